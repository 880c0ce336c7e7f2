use std::env;
use std::str::FromStr;

use thiserror::Error;

use crate::backend::{interp::IrInterpBackend, wasmtime::WasmBackend, BackendError, CodegenBackend};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Lower to WebAssembly and execute with wasmtime.
    #[default]
    Wasm,
    /// Execute optimized IR directly.
    Interp,
}

impl BackendKind {
    pub fn instantiate(self) -> Result<Box<dyn CodegenBackend>, BackendError> {
        Ok(match self {
            BackendKind::Wasm => Box::new(WasmBackend::new()?),
            BackendKind::Interp => Box::new(IrInterpBackend::new()),
        })
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wasm" | "wasmtime" => Ok(BackendKind::Wasm),
            "interp" | "ir" => Ok(BackendKind::Interp),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// Which guest ISA a configuration is for; selects defaults and environment variable names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Isa {
    X86,
    Dalvik,
}

impl Isa {
    fn threshold_var(self) -> &'static str {
        match self {
            Isa::X86 => "NACHO_X86_JIT_THRESHOLD",
            Isa::Dalvik => "NACHO_DALVIK_JIT_THRESHOLD",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("unknown JIT backend {0:?} (expected `wasm` or `interp`)")]
    InvalidBackend(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
    /// Dispatch count at which a key becomes eligible for compilation.
    pub hot_threshold: u64,
    pub backend: BackendKind,
    /// Upper bound on guest instructions translated into one unit.
    pub max_block_insts: usize,
}

impl JitConfig {
    /// x86 basic blocks are hot after 10 dispatches.
    pub fn x86() -> Self {
        Self {
            enabled: true,
            hot_threshold: 10,
            backend: BackendKind::default(),
            max_block_insts: 64,
        }
    }

    /// Dalvik methods are hot after 100 calls.
    pub fn dalvik() -> Self {
        Self {
            enabled: true,
            hot_threshold: 100,
            backend: BackendKind::default(),
            max_block_insts: 4096,
        }
    }

    pub fn for_isa(isa: Isa) -> Self {
        match isa {
            Isa::X86 => Self::x86(),
            Isa::Dalvik => Self::dalvik(),
        }
    }

    /// ISA defaults overridden by `NACHO_JIT`, `NACHO_JIT_BACKEND` and the per-ISA threshold var.
    pub fn from_env(isa: Isa) -> Result<Self, ConfigError> {
        Self::from_lookup(isa, |var| env::var(var).ok())
    }

    /// Same as [`JitConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(
        isa: Isa,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::for_isa(isa);

        if let Some(value) = lookup("NACHO_JIT") {
            config.enabled = parse_bool("NACHO_JIT", &value)?;
        }
        if let Some(value) = lookup("NACHO_JIT_BACKEND") {
            config.backend = value.parse()?;
        }
        let var = isa.threshold_var();
        if let Some(value) = lookup(var) {
            config.hot_threshold = match value.trim().parse::<u64>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::InvalidVar {
                        var,
                        value,
                        reason: "expected a positive integer",
                    })
                }
                Ok(n) => n,
            };
        }
        Ok(config)
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self::x86()
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidVar {
            var,
            value: value.to_string(),
            reason: "expected on/off",
        }),
    }
}
