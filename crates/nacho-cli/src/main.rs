#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use nacho_core::{Cpu, FlatMemory, RunExit};
use nacho_dalvik::{DalvikConfig, DalvikInterpreter, DalvikJit, ExecOutcome};
use nacho_jit::{BackendKind, Isa, JitConfig, JitStats};
use nacho_x86::{Gpr, X86Cpu, X86Jit, X86Registers};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nacho", about = "Run raw x86 or Dalvik code through the nacho interpreters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a flat x86 image into guest memory and run it.
    X86(X86Args),
    /// Run a Dalvik method body (raw little-endian code units).
    Dalvik(DalvikArgs),
}

#[derive(Debug, Args)]
struct JitArgs {
    /// Interpret only.
    #[arg(long)]
    no_jit: bool,

    /// Code generator for hot code (`wasm` or `interp`). Defaults to `NACHO_JIT_BACKEND`, then
    /// `wasm`.
    #[arg(long)]
    backend: Option<BackendKind>,
}

impl JitArgs {
    fn config(&self, isa: Isa) -> Result<JitConfig> {
        let mut config = JitConfig::from_env(isa).context("invalid JIT environment")?;
        if self.no_jit {
            config.enabled = false;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
struct X86Args {
    /// Raw machine code image.
    image: PathBuf,

    /// Guest address the image is copied to.
    #[arg(long, default_value = "0x1000", value_parser = parse_u64)]
    load_addr: u64,

    /// First instruction to execute. Defaults to the load address.
    #[arg(long, value_parser = parse_u64)]
    entry: Option<u64>,

    /// Guest memory size in bytes.
    #[arg(long, default_value = "0x100000", value_parser = parse_u64)]
    mem_size: u64,

    /// Cycle budget.
    #[arg(long, default_value_t = 1_000_000)]
    cycles: u64,

    #[command(flatten)]
    jit: JitArgs,
}

#[derive(Debug, Args)]
struct DalvikArgs {
    /// Method body as raw little-endian 16-bit code units.
    code: PathBuf,

    /// Method name the JIT profiles and caches the body under.
    #[arg(long, default_value = "main")]
    method: String,

    /// Invoke the method this many times.
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Initial register value, e.g. `v2=10` or `v0=0xff`. Applied before every invocation.
    #[arg(long = "reg", value_parser = parse_reg)]
    regs: Vec<(u32, u32)>,

    #[command(flatten)]
    jit: JitArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::X86(args) => run_x86(args),
        Command::Dalvik(args) => run_dalvik(args),
    }
}

fn run_x86(args: X86Args) -> Result<()> {
    let image = fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let mem_size = usize::try_from(args.mem_size).context("memory size does not fit in usize")?;
    let entry = u32::try_from(args.entry.unwrap_or(args.load_addr))
        .context("entry point must be a 32-bit address")?;

    let config = args.jit.config(Isa::X86)?;
    let memory = FlatMemory::new(mem_size);
    let mut cpu = if config.enabled {
        X86Cpu::with_jit(memory, X86Jit::new(config).context("failed to start the JIT")?)
    } else {
        X86Cpu::new(memory)
    };
    cpu.load(args.load_addr, &image)
        .with_context(|| format!("image does not fit at 0x{:x}", args.load_addr))?;
    cpu.set_entry(entry);
    cpu.set_interrupt_handler(Box::new(dos_services));

    info!(image = %args.image.display(), bytes = image.len(), entry, "running x86 image");
    let exit = cpu.run(args.cycles);
    io::stdout().flush()?;

    print_x86_registers(&cpu.registers());
    println!("exit: {exit:?}");
    if let Some(jit) = cpu.jit() {
        print_stats(jit.engine().backend_name(), jit.engine().stats());
    }

    match exit {
        RunExit::Faulted(fault) => bail!("guest faulted: {fault}"),
        _ => Ok(()),
    }
}

/// `INT 0x21` function 02h writes DL to stdout; `INT 0x20` and everything else is ignored.
fn dos_services(vector: u8, regs: &mut X86Registers) {
    let ah = (regs.get32(Gpr::Eax) >> 8) as u8;
    match (vector, ah) {
        (0x21, 0x02) => {
            let dl = regs.get32(Gpr::Edx) as u8;
            let _ = io::stdout().write_all(&[dl]);
        }
        _ => debug!(vector, ah, "ignoring software interrupt"),
    }
}

fn print_x86_registers(regs: &X86Registers) {
    for row in Gpr::ALL.chunks(4) {
        let line: Vec<String> = row
            .iter()
            .map(|&r| format!("{r}=0x{:08x}", regs.get32(r)))
            .collect();
        println!("{}", line.join(" "));
    }
    println!(
        "eip=0x{:08x} zf={} sf={}",
        regs.eip,
        u8::from(regs.zf()),
        u8::from(regs.sf())
    );
}

fn run_dalvik(args: DalvikArgs) -> Result<()> {
    let bytes =
        fs::read(&args.code).with_context(|| format!("failed to read {}", args.code.display()))?;
    if bytes.len() % 2 != 0 {
        bail!("{} is not a whole number of code units", args.code.display());
    }

    let config = DalvikConfig {
        jit: args.jit.config(Isa::Dalvik)?,
        ..DalvikConfig::default()
    };
    let mut vm = if config.jit.enabled {
        let jit = DalvikJit::new(config.jit.clone()).context("failed to start the JIT")?;
        DalvikInterpreter::with_jit(config, jit)
    } else {
        DalvikInterpreter::new(config)
    };

    let mut last: Option<ExecOutcome> = None;
    for call in 0..args.repeat {
        for &(index, value) in &args.regs {
            if !vm.regs_mut().set(index, value) {
                bail!("register v{index} is out of range");
            }
        }
        let outcome = vm
            .execute(&bytes, &args.method)
            .with_context(|| format!("invocation {} of {} failed", call + 1, args.method))?;
        last = Some(outcome);
    }

    let regs = vm.regs();
    for (index, value) in regs.v.iter().enumerate().filter(|(_, v)| **v != 0) {
        println!("v{index}=0x{value:08x}");
    }
    match last {
        Some(outcome) => {
            match outcome.return_value {
                Some(value) => println!("return: 0x{value:x}"),
                None => println!("return: void"),
            }
            println!("exit: {:?} (compiled: {})", outcome.halt, outcome.compiled);
        }
        None => println!("exit: not run"),
    }
    if let Some(jit) = vm.jit() {
        print_stats(jit.engine().backend_name(), jit.engine().stats());
    }
    Ok(())
}

fn print_stats(backend: &str, stats: JitStats) {
    println!(
        "jit[{backend}]: {} compiled, {} aborted, {} compiled executions",
        stats.compiles, stats.aborts, stats.compiled_executions
    );
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}

/// `vN=value`, where value is decimal (possibly negative) or `0x` hex.
fn parse_reg(s: &str) -> Result<(u32, u32), String> {
    let (reg, value) = s
        .split_once('=')
        .ok_or_else(|| format!("`{s}`: expected vN=value"))?;
    let index = reg
        .trim()
        .strip_prefix('v')
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| format!("`{reg}` is not a register name"))?;
    let value = value.trim();
    let value = match value.strip_prefix('-') {
        Some(magnitude) => magnitude
            .parse::<i64>()
            .ok()
            .and_then(|m| i32::try_from(-m).ok())
            .map(|v| v as u32)
            .ok_or_else(|| format!("`{value}` is not a 32-bit value"))?,
        None => parse_u64(value)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| format!("`{value}` is not a 32-bit value"))?,
    };
    Ok((index, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_assignments() {
        assert_eq!(parse_reg("v2=10"), Ok((2, 10)));
        assert_eq!(parse_reg("v0=0xff"), Ok((0, 0xff)));
        assert_eq!(parse_reg("v1=-1"), Ok((1, u32::MAX)));
        assert!(parse_reg("x1=1").is_err());
        assert!(parse_reg("v1").is_err());
        assert!(parse_reg("v1=0x100000000").is_err());
    }

    #[test]
    fn parses_addresses() {
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn cli_shape_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn backend_flag_parses() {
        let cli = Cli::try_parse_from([
            "nacho", "dalvik", "m.bin", "--backend", "interp", "--reg", "v2=3",
        ])
        .unwrap();
        let Command::Dalvik(args) = cli.command else {
            panic!("expected the dalvik subcommand");
        };
        assert_eq!(args.jit.backend, Some(BackendKind::Interp));
        assert_eq!(args.regs, vec![(2, 3)]);
    }
}
