use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use nacho_ir::IrType;

use crate::backend::ArtifactId;

/// A successfully compiled unit. Never mutated after creation; replacing it means evicting the
/// key and compiling again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledUnit<K> {
    pub key: K,
    pub artifact: ArtifactId,
    pub entry_point: String,
    /// Size of the backend artifact in bytes.
    pub code_size: usize,
    pub ir_instructions: usize,
    /// Guest instructions covered by the unit (one straight-line pass through it).
    pub guest_instructions: u32,
    /// Guest code bytes covered by the unit, starting at the key for address-keyed units.
    pub source_len: u32,
    /// See [`crate::Translation::falls_off_end`].
    pub falls_off_end: bool,
    pub return_type: IrType,
}

/// Compiled units by key.
///
/// There is no capacity limit or eviction policy: entries leave only through
/// [`CodeCache::evict`]. Lookups hand out shared handles, so repeated lookups of a warm key return
/// the same allocation.
#[derive(Debug)]
pub struct CodeCache<K> {
    units: HashMap<K, Arc<CompiledUnit<K>>>,
    code_bytes: usize,
    hits: u64,
    misses: u64,
}

impl<K> Default for CodeCache<K> {
    fn default() -> Self {
        Self {
            units: HashMap::new(),
            code_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> CodeCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch-path lookup; counts a hit or a miss.
    pub fn get(&mut self, key: &K) -> Option<Arc<CompiledUnit<K>>> {
        match self.units.get(key) {
            Some(unit) => {
                self.hits += 1;
                Some(Arc::clone(unit))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Lookup without touching statistics.
    pub fn peek(&self, key: &K) -> Option<&Arc<CompiledUnit<K>>> {
        self.units.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.units.contains_key(key)
    }

    /// Publish a unit. If the key is already present the existing unit wins and is returned.
    pub fn insert(&mut self, unit: CompiledUnit<K>) -> Arc<CompiledUnit<K>> {
        if let Some(existing) = self.units.get(&unit.key) {
            return Arc::clone(existing);
        }
        self.code_bytes += unit.code_size;
        let unit = Arc::new(unit);
        self.units.insert(unit.key.clone(), Arc::clone(&unit));
        unit
    }

    pub fn evict(&mut self, key: &K) -> Option<Arc<CompiledUnit<K>>> {
        let unit = self.units.remove(key)?;
        self.code_bytes -= unit.code_size;
        Some(unit)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn code_bytes(&self) -> usize {
        self.code_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl CodeCache<u64> {
    /// Keys of units whose guest source bytes intersect `[start, start + len)`.
    pub fn keys_overlapping(&self, start: u64, len: u64) -> Vec<u64> {
        let end = start.saturating_add(len);
        self.units
            .values()
            .filter(|unit| {
                let unit_end = unit.key.saturating_add(unit.source_len as u64);
                unit.key < end && start < unit_end
            })
            .map(|unit| unit.key)
            .collect()
    }
}
