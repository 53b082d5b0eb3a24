//! Function registry.
//!
//! The master and slaves need to agree on what user functions are available
//! and what they are called: the registry is built identically on every
//! process at startup, wire messages carry only the names, and slaves
//! resolve the names before executing. An unresolvable name is a fatal task
//! error.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use crate::error::MrResult;

/// Push-style output consumer handed to user functions. Outputs may be
/// arbitrarily many and are consumed in emission order.
pub type Emit<'a> = &'a mut dyn FnMut(Vec<u8>, Vec<u8>);

pub trait Mapper: Send + Sync {
    fn map(&self, key: &[u8], value: &[u8], emit: Emit<'_>) -> MrResult<()>;
}

impl<F> Mapper for F
where
    F: for<'a> Fn(&[u8], &[u8], Emit<'a>) -> MrResult<()> + Send + Sync,
{
    fn map(&self, key: &[u8], value: &[u8], emit: Emit<'_>) -> MrResult<()> {
        self(key, value, emit)
    }
}

/// Sees every value for a key together, exactly once per key.
pub trait Reducer: Send + Sync {
    fn reduce(
        &self,
        key: &[u8],
        values: &mut dyn Iterator<Item = Vec<u8>>,
        emit: Emit<'_>,
    ) -> MrResult<()>;
}

impl<F> Reducer for F
where
    F: for<'a, 'b> Fn(&[u8], &'a mut dyn Iterator<Item = Vec<u8>>, Emit<'b>) -> MrResult<()>
        + Send
        + Sync,
{
    fn reduce(
        &self,
        key: &[u8],
        values: &mut dyn Iterator<Item = Vec<u8>>,
        emit: Emit<'_>,
    ) -> MrResult<()> {
        self(key, values, emit)
    }
}

/// Maps a key and a split count to a split index in `0..splits`.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8], splits: u32) -> u32;
}

impl<F> Partitioner for F
where
    F: Fn(&[u8], u32) -> u32 + Send + Sync,
{
    fn partition(&self, key: &[u8], splits: u32) -> u32 {
        self(key, splits)
    }
}

/// Default partitioner name, registered on every process.
pub const DEFAULT_PARTITIONER: &str = "hash";

/// Stable hash of the key bytes modulo the split count. `DefaultHasher::new`
/// is keyed with constants, so the placement is identical on every process.
pub fn hash_partition(key: &[u8], splits: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    (hasher.finish() % splits as u64) as u32
}

/// Interprets the key as a decimal integer and takes it modulo the split
/// count; non-numeric keys fall back to the hash partitioner.
pub fn mod_partition(key: &[u8], splits: u32) -> u32 {
    std::str::from_utf8(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|n| (n % splits as u64) as u32)
        .unwrap_or_else(|| hash_partition(key, splits))
}

#[derive(Clone)]
enum UserFn {
    Map(Arc<dyn Mapper>),
    Reduce(Arc<dyn Reducer>),
    Partition(Arc<dyn Partitioner>),
}

/// Mapping between function names and callables, built once per process.
#[derive(Clone)]
pub struct Registry {
    entries: HashMap<String, UserFn>,
}

impl Registry {
    /// A registry preloaded with the built-in partitioners `hash` and `mod`.
    pub fn new() -> Self {
        let mut registry = Self { entries: HashMap::new() };
        registry.add_partitioner(DEFAULT_PARTITIONER, hash_partition);
        registry.add_partitioner("mod", mod_partition);
        registry
    }

    pub fn add_mapper(&mut self, name: impl Into<String>, mapper: impl Mapper + 'static) {
        self.entries.insert(name.into(), UserFn::Map(Arc::new(mapper)));
    }

    pub fn add_reducer(&mut self, name: impl Into<String>, reducer: impl Reducer + 'static) {
        self.entries.insert(name.into(), UserFn::Reduce(Arc::new(reducer)));
    }

    pub fn add_partitioner(
        &mut self,
        name: impl Into<String>,
        parter: impl Partitioner + 'static,
    ) {
        self.entries.insert(name.into(), UserFn::Partition(Arc::new(parter)));
    }

    pub fn mapper(&self, name: &str) -> Option<Arc<dyn Mapper>> {
        match self.entries.get(name) {
            Some(UserFn::Map(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn reducer(&self, name: &str) -> Option<Arc<dyn Reducer>> {
        match self.entries.get(name) {
            Some(UserFn::Reduce(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn partitioner(&self, name: &str) -> Option<Arc<dyn Partitioner>> {
        match self.entries.get(name) {
            Some(UserFn::Partition(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_partition_stays_in_range() {
        for splits in [1u32, 2, 3, 7, 16] {
            for key in [&b"a"[..], b"b", b"some longer key", b"", b"\x00\xff"] {
                assert!(hash_partition(key, splits) < splits);
            }
        }
    }

    #[test]
    fn hash_partition_is_deterministic() {
        assert_eq!(hash_partition(b"stable", 8), hash_partition(b"stable", 8));
    }

    #[test]
    fn mod_partition_uses_numeric_keys() {
        assert_eq!(mod_partition(b"10", 4), 2);
        assert_eq!(mod_partition(b"3", 4), 3);
        // non-numeric keys fall back to hashing, still in range
        assert!(mod_partition(b"word", 4) < 4);
    }

    #[test]
    fn names_resolve_to_the_right_kind() {
        let mut registry = Registry::new();
        registry.add_mapper("emit_once", |k: &[u8], v: &[u8], emit: Emit<'_>| {
            emit(k.to_vec(), v.to_vec());
            Ok(())
        });

        assert!(registry.mapper("emit_once").is_some());
        assert!(registry.reducer("emit_once").is_none());
        assert!(registry.mapper("missing").is_none());
        assert!(registry.partitioner(DEFAULT_PARTITIONER).is_some());
    }

    #[test]
    fn mapper_closure_emits_through_registry() {
        let mut registry = Registry::new();
        registry.add_mapper("double", |k: &[u8], v: &[u8], emit: Emit<'_>| {
            emit(k.to_vec(), v.to_vec());
            emit(k.to_vec(), v.to_vec());
            Ok(())
        });

        let mapper = registry.mapper("double").unwrap();
        let mut out = Vec::new();
        mapper.map(b"k", b"v", &mut |k, v| out.push((k, v))).unwrap();
        assert_eq!(out.len(), 2);
    }
}
