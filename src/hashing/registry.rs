//! Hash algorithm registry.
//!
//! A process-wide mapping from algorithm name to
//! [`HashStrategy`](super::strategies::HashStrategy), enabling new
//! algorithms to be registered at startup without modifying existing
//! code. Mutation is serialized by the backing concurrent map; the
//! registry is threaded through services as explicit context rather
//! than accessed through a global.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    errors::ProvenanceError,
    hashing::strategies::{
        Blake3Strategy, FileHasher, HashStrategy, Md5Strategy, Sha256Strategy, Sha512Strategy,
    },
};

/// Registry of hash algorithm strategies.
///
/// `blake3`, `sha256`, `sha512`, and `md5` are pre-registered;
/// [`register`](HashRegistry::register) adds more at startup.
pub struct HashRegistry {
    strategies: DashMap<String, Arc<dyn HashStrategy>>,
}

impl HashRegistry {
    /// Registry with the built-in algorithms pre-registered.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(Blake3Strategy));
        registry.register(Arc::new(Sha256Strategy));
        registry.register(Arc::new(Sha512Strategy));
        registry.register(Arc::new(Md5Strategy));
        registry
    }

    /// Registry with no algorithms registered.
    pub fn empty() -> Self {
        Self {
            strategies: DashMap::new(),
        }
    }

    /// Register a strategy under its algorithm name, replacing any
    /// previous strategy with the same name.
    pub fn register(&self, strategy: Arc<dyn HashStrategy>) {
        self.strategies
            .insert(strategy.algorithm_name().to_string(), strategy);
    }

    /// Look up a strategy by algorithm name.
    pub fn get(&self, algorithm: &str) -> Option<Arc<dyn HashStrategy>> {
        self.strategies.get(algorithm).map(|s| Arc::clone(&s))
    }

    /// Whether an algorithm is registered.
    pub fn contains(&self, algorithm: &str) -> bool {
        self.strategies.contains_key(algorithm)
    }

    /// Create a hasher for the given algorithm.
    pub fn hasher(&self, algorithm: &str) -> Result<Box<dyn FileHasher>, ProvenanceError> {
        let strategy = self
            .get(algorithm)
            .ok_or_else(|| ProvenanceError::UnknownAlgorithm(algorithm.to_string()))?;
        strategy.new_hasher()
    }

    /// Hash an in-memory buffer with the given algorithm.
    pub fn compute(&self, algorithm: &str, data: &[u8]) -> Result<String, ProvenanceError> {
        let mut hasher = self.hasher(algorithm)?;
        hasher.update(data);
        Ok(hasher.finalize())
    }

    /// Registered algorithm names, sorted for stable display.
    pub fn available_algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for HashRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::strategies::Sha1Strategy;

    #[test]
    fn test_defaults_registered() {
        let registry = HashRegistry::new();
        assert_eq!(
            registry.available_algorithms(),
            vec!["blake3", "md5", "sha256", "sha512"]
        );
        assert!(registry.contains("blake3"));
        assert!(!registry.contains("sha1"));
    }

    #[test]
    fn test_unknown_algorithm_fails() {
        let registry = HashRegistry::new();
        let err = registry.hasher("whirlpool").unwrap_err();
        assert!(matches!(err, ProvenanceError::UnknownAlgorithm(name) if name == "whirlpool"));
    }

    /// Startup registration makes a legacy algorithm available.
    #[test]
    fn test_register_sha1_at_startup() {
        let registry = HashRegistry::new();
        registry.register(Arc::new(Sha1Strategy));
        assert_eq!(
            registry.compute("sha1", b"abc").expect("sha1 digest"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_compute_matches_across_calls() {
        let registry = HashRegistry::new();
        let a = registry.compute("sha256", b"abc").expect("digest");
        let b = registry.compute("sha256", b"abc").expect("digest");
        assert_eq!(a, b);
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
