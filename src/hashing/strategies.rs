//! Hash algorithm strategy implementations.
//!
//! Each strategy encapsulates the construction of a streaming hasher for
//! one algorithm. The built-in set covers BLAKE3, SHA-256, SHA-512, and
//! MD5; a SHA-1 strategy is provided for legacy digests and can be added
//! to a [`HashRegistry`](super::registry::HashRegistry) at startup.
//!
//! All digests are emitted as lowercase hex strings.

use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};

use crate::errors::ProvenanceError;

/// Incremental hasher state fed chunk-by-chunk while a file is read.
pub trait FileHasher: Send {
    /// Absorb the next chunk of data.
    fn update(&mut self, data: &[u8]);
    /// Consume the state and return the lowercase hex digest.
    fn finalize(self: Box<Self>) -> String;
}

impl std::fmt::Debug for dyn FileHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn FileHasher")
    }
}

/// Strategy for one hash algorithm: a name plus a fallible hasher factory.
///
/// Construction is fallible so that a strategy backed by an optional
/// native implementation can report
/// [`AlgorithmUnavailable`](ProvenanceError::AlgorithmUnavailable); the
/// built-in strategies never fail.
pub trait HashStrategy: Send + Sync {
    /// Unique algorithm identifier (e.g. `blake3`, `sha256`).
    fn algorithm_name(&self) -> &'static str;
    /// Create a fresh hasher for a single file pass.
    fn new_hasher(&self) -> Result<Box<dyn FileHasher>, ProvenanceError>;
}

/// BLAKE3: the primary algorithm; lineage extraction keys on its digests.
pub struct Blake3Strategy;

struct Blake3Hasher(blake3::Hasher);

impl FileHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

impl HashStrategy for Blake3Strategy {
    fn algorithm_name(&self) -> &'static str {
        "blake3"
    }

    fn new_hasher(&self) -> Result<Box<dyn FileHasher>, ProvenanceError> {
        Ok(Box::new(Blake3Hasher(blake3::Hasher::new())))
    }
}

/// SHA-256: widely compatible secondary digest.
pub struct Sha256Strategy;

struct Sha256Hasher(Sha256);

impl FileHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

impl HashStrategy for Sha256Strategy {
    fn algorithm_name(&self) -> &'static str {
        "sha256"
    }

    fn new_hasher(&self) -> Result<Box<dyn FileHasher>, ProvenanceError> {
        Ok(Box::new(Sha256Hasher(Sha256::new())))
    }
}

/// SHA-512: stronger SHA-2 variant.
pub struct Sha512Strategy;

struct Sha512Hasher(Sha512);

impl FileHasher for Sha512Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

impl HashStrategy for Sha512Strategy {
    fn algorithm_name(&self) -> &'static str {
        "sha512"
    }

    fn new_hasher(&self) -> Result<Box<dyn FileHasher>, ProvenanceError> {
        Ok(Box::new(Sha512Hasher(Sha512::new())))
    }
}

/// MD5: legacy compatibility only; never used for identity decisions.
pub struct Md5Strategy;

struct Md5Hasher(Md5);

impl FileHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

impl HashStrategy for Md5Strategy {
    fn algorithm_name(&self) -> &'static str {
        "md5"
    }

    fn new_hasher(&self) -> Result<Box<dyn FileHasher>, ProvenanceError> {
        Ok(Box::new(Md5Hasher(Md5::new())))
    }
}

/// SHA-1: not pre-registered; register at startup where legacy object
/// stores still key on it.
pub struct Sha1Strategy;

struct Sha1Hasher(Sha1);

impl FileHasher for Sha1Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

impl HashStrategy for Sha1Strategy {
    fn algorithm_name(&self) -> &'static str {
        "sha1"
    }

    fn new_hasher(&self) -> Result<Box<dyn FileHasher>, ProvenanceError> {
        Ok(Box::new(Sha1Hasher(Sha1::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(strategy: &dyn HashStrategy, data: &[u8]) -> String {
        let mut hasher = strategy.new_hasher().expect("hasher");
        hasher.update(data);
        hasher.finalize()
    }

    /// Known test vectors for the fixed-width algorithms.
    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            digest_of(&Sha256Strategy, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha512_known_vector() {
        assert_eq!(
            digest_of(&Sha512Strategy, b"abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(digest_of(&Md5Strategy, b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            digest_of(&Sha1Strategy, b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    /// BLAKE3 digests are 64 lowercase hex chars and chunking must not
    /// change the result.
    #[test]
    fn test_blake3_shape_and_chunk_independence() {
        let whole = digest_of(&Blake3Strategy, b"hello provenance");

        let mut hasher = Blake3Strategy.new_hasher().expect("hasher");
        hasher.update(b"hello ");
        hasher.update(b"provenance");
        let chunked = hasher.finalize();

        assert_eq!(whole.len(), 64);
        assert!(whole.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(whole, chunked);
        assert_eq!(whole, whole.to_lowercase());
    }
}
