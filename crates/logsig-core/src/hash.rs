//! Hash algorithms, imprints and the node hashing rule.
//!
//! An imprint is a digest prefixed with the one-byte identifier of the
//! algorithm that produced it. Imprints are what gets hashed when tree nodes
//! are combined and what gets persisted in block headers and state files, so
//! the identifier byte is always part of the hashed and stored value.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{CoreError, Result};

/// Hash algorithms supported for record hashing and tree construction.
///
/// Identifiers follow the KSI registry. SHA-1 (`0x00`) and RIPEMD-160
/// (`0x02`) are recognised by name but are not trusted and never selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA2-256, identifier `0x01`.
    #[default]
    Sha256,
    /// SHA2-384, identifier `0x04`.
    Sha384,
    /// SHA2-512, identifier `0x05`.
    Sha512,
}

impl HashAlgorithm {
    /// Returns the registry identifier byte.
    pub const fn id(self) -> u8 {
        match self {
            Self::Sha256 => 0x01,
            Self::Sha384 => 0x04,
            Self::Sha512 => 0x05,
        }
    }

    /// Returns the digest length in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Returns the canonical algorithm name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Looks up an algorithm by registry identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::Sha256),
            0x04 => Ok(Self::Sha384),
            0x05 => Ok(Self::Sha512),
            _ => Err(CoreError::UnsupportedAlgorithm { id }),
        }
    }

    /// Looks up a trusted algorithm by name.
    ///
    /// Accepts the usual spellings (`SHA-256`, `SHA2-256`, `sha256`) and
    /// `default`. Returns `None` for unknown and untrusted names alike; use
    /// [`HashAlgorithm::is_untrusted_name`] to tell them apart.
    pub fn from_name(name: &str) -> Option<Self> {
        match normalize(name).as_str() {
            "DEFAULT" | "SHA256" | "SHA2256" => Some(Self::Sha256),
            "SHA384" | "SHA2384" => Some(Self::Sha384),
            "SHA512" | "SHA2512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Returns true for algorithms that are known but no longer trusted.
    pub fn is_untrusted_name(name: &str) -> bool {
        matches!(normalize(name).as_str(), "SHA1" | "RIPEMD160")
    }

    /// Hashes `data` and returns its imprint.
    pub fn digest(self, data: &[u8]) -> Imprint {
        let mut hasher = DataHasher::new(self);
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn normalize(name: &str) -> String {
    name.chars().filter(|c| *c != '-' && *c != '_').collect::<String>().to_ascii_uppercase()
}

/// Algorithm-tagged digest.
///
/// Stored as the identifier byte followed by the digest so that
/// [`Imprint::as_bytes`] is exactly the persisted and hashed form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Imprint {
    algorithm: HashAlgorithm,
    bytes: Vec<u8>,
}

impl Imprint {
    /// Creates an imprint from a digest, checking its length.
    pub fn new(algorithm: HashAlgorithm, digest: &[u8]) -> Result<Self> {
        if digest.len() != algorithm.digest_len() {
            return Err(CoreError::DigestLength {
                algorithm: algorithm.name(),
                expected: algorithm.digest_len(),
                actual: digest.len(),
            });
        }

        let mut bytes = Vec::with_capacity(digest.len() + 1);
        bytes.push(algorithm.id());
        bytes.extend_from_slice(digest);
        Ok(Self { algorithm, bytes })
    }

    /// All-zero imprint used to seed a fresh hash chain.
    pub fn zero(algorithm: HashAlgorithm) -> Self {
        let mut bytes = vec![0u8; algorithm.digest_len() + 1];
        bytes[0] = algorithm.id();
        Self { algorithm, bytes }
    }

    /// Parses the persisted form (identifier byte followed by digest).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&id, digest) = bytes.split_first().ok_or_else(|| CoreError::truncated(0, 1))?;
        let algorithm = HashAlgorithm::from_id(id)?;
        Self::new(algorithm, digest)
    }

    /// Algorithm that produced the digest.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest bytes without the identifier.
    pub fn digest(&self) -> &[u8] {
        &self.bytes[1..]
    }

    /// Identifier byte followed by the digest.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the persisted form in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Imprints always carry at least the identifier byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Lowercase hex of the persisted form.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for Imprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imprint({})", self.to_hex())
    }
}

impl fmt::Display for Imprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

enum HasherState {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Incremental hasher producing imprints.
pub struct DataHasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

impl DataHasher {
    /// Opens a hasher for the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => HasherState::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    /// Feeds raw bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha384(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
    }

    /// Feeds an imprint in its persisted form, identifier byte included.
    pub fn add_imprint(&mut self, imprint: &Imprint) {
        self.update(imprint.as_bytes());
    }

    /// Consumes the hasher and returns the imprint.
    pub fn finalize(self) -> Imprint {
        let digest = match self.state {
            HasherState::Sha256(h) => h.finalize().to_vec(),
            HasherState::Sha384(h) => h.finalize().to_vec(),
            HasherState::Sha512(h) => h.finalize().to_vec(),
        };
        Imprint { algorithm: self.algorithm, bytes: prefixed(self.algorithm, digest) }
    }
}

impl fmt::Debug for DataHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHasher").field("algorithm", &self.algorithm).finish()
    }
}

fn prefixed(algorithm: HashAlgorithm, digest: Vec<u8>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(digest.len() + 1);
    bytes.push(algorithm.id());
    bytes.extend(digest);
    bytes
}

/// Combines two child imprints into their parent: `H(left ‖ right ‖ level)`.
pub fn hash_node(algorithm: HashAlgorithm, left: &Imprint, right: &Imprint, level: u8) -> Imprint {
    let mut hasher = DataHasher::new(algorithm);
    hasher.add_imprint(left);
    hasher.add_imprint(right);
    hasher.update(&[level]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_imprint_is_prefixed_with_algorithm_id() {
        let imprint = HashAlgorithm::Sha256.digest(b"r0");

        assert_eq!(imprint.len(), 33);
        assert_eq!(imprint.as_bytes()[0], 0x01);
        assert_eq!(
            hex::encode(imprint.digest()),
            "dd191696e15e2ee293410d02454c5f9461a2249dee6d57c75f264eaeb83a3782"
        );
    }

    #[test]
    fn zero_imprint_has_only_zero_digest_bytes() {
        let zero = Imprint::zero(HashAlgorithm::Sha512);

        assert_eq!(zero.as_bytes()[0], 0x05);
        assert_eq!(zero.digest().len(), 64);
        assert!(zero.digest().iter().all(|b| *b == 0));
    }

    #[test]
    fn from_bytes_round_trips_and_checks_length() {
        let imprint = HashAlgorithm::Sha384.digest(b"payload");
        let parsed = Imprint::from_bytes(imprint.as_bytes()).unwrap();
        assert_eq!(parsed, imprint);

        let short = &imprint.as_bytes()[..20];
        assert!(matches!(Imprint::from_bytes(short), Err(CoreError::DigestLength { .. })));
        assert!(matches!(
            Imprint::from_bytes(&[0x00; 21]),
            Err(CoreError::UnsupportedAlgorithm { id: 0 })
        ));
        assert!(Imprint::from_bytes(&[]).is_err());
    }

    #[test]
    fn names_resolve_to_trusted_algorithms_only() {
        assert_eq!(HashAlgorithm::from_name("SHA-256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_name("sha2-384"), Some(HashAlgorithm::Sha384));
        assert_eq!(HashAlgorithm::from_name("SHA512"), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::from_name("default"), Some(HashAlgorithm::Sha256));

        assert_eq!(HashAlgorithm::from_name("SHA-1"), None);
        assert!(HashAlgorithm::is_untrusted_name("SHA-1"));
        assert!(HashAlgorithm::is_untrusted_name("RIPEMD-160"));
        assert!(!HashAlgorithm::is_untrusted_name("MD5"));
    }

    #[test]
    fn node_hash_depends_on_child_order_and_level() {
        let alg = HashAlgorithm::Sha256;
        let a = alg.digest(b"a");
        let b = alg.digest(b"b");

        let ab = hash_node(alg, &a, &b, 1);
        assert_ne!(ab, hash_node(alg, &b, &a, 1));
        assert_ne!(ab, hash_node(alg, &a, &b, 2));

        let mut manual = DataHasher::new(alg);
        manual.update(a.as_bytes());
        manual.update(b.as_bytes());
        manual.update(&[1]);
        assert_eq!(manual.finalize(), ab);
    }
}
