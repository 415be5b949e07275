//! Content digests for dataset identity

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Digest algorithm used for content hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-1
    #[default]
    Sha1,

    /// MD5
    Md5,

    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Prefix written in front of the hex digest
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "md5" => Ok(HashAlgorithm::Md5),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(Error::InvalidArgument(format!("Unknown hash algorithm: {other}"))),
        }
    }
}

enum Inner {
    Sha1(Sha1),
    Md5(Md5),
    Sha256(Sha256),
}

/// Incremental hasher producing `"<algo>.<hex digest>"`
pub struct ContentHasher {
    algorithm: HashAlgorithm,
    inner: Inner,
}

impl ContentHasher {
    /// Start a new digest
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner = match algorithm {
            HashAlgorithm::Sha1 => Inner::Sha1(Sha1::new()),
            HashAlgorithm::Md5 => Inner::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Inner::Sha256(Sha256::new()),
        };
        Self { algorithm, inner }
    }

    /// Feed bytes
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        match &mut self.inner {
            Inner::Sha1(h) => h.update(bytes),
            Inner::Md5(h) => h.update(bytes),
            Inner::Sha256(h) => h.update(bytes),
        }
    }

    /// Finish and format the digest
    pub fn finalize(self) -> String {
        let digest: Vec<u8> = match self.inner {
            Inner::Sha1(h) => h.finalize().to_vec(),
            Inner::Md5(h) => h.finalize().to_vec(),
            Inner::Sha256(h) => h.finalize().to_vec(),
        };
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{}.{hex}", self.algorithm)
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHasher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// One-shot digest of a byte string
pub fn digest(algorithm: HashAlgorithm, bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = ContentHasher::new(algorithm);
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(HashAlgorithm::Sha1, "sha1.a9993e364706816aba3e25717850c26c9cd0d89d"; "sha1")]
    #[test_case(HashAlgorithm::Md5, "md5.900150983cd24fb0d6963f7d28e17f72"; "md5")]
    #[test_case(
        HashAlgorithm::Sha256,
        "sha256.ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        "sha256"
    )]
    fn test_known_digests(algorithm: HashAlgorithm, expected: &str) {
        assert_eq!(digest(algorithm, "abc"), expected);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new(HashAlgorithm::Sha1);
        hasher.update("a");
        hasher.update("bc");
        assert_eq!(hasher.finalize(), digest(HashAlgorithm::Sha1, "abc"));
    }
}
