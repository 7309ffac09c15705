//! Hash algorithm detection and SHA-2 digests.

use std::fmt;

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

/// Algorithms recognized by hex length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// 128-bit MD5.
    Md5,
    /// 160-bit SHA-1.
    Sha1,
    /// SHA-224.
    Sha224,
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// Every recognized algorithm.
    pub const ALL: [Self; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    /// Infer the algorithm from the length of a hex digest.
    #[must_use]
    pub fn from_hex_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.hex_len() == len)
    }

    /// Parse a name such as `sha256`, `SHA-256` or `md5`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "md5" => Some(Self::Md5),
            "sha1" => Some(Self::Sha1),
            "sha224" => Some(Self::Sha224),
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA-1",
            Self::Sha224 => "SHA-224",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Digest size in bits.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::Md5 => 128,
            Self::Sha1 => 160,
            Self::Sha224 => 224,
            Self::Sha256 => 256,
            Self::Sha384 => 384,
            Self::Sha512 => 512,
        }
    }

    /// Length of the hex encoding.
    #[must_use]
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha224 => 56,
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    /// Path segment used by the hashlookup service, for the algorithms it
    /// indexes.
    #[must_use]
    pub fn lookup_kind(self) -> Option<&'static str> {
        match self {
            Self::Md5 => Some("md5"),
            Self::Sha1 => Some("sha1"),
            Self::Sha256 => Some("sha256"),
            Self::Sha224 | Self::Sha384 | Self::Sha512 => None,
        }
    }

    /// Lowercase hex digest of `data`. Only the SHA-2 family is computed
    /// locally; MD5 and SHA-1 return `None`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Option<String> {
        match self {
            Self::Sha224 => Some(hex::encode(Sha224::digest(data))),
            Self::Sha256 => Some(hex::encode(Sha256::digest(data))),
            Self::Sha384 => Some(hex::encode(Sha384::digest(data))),
            Self::Sha512 => Some(hex::encode(Sha512::digest(data))),
            Self::Md5 | Self::Sha1 => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `s` is a non-empty string of hex digits.
#[must_use]
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn detects_by_length() {
        assert_eq!(HashAlgorithm::from_hex_len(32), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_hex_len(40), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::from_hex_len(64), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_hex_len(128), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::from_hex_len(63), None);
    }

    #[test]
    fn names_are_forgiving() {
        assert_eq!(HashAlgorithm::from_name("SHA-256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_name("sha_384"), Some(HashAlgorithm::Sha384));
        assert_eq!(HashAlgorithm::from_name("Md5"), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_name("crc32"), None);
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(HashAlgorithm::Sha256.digest(b"").as_deref(), Some(EMPTY_SHA256));
        assert!(HashAlgorithm::Md5.digest(b"").is_none());
    }

    #[test]
    fn hex_check() {
        assert!(is_hex(EMPTY_SHA256));
        assert!(!is_hex(""));
        assert!(!is_hex("xyz"));
    }
}
