//! Content digests

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::RegistryError;

const SHA256: &str = "sha256";

/// A content digest, `sha256:<64 lowercase hex>`.
///
/// Only sha256 is accepted: it is the only algorithm the store computes, so a
/// digest in any other algorithm could never name stored content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Digest some content.
    pub fn from_bytes(content: &[u8]) -> Self {
        Self {
            hex: hex::encode(Sha256::digest(content)),
        }
    }

    /// The algorithm component, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        SHA256
    }

    /// The hex-encoded component.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check that `content` hashes to this digest.
    pub fn verify(&self, content: &[u8]) -> Result<(), RegistryError> {
        let actual = Digest::from_bytes(content);
        if &actual != self {
            return Err(RegistryError::DigestMismatch {
                expected: self.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Parse the hex component found in a storage path.
    pub(crate) fn from_hex(hex: &str) -> Option<Self> {
        valid_hex(hex).then(|| Self {
            hex: hex.to_owned(),
        })
    }
}

fn valid_hex(hex: &str) -> bool {
    hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SHA256, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::DigestInvalid(s.to_owned());

        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        if algorithm != SHA256 {
            return Err(invalid());
        }

        Digest::from_hex(hex).ok_or_else(invalid)
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_content() {
        let digest = Digest::from_bytes(b"hello");
        assert_eq!(
            digest.to_string(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(digest.verify(b"hello").is_ok());
        assert!(matches!(
            digest.verify(b"world"),
            Err(RegistryError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn parse_rejects_bad_digests() {
        for bad in [
            "",
            "sha256",
            "sha256:",
            "sha256:abc",
            "md5:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            "sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824",
        ] {
            assert!(
                matches!(bad.parse::<Digest>(), Err(RegistryError::DigestInvalid(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let digest = Digest::from_bytes(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
