//! Artifact integrity signatures.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Length of a hex-encoded SHA-1 digest.
pub const SIGNATURE_LEN: usize = 40;

/// A 40-character hexadecimal SHA-1 digest, stored lowercase.
///
/// Two signatures are equal iff their digests are byte-for-byte equal after
/// normalisation, so a feed publishing uppercase hex still verifies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(String);

impl Signature {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.len() != SIGNATURE_LEN {
            return Err(DomainError::invalid_signature(format!(
                "expected {SIGNATURE_LEN} characters, got {}",
                trimmed.len()
            )));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DomainError::invalid_signature("non-hex characters"));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Build a signature from a raw 20-byte digest.
    pub fn from_digest(digest: &[u8; 20]) -> Self {
        use core::fmt::Write as _;

        let mut hex = String::with_capacity(SIGNATURE_LEN);
        for byte in digest {
            // Writing into a String cannot fail.
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Signature {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(value: Signature) -> Self {
        value.0
    }
}

impl core::fmt::Display for Signature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
