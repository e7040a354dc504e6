//! Content digests
//!
//! Every identity in strata (context selections, layer deltas, layer and
//! image ids) is a SHA-256 digest. Digests are rendered as `sha256:<hex>`.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

const PREFIX: &str = "sha256:";

/// A SHA-256 content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest of a byte slice
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = DigestBuilder::new();
        hasher.update(bytes);
        hasher.finish()
    }

    /// Parse a `sha256:<hex>` string
    pub fn parse(s: &str) -> Option<Self> {
        let hex_part = s.strip_prefix(PREFIX)?;
        if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Hex part without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0[PREFIX.len()..]
    }

    /// First 12 hex chars, for display
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental digest over framed fields.
///
/// Every field is length-prefixed so that adjacent fields cannot be shifted
/// into each other (`("ab", "c")` and `("a", "bc")` hash differently).
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Append a length-prefixed field
    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Append a string field
    pub fn str_field(&mut self, s: &str) -> &mut Self {
        self.field(s.as_bytes())
    }

    /// Append raw bytes without framing
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{}{}", PREFIX, hex::encode(self.hasher.finalize())))
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        assert_eq!(
            Digest::of_bytes(b"").as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn framed_fields_do_not_collide() {
        let mut a = DigestBuilder::new();
        a.str_field("ab").str_field("c");
        let mut b = DigestBuilder::new();
        b.str_field("a").str_field("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn parse_roundtrips_display() {
        let d = Digest::of_bytes(b"hello");
        assert_eq!(Digest::parse(d.as_str()), Some(d.clone()));
        assert_eq!(d.short().len(), 12);
        assert!(Digest::parse("md5:abc").is_none());
        assert!(Digest::parse("sha256:xyz").is_none());
    }
}
