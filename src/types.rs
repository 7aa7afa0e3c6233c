// Validated Types
// Strongly-typed wrappers for the values shared between the trie, the record store
// and the query engine. These types cannot be constructed with invalid data.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sequential, zero-based identifier assigned to each ingested record
///
/// This is the only join key between the trie and the record store, so its
/// byte encoding is fixed: 4 bytes, little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(u32);

impl RecordId {
    /// Width of the encoded store key in bytes
    pub const KEY_LEN: usize = 4;

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Encode as a record store key
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        self.0.to_le_bytes()
    }

    /// Decode a record store key
    pub fn from_key(key: &[u8]) -> Result<Self> {
        ensure!(
            key.len() == Self::KEY_LEN,
            "Record key must be exactly {} bytes, got {}",
            Self::KEY_LEN,
            key.len()
        );
        let mut buf = [0u8; Self::KEY_LEN];
        buf.copy_from_slice(key);
        Ok(Self(u32::from_le_bytes(buf)))
    }

    /// The identifier that follows this one
    ///
    /// # Invariants
    /// - Identifiers are dense; running out of u32 space is an input failure
    pub fn next(&self) -> Result<Self> {
        let next = self
            .0
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("Record identifier space exhausted at {}", self.0))?;
        Ok(Self(next))
    }
}

impl From<u32> for RecordId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lexeme after clamping to the configured maximum length
///
/// Length is measured in characters (Unicode scalar values), which is also the
/// unit of a trie edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lexeme {
    chars: Vec<char>,
    truncated: bool,
}

impl Lexeme {
    /// Clamp a raw lexeme to at most `max_len` characters
    pub fn clamp(raw: &str, max_len: LexemeLength) -> Self {
        let mut chars: Vec<char> = raw.chars().collect();
        let truncated = chars.len() > max_len.get();
        chars.truncate(max_len.get());
        Self { chars, truncated }
    }

    /// Characters forming the trie path
    pub fn path(&self) -> &[char] {
        &self.chars
    }

    /// Whether characters were dropped by clamping
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

impl fmt::Display for Lexeme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.chars {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Maximum lexeme length in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LexemeLength {
    inner: usize,
}

impl LexemeLength {
    /// Create a new lexeme length
    ///
    /// # Invariants
    /// - Must be > 0, a zero-length path would collapse every lexeme onto the root
    pub fn new(len: usize) -> Result<Self> {
        crate::validation::config::validate_lexeme_length(len)?;
        Ok(Self { inner: len })
    }

    pub fn get(&self) -> usize {
        self.inner
    }
}

/// Maximum number of identifiers kept in one trie bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketCap {
    inner: usize,
}

impl BucketCap {
    /// Create a new bucket cap
    ///
    /// # Invariants
    /// - Must be > 0
    pub fn new(cap: usize) -> Result<Self> {
        crate::validation::config::validate_bucket_cap(cap)?;
        Ok(Self { inner: cap })
    }

    pub fn get(&self) -> usize {
        self.inner
    }
}

/// A limit value with enforced bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedLimit {
    inner: usize,
    max: usize,
}

impl ValidatedLimit {
    /// Create a new validated limit
    pub fn new(limit: usize, max: usize) -> Result<Self> {
        ensure!(limit > 0, "Limit must be greater than zero");
        ensure!(limit <= max, "Limit exceeds maximum of {}", max);

        Ok(Self { inner: limit, max })
    }

    /// Get the limit value
    pub fn get(&self) -> usize {
        self.inner
    }

    /// Get the maximum allowed value
    pub fn max(&self) -> usize {
        self.max
    }
}
