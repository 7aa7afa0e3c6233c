// Validation Layer - Contract Enforcement
// Runtime validation of configuration values, storage paths and the
// post-finalization bucket invariants of the trie

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::Path;

/// Validation errors with detailed context
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Precondition failed: {condition}")]
    PreconditionFailed { condition: String, context: String },

    #[error("Invariant violated: {invariant}")]
    InvariantViolated { invariant: String, state: String },

    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },
}

/// Validation context for better error messages
#[derive(Clone)]
pub struct ValidationContext {
    operation: String,
    attributes: HashMap<String, String>,
}

impl ValidationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn validate(self, condition: bool, message: &str) -> Result<()> {
        if !condition {
            let context = format!(
                "Operation: {}, Attributes: {:?}",
                self.operation, self.attributes
            );
            bail!(ValidationError::PreconditionFailed {
                condition: message.to_string(),
                context,
            });
        }
        Ok(())
    }
}

/// Path validation for the trie file and record store locations
pub mod path {
    use super::*;

    /// Maximum path length across platforms
    const MAX_PATH_LENGTH: usize = 4096;

    /// Validate a file path used for persistence
    pub fn validate_file_path(path: &str) -> Result<()> {
        let ctx = ValidationContext::new("validate_file_path").with_attribute("path", path);

        ctx.clone()
            .validate(!path.is_empty(), "Path cannot be empty")?;

        ctx.clone().validate(
            path.len() < MAX_PATH_LENGTH,
            &format!("Path exceeds maximum length of {MAX_PATH_LENGTH}"),
        )?;

        ctx.validate(!path.contains('\0'), "Path contains null bytes")?;

        if Path::new(path).file_name().is_none() {
            bail!(ValidationError::InvalidInput {
                field: "path".to_string(),
                reason: "Path must name a file".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration validation
pub mod config {
    use super::*;

    /// Upper bound on lexeme length; longer paths only grow the trie without
    /// narrowing results
    pub const MAX_LEXEME_LENGTH: usize = 256;

    /// Upper bound on bucket length
    pub const MAX_BUCKET_CAP: usize = 1 << 20;

    pub fn validate_lexeme_length(len: usize) -> Result<()> {
        let ctx = ValidationContext::new("lexeme_length").with_attribute("len", len.to_string());

        ctx.clone()
            .validate(len > 0, "Maximum lexeme length must be greater than zero")?;
        ctx.validate(
            len <= MAX_LEXEME_LENGTH,
            &format!("Maximum lexeme length exceeds {MAX_LEXEME_LENGTH}"),
        )?;

        Ok(())
    }

    pub fn validate_bucket_cap(cap: usize) -> Result<()> {
        let ctx = ValidationContext::new("bucket_cap").with_attribute("cap", cap.to_string());

        ctx.clone()
            .validate(cap > 0, "Maximum bucket length must be greater than zero")?;
        ctx.validate(
            cap <= MAX_BUCKET_CAP,
            &format!("Maximum bucket length exceeds {MAX_BUCKET_CAP}"),
        )?;

        Ok(())
    }
}

/// Index validation
pub mod index {
    use super::*;

    /// Validate a search query
    pub fn validate_search_query(query: &str) -> Result<()> {
        let ctx = ValidationContext::new("search_query").with_attribute("query", query);

        ctx.clone()
            .validate(!query.trim().is_empty(), "Search query cannot be empty")?;

        ctx.validate(query.len() < 1024, "Search query too long (max 1024 chars)")?;

        Ok(())
    }

    /// Validate a finalized bucket: strictly ascending (hence duplicate-free)
    /// and no longer than `cap`
    pub fn validate_bucket(path: &str, bucket: &[u32], cap: usize) -> Result<()> {
        if bucket.len() > cap {
            bail!(ValidationError::InvariantViolated {
                invariant: format!("bucket length <= {cap}"),
                state: format!("node '{path}' holds {} entries", bucket.len()),
            });
        }

        if let Some(pos) = bucket.windows(2).position(|w| w[0] >= w[1]) {
            bail!(ValidationError::InvariantViolated {
                invariant: "bucket strictly ascending".to_string(),
                state: format!(
                    "node '{path}' has {} followed by {} at position {}",
                    bucket[pos],
                    bucket[pos + 1],
                    pos
                ),
            });
        }

        Ok(())
    }

    /// Validate that sibling characters are pairwise distinct
    pub fn validate_children(path: &str, chars: &[char]) -> Result<()> {
        let mut seen = std::collections::HashSet::with_capacity(chars.len());
        for c in chars {
            if !seen.insert(*c) {
                bail!(ValidationError::InvariantViolated {
                    invariant: "child characters distinct".to_string(),
                    state: format!("node '{path}' has duplicate child '{c}'"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_validation() {
        assert!(path::validate_file_path("./data/trie.bin").is_ok());
        assert!(path::validate_file_path("records.log").is_ok());

        assert!(path::validate_file_path("").is_err());
        assert!(path::validate_file_path("file\0with\0nulls").is_err());
        assert!(path::validate_file_path("/").is_err());

        let long_path = "x".repeat(5000);
        assert!(path::validate_file_path(&long_path).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(config::validate_lexeme_length(10).is_ok());
        assert!(config::validate_lexeme_length(0).is_err());
        assert!(config::validate_lexeme_length(config::MAX_LEXEME_LENGTH + 1).is_err());

        assert!(config::validate_bucket_cap(1024).is_ok());
        assert!(config::validate_bucket_cap(0).is_err());
        assert!(config::validate_bucket_cap(config::MAX_BUCKET_CAP + 1).is_err());
    }

    #[test]
    fn test_bucket_validation() {
        assert!(index::validate_bucket("ab", &[], 3).is_ok());
        assert!(index::validate_bucket("ab", &[1, 2, 5], 3).is_ok());

        // Too long
        assert!(index::validate_bucket("ab", &[1, 2, 3, 4], 3).is_err());
        // Duplicate
        assert!(index::validate_bucket("ab", &[1, 1, 2], 3).is_err());
        // Unsorted
        let err = index::validate_bucket("ab", &[2, 1], 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::InvariantViolated { .. })
        ));
    }

    #[test]
    fn test_children_validation() {
        assert!(index::validate_children("", &['a', 'b', 'c']).is_ok());
        assert!(index::validate_children("", &['a', 'b', 'a']).is_err());
    }

    #[test]
    fn test_search_query_validation() {
        assert!(index::validate_search_query("tank").is_ok());
        assert!(index::validate_search_query("   ").is_err());
        assert!(index::validate_search_query(&"x".repeat(2000)).is_err());
    }
}
