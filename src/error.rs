// Index Error Taxonomy
// Typed root causes carried inside anyhow errors. Callers recover the category
// with `err.downcast_ref::<IndexError>()`; adapters map it to a status code or
// an exit code.

use thiserror::Error;

/// Failure categories of the build and query paths
///
/// A lexeme missing from the trie is not an error: it yields an empty bucket.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The record source or the tokenizer failed while building
    #[error("Input failure: {0}")]
    Input(String),

    /// The record store failed a read or a write
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Cooperative cancellation was requested
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A persisted trie could not be decoded
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// A lifecycle rule of the trie was broken (mutating after finalization)
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),
}

impl IndexError {
    /// Cancellation is a normal abort rather than a data error
    pub fn is_cancellation(&self) -> bool {
        matches!(self, IndexError::Cancelled(_))
    }

    /// Classify an anyhow error by its outermost `IndexError`, if any
    pub fn classify(err: &anyhow::Error) -> Option<&IndexError> {
        err.chain().find_map(|e| e.downcast_ref::<IndexError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_display() {
        let err = IndexError::Storage("record 42 missing".to_string());
        assert_eq!(err.to_string(), "Storage failure: record 42 missing");
    }

    #[test]
    fn test_cancellation_is_not_data_error() {
        assert!(IndexError::Cancelled("build".to_string()).is_cancellation());
        assert!(!IndexError::Input("csv".to_string()).is_cancellation());
    }

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Error = Err::<(), _>(IndexError::Input("bad row".to_string()))
            .context("while building")
            .unwrap_err();
        assert!(matches!(
            IndexError::classify(&err),
            Some(IndexError::Input(_))
        ));

        let plain = anyhow::anyhow!("something else");
        assert!(IndexError::classify(&plain).is_none());
    }
}
