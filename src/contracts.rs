// Contracts
// Traits at the seams between the index core and its external collaborators:
// the tokenizer and the record store. Preconditions and postconditions are part
// of each method's documentation.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::RecordId;

/// Splits raw text into lexemes
pub trait Tokenizer: Send + Sync {
    /// Tokenize text into an ordered sequence of lexemes
    ///
    /// # Postconditions
    /// - Pure and deterministic: the same text always yields the same lexemes
    /// - The build, query and overflow-verification paths all call this, and
    ///   results are only correct if the three agree
    fn tokenize(&self, text: &str) -> Vec<String>;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    fn tokenize(&self, text: &str) -> Vec<String> {
        self(text)
    }
}

/// Key-value store holding the original text of every record
///
/// Keys are the 4-byte little-endian encoding of the record identifier.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write a record
    ///
    /// # Preconditions
    /// - Called by the single build-phase writer, in identifier order
    ///
    /// # Postconditions
    /// - The record is readable with `get` once this returns
    /// - A failure is reported as a storage failure and aborts the build
    async fn put(&self, id: RecordId, value: &[u8]) -> Result<()>;

    /// Read a record
    ///
    /// # Postconditions
    /// - Returns Some(bytes) if the record exists, None otherwise
    /// - Does not modify any state; concurrent reads are safe
    async fn get(&self, id: RecordId) -> Result<Option<Vec<u8>>>;

    /// Force pending writes to durable storage
    async fn sync(&self) -> Result<()>;

    /// Number of records held
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Ordered supplier of raw record text
///
/// Position in the stream defines each record's identifier, so the order must
/// be stable and every record delivered exactly once.
#[async_trait]
pub trait RecordSource: Send {
    /// Push every record into `tx`, in order, then return the number sent
    ///
    /// # Preconditions
    /// - Called at most once per source
    ///
    /// # Postconditions
    /// - Stops promptly once `cancel` fires and returns a cancellation error
    /// - A read failure is an input failure; nothing after it is sent
    /// - Dropping `tx` on return signals end of stream to the consumer
    /// - A closed `tx` means the consumer stopped; report it as a cancellation
    async fn stream(&mut self, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_tokenizer() {
        let split = |text: &str| -> Vec<String> {
            text.split_whitespace().map(str::to_string).collect()
        };
        assert_eq!(split.tokenize("red tank"), vec!["red", "tank"]);
    }
}
