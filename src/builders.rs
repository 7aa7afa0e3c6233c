// Builder Patterns
// Fluent builder for the index configuration with sensible defaults

use anyhow::Result;
use std::sync::Arc;

use crate::config::{IndexConfig, DEFAULT_MAX_BUCKET_LENGTH, DEFAULT_MAX_LEXEME_LENGTH};
use crate::contracts::Tokenizer;
use crate::tokenizer::ProductTitleTokenizer;
use crate::types::{BucketCap, LexemeLength};

/// Builder for index configuration
pub struct IndexConfigBuilder {
    tokenizer: Option<Arc<dyn Tokenizer>>,
    max_lexeme_length: Option<LexemeLength>,
    max_bucket_length: Option<BucketCap>,
}

impl IndexConfigBuilder {
    pub fn new() -> Self {
        Self {
            tokenizer: None,
            max_lexeme_length: None,
            max_bucket_length: None,
        }
    }

    /// Set the tokenizer
    /// Defaults to `ProductTitleTokenizer`
    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Set the maximum lexeme length in characters
    pub fn max_lexeme_length(mut self, len: usize) -> Result<Self> {
        self.max_lexeme_length = Some(LexemeLength::new(len)?);
        Ok(self)
    }

    /// Set the maximum bucket length
    pub fn max_bucket_length(mut self, cap: usize) -> Result<Self> {
        self.max_bucket_length = Some(BucketCap::new(cap)?);
        Ok(self)
    }

    /// Build the configuration
    pub fn build(self) -> Result<IndexConfig> {
        let tokenizer = self
            .tokenizer
            .unwrap_or_else(|| Arc::new(ProductTitleTokenizer::new()));
        let max_lexeme_length = match self.max_lexeme_length {
            Some(len) => len,
            None => LexemeLength::new(DEFAULT_MAX_LEXEME_LENGTH)?,
        };
        let max_bucket_length = match self.max_bucket_length {
            Some(cap) => cap,
            None => BucketCap::new(DEFAULT_MAX_BUCKET_LENGTH)?,
        };

        Ok(IndexConfig::from_parts(
            tokenizer,
            max_lexeme_length,
            max_bucket_length,
        ))
    }
}

impl Default for IndexConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
