// Configuration
// `IndexConfig` is the immutable value every core operation receives.
// `Settings` is the operator-facing layer: loaded from an optional TOML file,
// then overridden by CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::builders::IndexConfigBuilder;
use crate::contracts::Tokenizer;
use crate::types::{BucketCap, Lexeme, LexemeLength};
use crate::validation;

pub const DEFAULT_MAX_LEXEME_LENGTH: usize = 10;
pub const DEFAULT_MAX_BUCKET_LENGTH: usize = 1024;
pub const DEFAULT_PORT: u16 = 3812;
pub const DEFAULT_RESULT_LIMIT: usize = 10;

/// Tokenizer plus the two length limits, shared by build and query
#[derive(Clone)]
pub struct IndexConfig {
    tokenizer: Arc<dyn Tokenizer>,
    max_lexeme_length: LexemeLength,
    max_bucket_length: BucketCap,
}

impl IndexConfig {
    pub(crate) fn from_parts(
        tokenizer: Arc<dyn Tokenizer>,
        max_lexeme_length: LexemeLength,
        max_bucket_length: BucketCap,
    ) -> Self {
        Self {
            tokenizer,
            max_lexeme_length,
            max_bucket_length,
        }
    }

    pub fn builder() -> IndexConfigBuilder {
        IndexConfigBuilder::new()
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn max_lexeme_length(&self) -> LexemeLength {
        self.max_lexeme_length
    }

    pub fn max_bucket_length(&self) -> BucketCap {
        self.max_bucket_length
    }

    /// Tokenize text
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenizer.tokenize(text)
    }

    /// Clamp a raw lexeme to the configured maximum length
    pub fn clamp(&self, raw: &str) -> Lexeme {
        Lexeme::clamp(raw, self.max_lexeme_length)
    }
}

impl fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexConfig")
            .field("max_lexeme_length", &self.max_lexeme_length.get())
            .field("max_bucket_length", &self.max_bucket_length.get())
            .finish_non_exhaustive()
    }
}

/// Operator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_lexeme_length: usize,
    pub max_bucket_length: usize,
    pub trie_path: PathBuf,
    pub record_store_path: PathBuf,
    pub catalogue_path: Option<PathBuf>,
    /// Zero-based CSV column holding the record text
    pub catalogue_column: usize,
    pub port: u16,
    /// Results returned by the HTTP surface when the caller gives no limit
    pub result_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_lexeme_length: DEFAULT_MAX_LEXEME_LENGTH,
            max_bucket_length: DEFAULT_MAX_BUCKET_LENGTH,
            trie_path: PathBuf::from("./data/trie.bin"),
            record_store_path: PathBuf::from("./data/records.log"),
            catalogue_path: None,
            catalogue_column: 1,
            port: DEFAULT_PORT,
            result_limit: DEFAULT_RESULT_LIMIT,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).with_context(|| {
                    format!("Failed to read settings file: {}", path.display())
                })?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Invalid settings file: {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(settings)
    }

    /// Parse settings from TOML text; absent keys keep their defaults
    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(raw).context("Failed to parse settings TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate paths and limits
    pub fn validate(&self) -> Result<()> {
        validation::config::validate_lexeme_length(self.max_lexeme_length)?;
        validation::config::validate_bucket_cap(self.max_bucket_length)?;
        validation::path::validate_file_path(&self.trie_path.to_string_lossy())?;
        validation::path::validate_file_path(&self.record_store_path.to_string_lossy())?;
        anyhow::ensure!(self.result_limit > 0, "Result limit must be greater than zero");
        Ok(())
    }

    /// Build the core configuration with the given tokenizer
    pub fn index_config(&self, tokenizer: Arc<dyn Tokenizer>) -> Result<IndexConfig> {
        IndexConfigBuilder::new()
            .tokenizer(tokenizer)
            .max_lexeme_length(self.max_lexeme_length)?
            .max_bucket_length(self.max_bucket_length)?
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ProductTitleTokenizer;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_lexeme_length, 10);
        assert_eq!(settings.max_bucket_length, 1024);
        assert_eq!(settings.port, 3812);
        settings.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            max_bucket_length = 64
            trie_path = "/tmp/catalogue/trie.bin"
            "#,
        )
        .unwrap();

        assert_eq!(settings.max_bucket_length, 64);
        assert_eq!(settings.max_lexeme_length, DEFAULT_MAX_LEXEME_LENGTH);
        assert_eq!(settings.trie_path, PathBuf::from("/tmp/catalogue/trie.bin"));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(Settings::from_toml("max_bucket_length = 0").is_err());
        assert!(Settings::from_toml("max_bucket_length = \"many\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("triedex.toml");
        std::fs::write(&path, "port = 9000\ncatalogue_column = 0\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.catalogue_column, 0);

        assert!(Settings::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_index_config_from_settings() {
        let config = Settings::default()
            .index_config(Arc::new(ProductTitleTokenizer))
            .unwrap();
        assert_eq!(config.max_lexeme_length().get(), 10);
        assert_eq!(config.clamp("tankinisuits").to_string(), "tankinisui");
        assert_eq!(config.tokenize("Red Tank"), vec!["red", "tank"]);
    }
}
