// triedex - Bounded-memory prefix search over short text records
// Root library module

pub mod builder;
pub mod builders;
pub mod catalogue;
pub mod config;
pub mod contracts;
pub mod error;
pub mod http_server;
pub mod observability;
pub mod persistence;
pub mod pure;
pub mod query;
pub mod record_store;
pub mod tokenizer;
pub mod trie;
pub mod types;
pub mod validation;

// Re-export key types
pub use observability::{
    init_logging_with_level,
    Operation,
    MetricType,
    log_operation,
    log_error_with_context,
    record_metric,
    with_trace_id,
};

pub use contracts::{RecordSource, RecordStore, Tokenizer};
pub use error::IndexError;

// Re-export validated types
pub use types::{BucketCap, Lexeme, LexemeLength, RecordId, ValidatedLimit};

// Re-export configuration
pub use builders::IndexConfigBuilder;
pub use config::{IndexConfig, Settings};

// Re-export the index core
pub use trie::{Trie, TrieNode, TrieStats};
pub use builder::{
    build_index_files, build_trie, fan_out, run_build, write_record_store, BuildReport,
};
pub use query::{LexemePlan, OverflowReason, QueryEngine, QueryOutcome};

// Re-export adapters
pub use catalogue::{CsvRecordSource, MemoryRecordSource};
pub use record_store::{LogRecordStore, MemoryRecordStore};
pub use persistence::{load_trie, save_trie, LoadedTrie};
pub use tokenizer::ProductTitleTokenizer;
pub use http_server::{create_server, start_server, AppState};
