// Trie Persistence
// Binary file format for a finalized trie: a fixed-size bincode header followed
// by the bincode-encoded node tree. The header carries the limits the trie was
// built with, so a loaded trie is always queried with matching settings.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::contracts::Tokenizer;
use crate::error::IndexError;
use crate::observability::{log_operation, Operation, OperationContext};
use crate::trie::{Trie, TrieNode};
use crate::types::{BucketCap, LexemeLength};

const TRIE_MAGIC: &[u8; 4] = b"TRIE";
pub const TRIE_FORMAT_VERSION: u32 = 1;

/// Encoded header length: magic 4, version 4, checksum 4, lexeme length 4,
/// bucket length 4, payload length 8
const HEADER_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct TrieFileHeader {
    magic: [u8; 4],
    version: u32,
    /// crc32c of the payload
    checksum: u32,
    max_lexeme_length: u32,
    max_bucket_length: u32,
    payload_len: u64,
}

/// On-disk node shape; characters are stored as code points
#[derive(Debug, Serialize, Deserialize)]
struct PersistedNode {
    character: u32,
    children: Vec<PersistedNode>,
    bucket: Vec<u32>,
}

impl From<&TrieNode> for PersistedNode {
    fn from(node: &TrieNode) -> Self {
        Self {
            character: node.character() as u32,
            children: node.children().iter().map(PersistedNode::from).collect(),
            bucket: node.bucket().to_vec(),
        }
    }
}

impl TryFrom<PersistedNode> for TrieNode {
    type Error = IndexError;

    fn try_from(node: PersistedNode) -> std::result::Result<Self, Self::Error> {
        let ch = char::from_u32(node.character).ok_or_else(|| {
            IndexError::Persistence(format!("invalid code point {:#x}", node.character))
        })?;
        let children = node
            .children
            .into_iter()
            .map(TrieNode::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(TrieNode::new(ch, children, node.bucket))
    }
}

/// A trie read back from disk with the limits it was built with
#[derive(Debug)]
pub struct LoadedTrie {
    pub trie: Trie,
    pub max_lexeme_length: LexemeLength,
    pub max_bucket_length: BucketCap,
    pub size_bytes: u64,
}

impl LoadedTrie {
    /// Configuration matching the persisted limits
    pub fn index_config(&self, tokenizer: std::sync::Arc<dyn Tokenizer>) -> Result<IndexConfig> {
        IndexConfig::builder()
            .tokenizer(tokenizer)
            .max_lexeme_length(self.max_lexeme_length.get())?
            .max_bucket_length(self.max_bucket_length.get())?
            .build()
    }
}

fn limit_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| IndexError::Persistence(format!("{what} {value} does not fit the header")).into())
}

/// Encode a finalized trie into the file format
pub fn encode_trie(trie: &Trie, config: &IndexConfig) -> Result<Vec<u8>> {
    if !trie.is_finalized() {
        bail!(IndexError::Lifecycle(
            "only a finalized trie can be persisted".to_string()
        ));
    }

    let payload = bincode::serialize(&PersistedNode::from(trie.root()))
        .map_err(|e| IndexError::Persistence(format!("encode trie: {e}")))?;
    let header = TrieFileHeader {
        magic: *TRIE_MAGIC,
        version: TRIE_FORMAT_VERSION,
        checksum: crc32c::crc32c(&payload),
        max_lexeme_length: limit_u32(config.max_lexeme_length().get(), "lexeme length")?,
        max_bucket_length: limit_u32(config.max_bucket_length().get(), "bucket length")?,
        payload_len: payload.len() as u64,
    };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| IndexError::Persistence(format!("encode header: {e}")))?;
    debug_assert_eq!(header_bytes.len(), HEADER_LEN);

    let mut bytes = Vec::with_capacity(header_bytes.len() + payload.len());
    bytes.extend_from_slice(&header_bytes);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode the file format, verifying header, checksum and trie invariants
pub fn decode_trie(bytes: &[u8]) -> Result<LoadedTrie> {
    if bytes.len() < HEADER_LEN {
        bail!(IndexError::Persistence(format!(
            "trie file too small: {} bytes",
            bytes.len()
        )));
    }

    let header: TrieFileHeader = bincode::deserialize(&bytes[..HEADER_LEN])
        .map_err(|e| IndexError::Persistence(format!("decode header: {e}")))?;
    if &header.magic != TRIE_MAGIC {
        bail!(IndexError::Persistence(
            "not a trie file: wrong magic bytes".to_string()
        ));
    }
    if header.version != TRIE_FORMAT_VERSION {
        bail!(IndexError::Persistence(format!(
            "incompatible trie format version: {} (expected {})",
            header.version, TRIE_FORMAT_VERSION
        )));
    }

    let payload = &bytes[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        bail!(IndexError::Persistence(format!(
            "trie payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    let checksum = crc32c::crc32c(payload);
    if checksum != header.checksum {
        bail!(IndexError::Persistence(format!(
            "trie file corrupted: checksum mismatch (expected {}, got {})",
            header.checksum, checksum
        )));
    }

    let max_lexeme_length = LexemeLength::new(header.max_lexeme_length as usize)
        .map_err(|e| IndexError::Persistence(format!("bad lexeme length in header: {e}")))?;
    let max_bucket_length = BucketCap::new(header.max_bucket_length as usize)
        .map_err(|e| IndexError::Persistence(format!("bad bucket length in header: {e}")))?;

    let root: PersistedNode = bincode::deserialize(payload)
        .map_err(|e| IndexError::Persistence(format!("decode trie: {e}")))?;
    let trie = Trie::from_finalized_root(TrieNode::try_from(root)?);
    trie.check_finalized(max_bucket_length)
        .map_err(|e| IndexError::Persistence(format!("persisted trie is inconsistent: {e}")))?;

    Ok(LoadedTrie {
        trie,
        max_lexeme_length,
        max_bucket_length,
        size_bytes: bytes.len() as u64,
    })
}

/// Write a finalized trie to `path`
///
/// The file is written next to its destination and renamed into place, so a
/// reader never sees a half-written trie.
pub async fn save_trie(path: &Path, trie: &Trie, config: &IndexConfig) -> Result<u64> {
    let ctx = OperationContext::new("save_trie");
    let bytes = encode_trie(trie, config)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, &bytes)
        .await
        .with_context(|| format!("Failed to write trie file: {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("Failed to move trie file into place: {}", path.display()))?;

    let size_bytes = bytes.len() as u64;
    log_operation(
        &ctx,
        &Operation::PersistTrie {
            path: path.display().to_string(),
            size_bytes,
        },
        &Ok(()),
    );
    Ok(size_bytes)
}

/// Read a trie written by `save_trie`
pub async fn load_trie(path: &Path) -> Result<LoadedTrie> {
    let ctx = OperationContext::new("load_trie");
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read trie file: {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "decoding trie file");

    let loaded = decode_trie(&bytes)
        .with_context(|| format!("Failed to load trie file: {}", path.display()))?;

    log_operation(
        &ctx,
        &Operation::LoadTrie {
            path: path.display().to_string(),
            nodes: loaded.trie.node_count(),
        },
        &Ok(()),
    );
    info!(
        path = %path.display(),
        max_lexeme_length = loaded.max_lexeme_length.get(),
        max_bucket_length = loaded.max_bucket_length.get(),
        "Trie loaded"
    );
    Ok(loaded)
}
