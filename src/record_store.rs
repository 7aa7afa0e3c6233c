// Record Store Implementations
// The key-value store mapping a record identifier to its original text.
// `LogRecordStore` is the durable, file-backed store; `MemoryRecordStore`
// serves tests and embedded use.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Display;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::contracts::RecordStore;
use crate::error::IndexError;
use crate::types::RecordId;

/// Frame header: key (4) + payload length (4) + crc32c of payload (4) +
/// crc32c of the preceding 12 header bytes (4)
const FRAME_HEADER_LEN: u64 = 16;

/// Largest payload a frame may carry
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

fn storage_err(what: &str, e: impl Display) -> IndexError {
    IndexError::Storage(format!("{what}: {e}"))
}

/// Location of one payload inside the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FramePointer {
    /// Offset of the payload (just past the frame header)
    offset: u64,
    len: u32,
    crc32: u32,
}

/// Append-only, file-backed record store
///
/// Frame format, all integers little endian:
/// - 4-byte record key
/// - u32 payload length
/// - u32 crc32c of payload
/// - u32 crc32c of the three fields above
/// - raw payload bytes
///
/// The key to frame map is held in memory and rebuilt by scanning the log on
/// open. A later frame for the same key shadows earlier ones. Appends are
/// serialized on one write handle; reads open their own handle and do not wait
/// on writes or on each other.
pub struct LogRecordStore {
    path: PathBuf,
    file: Mutex<LogFile>,
    index: RwLock<HashMap<RecordId, FramePointer>>,
}

struct LogFile {
    handle: fs::File,
    end: u64,
}

impl LogRecordStore {
    /// Open or create the log at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| storage_err(&format!("open {}", path.display()), e))?;

        let mut store = Self {
            path,
            file: Mutex::new(LogFile { handle, end: 0 }),
            index: RwLock::new(HashMap::new()),
        };
        store.recover().await?;
        Ok(store)
    }

    /// Scan the log and rebuild the in-memory index
    ///
    /// Only an interrupted final write is repaired: a header cut short at the
    /// end of the file, or an intact header whose payload runs past it. That
    /// frame is dropped and the file truncated to the last complete frame. A
    /// header failing its checksum or its length bound, or a payload failing
    /// its checksum, is corruption and fails the open without touching the file.
    async fn recover(&mut self) -> Result<()> {
        let file = self.file.get_mut();
        let file_len = file
            .handle
            .metadata()
            .await
            .map_err(|e| storage_err("stat record log", e))?
            .len();

        file.handle
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| storage_err("seek record log", e))?;
        let mut reader = BufReader::new(&mut file.handle);
        let mut index = HashMap::new();
        let mut pos = 0u64;

        while pos + FRAME_HEADER_LEN <= file_len {
            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            reader
                .read_exact(&mut header)
                .await
                .map_err(|e| storage_err("read frame header", e))?;
            let header_crc = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
            if crc32c::crc32c(&header[..12]) != header_crc {
                bail!(IndexError::Storage(format!(
                    "record log {} corrupt: frame header checksum mismatch at offset {}",
                    self.path.display(),
                    pos
                )));
            }
            let id = RecordId::from_key(&header[0..4])?;
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let crc32 = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            if len > MAX_RECORD_LEN {
                bail!(IndexError::Storage(format!(
                    "record log {} corrupt: frame at offset {} claims {} bytes",
                    self.path.display(),
                    pos,
                    len
                )));
            }

            let payload_offset = pos + FRAME_HEADER_LEN;
            if payload_offset + len as u64 > file_len {
                break;
            }

            let mut payload = vec![0u8; len as usize];
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| storage_err("read frame payload", e))?;
            if crc32c::crc32c(&payload) != crc32 {
                bail!(IndexError::Storage(format!(
                    "record log {} corrupt: checksum mismatch for record {} at offset {}",
                    self.path.display(),
                    id,
                    pos
                )));
            }

            index.insert(
                id,
                FramePointer {
                    offset: payload_offset,
                    len,
                    crc32,
                },
            );
            pos = payload_offset + len as u64;
        }
        drop(reader);

        if pos < file_len {
            warn!(
                path = %self.path.display(),
                valid_bytes = pos,
                file_bytes = file_len,
                "Dropping incomplete frame at the tail of the record log"
            );
            file.handle
                .set_len(pos)
                .await
                .map_err(|e| storage_err("truncate record log", e))?;
        }

        file.end = pos;
        info!(
            path = %self.path.display(),
            records = index.len(),
            "Record log opened"
        );
        *self.index.write() = index;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for LogRecordStore {
    async fn put(&self, id: RecordId, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| storage_err("write record", format!("record {id} too large")))?;
        let crc32 = crc32c::crc32c(value);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + value.len());
        frame.extend_from_slice(&id.to_key());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc32.to_le_bytes());
        let header_crc = crc32c::crc32c(&frame);
        frame.extend_from_slice(&header_crc.to_le_bytes());
        frame.extend_from_slice(value);

        let mut file = self.file.lock().await;
        let start = file.end;
        file.handle
            .seek(SeekFrom::Start(start))
            .await
            .map_err(|e| storage_err("seek record log", e))?;
        file.handle
            .write_all(&frame)
            .await
            .map_err(|e| storage_err(&format!("write record {id}"), e))?;
        file.handle
            .flush()
            .await
            .map_err(|e| storage_err(&format!("write record {id}"), e))?;
        file.end = start + frame.len() as u64;

        self.index.write().insert(
            id,
            FramePointer {
                offset: start + FRAME_HEADER_LEN,
                len,
                crc32,
            },
        );
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<Vec<u8>>> {
        let Some(ptr) = self.index.read().get(&id).copied() else {
            return Ok(None);
        };

        // Reads never take the append lock
        let mut handle = fs::File::open(&self.path)
            .await
            .map_err(|e| storage_err(&format!("open {}", self.path.display()), e))?;
        handle
            .seek(SeekFrom::Start(ptr.offset))
            .await
            .map_err(|e| storage_err("seek record log", e))?;
        let mut payload = vec![0u8; ptr.len as usize];
        handle
            .read_exact(&mut payload)
            .await
            .map_err(|e| storage_err(&format!("read record {id}"), e))?;

        if crc32c::crc32c(&payload) != ptr.crc32 {
            bail!(IndexError::Storage(format!(
                "record {id} failed checksum verification"
            )));
        }
        Ok(Some(payload))
    }

    async fn sync(&self) -> Result<()> {
        let file = self.file.lock().await;
        file.handle
            .sync_all()
            .await
            .map_err(|e| storage_err("sync record log", e))?;
        debug!(path = %self.path.display(), "Record log synced");
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.index.read().len())
    }
}

/// In-memory record store keyed by the encoded identifier
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<[u8; RecordId::KEY_LEN], Vec<u8>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-numbered records, identifiers assigned from 0 in order
    pub fn from_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let map = records
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                (
                    RecordId::new(i as u32).to_key(),
                    text.as_ref().as_bytes().to_vec(),
                )
            })
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, id: RecordId, value: &[u8]) -> Result<()> {
        self.records.write().insert(id.to_key(), value.to_vec());
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(&id.to_key()).cloned())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_store_put_get() -> Result<()> {
        let dir = TempDir::new()?;
        let store = LogRecordStore::open(dir.path().join("records.log")).await?;

        store.put(RecordId::new(0), b"red tank").await?;
        store.put(RecordId::new(1), b"blue tank top").await?;

        assert_eq!(store.get(RecordId::new(0)).await?, Some(b"red tank".to_vec()));
        assert_eq!(
            store.get(RecordId::new(1)).await?,
            Some(b"blue tank top".to_vec())
        );
        assert_eq!(store.get(RecordId::new(2)).await?, None);
        assert_eq!(store.len().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_reopen_recovers_index() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("records.log");
        {
            let store = LogRecordStore::open(&path).await?;
            store.put(RecordId::new(0), b"green jug").await?;
            store.put(RecordId::new(1), b"").await?;
            store.sync().await?;
        }

        let store = LogRecordStore::open(&path).await?;
        assert_eq!(store.len().await?, 2);
        assert_eq!(store.get(RecordId::new(0)).await?, Some(b"green jug".to_vec()));
        assert_eq!(store.get(RecordId::new(1)).await?, Some(Vec::new()));

        // Appends continue after the recovered tail
        store.put(RecordId::new(2), b"pot").await?;
        assert_eq!(store.get(RecordId::new(2)).await?, Some(b"pot".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_drops_torn_tail() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("records.log");
        {
            let store = LogRecordStore::open(&path).await?;
            store.put(RecordId::new(0), b"kept").await?;
            store.sync().await?;
        }
        // Half a frame header
        let mut bytes = std::fs::read(&path)?;
        bytes.extend_from_slice(&[1, 0, 0, 0, 9]);
        std::fs::write(&path, &bytes)?;

        let store = LogRecordStore::open(&path).await?;
        assert_eq!(store.len().await?, 1);
        assert_eq!(store.get(RecordId::new(0)).await?, Some(b"kept".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_detects_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("records.log");
        {
            let store = LogRecordStore::open(&path).await?;
            store.put(RecordId::new(0), b"payload").await?;
            store.sync().await?;
        }
        let mut bytes = std::fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        let err = LogRecordStore::open(&path).await.err().expect("corrupt log must fail");
        assert!(matches!(
            IndexError::classify(&err),
            Some(IndexError::Storage(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_drops_torn_payload() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("records.log");
        {
            let store = LogRecordStore::open(&path).await?;
            store.put(RecordId::new(0), b"kept").await?;
            store.put(RecordId::new(1), b"cut short").await?;
            store.sync().await?;
        }
        // The last frame keeps its header but loses the end of its payload
        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 3])?;

        let store = LogRecordStore::open(&path).await?;
        assert_eq!(store.len().await?, 1);
        assert_eq!(store.get(RecordId::new(1)).await?, None);
        assert_eq!(std::fs::metadata(&path)?.len(), FRAME_HEADER_LEN + 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_rejects_corrupted_length() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("records.log");
        {
            let store = LogRecordStore::open(&path).await?;
            store.put(RecordId::new(0), b"red tank").await?;
            store.put(RecordId::new(1), b"blue tank top").await?;
            store.put(RecordId::new(2), b"green jug").await?;
            store.sync().await?;
        }
        // High byte of the first frame's payload length
        let mut bytes = std::fs::read(&path)?;
        let file_len = bytes.len() as u64;
        bytes[7] = 0x7f;
        std::fs::write(&path, &bytes)?;

        let err = LogRecordStore::open(&path).await.err().expect("corrupt header must fail");
        assert!(matches!(
            IndexError::classify(&err),
            Some(IndexError::Storage(_))
        ));
        // Nothing was truncated
        assert_eq!(std::fs::metadata(&path)?.len(), file_len);
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_rejects_oversized_record() -> Result<()> {
        let dir = TempDir::new()?;
        let store = LogRecordStore::open(dir.path().join("records.log")).await?;
        let huge = vec![0u8; MAX_RECORD_LEN as usize + 1];
        assert!(store.put(RecordId::new(0), &huge).await.is_err());
        assert_eq!(store.len().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_concurrent_reads() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(LogRecordStore::open(dir.path().join("records.log")).await?);
        for i in 0..64u32 {
            store.put(RecordId::new(i), format!("record {i}").as_bytes()).await?;
        }

        let mut readers = tokio::task::JoinSet::new();
        for i in (0..64u32).rev() {
            let store = store.clone();
            readers.spawn(async move { (i, store.get(RecordId::new(i)).await) });
        }
        while let Some(joined) = readers.join_next().await {
            let (i, read) = joined?;
            assert_eq!(read?, Some(format!("record {i}").into_bytes()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store() -> Result<()> {
        let store = MemoryRecordStore::from_records(["a", "b"]);
        assert_eq!(store.get(RecordId::new(1)).await?, Some(b"b".to_vec()));
        store.put(RecordId::new(2), b"c").await?;
        assert_eq!(store.len().await?, 3);
        assert!(!store.is_empty().await?);
        Ok(())
    }
}
