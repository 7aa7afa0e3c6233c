// Record Sources
// Catalogue readers that feed raw record text, in order, into the build pipeline

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::contracts::RecordSource;
use crate::error::IndexError;

/// Reads one column of a CSV catalogue
///
/// A catalogue may list the same title many times (one row per variant); only
/// the first occurrence of a value is emitted. Rows too short to hold the
/// column are logged and skipped.
#[derive(Debug, Clone)]
pub struct CsvRecordSource {
    path: PathBuf,
    column: usize,
    has_headers: bool,
}

impl CsvRecordSource {
    pub fn new(path: impl AsRef<Path>, column: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            column,
            has_headers: false,
        }
    }

    /// Treat the first row as a header and skip it
    pub fn with_headers(mut self, has_headers: bool) -> Self {
        self.has_headers = has_headers;
        self
    }

    fn read_blocking(
        &self,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.has_headers)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| {
                IndexError::Input(format!(
                    "could not open csv catalogue {}: {e}",
                    self.path.display()
                ))
            })?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut sent = 0u64;
        let mut duplicates = 0u64;

        for (line, row) in reader.records().enumerate() {
            if cancel.is_cancelled() {
                bail!(IndexError::Cancelled(format!(
                    "csv catalogue read stopped after {sent} records"
                )));
            }

            let row = row.map_err(|e| IndexError::Input(format!("csv read failed: {e}")))?;
            let Some(value) = row.get(self.column) else {
                error!(line, column = self.column, "csv line does not have the column");
                continue;
            };
            if !seen.insert(value.to_string()) {
                duplicates += 1;
                continue;
            }

            // A closed channel means the pipeline is shutting down
            if tx.blocking_send(value.to_string()).is_err() {
                bail!(IndexError::Cancelled(
                    "record consumer closed before the catalogue was exhausted".to_string()
                ));
            }
            sent += 1;
        }

        debug!(sent, duplicates, "csv catalogue exhausted");
        Ok(sent)
    }
}

#[async_trait]
impl RecordSource for CsvRecordSource {
    async fn stream(&mut self, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Result<u64> {
        let source = self.clone();
        let sent = tokio::task::spawn_blocking(move || source.read_blocking(tx, cancel))
            .await
            .map_err(|e| IndexError::Input(format!("csv reader task failed: {e}")))??;
        info!(path = %self.path.display(), records = sent, "Catalogue streamed");
        Ok(sent)
    }
}

/// Records held in memory, streamed in order
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordSource {
    records: Vec<String>,
    consumed: bool,
}

impl MemoryRecordSource {
    pub fn new<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            records: records.into_iter().map(Into::into).collect(),
            consumed: false,
        }
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn stream(&mut self, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Result<u64> {
        if self.consumed {
            bail!(IndexError::Input(
                "record source has already been consumed".to_string()
            ));
        }
        self.consumed = true;

        let mut sent = 0u64;
        for record in std::mem::take(&mut self.records) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    bail!(IndexError::Cancelled(format!(
                        "record stream stopped after {sent} records"
                    )));
                }
                res = tx.send(record) => {
                    if res.is_err() {
                        bail!(IndexError::Cancelled(
                            "record consumer closed before the source was exhausted".to_string()
                        ));
                    }
                }
            }
            sent += 1;
        }
        Ok(sent)
    }
}
