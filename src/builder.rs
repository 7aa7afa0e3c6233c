// Index Builder
// Drives one ordered record stream into the trie and, in lockstep, into the
// record store. Identifiers are assigned by stream position on both sides, so a
// record's trie identifier and its store key always agree.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::IndexConfig;
use crate::contracts::{RecordSource, RecordStore};
use crate::error::IndexError;
use crate::observability::{log_operation, Operation, OperationContext, PerfTimer};
use crate::persistence::save_trie;
use crate::record_store::LogRecordStore;
use crate::trie::{Trie, TrieStats};
use crate::types::RecordId;

/// Capacity of each pipeline channel
pub const PIPELINE_BUFFER: usize = 1024;

/// Figures from one trie build
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub records: u64,
    pub lexemes: u64,
    /// Lexemes clamped to the maximum lexeme length
    pub truncated_lexemes: u64,
    /// Records written to the record store, when one was attached
    pub stored_records: Option<u64>,
    pub elapsed: Duration,
    pub stats: TrieStats,
}

/// Hands out sequential record identifiers starting at 0
#[derive(Debug, Default)]
struct IdSequence {
    next: Option<RecordId>,
    exhausted: bool,
}

impl IdSequence {
    fn next_id(&mut self) -> Result<RecordId> {
        if self.exhausted {
            bail!(IndexError::Input(
                "record identifier space exhausted".to_string()
            ));
        }
        let id = self.next.unwrap_or(RecordId::new(0));
        match id.next() {
            Ok(next) => self.next = Some(next),
            Err(_) => self.exhausted = true,
        }
        Ok(id)
    }
}

/// Wait for the next record, or fail once cancellation is requested
async fn next_record(
    rx: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
    stage: &str,
) -> Result<Option<String>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            bail!(IndexError::Cancelled(format!("{stage} stopped before the stream ended")))
        }
        item = rx.recv() => Ok(item),
    }
}

/// Consume the record stream into `trie`, then finalize it
///
/// Each record gets the next identifier, is tokenized, and its identifier is
/// appended under every clamped lexeme. A lexeme repeated within one record is
/// appended repeatedly; finalization removes the duplicates. On success the
/// trie has been finalized with the configured bucket cap.
pub async fn build_trie(
    trie: &mut Trie,
    config: &IndexConfig,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<BuildReport> {
    let started = Instant::now();
    let mut ids = IdSequence::default();
    let mut report = BuildReport::default();

    while let Some(item) = next_record(&mut rx, &cancel, "trie build").await? {
        let id = ids.next_id()?;
        trace!(id = %id, item = %item, "indexing record");

        for part in config.tokenize(&item) {
            let lexeme = config.clamp(&part);
            if lexeme.was_truncated() {
                trace!(part = %part, "truncating lexeme");
                report.truncated_lexemes += 1;
            }
            trie.append(lexeme.path(), id.get())?;
            report.lexemes += 1;
        }
        report.records += 1;
    }

    report.stats = {
        let _timer = PerfTimer::new("merge_upwards");
        trie.merge_upwards(config.max_bucket_length())?
    };
    report.elapsed = started.elapsed();

    let ctx = OperationContext::new("build_trie");
    log_operation(
        &ctx,
        &Operation::FinalizeTrie {
            nodes: report.stats.nodes,
            bucket_cap: config.max_bucket_length().get(),
        },
        &Ok(()),
    );
    Ok(report)
}

/// Consume the record stream into the record store
///
/// Keys follow the same sequential identifier scheme as `build_trie`.
pub async fn write_record_store(
    store: &dyn RecordStore,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut ids = IdSequence::default();
    let mut written = 0u64;

    while let Some(item) = next_record(&mut rx, &cancel, "record store write").await? {
        let id = ids.next_id()?;
        store.put(id, item.as_bytes()).await?;
        written += 1;
    }
    store.sync().await?;

    let ctx = OperationContext::new("write_record_store");
    log_operation(&ctx, &Operation::StoreWrite { records: written }, &Ok(()));
    debug!(records = written, "record store written");
    Ok(written)
}

/// Copy every record from `rx` to each of `outputs`, in order
///
/// Each record is delivered to every output before the next one is read, so
/// all consumers observe the same sequence exactly once. Ends when `rx` closes.
pub async fn fan_out(
    mut rx: mpsc::Receiver<String>,
    outputs: Vec<mpsc::Sender<String>>,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut forwarded = 0u64;
    while let Some(item) = next_record(&mut rx, &cancel, "fan out").await? {
        for out in &outputs {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    bail!(IndexError::Cancelled("fan out stopped".to_string()))
                }
                res = out.send(item.clone()) => res,
            };
            // Consumers only close early when they fail or are cancelled,
            // and report that themselves
            if sent.is_err() {
                bail!(IndexError::Cancelled(
                    "a record consumer closed before the stream ended".to_string()
                ));
            }
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

enum StageOutput {
    Source(u64),
    FanOut(u64),
    Trie(Box<Trie>, BuildReport),
    Store(u64),
}

/// Run a complete build: source, trie builder and optional store writer
///
/// All stages run concurrently off a single read of `source`. The first
/// failure cancels the remaining stages and is returned; a non-cancellation
/// error is preferred over the cancellations it triggers. No trie is returned
/// unless every stage succeeded.
pub async fn run_build(
    mut source: Box<dyn RecordSource>,
    config: IndexConfig,
    store: Option<Arc<dyn RecordStore>>,
    cancel: CancellationToken,
) -> Result<(Trie, BuildReport)> {
    let started = Instant::now();
    let cancel = cancel.child_token();
    let mut stages: JoinSet<Result<StageOutput>> = JoinSet::new();

    let (source_tx, source_rx) = mpsc::channel(PIPELINE_BUFFER);
    let (trie_tx, trie_rx) = mpsc::channel(PIPELINE_BUFFER);
    let mut outputs = vec![trie_tx];

    let token = cancel.clone();
    stages.spawn(async move { source.stream(source_tx, token).await.map(StageOutput::Source) });

    let token = cancel.clone();
    stages.spawn(async move {
        let mut trie = Trie::new();
        let report = build_trie(&mut trie, &config, trie_rx, token).await?;
        Ok(StageOutput::Trie(Box::new(trie), report))
    });

    if let Some(store) = store {
        let (store_tx, store_rx) = mpsc::channel(PIPELINE_BUFFER);
        outputs.push(store_tx);
        let token = cancel.clone();
        stages.spawn(async move {
            write_record_store(store.as_ref(), store_rx, token)
                .await
                .map(StageOutput::Store)
        });
    }

    let token = cancel.clone();
    stages.spawn(async move { fan_out(source_rx, outputs, token).await.map(StageOutput::FanOut) });

    let mut first_error: Option<anyhow::Error> = None;
    let mut built: Option<(Trie, BuildReport)> = None;
    let mut stored = None;
    let mut sourced = 0u64;

    while let Some(joined) = stages.join_next().await {
        let outcome = joined
            .map_err(|e| -> anyhow::Error {
                IndexError::Input(format!("build stage panicked: {e}")).into()
            })
            .and_then(|res| res);
        match outcome {
            Ok(StageOutput::Source(n)) => sourced = n,
            Ok(StageOutput::FanOut(n)) => trace!(forwarded = n, "fan out finished"),
            Ok(StageOutput::Trie(trie, report)) => built = Some((*trie, report)),
            Ok(StageOutput::Store(n)) => stored = Some(n),
            Err(err) => {
                cancel.cancel();
                let replace = match &first_error {
                    None => true,
                    Some(prev) => {
                        IndexError::classify(prev).is_some_and(IndexError::is_cancellation)
                            && !IndexError::classify(&err).is_some_and(IndexError::is_cancellation)
                    }
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_error {
        warn!(error = %err, "build aborted, discarding partial trie");
        return Err(err);
    }

    let Some((trie, mut report)) = built else {
        bail!(IndexError::Input("trie stage produced no result".to_string()));
    };
    if report.records != sourced {
        bail!(IndexError::Input(format!(
            "source sent {sourced} records but the trie indexed {}",
            report.records
        )));
    }
    if let Some(n) = stored {
        if n != report.records {
            bail!(IndexError::Storage(format!(
                "record store holds {n} records but the trie indexed {}",
                report.records
            )));
        }
    }
    report.stored_records = stored;
    report.elapsed = started.elapsed();

    let mut ctx = OperationContext::new("run_build");
    ctx.add_attribute("truncated_lexemes", report.truncated_lexemes);
    if let Some(n) = report.stored_records {
        ctx.add_attribute("stored_records", n);
    }
    log_operation(
        &ctx,
        &Operation::BuildIndex {
            records: report.records,
            lexemes: report.lexemes,
        },
        &Ok(()),
    );
    info!(
        records = report.records,
        lexemes = report.lexemes,
        truncated = report.truncated_lexemes,
        nodes = report.stats.nodes,
        elapsed_ms = report.elapsed.as_millis(),
        "Index build complete"
    );
    Ok((trie, report))
}

/// Sibling path that a file is built under before it replaces `path`
fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".staging");
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Build a trie file and its record log from `source`, replacing any previous pair
///
/// Both files are written under staging names next to their destinations and
/// only renamed into place once the build and the trie write have succeeded.
/// On failure the staging files are removed and an existing trie and record
/// log are left untouched, so their identifiers keep matching.
///
/// Returns the build report and the size of the trie file.
pub async fn build_index_files(
    source: Box<dyn RecordSource>,
    config: IndexConfig,
    trie_path: &Path,
    store_path: &Path,
    cancel: CancellationToken,
) -> Result<(BuildReport, u64)> {
    let staged_store = staging_path(store_path);
    let staged_trie = staging_path(trie_path);
    remove_if_exists(&staged_store).await?;
    remove_if_exists(&staged_trie).await?;

    let staged = async {
        let store: Arc<dyn RecordStore> = Arc::new(LogRecordStore::open(&staged_store).await?);
        let (trie, report) = run_build(source, config.clone(), Some(store), cancel).await?;
        let size_bytes = save_trie(&staged_trie, &trie, &config).await?;
        Ok::<_, anyhow::Error>((report, size_bytes))
    }
    .await;

    let (report, size_bytes) = match staged {
        Ok(done) => done,
        Err(err) => {
            for path in [&staged_store, &staged_trie] {
                if let Err(e) = remove_if_exists(path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove staging file");
                }
            }
            return Err(err);
        }
    };

    tokio::fs::rename(&staged_store, store_path)
        .await
        .with_context(|| format!("Failed to move record store into place: {}", store_path.display()))?;
    tokio::fs::rename(&staged_trie, trie_path)
        .await
        .with_context(|| format!("Failed to move trie file into place: {}", trie_path.display()))?;

    info!(
        trie = %trie_path.display(),
        store = %store_path.display(),
        records = report.records,
        "Index files replaced"
    );
    Ok((report, size_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::IndexConfigBuilder;
    use crate::catalogue::MemoryRecordSource;
    use crate::record_store::MemoryRecordStore;

    fn config(max_lexeme: usize, cap: usize) -> IndexConfig {
        IndexConfigBuilder::new()
            .max_lexeme_length(max_lexeme)
            .unwrap()
            .max_bucket_length(cap)
            .unwrap()
            .build()
            .unwrap()
    }

    async fn feed(records: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for r in records {
            tx.send(r.to_string()).await.unwrap();
        }
        rx
    }

    fn p(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[tokio::test]
    async fn test_build_trie_assigns_sequential_ids() -> Result<()> {
        let rx = feed(&["red tank", "blue tank top", "green jug"]).await;
        let mut trie = Trie::new();
        let report = build_trie(&mut trie, &config(10, 1024), rx, CancellationToken::new()).await?;

        assert_eq!(report.records, 3);
        assert_eq!(report.lexemes, 7);
        assert!(trie.is_finalized());
        assert_eq!(trie.lookup(&p("tank")), &[0, 1]);
        assert_eq!(trie.lookup(&p("jug")), &[2]);
        assert_eq!(trie.lookup(&p("t")), &[0, 1]);
        assert_eq!(trie.lookup(&p("g")), &[2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_build_trie_clamps_lexemes() -> Result<()> {
        let rx = feed(&["tankinis", "tank"]).await;
        let mut trie = Trie::new();
        let report = build_trie(&mut trie, &config(4, 16), rx, CancellationToken::new()).await?;

        assert_eq!(report.truncated_lexemes, 1);
        assert_eq!(trie.lookup(&p("tank")), &[0, 1]);
        assert!(trie.lookup(&p("tanki")).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_build_trie_repeated_lexeme_deduplicated() -> Result<()> {
        let rx = feed(&["tank tank tank"]).await;
        let mut trie = Trie::new();
        build_trie(&mut trie, &config(10, 16), rx, CancellationToken::new()).await?;
        assert_eq!(trie.lookup(&p("tank")), &[0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_build_trie_cancelled() {
        let (_tx, rx) = mpsc::channel::<String>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut trie = Trie::new();
        let err = build_trie(&mut trie, &config(10, 16), rx, cancel)
            .await
            .unwrap_err();
        assert!(IndexError::classify(&err).is_some_and(IndexError::is_cancellation));
        assert!(!trie.is_finalized());
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order_for_every_consumer() -> Result<()> {
        let rx = feed(&["a", "b", "c"]).await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let forwarded = fan_out(rx, vec![tx1, tx2], CancellationToken::new()).await?;
        assert_eq!(forwarded, 3);

        for rx in [&mut rx1, &mut rx2] {
            let mut got = Vec::new();
            while let Some(item) = rx.recv().await {
                got.push(item);
            }
            assert_eq!(got, vec!["a", "b", "c"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_run_build_keeps_trie_and_store_in_lockstep() -> Result<()> {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryRecordSource::new(["red tank", "blue tank top", "green jug"]);

        let (trie, report) = run_build(
            Box::new(source),
            config(10, 1024),
            Some(store.clone() as Arc<dyn RecordStore>),
            CancellationToken::new(),
        )
        .await?;

        assert_eq!(report.records, 3);
        assert_eq!(report.stored_records, Some(3));
        for id in trie.lookup(&p("tank")) {
            let text = store.get(RecordId::new(*id)).await?.expect("stored record");
            assert!(String::from_utf8(text)?.contains("tank"));
        }
        Ok(())
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl RecordSource for FailingSource {
        async fn stream(
            &mut self,
            tx: mpsc::Sender<String>,
            _cancel: CancellationToken,
        ) -> Result<u64> {
            tx.send("red tank".to_string()).await.ok();
            bail!(IndexError::Input("catalogue truncated".to_string()))
        }
    }

    #[tokio::test]
    async fn test_run_build_aborts_on_source_failure() {
        let err = run_build(
            Box::new(FailingSource),
            config(10, 1024),
            Some(Arc::new(MemoryRecordStore::new())),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            IndexError::classify(&err),
            Some(IndexError::Input(_))
        ));
    }

    #[tokio::test]
    async fn test_run_build_cancelled_by_caller() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_build(
            Box::new(MemoryRecordSource::new(["a b c"; 10])),
            config(10, 1024),
            None,
            cancel,
        )
        .await
        .unwrap_err();

        assert!(IndexError::classify(&err).is_some_and(IndexError::is_cancellation));
    }
}
