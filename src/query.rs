// Query Engine
// Turns free text into matching records: per-lexeme trie lookups, sorted set
// algebra over the buckets, resolution through the record store, and a
// verification pass for lexemes whose bucket cannot be trusted to be complete.

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::IndexConfig;
use crate::contracts::RecordStore;
use crate::error::IndexError;
use crate::observability::{log_operation, Operation, OperationContext};
use crate::pure::{lexeme, sorted};
use crate::trie::Trie;
use crate::types::RecordId;

/// Record store reads kept in flight while resolving candidates
pub const RESOLVE_CONCURRENCY: usize = 16;

/// Why a lexeme's bucket may be missing true matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowReason {
    /// The lexeme was longer than the maximum and was looked up clamped
    Clamped,
    /// The bucket reached the cap, so it holds only a sample
    Saturated,
}

/// How one query lexeme was looked up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LexemePlan {
    /// Lexeme as produced by the tokenizer
    pub lexeme: String,
    /// Trie path actually looked up
    pub path: String,
    pub bucket_len: usize,
    pub overflow: Option<OverflowReason>,
}

impl LexemePlan {
    pub fn is_overflow(&self) -> bool {
        self.overflow.is_some()
    }
}

/// Result of one query along with how it was planned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    /// Matching record text, ascending by record identifier
    pub results: Vec<String>,
    pub plan: Vec<LexemePlan>,
    /// Candidates resolved before overflow verification
    pub candidates: usize,
    /// True when every lexeme overflowed and buckets were unioned
    pub union_fallback: bool,
}

/// Read-only query engine over a finalized trie
///
/// Holds no mutable state; share it behind an `Arc` and query concurrently.
#[derive(Clone)]
pub struct QueryEngine {
    trie: Arc<Trie>,
    store: Arc<dyn RecordStore>,
    config: IndexConfig,
}

impl QueryEngine {
    /// Create an engine; `config` must match the one the trie was built with
    pub fn new(trie: Arc<Trie>, store: Arc<dyn RecordStore>, config: IndexConfig) -> Self {
        Self {
            trie,
            store,
            config,
        }
    }

    pub fn trie(&self) -> &Trie {
        &self.trie
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Run a query and return only the matching record text
    pub async fn search(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.query(text, cancel).await?.results)
    }

    /// Run a query
    ///
    /// Lexemes that are clamped or whose bucket reached the cap are overflow
    /// lexemes. Buckets of the remaining lexemes are intersected; when every
    /// lexeme overflows, all buckets are unioned instead. Candidates are then
    /// resolved through the record store and, for each overflow lexeme, kept
    /// only if one of their own lexemes starts with the unclamped query lexeme.
    ///
    /// Any record store failure, including a missing record, fails the whole
    /// query. Results are ascending by record identifier.
    #[instrument(skip(self, cancel), fields(query = %text))]
    pub async fn query(&self, text: &str, cancel: &CancellationToken) -> Result<QueryOutcome> {
        let mut ctx = OperationContext::new("query");
        let result = self.run(text, cancel).await;
        if let Ok(outcome) = &result {
            ctx.add_attribute("candidates", outcome.candidates);
            ctx.add_attribute("union_fallback", outcome.union_fallback);
        }

        let op = Operation::QueryExecute {
            query: text.to_string(),
            overflow_lexemes: result
                .as_ref()
                .map(|o| o.plan.iter().filter(|p| p.is_overflow()).count())
                .unwrap_or(0),
            result_count: result.as_ref().map(|o| o.results.len()).unwrap_or(0),
        };
        let status = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("{e}")),
        };
        log_operation(&ctx, &op, &status);
        result
    }

    async fn run(&self, text: &str, cancel: &CancellationToken) -> Result<QueryOutcome> {
        let lexemes = self.config.tokenize(text);
        if lexemes.is_empty() {
            debug!("query has no lexemes");
            return Ok(QueryOutcome::default());
        }

        let (plan, buckets) = self.plan(&lexemes);
        let union_fallback = plan.iter().all(LexemePlan::is_overflow);

        let ids = if union_fallback {
            sorted::union_all(buckets.iter().copied())
        } else {
            sorted::intersect_all(
                plan.iter()
                    .zip(&buckets)
                    .filter(|(p, _)| !p.is_overflow())
                    .map(|(_, b)| *b),
            )
        };
        debug!(
            lexemes = plan.len(),
            candidates = ids.len(),
            union_fallback,
            "buckets combined"
        );

        let candidates = self.resolve(&ids, cancel).await?;
        let candidate_count = candidates.len();

        let overflow: Vec<&str> = plan
            .iter()
            .filter(|p| p.is_overflow())
            .map(|p| p.lexeme.as_str())
            .collect();
        let results = if overflow.is_empty() {
            candidates
        } else {
            self.verify(candidates, &overflow)
        };

        Ok(QueryOutcome {
            results,
            plan,
            candidates: candidate_count,
            union_fallback,
        })
    }

    /// Look up every lexeme and classify it
    fn plan<'t>(&'t self, lexemes: &[String]) -> (Vec<LexemePlan>, Vec<&'t [u32]>) {
        let cap = self.config.max_bucket_length().get();
        lexemes
            .iter()
            .map(|raw| {
                let clamped = self.config.clamp(raw);
                let bucket = self.trie.lookup_lexeme(&clamped);
                let overflow = if clamped.was_truncated() {
                    Some(OverflowReason::Clamped)
                } else if bucket.len() >= cap {
                    Some(OverflowReason::Saturated)
                } else {
                    None
                };
                let plan = LexemePlan {
                    lexeme: raw.clone(),
                    path: clamped.to_string(),
                    bucket_len: bucket.len(),
                    overflow,
                };
                (plan, bucket)
            })
            .unzip()
    }

    /// Fetch candidate text in identifier order
    async fn resolve(&self, ids: &[u32], cancel: &CancellationToken) -> Result<Vec<String>> {
        if cancel.is_cancelled() {
            bail!(IndexError::Cancelled("query cancelled before resolution".to_string()));
        }

        let store = &self.store;
        let fetches = stream::iter(ids.iter().copied().map(RecordId::new))
            .map(|id| async move {
                let bytes = store.get(id).await?.ok_or_else(|| {
                    IndexError::Storage(format!("record {id} missing from the record store"))
                })?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    IndexError::Storage(format!("record {id} is not valid UTF-8: {e}"))
                })?;
                Ok::<_, anyhow::Error>(text)
            })
            .buffered(RESOLVE_CONCURRENCY)
            .try_collect::<Vec<String>>();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bail!(IndexError::Cancelled("query cancelled during resolution".to_string()))
            }
            res = fetches => res,
        }
    }

    /// Keep candidates that hold a prefix match for every overflow lexeme
    fn verify(&self, candidates: Vec<String>, overflow: &[&str]) -> Vec<String> {
        let config = &self.config;
        let keep: Vec<bool> = candidates
            .par_iter()
            .map(|text| {
                let parts = config.tokenize(text);
                overflow
                    .iter()
                    .all(|lex| lexeme::any_has_prefix(&parts, lex))
            })
            .collect();

        let before = candidates.len();
        let kept: Vec<String> = candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(text, keep)| keep.then_some(text))
            .collect();
        debug!(before, after = kept.len(), "overflow lexemes verified");
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_trie;
    use crate::builders::IndexConfigBuilder;
    use crate::record_store::MemoryRecordStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn config(max_lexeme: usize, cap: usize) -> IndexConfig {
        IndexConfigBuilder::new()
            .max_lexeme_length(max_lexeme)
            .unwrap()
            .max_bucket_length(cap)
            .unwrap()
            .build()
            .unwrap()
    }

    async fn engine(records: &[&str], config: IndexConfig) -> QueryEngine {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for r in records {
            tx.send(r.to_string()).await.unwrap();
        }
        drop(tx);

        let mut trie = Trie::new();
        build_trie(&mut trie, &config, rx, CancellationToken::new())
            .await
            .unwrap();
        let store = Arc::new(MemoryRecordStore::from_records(records));
        QueryEngine::new(Arc::new(trie), store, config)
    }

    #[tokio::test]
    async fn test_end_to_end_catalogue() -> Result<()> {
        let engine = engine(&["red tank", "blue tank top", "green jug"], config(10, 1024)).await;
        let cancel = CancellationToken::new();

        assert_eq!(
            engine.search("tank", &cancel).await?,
            vec!["red tank", "blue tank top"]
        );
        assert_eq!(engine.search("jug", &cancel).await?, vec!["green jug"]);
        assert_eq!(engine.search("blue tank", &cancel).await?, vec!["blue tank top"]);
        assert!(engine.search("kettle", &cancel).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_prefix_query() -> Result<()> {
        let engine = engine(&["red tank", "blue tank top", "green jug"], config(10, 1024)).await;
        let results = engine.search("ta", &CancellationToken::new()).await?;
        assert_eq!(results, vec!["red tank", "blue tank top"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_clamped_lexeme_is_verified() -> Result<()> {
        let engine = engine(&["tankini top", "tank top", "tanker"], config(4, 1024)).await;
        let cancel = CancellationToken::new();

        let outcome = engine.query("tanki", &cancel).await?;
        assert_eq!(outcome.results, vec!["tankini top"]);
        assert_eq!(outcome.candidates, 3);
        assert!(outcome.union_fallback);
        assert_eq!(outcome.plan[0].path, "tank");
        assert_eq!(outcome.plan[0].overflow, Some(OverflowReason::Clamped));

        // "top" is trusted and narrows the candidates before verification
        let outcome = engine.query("tanki top", &cancel).await?;
        assert_eq!(outcome.results, vec!["tankini top"]);
        assert_eq!(outcome.candidates, 2);
        assert!(!outcome.union_fallback);
        Ok(())
    }

    #[tokio::test]
    async fn test_saturated_lexeme_excluded_from_intersection() -> Result<()> {
        let engine = engine(&["red pot", "red jug", "red mug"], config(10, 2)).await;
        let cancel = CancellationToken::new();

        // "red" holds only [0, 1]; intersecting it would lose record 2
        let outcome = engine.query("red mug", &cancel).await?;
        assert_eq!(outcome.results, vec!["red mug"]);
        assert_eq!(outcome.plan[0].overflow, Some(OverflowReason::Saturated));
        assert_eq!(outcome.plan[1].overflow, None);

        let outcome = engine.query("red", &cancel).await?;
        assert!(outcome.union_fallback);
        assert_eq!(outcome.results, vec!["red pot", "red jug"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_without_lexemes_is_empty() -> Result<()> {
        let engine = QueryEngine::new(
            Arc::new(Trie::new()),
            Arc::new(FailingStore),
            config(10, 16),
        );
        let outcome = engine.query("!! ?", &CancellationToken::new()).await?;
        assert!(outcome.results.is_empty());
        assert!(outcome.plan.is_empty());
        Ok(())
    }

    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn put(&self, _id: RecordId, _value: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn get(&self, id: RecordId) -> Result<Option<Vec<u8>>> {
            bail!(IndexError::Storage(format!("disk error reading {id}")))
        }

        async fn sync(&self) -> Result<()> {
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_failure_aborts_query() {
        let good = engine(&["red tank", "blue tank top"], config(10, 1024)).await;
        let engine = QueryEngine::new(good.trie.clone(), Arc::new(FailingStore), good.config.clone());

        let err = engine
            .search("tank", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            IndexError::classify(&err),
            Some(IndexError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_record_is_storage_failure() {
        let good = engine(&["red tank"], config(10, 1024)).await;
        let engine = QueryEngine::new(
            good.trie.clone(),
            Arc::new(MemoryRecordStore::new()),
            good.config.clone(),
        );

        let err = engine
            .search("red", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            IndexError::classify(&err),
            Some(IndexError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_query() {
        let engine = engine(&["red tank"], config(10, 1024)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.search("tank", &cancel).await.unwrap_err();
        assert!(IndexError::classify(&err).is_some_and(IndexError::is_cancellation));
    }
}
