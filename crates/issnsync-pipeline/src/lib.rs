//! Batch orchestration: load identifiers, fetch both providers, merge,
//! fingerprint, filter to novel rows, insert, pace, repeat.
//!
//! One linear control flow. Per-identifier fetch failures degrade that
//! identifier's fields to null and never abort the batch; a store failure is
//! fatal to the run. Committed batches stay committed, and re-running is safe
//! because the fingerprint check makes inserts idempotent per record.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use issnsync_core::{CanonicalRecord, FactRow, FetchOutcome, Issn};
use issnsync_fetch::{JournalProvider, SourceProvider};
use issnsync_store::FactStore;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "issnsync-pipeline";

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Courtesy pause between batches, not adaptive backoff.
    pub batch_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_pause: Duration::from_secs(2),
        }
    }
}

/// Registry read seam, satisfied by the Postgres store and by test doubles.
#[async_trait]
pub trait IssnSource: Send + Sync {
    async fn load_issns(&self) -> Result<Vec<Issn>>;
}

/// Fact-table append seam. Implementations must perform the novelty check
/// and the insert in one transactional scope.
#[async_trait]
pub trait FactSink: Send + Sync {
    async fn insert_novel(&self, rows: &[FactRow]) -> Result<usize>;
}

#[async_trait]
impl IssnSource for FactStore {
    async fn load_issns(&self) -> Result<Vec<Issn>> {
        FactStore::load_issns(self).await
    }
}

#[async_trait]
impl FactSink for FactStore {
    async fn insert_novel(&self, rows: &[FactRow]) -> Result<usize> {
        FactStore::insert_novel(self, rows).await
    }
}

/// What one run did. Reported to the caller and the log; nothing beyond the
/// inserted rows is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub identifiers: usize,
    pub batches: usize,
    pub inserted: usize,
    pub fetch_failures: usize,
}

pub struct Pipeline<S, J, O> {
    store: S,
    journals: J,
    sources: O,
    config: PipelineConfig,
}

impl<S, J, O> Pipeline<S, J, O>
where
    S: IssnSource + FactSink,
    J: JournalProvider,
    O: SourceProvider,
{
    pub fn new(store: S, journals: J, sources: O, config: PipelineConfig) -> Self {
        Self {
            store,
            journals,
            sources,
            config,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let fetch_date = started_at.date_naive();

        let issns = self.store.load_issns().await?;
        let batch_size = self.config.batch_size.max(1);
        let total_batches = issns.len().div_ceil(batch_size);
        info!(%run_id, identifiers = issns.len(), total_batches, "starting sync run");

        let mut inserted = 0usize;
        let mut fetch_failures = 0usize;
        let mut batches = 0usize;

        for batch in issns.chunks(batch_size) {
            batches += 1;
            let mut rows = Vec::with_capacity(batch.len());

            for issn in batch {
                // Both providers are always queried; a failure in one never
                // short-circuits the other.
                let journal = self.journals.journal_meta(issn).await;
                if let FetchOutcome::Failed(reason) = &journal {
                    fetch_failures += 1;
                    warn!(%issn, reason, "journal lookup failed, fields degrade to null");
                }
                let source = self.sources.source_meta(issn).await;
                if let FetchOutcome::Failed(reason) = &source {
                    fetch_failures += 1;
                    warn!(%issn, reason, "source lookup failed, fields degrade to null");
                }

                let record = CanonicalRecord::merge(
                    issn.clone(),
                    journal.into_option(),
                    source.into_option(),
                    fetch_date,
                );
                rows.push(record.into_fact_row());
            }

            let batch_inserted = self.store.insert_novel(&rows).await?;
            inserted += batch_inserted;
            info!(
                batch = batches,
                total = total_batches,
                checked = rows.len(),
                inserted = batch_inserted,
                "batch committed"
            );

            if batches < total_batches {
                sleep(self.config.batch_pause).await;
            }
        }

        let finished_at = Utc::now();
        info!(%run_id, batches, inserted, fetch_failures, "sync run complete");
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            identifiers: issns.len(),
            batches,
            inserted,
            fetch_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use issnsync_core::{JournalMeta, SourceMeta, PROVENANCE};

    fn issn(raw: &str) -> Issn {
        Issn::parse(raw).expect("valid issn")
    }

    fn issns(n: usize) -> Vec<Issn> {
        (0..n)
            .map(|i| issn(&format!("{:04}-{:04}", 1000 + i, 1000 + i)))
            .collect()
    }

    fn quick_config(batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            batch_pause: Duration::ZERO,
        }
    }

    #[derive(Clone, Default)]
    struct MemStore {
        issns: Vec<Issn>,
        facts: Arc<Mutex<HashSet<(String, String)>>>,
        batch_sizes: Arc<Mutex<Vec<usize>>>,
        rows_seen: Arc<Mutex<Vec<FactRow>>>,
        fail_insert: bool,
    }

    impl MemStore {
        fn with_issns(issns: Vec<Issn>) -> Self {
            Self {
                issns,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl IssnSource for MemStore {
        async fn load_issns(&self) -> Result<Vec<Issn>> {
            Ok(self.issns.clone())
        }
    }

    #[async_trait]
    impl FactSink for MemStore {
        async fn insert_novel(&self, rows: &[FactRow]) -> Result<usize> {
            if self.fail_insert {
                return Err(anyhow!("bulk insert failed"));
            }
            self.batch_sizes.lock().unwrap().push(rows.len());
            self.rows_seen.lock().unwrap().extend(rows.iter().cloned());
            let mut facts = self.facts.lock().unwrap();
            let mut inserted = 0;
            for row in rows {
                let key = (row.record.issn.as_str().to_string(), row.fingerprint.clone());
                if facts.insert(key) {
                    inserted += 1;
                }
            }
            Ok(inserted)
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedJournals {
        meta: Option<JournalMeta>,
        fail_for: HashSet<String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JournalProvider for ScriptedJournals {
        async fn journal_meta(&self, issn: &Issn) -> FetchOutcome<JournalMeta> {
            self.calls.lock().unwrap().push(issn.as_str().to_string());
            if self.fail_for.contains(issn.as_str()) {
                return FetchOutcome::Failed("scripted timeout".to_string());
            }
            match &self.meta {
                Some(meta) => FetchOutcome::Found(meta.clone()),
                None => FetchOutcome::Absent,
            }
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedSources {
        meta: Option<SourceMeta>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SourceProvider for ScriptedSources {
        async fn source_meta(&self, issn: &Issn) -> FetchOutcome<SourceMeta> {
            self.calls.lock().unwrap().push(issn.as_str().to_string());
            match &self.meta {
                Some(meta) => FetchOutcome::Found(meta.clone()),
                None => FetchOutcome::Absent,
            }
        }
    }

    fn nature_journal() -> JournalMeta {
        JournalMeta {
            title: Some("Nature".to_string()),
            publisher: Some("Springer Nature".to_string()),
            subjects: vec!["Science".to_string()],
            doi_prefix: Some("10.1038".to_string()),
        }
    }

    fn nature_source() -> SourceMeta {
        SourceMeta {
            country_code: Some("GB".to_string()),
            is_oa: Some(false),
        }
    }

    #[tokio::test]
    async fn second_identical_run_inserts_nothing() {
        let store = MemStore::with_issns(vec![issn("0028-0836"), issn("1476-4687")]);
        let journals = ScriptedJournals {
            meta: Some(nature_journal()),
            ..Default::default()
        };
        let sources = ScriptedSources {
            meta: Some(nature_source()),
            ..Default::default()
        };

        let first = Pipeline::new(store.clone(), journals.clone(), sources.clone(), quick_config(100))
            .run()
            .await
            .expect("first run");
        assert_eq!(first.inserted, 2);

        let second = Pipeline::new(store, journals, sources, quick_config(100))
            .run()
            .await
            .expect("second run");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.identifiers, 2);
    }

    #[tokio::test]
    async fn batches_cover_every_identifier_exactly_once() {
        let all = issns(7);
        let store = MemStore::with_issns(all.clone());
        let journals = ScriptedJournals::default();
        let sources = ScriptedSources::default();

        let summary = Pipeline::new(store.clone(), journals.clone(), sources, quick_config(3))
            .run()
            .await
            .expect("run");

        assert_eq!(summary.batches, 3);
        assert_eq!(*store.batch_sizes.lock().unwrap(), vec![3, 3, 1]);

        let mut called = journals.calls.lock().unwrap().clone();
        called.sort();
        let mut expected: Vec<String> = all.iter().map(|i| i.as_str().to_string()).collect();
        expected.sort();
        assert_eq!(called, expected);
    }

    #[tokio::test]
    async fn journal_failure_never_blocks_source_lookup_or_later_identifiers() {
        let all = issns(3);
        let store = MemStore::with_issns(all.clone());
        let journals = ScriptedJournals {
            meta: Some(nature_journal()),
            fail_for: HashSet::from([all[0].as_str().to_string()]),
            ..Default::default()
        };
        let sources = ScriptedSources {
            meta: Some(nature_source()),
            ..Default::default()
        };

        let summary = Pipeline::new(store.clone(), journals, sources.clone(), quick_config(100))
            .run()
            .await
            .expect("run");

        assert_eq!(summary.fetch_failures, 1);
        assert_eq!(summary.inserted, 3);
        assert_eq!(sources.calls.lock().unwrap().len(), 3);

        // The failed identifier still produced a row, with its journal
        // fields null and its source fields populated.
        let rows = store.rows_seen.lock().unwrap();
        let degraded = rows
            .iter()
            .find(|r| r.record.issn == all[0])
            .expect("row present");
        assert_eq!(degraded.record.title, None);
        assert_eq!(degraded.record.country.as_deref(), Some("GB"));
    }

    #[tokio::test]
    async fn fully_populated_record_carries_provenance() {
        let store = MemStore::with_issns(vec![issn("0028-0836")]);
        let journals = ScriptedJournals {
            meta: Some(nature_journal()),
            ..Default::default()
        };
        let sources = ScriptedSources {
            meta: Some(nature_source()),
            ..Default::default()
        };

        Pipeline::new(store.clone(), journals, sources, quick_config(100))
            .run()
            .await
            .expect("run");

        let rows = store.rows_seen.lock().unwrap();
        assert_eq!(rows.len(), 1);
        let record = &rows[0].record;
        assert_eq!(record.title.as_deref(), Some("Nature"));
        assert_eq!(record.subjects.as_deref(), Some("Science"));
        assert_eq!(record.open_access, Some(false));
        assert_eq!(record.source, PROVENANCE);
        assert_eq!(rows[0].fingerprint.len(), 64);
    }

    #[tokio::test]
    async fn both_providers_absent_still_inserts_a_row() {
        let store = MemStore::with_issns(vec![issn("9999-9999")]);
        let summary = Pipeline::new(
            store.clone(),
            ScriptedJournals::default(),
            ScriptedSources::default(),
            quick_config(100),
        )
        .run()
        .await
        .expect("run");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.fetch_failures, 0);
        let rows = store.rows_seen.lock().unwrap();
        assert_eq!(rows[0].record.title, None);
        assert_eq!(rows[0].record.open_access, None);
    }

    #[tokio::test]
    async fn insert_failure_aborts_the_run() {
        let store = MemStore {
            issns: issns(2),
            fail_insert: true,
            ..Default::default()
        };
        let result = Pipeline::new(
            store,
            ScriptedJournals::default(),
            ScriptedSources::default(),
            quick_config(100),
        )
        .run()
        .await;
        assert!(result.is_err());
    }
}
