//! One ingestion cycle: fetch every adapter concurrently, normalize, merge
//! against the stored dataset and commit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use offerhub_adapters::{AdapterError, FetchContext, SourceAdapter};
use offerhub_core::{CanonicalEntity, RawRecord};
use offerhub_storage::{StoreError, VersionedStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::merge::{MergeConfig, MergeConflict, MergeEngine, ReviewHint};
use crate::normalize::Normalizer;

/// Report name under the store's `reports/` directory.
pub const LAST_CYCLE_REPORT: &str = "last_cycle";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    /// `source_unavailable`, `auth_error`, `rate_limited` or `other`.
    pub kind: String,
    pub message: String,
}

impl From<&AdapterError> for SourceFailure {
    fn from(err: &AdapterError) -> Self {
        Self {
            kind: err.category().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Raw records returned by the adapters that succeeded.
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub conflicts: Vec<MergeConflict>,
    pub malformed: usize,
    pub review_hints: Vec<ReviewHint>,
    pub per_source_errors: BTreeMap<String, SourceFailure>,
    pub per_source_records: BTreeMap<String, usize>,
    /// `None` when nothing changed and no commit was made.
    pub committed_version: Option<u64>,
    pub attempts: u32,
}

impl CycleReport {
    fn start(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            processed: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            conflicts: Vec::new(),
            malformed: 0,
            review_hints: Vec::new(),
            per_source_errors: BTreeMap::new(),
            per_source_records: BTreeMap::new(),
            committed_version: None,
            attempts: 0,
        }
    }

    /// Markdown brief of the cycle, one bullet per count and per source.
    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# Ingestion cycle {}\n\n- Started: {}\n- Finished: {}\n- Processed: {}\n- Inserted: {}\n- Updated: {}\n- Skipped: {}\n- Conflicts: {}\n- Malformed: {}\n- Review hints: {}\n- Committed version: {}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.processed,
            self.inserted,
            self.updated,
            self.skipped,
            self.conflicts.len(),
            self.malformed,
            self.review_hints.len(),
            self.committed_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );
        out.push_str("\n## Sources\n");
        for (source, count) in &self.per_source_records {
            out.push_str(&format!("- {source}: {count} records\n"));
        }
        for (source, failure) in &self.per_source_errors {
            out.push_str(&format!("- {source}: {} ({})\n", failure.kind, failure.message));
        }
        if !self.conflicts.is_empty() {
            out.push_str("\n## Conflicts\n");
            for conflict in &self.conflicts {
                out.push_str(&format!(
                    "- {} {}: {} from {} (trust {}) vs {} (trust {}), fields {}\n",
                    conflict.kind,
                    conflict.id,
                    conflict.reason,
                    conflict.incoming.source_name,
                    conflict.incoming.trust,
                    conflict.existing.source_name,
                    conflict.existing.trust,
                    conflict.fields.join(", "),
                ));
            }
        }
        out
    }
}

/// Store-level failures abort the cycle; the store keeps its last good
/// snapshot.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no enabled source named {0}")]
    UnknownSource(String),
    #[error("cycle task ended abnormally: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fetch_timeout: Duration,
    pub max_parallel_fetches: usize,
    /// Load, merge and commit attempts before a write conflict surfaces.
    pub max_commit_attempts: u32,
    pub merge: MergeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_parallel_fetches: 4,
            max_commit_attempts: 2,
            merge: MergeConfig::default(),
        }
    }
}

type FetchOutcome = (String, Result<Vec<RawRecord>, AdapterError>);

/// Runs between the merge and the commit of each attempt, with the attempt
/// number, so tests can move the store underneath a cycle.
#[cfg(test)]
pub(crate) type HookFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct BeforeCommit(pub(crate) Arc<dyn Fn(u32) -> HookFuture + Send + Sync>);

#[cfg(test)]
impl std::fmt::Debug for BeforeCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BeforeCommit")
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOrchestrator {
    store: VersionedStore,
    normalizer: Normalizer,
    merge: MergeEngine,
    config: OrchestratorConfig,
    #[cfg(test)]
    before_commit: Option<BeforeCommit>,
}

impl IngestionOrchestrator {
    pub fn new(store: VersionedStore, config: OrchestratorConfig) -> Self {
        Self {
            store,
            normalizer: Normalizer::new(),
            merge: MergeEngine::new(config.merge),
            config,
            #[cfg(test)]
            before_commit: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_before_commit(mut self, hook: BeforeCommit) -> Self {
        self.before_commit = Some(hook);
        self
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub async fn run_cycle(&self, adapters: &[Arc<dyn SourceAdapter>]) -> Result<CycleReport, CycleError> {
        let ctx = FetchContext::new(self.config.fetch_timeout);
        let mut report = CycleReport::start(ctx.run_id, ctx.fetched_at);
        let span = info_span!("ingestion_cycle", run_id = %ctx.run_id, adapters = adapters.len());

        async {
            let fetched = self.fetch_all(&ctx, adapters).await;
            let candidates = self.normalize_all(fetched, &mut report);
            self.merge_and_commit(candidates, &mut report).await?;

            report.finished_at = Utc::now();
            if let Err(err) = self.store.write_report(LAST_CYCLE_REPORT, &report).await {
                warn!(error = %err, "failed to write cycle report");
            }
            info!(
                processed = report.processed,
                inserted = report.inserted,
                updated = report.updated,
                skipped = report.skipped,
                conflicts = report.conflicts.len(),
                malformed = report.malformed,
                failed_sources = report.per_source_errors.len(),
                version = ?report.committed_version,
                "ingestion cycle finished"
            );
            Ok::<_, CycleError>(report)
        }
        .instrument(span)
        .await
    }

    /// Results come back in adapter order regardless of completion order.
    async fn fetch_all(&self, ctx: &FetchContext, adapters: &[Arc<dyn SourceAdapter>]) -> Vec<FetchOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_fetches.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, adapter) in adapters.iter().enumerate() {
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let permits = permits.clone();
            let limit = self.config.fetch_timeout;
            let span = info_span!("fetch_source", source = adapter.source_name());
            tasks.spawn(
                async move {
                    let name = adapter.source_name().to_string();
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return (idx, Err(AdapterError::unavailable(&name, "fetch pool closed"))),
                    };
                    let result = match tokio::time::timeout(limit, adapter.fetch(&ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(AdapterError::unavailable(
                            &name,
                            format!("fetch timed out after {}s", limit.as_secs_f64()),
                        )),
                    };
                    (idx, result.map(|records| stamp_provenance(adapter.as_ref(), records)))
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<Result<Vec<RawRecord>, AdapterError>>> = adapters.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(err) => warn!(error = %err, "fetch task did not complete"),
            }
        }

        adapters
            .iter()
            .zip(slots)
            .map(|(adapter, slot)| {
                let name = adapter.source_name().to_string();
                let result = slot.unwrap_or_else(|| Err(AdapterError::unavailable(&name, "fetch task aborted")));
                (name, result)
            })
            .collect()
    }

    fn normalize_all(&self, fetched: Vec<FetchOutcome>, report: &mut CycleReport) -> Vec<CanonicalEntity> {
        let now = Utc::now();
        let mut candidates = Vec::new();
        for (source, result) in fetched {
            let records = match result {
                Ok(records) => records,
                Err(err) => {
                    warn!(source = %source, kind = err.category(), error = %err, "source failed; continuing");
                    report.per_source_errors.insert(source, SourceFailure::from(&err));
                    continue;
                }
            };
            debug!(source = %source, records = records.len(), "source fetched");
            report.processed += records.len();
            report.per_source_records.insert(source, records.len());
            for record in &records {
                match self.normalizer.normalize_at(record, now) {
                    Ok(entity) => candidates.push(entity),
                    Err(err) => {
                        report.malformed += 1;
                        warn!(source = %record.source_name, error = %err, "dropping malformed record");
                    }
                }
            }
        }
        candidates
    }

    async fn merge_and_commit(
        &self,
        candidates: Vec<CanonicalEntity>,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        loop {
            report.attempts += 1;
            let existing = self.store.load().await?;
            let plan = self.merge.merge(&existing, candidates.clone());
            let summary = plan.summary();

            report.inserted = summary.inserted;
            report.updated = summary.updated;
            report.skipped = summary.skipped;
            report.conflicts = plan.conflicts().cloned().collect();
            report.review_hints = plan.review_hints.clone();
            for conflict in &report.conflicts {
                warn!(
                    kind = %conflict.kind,
                    id = %conflict.id,
                    reason = %conflict.reason,
                    incoming = %conflict.incoming.source_name,
                    existing = %conflict.existing.source_name,
                    "merge conflict left unapplied"
                );
            }

            if !plan.has_changes() {
                info!(version = existing.version, "nothing to commit");
                report.committed_version = None;
                return Ok(());
            }

            let next = plan.apply(&existing);
            let message = format!(
                "ingestion cycle {}: {} inserted, {} updated",
                report.run_id, summary.inserted, summary.updated
            );
            #[cfg(test)]
            if let Some(hook) = &self.before_commit {
                (hook.0)(report.attempts).await;
            }
            match self.store.commit_with_summary(&next, summary, &message).await {
                Ok(entry) => {
                    report.committed_version = Some(entry.version);
                    return Ok(());
                }
                Err(err) if err.is_write_conflict() && report.attempts < self.config.max_commit_attempts => {
                    warn!(attempt = report.attempts, error = %err, "store moved underneath the cycle; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Provenance comes from the adapter's declaration, not from whatever the
/// records claim; trust arbitration depends on it.
fn stamp_provenance(adapter: &dyn SourceAdapter, mut records: Vec<RawRecord>) -> Vec<RawRecord> {
    let name = adapter.source_name();
    let kind = adapter.source_kind();
    let trust = adapter.trust_level();
    let mut restamped = 0usize;
    for record in &mut records {
        if record.source_name != name || record.source_kind != kind || record.trust != trust {
            record.source_name = name.to_string();
            record.source_kind = kind;
            record.trust = trust;
            restamped += 1;
        }
    }
    if restamped > 0 {
        warn!(source = name, records = restamped, "records disagreed with declared provenance; restamped");
    }
    records
}
