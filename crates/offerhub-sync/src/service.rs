//! Trigger surface: manual, background and scheduled ingestion cycles over
//! the configured adapters, plus auto-publishing of committed versions.

use std::sync::Arc;

use anyhow::{Context, Result};
use offerhub_adapters::{build_adapters, SourceAdapter, SourceRegistry};
use offerhub_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, VersionedStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::SyncConfig;
use crate::orchestrator::{CycleError, CycleReport, IngestionOrchestrator, OrchestratorConfig};
use crate::publish::{GitPublisher, ProjectionPublisher, PublishHandle, PublishJob, Publisher, PublisherChain};

/// A cycle running in the background.
pub struct CycleJob {
    pub job_id: Uuid,
    pub handle: JoinHandle<Result<CycleReport, CycleError>>,
}

impl CycleJob {
    pub async fn wait(self) -> Result<CycleReport, CycleError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(CycleError::Aborted(err.to_string())),
        }
    }
}

pub struct IngestionService {
    config: SyncConfig,
    orchestrator: IngestionOrchestrator,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    publisher: Option<Arc<dyn Publisher>>,
    publish_backoff: BackoffPolicy,
    /// Cycles in one process never overlap.
    cycle_lock: Mutex<()>,
    last_publish: Mutex<Option<PublishHandle>>,
}

impl IngestionService {
    /// Loads `sources.yaml` and builds every enabled adapter.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: config.fetch_timeout,
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building http client")?,
        );
        let adapters = build_adapters(&registry, &config.sources_base_dir(), http)?;
        info!(
            sources = adapters.len(),
            registry = %config.sources_path.display(),
            "source registry loaded"
        );
        Ok(Self::new(config, adapters))
    }

    pub fn new(config: SyncConfig, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        let store = VersionedStore::new(config.store_dir.clone());
        let orchestrator = IngestionOrchestrator::new(
            store.clone(),
            OrchestratorConfig {
                fetch_timeout: config.fetch_timeout,
                max_parallel_fetches: config.max_parallel_fetches,
                ..OrchestratorConfig::default()
            },
        );

        let publisher: Option<Arc<dyn Publisher>> = if config.auto_publish {
            let mut chain: Vec<Arc<dyn Publisher>> = vec![Arc::new(ProjectionPublisher::new(store))];
            if config.git_publish {
                chain.push(Arc::new(GitPublisher::new(config.store_dir.clone(), config.git_push)));
            }
            Some(Arc::new(PublisherChain::new(chain)))
        } else {
            None
        };

        Self {
            config,
            orchestrator,
            adapters,
            publisher,
            publish_backoff: BackoffPolicy::default(),
            cycle_lock: Mutex::new(()),
            last_publish: Mutex::new(None),
        }
    }

    /// Replaces the publisher chosen from configuration.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>, backoff: BackoffPolicy) -> Self {
        self.publisher = Some(publisher);
        self.publish_backoff = backoff;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &VersionedStore {
        self.orchestrator.store()
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.store().clone())
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.source_name()).collect()
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        self.run_with(&self.adapters).await
    }

    /// Runs a cycle against a single named source.
    pub async fn run_cycle_for(&self, source: &str) -> Result<CycleReport, CycleError> {
        let selected: Vec<_> = self
            .adapters
            .iter()
            .filter(|a| a.source_name() == source)
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(CycleError::UnknownSource(source.to_string()));
        }
        self.run_with(&selected).await
    }

    pub fn spawn_cycle(self: &Arc<Self>) -> CycleJob {
        let service = Arc::clone(self);
        CycleJob {
            job_id: Uuid::new_v4(),
            handle: tokio::spawn(async move { service.run_cycle().await }),
        }
    }

    /// Handle of the most recent auto-publish, if one was started and not
    /// yet taken.
    pub async fn take_publish_handle(&self) -> Option<PublishHandle> {
        self.last_publish.lock().await.take()
    }

    async fn run_with(&self, adapters: &[Arc<dyn SourceAdapter>]) -> Result<CycleReport, CycleError> {
        let _guard = self.cycle_lock.lock().await;
        let report = self.orchestrator.run_cycle(adapters).await?;
        if let Some(version) = report.committed_version {
            self.start_publish(version).await;
        }
        Ok(report)
    }

    async fn start_publish(&self, version: u64) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let dataset = match self.store().load_version(version).await {
            Ok(dataset) => dataset,
            Err(err) => {
                warn!(version, error = %err, "cannot load committed version for publishing");
                return;
            }
        };
        let handle = PublishJob::spawn(publisher, dataset, version, self.publish_backoff);
        info!(job_id = %handle.job_id(), version, "publish job started");
        let mut slot = self.last_publish.lock().await;
        *slot = Some(handle);
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let service = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                match service.run_cycle().await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        version = ?report.committed_version,
                        "scheduled cycle finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled cycle failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use offerhub_adapters::{AdapterError, FetchContext};
    use offerhub_core::{RawOffer, RawPayload, RawRecord, SourceKind, TrustLevel};
    use std::path::Path;
    use std::time::Duration;

    use crate::publish::PublishStatus;

    struct OneOffer(&'static str);

    #[async_trait]
    impl SourceAdapter for OneOffer {
        fn source_name(&self) -> &str {
            self.0
        }

        fn source_kind(&self) -> SourceKind {
            SourceKind::Crowdsourced
        }

        fn trust_level(&self) -> TrustLevel {
            TrustLevel(1)
        }

        async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>, AdapterError> {
            Ok(vec![RawRecord {
                source_name: self.0.to_string(),
                source_kind: SourceKind::Crowdsourced,
                trust: TrustLevel(1),
                source_id: Some("1".into()),
                fetched_at: ctx.fetched_at,
                submitted_at: None,
                payload: RawPayload::Offer(RawOffer {
                    title: Some(format!("Offer from {}", self.0)),
                    card_name: Some("Card A".into()),
                    ..RawOffer::default()
                }),
            }])
        }
    }

    fn service(root: &Path, auto_publish: bool) -> IngestionService {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.store_dir = root.to_path_buf();
        config.auto_publish = auto_publish;
        IngestionService::new(config, vec![Arc::new(OneOffer("alpha")), Arc::new(OneOffer("beta"))])
    }

    #[tokio::test]
    async fn single_source_cycle_only_touches_that_source() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), false);

        let report = service.run_cycle_for("beta").await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.per_source_records.keys().collect::<Vec<_>>(), vec!["beta"]);

        let err = service.run_cycle_for("gamma").await.unwrap_err();
        assert!(matches!(err, CycleError::UnknownSource(name) if name == "gamma"));
    }

    #[tokio::test]
    async fn committed_cycles_are_published_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), true);

        let report = service.run_cycle().await.unwrap();
        assert_eq!(report.committed_version, Some(1));
        let handle = service.take_publish_handle().await.expect("publish started");
        assert_eq!(handle.wait().await, PublishStatus::Succeeded { attempts: 1 });
        assert!(service.store().projection_dir().join("offers").is_dir());

        let again = service.run_cycle().await.unwrap();
        assert_eq!(again.committed_version, None);
        assert!(service.take_publish_handle().await.is_none());
    }

    #[tokio::test]
    async fn spawned_cycle_reports_through_its_handle() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(service(dir.path(), false));

        let job = service.spawn_cycle();
        let report = tokio::time::timeout(Duration::from_secs(10), job.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(service.catalog().get_stats().await.unwrap(), Some(report));
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(service(dir.path(), false));
        assert!(service.maybe_build_scheduler().await.unwrap().is_none());
        assert_eq!(service.source_names(), vec!["alpha", "beta"]);
    }
}
