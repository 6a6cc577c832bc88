//! Background publishing of committed datasets.
//!
//! A publish runs after a commit has already succeeded, as its own job with
//! retry/backoff, a status channel and cancellation. Its outcome never feeds
//! back into the ingestion cycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use offerhub_core::Dataset;
use offerhub_storage::{BackoffPolicy, VersionedStore};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, dataset: &Dataset, version: u64) -> Result<()>;
}

/// Writes the per-entity file layout next to the store.
#[derive(Debug, Clone)]
pub struct ProjectionPublisher {
    store: VersionedStore,
}

impl ProjectionPublisher {
    pub fn new(store: VersionedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Publisher for ProjectionPublisher {
    fn name(&self) -> &str {
        "projection"
    }

    async fn publish(&self, dataset: &Dataset, version: u64) -> Result<()> {
        let dir = self
            .store
            .write_projection(dataset)
            .await
            .with_context(|| format!("writing projection for version {version}"))?;
        info!(dir = %dir.display(), version, "projection written");
        Ok(())
    }
}

/// Commits the store's published files to git and pushes when a remote
/// exists.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    work_dir: PathBuf,
    push: bool,
}

impl GitPublisher {
    pub fn new(work_dir: impl Into<PathBuf>, push: bool) -> Self {
        Self {
            work_dir: work_dir.into(),
            push,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .arg("-C")
            .arg(&self.work_dir)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run `git {}`", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed:\n{}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    fn name(&self) -> &str {
        "git"
    }

    async fn publish(&self, _dataset: &Dataset, version: u64) -> Result<()> {
        let inside = self.git(&["rev-parse", "--is-inside-work-tree"]).await?;
        if inside != "true" {
            return Err(anyhow!("{} is not a git work tree", self.work_dir.display()));
        }
        let mut add = vec!["add", "-A", "--"];
        add.extend(
            VersionedStore::published_paths()
                .into_iter()
                .filter(|path| self.work_dir.join(path).exists()),
        );
        add.push(":(exclude,glob)**/*.tmp");
        self.git(&add).await?;
        if self.git(&["diff", "--cached", "--name-only"]).await?.is_empty() {
            info!(version, "nothing to commit");
            return Ok(());
        }
        let message = format!("Publish dataset version {version}");
        self.git(&["commit", "-m", &message]).await?;
        info!(version, "committed dataset to git");

        if self.push && !self.git(&["remote"]).await?.is_empty() {
            self.git(&["push"]).await?;
            info!(version, "pushed dataset");
        }
        Ok(())
    }
}

/// Runs publishers in order; the first failure fails the chain.
pub struct PublisherChain {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl PublisherChain {
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl Publisher for PublisherChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn publish(&self, dataset: &Dataset, version: u64) -> Result<()> {
        for publisher in &self.publishers {
            publisher
                .publish(dataset, version)
                .await
                .with_context(|| format!("publisher {} failed", publisher.name()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Pending,
    Running { attempt: usize },
    Succeeded { attempts: usize },
    Failed { attempts: usize, error: String },
    Cancelled,
}

impl PublishStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublishStatus::Succeeded { .. } | PublishStatus::Failed { .. } | PublishStatus::Cancelled
        )
    }
}

pub struct PublishHandle {
    job_id: Uuid,
    status: watch::Receiver<PublishStatus>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<PublishStatus>,
}

impl PublishHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn status(&self) -> PublishStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishStatus> {
        self.status.clone()
    }

    /// Stops the job at its next await point. A publish that already
    /// finished is unaffected.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn wait(self) -> PublishStatus {
        match self.task.await {
            Ok(status) => status,
            Err(err) => PublishStatus::Failed {
                attempts: 0,
                error: format!("publish task ended abnormally: {err}"),
            },
        }
    }
}

pub struct PublishJob;

impl PublishJob {
    pub fn spawn(
        publisher: Arc<dyn Publisher>,
        dataset: Dataset,
        version: u64,
        backoff: BackoffPolicy,
    ) -> PublishHandle {
        let job_id = Uuid::new_v4();
        let (status_tx, status_rx) = watch::channel(PublishStatus::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let span = info_span!("publish_job", %job_id, publisher = publisher.name(), version);
        let task = tokio::spawn(
            run_publish(publisher, dataset, version, backoff, status_tx, cancel_rx).instrument(span),
        );
        PublishHandle {
            job_id,
            status: status_rx,
            cancel: cancel_tx,
            task,
        }
    }
}

/// Resolves once cancellation is requested. Never resolves if the handle
/// was dropped without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_publish(
    publisher: Arc<dyn Publisher>,
    dataset: Dataset,
    version: u64,
    backoff: BackoffPolicy,
    status: watch::Sender<PublishStatus>,
    mut cancel: watch::Receiver<bool>,
) -> PublishStatus {
    let max_attempts = backoff.max_retries + 1;
    let mut attempt = 0;

    let outcome = loop {
        if *cancel.borrow() {
            break PublishStatus::Cancelled;
        }
        attempt += 1;
        status.send_replace(PublishStatus::Running { attempt });

        let result = tokio::select! {
            result = publisher.publish(&dataset, version) => result,
            _ = cancelled(&mut cancel) => break PublishStatus::Cancelled,
        };
        match result {
            Ok(()) => {
                info!(attempt, "publish succeeded");
                break PublishStatus::Succeeded { attempts: attempt };
            }
            Err(err) if attempt < max_attempts => {
                let delay = backoff.delay_for_attempt(attempt - 1);
                warn!(attempt, error = %format!("{err:#}"), delay_ms = delay.as_millis() as u64, "publish failed; retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel) => break PublishStatus::Cancelled,
                }
            }
            Err(err) => {
                warn!(attempt, error = %format!("{err:#}"), "publish failed; giving up");
                break PublishStatus::Failed {
                    attempts: attempt,
                    error: format!("{err:#}"),
                };
            }
        }
    };

    status.send_replace(outcome.clone());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyPublisher {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyPublisher {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(times),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn publish(&self, _dataset: &Dataset, _version: u64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(anyhow!("remote rejected push"));
            }
            Ok(())
        }
    }

    struct HangingPublisher;

    #[async_trait]
    impl Publisher for HangingPublisher {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn publish(&self, _dataset: &Dataset, _version: u64) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let publisher = FlakyPublisher::failing(2);
        let handle = PublishJob::spawn(publisher.clone(), Dataset::empty(), 3, backoff(3));
        assert_eq!(handle.wait().await, PublishStatus::Succeeded { attempts: 3 });
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_retry_budget() {
        let publisher = FlakyPublisher::failing(10);
        let handle = PublishJob::spawn(publisher.clone(), Dataset::empty(), 3, backoff(1));
        let mut status = handle.subscribe();

        match handle.wait().await {
            PublishStatus::Failed { attempts, error } => {
                assert_eq!(attempts, 2);
                assert!(error.contains("remote rejected push"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(status.borrow_and_update().is_terminal());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_running_publish() {
        let handle = PublishJob::spawn(Arc::new(HangingPublisher), Dataset::empty(), 1, backoff(0));
        let mut status = handle.subscribe();
        while !matches!(*status.borrow_and_update(), PublishStatus::Running { .. }) {
            status.changed().await.unwrap();
        }
        handle.cancel();
        assert_eq!(handle.wait().await, PublishStatus::Cancelled);
    }

    #[tokio::test]
    async fn projection_publisher_writes_entity_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionedStore::new(dir.path());
        let handle = PublishJob::spawn(
            Arc::new(ProjectionPublisher::new(store.clone())),
            Dataset::empty(),
            0,
            backoff(0),
        );
        assert_eq!(handle.wait().await, PublishStatus::Succeeded { attempts: 1 });
        assert!(store.projection_dir().join("index.json").exists());
    }

    async fn git_in(dir: &std::path::Path, args: &[&str]) -> bool {
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn git_publisher_commits_only_published_files() {
        let dir = tempfile::tempdir().unwrap();
        if !git_in(dir.path(), &["init", "-q"]).await {
            // git is not installed
            return;
        }
        assert!(git_in(dir.path(), &["config", "user.email", "publisher@example.com"]).await);
        assert!(git_in(dir.path(), &["config", "user.name", "Publisher"]).await);
        assert!(git_in(dir.path(), &["config", "commit.gpgsign", "false"]).await);

        let store = VersionedStore::new(dir.path());
        let dataset = store.load().await.unwrap();
        store.commit(&dataset, "v1").await.unwrap();
        store.write_report("last_cycle", &serde_json::json!({"inserted": 0})).await.unwrap();
        std::fs::write(dir.path().join("history/.leftover.10.tmp"), b"partial").unwrap();
        let dataset = store.load().await.unwrap();
        store.write_projection(&dataset).await.unwrap();

        GitPublisher::new(dir.path(), false).publish(&dataset, 1).await.unwrap();

        let listed = Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["ls-files"])
            .output()
            .await
            .unwrap();
        let files = String::from_utf8_lossy(&listed.stdout).to_string();
        assert!(files.lines().any(|f| f == "snapshot.json"), "{files}");
        assert!(files.lines().any(|f| f == "changelog.jsonl"));
        assert!(files.lines().any(|f| f == "history/v00000001.json"));
        assert!(files.lines().any(|f| f == "projection/index.json"));
        assert!(!files.contains(".commit.lock"));
        assert!(!files.contains("reports/"));
        assert!(!files.contains(".tmp"));

        // republishing the same state is a no-op
        GitPublisher::new(dir.path(), false).publish(&dataset, 1).await.unwrap();
    }

    #[tokio::test]
    async fn git_publisher_refuses_a_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = GitPublisher::new(dir.path(), false);
        assert!(publisher.publish(&Dataset::empty(), 1).await.is_err());
    }
}
