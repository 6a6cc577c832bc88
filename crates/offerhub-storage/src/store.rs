//! File-backed versioned store for the canonical dataset.
//!
//! Layout under the store root:
//!
//! - `snapshot.json`: the current committed version
//! - `history/v00000042.json`: every committed version, never rewritten
//! - `changelog.jsonl`: one [`ChangeLogEntry`] per line, append-only
//! - `projection/<collection>/<id>.json`: browsable per-entity copies
//! - `reports/`: small JSON reports written next to the data
//!
//! Every file that readers see is swapped in with a temp-file rename, so a
//! reader always observes either the previous or the next snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::Utc;
use fs2::FileExt;
use offerhub_core::{Canonical, ChangeLogEntry, ChangeSummary, Dataset, EntityKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

const SNAPSHOT_FILE: &str = "snapshot.json";
const CHANGELOG_FILE: &str = "changelog.jsonl";
const HISTORY_DIR: &str = "history";
const PROJECTION_DIR: &str = "projection";
const REPORTS_DIR: &str = "reports";
const LOCK_FILE: &str = ".commit.lock";
const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store at {path} is corrupt: {reason}")]
    CorruptStore { path: PathBuf, reason: String },
    #[error("write conflict: commit based on version {expected} but store is at {found}")]
    WriteConflict { expected: u64, found: u64 },
    #[error("another writer holds the commit lock {0}")]
    Locked(PathBuf),
    #[error("version {0} not found in store history")]
    UnknownVersion(u64),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl StoreError {
    /// Both a stale base version and a concurrently held lock mean another
    /// writer got there first.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, StoreError::WriteConflict { .. } | StoreError::Locked(_))
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::CorruptStore {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotFileOut<'a> {
    format: u32,
    checksum: &'a str,
    change: &'a ChangeLogEntry,
    dataset: &'a RawValue,
}

#[derive(Debug, Deserialize)]
struct SnapshotFileIn {
    format: u32,
    checksum: String,
    change: ChangeLogEntry,
    dataset: Box<RawValue>,
}

#[derive(Debug)]
struct LoadedSnapshot {
    change: ChangeLogEntry,
    dataset: Dataset,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitFault {
    /// Crash after the history copy is durable but before the swap.
    AfterHistoryWrite,
    /// Crash halfway through writing the new snapshot's temp file.
    TornSnapshotWrite,
}

#[derive(Debug, Clone)]
pub struct VersionedStore {
    root: PathBuf,
    #[cfg(test)]
    fault: Option<CommitFault>,
}

impl VersionedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            #[cfg(test)]
            fault: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_fault(mut self, fault: CommitFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.root.join(CHANGELOG_FILE)
    }

    pub fn projection_dir(&self) -> PathBuf {
        self.root.join(PROJECTION_DIR)
    }

    /// Entries under the root that make up the published dataset. The lock,
    /// reports and temp files stay local.
    pub fn published_paths() -> [&'static str; 4] {
        [SNAPSHOT_FILE, CHANGELOG_FILE, HISTORY_DIR, PROJECTION_DIR]
    }

    fn history_path(&self, version: u64) -> PathBuf {
        self.root.join(HISTORY_DIR).join(format!("v{version:08}.json"))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Latest committed dataset. A store that has never been written yields
    /// an empty dataset at version 0; a store with history but no readable
    /// snapshot is `CorruptStore`.
    pub async fn load(&self) -> Result<Dataset, StoreError> {
        let store = self.clone();
        run_blocking(move || store.load_blocking()).await
    }

    pub async fn current_version(&self) -> Result<u64, StoreError> {
        Ok(self.load().await?.version)
    }

    /// Commits `updated` as the next version, deriving the summary from a
    /// diff against the current snapshot.
    pub async fn commit(&self, updated: &Dataset, message: &str) -> Result<ChangeLogEntry, StoreError> {
        let store = self.clone();
        let updated = updated.clone();
        let message = message.to_string();
        run_blocking(move || {
            let current = store.load_blocking()?;
            let summary = diff_summary(&current, &updated);
            store.commit_blocking(&updated, summary, &message)
        })
        .await
    }

    /// Commits `updated`, whose `version` must equal the store's current
    /// version (the version it was loaded at).
    ///
    /// The write runs to completion on a blocking task even if the calling
    /// future is dropped, so cancellation never leaves half a commit.
    pub async fn commit_with_summary(
        &self,
        updated: &Dataset,
        summary: ChangeSummary,
        message: &str,
    ) -> Result<ChangeLogEntry, StoreError> {
        let store = self.clone();
        let updated = updated.clone();
        let message = message.to_string();
        run_blocking(move || store.commit_blocking(&updated, summary, &message)).await
    }

    /// Every committed change, oldest first.
    pub async fn history(&self) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let store = self.clone();
        run_blocking(move || {
            let mut entries = store.read_changelog_blocking()?;
            let head = match store.read_snapshot_blocking()? {
                Some(snapshot) => snapshot.change.version,
                None => return Ok(entries),
            };
            let last = entries.last().map(|e| e.version).unwrap_or(0);
            for version in (last + 1)..=head {
                entries.push(store.read_history_blocking(version)?.change);
            }
            Ok(entries)
        })
        .await
    }

    pub async fn load_version(&self, version: u64) -> Result<Dataset, StoreError> {
        let store = self.clone();
        run_blocking(move || {
            let head = store.load_blocking()?.version;
            Ok(store.read_committed_blocking(version, head)?.dataset)
        })
        .await
    }

    /// Re-commits the content of `version` as a new version. History is
    /// only ever appended to.
    pub async fn revert(&self, version: u64, message: &str) -> Result<ChangeLogEntry, StoreError> {
        let store = self.clone();
        let message = message.to_string();
        run_blocking(move || {
            let current = store.load_blocking()?;
            let mut target = store.read_committed_blocking(version, current.version)?.dataset;
            target.version = current.version;
            let summary = diff_summary(&current, &target);
            store.commit_blocking(&target, summary, &message)
        })
        .await
    }

    /// Writes one JSON file per entity, grouped by collection, and swaps the
    /// whole directory into place.
    pub async fn write_projection(&self, dataset: &Dataset) -> Result<PathBuf, StoreError> {
        let store = self.clone();
        let dataset = dataset.clone();
        run_blocking(move || store.write_projection_blocking(&dataset)).await
    }

    pub async fn write_report<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing report {name}"))?;
        let path = self.root.join(REPORTS_DIR).join(format!("{name}.json"));
        let target = path.clone();
        run_blocking(move || {
            write_atomic(&target, &bytes)?;
            Ok(())
        })
        .await?;
        Ok(path)
    }

    pub async fn read_report<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.root.join(REPORTS_DIR).join(format!("{name}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(&path, e.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading report {}", path.display()))
                .into()),
        }
    }

    fn load_blocking(&self) -> Result<Dataset, StoreError> {
        match self.read_snapshot_blocking()? {
            Some(snapshot) => Ok(snapshot.dataset),
            None => {
                if self.has_history_blocking()? {
                    return Err(StoreError::corrupt(
                        &self.snapshot_path(),
                        "snapshot missing while history or change log exists",
                    ));
                }
                Ok(Dataset::empty())
            }
        }
    }

    fn has_history_blocking(&self) -> Result<bool, StoreError> {
        let changelog = self.changelog_path();
        match fs::metadata(&changelog) {
            Ok(meta) if meta.len() > 0 => return Ok(true),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("inspecting {}", changelog.display()))
                    .into())
            }
        }
        let history = self.root.join(HISTORY_DIR);
        // A crashed first commit leaves only v1 behind; that is still an
        // empty store.
        let first = self.history_path(1);
        match fs::read_dir(&history) {
            Ok(entries) => Ok(entries.filter_map(Result::ok).any(|e| {
                e.file_name().to_string_lossy().ends_with(".json") && e.path() != first
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("listing {}", history.display()))
                .into()),
        }
    }

    fn read_snapshot_blocking(&self) -> Result<Option<LoadedSnapshot>, StoreError> {
        let path = self.snapshot_path();
        match fs::read(&path) {
            Ok(bytes) => parse_snapshot(&path, &bytes).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading snapshot {}", path.display()))
                .into()),
        }
    }

    fn read_history_blocking(&self, version: u64) -> Result<LoadedSnapshot, StoreError> {
        let path = self.history_path(version);
        match fs::read(&path) {
            Ok(bytes) => parse_snapshot(&path, &bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::UnknownVersion(version)),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading history {}", path.display()))
                .into()),
        }
    }

    /// History file for `version`, provided it is at or below `head`. A
    /// crashed commit can leave a history file above the head; it was never
    /// committed and is not addressable.
    fn read_committed_blocking(&self, version: u64, head: u64) -> Result<LoadedSnapshot, StoreError> {
        if version == 0 || version > head {
            return Err(StoreError::UnknownVersion(version));
        }
        self.read_history_blocking(version)
    }

    /// Parses the change log. A malformed final line is a torn append and is
    /// dropped; a malformed line anywhere else is corruption.
    fn read_changelog_blocking(&self) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let path = self.changelog_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into())
            }
        };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<ChangeLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) if idx + 1 == lines.len() => {
                    warn!(path = %path.display(), "ignoring torn trailing change log line");
                }
                Err(err) => {
                    return Err(StoreError::corrupt(&path, format!("line {}: {err}", idx + 1)));
                }
            }
        }
        Ok(entries)
    }

    /// Brings the change log up to the snapshot version using the entries
    /// embedded in history files. Runs under the commit lock.
    fn repair_changelog_blocking(&self, head: u64) -> Result<(), StoreError> {
        let path = self.changelog_path();
        let entries = self.read_changelog_blocking()?;
        let last = entries.last().map(|e| e.version).unwrap_or(0);
        let raw_lines = fs::read_to_string(&path)
            .map(|t| t.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0);
        if last >= head && raw_lines == entries.len() {
            return Ok(());
        }

        let mut repaired = entries;
        for version in (last + 1)..=head {
            repaired.push(self.read_history_blocking(version)?.change);
        }
        let mut body = String::new();
        for entry in &repaired {
            body.push_str(&serde_json::to_string(entry).context("serializing change log entry")?);
            body.push('\n');
        }
        write_atomic(&path, body.as_bytes())?;
        warn!(from = last, to = head, "repaired change log from history");
        Ok(())
    }

    fn commit_blocking(
        &self,
        updated: &Dataset,
        summary: ChangeSummary,
        message: &str,
    ) -> Result<ChangeLogEntry, StoreError> {
        let span = info_span!("store_commit", root = %self.root.display(), base = updated.version);
        let _guard = span.enter();

        fs::create_dir_all(self.root.join(HISTORY_DIR))
            .with_context(|| format!("creating store directories under {}", self.root.display()))?;
        let _lock = self.acquire_lock_blocking()?;

        let current = self.load_blocking()?;
        self.repair_changelog_blocking(current.version)?;
        if updated.version != current.version {
            return Err(StoreError::WriteConflict {
                expected: updated.version,
                found: current.version,
            });
        }
        if !updated.ids_are_unique() {
            return Err(anyhow!("refusing to commit a dataset with duplicate ids").into());
        }

        let mut next = updated.clone();
        next.version = current.version + 1;
        next.last_updated = Utc::now();

        let dataset_json = serde_json::to_string(&next).context("serializing dataset")?;
        let checksum = Self::sha256_hex(dataset_json.as_bytes());
        let entry = ChangeLogEntry {
            version: next.version,
            timestamp: next.last_updated,
            commit_id: Uuid::new_v4(),
            summary,
            message: message.to_string(),
            checksum: checksum.clone(),
        };
        let raw = RawValue::from_string(dataset_json).context("wrapping dataset json")?;
        let file_bytes = serde_json::to_vec_pretty(&SnapshotFileOut {
            format: SNAPSHOT_FORMAT,
            checksum: &checksum,
            change: &entry,
            dataset: &raw,
        })
        .context("serializing snapshot file")?;

        write_atomic(&self.history_path(next.version), &file_bytes)?;

        #[cfg(test)]
        match self.fault {
            Some(CommitFault::AfterHistoryWrite) => {
                return Err(anyhow!("injected fault after history write").into());
            }
            Some(CommitFault::TornSnapshotWrite) => {
                let temp = self.root.join(format!(".{}.torn.tmp", Uuid::new_v4()));
                fs::write(&temp, &file_bytes[..file_bytes.len() / 2])
                    .context("writing torn temp snapshot")?;
                return Err(anyhow!("injected fault during snapshot write").into());
            }
            None => {}
        }

        write_atomic(&self.snapshot_path(), &file_bytes)?;
        self.append_changelog_blocking(&entry)?;

        info!(
            version = entry.version,
            inserted = summary.inserted,
            updated = summary.updated,
            "committed snapshot"
        );
        Ok(entry)
    }

    fn acquire_lock_blocking(&self) -> Result<File, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(err) if is_contended(&err) => Err(StoreError::Locked(path)),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("locking {}", path.display()))
                .into()),
        }
    }

    fn append_changelog_blocking(&self, entry: &ChangeLogEntry) -> Result<(), StoreError> {
        let path = self.changelog_path();
        let mut line = serde_json::to_string(entry).context("serializing change log entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", path.display()))?;
        Ok(())
    }

    fn write_projection_blocking(&self, dataset: &Dataset) -> Result<PathBuf, StoreError> {
        let target = self.projection_dir();
        let staging = self.root.join(format!(".projection-{}", Uuid::new_v4()));

        let result = (|| -> anyhow::Result<()> {
            project_collection(&staging, &dataset.offers)?;
            project_collection(&staging, &dataset.benefits)?;
            project_collection(&staging, &dataset.redemption_options)?;
            project_collection(&staging, &dataset.travel_tips)?;
            let counts: BTreeMap<&str, usize> = [
                (EntityKind::Offer, dataset.offers.len()),
                (EntityKind::Benefit, dataset.benefits.len()),
                (EntityKind::RedemptionOption, dataset.redemption_options.len()),
                (EntityKind::TravelTip, dataset.travel_tips.len()),
            ]
            .into_iter()
            .map(|(kind, n)| (kind.collection_name(), n))
            .collect();
            let index = serde_json::json!({
                "version": dataset.version,
                "last_updated": dataset.last_updated,
                "counts": counts,
            });
            fs::write(staging.join("index.json"), serde_json::to_vec_pretty(&index)?)
                .context("writing projection index")?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(err.into());
        }

        let retired = self.root.join(format!(".projection-old-{}", Uuid::new_v4()));
        let had_previous = match fs::rename(&target, &retired) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(anyhow::Error::new(err)
                    .context(format!("retiring {}", target.display()))
                    .into());
            }
        };
        fs::rename(&staging, &target)
            .with_context(|| format!("swapping projection into {}", target.display()))?;
        if had_previous {
            if let Err(err) = fs::remove_dir_all(&retired) {
                debug!(error = %err, "leaving retired projection behind");
            }
        }
        Ok(target)
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Persistence(anyhow!("store task failed: {e}")))?
}

fn parse_snapshot(path: &Path, bytes: &[u8]) -> Result<LoadedSnapshot, StoreError> {
    let file: SnapshotFileIn =
        serde_json::from_slice(bytes).map_err(|e| StoreError::corrupt(path, format!("unparseable: {e}")))?;
    if file.format != SNAPSHOT_FORMAT {
        return Err(StoreError::corrupt(path, format!("unsupported format {}", file.format)));
    }
    let actual = VersionedStore::sha256_hex(file.dataset.get().as_bytes());
    if actual != file.checksum || actual != file.change.checksum {
        return Err(StoreError::corrupt(path, "checksum mismatch"));
    }
    let dataset: Dataset = serde_json::from_str(file.dataset.get())
        .map_err(|e| StoreError::corrupt(path, format!("dataset: {e}")))?;
    if dataset.version != file.change.version {
        return Err(StoreError::corrupt(
            path,
            format!(
                "dataset version {} disagrees with change entry {}",
                dataset.version, file.change.version
            ),
        ));
    }
    Ok(LoadedSnapshot {
        change: file.change,
        dataset,
    })
}

/// Writes via a sibling temp file, fsyncs it, then renames over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let write_result = (|| -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(anyhow::Error::new(err).context(format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        )));
    }
    sync_dir(parent);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn project_collection<T: Canonical + Serialize>(root: &Path, items: &[T]) -> anyhow::Result<()> {
    let dir = root.join(T::KIND.collection_name());
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    for item in items {
        let path = dir.join(format!("{}.json", file_stem(item.id())));
        let bytes = serde_json::to_vec_pretty(item)
            .with_context(|| format!("serializing {} {}", T::KIND, item.id()))?;
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

/// Escapes every byte outside `[A-Za-z0-9-]` as `_xx`, so distinct ids
/// never share a file.
fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

/// Counts ids new in `next` and ids whose stored value changed.
pub fn diff_summary(previous: &Dataset, next: &Dataset) -> ChangeSummary {
    fn diff<T: Canonical>(prev: &[T], next: &[T], summary: &mut ChangeSummary) {
        let before: HashMap<&str, &T> = prev.iter().map(|e| (e.id(), e)).collect();
        for item in next {
            match before.get(item.id()) {
                None => summary.inserted += 1,
                Some(old) if *old != item => summary.updated += 1,
                Some(_) => {}
            }
        }
    }

    let mut summary = ChangeSummary::default();
    diff(&previous.offers, &next.offers, &mut summary);
    diff(&previous.benefits, &next.benefits, &mut summary);
    diff(&previous.redemption_options, &next.redemption_options, &mut summary);
    diff(&previous.travel_tips, &next.travel_tips, &mut summary);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use offerhub_core::{Offer, OfferCategory, Provenance, SourceKind, TrustLevel, Votes};
    use tempfile::tempdir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn offer(id: &str, description: &str) -> Offer {
        Offer {
            id: id.into(),
            title: "5x Dining".into(),
            description: description.into(),
            card_name: "Card A".into(),
            bank_name: "Bank A".into(),
            category: OfferCategory::Dining,
            expiry_date: None,
            terms: None,
            is_active: true,
            min_spend: Some(1000.0),
            max_benefit: None,
            votes: Votes::default(),
            provenance: Provenance {
                source_kind: SourceKind::Crowdsourced,
                source_name: "forms".into(),
                trust: TrustLevel(1),
                fetched_at: ts(),
            },
            created_at: ts(),
            updated_at: ts(),
        }
    }

    #[tokio::test]
    async fn empty_store_loads_version_zero() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path().join("data"));
        let dataset = store.load().await.expect("load");
        assert_eq!(dataset.version, 0);
        assert_eq!(dataset.entity_count(), 0);
        assert!(store.history().await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn commit_increments_version_and_appends_changelog() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());

        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "first"));
        let entry = store.commit(&dataset, "first import").await.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.summary.inserted, 1);

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.offers, dataset.offers);

        let mut next = reloaded.clone();
        next.offers[0].description = "second".into();
        let entry = store.commit(&next, "edit").await.unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.summary.updated, 1);

        let history = store.history().await.unwrap();
        assert_eq!(history.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history[0].message, "first import");
    }

    #[tokio::test]
    async fn stale_base_version_is_a_write_conflict() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());

        let first_view = store.load().await.unwrap();
        let second_view = store.load().await.unwrap();

        let mut a = first_view.clone();
        a.offers.push(offer("o1", "a"));
        store.commit(&a, "writer a").await.unwrap();

        let mut b = second_view.clone();
        b.offers.push(offer("o2", "b"));
        let err = store.commit(&b, "writer b").await.unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict { expected: 0, found: 1 }));
        assert!(err.is_write_conflict());

        let current = store.load().await.unwrap();
        assert_eq!(current.offers.len(), 1);
        assert_eq!(current.offers[0].id, "o1");
    }

    #[tokio::test]
    async fn torn_snapshot_write_leaves_previous_snapshot_loadable() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "stable"));
        store.commit(&dataset, "stable").await.unwrap();
        let before = store.load().await.unwrap();

        let faulty = VersionedStore::new(dir.path()).with_fault(CommitFault::TornSnapshotWrite);
        let mut next = before.clone();
        next.offers.push(offer("o2", "lost"));
        assert!(faulty.commit(&next, "will crash").await.is_err());

        let after = store.load().await.unwrap();
        assert_eq!(after, before);
        assert_eq!(store.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crash_after_history_write_is_recoverable() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "v1"));
        store.commit(&dataset, "v1").await.unwrap();

        let faulty = VersionedStore::new(dir.path()).with_fault(CommitFault::AfterHistoryWrite);
        let mut next = store.load().await.unwrap();
        next.offers.push(offer("o2", "orphan"));
        assert!(faulty.commit(&next, "crash").await.is_err());
        assert_eq!(store.load().await.unwrap().version, 1);

        // the orphaned history file for v2 is overwritten by the next real commit
        let mut retry = store.load().await.unwrap();
        retry.offers.push(offer("o3", "real"));
        let entry = store.commit(&retry, "real v2").await.unwrap();
        assert_eq!(entry.version, 2);
        let v2 = store.load_version(2).await.unwrap();
        assert!(v2.get::<Offer>("o3").is_some());
        assert!(v2.get::<Offer>("o2").is_none());
    }

    #[tokio::test]
    async fn orphaned_history_is_not_loadable_or_revertible() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "v1"));
        store.commit(&dataset, "v1").await.unwrap();

        let faulty = VersionedStore::new(dir.path()).with_fault(CommitFault::AfterHistoryWrite);
        let mut next = store.load().await.unwrap();
        next.offers.push(offer("never-committed", "orphan"));
        assert!(faulty.commit(&next, "crash").await.is_err());
        assert!(dir.path().join("history/v00000002.json").exists());

        assert!(matches!(store.load_version(2).await, Err(StoreError::UnknownVersion(2))));
        assert!(matches!(store.revert(2, "revert").await, Err(StoreError::UnknownVersion(2))));
        assert!(matches!(store.load_version(0).await, Err(StoreError::UnknownVersion(0))));
        let current = store.load().await.unwrap();
        assert_eq!(current.version, 1);
        assert!(current.get::<Offer>("never-committed").is_none());
        assert_eq!(store.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crash_during_first_commit_leaves_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        let faulty = VersionedStore::new(dir.path()).with_fault(CommitFault::AfterHistoryWrite);
        let mut dataset = faulty.load().await.unwrap();
        dataset.offers.push(offer("o1", "orphan"));
        assert!(faulty.commit(&dataset, "crash").await.is_err());

        let store = VersionedStore::new(dir.path());
        assert_eq!(store.load().await.unwrap().version, 0);
        assert!(matches!(store.load_version(1).await, Err(StoreError::UnknownVersion(1))));
        let mut retry = store.load().await.unwrap();
        retry.offers.push(offer("o2", "real"));
        assert_eq!(store.commit(&retry, "first").await.unwrap().version, 1);
        assert!(store.load_version(1).await.unwrap().get::<Offer>("o1").is_none());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_not_an_empty_dataset() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "x"));
        store.commit(&dataset, "x").await.unwrap();

        fs::write(store.snapshot_path(), b"{ not json").unwrap();
        assert!(matches!(store.load().await, Err(StoreError::CorruptStore { .. })));

        fs::remove_file(store.snapshot_path()).unwrap();
        assert!(matches!(store.load().await, Err(StoreError::CorruptStore { .. })));
    }

    #[tokio::test]
    async fn tampered_dataset_fails_checksum() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "original"));
        store.commit(&dataset, "x").await.unwrap();

        let text = fs::read_to_string(store.snapshot_path()).unwrap();
        fs::write(store.snapshot_path(), text.replace("original", "tampered")).unwrap();
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptStore { ref reason, .. } if reason == "checksum mismatch"));
    }

    #[tokio::test]
    async fn missing_changelog_lines_are_repaired_on_next_commit() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "v1"));
        store.commit(&dataset, "v1").await.unwrap();

        // simulate a crash between the snapshot swap and the log append
        fs::write(store.changelog_path(), b"").unwrap();
        assert_eq!(store.history().await.unwrap().len(), 1);

        let mut next = store.load().await.unwrap();
        next.offers.push(offer("o2", "v2"));
        store.commit(&next, "v2").await.unwrap();

        let lines = fs::read_to_string(store.changelog_path()).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[tokio::test]
    async fn revert_commits_old_content_as_new_version() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = store.load().await.unwrap();
        dataset.offers.push(offer("o1", "good"));
        store.commit(&dataset, "good").await.unwrap();

        let mut bad = store.load().await.unwrap();
        bad.offers[0].description = "bad".into();
        store.commit(&bad, "bad").await.unwrap();

        let entry = store.revert(1, "revert to v1").await.unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.summary.updated, 1);
        let current = store.load().await.unwrap();
        assert_eq!(current.offers[0].description, "good");
        assert_eq!(store.history().await.unwrap().len(), 3);
        assert!(matches!(store.load_version(9).await, Err(StoreError::UnknownVersion(9))));
    }

    #[tokio::test]
    async fn held_lock_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.path().join(LOCK_FILE))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let dataset = store.load().await.unwrap();
        let err = store.commit(&dataset, "blocked").await.unwrap_err();
        assert!(matches!(err, StoreError::Locked(_)));
        assert!(err.is_write_conflict());
        FileExt::unlock(&holder).unwrap();
    }

    #[tokio::test]
    async fn projection_writes_one_file_per_entity() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = Dataset::empty();
        dataset.offers.push(offer("forms-r1", "a"));
        dataset.offers.push(offer("offer-abc", "b"));

        let root = store.write_projection(&dataset).await.unwrap();
        assert!(root.join("offers/forms-r1.json").exists());
        assert!(root.join("offers/offer-abc.json").exists());
        assert!(root.join("benefits").is_dir());

        dataset.offers.pop();
        store.write_projection(&dataset).await.unwrap();
        assert!(!root.join("offers/offer-abc.json").exists());
    }

    #[tokio::test]
    async fn projection_file_names_keep_distinct_ids_apart() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        let mut dataset = Dataset::empty();
        dataset.offers.push(offer("a.b", "dot"));
        dataset.offers.push(offer("a_b", "underscore"));

        let root = store.write_projection(&dataset).await.unwrap();
        let files = fs::read_dir(root.join("offers")).unwrap().count();
        assert_eq!(files, 2);
        assert_eq!(file_stem("a.b"), "a_2eb");
        assert_eq!(file_stem("a_b"), "a_5fb");
        assert_eq!(file_stem("forms-r1"), "forms-r1");
    }

    #[tokio::test]
    async fn reports_round_trip_through_store_dir() {
        let dir = tempdir().expect("tempdir");
        let store = VersionedStore::new(dir.path());
        assert!(store.read_report::<serde_json::Value>("last_cycle").await.unwrap().is_none());
        store
            .write_report("last_cycle", &serde_json::json!({"inserted": 3}))
            .await
            .unwrap();
        let value: serde_json::Value = store.read_report("last_cycle").await.unwrap().unwrap();
        assert_eq!(value["inserted"], 3);
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        assert_eq!(
            VersionedStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
