//! Checkpoint lifecycle manager
//!
//! Owns one run's checkpoint directory: the single-writer lock, the
//! startup scan, cadence-driven async saves, retention pruning, and
//! newest-first recovery loads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use runtime_core::config::CheckpointSettings;
use runtime_core::{Cadence, CheckpointRecord, Error, Result, Step};
use serde::{Deserialize, Serialize};
use storage::StorageBackend;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{self, Artifact, ArtifactManifest};
use crate::writer::{CheckpointWriter, WriteRequest, WriterEvent};

/// Lock marker file name inside a run's checkpoint directory
const LOCK_FILE: &str = ".lock";

/// State of a run's checkpoint directory, decided by the startup scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryState {
    /// No checkpoint artifacts present
    Empty,

    /// The newest artifact is structurally complete
    HasValidCheckpoint { step: Step },

    /// The newest artifact is partial or unreadable; `fallback` is the
    /// newest complete one, when any exists
    Corrupt { fallback: Option<Step> },
}

/// Contents of the lock marker, for diagnostics when a lock is held
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            owner: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            created_at: Utc::now(),
        }
    }
}

/// A save that has been queued but not yet published
#[derive(Debug, Clone)]
pub struct PendingSave {
    pub step: Step,
    pub queued_at: DateTime<Utc>,
}

/// Checkpoint manager for one run directory
///
/// Exactly one manager may hold a run directory at a time; `open`
/// acquires the lock marker and `close` releases it. All saves flow
/// through a single writer task, so publication order equals submission
/// order.
pub struct CheckpointManager {
    prefix: String,
    settings: CheckpointSettings,
    storage: Arc<dyn StorageBackend>,
    save_cadence: Cadence,
    directory_state: DirectoryState,

    /// Published checkpoints by step
    records: Arc<RwLock<BTreeMap<Step, CheckpointRecord>>>,

    /// Queued saves the writer has not finished
    pending: Arc<RwLock<BTreeMap<Step, PendingSave>>>,

    /// First write failure after retry exhaustion; latched, never cleared
    failure: Arc<RwLock<Option<String>>>,

    /// Paths whose deletion failed, retried on the next prune pass
    parked_deletions: Arc<RwLock<Vec<String>>>,

    /// Total publications by this manager, unaffected by pruning
    published_total: Arc<AtomicU64>,

    write_tx: mpsc::Sender<WriteRequest>,
    _writer: CheckpointWriter,
    _listener: tokio::task::JoinHandle<()>,

    lock_key: String,
}

impl CheckpointManager {
    /// Open a run's checkpoint directory
    ///
    /// Acquires the single-writer lock, scans existing artifacts to
    /// decide the directory state, and spawns the async writer. Fails
    /// with `RunLocked` when another manager holds the directory.
    pub async fn open(
        prefix: &str,
        settings: CheckpointSettings,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let lock_key = join_key(prefix, LOCK_FILE);
        acquire_lock(storage.as_ref(), &lock_key).await?;

        let (initial_records, directory_state) = match scan(storage.as_ref(), prefix).await {
            Ok(scanned) => scanned,
            Err(e) => {
                let _ = storage.delete(&lock_key).await;
                return Err(e);
            }
        };

        info!(
            prefix,
            state = ?directory_state,
            checkpoints = initial_records.len(),
            "Opened checkpoint directory"
        );

        let records = Arc::new(RwLock::new(initial_records));
        let pending = Arc::new(RwLock::new(BTreeMap::new()));
        let failure = Arc::new(RwLock::new(None));
        let parked_deletions = Arc::new(RwLock::new(Vec::new()));
        let published_total = Arc::new(AtomicU64::new(0));

        let (event_tx, event_rx) = mpsc::channel(settings.queue_depth.max(1) * 2);
        let (write_tx, writer) = CheckpointWriter::spawn(
            storage.clone(),
            settings.retry.clone(),
            settings.queue_depth,
            event_tx,
        );

        let listener = tokio::spawn(listen_for_events(
            event_rx,
            records.clone(),
            pending.clone(),
            failure.clone(),
            parked_deletions.clone(),
            published_total.clone(),
            settings.clone(),
            storage.clone(),
        ));

        Ok(Self {
            prefix: prefix.to_string(),
            save_cadence: Cadence::every(settings.save_period),
            settings,
            storage,
            directory_state,
            records,
            pending,
            failure,
            parked_deletions,
            published_total,
            write_tx,
            _writer: writer,
            _listener: listener,
            lock_key,
        })
    }

    /// Remove a leftover lock marker from a crashed process
    ///
    /// Never called automatically; taking over a possibly live run must
    /// be an explicit operator decision.
    pub async fn force_unlock(storage: &dyn StorageBackend, prefix: &str) -> Result<()> {
        let lock_key = join_key(prefix, LOCK_FILE);
        match storage.delete(&lock_key).await {
            Ok(()) => {
                warn!(path = %lock_key, "Forcibly removed checkpoint directory lock");
                Ok(())
            }
            Err(Error::StoragePathNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Directory state decided by the startup scan
    pub fn directory_state(&self) -> &DirectoryState {
        &self.directory_state
    }

    /// Queue a save when the completed-step count is on the save cadence
    ///
    /// The snapshot closure runs only when a save actually triggers, so
    /// off-cadence steps pay nothing. Returns whether a save was queued.
    /// Fails once a previous save has exhausted its retries; training
    /// must not continue without a working resume path.
    pub async fn maybe_save<F>(&self, completed_step: Step, snapshot: F) -> Result<bool>
    where
        F: FnOnce() -> Result<(ArtifactManifest, Bytes)>,
    {
        self.ensure_healthy()?;
        if completed_step == 0 || !self.save_cadence.fires_at(completed_step) {
            return Ok(false);
        }

        let (manifest, payload) = snapshot()?;
        self.save(completed_step, &manifest, &payload).await?;
        Ok(true)
    }

    /// Queue an unconditional save of an already materialized snapshot
    pub async fn save(
        &self,
        step: Step,
        manifest: &ArtifactManifest,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_healthy()?;

        let data = artifact::encode(step, manifest, payload)?;
        let path = join_key(&self.prefix, &artifact::file_name(step));

        self.pending.write().insert(
            step,
            PendingSave {
                step,
                queued_at: Utc::now(),
            },
        );

        let request = WriteRequest {
            step,
            path: path.clone(),
            data,
        };
        if let Err(e) = self.write_tx.send(request).await {
            self.pending.write().remove(&step);
            return Err(Error::ChannelClosed {
                channel: format!("checkpoint write queue: {e}"),
            });
        }

        debug!(step, path = %path, "Queued checkpoint save");
        Ok(())
    }

    /// Load the newest readable checkpoint
    ///
    /// Candidates are tried newest first; a corrupt candidate falls back
    /// to the next older one. Returns `None` when the directory holds
    /// nothing structurally complete (fresh start), and fails with
    /// `NoCheckpointForRecovery` when every scanned-valid candidate turns
    /// out unreadable.
    pub async fn load_for_resume(&self) -> Result<Option<Artifact>> {
        let candidates: Vec<CheckpointRecord> =
            self.records.read().values().rev().cloned().collect();

        if candidates.is_empty() {
            if matches!(self.directory_state, DirectoryState::Corrupt { .. }) {
                warn!("No complete checkpoint to fall back to, starting fresh");
            }
            return Ok(None);
        }

        for record in candidates {
            let decoded = match self.storage.read(&record.path).await {
                Ok(bytes) => artifact::decode(&record.path, &bytes),
                Err(e) => Err(e),
            };
            match decoded {
                Ok(loaded) => {
                    info!(
                        step = loaded.step,
                        path = %record.path,
                        mesh = %loaded.manifest.mesh_summary(),
                        "Loaded checkpoint for resume"
                    );
                    return Ok(Some(loaded));
                }
                Err(e) => {
                    warn!(
                        step = record.step,
                        path = %record.path,
                        error = %e,
                        "Checkpoint unreadable, falling back to an older one"
                    );
                }
            }
        }

        Err(Error::NoCheckpointForRecovery)
    }

    /// Newest published checkpoint
    pub fn latest(&self) -> Option<CheckpointRecord> {
        self.records.read().values().last().cloned()
    }

    /// All published checkpoints, oldest first
    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Steps of the currently retained checkpoints, ascending
    pub fn retained_steps(&self) -> Vec<Step> {
        self.records.read().keys().copied().collect()
    }

    /// Saves queued but not yet published
    pub fn pending_saves(&self) -> Vec<PendingSave> {
        self.pending.read().values().cloned().collect()
    }

    /// Number of deletions parked for retry
    pub fn parked_deletion_count(&self) -> usize {
        self.parked_deletions.read().len()
    }

    /// Count of checkpoints published by this manager instance
    pub fn published_count(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    /// Settings this manager was opened with
    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Block until every queued save has been published or failed
    ///
    /// Fails when any save exhausted its retries, since the run then has
    /// no guarantee its newest state is recoverable.
    pub async fn wait_pending(&self) -> Result<()> {
        loop {
            if self.pending.read().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.ensure_healthy()
    }

    /// Flush pending saves and release the directory lock
    pub async fn close(self) -> Result<()> {
        let flush_result = self.wait_pending().await;

        match self.storage.delete(&self.lock_key).await {
            Ok(()) => debug!(path = %self.lock_key, "Released checkpoint directory lock"),
            Err(Error::StoragePathNotFound { .. }) => {}
            Err(e) => warn!(path = %self.lock_key, error = %e, "Failed to release lock"),
        }

        flush_result
    }

    fn ensure_healthy(&self) -> Result<()> {
        if let Some(message) = self.failure.read().clone() {
            return Err(Error::CheckpointWriteFailed { message });
        }
        Ok(())
    }
}

/// Join a storage key onto the manager prefix
fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Create the lock marker, failing loudly when it already exists
async fn acquire_lock(storage: &dyn StorageBackend, lock_key: &str) -> Result<()> {
    let info = LockInfo::current();
    let body = Bytes::from(serde_json::to_vec(&info)?);

    if storage.write_if_absent(lock_key, body).await? {
        debug!(path = %lock_key, owner = %info.owner, "Acquired checkpoint directory lock");
        return Ok(());
    }

    match storage.read(lock_key).await {
        Ok(existing) => {
            if let Ok(holder) = serde_json::from_slice::<LockInfo>(&existing) {
                error!(
                    path = %lock_key,
                    holder_pid = holder.pid,
                    holder_host = %holder.hostname,
                    held_since = %holder.created_at,
                    "Checkpoint directory is locked by another process"
                );
            }
        }
        Err(e) => warn!(path = %lock_key, error = %e, "Lock held but contents unreadable"),
    }

    Err(Error::RunLocked {
        path: lock_key.to_string(),
    })
}

/// Scan a directory for artifacts and decide its state
async fn scan(
    storage: &dyn StorageBackend,
    prefix: &str,
) -> Result<(BTreeMap<Step, CheckpointRecord>, DirectoryState)> {
    let list_prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    };

    let mut records = BTreeMap::new();
    let mut newest_named: Option<Step> = None;

    for path in storage.list(&list_prefix).await? {
        let name = path.rsplit('/').next().unwrap_or(&path);
        let step = match artifact::parse_file_name(name) {
            Some(step) => step,
            None => continue,
        };
        newest_named = Some(newest_named.map_or(step, |s: Step| s.max(step)));

        let bytes = match storage.read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path, error = %e, "Artifact unreadable during scan");
                continue;
            }
        };
        match artifact::decode_manifest(&path, &bytes) {
            Ok((header_step, manifest)) if header_step == step => {
                records.insert(
                    step,
                    CheckpointRecord {
                        step,
                        path: path.clone(),
                        size_bytes: bytes.len() as u64,
                        created_at: manifest.created_at,
                    },
                );
            }
            Ok((header_step, _)) => {
                warn!(
                    path = %path,
                    header_step,
                    name_step = step,
                    "Artifact header step disagrees with its file name, skipping"
                );
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Incomplete artifact found during scan");
            }
        }
    }

    let state = match newest_named {
        None => DirectoryState::Empty,
        Some(newest) => {
            if records.contains_key(&newest) {
                DirectoryState::HasValidCheckpoint { step: newest }
            } else {
                DirectoryState::Corrupt {
                    fallback: records.keys().next_back().copied(),
                }
            }
        }
    };

    Ok((records, state))
}

/// Writer event loop: register publications, latch failures, prune
///
/// A pending entry is removed only after its event is fully handled,
/// so `wait_pending` returning means retention has run for every
/// published save.
async fn listen_for_events(
    mut event_rx: mpsc::Receiver<WriterEvent>,
    records: Arc<RwLock<BTreeMap<Step, CheckpointRecord>>>,
    pending: Arc<RwLock<BTreeMap<Step, PendingSave>>>,
    failure: Arc<RwLock<Option<String>>>,
    parked_deletions: Arc<RwLock<Vec<String>>>,
    published_total: Arc<AtomicU64>,
    settings: CheckpointSettings,
    storage: Arc<dyn StorageBackend>,
) {
    debug!("Checkpoint event listener started");

    while let Some(event) = event_rx.recv().await {
        match event {
            WriterEvent::Published {
                step,
                path,
                size_bytes,
            } => {
                records.write().insert(
                    step,
                    CheckpointRecord {
                        step,
                        path,
                        size_bytes,
                        created_at: Utc::now(),
                    },
                );
                published_total.fetch_add(1, Ordering::Relaxed);
                prune(&records, &parked_deletions, &settings, storage.as_ref()).await;
                pending.write().remove(&step);
            }
            WriterEvent::Failed { step, path, error } => {
                error!(
                    step,
                    path = %path,
                    error = %error,
                    "Checkpoint save failed after exhausting retries"
                );
                let mut slot = failure.write();
                if slot.is_none() {
                    *slot = Some(format!("step {step}: {error}"));
                }
                drop(slot);
                pending.write().remove(&step);
            }
        }
    }

    debug!("Checkpoint event listener stopped");
}

/// Apply the retention policy and delete everything it dooms
///
/// Retention keeps the most recent `max_to_keep` steps (all of them
/// when 0) plus every step that is a multiple of `keep_period` (when
/// > 0). Failed deletions are parked and retried on the next pass.
async fn prune(
    records: &RwLock<BTreeMap<Step, CheckpointRecord>>,
    parked_deletions: &RwLock<Vec<String>>,
    settings: &CheckpointSettings,
    storage: &dyn StorageBackend,
) {
    let parked: Vec<String> = std::mem::take(&mut *parked_deletions.write());
    for path in parked {
        match storage.delete(&path).await {
            Ok(()) => debug!(path = %path, "Deleted previously parked checkpoint"),
            Err(Error::StoragePathNotFound { .. }) => {}
            Err(e) => {
                warn!(path = %path, error = %e, "Parked deletion failed again");
                parked_deletions.write().push(path);
            }
        }
    }

    let doomed: Vec<CheckpointRecord> = {
        let mut records = records.write();
        let steps: Vec<Step> = records.keys().copied().collect();

        let tail_start = if settings.max_to_keep == 0 {
            0
        } else {
            steps.len().saturating_sub(settings.max_to_keep as usize)
        };
        let recent = &steps[tail_start..];

        let doomed_steps: Vec<Step> = steps
            .iter()
            .copied()
            .filter(|step| {
                let in_tail = recent.contains(step);
                let milestone = settings.keep_period > 0 && step % settings.keep_period == 0;
                !in_tail && !milestone
            })
            .collect();

        doomed_steps
            .into_iter()
            .filter_map(|step| records.remove(&step))
            .collect()
    };

    for record in doomed {
        match storage.delete(&record.path).await {
            Ok(()) => debug!(step = record.step, path = %record.path, "Pruned checkpoint"),
            Err(Error::StoragePathNotFound { .. }) => {}
            Err(e) => {
                warn!(
                    step = record.step,
                    path = %record.path,
                    error = %e,
                    "Failed to delete pruned checkpoint, parking for retry"
                );
                parked_deletions.write().push(record.path);
            }
        }
    }
}
