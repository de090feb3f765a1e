//! Background reindex.
//!
//! Rebuilds index rows for stored resources after the parameter registry
//! changes. A job walks resource types in name order and ids in ascending
//! order, one batch at a time, and checkpoints its cursor after every batch
//! so it can be resumed after a restart or a cancel.
//!
//! Each resource is reindexed in its own short write guarded by the version
//! the batch saw: if the resource was updated in between, the newer write
//! has already indexed it and the job skips it. Reindexing a resource twice
//! leaves the same rows behind, so rerunning a job is harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::StorageResult;

use super::errors::ReindexError;

/// Request to start a reindex job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexRequest {
    /// Target resource types (None = all storable types).
    pub resource_types: Option<Vec<String>>,

    /// Number of resources per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_batch_size() -> u32 {
    100
}

impl Default for ReindexRequest {
    fn default() -> Self {
        Self {
            resource_types: None,
            batch_size: default_batch_size(),
        }
    }
}

impl ReindexRequest {
    /// Creates a request covering every storable type.
    pub fn all() -> Self {
        Self::default()
    }

    /// Creates a request for specific resource types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_types: Some(types.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Status of a reindex job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexStatus {
    /// Created but not started.
    Queued,
    /// Running.
    InProgress,
    /// Every resource was processed.
    Completed,
    /// Stopped by a storage failure.
    Failed,
    /// Stopped by `cancel`.
    Cancelled,
}

impl ReindexStatus {
    /// Returns true if the job is still running.
    pub fn is_running(&self) -> bool {
        matches!(self, ReindexStatus::Queued | ReindexStatus::InProgress)
    }

    /// Returns true if the job has finished (success, failure, or cancelled).
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Stored form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexStatus::Queued => "queued",
            ReindexStatus::InProgress => "in-progress",
            ReindexStatus::Completed => "completed",
            ReindexStatus::Failed => "failed",
            ReindexStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ReindexStatus::Queued),
            "in-progress" => Some(ReindexStatus::InProgress),
            "completed" => Some(ReindexStatus::Completed),
            "failed" => Some(ReindexStatus::Failed),
            "cancelled" => Some(ReindexStatus::Cancelled),
            _ => None,
        }
    }
}

/// Position of a job: the last id finished within a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexCursor {
    /// Resource type being walked.
    pub resource_type: String,
    /// Last id processed in that type, if any.
    pub last_id: Option<String>,
}

/// A resource to reindex, with the version the batch saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexTarget {
    /// Logical id.
    pub id: String,
    /// Current version id when the batch was read.
    pub version_id: String,
}

/// Outcome of reindexing one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexOutcome {
    /// Index rows were rebuilt.
    Reindexed {
        /// Number of rows written.
        entries: usize,
    },
    /// The resource changed or was deleted since the batch was read.
    Skipped,
}

/// Progress of a reindex job. Persisted after every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexProgress {
    /// Unique job identifier.
    pub job_id: String,

    /// Current status.
    pub status: ReindexStatus,

    /// Resource types the job covers, in processing order.
    pub resource_types: Vec<String>,

    /// Batch size.
    pub batch_size: u32,

    /// Registry revision the job indexes against.
    pub registry_revision: u64,

    /// Total number of resources when the job started.
    pub total_resources: u64,

    /// Number of resources processed so far.
    pub processed_resources: u64,

    /// Number of resources skipped because they changed underneath the job.
    pub skipped_resources: u64,

    /// Number of index entries written.
    pub entries_written: u64,

    /// Where to continue from.
    pub cursor: Option<ReindexCursor>,

    /// When the job was started (RFC 3339).
    pub started_at: Option<String>,

    /// When the job finished (RFC 3339).
    pub completed_at: Option<String>,

    /// Error message if status is Failed.
    pub error_message: Option<String>,
}

impl ReindexProgress {
    /// Creates progress for a new job.
    pub fn new(job_id: impl Into<String>, resource_types: Vec<String>, batch_size: u32) -> Self {
        Self {
            job_id: job_id.into(),
            status: ReindexStatus::Queued,
            resource_types,
            batch_size: batch_size.max(1),
            registry_revision: 0,
            total_resources: 0,
            processed_resources: 0,
            skipped_resources: 0,
            entries_written: 0,
            cursor: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Returns the progress percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_resources == 0 {
            if self.status == ReindexStatus::Completed { 100.0 } else { 0.0 }
        } else {
            (self.processed_resources as f64 / self.total_resources as f64 * 100.0).min(100.0)
        }
    }

    /// Converts to a FHIR Parameters resource.
    pub fn to_parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "jobId", "valueString": self.job_id},
                {"name": "status", "valueCode": self.status.as_str()},
                {"name": "total", "valueInteger": self.total_resources},
                {"name": "processed", "valueInteger": self.processed_resources},
                {"name": "skipped", "valueInteger": self.skipped_resources},
                {"name": "entriesWritten", "valueInteger": self.entries_written},
                {"name": "percentage", "valueDecimal": self.percentage()}
            ]
        })
    }

    fn finish(&mut self, status: ReindexStatus) {
        self.status = status;
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Storage operations a reindex job needs.
#[async_trait]
pub trait ReindexableStorage: Send + Sync + 'static {
    /// Storable resource types, sorted.
    fn reindexable_types(&self) -> Vec<String>;

    /// The current registry revision.
    fn registry_revision(&self) -> u64;

    /// Counts live resources of the given types.
    async fn count_live(&self, resource_types: &[String]) -> StorageResult<u64>;

    /// Live resources of `resource_type` with ids after `after_id`, in id order.
    async fn fetch_batch(
        &self,
        resource_type: &str,
        after_id: Option<&str>,
        limit: u32,
    ) -> StorageResult<Vec<ReindexTarget>>;

    /// Rebuilds the index rows of one resource if it is still at `version_id`.
    async fn reindex_resource(
        &self,
        resource_type: &str,
        target: &ReindexTarget,
    ) -> StorageResult<ReindexOutcome>;

    /// Persists job progress.
    async fn save_progress(&self, progress: &ReindexProgress) -> StorageResult<()>;

    /// Loads job progress.
    async fn load_progress(&self, job_id: &str) -> StorageResult<Option<ReindexProgress>>;
}

struct JobHandle {
    cancel: Arc<AtomicBool>,
    task: Option<JoinHandle<ReindexProgress>>,
}

/// Starts, resumes and cancels reindex jobs.
pub struct ReindexOperation<S: ReindexableStorage> {
    storage: Arc<S>,
    jobs: Arc<RwLock<HashMap<String, JobHandle>>>,
}

impl<S: ReindexableStorage> Clone for ReindexOperation<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

impl<S: ReindexableStorage> ReindexOperation<S> {
    /// Creates a job manager over the storage.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Starts a job and returns its id. The job runs on a tokio task.
    ///
    /// # Errors
    ///
    /// * `ReindexError::AlreadyRunning` - if another job is running
    pub async fn start(&self, request: ReindexRequest) -> Result<String, ReindexError> {
        self.ensure_idle()?;

        let types = match request.resource_types {
            Some(mut types) => {
                types.sort();
                types.dedup();
                types
            }
            None => self.storage.reindexable_types(),
        };

        let job_id = Uuid::new_v4().to_string();
        let mut progress = ReindexProgress::new(&job_id, types, request.batch_size);
        progress.registry_revision = self.storage.registry_revision();
        progress.total_resources = self.storage.count_live(&progress.resource_types).await?;
        progress.started_at = Some(chrono::Utc::now().to_rfc3339());
        self.storage.save_progress(&progress).await?;

        tracing::info!(
            job_id = %job_id,
            types = progress.resource_types.len(),
            total = progress.total_resources,
            "starting reindex job"
        );
        self.spawn(progress);
        Ok(job_id)
    }

    /// Continues a stopped job from its stored cursor.
    ///
    /// A completed job is left alone.
    ///
    /// # Errors
    ///
    /// * `ReindexError::JobNotFound` - if no job has this id
    /// * `ReindexError::AlreadyRunning` - if a job is running
    pub async fn resume(&self, job_id: &str) -> Result<(), ReindexError> {
        let progress = self
            .storage
            .load_progress(job_id)
            .await?
            .ok_or_else(|| ReindexError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if progress.status == ReindexStatus::Completed {
            return Ok(());
        }
        self.ensure_idle()?;

        let mut progress = progress;
        progress.completed_at = None;
        progress.error_message = None;
        tracing::info!(
            job_id = %job_id,
            processed = progress.processed_resources,
            "resuming reindex job"
        );
        self.spawn(progress);
        Ok(())
    }

    /// Stops a job at its next batch boundary.
    ///
    /// # Errors
    ///
    /// * `ReindexError::JobNotFound` - if no job has this id
    pub async fn cancel(&self, job_id: &str) -> Result<(), ReindexError> {
        let running = self
            .jobs
            .read()
            .get(job_id)
            .map(|job| Arc::clone(&job.cancel));
        if let Some(flag) = running {
            flag.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Not running in this process: mark the stored job cancelled.
        let mut progress = self
            .storage
            .load_progress(job_id)
            .await?
            .ok_or_else(|| ReindexError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if progress.status.is_running() {
            progress.finish(ReindexStatus::Cancelled);
            self.storage.save_progress(&progress).await?;
        }
        Ok(())
    }

    /// Gets the stored progress of a job.
    pub async fn get_progress(&self, job_id: &str) -> Result<ReindexProgress, ReindexError> {
        self.storage
            .load_progress(job_id)
            .await?
            .ok_or_else(|| ReindexError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Waits for a job started by this manager to stop and returns its
    /// final progress.
    pub async fn wait(&self, job_id: &str) -> Result<ReindexProgress, ReindexError> {
        let task = self
            .jobs
            .write()
            .get_mut(job_id)
            .and_then(|job| job.task.take());
        match task {
            Some(task) => {
                let progress = task.await.map_err(|e| ReindexError::StorageError {
                    message: format!("reindex task panicked: {}", e),
                })?;
                self.jobs.write().remove(job_id);
                Ok(progress)
            }
            None => self.get_progress(job_id).await,
        }
    }

    fn ensure_idle(&self) -> Result<(), ReindexError> {
        let mut jobs = self.jobs.write();
        jobs.retain(|_, job| job.task.as_ref().is_some_and(|t| !t.is_finished()));
        match jobs.keys().next() {
            Some(existing) => Err(ReindexError::AlreadyRunning {
                existing_job_id: existing.clone(),
            }),
            None => Ok(()),
        }
    }

    fn spawn(&self, progress: ReindexProgress) {
        let cancel = Arc::new(AtomicBool::new(false));
        let job_id = progress.job_id.clone();
        let storage = Arc::clone(&self.storage);
        let flag = Arc::clone(&cancel);
        let task = tokio::spawn(async move { run_job(storage, progress, flag).await });
        self.jobs.write().insert(
            job_id,
            JobHandle {
                cancel,
                task: Some(task),
            },
        );
    }
}

impl<S: ReindexableStorage> std::fmt::Debug for ReindexOperation<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReindexOperation")
            .field("active_jobs", &self.jobs.read().len())
            .finish()
    }
}

async fn run_job<S: ReindexableStorage>(
    storage: Arc<S>,
    mut progress: ReindexProgress,
    cancel: Arc<AtomicBool>,
) -> ReindexProgress {
    progress.status = ReindexStatus::InProgress;
    let status = match walk(&*storage, &mut progress, &cancel).await {
        Ok(true) => ReindexStatus::Completed,
        Ok(false) => ReindexStatus::Cancelled,
        Err(e) => {
            tracing::warn!(job_id = %progress.job_id, error = %e, "reindex job failed");
            progress.error_message = Some(e.to_string());
            ReindexStatus::Failed
        }
    };
    progress.finish(status);
    if let Err(e) = storage.save_progress(&progress).await {
        tracing::warn!(job_id = %progress.job_id, error = %e, "failed to save reindex progress");
    }
    tracing::info!(
        job_id = %progress.job_id,
        status = progress.status.as_str(),
        processed = progress.processed_resources,
        skipped = progress.skipped_resources,
        "reindex job stopped"
    );
    progress
}

/// Walks the job from its cursor. Returns false when cancelled.
async fn walk<S: ReindexableStorage>(
    storage: &S,
    progress: &mut ReindexProgress,
    cancel: &AtomicBool,
) -> StorageResult<bool> {
    let types = progress.resource_types.clone();
    let start = progress
        .cursor
        .as_ref()
        .and_then(|c| types.iter().position(|t| *t == c.resource_type))
        .unwrap_or(0);

    for resource_type in &types[start..] {
        let mut last_id = progress
            .cursor
            .as_ref()
            .filter(|c| c.resource_type == *resource_type)
            .and_then(|c| c.last_id.clone());

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }

            let batch = storage
                .fetch_batch(resource_type, last_id.as_deref(), progress.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            for target in &batch {
                match storage.reindex_resource(resource_type, target).await? {
                    ReindexOutcome::Reindexed { entries } => {
                        progress.entries_written += entries as u64;
                    }
                    ReindexOutcome::Skipped => progress.skipped_resources += 1,
                }
                progress.processed_resources += 1;
            }

            last_id = batch.last().map(|t| t.id.clone());
            progress.cursor = Some(ReindexCursor {
                resource_type: resource_type.clone(),
                last_id: last_id.clone(),
            });
            storage.save_progress(progress).await?;
            tracing::debug!(
                job_id = %progress.job_id,
                resource_type = %resource_type,
                processed = progress.processed_resources,
                "reindex batch checkpointed"
            );

            if batch.len() < progress.batch_size as usize {
                break;
            }
        }
    }
    Ok(true)
}
