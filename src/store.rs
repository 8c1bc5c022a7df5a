//! Job persistence.
//!
//! [`JobStore`] is the only way the rest of the crate reads or writes job
//! records and the settings override. Two implementations ship:
//!
//! * [`MemoryJobStore`]: a `RwLock<HashMap>`; used by tests and by hosts
//!   that don't need jobs to survive a restart.
//! * [`FileJobStore`]: one JSON document per job under `<root>/jobs/`,
//!   plus `<root>/settings.json` for the override record.
//!
//! Updates are field-level ([`JobUpdate`]): a run persisting
//! `pages_processed` never overwrites a concurrent operator edit of another
//! field.

use crate::config::SettingsOverride;
use crate::error::PagewiseError;
use crate::job::{Job, JobId, JobStatus, JobUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Selects jobs for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Case-insensitive substring of the original filename.
    pub query: Option<String>,
    pub status: Option<JobStatus>,
    /// Only jobs created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn query(mut self, q: impl Into<String>) -> Self {
        let q = q.into();
        self.query = (!q.trim().is_empty()).then(|| q.trim().to_lowercase());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(q) = &self.query {
            if !job.original_filename.to_lowercase().contains(q.as_str()) {
                return false;
            }
        }
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if self.created_before.is_some_and(|t| job.created_at >= t) {
            return false;
        }
        true
    }
}

/// Result of a conditional update ([`JobStore::update_if`]).
#[derive(Debug, Clone)]
pub enum Transition {
    /// The status matched; holds the updated record.
    Applied(Job),
    /// The status did not match; holds the record as it is.
    Rejected(Job),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), PagewiseError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, PagewiseError>;

    /// Apply `update` and return the resulting record.
    ///
    /// # Errors
    /// [`PagewiseError::JobNotFound`] when no record exists.
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, PagewiseError>;

    /// Apply `update` only if the job's current status is in `allowed`.
    ///
    /// The check and the write are one atomic step with respect to every
    /// other write to the same store.
    ///
    /// # Errors
    /// [`PagewiseError::JobNotFound`] when no record exists.
    async fn update_if(
        &self,
        id: JobId,
        allowed: &[JobStatus],
        update: JobUpdate,
    ) -> Result<Transition, PagewiseError>;

    /// Matching jobs, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, PagewiseError>;

    /// Remove the given records and return the ones that existed.
    async fn delete(&self, ids: &[JobId]) -> Result<Vec<Job>, PagewiseError>;

    async fn settings_override(&self) -> Result<Option<SettingsOverride>, PagewiseError>;

    async fn save_settings_override(&self, record: &SettingsOverride) -> Result<(), PagewiseError>;
}

fn newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    settings: RwLock<Option<SettingsOverride>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), PagewiseError> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, PagewiseError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, PagewiseError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(PagewiseError::JobNotFound(id))?;
        update.apply(job);
        Ok(job.clone())
    }

    async fn update_if(
        &self,
        id: JobId,
        allowed: &[JobStatus],
        update: JobUpdate,
    ) -> Result<Transition, PagewiseError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(PagewiseError::JobNotFound(id))?;
        if !allowed.contains(&job.status) {
            return Ok(Transition::Rejected(job.clone()));
        }
        update.apply(job);
        Ok(Transition::Applied(job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, PagewiseError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn delete(&self, ids: &[JobId]) -> Result<Vec<Job>, PagewiseError> {
        let mut jobs = self.jobs.write().await;
        Ok(ids.iter().filter_map(|id| jobs.remove(id)).collect())
    }

    async fn settings_override(&self) -> Result<Option<SettingsOverride>, PagewiseError> {
        Ok(self.settings.read().await.clone())
    }

    async fn save_settings_override(&self, record: &SettingsOverride) -> Result<(), PagewiseError> {
        *self.settings.write().await = Some(record.clone());
        Ok(())
    }
}

// ── JSON files ───────────────────────────────────────────────────────────

/// One pretty-printed JSON file per job, written atomically.
///
/// A single async mutex serialises every write so read-modify-write updates
/// from concurrent runs cannot interleave. Reads take no lock: a reader sees
/// either the previous or the next complete file, never a torn one.
pub struct FileJobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PagewiseError> {
        let root = root.into();
        let jobs = root.join("jobs");
        std::fs::create_dir_all(&jobs).map_err(|e| PagewiseError::storage(&jobs, e))?;
        debug!("Job store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn job_path(&self, id: JobId) -> PathBuf {
        self.jobs_dir().join(format!("{id}.json"))
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    async fn read_job(&self, path: &Path) -> Result<Option<Job>, PagewiseError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PagewiseError::storage(path, e)),
        }
    }

    async fn write_job(&self, job: &Job) -> Result<(), PagewiseError> {
        let bytes = serde_json::to_vec_pretty(job)?;
        write_atomic(self.job_path(job.id), bytes).await
    }
}

/// Write `bytes` to a temp file beside `path`, then rename over it.
async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<(), PagewiseError> {
    tokio::task::spawn_blocking(move || {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| PagewiseError::storage(dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| PagewiseError::storage(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| PagewiseError::storage(&path, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| PagewiseError::Internal(format!("Store write task panicked: {e}")))?
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: Job) -> Result<(), PagewiseError> {
        let _guard = self.write_lock.lock().await;
        self.write_job(&job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, PagewiseError> {
        self.read_job(&self.job_path(id)).await
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, PagewiseError> {
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .read_job(&self.job_path(id))
            .await?
            .ok_or(PagewiseError::JobNotFound(id))?;
        update.apply(&mut job);
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn update_if(
        &self,
        id: JobId,
        allowed: &[JobStatus],
        update: JobUpdate,
    ) -> Result<Transition, PagewiseError> {
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .read_job(&self.job_path(id))
            .await?
            .ok_or(PagewiseError::JobNotFound(id))?;
        if !allowed.contains(&job.status) {
            return Ok(Transition::Rejected(job));
        }
        update.apply(&mut job);
        self.write_job(&job).await?;
        Ok(Transition::Applied(job))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, PagewiseError> {
        let dir = self.jobs_dir();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| PagewiseError::storage(&dir, e))?;

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PagewiseError::storage(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_job(&path).await {
                Ok(Some(job)) if filter.matches(&job) => jobs.push(job),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable job record {}: {}", path.display(), e),
            }
        }
        newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn delete(&self, ids: &[JobId]) -> Result<Vec<Job>, PagewiseError> {
        let _guard = self.write_lock.lock().await;
        let mut removed = Vec::new();
        for &id in ids {
            let path = self.job_path(id);
            if let Some(job) = self.read_job(&path).await? {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| PagewiseError::storage(&path, e))?;
                removed.push(job);
            }
        }
        Ok(removed)
    }

    async fn settings_override(&self) -> Result<Option<SettingsOverride>, PagewiseError> {
        let path = self.settings_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PagewiseError::storage(&path, e)),
        }
    }

    async fn save_settings_override(&self, record: &SettingsOverride) -> Result<(), PagewiseError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(self.settings_path(), bytes).await
    }
}
