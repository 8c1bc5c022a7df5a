//! Job lifecycle: creation, background runs, retry, retrieval, housekeeping.
//!
//! [`JobManager`] is the only component that writes job records. Each run is
//! a detached tokio task; the caller gets a [`StartedJob`] back immediately
//! and follows progress through [`JobManager::status`]. The job record is the
//! only channel between the two.
//!
//! ```text
//!                 ┌──────────── full run ─────────────┐
//! create_job ──▶ pending ──▶ processing ──▶ success | partial_success | failed
//!                    ▲                                  │
//! retry ─────────────┴── failed pages only ◀────────────┘
//! ```
//!
//! A run never returns an error to anyone: every failure ends as a `failed`
//! record carrying the error's display text and the run's duration.

use crate::artifacts::{sanitize_filename, ArtifactStore};
use crate::config::{resolve_effective, EffectiveConfig, Settings, SettingsOverride};
use crate::error::{DocumentError, PagewiseError};
use crate::job::{Job, JobId, JobSnapshot, JobStatus, JobUpdate, PageFailure, PageRange};
use crate::pipeline::orchestrate::{assemble, transcribe_pages, RunOptions};
use crate::pipeline::render::{rasterize_in_background, PdfiumRasterizer, Rasterizer};
use crate::pipeline::transcribe::{Backend, CallOptions, TranscriberFactory, VisionTranscriberFactory};
use crate::progress::PageProgress;
use crate::prompts::{ALL_PAGES_FAILED, STUCK_MESSAGE};
use crate::store::{FileJobStore, JobFilter, JobStore, Transition};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A document submitted for conversion.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// `None` or blank uses [`Settings::default_prompt`].
    pub prompt: Option<String>,
    pub page_range: PageRange,
}

impl NewJob {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            prompt: None,
            page_range: PageRange::ALL,
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn page_range(mut self, range: PageRange) -> Self {
        self.page_range = range;
        self
    }
}

/// A job whose run has been spawned.
#[derive(Debug)]
pub struct StartedJob {
    pub id: JobId,
    handle: JoinHandle<()>,
}

impl StartedJob {
    /// Wait for the background run to finish. The outcome is on the job record.
    pub async fn wait(self) -> Result<JobId, PagewiseError> {
        self.handle
            .await
            .map_err(|e| PagewiseError::Internal(format!("Job supervisor failed: {e}")))?;
        Ok(self.id)
    }

    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Which kind of run a retry started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Same job; only the previously failed pages are transcribed again.
    FailedPagesOnly,
    /// A new job over the same document, prompt and range.
    NewJob,
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub plan: RetryPlan,
    /// The job to poll: the original for [`RetryPlan::FailedPagesOnly`].
    pub job: StartedJob,
}

/// A downloadable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Result of [`JobManager::reset_stuck`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    /// Jobs moved (or, on a dry run, that would move) to `failed`.
    pub reset: Vec<JobId>,
    pub not_found: Vec<JobId>,
    /// Jobs that exist but already finished.
    pub not_stuck: Vec<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Full,
    FailedPagesOnly,
}

/// Terminal fields produced by a successful (non-erroring) run.
struct RunOutcome {
    status: JobStatus,
    error_message: String,
    pages_processed: usize,
    page_results: Vec<String>,
    failures: Vec<PageFailure>,
    output_path: Option<PathBuf>,
}

struct Inner {
    settings: Settings,
    store: Arc<dyn JobStore>,
    artifacts: ArtifactStore,
    rasterizer: Arc<dyn Rasterizer>,
    factory: Arc<dyn TranscriberFactory>,
}

/// Creates jobs, runs them in the background and serves their results.
///
/// Cheap to clone; clones share the same store and settings.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        settings: Settings,
        store: Arc<dyn JobStore>,
        artifacts: ArtifactStore,
        rasterizer: Arc<dyn Rasterizer>,
        factory: Arc<dyn TranscriberFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                artifacts,
                rasterizer,
                factory,
            }),
        }
    }

    /// Production wiring: JSON job store and artifacts under `data_dir`,
    /// pdfium rasteriser, `edgequake-llm` vision providers.
    pub fn open(settings: Settings, data_dir: impl Into<PathBuf>) -> Result<Self, PagewiseError> {
        let data_dir = data_dir.into();
        let store = FileJobStore::open(&data_dir)?;
        let rasterizer = PdfiumRasterizer::new(&settings);
        let factory = VisionTranscriberFactory::new(CallOptions::from_settings(&settings));
        Ok(Self::new(
            settings,
            Arc::new(store),
            ArtifactStore::new(data_dir),
            Arc::new(rasterizer),
            Arc::new(factory),
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    // ── Boundary operations ──────────────────────────────────────────────

    /// Store the document, create a `pending` job and start its run.
    ///
    /// # Errors
    /// [`PagewiseError::UploadTooLarge`] above [`Settings::max_upload_bytes`];
    /// storage errors. Nothing about the document's content is checked here:
    /// an unreadable document becomes a `failed` job.
    pub async fn create_job(&self, new: NewJob) -> Result<StartedJob, PagewiseError> {
        let limit = self.inner.settings.max_upload_bytes;
        if new.bytes.len() > limit {
            return Err(PagewiseError::UploadTooLarge {
                size: new.bytes.len(),
                limit,
            });
        }

        let id = JobId::new();
        let filename = sanitize_filename(&new.filename);
        let prompt = new
            .prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.inner.settings.default_prompt.clone());

        let source = self
            .inner
            .artifacts
            .save_source(id, &filename, &new.bytes)
            .await?;
        self.inner
            .store
            .insert(Job::new(id, filename.as_str(), source, prompt, new.page_range))
            .await?;
        info!(
            "Created job {} for '{}' ({} bytes, pages {})",
            id,
            filename,
            new.bytes.len(),
            new.page_range
        );

        Ok(self.spawn_run(id, RunMode::Full))
    }

    pub async fn job(&self, id: JobId) -> Result<Job, PagewiseError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(PagewiseError::JobNotFound(id))
    }

    /// Point-in-time progress snapshot; safe to poll.
    pub async fn status(&self, id: JobId) -> Result<JobSnapshot, PagewiseError> {
        Ok(self.job(id).await?.snapshot())
    }

    /// Retry a finished job.
    ///
    /// Re-runs only the failed pages when the stored per-page results allow
    /// it (see [`Job::can_retry_failed_only`]); otherwise starts a new full
    /// job over a copy of the same document.
    pub async fn retry(&self, id: JobId) -> Result<RetryOutcome, PagewiseError> {
        let job = self.job(id).await?;
        if !job.status.is_terminal() {
            return Err(PagewiseError::NotRetryable {
                id,
                status: job.status,
            });
        }

        if job.can_retry_failed_only() {
            // Claim the job; a concurrent retry that lost sees `processing`.
            let claim = JobUpdate::default().status(JobStatus::Processing);
            if let Transition::Rejected(current) = self
                .inner
                .store
                .update_if(id, &JobStatus::TERMINAL, claim)
                .await?
            {
                return Err(PagewiseError::NotRetryable {
                    id,
                    status: current.status,
                });
            }
            info!(
                "Retrying {} failed page(s) of job {}",
                job.failed_pages.len(),
                id
            );
            return Ok(RetryOutcome {
                plan: RetryPlan::FailedPagesOnly,
                job: self.spawn_run(id, RunMode::FailedPagesOnly),
            });
        }

        let new_id = JobId::new();
        let source = self
            .inner
            .artifacts
            .copy_source(&job.source_path, new_id, &job.original_filename)
            .await?;
        self.inner
            .store
            .insert(Job::new(
                new_id,
                job.original_filename.as_str(),
                source,
                job.prompt.as_str(),
                job.page_range,
            ))
            .await?;
        info!("Job {} cannot resume failed pages; started new job {}", id, new_id);

        Ok(RetryOutcome {
            plan: RetryPlan::NewJob,
            job: self.spawn_run(new_id, RunMode::Full),
        })
    }

    /// The assembled Markdown of a `success` or `partial_success` job.
    pub async fn markdown(&self, id: JobId) -> Result<Artifact, PagewiseError> {
        let job = self.job(id).await?;
        let path = job
            .output_path
            .as_ref()
            .filter(|_| job.status.has_output())
            .ok_or(PagewiseError::ArtifactUnavailable {
                id,
                what: "Markdown output",
            })?;
        Ok(Artifact {
            filename: job.markdown_filename(),
            bytes: self.inner.artifacts.read(path).await?,
        })
    }

    /// The original document of a `success` or `partial_success` job.
    pub async fn source_document(&self, id: JobId) -> Result<Artifact, PagewiseError> {
        let job = self.job(id).await?;
        if !job.status.has_output() {
            return Err(PagewiseError::ArtifactUnavailable {
                id,
                what: "Source document",
            });
        }
        Ok(Artifact {
            bytes: self.inner.artifacts.read(&job.source_path).await?,
            filename: job.original_filename,
        })
    }

    /// Job history, newest first, optionally filtered by filename substring.
    pub async fn list_jobs(&self, query: Option<&str>) -> Result<Vec<Job>, PagewiseError> {
        let filter = match query {
            Some(q) => JobFilter::default().query(q),
            None => JobFilter::default(),
        };
        self.inner.store.list(&filter).await
    }

    /// Delete job records and their files. Returns the ids that existed.
    pub async fn delete_jobs(&self, ids: &[JobId]) -> Result<Vec<JobId>, PagewiseError> {
        let removed = self.inner.store.delete(ids).await?;
        for job in &removed {
            if let Err(e) = self.inner.artifacts.remove_job(job.id).await {
                warn!("Job {} deleted but its files remain: {}", job.id, e);
            }
        }
        info!("Deleted {} job(s)", removed.len());
        Ok(removed.into_iter().map(|j| j.id).collect())
    }

    /// Delete jobs created more than `days` days ago.
    ///
    /// With `dry_run` nothing is deleted; the jobs that would be are returned.
    pub async fn cleanup_older_than(
        &self,
        days: u32,
        dry_run: bool,
    ) -> Result<Vec<Job>, PagewiseError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        let stale = self
            .inner
            .store
            .list(&JobFilter::default().created_before(cutoff))
            .await?;

        if dry_run {
            info!("Dry run: {} job(s) older than {} day(s)", stale.len(), days);
        } else if !stale.is_empty() {
            let ids: Vec<JobId> = stale.iter().map(|j| j.id).collect();
            self.delete_jobs(&ids).await?;
        }
        Ok(stale)
    }

    /// Force unfinished (`pending` or `processing`) jobs back to a retryable
    /// `failed` state.
    ///
    /// For runs that died with the process. An empty `ids` selects every
    /// unfinished job.
    pub async fn reset_stuck(
        &self,
        ids: &[JobId],
        dry_run: bool,
    ) -> Result<ResetReport, PagewiseError> {
        let mut report = ResetReport::default();
        let candidates = if ids.is_empty() {
            self.inner
                .store
                .list(&JobFilter::default())
                .await?
                .into_iter()
                .filter(|j| !j.status.is_terminal())
                .collect()
        } else {
            let mut found = Vec::with_capacity(ids.len());
            for &id in ids {
                match self.inner.store.get(id).await? {
                    Some(job) => found.push(job),
                    None => report.not_found.push(id),
                }
            }
            found
        };

        for job in candidates {
            if job.status.is_terminal() {
                report.not_stuck.push(job.id);
                continue;
            }
            if !dry_run {
                let update = JobUpdate::default()
                    .status(JobStatus::Failed)
                    .error_message(STUCK_MESSAGE);
                match self
                    .inner
                    .store
                    .update_if(job.id, &JobStatus::UNFINISHED, update)
                    .await?
                {
                    Transition::Applied(_) => warn!("Reset stuck job {} ({})", job.id, job.status),
                    Transition::Rejected(_) => {
                        report.not_stuck.push(job.id);
                        continue;
                    }
                }
            }
            report.reset.push(job.id);
        }
        Ok(report)
    }

    pub async fn settings_override(&self) -> Result<Option<SettingsOverride>, PagewiseError> {
        self.inner.store.settings_override().await
    }

    /// Persist the override record; picked up by the next run that starts.
    ///
    /// # Errors
    /// [`PagewiseError::UnknownBackend`] when a non-empty backend is not supported.
    pub async fn save_settings_override(
        &self,
        record: &SettingsOverride,
    ) -> Result<(), PagewiseError> {
        if !record.backend.trim().is_empty() {
            record.backend.parse::<Backend>()?;
        }
        self.inner.store.save_settings_override(record).await?;
        info!("Saved settings override: {:?}", record);
        Ok(())
    }

    /// The configuration the next run would use.
    pub async fn effective_config(&self) -> Result<EffectiveConfig, PagewiseError> {
        let record = self.inner.store.settings_override().await?;
        Ok(resolve_effective(&self.inner.settings, record.as_ref()))
    }

    // ── Background runs ──────────────────────────────────────────────────

    /// Spawn a supervisor that runs the pipeline in its own task and always
    /// writes a terminal state, even when the pipeline task panics.
    fn spawn_run(&self, id: JobId, mode: RunMode) -> StartedJob {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let worker = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.execute(id, mode).await })
            };
            let result = worker
                .await
                .unwrap_or_else(|e| Err(PagewiseError::Internal(format!("Run task panicked: {e}"))));
            manager.finish(id, result, start).await;
        });
        StartedJob { id, handle }
    }

    async fn execute(&self, id: JobId, mode: RunMode) -> Result<RunOutcome, PagewiseError> {
        let inner = &self.inner;

        // ── Step 1: Load the job and resolve configuration ───────────────
        let job = inner
            .store
            .get(id)
            .await?
            .ok_or(PagewiseError::JobNotFound(id))?;
        let record = inner.store.settings_override().await?;
        let effective = resolve_effective(&inner.settings, record.as_ref());

        let retry_indices = match mode {
            RunMode::Full => None,
            RunMode::FailedPagesOnly => Some(job.failed_indices()),
        };
        let initial = match &retry_indices {
            None => 0,
            Some(indices) => job.page_results.len().saturating_sub(indices.len()),
        };

        inner
            .store
            .update(
                id,
                JobUpdate::default()
                    .status(JobStatus::Processing)
                    .backend(effective.backend_key.as_str(), effective.model())
                    .pages_processed(initial)
                    .error_message(""),
            )
            .await?;
        info!(
            "Job {}: {:?} run with {}/{}",
            id,
            mode,
            effective.backend_key,
            effective.model()
        );

        // ── Step 2: Select the backend (fails closed) ────────────────────
        let backend = effective.backend()?;
        let transcriber = inner.factory.build(backend, &effective)?;

        // ── Step 3: Rasterise ────────────────────────────────────────────
        let render_start = Instant::now();
        let pages = rasterize_in_background(
            Arc::clone(&inner.rasterizer),
            job.source_path.clone(),
            job.page_range,
        )
        .await?;
        let total = pages.page_count();
        info!(
            "Job {}: rasterised {} page(s) in {}ms",
            id,
            total,
            render_start.elapsed().as_millis()
        );

        match &retry_indices {
            None => {
                if total == 0 {
                    return Err(DocumentError::Corrupt {
                        path: job.source_path.clone(),
                        detail: "document has no pages".into(),
                    }
                    .into());
                }
                inner
                    .store
                    .update(id, JobUpdate::default().page_count(total))
                    .await?;
            }
            Some(_) if total != job.page_results.len() => {
                return Err(PagewiseError::PageCountMismatch {
                    expected: job.page_results.len(),
                    actual: total,
                });
            }
            Some(_) => {}
        }

        // ── Step 4: Transcribe ───────────────────────────────────────────
        let (progress, writer) = ProgressWriter::spawn(Arc::clone(&inner.store), id, initial);
        let run = transcribe_pages(
            transcriber,
            &pages.images,
            &job.prompt,
            &RunOptions::from_settings(&inner.settings),
            Some(&progress as &dyn PageProgress),
            retry_indices.as_deref(),
        )
        .await;
        let pages_processed = progress.count();
        drop(progress);
        if let Err(e) = writer.await {
            warn!("Job {}: progress writer stopped: {}", id, e);
        }

        // ── Step 5: Merge and assemble ───────────────────────────────────
        let page_results = match retry_indices {
            None => run.pages,
            Some(_) => {
                let mut merged = job.page_results.clone();
                for (index, text) in run.iter() {
                    merged[index] = text.to_string();
                }
                merged
            }
        };
        let failures = run.failures;

        let (status, error_message) = if failures.is_empty() {
            (JobStatus::Success, String::new())
        } else if failures.len() >= page_results.len() {
            (JobStatus::Failed, ALL_PAGES_FAILED.to_string())
        } else {
            (JobStatus::PartialSuccess, String::new())
        };

        let output_path = if status.has_output() {
            let markdown = assemble(&page_results);
            Some(
                inner
                    .artifacts
                    .write_markdown(id, &job.markdown_filename(), &markdown)
                    .await?,
            )
        } else {
            None
        };

        Ok(RunOutcome {
            status,
            error_message,
            pages_processed,
            page_results,
            failures,
            output_path,
        })
    }

    /// Write the terminal state of a run.
    async fn finish(&self, id: JobId, result: Result<RunOutcome, PagewiseError>, start: Instant) {
        let secs = start.elapsed().as_secs_f64();
        let update = match result {
            Ok(outcome) => {
                info!(
                    "Job {} finished: {} ({} failed page(s), {:.1}s)",
                    id,
                    outcome.status,
                    outcome.failures.len(),
                    secs
                );
                JobUpdate::default()
                    .status(outcome.status)
                    .error_message(outcome.error_message)
                    .pages_processed(outcome.pages_processed)
                    .page_results(outcome.page_results)
                    .failed_pages(outcome.failures)
                    .output_path(outcome.output_path)
                    .processing_time_secs(secs)
            }
            Err(e) => {
                error!("Job {} failed: {}", id, e);
                let update = JobUpdate::default()
                    .status(JobStatus::Failed)
                    .error_message(e.to_string())
                    .processing_time_secs(secs);
                // Stored results no longer line up with the document.
                if matches!(e, PagewiseError::PageCountMismatch { .. }) {
                    update.page_results(Vec::new())
                } else {
                    update
                }
            }
        };

        if let Err(e) = self.inner.store.update(id, update).await {
            error!("Job {}: could not record final state: {}", id, e);
        }
    }
}

/// Counts finished pages and hands each new total to a writer task.
///
/// The count is mutex-guarded so concurrent callbacks never lose an
/// increment; the writer persists values in order and skips intermediate
/// ones it has not caught up with.
struct ProgressWriter {
    done: Mutex<usize>,
    tx: watch::Sender<usize>,
}

impl ProgressWriter {
    fn spawn(store: Arc<dyn JobStore>, id: JobId, initial: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = watch::channel(initial);
        let writer = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let n = *rx.borrow_and_update();
                debug!("Job {}: {} page(s) processed", id, n);
                if let Err(e) = store
                    .update(id, JobUpdate::default().pages_processed(n))
                    .await
                {
                    warn!("Job {}: could not persist progress: {}", id, e);
                }
            }
        });
        (
            Self {
                done: Mutex::new(initial),
                tx,
            },
            writer,
        )
    }

    fn count(&self) -> usize {
        *self.done.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl PageProgress for ProgressWriter {
    fn on_page_done(&self, _page_index: usize) {
        let mut done = self.done.lock().unwrap_or_else(|p| p.into_inner());
        *done += 1;
        self.tx.send_replace(*done);
    }
}
