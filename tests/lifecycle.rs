//! End-to-end job lifecycle tests.
//!
//! The pipeline runs for real (manager, orchestrator, stores, artifacts);
//! only pdfium and the vision provider are replaced: a fake rasteriser
//! produces N placeholder page images for any file with PDF magic bytes,
//! and a scripted transcriber fails chosen pages a chosen number of times.
//! No network access or pdfium library is needed.

use async_trait::async_trait;
use pagewise::config::EffectiveConfig;
use pagewise::job::JobUpdate;
use pagewise::pipeline::render::{check_document, select_pages};
use pagewise::prompts::{count_failed_markers, failed_page_placeholder, ALL_PAGES_FAILED, STUCK_MESSAGE};
use pagewise::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

const PDF: &[u8] = b"%PDF-1.7\n% fake document\n";

// ── Fakes ────────────────────────────────────────────────────────────────

struct FakeRasterizer {
    pages: AtomicUsize,
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl Rasterizer for FakeRasterizer {
    fn rasterize(&self, path: &Path, range: PageRange) -> Result<RasterizedPages, PagewiseError> {
        check_document(path)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DocumentError::Corrupt {
                path: path.to_path_buf(),
                detail: "xref table damaged".into(),
            }
            .into());
        }

        let document_pages = self.pages.load(Ordering::SeqCst);
        let selected = select_pages(range, document_pages, 100);
        let images = selected
            .clone()
            .enumerate()
            .map(|(index, doc_idx)| PageImage {
                index,
                base64_png: format!("png-of-page-{}", doc_idx + 1),
            })
            .collect();
        Ok(RasterizedPages {
            images,
            document_pages,
            selected,
        })
    }
}

#[derive(Default)]
struct Script {
    /// page index → remaining failures
    failures: Mutex<HashMap<usize, u32>>,
    calls: Mutex<Vec<usize>>,
    built: Mutex<Vec<(Backend, String)>>,
    /// When set, every call waits for a permit before answering.
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Script {
    fn fail(&self, index: usize, times: u32) {
        self.failures.lock().unwrap().insert(index, times);
    }

    fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn take_calls(&self) -> Vec<usize> {
        let mut calls = std::mem::take(&mut *self.calls.lock().unwrap());
        calls.sort_unstable();
        calls
    }
}

struct ScriptedTranscriber {
    script: Arc<Script>,
    model: String,
}

#[async_trait]
impl PageTranscriber for ScriptedTranscriber {
    async fn transcribe_page(
        &self,
        image: &PageImage,
        _prompt: &str,
    ) -> Result<String, TranscriptionError> {
        self.script.calls.lock().unwrap().push(image.index);
        let gate = self.script.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
        // Later pages finish first.
        let delay = 4u64.saturating_sub(image.index as u64) * 5;
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let mut failures = self.script.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&image.index) {
            if *left > 0 {
                *left -= 1;
                return Err(TranscriptionError::Provider(format!(
                    "HTTP 500 on page {}",
                    image.page_num()
                )));
            }
        }
        Ok(format!(
            "# Page {}\n\nBody of {} via {}",
            image.page_num(),
            image.base64_png,
            self.model
        ))
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
}

impl TranscriberFactory for ScriptedFactory {
    fn build(
        &self,
        backend: Backend,
        config: &EffectiveConfig,
    ) -> Result<Arc<dyn PageTranscriber>, PagewiseError> {
        self.script
            .built
            .lock()
            .unwrap()
            .push((backend, config.model().to_string()));
        Ok(Arc::new(ScriptedTranscriber {
            script: Arc::clone(&self.script),
            model: config.model().to_string(),
        }))
    }
}

/// Memory store that records every persisted `pages_processed` value.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryJobStore,
    progress: Mutex<Vec<usize>>,
}

impl RecordingStore {
    fn take_progress(&self) -> Vec<usize> {
        std::mem::take(&mut *self.progress.lock().unwrap())
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn insert(&self, job: Job) -> Result<(), PagewiseError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, PagewiseError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, PagewiseError> {
        if let Some(n) = update.pages_processed {
            self.progress.lock().unwrap().push(n);
        }
        self.inner.update(id, update).await
    }

    async fn update_if(
        &self,
        id: JobId,
        allowed: &[JobStatus],
        update: JobUpdate,
    ) -> Result<Transition, PagewiseError> {
        let pages_processed = update.pages_processed;
        let outcome = self.inner.update_if(id, allowed, update).await?;
        if let (Transition::Applied(_), Some(n)) = (&outcome, pages_processed) {
            self.progress.lock().unwrap().push(n);
        }
        Ok(outcome)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, PagewiseError> {
        self.inner.list(filter).await
    }

    async fn delete(&self, ids: &[JobId]) -> Result<Vec<Job>, PagewiseError> {
        self.inner.delete(ids).await
    }

    async fn settings_override(&self) -> Result<Option<SettingsOverride>, PagewiseError> {
        self.inner.settings_override().await
    }

    async fn save_settings_override(&self, record: &SettingsOverride) -> Result<(), PagewiseError> {
        self.inner.save_settings_override(record).await
    }
}

struct Harness {
    manager: JobManager,
    store: Arc<RecordingStore>,
    raster: Arc<FakeRasterizer>,
    script: Arc<Script>,
    _dir: TempDir,
}

fn harness_with(settings: Settings, pages: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordingStore::default());
    let raster = Arc::new(FakeRasterizer {
        pages: AtomicUsize::new(pages),
        calls: AtomicUsize::new(0),
        fail_next: AtomicBool::new(false),
    });
    let script = Arc::new(Script::default());
    let manager = JobManager::new(
        settings,
        store.clone(),
        ArtifactStore::new(dir.path()),
        raster.clone(),
        Arc::new(ScriptedFactory {
            script: Arc::clone(&script),
        }),
    );
    Harness {
        manager,
        store,
        raster,
        script,
        _dir: dir,
    }
}

fn harness(pages: usize) -> Harness {
    harness_with(Settings::builder().max_workers(2).build().unwrap(), pages)
}

impl Harness {
    async fn run(&self, job: NewJob) -> Job {
        let id = self.manager.create_job(job).await.unwrap().wait().await.unwrap();
        self.manager.job(id).await.unwrap()
    }

    async fn convert(&self) -> Job {
        self.run(NewJob::new("scan.pdf", PDF.to_vec())).await
    }
}

fn assert_monotonic(values: &[usize], from: usize, to: usize) {
    assert!(!values.is_empty());
    assert_eq!(values.first(), Some(&from), "progress {values:?}");
    assert_eq!(values.last(), Some(&to), "progress {values:?}");
    assert!(
        values.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {values:?}"
    );
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_pages_all_succeed() {
    let h = harness(3);
    let job = h.convert().await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.page_count, Some(3));
    assert_eq!(job.pages_processed, 3);
    assert!(job.failed_pages.is_empty());
    assert_eq!(job.error_message, "");
    assert_eq!(job.vision_backend, "openai");
    assert_eq!(job.vision_model, config::DEFAULT_OPENAI_MODEL);
    assert!(job.processing_time_secs.is_some());

    for (i, text) in job.page_results.iter().enumerate() {
        assert!(text.starts_with(&format!("# Page {}", i + 1)), "slot {i}: {text}");
    }

    let md = h.manager.markdown(job.id).await.unwrap();
    assert_eq!(md.filename, "scan.md");
    let md = String::from_utf8(md.bytes).unwrap();
    assert_eq!(md, job.page_results.join("\n\n"));

    let src = h.manager.source_document(job.id).await.unwrap();
    assert_eq!(src.filename, "scan.pdf");
    assert_eq!(src.bytes, PDF);

    let snapshot = h.manager.status(job.id).await.unwrap();
    assert_eq!(snapshot.total_pages, Some(3));
    assert_eq!(snapshot.error_message, None);
}

#[tokio::test]
async fn one_failed_page_is_partial_success() {
    let h = harness(3);
    h.script.fail(1, 1);
    let job = h.convert().await;

    assert_eq!(job.status, JobStatus::PartialSuccess);
    assert_eq!(job.pages_processed, 3);
    assert_eq!(
        job.failed_pages,
        vec![PageFailure {
            page: 2,
            error: "HTTP 500 on page 2".into()
        }]
    );
    assert_eq!(job.page_results[1], failed_page_placeholder(2));

    let md = String::from_utf8(h.manager.markdown(job.id).await.unwrap().bytes).unwrap();
    assert!(md.contains("# Page 1"));
    assert!(md.contains("# Page 3"));
    assert!(md.contains("<!-- [Page 2: transcription failed] -->"));
    assert_eq!(count_failed_markers(&md), job.failed_pages.len());

    let snapshot = h.manager.status(job.id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::PartialSuccess);
    assert_eq!(snapshot.error_message, None);
}

#[tokio::test]
async fn all_pages_failing_fails_the_job() {
    let h = harness(3);
    for i in 0..3 {
        h.script.fail(i, 10);
    }
    let job = h.convert().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message, ALL_PAGES_FAILED);
    assert_eq!(job.failed_pages.len(), 3);
    assert_eq!(job.page_results.len(), 3);
    assert_eq!(job.output_path, None);
    assert!(matches!(
        h.manager.markdown(job.id).await,
        Err(PagewiseError::ArtifactUnavailable { .. })
    ));

    let snapshot = h.manager.status(job.id).await.unwrap();
    assert_eq!(snapshot.error_message.as_deref(), Some(ALL_PAGES_FAILED));
}

#[tokio::test]
async fn unreadable_document_fails_before_any_page_work() {
    let h = harness(3);
    let job = h
        .run(NewJob::new("notes.pdf", b"PK\x03\x04 this is a zip".to_vec()))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.pages_processed, 0);
    assert_eq!(job.page_count, None);
    assert!(job.error_message.contains("not a valid PDF"), "{}", job.error_message);
    assert!(job.processing_time_secs.is_some());
    assert_eq!(h.raster.calls.load(Ordering::SeqCst), 0);
    assert!(h.script.take_calls().is_empty());
}

#[tokio::test]
async fn unknown_backend_fails_before_rasterisation() {
    let h = harness_with(Settings::builder().backend("Anthropic").build().unwrap(), 3);
    let job = h.convert().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.contains("'anthropic'"), "{}", job.error_message);
    assert_eq!(job.vision_backend, "anthropic");
    assert_eq!(job.page_count, None);
    assert_eq!(h.raster.calls.load(Ordering::SeqCst), 0);
    assert!(h.script.built.lock().unwrap().is_empty());
}

#[tokio::test]
async fn retry_resumes_only_failed_pages_and_splices_results() {
    let h = harness(6);
    h.script.fail(1, 1);
    h.script.fail(4, 1);
    let first = h.convert().await;

    assert_eq!(first.status, JobStatus::PartialSuccess);
    assert_eq!(
        first.failed_pages.iter().map(|f| f.page).collect::<Vec<_>>(),
        vec![2, 5]
    );
    assert_eq!(h.script.take_calls(), vec![0, 1, 2, 3, 4, 5]);
    h.store.take_progress();

    let outcome = h.manager.retry(first.id).await.unwrap();
    assert_eq!(outcome.plan, RetryPlan::FailedPagesOnly);
    assert_eq!(outcome.job.id, first.id);
    outcome.job.wait().await.unwrap();

    let after = h.manager.job(first.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Success);
    assert!(after.failed_pages.is_empty());
    assert_eq!(h.script.take_calls(), vec![1, 4]);

    for i in [0, 2, 3, 5] {
        assert_eq!(after.page_results[i], first.page_results[i], "page {}", i + 1);
    }
    for i in [1, 4] {
        assert!(after.page_results[i].starts_with(&format!("# Page {}", i + 1)));
    }

    assert_monotonic(&h.store.take_progress(), 4, 6);
    assert_eq!(after.pages_processed, 6);

    let md = String::from_utf8(h.manager.markdown(first.id).await.unwrap().bytes).unwrap();
    assert_eq!(md, after.page_results.join("\n\n"));
    assert_eq!(count_failed_markers(&md), 0);
}

#[tokio::test]
async fn page_failing_again_stays_in_failure_list() {
    let h = harness(4);
    h.script.fail(0, 1);
    h.script.fail(2, 2);
    let first = h.convert().await;
    assert_eq!(first.failed_pages.len(), 2);

    let outcome = h.manager.retry(first.id).await.unwrap();
    outcome.job.wait().await.unwrap();
    let after = h.manager.job(first.id).await.unwrap();

    assert_eq!(after.status, JobStatus::PartialSuccess);
    assert_eq!(
        after.failed_pages,
        vec![PageFailure {
            page: 3,
            error: "HTTP 500 on page 3".into()
        }]
    );
    assert!(after.page_results[0].starts_with("# Page 1"));
    assert_eq!(after.page_results[2], failed_page_placeholder(3));
}

#[tokio::test]
async fn full_run_progress_counts_every_page() {
    let h = harness(5);
    h.script.fail(3, 1);
    let job = h.convert().await;

    assert_eq!(job.pages_processed, 5);
    assert_monotonic(&h.store.take_progress(), 0, 5);
}

#[tokio::test]
async fn retry_without_stored_pages_starts_a_new_job() {
    let h = harness(2);
    h.raster.fail_next.store(true, Ordering::SeqCst);
    let first = h.convert().await;
    assert_eq!(first.status, JobStatus::Failed);
    assert!(first.error_message.contains("xref table damaged"));
    assert!(first.page_results.is_empty());

    let outcome = h.manager.retry(first.id).await.unwrap();
    assert_eq!(outcome.plan, RetryPlan::NewJob);
    assert_ne!(outcome.job.id, first.id);
    let new_id = outcome.job.wait().await.unwrap();

    let fresh = h.manager.job(new_id).await.unwrap();
    assert_eq!(fresh.status, JobStatus::Success);
    assert_eq!(fresh.original_filename, first.original_filename);
    assert_eq!(fresh.prompt, first.prompt);
    assert_eq!(fresh.page_range, first.page_range);
    assert_ne!(fresh.source_path, first.source_path);

    let old = h.manager.job(first.id).await.unwrap();
    assert_eq!(old.status, JobStatus::Failed);
}

#[tokio::test]
async fn retry_of_successful_job_is_a_new_job() {
    let h = harness(2);
    let first = h.convert().await;
    let outcome = h.manager.retry(first.id).await.unwrap();
    assert_eq!(outcome.plan, RetryPlan::NewJob);
    outcome.job.wait().await.unwrap();
}

#[tokio::test]
async fn changed_page_count_blocks_splicing() {
    let h = harness(6);
    h.script.fail(5, 1);
    let first = h.convert().await;
    assert_eq!(first.status, JobStatus::PartialSuccess);

    h.raster.pages.store(5, Ordering::SeqCst);
    let outcome = h.manager.retry(first.id).await.unwrap();
    assert_eq!(outcome.plan, RetryPlan::FailedPagesOnly);
    outcome.job.wait().await.unwrap();

    let after = h.manager.job(first.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Failed);
    assert!(after.error_message.contains("start a new conversion"), "{}", after.error_message);
    assert!(after.page_results.is_empty());

    let next = h.manager.retry(first.id).await.unwrap();
    assert_eq!(next.plan, RetryPlan::NewJob);
    next.job.wait().await.unwrap();
}

#[tokio::test]
async fn unfinished_job_cannot_be_retried() {
    let h = harness(2);
    let mut job = Job::new(
        JobId::new(),
        "stuck.pdf",
        "/nowhere/stuck.pdf".into(),
        "p",
        PageRange::ALL,
    );
    job.status = JobStatus::Processing;
    let id = job.id;
    h.store.insert(job).await.unwrap();

    assert!(matches!(
        h.manager.retry(id).await,
        Err(PagewiseError::NotRetryable { status: JobStatus::Processing, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_start_a_single_resume_run() {
    let h = harness(6);
    h.script.fail(1, 1);
    let first = h.convert().await;
    assert_eq!(first.status, JobStatus::PartialSuccess);
    h.script.take_calls();
    h.store.take_progress();

    let gate = h.script.hold();
    let attempts: Vec<_> = (0..2)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.retry(first.id).await })
        })
        .collect();

    let mut started = Vec::new();
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(outcome) => started.push(outcome),
            Err(PagewiseError::NotRetryable { status, .. }) => {
                assert_eq!(status, JobStatus::Processing);
                rejected += 1;
            }
            Err(e) => panic!("unexpected retry error: {e}"),
        }
    }
    assert_eq!(started.len(), 1);
    assert_eq!(rejected, 1);
    assert_eq!(started[0].plan, RetryPlan::FailedPagesOnly);

    gate.add_permits(16);
    started.pop().unwrap().job.wait().await.unwrap();

    let after = h.manager.job(first.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Success);
    assert_eq!(h.script.take_calls(), vec![1]);
    assert_monotonic(&h.store.take_progress(), 5, 6);
}

#[tokio::test]
async fn pending_job_can_be_reset_and_retried() {
    let h = harness(3);
    h.script.fail(2, 1);
    let first = h.convert().await;
    assert_eq!(first.status, JobStatus::PartialSuccess);

    // A run that never got past `pending` before the process went away.
    h.store
        .update(first.id, JobUpdate::default().status(JobStatus::Pending))
        .await
        .unwrap();
    assert!(matches!(
        h.manager.retry(first.id).await,
        Err(PagewiseError::NotRetryable { status: JobStatus::Pending, .. })
    ));

    let dry = h.manager.reset_stuck(&[first.id], true).await.unwrap();
    assert_eq!(dry.reset, vec![first.id]);
    assert_eq!(h.manager.job(first.id).await.unwrap().status, JobStatus::Pending);

    let report = h.manager.reset_stuck(&[], false).await.unwrap();
    assert_eq!(report.reset, vec![first.id]);
    assert!(report.not_stuck.is_empty());
    let snapshot = h.manager.status(first.id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error_message.as_deref(), Some(STUCK_MESSAGE));

    let outcome = h.manager.retry(first.id).await.unwrap();
    assert_eq!(outcome.plan, RetryPlan::FailedPagesOnly);
    outcome.job.wait().await.unwrap();
    let after = h.manager.job(first.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Success);
    assert_eq!(after.error_message, "");
}

#[tokio::test]
async fn page_range_and_prompt_are_honoured() {
    let h = harness(10);
    let job = h
        .run(
            NewJob::new("book.pdf", PDF.to_vec())
                .prompt("Only the tables")
                .page_range(PageRange::new(3, 5)),
        )
        .await;

    assert_eq!(job.prompt, "Only the tables");
    assert_eq!(job.page_count, Some(3));
    assert!(job.page_results[0].contains("png-of-page-3"));
    assert!(job.page_results[2].contains("png-of-page-5"));
}

#[tokio::test]
async fn blank_prompt_uses_default() {
    let h = harness(1);
    let job = h.run(NewJob::new("a.pdf", PDF.to_vec()).prompt("  ")).await;
    assert_eq!(job.prompt, prompts::DEFAULT_PROMPT);
}

#[tokio::test]
async fn upload_limit_is_enforced() {
    let h = harness_with(Settings::builder().max_upload_bytes(8).build().unwrap(), 1);
    let err = h
        .manager
        .create_job(NewJob::new("big.pdf", PDF.to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, PagewiseError::UploadTooLarge { limit: 8, .. }));
    assert!(h.manager.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn settings_override_selects_backend_for_next_run() {
    let h = harness(1);
    h.manager
        .save_settings_override(&SettingsOverride {
            backend: "gemini".into(),
            openai_model: String::new(),
            gemini_model: "gemini-2.5-pro".into(),
        })
        .await
        .unwrap();

    let job = h.convert().await;
    assert_eq!(job.vision_backend, "gemini");
    assert_eq!(job.vision_model, "gemini-2.5-pro");
    assert_eq!(
        *h.script.built.lock().unwrap(),
        vec![(Backend::Gemini, "gemini-2.5-pro".to_string())]
    );
    assert!(job.page_results[0].ends_with("via gemini-2.5-pro"));

    let bad = SettingsOverride {
        backend: "ollama".into(),
        ..Default::default()
    };
    assert!(matches!(
        h.manager.save_settings_override(&bad).await,
        Err(PagewiseError::UnknownBackend(_))
    ));
}

#[tokio::test]
async fn history_search_and_delete() {
    let h = harness(1);
    let a = h.run(NewJob::new("Invoice-2024.pdf", PDF.to_vec())).await;
    let b = h.run(NewJob::new("contract.pdf", PDF.to_vec())).await;

    let all = h.manager.list_jobs(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, b.id, "newest first");

    let hits = h.manager.list_jobs(Some("invoice")).await.unwrap();
    assert_eq!(hits.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id]);

    let removed = h.manager.delete_jobs(&[a.id, JobId::new()]).await.unwrap();
    assert_eq!(removed, vec![a.id]);
    assert!(!a.source_path.exists());
    assert!(!a.output_path.unwrap().exists());
    assert!(matches!(
        h.manager.status(a.id).await,
        Err(PagewiseError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn cleanup_removes_only_old_jobs() {
    let h = harness(1);
    let old = h.convert().await;
    let recent = h.convert().await;

    let mut aged = old.clone();
    aged.created_at -= chrono::Duration::days(40);
    h.store.insert(aged).await.unwrap();

    let preview = h.manager.cleanup_older_than(30, true).await.unwrap();
    assert_eq!(preview.iter().map(|j| j.id).collect::<Vec<_>>(), vec![old.id]);
    assert!(h.manager.job(old.id).await.is_ok());

    let deleted = h.manager.cleanup_older_than(30, false).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert!(h.manager.job(old.id).await.is_err());
    assert!(h.manager.job(recent.id).await.is_ok());
}

#[tokio::test]
async fn reset_stuck_marks_processing_jobs_failed() {
    let h = harness(1);
    let done = h.convert().await;

    let mut stuck = Job::new(
        JobId::new(),
        "stuck.pdf",
        "/nowhere/stuck.pdf".into(),
        "p",
        PageRange::ALL,
    );
    stuck.status = JobStatus::Processing;
    let stuck_id = stuck.id;
    h.store.insert(stuck).await.unwrap();
    let missing = JobId::new();

    let dry = h
        .manager
        .reset_stuck(&[stuck_id, done.id, missing], true)
        .await
        .unwrap();
    assert_eq!(dry.reset, vec![stuck_id]);
    assert_eq!(dry.not_stuck, vec![done.id]);
    assert_eq!(dry.not_found, vec![missing]);
    assert_eq!(
        h.manager.job(stuck_id).await.unwrap().status,
        JobStatus::Processing
    );

    let report = h.manager.reset_stuck(&[], false).await.unwrap();
    assert_eq!(report.reset, vec![stuck_id]);
    let snapshot = h.manager.status(stuck_id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error_message.as_deref(), Some(STUCK_MESSAGE));
}

#[tokio::test]
async fn jobs_persist_in_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    let manager = JobManager::new(
        Settings::default(),
        Arc::new(FileJobStore::open(dir.path()).unwrap()),
        ArtifactStore::new(dir.path()),
        Arc::new(FakeRasterizer {
            pages: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }),
        Arc::new(ScriptedFactory { script }),
    );

    let id = manager
        .create_job(NewJob::new("scan.pdf", PDF.to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let reopened = FileJobStore::open(dir.path()).unwrap();
    let job = reopened.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.page_results.len(), 2);
    assert!(dir.path().join("jobs").join(format!("{id}.json")).exists());
}
