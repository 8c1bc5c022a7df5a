//! The job record: one document-to-Markdown conversion request.
//!
//! A [`Job`] is owned and mutated by exactly one background run at a time
//! (see [`crate::manager`]). Every write goes through a [`JobUpdate`] that
//! names only the fields that changed, so a poller reading the record
//! concurrently never sees another field clobbered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, immutable job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle status.
///
/// ```text
/// pending ──▶ processing ──▶ success | partial_success | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Success,
    PartialSuccess,
    Failed,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Success,
        JobStatus::PartialSuccess,
        JobStatus::Failed,
    ];

    /// States a run can be interrupted in.
    pub const UNFINISHED: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::PartialSuccess | JobStatus::Failed
        )
    }

    /// Terminal states that carry a downloadable Markdown artifact.
    pub fn has_output(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::PartialSuccess)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested page range: 1-based inclusive `start`, `end == 0` meaning "last page".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl Default for PageRange {
    fn default() -> Self {
        Self::ALL
    }
}

impl PageRange {
    pub const ALL: PageRange = PageRange { start: 1, end: 0 };

    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Resolve against the actual document length into 0-based page indices.
    ///
    /// An empty or inverted result falls back to the whole document, so a
    /// document with at least one page never yields zero pages.
    pub fn resolve(&self, document_pages: usize) -> Range<usize> {
        let first = self.start.saturating_sub(1);
        let last = if self.end == 0 {
            document_pages
        } else {
            self.end.min(document_pages)
        };

        if first >= last {
            0..document_pages
        } else {
            first..last
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == 0 {
            write!(f, "{}-last", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One page whose transcription call raised an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    /// 1-based page number within the rasterised selection.
    pub page: usize,
    pub error: String,
}

/// The persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    // ── Input ────────────────────────────────────────────────────────────
    pub original_filename: String,
    pub source_path: PathBuf,
    pub prompt: String,
    pub page_range: PageRange,

    // ── Output ───────────────────────────────────────────────────────────
    pub output_path: Option<PathBuf>,

    // ── Progress / status ────────────────────────────────────────────────
    pub status: JobStatus,
    /// Set once rasterisation completes.
    pub page_count: Option<usize>,
    pub pages_processed: usize,
    pub error_message: String,
    /// Index-aligned with the rasterised pages; failed slots hold a placeholder.
    #[serde(default)]
    pub page_results: Vec<String>,
    /// Sorted by page number.
    #[serde(default)]
    pub failed_pages: Vec<PageFailure>,

    // ── Metadata ─────────────────────────────────────────────────────────
    pub vision_backend: String,
    pub vision_model: String,
    pub processing_time_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `pending` job.
    pub fn new(
        id: JobId,
        original_filename: impl Into<String>,
        source_path: PathBuf,
        prompt: impl Into<String>,
        page_range: PageRange,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            original_filename: original_filename.into(),
            source_path,
            prompt: prompt.into(),
            page_range,
            output_path: None,
            status: JobStatus::Pending,
            page_count: None,
            pages_processed: 0,
            error_message: String::new(),
            page_results: Vec::new(),
            failed_pages: Vec::new(),
            vision_backend: String::new(),
            vision_model: String::new(),
            processing_time_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Safe `.md` filename derived from the original document name.
    pub fn markdown_filename(&self) -> String {
        markdown_filename(&self.original_filename)
    }

    /// Whether a retry can re-run only the failed pages of this job.
    ///
    /// Requires a stored per-page array whose length matches the page count
    /// and at least one recorded failure.
    pub fn can_retry_failed_only(&self) -> bool {
        !self.page_results.is_empty()
            && !self.failed_pages.is_empty()
            && Some(self.page_results.len()) == self.page_count
    }

    /// 0-based indices of the failed pages, ascending.
    pub fn failed_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .failed_pages
            .iter()
            .filter(|f| f.page >= 1)
            .map(|f| f.page - 1)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Point-in-time status snapshot for pollers.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            status: self.status,
            total_pages: self.page_count,
            pages_processed: self.pages_processed,
            error_message: (self.status == JobStatus::Failed)
                .then(|| self.error_message.clone())
                .filter(|m| !m.is_empty()),
        }
    }
}

/// `report.final.pdf` → `report.final.md`, stem capped at 200 characters.
pub fn markdown_filename(original: &str) -> String {
    let stem = match original.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => original,
    };
    let stem: String = stem.chars().take(200).collect();
    format!("{stem}.md")
}

/// The cheap, repeatable answer to "how is my job doing?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub total_pages: Option<usize>,
    pub pages_processed: usize,
    /// Present only when `status == failed`.
    pub error_message: Option<String>,
}

/// A narrow write: only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub page_count: Option<Option<usize>>,
    pub pages_processed: Option<usize>,
    pub error_message: Option<String>,
    pub page_results: Option<Vec<String>>,
    pub failed_pages: Option<Vec<PageFailure>>,
    pub output_path: Option<Option<PathBuf>>,
    pub vision_backend: Option<String>,
    pub vision_model: Option<String>,
    pub processing_time_secs: Option<f64>,
}

impl JobUpdate {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page_count(mut self, count: usize) -> Self {
        self.page_count = Some(Some(count));
        self
    }

    pub fn pages_processed(mut self, n: usize) -> Self {
        self.pages_processed = Some(n);
        self
    }

    pub fn error_message(mut self, msg: impl Into<String>) -> Self {
        self.error_message = Some(msg.into());
        self
    }

    pub fn page_results(mut self, pages: Vec<String>) -> Self {
        self.page_results = Some(pages);
        self
    }

    pub fn failed_pages(mut self, failures: Vec<PageFailure>) -> Self {
        self.failed_pages = Some(failures);
        self
    }

    pub fn output_path(mut self, path: Option<PathBuf>) -> Self {
        self.output_path = Some(path);
        self
    }

    pub fn backend(mut self, backend: impl Into<String>, model: impl Into<String>) -> Self {
        self.vision_backend = Some(backend.into());
        self.vision_model = Some(model.into());
        self
    }

    pub fn processing_time_secs(mut self, secs: f64) -> Self {
        self.processing_time_secs = Some(secs);
        self
    }

    /// Apply the changed fields and bump `updated_at`.
    pub fn apply(self, job: &mut Job) {
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = self.page_count {
            job.page_count = v;
        }
        if let Some(v) = self.pages_processed {
            job.pages_processed = v;
        }
        if let Some(v) = self.error_message {
            job.error_message = v;
        }
        if let Some(v) = self.page_results {
            job.page_results = v;
        }
        if let Some(v) = self.failed_pages {
            job.failed_pages = v;
        }
        if let Some(v) = self.output_path {
            job.output_path = v;
        }
        if let Some(v) = self.vision_backend {
            job.vision_backend = v;
        }
        if let Some(v) = self.vision_model {
            job.vision_model = v;
        }
        if let Some(v) = self.processing_time_secs {
            job.processing_time_secs = Some(v);
        }
        job.updated_at = Utc::now();
    }
}
