//! Error types for the pagewise library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`PagewiseError`]: **Fatal**: a run or a boundary call cannot proceed
//!   (unknown backend, unreadable document, missing job). A run that hits one
//!   of these ends with the job in `failed` and the error's `Display` text
//!   stored as the job's error message.
//!
//! * [`DocumentError`]: the subset of fatal errors caused by the source
//!   document itself. Wrapped by [`PagewiseError::Document`].
//!
//! * [`TranscriptionError`]: **Non-fatal**: one page's provider call failed.
//!   The orchestrator records it in the failure list and keeps going; it is
//!   never converted into a [`PagewiseError`] inside a run.

use crate::job::{JobId, JobStatus};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pagewise library.
#[derive(Debug, Error)]
pub enum PagewiseError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// The configured backend key is not one of the supported providers.
    #[error("Unknown vision backend '{0}' (expected 'openai' or 'gemini')")]
    UnknownBackend(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The selected provider could not be initialised (missing API key etc.).
    #[error("Vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Document errors ───────────────────────────────────────────────────
    #[error(transparent)]
    Document(#[from] DocumentError),

    // ── Input errors ──────────────────────────────────────────────────────
    /// HTTP download of a URL input failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// HTTP download timed out.
    #[error("Download of '{url}' timed out after {secs}s")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Boundary errors ───────────────────────────────────────────────────
    /// No job record exists for the given id.
    #[error("Job '{0}' not found")]
    JobNotFound(JobId),

    /// The uploaded document exceeds the configured size limit.
    #[error("Document is {size} bytes, above the {limit}-byte upload limit")]
    UploadTooLarge { size: usize, limit: usize },

    /// Retry was requested for a job that has not finished yet.
    #[error("Job '{id}' is {status}; only finished jobs can be retried")]
    NotRetryable { id: JobId, status: JobStatus },

    /// The requested artifact does not exist for the job's current state.
    #[error("{what} is not available for job '{id}'")]
    ArtifactUnavailable { id: JobId, what: &'static str },

    // ── Unexpected errors ─────────────────────────────────────────────────
    /// A retry-only run rasterised a different number of pages than stored.
    #[error("Document now yields {actual} pages but the stored result has {expected}; start a new conversion")]
    PageCountMismatch { expected: usize, actual: usize },

    /// Reading or writing a job record or artifact failed.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A job record could not be (de)serialised.
    #[error("Malformed job record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PagewiseError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PagewiseError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// The source document cannot be opened, parsed or rendered.
///
/// Never retryable: the same bytes fail the same way on the next run.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}' (first bytes: {magic:?})")]
    NotAPdf { path: PathBuf, magic: Vec<u8> },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// PDF requires a password but none (or the wrong one) was provided.
    #[error("PDF '{path}' is encrypted and requires a valid password")]
    PasswordRequired { path: PathBuf },

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The rendered bitmap could not be PNG-encoded.
    #[error("Image encoding failed for page {page}: {detail}")]
    EncodeFailed { page: usize, detail: String },
}

/// A non-fatal error for a single page's transcription call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptionError {
    /// The provider call failed (transport, auth, rate limit, malformed response).
    #[error("{0}")]
    Provider(String),

    /// The call did not finish within the configured per-call timeout.
    #[error("transcription timed out after {secs}s")]
    Timeout { secs: u64 },
}
