//! # pagewise
//!
//! Page-level PDF-to-Markdown transcription jobs backed by Vision Language
//! Models (VLMs).
//!
//! Each page is rasterised to a PNG and transcribed by a vision model on its
//! own, concurrently with the other pages. The results are stitched back
//! together in page order. A page that fails does not sink the document: it
//! becomes a placeholder comment, and a later retry can re-run only those
//! pages and splice the new text into the stored result.
//!
//! ## Pipeline Overview
//!
//! ```text
//! create_job ─▶ pending
//!                  │  background task
//!                  ├─ 1. Config     settings + override → backend (fails closed)
//!                  ├─ 2. Render     pdfium → PNG → base64 (spawn_blocking)
//!                  ├─ 3. Transcribe bounded worker pool, one VLM call per page
//!                  ├─ 4. Assemble   index-ordered pages joined by a blank line
//!                  └─ 5. Persist    success | partial_success | failed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagewise::{JobManager, NewJob, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API keys come from OPENAI_API_KEY / GEMINI_API_KEY
//!     let manager = JobManager::open(Settings::default(), "./pagewise-data")?;
//!
//!     let bytes = std::fs::read("scan.pdf")?;
//!     let started = manager.create_job(NewJob::new("scan.pdf", bytes)).await?;
//!     let id = started.wait().await?;
//!
//!     let snapshot = manager.status(id).await?;
//!     println!("{}: {}/{:?} pages", snapshot.status, snapshot.pages_processed, snapshot.total_pages);
//!     if snapshot.status.has_output() {
//!         let md = manager.markdown(id).await?;
//!         std::fs::write(&md.filename, &md.bytes)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagewise` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when embedding the library:
//! ```toml
//! pagewise = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifacts::ArtifactStore;
pub use config::{resolve_effective, EffectiveConfig, Settings, SettingsBuilder, SettingsOverride};
pub use error::{DocumentError, PagewiseError, TranscriptionError};
pub use job::{Job, JobId, JobSnapshot, JobStatus, PageFailure, PageRange};
pub use manager::{Artifact, JobManager, NewJob, ResetReport, RetryOutcome, RetryPlan, StartedJob};
pub use pipeline::encode::PageImage;
pub use pipeline::orchestrate::{transcribe_pages, RunOptions, TranscriptionRun};
pub use pipeline::render::{PdfiumRasterizer, RasterizedPages, Rasterizer};
pub use pipeline::transcribe::{
    Backend, PageTranscriber, TranscriberFactory, VisionTranscriber, VisionTranscriberFactory,
};
pub use progress::{NoopProgress, PageProgress, ProgressCallback};
pub use store::{FileJobStore, JobFilter, JobStore, MemoryJobStore, Transition};
