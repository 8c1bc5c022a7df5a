//! Pipeline stages for page-level transcription.
//!
//! Each submodule implements one step of a run. The job manager strings them
//! together; none of them reads or writes a job record.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ orchestrate ──▶ transcribe ──▶ postprocess
//! (URL/path) (pdfium)  (base64)   (worker pool)   (VLM call)     (optional)
//! ```
//!
//! 1. [`input`]: load a local file or download a URL (CLI only)
//! 2. [`render`]: rasterise the selected pages; blocking, so it runs on
//!    tokio's blocking pool
//! 3. [`encode`]: PNG-encode and base64-wrap each rendered page
//! 4. [`orchestrate`]: bounded concurrent fan-out, order-stable results,
//!    failure placeholders, progress events
//! 5. [`transcribe`]: per-provider request shape and the provider call
//! 6. [`postprocess`]: opt-in cleanup of successful page text

pub mod encode;
pub mod input;
pub mod orchestrate;
pub mod postprocess;
pub mod render;
pub mod transcribe;
