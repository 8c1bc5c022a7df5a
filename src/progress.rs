//! Progress-callback trait for orchestrator runs.
//!
//! The orchestrator reports through a [`PageProgress`] implementation and
//! never touches the job record itself. The job manager plugs in a counter
//! that persists `pages_processed`; tests plug in recorders; a plain closure
//! `Fn(usize)` works too.
//!
//! # Example
//!
//! ```rust
//! use pagewise::PageProgress;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let done = AtomicUsize::new(0);
//! let cb = |_page_index: usize| {
//!     done.fetch_add(1, Ordering::SeqCst);
//! };
//! cb.on_page_done(3);
//! assert_eq!(done.load(Ordering::SeqCst), 1);
//! ```

use std::sync::Arc;

/// Called by the orchestrator as a run progresses.
///
/// Implementations must be `Send + Sync` and protect shared mutable state
/// themselves: nothing guarantees callbacks arrive from a single thread.
/// All methods except [`on_page_done`](PageProgress::on_page_done) have
/// no-op defaults.
pub trait PageProgress: Send + Sync {
    /// Called once before any call is dispatched.
    ///
    /// # Arguments
    /// * `selected`: number of pages this run will transcribe
    fn on_run_start(&self, _selected: usize) {}

    /// Called exactly once per finished page, success or failure, in
    /// completion order.
    ///
    /// # Arguments
    /// * `page_index`: 0-based index into the rasterised pages
    fn on_page_done(&self, page_index: usize);

    /// Called once after every selected page has finished.
    ///
    /// # Arguments
    /// * `selected`: pages attempted
    /// * `failed`  : pages that ended in a failure placeholder
    fn on_run_complete(&self, _selected: usize, _failed: usize) {}
}

impl<F> PageProgress for F
where
    F: Fn(usize) + Send + Sync,
{
    fn on_page_done(&self, page_index: usize) {
        self(page_index)
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl PageProgress for NoopProgress {
    fn on_page_done(&self, _page_index: usize) {}
}

/// Convenience alias for a shared progress sink.
pub type ProgressCallback = Arc<dyn PageProgress>;
