//! Prompt text and fixed-format markers.
//!
//! Every string a provider or a downstream reader depends on lives here, so
//! the placeholder format in particular has exactly one definition: the
//! orchestrator writes it, assembly preserves it, and callers count it.

/// Prompt used when a job is created without one.
pub const DEFAULT_PROMPT: &str = "Transcribe the information in this document in Markdown format. \
Keep the language of the file. \
Ignore the letterhead and the footer of the document.";

/// User-turn instruction sent alongside the page image on the OpenAI backend.
///
/// The job prompt travels as the system message there; OpenAI still needs a
/// user turn to answer.
pub const OPENAI_USER_INSTRUCTION: &str =
    "Transcribe the information in this document in Markdown format";

/// Separator between page slots in the assembled document.
pub const PAGE_JOINER: &str = "\n\n";

/// Error message for a run in which every page failed.
pub const ALL_PAGES_FAILED: &str = "All pages failed transcription.";

/// Error message written by [`crate::manager::JobManager::reset_stuck`].
pub const STUCK_MESSAGE: &str =
    "Processing was interrupted or stuck. Use Retry to try again.";

/// The marker line for a failed page (1-based `page_num`).
pub fn failed_page_marker(page_num: usize) -> String {
    format!("<!-- [Page {page_num}: transcription failed] -->")
}

/// The full slot text stored for a failed page.
pub fn failed_page_placeholder(page_num: usize) -> String {
    format!("\n\n{}\n\n", failed_page_marker(page_num))
}

/// Number of failed-page markers in an assembled document.
pub fn count_failed_markers(markdown: &str) -> usize {
    markdown
        .match_indices("<!-- [Page ")
        .filter(|(at, _)| {
            markdown[*at..]
                .split_once("-->")
                .is_some_and(|(inner, _)| inner.ends_with(": transcription failed] "))
        })
        .count()
}
