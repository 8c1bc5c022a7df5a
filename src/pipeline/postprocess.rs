//! Optional cleanup of provider-generated page text.
//!
//! Vision models sometimes wrap a perfectly good transcription in a
//! ```` ```markdown ```` fence, emit CRLF line endings, or sprinkle zero-width
//! characters through the text. When [`crate::Settings::clean_markdown`] is
//! on, each successful page passes through [`clean_markdown`] before it is
//! stored. Failed-page placeholders never do.
//!
//! Cleanup is per page, so it must not add or strip the blank lines that
//! separate pages; assembly owns those.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply the cleanup rules in order:
///
/// 1. Unwrap a single outer code fence around the whole page
/// 2. CRLF / CR → LF
/// 3. Trim trailing whitespace on every line
/// 4. Squeeze runs of blank lines to one blank line
/// 5. Drop invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 6. Trim leading and trailing blank space of the page
pub fn clean_markdown(page: &str) -> String {
    let s = unwrap_outer_fence(page);
    let s = unify_newlines(&s);
    let s = trim_line_ends(&s);
    let s = squeeze_blank_lines(&s);
    let s = drop_invisible(&s);
    s.trim().to_string()
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```$").unwrap());

fn unwrap_outer_fence(page: &str) -> String {
    let trimmed = page.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        // A fence inside the body means the outer ticks belong to real code.
        Some(caps) if !caps[1].contains("\n```") => caps[1].to_string(),
        _ => page.to_string(),
    }
}

fn unify_newlines(page: &str) -> String {
    page.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_line_ends(page: &str) -> String {
    page.split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn squeeze_blank_lines(page: &str) -> String {
    RE_BLANK_RUN.replace_all(page, "\n\n").into_owned()
}

const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}',
];

fn drop_invisible(page: &str) -> String {
    page.chars().filter(|c| !INVISIBLE.contains(c)).collect()
}
