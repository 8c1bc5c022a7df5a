//! Concurrent page transcription with order-stable results.
//!
//! [`transcribe_pages`] fans one backend call per selected page out over a
//! bounded pool (`buffer_unordered(max_workers)`), collects each call as it
//! finishes, and writes it into a slot fixed by the page's position in the
//! selection. Completion order decides only *when* progress fires, never
//! where a result lands.
//!
//! A failed page never aborts the batch: its slot gets the placeholder from
//! [`crate::prompts::failed_page_placeholder`] and a [`PageFailure`] is
//! recorded. The orchestrator never retries a page either; a caller that
//! wants another attempt runs it again with `restrict_to` set to the failed
//! indices.
//!
//! Each call runs in its own tokio task, so calls proceed in parallel on a
//! multi-threaded runtime and a panicking backend costs one page, not the run.

use crate::config::Settings;
use crate::error::TranscriptionError;
use crate::job::PageFailure;
use crate::pipeline::encode::PageImage;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::transcribe::PageTranscriber;
use crate::progress::PageProgress;
use crate::prompts::{failed_page_placeholder, PAGE_JOINER};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-run orchestration knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum provider calls in flight. Values below 1 are treated as 1.
    pub max_workers: usize,
    /// Per-call timeout; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// Clean successful page text with [`clean_markdown`].
    pub clean_markdown: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            call_timeout: None,
            clean_markdown: false,
        }
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_workers: settings.max_workers,
            call_timeout: settings.call_timeout(),
            clean_markdown: settings.clean_markdown,
        }
    }
}

/// Output of one orchestrator run.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionRun {
    /// Processed page indices (0-based), ascending.
    pub indices: Vec<usize>,
    /// One entry per element of `indices`, same order.
    pub pages: Vec<String>,
    /// Failed pages, sorted by page number.
    pub failures: Vec<PageFailure>,
}

impl TranscriptionRun {
    /// `(page_index, text)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.indices
            .iter()
            .copied()
            .zip(self.pages.iter().map(String::as_str))
    }

    pub fn all_failed(&self) -> bool {
        !self.indices.is_empty() && self.failures.len() == self.indices.len()
    }
}

/// Join page slots into the final document.
pub fn assemble(pages: &[String]) -> String {
    pages.join(PAGE_JOINER)
}

/// Transcribe `images` (or only the indices in `restrict_to`) concurrently.
///
/// `restrict_to` is sorted and deduplicated; indices outside `images` are
/// skipped with a warning. `progress.on_page_done(index)` fires exactly once
/// per processed page, success or failure, in completion order.
pub async fn transcribe_pages(
    transcriber: Arc<dyn PageTranscriber>,
    images: &[PageImage],
    prompt: &str,
    options: &RunOptions,
    progress: Option<&dyn PageProgress>,
    restrict_to: Option<&[usize]>,
) -> TranscriptionRun {
    let indices = select_indices(images.len(), restrict_to);
    let selected = indices.len();
    let workers = options.max_workers.max(1);
    let start = Instant::now();
    info!(
        "Transcribing {} page(s) with {} worker(s)",
        selected, workers
    );

    if let Some(cb) = progress {
        cb.on_run_start(selected);
    }

    let prompt: Arc<str> = Arc::from(prompt);
    let timeout = options.call_timeout;
    let mut in_flight = stream::iter(indices.iter().copied().enumerate())
        .map(|(slot, index)| {
            let transcriber = Arc::clone(&transcriber);
            let prompt = Arc::clone(&prompt);
            let image = images[index].clone();
            async move {
                let handle = tokio::spawn(async move {
                    call_page(transcriber.as_ref(), &image, &prompt, timeout).await
                });
                let outcome = handle.await.unwrap_or_else(|e| {
                    Err(TranscriptionError::Provider(format!(
                        "transcription worker aborted: {e}"
                    )))
                });
                (slot, index, outcome)
            }
        })
        .buffer_unordered(workers);

    let mut slots: Vec<Option<String>> = vec![None; selected];
    let mut failures = Vec::new();

    while let Some((slot, index, outcome)) = in_flight.next().await {
        let page_num = index + 1;
        match outcome {
            Ok(text) => {
                debug!("Page {} transcribed ({} chars)", page_num, text.len());
                slots[slot] = Some(if options.clean_markdown {
                    clean_markdown(&text)
                } else {
                    text
                });
            }
            Err(e) => {
                let mut error = e.to_string();
                if error.trim().is_empty() {
                    error = "transcription failed".to_string();
                }
                warn!("Page {} transcription failed: {}", page_num, error);
                failures.push(PageFailure {
                    page: page_num,
                    error,
                });
                slots[slot] = Some(failed_page_placeholder(page_num));
            }
        }

        if let Some(cb) = progress {
            cb.on_page_done(index);
        }
    }
    drop(in_flight);

    failures.sort_by_key(|f| f.page);
    if let Some(cb) = progress {
        cb.on_run_complete(selected, failures.len());
    }
    info!(
        "Transcribed {}/{} page(s) in {:?}",
        selected - failures.len(),
        selected,
        start.elapsed()
    );

    let pages = slots
        .into_iter()
        .zip(&indices)
        .map(|(slot, index)| slot.unwrap_or_else(|| failed_page_placeholder(index + 1)))
        .collect();

    TranscriptionRun {
        indices,
        pages,
        failures,
    }
}

fn select_indices(available: usize, restrict_to: Option<&[usize]>) -> Vec<usize> {
    match restrict_to {
        None => (0..available).collect(),
        Some(wanted) => {
            let mut indices: Vec<usize> = wanted
                .iter()
                .copied()
                .filter(|&i| {
                    let ok = i < available;
                    if !ok {
                        warn!("Skipping page index {} (only {} pages)", i, available);
                    }
                    ok
                })
                .collect();
            indices.sort_unstable();
            indices.dedup();
            indices
        }
    }
}

async fn call_page(
    transcriber: &dyn PageTranscriber,
    image: &PageImage,
    prompt: &str,
    timeout: Option<Duration>,
) -> Result<String, TranscriptionError> {
    match timeout {
        None => transcriber.transcribe_page(image, prompt).await,
        Some(limit) => tokio::time::timeout(limit, transcriber.transcribe_page(image, prompt))
            .await
            .unwrap_or(Err(TranscriptionError::Timeout {
                secs: limit.as_secs(),
            })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Per-page scripted outcome with a delay, to control completion order.
    #[derive(Default)]
    struct Scripted {
        delays_ms: HashMap<usize, u64>,
        failures: HashMap<usize, String>,
        panics: Vec<usize>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn delay(mut self, index: usize, ms: u64) -> Self {
            self.delays_ms.insert(index, ms);
            self
        }

        fn fail(mut self, index: usize, msg: &str) -> Self {
            self.failures.insert(index, msg.to_string());
            self
        }
    }

    #[async_trait]
    impl PageTranscriber for Scripted {
        async fn transcribe_page(
            &self,
            image: &PageImage,
            prompt: &str,
        ) -> Result<String, TranscriptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let ms = self.delays_ms.get(&image.index).copied().unwrap_or(5);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panics.contains(&image.index) {
                panic!("backend exploded");
            }
            match self.failures.get(&image.index) {
                Some(msg) => Err(TranscriptionError::Provider(msg.clone())),
                None => Ok(format!("{prompt} #{}", image.page_num())),
            }
        }
    }

    fn images(n: usize) -> Vec<PageImage> {
        (0..n)
            .map(|index| PageImage {
                index,
                base64_png: format!("img{index}"),
            })
            .collect()
    }

    fn opts(workers: usize) -> RunOptions {
        RunOptions {
            max_workers: workers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn results_follow_index_order_not_completion_order() {
        let t = Scripted::default().delay(0, 60).delay(1, 30).delay(2, 1);
        let order = Mutex::new(Vec::new());
        let cb = |idx: usize| order.lock().unwrap().push(idx);

        let run = transcribe_pages(Arc::new(t), &images(3), "p", &opts(3), Some(&cb), None).await;

        assert_eq!(run.indices, vec![0, 1, 2]);
        assert_eq!(run.pages, vec!["p #1", "p #2", "p #3"]);
        assert!(run.failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn failed_page_gets_placeholder_and_failure_entry() {
        let t = Scripted::default().fail(1, "HTTP 500");
        let run = transcribe_pages(Arc::new(t), &images(3), "p", &opts(2), None, None).await;

        assert_eq!(run.pages.len(), 3);
        assert_eq!(run.pages[0], "p #1");
        assert_eq!(run.pages[1], failed_page_placeholder(2));
        assert_eq!(run.pages[2], "p #3");
        assert_eq!(
            run.failures,
            vec![PageFailure {
                page: 2,
                error: "HTTP 500".into()
            }]
        );
        assert!(!run.all_failed());
    }

    #[tokio::test]
    async fn empty_error_message_gets_generic_text() {
        let t = Scripted::default().fail(0, "");
        let run = transcribe_pages(Arc::new(t), &images(1), "p", &opts(1), None, None).await;
        assert_eq!(run.failures[0].error, "transcription failed");
        assert!(run.all_failed());
    }

    #[tokio::test]
    async fn progress_fires_once_per_page_including_failures() {
        let t = Scripted::default().fail(0, "a").fail(3, "b");
        let hits = AtomicUsize::new(0);
        let cb = |_idx: usize| {
            hits.fetch_add(1, Ordering::SeqCst);
        };

        let run = transcribe_pages(Arc::new(t), &images(5), "p", &opts(2), Some(&cb), None).await;

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(run.failures.len(), 2);
        assert_eq!(run.failures[0].page, 1);
        assert_eq!(run.failures[1].page, 4);
    }

    #[tokio::test]
    async fn restricted_run_only_calls_selected_pages() {
        let t = Arc::new(Scripted::default().delay(4, 40));
        let seen = Mutex::new(Vec::new());
        let cb = |idx: usize| seen.lock().unwrap().push(idx);

        let run = transcribe_pages(
            t.clone(),
            &images(6),
            "p",
            &opts(4),
            Some(&cb),
            Some(&[4, 1, 4, 9]),
        )
        .await;

        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.indices, vec![1, 4]);
        assert_eq!(run.pages, vec!["p #2", "p #5"]);
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 4]);
        assert_eq!(run.iter().collect::<Vec<_>>(), vec![(1, "p #2"), (4, "p #5")]);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let mut t = Scripted::default();
        for i in 0..8 {
            t = t.delay(i, 20);
        }
        let t = Arc::new(t);

        transcribe_pages(t.clone(), &images(8), "p", &opts(2), None, None).await;

        assert_eq!(t.calls.load(Ordering::SeqCst), 8);
        assert!(t.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(t.max_in_flight.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn zero_workers_still_makes_progress() {
        let run = transcribe_pages(
            Arc::new(Scripted::default()),
            &images(2),
            "p",
            &opts(0),
            None,
            None,
        )
        .await;
        assert_eq!(run.pages.len(), 2);
    }

    #[tokio::test]
    async fn slow_call_times_out_as_page_failure() {
        let t = Scripted::default().delay(1, 5_000);
        let options = RunOptions {
            max_workers: 2,
            call_timeout: Some(Duration::from_millis(50)),
            clean_markdown: false,
        };

        let run = transcribe_pages(Arc::new(t), &images(2), "p", &options, None, None).await;

        assert_eq!(run.pages[0], "p #1");
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].page, 2);
        assert!(run.failures[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_backend_costs_one_page() {
        let t = Scripted {
            panics: vec![0],
            ..Default::default()
        };
        let run = transcribe_pages(Arc::new(t), &images(2), "p", &opts(2), None, None).await;

        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].page, 1);
        assert_eq!(run.pages[1], "p #2");
    }

    #[tokio::test]
    async fn same_inputs_give_same_ordering() {
        let first = transcribe_pages(
            Arc::new(Scripted::default().delay(0, 30)),
            &images(4),
            "p",
            &opts(4),
            None,
            None,
        )
        .await;
        let second = transcribe_pages(
            Arc::new(Scripted::default().delay(3, 30)),
            &images(4),
            "p",
            &opts(4),
            None,
            None,
        )
        .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cleanup_applies_to_successful_pages_only() {
        struct Fenced;

        #[async_trait]
        impl PageTranscriber for Fenced {
            async fn transcribe_page(
                &self,
                image: &PageImage,
                _prompt: &str,
            ) -> Result<String, TranscriptionError> {
                if image.index == 1 {
                    return Err(TranscriptionError::Provider("nope".into()));
                }
                Ok("```markdown\n# Title   \n```".to_string())
            }
        }

        let options = RunOptions {
            clean_markdown: true,
            ..opts(2)
        };
        let run = transcribe_pages(Arc::new(Fenced), &images(2), "p", &options, None, None).await;
        assert_eq!(run.pages[0], "# Title");
        assert_eq!(run.pages[1], failed_page_placeholder(2));
    }

    #[test]
    fn assemble_joins_with_blank_line() {
        let pages = vec!["a".to_string(), failed_page_placeholder(2), "c".to_string()];
        assert_eq!(
            assemble(&pages),
            "a\n\n\n\n<!-- [Page 2: transcription failed] -->\n\n\n\nc"
        );
    }
}
