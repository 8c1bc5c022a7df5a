//! Input resolution: turn a user-supplied path or URL into document bytes.
//!
//! The job manager takes ownership of the bytes and stores its own copy, so
//! unlike a one-shot converter nothing here has to outlive the call: a URL is
//! downloaded straight into memory, a local file is read whole. Both paths
//! check the `%PDF` magic before handing the bytes over, so a bad input is
//! rejected before a job record exists.

use crate::error::{DocumentError, PagewiseError};
use crate::pipeline::render::check_document;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A document ready to be submitted as a job.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Name shown to users and used to derive the Markdown filename.
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load `input` from disk, or download it when it is an `http(s)` URL.
pub async fn fetch_document(input: &str, timeout_secs: u64) -> Result<FetchedDocument, PagewiseError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<FetchedDocument, PagewiseError> {
    check_document(path)?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PagewiseError::storage(path, e))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());
    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(FetchedDocument { filename, bytes })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<FetchedDocument, PagewiseError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PagewiseError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PagewiseError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PagewiseError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(PagewiseError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PagewiseError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .to_vec();

    check_magic(url, &bytes)?;
    info!("Downloaded {} bytes from {}", bytes.len(), url);

    Ok(FetchedDocument {
        filename: filename_from_url(url),
        bytes,
    })
}

fn check_magic(source: &str, bytes: &[u8]) -> Result<(), DocumentError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(());
    }
    Err(DocumentError::NotAPdf {
        path: PathBuf::from(source),
        magic: bytes.iter().take(4).copied().collect(),
    })
}

/// Last path segment of `url` when it looks like a filename.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}
