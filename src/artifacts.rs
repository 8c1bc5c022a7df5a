//! Source documents and Markdown outputs on disk.
//!
//! ```text
//! <root>/uploads/<job-id>/<original filename>
//! <root>/outputs/<job-id>/<stem>.md
//! ```
//!
//! Each job owns one directory per kind, so deleting a job is two
//! `remove_dir_all` calls and two jobs with the same filename never collide.

use crate::error::PagewiseError;
use crate::job::JobId;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn uploads(&self, id: JobId) -> PathBuf {
        self.root.join("uploads").join(id.to_string())
    }

    fn outputs(&self, id: JobId) -> PathBuf {
        self.root.join("outputs").join(id.to_string())
    }

    /// Store the uploaded document for `id` and return its path.
    pub async fn save_source(
        &self,
        id: JobId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, PagewiseError> {
        let path = self.uploads(id).join(sanitize_filename(filename));
        write_file(&path, bytes).await?;
        debug!("Stored source for job {} at {}", id, path.display());
        Ok(path)
    }

    /// Copy an existing source document into `id`'s upload directory.
    pub async fn copy_source(
        &self,
        from: &Path,
        id: JobId,
        filename: &str,
    ) -> Result<PathBuf, PagewiseError> {
        let path = self.uploads(id).join(sanitize_filename(filename));
        create_parent(&path).await?;
        tokio::fs::copy(from, &path)
            .await
            .map_err(|e| PagewiseError::storage(from, e))?;
        Ok(path)
    }

    /// Write the assembled Markdown for `id` under `filename`.
    pub async fn write_markdown(
        &self,
        id: JobId,
        filename: &str,
        markdown: &str,
    ) -> Result<PathBuf, PagewiseError> {
        let path = self.outputs(id).join(sanitize_filename(filename));
        write_file(&path, markdown.as_bytes()).await?;
        debug!(
            "Wrote {} bytes of Markdown for job {} to {}",
            markdown.len(),
            id,
            path.display()
        );
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, PagewiseError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| PagewiseError::storage(path, e))
    }

    /// Remove every file stored for `id`. Missing directories are fine.
    pub async fn remove_job(&self, id: JobId) -> Result<(), PagewiseError> {
        for dir in [self.uploads(id), self.outputs(id)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PagewiseError::storage(&dir, e)),
            }
        }
        Ok(())
    }
}

async fn create_parent(path: &Path) -> Result<(), PagewiseError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PagewiseError::storage(parent, e))?;
    }
    Ok(())
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PagewiseError> {
    create_parent(path).await?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| PagewiseError::storage(path, e))
}

/// Reduce a user-supplied name to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "document.pdf".to_string()
    } else {
        cleaned.to_string()
    }
}
