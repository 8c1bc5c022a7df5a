//! Page rasterisation: PDF → ordered base64 PNG page images via pdfium.
//!
//! ## Why blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-bound. The [`Rasterizer`] trait is therefore synchronous;
//! async callers go through [`rasterize_in_background`], which moves the work
//! onto tokio's blocking pool so runtime worker threads never stall.
//!
//! ## Range policy
//!
//! The requested [`PageRange`] is resolved against the real page count
//! ([`PageRange::resolve`]): an empty or inverted range falls back to the
//! whole document, then the selection is cut to the configured page ceiling.

use crate::config::Settings;
use crate::error::{DocumentError, PagewiseError};
use crate::job::PageRange;
use crate::pipeline::encode::{encode_page, PageImage};
use pdfium_render::prelude::*;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The rasteriser's output for one run.
#[derive(Debug, Clone)]
pub struct RasterizedPages {
    /// One image per selected page, in page order.
    pub images: Vec<PageImage>,
    /// Total pages in the source document.
    pub document_pages: usize,
    /// 0-based document page indices that were selected.
    pub selected: Range<usize>,
}

impl RasterizedPages {
    /// Number of pages selected (and rendered).
    pub fn page_count(&self) -> usize {
        self.images.len()
    }
}

/// Turns a document on disk into ordered page images.
pub trait Rasterizer: Send + Sync {
    /// Render the pages of `path` selected by `range`.
    ///
    /// # Errors
    /// [`PagewiseError::Document`] when the document cannot be opened, parsed
    /// or rendered. Never retryable.
    fn rasterize(&self, path: &Path, range: PageRange) -> Result<RasterizedPages, PagewiseError>;
}

/// Run `rasterizer` on the blocking pool.
pub async fn rasterize_in_background(
    rasterizer: Arc<dyn Rasterizer>,
    path: PathBuf,
    range: PageRange,
) -> Result<RasterizedPages, PagewiseError> {
    tokio::task::spawn_blocking(move || rasterizer.rasterize(&path, range))
        .await
        .map_err(|e| PagewiseError::Internal(format!("Render task panicked: {}", e)))?
}

/// Resolve `range` against the document and apply the page ceiling.
pub fn select_pages(range: PageRange, document_pages: usize, max_pages: usize) -> Range<usize> {
    let resolved = range.resolve(document_pages);
    if resolved.len() > max_pages {
        warn!(
            "Selection {} spans {} pages; truncating to the first {}",
            range,
            resolved.len(),
            max_pages
        );
        resolved.start..resolved.start + max_pages
    } else {
        resolved
    }
}

/// Validate that `path` exists, is readable and starts with the `%PDF` magic.
///
/// Runs before pdfium is touched, so unreadable input is reported as a
/// [`DocumentError`] even on hosts without a pdfium library.
pub fn check_document(path: &Path) -> Result<(), DocumentError> {
    if !path.exists() {
        return Err(DocumentError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DocumentError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(DocumentError::NotFound {
                path: path.to_path_buf(),
            });
        }
    };

    let mut magic = Vec::with_capacity(4);
    file.by_ref()
        .take(4)
        .read_to_end(&mut magic)
        .map_err(|e| DocumentError::Corrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if magic != b"%PDF" {
        return Err(DocumentError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

/// pdfium-backed [`Rasterizer`].
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    max_rendered_pixels: u32,
    max_pages: usize,
    password: Option<String>,
    library: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            max_rendered_pixels: settings.max_rendered_pixels,
            max_pages: settings.max_pages,
            password: settings.password.clone(),
            library: settings.pdfium_library.clone(),
        }
    }

    fn bind(&self) -> Result<Pdfium, PagewiseError> {
        let bindings = match self.library.as_deref() {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| PagewiseError::PdfiumBindingFailed(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(&self, path: &Path, range: PageRange) -> Result<RasterizedPages, PagewiseError> {
        check_document(path)?;
        let pdfium = self.bind()?;

        let document = pdfium
            .load_pdf_from_file(path, self.password.as_deref())
            .map_err(|e| {
                let detail = format!("{:?}", e);
                if detail.contains("Password") || detail.contains("password") {
                    DocumentError::PasswordRequired {
                        path: path.to_path_buf(),
                    }
                } else {
                    DocumentError::Corrupt {
                        path: path.to_path_buf(),
                        detail,
                    }
                }
            })?;

        let pages = document.pages();
        let document_pages = pages.len() as usize;
        let selected = select_pages(range, document_pages, self.max_pages);
        info!(
            "Rasterising pages {}–{} ({} page(s)) of {}",
            selected.start + 1,
            selected.end,
            selected.len(),
            path.display()
        );

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_rendered_pixels as i32)
            .set_maximum_height(self.max_rendered_pixels as i32);

        let mut images = Vec::with_capacity(selected.len());
        for (index, doc_idx) in selected.clone().enumerate() {
            let page = pages
                .get(doc_idx as u16)
                .map_err(|e| DocumentError::RenderFailed {
                    page: doc_idx + 1,
                    detail: format!("{:?}", e),
                })?;

            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| DocumentError::RenderFailed {
                    page: doc_idx + 1,
                    detail: format!("{:?}", e),
                })?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                doc_idx + 1,
                image.width(),
                image.height()
            );

            let encoded = encode_page(index, &image).map_err(|e| DocumentError::EncodeFailed {
                page: doc_idx + 1,
                detail: e.to_string(),
            })?;
            images.push(encoded);
        }

        Ok(RasterizedPages {
            images,
            document_pages,
            selected,
        })
    }
}
