//! Image encoding: rendered page → base64 PNG [`PageImage`].
//!
//! PNG is lossless; text crispness matters far more than payload size for
//! transcription accuracy, and JPEG artefacts around glyph edges measurably
//! confuse vision models at default resolution.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

pub const PNG_MIME: &str = "image/png";

/// One rasterised page ready for transport to a backend.
///
/// Lives only for the duration of one run; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 0-based index within the rasterised selection.
    pub index: usize,
    /// Base64 (standard alphabet) of the PNG bytes.
    pub base64_png: String,
}

impl PageImage {
    /// 1-based page number within the selection.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }

    /// `data:` URI form, for providers that take images inline as URLs.
    pub fn data_uri(&self) -> String {
        format!("data:{PNG_MIME};base64,{}", self.base64_png)
    }
}

/// PNG-encode and base64-wrap a rendered page.
pub fn encode_page(index: usize, img: &DynamicImage) -> Result<PageImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let base64_png = STANDARD.encode(&buf);
    debug!(
        "Encoded page {} ({}x{}) → {} bytes base64",
        index + 1,
        img.width(),
        img.height(),
        base64_png.len()
    );

    Ok(PageImage { index, base64_png })
}
