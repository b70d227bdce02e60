//! PDF pages to PNG slides.

use async_trait::async_trait;
use card_flow::{PipelineError, Slide, SlideSource};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use pdf2image::{DPI, PDF, Pages, RenderOptionsBuilder};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Longest edge of an encoded slide, in pixels.
pub const MAX_EDGE: u32 = 1024;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("PDF file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to render PDF: {0}")]
    Pdf(String),
    #[error("failed to encode slide image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("render task failed: {0}")]
    Join(String),
}

/// A lecture PDF whose pages become slides `1..=n`.
#[derive(Debug, Clone)]
pub struct PdfSlideSource {
    path: PathBuf,
    doc_id: String,
    dpi: u32,
}

impl PdfSlideSource {
    pub fn new(path: impl Into<PathBuf>, dpi: u32) -> Self {
        let path = path.into();
        let doc_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, doc_id, dpi }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SlideSource for PdfSlideSource {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    async fn render(&self) -> card_flow::Result<Vec<Slide>> {
        render_pdf(&self.path, self.dpi)
            .await
            .map_err(|e| PipelineError::Render {
                doc_id: self.doc_id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Render every page of `path` and encode it as a PNG slide.
pub async fn render_pdf(path: &Path, dpi: u32) -> Result<Vec<Slide>, RenderError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(RenderError::NotFound(path.to_path_buf()));
    }

    info!(path = %path.display(), dpi, "Rendering PDF pages");
    let owned = path.to_path_buf();
    let slides = tokio::task::spawn_blocking(move || -> Result<Vec<Slide>, RenderError> {
        let pdf = PDF::from_file(&owned).map_err(|e| RenderError::Pdf(e.to_string()))?;
        let options = RenderOptionsBuilder::default()
            .resolution(DPI::Uniform(dpi))
            .build()
            .map_err(|e| RenderError::Pdf(e.to_string()))?;
        let pages = pdf
            .render(Pages::All, options)
            .map_err(|e| RenderError::Pdf(e.to_string()))?;

        pages
            .iter()
            .zip(1u32..)
            .map(|(page, page_id)| Ok(Slide::png(page_id, encode_slide(page, MAX_EDGE)?)))
            .collect()
    })
    .await
    .map_err(|e| RenderError::Join(e.to_string()))??;

    info!(pages = slides.len(), "Rendered PDF");
    Ok(slides)
}

/// Downscale so the longest edge is at most `max_edge`, then encode as PNG.
pub fn encode_slide(image: &DynamicImage, max_edge: u32) -> Result<Vec<u8>, RenderError> {
    let resized;
    let image = if image.width().max(image.height()) > max_edge {
        debug!(
            width = image.width(),
            height = image.height(),
            max_edge,
            "Downscaling slide"
        );
        resized = image.resize(max_edge, max_edge, FilterType::Lanczos3);
        &resized
    } else {
        image
    };

    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

/// PDFs directly inside `dir`, sorted by file name.
pub fn discover_pdfs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut pdfs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_pdf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            pdfs.push(path);
        }
    }
    pdfs.sort();
    Ok(pdfs)
}
