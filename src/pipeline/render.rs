//! PDF rasterisation: selected pages → PNG files in the scratch directory.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and does CPU-heavy work. Rendering runs on the blocking pool so the
//! Tokio workers never stall behind a 600 DPI page.
//!
//! ## Why straight to disk?
//!
//! A 400-page book at 200 DPI is several gigabytes of RGBA bitmaps. Each page
//! is written to `{index}.png` as soon as it is rendered and dropped, so only
//! one bitmap is ever alive; recognizers read the file back when they need it.

use crate::error::ScanbookError;
use crate::output::DocumentMetadata;
use crate::pipeline::recognize::PageImage;
use crate::pipeline::scratch::ScratchDir;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Turns a PDF into page images.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Number of pages in the document.
    async fn page_count(&self, pdf: &Path) -> Result<usize, ScanbookError>;

    /// Render the 0-based `indices` into `scratch`, in the given order.
    async fn rasterize(
        &self,
        pdf: &Path,
        indices: &[usize],
        scratch: &mut ScratchDir,
    ) -> Result<Vec<PageImage>, ScanbookError>;
}

/// [`Rasterizer`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new(dpi: u32, max_pixels: u32, password: Option<String>) -> Self {
        Self {
            dpi,
            max_pixels,
            password,
        }
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn page_count(&self, pdf: &Path) -> Result<usize, ScanbookError> {
        let path = pdf.to_path_buf();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium()?;
            let document = open_document(&pdfium, &path, password.as_deref())?;
            let total = document.pages().len() as usize;
            Ok(total)
        })
        .await
        .map_err(|e| ScanbookError::Internal(format!("Render task panicked: {}", e)))?
    }

    async fn rasterize(
        &self,
        pdf: &Path,
        indices: &[usize],
        scratch: &mut ScratchDir,
    ) -> Result<Vec<PageImage>, ScanbookError> {
        let path = pdf.to_path_buf();
        let password = self.password.clone();
        let dpi = self.dpi;
        let max_pixels = self.max_pixels;
        let targets: Vec<(usize, PathBuf)> = indices
            .iter()
            .map(|&idx| (idx, scratch.image_path(idx)))
            .collect();

        let pages = tokio::task::spawn_blocking(move || {
            render_blocking(&path, password.as_deref(), dpi, max_pixels, &targets)
        })
        .await
        .map_err(|e| ScanbookError::Internal(format!("Render task panicked: {}", e)))??;

        for page in &pages {
            scratch.track(page.path.clone());
        }
        Ok(pages)
    }
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` first, then the copy the CLI downloads
/// into the user cache, then a library in the working directory, then the
/// system library.
pub fn bind_pdfium() -> Result<Pdfium, ScanbookError> {
    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        let bindings = Pdfium::bind_to_library(&path)
            .map_err(|e| ScanbookError::PdfiumBindingFailed(format!("{}: {}", path, e)))?;
        return Ok(Pdfium::new(bindings));
    }
    let local = Pdfium::pdfium_platform_library_name_at_path("./");
    let bound = library_candidates(pdfium_auto::cached_pdfium_path(), local)
        .into_iter()
        .find_map(|path| match Pdfium::bind_to_library(&path) {
            Ok(bindings) => {
                debug!("Bound pdfium from {}", path.display());
                Some(bindings)
            }
            Err(_) => None,
        });
    let bindings = match bound {
        Some(bindings) => bindings,
        None => Pdfium::bind_to_system_library()
            .map_err(|e| ScanbookError::PdfiumBindingFailed(e.to_string()))?,
    };
    Ok(Pdfium::new(bindings))
}

fn library_candidates(cached: Option<PathBuf>, local: PathBuf) -> Vec<PathBuf> {
    cached.into_iter().chain(std::iter::once(local)).collect()
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, ScanbookError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                ScanbookError::WrongPassword {
                    path: path.to_path_buf(),
                }
            } else {
                ScanbookError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            }
        } else {
            ScanbookError::CorruptPdf {
                path: path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn render_blocking(
    pdf_path: &Path,
    password: Option<&str>,
    dpi: u32,
    max_pixels: u32,
    targets: &[(usize, PathBuf)],
) -> Result<Vec<PageImage>, ScanbookError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, pdf_path, password)?;
    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages, rendering {}", total_pages, targets.len());

    // PDF user space is 72 units per inch.
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(targets.len());
    for (idx, target) in targets {
        let idx = *idx;
        if idx >= total_pages {
            return Err(ScanbookError::PageOutOfRange { total: total_pages });
        }
        let failed = |detail: String| ScanbookError::RasterisationFailed {
            page: idx + 1,
            detail,
        };

        let page = pages.get(idx as u16).map_err(|e| failed(format!("{:?}", e)))?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| failed(format!("{:?}", e)))?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        image
            .save_with_format(target, image::ImageFormat::Png)
            .map_err(|e| failed(format!("cannot write {}: {}", target.display(), e)))?;

        results.push(PageImage {
            page_num: idx + 1,
            path: target.clone(),
        });
    }

    Ok(results)
}

/// Document metadata without rendering anything.
pub async fn extract_metadata(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, ScanbookError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || extract_metadata_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| ScanbookError::Internal(format!("Metadata task panicked: {}", e)))?
}

fn extract_metadata_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, ScanbookError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, pdf_path, password)?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata
            .get(tag)
            .map(|t| t.value().trim().to_string())
            .filter(|v| !v.is_empty())
    };

    Ok(DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
        encrypted: password.is_some(),
    })
}
