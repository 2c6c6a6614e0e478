//! Local OCR through the Tesseract command-line tool.
//!
//! The binary is invoked as `tesseract <png> stdout -l <lang>` once per page.
//! Shelling out keeps the crate free of a native leptonica/tesseract link
//! step; the cost is one process spawn per page, which is noise next to the
//! recognition time itself.

use crate::context::PagePrompt;
use crate::error::{RecognizeError, TESSERACT_INSTALL_HINT};
use crate::pipeline::recognize::{PageImage, Recognition, Recognizer};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// [`Recognizer`] that runs Tesseract on the page image.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    program: PathBuf,
    lang: String,
}

impl TesseractOcr {
    pub fn new(program: impl Into<PathBuf>, lang: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            lang: lang.into(),
        }
    }

    /// First line of `tesseract --version`; fails with install instructions
    /// when the program cannot be started.
    pub async fn version(&self) -> Result<String, RecognizeError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        // Older releases print the version on stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let source = if stdout.trim().is_empty() { stderr } else { stdout };
        Ok(source
            .lines()
            .next()
            .map(str::trim)
            .unwrap_or_default()
            .to_string())
    }

    /// OCR one image file into plain text.
    pub async fn image_to_text(&self, image: &Path) -> Result<String, RecognizeError> {
        let output = Command::new(&self.program)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognizeError::Ocr {
                detail: format!(
                    "tesseract exited with {} for {}: {}",
                    output.status,
                    image.display(),
                    stderr.trim()
                ),
            });
        }

        let text = normalise_ocr_text(&String::from_utf8_lossy(&output.stdout));
        debug!("OCR {} → {} chars", image.display(), text.len());
        Ok(text)
    }

    fn spawn_error(&self, e: std::io::Error) -> RecognizeError {
        match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => RecognizeError::MissingDependency {
                program: self.program.display().to_string(),
                hint: TESSERACT_INSTALL_HINT.to_string(),
            },
            _ => RecognizeError::Ocr {
                detail: format!("failed to execute {}: {}", self.program.display(), e),
            },
        }
    }
}

#[async_trait]
impl Recognizer for TesseractOcr {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn ready(&self) -> Result<(), RecognizeError> {
        let version = self.version().await?;
        debug!("Using {}", version);
        Ok(())
    }

    async fn recognize(&self, page: &PageImage, _prompt: &PagePrompt) -> Result<Recognition, RecognizeError> {
        let text = self.image_to_text(&page.path).await?;
        Ok(Recognition::local(text))
    }
}

/// Drop NULs and the form feed Tesseract emits at the end of every page,
/// and make sure non-empty text ends with exactly one newline so pages
/// concatenate line by line.
pub fn normalise_ocr_text(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|&c| c != '\0' && c != '\u{000C}').collect();
    let trimmed = cleaned.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}
