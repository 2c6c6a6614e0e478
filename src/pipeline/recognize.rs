//! The recognizer capability shared by local OCR and the vision model.
//!
//! Every way of turning a page image into text implements [`Recognizer`]. A
//! recognizer is told what earlier pages established ([`PagePrompt`]) and
//! returns the page's Markdown, plus an updated [`BookContext`] if it is able
//! to infer one. Local OCR cannot, and returns `None`; the caller then keeps
//! the previous context.

use crate::context::{BookContext, PagePrompt};
use crate::error::RecognizeError;
use crate::pipeline::cost::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A rendered page on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-indexed page number in the source PDF.
    pub page_num: usize,
    pub path: PathBuf,
}

impl PageImage {
    /// 0-based page index.
    pub fn index(&self) -> usize {
        self.page_num - 1
    }
}

/// Which path produced a unit's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionSource {
    /// The hosted vision model read the page image.
    Vision,
    /// Raw Tesseract output.
    LocalOcr,
    /// Tesseract output after a text-only correction call.
    OcrCorrected,
    /// An OCR text block reformatted by the model (text pipeline).
    Formatted,
}

impl fmt::Display for RecognitionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecognitionSource::Vision => "vision",
            RecognitionSource::LocalOcr => "local_ocr",
            RecognitionSource::OcrCorrected => "ocr_corrected",
            RecognitionSource::Formatted => "formatted",
        })
    }
}

/// The result of recognising one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub markdown: String,
    /// Updated book facts, when the recognizer inferred them.
    pub context: Option<BookContext>,
    pub source: RecognitionSource,
    pub usage: TokenUsage,
    /// Model attempts spent, 0 for purely local recognition.
    pub attempts: u32,
    /// Why the preferred recognizer was bypassed for this page.
    pub fallback_reason: Option<String>,
}

impl Recognition {
    /// Text from a recognizer that infers no context and spends no tokens.
    pub fn local(markdown: String) -> Self {
        Self {
            markdown,
            context: None,
            source: RecognitionSource::LocalOcr,
            usage: TokenUsage::default(),
            attempts: 0,
            fallback_reason: None,
        }
    }
}

/// Recognises a page image.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Check that the recognizer can run at all, before any page is sent.
    async fn ready(&self) -> Result<(), RecognizeError> {
        Ok(())
    }

    async fn recognize(&self, page: &PageImage, prompt: &PagePrompt) -> Result<Recognition, RecognizeError>;
}

/// Turns raw OCR text of a page into Markdown with a text-only model call.
#[async_trait]
pub trait OcrCorrector: Send + Sync {
    async fn correct(
        &self,
        page_num: usize,
        raw_text: &str,
        prompt: &PagePrompt,
    ) -> Result<Recognition, RecognizeError>;
}
