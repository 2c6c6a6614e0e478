//! Refusal fallback: vision first, local OCR for the pages it declines.
//!
//! A content-policy refusal is about one page, not the book, so the
//! fallback is decided page by page. The next page goes to the vision model
//! again as if nothing had happened.

use crate::context::PagePrompt;
use crate::error::RecognizeError;
use crate::pipeline::cost::TokenUsage;
use crate::pipeline::recognize::{OcrCorrector, PageImage, Recognition, Recognizer};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Composes a primary recognizer with local OCR.
pub struct FallbackRecognizer {
    primary: Arc<dyn Recognizer>,
    local: Arc<dyn Recognizer>,
    corrector: Option<Arc<dyn OcrCorrector>>,
}

impl FallbackRecognizer {
    pub fn new(primary: Arc<dyn Recognizer>, local: Arc<dyn Recognizer>) -> Self {
        Self {
            primary,
            local,
            corrector: None,
        }
    }

    /// Send fallback OCR text through `corrector` before it is used.
    pub fn with_corrector(mut self, corrector: Arc<dyn OcrCorrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    async fn fall_back(
        &self,
        page: &PageImage,
        prompt: &PagePrompt,
        reason: String,
        refused: TokenUsage,
    ) -> Result<Recognition, RecognizeError> {
        let mut raw = self.local.recognize(page, prompt).await?;
        raw.fallback_reason = Some(reason.clone());
        raw.usage += refused;
        let Some(ref corrector) = self.corrector else {
            return Ok(raw);
        };

        match corrector.correct(page.page_num, &raw.markdown, prompt).await {
            Ok(mut corrected) => {
                corrected.fallback_reason = Some(reason);
                corrected.usage += raw.usage;
                Ok(corrected)
            }
            Err(err) if err.is_refusal() => {
                warn!(
                    "Page {}: correction refused as well, keeping raw OCR text",
                    page.page_num
                );
                raw.usage += err.billed();
                Ok(raw)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Recognizer for FallbackRecognizer {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn recognize(&self, page: &PageImage, prompt: &PagePrompt) -> Result<Recognition, RecognizeError> {
        match self.primary.recognize(page, prompt).await {
            Err(err) if err.is_refusal() => {
                warn!(
                    "Page {}: {} refused ({}), using {}",
                    page.page_num,
                    self.primary.name(),
                    err,
                    self.local.name()
                );
                self.fall_back(page, prompt, err.to_string(), err.billed()).await
            }
            other => other,
        }
    }
}
