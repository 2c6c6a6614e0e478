//! Page recognition by a hosted vision model.
//!
//! One request per page. The user turn is built from separate parts, in this
//! order: the page instruction, the reply schema, the previous page's ending
//! (only when there is one), and the carried context. The page image rides
//! along with the same turn.

use crate::context::PagePrompt;
use crate::error::RecognizeError;
use crate::pipeline::cost::TokenUsage;
use crate::pipeline::encode::encode_image_file;
use crate::pipeline::llm::{ChatModel, ChatRequest};
use crate::pipeline::recognize::{
    OcrCorrector, PageImage, Recognition, RecognitionSource, Recognizer,
};
use crate::pipeline::retry::{with_retry, RetryPolicy};
use crate::pipeline::structured::{page_schema, parse_page_reply, PageExtraction};
use crate::prompts::{
    context_message, ending_excerpt_message, schema_message, OCR_CORRECTION_INSTRUCTION,
    PAGE_INSTRUCTION,
};
use async_trait::async_trait;
use edgequake_llm::ImageData;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::debug;

/// [`Recognizer`] sending the page image to a multimodal model; also the
/// text-only [`OcrCorrector`] used after a fallback.
pub struct VisionRecognizer {
    chat: Arc<dyn ChatModel>,
    policy: RetryPolicy,
    instruction: String,
}

impl VisionRecognizer {
    pub fn new(chat: Arc<dyn ChatModel>, policy: RetryPolicy) -> Self {
        Self {
            chat,
            policy,
            instruction: PAGE_INSTRUCTION.to_string(),
        }
    }

    /// Replace the page instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// The request for one page image.
    pub fn build_page_request(&self, image: ImageData, prompt: &PagePrompt) -> ChatRequest {
        ChatRequest {
            system: None,
            parts: prompt_parts(&self.instruction, prompt),
            image: Some(image),
            json: true,
        }
    }

    /// The text-only request correcting a page's raw OCR output.
    pub fn build_correction_request(&self, raw_text: &str, prompt: &PagePrompt) -> ChatRequest {
        let mut parts = prompt_parts(OCR_CORRECTION_INSTRUCTION, prompt);
        parts.push(format!("OCR text:\n```{}```", raw_text));
        ChatRequest {
            system: None,
            parts,
            image: None,
            json: true,
        }
    }

    /// Send `request` under the retry policy and parse the page reply.
    async fn extract(
        &self,
        label: &str,
        request: &ChatRequest,
        source: RecognitionSource,
    ) -> Result<Recognition, RecognizeError> {
        // Usage of failed attempts is still billed.
        let spent = Mutex::new(TokenUsage::default());
        let add = |usage: TokenUsage| {
            if let Ok(mut total) = spent.lock() {
                *total += usage;
            }
        };
        let chat = &self.chat;
        let attempted = with_retry(&self.policy, label, |params| {
            let add = &add;
            async move {
                let reply = chat.chat(request, params.temperature).await.inspect_err(|e| add(e.billed()))?;
                add(reply.usage);
                parse_page_reply(&reply.content)
            }
        })
        .await;
        let usage = spent.lock().map(|u| *u).unwrap_or_default();
        // A refusal carries everything this page cost so far.
        let attempted = attempted.map_err(|e| e.with_billed(usage))?;

        let PageExtraction {
            markdown,
            context_from_previous_pages,
        } = attempted.value;
        debug!("{}: {} chars after {} attempt(s)", label, markdown.len(), attempted.attempts);

        Ok(Recognition {
            markdown,
            context: Some(context_from_previous_pages),
            source,
            usage,
            attempts: attempted.attempts,
            fallback_reason: None,
        })
    }
}

fn prompt_parts(instruction: &str, prompt: &PagePrompt) -> Vec<String> {
    let mut parts = vec![instruction.to_string(), schema_message(&page_schema())];
    if let Some(ref excerpt) = prompt.ending_excerpt {
        parts.push(ending_excerpt_message(excerpt));
    }
    parts.push(context_message(&prompt.context));
    parts
}

#[async_trait]
impl Recognizer for VisionRecognizer {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn recognize(&self, page: &PageImage, prompt: &PagePrompt) -> Result<Recognition, RecognizeError> {
        let image = encode_image_file(&page.path).await?;
        let request = self.build_page_request(image, prompt);
        let label = format!("page {}", page.page_num);
        self.extract(&label, &request, RecognitionSource::Vision).await
    }
}

#[async_trait]
impl OcrCorrector for VisionRecognizer {
    async fn correct(
        &self,
        page_num: usize,
        raw_text: &str,
        prompt: &PagePrompt,
    ) -> Result<Recognition, RecognizeError> {
        let request = self.build_correction_request(raw_text, prompt);
        let label = format!("page {} correction", page_num);
        self.extract(&label, &request, RecognitionSource::OcrCorrected).await
    }
}
