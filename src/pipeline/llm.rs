//! Model interaction: one request in, one reply out.
//!
//! [`ChatModel`] is the narrow seam between the pipeline and the hosted
//! service. The pipeline only ever needs "send these instructions (and maybe
//! an image) at this temperature, give me the text back", so that is all the
//! trait exposes. [`ProviderChat`] implements it on top of an `edgequake-llm`
//! provider and turns [`LlmError`]s into [`RecognizeError`] classes the
//! retry loop and fallback policy understand.

use crate::error::RecognizeError;
use crate::pipeline::cost::TokenUsage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// `finish_reason` reported when the provider's safety system cut the reply.
const CONTENT_FILTER: &str = "content_filter";

/// One request to the hosted model.
///
/// `parts` are separate pieces of the user turn (instruction, schema, ending
/// excerpt, context dump) and are sent in order.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub parts: Vec<String>,
    pub image: Option<ImageData>,
    /// The reply must be a single JSON object.
    pub json: bool,
}

impl ChatRequest {
    /// The user turn as sent: parts separated by blank lines.
    pub fn user_text(&self) -> String {
        self.parts.join("\n\n")
    }
}

/// The model's reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub usage: TokenUsage,
}

/// Something that answers chat requests.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest, temperature: f32) -> Result<ChatReply, RecognizeError>;
}

/// [`ChatModel`] backed by an `edgequake-llm` provider.
pub struct ProviderChat {
    provider: Arc<dyn LLMProvider>,
    max_tokens: usize,
}

impl ProviderChat {
    pub fn new(provider: Arc<dyn LLMProvider>, max_tokens: usize) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    fn build_messages(request: &ChatRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        let text = request.user_text();
        messages.push(match request.image {
            Some(ref image) => ChatMessage::user_with_images(text.as_str(), vec![image.clone()]),
            None => ChatMessage::user(text.as_str()),
        });
        messages
    }

    /// Sampling options; JSON mode only where the provider honours it; the
    /// schema in the prompt covers the rest.
    fn options(&self, request: &ChatRequest, temperature: f32) -> CompletionOptions {
        let json_mode = request.json && self.provider.supports_json_mode();
        CompletionOptions {
            temperature: Some(temperature),
            max_tokens: Some(self.max_tokens),
            response_format: json_mode.then(|| "json_object".to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChatModel for ProviderChat {
    async fn chat(&self, request: &ChatRequest, temperature: f32) -> Result<ChatReply, RecognizeError> {
        let start = Instant::now();
        let messages = Self::build_messages(request);
        let options = self.options(request, temperature);

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&e))?;

        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let usage = TokenUsage {
            input: response.prompt_tokens as u64,
            output: response.completion_tokens as u64,
        };
        if response.finish_reason.as_deref() == Some(CONTENT_FILTER) {
            return Err(RecognizeError::Refused {
                detail: format!("finish_reason={}", CONTENT_FILTER),
                usage,
            });
        }

        Ok(ChatReply {
            content: response.content,
            usage,
        })
    }
}

/// Markers of a safety-system stop inside an `ApiError` message.
static RE_POLICY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)content[ _-]?(filter|policy|management)|responsible ai|safety system|guardrail")
        .unwrap()
});

/// HTTP statuses worth another attempt, as whole numbers.
static RE_RETRY_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(429|50[0234]|529)\b|(?i)overloaded").unwrap());

/// Sort a provider error into a retry/fallback class.
///
/// Only an API error naming a content filter or policy is a refusal; the
/// page then goes to local OCR. Network trouble is retried, bad credentials
/// and bad requests are not.
pub fn classify_provider_error(err: &LlmError) -> RecognizeError {
    let detail = err.to_string();
    match err {
        LlmError::Timeout | LlmError::NetworkError(_) | LlmError::RateLimited(_) => {
            RecognizeError::Transient { detail }
        }
        LlmError::ProviderError(_) | LlmError::SerializationError(_) if err.is_recoverable() => {
            RecognizeError::Transient { detail }
        }
        LlmError::ApiError(msg) if RE_POLICY.is_match(msg) => RecognizeError::refused(detail),
        LlmError::ApiError(msg) if RE_RETRY_STATUS.is_match(msg) => RecognizeError::Transient { detail },
        LlmError::TokenLimitExceeded { .. } => {
            warn!("Request exceeds the model's context window: {}", detail);
            RecognizeError::Service { detail }
        }
        _ => RecognizeError::Service { detail },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_filter_api_error_is_a_refusal() {
        let e = classify_provider_error(&LlmError::ApiError(
            "Response blocked by OpenAI content filter (finish_reason=content_filter)".into(),
        ));
        assert!(e.is_refusal(), "got {e:?}");
        let e = classify_provider_error(&LlmError::ApiError(
            "The response was filtered due to the prompt triggering Azure OpenAI's content management policy".into(),
        ));
        assert!(e.is_refusal(), "got {e:?}");
    }

    #[test]
    fn unreachable_server_is_transient_not_a_refusal() {
        let e = classify_provider_error(&LlmError::NetworkError(
            "Connection failed: tcp connect error: Connection refused (os error 111)".into(),
        ));
        assert!(matches!(e, RecognizeError::Transient { .. }), "got {e:?}");

        let e = classify_provider_error(&LlmError::NetworkError(
            "LM Studio not responding at http://localhost:1234".into(),
        ));
        assert!(e.is_retryable(), "got {e:?}");
        assert!(classify_provider_error(&LlmError::Timeout).is_retryable());
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        let e = classify_provider_error(&LlmError::RateLimited("429 Too Many Requests".into()));
        assert!(matches!(e, RecognizeError::Transient { .. }));
        let e = classify_provider_error(&LlmError::ApiError("HTTP 503 Service Unavailable".into()));
        assert!(matches!(e, RecognizeError::Transient { .. }));
        let e = classify_provider_error(&LlmError::ProviderError("upstream closed stream".into()));
        assert!(matches!(e, RecognizeError::Transient { .. }));
    }

    #[test]
    fn numbers_inside_a_bad_request_are_not_status_codes() {
        let e = classify_provider_error(&LlmError::InvalidRequest(
            "max_tokens is too large: 5000".into(),
        ));
        assert!(matches!(e, RecognizeError::Service { .. }), "got {e:?}");
        let e = classify_provider_error(&LlmError::ApiError("context has 15003 tokens".into()));
        assert!(matches!(e, RecognizeError::Service { .. }), "got {e:?}");
    }

    #[test]
    fn credentials_and_unknown_models_are_permanent() {
        for err in [
            LlmError::AuthError("Incorrect API key provided".into()),
            LlmError::ModelNotFound("gpt-9".into()),
            LlmError::ConfigError("OPENAI_API_KEY not set".into()),
        ] {
            let e = classify_provider_error(&err);
            assert!(matches!(e, RecognizeError::Service { .. }), "got {e:?}");
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn json_mode_only_where_the_provider_supports_it() {
        use edgequake_llm::{MockProvider, OpenAIProvider};

        let page = ChatRequest {
            parts: vec!["Transcribe this page.".into()],
            json: true,
            ..Default::default()
        };
        let openai = ProviderChat::new(Arc::new(OpenAIProvider::new("sk-test")), 4096);
        assert_eq!(
            openai.options(&page, 0.0).response_format.as_deref(),
            Some("json_object")
        );

        let plain = ChatRequest {
            json: false,
            ..page.clone()
        };
        assert_eq!(openai.options(&plain, 0.0).response_format, None);

        let mock = ProviderChat::new(Arc::new(MockProvider::new()), 4096);
        assert_eq!(mock.options(&page, 0.0).response_format, None);
    }

    #[test]
    fn user_text_joins_parts_in_order() {
        let req = ChatRequest {
            parts: vec!["one".into(), "two".into()],
            ..Default::default()
        };
        assert_eq!(req.user_text(), "one\n\ntwo");
    }
}
