//! Reformatting of OCR text blocks (text pipeline).
//!
//! Each block is sent on its own: the editor system prompt, then the block
//! instruction with the block fenced below it. Blocks share nothing, so a
//! block can be retried without touching its neighbours.

use crate::error::{RecognizeError, ScanbookError};
use crate::pipeline::chunk::{TextBlock, TokenCounter};
use crate::pipeline::cost::TokenUsage;
use crate::pipeline::llm::{ChatModel, ChatRequest};
use crate::pipeline::retry::{with_retry, RetryPolicy};
use crate::pipeline::structured::{block_schema, parse_block_reply};
use crate::prompts::{block_message, schema_message, BLOCK_INSTRUCTION, EDITOR_SYSTEM_PROMPT};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A reformatted block.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedBlock {
    pub markdown: String,
    pub usage: TokenUsage,
    pub attempts: u32,
}

/// Sends text blocks to the model for reformatting.
pub struct BlockFormatter {
    chat: Arc<dyn ChatModel>,
    policy: RetryPolicy,
    counter: Arc<dyn TokenCounter>,
    context_window: usize,
    system: String,
    instruction: String,
}

impl BlockFormatter {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        policy: RetryPolicy,
        counter: Arc<dyn TokenCounter>,
        context_window: usize,
    ) -> Self {
        Self {
            chat,
            policy,
            counter,
            context_window,
            system: EDITOR_SYSTEM_PROMPT.to_string(),
            instruction: BLOCK_INSTRUCTION.to_string(),
        }
    }

    /// Replace the block instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// The request for one block.
    pub fn build_request(&self, block: &TextBlock) -> ChatRequest {
        ChatRequest {
            system: Some(self.system.clone()),
            parts: vec![
                block_message(&self.instruction, &block.text()),
                schema_message(&block_schema()),
            ],
            image: None,
            json: true,
        }
    }

    /// Tokens every request spends around the block itself.
    pub fn instruction_tokens(&self) -> usize {
        self.counter.count(&self.system)
            + self.counter.count(&self.instruction)
            + self.counter.count(&schema_message(&block_schema()))
    }

    /// Tokens of the full prompt for `request`.
    pub fn prompt_tokens(&self, request: &ChatRequest) -> usize {
        request.system.as_deref().map_or(0, |s| self.counter.count(s))
            + self.counter.count(&request.user_text())
    }

    /// Reformat block `number` (1-indexed).
    ///
    /// A prompt larger than the context window is refused without a call.
    pub async fn format_block(&self, number: usize, block: &TextBlock) -> Result<FormattedBlock, ScanbookError> {
        let request = self.build_request(block);
        let tokens = self.prompt_tokens(&request);
        if tokens > self.context_window {
            return Err(ScanbookError::PromptTooLong {
                block: number,
                tokens,
                limit: self.context_window,
            });
        }

        let label = format!("block {}", number);
        let spent = Mutex::new(TokenUsage::default());
        let chat = &self.chat;
        let request = &request;
        let attempted = with_retry(&self.policy, &label, |params| {
            let spent = &spent;
            async move {
                let reply = chat.chat(request, params.temperature).await?;
                if let Ok(mut total) = spent.lock() {
                    *total += reply.usage;
                }
                parse_block_reply(&reply.content)
            }
        })
        .await
        .map_err(|e: RecognizeError| ScanbookError::block(number, e))?;

        let usage = spent.lock().map(|u| *u).unwrap_or_default();
        debug!(
            "{}: {} prompt tokens, {} chars back after {} attempt(s)",
            label,
            tokens,
            attempted.value.len(),
            attempted.attempts
        );

        Ok(FormattedBlock {
            markdown: attempted.value,
            usage,
            attempts: attempted.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chunk::BpeTokenCounter;
    use crate::pipeline::llm::ChatReply;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Replies {
        content: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for Replies {
        async fn chat(&self, _: &ChatRequest, _: f32) -> Result<ChatReply, RecognizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatReply {
                content: self.content.to_string(),
                usage: TokenUsage { input: 50, output: 10 },
            })
        }
    }

    fn counter() -> BpeTokenCounter {
        BpeTokenCounter::for_model("gpt-4o").unwrap()
    }

    fn block(text: &str) -> TextBlock {
        TextBlock {
            lines: vec![text.to_string()],
            tokens: counter().count(text),
        }
    }

    fn formatter(chat: Arc<Replies>, window: usize) -> BlockFormatter {
        let policy = RetryPolicy {
            backoff_ms: 0,
            ..RetryPolicy::default()
        };
        BlockFormatter::new(chat, policy, Arc::new(counter()), window)
    }

    #[test]
    fn request_uses_editor_system_prompt_and_fenced_block() {
        let f = formatter(
            Arc::new(Replies {
                content: "",
                calls: AtomicUsize::new(0),
            }),
            128_000,
        );
        let req = f.build_request(&block("CHAPTER I\nIt was\n"));
        assert_eq!(req.system.as_deref(), Some(EDITOR_SYSTEM_PROMPT));
        assert!(req.parts[0].starts_with(BLOCK_INSTRUCTION));
        assert!(req.parts[0].ends_with("```CHAPTER I\nIt was\n```"));
        assert!(req.image.is_none());
        assert!(req.json);
    }

    #[tokio::test]
    async fn formats_a_block() {
        let chat = Arc::new(Replies {
            content: r##"{"markdown": "# Chapter I\n\nIt was"}"##,
            calls: AtomicUsize::new(0),
        });
        let out = formatter(chat.clone(), 128_000)
            .format_block(1, &block("CHAPTER I\nIt was\n"))
            .await
            .unwrap();
        assert_eq!(out.markdown, "# Chapter I\n\nIt was");
        assert_eq!(out.attempts, 1);
        assert_eq!(out.usage, TokenUsage { input: 50, output: 10 });
    }

    #[tokio::test]
    async fn oversized_prompt_is_refused_without_a_call() {
        let chat = Arc::new(Replies {
            content: r#"{"markdown": "x"}"#,
            calls: AtomicUsize::new(0),
        });
        let err = formatter(chat.clone(), 50)
            .format_block(7, &block(&"word ".repeat(400)))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanbookError::PromptTooLong { block: 7, .. }));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_garbage_fails_the_block_after_three_calls() {
        let chat = Arc::new(Replies {
            content: "Sure! Here is your text:",
            calls: AtomicUsize::new(0),
        });
        let err = formatter(chat.clone(), 128_000)
            .format_block(2, &block("text\n"))
            .await
            .unwrap_err();
        assert_eq!(chat.calls.load(Ordering::SeqCst), 3);
        match err {
            ScanbookError::BlockFailed {
                block: 2,
                source: RecognizeError::Exhausted { attempts: 3, .. },
            } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
