//! Structured replies: the JSON schemas we ask for and their parsers.
//!
//! Models are asked to reply with a bare JSON object, but they sometimes wrap
//! it in a ```json fence, prefix a sentence, or stop mid-object. Parsing is
//! tolerant of the wrapping and strict about the content: a reply missing a
//! required field is [`RecognizeError::Malformed`] and goes back through the
//! retry loop instead of producing a page with no text or a half context.

use crate::context::BookContext;
use crate::error::RecognizeError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

/// A vision or correction reply: the page's Markdown plus updated context.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageExtraction {
    pub markdown: String,
    pub context_from_previous_pages: BookContext,
}

#[derive(Debug, Deserialize)]
struct BlockExtraction {
    markdown: String,
}

/// Schema for page replies.
pub fn page_schema() -> Value {
    json!({
        "type": "object",
        "title": "markdown and context",
        "additionalProperties": false,
        "required": ["markdown", "context_from_previous_pages"],
        "properties": {
            "markdown": {
                "type": "string",
                "description": "The markdown-formatted text of the page"
            },
            "context_from_previous_pages": {
                "type": "object",
                "title": "context",
                "description": "Where this page sits in the book",
                "additionalProperties": false,
                "required": ["book_title", "author", "current_chapter"],
                "properties": {
                    "book_title": { "type": "string", "description": "The book title" },
                    "author": { "type": "string", "description": "The author of the book" },
                    "current_chapter": { "type": "string", "description": "The chapter title" }
                }
            }
        }
    })
}

/// Schema for text-block replies.
pub fn block_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["markdown"],
        "properties": {
            "markdown": {
                "type": "string",
                "description": "The markdown-formatted, error-corrected text"
            }
        }
    })
}

static RE_REFUSAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\W*(i['’]?m sorry|i am sorry|sorry, (but )?i|i can(no|['’])?t (help|assist|comply|provide|transcribe)|i['’]?m (unable|not able)|i am (unable|not able))",
    )
    .unwrap()
});

/// Parse a page reply.
pub fn parse_page_reply(content: &str) -> Result<PageExtraction, RecognizeError> {
    parse_json(content)
}

/// Parse a text-block reply into its Markdown.
pub fn parse_block_reply(content: &str) -> Result<String, RecognizeError> {
    parse_json::<BlockExtraction>(content).map(|b| b.markdown)
}

fn parse_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, RecognizeError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(RecognizeError::Malformed {
            detail: "empty reply".to_string(),
        });
    }

    let candidate = json_object_span(trimmed);
    match candidate {
        Some(json) => serde_json::from_str(json).map_err(|e| RecognizeError::Malformed {
            detail: e.to_string(),
        }),
        None if RE_REFUSAL.is_match(trimmed) => Err(RecognizeError::refused(truncate(trimmed, 160))),
        None => Err(RecognizeError::Malformed {
            detail: format!("no JSON object in reply: {:?}", truncate(trimmed, 80)),
        }),
    }
}

/// The outermost `{ … }` span of `text`, if any.
fn json_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"{"markdown":"# One\n\nText.","context_from_previous_pages":{"book_title":"B","author":"A","current_chapter":"One"}}"##;

    #[test]
    fn parses_bare_page_reply() {
        let page = parse_page_reply(PAGE).unwrap();
        assert_eq!(page.markdown, "# One\n\nText.");
        assert_eq!(page.context_from_previous_pages.current_chapter, "One");
    }

    #[test]
    fn parses_fenced_reply() {
        let fenced = format!("```json\n{}\n```", PAGE);
        assert!(parse_page_reply(&fenced).is_ok());
    }

    #[test]
    fn missing_context_is_malformed() {
        let err = parse_page_reply(r#"{"markdown":"text"}"#).unwrap_err();
        assert!(matches!(err, RecognizeError::Malformed { .. }));
    }

    #[test]
    fn truncated_reply_is_malformed() {
        let err = parse_page_reply(r#"{"markdown":"text", "context_from_prev"#).unwrap_err();
        assert!(matches!(err, RecognizeError::Malformed { .. }));
    }

    #[test]
    fn empty_reply_is_malformed() {
        assert!(matches!(
            parse_block_reply("   "),
            Err(RecognizeError::Malformed { .. })
        ));
    }

    #[test]
    fn apology_without_json_is_a_refusal() {
        let err = parse_page_reply("I'm sorry, but I can't help with transcribing this page.").unwrap_err();
        assert!(err.is_refusal(), "got {err:?}");
    }

    #[test]
    fn prose_without_json_is_malformed() {
        let err = parse_block_reply("Here is the formatted text: Chapter 1").unwrap_err();
        assert!(matches!(err, RecognizeError::Malformed { .. }));
    }

    #[test]
    fn block_reply_yields_markdown() {
        let md = parse_block_reply(r###"{"markdown": "## Part\n\nBody"}"###).unwrap();
        assert_eq!(md, "## Part\n\nBody");
    }

    #[test]
    fn page_schema_requires_both_fields() {
        let schema = page_schema();
        assert_eq!(schema["required"], json!(["markdown", "context_from_previous_pages"]));
        assert_eq!(
            schema["properties"]["context_from_previous_pages"]["required"],
            json!(["book_title", "author", "current_chapter"])
        );
    }
}
