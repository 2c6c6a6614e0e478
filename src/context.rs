//! The context carried from one page to the next.
//!
//! Scanned books repeat the title, author, or chapter name in the running
//! header of almost every page. A recognizer looking at a single page cannot
//! tell a running header from a real chapter heading, so each request is
//! accompanied by what earlier pages established: the book, the author, the
//! current chapter, and a literal excerpt of how the previous page ended.
//!
//! The excerpt travels separately from the rest. It is *taken* out of the
//! carried context when a prompt is built ([`PageContext::take_prompt`]) and
//! only comes back when the next page's output is folded in
//! ([`PageContext::advance`]). The context is threaded strictly in page order;
//! there is no backtracking, so a wrong chapter name on page N stays wrong
//! until a later page corrects it.

use serde::{Deserialize, Serialize};

/// Placeholder used for every field until a recognizer infers it.
pub const UNKNOWN: &str = "Unknown";

/// Upper bound on the ending excerpt, in characters.
pub const MAX_EXCERPT_CHARS: usize = 200;

/// Book-level facts; also the `context_from_previous_pages` object of the
/// vision response schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookContext {
    pub book_title: String,
    pub author: String,
    pub current_chapter: String,
}

impl Default for BookContext {
    fn default() -> Self {
        Self {
            book_title: UNKNOWN.to_string(),
            author: UNKNOWN.to_string(),
            current_chapter: UNKNOWN.to_string(),
        }
    }
}

/// Everything carried across a page boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    #[serde(flatten)]
    pub book: BookContext,

    /// Tail of the previous page's emitted Markdown. `None` before page 1 and
    /// between [`take_prompt`](Self::take_prompt) and
    /// [`advance`](Self::advance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_excerpt: Option<String>,
}

/// What a recognizer is told about the pages before it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagePrompt {
    pub context: BookContext,
    pub ending_excerpt: Option<String>,
}

impl PageContext {
    /// Split the context for the next request, removing the excerpt.
    pub fn take_prompt(&mut self) -> PagePrompt {
        PagePrompt {
            context: self.book.clone(),
            ending_excerpt: self.ending_excerpt.take(),
        }
    }

    /// Fold one page's result into the context carried to the next page.
    ///
    /// `returned` replaces the book facts when the recognizer supplied them;
    /// local OCR supplies none and the previous facts carry over unchanged.
    /// The excerpt is always recomputed from `emitted`.
    pub fn advance(self, returned: Option<BookContext>, emitted: &str, excerpt_chars: usize) -> Self {
        let excerpt_chars = excerpt_chars.min(MAX_EXCERPT_CHARS);
        Self {
            book: returned.unwrap_or(self.book),
            ending_excerpt: Some(tail_chars(emitted, excerpt_chars).to_string()),
        }
    }
}

/// The last `n` characters of `text` (all of it when shorter).
pub fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unknown_without_excerpt() {
        let ctx = PageContext::default();
        assert_eq!(ctx.book.book_title, "Unknown");
        assert_eq!(ctx.book.author, "Unknown");
        assert_eq!(ctx.book.current_chapter, "Unknown");
        assert!(ctx.ending_excerpt.is_none());
    }

    #[test]
    fn tail_chars_counts_characters_not_bytes() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abc", 0), "");
        assert_eq!(tail_chars("", 3), "");
    }

    #[test]
    fn take_prompt_removes_the_excerpt() {
        let mut ctx = PageContext {
            book: BookContext::default(),
            ending_excerpt: Some("…and so it ended".into()),
        };
        let prompt = ctx.take_prompt();
        assert_eq!(prompt.ending_excerpt.as_deref(), Some("…and so it ended"));
        assert!(ctx.ending_excerpt.is_none());

        // A second prompt built without an intervening page has no excerpt.
        assert!(ctx.take_prompt().ending_excerpt.is_none());
    }

    #[test]
    fn advance_tracks_the_last_page_only() {
        let pages = [
            "# Chapter One\n\nIt was a bright cold day in April.".to_string(),
            "x".repeat(450),
            "short".to_string(),
        ];

        let mut ctx = PageContext::default();
        for page in &pages {
            let _ = ctx.take_prompt();
            ctx = ctx.advance(None, page, 200);
            let expected_len = page.chars().count().min(200);
            let excerpt = ctx.ending_excerpt.as_deref().unwrap();
            assert_eq!(excerpt.chars().count(), expected_len);
            assert!(page.ends_with(excerpt));
        }
        assert_eq!(ctx.ending_excerpt.as_deref(), Some("short"));
    }

    #[test]
    fn advance_prefers_returned_context_and_keeps_previous_otherwise() {
        let returned = BookContext {
            book_title: "Clandestine in Chile".into(),
            author: "Gabriel García Márquez".into(),
            current_chapter: "Those Who Stayed".into(),
        };
        let ctx = PageContext::default().advance(Some(returned.clone()), "text", 200);
        assert_eq!(ctx.book, returned);

        let ctx = ctx.advance(None, "more text", 200);
        assert_eq!(ctx.book, returned, "OCR pages carry the previous facts");
    }

    #[test]
    fn excerpt_length_is_capped() {
        let ctx = PageContext::default().advance(None, &"y".repeat(1000), 5000);
        assert_eq!(ctx.ending_excerpt.unwrap().len(), MAX_EXCERPT_CHARS);
    }

    #[test]
    fn serialises_flat_and_omits_missing_excerpt() {
        let json = serde_json::to_value(PageContext::default()).unwrap();
        assert_eq!(json["book_title"], "Unknown");
        assert!(json.get("ending_excerpt").is_none());
    }
}
