//! Prompts sent to the hosted recognition service.
//!
//! Every instruction lives here so that wording changes touch one file and
//! tests can inspect the exact text without a live model. Callers can replace
//! the page/block instruction via
//! [`crate::config::ConversionConfig::system_prompt`].

use crate::context::BookContext;

/// Instruction for recognising one page image (vision mode).
pub const PAGE_INSTRUCTION: &str = r#"This image is one page of a scanned book. Transcribe it as Markdown.

Rules:
1. Chapter titles become H1 (`#`); section or paragraph titles become H2 (`##`).
2. Drop page numbers.
3. Books repeat the title, author, or chapter name at the top or bottom of every page.
   Use the context from previous pages to recognise these running headers and footers and leave them out.
   Only emit a chapter title as a heading on the page where the chapter actually begins, or on the cover page.
4. Do not invent a heading for the current chapter unless it is printed as a heading on this page.
5. If the page shows an image, write `<image showing: DESCRIPTION>` followed by its caption.
6. Correct obvious scanning mistakes only when you are certain.

Also return the context for the next page: the book title, the author, and the current chapter,
updated with anything learned from this page."#;

/// Instruction for correcting raw OCR text of a single page (used after a
/// vision request was refused and the page fell back to local OCR).
pub const OCR_CORRECTION_INSTRUCTION: &str = r#"The text below is raw OCR output of one page of a scanned book. Reformat it as Markdown.

Rules:
1. Chapter titles become H1 (`#`); section or paragraph titles become H2 (`##`).
2. Drop page numbers and running headers/footers that repeat the title, author, or chapter.
   Use the context from previous pages to recognise them.
3. Fix characters the OCR engine obviously misread.
4. Keep the wording otherwise unchanged.

Also return the context for the next page: the book title, the author, and the current chapter."#;

/// System prompt for the text pipeline's block reformatting.
pub const EDITOR_SYSTEM_PROMPT: &str = "You are a diligent editor working on a book manuscript.";

/// Instruction prefixed to every text block (text pipeline).
pub const BLOCK_INSTRUCTION: &str = "The text below is the output of optical character recognition of a scanned book and is very messy. \
Format it as Markdown. Remove page numbers. Many books repeat the title, chapter, and author on every page; \
these repetitions are not headers and must be removed. Correct misrecognised characters as best you can. \
Use H1 (`# Chapter`) for chapter titles and H2 (`##`) for paragraph titles. \
If you encounter an image caption, put a `<missing image>` tag before the caption.";

/// The labelled message carrying the literal tail of the previous page.
pub fn ending_excerpt_message(excerpt: &str) -> String {
    format!("The last page ended with: {}", excerpt)
}

/// The labelled context dump.
pub fn context_message(context: &BookContext) -> String {
    let json = serde_json::to_string(context).unwrap_or_default();
    format!("context_from_previous_pages: {}", json)
}

/// Ask for a reply matching `schema`, as bare JSON.
pub fn schema_message(schema: &serde_json::Value) -> String {
    format!(
        "Reply with a single JSON object and nothing else. It must match this JSON schema:\n{}",
        schema
    )
}

/// Wrap an OCR text block in the block instruction.
pub fn block_message(instruction: &str, block: &str) -> String {
    format!("{}\n```{}```", instruction, block)
}
