//! Pipeline stages for scanned-book conversion.
//!
//! Each submodule does one job and is testable on its own. The two pipelines
//! share the front and back ends and differ in the middle:
//!
//! ```text
//!                      ┌─▶ ocr ──▶ chunk ──▶ cost ──▶ format ─┐     (text)
//! input ──▶ render ────┤                                      ├──▶ assemble
//!  (path/URL) (pdfium) └─▶ carry(vision ⇄ fallback/ocr) ──────┘     (vision)
//! ```
//!
//! 1. [`input`]   — canonicalise the path or URL to a local `%PDF` file
//! 2. [`render`]  — rasterise selected pages into the [`scratch`] directory
//! 3. [`ocr`]     — Tesseract, page image → plain text
//! 4. [`chunk`]   — greedy token-bounded blocks of OCR lines
//! 5. [`cost`]    — spend projection and the ceiling check
//! 6. [`format`]  — model reformatting of each block
//! 7. [`vision`]  — page image → `{markdown, context}` via a multimodal model
//! 8. [`fallback`] — local OCR for pages the vision model refuses
//! 9. [`carry`]   — one step of the context-carrying page loop
//! 10. [`assemble`] — newline/heading rule and the output sink
//!
//! [`llm`], [`retry`], [`structured`], [`encode`] and [`postprocess`] are
//! shared plumbing for the stages above.

pub mod assemble;
pub mod carry;
pub mod chunk;
pub mod cost;
pub mod encode;
pub mod fallback;
pub mod format;
pub mod input;
pub mod llm;
pub mod ocr;
pub mod postprocess;
pub mod recognize;
pub mod render;
pub mod retry;
pub mod scratch;
pub mod structured;
pub mod vision;
