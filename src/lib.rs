//! # scanbook-md
//!
//! Turn a scanned book (a PDF of page photographs) into a single Markdown
//! document.
//!
//! ## Two pipelines
//!
//! **Text** (the default) OCRs every page locally with Tesseract, splits the
//! text into token-bounded blocks, prices the run, refuses it above the cost
//! ceiling, and asks a hosted model to reformat each block into Markdown.
//!
//! **Vision** sends each page image to a multimodal model together with the
//! last 200 characters of the previous page and what is known about the book
//! so far (title, author, current chapter). The model returns the page's
//! Markdown and the updated book facts, which are carried to the next page.
//! Pages the model refuses to transcribe go through local OCR instead.
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Render    rasterise pages via pdfium into {index}.png
//!  ├─ 3a. Text     tesseract → blocks → cost ceiling → model reformat
//!  ├─ 3b. Vision   page image + carried context → {markdown, context}
//!  ├─ 4. Clean     per-unit Markdown cleanup
//!  └─ 5. Output    appended chunk by chunk, plus a JSON Lines run log
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scanbook_md::{convert_to_file, ConversionConfig, PipelineMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = ConversionConfig::builder()
//!         .mode(PipelineMode::Vision)
//!         .run_log("book.md.log.jsonl")
//!         .build()?;
//!     let output = convert_to_file("book.pdf", "book.md", &config).await?;
//!     eprintln!(
//!         "{} pages, {} via local OCR, {} in / {} out tokens",
//!         output.stats.processed_units,
//!         output.stats.fallback_pages,
//!         output.stats.total_input_tokens,
//!         output.stats.total_output_tokens
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scanbook` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! scanbook-md = { version = "0.1", default-features = false }
//! ```
//!
//! ## Runtime requirements
//!
//! - The pdfium shared library (`PDFIUM_LIB_PATH`, the working directory, or
//!   the system library path).
//! - `tesseract` on `PATH` for the text pipeline and for refusal fallback.
//! - An API key for a provider supported by `edgequake-llm`.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod runlog;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder, PageSelection, PipelineMode};
pub use context::{BookContext, PageContext, PagePrompt};
pub use convert::{convert, convert_sync, convert_to_file, convert_with, inspect, Engines};
pub use error::{RecognizeError, ScanbookError};
pub use output::{ConversionOutput, ConversionStats, DocumentMetadata, UnitKind, UnitResult};
pub use pipeline::assemble::{AppendFile, Discard, PageSink};
pub use pipeline::chunk::{BpeTokenCounter, TokenCounter};
pub use pipeline::cost::ModelPricing;
pub use pipeline::llm::{ChatModel, ChatReply, ChatRequest};
pub use pipeline::recognize::{PageImage, Recognition, RecognitionSource, Recognizer};
pub use pipeline::render::Rasterizer;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use stream::{convert_stream, convert_stream_with, PageStream};
