//! Progress-callback trait for per-page and per-block events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to follow a
//! run as it happens. The pipeline is strictly sequential, so events for one
//! stage arrive in order: `on_stage_start`, then start/complete pairs for each
//! unit.
//!
//! # Example
//!
//! ```rust
//! use scanbook_md::{ConversionConfig, ConversionProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     fallbacks: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_page_fallback(&self, page_num: usize, reason: &str) {
//!         self.fallbacks.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num} used local OCR: {reason}");
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { fallbacks: AtomicUsize::new(0) });
//! let config = ConversionConfig::builder()
//!     .progress_callback(cb as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A phase of the run. The text pipeline runs `Ocr` then `Format`; the
/// vision pipeline runs `Recognize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Local OCR of every page.
    Ocr,
    /// Model reformatting of text blocks.
    Format,
    /// Page-by-page vision recognition.
    Recognize,
}

impl Stage {
    /// Noun for one unit of this stage, for progress output.
    pub fn unit(&self) -> &'static str {
        match self {
            Stage::Ocr | Stage::Recognize => "page",
            Stage::Format => "block",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ocr => f.write_str("OCR"),
            Stage::Format => f.write_str("Formatting"),
            Stage::Recognize => f.write_str("Recognising"),
        }
    }
}

/// Called by the conversion pipeline as it works through a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Unit numbers are 1-indexed.
pub trait ConversionProgressCallback: Send + Sync {
    /// A stage begins; `total` units will follow.
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let _ = (stage, total);
    }

    /// Just before a unit (page or block) is processed.
    fn on_unit_start(&self, stage: Stage, unit: usize, total: usize) {
        let _ = (stage, unit, total);
    }

    /// A unit produced `text_len` bytes of output.
    fn on_unit_complete(&self, stage: Stage, unit: usize, total: usize, text_len: usize) {
        let _ = (stage, unit, total, text_len);
    }

    /// A unit failed; the run is about to abort.
    fn on_unit_error(&self, stage: Stage, unit: usize, total: usize, error: &str) {
        let _ = (stage, unit, total, error);
    }

    /// The vision service refused a page and local OCR was used instead.
    fn on_page_fallback(&self, page_num: usize, reason: &str) {
        let _ = (page_num, reason);
    }

    /// Called once after the last unit succeeded.
    fn on_conversion_complete(&self, units: usize) {
        let _ = units;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
