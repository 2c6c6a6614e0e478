//! Error types for the scanbook-md library.
//!
//! Two error types reflect two levels of failure:
//!
//! * [`ScanbookError`] — **Fatal**: the run cannot continue (bad input file,
//!   projected spend above the ceiling, a page whose recognition kept failing).
//!   Returned as `Err(ScanbookError)` from the top-level `convert*` functions.
//!   There is no partial-document checkpointing: a fatal error during page N
//!   aborts the run, but pages already appended to the output file stay there.
//!
//! * [`RecognizeError`] — the outcome of a single recognizer call. The retry
//!   loop and the fallback policy inspect it to decide whether to try again,
//!   switch to local OCR, or give up. Whatever is left after those decisions
//!   is wrapped into a [`ScanbookError`].

use crate::pipeline::cost::TokenUsage;
use std::path::PathBuf;
use thiserror::Error;

/// Installation hint printed when the `tesseract` binary cannot be found.
pub const TESSERACT_INSTALL_HINT: &str = "Install Tesseract OCR and make sure it is on PATH:\n\
  • macOS:         brew install tesseract\n\
  • Debian/Ubuntu: sudo apt-get install tesseract-ocr\n\
  • Fedora:        sudo dnf install tesseract\n\
  • Windows:       https://github.com/UB-Mannheim/tesseract/wiki\n\
Or point --tesseract at an existing binary.";

/// All fatal errors returned by the scanbook-md library.
#[derive(Debug, Error)]
pub enum ScanbookError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The page selection matched no page of the document.
    #[error("No selected page exists (document has {total} pages)")]
    PageOutOfRange { total: usize },

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Run the scanbook CLI once to download it, place libpdfium next to the\n\
binary, install it system-wide, or set PDFIUM_LIB_PATH=/path/to/libpdfium."
    )]
    PdfiumBindingFailed(String),

    // ── Recognition errors ────────────────────────────────────────────────
    /// A page could not be recognised; the run stops here so that a bad
    /// context never leaks into later pages.
    #[error("Page {page}: {source}")]
    PageFailed {
        page: usize,
        #[source]
        source: RecognizeError,
    },

    /// A text block could not be reformatted.
    #[error("Block {block}: {source}")]
    BlockFailed {
        block: usize,
        #[source]
        source: RecognizeError,
    },

    /// The remote recognizer refused the page and OCR fallback is disabled.
    #[error("Page {page} was refused by the recognition service: {detail}\nRe-run without --no-fallback to use local OCR for such pages.")]
    ContentRefused { page: usize, detail: String },

    /// A block's prompt does not fit in the model's context window.
    #[error("Block {block}: prompt is {tokens} tokens, exceeding the {limit}-token context window")]
    PromptTooLong {
        block: usize,
        tokens: usize,
        limit: usize,
    },

    // ── Cost errors ───────────────────────────────────────────────────────
    /// Projected spend is above the configured ceiling. Raised before any
    /// paid request is sent.
    #[error("Estimated cost ${estimated_usd:.2} exceeds the ${ceiling_usd:.2} ceiling; nothing was sent.\nRaise it with --cost-ceiling or use a cheaper --model.")]
    CostCeilingExceeded { estimated_usd: f64, ceiling_usd: f64 },

    /// The model has no entry in the pricing table and no override was given.
    #[error("No pricing known for model '{model}'.\nPass --price-in and --price-out (USD per 1M tokens).")]
    UnknownModelPricing { model: String },

    // ── Provider / dependency errors ──────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A local program required by the chosen path is not installed.
    #[error("Required program '{program}' was not found.\n{hint}")]
    MissingDependency { program: String, hint: String },

    /// The BPE vocabulary for the model could not be loaded.
    #[error("Cannot load the tokenizer for model '{model}': {detail}")]
    TokenizerUnavailable { model: String, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or append to the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write or remove a file in the temp directory.
    #[error("Temp directory error at '{path}': {source}")]
    ScratchIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not append to the run log.
    #[error("Failed to write run log '{path}': {source}")]
    RunLogFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanbookError {
    /// Wrap a recognizer failure for `page`, lifting the cases that deserve
    /// their own top-level variant.
    pub fn page(page: usize, err: RecognizeError) -> Self {
        match err {
            RecognizeError::MissingDependency { program, hint } => {
                ScanbookError::MissingDependency { program, hint }
            }
            RecognizeError::Refused { detail, .. } => ScanbookError::ContentRefused { page, detail },
            source => ScanbookError::PageFailed { page, source },
        }
    }

    /// Wrap a formatter failure for text block `block`.
    pub fn block(block: usize, err: RecognizeError) -> Self {
        match err {
            RecognizeError::MissingDependency { program, hint } => {
                ScanbookError::MissingDependency { program, hint }
            }
            source => ScanbookError::BlockFailed { block, source },
        }
    }
}

/// Outcome of one recognizer call (vision, OCR, or block formatting).
#[derive(Debug, Clone, Error)]
pub enum RecognizeError {
    /// The reply could not be parsed into the declared JSON schema.
    #[error("malformed structured response: {detail}")]
    Malformed { detail: String },

    /// The service declined the request on content-policy grounds.
    ///
    /// `usage` is what the declined attempts were billed, zero when the
    /// provider rejected the request outright.
    #[error("request refused by content policy: {detail}")]
    Refused { detail: String, usage: TokenUsage },

    /// Timeout, rate limit, or 5xx — worth another attempt after a pause.
    #[error("transient service error: {detail}")]
    Transient { detail: String },

    /// Authentication or request error that another attempt will not fix.
    #[error("service error: {detail}")]
    Service { detail: String },

    /// Every attempt allowed by the retry policy failed.
    #[error("gave up after {attempts} attempts; last error: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RecognizeError>,
    },

    /// A local program (tesseract) is not installed.
    #[error("required program '{program}' is not available")]
    MissingDependency { program: String, hint: String },

    /// The OCR engine ran but reported a failure.
    #[error("local OCR failed: {detail}")]
    Ocr { detail: String },

    /// Reading a page image failed.
    #[error("cannot read '{path}': {detail}")]
    Io { path: PathBuf, detail: String },
}

impl RecognizeError {
    /// Whether the retry loop should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecognizeError::Malformed { .. } | RecognizeError::Transient { .. }
        )
    }

    /// Whether this is a content-policy refusal.
    pub fn is_refusal(&self) -> bool {
        matches!(self, RecognizeError::Refused { .. })
    }

    /// A refusal nobody was billed for yet.
    pub fn refused(detail: impl Into<String>) -> Self {
        RecognizeError::Refused {
            detail: detail.into(),
            usage: TokenUsage::default(),
        }
    }

    /// Tokens billed for the failed call; only refusals carry any.
    pub fn billed(&self) -> TokenUsage {
        match self {
            RecognizeError::Refused { usage, .. } => *usage,
            _ => TokenUsage::default(),
        }
    }

    /// Replace the usage of a refusal with `spent`; other errors pass through.
    pub fn with_billed(self, spent: TokenUsage) -> Self {
        match self {
            RecognizeError::Refused { detail, .. } => RecognizeError::Refused { detail, usage: spent },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_ceiling_display() {
        let e = ScanbookError::CostCeilingExceeded {
            estimated_usd: 11.0,
            ceiling_usd: 10.0,
        };
        let msg = e.to_string();
        assert!(msg.contains("$11.00"), "got: {msg}");
        assert!(msg.contains("$10.00"), "got: {msg}");
    }

    #[test]
    fn missing_tesseract_is_lifted_to_top_level() {
        let e = ScanbookError::page(
            4,
            RecognizeError::MissingDependency {
                program: "tesseract".into(),
                hint: TESSERACT_INSTALL_HINT.into(),
            },
        );
        assert!(matches!(e, ScanbookError::MissingDependency { .. }));
        assert!(e.to_string().contains("apt-get install tesseract-ocr"));
    }

    #[test]
    fn refusal_becomes_content_refused() {
        let e = ScanbookError::page(
            2,
            RecognizeError::refused("content_filter"),
        );
        assert!(matches!(e, ScanbookError::ContentRefused { page: 2, .. }));
    }

    #[test]
    fn exhausted_display_names_attempts() {
        let e = ScanbookError::page(
            7,
            RecognizeError::Exhausted {
                attempts: 3,
                last: Box::new(RecognizeError::Malformed {
                    detail: "expected value at line 1".into(),
                }),
            },
        );
        let msg = e.to_string();
        assert!(msg.contains("Page 7"), "got: {msg}");
        assert!(msg.contains("3 attempts"), "got: {msg}");
    }

    #[test]
    fn only_malformed_and_transient_retry() {
        assert!(RecognizeError::Malformed { detail: String::new() }.is_retryable());
        assert!(RecognizeError::Transient { detail: String::new() }.is_retryable());
        assert!(!RecognizeError::refused("").is_retryable());
        assert!(!RecognizeError::Service { detail: String::new() }.is_retryable());
    }

    #[test]
    fn only_refusals_carry_billed_usage() {
        let spent = TokenUsage { input: 900, output: 12 };
        let refused = RecognizeError::refused("content_filter").with_billed(spent);
        assert_eq!(refused.billed(), spent);

        let malformed = RecognizeError::Malformed { detail: "eof".into() }.with_billed(spent);
        assert_eq!(malformed.billed(), TokenUsage::default());
    }
}
