//! Configuration types for scanned-book conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. One struct holding every knob makes it
//! easy to log a run's settings and to diff two runs that produced different
//! output.

use crate::context::MAX_EXCERPT_CHARS;
use crate::error::ScanbookError;
use crate::pipeline::cost::ModelPricing;
use crate::pipeline::retry::{RetryPolicy, MAX_STRUCTURED_ATTEMPTS};
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Configuration for a scanned-book conversion.
///
/// # Example
/// ```rust
/// use scanbook_md::{ConversionConfig, PipelineMode};
///
/// let config = ConversionConfig::builder()
///     .mode(PipelineMode::Vision)
///     .model("gpt-4o-2024-08-06")
///     .keep_images(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Which pipeline runs. Default: [`PipelineMode::Text`].
    pub mode: PipelineMode,

    /// Rendering DPI used when rasterising pages. Range: 72–600. Default: 200.
    ///
    /// Tesseract wants roughly 300 DPI for small print; 200 is a compromise
    /// that keeps vision requests below upload limits.
    pub dpi: u32,

    /// Cap on the longest edge of a rendered page, in pixels. Default: 2500.
    pub max_rendered_pixels: u32,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// LLM model identifier. If None, [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature of the first attempt. Default: 0.0.
    pub temperature: f32,

    /// Added to the temperature after each malformed reply. Default: 0.1.
    pub temperature_step: f32,

    /// Base delay before retrying a transient service error. Default: 500.
    /// Doubles after each attempt.
    pub retry_backoff_ms: u64,

    /// Maximum tokens the model may generate per request. Default: 4096.
    pub max_tokens: usize,

    /// Token budget of one text block (text pipeline). Default: 1000.
    pub block_tokens: usize,

    /// Model context window; a block prompt above it is refused. Default: 128 000.
    pub context_window_tokens: usize,

    /// Ceiling on the projected spend of the text pipeline, in USD. Default: 10.
    pub cost_ceiling_usd: f64,

    /// Pricing override; if None the built-in table is consulted.
    pub pricing: Option<ModelPricing>,

    /// Characters of the previous page carried as the ending excerpt. Default: 200 (max).
    pub excerpt_chars: usize,

    /// Fall back to local OCR when the vision service refuses a page. Default: true.
    pub fallback_to_ocr: bool,

    /// After a fallback, send the OCR text for correction. Default: true.
    pub correct_fallback_ocr: bool,

    /// Tesseract language code(s), e.g. "eng" or "eng+fra". Default: "eng".
    pub ocr_language: String,

    /// Tesseract executable. Default: "tesseract" (looked up on PATH).
    pub tesseract_path: PathBuf,

    /// Directory receiving `{index}.png` page images. Default: "temp".
    pub temp_dir: PathBuf,

    /// Keep page images (and OCR text) after a successful run. Default: false.
    pub keep_images: bool,

    /// JSON Lines run log. None disables it.
    pub run_log: Option<PathBuf>,

    /// Apply deterministic Markdown cleanup to every unit. Default: true.
    pub clean_output: bool,

    /// Custom page/block instruction. If None, the built-in prompt for the mode.
    pub system_prompt: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Receives per-page and per-block progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            dpi: 200,
            max_rendered_pixels: 2500,
            pages: PageSelection::default(),
            password: None,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            temperature_step: 0.1,
            retry_backoff_ms: 500,
            max_tokens: 4096,
            block_tokens: 1000,
            context_window_tokens: 128_000,
            cost_ceiling_usd: 10.0,
            pricing: None,
            excerpt_chars: MAX_EXCERPT_CHARS,
            fallback_to_ocr: true,
            correct_fallback_ocr: true,
            ocr_language: "eng".to_string(),
            tesseract_path: PathBuf::from("tesseract"),
            temp_dir: PathBuf::from("temp"),
            keep_images: false,
            run_log: None,
            clean_output: true,
            system_prompt: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("mode", &self.mode)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pages", &self.pages)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("block_tokens", &self.block_tokens)
            .field("cost_ceiling_usd", &self.cost_ceiling_usd)
            .field("excerpt_chars", &self.excerpt_chars)
            .field("fallback_to_ocr", &self.fallback_to_ocr)
            .field("temp_dir", &self.temp_dir)
            .field("keep_images", &self.keep_images)
            .field("run_log", &self.run_log)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The model id requests are sent to.
    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// The retry policy shared by every structured call. The attempt count
    /// is fixed at [`MAX_STRUCTURED_ATTEMPTS`].
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: MAX_STRUCTURED_ATTEMPTS,
            base_temperature: self.temperature,
            temperature_step: self.temperature_step,
            backoff_ms: self.retry_backoff_ms,
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn mode(mut self, mode: PipelineMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn temperature_step(mut self, step: f32) -> Self {
        self.config.temperature_step = step.max(0.0);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn block_tokens(mut self, n: usize) -> Self {
        self.config.block_tokens = n;
        self
    }

    pub fn context_window_tokens(mut self, n: usize) -> Self {
        self.config.context_window_tokens = n;
        self
    }

    pub fn cost_ceiling_usd(mut self, usd: f64) -> Self {
        self.config.cost_ceiling_usd = usd;
        self
    }

    pub fn pricing(mut self, pricing: ModelPricing) -> Self {
        self.config.pricing = Some(pricing);
        self
    }

    pub fn excerpt_chars(mut self, n: usize) -> Self {
        self.config.excerpt_chars = n;
        self
    }

    pub fn fallback_to_ocr(mut self, v: bool) -> Self {
        self.config.fallback_to_ocr = v;
        self
    }

    pub fn correct_fallback_ocr(mut self, v: bool) -> Self {
        self.config.correct_fallback_ocr = v;
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn tesseract_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract_path = path.into();
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn keep_images(mut self, v: bool) -> Self {
        self.config.keep_images = v;
        self
    }

    pub fn run_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.run_log = Some(path.into());
        self
    }

    pub fn clean_output(mut self, v: bool) -> Self {
        self.config.clean_output = v;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ScanbookError> {
        let c = &self.config;
        if c.block_tokens == 0 {
            return Err(ScanbookError::InvalidConfig(
                "block_tokens must be ≥ 1".into(),
            ));
        }
        if c.block_tokens > c.context_window_tokens {
            return Err(ScanbookError::InvalidConfig(format!(
                "block_tokens ({}) exceeds the context window ({})",
                c.block_tokens, c.context_window_tokens
            )));
        }
        if c.excerpt_chars == 0 || c.excerpt_chars > MAX_EXCERPT_CHARS {
            return Err(ScanbookError::InvalidConfig(format!(
                "excerpt_chars must be 1–{}, got {}",
                MAX_EXCERPT_CHARS, c.excerpt_chars
            )));
        }
        if !(c.cost_ceiling_usd > 0.0) {
            return Err(ScanbookError::InvalidConfig(format!(
                "cost ceiling must be positive, got {}",
                c.cost_ceiling_usd
            )));
        }
        if c.ocr_language.trim().is_empty() {
            return Err(ScanbookError::InvalidConfig(
                "OCR language must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which recognition pipeline a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// OCR every page locally, chunk the text into token-bounded blocks, and
    /// have the model reformat each block. Refuses to start above the cost
    /// ceiling. (default)
    #[default]
    Text,
    /// Send each page image to a vision model, one page at a time, carrying
    /// book/chapter context and the previous page's ending from page to page.
    Vision,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::Text => f.write_str("text"),
            PipelineMode::Vision => f.write_str("vision"),
        }
    }
}

/// Specifies which pages of the PDF to convert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page
    /// numbers. Pages past the end of the document are dropped.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if (1..=total_pages).contains(p) {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|p| (1..=total_pages).contains(*p))
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let c = ConversionConfig::default();
        assert_eq!(c.mode, PipelineMode::Text);
        assert_eq!(c.retry_policy().max_attempts, 3);
        assert_eq!(c.block_tokens, 1000);
        assert_eq!(c.excerpt_chars, 200);
        assert_eq!(c.cost_ceiling_usd, 10.0);
        assert_eq!(c.temp_dir, PathBuf::from("temp"));
        assert!(!c.keep_images);
        assert_eq!(c.model_id(), "gpt-4o");
    }

    #[test]
    fn builder_rejects_oversized_excerpt() {
        let err = ConversionConfig::builder().excerpt_chars(500).build().unwrap_err();
        assert!(err.to_string().contains("excerpt_chars"));
    }

    #[test]
    fn builder_rejects_block_larger_than_window() {
        let err = ConversionConfig::builder()
            .block_tokens(4000)
            .context_window_tokens(2000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("context window"));
    }

    #[test]
    fn builder_clamps_dpi() {
        let c = ConversionConfig::builder().dpi(5000).build().unwrap();
        assert_eq!(c.dpi, 600);
    }

    #[test]
    fn retry_policy_reflects_config() {
        let c = ConversionConfig::builder()
            .temperature(0.2)
            .temperature_step(0.3)
            .retry_backoff_ms(0)
            .build()
            .unwrap();
        let p = c.retry_policy();
        assert_eq!(p.max_attempts, MAX_STRUCTURED_ATTEMPTS);
        assert_eq!(p.backoff_ms, 0);
        assert_eq!(p.base_temperature, 0.2);
        assert_eq!(p.temperature_step, 0.3);
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(4, 10).to_indices(5), vec![3, 4]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3]).to_indices(5), vec![0, 2]);
    }

    #[test]
    fn mode_display() {
        assert_eq!(PipelineMode::Text.to_string(), "text");
        assert_eq!(PipelineMode::Vision.to_string(), "vision");
    }
}
