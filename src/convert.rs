//! Eager (whole-book) conversion entry points.
//!
//! [`convert_with`] is the one real driver; the other entry points only
//! decide where the collaborators and the output go:
//!
//! | Entry point          | Engines              | Output                   |
//! |----------------------|----------------------|--------------------------|
//! | [`convert`]          | from the config      | returned in memory       |
//! | [`convert_to_file`]  | from the config      | appended to a file       |
//! | [`convert_with`]     | caller-supplied      | caller-supplied sink     |
//! | [`convert_sync`]     | from the config      | in memory, blocking      |
//!
//! Both pipelines are strictly sequential. Every chunk reaches the sink
//! before the next page or block is started, so a fatal error leaves the
//! finished part of the book on disk.

use crate::config::{ConversionConfig, PipelineMode};
use crate::context::{PageContext, PagePrompt};
use crate::error::ScanbookError;
use crate::output::{ConversionOutput, ConversionStats, DocumentMetadata, UnitKind, UnitResult};
use crate::pipeline::assemble::{AppendFile, Discard, Document, PageSink};
use crate::pipeline::carry::{carry_page, CarrySettings, PageOutcome, RunState};
use crate::pipeline::chunk::{chunk_lines, split_lines, BpeTokenCounter, TokenCounter};
use crate::pipeline::cost::{
    enforce_ceiling, estimate_formatting_cost, pricing_for, ModelPricing, TokenLedger,
};
use crate::pipeline::fallback::FallbackRecognizer;
use crate::pipeline::format::BlockFormatter;
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::llm::{ChatModel, ProviderChat};
use crate::pipeline::ocr::TesseractOcr;
use crate::pipeline::postprocess::clean_page_markdown;
use crate::pipeline::recognize::{PageImage, RecognitionSource, Recognizer};
use crate::pipeline::render::{self, PdfiumRasterizer, Rasterizer};
use crate::pipeline::scratch::ScratchDir;
use crate::pipeline::vision::VisionRecognizer;
use crate::progress::{ConversionProgressCallback, NoopProgressCallback, Stage};
use crate::runlog::{RunEvent, RunLog};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The collaborators a run talks to.
///
/// [`Engines::from_config`] wires up pdfium, the Tesseract CLI and the
/// configured provider. Tests and embedders build the struct directly to
/// swap any of them out.
#[derive(Clone)]
pub struct Engines {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub local_ocr: Arc<dyn Recognizer>,
    /// `None` when no provider is available; both pipelines need one.
    pub chat: Option<Arc<dyn ChatModel>>,
    pub token_counter: Arc<dyn TokenCounter>,
}

impl Engines {
    /// Production engines for `config`.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, ScanbookError> {
        let provider = resolve_provider(config)?;
        let token_counter = Arc::new(BpeTokenCounter::for_model(provider.model())?);
        Ok(Self {
            rasterizer: Arc::new(PdfiumRasterizer::new(
                config.dpi,
                config.max_rendered_pixels,
                config.password.clone(),
            )),
            local_ocr: Arc::new(TesseractOcr::new(
                config.tesseract_path.clone(),
                config.ocr_language.clone(),
            )),
            chat: Some(Arc::new(ProviderChat::new(provider, config.max_tokens))),
            token_counter,
        })
    }

    /// The chat model, or the error explaining why there is none.
    pub fn chat(&self) -> Result<Arc<dyn ChatModel>, ScanbookError> {
        self.chat
            .clone()
            .ok_or_else(|| ScanbookError::ProviderNotConfigured {
                provider: "none".to_string(),
                hint: "No chat model was supplied to the conversion.".to_string(),
            })
    }
}

/// Convert a scanned book (local path or URL) to Markdown in memory.
///
/// # Errors
/// Every failure is fatal: the first page or block that cannot be
/// recognised aborts the run.
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ScanbookError> {
    let engines = Engines::from_config(config)?;
    convert_with(input_str, config, &engines, &mut Discard).await
}

/// Convert and append each page or block to `output_path` as it is produced.
///
/// The file is truncated before the first page is read. On error it keeps
/// everything appended so far.
pub async fn convert_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ScanbookError> {
    let engines = Engines::from_config(config)?;
    let mut sink = AppendFile::create(output_path.as_ref()).await?;
    convert_with(input_str, config, &engines, &mut sink).await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ScanbookError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ScanbookError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_str, config))
}

/// Extract PDF metadata without converting content.
///
/// Does not require an LLM provider, an API key or Tesseract.
pub async fn inspect(
    input_str: impl AsRef<str>,
    password: Option<&str>,
) -> Result<DocumentMetadata, ScanbookError> {
    let resolved = input::resolve_input(input_str.as_ref(), 120).await?;
    render::extract_metadata(resolved.path(), password).await
}

/// Convert with caller-supplied engines, streaming chunks into `sink`.
pub async fn convert_with(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
    engines: &Engines,
    sink: &mut dyn PageSink,
) -> Result<ConversionOutput, ScanbookError> {
    let total_start = Instant::now();
    let input_str = input_str.as_ref();
    info!("Starting {} conversion: {}", config.mode, input_str);

    preflight(config, engines).await?;
    let mut run = prepare(input_str, config, engines).await?;

    let recognition_start = Instant::now();
    let finished = match config.mode {
        PipelineMode::Text => run_text(config, engines, &mut run, sink).await?,
        PipelineMode::Vision => run_vision(config, engines, &mut run, sink).await?,
    };
    let recognition_duration_ms = recognition_start.elapsed().as_millis() as u64;

    let estimated_cost_usd = pricing(config).map(|p| finished.ledger.spend(&p).total_usd());
    let stats = ConversionStats {
        mode: config.mode,
        total_pages: run.total_pages,
        processed_units: finished.units.len(),
        fallback_pages: finished.fallback_pages,
        blocks: finished.blocks,
        total_input_tokens: finished.ledger.sent,
        total_output_tokens: finished.ledger.received,
        estimated_cost_usd,
        render_duration_ms: run.render_duration_ms,
        recognition_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    run.log.record(finished_event(&stats)).await?;
    let PreparedRun { scratch, .. } = run;
    scratch.cleanup().await;

    info!(
        "Conversion complete: {} {}s, {} in / {} out tokens, {}ms total",
        stats.processed_units,
        match config.mode {
            PipelineMode::Text => "block",
            PipelineMode::Vision => "page",
        },
        stats.total_input_tokens,
        stats.total_output_tokens,
        stats.total_duration_ms
    );
    progress(config).on_conversion_complete(stats.processed_units);

    Ok(ConversionOutput {
        markdown: finished.document.into_markdown(),
        units: finished.units,
        final_context: finished.final_context,
        stats,
    })
}

// ── Shared run plumbing ──────────────────────────────────────────────────

/// A run whose pages are rendered and whose log is open.
pub(crate) struct PreparedRun {
    /// Keeps a downloaded PDF alive until the run ends.
    pub(crate) _input: ResolvedInput,
    pub(crate) total_pages: usize,
    pub(crate) pages: Vec<PageImage>,
    pub(crate) scratch: ScratchDir,
    pub(crate) log: RunLog,
    pub(crate) render_duration_ms: u64,
}

/// What a pipeline hands back to the driver.
struct FinishedRun {
    document: Document,
    units: Vec<UnitResult>,
    ledger: TokenLedger,
    fallback_pages: usize,
    blocks: usize,
    final_context: Option<PageContext>,
}

/// Fail before any page is rendered when a collaborator the mode needs is
/// missing.
pub(crate) async fn preflight(config: &ConversionConfig, engines: &Engines) -> Result<(), ScanbookError> {
    engines.chat()?;
    if config.mode == PipelineMode::Text {
        if pricing(config).is_none() {
            return Err(ScanbookError::UnknownModelPricing {
                model: config.model_id().to_string(),
            });
        }
        // Page 0: nothing has been read yet.
        engines
            .local_ocr
            .ready()
            .await
            .map_err(|e| ScanbookError::page(0, e))?;
    }
    Ok(())
}

/// Resolve the input, open the run log and rasterise the selected pages.
pub(crate) async fn prepare(
    input_str: &str,
    config: &ConversionConfig,
    engines: &Engines,
) -> Result<PreparedRun, ScanbookError> {
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let total_pages = engines.rasterizer.page_count(resolved.path()).await?;
    info!("PDF has {} pages", total_pages);

    let indices = config.pages.to_indices(total_pages);
    if indices.is_empty() {
        return Err(ScanbookError::PageOutOfRange { total: total_pages });
    }
    debug!("Selected {} pages for conversion", indices.len());

    let mut log = RunLog::open(config.run_log.as_deref()).await?;
    log.record(RunEvent::RunStarted {
        input: resolved.display_name(),
        mode: config.mode,
        model: config.model_id().to_string(),
        pages: indices.len(),
    })
    .await?;

    let mut scratch = ScratchDir::create(config.temp_dir.clone(), config.keep_images).await?;
    let render_start = Instant::now();
    let pages = engines
        .rasterizer
        .rasterize(resolved.path(), &indices, &mut scratch)
        .await?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    info!(
        "Rendered {} pages into {} in {}ms",
        pages.len(),
        scratch.root().display(),
        render_duration_ms
    );

    Ok(PreparedRun {
        _input: resolved,
        total_pages,
        pages,
        scratch,
        log,
        render_duration_ms,
    })
}

/// The page recognizer of a vision run: the vision model, wrapped in the
/// refusal fallback unless that is switched off.
pub(crate) fn page_recognizer(
    config: &ConversionConfig,
    engines: &Engines,
) -> Result<Arc<dyn Recognizer>, ScanbookError> {
    let mut vision = VisionRecognizer::new(engines.chat()?, config.retry_policy());
    if let Some(ref instruction) = config.system_prompt {
        vision = vision.with_instruction(instruction.clone());
    }
    let vision = Arc::new(vision);
    if !config.fallback_to_ocr {
        return Ok(vision);
    }

    let mut recognizer = FallbackRecognizer::new(vision.clone(), Arc::clone(&engines.local_ocr));
    if config.correct_fallback_ocr {
        recognizer = recognizer.with_corrector(vision);
    }
    Ok(Arc::new(recognizer))
}

pub(crate) fn carry_settings(config: &ConversionConfig) -> CarrySettings {
    CarrySettings {
        excerpt_chars: config.excerpt_chars,
        clean_output: config.clean_output,
    }
}

/// Log the events of one finished vision page.
pub(crate) async fn record_page(
    log: &mut RunLog,
    callback: &dyn ConversionProgressCallback,
    state: &RunState,
    outcome: &PageOutcome,
) -> Result<(), ScanbookError> {
    let page = outcome.unit.unit;
    if let Some(ref reason) = outcome.fallback_reason {
        warn!("Page {} recognised by local OCR: {}", page, reason);
        callback.on_page_fallback(page, reason);
        log.record(RunEvent::PageFallback {
            page,
            reason: reason.clone(),
        })
        .await?;
    }
    log.record(RunEvent::PageRecognized {
        page,
        source: outcome.unit.source,
        attempts: outcome.unit.attempts,
        markdown_chars: outcome.unit.markdown.chars().count(),
        context: state.context.clone(),
    })
    .await
}

pub(crate) fn finished_event(stats: &ConversionStats) -> RunEvent {
    RunEvent::RunFinished {
        units: stats.processed_units,
        input_tokens: stats.total_input_tokens,
        output_tokens: stats.total_output_tokens,
        estimated_cost_usd: stats.estimated_cost_usd,
    }
}

pub(crate) fn progress(config: &ConversionConfig) -> &dyn ConversionProgressCallback {
    match config.progress_callback {
        Some(ref cb) => cb.as_ref(),
        None => &NoopProgressCallback,
    }
}

/// Configured pricing, else the list price of the model.
fn pricing(config: &ConversionConfig) -> Option<ModelPricing> {
    config.pricing.or_else(|| pricing_for(config.model_id()))
}

// ── Text pipeline ────────────────────────────────────────────────────────

async fn run_text(
    config: &ConversionConfig,
    engines: &Engines,
    run: &mut PreparedRun,
    sink: &mut dyn PageSink,
) -> Result<FinishedRun, ScanbookError> {
    let cb = progress(config);
    let pricing = pricing(config).ok_or_else(|| ScanbookError::UnknownModelPricing {
        model: config.model_id().to_string(),
    })?;

    // OCR every page first; the whole text is needed to price the run.
    let total = run.pages.len();
    cb.on_stage_start(Stage::Ocr, total);
    let mut lines = Vec::new();
    for (i, page) in run.pages.iter().enumerate() {
        cb.on_unit_start(Stage::Ocr, i + 1, total);
        let text = match engines.local_ocr.recognize(page, &PagePrompt::default()).await {
            Ok(recognition) => recognition.markdown,
            Err(e) => {
                cb.on_unit_error(Stage::Ocr, i + 1, total, &e.to_string());
                return Err(ScanbookError::page(page.page_num, e));
            }
        };
        run.scratch.save_text(page.index(), &text).await?;
        cb.on_unit_complete(Stage::Ocr, i + 1, total, text.len());
        lines.extend(split_lines(&text));
    }

    let line_count = lines.len();
    let blocks = chunk_lines(lines, config.block_tokens, engines.token_counter.as_ref());
    let mut formatter = BlockFormatter::new(
        engines.chat()?,
        config.retry_policy(),
        Arc::clone(&engines.token_counter),
        config.context_window_tokens,
    );
    if let Some(ref instruction) = config.system_prompt {
        formatter = formatter.with_instruction(instruction.clone());
    }

    let estimate = estimate_formatting_cost(&blocks, formatter.instruction_tokens(), &pricing);
    info!(
        "{} lines in {} blocks, estimated ${:.4} (ceiling ${:.2})",
        line_count,
        blocks.len(),
        estimate.total_usd(),
        config.cost_ceiling_usd
    );
    run.log
        .record(RunEvent::BlocksPlanned {
            lines: line_count,
            blocks: blocks.len(),
            estimate,
            estimated_usd: estimate.total_usd(),
            ceiling_usd: config.cost_ceiling_usd,
        })
        .await?;
    enforce_ceiling(&estimate, config.cost_ceiling_usd)?;

    let total = blocks.len();
    cb.on_stage_start(Stage::Format, total);
    let mut document = Document::default();
    let mut units = Vec::with_capacity(total);
    let mut ledger = TokenLedger::default();

    for (i, block) in blocks.iter().enumerate() {
        let number = i + 1;
        if block.text().trim().is_empty() {
            debug!("Block {} is blank, skipping", number);
            continue;
        }

        cb.on_unit_start(Stage::Format, number, total);
        let start = Instant::now();
        let formatted = match formatter.format_block(number, block).await {
            Ok(f) => f,
            Err(e) => {
                cb.on_unit_error(Stage::Format, number, total, &e.to_string());
                return Err(e);
            }
        };

        let markdown = if config.clean_output {
            clean_page_markdown(&formatted.markdown)
        } else {
            formatted.markdown
        };
        let chunk = document.push_page(&markdown);
        sink.write_chunk(&chunk).await?;
        ledger.record(formatted.usage);

        run.log
            .record(RunEvent::BlockFormatted {
                block: number,
                tokens: block.tokens,
                attempts: formatted.attempts,
                markdown_chars: markdown.chars().count(),
            })
            .await?;
        cb.on_unit_complete(Stage::Format, number, total, markdown.len());

        units.push(UnitResult {
            unit: number,
            kind: UnitKind::Block,
            source: RecognitionSource::Formatted,
            markdown,
            input_tokens: formatted.usage.input,
            output_tokens: formatted.usage.output,
            attempts: formatted.attempts,
            duration_ms: start.elapsed().as_millis() as u64,
        });
    }

    Ok(FinishedRun {
        document,
        units,
        ledger,
        fallback_pages: 0,
        blocks: total,
        final_context: None,
    })
}

// ── Vision pipeline ──────────────────────────────────────────────────────

async fn run_vision(
    config: &ConversionConfig,
    engines: &Engines,
    run: &mut PreparedRun,
    sink: &mut dyn PageSink,
) -> Result<FinishedRun, ScanbookError> {
    let cb = progress(config);
    let recognizer = page_recognizer(config, engines)?;
    let settings = carry_settings(config);

    let total = run.pages.len();
    cb.on_stage_start(Stage::Recognize, total);
    let mut state = RunState::default();

    for (i, page) in run.pages.iter().enumerate() {
        cb.on_unit_start(Stage::Recognize, i + 1, total);
        let (next, outcome) = match carry_page(state, recognizer.as_ref(), page, &settings).await {
            Ok(step) => step,
            Err(e) => {
                cb.on_unit_error(Stage::Recognize, i + 1, total, &e.to_string());
                return Err(e);
            }
        };
        state = next;

        sink.write_chunk(&outcome.chunk).await?;
        record_page(&mut run.log, cb, &state, &outcome).await?;
        cb.on_unit_complete(Stage::Recognize, i + 1, total, outcome.unit.markdown.len());
    }

    Ok(FinishedRun {
        document: state.document,
        units: state.units,
        ledger: state.ledger,
        fallback_pages: state.fallback_pages,
        blocks: 0,
        final_context: Some(state.context),
    })
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ScanbookError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ScanbookError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`), API key from the
///    provider's usual environment variable.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **`OPENAI_API_KEY`** with the configured model.
/// 5. **Full auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, ScanbookError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, config.model_id());
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", config.model_id());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ScanbookError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_pricing_wins_over_the_list() {
        let config = ConversionConfig::builder()
            .model("gpt-4o")
            .pricing(ModelPricing::new(1.0, 2.0))
            .build()
            .unwrap();
        assert_eq!(pricing(&config), Some(ModelPricing::new(1.0, 2.0)));

        let listed = ConversionConfig::builder().model("gpt-4o-mini").build().unwrap();
        assert_eq!(pricing(&listed), Some(ModelPricing::new(0.15, 0.60)));

        let unknown = ConversionConfig::builder().model("my-local-llava").build().unwrap();
        assert_eq!(pricing(&unknown), None);
    }

    #[test]
    fn missing_chat_model_is_a_configuration_error() {
        let engines = Engines {
            rasterizer: Arc::new(PdfiumRasterizer::new(200, 2500, None)),
            local_ocr: Arc::new(TesseractOcr::new("tesseract", "eng")),
            chat: None,
            token_counter: Arc::new(BpeTokenCounter::for_model("gpt-4o").unwrap()),
        };
        assert!(matches!(
            engines.chat(),
            Err(ScanbookError::ProviderNotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn preflight_checks_the_chat_model_first() {
        let config = ConversionConfig::builder()
            .mode(PipelineMode::Text)
            .model("my-local-llava")
            .build()
            .unwrap();
        let engines = Engines {
            rasterizer: Arc::new(PdfiumRasterizer::new(200, 2500, None)),
            local_ocr: Arc::new(TesseractOcr::new("tesseract", "eng")),
            chat: None,
            token_counter: Arc::new(BpeTokenCounter::for_model("gpt-4o").unwrap()),
        };
        assert!(matches!(
            preflight(&config, &engines).await,
            Err(ScanbookError::ProviderNotConfigured { .. })
        ));
    }
}
