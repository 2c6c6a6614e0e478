//! CLI binary for scanbook-md.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use scanbook_md::{
    convert_to_file, inspect, ConversionConfig, ConversionProgressCallback, ModelPricing,
    PageSelection, PipelineMode, ProgressCallback, Stage,
};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar per stage plus a log line per unit.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-unit wall-clock start times for elapsed reporting.
    start_times: Mutex<HashMap<usize, Instant>>,
    fallbacks: AtomicUsize,
}

impl CliProgressCallback {
    /// A spinner until the first stage announces its size.
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            fallbacks: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, unit: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&unit))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} {msg}  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_style(progress_style);
        self.bar.set_prefix(stage.to_string());
        self.bar.set_message(format!("{}s", stage.unit()));
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total} {}s", stage.unit()))
        ));
    }

    fn on_unit_start(&self, _stage: Stage, unit: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(unit, Instant::now());
        }
    }

    fn on_unit_complete(&self, stage: Stage, unit: usize, total: usize, text_len: usize) {
        let secs = self.elapsed_secs(unit);
        self.bar.println(format!(
            "  {} {} {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            capitalise(stage.unit()),
            unit,
            total,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, stage: Stage, unit: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(unit);
        let msg = truncate(error, 80);
        self.bar.println(format!(
            "  {} {} {:>3}/{:<3}  {}  {}",
            red("✗"),
            capitalise(stage.unit()),
            unit,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
    }

    fn on_page_fallback(&self, page_num: usize, reason: &str) {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            yellow("↺"),
            page_num,
            yellow(&format!("local OCR ({})", truncate(reason, 60))),
        ));
    }

    fn on_conversion_complete(&self, units: usize) {
        self.bar.finish_and_clear();
        let fallbacks = self.fallbacks.load(Ordering::SeqCst);
        if fallbacks == 0 {
            eprintln!("{} {} units converted", green("✔"), bold(&units.to_string()));
        } else {
            eprintln!(
                "{} {} units converted  ({} via local OCR)",
                cyan("⚠"),
                bold(&units.to_string()),
                yellow(&fallbacks.to_string()),
            );
        }
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # OCR locally, reformat with the model (default text mode)
  scanbook scans/clandestine.pdf clandestine.md

  # Page images straight to a vision model, context carried page to page
  scanbook --mode vision scans/clandestine.pdf clandestine.md

  # Keep the rendered pages and OCR text for inspection
  scanbook --keep-images --temp-dir work/ book.pdf book.md

  # A cheaper model with an explicit price and a tighter ceiling
  scanbook --model gpt-4o-mini --cost-ceiling 2 book.pdf book.md

  # Model without a list price: say what it costs per 1M tokens
  scanbook --provider ollama --model llava --price-in 0 --price-out 0 book.pdf book.md

  # Inspect PDF metadata (no API key needed)
  scanbook --inspect-only book.pdf

PIPELINES:
  text    tesseract → 1000-token blocks → cost check → model reformat
  vision  page image + previous-page excerpt + book context → model;
          pages the model refuses are OCRed locally instead

COST CEILING (text mode):
  The whole run is priced before the first request. If the estimate is
  above --cost-ceiling (default $10) the run stops without spending.

RUN LOG:
  <OUTPUT>.log.jsonl by default: run_started, blocks_planned,
  page_recognized, page_fallback, block_formatted, run_finished.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (skips the first-run download)
  PDFIUM_AUTO_CACHE_DIR   Where the downloaded libpdfium is cached
  SCANBOOK_*              Defaults for most flags (see --help)
"#;

/// Convert scanned book PDFs to Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "scanbook",
    version,
    about = "Convert scanned book PDFs to Markdown with local OCR or Vision LLMs",
    long_about = "Convert a scanned book (a PDF of page images) into one Markdown document. \
The text pipeline OCRs pages locally with Tesseract and has a hosted model reformat the text; \
the vision pipeline sends each page image to a multimodal model, carrying the book's context \
from page to page.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Markdown file to write; truncated first, then appended page by page.
    #[arg(required_unless_present = "inspect_only")]
    output: Option<PathBuf>,

    /// Recognition pipeline.
    #[arg(long, env = "SCANBOOK_MODE", value_enum, default_value = "text")]
    mode: ModeArg,

    /// LLM model ID (e.g. gpt-4o, gpt-4o-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "SCANBOOK_PAGES", default_value = "all")]
    pages: String,

    /// Rendering DPI (72–600).
    #[arg(long, env = "SCANBOOK_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "SCANBOOK_PASSWORD")]
    password: Option<String>,

    /// Tesseract language(s), e.g. eng or eng+spa.
    #[arg(long, env = "SCANBOOK_OCR_LANG", default_value = "eng")]
    ocr_lang: String,

    /// Tesseract executable.
    #[arg(long, env = "SCANBOOK_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// Token budget of one text block.
    #[arg(long, env = "SCANBOOK_BLOCK_TOKENS", default_value_t = 1000)]
    block_tokens: usize,

    /// Refuse text-mode runs projected to cost more than this (USD).
    #[arg(long, env = "SCANBOOK_COST_CEILING", default_value_t = 10.0)]
    cost_ceiling: f64,

    /// Input price, USD per 1M tokens (for models without a list price).
    #[arg(long, env = "SCANBOOK_PRICE_IN", requires = "price_out")]
    price_in: Option<f64>,

    /// Output price, USD per 1M tokens.
    #[arg(long, env = "SCANBOOK_PRICE_OUT", requires = "price_in")]
    price_out: Option<f64>,

    /// Base sampling temperature.
    #[arg(long, env = "SCANBOOK_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Max LLM output tokens per request.
    #[arg(long, env = "SCANBOOK_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Fail on a refused page instead of OCRing it locally (vision mode).
    #[arg(long, env = "SCANBOOK_NO_FALLBACK")]
    no_fallback: bool,

    /// Use fallback OCR text as-is, without a model correction pass.
    #[arg(long, env = "SCANBOOK_NO_CORRECTION")]
    no_correction: bool,

    /// Skip the Markdown cleanup pass.
    #[arg(long, env = "SCANBOOK_RAW")]
    raw: bool,

    /// Text file replacing the page (vision) or block (text) instruction.
    #[arg(long, env = "SCANBOOK_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Run log path [default: <OUTPUT>.log.jsonl].
    #[arg(long, env = "SCANBOOK_RUN_LOG")]
    run_log: Option<PathBuf>,

    /// Do not write a run log.
    #[arg(long, conflicts_with = "run_log")]
    no_run_log: bool,

    /// Keep rendered page images (and OCR text) after a successful run.
    #[arg(long, env = "SCANBOOK_KEEP_IMAGES")]
    keep_images: bool,

    /// Directory for page images.
    #[arg(long, env = "SCANBOOK_TEMP_DIR", default_value = "temp")]
    temp_dir: PathBuf,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "SCANBOOK_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print PDF metadata only, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Print metadata or run statistics as JSON on stdout.
    #[arg(long, env = "SCANBOOK_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SCANBOOK_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SCANBOOK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SCANBOOK_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Text,
    Vision,
}

impl From<ModeArg> for PipelineMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Text => PipelineMode::Text,
            ModeArg::Vision => PipelineMode::Vision,
        }
    }
}

/// Make sure a PDFium library is on disk before any page is rendered.
fn ensure_pdf_engine(silent: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if silent {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download the PDFium engine")?;
        return Ok(());
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    bar.set_prefix("PDF engine");
    bar.enable_steady_tick(Duration::from_millis(80));

    let report = |downloaded: u64, total: Option<u64>| {
        if let Some(total) = total {
            if bar.length() != Some(total) {
                bar.set_length(total);
            }
        }
        bar.set_position(downloaded);
    };
    tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(Some(&report)))
        .context("Failed to download the PDFium engine")?;
    bar.finish_with_message("ready");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar provides the feedback; library INFO logs would tear it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // First run only: fetch libpdfium (~30 MB) into the user cache.
    ensure_pdf_engine(cli.quiet || cli.json)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&cli.input, cli.password.as_deref())
            .await
            .context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            println!("File:         {}", cli.input);
            if let Some(ref t) = meta.title {
                println!("Title:        {}", t);
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {}", a);
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            println!("Encrypted:    {}", meta.encrypted);
            if let Some(ref p) = meta.producer {
                println!("Producer:     {}", p);
            }
            if let Some(ref c) = meta.creator {
                println!("Creator:      {}", c);
            }
        }
        return Ok(());
    }

    let output_path = cli
        .output
        .clone()
        .context("An OUTPUT path is required unless --inspect-only is given")?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, &output_path, progress_cb).await?;
    let run_log = config.run_log.clone();

    // ── Run conversion ───────────────────────────────────────────────────
    let output = convert_to_file(&cli.input, &output_path, &config)
        .await
        .with_context(|| format!("Conversion of {} failed", cli.input))?;
    let stats = &output.stats;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(stats).context("Failed to serialise statistics")?
        );
    } else if !cli.quiet {
        eprintln!(
            "{}  {} {}s  {}ms  →  {}",
            green("✔"),
            stats.processed_units,
            match stats.mode {
                PipelineMode::Text => "block",
                PipelineMode::Vision => "page",
            },
            stats.total_duration_ms,
            bold(&output_path.display().to_string()),
        );
        let cost = stats
            .estimated_cost_usd
            .map(|usd| format!("  ≈ ${usd:.4}"))
            .unwrap_or_default();
        eprintln!(
            "   {} tokens in  /  {} tokens out{}",
            dim(&stats.total_input_tokens.to_string()),
            dim(&stats.total_output_tokens.to_string()),
            dim(&cost),
        );
        if let Some(ref log) = run_log {
            eprintln!("   run log: {}", dim(&log.display().to_string()));
        }
    }

    Ok(())
}

/// Map CLI args to `ConversionConfig`.
async fn build_config(
    cli: &Cli,
    output: &Path,
    progress: Option<ProgressCallback>,
) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .mode(cli.mode.into())
        .dpi(cli.dpi)
        .pages(parse_pages(&cli.pages)?)
        .ocr_language(cli.ocr_lang.clone())
        .tesseract_path(cli.tesseract.clone())
        .block_tokens(cli.block_tokens)
        .cost_ceiling_usd(cli.cost_ceiling)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .fallback_to_ocr(!cli.no_fallback)
        .correct_fallback_ocr(!cli.no_correction)
        .clean_output(!cli.raw)
        .keep_images(cli.keep_images)
        .temp_dir(cli.temp_dir.clone())
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password.clone());
    }
    if let (Some(input), Some(output)) = (cli.price_in, cli.price_out) {
        builder = builder.pricing(ModelPricing::new(input, output));
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if !cli.no_run_log {
        let path = cli
            .run_log
            .clone()
            .unwrap_or_else(|| default_run_log(output));
        builder = builder.run_log(path);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// `<OUTPUT>.log.jsonl`
fn default_run_log(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".log.jsonl");
    PathBuf::from(name)
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }

        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .context(format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(&p) = pages.iter().find(|&&p| p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }

        return Ok(PageSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(PageSelection::Single(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_selections_parse() {
        assert_eq!(parse_pages("all").unwrap(), PageSelection::All);
        assert_eq!(parse_pages(" 5 ").unwrap(), PageSelection::Single(5));
        assert_eq!(parse_pages("3-15").unwrap(), PageSelection::Range(3, 15));
        assert_eq!(parse_pages("1,3,5").unwrap(), PageSelection::Set(vec![1, 3, 5]));
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("9-2").is_err());
        assert!(parse_pages("two").is_err());
    }

    #[test]
    fn run_log_sits_next_to_the_output() {
        assert_eq!(
            default_run_log(Path::new("out/book.md")),
            PathBuf::from("out/book.md.log.jsonl")
        );
    }

    #[test]
    fn long_messages_are_truncated() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 5), "abcd\u{2026}");
    }
}
