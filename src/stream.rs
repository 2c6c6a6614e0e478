//! Streaming conversion API: emit pages as the carrier advances.
//!
//! Unlike the eager [`crate::convert::convert`] which returns only after the
//! whole book is done, [`convert_stream`] yields one [`UnitResult`] per page.
//! Pages still go one at a time, in order: page N is not requested before
//! page N-1's context is known, so the stream is lazy and a slow consumer
//! simply slows the run down.
//!
//! Only the vision pipeline streams. The text pipeline has to OCR and price
//! the whole book before its first block is sent, so there is nothing to
//! yield early.

use crate::config::{ConversionConfig, PipelineMode};
use crate::convert::{
    carry_settings, finished_event, page_recognizer, preflight, prepare, progress, record_page,
    Engines, PreparedRun,
};
use crate::error::ScanbookError;
use crate::output::{ConversionStats, UnitResult};
use crate::pipeline::carry::{carry_page, CarrySettings, RunState};
use crate::pipeline::cost::{pricing_for, ModelPricing};
use crate::pipeline::recognize::Recognizer;
use crate::progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
use futures::stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};

/// A boxed stream of page results.
///
/// The stream ends after the first `Err`; pages already yielded stay valid.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<UnitResult, ScanbookError>> + Send>>;

/// Convert a PDF to Markdown, yielding pages in order.
///
/// # Returns
/// - `Ok(PageStream)` once the pages are rendered
/// - `Err(ScanbookError)` for errors before the first page (file not found,
///   not a PDF, no provider, text mode requested, …)
pub async fn convert_stream(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<PageStream, ScanbookError> {
    let engines = Engines::from_config(config)?;
    convert_stream_with(input_str, config, &engines).await
}

/// [`convert_stream`] with caller-supplied engines.
pub async fn convert_stream_with(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
    engines: &Engines,
) -> Result<PageStream, ScanbookError> {
    if config.mode != PipelineMode::Vision {
        return Err(ScanbookError::InvalidConfig(
            "streaming is only available in vision mode".into(),
        ));
    }
    let input_str = input_str.as_ref();
    info!("Starting streaming conversion: {}", input_str);

    preflight(config, engines).await?;
    let run = prepare(input_str, config, engines).await?;
    let recognizer = page_recognizer(config, engines)?;
    progress(config).on_stage_start(Stage::Recognize, run.pages.len());

    let carrier = Carrier {
        run,
        recognizer,
        settings: carry_settings(config),
        state: RunState::default(),
        next: 0,
        callback: config.progress_callback.clone(),
        pricing: config.pricing.or_else(|| pricing_for(config.model_id())),
        mode: config.mode,
    };

    let pages = stream::unfold(Some(carrier), |carrier| async move {
        let mut carrier = carrier?;
        match carrier.step().await {
            Ok(Some(unit)) => Some((Ok(unit), Some(carrier))),
            Ok(None) => {
                carrier.finish().await;
                None
            }
            Err(e) => Some((Err(e), None)),
        }
    });
    Ok(Box::pin(pages))
}

/// Everything the stream owns between pages.
struct Carrier {
    run: PreparedRun,
    recognizer: Arc<dyn Recognizer>,
    settings: CarrySettings,
    state: RunState,
    next: usize,
    callback: Option<ProgressCallback>,
    pricing: Option<ModelPricing>,
    mode: PipelineMode,
}

impl Carrier {
    fn callback(&self) -> &dyn ConversionProgressCallback {
        match self.callback {
            Some(ref cb) => cb.as_ref(),
            None => &NoopProgressCallback,
        }
    }

    /// Recognise the next page; `None` when all pages are done.
    async fn step(&mut self) -> Result<Option<UnitResult>, ScanbookError> {
        let Some(page) = self.run.pages.get(self.next).cloned() else {
            return Ok(None);
        };
        let total = self.run.pages.len();
        let number = self.next + 1;
        self.callback().on_unit_start(Stage::Recognize, number, total);

        let state = std::mem::take(&mut self.state);
        let (state, outcome) = match carry_page(state, self.recognizer.as_ref(), &page, &self.settings).await {
            Ok(step) => step,
            Err(e) => {
                self.callback()
                    .on_unit_error(Stage::Recognize, number, total, &e.to_string());
                return Err(e);
            }
        };
        self.state = state;
        self.next += 1;

        let cb: &dyn ConversionProgressCallback = match self.callback {
            Some(ref cb) => cb.as_ref(),
            None => &NoopProgressCallback,
        };
        record_page(&mut self.run.log, cb, &self.state, &outcome).await?;
        cb.on_unit_complete(Stage::Recognize, number, total, outcome.unit.markdown.len());
        Ok(Some(outcome.unit))
    }

    /// Close the run log and the scratch directory after the last page.
    async fn finish(self) {
        let units = self.state.units.len();
        let stats = ConversionStats {
            mode: self.mode,
            total_pages: self.run.total_pages,
            processed_units: units,
            fallback_pages: self.state.fallback_pages,
            total_input_tokens: self.state.ledger.sent,
            total_output_tokens: self.state.ledger.received,
            estimated_cost_usd: self.pricing.map(|p| self.state.ledger.spend(&p).total_usd()),
            render_duration_ms: self.run.render_duration_ms,
            ..Default::default()
        };

        let mut run = self.run;
        if let Err(e) = run.log.record(finished_event(&stats)).await {
            warn!("Could not finish the run log: {}", e);
        }
        let PreparedRun { scratch, .. } = run;
        scratch.cleanup().await;

        if let Some(cb) = self.callback {
            cb.on_conversion_complete(units);
        }
        info!("Streaming conversion complete: {} pages", units);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chunk::BpeTokenCounter;
    use crate::pipeline::ocr::TesseractOcr;
    use crate::pipeline::render::PdfiumRasterizer;

    #[tokio::test]
    async fn text_mode_cannot_stream() {
        let config = ConversionConfig::builder()
            .mode(PipelineMode::Text)
            .build()
            .unwrap();
        let engines = Engines {
            rasterizer: Arc::new(PdfiumRasterizer::new(200, 2500, None)),
            local_ocr: Arc::new(TesseractOcr::new("tesseract", "eng")),
            chat: None,
            token_counter: Arc::new(BpeTokenCounter::for_model("gpt-4o").unwrap()),
        };
        let err = convert_stream_with("book.pdf", &config, &engines).await.err();
        assert!(matches!(err, Some(ScanbookError::InvalidConfig(_))));
    }
}
