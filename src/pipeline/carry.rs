//! One step of the page-by-page pipeline.
//!
//! The whole run state lives in [`RunState`], which is moved into
//! [`carry_page`] and handed back with the page folded in. There is no other
//! place the carried context can change, which is what keeps page N's prompt
//! a function of pages 1..N-1 and nothing else.

use crate::context::PageContext;
use crate::error::ScanbookError;
use crate::output::{UnitKind, UnitResult};
use crate::pipeline::assemble::Document;
use crate::pipeline::cost::TokenLedger;
use crate::pipeline::postprocess::clean_page_markdown;
use crate::pipeline::recognize::{PageImage, Recognizer};
use std::time::Instant;
use tracing::debug;

/// Accumulated state of a vision run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub context: PageContext,
    pub document: Document,
    pub ledger: TokenLedger,
    pub units: Vec<UnitResult>,
    pub fallback_pages: usize,
}

/// Knobs of the carry step.
#[derive(Debug, Clone, Copy)]
pub struct CarrySettings {
    pub excerpt_chars: usize,
    pub clean_output: bool,
}

/// What one step produced besides the new state.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOutcome {
    /// Text to append to the output, separators included.
    pub chunk: String,
    pub unit: UnitResult,
    /// Set when the page was recognised by the fallback path.
    pub fallback_reason: Option<String>,
}

/// Recognise `page` with the carried context and fold the result in.
pub async fn carry_page(
    mut state: RunState,
    recognizer: &dyn Recognizer,
    page: &PageImage,
    settings: &CarrySettings,
) -> Result<(RunState, PageOutcome), ScanbookError> {
    let start = Instant::now();
    let prompt = state.context.take_prompt();

    let recognition = recognizer
        .recognize(page, &prompt)
        .await
        .map_err(|e| ScanbookError::page(page.page_num, e))?;

    let markdown = if settings.clean_output {
        clean_page_markdown(&recognition.markdown)
    } else {
        recognition.markdown
    };

    state.context = state
        .context
        .advance(recognition.context, &markdown, settings.excerpt_chars);
    let chunk = state.document.push_page(&markdown);
    state.ledger.record(recognition.usage);
    if recognition.fallback_reason.is_some() {
        state.fallback_pages += 1;
    }

    let unit = UnitResult {
        unit: page.page_num,
        kind: UnitKind::Page,
        source: recognition.source,
        markdown,
        input_tokens: recognition.usage.input,
        output_tokens: recognition.usage.output,
        attempts: recognition.attempts,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    state.units.push(unit.clone());
    debug!(
        "Page {} via {} ({} chars), chapter now '{}'",
        page.page_num,
        unit.source,
        unit.markdown.len(),
        state.context.book.current_chapter
    );

    Ok((
        state,
        PageOutcome {
            chunk,
            unit,
            fallback_reason: recognition.fallback_reason,
        },
    ))
}
