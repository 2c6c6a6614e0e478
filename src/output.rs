//! Result types returned by the conversion entry points.

use crate::config::PipelineMode;
use crate::context::PageContext;
use crate::pipeline::recognize::RecognitionSource;
use serde::{Deserialize, Serialize};

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    /// The assembled document, identical to what was appended to the sink.
    pub markdown: String,

    /// One entry per page (vision) or block (text), in output order.
    pub units: Vec<UnitResult>,

    /// Context after the last page. Only the vision pipeline carries one.
    pub final_context: Option<PageContext>,

    pub stats: ConversionStats,
}

/// What a unit of output was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Page,
    Block,
}

/// One appended unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitResult {
    /// 1-indexed page number (vision) or block number (text).
    pub unit: usize,
    pub kind: UnitKind,
    pub source: RecognitionSource,
    /// Cleaned Markdown of the unit, before the assembler's separators.
    pub markdown: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Model attempts; 0 when no model was involved.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionStats {
    pub mode: PipelineMode,

    /// Pages in the PDF.
    pub total_pages: usize,

    /// Units appended to the output.
    pub processed_units: usize,

    /// Pages that went through local OCR after a refusal.
    pub fallback_pages: usize,

    /// Text blocks planned (text pipeline).
    pub blocks: usize,

    pub total_input_tokens: u64,
    pub total_output_tokens: u64,

    /// Spend at list price; `None` when the model has no known pricing.
    pub estimated_cost_usd: Option<f64>,

    pub render_duration_ms: u64,
    pub recognition_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// PDF document metadata, available without converting anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
    /// Whether a password was needed to open the file.
    pub encrypted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_result_serialises_source_in_snake_case() {
        let unit = UnitResult {
            unit: 3,
            kind: UnitKind::Page,
            source: RecognitionSource::LocalOcr,
            markdown: "text".into(),
            input_tokens: 0,
            output_tokens: 0,
            attempts: 0,
            duration_ms: 12,
        };
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["source"], "local_ocr");
        assert_eq!(json["kind"], "page");
    }
}
