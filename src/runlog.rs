//! Persisted run log: one JSON object per line.
//!
//! The log is the audit trail of a run: what was planned and what it was
//! projected to cost, the context carried after every page, every fallback,
//! and the token totals at the end. It is written as the run progresses, so
//! a run that aborts still leaves everything up to the failure behind.

use crate::config::PipelineMode;
use crate::context::PageContext;
use crate::error::ScanbookError;
use crate::pipeline::cost::CostEstimate;
use crate::pipeline::recognize::RecognitionSource;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// One log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        input: String,
        mode: PipelineMode,
        model: String,
        pages: usize,
    },
    BlocksPlanned {
        lines: usize,
        blocks: usize,
        estimate: CostEstimate,
        estimated_usd: f64,
        ceiling_usd: f64,
    },
    PageRecognized {
        page: usize,
        source: RecognitionSource,
        attempts: u32,
        markdown_chars: usize,
        /// The context carried into the next page.
        context: PageContext,
    },
    PageFallback {
        page: usize,
        reason: String,
    },
    BlockFormatted {
        block: usize,
        tokens: usize,
        attempts: u32,
        markdown_chars: usize,
    },
    RunFinished {
        units: usize,
        input_tokens: u64,
        output_tokens: u64,
        estimated_cost_usd: Option<f64>,
    },
}

#[derive(Serialize)]
struct Entry<'a> {
    elapsed_ms: u64,
    #[serde(flatten)]
    event: &'a RunEvent,
}

/// Appends [`RunEvent`]s to a JSON Lines file; a disabled log drops them.
#[derive(Debug)]
pub struct RunLog {
    sink: Option<(PathBuf, File)>,
    started: Instant,
}

impl RunLog {
    /// Open (truncating) the log at `path`, or a disabled log for `None`.
    pub async fn open(path: Option<&Path>) -> Result<Self, ScanbookError> {
        let sink = match path {
            Some(path) => {
                let fail = |source| ScanbookError::RunLogFailed {
                    path: path.to_path_buf(),
                    source,
                };
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(fail)?;
                }
                let file = File::create(path).await.map_err(fail)?;
                Some((path.to_path_buf(), file))
            }
            None => None,
        };
        Ok(Self {
            sink,
            started: Instant::now(),
        })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            started: Instant::now(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(p, _)| p.as_path())
    }

    pub async fn record(&mut self, event: RunEvent) -> Result<(), ScanbookError> {
        let Some((ref path, ref mut file)) = self.sink else {
            return Ok(());
        };
        let entry = Entry {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            event: &event,
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| ScanbookError::Internal(format!("run log serialisation: {}", e)))?;
        line.push('\n');

        let fail = |source| ScanbookError::RunLogFailed {
            path: path.clone(),
            source,
        };
        file.write_all(line.as_bytes()).await.map_err(fail)?;
        file.flush().await.map_err(fail)?;
        Ok(())
    }
}
