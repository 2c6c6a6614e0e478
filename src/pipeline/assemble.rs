//! Assembly of per-unit Markdown into the output document.
//!
//! Every unit (a page in vision mode, a block in text mode) is appended as
//! soon as it is recognised, preceded by one newline, and by a second one
//! when it opens with a heading so the heading always starts a paragraph.
//! Pages already appended stay in the output file when a later page fails.

use crate::error::ScanbookError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// The text appended to the document for one unit of Markdown.
pub fn page_chunk(markdown: &str) -> String {
    let mut chunk = String::with_capacity(markdown.len() + 2);
    chunk.push('\n');
    if markdown.starts_with('#') {
        chunk.push('\n');
    }
    chunk.push_str(markdown);
    chunk
}

/// In-memory copy of everything appended so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    markdown: String,
    parts: usize,
}

impl Document {
    /// Append one unit, returning the chunk that was added.
    pub fn push_page(&mut self, markdown: &str) -> String {
        let chunk = page_chunk(markdown);
        self.markdown.push_str(&chunk);
        self.parts += 1;
        chunk
    }

    pub fn as_str(&self) -> &str {
        &self.markdown
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    pub fn into_markdown(self) -> String {
        self.markdown
    }
}

/// Destination for chunks as they are produced.
#[async_trait]
pub trait PageSink: Send {
    async fn write_chunk(&mut self, chunk: &str) -> Result<(), ScanbookError>;
}

/// Appends chunks to a file that is created empty when the sink opens.
#[derive(Debug)]
pub struct AppendFile {
    path: PathBuf,
}

impl AppendFile {
    /// Create (or truncate) `path`, creating missing parent directories.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, ScanbookError> {
        let path = path.into();
        let fail = |source| ScanbookError::OutputWriteFailed {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
        tokio::fs::write(&path, b"").await.map_err(fail)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PageSink for AppendFile {
    async fn write_chunk(&mut self, chunk: &str) -> Result<(), ScanbookError> {
        let fail = |source| ScanbookError::OutputWriteFailed {
            path: self.path.clone(),
            source,
        };
        // Opened per chunk so every completed unit is on disk before the next
        // request goes out.
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(fail)?;
        file.write_all(chunk.as_bytes()).await.map_err(fail)?;
        file.flush().await.map_err(fail)?;
        Ok(())
    }
}

/// Sink that drops everything; the document is still kept in memory.
#[derive(Debug, Default)]
pub struct Discard;

#[async_trait]
impl PageSink for Discard {
    async fn write_chunk(&mut self, _chunk: &str) -> Result<(), ScanbookError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_get_an_extra_newline() {
        assert_eq!(page_chunk("# Chapter One\n\nText"), "\n\n# Chapter One\n\nText");
        assert_eq!(page_chunk("plain text"), "\nplain text");
        assert_eq!(page_chunk(""), "\n");
    }

    #[test]
    fn document_concatenates_chunks_in_order() {
        let mut doc = Document::default();
        doc.push_page("# One");
        doc.push_page("continued");
        assert_eq!(doc.as_str(), "\n\n# One\ncontinued");
        assert_eq!(doc.parts(), 2);
    }

    #[tokio::test]
    async fn append_file_starts_empty_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("book.md");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale content from an earlier run").unwrap();

        let mut sink = AppendFile::create(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        sink.write_chunk("\npage one").await.unwrap();
        sink.write_chunk("\n\n# Two").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "\npage one\n\n# Two");
    }
}
