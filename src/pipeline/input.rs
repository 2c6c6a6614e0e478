//! Input resolution: a local path or an HTTP(S) URL becomes a local PDF.
//!
//! pdfium opens files, not streams, so a URL is downloaded into a
//! [`TempDir`] that lives as long as the [`ResolvedInput`]. Either way the
//! first four bytes must be `%PDF`; a scanned JPEG renamed to `.pdf` fails
//! here with a readable error instead of deep inside pdfium.

use crate::error::ScanbookError;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A PDF on the local file system.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// Downloaded copy; removed when this value is dropped.
    Downloaded {
        url: String,
        path: PathBuf,
        _temp_dir: TempDir,
    },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// How the input was named by the caller, for logs.
    pub fn display_name(&self) -> String {
        match self {
            ResolvedInput::Local(p) => p.display().to_string(),
            ResolvedInput::Downloaded { url, .. } => url.clone(),
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a local PDF, downloading URLs.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, ScanbookError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input)).await
    }
}

async fn resolve_local(path: &Path) -> Result<ResolvedInput, ScanbookError> {
    let path = path.to_path_buf();
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(ScanbookError::PermissionDenied { path });
        }
        Err(_) => return Err(ScanbookError::FileNotFound { path }),
    };

    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..]).await {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(ScanbookError::PermissionDenied { path });
            }
            // A directory opens fine on Unix but cannot be read.
            Err(_) => return Err(ScanbookError::FileNotFound { path }),
        }
    }
    if &magic != PDF_MAGIC {
        return Err(ScanbookError::NotAPdf { path, magic });
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, ScanbookError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| ScanbookError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            ScanbookError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(classify)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let temp_dir = TempDir::new().map_err(|e| ScanbookError::Internal(format!("tempdir: {}", e)))?;
    let path = temp_dir.path().join(filename_from_url(url));
    let write_err = |e: std::io::Error| ScanbookError::Internal(format!("Failed to write temp file: {}", e));
    let mut file = tokio::fs::File::create(&path).await.map_err(write_err)?;

    let mut head = Vec::with_capacity(4);
    let mut total = 0usize;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(classify)?;
        if head.len() < 4 {
            let take = (4 - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        total += chunk.len();
        file.write_all(&chunk).await.map_err(write_err)?;
    }
    file.flush().await.map_err(write_err)?;

    if head.as_slice() != PDF_MAGIC {
        let mut magic = [0u8; 4];
        magic[..head.len()].copy_from_slice(&head);
        return Err(ScanbookError::NotAPdf { path, magic });
    }

    info!("Downloaded {} bytes to {}", total, path.display());
    Ok(ResolvedInput::Downloaded {
        url: url.to_string(),
        path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of `url` when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_urls() {
        assert!(is_url("https://example.com/book.pdf"));
        assert!(is_url("http://example.com/book.pdf"));
        assert!(!is_url("/tmp/book.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn file_name_comes_from_the_url_path() {
        assert_eq!(filename_from_url("https://a.org/scans/marquez.pdf?x=1"), "marquez.pdf");
        assert_eq!(filename_from_url("https://a.org/download"), "downloaded.pdf");
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, ScanbookError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn non_pdf_is_rejected_with_its_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("scan.pdf");
        std::fs::write(&path, b"\xFF\xD8\xFF\xE0 jpeg data").unwrap();

        let err = resolve_input(path.to_str().unwrap(), 5).await.unwrap_err();
        match err {
            ScanbookError::NotAPdf { magic, .. } => assert_eq!(magic, [0xFF, 0xD8, 0xFF, 0xE0]),
            other => panic!("expected NotAPdf, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_files_are_not_pdfs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tiny.pdf");
        std::fs::write(&path, b"%P").unwrap();
        assert!(matches!(
            resolve_input(path.to_str().unwrap(), 5).await,
            Err(ScanbookError::NotAPdf { .. })
        ));
    }

    #[tokio::test]
    async fn pdf_header_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("book.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let resolved = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(resolved.path(), path.as_path());
    }
}
