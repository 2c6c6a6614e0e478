//! The run's scratch directory: page images and, when kept, OCR text.
//!
//! Pages are written as `{index}.png` (0-based, the same order they were
//! rendered in) so a retained directory can be inspected or fed to a later
//! run by hand. Cleanup happens only when the caller reaches the end of a
//! successful run; a failed or killed run leaves the files where they are.

use crate::error::ScanbookError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Owns the files a run writes next to the output.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    keep: bool,
    written: Vec<PathBuf>,
}

impl ScratchDir {
    /// Create (if needed) the directory at `root`.
    pub async fn create(root: impl Into<PathBuf>, keep: bool) -> Result<Self, ScanbookError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| ScanbookError::ScratchIo {
                path: root.clone(),
                source,
            })?;
        Ok(Self {
            root,
            keep,
            written: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keeps_files(&self) -> bool {
        self.keep
    }

    /// Where page `index` (0-based) is rendered to.
    pub fn image_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("{}.png", index))
    }

    /// Where the OCR text of page `index` is retained.
    pub fn text_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("{}.txt", index))
    }

    /// Remember a file written into the directory so cleanup removes it.
    pub fn track(&mut self, path: PathBuf) {
        self.written.push(path);
    }

    /// Keep the OCR text of page `index` when files are retained; no-op
    /// otherwise.
    pub async fn save_text(&mut self, index: usize, text: &str) -> Result<(), ScanbookError> {
        if !self.keep {
            return Ok(());
        }
        let path = self.text_path(index);
        tokio::fs::write(&path, text)
            .await
            .map_err(|source| ScanbookError::ScratchIo {
                path: path.clone(),
                source,
            })?;
        self.written.push(path);
        Ok(())
    }

    /// Remove every tracked file unless files are kept. Call only on the
    /// success path.
    pub async fn cleanup(self) {
        if self.keep {
            debug!("Keeping {} scratch files in {}", self.written.len(), self.root.display());
            return;
        }
        for path in &self.written {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        // Only succeeds when nothing else lives there.
        let _ = tokio::fs::remove_dir(&self.root).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_removes_tracked_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("temp");
        let mut scratch = ScratchDir::create(&root, false).await.unwrap();

        let img = scratch.image_path(0);
        assert!(img.ends_with("0.png"));
        tokio::fs::write(&img, b"png").await.unwrap();
        scratch.track(img.clone());

        // Not kept, so no text file is written.
        scratch.save_text(0, "raw").await.unwrap();
        assert!(!scratch.text_path(0).exists());

        scratch.cleanup().await;
        assert!(!img.exists());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn kept_files_survive_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scratch = ScratchDir::create(tmp.path().join("t"), true).await.unwrap();
        scratch.save_text(3, "page four").await.unwrap();
        let txt = scratch.text_path(3);

        scratch.cleanup().await;
        assert_eq!(std::fs::read_to_string(txt).unwrap(), "page four");
    }

    #[tokio::test]
    async fn foreign_files_keep_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("shared");
        let scratch = ScratchDir::create(&root, false).await.unwrap();
        std::fs::write(root.join("notes.md"), "mine").unwrap();

        scratch.cleanup().await;
        assert!(root.join("notes.md").exists());
    }
}
