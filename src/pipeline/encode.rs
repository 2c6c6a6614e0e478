//! Page image encoding for the vision request body.
//!
//! Pages are already on disk as PNG when a recognizer sees them, so encoding
//! is a read plus base64. PNG stays lossless: JPEG artefacts around small
//! print cost far more recognition accuracy than they save in upload size.
//! `detail: "high"` lets GPT-4-class models tile the full page instead of
//! looking at a single 512 px overview.

use crate::error::RecognizeError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// Read a rendered page and wrap it for the multimodal API.
pub async fn encode_image_file(path: &Path) -> Result<ImageData, RecognizeError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| RecognizeError::Io {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok(encode_png_bytes(&bytes))
}

/// Wrap PNG bytes as base64 image data.
pub fn encode_png_bytes(bytes: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
