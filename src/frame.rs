//! Upload gate and decode step.
//!
//! Both checks run before any inference work, and each has its own failure
//! class so the HTTP layer can answer 400 without touching the model.

use image::RgbImage;

use crate::error::PipelineError;

const IMAGE_MEDIA_PREFIX: &str = "image/";

/// Reject anything not declared as `image/*`.
pub fn check_content_type(content_type: &str) -> Result<(), PipelineError> {
    let normalized = content_type.trim().to_ascii_lowercase();
    if normalized.starts_with(IMAGE_MEDIA_PREFIX) {
        Ok(())
    } else {
        Err(PipelineError::UnsupportedMediaType(content_type.to_string()))
    }
}

/// Decode uploaded bytes into an 8-bit RGB raster.
///
/// The format is sniffed from the bytes, not from the declared content type.
/// Alpha and higher bit depths are dropped by the RGB conversion.
pub fn decode_upload(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::InvalidImage("empty upload".to_string()));
    }
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))?;
    let rgb = decoded.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(PipelineError::InvalidImage(
            "decoded image has no pixels".to_string(),
        ));
    }
    Ok(rgb)
}

/// Content type for a local file, guessed from its extension.
pub fn content_type_for_path(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}
