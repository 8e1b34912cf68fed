//! Capture normalisation: raw rasterizer output → validated image bytes.
//!
//! Rasterization primitives disagree on their output shape: DevTools returns
//! raw PNG bytes, canvas-based capturers hand back a
//! `data:image/png;base64,…` URL. Everything downstream (content hashing,
//! upload) must see the same decoded bytes for the same pixels, so both forms
//! are folded into one [`EncodedImage`] here, with the format sniffed from
//! the magic bytes and the dimensions read from the header.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

/// Validated capture output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "jpg",
            _ => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "image/jpeg",
            _ => "image/png",
        }
    }

    /// `data:` URL for hosts that inline images instead of uploading them.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(&self.bytes))
    }
}

/// Decode and validate a capture.
///
/// Accepts raw PNG/JPEG bytes or a base64 `data:` URL.
pub fn normalise_capture(raw: &[u8]) -> Result<EncodedImage, String> {
    if raw.is_empty() {
        return Err("rasterizer returned no data".into());
    }

    let bytes = if raw.starts_with(b"data:") {
        let url = std::str::from_utf8(raw).map_err(|e| format!("data URL is not UTF-8: {e}"))?;
        decode_data_url(url)?
    } else {
        raw.to_vec()
    };

    let format = image::guess_format(&bytes).map_err(|e| format!("unrecognised image data: {e}"))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(format!("unsupported image format {format:?}"));
    }

    let (width, height) = ImageReader::with_format(Cursor::new(&bytes), format)
        .into_dimensions()
        .map_err(|e| format!("unreadable image header: {e}"))?;
    if width == 0 || height == 0 {
        return Err(format!("image has zero area ({width}x{height})"));
    }

    debug!("Capture: {:?} {}x{} px, {} bytes", format, width, height, bytes.len());
    Ok(EncodedImage {
        bytes,
        format,
        width,
        height,
    })
}

/// Decode the payload of a `data:<mime>;base64,<payload>` URL.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, String> {
    let (header, payload) = url
        .split_once(',')
        .ok_or_else(|| "data URL has no payload".to_string())?;
    if !header.ends_with(";base64") {
        return Err(format!("data URL is not base64-encoded: {header}"));
    }
    STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64 payload: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("encode should succeed");
        buf
    }

    #[test]
    fn raw_png_is_accepted() {
        let img = normalise_capture(&png(10, 4)).expect("valid png");
        assert_eq!(img.format, ImageFormat::Png);
        assert_eq!((img.width, img.height), (10, 4));
        assert_eq!(img.extension(), "png");
    }

    #[test]
    fn data_url_decodes_to_same_bytes() {
        let raw = png(3, 3);
        let url = format!("data:image/png;base64,{}", STANDARD.encode(&raw));
        let img = normalise_capture(url.as_bytes()).expect("valid data url");
        assert_eq!(img.bytes, raw);
        assert_eq!(img.to_data_url(), url);
    }

    #[test]
    fn empty_and_garbage_are_rejected() {
        assert!(normalise_capture(b"").is_err());
        assert!(normalise_capture(b"definitely not an image").is_err());
        assert!(normalise_capture(b"data:image/png,plain").is_err());
    }
}
