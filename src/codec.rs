use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unable to determine image format")]
    UnknownFormat,

    #[error("Error decoding image: {0}")]
    Decode(String),

    #[error("Error converting to WebP: {0}")]
    Encode(String),

    #[error("{0:?} decoding is not compiled in, rebuild with the `avif-native` feature")]
    Unsupported(ImageFormat),
}

/// Fails when this build cannot decode AVIF sources. Checked at startup so a
/// build without a decoder refuses to serve instead of failing every request.
pub fn ensure_avif_decoding() -> Result<(), CodecError> {
    // ImageFormat::reading_enabled() also holds for the encoder-only `avif` feature
    if cfg!(feature = "avif-native") {
        Ok(())
    } else {
        Err(CodecError::Unsupported(ImageFormat::Avif))
    }
}

/// Image decode/encode capability. Both calls are CPU bound and are run
/// off the async executor by the pipeline.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError>;

    fn encode_webp(&self, image: &DynamicImage) -> Result<Vec<u8>, CodecError>;
}

/// Codec backed by the `image` crate.
#[derive(Clone, Debug)]
pub struct ImageCodec {
    max_alloc: u64,
}

impl Default for ImageCodec {
    fn default() -> Self {
        // 1 GiB allocator limit for decoders
        ImageCodec {
            max_alloc: 1024 * 1024 * 1024,
        }
    }
}

impl Codec for ImageCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        if reader.format().is_none() {
            return Err(CodecError::UnknownFormat);
        }

        let mut limits = Limits::no_limits();
        limits.max_alloc = Some(self.max_alloc);
        reader.limits(limits);

        reader.decode().map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_webp(&self, image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
        // the WebP encoder only takes 8-bit RGB(A)
        let image = DynamicImage::ImageRgba8(image.to_rgba8());
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, ImageFormat::WebP)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buffer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::new_rgb8(width, height);
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn decodes_and_encodes_webp() {
        let codec = ImageCodec::default();
        let image = codec.decode(&png_bytes(8, 6)).unwrap();
        assert_eq!((image.width(), image.height()), (8, 6));

        let webp = codec.encode_webp(&image).unwrap();
        assert_eq!(&webp[0..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");
    }

    fn avif_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::new_rgb8(width, height);
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Avif).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn startup_check_agrees_with_avif_decoder() {
        let decoded = ImageCodec::default().decode(&avif_bytes(16, 12));
        assert_eq!(decoded.is_ok(), ensure_avif_decoding().is_ok());
    }

    #[cfg(feature = "avif-native")]
    #[test]
    fn decodes_avif_sources() {
        let codec = ImageCodec::default();
        let image = codec.decode(&avif_bytes(16, 12)).unwrap();
        assert_eq!((image.width(), image.height()), (16, 12));

        let webp = codec.encode_webp(&image).unwrap();
        assert_eq!(&webp[8..12], b"WEBP");
    }

    #[test]
    fn garbage_is_rejected() {
        let codec = ImageCodec::default();
        assert!(matches!(
            codec.decode(b"definitely not an image"),
            Err(CodecError::UnknownFormat)
        ));
    }
}
