//! Image decode/encode behind the [`ImageCodec`] trait.
//!
//! All methods are synchronous and CPU-bound; stage handlers call them from
//! `spawn_blocking`. [`RasterCodec`] is the production implementation on the
//! `image` crate.

use crate::error::CodecError;
use crate::model::{ImageFormat, ImageMetadata};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage};

/// An encoded JPEG rendition
#[derive(Debug, Clone)]
pub struct Rendition {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

pub trait ImageCodec: Send + Sync {
    /// Decode the full image and report its structure
    fn probe(&self, bytes: &[u8]) -> Result<ImageMetadata, CodecError>;

    /// Fit inside `max_width`×`max_height`, keeping aspect ratio, never upscaling
    fn fit_within(&self, bytes: &[u8], max_width: u32, max_height: u32) -> Result<Rendition, CodecError>;

    /// Scale to cover `width`×`height` and center-crop to exactly that size
    fn cover(&self, bytes: &[u8], width: u32, height: u32) -> Result<Rendition, CodecError>;
}

/// `image`-crate codec producing baseline JPEGs
#[derive(Debug, Clone)]
pub struct RasterCodec {
    jpeg_quality: u8,
}

impl RasterCodec {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), CodecError> {
        let guessed = image::guess_format(bytes)
            .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))?;

        let format = match guessed {
            image::ImageFormat::Jpeg => ImageFormat::Jpeg,
            image::ImageFormat::Png => ImageFormat::Png,
            image::ImageFormat::Gif => ImageFormat::Gif,
            image::ImageFormat::WebP => ImageFormat::Webp,
            other => return Err(CodecError::UnsupportedFormat(format!("{other:?}"))),
        };

        let img = image::load_from_memory_with_format(bytes, guessed)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        Ok((img, format))
    }

    fn encode_jpeg(&self, img: &DynamicImage) -> Result<Rendition, CodecError> {
        // JPEG has no alpha channel
        let rgb = img.to_rgb8();
        let mut buf = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality);
        rgb.write_with_encoder(encoder)
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        Ok(Rendition {
            bytes: Bytes::from(buf),
            width: rgb.width(),
            height: rgb.height(),
        })
    }
}

impl Default for RasterCodec {
    fn default() -> Self {
        Self::new(85)
    }
}

impl ImageCodec for RasterCodec {
    fn probe(&self, bytes: &[u8]) -> Result<ImageMetadata, CodecError> {
        let (img, format) = self.decode(bytes)?;
        let color = img.color();

        Ok(ImageMetadata {
            width: img.width(),
            height: img.height(),
            format,
            color_space: color_space(color).to_string(),
            channels: color.channel_count(),
            has_alpha: color.has_alpha(),
        })
    }

    fn fit_within(&self, bytes: &[u8], max_width: u32, max_height: u32) -> Result<Rendition, CodecError> {
        let (img, _) = self.decode(bytes)?;

        let img = if img.width() <= max_width && img.height() <= max_height {
            img
        } else {
            img.resize(max_width, max_height, FilterType::Lanczos3)
        };

        self.encode_jpeg(&img)
    }

    fn cover(&self, bytes: &[u8], width: u32, height: u32) -> Result<Rendition, CodecError> {
        let (img, _) = self.decode(bytes)?;
        let img = img.resize_to_fill(width, height, FilterType::Lanczos3);
        self.encode_jpeg(&img)
    }
}

fn color_space(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::La8 | ColorType::L16 | ColorType::La16 => "b-w",
        _ => "srgb",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Jpeg)
            .unwrap();
        buf.into_inner()
    }

    fn png_rgba_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |_, _| Rgba([10, 20, 30, 128]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_probe_jpeg() {
        let meta = RasterCodec::default().probe(&jpeg_bytes(64, 48)).unwrap();
        assert_eq!(meta.width, 64);
        assert_eq!(meta.height, 48);
        assert_eq!(meta.format, ImageFormat::Jpeg);
        assert_eq!(meta.color_space, "srgb");
        assert_eq!(meta.channels, 3);
        assert!(!meta.has_alpha);
    }

    #[test]
    fn test_probe_png_with_alpha() {
        let meta = RasterCodec::default().probe(&png_rgba_bytes(10, 10)).unwrap();
        assert_eq!(meta.format, ImageFormat::Png);
        assert_eq!(meta.channels, 4);
        assert!(meta.has_alpha);
    }

    #[test]
    fn test_probe_greyscale() {
        let img = GrayImage::from_fn(8, 8, |_, _| Luma([200]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();

        let meta = RasterCodec::default().probe(buf.get_ref()).unwrap();
        assert_eq!(meta.color_space, "b-w");
        assert_eq!(meta.channels, 1);
    }

    #[test]
    fn test_probe_truncated_body_is_decode_error() {
        let mut bytes = jpeg_bytes(64, 48);
        bytes.truncate(20);

        let result = RasterCodec::default().probe(&bytes);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_fit_within_preserves_aspect() {
        let out = RasterCodec::default()
            .fit_within(&jpeg_bytes(2000, 1500), 1024, 768)
            .unwrap();
        assert_eq!((out.width, out.height), (1024, 768));

        let tall = RasterCodec::default()
            .fit_within(&jpeg_bytes(600, 1200), 1024, 768)
            .unwrap();
        assert_eq!((tall.width, tall.height), (384, 768));
    }

    #[test]
    fn test_fit_within_never_upscales() {
        let out = RasterCodec::default()
            .fit_within(&jpeg_bytes(320, 200), 1024, 768)
            .unwrap();
        assert_eq!((out.width, out.height), (320, 200));
    }

    #[test]
    fn test_cover_is_exact_size() {
        let codec = RasterCodec::default();
        let out = codec.cover(&jpeg_bytes(2000, 1500), 200, 200).unwrap();
        assert_eq!((out.width, out.height), (200, 200));

        let meta = codec.probe(&out.bytes).unwrap();
        assert_eq!(meta.format, ImageFormat::Jpeg);
        assert_eq!((meta.width, meta.height), (200, 200));
    }

    #[test]
    fn test_alpha_input_encodes_to_jpeg() {
        let out = RasterCodec::default()
            .cover(&png_rgba_bytes(50, 30), 20, 20)
            .unwrap();
        assert_eq!(&out.bytes[..3], &[0xFF, 0xD8, 0xFF]);
    }
}
