//! Download and transform stages of a job.

use std::time::Duration;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use imgflow_bus::ProcessingType;
use thiserror::Error;
use tracing::debug;

/// Edge length of the `resize` output.
pub const RESIZE_EDGE: u32 = 100;
pub const BLUR_SIGMA: f32 = 2.0;
pub const SHARPEN_SIGMA: f32 = 2.0;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(u16),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// A decoded source image and the format it arrived in.
#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub image: DynamicImage,
    /// Lowercase format name, e.g. "jpeg" or "png".
    pub format: String,
}

impl DownloadedImage {
    /// Decode raw bytes, sniffing the format from the content.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let format = image::guess_format(bytes)?;
        let image = image::load_from_memory_with_format(bytes, format)?;
        Ok(Self {
            image,
            format: format_name(format),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "jpeg".to_string(),
        ImageFormat::Png => "png".to_string(),
        ImageFormat::Gif => "gif".to_string(),
        ImageFormat::WebP => "webp".to_string(),
        ImageFormat::Bmp => "bmp".to_string(),
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

/// Where source images come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn download(&self, url: &str) -> Result<DownloadedImage, DownloadError>;
}

/// Fetches images over HTTP(S).
#[derive(Clone)]
pub struct HttpImageSource {
    client: reqwest::Client,
}

impl HttpImageSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn download(&self, url: &str) -> Result<DownloadedImage, DownloadError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(DownloadError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        debug!(url, bytes = bytes.len(), "image downloaded");
        Ok(DownloadedImage::decode(&bytes)?)
    }
}

type TransformFn = fn(DynamicImage) -> DynamicImage;

fn passthrough(img: DynamicImage) -> DynamicImage {
    img
}

fn grayscale(img: DynamicImage) -> DynamicImage {
    img.grayscale()
}

fn resize(img: DynamicImage) -> DynamicImage {
    img.resize_exact(RESIZE_EDGE, RESIZE_EDGE, FilterType::Lanczos3)
}

fn blur(img: DynamicImage) -> DynamicImage {
    img.blur(BLUR_SIGMA)
}

fn sharpen(img: DynamicImage) -> DynamicImage {
    img.unsharpen(SHARPEN_SIGMA, 0)
}

/// Transform per processing type.
const TRANSFORMS: [(ProcessingType, TransformFn); 5] = [
    (ProcessingType::Original, passthrough),
    (ProcessingType::Grayscale, grayscale),
    (ProcessingType::Resize, resize),
    (ProcessingType::Blur, blur),
    (ProcessingType::Sharpen, sharpen),
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported processing type: {0}")]
pub struct UnsupportedTransform(pub ProcessingType);

pub fn transform_for(kind: ProcessingType) -> Result<TransformFn, UnsupportedTransform> {
    TRANSFORMS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, f)| *f)
        .ok_or(UnsupportedTransform(kind))
}

/// Apply the transform for `kind`. CPU-bound; run it off the async workers.
pub fn apply(kind: ProcessingType, img: DynamicImage) -> Result<DynamicImage, UnsupportedTransform> {
    let transform = transform_for(kind)?;
    Ok(transform(img))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn sample(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 200])
        }))
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn every_processing_type_has_a_transform() {
        for kind in ProcessingType::ALL {
            assert!(transform_for(kind).is_ok(), "{kind} has no transform");
        }
    }

    #[test]
    fn resize_is_exact() {
        let out = apply(ProcessingType::Resize, sample(320, 200)).unwrap();
        assert_eq!((out.width(), out.height()), (RESIZE_EDGE, RESIZE_EDGE));
    }

    #[test]
    fn grayscale_drops_color() {
        let out = apply(ProcessingType::Grayscale, sample(8, 8)).unwrap();
        let rgb = out.to_rgb8();
        assert!(rgb.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
    }

    #[test]
    fn original_is_unchanged() {
        let img = sample(16, 9);
        let out = apply(ProcessingType::Original, img.clone()).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn blur_and_sharpen_keep_dimensions() {
        for kind in [ProcessingType::Blur, ProcessingType::Sharpen] {
            let out = apply(kind, sample(40, 30)).unwrap();
            assert_eq!((out.width(), out.height()), (40, 30));
        }
    }

    #[test]
    fn decode_reports_format_and_size() {
        let decoded = DownloadedImage::decode(&png_bytes(&sample(12, 34))).unwrap();
        assert_eq!(decoded.format, "png");
        assert_eq!((decoded.width(), decoded.height()), (12, 34));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(DownloadedImage::decode(b"definitely not an image").is_err());
    }
}
