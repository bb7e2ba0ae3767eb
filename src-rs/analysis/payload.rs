use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::geometry::{CoordinateSpace, ScreenRect};
use crate::model::AnalysisReply;

const QUALITY_STEPS: [u8; 4] = [85, 70, 55, 40];
const MIN_EDGE: u32 = 320;

#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    /// Dimensions of the screenshot before any downscale.
    pub source_width: u32,
    pub source_height: u32,
}

impl UploadPayload {
    pub fn is_downscaled(&self) -> bool {
        (self.width, self.height) != (self.source_width, self.source_height)
    }

    /// Maps a physical rectangle measured on the uploaded image back onto the
    /// captured screenshot. Logical rectangles are returned unchanged.
    pub fn rescale_to_source(&self, rect: &ScreenRect) -> ScreenRect {
        if rect.space != CoordinateSpace::Physical || !self.is_downscaled() {
            return *rect;
        }
        let sx = ratio(self.source_width, self.width);
        let sy = ratio(self.source_height, self.height);
        ScreenRect::physical(rect.x * sx, rect.y * sy, rect.width * sx, rect.height * sy)
    }

    pub fn rescale_reply(&self, reply: &mut AnalysisReply) {
        for step in &mut reply.steps {
            step.rect = self.rescale_to_source(&step.rect);
        }
    }
}

fn ratio(source: u32, uploaded: u32) -> f64 {
    if uploaded == 0 {
        1.0
    } else {
        f64::from(source) / f64::from(uploaded)
    }
}

/// Re-encodes a screenshot until it fits under `ceiling` bytes: JPEG quality
/// first, then 3/4 downscales. Payloads already under the ceiling pass through.
pub fn compress_for_upload(raw: &[u8], ceiling: usize) -> Result<UploadPayload> {
    let image = image::load_from_memory(raw).context("failed to decode screenshot for upload")?;
    let (width, height) = image.dimensions();

    if raw.len() <= ceiling {
        return Ok(UploadPayload {
            bytes: raw.to_vec(),
            media_type: sniff_media_type(raw).to_string(),
            width,
            height,
            source_width: width,
            source_height: height,
        });
    }

    let mut current = DynamicImage::ImageRgb8(image.to_rgb8());
    loop {
        for quality in QUALITY_STEPS {
            let bytes = encode_jpeg(&current, quality)?;
            if bytes.len() <= ceiling {
                let (uploaded_width, uploaded_height) = current.dimensions();
                return Ok(UploadPayload {
                    bytes,
                    media_type: "image/jpeg".to_string(),
                    width: uploaded_width,
                    height: uploaded_height,
                    source_width: width,
                    source_height: height,
                });
            }
        }

        let (w, h) = current.dimensions();
        if w.max(h) <= MIN_EDGE {
            bail!("screenshot does not fit under {ceiling} bytes even at {w}x{h}");
        }
        current = current.resize_exact((w * 3 / 4).max(1), (h * 3 / 4).max(1), FilterType::Triangle);
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder
        .encode_image(&rgb)
        .with_context(|| format!("failed to encode JPEG at quality {quality}"))?;
    Ok(bytes)
}

pub fn sniff_media_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(media_type_for)
        .unwrap_or("application/octet-stream")
}

fn media_type_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    fn png_bytes(image: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image.clone())
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn small_png_passes_through() {
        let raw = png_bytes(&RgbaImage::from_pixel(64, 32, Rgba([255, 255, 255, 255])));
        let payload = compress_for_upload(&raw, 1_000_000).unwrap();
        assert_eq!(payload.bytes, raw);
        assert_eq!(payload.media_type, "image/png");
        assert_eq!((payload.width, payload.height), (64, 32));
        assert!(!payload.is_downscaled());
        let rect = ScreenRect::physical(3.0, 4.0, 10.0, 20.0);
        assert_eq!(payload.rescale_to_source(&rect), rect);
    }

    #[test]
    fn noisy_capture_is_squeezed_under_ceiling() {
        let mut rng = StdRng::seed_from_u64(11);
        let noisy = RgbaImage::from_fn(1600, 1000, |_, _| {
            Rgba([rng.gen(), rng.gen(), rng.gen(), 255])
        });
        let raw = png_bytes(&noisy);
        let ceiling = 250_000;
        assert!(raw.len() > ceiling);

        let payload = compress_for_upload(&raw, ceiling).unwrap();
        assert!(payload.bytes.len() <= ceiling);
        assert_eq!(payload.media_type, "image/jpeg");
        let decoded = image::load_from_memory(&payload.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (payload.width, payload.height));
        assert_eq!((payload.source_width, payload.source_height), (1600, 1000));

        let whole = ScreenRect::physical(0.0, 0.0, payload.width as f64, payload.height as f64);
        let mapped = payload.rescale_to_source(&whole);
        assert!((mapped.width - 1600.0).abs() < 1e-6);
        assert!((mapped.height - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn downscaled_rects_map_back_to_capture_pixels() {
        let payload = UploadPayload {
            bytes: Vec::new(),
            media_type: "image/jpeg".to_string(),
            width: 1200,
            height: 750,
            source_width: 1600,
            source_height: 1000,
        };
        let mut reply = AnalysisReply {
            message: "Click Save".to_string(),
            steps: vec![crate::model::PredictedStep {
                id: "step-1".to_string(),
                label: "Save".to_string(),
                rect: ScreenRect::physical(300.0, 150.0, 75.0, 45.0),
                description: String::new(),
            }],
        };
        payload.rescale_reply(&mut reply);
        assert_eq!(reply.steps[0].rect, ScreenRect::physical(400.0, 200.0, 100.0, 60.0));

        let logical = ScreenRect::logical(300.0, 150.0, 75.0, 45.0);
        assert_eq!(payload.rescale_to_source(&logical), logical);
    }

    #[test]
    fn impossible_ceiling_is_an_error() {
        let raw = png_bytes(&RgbaImage::from_pixel(400, 300, Rgba([10, 20, 30, 255])));
        assert!(compress_for_upload(&raw, 64).is_err());
    }
}
