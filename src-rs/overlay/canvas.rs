use anyhow::{Context, Result};
use chrono::Utc;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::PredictedStep;

/// Largest tile edge the renderer will allocate, whatever the request says.
const MAX_TILE_EDGE: u32 = 4096;
const MAX_DISPLAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerStyle {
    pub color: Rgba<u8>,
    pub fill_alpha: u8,
    pub thickness: u32,
    pub text_scale: u32,
}

impl Default for MarkerStyle {
    fn default() -> Self {
        Self {
            color: Rgba([255, 59, 48, 255]),
            fill_alpha: 48,
            thickness: 3,
            text_scale: 2,
        }
    }
}

/// Draws the marker tile for one logical-space step: translucent fill, outline,
/// and a label band along the top edge.
pub fn draw_marker(step: &PredictedStep, style: &MarkerStyle) -> RgbaImage {
    let w = tile_edge(step.rect.width);
    let h = tile_edge(step.rect.height);
    let mut img = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 0]));

    let [r, g, b, _] = style.color.0;
    fill_rect_alpha(
        &mut img,
        0,
        0,
        w as i32 - 1,
        h as i32 - 1,
        Rgba([r, g, b, style.fill_alpha]),
    );
    draw_rect_outline(&mut img, 0, 0, w, h, style.color, style.thickness);

    let scale = if h >= 40 { style.text_scale.max(1) } else { 1 };
    let band_h = (8 * scale + 4) as i32;
    fill_rect_alpha(&mut img, 0, 0, w as i32 - 1, band_h - 1, Rgba([0, 0, 0, 170]));
    let max_chars = ((w as i32 - 6) / (8 * scale as i32)).max(0) as usize;
    let label = truncate_label(&step.label, max_chars);
    draw_bitmap_text(&mut img, 3, 2, &label, Rgba([255, 255, 255, 255]), scale);
    img
}

fn tile_edge(value: f64) -> u32 {
    if !value.is_finite() || value < 1.0 {
        return 1;
    }
    (value.round() as u32).clamp(1, MAX_TILE_EDGE)
}

fn truncate_label(label: &str, max_chars: usize) -> String {
    let single_line = label.replace(['\n', '\r'], " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    if max_chars <= 2 {
        return single_line.chars().take(max_chars).collect();
    }
    single_line.chars().take(max_chars - 2).collect::<String>() + ".."
}

fn clamp_i32(value: i32, min_value: i32, max_value: i32) -> i32 {
    value.max(min_value).min(max_value)
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(dst[3]) * inv + f64::from(src[3]))
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn fill_rect_alpha(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let min_x = clamp_i32(x0.min(x1), 0, img.width() as i32 - 1);
    let max_x = clamp_i32(x0.max(x1), 0, img.width() as i32 - 1);
    let min_y = clamp_i32(y0.min(y1), 0, img.height() as i32 - 1);
    let max_y = clamp_i32(y0.max(y1), 0, img.height() as i32 - 1);
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dst = *img.get_pixel(x as u32, y as u32);
            img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
        }
    }
}

// Thickness grows inward so the outline never leaves the tile.
fn draw_rect_outline(img: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>, thickness: u32) {
    if w == 0 || h == 0 || img.width() == 0 || img.height() == 0 {
        return;
    }
    let x0 = x.min(img.width() - 1);
    let y0 = y.min(img.height() - 1);
    let x1 = (x + w - 1).min(img.width() - 1);
    let y1 = (y + h - 1).min(img.height() - 1);

    for t in 0..thickness.max(1) {
        let tx0 = x0 + t;
        let ty0 = y0 + t;
        let (Some(tx1), Some(ty1)) = (x1.checked_sub(t), y1.checked_sub(t)) else {
            break;
        };
        if tx0 > tx1 || ty0 > ty1 {
            break;
        }
        for xx in tx0..=tx1 {
            img.put_pixel(xx, ty0, color);
            img.put_pixel(xx, ty1, color);
        }
        for yy in ty0..=ty1 {
            img.put_pixel(tx0, yy, color);
            img.put_pixel(tx1, yy, color);
        }
    }
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    for ch in text.chars() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            cursor_x += 8 * scale_i;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..8 {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        let tx = px + sx;
                        let ty = py + sy;
                        if tx >= 0 && ty >= 0 && tx < img.width() as i32 && ty < img.height() as i32 {
                            let dst = *img.get_pixel(tx as u32, ty as u32);
                            img.put_pixel(tx as u32, ty as u32, blend_pixel(dst, color));
                        }
                    }
                }
            }
        }
        cursor_x += 8 * scale_i;
    }
}

/// Placement record written next to the tile so an external viewer knows where it goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSidecar {
    pub owner: String,
    pub source: String,
    pub label: String,
    pub description: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub shown_at: String,
    pub expires_at: String,
}

impl FrameSidecar {
    pub fn for_step(owner: &str, source: &str, step: &PredictedStep, duration: Duration) -> Self {
        let now = Utc::now();
        let millis = duration.min(MAX_DISPLAY).as_millis() as i64;
        Self {
            owner: owner.to_string(),
            source: source.to_string(),
            label: step.label.clone(),
            description: step.description.clone(),
            x: step.rect.x,
            y: step.rect.y,
            width: step.rect.width,
            height: step.rect.height,
            shown_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::milliseconds(millis)).to_rfc3339(),
        }
    }
}

/// Where markers are published: one tile PNG plus a JSON sidecar giving its
/// logical position and expiry. Nothing in this crate puts the tile on
/// screen; an external compositor or viewer has to read the directory, and
/// without one a fresh screen capture will not contain the marker.
/// Writes are atomic (temp file + rename).
#[derive(Debug, Clone)]
pub struct FrameSink {
    dir: PathBuf,
}

impl FrameSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frame_path(&self) -> PathBuf {
        self.dir.join("overlay.png")
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.dir.join("overlay.json")
    }

    pub fn publish(&self, tile: &RgbaImage, sidecar: &FrameSidecar) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create overlay dir: {}", self.dir.display()))?;

        let frame_tmp = self.dir.join("overlay.png.tmp");
        DynamicImage::ImageRgba8(tile.clone())
            .save_with_format(&frame_tmp, ImageFormat::Png)
            .with_context(|| format!("failed to write overlay frame: {}", frame_tmp.display()))?;
        fs::rename(&frame_tmp, self.frame_path())
            .with_context(|| format!("failed to publish overlay frame in {}", self.dir.display()))?;

        let sidecar_tmp = self.dir.join("overlay.json.tmp");
        let raw = serde_json::to_string_pretty(sidecar)?;
        fs::write(&sidecar_tmp, raw)
            .with_context(|| format!("failed to write overlay sidecar: {}", sidecar_tmp.display()))?;
        fs::rename(&sidecar_tmp, self.sidecar_path())
            .with_context(|| format!("failed to publish overlay sidecar in {}", self.dir.display()))?;
        Ok(())
    }

    pub fn current(&self) -> Option<FrameSidecar> {
        let raw = fs::read_to_string(self.sidecar_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn clear(&self) -> Result<()> {
        for path in [self.sidecar_path(), self.frame_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to clear {}", path.display()))
                }
            }
        }
        Ok(())
    }

    /// Clears only when the published frame still belongs to `owner`.
    pub fn clear_if_owner(&self, owner: &str) -> Result<bool> {
        match self.current() {
            Some(sidecar) if sidecar.owner == owner => {
                self.clear()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
