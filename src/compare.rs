//! Screenshot comparison
//!
//! Loads two stored captures of the same page, reconciles their
//! dimensions, and computes a perceptual per-pixel difference in YIQ
//! space with anti-aliasing detection, so sub-pixel font rendering
//! noise doesn't read as change. Dimension mismatch is never an error:
//! both images are cover-fitted to the shared minimum, anchored at the
//! top where page content is stable.

use image::{imageops, Rgba, RgbaImage};
use serde::Serialize;
use std::io::Cursor;

use crate::db::Db;
use crate::storage::ScreenshotStore;
use crate::WorkerError;

/// Maximum possible delta between two pixels in YIQ space.
const MAX_YIQ_DELTA: f64 = 35215.0;

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Matching threshold, 0..1; smaller is stricter.
    pub threshold: f64,
    /// Detect anti-aliased pixels and exclude them from the count.
    pub include_aa: bool,
    /// Opacity of the faded original under the diff overlay.
    pub alpha: f64,
    pub diff_color: [u8; 3],
    pub aa_color: [u8; 3],
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            include_aa: true,
            alpha: 0.1,
            diff_color: [255, 0, 128],
            aa_color: [0, 255, 128],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffStats {
    pub diff_pixels: u64,
    pub diff_percentage: f64,
    pub total_pixels: u64,
    pub width: u32,
    pub height: u32,
    /// The older screenshot ("before").
    pub screenshot_1: i64,
    /// The newer screenshot ("after").
    pub screenshot_2: i64,
}

#[derive(Debug)]
pub struct Comparison {
    pub stats: DiffStats,
    pub diff_png: Option<Vec<u8>>,
}

pub struct CompareEngine {
    db: Db,
    store: ScreenshotStore,
}

impl CompareEngine {
    pub fn new(db: Db, store: ScreenshotStore) -> Self {
        Self { db, store }
    }

    /// Compare two screenshots of the same page. With `with_image` a
    /// diff PNG is rendered; without, only the counters are computed.
    pub async fn compare(
        &self,
        id_a: i64,
        id_b: i64,
        with_image: bool,
    ) -> Result<Comparison, WorkerError> {
        let a = self.db.screenshot(id_a).await?;
        let b = self.db.screenshot(id_b).await?;

        // Older is "before"; equal timestamps fall back to id order.
        let (before, after) = if (a.created_at, a.id) <= (b.created_at, b.id) {
            (a, b)
        } else {
            (b, a)
        };

        let before_path = before
            .file_path
            .as_deref()
            .ok_or_else(|| WorkerError::NotFound(format!("screenshot {} has no file", before.id)))?;
        let after_path = after
            .file_path
            .as_deref()
            .ok_or_else(|| WorkerError::NotFound(format!("screenshot {} has no file", after.id)))?;

        let before_img = image::load_from_memory(&self.store.read(before_path).await?)?.to_rgba8();
        let after_img = image::load_from_memory(&self.store.read(after_path).await?)?.to_rgba8();

        let width = before_img.width().min(after_img.width());
        let height = before_img.height().min(after_img.height());

        let before_img = cover_fit(&before_img, width, height);
        let after_img = cover_fit(&after_img, width, height);

        let options = DiffOptions::default();
        let mut output = with_image.then(|| RgbaImage::new(width, height));
        let diff_pixels = pixelmatch(&before_img, &after_img, output.as_mut(), &options);

        let total_pixels = width as u64 * height as u64;
        let diff_percentage = if total_pixels > 0 {
            round2(100.0 * diff_pixels as f64 / total_pixels as f64)
        } else {
            0.0
        };

        let diff_png = match output {
            Some(img) => {
                let mut buf = Vec::new();
                image::DynamicImage::ImageRgba8(img)
                    .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
                Some(buf)
            }
            None => None,
        };

        Ok(Comparison {
            stats: DiffStats {
                diff_pixels,
                diff_percentage,
                total_pixels,
                width,
                height,
                screenshot_1: before.id,
                screenshot_2: after.id,
            },
            diff_png,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Scale preserving aspect so the image covers `width × height`, then
/// crop the overflow, anchored at the top-left corner.
pub fn cover_fit(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.width() == width && image.height() == height {
        return image.clone();
    }

    let scale_x = width as f64 / image.width() as f64;
    let scale_y = height as f64 / image.height() as f64;
    let scale = scale_x.max(scale_y);

    let scaled_w = ((image.width() as f64 * scale).round() as u32).max(width);
    let scaled_h = ((image.height() as f64 * scale).round() as u32).max(height);

    let scaled = if (scaled_w, scaled_h) == image.dimensions() {
        image.clone()
    } else {
        imageops::resize(image, scaled_w, scaled_h, imageops::FilterType::Triangle)
    };
    imageops::crop_imm(&scaled, 0, 0, width, height).to_image()
}

/// Count differing pixels between two equally-sized images, painting a
/// diff overlay when `output` is given. Anti-aliased transitions are
/// painted in the AA colour and excluded from the count.
pub fn pixelmatch(
    img1: &RgbaImage,
    img2: &RgbaImage,
    mut output: Option<&mut RgbaImage>,
    options: &DiffOptions,
) -> u64 {
    debug_assert_eq!(img1.dimensions(), img2.dimensions());
    let (width, height) = img1.dimensions();
    let max_delta = MAX_YIQ_DELTA * options.threshold * options.threshold;
    let mut diff_count = 0u64;

    for y in 0..height {
        for x in 0..width {
            let p1 = img1.get_pixel(x, y);
            let p2 = img2.get_pixel(x, y);
            let delta = color_delta(p1, p2, false).abs();

            if delta > max_delta {
                let is_aa = options.include_aa
                    && (antialiased(img1, x, y, img2) || antialiased(img2, x, y, img1));
                if is_aa {
                    if let Some(out) = output.as_deref_mut() {
                        let [r, g, b] = options.aa_color;
                        out.put_pixel(x, y, Rgba([r, g, b, 255]));
                    }
                } else {
                    diff_count += 1;
                    if let Some(out) = output.as_deref_mut() {
                        let [r, g, b] = options.diff_color;
                        out.put_pixel(x, y, Rgba([r, g, b, 255]));
                    }
                }
            } else if let Some(out) = output.as_deref_mut() {
                // Faded grayscale of the original for matching pixels.
                let value = blend(rgb2y(p1), options.alpha * p1[3] as f64 / 255.0);
                let value = value.clamp(0.0, 255.0) as u8;
                out.put_pixel(x, y, Rgba([value, value, value, 255]));
            }
        }
    }

    diff_count
}

/// Perceptual colour distance in YIQ space, signed by whether the pixel
/// darkens or brightens.
fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>, y_only: bool) -> f64 {
    let mut r1 = a[0] as f64;
    let mut g1 = a[1] as f64;
    let mut b1 = a[2] as f64;
    let a1 = a[3] as f64 / 255.0;
    let mut r2 = b[0] as f64;
    let mut g2 = b[1] as f64;
    let mut b2 = b[2] as f64;
    let a2 = b[3] as f64 / 255.0;

    if a1 < 1.0 {
        r1 = blend(r1, a1);
        g1 = blend(g1, a1);
        b1 = blend(b1, a1);
    }
    if a2 < 1.0 {
        r2 = blend(r2, a2);
        g2 = blend(g2, a2);
        b2 = blend(b2, a2);
    }

    let y1 = rgb2y_f(r1, g1, b1);
    let y2 = rgb2y_f(r2, g2, b2);
    let y = y1 - y2;
    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

/// Whether a differing pixel looks like font/edge anti-aliasing: it sits
/// on a luminance gradient whose darkest and brightest neighbours belong
/// to larger same-colour areas in either image.
fn antialiased(img: &RgbaImage, x: u32, y: u32, other: &RgbaImage) -> bool {
    let (width, height) = img.dimensions();
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(width - 1);
    let y2 = (y + 1).min(height - 1);
    let center = img.get_pixel(x, y);

    let mut zeroes = usize::from(x == x0 || x == x2 || y == y0 || y == y2);
    let mut min = 0.0f64;
    let mut max = 0.0f64;
    let mut min_pos = (0u32, 0u32);
    let mut max_pos = (0u32, 0u32);

    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }
            let delta = color_delta(center, img.get_pixel(nx, ny), true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_pos = (nx, ny);
            } else if delta > max {
                max = delta;
                max_pos = (nx, ny);
            }
        }
    }

    // Not a gradient: no darker or no brighter neighbour.
    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_pos.0, min_pos.1) && has_many_siblings(other, min_pos.0, min_pos.1))
        || (has_many_siblings(img, max_pos.0, max_pos.1)
            && has_many_siblings(other, max_pos.0, max_pos.1))
}

/// Whether at least two neighbours share the pixel's exact colour.
fn has_many_siblings(img: &RgbaImage, x: u32, y: u32) -> bool {
    let (width, height) = img.dimensions();
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(width - 1);
    let y2 = (y + 1).min(height - 1);
    let center = img.get_pixel(x, y);

    let mut zeroes = usize::from(x == x0 || x == x2 || y == y0 || y == y2);
    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }
            if center == img.get_pixel(nx, ny) {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}

fn blend(channel: f64, alpha: f64) -> f64 {
    255.0 + (channel - 255.0) * alpha
}

fn rgb2y(pixel: &Rgba<u8>) -> f64 {
    rgb2y_f(pixel[0] as f64, pixel[1] as f64, pixel[2] as f64)
}

fn rgb2y_f(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(color))
    }

    #[test]
    fn identical_images_have_zero_diff() {
        let img = solid(64, 64, [120, 130, 140, 255]);
        let count = pixelmatch(&img, &img, None, &DiffOptions::default());
        assert_eq!(count, 0);
    }

    #[test]
    fn changed_region_counted() {
        let a = solid(50, 50, [200, 200, 200, 255]);
        let mut b = a.clone();
        for y in 10..20 {
            for x in 10..20 {
                b.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let count = pixelmatch(&a, &b, None, &DiffOptions::default());
        assert_eq!(count, 100);
    }

    #[test]
    fn sub_threshold_change_ignored() {
        let a = solid(30, 30, [128, 128, 128, 255]);
        let mut b = a.clone();
        b.put_pixel(5, 5, Rgba([130, 128, 128, 255]));
        let count = pixelmatch(&a, &b, None, &DiffOptions::default());
        assert_eq!(count, 0);
    }

    #[test]
    fn diff_overlay_uses_configured_colors() {
        let a = solid(20, 20, [255, 255, 255, 255]);
        let mut b = a.clone();
        // A 3x3 isolated block: solidly different, not an AA gradient.
        for y in 8..11 {
            for x in 8..11 {
                b.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let options = DiffOptions::default();
        let mut out = RgbaImage::new(20, 20);
        let count = pixelmatch(&a, &b, Some(&mut out), &options);
        assert!(count > 0);
        assert_eq!(out.get_pixel(9, 9), &Rgba([255, 0, 128, 255]));
        // Matching pixels render as faded grayscale, not black.
        assert_ne!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn cover_fit_reconciles_to_top_region() {
        // Tall "before" (100 × 500), shorter "after" (100 × 420): the
        // shared canvas is 100 × 420 and content anchors at the top.
        let mut tall = solid(100, 500, [255, 255, 255, 255]);
        for x in 0..100 {
            tall.put_pixel(x, 0, Rgba([1, 2, 3, 255]));
        }
        let fitted = cover_fit(&tall, 100, 420);
        assert_eq!(fitted.dimensions(), (100, 420));
        assert_eq!(fitted.get_pixel(50, 0), &Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn cover_fit_noop_on_equal_dimensions() {
        let img = solid(40, 40, [9, 9, 9, 255]);
        assert_eq!(cover_fit(&img, 40, 40), img);
    }

    #[test]
    fn percentage_rounds_to_two_places() {
        assert_eq!(round2(100.0 * 1.0 / 3.0), 33.33);
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(100.0), 100.0);
    }
}
