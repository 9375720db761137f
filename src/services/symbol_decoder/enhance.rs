//! Grayscale enhancement passes used by the decode ladder

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Offset below the local mean a pixel must fall to binarize as black
const BINARIZE_OFFSET: i64 = 2;

/// Scale by `factor` with bilinear interpolation; factors <= 1 return a copy
pub fn upscale(image: &GrayImage, factor: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    if factor <= 1.0 || width == 0 || height == 0 {
        return image.clone();
    }
    let new_width = ((width as f32 * factor).round() as u32).max(1);
    let new_height = ((height as f32 * factor).round() as u32).max(1);
    imageops::resize(image, new_width, new_height, FilterType::Triangle)
}

/// 3x3 sharpen with edge pixels replicated
pub fn sharpen(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let at = |x: i64, y: i64| -> i64 {
        let x = x.clamp(0, width as i64 - 1) as u32;
        let y = y.clamp(0, height as i64 - 1) as u32;
        image.get_pixel(x, y)[0] as i64
    };

    GrayImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let value = 5 * at(x, y) - at(x - 1, y) - at(x + 1, y) - at(x, y - 1) - at(x, y + 1);
        Luma([value.clamp(0, 255) as u8])
    })
}

/// Edge-preserving smoothing over a square window of `radius`
///
/// Each neighbor is weighted by its distance and by how far its value is
/// from the center pixel, so flat areas lose sensor noise while bar edges
/// stay sharp.
pub fn denoise_bilateral(image: &GrayImage, radius: u32, sigma_color: f32, sigma_space: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    if radius == 0 || width == 0 || height == 0 {
        return image.clone();
    }
    let r = radius as i64;
    let space_coeff = -0.5 / (sigma_space * sigma_space);
    let color_coeff = -0.5 / (sigma_color * sigma_color);
    let color_weight: Vec<f32> = (0..256).map(|d| ((d * d) as f32 * color_coeff).exp()).collect();
    let mut space_weight = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    for dy in -r..=r {
        for dx in -r..=r {
            space_weight.push(((dx * dx + dy * dy) as f32 * space_coeff).exp());
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let center = image.get_pixel(x, y)[0] as i64;
        let mut sum = 0.0f32;
        let mut norm = 0.0f32;
        let mut k = 0;
        for dy in -r..=r {
            let ny = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
            for dx in -r..=r {
                let nx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                let value = image.get_pixel(nx, ny)[0] as i64;
                let weight = space_weight[k] * color_weight[(value - center).unsigned_abs() as usize];
                sum += weight * value as f32;
                norm += weight;
                k += 1;
            }
        }
        Luma([(sum / norm).round().clamp(0.0, 255.0) as u8])
    })
}

/// Contrast-limited adaptive histogram equalization
///
/// The image is split into roughly `tiles` x `tiles` blocks. Each block gets
/// a clipped histogram-equalization curve; pixels blend the curves of the
/// four nearest block centers.
pub fn equalize_local(image: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let tile_w = width.div_ceil(tiles.clamp(1, width));
    let tile_h = height.div_ceil(tiles.clamp(1, height));
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let (x0, y0) = (tx * tile_w, ty * tile_h);
            let (x1, y1) = ((x0 + tile_w).min(width), (y0 + tile_h).min(height));
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            luts.push(clipped_lut(&mut hist, (x1 - x0) * (y1 - y0), clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32, v: usize| luts[(ty * tiles_x + tx) as usize][v] as f32;

    GrayImage::from_fn(width, height, |x, y| {
        let (tx0, tx1, wx) = blend_coords(x, tile_w, tiles_x);
        let (ty0, ty1, wy) = blend_coords(y, tile_h, tiles_y);
        let v = image.get_pixel(x, y)[0] as usize;
        let top = lut_at(tx0, ty0, v) * (1.0 - wx) + lut_at(tx1, ty0, v) * wx;
        let bottom = lut_at(tx0, ty1, v) * (1.0 - wx) + lut_at(tx1, ty1, v) * wx;
        Luma([(top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Neighboring tile indices and blend weight for one axis
fn blend_coords(pos: u32, tile: u32, tiles: u32) -> (u32, u32, f32) {
    let f = ((pos as f32 + 0.5) / tile as f32 - 0.5).max(0.0);
    let i0 = (f.floor() as u32).min(tiles - 1);
    let i1 = (i0 + 1).min(tiles - 1);
    let weight = if i0 == i1 { 0.0 } else { (f - i0 as f32).clamp(0.0, 1.0) };
    (i0, i1, weight)
}

fn clipped_lut(hist: &mut [u32; 256], count: u32, clip_limit: f32) -> [u8; 256] {
    let limit = ((clip_limit * count as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    // Spread the clipped mass evenly over all bins
    let share = excess / 256;
    let mut remainder = excess % 256;
    for bin in hist.iter_mut() {
        *bin += share;
        if remainder > 0 {
            *bin += 1;
            remainder -= 1;
        }
    }

    let scale = 255.0 / count.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (value, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[value] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Local-mean thresholding over a (2r+1)^2 window, output is 0 or 255
pub fn binarize_adaptive(image: &GrayImage, block_radius: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    // Summed-area table with a zero first row and column
    let stride = width as usize + 1;
    let mut integral = vec![0u64; stride * (height as usize + 1)];
    for y in 0..height as usize {
        let mut row_sum = 0u64;
        for x in 0..width as usize {
            row_sum += image.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row_sum;
        }
    }

    let r = block_radius;
    GrayImage::from_fn(width, height, |x, y| {
        let (x0, x1) = (x.saturating_sub(r) as usize, (x + r + 1).min(width) as usize);
        let (y0, y1) = (y.saturating_sub(r) as usize, (y + r + 1).min(height) as usize);
        let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
            - integral[y0 * stride + x1]
            - integral[y1 * stride + x0];
        let area = ((x1 - x0) * (y1 - y0)) as u64;
        let mean = (sum / area) as i64;
        let value = image.get_pixel(x, y)[0] as i64;
        Luma([if value > mean - BINARIZE_OFFSET { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_range(image: &GrayImage) -> (u8, u8) {
        let min = image.pixels().map(|p| p[0]).min().unwrap();
        let max = image.pixels().map(|p| p[0]).max().unwrap();
        (min, max)
    }

    #[test]
    fn test_upscale_dimensions() {
        let image = GrayImage::new(30, 10);
        assert_eq!(upscale(&image, 2.0).dimensions(), (60, 20));
        assert_eq!(upscale(&image, 1.0).dimensions(), (30, 10));
    }

    #[test]
    fn test_sharpen_keeps_flat_regions_and_boosts_edges() {
        let flat = GrayImage::from_pixel(7, 5, Luma([90]));
        assert!(sharpen(&flat).pixels().all(|p| p[0] == 90));

        let step = GrayImage::from_fn(8, 4, |x, _| Luma([if x < 4 { 100 } else { 150 }]));
        let sharp = sharpen(&step);
        assert!(sharp.get_pixel(3, 1)[0] < 100);
        assert!(sharp.get_pixel(4, 1)[0] > 150);
    }

    #[test]
    fn test_denoise_smooths_noise_but_keeps_edges() {
        let flat = GrayImage::from_pixel(9, 9, Luma([120]));
        assert!(denoise_bilateral(&flat, 3, 75.0, 75.0).pixels().all(|p| p[0] == 120));

        // Speckled dark bar next to a light bar
        let noisy = GrayImage::from_fn(20, 10, |x, y| {
            let base: i32 = if x < 10 { 40 } else { 210 };
            let jitter = if (x + y) % 2 == 0 { 6 } else { -6 };
            Luma([(base + jitter) as u8])
        });
        let smooth = denoise_bilateral(&noisy, 3, 30.0, 3.0);
        let dark = smooth.get_pixel(4, 5)[0];
        let light = smooth.get_pixel(15, 5)[0];
        assert!((38..=42).contains(&dark), "dark {dark}");
        assert!((208..=212).contains(&light), "light {light}");
        assert!(smooth.get_pixel(9, 5)[0] < 50);
        assert!(smooth.get_pixel(10, 5)[0] > 200);

        assert_eq!(denoise_bilateral(&noisy, 0, 30.0, 3.0), noisy);
    }

    #[test]
    fn test_equalize_stretches_low_contrast() {
        let image = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x / 4) as u8]));
        let (min, max) = value_range(&image);
        assert_eq!(max - min, 15);

        let equalized = equalize_local(&image, 1, 40.0);
        assert_eq!(equalized.dimensions(), (64, 64));
        let (min, max) = value_range(&equalized);
        assert!(max - min > 200, "range {min}..{max}");
    }

    #[test]
    fn test_equalize_tiled_handles_small_images() {
        let image = GrayImage::from_fn(5, 3, |x, y| Luma([(x * 40 + y * 10) as u8]));
        assert_eq!(equalize_local(&image, 8, 3.0).dimensions(), (5, 3));
    }

    #[test]
    fn test_binarize_adaptive() {
        // Dark square on a light background
        let image = GrayImage::from_fn(40, 40, |x, y| {
            let inside = (10..30).contains(&x) && (10..30).contains(&y);
            Luma([if inside { 20 } else { 200 }])
        });
        let binary = binarize_adaptive(&image, 5);
        assert!(binary.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(binary.get_pixel(11, 11)[0], 0);
        assert_eq!(binary.get_pixel(2, 2)[0], 255);
        assert_eq!(binary.get_pixel(8, 20)[0], 255);
    }
}
