//! Region ranking and cropping

use crate::domain::types::{BoundingBox, RegionProposal};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

/// Upper bound on either side of an upscaled crop
const MAX_CROP_SIDE: u32 = 4096;
/// Largest per-side shrink fraction
pub const MAX_SHRINK: f32 = 0.45;

/// Crop geometry for region decoding
#[derive(Debug, Clone, PartialEq)]
pub struct CropSettings {
    /// Absolute padding added on each side after shrinking
    pub pad_px: u32,
    /// Padding as a fraction of the shrunk box size, per side
    pub pad_pct: f32,
    /// Fraction cut from each side before padding, in [0, MAX_SHRINK]
    pub shrink: f32,
    /// Crops whose narrow side is below this are upscaled
    pub min_width: u32,
    /// Minimum scale applied to narrow crops
    pub upscale: f32,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self { pad_px: 8, pad_pct: 0.06, shrink: 0.10, min_width: 360, upscale: 2.0 }
    }
}

/// Drop proposals under the confidence floor, order by confidence then
/// area (both descending) and keep at most `max_regions`
pub fn rank_proposals(
    mut proposals: Vec<RegionProposal>,
    min_confidence: f32,
    max_regions: usize,
) -> Vec<RegionProposal> {
    proposals.retain(|p| p.confidence.is_finite() && p.confidence >= min_confidence && !p.bbox.is_empty());
    proposals.sort_by(|a, b| {
        b.confidence.total_cmp(&a.confidence).then_with(|| b.bbox.area().cmp(&a.bbox.area()))
    });
    proposals.truncate(max_regions);
    proposals
}

/// Shrink then pad `bbox`, clamped to the frame. `None` if nothing remains.
pub fn crop_box(bbox: &BoundingBox, frame_width: u32, frame_height: u32, crop: &CropSettings) -> Option<BoundingBox> {
    let mut x1 = bbox.x1.min(frame_width);
    let mut y1 = bbox.y1.min(frame_height);
    let mut x2 = bbox.x2.min(frame_width);
    let mut y2 = bbox.y2.min(frame_height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let shrink = crop.shrink.clamp(0.0, MAX_SHRINK);
    let sx = ((x2 - x1) as f32 * shrink) as u32;
    let sy = ((y2 - y1) as f32 * shrink) as u32;
    x1 += sx;
    x2 -= sx;
    y1 += sy;
    y2 -= sy;

    let ex = (x2.saturating_sub(x1) as f32 * crop.pad_pct) as u32 + crop.pad_px;
    let ey = (y2.saturating_sub(y1) as f32 * crop.pad_pct) as u32 + crop.pad_px;
    let padded = BoundingBox::new(
        x1.saturating_sub(ex),
        y1.saturating_sub(ey),
        x2.saturating_add(ex).min(frame_width),
        y2.saturating_add(ey).min(frame_height),
    );
    (!padded.is_empty()).then_some(padded)
}

/// Cut a region out of the frame, upscaling narrow crops
pub fn crop_region(frame: &DynamicImage, bbox: &BoundingBox, crop: &CropSettings) -> Option<DynamicImage> {
    let (width, height) = frame.dimensions();
    let b = crop_box(bbox, width, height, crop)?;
    let region = frame.crop_imm(b.x1, b.y1, b.width(), b.height());

    let narrow = b.width().min(b.height());
    if narrow >= crop.min_width {
        return Some(region);
    }
    let wanted = crop.upscale.max(crop.min_width as f32 / narrow.max(1) as f32);
    let limit = MAX_CROP_SIDE as f32 / b.width().max(b.height()) as f32;
    let scale = wanted.min(limit);
    if scale <= 1.0 {
        return Some(region);
    }
    let new_width = (b.width() as f32 * scale).round() as u32;
    let new_height = (b.height() as f32 * scale).round() as u32;
    Some(region.resize_exact(new_width, new_height, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn proposal(x1: u32, y1: u32, x2: u32, y2: u32, confidence: f32) -> RegionProposal {
        RegionProposal { bbox: BoundingBox::new(x1, y1, x2, y2), confidence }
    }

    #[test]
    fn test_rank_by_confidence_then_area() {
        let ranked = rank_proposals(
            vec![
                proposal(0, 0, 10, 10, 0.5),
                proposal(0, 0, 50, 50, 0.5),
                proposal(0, 0, 5, 5, 0.9),
                proposal(0, 0, 80, 80, 0.1),
                proposal(5, 5, 5, 9, 0.99),
            ],
            0.25,
            2,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].confidence, 0.9);
        assert_eq!(ranked[1].bbox.area(), 2500);
    }

    #[test]
    fn test_crop_box_shrinks_then_pads() {
        let crop = CropSettings { pad_px: 8, pad_pct: 0.06, shrink: 0.10, ..CropSettings::default() };
        // 200x100 box: shrink 20/10 per side, then pad 8+9 / 8+4 per side
        let b = crop_box(&BoundingBox::new(100, 100, 300, 200), 1000, 1000, &crop).unwrap();
        assert_eq!(b, BoundingBox::new(103, 98, 297, 202));
    }

    #[test]
    fn test_crop_box_clamps_to_frame() {
        let crop = CropSettings { shrink: 0.0, ..CropSettings::default() };
        let b = crop_box(&BoundingBox::new(0, 0, 640, 480), 640, 480, &crop).unwrap();
        assert_eq!(b, BoundingBox::new(0, 0, 640, 480));
        assert!(crop_box(&BoundingBox::new(700, 0, 800, 10), 640, 480, &crop).is_none());
    }

    #[test]
    fn test_crop_box_caps_shrink() {
        let crop = CropSettings { pad_px: 0, pad_pct: 0.0, shrink: 1.5, ..CropSettings::default() };
        let b = crop_box(&BoundingBox::new(100, 100, 300, 200), 1000, 1000, &crop).unwrap();
        assert_eq!(b, BoundingBox::new(190, 145, 210, 155));
    }

    #[test]
    fn test_crop_region_upscales_narrow_crops() {
        let frame = DynamicImage::ImageLuma8(GrayImage::new(1000, 1000));
        let crop = CropSettings { pad_px: 0, pad_pct: 0.0, shrink: 0.0, min_width: 90, upscale: 2.0 };

        // Narrow side 30 -> scale max(2.0, 90/30) = 3
        let region = crop_region(&frame, &BoundingBox::new(0, 0, 120, 30), &crop).unwrap();
        assert_eq!(region.dimensions(), (360, 90));

        // Wide enough: cropped only
        let region = crop_region(&frame, &BoundingBox::new(0, 0, 200, 100), &crop).unwrap();
        assert_eq!(region.dimensions(), (200, 100));
    }
}
