//! Barcode region proposers
//!
//! The detector model lives outside this crate; anything that can turn a
//! frame into scored boxes plugs in here.

use crate::domain::types::{BoundingBox, RegionProposal};
use image::{DynamicImage, GenericImageView};

pub trait RegionProposer: Send + Sync {
    fn propose(&self, frame: &DynamicImage) -> Vec<RegionProposal>;
}

/// Proposes the whole frame as a single region
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeFrameProposer;

impl RegionProposer for WholeFrameProposer {
    fn propose(&self, frame: &DynamicImage) -> Vec<RegionProposal> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }
        vec![RegionProposal { bbox: BoundingBox::new(0, 0, width, height), confidence: 1.0 }]
    }
}

/// Returns the same proposals for every frame
#[derive(Debug, Clone, Default)]
pub struct FixedProposer {
    proposals: Vec<RegionProposal>,
}

impl FixedProposer {
    pub fn new(proposals: Vec<RegionProposal>) -> Self {
        Self { proposals }
    }
}

impl RegionProposer for FixedProposer {
    fn propose(&self, _frame: &DynamicImage) -> Vec<RegionProposal> {
        self.proposals.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn test_whole_frame_proposer() {
        let frame = DynamicImage::ImageLuma8(GrayImage::new(640, 480));
        let proposals = WholeFrameProposer.propose(&frame);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].bbox, BoundingBox::new(0, 0, 640, 480));

        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(WholeFrameProposer.propose(&empty).is_empty());
    }
}
