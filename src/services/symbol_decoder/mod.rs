//! Symbol decoder - escalating enhancement ladder over one image region
//!
//! The search is an ordered list of (variant, rotation) steps evaluated
//! until one yields a payload. Variants are built lazily, so a region that
//! decodes on the first step never pays for equalization or binarization.
//!
//! Variant levels:
//! - 1: grayscale, upscaled
//! - 2: + upscaled with local contrast equalization
//! - 3: + upscaled with adaptive binarization

pub mod enhance;

use crate::infra::config::ConfigError;
use crate::io::symbol_reader::SymbolReader;
use image::{imageops, DynamicImage, GrayImage};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

pub const MAX_VARIANT_LEVEL: u8 = 3;

/// Bilateral window radius and color/space sigma for the denoise pass
const DENOISE_RADIUS: u32 = 3;
const DENOISE_SIGMA: f32 = 75.0;

/// Validated decoder parameters
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderSettings {
    pub variant_level: u8,
    pub upscale_factor: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub binarize_block_radius: u32,
    /// Edge-preserving smoothing before any sharpening
    pub denoise: bool,
    /// Sharpen region crops before the ladder
    pub sharpen: bool,
}

impl DecoderSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_VARIANT_LEVEL).contains(&self.variant_level) {
            return Err(ConfigError::VariantLevel(self.variant_level));
        }
        if !(self.upscale_factor.is_finite() && self.upscale_factor > 0.0) {
            return Err(ConfigError::NonPositive("upscale_factor"));
        }
        if !(self.clahe_clip_limit.is_finite() && self.clahe_clip_limit > 0.0) {
            return Err(ConfigError::NonPositive("clahe_clip_limit"));
        }
        if self.clahe_tiles == 0 {
            return Err(ConfigError::NonPositive("clahe_tiles"));
        }
        if self.binarize_block_radius == 0 {
            return Err(ConfigError::NonPositive("binarize_block_radius"));
        }
        Ok(())
    }
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            variant_level: MAX_VARIANT_LEVEL,
            upscale_factor: 2.0,
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
            binarize_block_radius: 15,
            denoise: true,
            sharpen: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Gray,
    Upscaled,
    Equalized,
    Binarized,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Gray => "gray",
            Variant::Upscaled => "upscaled",
            Variant::Equalized => "equalized",
            Variant::Binarized => "binarized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270];

    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

pub type LadderStep = (Variant, Rotation);

/// Result of walking a ladder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LadderOutcome {
    /// Distinct non-empty payloads from the first successful step
    pub payloads: Vec<String>,
    pub hit: Option<LadderStep>,
    pub attempts: usize,
}

/// Ordered decode attempts, every rotation of a variant before the next variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ladder {
    steps: SmallVec<[LadderStep; 16]>,
}

impl Ladder {
    fn from_variants(variants: &[Variant]) -> Self {
        let steps = variants
            .iter()
            .flat_map(|v| Rotation::ALL.iter().map(move |r| (*v, *r)))
            .collect();
        Self { steps }
    }

    /// Ladder for a region, capped at `level` (clamped to 1..=3)
    pub fn for_level(level: u8) -> Self {
        let variants: &[Variant] = match level.clamp(1, MAX_VARIANT_LEVEL) {
            1 => &[Variant::Gray, Variant::Upscaled],
            2 => &[Variant::Gray, Variant::Upscaled, Variant::Equalized],
            _ => &[Variant::Gray, Variant::Upscaled, Variant::Equalized, Variant::Binarized],
        };
        Self::from_variants(variants)
    }

    /// Cheap ladder for whole frames: no enhancement, rotations only
    pub fn whole_frame() -> Self {
        Self::from_variants(&[Variant::Gray])
    }

    pub fn steps(&self) -> &[LadderStep] {
        &self.steps
    }

    /// Run `attempt` on each step until one returns a non-empty payload
    pub fn search<F>(&self, mut attempt: F) -> LadderOutcome
    where
        F: FnMut(Variant, Rotation) -> Vec<String>,
    {
        let mut attempts = 0;
        for &(variant, rotation) in &self.steps {
            attempts += 1;
            let payloads = distinct_payloads(attempt(variant, rotation));
            if !payloads.is_empty() {
                return LadderOutcome { payloads, hit: Some((variant, rotation)), attempts };
            }
        }
        LadderOutcome { payloads: Vec::new(), hit: None, attempts }
    }
}

fn distinct_payloads(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for payload in raw {
        if !payload.is_empty() && !out.contains(&payload) {
            out.push(payload);
        }
    }
    out
}

/// Variant images for one decode, built on first use
struct VariantCache<'a> {
    gray: &'a GrayImage,
    settings: &'a DecoderSettings,
    upscaled: Option<GrayImage>,
    equalized: Option<GrayImage>,
    binarized: Option<GrayImage>,
}

impl<'a> VariantCache<'a> {
    fn new(gray: &'a GrayImage, settings: &'a DecoderSettings) -> Self {
        Self { gray, settings, upscaled: None, equalized: None, binarized: None }
    }

    fn upscaled(&mut self) -> &GrayImage {
        let (gray, factor) = (self.gray, self.settings.upscale_factor);
        self.upscaled.get_or_insert_with(|| enhance::upscale(gray, factor))
    }

    fn get(&mut self, variant: Variant) -> &GrayImage {
        match variant {
            Variant::Gray => self.gray,
            Variant::Upscaled => self.upscaled(),
            Variant::Equalized => {
                if self.equalized.is_none() {
                    let (tiles, clip) = (self.settings.clahe_tiles, self.settings.clahe_clip_limit);
                    let equalized = enhance::equalize_local(self.upscaled(), tiles, clip);
                    self.equalized = Some(equalized);
                }
                self.equalized.get_or_insert_with(GrayImage::default)
            }
            Variant::Binarized => {
                if self.binarized.is_none() {
                    let radius = self.settings.binarize_block_radius;
                    let binarized = enhance::binarize_adaptive(self.upscaled(), radius);
                    self.binarized = Some(binarized);
                }
                self.binarized.get_or_insert_with(GrayImage::default)
            }
        }
    }
}

fn rotate(image: &GrayImage, rotation: Rotation) -> GrayImage {
    match rotation {
        Rotation::Deg0 => image.clone(),
        Rotation::Deg90 => imageops::rotate90(image),
        Rotation::Deg180 => imageops::rotate180(image),
        Rotation::Deg270 => imageops::rotate270(image),
    }
}

/// Decodes image regions through the variant ladder
pub struct SymbolDecoder {
    settings: DecoderSettings,
    reader: Arc<dyn SymbolReader>,
    region_ladder: Ladder,
    frame_ladder: Ladder,
}

impl SymbolDecoder {
    pub fn new(settings: DecoderSettings, reader: Arc<dyn SymbolReader>) -> Result<Self, ConfigError> {
        settings.validate()?;
        let region_ladder = Ladder::for_level(settings.variant_level);
        Ok(Self { settings, reader, region_ladder, frame_ladder: Ladder::whole_frame() })
    }

    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    /// Decode a cropped region. Pure function of the image.
    pub fn decode(&self, region: &DynamicImage) -> LadderOutcome {
        let mut gray = self.denoised(region);
        if self.settings.sharpen {
            gray = enhance::sharpen(&gray);
        }
        self.run_ladder(&self.region_ladder, &gray)
    }

    /// Lower-precision decode of a whole frame, rotations only
    pub fn decode_whole_frame(&self, frame: &DynamicImage) -> LadderOutcome {
        self.run_ladder(&self.frame_ladder, &self.denoised(frame))
    }

    fn denoised(&self, image: &DynamicImage) -> GrayImage {
        let gray = image.to_luma8();
        if !self.settings.denoise {
            return gray;
        }
        enhance::denoise_bilateral(&gray, DENOISE_RADIUS, DENOISE_SIGMA, DENOISE_SIGMA)
    }

    fn run_ladder(&self, ladder: &Ladder, gray: &GrayImage) -> LadderOutcome {
        if gray.width() == 0 || gray.height() == 0 {
            return LadderOutcome::default();
        }
        let mut cache = VariantCache::new(gray, &self.settings);
        let outcome = ladder.search(|variant, rotation| {
            let image = cache.get(variant);
            match rotation {
                Rotation::Deg0 => self.reader.read(image),
                _ => self.reader.read(&rotate(image, rotation)),
            }
        });
        if let Some((variant, rotation)) = outcome.hit {
            trace!(
                variant = %variant.as_str(),
                rotation = %rotation.degrees(),
                attempts = %outcome.attempts,
                payloads = %outcome.payloads.len(),
                "decode_hit"
            );
        }
        outcome
    }
}
