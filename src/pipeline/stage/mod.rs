pub mod microplastic;
pub mod plankton;
pub mod service;

pub use microplastic::MicroplasticDetector;
pub use plankton::{species_info, PlanktonClassifier, SpeciesInfo};
pub use service::{StageRunner, StageService};

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::common::Frame;
use crate::error::InferenceError;
use crate::pipeline::domain::{DetectionResult, StageKind};

/// Side length of the square input both default models expect.
pub const MODEL_INPUT_SIZE: u32 = 224;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub classes: Vec<String>,
    pub input_size: (u32, u32),
    pub confidence_threshold: f64,
    /// The stage can produce a per-pixel mask of what it found.
    pub segmentation: bool,
    /// Detections carry regions worth cropping out and keeping with the report.
    pub roi_extraction: bool,
}

/// One detection model. Implementations must leave the frame untouched.
#[async_trait]
pub trait InferenceStage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn model_info(&self) -> ModelInfo;

    async fn infer(&self, frame: &Frame) -> Result<DetectionResult, InferenceError>;
}

/// Resizes the frame to the model's square input.
pub(crate) fn normalize_input(frame: &Frame) -> RgbImage {
    imageops::resize(frame.image(), MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::Triangle)
}

/// RNG keyed on the normalized input, so identical frames yield identical results.
pub(crate) fn seeded_rng(input: &RgbImage, salt: u64) -> StdRng {
    let digest = Sha256::new()
        .chain_update(input.as_raw())
        .chain_update(salt.to_le_bytes())
        .finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    StdRng::from_seed(seed)
}

/// Clips to `[0, 1]` and keeps three decimals.
pub(crate) fn round_confidence(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}
