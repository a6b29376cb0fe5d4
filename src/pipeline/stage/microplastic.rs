use async_trait::async_trait;
use rand::Rng;

use super::{normalize_input, round_confidence, seeded_rng, InferenceStage, ModelInfo, MODEL_INPUT_SIZE};
use crate::common::Frame;
use crate::error::InferenceError;
use crate::pipeline::domain::{
    BoundingBox, DetectionResult, MicroplasticResult, Particle, ParticleClass, StageKind,
};

// Frames below this many pixels yield fewer particles at lower confidence.
const SMALL_FRAME_PIXELS: u64 = 100_000;
const MAX_PARTICLES: u32 = 25;

/// Simulated microplastic detector.
///
/// Deterministic in the frame content: particles of the four plastic classes with pixel
/// boxes between 50 and 150 px, detected in roughly `detection_rate` of frames.
pub struct MicroplasticDetector {
    detection_rate: f64,
}

impl MicroplasticDetector {
    pub fn new() -> Self {
        Self { detection_rate: 0.7 }
    }

    pub fn with_detection_rate(mut self, detection_rate: f64) -> Self {
        self.detection_rate = detection_rate.clamp(0.0, 1.0);
        self
    }
}

impl Default for MicroplasticDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn detect(frame: &Frame, detection_rate: f64) -> MicroplasticResult {
    let input = normalize_input(frame);
    let mut rng = seeded_rng(&input, 0x6d70);
    let (width, height) = (frame.width(), frame.height());
    let small = (width as u64) * (height as u64) < SMALL_FRAME_PIXELS;

    let detected = rng.random_bool(detection_rate);
    let mut count = if detected {
        rng.random_range(1..=MAX_PARTICLES)
    } else {
        0
    };
    let mut confidence = if detected {
        rng.random_range(0.6..0.95)
    } else {
        rng.random_range(0.1..0.4)
    };
    if small {
        count = count.saturating_sub(5);
        confidence *= 0.9;
    }

    let particles = (0..count)
        .map(|_| {
            let class = ParticleClass::ALL[rng.random_range(0..ParticleClass::ALL.len())];
            let x1 = rng.random_range(0..=width / 2);
            let y1 = rng.random_range(0..=height / 2);
            let x2 = x1 + rng.random_range(50..=150);
            let y2 = y1 + rng.random_range(50..=150);
            Particle {
                class,
                bbox: BoundingBox::from_pixels(x1, y1, x2, y2, width, height),
                confidence: round_confidence(rng.random_range(0.5..0.9)),
            }
        })
        .collect();

    MicroplasticResult {
        present: count > 0,
        count,
        confidence: round_confidence(confidence),
        particles,
    }
}

#[async_trait]
impl InferenceStage for MicroplasticDetector {
    fn kind(&self) -> StageKind {
        StageKind::Microplastic
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "Microplastic Detection Model".to_string(),
            version: "1.0".to_string(),
            classes: ParticleClass::ALL.iter().map(|c| c.as_str().to_string()).collect(),
            input_size: (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE),
            confidence_threshold: 0.7,
            segmentation: false,
            roi_extraction: false,
        }
    }

    async fn infer(&self, frame: &Frame) -> Result<DetectionResult, InferenceError> {
        let frame = frame.clone();
        let detection_rate = self.detection_rate;
        let result = tokio::task::spawn_blocking(move || detect(&frame, detection_rate))
            .await
            .map_err(|err| InferenceError::model(StageKind::Microplastic, err.to_string()))?;
        tracing::debug!(count = result.count, confidence = result.confidence, "Microplastic inference done");
        Ok(DetectionResult::Microplastic(result))
    }
}
