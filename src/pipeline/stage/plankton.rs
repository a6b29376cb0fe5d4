use async_trait::async_trait;
use image::{GrayImage, Luma};
use indexmap::IndexMap;
use rand::seq::index;
use rand::Rng;
use serde::Serialize;

use super::{normalize_input, round_confidence, seeded_rng, InferenceStage, ModelInfo, MODEL_INPUT_SIZE};
use crate::common::Frame;
use crate::error::InferenceError;
use crate::pipeline::domain::{BoundingBox, DetectionResult, PlanktonDetection, PlanktonResult, StageKind};

pub const SPECIES: [&str; 20] = [
    "Diatoms",
    "Copepods",
    "Dinoflagellates",
    "Radiolarians",
    "Foraminifera",
    "Coccolithophores",
    "Ciliates",
    "Flagellates",
    "Nauplius",
    "Amphipods",
    "Cladocera",
    "Rotifers",
    "Chaetognaths",
    "Appendicularians",
    "Polychaetes",
    "Crustacean_Larva",
    "Fish_Larva",
    "Gelatinous_Zooplankton",
    "Bacteria",
    "Viruses",
];

/// Field notes for one plankton group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeciesInfo {
    pub description: &'static str,
    pub size_range: &'static str,
    pub habitat: &'static str,
    pub ecological_role: &'static str,
}

const GENERIC_SPECIES: SpeciesInfo = SpeciesInfo {
    description: "Plankton species",
    size_range: "Variable",
    habitat: "Aquatic",
    ecological_role: "Part of marine food web",
};

/// Reference notes for `species`; groups without dedicated notes get a generic entry.
pub fn species_info(species: &str) -> SpeciesInfo {
    match species {
        "Diatoms" => SpeciesInfo {
            description: "Silica-shelled phytoplankton",
            size_range: "10-200 μm",
            habitat: "Freshwater and marine",
            ecological_role: "Primary producers",
        },
        "Copepods" => SpeciesInfo {
            description: "Small crustacean zooplankton",
            size_range: "0.5-5 mm",
            habitat: "Marine and freshwater",
            ecological_role: "Primary consumers",
        },
        "Dinoflagellates" => SpeciesInfo {
            description: "Motile phytoplankton with flagella",
            size_range: "10-100 μm",
            habitat: "Marine and freshwater",
            ecological_role: "Primary producers, some bioluminescent",
        },
        "Radiolarians" => SpeciesInfo {
            description: "Marine protists with silica skeletons",
            size_range: "50-500 μm",
            habitat: "Marine",
            ecological_role: "Primary consumers",
        },
        "Foraminifera" => SpeciesInfo {
            description: "Single-celled organisms with calcareous shells",
            size_range: "50-1000 μm",
            habitat: "Marine",
            ecological_role: "Primary consumers",
        },
        _ => GENERIC_SPECIES,
    }
}

/// Segmentation mask for a `width` x `height` frame: every organism's region of interest
/// is filled as an ellipse with 255, background stays 0.
pub fn segment(result: &PlanktonResult, width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    if width == 0 || height == 0 {
        return mask;
    }
    for detection in &result.detailed {
        let (x, y, w, h) = detection.roi_bbox.to_pixels(width, height);
        if w == 0 || h == 0 {
            continue;
        }
        let (rx, ry) = (w as f64 / 2.0, h as f64 / 2.0);
        let (cx, cy) = (x as f64 + rx, y as f64 + ry);
        for py in y..(y + h).min(height) {
            for px in x..(x + w).min(width) {
                let dx = (px as f64 + 0.5 - cx) / rx;
                let dy = (py as f64 + 0.5 - cy) / ry;
                if dx * dx + dy * dy <= 1.0 {
                    mask.put_pixel(px, py, Luma([255]));
                }
            }
        }
    }
    mask
}

/// Simulated plankton classifier: three to six species per frame, each organism with its
/// own region of interest.
pub struct PlanktonClassifier {
    max_per_species: u32,
}

impl PlanktonClassifier {
    pub fn new() -> Self {
        Self { max_per_species: 12 }
    }
}

impl Default for PlanktonClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(frame: &Frame, max_per_species: u32) -> PlanktonResult {
    let input = normalize_input(frame);
    let mut rng = seeded_rng(&input, 0x706b);

    let species_count = rng.random_range(3..=6);
    let mut picked: Vec<(&str, u32, f64)> = index::sample(&mut rng, SPECIES.len(), species_count)
        .into_iter()
        .map(|i| {
            let count = rng.random_range(1..=max_per_species.max(1));
            let confidence = rng.random_range(0.6..0.95);
            (SPECIES[i], count, confidence)
        })
        .collect();
    picked.sort_by(|a, b| b.1.cmp(&a.1));

    let mut species_summary = IndexMap::with_capacity(picked.len());
    let mut detailed = Vec::new();
    for (species, count, confidence) in picked {
        species_summary.insert(species.to_string(), count);
        for _ in 0..count {
            let x = rng.random_range(0.0..0.9);
            let y = rng.random_range(0.0..0.9);
            let w = rng.random_range(0.02..0.1);
            let h = rng.random_range(0.02..0.1);
            detailed.push(PlanktonDetection {
                species: species.to_string(),
                roi_bbox: BoundingBox {
                    x_min: x,
                    y_min: y,
                    x_max: f64::min(x + w, 1.0),
                    y_max: f64::min(y + h, 1.0),
                },
                confidence: round_confidence(confidence + rng.random_range(-0.05..0.05)),
            });
        }
    }

    PlanktonResult {
        species_summary,
        detailed,
    }
}

#[async_trait]
impl InferenceStage for PlanktonClassifier {
    fn kind(&self) -> StageKind {
        StageKind::Plankton
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "Plankton Classification Model".to_string(),
            version: "1.0".to_string(),
            classes: SPECIES.iter().map(|s| s.to_string()).collect(),
            input_size: (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE),
            confidence_threshold: 0.6,
            segmentation: true,
            roi_extraction: true,
        }
    }

    async fn infer(&self, frame: &Frame) -> Result<DetectionResult, InferenceError> {
        let frame = frame.clone();
        let max_per_species = self.max_per_species;
        let result = tokio::task::spawn_blocking(move || classify(&frame, max_per_species))
            .await
            .map_err(|err| InferenceError::model(StageKind::Plankton, err.to_string()))?;
        tracing::debug!(
            species = result.species_summary.len(),
            organisms = result.detailed.len(),
            "Plankton inference done"
        );
        Ok(DetectionResult::Plankton(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FrameOrigin;
    use chrono::Utc;
    use image::{Rgb, RgbImage};

    fn frame(seed: u8) -> Frame {
        let image = RgbImage::from_fn(400, 300, |x, y| Rgb([(x % 251) as u8 ^ seed, (y % 241) as u8, seed]));
        Frame::new(
            FrameOrigin::Camera {
                device: "usb:0".to_string(),
            },
            image,
            Utc::now(),
        )
    }

    async fn classify_frame(frame: &Frame) -> PlanktonResult {
        match PlanktonClassifier::new().infer(frame).await.unwrap() {
            DetectionResult::Plankton(result) => result,
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn picks_three_to_six_known_species() {
        for seed in 0..10 {
            let result = classify_frame(&frame(seed)).await;
            let n = result.species_summary.len();
            assert!((3..=6).contains(&n), "{n} species");
            assert!(result.species_summary.keys().all(|s| SPECIES.contains(&s.as_str())));
            assert!(result.validate().is_ok());
        }
    }

    #[tokio::test]
    async fn summary_is_ordered_by_abundance() {
        let result = classify_frame(&frame(42)).await;
        let counts: Vec<u32> = result.species_summary.values().copied().collect();
        assert!(counts.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(result.detailed[0].species, *result.species_summary.keys().next().unwrap());
    }

    #[test]
    fn species_info_covers_known_groups_and_falls_back() {
        assert_eq!(species_info("Copepods").size_range, "0.5-5 mm");
        assert_eq!(species_info("Foraminifera").habitat, "Marine");
        assert_eq!(species_info("Rotifers"), GENERIC_SPECIES);
        assert_eq!(species_info("not a plankton").description, "Plankton species");
    }

    #[test]
    fn mask_fills_regions_of_interest_only() {
        let result = PlanktonResult {
            species_summary: IndexMap::from([("Diatoms".to_string(), 1)]),
            detailed: vec![PlanktonDetection {
                species: "Diatoms".to_string(),
                roi_bbox: BoundingBox::from_pixels(20, 20, 60, 40, 100, 100),
                confidence: 0.9,
            }],
        };

        let mask = segment(&result, 100, 100);
        assert_eq!(mask.dimensions(), (100, 100));
        assert_eq!(mask.get_pixel(40, 30), &Luma([255]));
        assert_eq!(mask.get_pixel(20, 20), &Luma([0]));
        assert_eq!(mask.get_pixel(80, 80), &Luma([0]));
        assert!(mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[tokio::test]
    async fn advertises_segmentation_and_roi_extraction() {
        let info = PlanktonClassifier::new().model_info();
        assert!(info.segmentation && info.roi_extraction);
        assert_eq!(info.classes.len(), SPECIES.len());
    }

    #[tokio::test]
    async fn same_frame_gives_same_result() {
        let frame = frame(5);
        assert_eq!(classify_frame(&frame).await, classify_frame(&frame).await);
    }
}
