use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Microplastic,
    Plankton,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Microplastic => write!(f, "microplastic"),
            StageKind::Plankton => write!(f, "plankton"),
        }
    }
}

/// Normalized `[x_min, y_min, x_max, y_max]`, each coordinate a fraction of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f64; 4]", try_from = "[f64; 4]")]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Result<Self, String> {
        let bbox = Self {
            x_min,
            y_min,
            x_max,
            y_max,
        };
        if bbox.is_valid() {
            Ok(bbox)
        } else {
            Err(format!("bounding box {:?} is not normalized", bbox.to_array()))
        }
    }

    /// Box in pixel coordinates converted to fractions of `width` x `height`, clipped to
    /// the frame.
    pub fn from_pixels(x1: u32, y1: u32, x2: u32, y2: u32, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f64, height.max(1) as f64);
        let fx = |v: u32| (v as f64 / w).clamp(0.0, 1.0);
        let fy = |v: u32| (v as f64 / h).clamp(0.0, 1.0);
        Self {
            x_min: fx(x1.min(x2)),
            y_min: fy(y1.min(y2)),
            x_max: fx(x1.max(x2)),
            y_max: fy(y1.max(y2)),
        }
    }

    pub fn is_valid(&self) -> bool {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        self.to_array().iter().all(|v| in_unit(*v)) && self.x_min <= self.x_max && self.y_min <= self.y_max
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }

    /// Pixel rectangle `(x, y, width, height)` on a `width` x `height` frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x = (self.x_min * width as f64).round() as u32;
        let y = (self.y_min * height as f64).round() as u32;
        let x2 = (self.x_max * width as f64).round() as u32;
        let y2 = (self.y_max * height as f64).round() as u32;
        (x, y, x2.saturating_sub(x), y2.saturating_sub(y))
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(bbox: BoundingBox) -> Self {
        bbox.to_array()
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = String;

    fn try_from([x_min, y_min, x_max, y_max]: [f64; 4]) -> Result<Self, Self::Error> {
        BoundingBox::new(x_min, y_min, x_max, y_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticleClass {
    Fiber,
    Fragment,
    Pellet,
    Film,
}

impl ParticleClass {
    pub const ALL: [ParticleClass; 4] = [
        ParticleClass::Fiber,
        ParticleClass::Fragment,
        ParticleClass::Pellet,
        ParticleClass::Film,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticleClass::Fiber => "fiber",
            ParticleClass::Fragment => "fragment",
            ParticleClass::Pellet => "pellet",
            ParticleClass::Film => "film",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub class: ParticleClass,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroplasticResult {
    pub present: bool,
    pub count: u32,
    pub confidence: f64,
    pub particles: Vec<Particle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanktonDetection {
    pub species: String,
    pub roi_bbox: BoundingBox,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanktonResult {
    /// Species to count, most abundant first.
    pub species_summary: IndexMap<String, u32>,
    pub detailed: Vec<PlanktonDetection>,
}

impl PlanktonResult {
    pub fn total_count(&self) -> u32 {
        self.species_summary.values().sum()
    }
}

/// Output of one inference stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DetectionResult {
    Microplastic(MicroplasticResult),
    Plankton(PlanktonResult),
}

fn check_confidence(what: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{what} confidence {value} is outside [0, 1]"))
    }
}

fn check_bbox(what: &str, bbox: &BoundingBox) -> Result<(), String> {
    if bbox.is_valid() {
        Ok(())
    } else {
        Err(format!("{what} bounding box {:?} is not normalized", bbox.to_array()))
    }
}

impl MicroplasticResult {
    pub fn validate(&self) -> Result<(), String> {
        check_confidence("microplastic", self.confidence)?;
        if self.count as usize != self.particles.len() {
            return Err(format!(
                "microplastic count {} does not match {} particles",
                self.count,
                self.particles.len()
            ));
        }
        if self.present != (self.count > 0) {
            return Err(format!(
                "microplastic present={} contradicts count {}",
                self.present, self.count
            ));
        }
        for particle in &self.particles {
            check_confidence("particle", particle.confidence)?;
            check_bbox("particle", &particle.bbox)?;
        }
        Ok(())
    }
}

impl PlanktonResult {
    pub fn validate(&self) -> Result<(), String> {
        let total = self.total_count() as usize;
        if total != self.detailed.len() {
            return Err(format!(
                "plankton summary counts {total} organisms but {} are detailed",
                self.detailed.len()
            ));
        }
        for (species, expected) in &self.species_summary {
            let found = self.detailed.iter().filter(|d| &d.species == species).count();
            if found != *expected as usize {
                return Err(format!(
                    "plankton summary lists {expected} {species} but {found} are detailed"
                ));
            }
        }
        for detection in &self.detailed {
            check_confidence("plankton", detection.confidence)?;
            check_bbox("plankton roi", &detection.roi_bbox)?;
        }
        Ok(())
    }
}

impl DetectionResult {
    pub fn kind(&self) -> StageKind {
        match self {
            DetectionResult::Microplastic(_) => StageKind::Microplastic,
            DetectionResult::Plankton(_) => StageKind::Plankton,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            DetectionResult::Microplastic(result) => result.validate(),
            DetectionResult::Plankton(result) => result.validate(),
        }
    }
}
