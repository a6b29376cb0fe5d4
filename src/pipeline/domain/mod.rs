pub mod detection;
pub mod report;

pub use detection::{
    BoundingBox, DetectionResult, MicroplasticResult, Particle, ParticleClass, PlanktonDetection,
    PlanktonResult, StageKind,
};
pub use report::{Report, ReportDraft, ReportMetadata, StageWarning};
