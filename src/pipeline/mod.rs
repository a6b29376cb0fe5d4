pub mod analysis;
pub mod domain;
pub mod image_store;
pub mod overlay;
pub mod stage;

pub use analysis::{AnalysisPipeline, AnalysisPipelineBuilder};
pub use image_store::ImageStore;
