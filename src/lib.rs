pub mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AnalysisError, AppError, CameraError, InferenceError, SessionError, StoreError};

pub use config::Configuration;
pub use coordinator::{Coordinator, CoordinatorBuilder, FrameRef};
pub use intake::session::{CameraSessionManager, CaptureSpec, SessionInfo, SessionState};
pub use pipeline::domain::{Report, ReportMetadata};
pub use pipeline::AnalysisPipeline;
pub use store::{MonthlyDetections, ReportFilter, ReportStatistics, ReportStore};
