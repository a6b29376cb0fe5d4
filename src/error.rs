use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::domain::StageKind;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Session Error: {0}")]
    Session(#[from] SessionError),
    #[error("Analysis Error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("Store Error: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to decode uploaded image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown or already consumed frame: {0}")]
    FrameNotFound(Uuid),
    #[error("Pipeline Error: {0}")]
    Pipeline(String),
}

// Camera Error Type

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("Device {device} is unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("Device {device} did not deliver a frame within {timeout:?}")]
    ReadTimeout { device: String, timeout: Duration },
    #[error("Stream from {device} has ended")]
    StreamEnded { device: String },
}

impl CameraError {
    pub fn unavailable(device: impl Into<String>, reason: impl Into<String>) -> Self {
        CameraError::DeviceUnavailable {
            device: device.into(),
            reason: reason.into(),
        }
    }
}

// Session Error Type

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid camera parameters: {0}")]
    InvalidParameters(String),
    #[error("A camera session is already active")]
    SessionAlreadyActive,
    #[error("No camera session is running")]
    SessionNotRunning,
    #[error("The camera session is busy")]
    SessionBusy,
    #[error(transparent)]
    Camera(#[from] CameraError),
}

// Inference Error Type

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} stage failed: {cause}")]
pub struct InferenceError {
    pub stage: StageKind,
    pub cause: InferenceCause,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceCause {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("model failure: {0}")]
    Model(String),
    #[error("invalid model output: {0}")]
    InvalidOutput(String),
}

impl InferenceError {
    pub fn new(stage: StageKind, cause: InferenceCause) -> Self {
        Self { stage, cause }
    }

    pub fn model(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, InferenceCause::Model(message.into()))
    }

    pub fn invalid_output(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, InferenceCause::InvalidOutput(message.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, InferenceCause::Timeout(_))
    }
}

// Analysis Error Type

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Analysis failed in every stage: {}", format_causes(.causes))]
    AnalysisFailed { causes: Vec<InferenceError> },
    #[error("Invalid report metadata: {0}")]
    InvalidMetadata(String),
    #[error("Failed to store frame image: {0}")]
    ImageIo(#[from] std::io::Error),
    #[error("Failed to encode frame image: {0}")]
    ImageEncode(#[from] image::ImageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_causes(causes: &[InferenceError]) -> String {
    causes
        .iter()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// Store Error Type

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid result payload: {0}")]
    InvalidPayload(String),
    #[error("Report {0} not found")]
    NotFound(i64),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl StoreError {
    /// Whether this is a storage-layer failure as opposed to a lookup or query problem.
    pub fn is_storage_error(&self) -> bool {
        !matches!(self, StoreError::NotFound(_) | StoreError::InvalidQuery(_))
    }
}
