use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::detection::{MicroplasticResult, PlanktonResult, StageKind};

/// Caller-supplied description of the slide being analyzed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub slide_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub user: String,
}

impl ReportMetadata {
    pub fn new(slide_name: impl Into<String>) -> Self {
        Self {
            slide_name: slide_name.into(),
            ..Default::default()
        }
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// A stage that failed while the other one succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWarning {
    pub stage: StageKind,
    pub message: String,
}

/// Everything needed to persist a report; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
    pub slide_name: String,
    pub location: String,
    pub user: String,
    pub microplastic: Option<MicroplasticResult>,
    pub plankton: Option<PlanktonResult>,
    pub image_path: PathBuf,
    pub annotated_image_path: Option<PathBuf>,
    /// Padded crops of the most confident plankton regions.
    pub roi_image_paths: Vec<PathBuf>,
    pub warnings: Vec<StageWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub id: i64,
    pub slide_name: String,
    pub created_at: DateTime<Utc>,
    pub location: String,
    pub user: String,
    pub microplastic: Option<MicroplasticResult>,
    pub plankton: Option<PlanktonResult>,
    pub image_path: PathBuf,
    pub annotated_image_path: Option<PathBuf>,
    /// Padded crops of the most confident plankton regions.
    pub roi_image_paths: Vec<PathBuf>,
    pub warnings: Vec<StageWarning>,
}

impl Report {
    pub fn microplastics_present(&self) -> bool {
        self.microplastic.as_ref().is_some_and(|m| m.present)
    }

    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}
