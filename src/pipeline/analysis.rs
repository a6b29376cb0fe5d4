use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::common::Frame;
use crate::error::{AnalysisError, AppError, InferenceError};
use crate::pipeline::domain::{
    DetectionResult, MicroplasticResult, PlanktonResult, Report, ReportDraft, ReportMetadata,
    StageKind, StageWarning,
};
use crate::pipeline::image_store::{ImageStore, StoredImage};
use crate::pipeline::overlay;
use crate::pipeline::stage::{InferenceStage, StageRunner};
use crate::store::ReportStore;

const DEFAULT_ROI_CROPS: usize = 4;

/// Runs both detection stages on a frame and persists whatever they found.
pub struct AnalysisPipeline {
    microplastic: StageRunner,
    plankton: StageRunner,
    images: ImageStore,
    store: ReportStore,
    annotate: bool,
    roi_crops: usize,
}

impl AnalysisPipeline {
    pub fn builder() -> AnalysisPipelineBuilder {
        AnalysisPipelineBuilder::new()
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    /// Analyzes `frame` and returns the persisted report.
    ///
    /// A report is written as long as one stage succeeds; the failed stage is recorded as a
    /// warning. When both fail nothing is written.
    pub async fn analyze(&self, frame: &Frame, metadata: &ReportMetadata) -> Result<Report, AnalysisError> {
        if metadata.slide_name.trim().is_empty() {
            return Err(AnalysisError::InvalidMetadata("slide_name must not be blank".to_string()));
        }

        tracing::info!(
            frame_id = %frame.id(),
            slide = %metadata.slide_name,
            width = frame.width(),
            height = frame.height(),
            "Analyzing frame"
        );
        let (microplastic, plankton) = tokio::join!(
            self.microplastic.run(frame.clone()),
            self.plankton.run(frame.clone())
        );

        let mut warnings = Vec::new();
        let mut causes = Vec::new();
        let microplastic = collect(microplastic, &mut warnings, &mut causes).and_then(|result| match result {
            DetectionResult::Microplastic(result) => Some(result),
            DetectionResult::Plankton(_) => None,
        });
        let plankton = collect(plankton, &mut warnings, &mut causes).and_then(|result| match result {
            DetectionResult::Plankton(result) => Some(result),
            DetectionResult::Microplastic(_) => None,
        });
        if microplastic.is_none() && plankton.is_none() {
            tracing::error!(frame_id = %frame.id(), "Both stages failed, nothing persisted");
            return Err(AnalysisError::AnalysisFailed { causes });
        }

        let mut created = Vec::new();
        let outcome = self
            .persist(frame, metadata, microplastic, plankton, warnings, &mut created)
            .await;
        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                // Content-addressed files written by an earlier analysis stay put.
                for path in &created {
                    if let Err(remove_err) = tokio::fs::remove_file(path).await {
                        tracing::warn!(path = %path.display(), error = %remove_err, "Failed to remove orphaned image");
                    }
                }
                tracing::error!(frame_id = %frame.id(), error = %err, "Report not stored");
                return Err(err);
            }
        };

        tracing::info!(
            report_id = report.id,
            microplastics_present = report.microplastics_present(),
            partial = report.is_partial(),
            "Report stored"
        );
        Ok(report)
    }

    /// Writes the images and the report row, recording every file it creates in `created`.
    async fn persist(
        &self,
        frame: &Frame,
        metadata: &ReportMetadata,
        microplastic: Option<MicroplasticResult>,
        plankton: Option<PlanktonResult>,
        warnings: Vec<StageWarning>,
        created: &mut Vec<PathBuf>,
    ) -> Result<Report, AnalysisError> {
        let mut keep = |image: StoredImage| {
            if image.created {
                created.push(image.path.clone());
            }
            image.path
        };

        let image_path = keep(self.images.save_frame(frame).await?);
        let annotated_image_path = if self.annotate {
            Some(keep(self.save_overlay(frame, microplastic.clone(), plankton.clone()).await?))
        } else {
            None
        };
        let roi_image_paths = match &plankton {
            Some(plankton) if self.roi_crops > 0 => self
                .images
                .save_roi_crops(frame, plankton, self.roi_crops)
                .await?
                .into_iter()
                .map(&mut keep)
                .collect(),
            _ => Vec::new(),
        };

        Ok(self
            .store
            .create(ReportDraft {
                slide_name: metadata.slide_name.trim().to_string(),
                location: metadata.location.clone(),
                user: metadata.user.clone(),
                microplastic,
                plankton,
                image_path,
                annotated_image_path,
                roi_image_paths,
                warnings,
            })
            .await?)
    }

    async fn save_overlay(
        &self,
        frame: &Frame,
        microplastic: Option<MicroplasticResult>,
        plankton: Option<PlanktonResult>,
    ) -> Result<StoredImage, AnalysisError> {
        let source = frame.clone();
        let annotated = tokio::task::spawn_blocking(move || {
            overlay::render(source.image(), microplastic.as_ref(), plankton.as_ref())
        })
        .await
        .map_err(std::io::Error::other)?;
        self.images.save_annotated(frame, annotated).await
    }
}

fn collect(
    outcome: Result<DetectionResult, InferenceError>,
    warnings: &mut Vec<StageWarning>,
    causes: &mut Vec<InferenceError>,
) -> Option<DetectionResult> {
    match outcome {
        Ok(result) => Some(result),
        Err(err) => {
            warnings.push(StageWarning {
                stage: err.stage,
                message: err.to_string(),
            });
            causes.push(err);
            None
        }
    }
}

pub struct AnalysisPipelineBuilder {
    microplastic: Option<Arc<dyn InferenceStage>>,
    plankton: Option<Arc<dyn InferenceStage>>,
    stage_timeout: Option<Duration>,
    images: Option<ImageStore>,
    store: Option<ReportStore>,
    annotate: bool,
    roi_crops: usize,
}

impl AnalysisPipelineBuilder {
    pub fn new() -> Self {
        Self {
            microplastic: None,
            plankton: None,
            stage_timeout: Some(Duration::from_secs(10)),
            images: None,
            store: None,
            annotate: true,
            roi_crops: DEFAULT_ROI_CROPS,
        }
    }

    pub fn microplastic(mut self, stage: Arc<dyn InferenceStage>) -> Self {
        self.microplastic = Some(stage);
        self
    }

    pub fn plankton(mut self, stage: Arc<dyn InferenceStage>) -> Self {
        self.plankton = Some(stage);
        self
    }

    // Sets the per-stage timeout (a zero duration means none), this will override the default
    // configuration.
    pub fn stage_timeout(mut self, stage_timeout: Option<Duration>) -> Self {
        self.stage_timeout = stage_timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn images(mut self, images: ImageStore) -> Self {
        self.images = Some(images);
        self
    }

    pub fn store(mut self, store: ReportStore) -> Self {
        self.store = Some(store);
        self
    }

    // Enables overlay rendering, this will override the default configuration.
    pub fn annotate(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    // Sets how many plankton regions are cropped per report (0 disables), this will override
    // the default configuration.
    pub fn roi_crops(mut self, roi_crops: usize) -> Self {
        self.roi_crops = roi_crops;
        self
    }

    pub fn build(self) -> Result<AnalysisPipeline, AppError> {
        let microplastic = self
            .microplastic
            .ok_or(AppError::Pipeline("Microplastic stage not set".to_string()))?;
        let plankton = self
            .plankton
            .ok_or(AppError::Pipeline("Plankton stage not set".to_string()))?;
        let images = self
            .images
            .ok_or(AppError::Pipeline("Image store not set".to_string()))?;
        let store = self
            .store
            .ok_or(AppError::Pipeline("Report store not set".to_string()))?;

        for (stage, expected) in [(&microplastic, StageKind::Microplastic), (&plankton, StageKind::Plankton)] {
            if stage.kind() != expected {
                return Err(AppError::Pipeline(format!(
                    "{} stage registered in the {expected} slot",
                    stage.kind()
                )));
            }
        }

        Ok(AnalysisPipeline {
            microplastic: StageRunner::new(microplastic, self.stage_timeout),
            plankton: StageRunner::new(plankton, self.stage_timeout),
            images,
            store,
            annotate: self.annotate,
            roi_crops: self.roi_crops,
        })
    }
}

impl Default for AnalysisPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
