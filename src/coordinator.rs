use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    common::{Frame, FrameOrigin},
    config::{Configuration, OperatorSettings},
    error::AppError,
    intake::session::{CameraSessionManager, CaptureSpec, SessionInfo, SessionState},
    intake::source::SourceSpec,
    pipeline::{domain::Report, domain::ReportMetadata, AnalysisPipeline},
    store::ReportStore,
};

/// Handle to a frame waiting for analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRef {
    pub frame_id: Uuid,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub origin: FrameOrigin,
}

impl FrameRef {
    fn of(frame: &Frame) -> Self {
        Self {
            frame_id: frame.id(),
            width: frame.width(),
            height: frame.height(),
            captured_at: frame.captured_at(),
            origin: frame.origin().clone(),
        }
    }
}

struct PendingFrame {
    frame: Frame,
    stored_at: Instant,
}

type PendingFrames = Arc<Mutex<HashMap<Uuid, PendingFrame>>>;

/// Glues the camera session, the analysis pipeline and the report store together.
///
/// Frames handed out as [`FrameRef`]s stay in a pending table until they are analyzed or
/// outlive the configured TTL.
pub struct Coordinator {
    sessions: Arc<CameraSessionManager>,
    pipeline: Arc<AnalysisPipeline>,
    operator: OperatorSettings,
    default_spec: CaptureSpec,
    pending: PendingFrames,
    sweeper_task: tokio::task::JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl Coordinator {
    fn new(
        configuration: CoordinatorConfiguration,
        sessions: Arc<CameraSessionManager>,
        pipeline: Arc<AnalysisPipeline>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let pending: PendingFrames = Arc::default();

        Self {
            sweeper_task: Self::start_sweeper_task(
                pending.clone(),
                configuration.pending_frame_ttl,
                configuration.sweep_interval,
                cancel_token.clone(),
            ),
            sessions,
            pipeline,
            operator: configuration.operator,
            default_spec: configuration.default_spec,
            pending,
            cancel_token,
        }
    }

    fn start_sweeper_task(
        pending: PendingFrames,
        ttl: Duration,
        sweep_interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut pending = pending.lock().await;
                        let before = pending.len();
                        pending.retain(|_, entry| entry.stored_at.elapsed() < ttl);
                        let expired = before - pending.len();
                        if expired > 0 {
                            tracing::info!(expired, remaining = pending.len(), "Discarded unanalyzed frames");
                        }
                    }
                }
            }
        })
    }

    pub fn reports(&self) -> &ReportStore {
        self.pipeline.store()
    }

    pub fn sessions(&self) -> &Arc<CameraSessionManager> {
        &self.sessions
    }

    pub async fn start_camera(&self, spec: &CaptureSpec) -> Result<SourceSpec, AppError> {
        Ok(self.sessions.start(spec).await?)
    }

    pub async fn stop_camera(&self) -> Result<(), AppError> {
        Ok(self.sessions.stop().await?)
    }

    pub async fn camera_info(&self) -> SessionInfo {
        self.sessions.info().await
    }

    /// Grabs a frame (from the running session, or a one-off capture with the default
    /// spec) and parks it for a later [`Coordinator::analyze`].
    pub async fn snapshot(&self) -> Result<FrameRef, AppError> {
        let frame = self.sessions.snapshot(&self.default_spec).await?;
        Ok(self.park(frame).await)
    }

    /// Decodes an uploaded image and parks it like a captured frame.
    pub async fn upload(&self, bytes: Vec<u8>, file_name: impl Into<String>) -> Result<FrameRef, AppError> {
        let file_name = file_name.into();
        let frame = tokio::task::spawn_blocking(move || Frame::from_upload(&bytes, file_name))
            .await
            .map_err(std::io::Error::other)??;
        Ok(self.park(frame).await)
    }

    /// Analyzes a parked frame. The frame leaves the pending table for the duration of the
    /// analysis, so a concurrent call for the same id gets `FrameNotFound`; it is put back if
    /// the analysis fails so the caller can retry.
    pub async fn analyze(&self, frame_id: Uuid, metadata: ReportMetadata) -> Result<Report, AppError> {
        let entry = self
            .pending
            .lock()
            .await
            .remove(&frame_id)
            .ok_or(AppError::FrameNotFound(frame_id))?;

        match self
            .pipeline
            .analyze(&entry.frame, &self.with_operator_defaults(metadata))
            .await
        {
            Ok(report) => Ok(report),
            Err(err) => {
                self.pending.lock().await.insert(frame_id, entry);
                Err(err.into())
            }
        }
    }

    /// Captures one frame and analyzes it immediately.
    pub async fn capture_and_analyze(&self, metadata: ReportMetadata) -> Result<Report, AppError> {
        let frame = if self.sessions.info().await.state == SessionState::Running {
            self.sessions.grab_frame().await?
        } else {
            self.sessions.snapshot(&self.default_spec).await?
        };
        Ok(self.pipeline.analyze(&frame, &self.with_operator_defaults(metadata)).await?)
    }

    pub async fn pending_frames(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn park(&self, frame: Frame) -> FrameRef {
        let frame_ref = FrameRef::of(&frame);
        self.pending.lock().await.insert(
            frame.id(),
            PendingFrame {
                frame,
                stored_at: Instant::now(),
            },
        );
        tracing::debug!(frame_id = %frame_ref.frame_id, "Frame parked for analysis");
        frame_ref
    }

    fn with_operator_defaults(&self, mut metadata: ReportMetadata) -> ReportMetadata {
        if metadata.location.trim().is_empty() {
            metadata.location = self.operator.lab_location.clone();
        }
        if metadata.user.trim().is_empty() {
            metadata.user = self.operator.user_name.clone();
        }
        metadata
    }

    /// Stops the camera session and the background sweeper.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.stop();
        self.stop_camera().await
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
        self.sweeper_task.abort();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CoordinatorConfiguration {
    operator: OperatorSettings,
    default_spec: CaptureSpec,
    pending_frame_ttl: Duration,
    sweep_interval: Duration,
}

pub struct CoordinatorBuilder {
    configuration: CoordinatorConfiguration,
    sessions: Option<Arc<CameraSessionManager>>,
    pipeline: Option<Arc<AnalysisPipeline>>,
}

impl CoordinatorBuilder {
    pub fn new(configuration: &Configuration) -> Self {
        Self {
            configuration: CoordinatorConfiguration {
                operator: configuration.operator.clone(),
                default_spec: configuration.camera.default_spec.clone(),
                pending_frame_ttl: configuration.coordinator.pending_frame_ttl(),
                sweep_interval: configuration.coordinator.sweep_interval(),
            },
            sessions: None,
            pipeline: None,
        }
    }

    // Sets the pending-frame TTL, this will override the default configuration.
    pub fn pending_frame_ttl(mut self, pending_frame_ttl: Duration) -> Self {
        self.configuration.pending_frame_ttl = pending_frame_ttl;
        self
    }

    // Adjusts how often expired frames are swept, this will override the default configuration.
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.configuration.sweep_interval = sweep_interval;
        self
    }

    // Sets the operator defaults, this will override the default configuration.
    pub fn operator(mut self, operator: OperatorSettings) -> Self {
        self.configuration.operator = operator;
        self
    }

    // Sets the capture spec used for one-off snapshots, this will override the default configuration.
    pub fn default_spec(mut self, default_spec: CaptureSpec) -> Self {
        self.configuration.default_spec = default_spec;
        self
    }

    pub fn sessions(mut self, sessions: Arc<CameraSessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<AnalysisPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn build(self) -> Result<Coordinator, AppError> {
        let sessions = self
            .sessions
            .ok_or(AppError::Pipeline("Camera session manager not set".to_string()))?;
        let pipeline = self
            .pipeline
            .ok_or(AppError::Pipeline("Analysis pipeline not set".to_string()))?;
        if self.configuration.sweep_interval.is_zero() {
            return Err(AppError::Pipeline("Sweep interval must be positive".to_string()));
        }
        Ok(Coordinator::new(self.configuration, sessions, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AnalysisError, SessionError};
    use crate::intake::source::CameraKind;
    use crate::pipeline::stage::{MicroplasticDetector, PlanktonClassifier};
    use crate::pipeline::ImageStore;
    use crate::store::ReportFilter;
    use crate::testing::{Script, ScriptedFactory};
    use assert_matches::assert_matches;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct Bench {
        _dir: tempfile::TempDir,
        coordinator: Coordinator,
    }

    async fn bench(configure: impl FnOnce(CoordinatorBuilder) -> CoordinatorBuilder) -> Bench {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::open(&dir.path().join("reports.db")).await.unwrap();
        let pipeline = AnalysisPipeline::builder()
            .microplastic(Arc::new(MicroplasticDetector::new()))
            .plankton(Arc::new(PlanktonClassifier::new()))
            .images(ImageStore::new(dir.path().join("captures")))
            .store(store)
            .build()
            .expect("Failed to build pipeline");
        let sessions = Arc::new(CameraSessionManager::new(Arc::new(ScriptedFactory::new(
            Script::default(),
        ))));

        let coordinator = configure(
            CoordinatorBuilder::new(&Configuration::default())
                .sessions(sessions)
                .pipeline(Arc::new(pipeline)),
        )
        .build()
        .expect("Failed to build coordinator");
        Bench { _dir: dir, coordinator }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([40, 90, 200]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[tokio::test]
    async fn test_capture_analyze_and_restart() {
        let bench = bench(|builder| builder).await;
        let coordinator = &bench.coordinator;

        let spec = CaptureSpec {
            camera_id: 0,
            camera_type: CameraKind::Usb,
            width: 1280,
            height: 720,
            fps: 30,
            ..Default::default()
        };
        coordinator.start_camera(&spec).await.unwrap();
        assert_eq!(coordinator.camera_info().await.state, SessionState::Running);

        let frame = coordinator.snapshot().await.unwrap();
        assert_eq!((frame.width, frame.height), (1280, 720));

        let report = coordinator
            .analyze(frame.frame_id, ReportMetadata::new("S1"))
            .await
            .unwrap();
        assert_eq!(report.id, 1);
        assert_eq!(report.slide_name, "S1");
        assert_eq!(coordinator.reports().get(1).await.unwrap(), report);

        coordinator.stop_camera().await.unwrap();
        assert_eq!(coordinator.camera_info().await.state, SessionState::Idle);
        coordinator.start_camera(&spec).await.unwrap();
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn blank_metadata_falls_back_to_operator_defaults() {
        let bench = bench(|builder| {
            builder.operator(OperatorSettings {
                user_name: "Dr. Okafor".to_string(),
                lab_location: "Pier 4".to_string(),
            })
        })
        .await;

        let frame = bench.coordinator.upload(png_bytes(64, 48), "slide.png").await.unwrap();
        assert_eq!(
            frame.origin,
            FrameOrigin::Upload {
                file_name: "slide.png".to_string()
            }
        );

        let report = bench
            .coordinator
            .analyze(frame.frame_id, ReportMetadata::new("S7").user("  "))
            .await
            .unwrap();
        assert_eq!(report.location, "Pier 4");
        assert_eq!(report.user, "Dr. Okafor");
        assert_eq!(bench.coordinator.pending_frames().await, 0);
    }

    #[tokio::test]
    async fn analyzed_frame_cannot_be_reused() {
        let bench = bench(|builder| builder).await;
        let frame = bench.coordinator.snapshot().await.unwrap();
        bench
            .coordinator
            .analyze(frame.frame_id, ReportMetadata::new("once"))
            .await
            .unwrap();

        let err = bench
            .coordinator
            .analyze(frame.frame_id, ReportMetadata::new("twice"))
            .await
            .unwrap_err();
        assert_matches!(err, AppError::FrameNotFound(id) if id == frame.frame_id);
    }

    #[tokio::test]
    async fn invalid_metadata_keeps_the_frame_parked() {
        let bench = bench(|builder| builder).await;
        let frame = bench.coordinator.snapshot().await.unwrap();

        let err = bench
            .coordinator
            .analyze(frame.frame_id, ReportMetadata::new(""))
            .await
            .unwrap_err();
        assert_matches!(err, AppError::Analysis(AnalysisError::InvalidMetadata(_)));
        assert_eq!(bench.coordinator.pending_frames().await, 1);
    }

    #[tokio::test]
    async fn undecodable_upload_is_rejected() {
        let bench = bench(|builder| builder).await;
        let err = bench
            .coordinator
            .upload(b"not an image".to_vec(), "junk.bin")
            .await
            .unwrap_err();
        assert_matches!(err, AppError::Decode(_));
        assert_eq!(bench.coordinator.pending_frames().await, 0);
    }

    #[tokio::test]
    async fn concurrent_analyze_of_one_frame_stores_one_report() {
        let bench = bench(|builder| builder).await;
        let frame = bench.coordinator.snapshot().await.unwrap();

        let (first, second) = tokio::join!(
            bench.coordinator.analyze(frame.frame_id, ReportMetadata::new("first")),
            bench.coordinator.analyze(frame.frame_id, ReportMetadata::new("second")),
        );
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_matches!(second, Err(AppError::FrameNotFound(id)) if id == frame.frame_id);
        assert_eq!(
            bench.coordinator.reports().count(&ReportFilter::default()).await.unwrap(),
            1
        );
        assert_eq!(bench.coordinator.pending_frames().await, 0);
    }

    #[tokio::test]
    async fn failed_analysis_can_be_retried() {
        let bench = bench(|builder| builder).await;
        let frame = bench.coordinator.snapshot().await.unwrap();

        assert!(bench
            .coordinator
            .analyze(frame.frame_id, ReportMetadata::new(" "))
            .await
            .is_err());
        let report = bench
            .coordinator
            .analyze(frame.frame_id, ReportMetadata::new("retry"))
            .await
            .unwrap();
        assert_eq!(report.slide_name, "retry");
    }

    #[tokio::test]
    async fn expired_frames_are_swept() {
        let bench = bench(|builder| {
            builder
                .pending_frame_ttl(Duration::from_secs(30))
                .sweep_interval(Duration::from_secs(5))
        })
        .await;

        let frame = bench.coordinator.upload(png_bytes(8, 8), "tiny.png").await.unwrap();
        // The database is not touched past this point, so virtual time is safe.
        tokio::time::pause();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(bench.coordinator.pending_frames().await, 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(bench.coordinator.pending_frames().await, 0);
        assert_matches!(
            bench.coordinator.analyze(frame.frame_id, ReportMetadata::new("late")).await,
            Err(AppError::FrameNotFound(_))
        );
    }

    #[tokio::test]
    async fn capture_and_analyze_uses_the_running_session() {
        let bench = bench(|builder| builder).await;
        bench
            .coordinator
            .start_camera(&CaptureSpec {
                width: 640,
                height: 480,
                ..Default::default()
            })
            .await
            .unwrap();

        let report = bench
            .coordinator
            .capture_and_analyze(ReportMetadata::new("live"))
            .await
            .unwrap();
        assert_eq!(bench.coordinator.camera_info().await.frames_grabbed, 1);
        assert_eq!(
            bench.coordinator.reports().count(&ReportFilter::default()).await.unwrap(),
            1
        );
        assert_eq!(report.location, "Lab Station 1");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let bench = bench(|builder| builder).await;
        bench.coordinator.start_camera(&CaptureSpec::default()).await.unwrap();
        assert_matches!(
            bench.coordinator.start_camera(&CaptureSpec::default()).await,
            Err(AppError::Session(SessionError::SessionAlreadyActive))
        );
    }

    #[test]
    fn builder_requires_components() {
        let result = CoordinatorBuilder::new(&Configuration::default()).build();
        assert!(matches!(result, Err(AppError::Pipeline(_))));
    }
}
