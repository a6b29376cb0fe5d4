//! Fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::Utc;
use image::{Rgb, RgbImage};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Frame, FrameOrigin};
use crate::error::{CameraError, InferenceError};
use crate::intake::source::{Camera, CaptureBackend, DeviceRegistry, FrameSource, SourceFactory, SourceSpec};
use crate::pipeline::domain::{
    BoundingBox, DetectionResult, MicroplasticResult, Particle, ParticleClass, PlanktonDetection,
    PlanktonResult, StageKind,
};
use crate::pipeline::stage::{InferenceStage, ModelInfo};

/// Deterministic gradient frame; equal sizes give equal pixels.
pub(crate) fn sample_frame(width: u32, height: u32) -> Frame {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    });
    Frame::new(
        FrameOrigin::Camera {
            device: "usb:0".to_string(),
        },
        image,
        Utc::now(),
    )
}

pub(crate) fn microplastic_result(count: u32) -> MicroplasticResult {
    MicroplasticResult {
        present: count > 0,
        count,
        confidence: if count > 0 { 0.82 } else { 0.21 },
        particles: (0..count)
            .map(|i| Particle {
                class: ParticleClass::ALL[i as usize % ParticleClass::ALL.len()],
                bbox: BoundingBox::new(0.1, 0.1 * i as f64 % 0.8, 0.2, 0.1 * i as f64 % 0.8 + 0.1)
                    .unwrap_or(BoundingBox::from_pixels(0, 0, 1, 1, 10, 10)),
                confidence: 0.75,
            })
            .collect(),
    }
}

pub(crate) fn plankton_result() -> PlanktonResult {
    let detection = |species: &str, confidence: f64| PlanktonDetection {
        species: species.to_string(),
        roi_bbox: BoundingBox::from_pixels(10, 10, 40, 40, 100, 100),
        confidence,
    };
    PlanktonResult {
        species_summary: IndexMap::from([("Diatoms".to_string(), 2), ("Copepods".to_string(), 1)]),
        detailed: vec![
            detection("Diatoms", 0.91),
            detection("Diatoms", 0.88),
            detection("Copepods", 0.7),
        ],
    }
}

#[derive(Default)]
struct ScriptState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads_started: AtomicUsize,
    failing_opens: AtomicUsize,
    failing_reads: AtomicUsize,
    hang_reads: AtomicBool,
    open_delay_ms: AtomicU64,
}

/// Shared control panel for [`ScriptedBackend`]s: queue failures, make reads hang, and
/// count calls.
#[derive(Clone, Default)]
pub(crate) struct Script {
    state: Arc<ScriptState>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Script {
    pub(crate) fn fail_opens(&self, n: usize) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_reads(&self, n: usize) {
        self.state.failing_reads.store(n, Ordering::SeqCst);
    }

    pub(crate) fn hang_reads(&self, hang: bool) {
        self.state.hang_reads.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn open_delay(&self, delay: Duration) {
        self.state.open_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn reads_started(&self) -> usize {
        self.state.reads_started.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
    spec: Option<SourceSpec>,
}

impl ScriptedBackend {
    pub(crate) fn new(script: Script) -> Self {
        Self { script, spec: None }
    }
}

#[async_trait]
impl CaptureBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&mut self, spec: &SourceSpec) -> Result<(), CameraError> {
        let state = &self.script.state;
        state.opens.fetch_add(1, Ordering::SeqCst);
        let delay = state.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_one(&state.failing_opens) {
            return Err(CameraError::unavailable(spec.device_key(), "scripted open failure"));
        }
        self.spec = Some(spec.clone());
        Ok(())
    }

    async fn read(&mut self) -> Result<RgbImage, CameraError> {
        let state = &self.script.state;
        state.reads_started.fetch_add(1, Ordering::SeqCst);
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| CameraError::unavailable("scripted", "not open"))?;
        if state.hang_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take_one(&state.failing_reads) {
            return Err(CameraError::StreamEnded {
                device: spec.device_key(),
            });
        }
        Ok(RgbImage::from_pixel(spec.width, spec.height, Rgb([90, 160, 90])))
    }

    async fn close(&mut self) {
        self.script.state.closes.fetch_add(1, Ordering::SeqCst);
        self.spec = None;
    }
}

/// Builds [`Camera`]s over scripted backends sharing one registry.
pub(crate) struct ScriptedFactory {
    script: Script,
    registry: DeviceRegistry,
}

impl ScriptedFactory {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            registry: DeviceRegistry::new(),
        }
    }
}

impl SourceFactory for ScriptedFactory {
    fn create(&self, spec: SourceSpec) -> Box<dyn FrameSource> {
        Box::new(
            Camera::new(
                spec,
                Box::new(ScriptedBackend::new(self.script.clone())),
                self.registry.clone(),
            )
            .read_timeout(Duration::from_millis(100)),
        )
    }
}

fn fake_info(kind: StageKind) -> ModelInfo {
    ModelInfo {
        name: format!("fake {kind}"),
        version: "0".to_string(),
        classes: Vec::new(),
        input_size: (1, 1),
        confidence_threshold: 0.5,
        segmentation: false,
        roi_extraction: false,
    }
}

/// Always returns the same result, optionally claiming a different stage kind.
pub(crate) struct FixedStage {
    kind: StageKind,
    result: DetectionResult,
}

impl FixedStage {
    pub(crate) fn new(result: DetectionResult) -> Self {
        Self {
            kind: result.kind(),
            result,
        }
    }

    pub(crate) fn microplastic(count: u32) -> Self {
        Self::new(DetectionResult::Microplastic(microplastic_result(count)))
    }

    pub(crate) fn plankton() -> Self {
        Self::new(DetectionResult::Plankton(plankton_result()))
    }

    pub(crate) fn plankton_as_microplastic() -> Self {
        Self {
            kind: StageKind::Microplastic,
            result: DetectionResult::Plankton(plankton_result()),
        }
    }

    pub(crate) fn inconsistent_microplastic() -> Self {
        let mut result = microplastic_result(2);
        result.count = 5;
        Self::new(DetectionResult::Microplastic(result))
    }
}

#[async_trait]
impl InferenceStage for FixedStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn model_info(&self) -> ModelInfo {
        fake_info(self.kind)
    }

    async fn infer(&self, _frame: &Frame) -> Result<DetectionResult, InferenceError> {
        Ok(self.result.clone())
    }
}

pub(crate) struct FailingStage {
    kind: StageKind,
    message: String,
}

impl FailingStage {
    pub(crate) fn new(kind: StageKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl InferenceStage for FailingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn model_info(&self) -> ModelInfo {
        fake_info(self.kind)
    }

    async fn infer(&self, _frame: &Frame) -> Result<DetectionResult, InferenceError> {
        Err(InferenceError::model(self.kind, self.message.clone()))
    }
}

pub(crate) struct HangingStage {
    kind: StageKind,
}

impl HangingStage {
    pub(crate) fn new(kind: StageKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl InferenceStage for HangingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn model_info(&self) -> ModelInfo {
        fake_info(self.kind)
    }

    async fn infer(&self, _frame: &Frame) -> Result<DetectionResult, InferenceError> {
        std::future::pending().await
    }
}

pub(crate) struct PanickingStage {
    kind: StageKind,
}

impl PanickingStage {
    pub(crate) fn new(kind: StageKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl InferenceStage for PanickingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn model_info(&self) -> ModelInfo {
        fake_info(self.kind)
    }

    async fn infer(&self, _frame: &Frame) -> Result<DetectionResult, InferenceError> {
        panic!("model weights corrupted")
    }
}
