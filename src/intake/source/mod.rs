pub mod camera;
#[cfg(feature = "backend-gstreamer")]
pub mod gstreamer;
pub mod registry;
pub mod retry;
#[cfg(feature = "backend-synthetic")]
pub mod synthetic;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::common::Frame;
use crate::config::CameraSettings;
use crate::error::CameraError;

pub use camera::Camera;
pub use registry::{DeviceLease, DeviceRegistry};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    #[default]
    Usb,
    Csi,
    Ip,
}

impl fmt::Display for CameraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraKind::Usb => write!(f, "usb"),
            CameraKind::Csi => write!(f, "csi"),
            CameraKind::Ip => write!(f, "ip"),
        }
    }
}

/// Optional sensor controls. `None` leaves the device default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageControls {
    /// Offset in `[-1, 1]` applied to the sensor's neutral brightness.
    pub brightness: Option<f32>,
    pub exposure_us: Option<u32>,
    pub white_balance_k: Option<u32>,
}

/// Validated description of one capture device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSpec {
    pub kind: CameraKind,
    /// Device index for usb/csi, stream URI for ip.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub controls: ImageControls,
}

impl SourceSpec {
    /// Key under which the device is claimed in the [`DeviceRegistry`].
    pub fn device_key(&self) -> String {
        format!("{}:{}", self.kind, self.device)
    }
}

/// Uniform streaming contract over every camera kind.
#[async_trait]
pub trait FrameSource: Send {
    fn spec(&self) -> &SourceSpec;

    fn is_open(&self) -> bool;

    /// Claims the device exclusively. Opening an already open source is a no-op.
    async fn open(&mut self) -> Result<(), CameraError>;

    /// Next frame, bounded by the source's read timeout.
    async fn read(&mut self) -> Result<Frame, CameraError>;

    /// Releases the device. Idempotent.
    async fn close(&mut self);

    /// Single frame, closing the source again if this call had to open it.
    async fn snapshot(&mut self) -> Result<Frame, CameraError> {
        let opened_here = !self.is_open();
        if opened_here {
            self.open().await?;
        }
        let result = self.read().await;
        if opened_here {
            self.close().await;
        }
        result
    }
}

/// Device-level driver behind a [`Camera`]. Implementations only talk to the hardware;
/// claiming, timeouts and retries are handled by the camera wrapping them.
#[async_trait]
pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    async fn open(&mut self, spec: &SourceSpec) -> Result<(), CameraError>;

    async fn read(&mut self) -> Result<RgbImage, CameraError>;

    async fn close(&mut self);
}

/// Builds frame sources for validated specs. The session manager only sees this seam.
pub trait SourceFactory: Send + Sync {
    fn create(&self, spec: SourceSpec) -> Box<dyn FrameSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Synthetic,
    Gstreamer,
}

impl Default for BackendKind {
    #[cfg(feature = "backend-gstreamer")]
    fn default() -> Self {
        BackendKind::Gstreamer
    }

    #[cfg(not(feature = "backend-gstreamer"))]
    fn default() -> Self {
        BackendKind::Synthetic
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Synthetic => write!(f, "synthetic"),
            BackendKind::Gstreamer => write!(f, "gstreamer"),
        }
    }
}

impl BackendKind {
    pub fn instantiate(self) -> Box<dyn CaptureBackend> {
        match self {
            #[cfg(feature = "backend-synthetic")]
            BackendKind::Synthetic => Box::new(synthetic::SyntheticBackend::new()),
            #[cfg(feature = "backend-gstreamer")]
            BackendKind::Gstreamer => Box::new(gstreamer::GStreamerBackend::new()),
            #[allow(unreachable_patterns)]
            other => Box::new(UnavailableBackend { backend: other }),
        }
    }
}

/// Stand-in for a backend that was not compiled into this build.
struct UnavailableBackend {
    backend: BackendKind,
}

#[async_trait]
impl CaptureBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn open(&mut self, spec: &SourceSpec) -> Result<(), CameraError> {
        Err(CameraError::unavailable(
            spec.device_key(),
            format!("the {} backend is not compiled into this build", self.backend),
        ))
    }

    async fn read(&mut self) -> Result<RgbImage, CameraError> {
        Err(CameraError::unavailable(
            self.backend.to_string(),
            "backend is not compiled into this build",
        ))
    }

    async fn close(&mut self) {}
}

/// Creates [`Camera`]s over the configured backend, all sharing one device registry.
#[derive(Clone)]
pub struct DefaultSourceFactory {
    registry: DeviceRegistry,
    backend: BackendKind,
    read_timeout: Duration,
    retry: RetryPolicy,
}

impl DefaultSourceFactory {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            backend,
            read_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(settings: &CameraSettings) -> Self {
        Self::new(settings.backend)
            .read_timeout(settings.read_timeout())
            .retry(settings.ip_retry.clone())
    }

    pub fn registry(mut self, registry: DeviceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn create(&self, spec: SourceSpec) -> Box<dyn FrameSource> {
        tracing::debug!(device = %spec.device_key(), backend = %self.backend, "Creating frame source");
        Box::new(
            Camera::new(spec, self.backend.instantiate(), self.registry.clone())
                .read_timeout(self.read_timeout)
                .retry(self.retry.clone()),
        )
    }
}
