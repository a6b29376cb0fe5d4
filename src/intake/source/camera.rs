use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use super::registry::{DeviceLease, DeviceRegistry};
use super::retry::RetryPolicy;
use super::{CameraKind, CaptureBackend, FrameSource, SourceSpec};
use crate::common::{Frame, FrameOrigin};
use crate::error::CameraError;

/// A [`FrameSource`] over any [`CaptureBackend`].
///
/// Holds the device lease for as long as it is open. Reads are bounded by `read_timeout`;
/// `open` on an IP source retries `DeviceUnavailable` with the configured backoff, while a
/// claim conflict fails straight away.
pub struct Camera {
    spec: SourceSpec,
    backend: Box<dyn CaptureBackend>,
    registry: DeviceRegistry,
    lease: Option<DeviceLease>,
    read_timeout: Duration,
    retry: RetryPolicy,
}

impl Camera {
    pub fn new(spec: SourceSpec, backend: Box<dyn CaptureBackend>, registry: DeviceRegistry) -> Self {
        Self {
            spec,
            backend,
            registry,
            lease: None,
            read_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn open_backend(&mut self, device: &str) -> Result<(), CameraError> {
        let delays = match self.spec.kind {
            CameraKind::Ip => self.retry.schedule(),
            CameraKind::Usb | CameraKind::Csi => Vec::new(),
        };

        let mut attempt = 0;
        loop {
            match self.backend.open(&self.spec).await {
                Ok(()) => return Ok(()),
                Err(err @ CameraError::DeviceUnavailable { .. }) if attempt < delays.len() => {
                    let delay = delays[attempt];
                    attempt += 1;
                    tracing::warn!(
                        device = %device,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Open failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl FrameSource for Camera {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    async fn open(&mut self) -> Result<(), CameraError> {
        if self.lease.is_some() {
            return Ok(());
        }

        let device = self.spec.device_key();
        let lease = self
            .registry
            .try_claim(&device)
            .await
            .ok_or_else(|| CameraError::unavailable(&device, "device is claimed by another source"))?;

        // The lease is dropped with this frame if the backend never comes up.
        self.open_backend(&device).await?;
        self.lease = Some(lease);

        tracing::info!(
            device = %device,
            backend = self.backend.name(),
            width = self.spec.width,
            height = self.spec.height,
            fps = self.spec.fps,
            "Camera opened"
        );
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CameraError> {
        let device = self.spec.device_key();
        if self.lease.is_none() {
            return Err(CameraError::unavailable(device, "source is not open"));
        }

        match tokio::time::timeout(self.read_timeout, self.backend.read()).await {
            Ok(Ok(image)) => Ok(Frame::new(FrameOrigin::Camera { device }, image, Utc::now())),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CameraError::ReadTimeout {
                device,
                timeout: self.read_timeout,
            }),
        }
    }

    async fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.backend.close().await;
            tracing::info!(device = %lease.device(), "Camera closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::source::ImageControls;
    use crate::testing::{Script, ScriptedBackend};
    use assert_matches::assert_matches;

    fn spec(kind: CameraKind, device: &str) -> SourceSpec {
        SourceSpec {
            kind,
            device: device.to_string(),
            width: 32,
            height: 24,
            fps: 30,
            controls: ImageControls::default(),
        }
    }

    fn camera(kind: CameraKind, device: &str, script: &Script, registry: &DeviceRegistry) -> Camera {
        Camera::new(
            spec(kind, device),
            Box::new(ScriptedBackend::new(script.clone())),
            registry.clone(),
        )
        .read_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn read_returns_frame_tagged_with_device() {
        let script = Script::default();
        let registry = DeviceRegistry::new();
        let mut cam = camera(CameraKind::Usb, "0", &script, &registry);

        cam.open().await.unwrap();
        let frame = cam.read().await.unwrap();

        assert_eq!((frame.width(), frame.height()), (32, 24));
        assert_eq!(
            frame.origin(),
            &FrameOrigin::Camera {
                device: "usb:0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn read_before_open_is_rejected() {
        let mut cam = camera(CameraKind::Usb, "0", &Script::default(), &DeviceRegistry::new());
        assert_matches!(cam.read().await, Err(CameraError::DeviceUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_read_times_out() {
        let script = Script::default();
        script.hang_reads(true);
        let mut cam = camera(CameraKind::Usb, "0", &script, &DeviceRegistry::new());
        cam.open().await.unwrap();

        let result = cam.read().await;
        assert_matches!(
            result,
            Err(CameraError::ReadTimeout { timeout, .. }) if timeout == Duration::from_millis(50)
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_claim() {
        let script = Script::default();
        let registry = DeviceRegistry::new();
        let mut cam = camera(CameraKind::Csi, "1", &script, &registry);

        cam.open().await.unwrap();
        assert!(registry.is_claimed("csi:1").await);
        cam.close().await;
        cam.close().await;

        assert!(!cam.is_open());
        assert!(!registry.is_claimed("csi:1").await);
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn failed_open_does_not_keep_the_claim() {
        let script = Script::default();
        script.fail_opens(1);
        let registry = DeviceRegistry::new();
        let mut cam = camera(CameraKind::Usb, "0", &script, &registry);

        assert_matches!(cam.open().await, Err(CameraError::DeviceUnavailable { .. }));
        assert!(!registry.is_claimed("usb:0").await);
        assert_eq!(script.opens(), 1);
    }

    #[tokio::test]
    async fn snapshot_closes_what_it_opened() {
        let script = Script::default();
        let registry = DeviceRegistry::new();
        let mut cam = camera(CameraKind::Usb, "0", &script, &registry);

        let frame = cam.snapshot().await.unwrap();
        assert_eq!(frame.width(), 32);
        assert!(!cam.is_open());
        assert!(!registry.is_claimed("usb:0").await);

        cam.open().await.unwrap();
        cam.snapshot().await.unwrap();
        assert!(cam.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn ip_open_retries_with_backoff() {
        let script = Script::default();
        script.fail_opens(2);
        let mut cam = camera(CameraKind::Ip, "rtsp://scope.local/live", &script, &DeviceRegistry::new());

        let started = tokio::time::Instant::now();
        cam.open().await.unwrap();

        assert_eq!(script.opens(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500) && elapsed < Duration::from_millis(1_600));
    }

    #[tokio::test(start_paused = true)]
    async fn ip_open_gives_up_after_three_retries() {
        let script = Script::default();
        script.fail_opens(10);
        let registry = DeviceRegistry::new();
        let mut cam = camera(CameraKind::Ip, "rtsp://scope.local/live", &script, &registry);

        let started = tokio::time::Instant::now();
        assert_matches!(cam.open().await, Err(CameraError::DeviceUnavailable { .. }));

        assert_eq!(script.opens(), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3_500) && elapsed < Duration::from_millis(3_600));
        assert!(!registry.is_claimed("ip:rtsp://scope.local/live").await);
    }

    #[tokio::test]
    async fn usb_open_is_not_retried() {
        let script = Script::default();
        script.fail_opens(1);
        let mut cam = camera(CameraKind::Usb, "0", &script, &DeviceRegistry::new());

        assert!(cam.open().await.is_err());
        assert_eq!(script.opens(), 1);
    }

    #[tokio::test]
    async fn claim_conflict_is_not_retried() {
        let registry = DeviceRegistry::new();
        let _held = registry.try_claim("ip:rtsp://scope.local/live").await.unwrap();
        let script = Script::default();
        let mut cam = camera(CameraKind::Ip, "rtsp://scope.local/live", &script, &registry);

        assert_matches!(cam.open().await, Err(CameraError::DeviceUnavailable { .. }));
        assert_eq!(script.opens(), 0);
    }
}
