//! Deterministic stand-in for a microscope camera.
//!
//! Renders a bright-field slide: a vignetted background with a scatter of dark round
//! bodies that drift slowly from frame to frame. Used when no capture hardware is
//! attached and throughout the test suite.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{CameraKind, CaptureBackend, SourceSpec};
use crate::error::CameraError;

const BODY_COUNT: usize = 24;

pub struct SyntheticBackend {
    spec: Option<SourceSpec>,
    frame_index: u64,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            spec: None,
            frame_index: 0,
        }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_device(spec: &SourceSpec) -> Result<(), String> {
    match spec.kind {
        CameraKind::Usb | CameraKind::Csi => spec
            .device
            .parse::<u32>()
            .map(|_| ())
            .map_err(|_| format!("'{}' is not a device index", spec.device)),
        CameraKind::Ip => {
            if spec.device.starts_with("rtsp://") || spec.device.starts_with("http") {
                Ok(())
            } else {
                Err(format!("'{}' is not a stream URI", spec.device))
            }
        }
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn open(&mut self, spec: &SourceSpec) -> Result<(), CameraError> {
        check_device(spec).map_err(|reason| CameraError::unavailable(spec.device_key(), reason))?;
        self.spec = Some(spec.clone());
        self.frame_index = 0;
        Ok(())
    }

    async fn read(&mut self) -> Result<RgbImage, CameraError> {
        let spec = self
            .spec
            .clone()
            .ok_or_else(|| CameraError::unavailable("synthetic", "backend is not open"))?;
        let frame_index = self.frame_index;
        self.frame_index += 1;

        let device = spec.device_key();
        tokio::task::spawn_blocking(move || render_field(&spec, frame_index))
            .await
            .map_err(|err| CameraError::unavailable(device, format!("render task failed: {err}")))
    }

    async fn close(&mut self) {
        self.spec = None;
    }
}

fn render_field(spec: &SourceSpec, frame_index: u64) -> RgbImage {
    let (width, height) = (spec.width, spec.height);
    let brightness = spec.controls.brightness.unwrap_or(0.0).clamp(-1.0, 1.0);
    let base = 205.0 + 50.0 * brightness;

    let seed = spec
        .device_key()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| (acc ^ b as u64).wrapping_mul(0x100_0000_01b3));
    let mut rng = StdRng::seed_from_u64(seed);
    let bodies: Vec<(f32, f32, f32)> = (0..BODY_COUNT)
        .map(|_| {
            (
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
                rng.random_range(0.008..0.03),
            )
        })
        .collect();
    let drift = frame_index as f32 * 0.002;

    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let max_radius = (cx * cx + cy * cy).sqrt().max(1.0);
    let scale = width.min(height) as f32;

    RgbImage::from_fn(width, height, |x, y| {
        let (fx, fy) = (x as f32, y as f32);
        let r = ((fx - cx).powi(2) + (fy - cy).powi(2)).sqrt() / max_radius;
        let mut level = base * (1.0 - 0.35 * r * r);

        for (bx, by, radius) in &bodies {
            let px = ((bx + drift) % 1.0) * width as f32;
            let py = by * height as f32;
            let d = ((fx - px).powi(2) + (fy - py).powi(2)).sqrt() / (radius * scale);
            if d < 1.0 {
                level *= 0.45 + 0.55 * d;
            }
        }

        let v = level.clamp(0.0, 255.0);
        Rgb([(v * 0.92) as u8, v as u8, (v * 0.85) as u8])
    })
}
