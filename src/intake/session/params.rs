use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::intake::source::{CameraKind, ImageControls, SourceSpec};

/// Camera parameters as requested by a caller, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSpec {
    pub camera_id: u32,
    pub camera_type: CameraKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Stream URI, required for `ip` cameras.
    pub uri: Option<String>,
    pub controls: ImageControls,
}

impl Default for CaptureSpec {
    fn default() -> Self {
        Self {
            camera_id: 0,
            camera_type: CameraKind::Usb,
            width: 1280,
            height: 720,
            fps: 30,
            uri: None,
            controls: ImageControls::default(),
        }
    }
}

/// Ranges supported by the attached hardware.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HardwareLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub brightness: (f32, f32),
    pub exposure_us: (u32, u32),
    pub white_balance_k: (u32, u32),
}

impl Default for HardwareLimits {
    fn default() -> Self {
        Self {
            max_width: 3840,
            max_height: 2160,
            min_fps: 1,
            max_fps: 60,
            brightness: (-1.0, 1.0),
            exposure_us: (100, 1_000_000),
            white_balance_k: (2_000, 10_000),
        }
    }
}

impl HardwareLimits {
    /// Rejects out-of-range geometry and clamps the image controls.
    pub fn validate(&self, spec: &CaptureSpec) -> Result<SourceSpec, SessionError> {
        if spec.width == 0 || spec.height == 0 {
            return Err(SessionError::InvalidParameters(format!(
                "resolution {}x{} must be positive",
                spec.width, spec.height
            )));
        }
        if spec.width > self.max_width || spec.height > self.max_height {
            return Err(SessionError::InvalidParameters(format!(
                "resolution {}x{} exceeds the hardware maximum {}x{}",
                spec.width, spec.height, self.max_width, self.max_height
            )));
        }
        if spec.fps < self.min_fps || spec.fps > self.max_fps {
            return Err(SessionError::InvalidParameters(format!(
                "fps {} outside [{}, {}]",
                spec.fps, self.min_fps, self.max_fps
            )));
        }

        let device = match spec.camera_type {
            CameraKind::Usb | CameraKind::Csi => spec.camera_id.to_string(),
            CameraKind::Ip => match spec.uri.as_deref().map(str::trim) {
                Some(uri) if !uri.is_empty() => uri.to_string(),
                _ => {
                    return Err(SessionError::InvalidParameters(
                        "ip cameras require a stream uri".to_string(),
                    ))
                }
            },
        };

        Ok(SourceSpec {
            kind: spec.camera_type,
            device,
            width: spec.width,
            height: spec.height,
            fps: spec.fps,
            controls: self.clamp_controls(&spec.controls),
        })
    }

    fn clamp_controls(&self, controls: &ImageControls) -> ImageControls {
        let (b_min, b_max) = self.brightness;
        let (e_min, e_max) = self.exposure_us;
        let (w_min, w_max) = self.white_balance_k;
        ImageControls {
            brightness: controls
                .brightness
                .filter(|b| b.is_finite())
                .map(|b| b.clamp(b_min, b_max)),
            exposure_us: controls.exposure_us.map(|e| e.clamp(e_min, e_max)),
            white_balance_k: controls.white_balance_k.map(|w| w.clamp(w_min, w_max)),
        }
    }
}
