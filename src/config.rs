use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::intake::session::{CaptureSpec, HardwareLimits};
use crate::intake::source::{BackendKind, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "microbe.toml";
pub const ENV_PREFIX: &str = "MICROBE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub storage: StorageSettings,
    pub camera: CameraSettings,
    pub inference: InferenceSettings,
    pub operator: OperatorSettings,
    pub logging: LoggingSettings,
    pub coordinator: CoordinatorSettings,
}

impl Configuration {
    /// Layers built-in defaults, the config file and `MICROBE__*` environment variables.
    ///
    /// An explicit `path` must exist; the default `microbe.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
    pub capture_dir: PathBuf,
    /// Also write an overlay image with the detections drawn on it.
    pub annotate: bool,
    /// Plankton regions cropped into their own images per report; 0 disables.
    pub roi_crops: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/reports.db"),
            capture_dir: PathBuf::from("data/captures"),
            annotate: true,
            roi_crops: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub backend: BackendKind,
    pub default_spec: CaptureSpec,
    pub limits: HardwareLimits,
    pub read_timeout_ms: u64,
    /// Consecutive read failures before a running session is torn down.
    pub failure_threshold: u32,
    pub ip_retry: RetryPolicy,
}

impl CameraSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            default_spec: CaptureSpec::default(),
            limits: HardwareLimits::default(),
            read_timeout_ms: 2_000,
            failure_threshold: 3,
            ip_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Per-stage deadline; 0 turns the deadline off.
    pub stage_timeout_ms: u64,
}

impl InferenceSettings {
    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_ms > 0).then(|| Duration::from_millis(self.stage_timeout_ms))
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 10_000,
        }
    }
}

/// Defaults applied to reports whose metadata leaves these blank.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperatorSettings {
    pub user_name: String,
    pub lab_location: String,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            user_name: "Researcher".to_string(),
            lab_location: "Lab Station 1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub pending_frame_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl CoordinatorSettings {
    pub fn pending_frame_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_frame_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            pending_frame_ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::source::CameraKind;
    use std::io::Write;

    #[test]
    fn defaults_match_the_bench_setup() {
        let configuration = Configuration::default();
        assert_eq!(configuration.camera.default_spec.camera_type, CameraKind::Usb);
        assert_eq!(configuration.camera.default_spec.width, 1280);
        assert_eq!(configuration.camera.default_spec.height, 720);
        assert_eq!(configuration.camera.default_spec.fps, 30);
        assert_eq!(configuration.camera.read_timeout(), Duration::from_secs(2));
        assert_eq!(configuration.camera.failure_threshold, 3);
        assert_eq!(configuration.inference.stage_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(configuration.operator.lab_location, "Lab Station 1");
    }

    #[test]
    fn file_values_override_defaults_section_by_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("microbe.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[camera]
read_timeout_ms = 500

[camera.default_spec]
camera_id = 2
camera_type = "csi"
width = 1920
height = 1080
fps = 15

[operator]
user_name = "Dr. Okafor"
"#
        )
        .unwrap();

        let configuration = Configuration::load(Some(&path)).unwrap();
        assert_eq!(configuration.camera.read_timeout(), Duration::from_millis(500));
        assert_eq!(configuration.camera.default_spec.camera_type, CameraKind::Csi);
        assert_eq!(configuration.camera.default_spec.width, 1920);
        assert_eq!(configuration.camera.failure_threshold, 3);
        assert_eq!(configuration.operator.user_name, "Dr. Okafor");
        assert_eq!(configuration.operator.lab_location, "Lab Station 1");
        assert_eq!(configuration.storage.capture_dir, PathBuf::from("data/captures"));
    }

    #[test]
    fn zero_stage_timeout_disables_the_deadline() {
        let inference = InferenceSettings { stage_timeout_ms: 0 };
        assert_eq!(inference.stage_timeout(), None);
        let inference = InferenceSettings { stage_timeout_ms: 250 };
        assert_eq!(inference.stage_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(Configuration::load(Some(&missing)).is_err());
    }
}
