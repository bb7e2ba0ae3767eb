use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::RetryPolicy;
use crate::geometry::GeometryLimits;
use crate::model::LOW_CONFIDENCE_THRESHOLD;

const DEFAULT_CONFIG_PATH: &str = ".screen-pointer/config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    /// Screenshots above this size are recompressed before upload.
    pub upload_ceiling_bytes: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            timeout_ms: 60_000,
            upload_ceiling_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    pub host_addr: String,
    pub overlay_dir: PathBuf,
    pub marker_bin: Option<PathBuf>,
    pub display_ms: u64,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            host_addr: "127.0.0.1:47810".to_string(),
            overlay_dir: PathBuf::from(".screen-pointer/overlay"),
            marker_bin: None,
            display_ms: 5_000,
            connect_timeout_ms: 500,
            call_timeout_ms: 2_000,
        }
    }
}

impl OverlaySettings {
    pub fn display_duration(&self) -> Duration {
        Duration::from_millis(self.display_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub enabled: bool,
    pub settle_ms: u64,
    pub low_confidence_threshold: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_ms: 800,
            low_confidence_threshold: LOW_CONFIDENCE_THRESHOLD,
        }
    }
}

impl CalibrationSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service: ServiceSettings,
    pub retry: RetryPolicy,
    pub geometry: GeometryLimits,
    pub overlay: OverlaySettings,
    pub calibration: CalibrationSettings,
}

impl Settings {
    /// `explicit`, else `$SP_CONFIG`, else the project-local file if present,
    /// else defaults. Environment overrides apply last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env_path("SP_CONFIG"))
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_PATH);
                local.exists().then_some(local)
            });

        let mut settings = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings.sanitized())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config JSON: {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = env_string("SP_SERVICE_URL") {
            self.service.base_url = url;
        }
        if let Some(key) = env_string("SP_API_KEY") {
            self.service.api_key = Some(key);
        }
        if let Some(addr) = env_string("SP_HOST_ADDR") {
            self.overlay.host_addr = addr;
        }
        if let Some(dir) = env_path("SP_OVERLAY_DIR") {
            self.overlay.overlay_dir = dir;
        }
        if let Some(bin) = env_path("SP_MARKER_BIN") {
            self.overlay.marker_bin = Some(bin);
        }
    }

    pub fn sanitized(mut self) -> Self {
        self.geometry = self.geometry.sanitized();
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        let threshold = self.calibration.low_confidence_threshold;
        self.calibration.low_confidence_threshold = if threshold.is_finite() {
            threshold.clamp(0.0, 1.0)
        } else {
            LOW_CONFIDENCE_THRESHOLD
        };
        self
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_string(name).map(PathBuf::from)
}
