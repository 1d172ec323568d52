use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::capture::{CaptureConfig, DEFAULT_SOURCE};
use crate::drain::DrainerConfig;
use crate::pipeline::LatencyMode;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_READ_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SYNTHETIC_FPS: u32 = 30;
const MAX_SYNTHETIC_FPS: u32 = 1_000_000_000;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    low_latency: Option<bool>,
    read_timeout_ms: Option<u64>,
    synthetic_fps: Option<u32>,
    drainer: Option<DrainerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DrainerConfigFile {
    idle_backoff_us: Option<u64>,
}

/// Capture settings resolved from `CSI_CAPTURE_CONFIG` and `CSI_CAPTURE_*` overrides.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub capture: CaptureConfig,
    pub drainer: DrainerConfig,
}

impl CaptureSettings {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CSI_CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let capture = CaptureConfig {
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            width: file.width.unwrap_or(DEFAULT_WIDTH),
            height: file.height.unwrap_or(DEFAULT_HEIGHT),
            latency: LatencyMode::from_low_latency(file.low_latency.unwrap_or(true)),
            read_timeout: Duration::from_millis(
                file.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            synthetic_fps: file.synthetic_fps.unwrap_or(DEFAULT_SYNTHETIC_FPS),
        };
        let drainer = DrainerConfig {
            idle_backoff: Duration::from_micros(
                file.drainer
                    .and_then(|drainer| drainer.idle_backoff_us)
                    .unwrap_or(0),
            ),
        };
        Self { capture, drainer }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("CSI_CAPTURE_SOURCE") {
            if !source.trim().is_empty() {
                self.capture.source = source.trim().to_string();
            }
        }
        if let Ok(width) = std::env::var("CSI_CAPTURE_WIDTH") {
            self.capture.width = width
                .parse()
                .map_err(|_| anyhow!("CSI_CAPTURE_WIDTH must be a positive integer"))?;
        }
        if let Ok(height) = std::env::var("CSI_CAPTURE_HEIGHT") {
            self.capture.height = height
                .parse()
                .map_err(|_| anyhow!("CSI_CAPTURE_HEIGHT must be a positive integer"))?;
        }
        if let Ok(low_latency) = std::env::var("CSI_CAPTURE_LOW_LATENCY") {
            let low_latency = parse_bool(&low_latency)
                .ok_or_else(|| anyhow!("CSI_CAPTURE_LOW_LATENCY must be true or false"))?;
            self.capture.latency = LatencyMode::from_low_latency(low_latency);
        }
        if let Ok(timeout) = std::env::var("CSI_CAPTURE_READ_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("CSI_CAPTURE_READ_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.capture.read_timeout = Duration::from_millis(millis);
        }
        if let Ok(backoff) = std::env::var("CSI_CAPTURE_DRAIN_BACKOFF_US") {
            let micros: u64 = backoff.parse().map_err(|_| {
                anyhow!("CSI_CAPTURE_DRAIN_BACKOFF_US must be an integer number of microseconds")
            })?;
            self.drainer.idle_backoff = Duration::from_micros(micros);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture.source.trim().is_empty() {
            return Err(anyhow!("capture source must not be empty"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!(
                "capture dimensions must be positive (got {}x{})",
                self.capture.width,
                self.capture.height
            ));
        }
        if self.capture.read_timeout.is_zero() {
            return Err(anyhow!("read timeout must be greater than zero"));
        }
        if !(1..=MAX_SYNTHETIC_FPS).contains(&self.capture.synthetic_fps) {
            return Err(anyhow!(
                "synthetic_fps must be between 1 and {} (got {})",
                MAX_SYNTHETIC_FPS,
                self.capture.synthetic_fps
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
