//! CSI sensor pipeline description.
//!
//! Renders the launch description for the Jetson camera stack:
//!
//! ```text
//! nvarguscamerasrc ! nvvidconv ! video/x-raw(BGRx) ! videoconvert ! video/x-raw(BGR) ! appsink
//! ```
//!
//! `nvvidconv` cannot emit packed 3-channel BGR, so a software `videoconvert`
//! stage drops the padding byte. The hardware stage holds a single output
//! buffer in both latency modes, which bounds how stale a queued frame can be.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Only sensor mode the CSI stack exposes for this module.
pub const SENSOR_MODE: u32 = 0;

/// Buffers held by the hardware conversion stage.
pub const OUTPUT_BUFFERS: u32 = 1;

/// Latency/quality trade-off for a capture handle. Fixed for the handle's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    /// No temporal noise reduction, nearest-neighbour scaling, background draining.
    #[default]
    LowLatency,
    /// Temporal noise reduction and the best scaler; reads may return a queued frame.
    HighQuality,
}

impl LatencyMode {
    pub fn from_low_latency(low_latency: bool) -> Self {
        if low_latency {
            Self::LowLatency
        } else {
            Self::HighQuality
        }
    }

    pub fn is_low_latency(self) -> bool {
        matches!(self, Self::LowLatency)
    }

    /// `tnr-mode` value for `nvarguscamerasrc`.
    pub fn tnr_mode(self) -> &'static str {
        match self {
            Self::LowLatency => "0",
            Self::HighQuality => "2",
        }
    }

    /// `interpolation-method` value for `nvvidconv`.
    pub fn interpolation_method(self) -> &'static str {
        match self {
            Self::LowLatency => "Nearest",
            Self::HighQuality => "Nicest",
        }
    }

    /// Whether a buffer drainer runs alongside handles in this mode.
    pub fn spawns_drainer(self) -> bool {
        self.is_low_latency()
    }
}

impl fmt::Display for LatencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowLatency => f.write_str("low_latency"),
            Self::HighQuality => f.write_str("high_quality"),
        }
    }
}

/// Thread count for the software color conversion stage.
pub fn conversion_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Parameters of one sensor pipeline. `Display` yields the launch string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDescription {
    pub sensor_mode: u32,
    pub width: u32,
    pub height: u32,
    pub latency: LatencyMode,
    pub output_buffers: u32,
    pub conversion_threads: u32,
    /// Optional `name=` for the appsink, so a backend can look it up.
    pub sink_name: Option<String>,
}

impl PipelineDescription {
    pub fn new(width: u32, height: u32, latency: LatencyMode) -> Self {
        Self {
            sensor_mode: SENSOR_MODE,
            width,
            height,
            latency,
            output_buffers: OUTPUT_BUFFERS,
            conversion_threads: conversion_threads(),
            sink_name: None,
        }
    }

    pub fn with_sink_name(mut self, name: impl Into<String>) -> Self {
        self.sink_name = Some(name.into());
        self
    }

    pub fn with_conversion_threads(mut self, threads: u32) -> Self {
        self.conversion_threads = threads.max(1);
        self
    }
}

impl fmt::Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nvarguscamerasrc sensor-mode={} tnr-mode={} ",
            self.sensor_mode,
            self.latency.tnr_mode()
        )?;
        write!(
            f,
            "! nvvidconv interpolation-method={} output-buffers={} ",
            self.latency.interpolation_method(),
            self.output_buffers
        )?;
        write!(
            f,
            "! video/x-raw, width={}, height={}, format=BGRx ",
            self.width, self.height
        )?;
        write!(f, "! videoconvert n-threads={} ", self.conversion_threads)?;
        f.write_str("! video/x-raw, format=(string)BGR ! appsink")?;
        if let Some(name) = &self.sink_name {
            write!(f, " name={}", name)?;
        }
        Ok(())
    }
}
