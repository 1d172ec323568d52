//! Capture handles.
//!
//! This module provides the handle surface shared by the caller and the drainer:
//! - `CaptureHandle`: open status, blocking read, non-blocking discard, release
//! - `CsiCapture`: the factory-built handle, backed by either
//!   - GStreamer on the CSI camera stack (feature: csi-gstreamer)
//!   - a synthetic sensor for `stub://` sources (testing, hosts without the ISP daemon)
//!
//! Opening never fails loudly. A pipeline that cannot start (daemon unavailable,
//! sensor busy, bad dimensions) yields a handle whose `is_opened()` is false and
//! whose reads all fail. Callers check status; nothing here retries.

#[cfg(feature = "csi-gstreamer")]
mod nvargus;
mod synthetic;

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::frame::Frame;
use crate::pipeline::LatencyMode;

#[cfg(feature = "csi-gstreamer")]
use self::nvargus::NvargusCapture;
use self::synthetic::SyntheticCapture;

/// Source selecting the first CSI sensor.
pub const DEFAULT_SOURCE: &str = "csi://0";

/// Scheme that selects the synthetic backend.
pub const STUB_SCHEME: &str = "stub://";

/// Handle surface exposed to the caller and to the drainer.
///
/// All methods take `&self`: one handle is read by the caller while the
/// drainer discards on another thread. Implementations must make that
/// concurrent use safe.
pub trait CaptureHandle: Send + Sync {
    /// True until `release()` is called, or never true if opening failed.
    fn is_opened(&self) -> bool;

    /// Block until the next frame is available and return it.
    ///
    /// A failed read does not close the handle.
    fn read(&self) -> Result<Frame>;

    /// Discard at most one queued frame without blocking.
    ///
    /// Returns true when a frame was discarded. Failures are not errors.
    fn grab(&self) -> bool;

    /// Close the handle. Calls after the first are no-ops.
    fn release(&self);

    fn stats(&self) -> CaptureStats;
}

/// Configuration for a capture handle.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// `csi://0` for the sensor, `stub://<name>` for the synthetic backend.
    pub source: String,
    /// Output frame width in pixels.
    pub width: u32,
    /// Output frame height in pixels.
    pub height: u32,
    pub latency: LatencyMode,
    /// Upper bound on how long a single `read()` waits for a frame.
    pub read_timeout: Duration,
    /// Frame rate of the synthetic sensor (ignored by real backends).
    pub synthetic_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            width: 640,
            height: 480,
            latency: LatencyMode::LowLatency,
            read_timeout: Duration::from_secs(2),
            synthetic_fps: 30,
        }
    }
}

impl CaptureConfig {
    pub fn new(width: u32, height: u32, low_latency: bool) -> Self {
        Self {
            width,
            height,
            latency: LatencyMode::from_low_latency(low_latency),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn is_stub(&self) -> bool {
        self.source.starts_with(STUB_SCHEME)
    }
}

/// Counters for a capture handle.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CaptureStats {
    pub source: String,
    pub frames_read: u64,
    pub read_failures: u64,
    pub frames_discarded: u64,
    pub grab_attempts: u64,
}

/// CSI capture handle produced by the factory.
pub struct CsiCapture {
    backend: CaptureBackend,
}

enum CaptureBackend {
    Synthetic(SyntheticCapture),
    #[cfg(feature = "csi-gstreamer")]
    Gstreamer(NvargusCapture),
    #[cfg_attr(feature = "csi-gstreamer", allow(dead_code))]
    Unavailable(UnavailableCapture),
}

impl CsiCapture {
    /// Build and start a capture handle for `config`.
    ///
    /// Never returns an error; check `is_opened()` on the result.
    pub fn open(config: &CaptureConfig) -> Self {
        let backend = if config.is_stub() {
            CaptureBackend::Synthetic(SyntheticCapture::open(config))
        } else {
            #[cfg(feature = "csi-gstreamer")]
            {
                CaptureBackend::Gstreamer(NvargusCapture::open(config))
            }
            #[cfg(not(feature = "csi-gstreamer"))]
            {
                log::error!(
                    "CsiCapture: {} requires the csi-gstreamer feature; handle stays closed",
                    config.source
                );
                CaptureBackend::Unavailable(UnavailableCapture::new(&config.source))
            }
        };
        let capture = Self { backend };
        if capture.is_opened() {
            log::info!(
                "CsiCapture: opened {} at {}x{} ({})",
                config.source,
                config.width,
                config.height,
                config.latency
            );
        } else {
            log::warn!("CsiCapture: failed to open {}", config.source);
        }
        capture
    }
}

impl CaptureHandle for CsiCapture {
    fn is_opened(&self) -> bool {
        match &self.backend {
            CaptureBackend::Synthetic(source) => source.is_opened(),
            #[cfg(feature = "csi-gstreamer")]
            CaptureBackend::Gstreamer(source) => source.is_opened(),
            CaptureBackend::Unavailable(source) => source.is_opened(),
        }
    }

    fn read(&self) -> Result<Frame> {
        match &self.backend {
            CaptureBackend::Synthetic(source) => source.read(),
            #[cfg(feature = "csi-gstreamer")]
            CaptureBackend::Gstreamer(source) => source.read(),
            CaptureBackend::Unavailable(source) => source.read(),
        }
    }

    fn grab(&self) -> bool {
        match &self.backend {
            CaptureBackend::Synthetic(source) => source.grab(),
            #[cfg(feature = "csi-gstreamer")]
            CaptureBackend::Gstreamer(source) => source.grab(),
            CaptureBackend::Unavailable(source) => source.grab(),
        }
    }

    fn release(&self) {
        match &self.backend {
            CaptureBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "csi-gstreamer")]
            CaptureBackend::Gstreamer(source) => source.release(),
            CaptureBackend::Unavailable(source) => source.release(),
        }
    }

    fn stats(&self) -> CaptureStats {
        match &self.backend {
            CaptureBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "csi-gstreamer")]
            CaptureBackend::Gstreamer(source) => source.stats(),
            CaptureBackend::Unavailable(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Read gate: keeps the drainer off the queue while a read is waiting
// ----------------------------------------------------------------------------

/// Counts reads in flight on one handle.
///
/// While any read is pending, discards are skipped, so a frame the reader is
/// waiting for is never taken by the drainer. A read in flight means the queue
/// is already being emptied by the reader itself.
#[derive(Debug, Default)]
pub(crate) struct ReadGate {
    pending: AtomicUsize,
}

impl ReadGate {
    pub(crate) fn enter(&self) -> ReadGuard<'_> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        ReadGuard { gate: self }
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

pub(crate) struct ReadGuard<'a> {
    gate: &'a ReadGate,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.gate.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Unavailable backend: source that cannot be served by this build
// ----------------------------------------------------------------------------

struct UnavailableCapture {
    source: String,
    read_failures: AtomicUsize,
}

impl UnavailableCapture {
    #[cfg_attr(feature = "csi-gstreamer", allow(dead_code))]
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            read_failures: AtomicUsize::new(0),
        }
    }

    fn is_opened(&self) -> bool {
        false
    }

    fn read(&self) -> Result<Frame> {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
        anyhow::bail!("capture {} is not open", self.source)
    }

    fn grab(&self) -> bool {
        false
    }

    fn release(&self) {}

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            source: self.source.clone(),
            read_failures: self.read_failures.load(Ordering::Relaxed) as u64,
            ..CaptureStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_gate_tracks_pending_reads() {
        let gate = ReadGate::default();
        assert!(!gate.is_reading());
        {
            let _first = gate.enter();
            let _second = gate.enter();
            assert!(gate.is_reading());
        }
        assert!(!gate.is_reading());
    }

    #[test]
    fn stub_source_opens_synthetic_backend() {
        let config = CaptureConfig::new(64, 48, true).with_source("stub://unit");
        let capture = CsiCapture::open(&config);
        assert!(capture.is_opened());
        let frame = capture.read().expect("synthetic read");
        assert_eq!(frame.shape(), (48, 64, 3));
        capture.release();
        assert!(!capture.is_opened());
    }

    #[cfg(not(feature = "csi-gstreamer"))]
    #[test]
    fn sensor_source_without_backend_reports_closed() {
        let capture = CsiCapture::open(&CaptureConfig::default());
        assert!(!capture.is_opened());
        assert!(capture.read().is_err());
        assert!(!capture.grab());
        capture.release();
        assert_eq!(capture.stats().read_failures, 1);
    }

    #[test]
    fn config_defaults_match_sensor_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.source, DEFAULT_SOURCE);
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.latency, LatencyMode::LowLatency);
        assert!(!config.is_stub());
    }
}
