//! CSI capture through GStreamer and the Argus camera daemon.
//!
//! Builds the `nvarguscamerasrc` pipeline from `PipelineDescription`, starts it,
//! and serves frames from its appsink:
//! - `read()` pulls with the configured timeout
//! - `grab()` pulls with a zero timeout and drops the sample
//! - `release()` takes the pipeline to NULL
//!
//! Appsink pulls are internally locked by GStreamer, so the caller and the
//! drainer may pull from one handle concurrently.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CaptureConfig, CaptureStats, ReadGate};
use crate::frame::{repack_rows, Frame};
use crate::pipeline::PipelineDescription;

const SINK_NAME: &str = "csi_sink";

/// How long the pipeline may take to reach PLAYING before the open is
/// considered failed. The Argus daemon is slow to hand over the sensor.
const START_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) struct NvargusCapture {
    source: String,
    read_timeout: Duration,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    opened: AtomicBool,
    reads: ReadGate,
    last_error: Mutex<Option<String>>,
    sequence: AtomicU64,
    frames_read: AtomicU64,
    read_failures: AtomicU64,
    frames_discarded: AtomicU64,
    grab_attempts: AtomicU64,
}

impl NvargusCapture {
    pub(super) fn open(config: &CaptureConfig) -> Self {
        let description =
            PipelineDescription::new(config.width, config.height, config.latency)
                .with_sink_name(SINK_NAME);

        let pipeline = match start_pipeline(&description) {
            Ok(pipeline) => Some(pipeline),
            Err(err) => {
                log::warn!("NvargusCapture: {} did not start: {:#}", config.source, err);
                None
            }
        };
        let opened = pipeline.is_some();

        Self {
            source: config.source.clone(),
            read_timeout: config.read_timeout,
            pipeline,
            opened: AtomicBool::new(opened),
            reads: ReadGate::default(),
            last_error: Mutex::new(None),
            sequence: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
            grab_attempts: AtomicU64::new(0),
        }
    }

    pub(super) fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub(super) fn read(&self) -> Result<Frame> {
        let _reading = self.reads.enter();
        let result = self.pull_frame();
        match &result {
            Ok(_) => self.frames_read.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.read_failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub(super) fn grab(&self) -> bool {
        self.grab_attempts.fetch_add(1, Ordering::Relaxed);
        if !self.is_opened() || self.reads.is_reading() {
            return false;
        }
        let Some((_, appsink)) = &self.pipeline else {
            return false;
        };
        if appsink.try_pull_sample(gstreamer::ClockTime::ZERO).is_some() {
            self.sequence.fetch_add(1, Ordering::Relaxed);
            self.frames_discarded.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(super) fn release(&self) {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((pipeline, _)) = &self.pipeline {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("NvargusCapture: failed to stop {}: {}", self.source, err);
            }
        }
        log::info!("NvargusCapture: released {}", self.source);
    }

    pub(super) fn stats(&self) -> CaptureStats {
        CaptureStats {
            source: self.source.clone(),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            grab_attempts: self.grab_attempts.load(Ordering::Relaxed),
        }
    }

    fn pull_frame(&self) -> Result<Frame> {
        if !self.is_opened() {
            anyhow::bail!("capture {} is closed", self.source);
        }
        let (_, appsink) = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("capture {} has no pipeline", self.source))?;
        self.poll_bus();

        let timeout_ns = u64::try_from(self.read_timeout.as_nanos()).unwrap_or(u64::MAX);
        let timeout = gstreamer::ClockTime::from_nseconds(timeout_ns);
        let sample = appsink.try_pull_sample(timeout).ok_or_else(|| {
            let last_error = self
                .last_error
                .lock()
                .ok()
                .and_then(|guard| guard.clone());
            match last_error {
                Some(err) => anyhow!("no frame from {}: {}", self.source, err),
                None => anyhow!("no frame from {} within {:?}", self.source, self.read_timeout),
            }
        })?;
        let captured_at = Instant::now();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        sample_to_frame(&sample, sequence, captured_at)
    }

    /// Record pipeline errors for the next failed read. The handle stays open;
    /// only the owner closes it.
    fn poll_bus(&self) {
        let Some((pipeline, _)) = &self.pipeline else {
            return;
        };
        let Some(bus) = pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            let error = match message.view() {
                MessageView::Error(err) => Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                )),
                MessageView::Eos(..) => Some("gstreamer reached EOS".to_string()),
                _ => None,
            };
            if let Some(error) = error {
                log::warn!("NvargusCapture: {}: {}", self.source, error);
                if let Ok(mut last_error) = self.last_error.lock() {
                    *last_error = Some(error);
                }
            }
        }
    }
}

impl Drop for NvargusCapture {
    fn drop(&mut self) {
        if let Some((pipeline, _)) = &self.pipeline {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
    }
}

fn start_pipeline(
    description: &PipelineDescription,
) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
    gstreamer::init().context("initialize gstreamer")?;

    let launch = description.to_string();
    log::debug!("NvargusCapture: launching {}", launch);
    let pipeline = gstreamer::parse::launch(&launch)
        .context("build CSI pipeline")?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow!("CSI pipeline is not a Pipeline"))?;

    let appsink = pipeline
        .by_name(SINK_NAME)
        .context("appsink element missing from pipeline")?
        .downcast::<gstreamer_app::AppSink>()
        .map_err(|_| anyhow!("appsink element has unexpected type"))?;
    appsink.set_max_buffers(1);
    appsink.set_drop(false);
    appsink.set_sync(false);

    if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
        let _ = pipeline.set_state(gstreamer::State::Null);
        return Err(anyhow!("set CSI pipeline to Playing: {}", err));
    }
    let (result, state, _) = pipeline.state(gstreamer::ClockTime::from_seconds(
        START_TIMEOUT.as_secs(),
    ));
    if result.is_err() || state != gstreamer::State::Playing {
        let _ = pipeline.set_state(gstreamer::State::Null);
        return Err(anyhow!("CSI pipeline stuck in {:?}", state));
    }

    Ok((pipeline, appsink))
}

fn row_stride(stride: i32) -> Result<usize> {
    usize::try_from(stride).map_err(|_| anyhow!("CSI buffer has negative row stride {}", stride))
}

fn sample_to_frame(
    sample: &gstreamer::Sample,
    sequence: u64,
    captured_at: Instant,
) -> Result<Frame> {
    let buffer = sample.buffer().context("CSI sample missing buffer")?;
    let caps = sample.caps().context("CSI sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse CSI caps as video info")?;

    let width = info.width();
    let height = info.height();
    let stride = row_stride(info.stride()[0])?;

    let map = buffer.map_readable().context("map CSI buffer")?;
    let pixels = repack_rows(map.as_slice(), width, height, stride)?;

    Frame::from_bgr_at(pixels, width, height, sequence, captured_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_stride_is_rejected() {
        assert_eq!(row_stride(1920).ok(), Some(1920));
        let err = row_stride(-1920).unwrap_err();
        assert!(err.to_string().contains("negative row stride"));
    }
}
