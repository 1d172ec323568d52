//! Synthetic CSI sensor (`stub://` sources).
//!
//! Models the part of the camera stack that matters for freshness:
//! - the sensor exposes a frame every `1 / synthetic_fps` seconds
//! - the conversion stage holds `OUTPUT_BUFFERS` frames
//! - when that buffer is full, new exposures are lost upstream, so the
//!   queued frame is the OLDEST one, not the newest
//!
//! `stub://busy` and zero dimensions model an open failure.

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{CaptureConfig, CaptureStats, ReadGate};
use crate::frame::{packed_len, Frame};
use crate::pipeline::OUTPUT_BUFFERS;

/// Source name that never opens (sensor held by another process).
pub(crate) const BUSY_SOURCE: &str = "stub://busy";

const NANOS_PER_SEC: u64 = 1_000_000_000;

pub(super) struct SyntheticCapture {
    source: String,
    width: u32,
    height: u32,
    frame_interval_ns: u64,
    read_timeout: Duration,
    queue_depth: usize,
    opened: AtomicBool,
    state: Mutex<SensorState>,
    frame_ready: Condvar,
    reads: ReadGate,
    frames_read: AtomicU64,
    read_failures: AtomicU64,
    frames_discarded: AtomicU64,
    grab_attempts: AtomicU64,
}

#[derive(Clone, Copy, Debug)]
struct Exposure {
    sequence: u64,
    captured_at: Instant,
}

struct SensorState {
    started_at: Instant,
    /// Sequence number of the next exposure the sensor will take.
    next_exposure: u64,
    queue: VecDeque<Exposure>,
    /// Exposures dropped because the output buffer was full.
    lost: u64,
}

impl SensorState {
    fn exposure_at(&self, sequence: u64, interval_ns: u64) -> Instant {
        self.started_at + Duration::from_nanos(interval_ns.saturating_mul(sequence))
    }

    /// Bring the queue up to date with every exposure taken up to `now`.
    fn advance(&mut self, now: Instant, interval_ns: u64, depth: usize) {
        let elapsed = now.saturating_duration_since(self.started_at).as_nanos();
        let exposed = (elapsed / interval_ns as u128) as u64 + 1;
        while self.next_exposure < exposed && self.queue.len() < depth {
            let sequence = self.next_exposure;
            self.queue.push_back(Exposure {
                sequence,
                captured_at: self.exposure_at(sequence, interval_ns),
            });
            self.next_exposure += 1;
        }
        if self.next_exposure < exposed {
            self.lost += exposed - self.next_exposure;
            self.next_exposure = exposed;
        }
    }
}

impl SyntheticCapture {
    pub(super) fn open(config: &CaptureConfig) -> Self {
        let opened = match open_failure(config) {
            Some(reason) => {
                log::warn!("SyntheticCapture: {} not opened: {}", config.source, reason);
                false
            }
            None => {
                log::info!("SyntheticCapture: connected to {} (synthetic)", config.source);
                true
            }
        };
        let fps = u64::from(config.synthetic_fps.max(1));
        // Rates above 1 GHz still tick once per nanosecond.
        let frame_interval_ns = (NANOS_PER_SEC / fps).max(1);

        Self {
            source: config.source.clone(),
            width: config.width,
            height: config.height,
            frame_interval_ns,
            read_timeout: config.read_timeout,
            queue_depth: OUTPUT_BUFFERS as usize,
            opened: AtomicBool::new(opened),
            state: Mutex::new(SensorState {
                started_at: Instant::now(),
                next_exposure: 0,
                queue: VecDeque::new(),
                lost: 0,
            }),
            frame_ready: Condvar::new(),
            reads: ReadGate::default(),
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
        let result = self
            .wait_for_exposure()
            .and_then(|exposure| self.render(exposure));
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
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.advance(Instant::now(), self.frame_interval_ns, self.queue_depth);
        if state.queue.pop_front().is_some() {
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
        // Take the lock so a reader between its status check and its wait
        // cannot miss the wakeup.
        if let Ok(mut state) = self.state.lock() {
            state.queue.clear();
        }
        self.frame_ready.notify_all();
        log::info!("SyntheticCapture: released {}", self.source);
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

    fn lock_state(&self) -> Result<MutexGuard<'_, SensorState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("synthetic sensor state poisoned"))
    }

    fn wait_for_exposure(&self) -> Result<Exposure> {
        let deadline = Instant::now() + self.read_timeout;
        let mut state = self.lock_state()?;
        loop {
            if !self.is_opened() {
                bail!("capture {} is closed", self.source);
            }
            let now = Instant::now();
            state.advance(now, self.frame_interval_ns, self.queue_depth);
            if let Some(exposure) = state.queue.pop_front() {
                return Ok(exposure);
            }
            if now >= deadline {
                bail!(
                    "no frame from {} within {:?}",
                    self.source,
                    self.read_timeout
                );
            }
            let wake = state
                .exposure_at(state.next_exposure, self.frame_interval_ns)
                .min(deadline);
            let (guard, _) = self
                .frame_ready
                .wait_timeout(state, wake.saturating_duration_since(now))
                .map_err(|_| anyhow!("synthetic sensor state poisoned"))?;
            state = guard;
        }
    }

    /// Deterministic BGR pattern keyed on the sequence number.
    fn render(&self, exposure: Exposure) -> Result<Frame> {
        let mut pixels = vec![0u8; packed_len(self.width, self.height)?];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64).wrapping_add(exposure.sequence) % 256) as u8;
        }
        Frame::from_bgr_at(
            pixels,
            self.width,
            self.height,
            exposure.sequence,
            exposure.captured_at,
        )
    }

    #[cfg(test)]
    fn lost_exposures(&self) -> u64 {
        self.state.lock().map(|state| state.lost).unwrap_or(0)
    }
}

fn open_failure(config: &CaptureConfig) -> Option<String> {
    if config.source == BUSY_SOURCE {
        return Some("sensor busy".to_string());
    }
    if config.width == 0 || config.height == 0 {
        return Some(format!(
            "invalid dimensions {}x{}",
            config.width, config.height
        ));
    }
    if let Err(err) = packed_len(config.width, config.height) {
        return Some(err.to_string());
    }
    None
}
