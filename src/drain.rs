//! Background buffer drainer.
//!
//! While a low-latency handle is open, a dedicated thread keeps discarding
//! queued frames so the caller's next `read()` waits for a fresh exposure
//! instead of returning one that sat in the output buffer.
//!
//! The thread stops on whichever comes first:
//! - the handle reports closed
//! - the stop channel is closed (the owning `Drainer` signalled or was dropped)
//!
//! The drainer never releases the handle. Its owner releases first, then joins.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::CaptureHandle;

const THREAD_NAME: &str = "csi-drainer";

/// Drainer tuning.
#[derive(Clone, Copy, Debug, Default)]
pub struct DrainerConfig {
    /// Pause between discards. Zero yields the CPU instead of sleeping.
    pub idle_backoff: Duration,
}

/// What a drainer did before it stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub iterations: u64,
    pub frames_discarded: u64,
}

/// Handle to a running drainer thread.
#[derive(Debug)]
pub struct Drainer {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<DrainReport>>,
}

impl Drainer {
    /// Start draining `handle` on a new thread.
    pub fn spawn<H>(handle: Arc<H>, config: DrainerConfig) -> Result<Self>
    where
        H: CaptureHandle + 'static,
    {
        let (stop, stop_rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || drain_loop(handle.as_ref(), &stop_rx, config.idle_backoff))
            .context("spawn buffer drainer thread")?;
        Ok(Self {
            stop: Some(stop),
            join: Some(join),
        })
    }

    /// Tell the thread to stop after its current iteration.
    pub fn signal(&mut self) {
        self.stop.take();
    }

    /// True once the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Signal the thread and wait for it to exit.
    pub fn join(mut self) -> Result<DrainReport> {
        self.signal();
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("buffer drainer thread panicked")),
            None => Ok(DrainReport::default()),
        }
    }
}

impl Drop for Drainer {
    fn drop(&mut self) {
        self.signal();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("buffer drainer thread panicked");
            }
        }
    }
}

fn drain_loop<H>(handle: &H, stop: &Receiver<()>, idle_backoff: Duration) -> DrainReport
where
    H: CaptureHandle + ?Sized,
{
    let mut report = DrainReport::default();
    while handle.is_opened() {
        // Losing the race against release or a reader is expected.
        if handle.grab() {
            report.frames_discarded += 1;
        }
        report.iterations += 1;

        let stopped = if idle_backoff.is_zero() {
            std::thread::yield_now();
            !matches!(stop.try_recv(), Err(TryRecvError::Empty))
        } else {
            !matches!(
                stop.recv_timeout(idle_backoff),
                Err(RecvTimeoutError::Timeout)
            )
        };
        if stopped {
            break;
        }
    }
    log::debug!(
        "buffer drainer exiting after {} iterations ({} frames discarded)",
        report.iterations,
        report.frames_discarded
    );
    report
}
