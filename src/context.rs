//! Scoped capture context.
//!
//! `CaptureContext` owns one capture handle and, in low-latency mode, the
//! drainer that keeps it fresh:
//!
//! ```text
//! Created -> OpenNoDrain | OpenDraining -> Releasing -> Closed
//! ```
//!
//! Teardown always runs release -> signal drainer -> join drainer, in that
//! order, whether the scope ends through `close()`, an early return, `?`, or
//! a panic (via `Drop`). When teardown returns, the handle is closed and no
//! drainer thread is left running against the camera.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::capture::{CaptureConfig, CaptureHandle, CaptureStats, CsiCapture};
use crate::drain::{DrainReport, Drainer, DrainerConfig};
use crate::pipeline::LatencyMode;

/// Lifecycle state of a `CaptureContext`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ContextState {
    Created,
    OpenNoDrain,
    OpenDraining,
    Releasing,
    Closed,
}

/// Summary returned by `CaptureContext::close`.
#[derive(Clone, Debug, Serialize)]
pub struct ContextReport {
    pub latency: LatencyMode,
    /// Present only when a drainer ran.
    pub drain: Option<DrainReport>,
    pub stats: CaptureStats,
}

/// An open capture handle plus its optional drainer.
pub struct CaptureContext<H: CaptureHandle + 'static = CsiCapture> {
    handle: Arc<H>,
    latency: LatencyMode,
    drainer: Option<Drainer>,
    state: ContextState,
}

impl CaptureContext<CsiCapture> {
    /// Open the CSI handle described by `config` and start draining it when
    /// the latency mode asks for it.
    ///
    /// A handle that fails to open is still returned (reporting closed); the
    /// only error is failing to start the drainer thread.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        Self::open_with(config, DrainerConfig::default())
    }

    pub fn open_with(config: &CaptureConfig, drainer: DrainerConfig) -> Result<Self> {
        Self::with_handle(CsiCapture::open(config), config.latency, drainer)
    }
}

impl<H: CaptureHandle + 'static> CaptureContext<H> {
    /// Take ownership of an already created handle.
    pub fn with_handle(handle: H, latency: LatencyMode, drainer: DrainerConfig) -> Result<Self> {
        Self::start(handle, latency, |handle| Drainer::spawn(handle, drainer))
    }

    fn start<F>(handle: H, latency: LatencyMode, spawn: F) -> Result<Self>
    where
        F: FnOnce(Arc<H>) -> Result<Drainer>,
    {
        let mut context = Self {
            handle: Arc::new(handle),
            latency,
            drainer: None,
            state: ContextState::Created,
        };

        if !latency.spawns_drainer() {
            context.state = ContextState::OpenNoDrain;
            return Ok(context);
        }
        if !context.handle.is_opened() {
            // Nothing to drain; the caller observes the closed handle.
            log::warn!("capture context: handle not open, skipping buffer drainer");
            context.state = ContextState::OpenNoDrain;
            return Ok(context);
        }

        // On spawn failure `context` drops here and releases the handle.
        let spawned = spawn(Arc::clone(&context.handle))?;
        context.drainer = Some(spawned);
        context.state = ContextState::OpenDraining;
        Ok(context)
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Shared reference to the handle that outlives the context.
    ///
    /// The handle is still released when the context ends.
    pub fn shared_handle(&self) -> Arc<H> {
        Arc::clone(&self.handle)
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn latency(&self) -> LatencyMode {
        self.latency
    }

    pub fn is_draining(&self) -> bool {
        self.state == ContextState::OpenDraining
    }

    /// Release the handle and wait for the drainer to finish.
    pub fn close(mut self) -> Result<ContextReport> {
        let drain = self.shutdown()?;
        Ok(ContextReport {
            latency: self.latency,
            drain,
            stats: self.handle.stats(),
        })
    }

    fn shutdown(&mut self) -> Result<Option<DrainReport>> {
        if self.state == ContextState::Closed {
            return Ok(None);
        }
        self.state = ContextState::Releasing;

        // Release first: the drainer only stops once it sees the handle closed
        // or the stop signal, and joining before either would hang.
        self.handle.release();
        let drain = self.drainer.take().map(Drainer::join).transpose();
        self.state = ContextState::Closed;
        log::info!("capture context closed ({})", self.latency);
        drain
    }
}

impl<H: CaptureHandle + 'static> Drop for CaptureContext<H> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("capture context teardown failed: {:#}", err);
        }
    }
}

/// Run `body` against an open CSI handle, then tear the context down.
///
/// Teardown happens on every exit path. An error from `body` wins over a
/// teardown error.
pub fn with_capture<T, F>(config: &CaptureConfig, body: F) -> Result<T>
where
    F: FnOnce(&CsiCapture) -> Result<T>,
{
    let context = CaptureContext::open(config)?;
    let outcome = body(context.handle());
    let closed = context.close();
    let value = outcome?;
    closed?;
    Ok(value)
}
