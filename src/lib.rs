//! CSI camera capture context.
//!
//! Opens the Jetson CSI sensor pipeline and hands out a capture handle whose
//! reads reflect the most recent exposure, then tears everything down
//! deterministically.
//!
//! # Architecture
//!
//! - `pipeline`: latency mode and the sensor pipeline description
//! - `capture`: the capture handle (`CsiCapture`) and its backends
//! - `drain`: background thread that keeps the handle's queue empty
//! - `context`: scoped ownership of handle + drainer (`CaptureContext`, `with_capture`)
//! - `config`: file/env configuration
//!
//! ```no_run
//! use csi_capture::{with_capture, CaptureConfig, CaptureHandle};
//!
//! # fn main() -> anyhow::Result<()> {
//! let shape = with_capture(&CaptureConfig::new(640, 480, true), |cap| {
//!     let frame = cap.read()?;
//!     Ok(frame.shape())
//! })?;
//! assert_eq!(shape, (480, 640, 3));
//! # Ok(())
//! # }
//! ```
//!
//! In low-latency mode `read()` blocks until the next exposure; use
//! `LatencyMode::HighQuality` to get whatever frame is already queued.

pub mod capture;
pub mod config;
pub mod context;
pub mod drain;
pub mod frame;
pub mod pipeline;
pub mod ui;

pub use capture::{CaptureConfig, CaptureHandle, CaptureStats, CsiCapture};
pub use config::CaptureSettings;
pub use context::{with_capture, CaptureContext, ContextReport, ContextState};
pub use drain::{DrainReport, Drainer, DrainerConfig};
pub use frame::Frame;
pub use pipeline::{LatencyMode, PipelineDescription};
