//! csi_probe - exercise a CSI capture context from the command line.
//!
//! Two modes:
//! 1. Read frames from one context (`--frames N`, 0 = until Ctrl-C) and report
//!    read latency and frame age.
//! 2. Stress open/read/close cycles alternating latency modes (`--cycles N`),
//!    checking frame shape and that each handle is closed after its scope.
//!
//! Settings come from `CSI_CAPTURE_CONFIG` / `CSI_CAPTURE_*`; flags override them.
//! A JSON summary is printed to stdout.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use csi_capture::ui::{Ui, UiMode};
use csi_capture::{
    CaptureContext, CaptureHandle, CaptureSettings, ContextReport, DrainReport, LatencyMode,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a CSI camera through a low-latency capture context")]
struct Args {
    /// Capture source (`csi://0`, or `stub://<name>` for the synthetic sensor).
    #[arg(long)]
    source: Option<String>,

    /// Output frame width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Output frame height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Use temporal noise reduction and high quality scaling; no buffer draining.
    #[arg(long)]
    high_quality: bool,

    /// Frames to read (0 reads until Ctrl-C).
    #[arg(long, env = "CSI_PROBE_FRAMES", default_value_t = 30)]
    frames: u64,

    /// Run this many open/read/close cycles alternating latency modes instead.
    #[arg(long, env = "CSI_PROBE_CYCLES", default_value_t = 0)]
    cycles: u32,

    /// Give up after this many consecutive failed reads.
    #[arg(long, default_value_t = 3)]
    max_failures: u32,

    /// Progress output style.
    #[arg(long, value_enum, env = "CSI_PROBE_UI", default_value = "auto")]
    ui: UiMode,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    source: String,
    width: u32,
    height: u32,
    latency: LatencyMode,
    frames: u64,
    read_failures: u64,
    mean_read_ms: f64,
    max_read_ms: f64,
    mean_frame_age_ms: f64,
    interrupted: bool,
    context: ContextReport,
}

#[derive(Debug, Serialize)]
struct CycleResult {
    cycle: u32,
    latency: LatencyMode,
    shape: (usize, usize, usize),
    closed_after_exit: bool,
    drain: Option<DrainReport>,
}

#[derive(Debug, Serialize)]
struct CycleSummary {
    source: String,
    cycles: Vec<CycleResult>,
}

#[derive(Default)]
struct ReadTimings {
    frames: u64,
    failures: u64,
    total_read: Duration,
    max_read: Duration,
    total_age: Duration,
}

impl ReadTimings {
    fn record(&mut self, read: Duration, age: Duration) {
        self.frames += 1;
        self.total_read += read;
        self.max_read = self.max_read.max(read);
        self.total_age += age;
    }

    fn mean_ms(&self, total: Duration) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        total.as_secs_f64() * 1000.0 / self.frames as f64
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );

    let settings = {
        let _stage = ui.stage("Load capture settings");
        let mut settings = CaptureSettings::load()?;
        if let Some(source) = &args.source {
            settings.capture.source = source.clone();
        }
        if let Some(width) = args.width {
            settings.capture.width = width;
        }
        if let Some(height) = args.height {
            settings.capture.height = height;
        }
        if args.high_quality {
            settings.capture.latency = LatencyMode::HighQuality;
        }
        if settings.capture.width == 0 || settings.capture.height == 0 {
            bail!("--width and --height must be positive");
        }
        settings
    };

    if args.cycles > 0 {
        let summary = run_cycles(&ui, &settings, args.cycles)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let summary = run_frames(&ui, &settings, args.frames, args.max_failures)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

fn run_frames(
    ui: &Ui,
    settings: &CaptureSettings,
    frames: u64,
    max_failures: u32,
) -> Result<RunSummary> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("install Ctrl-C handler")?;
    }

    let cfg = &settings.capture;
    let context = {
        let _stage = ui.stage(&format!("Open {} ({})", cfg.source, cfg.latency));
        CaptureContext::open_with(cfg, settings.drainer)?
    };
    if !context.handle().is_opened() {
        bail!("capture {} did not open", cfg.source);
    }

    let expected = (cfg.height as usize, cfg.width as usize, 3);
    let progress = ui.frames(frames);
    let mut timings = ReadTimings::default();
    let mut consecutive_failures = 0u32;

    while !stop.load(Ordering::SeqCst) && (frames == 0 || timings.frames < frames) {
        let started = Instant::now();
        match context.handle().read() {
            Ok(frame) => {
                if frame.shape() != expected {
                    bail!(
                        "frame shape {:?} does not match requested {:?}",
                        frame.shape(),
                        expected
                    );
                }
                let elapsed = started.elapsed();
                timings.record(elapsed, frame.age());
                progress.tick(elapsed);
                consecutive_failures = 0;
            }
            Err(err) => {
                log::warn!("read failed: {:#}", err);
                timings.failures += 1;
                consecutive_failures += 1;
                if consecutive_failures >= max_failures {
                    bail!("{} consecutive reads failed", consecutive_failures);
                }
            }
        }
    }
    progress.finish();
    let interrupted = stop.load(Ordering::SeqCst);

    let report = {
        let _stage = ui.stage("Close capture");
        context.close()?
    };

    Ok(RunSummary {
        source: cfg.source.clone(),
        width: cfg.width,
        height: cfg.height,
        latency: cfg.latency,
        frames: timings.frames,
        read_failures: timings.failures,
        mean_read_ms: timings.mean_ms(timings.total_read),
        max_read_ms: timings.max_read.as_secs_f64() * 1000.0,
        mean_frame_age_ms: timings.mean_ms(timings.total_age),
        interrupted,
        context: report,
    })
}

fn run_cycles(ui: &Ui, settings: &CaptureSettings, cycles: u32) -> Result<CycleSummary> {
    let mut results = Vec::with_capacity(cycles as usize);
    for cycle in 0..cycles {
        let mut cfg = settings.capture.clone();
        cfg.latency = LatencyMode::from_low_latency(cycle % 2 == 0);
        let _stage = ui.stage(&format!("Cycle {} ({})", cycle + 1, cfg.latency));

        let context = CaptureContext::open_with(&cfg, settings.drainer)?;
        let handle = context.shared_handle();
        let frame = handle
            .read()
            .with_context(|| format!("cycle {}: read failed", cycle + 1))?;
        let expected = (cfg.height as usize, cfg.width as usize, 3);
        if frame.shape() != expected {
            return Err(anyhow!(
                "cycle {}: frame shape {:?} does not match requested {:?}",
                cycle + 1,
                frame.shape(),
                expected
            ));
        }
        let report = context.close()?;
        let closed_after_exit = !handle.is_opened();
        if !closed_after_exit {
            bail!("cycle {}: handle still open after close", cycle + 1);
        }

        results.push(CycleResult {
            cycle: cycle + 1,
            latency: cfg.latency,
            shape: frame.shape(),
            closed_after_exit,
            drain: report.drain,
        });
    }
    Ok(CycleSummary {
        source: settings.capture.source.clone(),
        cycles: results,
    })
}
