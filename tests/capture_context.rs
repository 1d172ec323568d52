//! Capture context lifecycle tests.
//!
//! Runs against the synthetic `stub://` sensor: frame shape, release-then-join
//! teardown on every exit path, drainer presence per latency mode, freshness,
//! and repeated open/close cycles.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use csi_capture::{
    with_capture, CaptureConfig, CaptureContext, CaptureHandle, CaptureStats, ContextState,
    CsiCapture, DrainerConfig, Frame, LatencyMode,
};

fn stub_config(width: u32, height: u32, low_latency: bool) -> CaptureConfig {
    CaptureConfig::new(width, height, low_latency).with_source("stub://front_camera")
}

fn stub_config_at(fps: u32, low_latency: bool) -> CaptureConfig {
    CaptureConfig {
        synthetic_fps: fps,
        ..stub_config(64, 48, low_latency)
    }
}

/// Grab attempts must stop changing once the context is gone.
fn assert_no_drain_activity<H: CaptureHandle>(handle: &H) {
    let settled = handle.stats().grab_attempts;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        handle.stats().grab_attempts,
        settled,
        "discards continued after teardown"
    );
}

#[test]
fn read_returns_frames_of_requested_shape() -> Result<()> {
    for (width, height) in [(640, 480), (320, 240), (33, 17)] {
        for low_latency in [true, false] {
            let frame = with_capture(&stub_config(width, height, low_latency), |cap| {
                assert!(cap.is_opened());
                cap.read()
            })?;
            assert_eq!(frame.shape(), (height as usize, width as usize, 3));
            assert_eq!(frame.as_bytes().len(), (width * height * 3) as usize);
        }
    }
    Ok(())
}

#[test]
fn handle_is_closed_and_drainer_gone_after_scope() -> Result<()> {
    let context = CaptureContext::open(&stub_config(640, 480, true))?;
    assert_eq!(context.state(), ContextState::OpenDraining);
    let handle = context.shared_handle();
    assert!(handle.is_opened());
    handle.read()?;

    let report = context.close()?;
    assert!(!handle.is_opened());
    assert!(report.drain.is_some());
    assert_no_drain_activity(handle.as_ref());
    Ok(())
}

#[test]
fn repeated_cycles_alternating_latency_modes() -> Result<()> {
    for i in 0..10 {
        let low_latency = i % 2 == 0;
        let context = CaptureContext::open(&stub_config(640, 480, low_latency))?;
        let handle = context.shared_handle();
        assert_eq!(context.is_draining(), low_latency);

        let frame = handle.read()?;
        assert_eq!(frame.shape(), (480, 640, 3));

        let report = context.close()?;
        assert!(!handle.is_opened(), "cycle {} left handle open", i);
        assert_eq!(report.drain.is_some(), low_latency);
        assert_no_drain_activity(handle.as_ref());
        assert_eq!(Arc::strong_count(&handle), 1);
    }
    Ok(())
}

#[test]
fn high_quality_mode_never_discards() -> Result<()> {
    let context = CaptureContext::open(&stub_config_at(50, false))?;
    let handle = context.shared_handle();
    std::thread::sleep(Duration::from_millis(200));

    // The queued exposure from open time is still there: stale, but immediate.
    let frame = handle.read()?;
    assert_eq!(frame.sequence, 0);
    assert!(frame.age() >= Duration::from_millis(200));

    context.close()?;
    assert_eq!(handle.stats().grab_attempts, 0);
    assert_eq!(handle.stats().frames_discarded, 0);
    Ok(())
}

#[test]
fn low_latency_mode_serves_fresh_frames() -> Result<()> {
    let context = CaptureContext::open(&stub_config_at(20, true))?;
    let handle = context.shared_handle();
    std::thread::sleep(Duration::from_millis(200));

    let frame = handle.read()?;
    assert!(frame.sequence >= 4, "sequence {}", frame.sequence);
    assert!(
        frame.age() < Duration::from_millis(100),
        "frame age {:?}",
        frame.age()
    );

    context.close()?;
    assert!(handle.stats().frames_discarded > 0);
    Ok(())
}

#[test]
fn reads_never_fail_while_drainer_runs() -> Result<()> {
    let context = CaptureContext::open(&stub_config_at(100, true))?;
    let handle = context.shared_handle();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || -> Result<u64> {
                let mut last = 0;
                for _ in 0..20 {
                    let frame = handle.read()?;
                    assert!(frame.sequence >= last);
                    last = frame.sequence;
                }
                Ok(last)
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader thread")?;
    }

    assert!(handle.is_opened());
    assert_eq!(handle.stats().read_failures, 0);
    assert_eq!(handle.stats().frames_read, 40);
    context.close()?;
    Ok(())
}

#[test]
fn early_error_return_still_releases() {
    fn fails_inside_scope(config: &CaptureConfig, seen: &mut Option<Arc<CsiCapture>>) -> Result<()> {
        let context = CaptureContext::open(config)?;
        *seen = Some(context.shared_handle());
        context.handle().read()?;
        anyhow::bail!("caller gave up")
    }

    let mut seen = None;
    let err = fails_inside_scope(&stub_config(64, 48, true), &mut seen).unwrap_err();
    assert_eq!(err.to_string(), "caller gave up");

    let handle = seen.expect("scope opened a handle");
    assert!(!handle.is_opened());
    assert_no_drain_activity(handle.as_ref());
    assert_eq!(Arc::strong_count(&handle), 1);
}

#[test]
fn panic_inside_scope_still_releases_and_joins() -> Result<()> {
    let context = CaptureContext::open(&stub_config(64, 48, true))?;
    let handle = context.shared_handle();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _context = context;
        panic!("frame consumer crashed");
    }));
    assert!(outcome.is_err());
    assert!(!handle.is_opened());
    assert_no_drain_activity(handle.as_ref());
    assert_eq!(Arc::strong_count(&handle), 1);
    Ok(())
}

#[test]
fn failed_open_is_observed_not_raised() -> Result<()> {
    let result = with_capture(&stub_config(64, 48, true).with_source("stub://busy"), |cap| {
        assert!(!cap.is_opened());
        Ok(cap.read().is_err())
    })?;
    assert!(result);

    let zero = with_capture(&stub_config(0, 48, false), |cap| Ok(cap.is_opened()))?;
    assert!(!zero);
    Ok(())
}

// ----------------------------------------------------------------------------
// Release while the drainer is inside an iteration
// ----------------------------------------------------------------------------

/// Handle whose discards take long enough to be caught mid-iteration.
#[derive(Default)]
struct SlowDiscardHandle {
    closed: AtomicBool,
    in_grab: AtomicBool,
    grabs: AtomicU64,
}

impl CaptureHandle for SlowDiscardHandle {
    fn is_opened(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<Frame> {
        Frame::from_bgr(vec![0u8; 3], 1, 1, 0)
    }

    fn grab(&self) -> bool {
        self.in_grab.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        self.grabs.fetch_add(1, Ordering::SeqCst);
        self.in_grab.store(false, Ordering::SeqCst);
        true
    }

    fn release(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            grab_attempts: self.grabs.load(Ordering::SeqCst),
            ..CaptureStats::default()
        }
    }
}

#[test]
fn release_mid_iteration_waits_for_drainer_exit() -> Result<()> {
    let context = CaptureContext::with_handle(
        SlowDiscardHandle::default(),
        LatencyMode::LowLatency,
        DrainerConfig::default(),
    )?;
    let handle = context.shared_handle();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.in_grab.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert!(handle.in_grab.load(Ordering::SeqCst));

    let report = context.close()?;
    assert!(!handle.in_grab.load(Ordering::SeqCst));
    let drain = report.drain.expect("drainer ran");
    assert!(drain.iterations >= 1);
    assert_eq!(drain.frames_discarded, handle.grabs.load(Ordering::SeqCst));
    assert_no_drain_activity(handle.as_ref());
    assert_eq!(Arc::strong_count(&handle), 1);
    Ok(())
}
