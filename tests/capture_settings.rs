use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use csi_capture::{CaptureSettings, LatencyMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CSI_CAPTURE_CONFIG",
        "CSI_CAPTURE_SOURCE",
        "CSI_CAPTURE_WIDTH",
        "CSI_CAPTURE_HEIGHT",
        "CSI_CAPTURE_LOW_LATENCY",
        "CSI_CAPTURE_READ_TIMEOUT_MS",
        "CSI_CAPTURE_DRAIN_BACKOFF_US",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureSettings::load().expect("load defaults");
    assert_eq!(cfg.capture.source, "csi://0");
    assert_eq!(cfg.capture.width, 640);
    assert_eq!(cfg.capture.height, 480);
    assert_eq!(cfg.capture.latency, LatencyMode::LowLatency);
    assert_eq!(cfg.capture.read_timeout, Duration::from_secs(2));
    assert!(cfg.drainer.idle_backoff.is_zero());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": "stub://bench",
        "width": 1280,
        "height": 720,
        "low_latency": false,
        "read_timeout_ms": 500,
        "synthetic_fps": 60,
        "drainer": {
            "idle_backoff_us": 250
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CSI_CAPTURE_CONFIG", file.path());
    std::env::set_var("CSI_CAPTURE_HEIGHT", "960");
    std::env::set_var("CSI_CAPTURE_LOW_LATENCY", "yes");

    let cfg = CaptureSettings::load().expect("load config");

    assert_eq!(cfg.capture.source, "stub://bench");
    assert_eq!(cfg.capture.width, 1280);
    assert_eq!(cfg.capture.height, 960);
    assert_eq!(cfg.capture.latency, LatencyMode::LowLatency);
    assert_eq!(cfg.capture.read_timeout, Duration::from_millis(500));
    assert_eq!(cfg.capture.synthetic_fps, 60);
    assert_eq!(cfg.drainer.idle_backoff, Duration::from_micros(250));

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CSI_CAPTURE_WIDTH", "wide");
    assert!(CaptureSettings::load().is_err());
    clear_env();

    std::env::set_var("CSI_CAPTURE_HEIGHT", "0");
    let err = CaptureSettings::load().unwrap_err();
    assert!(err.to_string().contains("dimensions must be positive"));
    clear_env();

    std::env::set_var("CSI_CAPTURE_READ_TIMEOUT_MS", "0");
    assert!(CaptureSettings::load().is_err());
    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ \"width\": \"wide\" }").expect("write config");
    std::env::set_var("CSI_CAPTURE_CONFIG", file.path());

    let err = CaptureSettings::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}

#[test]
fn rejects_synthetic_fps_beyond_nanosecond_ticks() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "source": "stub://bench", "synthetic_fps": 2000000000 }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("CSI_CAPTURE_CONFIG", file.path());

    let err = CaptureSettings::load().unwrap_err();
    assert!(err.to_string().contains("synthetic_fps"));

    clear_env();
}
