use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::{Rgb, RgbImage};

use cage_capture::publish::encode_jpeg;
use cage_capture::record::encoder::RECORD_JPEG_QUALITY;
use cage_capture::record::scan;
use cage_capture::{CaptureService, LoopPhase, SegmentMeta, Settings, StatusSnapshot, MANIFEST_FILE};

fn stub_settings(device: &str, dir: &Path) -> Settings {
    Settings {
        device: device.to_string(),
        frame_width: 64,
        frame_height: 48,
        capture_fps: 30,
        stream_fps: 10,
        record_enabled: true,
        record_fps: 5,
        segment_duration: Duration::from_secs(1),
        output_dir: dir.to_path_buf(),
        codec: "mjpg".to_string(),
        max_storage_bytes: 0,
        ..Settings::default()
    }
}

fn read_manifest(dir: &Path) -> Result<Vec<SegmentMeta>> {
    let raw = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

fn wait_for(service: &CaptureService, check: impl Fn(&StatusSnapshot) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check(&service.status()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Upper bound for one 1 s segment of synthetic 64x48 frames at 5 fps.
fn estimated_segment_bytes() -> Result<u64> {
    let frame = RgbImage::from_fn(64, 48, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let jpeg = encode_jpeg(&frame, RECORD_JPEG_QUALITY)?;
    // Up to 6 frames per segment plus headroom for content variation.
    Ok(jpeg.len() as u64 * 7 * 5 / 4)
}

#[test]
fn records_rotating_segments_under_quota() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let segment_bytes = estimated_segment_bytes()?;
    let quota = segment_bytes * 2;
    let service = CaptureService::new(Settings {
        max_storage_bytes: quota,
        ..stub_settings("stub://e2e", dir.path())
    });

    service.start()?;
    std::thread::sleep(Duration::from_millis(3500));
    let running = service.status();
    assert!(running.running);
    assert!(running.camera_opened);
    assert!(running.recording_active);
    assert!(running.latest_sequence > 0);
    service.stop();

    let segments = read_manifest(dir.path())?;
    assert!(segments.len() >= 3, "only {} segments closed", segments.len());
    for meta in &segments {
        assert!(meta.written_frames > 0);
        assert!(
            meta.frame_time_matched,
            "{} drifted: drift_ms={} max_sync_ms={}",
            meta.video_path.display(),
            meta.timeline_drift_ms,
            meta.max_abs_sync_error_ms
        );
    }
    let mut paths: Vec<_> = segments.iter().map(|meta| meta.video_path.clone()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), segments.len());

    let (_, stored_bytes) = scan(dir.path());
    assert!(
        stored_bytes <= quota + segment_bytes,
        "stored {} bytes with quota {}",
        stored_bytes,
        quota
    );

    let stopped = service.status();
    assert!(!stopped.running);
    assert!(!stopped.recording_active);
    assert_eq!(stopped.current_record_path, None);
    Ok(())
}

#[test]
fn recovers_from_read_failures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let service = CaptureService::new(stub_settings("stub://flaky?fail-read-after=5", dir.path()));
    service.start()?;

    assert!(wait_for(&service, |s| s.error_count >= 2));
    let status = service.status();
    assert!(status.last_error.contains("synthetic read failure"));

    // Frames keep flowing after every reopen.
    let (before, _) = service.wait_next(0, Duration::from_secs(5));
    let (after, _) = service.wait_next(before, Duration::from_secs(5));
    assert!(after > before);
    service.stop();

    // Each failure finalized the open segment.
    assert!(read_manifest(dir.path())?.len() >= 2);
    Ok(())
}

#[test]
fn stop_is_idempotent_and_writes_no_duplicate_manifest_lines() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let service = CaptureService::new(Settings {
        segment_duration: Duration::from_secs(60),
        ..stub_settings("stub://once", dir.path())
    });
    service.start()?;
    assert!(wait_for(&service, |s| s.current_written_frames >= 2));
    service.stop();
    service.stop();
    drop(service);

    let segments = read_manifest(dir.path())?;
    assert_eq!(segments.len(), 1);
    Ok(())
}

#[test]
fn stop_releases_blocked_frame_waiters() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let service = Arc::new(CaptureService::new(stub_settings(
        "stub://dead?fail-open",
        dir.path(),
    )));
    service.start()?;

    let waiter = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || {
            let started = Instant::now();
            let (sequence, jpeg) = service.wait_next(0, Duration::from_secs(30));
            (sequence, jpeg.is_some(), started.elapsed())
        })
    };
    std::thread::sleep(Duration::from_millis(100));
    service.stop();

    let (sequence, has_jpeg, waited) = waiter.join().expect("waiter thread");
    assert_eq!(sequence, 0);
    assert!(!has_jpeg);
    assert!(waited < Duration::from_secs(5));
    Ok(())
}

#[test]
fn reconfigure_restarts_only_on_change() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = Settings {
        record_enabled: false,
        ..stub_settings("stub://first", dir.path())
    };
    let service = CaptureService::new(first.clone());
    service.start()?;
    assert!(wait_for(&service, |s| s.backend == "stub:first"));
    let (sequence, _) = service.wait_next(0, Duration::from_secs(5));

    let second = Settings {
        device: "stub://second".to_string(),
        ..first.clone()
    };
    service.reconfigure(second.clone())?;
    assert!(service.is_running());
    assert!(wait_for(&service, |s| s.backend == "stub:second"));
    assert_eq!(service.settings(), second);

    // The sequence keeps increasing across the restart.
    let (after, _) = service.wait_next(sequence, Duration::from_secs(5));
    assert!(after > sequence);
    service.stop();

    // Reconfiguring a stopped service only swaps the snapshot.
    service.reconfigure(first.clone())?;
    assert!(!service.is_running());
    assert_eq!(service.settings(), first);
    Ok(())
}

#[test]
fn status_while_stopped_reports_stored_segments() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("loop_20240101_000000_000.mp4"), vec![0u8; 1234])?;
    std::fs::write(dir.path().join("loop_20240101_000500_000.mjpeg"), vec![0u8; 66])?;
    std::fs::write(dir.path().join("loop_20240101_000000_000.mp4.meta.json"), b"{}")?;

    let service = CaptureService::new(stub_settings("stub://idle", dir.path()));
    let status = service.status();
    assert!(!status.running);
    assert_eq!(status.phase, LoopPhase::Stopped);
    assert_eq!(status.status, "stopped");
    assert_eq!(status.latest_sequence, 0);
    assert_eq!(status.latest_frame_at, None);
    assert_eq!(status.stored_files, 2);
    assert_eq!(status.stored_bytes, 1300);
    assert_eq!(status.record_segment_seconds, 1);

    let json = serde_json::to_value(&status)?;
    assert_eq!(json["phase"], "stopped");
    assert!(service.wait_latest(Duration::from_millis(20)).is_none());
    Ok(())
}

#[cfg(unix)]
#[test]
fn restart_never_overlaps_camera_processes() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir()?;
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin)?;
    let pids = dir.path().join("pids");
    // A camera utility that starts but never emits a frame.
    let script = bin.join("rpicam-vid");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho $$ >> '{}'\nexec sleep 30\n", pids.display()),
    )?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
    let path = std::env::var_os("PATH").unwrap_or_default();
    let mut entries = vec![bin.clone()];
    entries.extend(std::env::split_paths(&path));
    std::env::set_var("PATH", std::env::join_paths(entries)?);

    let service = CaptureService::new(Settings {
        record_enabled: false,
        ..stub_settings("rpicam-vid", dir.path())
    });
    service.start()?;
    assert!(wait_for(&service, |s| s.camera_opened));

    let stopping = Instant::now();
    service.stop();
    assert!(
        stopping.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        stopping.elapsed()
    );

    service.start()?;
    assert!(wait_for(&service, |s| s.camera_opened));
    let spawned: Vec<libc::pid_t> = std::fs::read_to_string(&pids)?
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    assert_eq!(spawned.len(), 2, "spawned {:?}", spawned);
    let first_alive = unsafe { libc::kill(spawned[0], 0) } == 0;
    assert!(!first_alive, "first camera process {} still running", spawned[0]);
    service.stop();
    Ok(())
}
