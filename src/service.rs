//! Capture service: the long-lived camera loop and its controls.
//!
//! One `capture-loop` thread per running service owns the camera backend and
//! the recorder, and drives read → normalize → publish → record. Every other
//! thread talks to it through the shared state:
//!
//! - `wait_latest` / `wait_next` block on the frame condvar for preview bytes
//! - `status` reads a snapshot and never waits for a frame
//! - `reconfigure` swaps the settings and restarts the loop only on a change
//!
//! Failures never end the loop. A backend that cannot be opened is retried
//! every second; a read failure closes the backend and the open segment and
//! reopens after a short pause. Only `stop` ends the thread.

use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::CaptureError;
use crate::ingest::{candidates_for, normalize_frame, select_backend, CameraBackend};
use crate::publish::StreamPublisher;
use crate::record::{self, Recorder};
use crate::settings::Settings;
use crate::shared::{Shared, SharedState};
use crate::status::{LoopPhase, LoopStatus, StatusSnapshot};

/// Pause before retrying after no backend could be opened.
pub const OPEN_RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Pause before reopening after a read failure.
pub const READ_RETRY_BACKOFF: Duration = Duration::from_millis(400);
/// How long `stop` waits for the loop thread before detaching it.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(4);

const SLEEP_SLICE: Duration = Duration::from_millis(25);

struct Worker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }
}

#[derive(Default)]
struct Control {
    worker: Option<Worker>,
    /// Loop thread a timed-out stop left behind. It still owns its backend and
    /// segment, so no new loop starts until it has exited.
    draining: Option<JoinHandle<()>>,
}

impl Control {
    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_alive)
    }

    /// Reap the draining thread, waiting up to `timeout` for it.
    fn wait_drained(&mut self, timeout: Duration) -> Result<(), CaptureError> {
        let Some(join) = self.draining.take() else {
            return Ok(());
        };
        if !exits_within(&join, timeout) {
            self.draining = Some(join);
            return Err(CaptureError::LoopStillRunning {
                waited_ms: timeout.as_millis(),
            });
        }
        reap(join);
        log::info!("CaptureService: previous capture loop exited");
        Ok(())
    }
}

pub struct CaptureService {
    shared: Arc<Shared>,
    /// Serializes start/stop/reconfigure. Taken before the state lock, never after.
    control: Mutex<Control>,
}

impl CaptureService {
    pub fn new(settings: Settings) -> Self {
        Self {
            shared: Arc::new(Shared::new(settings)),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn settings(&self) -> Settings {
        self.shared.lock().settings.clone()
    }

    pub fn is_running(&self) -> bool {
        self.control().is_running()
    }

    /// Spawn the capture loop. No-op when it is already running.
    ///
    /// A loop left behind by a timed-out `stop` is waited for (bounded) first;
    /// if it still has not exited, `LoopStillRunning` is returned and nothing
    /// is spawned.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut control = self.control();
        self.start_locked(&mut control)
    }

    /// Stop the capture loop and wait (bounded) for it to release the camera.
    /// Idempotent.
    pub fn stop(&self) {
        let mut control = self.control();
        self.stop_locked(&mut control);
    }

    /// Swap in new settings. A running loop is restarted only when they differ.
    pub fn reconfigure(&self, settings: Settings) -> Result<(), CaptureError> {
        let mut control = self.control();
        let changed = {
            let mut state = self.shared.lock();
            if state.settings == settings {
                false
            } else {
                state.settings = settings;
                true
            }
        };
        if !changed {
            return Ok(());
        }
        if control.is_running() {
            log::info!("CaptureService: settings changed, restarting capture loop");
            self.stop_locked(&mut control);
            self.start_locked(&mut control)?;
        }
        Ok(())
    }

    /// Current JPEG, or wait once up to `timeout` for the first one.
    pub fn wait_latest(&self, timeout: Duration) -> Option<Arc<[u8]>> {
        self.shared.wait_latest(timeout)
    }

    /// Wait for a frame newer than `last_seen`. Returns the latest sequence and bytes.
    pub fn wait_next(&self, last_seen: u64, timeout: Duration) -> (u64, Option<Arc<[u8]>>) {
        self.shared.wait_next(last_seen, timeout)
    }

    pub fn status(&self) -> StatusSnapshot {
        let mut snapshot = {
            let state = self.shared.lock();
            let settings = &state.settings;
            let status = &state.status;
            let segment = state.segment.as_ref();
            StatusSnapshot {
                running: status.phase != LoopPhase::Stopped,
                phase: status.phase,
                camera_opened: status.camera_opened,
                backend: status.backend.clone(),
                status: status.text.clone(),
                last_error: status.last_error.clone(),
                error_count: status.error_count,
                latest_sequence: state.published.sequence,
                latest_frame_at: state.published.captured_at,
                frame_width: state.published.width,
                frame_height: state.published.height,
                stream_fps: settings.stream_fps,
                recording_enabled: settings.record_enabled,
                recording_active: segment.is_some(),
                current_record_path: segment.map(|s| s.video_path.clone()),
                current_frame_log_path: segment.map(|s| s.frame_log_path.clone()),
                current_written_frames: segment.map_or(0, |s| s.written_frames),
                record_fps: settings.record_fps,
                record_segment_seconds: settings.segment_duration.as_secs(),
                record_output_dir: settings.output_dir.clone(),
                record_max_storage_bytes: settings.max_storage_bytes,
                stored_files: 0,
                stored_bytes: 0,
            }
        };
        // Directory scan happens outside the state lock.
        let (files, bytes) = record::scan(&snapshot.record_output_dir);
        snapshot.stored_files = files;
        snapshot.stored_bytes = bytes;
        snapshot
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_locked(&self, control: &mut Control) -> Result<(), CaptureError> {
        if control.is_running() {
            return Ok(());
        }
        if let Some(finished) = control.worker.take() {
            reap(finished.join);
        }
        control.wait_drained(STOP_JOIN_TIMEOUT)?;

        let stop = Arc::new(AtomicBool::new(false));
        let run_id = {
            let mut state = self.shared.lock();
            state.run_id = state.run_id.wrapping_add(1);
            state.status.phase = LoopPhase::Starting;
            state.status.text = "starting".to_string();
            state.run_id
        };

        let shared = Arc::clone(&self.shared);
        let stop_thread = Arc::clone(&stop);
        let spawned = std::thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || run_loop(shared, stop_thread, run_id));
        match spawned {
            Ok(join) => {
                control.worker = Some(Worker { stop, join });
                Ok(())
            }
            Err(err) => {
                let mut state = self.shared.lock();
                state.status.fail(LoopPhase::Stopped, "stopped", err.to_string());
                Err(CaptureError::ThreadSpawn(err))
            }
        }
    }

    fn stop_locked(&self, control: &mut Control) {
        if let Some(worker) = control.worker.take() {
            {
                let mut state = self.shared.lock();
                state.status.phase = LoopPhase::Stopping;
                state.status.text = "stopping".to_string();
            }
            worker.stop.store(true, Ordering::SeqCst);
            self.shared.release_waiters();

            if exits_within(&worker.join, STOP_JOIN_TIMEOUT) {
                reap(worker.join);
            } else {
                // The thread still owns the backend; it closes it when its read returns.
                log::warn!(
                    "CaptureService: capture loop did not exit within {:?}; draining",
                    STOP_JOIN_TIMEOUT
                );
                control.draining = Some(worker.join);
            }
        }
        // Reap a previously drained thread that has finished since.
        if control.draining.as_ref().is_some_and(JoinHandle::is_finished) {
            let _ = control.wait_drained(Duration::ZERO);
        }

        let mut state = self.shared.lock();
        state.run_id = state.run_id.wrapping_add(1);
        let error_count = state.status.error_count;
        let last_error = std::mem::take(&mut state.status.last_error);
        state.status = LoopStatus {
            error_count,
            last_error,
            ..LoopStatus::stopped()
        };
        state.segment = None;
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn exits_within(join: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    while !join.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

fn reap(join: JoinHandle<()>) {
    if join.join().is_err() {
        log::error!("CaptureService: capture loop panicked");
    }
}

// ---- loop thread

/// Resources owned by one loop run. Dropping it releases the camera and
/// finalizes the open segment, whichever way the thread exits.
struct LoopRun {
    shared: Arc<Shared>,
    run_id: u64,
    backend: Option<Box<dyn CameraBackend>>,
    recorder: Recorder,
}

impl LoopRun {
    /// Apply `f` to the status unless this run has been superseded.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SharedState),
    {
        let mut state = self.shared.lock();
        if state.run_id == self.run_id {
            f(&mut *state);
        }
    }

    fn close_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            log::info!("CaptureLoop: closed {}", backend.name());
        }
    }

    fn close_segment(&mut self) {
        self.recorder.close(Local::now());
        self.update(|state| state.segment = None);
    }
}

impl Drop for LoopRun {
    fn drop(&mut self) {
        self.close_backend();
        self.close_segment();
        self.update(|state| {
            state.status.phase = LoopPhase::Stopped;
            state.status.text = "stopped".to_string();
            state.status.camera_opened = false;
        });
    }
}

fn run_loop(shared: Arc<Shared>, stop: Arc<AtomicBool>, run_id: u64) {
    let settings = shared.lock().settings.clone();
    log::info!(
        "CaptureLoop: starting device={} {}x{} rotation={} capture_fps={} stream_fps={} record={}",
        settings.device,
        settings.frame_width,
        settings.frame_height,
        settings.rotation.degrees(),
        settings.capture_fps,
        settings.stream_fps,
        settings.record_enabled
    );

    let mut run = LoopRun {
        shared,
        run_id,
        backend: None,
        recorder: Recorder::new(settings.clone()),
    };
    let mut publisher = StreamPublisher::new();
    let mut recorder_failing = false;

    while !stop.load(Ordering::SeqCst) {
        if run.backend.is_none() {
            run.update(|state| {
                state.status.phase = LoopPhase::Starting;
                state.status.text = "starting".to_string();
            });
            match select_backend(&settings.device, candidates_for(&settings)) {
                Ok(selected) => {
                    for skipped in &selected.skipped {
                        log::debug!("CaptureLoop: skipped {}", skipped);
                    }
                    let name = selected.backend.name().to_string();
                    log::info!(
                        "CaptureLoop: camera opened backend={} device={} {}x{} @ {} fps",
                        name,
                        settings.device,
                        settings.frame_width,
                        settings.frame_height,
                        settings.capture_fps
                    );
                    run.update(|state| {
                        state.status.phase = LoopPhase::CameraOpen;
                        state.status.text = "camera opened".to_string();
                        state.status.camera_opened = true;
                        state.status.backend = name;
                        state.status.last_error.clear();
                    });
                    publisher.reset();
                    let mut backend = selected.backend;
                    backend.watch_stop(Arc::clone(&stop));
                    run.backend = Some(backend);
                }
                Err(err) => {
                    let err = CaptureError::from(err);
                    log::warn!(
                        "CaptureLoop: camera open failed device={}: {}",
                        settings.device,
                        err
                    );
                    run.close_segment();
                    run.update(|state| {
                        state.status.camera_opened = false;
                        state
                            .status
                            .fail(LoopPhase::Starting, "camera open failed", err.to_string());
                    });
                    sleep_unless_stopped(&stop, OPEN_RETRY_BACKOFF);
                }
            }
            continue;
        }
        let Some(backend) = run.backend.as_mut() else {
            continue;
        };

        let read = backend
            .read()
            .and_then(|frame| {
                if frame.is_empty() {
                    anyhow::bail!("empty frame");
                }
                Ok(frame)
            });
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let frame = match read {
            Ok(frame) => frame,
            Err(err) => {
                let err = CaptureError::ReadFailed {
                    backend: backend.name().to_string(),
                    reason: format!("{:#}", err),
                };
                log::warn!("CaptureLoop: {}", err);
                run.close_backend();
                run.close_segment();
                run.update(|state| {
                    state.status.camera_opened = false;
                    state.status.fail(
                        LoopPhase::RecoveringFromReadFailure,
                        "camera read failed",
                        err.to_string(),
                    );
                });
                sleep_unless_stopped(&stop, READ_RETRY_BACKOFF);
                continue;
            }
        };

        let captured_at = frame.captured_at;
        let now = frame.captured_instant;
        let image = normalize_frame(
            frame.image,
            settings.frame_width,
            settings.frame_height,
            settings.rotation,
        );

        if let Err(err) =
            publisher.publish(&run.shared, &image, captured_at, now, settings.stream_interval())
        {
            log::warn!("CaptureLoop: publishing frame failed: {:#}", err);
        }

        let was_open = run.recorder.is_open();
        match run.recorder.record(&image, captured_at, now) {
            Ok(_) => {
                if recorder_failing {
                    log::info!("CaptureLoop: recording resumed");
                    recorder_failing = false;
                }
                let segment = run.recorder.active_segment();
                let opened = !was_open && segment.is_some();
                run.update(|state| {
                    if opened {
                        state.status.text = "recording".to_string();
                        state.status.last_error.clear();
                    }
                    state.segment = segment;
                });
            }
            Err(err) => {
                if recorder_failing {
                    log::debug!("CaptureLoop: {}", err);
                } else {
                    log::warn!("CaptureLoop: {}", err);
                    recorder_failing = true;
                }
                let text = match err {
                    CaptureError::RecorderWrite { .. } => "recording write failed",
                    _ => "recording open failed",
                };
                run.update(|state| {
                    state.segment = None;
                    state.status.fail(LoopPhase::CameraOpen, text, err.to_string());
                });
            }
        }
    }
    log::info!("CaptureLoop: stopping");
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn stub_settings(device: &str, dir: &Path) -> Settings {
        Settings {
            device: device.to_string(),
            frame_width: 32,
            frame_height: 24,
            capture_fps: 20,
            stream_fps: 10,
            record_enabled: false,
            output_dir: dir.to_path_buf(),
            codec: "mjpg".to_string(),
            ..Settings::default()
        }
    }

    fn wait_for<F: Fn(&StatusSnapshot) -> bool>(service: &CaptureService, check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check(&service.status()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn start_publishes_frames_and_stop_resets_status() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = CaptureService::new(stub_settings("stub://unit", dir.path()));
        service.start()?;
        service.start()?;
        assert!(service.is_running());

        let (sequence, jpeg) = service.wait_next(0, Duration::from_secs(5));
        assert!(sequence >= 1);
        assert!(jpeg.is_some());
        assert!(wait_for(&service, |s| s.camera_opened && s.backend == "stub:unit"));

        service.stop();
        service.stop();
        let status = service.status();
        assert!(!status.running);
        assert!(!status.camera_opened);
        assert!(!status.recording_active);
        assert_eq!(status.phase, LoopPhase::Stopped);
        Ok(())
    }

    #[test]
    fn open_failures_are_counted_and_retried() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = CaptureService::new(stub_settings("stub://cam?fail-open", dir.path()));
        service.start()?;
        assert!(wait_for(&service, |s| s.error_count >= 2));
        let status = service.status();
        assert!(!status.camera_opened);
        assert_eq!(status.status, "camera open failed");
        assert!(status.last_error.contains("synthetic open failure"));
        service.stop();
        Ok(())
    }

    #[test]
    fn stop_is_prompt_during_open_backoff() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = CaptureService::new(stub_settings("stub://cam?fail-open", dir.path()));
        service.start()?;
        assert!(wait_for(&service, |s| s.error_count >= 1));
        let started = Instant::now();
        service.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    fn gated_thread(gate: &Arc<AtomicBool>) -> JoinHandle<()> {
        let gate = Arc::clone(gate);
        std::thread::spawn(move || {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    }

    #[test]
    fn draining_thread_blocks_until_it_exits() -> anyhow::Result<()> {
        let gate = Arc::new(AtomicBool::new(false));
        let mut control = Control {
            draining: Some(gated_thread(&gate)),
            ..Control::default()
        };
        let err = control
            .wait_drained(Duration::from_millis(50))
            .expect_err("thread is still running");
        assert!(matches!(err, CaptureError::LoopStillRunning { waited_ms: 50 }));
        assert!(control.draining.is_some());

        gate.store(true, Ordering::SeqCst);
        control.wait_drained(Duration::from_secs(2))?;
        assert!(control.draining.is_none());
        Ok(())
    }

    #[test]
    fn start_waits_for_a_draining_loop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = CaptureService::new(stub_settings("stub://after-drain", dir.path()));
        let gate = Arc::new(AtomicBool::new(false));
        service.control().draining = Some(gated_thread(&gate));

        let opener = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                gate.store(true, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        service.start()?;
        assert!(started.elapsed() >= Duration::from_millis(250));
        opener.join().expect("opener thread");
        assert!(service.control().draining.is_none());
        assert!(service.is_running());
        service.stop();
        Ok(())
    }

    #[test]
    fn reconfigure_with_equal_settings_keeps_the_loop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = stub_settings("stub://same", dir.path());
        let service = CaptureService::new(settings.clone());
        service.start()?;
        let (before, _) = service.wait_next(0, Duration::from_secs(5));
        service.reconfigure(settings.clone())?;
        let (after, _) = service.wait_next(before, Duration::from_secs(5));
        assert!(after > before);
        assert_eq!(service.settings(), settings);
        service.stop();
        Ok(())
    }
}
