//! Subprocess MJPEG backend.
//!
//! Spawns `rpicam-vid` (or `libcamera-vid`) with MJPEG output on stdout and cuts
//! frames out of the pipe with `MjpegFramer`. Reads are bounded: each wait on the
//! pipe lasts at most `READ_POLL_WINDOW`, and a single `read` gives up after
//! `MAX_READ_ATTEMPTS` windows without a complete frame.
//!
//! The child's stderr is drained without blocking so a chatty utility never
//! stalls on a full pipe; its last line is kept for error messages.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::mjpeg::{decode_jpeg, MjpegFramer};
use super::CameraBackend;
use crate::frame::Frame;
use crate::settings::Settings;

/// Well-known camera utilities, in preference order.
pub const UTILITY_NAMES: [&str; 2] = ["rpicam-vid", "libcamera-vid"];

const READ_POLL_WINDOW: Duration = Duration::from_millis(900);
const MAX_READ_ATTEMPTS: usize = 8;
const STARTUP_SETTLE: Duration = Duration::from_millis(80);
const TERMINATE_GRACE: Duration = Duration::from_millis(1200);
const KILL_GRACE: Duration = Duration::from_millis(800);
const CHUNK_BYTES: usize = 64 * 1024;

pub struct RpicamBackend {
    name: String,
    executable: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    framer: MjpegFramer,
    last_stderr: String,
    stop: Option<Arc<AtomicBool>>,
}

impl RpicamBackend {
    pub fn new(executable: PathBuf, settings: &Settings) -> Self {
        let file_name = executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());
        Self {
            name: format!("rpicam:{}", file_name),
            executable,
            width: settings.frame_width.max(1),
            height: settings.frame_height.max(1),
            fps: settings.capture_fps.max(1),
            child: None,
            stdout: None,
            stderr: None,
            framer: MjpegFramer::new(),
            last_stderr: String::new(),
            stop: None,
        }
    }

    fn command_args(&self) -> Vec<String> {
        vec![
            "--timeout".into(),
            "0".into(),
            "--nopreview".into(),
            "--codec".into(),
            "mjpeg".into(),
            "--width".into(),
            self.width.to_string(),
            "--height".into(),
            self.height.to_string(),
            "--framerate".into(),
            self.fps.to_string(),
            "-o".into(),
            "-".into(),
        ]
    }

    fn child_exited(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => false,
            Some(Ok(Some(_))) | Some(Err(_)) | None => true,
        }
    }

    fn drain_stderr(&mut self) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 4096];
        for _ in 0..4 {
            match wait_readable(&*stderr, Duration::ZERO) {
                Ok(true) => {}
                _ => break,
            }
            match stderr.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let text = String::from_utf8_lossy(&chunk[..read]);
                    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
                        log::debug!("RpicamBackend: {}: {}", self.name, line);
                        self.last_stderr = line.to_string();
                    }
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::SeqCst))
    }

    fn exit_error(&self, context: &str) -> anyhow::Error {
        if self.last_stderr.is_empty() {
            anyhow!("{}", context)
        } else {
            anyhow!("{} ({})", context, self.last_stderr)
        }
    }
}

impl CameraBackend for RpicamBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        self.close();
        let mut child = Command::new(&self.executable)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.executable.display()))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("failed to open rpicam stream pipe"));
        };
        self.child = Some(child);
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.framer.clear();
        self.last_stderr.clear();

        std::thread::sleep(STARTUP_SETTLE);
        self.drain_stderr();
        if self.child_exited() {
            let err = self.exit_error("rpicam process exited during startup");
            self.close();
            return Err(err);
        }

        log::info!(
            "RpicamBackend: started {} ({}x{} @ {} fps)",
            self.executable.display(),
            self.width,
            self.height,
            self.fps
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        if self.stdout.is_none() {
            return Err(anyhow!("rpicam backend not opened"));
        }
        if self.child_exited() {
            return Err(self.exit_error("rpicam process exited"));
        }

        let mut chunk = vec![0u8; CHUNK_BYTES];
        for _ in 0..MAX_READ_ATTEMPTS {
            if let Some(jpeg) = self.framer.next_jpeg() {
                match decode_jpeg(&jpeg) {
                    Ok(image) if image.width() > 0 && image.height() > 0 => {
                        return Ok(Frame::new(image));
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        log::debug!("RpicamBackend: skipping undecodable frame: {:#}", err);
                        continue;
                    }
                }
            }

            if self.stop_requested() {
                return Err(anyhow!("read interrupted by stop"));
            }
            let stdout = self
                .stdout
                .as_mut()
                .ok_or_else(|| anyhow!("rpicam backend not opened"))?;
            let ready = wait_readable(&*stdout, READ_POLL_WINDOW).context("poll rpicam stdout")?;
            if !ready {
                if self.child_exited() {
                    return Err(self.exit_error("rpicam process exited"));
                }
                self.drain_stderr();
                continue;
            }

            let read = stdout.read(&mut chunk).context("read rpicam stdout")?;
            if read == 0 {
                break;
            }
            self.framer.push(&chunk[..read]);
            self.drain_stderr();
        }

        Err(self.exit_error("no complete mjpeg frame from rpicam stream"))
    }

    fn watch_stop(&mut self, stop: Arc<AtomicBool>) {
        self.stop = Some(stop);
    }

    fn close(&mut self) {
        self.stdout = None;
        self.stderr = None;
        self.framer.clear();
        let Some(mut child) = self.child.take() else {
            return;
        };

        terminate(&child);
        if wait_with_deadline(&mut child, TERMINATE_GRACE) {
            return;
        }
        let _ = child.kill();
        if !wait_with_deadline(&mut child, KILL_GRACE) {
            log::warn!("RpicamBackend: {} did not exit after kill", self.name);
        }
    }
}

impl Drop for RpicamBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve an executable name against `PATH`. Names containing a path
/// separator are returned as-is when they point at a file.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if name.contains(std::path::MAIN_SEPARATOR) {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn terminate(child: &Child) {
    // SIGTERM first so the utility can release the camera cleanly.
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

fn wait_with_deadline(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(None) | Err(_) => return false,
        }
    }
}

#[cfg(unix)]
fn wait_readable<F: std::os::unix::io::AsRawFd>(file: &F, timeout: Duration) -> std::io::Result<bool> {
    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let rc = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    // POLLHUP counts as readable: the following read returns 0 (EOF).
    Ok(rc > 0 && fds.revents & (libc::POLLIN | libc::POLLHUP) != 0)
}

#[cfg(not(unix))]
fn wait_readable<F>(_file: &F, _timeout: Duration) -> std::io::Result<bool> {
    Ok(true)
}
