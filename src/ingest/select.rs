//! Backend selection.
//!
//! `candidates_for` turns a device identifier into an ordered candidate list;
//! `select_backend` opens candidates in order and returns the first success.
//! Every failed candidate is recorded, so a caller sees exactly which variants
//! were tried and why each one was rejected. No retries happen here.

use super::libcamera::LibcameraBackend;
use super::rpicam::{find_executable, RpicamBackend, UTILITY_NAMES};
use super::stub::{StubBackend, STUB_SCHEME};
use super::v4l2::{V4l2Backend, DEFAULT_DEVICES};
use super::CameraBackend;
use crate::error::{BackendOpenError, OpenFailure};
use crate::settings::Settings;

/// Identifiers that prefer the subprocess MJPEG utilities.
const UTILITY_ALIASES: [&str; 4] = ["rpicam", "rpicam-vid", "libcamera", "libcamera-vid"];
/// Identifiers that name the vendor camera stack directly.
const VENDOR_ALIASES: [&str; 4] = ["picamera2", "csi", "ov5647", "libcamerasrc"];

/// One entry in the ordered selection list.
pub enum Candidate {
    /// A constructed backend waiting to be opened.
    Backend(Box<dyn CameraBackend>),
    /// A candidate rejected before construction (e.g. executable not on PATH).
    Unavailable(OpenFailure),
}

impl Candidate {
    pub fn backend<B: CameraBackend + 'static>(backend: B) -> Self {
        Self::Backend(Box::new(backend))
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Backend(backend) => backend.name(),
            Self::Unavailable(failure) => &failure.candidate,
        }
    }
}

/// The opened backend plus the candidates that failed before it.
pub struct Selected {
    pub backend: Box<dyn CameraBackend>,
    pub skipped: Vec<OpenFailure>,
}

impl std::fmt::Debug for Selected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selected")
            .field("backend", &self.backend.name())
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// Open candidates in order; the first success wins.
pub fn select_backend(
    device: &str,
    candidates: Vec<Candidate>,
) -> Result<Selected, BackendOpenError> {
    let mut failures = Vec::new();
    for candidate in candidates {
        match candidate {
            Candidate::Unavailable(failure) => failures.push(failure),
            Candidate::Backend(mut backend) => match backend.open() {
                Ok(()) => {
                    if !failures.is_empty() {
                        log::info!(
                            "select_backend: opened {} after {} failed candidate(s)",
                            backend.name(),
                            failures.len()
                        );
                    }
                    return Ok(Selected {
                        backend,
                        skipped: failures,
                    });
                }
                Err(err) => {
                    let label = backend.name().to_string();
                    backend.close();
                    failures.push(OpenFailure::new(label, format!("{:#}", err)));
                }
            },
        }
    }
    Err(BackendOpenError {
        device: device.to_string(),
        attempts: failures,
    })
}

/// Build the ordered candidate list for the configured device identifier.
pub fn candidates_for(settings: &Settings) -> Vec<Candidate> {
    let raw = settings.device.trim();
    let raw = if raw.is_empty() { "rpicam" } else { raw };
    let lowered = raw.to_lowercase();

    if lowered.starts_with(STUB_SCHEME) {
        return vec![Candidate::backend(StubBackend::new(settings))];
    }

    let is_auto = lowered == "auto";
    let is_utility = UTILITY_ALIASES.contains(&lowered.as_str());
    let is_vendor = VENDOR_ALIASES.contains(&lowered.as_str());

    let mut candidates = Vec::new();
    if is_auto || is_utility {
        let preferred = is_utility.then_some(raw);
        candidates.extend(utility_candidates(preferred, settings));
    }
    if is_auto || is_utility || is_vendor {
        candidates.push(Candidate::backend(LibcameraBackend::new(settings)));
    }

    let grabber_devices: Vec<&str> = if is_auto || is_utility || is_vendor {
        DEFAULT_DEVICES.to_vec()
    } else {
        vec![raw]
    };
    candidates.extend(
        grabber_devices
            .into_iter()
            .map(|device| Candidate::backend(V4l2Backend::new(device, settings))),
    );
    candidates
}

fn utility_candidates(preferred: Option<&str>, settings: &Settings) -> Vec<Candidate> {
    let mut names: Vec<&str> = Vec::new();
    // Bare aliases (`rpicam`, `libcamera`) are not executables themselves.
    if let Some(name) = preferred.filter(|name| name.ends_with("-vid") || name.contains('/')) {
        names.push(name);
    }
    for name in UTILITY_NAMES {
        if !names.contains(&name) {
            names.push(name);
        }
    }

    names
        .into_iter()
        .map(|name| match find_executable(name) {
            Some(path) => Candidate::backend(RpicamBackend::new(path, settings)),
            None => Candidate::Unavailable(OpenFailure::new(name, "executable not found")),
        })
        .collect()
}
