//! Storage quota enforcement for recorded segments.
//!
//! Only files that look like segments (`loop_*` with a video extension) are
//! counted or deleted. Sidecars travel with their video file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// File-name prefix shared by every recorded segment.
pub const SEGMENT_PREFIX: &str = "loop_";
/// Video extensions the recorder produces.
pub const SEGMENT_EXTENSIONS: [&str; 2] = ["mp4", "mjpeg"];
/// Suffix of the per-frame timing sidecar.
pub const FRAME_LOG_SUFFIX: &str = ".frames.jsonl";
/// Suffix of the per-segment metadata summary.
pub const META_SUFFIX: &str = ".meta.json";

/// Result of one enforcement pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    pub deleted_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Debug)]
struct SegmentFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Sidecar path for a video file (`<video><suffix>`).
pub fn sidecar_path(video: &Path, suffix: &str) -> PathBuf {
    let mut name = video.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn is_segment_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    name.starts_with(SEGMENT_PREFIX) && SEGMENT_EXTENSIONS.contains(&extension)
}

fn list_segments(dir: &Path) -> Vec<SegmentFile> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_segment_file(path))
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            if !meta.is_file() {
                return None;
            }
            Some(SegmentFile {
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            })
        })
        .collect()
}

/// Count and total size of the segments currently on disk.
pub fn scan(dir: &Path) -> (u64, u64) {
    list_segments(dir)
        .iter()
        .fold((0, 0), |(count, bytes), file| (count + 1, bytes + file.size))
}

/// Delete oldest segments until the directory fits in `max_bytes`.
///
/// `current` is never deleted. A zero quota disables pruning. Individual delete
/// failures are logged and skipped.
pub fn enforce_quota(dir: &Path, max_bytes: u64, current: Option<&Path>) -> PruneReport {
    prune_with(dir, max_bytes, current, |path| fs::remove_file(path))
}

fn prune_with<F>(dir: &Path, max_bytes: u64, current: Option<&Path>, mut remove: F) -> PruneReport
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    if max_bytes == 0 {
        return PruneReport::default();
    }
    let mut files = list_segments(dir);
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let current = current.map(canonical);
    let mut report = PruneReport {
        remaining_bytes: files.iter().map(|file| file.size).sum(),
        ..PruneReport::default()
    };

    for file in &files {
        if report.remaining_bytes <= max_bytes {
            break;
        }
        if current.as_deref() == Some(canonical(&file.path).as_path()) {
            continue;
        }
        if let Err(err) = remove(&file.path) {
            log::warn!(
                "storage: failed to delete {}: {}",
                file.path.display(),
                err
            );
            continue;
        }
        for suffix in [FRAME_LOG_SUFFIX, META_SUFFIX] {
            let sidecar = sidecar_path(&file.path, suffix);
            match remove(&sidecar) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!(
                    "storage: failed to delete sidecar {}: {}",
                    sidecar.display(),
                    err
                ),
            }
        }
        report.remaining_bytes = report.remaining_bytes.saturating_sub(file.size);
        report.deleted_bytes += file.size;
        report.deleted.push(file.path.clone());
    }

    if !report.deleted.is_empty() {
        log::info!(
            "storage: pruned {} segment(s) in {} deleted_bytes={} remaining_bytes={} max_bytes={}",
            report.deleted.len(),
            dir.display(),
            report.deleted_bytes,
            report.remaining_bytes,
            max_bytes
        );
    }
    report
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs::{File, FileTimes};
    use std::time::Duration;

    fn make_segment(dir: &Path, name: &str, size: usize, age_secs: u64) -> Result<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size])?;
        fs::write(sidecar_path(&path, FRAME_LOG_SUFFIX), b"{}\n")?;
        fs::write(sidecar_path(&path, META_SUFFIX), b"{}")?;
        let modified = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)?
            .set_times(FileTimes::new().set_modified(modified))?;
        Ok(path)
    }

    #[test]
    fn recognizes_only_segment_files() {
        assert!(is_segment_file(Path::new("/x/loop_20240101_000000_000.mp4")));
        assert!(is_segment_file(Path::new("loop_a.mjpeg")));
        assert!(!is_segment_file(Path::new("loop_a.mp4.meta.json")));
        assert!(!is_segment_file(Path::new("segments_manifest.jsonl")));
        assert!(!is_segment_file(Path::new("other.mp4")));
    }

    #[test]
    fn deletes_oldest_first_until_under_quota() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let oldest = make_segment(dir.path(), "loop_1.mp4", 400, 300)?;
        let middle = make_segment(dir.path(), "loop_2.mp4", 400, 200)?;
        let newest = make_segment(dir.path(), "loop_3.mp4", 400, 100)?;
        fs::write(dir.path().join("notes.txt"), vec![0u8; 5000])?;

        let report = enforce_quota(dir.path(), 900, None);
        assert_eq!(report.deleted, vec![oldest.clone()]);
        assert_eq!(report.deleted_bytes, 400);
        assert_eq!(report.remaining_bytes, 800);
        assert!(!oldest.exists());
        assert!(!sidecar_path(&oldest, FRAME_LOG_SUFFIX).exists());
        assert!(!sidecar_path(&oldest, META_SUFFIX).exists());
        assert!(middle.exists() && newest.exists());
        assert_eq!(scan(dir.path()), (2, 800));
        Ok(())
    }

    #[test]
    fn never_deletes_the_current_segment() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let current = make_segment(dir.path(), "loop_1.mp4", 500, 300)?;
        let other = make_segment(dir.path(), "loop_2.mp4", 500, 200)?;

        let report = enforce_quota(dir.path(), 100, Some(&current));
        assert_eq!(report.deleted, vec![other]);
        assert!(current.exists());
        assert_eq!(report.remaining_bytes, 500);
        Ok(())
    }

    #[test]
    fn zero_quota_is_a_no_op() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_segment(dir.path(), "loop_1.mp4", 500, 10)?;
        assert_eq!(enforce_quota(dir.path(), 0, None), PruneReport::default());
        assert_eq!(scan(dir.path()), (1, 500));
        Ok(())
    }

    #[test]
    fn failed_deletes_are_skipped_and_the_pass_continues() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stuck = make_segment(dir.path(), "loop_1.mp4", 400, 300)?;
        let next = make_segment(dir.path(), "loop_2.mp4", 400, 200)?;
        make_segment(dir.path(), "loop_3.mp4", 400, 100)?;

        let report = prune_with(dir.path(), 900, None, |path| {
            if path == stuck.as_path() {
                Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            } else {
                fs::remove_file(path)
            }
        });
        assert_eq!(report.deleted, vec![next.clone()]);
        assert_eq!(report.remaining_bytes, 800);
        assert!(stuck.exists());
        assert!(!next.exists());
        Ok(())
    }

    #[test]
    fn every_delete_failing_leaves_usage_over_quota() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_segment(dir.path(), "loop_1.mp4", 400, 300)?;
        make_segment(dir.path(), "loop_2.mp4", 400, 200)?;

        let report = prune_with(dir.path(), 100, None, |_| {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        });
        assert!(report.deleted.is_empty());
        assert_eq!(report.deleted_bytes, 0);
        assert_eq!(report.remaining_bytes, 800);
        assert!(report.remaining_bytes > 100);
        assert_eq!(scan(dir.path()), (2, 800));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn read_only_directory_is_left_intact() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        // Root ignores directory permissions.
        if unsafe { libc::geteuid() } == 0 {
            return Ok(());
        }
        let dir = tempfile::tempdir()?;
        make_segment(dir.path(), "loop_1.mp4", 400, 300)?;
        make_segment(dir.path(), "loop_2.mp4", 400, 200)?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555))?;

        let report = enforce_quota(dir.path(), 100, None);
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
        assert!(report.deleted.is_empty());
        assert!(report.remaining_bytes > 100);
        assert_eq!(scan(dir.path()), (2, 800));
        Ok(())
    }

    #[test]
    fn missing_directory_scans_empty() {
        let path = Path::new("/definitely/not/a/recording/dir");
        assert_eq!(scan(path), (0, 0));
        assert!(enforce_quota(path, 10, None).deleted.is_empty());
    }
}
