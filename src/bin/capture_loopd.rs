//! capture_loopd - enclosure camera capture daemon
//!
//! This daemon:
//! 1. Loads the capture configuration (`--config`, else `CAGE_CONFIG`, plus `CAGE_*` overrides)
//! 2. Starts the capture loop (camera → preview frame → recorded segments)
//! 3. Logs a status line at a fixed interval
//! 4. Re-reads the config file when it changes and reconfigures the running loop
//! 5. Stops cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime};

use cage_capture::{CaptureConfig, CaptureService};

#[derive(Parser, Debug)]
#[command(
    name = "capture_loopd",
    about = "Keep the enclosure camera open and record it in rotating segments"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, value_name = "PATH", env = "CAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between status log lines (0 disables)
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,

    /// Seconds between config file change checks (0 disables reloading)
    #[arg(long, default_value_t = 5)]
    reload_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    let service = CaptureService::new(config.settings()?);
    service.start()?;
    log::info!(
        "capture_loopd running. device={} output_dir={}",
        config.device,
        config.output_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let status_every = Duration::from_secs(args.status_interval_secs);
    let reload_every = Duration::from_secs(args.reload_interval_secs);
    let tick = Duration::from_millis(250);
    let mut last_status = Instant::now();
    let mut last_reload_check = Instant::now();
    let mut config_mtime = args.config.as_deref().and_then(modified_at);

    loop {
        match rx.recv_timeout(tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if !status_every.is_zero() && last_status.elapsed() >= status_every {
            last_status = Instant::now();
            let status = service.status();
            log::info!(
                "status: phase={} backend={} frames={} recording={} segment={} stored_files={} stored_bytes={} errors={} last_error={}",
                serde_json::to_string(&status.phase)?.trim_matches('"'),
                status.backend,
                status.latest_sequence,
                status.recording_active,
                status
                    .current_record_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string()),
                status.stored_files,
                status.stored_bytes,
                status.error_count,
                status.last_error
            );
        }

        let Some(path) = args.config.as_deref() else {
            continue;
        };
        if reload_every.is_zero() || last_reload_check.elapsed() < reload_every {
            continue;
        }
        last_reload_check = Instant::now();
        if !service.is_running() {
            // A restart refused while the previous loop was still draining.
            if let Err(err) = service.start() {
                log::warn!("capture loop restart deferred: {}", err);
            }
        }
        let mtime = modified_at(path);
        if mtime == config_mtime {
            continue;
        }
        config_mtime = mtime;
        match CaptureConfig::from_path(path).and_then(|cfg| cfg.settings()) {
            Ok(settings) => {
                log::info!("config {} changed, applying", path.display());
                if let Err(err) = service.reconfigure(settings) {
                    log::warn!("capture loop restart deferred: {}", err);
                }
            }
            Err(err) => log::warn!("config {} rejected, keeping current settings: {:#}", path.display(), err),
        }
    }

    log::info!("shutdown signal received, stopping capture loop...");
    service.stop();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CaptureConfig> {
    match path {
        Some(path) => CaptureConfig::from_path(path),
        None => CaptureConfig::load(),
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
