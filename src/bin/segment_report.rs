//! segment_report - summarize recorded segments from the manifest.
//!
//! Reads `segments_manifest.jsonl` from a recording directory and prints one
//! line per closed segment (frames, drift, worst sync error). Exits non-zero
//! when any segment's frame timing drifted out of bounds.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use cage_capture::{CaptureConfig, SegmentMeta, MANIFEST_FILE};

#[derive(Parser, Debug)]
#[command(
    name = "segment_report",
    about = "Summarize recorded segments and their frame timing drift"
)]
struct Args {
    /// Recording directory (defaults to the configured output directory)
    #[arg(long, value_name = "PATH")]
    dir: Option<PathBuf>,

    /// Emit the parsed manifest as a JSON array instead of a table
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let dir = match args.dir {
        Some(dir) => dir,
        None => CaptureConfig::load()?.output_dir,
    };
    let manifest = dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&manifest)
        .with_context(|| format!("read {}", manifest.display()))?;

    let mut segments = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SegmentMeta>(line) {
            Ok(meta) => segments.push(meta),
            Err(err) => log::warn!("{}:{}: skipping malformed line: {}", manifest.display(), lineno + 1, err),
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&segments)?);
    } else {
        println!("segment_report: {}", manifest.display());
        println!();
        for meta in &segments {
            let name = meta
                .video_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            println!(
                "  {} frames={} drift_ms={:.1} max_sync_ms={:.1} {}",
                name,
                meta.written_frames,
                meta.timeline_drift_ms,
                meta.max_abs_sync_error_ms,
                if meta.frame_time_matched { "OK" } else { "DRIFT" }
            );
        }
        println!();
    }

    let frames: u64 = segments.iter().map(|meta| meta.written_frames).sum();
    let drifted = segments.iter().filter(|meta| !meta.frame_time_matched).count();
    if !args.json {
        println!(
            "segments={} frames={} drifted={}",
            segments.len(),
            frames,
            drifted
        );
    }
    if drifted > 0 {
        return Err(anyhow!("{} segment(s) out of timing bounds", drifted));
    }
    Ok(())
}
