//! camlink-sim - run the SPI slave core against a scripted master
//!
//! Pings the slave, downloads and verifies frames block by block, optionally
//! goes silent long enough for the watchdog to recover the link, then prints
//! the link statistics as JSON.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;

use camlink_sim::{build_responder, synthetic_frame, ResponderLoop, SimMaster, SimWire, SyntheticCamera};
use shared::{FrameSize, LinkConfig, LinkStats, VERSION};

/// CamLink SPI slave simulator
#[derive(Parser, Debug)]
#[command(name = "camlink-sim")]
#[command(version)]
#[command(about = "Drive the CamLink SPI slave core with a simulated master")]
struct Args {
    /// JSON file with link configuration overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Size of each synthetic camera frame in bytes
    #[arg(short = 'b', long, default_value = "20000")]
    frame_bytes: usize,

    /// Number of frames to download
    #[arg(short = 'n', long, default_value = "1")]
    frames: u32,

    /// Run without a camera (capture requests are NACKed)
    #[arg(long)]
    no_camera: bool,

    /// Go silent after the download so the watchdog recovers the link
    #[arg(long)]
    stall: bool,

    /// Slave task loop period in milliseconds
    #[arg(long, default_value = "5")]
    poll_ms: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    version: &'static str,
    camera: bool,
    frames_downloaded: u32,
    bytes_downloaded: usize,
    elapsed_ms: u128,
    link: LinkStats,
}

fn load_config(path: Option<&PathBuf>) -> Result<LinkConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => LinkConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    info!("========================================");
    info!("  CamLink SPI slave simulator v{}", VERSION);
    info!("========================================");

    let wire = SimWire::new();
    let camera = (!args.no_camera).then(|| SyntheticCamera::new(args.frame_bytes, FrameSize::default()));
    let responder = build_responder(wire.clone(), config.clone(), camera)?;
    responder.begin()?;

    let task_loop = ResponderLoop::start(responder.clone(), Duration::from_millis(args.poll_ms));
    let master = SimMaster::new(wire, responder.clone());
    let started = Instant::now();

    let status = master.ping(b"camlink").await?;
    info!("Slave answered PING, receive buffer {}% full", status);

    let mut frames_downloaded = 0;
    let mut bytes_downloaded = 0;
    if args.no_camera {
        match master.capture().await {
            Err(e) => info!("Capture without camera: {}", e),
            Ok(_) => bail!("slave reported a frame without a camera"),
        }
    } else {
        for sequence in 0..args.frames {
            let (meta, frame) = master.download_frame().await?;
            if frame != synthetic_frame(args.frame_bytes, sequence) {
                bail!("frame {} does not match what the camera produced", sequence);
            }
            info!("Frame {} verified ({} bytes, {} blocks)", sequence, meta.length, meta.total_blocks);
            frames_downloaded += 1;
            bytes_downloaded += frame.len();
        }
    }

    if args.stall {
        let silence = u64::from(config.transaction_timeout_ms) * 2 + u64::from(config.watchdog_interval_ms) * 2;
        warn!("Going silent for {} ms", silence);
        tokio::time::sleep(Duration::from_millis(silence)).await;
        master.ping(b"again").await.context("ping after recovery")?;
        info!("Link answered after {} recovery attempt(s)", responder.stats().recovery_attempts);
    }

    let (percent, pending) = master.buffer_status().await?;
    info!("Buffer status: {}% full, {} pending", percent, pending);

    let elapsed_ms = started.elapsed().as_millis();
    task_loop.stop().await;

    let report = Report {
        version: VERSION,
        camera: !args.no_camera,
        frames_downloaded,
        bytes_downloaded,
        elapsed_ms,
        link: responder.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
