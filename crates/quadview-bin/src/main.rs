//! Headless quadview runner.
//!
//! Loads a camera configuration, starts one capture pipeline per source
//! and drains every tile mailbox on the runtime until Ctrl-C. The actual
//! display surface is out of scope; the drain tasks stand in for it.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use quadview_lib::{Pipeline, Tile};
use quadview_types::Config;

#[derive(Parser)]
#[command(name = "quadview", about = "Multi-camera capture, decode and scale pipelines")]
struct Cli {
    /// JSON camera configuration, {"cameras":[{"name":...,"url":...}],...}.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let raw = match fs::read_to_string(&cli.config) {
        Ok(raw) => raw,
        Err(e) => {
            log::error!("cannot read {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let config: Config = match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            log::error!("cannot parse {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if config.cameras.is_empty() {
        log::error!("no cameras configured in {}", cli.config.display());
        return ExitCode::FAILURE;
    }

    let pipeline = match Pipeline::start(&config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::error!("pipeline start failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut consumers = Vec::new();
    for tile in pipeline.tiles() {
        consumers.push(tokio::spawn(drain_tile(tile)));
    }
    log::info!(
        "{} tile(s) running at {:?}, Ctrl-C to stop",
        consumers.len(),
        config.tile_size
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("signal handler failed: {}", e);
    }
    log::info!("shutting down");
    pipeline.shutdown().await;

    // Workers dropped their mailbox senders on the way out, so the drain
    // tasks finish on their own.
    for consumer in consumers {
        let _ = consumer.await;
    }

    ExitCode::SUCCESS
}

/// Stand-in for a display tile: observes every delivered frame, logging a
/// heartbeat now and then.
async fn drain_tile(mut tile: Tile) {
    let mut received = 0u64;
    while tile.frames.changed().await.is_ok() {
        let frame = tile.frames.borrow_and_update().clone();
        if let Some(frame) = frame {
            received += 1;
            if received == 1 || received % 128 == 0 {
                log::info!(
                    target: "display",
                    "\"{}\" frame {} ({}x{}, {} bytes)",
                    tile.name,
                    received,
                    frame.width,
                    frame.height,
                    frame.data.len()
                );
            }
        }
    }
}
