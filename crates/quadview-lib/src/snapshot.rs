//! Still-image polling worker.
//!
//! One poller per HTTP source, living on the async runtime. A fixed
//! interval drives ticks; each tick issues at most one GET, and a tick
//! that fires while the previous fetch is still in flight is skipped, so
//! a slow endpoint is polled at whatever pace it can actually sustain.
//! Pollers never touch the hardware device manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::imageops::FilterType;
use quadview_types::{PipelineError, RasterFrame, SourceConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::mailbox::FrameSender;
use crate::telemetry::{RateWindow, SNAPSHOT_WINDOW};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Owner-side handle for one polling task.
pub struct SnapshotPoller {
    name: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SnapshotPoller {
    /// Spawns the poll loop on the current tokio runtime.
    pub fn spawn(
        source: SourceConfig,
        tile: (u32, u32),
        interval: Duration,
        frames: FrameSender,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let name = source.name.clone();
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(poll_loop(source, tile, interval, frames, cancel_rx));

        Self {
            name,
            cancel: cancel_tx,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stops the loop and waits for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

/// Clears the single-in-flight flag however the fetch task ends.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn poll_loop(
    source: SourceConfig,
    tile: (u32, u32),
    interval: Duration,
    frames: FrameSender,
    mut cancel: watch::Receiver<bool>,
) {
    log::info!(target: "http", "\"{}\" poller starting: {}", source.name, source.url);

    let client = match reqwest::Client::builder().timeout(FETCH_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            log::error!(target: "http", "\"{}\" http client init failed: {}", source.name, e);
            return;
        }
    };

    let in_flight = Arc::new(AtomicBool::new(false));
    let first_pushed = Arc::new(AtomicBool::new(false));
    let window = Arc::new(Mutex::new(RateWindow::new(SNAPSHOT_WINDOW)));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow_and_update() {
                    break;
                }
                continue;
            }
        }

        if in_flight.swap(true, Ordering::AcqRel) {
            log::debug!(
                target: "http",
                "\"{}\" previous fetch still in flight, skipping tick",
                source.name
            );
            continue;
        }

        let client = client.clone();
        let url = source.url.clone();
        let name = source.name.clone();
        let frames = frames.clone();
        let guard = FlightGuard(in_flight.clone());
        let first_pushed = first_pushed.clone();
        let window = window.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match fetch_one(&client, &url, tile).await {
                Ok(raster) => {
                    if !first_pushed.swap(true, Ordering::AcqRel) {
                        log::info!(
                            target: "http",
                            "\"{}\" first frame {}x{}",
                            name,
                            raster.width,
                            raster.height
                        );
                    }
                    frames.send_replace(Some(raster));

                    let report = {
                        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
                        window.record(Instant::now())
                    };
                    if let Some(report) = report {
                        log::info!(target: "http", "\"{}\" {:.1} fps", name, report.fps());
                    }
                }
                Err(e) => {
                    log::warn!(target: "http", "\"{}\" snapshot failed: {}", name, e);
                }
            }
        });
    }

    log::info!(target: "http", "\"{}\" poller stopped", source.name);
}

async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    (tile_width, tile_height): (u32, u32),
) -> Result<RasterFrame, PipelineError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PipelineError::Fetch(e.to_string()))?
        .error_for_status()
        .map_err(|e| PipelineError::Fetch(e.to_string()))?;
    let payload = response
        .bytes()
        .await
        .map_err(|e| PipelineError::Fetch(e.to_string()))?;

    tokio::task::spawn_blocking(move || decode_snapshot(&payload, tile_width, tile_height))
        .await
        .map_err(|e| PipelineError::Image(format!("decode task failed: {}", e)))?
}

fn decode_snapshot(
    payload: &[u8],
    tile_width: u32,
    tile_height: u32,
) -> Result<RasterFrame, PipelineError> {
    let decoded =
        image::load_from_memory(payload).map_err(|e| PipelineError::Image(e.to_string()))?;
    Ok(letterbox(&decoded, tile_width, tile_height))
}

/// Fits the image inside the tile preserving aspect ratio, centered on an
/// opaque black canvas.
fn letterbox(source: &image::DynamicImage, tile_width: u32, tile_height: u32) -> RasterFrame {
    let scaled = source.resize(tile_width, tile_height, FilterType::Triangle);
    let mut canvas =
        image::RgbaImage::from_pixel(tile_width, tile_height, image::Rgba([0, 0, 0, 255]));
    let x = (tile_width - scaled.width()) / 2;
    let y = (tile_height - scaled.height()) / 2;
    image::imageops::overlay(&mut canvas, &scaled.to_rgba8(), x as i64, y as i64);

    RasterFrame {
        width: tile_width,
        height: tile_height,
        data: Bytes::from(canvas.into_raw()),
    }
}
