//! Pipeline supervisor: worker startup, tile registry, shutdown order.
//!
//! The supervisor owns one worker per configured source and the device
//! manager they share. Startup derives each source's transport from its
//! URL scheme and caps the plan at the display's tile count. Shutdown is
//! cooperative and ordered: every worker is cancelled, then joined with a
//! bounded wait, and only then is the hardware device released.

use std::sync::Arc;
use std::time::Duration;

use quadview_types::{Config, PipelineError, SourceConfig, TransportKind, MAX_TILES};

use crate::device::DeviceManager;
use crate::mailbox::{frame_mailbox, FrameReceiver};
use crate::session::{SessionState, StreamSession, JOIN_TIMEOUT};
use crate::snapshot::SnapshotPoller;

/// Consumer-side view of one source: its name and the mailbox its frames
/// arrive through. Receivers are cheap to clone.
#[derive(Clone)]
pub struct Tile {
    pub name: String,
    pub frames: FrameReceiver,
}

enum Worker {
    Stream(StreamSession),
    Snapshot(SnapshotPoller),
}

impl Worker {
    fn request_stop(&self) {
        match self {
            Worker::Stream(session) => session.request_stop(),
            Worker::Snapshot(poller) => poller.request_stop(),
        }
    }
}

/// All running capture workers plus the device manager they arbitrate
/// through. Dropping without [`Pipeline::shutdown`] leaves the workers
/// running detached until their sources end; orderly teardown goes
/// through `shutdown`.
pub struct Pipeline {
    devices: Arc<DeviceManager>,
    workers: Vec<Worker>,
    tiles: Vec<Tile>,
}

impl Pipeline {
    /// Starts one worker per configured source. Must be called from within
    /// a tokio runtime; snapshot pollers live on it. Sources past the tile
    /// cap are dropped with a warning.
    pub fn start(config: &Config) -> Result<Self, PipelineError> {
        crate::init()?;

        if config.cameras.len() > MAX_TILES {
            log::warn!(
                "{} sources configured, display holds {}; ignoring the rest",
                config.cameras.len(),
                MAX_TILES
            );
        }

        let devices = Arc::new(DeviceManager::new());
        let tile = config.tile_size.dimensions();
        let push_interval = Duration::from_millis(config.push_interval_ms);
        let poll_interval = Duration::from_millis(config.snapshot_interval_ms);

        let mut workers = Vec::new();
        let mut tiles = Vec::new();
        for source in config.cameras.iter().take(MAX_TILES) {
            let (tx, rx) = frame_mailbox();
            workers.push(spawn_worker(
                source.clone(),
                tile,
                push_interval,
                poll_interval,
                devices.clone(),
                tx,
            ));
            tiles.push(Tile {
                name: source.name.clone(),
                frames: rx,
            });
        }

        Ok(Self {
            devices,
            workers,
            tiles,
        })
    }

    /// One tile per running worker, in configuration order.
    pub fn tiles(&self) -> Vec<Tile> {
        self.tiles.clone()
    }

    /// Current lifecycle state per stream session; pollers have no decode
    /// state machine and are omitted.
    pub fn session_states(&self) -> Vec<(String, SessionState)> {
        self.workers
            .iter()
            .filter_map(|worker| match worker {
                Worker::Stream(session) => {
                    Some((session.name().to_string(), session.state()))
                }
                Worker::Snapshot(_) => None,
            })
            .collect()
    }

    /// Stops every worker and waits for each with a bounded join. The
    /// hardware device is released only after all sessions have stopped
    /// using it.
    pub async fn shutdown(self) {
        for worker in &self.workers {
            worker.request_stop();
        }

        for worker in self.workers {
            match worker {
                Worker::Stream(session) => {
                    // The join blocks on the worker thread; keep it off the
                    // async executor.
                    let _ = tokio::task::spawn_blocking(move || session.join(JOIN_TIMEOUT)).await;
                }
                Worker::Snapshot(poller) => poller.shutdown().await,
            }
        }

        self.devices.release();
    }
}

fn spawn_worker(
    source: SourceConfig,
    tile: (u32, u32),
    push_interval: Duration,
    poll_interval: Duration,
    devices: Arc<DeviceManager>,
    tx: crate::mailbox::FrameSender,
) -> Worker {
    match source.transport() {
        TransportKind::Stream => Worker::Stream(StreamSession::spawn(
            source,
            tile,
            push_interval,
            devices,
            tx,
        )),
        TransportKind::Snapshot => {
            Worker::Snapshot(SnapshotPoller::spawn(source, tile, poll_interval, tx))
        }
    }
}
