use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Display layout holds at most this many sources; extra entries are ignored.
pub const MAX_TILES: usize = 4;

/// Fixed output raster sizes for display tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileSize {
    P360, // 640x360
    P540, // 960x540
    P720, // 1280x720
}

impl TileSize {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            TileSize::P360 => (640, 360),
            TileSize::P540 => (960, 540),
            TileSize::P720 => (1280, 720),
        }
    }
}

impl Default for TileSize {
    fn default() -> Self {
        TileSize::P540
    }
}

/// How frames are obtained from a source. Derived from the URL scheme,
/// never configured directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Continuous stream demuxed and decoded frame by frame (RTSP and
    /// anything else FFmpeg can open).
    Stream,
    /// Single still image fetched over HTTP at a fixed cadence.
    Snapshot,
}

/// One configured camera. Immutable once its worker starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
}

impl SourceConfig {
    pub fn transport(&self) -> TransportKind {
        match self.url.split("://").next() {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") =>
            {
                TransportKind::Snapshot
            }
            _ => TransportKind::Stream,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cameras: Vec<SourceConfig>,
    #[serde(default)]
    pub tile_size: TileSize,
    /// Minimum spacing between frames handed to a consumer, milliseconds.
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
    /// Pause between still-image requests, milliseconds.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

fn default_push_interval_ms() -> u64 {
    90
}

fn default_snapshot_interval_ms() -> u64 {
    500
}

/// Tightly packed RGBA8 raster handed to consumers. `data` holds exactly
/// `width * height * 4` bytes, no row padding.
#[derive(Debug, Clone)]
pub struct RasterFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl RasterFrame {
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("ffmpeg: {0}")]
    Ffmpeg(String),
    #[error("no video stream in source")]
    NoVideoStream,
    #[error("source geometry changed mid-session: {have} -> {got}")]
    SourceChanged { have: String, got: String },
    #[error("snapshot fetch failed: {0}")]
    Fetch(String),
    #[error("image decode failed: {0}")]
    Image(String),
}
