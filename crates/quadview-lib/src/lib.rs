//! Live multi-camera capture, decode and scale pipelines.
//!
//! One worker per configured source: continuous streams decode on a
//! dedicated thread (hardware accelerated when the single VAAPI device is
//! granted), still-image endpoints poll on the async runtime. Every worker
//! hands fixed-size RGBA tiles to its consumer through a latest-wins
//! mailbox, so a slow consumer never slows decoding.
//!
//! # Thread Safety
//! Decode state is owned by its worker thread and never shared. The device
//! manager's claim flag is the only cross-session mutable state.

pub mod device;
pub mod mailbox;
pub mod pipeline;
pub mod scale;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod throttle;

#[cfg(test)]
mod tests;

use ffmpeg_next as ffmpeg;
use quadview_types::PipelineError;

pub use device::DeviceManager;
pub use pipeline::{Pipeline, Tile};
pub use session::{SessionState, StreamSession};
pub use snapshot::SnapshotPoller;

/// Initializes FFmpeg and quiets its console output. Safe to call more
/// than once.
pub fn init() -> Result<(), PipelineError> {
    ffmpeg::init().map_err(ff_err)?;
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Warning);
    Ok(())
}

pub(crate) fn ff_err(e: ffmpeg::Error) -> PipelineError {
    PipelineError::Ffmpeg(e.to_string())
}
