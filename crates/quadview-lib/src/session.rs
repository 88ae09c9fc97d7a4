//! Per-source capture and decode worker.
//!
//! Each stream source gets a dedicated OS thread that owns every piece of
//! demux and codec state for that source. The only state shared with the
//! rest of the process is the session handle (state, cancel and hardware
//! flags) and the device manager consulted once at startup.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi::{av_buffer_ref, av_hwframe_transfer_data, AVCodecContext, AVPixelFormat};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{codec, format, frame, media, Dictionary, Packet};
use quadview_types::{PipelineError, SourceConfig};

use crate::device::{DeviceManager, HardwareDevice};
use crate::ff_err;
use crate::mailbox::FrameSender;
use crate::scale::{pack_raster, FrameScaler};
use crate::telemetry::{DecodeMode, RateWindow, DECODE_WINDOW};
use crate::throttle::PushThrottle;

/// Socket and connect timeout handed to the RTSP demuxer, microseconds.
const SOCKET_TIMEOUT_US: &str = "5000000";
/// Sleep applied when the demuxer has nothing for us yet.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);
/// How long `join` waits before giving up on a worker thread.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Opening = 0,
    Probing = 1,
    Decoding = 2,
    Draining = 3,
    Stopped = 4,
    Failed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::Opening,
            1 => SessionState::Probing,
            2 => SessionState::Decoding,
            3 => SessionState::Draining,
            4 => SessionState::Stopped,
            _ => SessionState::Failed,
        }
    }
}

/// State shared between a session's owner and its worker thread.
pub struct SessionHandle {
    state: AtomicU8,
    cancel: AtomicBool,
    hardware: AtomicBool,
    downgraded: AtomicBool,
}

impl SessionHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(SessionState::Opening as u8),
            cancel: AtomicBool::new(false),
            hardware: AtomicBool::new(false),
            downgraded: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Forward-only: an attempt to move backwards keeps the later state.
    fn advance(&self, state: SessionState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn hardware_active(&self) -> bool {
        self.hardware.load(Ordering::Acquire)
    }

    fn set_hardware(&self) {
        if !self.downgraded.load(Ordering::Acquire) {
            self.hardware.store(true, Ordering::Release);
        }
    }

    /// The downgrade is permanent: once cleared, the flag can never be set
    /// again for this session.
    fn clear_hardware(&self) {
        self.downgraded.store(true, Ordering::Release);
        self.hardware.store(false, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Owner-side handle for one decode worker.
pub struct StreamSession {
    name: String,
    handle: Arc<SessionHandle>,
    worker: Option<thread::JoinHandle<()>>,
}

impl StreamSession {
    /// Spawns the worker thread for one stream source.
    pub fn spawn(
        source: SourceConfig,
        tile: (u32, u32),
        push_interval: Duration,
        devices: Arc<DeviceManager>,
        frames: FrameSender,
    ) -> Self {
        let handle = SessionHandle::new();
        let shared = handle.clone();
        let name = source.name.clone();

        let worker = thread::Builder::new()
            .name(format!("decode-{}", source.name))
            .spawn(move || run_worker(source, tile, push_interval, devices, frames, shared));
        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::error!(target: "rtsp", "\"{}\" worker thread failed to start: {}", name, e);
                handle.advance(SessionState::Failed);
                None
            }
        };

        Self {
            name,
            handle,
            worker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn hardware_active(&self) -> bool {
        self.handle.hardware_active()
    }

    pub fn request_stop(&self) {
        self.handle.request_stop();
    }

    /// Requests a stop and waits (bounded) for the worker to wind down.
    /// False means the wait timed out and the thread was left detached.
    pub fn join(mut self, timeout: Duration) -> bool {
        self.request_stop();
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return true,
        };

        let deadline = Instant::now() + timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    target: "rtsp",
                    "\"{}\" did not stop within {:?}, detaching",
                    self.name,
                    timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = worker.join();
        true
    }
}

fn run_worker(
    source: SourceConfig,
    tile: (u32, u32),
    push_interval: Duration,
    devices: Arc<DeviceManager>,
    frames: FrameSender,
    shared: Arc<SessionHandle>,
) {
    log::info!(target: "rtsp", "\"{}\" session starting: {}", source.name, source.url);
    match decode_stream(&source, tile, push_interval, &devices, &frames, &shared) {
        Ok(()) => {
            shared.advance(SessionState::Stopped);
            log::info!(target: "rtsp", "\"{}\" session stopped", source.name);
        }
        Err(e) => {
            shared.advance(SessionState::Failed);
            log::error!(target: "rtsp", "\"{}\" session failed: {}", source.name, e);
        }
    }
}

fn decode_stream(
    source: &SourceConfig,
    (tile_width, tile_height): (u32, u32),
    push_interval: Duration,
    devices: &DeviceManager,
    frames: &FrameSender,
    shared: &SessionHandle,
) -> Result<(), PipelineError> {
    let mut ictx = open_input(&source.url)?;

    shared.advance(SessionState::Probing);
    let (stream_index, params) = {
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or(PipelineError::NoVideoStream)?;
        (stream.index(), stream.parameters())
    };

    let context = codec::Context::from_parameters(params).map_err(ff_err)?;
    let (src_width, src_height) = coded_dimensions(&context);

    // Source geometry decides hardware eligibility before the codec opens.
    let grant = devices.try_assign(src_width.saturating_mul(src_height));
    let mut decoder = match grant.as_deref() {
        Some(device) => open_hardware_decoder(context, device, shared)?,
        None => context.decoder().video().map_err(ff_err)?,
    };
    if shared.hardware_active() {
        log::info!(
            target: "vaapi",
            "\"{}\" hardware decode granted ({}x{})",
            source.name,
            src_width,
            src_height
        );
    } else {
        log::info!(
            target: "rtsp",
            "\"{}\" software decode ({}x{})",
            source.name,
            src_width,
            src_height
        );
    }

    shared.advance(SessionState::Decoding);
    let mut scaler = FrameScaler::new(&source.name, tile_width, tile_height);
    let mut throttle = PushThrottle::new(push_interval);
    let mut window = RateWindow::new(DECODE_WINDOW);
    let mut decoded = frame::Video::empty();
    let mut transfer = frame::Video::empty();
    let mut first_pushed = false;

    while !shared.cancelled() {
        let mut packet = Packet::empty();
        match packet.read(&mut ictx) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) => {
                thread::sleep(READ_RETRY_DELAY);
                continue;
            }
            Err(ffmpeg::Error::Eof) => break,
            Err(e) => return Err(ff_err(e)),
        }

        if packet.stream() != stream_index {
            continue;
        }

        if let Err(e) = decoder.send_packet(&packet) {
            log::debug!(target: "rtsp", "\"{}\" packet rejected: {}", source.name, e);
            continue;
        }

        loop {
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {}
                Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) | Err(ffmpeg::Error::Eof) => {
                    break
                }
                Err(e) => return Err(ff_err(e)),
            }

            let frame_ref = if shared.hardware_active() && decoded.format() == Pixel::VAAPI {
                let mut host = frame::Video::empty();
                match transfer_to_host(&decoded, &mut host) {
                    Ok(()) => {
                        transfer = host;
                        &transfer
                    }
                    Err(e) => {
                        shared.clear_hardware();
                        log::warn!(
                            target: "vaapi",
                            "\"{}\" transfer to host failed, switching to software decode: {}",
                            source.name,
                            e
                        );
                        decoder = reopen_software_decoder(&ictx, stream_index)?;
                        scaler.reset();
                        continue;
                    }
                }
            } else {
                &decoded
            };

            let scaled = scaler.scale(frame_ref)?;

            if let Some(report) = window.record(Instant::now()) {
                let mode = if shared.hardware_active() {
                    DecodeMode::Hardware
                } else {
                    DecodeMode::Software
                };
                log::info!(
                    target: "rtsp",
                    "\"{}\" {:.1} fps ({})",
                    source.name,
                    report.fps(),
                    mode
                );
            }

            if throttle.admit(Instant::now()) {
                let raster = pack_raster(scaled);
                if !first_pushed {
                    first_pushed = true;
                    log::info!(
                        target: "rtsp",
                        "\"{}\" first frame {}x{}",
                        source.name,
                        raster.width,
                        raster.height
                    );
                }
                frames.send_replace(Some(raster));
            }
        }
    }

    shared.advance(SessionState::Draining);
    Ok(())
}

fn open_input(url: &str) -> Result<format::context::Input, PipelineError> {
    let mut options = Dictionary::new();
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        options.set("rtsp_transport", "tcp");
        options.set("stimeout", SOCKET_TIMEOUT_US);
    }
    options.set("fflags", "+genpts");
    options.set("use_wallclock_as_timestamps", "1");
    format::input_with_dictionary(&url, options).map_err(ff_err)
}

fn coded_dimensions(context: &codec::Context) -> (u32, u32) {
    unsafe {
        let raw = context.as_ptr();
        ((*raw).width.max(0) as u32, (*raw).height.max(0) as u32)
    }
}

fn open_hardware_decoder(
    mut context: codec::Context,
    device: &HardwareDevice,
    shared: &SessionHandle,
) -> Result<codec::decoder::Video, PipelineError> {
    unsafe {
        let raw = context.as_mut_ptr();
        (*raw).get_format = Some(negotiate_vaapi);
        let device_ref = av_buffer_ref(device.as_ptr());
        if device_ref.is_null() {
            return Err(PipelineError::Ffmpeg(
                "failed to reference device context".to_string(),
            ));
        }
        (*raw).hw_device_ctx = device_ref;
    }

    let decoder = context.decoder().video().map_err(ff_err)?;
    shared.set_hardware();
    Ok(decoder)
}

fn reopen_software_decoder(
    ictx: &format::context::Input,
    stream_index: usize,
) -> Result<codec::decoder::Video, PipelineError> {
    let params = ictx
        .stream(stream_index)
        .map(|stream| stream.parameters())
        .ok_or(PipelineError::NoVideoStream)?;
    codec::Context::from_parameters(params)
        .map_err(ff_err)?
        .decoder()
        .video()
        .map_err(ff_err)
}

extern "C" fn negotiate_vaapi(
    _context: *mut AVCodecContext,
    pix_fmts: *const AVPixelFormat,
) -> AVPixelFormat {
    let mut i = 0;
    unsafe {
        loop {
            let format = *pix_fmts.offset(i);
            if format == AVPixelFormat::AV_PIX_FMT_NONE {
                break;
            }
            if format == AVPixelFormat::AV_PIX_FMT_VAAPI {
                return format;
            }
            i += 1;
        }
    }
    AVPixelFormat::AV_PIX_FMT_NONE
}

fn transfer_to_host(decoded: &frame::Video, host: &mut frame::Video) -> Result<(), PipelineError> {
    unsafe {
        let ret = av_hwframe_transfer_data(host.as_mut_ptr(), decoded.as_ptr(), 0);
        if ret < 0 {
            return Err(PipelineError::Ffmpeg(format!(
                "hwframe transfer failed ({})",
                ret
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::frame_mailbox;

    #[test]
    fn states_are_forward_only() {
        let handle = SessionHandle::new();
        assert_eq!(handle.state(), SessionState::Opening);

        handle.advance(SessionState::Decoding);
        assert_eq!(handle.state(), SessionState::Decoding);

        // Moving backwards keeps the later state.
        handle.advance(SessionState::Probing);
        assert_eq!(handle.state(), SessionState::Decoding);

        handle.advance(SessionState::Draining);
        handle.advance(SessionState::Stopped);
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[test]
    fn failed_is_terminal() {
        let handle = SessionHandle::new();
        handle.advance(SessionState::Probing);
        handle.advance(SessionState::Failed);
        handle.advance(SessionState::Stopped);
        assert_eq!(handle.state(), SessionState::Failed);
    }

    #[test]
    fn hardware_downgrade_is_irrevocable() {
        let handle = SessionHandle::new();
        handle.set_hardware();
        assert!(handle.hardware_active());

        handle.clear_hardware();
        assert!(!handle.hardware_active());

        // Nothing can turn the flag back on once it was cleared.
        handle.set_hardware();
        assert!(!handle.hardware_active());
    }

    #[test]
    fn state_codes_round_trip() {
        for state in [
            SessionState::Opening,
            SessionState::Probing,
            SessionState::Decoding,
            SessionState::Draining,
            SessionState::Stopped,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn unreachable_source_fails_and_joins() {
        crate::init().expect("ffmpeg init");
        let (tx, _rx) = frame_mailbox();
        let devices = Arc::new(DeviceManager::new());
        let source = SourceConfig {
            name: "refused".to_string(),
            url: "rtsp://127.0.0.1:1/stream".to_string(),
        };

        let session = StreamSession::spawn(
            source,
            (320, 180),
            Duration::from_millis(90),
            devices,
            tx,
        );

        let deadline = Instant::now() + Duration::from_secs(15);
        while session.state() != SessionState::Failed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.join(Duration::from_secs(5)));
    }
}
