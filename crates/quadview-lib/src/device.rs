//! VAAPI device ownership and arbitration.
//!
//! One render device exists per process. Creation happens on the first
//! `acquire` call and the outcome is cached, success or failure alike. At
//! most one decode session may hold the device; the claim is a single
//! atomic compare-and-swap and is never returned before process shutdown.

use ffmpeg_next::ffi::{av_buffer_unref, av_hwdevice_ctx_create, AVBufferRef, AVHWDeviceType};
use quadview_types::PipelineError;
use std::ffi::CString;
use std::path::Path;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Render node the device context is created on.
pub const RENDER_NODE: &str = "/dev/dri/renderD128";

/// Minimum source area (pixels) for a session to qualify for the device.
pub const MIN_HW_PIXEL_AREA: u32 = 1280 * 720;

/// RAII wrapper for the FFmpeg VAAPI device context.
pub struct HardwareDevice {
    ctx: *mut AVBufferRef,
}

impl HardwareDevice {
    fn create(node: &str) -> Result<Arc<Self>, PipelineError> {
        let device = CString::new(node).map_err(|e| PipelineError::Ffmpeg(e.to_string()))?;
        let mut hw_device_ctx = null_mut();

        unsafe {
            let ret = av_hwdevice_ctx_create(
                &mut hw_device_ctx,
                AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
                device.as_ptr(),
                null_mut(),
                0,
            );
            if ret < 0 {
                return Err(PipelineError::Ffmpeg(format!(
                    "failed to create VAAPI device on {} (error {})",
                    node, ret
                )));
            }
        }

        Ok(Arc::new(Self { ctx: hw_device_ctx }))
    }

    pub fn as_ptr(&self) -> *mut AVBufferRef {
        self.ctx
    }
}

impl Drop for HardwareDevice {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                av_buffer_unref(&mut self.ctx);
            }
        }
    }
}

unsafe impl Send for HardwareDevice {}
unsafe impl Sync for HardwareDevice {}

#[derive(Default)]
struct DeviceSlot {
    attempted: bool,
    device: Option<Arc<HardwareDevice>>,
}

/// Arbitrates the single VAAPI device across decode sessions.
pub struct DeviceManager {
    slot: Mutex<DeviceSlot>,
    claimed: AtomicBool,
    node: String,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_node(RENDER_NODE)
    }

    pub(crate) fn with_node(node: &str) -> Self {
        Self {
            slot: Mutex::new(DeviceSlot::default()),
            claimed: AtomicBool::new(false),
            node: node.to_string(),
        }
    }

    /// Creates the device on the first call only; later calls return the
    /// cached outcome. True when a device exists.
    pub fn acquire(&self) -> bool {
        let mut slot = self.slot();
        if !slot.attempted {
            slot.attempted = true;
            if !Path::new(&self.node).exists() {
                log::warn!(
                    target: "vaapi",
                    "render node {} not present, hardware decode disabled",
                    self.node
                );
            } else {
                match HardwareDevice::create(&self.node) {
                    Ok(device) => {
                        log::info!(target: "vaapi", "device context ready on {}", self.node);
                        slot.device = Some(device);
                    }
                    Err(e) => {
                        log::warn!(target: "vaapi", "device init failed: {}", e);
                    }
                }
            }
        }
        slot.device.is_some()
    }

    /// Grants exclusive device use to one caller. Succeeds only when the
    /// device exists, nobody holds it yet and the source covers at least
    /// `MIN_HW_PIXEL_AREA` pixels.
    pub fn try_assign(&self, pixel_area: u32) -> Option<Arc<HardwareDevice>> {
        if pixel_area < MIN_HW_PIXEL_AREA {
            return None;
        }
        if !self.acquire() {
            return None;
        }

        let slot = self.slot();
        let device = slot.device.as_ref()?;
        if !self.try_claim() {
            return None;
        }
        Some(device.clone())
    }

    fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_assigned(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Frees the device at process shutdown. Callers must have stopped
    /// every session first.
    pub fn release(&self) {
        let mut slot = self.slot();
        if slot.device.take().is_some() {
            log::info!(target: "vaapi", "device context released");
        }
    }

    fn slot(&self) -> MutexGuard<'_, DeviceSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
