//! Binding to the vendor capture library, loaded at runtime with `libloading`.
//!
//! Only the calls [`CaptureDriver`] needs are resolved. Struct layouts mirror the SDK headers,
//! which pack to one byte. Events must be kernel events so the driver can signal them, which makes
//! this driver usable on Windows only; elsewhere [`CaptureDriver::create_event`] fails.

use std::ffi::c_void;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libloading::Library;
use tracing::{debug, info};

use super::{check, CaptureDriver, ChannelHandle, FrameRequest, MW_INVALID_PARAMS};
use crate::capture::settings::{AspectRatio, ImageSize};
use crate::capture::status::{
    DeviceTicks, FrameState, OnDeviceBufferStatus, RawFrameInfo, SignalState, SignalStatus,
    TransferStatus,
};
use crate::error::{CaptureError, Result};
use crate::events::{Event, NotifyFlags, NotifyHandle};

#[cfg(windows)]
pub const DEFAULT_LIBRARY: &str = "LibMWCapture.dll";
#[cfg(not(windows))]
pub const DEFAULT_LIBRARY: &str = "libMWCapture.so";

const DEVICE_PATH_CHARS: usize = 128;

type HChannel = *mut c_void;
type WaitHandle = isize;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct MwVideoSignalStatus {
    state: i32,
    x: i32,
    y: i32,
    cx: i32,
    cy: i32,
    cx_total: i32,
    cy_total: i32,
    interlaced: u8,
    frame_duration: i32,
    aspect_x: i32,
    aspect_y: i32,
    segmented_frame: u8,
    frame_type: i32,
    color_format: i32,
    quant_range: i32,
    sat_range: i32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct MwVideoCaptureStatus {
    context: i64,
    physical_address: u8,
    frame: u64,
    frame_index: i32,
    frame_completed: u8,
    cy_completed: i16,
    cy_completed_prev: i16,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct MwVideoBufferInfo {
    max_frames: i32,
    newest_buffering: u8,
    buffering_field_index: u8,
    newest_buffered: u8,
    buffered_field_index: u8,
    newest_buffered_full_frame: u8,
    buffered_full_frames: i32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct MwVideoFrameInfo {
    state: i32,
    interlaced: u8,
    segmented_frame: u8,
    top_field_first: u8,
    top_field_inverted: u8,
    cx: i32,
    cy: i32,
    aspect_x: i32,
    aspect_y: i32,
    field_start_times: [i64; 2],
    field_buffered_times: [i64; 2],
    timecodes: [u8; 8],
}

type CaptureToVirtualAddressEx = unsafe extern "C" fn(
    HChannel,
    i32, // frame index
    *mut u8, // destination
    i32, // destination size
    i32, // stride
    u8, // bottom up
    i64, // context
    u32, // fourcc
    i32, // cx
    i32, // cy
    u32, // process switches
    i32, // partial notify lines
    i64, // OSD image
    *const c_void,
    i32, // OSD rect count
    i16, // contrast
    i16, // brightness
    i16, // saturation
    i16, // hue
    i32, // deinterlace mode
    i32, // aspect ratio convert mode
    *const c_void,
    *const c_void,
    i32, // aspect x
    i32, // aspect y
    i32, // colour format
    i32, // quantization range
    i32, // saturation range
) -> i32;

struct Api {
    init_instance: unsafe extern "C" fn() -> i32,
    exit_instance: unsafe extern "C" fn(),
    refresh_device: unsafe extern "C" fn() -> i32,
    get_channel_count: unsafe extern "C" fn() -> i32,
    get_device_path: unsafe extern "C" fn(i32, *mut u16) -> i32,
    open_channel_by_path: unsafe extern "C" fn(*const u16) -> HChannel,
    close_channel: unsafe extern "C" fn(HChannel),
    start_video_capture: unsafe extern "C" fn(HChannel, WaitHandle) -> i32,
    stop_video_capture: unsafe extern "C" fn(HChannel) -> i32,
    register_notify: unsafe extern "C" fn(HChannel, WaitHandle, u32) -> i64,
    unregister_notify: unsafe extern "C" fn(HChannel, i64) -> i32,
    get_notify_status: unsafe extern "C" fn(HChannel, i64, *mut u64) -> i32,
    register_timer: unsafe extern "C" fn(HChannel, WaitHandle) -> i64,
    unregister_timer: unsafe extern "C" fn(HChannel, i64) -> i32,
    schedule_timer: unsafe extern "C" fn(HChannel, i64, i64) -> i32,
    get_device_time: unsafe extern "C" fn(HChannel, *mut i64) -> i32,
    get_video_signal_status: unsafe extern "C" fn(HChannel, *mut MwVideoSignalStatus) -> i32,
    get_video_buffer_info: unsafe extern "C" fn(HChannel, *mut MwVideoBufferInfo) -> i32,
    get_video_frame_info: unsafe extern "C" fn(HChannel, u8, *mut MwVideoFrameInfo) -> i32,
    get_video_capture_status: unsafe extern "C" fn(HChannel, *mut MwVideoCaptureStatus) -> i32,
    capture_video_frame_to_virtual_address_ex: CaptureToVirtualAddressEx,
}

macro_rules! symbol {
    ($lib:expr, $name:literal) => {{
        // SAFETY: the field type matches the SDK prototype, and the library is stored next to the
        // table so the pointer never outlives it.
        let symbol = unsafe { $lib.get(concat!($name, "\0").as_bytes()) }
            .map_err(|e| CaptureError::Library(format!("{}: {}", $name, e)))?;
        *symbol
    }};
}

impl Api {
    fn resolve(lib: &Library) -> Result<Self> {
        Ok(Self {
            init_instance: symbol!(lib, "MWCaptureInitInstance"),
            exit_instance: symbol!(lib, "MWCaptureExitInstance"),
            refresh_device: symbol!(lib, "MWRefreshDevice"),
            get_channel_count: symbol!(lib, "MWGetChannelCount"),
            get_device_path: symbol!(lib, "MWGetDevicePath"),
            open_channel_by_path: symbol!(lib, "MWOpenChannelByPath"),
            close_channel: symbol!(lib, "MWCloseChannel"),
            start_video_capture: symbol!(lib, "MWStartVideoCapture"),
            stop_video_capture: symbol!(lib, "MWStopVideoCapture"),
            register_notify: symbol!(lib, "MWRegisterNotify"),
            unregister_notify: symbol!(lib, "MWUnregisterNotify"),
            get_notify_status: symbol!(lib, "MWGetNotifyStatus"),
            register_timer: symbol!(lib, "MWRegisterTimer"),
            unregister_timer: symbol!(lib, "MWUnregisterTimer"),
            schedule_timer: symbol!(lib, "MWScheduleTimer"),
            get_device_time: symbol!(lib, "MWGetDeviceTime"),
            get_video_signal_status: symbol!(lib, "MWGetVideoSignalStatus"),
            get_video_buffer_info: symbol!(lib, "MWGetVideoBufferInfo"),
            get_video_frame_info: symbol!(lib, "MWGetVideoFrameInfo"),
            get_video_capture_status: symbol!(lib, "MWGetVideoCaptureStatus"),
            capture_video_frame_to_virtual_address_ex: symbol!(
                lib,
                "MWCaptureVideoFrameToVirtualAddressEx"
            ),
        })
    }
}

/// Capture card driver backed by the vendor library.
pub struct MagewellDriver {
    api: Api,
    released: AtomicBool,
    // Dropped last: `api` points into it.
    _lib: Library,
}

fn channel_ptr(channel: ChannelHandle) -> HChannel {
    channel.0 as usize as HChannel
}

fn non_negative(value: i32) -> u32 {
    value.max(0) as u32
}

fn wait_handle(event: &Event, call: &'static str) -> Result<WaitHandle> {
    event.raw_handle().ok_or(CaptureError::Driver {
        call,
        status: MW_INVALID_PARAMS,
    })
}

impl MagewellDriver {
    /// Loads the library (from `path`, or the platform default name) and initialises the SDK.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_LIBRARY));
        // SAFETY: loading runs the library's initialisers; the vendor SDK has no unusual ones.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| CaptureError::Library(format!("{}: {}", path.display(), e)))?;
        let api = Api::resolve(&lib)?;

        // SAFETY: no arguments; must precede every other SDK call.
        if unsafe { (api.init_instance)() } == 0 {
            return Err(CaptureError::Library(
                "MWCaptureInitInstance failed".to_string(),
            ));
        }
        info!("Loaded capture library {}", path.display());
        Ok(Self {
            api,
            released: AtomicBool::new(false),
            _lib: lib,
        })
    }
}

impl Drop for MagewellDriver {
    fn drop(&mut self) {
        self.release();
    }
}

impl CaptureDriver for MagewellDriver {
    #[cfg(windows)]
    fn create_event(&self) -> Result<Event> {
        Event::win32().map_err(|e| CaptureError::Wait(e.to_string()))
    }

    #[cfg(not(windows))]
    fn create_event(&self) -> Result<Event> {
        Err(CaptureError::Library(
            "driver-signalled events need Win32 event handles".to_string(),
        ))
    }

    fn refresh_devices(&self) -> Result<()> {
        // SAFETY: no arguments.
        check("MWRefreshDevice", unsafe { (self.api.refresh_device)() })
    }

    fn channel_count(&self) -> Result<usize> {
        // SAFETY: no arguments.
        let count = unsafe { (self.api.get_channel_count)() };
        Ok(count.max(0) as usize)
    }

    fn device_path(&self, index: usize) -> Result<String> {
        let mut path = [0u16; DEVICE_PATH_CHARS];
        // SAFETY: the SDK writes at most DEVICE_PATH_CHARS wide characters, nul included.
        let status = unsafe { (self.api.get_device_path)(index as i32, path.as_mut_ptr()) };
        check("MWGetDevicePath", status)?;
        let len = path.iter().position(|&c| c == 0).unwrap_or(path.len());
        Ok(String::from_utf16_lossy(&path[..len]))
    }

    fn open_channel(&self, path: &str) -> Result<ChannelHandle> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
        // SAFETY: `wide` is nul-terminated and outlives the call.
        let channel = unsafe { (self.api.open_channel_by_path)(wide.as_ptr()) };
        if channel.is_null() {
            return Err(CaptureError::Driver {
                call: "MWOpenChannelByPath",
                status: super::MW_FAILED,
            });
        }
        Ok(ChannelHandle(channel as usize as u64))
    }

    fn close_channel(&self, channel: ChannelHandle) {
        // SAFETY: the handle came from MWOpenChannelByPath and is closed once by the session.
        unsafe { (self.api.close_channel)(channel_ptr(channel)) }
    }

    fn start_capture(&self, channel: ChannelHandle, transfer_complete: &Event) -> Result<()> {
        let event = wait_handle(transfer_complete, "MWStartVideoCapture")?;
        // SAFETY: the event is owned by the session and outlives the capture.
        let status = unsafe { (self.api.start_video_capture)(channel_ptr(channel), event) };
        check("MWStartVideoCapture", status)
    }

    fn stop_capture(&self, channel: ChannelHandle) -> Result<()> {
        // SAFETY: valid open channel.
        let status = unsafe { (self.api.stop_video_capture)(channel_ptr(channel)) };
        check("MWStopVideoCapture", status)
    }

    fn register_notify(
        &self,
        channel: ChannelHandle,
        event: &Event,
        token: NotifyFlags,
    ) -> Result<NotifyHandle> {
        let event = wait_handle(event, "MWRegisterNotify")?;
        // SAFETY: valid open channel; the event outlives the registration.
        let handle = unsafe {
            (self.api.register_notify)(channel_ptr(channel), event, token.bits() as u32)
        };
        if handle == 0 {
            return Err(CaptureError::Driver {
                call: "MWRegisterNotify",
                status: super::MW_FAILED,
            });
        }
        Ok(NotifyHandle(handle as u64))
    }

    fn unregister_notify(&self, channel: ChannelHandle, notify: NotifyHandle) -> Result<()> {
        // SAFETY: handle returned by MWRegisterNotify on this channel.
        let status =
            unsafe { (self.api.unregister_notify)(channel_ptr(channel), notify.0 as i64) };
        check("MWUnregisterNotify", status)
    }

    fn notify_status(&self, channel: ChannelHandle, notify: NotifyHandle) -> Result<NotifyFlags> {
        let mut bits = 0u64;
        // SAFETY: `bits` is a valid out-pointer for the duration of the call.
        let status = unsafe {
            (self.api.get_notify_status)(channel_ptr(channel), notify.0 as i64, &mut bits)
        };
        check("MWGetNotifyStatus", status)?;
        Ok(NotifyFlags::from_bits_truncate(bits))
    }

    fn register_timer(&self, channel: ChannelHandle, event: &Event) -> Result<NotifyHandle> {
        let event = wait_handle(event, "MWRegisterTimer")?;
        // SAFETY: valid open channel; the event outlives the registration.
        let handle = unsafe { (self.api.register_timer)(channel_ptr(channel), event) };
        if handle == 0 {
            return Err(CaptureError::Driver {
                call: "MWRegisterTimer",
                status: super::MW_FAILED,
            });
        }
        Ok(NotifyHandle(handle as u64))
    }

    fn unregister_timer(&self, channel: ChannelHandle, timer: NotifyHandle) -> Result<()> {
        // SAFETY: handle returned by MWRegisterTimer on this channel.
        let status = unsafe { (self.api.unregister_timer)(channel_ptr(channel), timer.0 as i64) };
        check("MWUnregisterTimer", status)
    }

    fn schedule_timer(
        &self,
        channel: ChannelHandle,
        timer: NotifyHandle,
        expiry: DeviceTicks,
    ) -> Result<()> {
        // SAFETY: handle returned by MWRegisterTimer on this channel.
        let status = unsafe {
            (self.api.schedule_timer)(channel_ptr(channel), timer.0 as i64, expiry.0)
        };
        check("MWScheduleTimer", status)
    }

    fn device_time(&self, channel: ChannelHandle) -> Result<DeviceTicks> {
        let mut ticks = 0i64;
        // SAFETY: `ticks` is a valid out-pointer.
        let status = unsafe { (self.api.get_device_time)(channel_ptr(channel), &mut ticks) };
        check("MWGetDeviceTime", status)?;
        Ok(DeviceTicks(ticks))
    }

    fn signal_status(&self, channel: ChannelHandle) -> Result<SignalStatus> {
        let mut raw = MwVideoSignalStatus::default();
        // SAFETY: `raw` matches the SDK layout.
        let status = unsafe { (self.api.get_video_signal_status)(channel_ptr(channel), &mut raw) };
        check("MWGetVideoSignalStatus", status)?;
        Ok(SignalStatus {
            state: SignalState::from_raw(raw.state),
            start_position: (non_negative(raw.x), non_negative(raw.y)),
            image_dimensions: ImageSize::new(non_negative(raw.cx), non_negative(raw.cy)),
            total_dimensions: ImageSize::new(
                non_negative(raw.cx_total),
                non_negative(raw.cy_total),
            ),
            interlaced: raw.interlaced != 0,
            frame_period: DeviceTicks(raw.frame_duration as i64),
            aspect_ratio: AspectRatio {
                hor: non_negative(raw.aspect_x),
                ver: non_negative(raw.aspect_y),
            },
            segmented: raw.segmented_frame != 0,
        })
    }

    fn buffer_status(&self, channel: ChannelHandle) -> Result<OnDeviceBufferStatus> {
        let mut raw = MwVideoBufferInfo::default();
        // SAFETY: `raw` matches the SDK layout.
        let status = unsafe { (self.api.get_video_buffer_info)(channel_ptr(channel), &mut raw) };
        check("MWGetVideoBufferInfo", status)?;
        Ok(OnDeviceBufferStatus {
            buffer_size_in_frames: non_negative(raw.max_frames),
            newest_buffering_index: raw.newest_buffering,
            buffering_field_index: raw.buffering_field_index,
            newest_buffered_index: raw.newest_buffered,
            buffered_field_index: raw.buffered_field_index,
            last_buffered_frame_index: raw.newest_buffered_full_frame,
            num_fully_buffered_frames: non_negative(raw.buffered_full_frames),
        })
    }

    fn frame_info(&self, channel: ChannelHandle, frame_index: u8) -> Result<RawFrameInfo> {
        let mut raw = MwVideoFrameInfo::default();
        // SAFETY: `raw` matches the SDK layout.
        let status = unsafe {
            (self.api.get_video_frame_info)(channel_ptr(channel), frame_index, &mut raw)
        };
        check("MWGetVideoFrameInfo", status)?;
        let start = raw.field_start_times;
        let buffered = raw.field_buffered_times;
        Ok(RawFrameInfo {
            state: FrameState::from_raw(raw.state),
            interlaced: raw.interlaced != 0,
            segmented: raw.segmented_frame != 0,
            top_field_first: raw.top_field_first != 0,
            dimensions: ImageSize::new(non_negative(raw.cx), non_negative(raw.cy)),
            aspect_ratio: AspectRatio {
                hor: non_negative(raw.aspect_x),
                ver: non_negative(raw.aspect_y),
            },
            field_start_times: [DeviceTicks(start[0]), DeviceTicks(start[1])],
            field_buffered_times: [DeviceTicks(buffered[0]), DeviceTicks(buffered[1])],
        })
    }

    fn transfer_status(&self, channel: ChannelHandle) -> Result<TransferStatus> {
        let mut raw = MwVideoCaptureStatus::default();
        // SAFETY: `raw` matches the SDK layout.
        let status =
            unsafe { (self.api.get_video_capture_status)(channel_ptr(channel), &mut raw) };
        check("MWGetVideoCaptureStatus", status)?;
        Ok(TransferStatus {
            frame_index: raw.frame_index,
            whole_frame_transferred: raw.frame_completed != 0,
            num_lines_transferred: raw.cy_completed.max(0) as u32,
            num_lines_transferred_previously: raw.cy_completed_prev.max(0) as u32,
        })
    }

    fn capture_frame(
        &self,
        channel: ChannelHandle,
        request: &FrameRequest,
        buffer: &mut [u8],
    ) -> Result<()> {
        if buffer.len() < request.size_in_bytes {
            return Err(CaptureError::BufferTooSmall {
                required: request.size_in_bytes,
                actual: buffer.len(),
            });
        }
        debug!(frame_index = request.frame_index, "requesting frame transfer");
        // SAFETY: `buffer` holds at least `size_in_bytes` bytes. The caller keeps it alive and
        // untouched until the transfer-complete event fires.
        let status = unsafe {
            (self.api.capture_video_frame_to_virtual_address_ex)(
                channel_ptr(channel),
                request.frame_index as i32,
                buffer.as_mut_ptr(),
                request.size_in_bytes as i32,
                request.stride as i32,
                0,
                0,
                request.format.fourcc(),
                request.cols as i32,
                request.rows as i32,
                0,
                request.partial_notify_lines as i32,
                0,
                ptr::null(),
                0,
                request.contrast,
                request.brightness,
                request.saturation,
                request.hue,
                request.deinterlace as i32,
                request.aspect_ratio as i32,
                ptr::null(),
                ptr::null(),
                0,
                0,
                0,
                0,
                0,
            )
        };
        check("MWCaptureVideoFrameToVirtualAddressEx", status)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: paired with the successful MWCaptureInitInstance in `load`; runs once.
        unsafe { (self.api.exit_instance)() };
        info!("Capture library instance released");
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn structs_match_packed_sdk_layout() {
        assert_eq!(size_of::<MwVideoSignalStatus>(), 58);
        assert_eq!(size_of::<MwVideoCaptureStatus>(), 26);
        assert_eq!(size_of::<MwVideoBufferInfo>(), 13);
        assert_eq!(size_of::<MwVideoFrameInfo>(), 64);
    }

    #[test]
    fn missing_library_is_reported() {
        let err = MagewellDriver::load(Some(Path::new("/nonexistent/libMWCapture.so")))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Library(_)));
    }
}
