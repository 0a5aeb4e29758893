//! The narrow boundary between the acquisition engine and the capture card driver.
//!
//! [`CaptureDriver`] exposes only the calls a device session needs. [`mock::MockDriver`] is a
//! software device for development and tests; `magewell::MagewellDriver` (feature `hardware`)
//! binds the vendor library.

#[cfg(feature = "hardware")]
pub mod magewell;
pub mod mock;

pub use mock::{MockConfig, MockControls, MockDriver};

use crate::capture::settings::ColourFormat;
use crate::capture::status::{
    DeviceTicks, OnDeviceBufferStatus, RawFrameInfo, SignalStatus, TransferStatus,
};
use crate::error::Result;
use crate::events::{Event, NotifyFlags, NotifyHandle};

pub const MW_SUCCEEDED: i32 = 0;
pub const MW_FAILED: i32 = 1;
pub const MW_INVALID_PARAMS: i32 = 2;

/// Driver handle for one opened capture input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterlaceMode {
    Weave = 0,
    Blend = 1,
    TopField = 2,
    BottomField = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatioMode {
    Ignore = 0,
    Cropping = 1,
    Padding = 2,
}

/// Parameters of one device-to-host frame copy.
///
/// Conversion is fixed: no scaling, no cropping, no OSD, neutral picture adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub frame_index: u8,
    pub format: ColourFormat,
    pub cols: u32,
    pub rows: u32,
    pub stride: u32,
    pub size_in_bytes: usize,
    /// Lines per partial completion notification; zero requests a whole-frame notification.
    pub partial_notify_lines: u32,
    pub deinterlace: DeinterlaceMode,
    pub aspect_ratio: AspectRatioMode,
    pub contrast: i16,
    pub brightness: i16,
    pub saturation: i16,
    pub hue: i16,
}

impl FrameRequest {
    pub fn new(
        frame_index: u8,
        format: ColourFormat,
        cols: u32,
        rows: u32,
        stride: u32,
        size_in_bytes: usize,
        partial_notify_lines: u32,
    ) -> Self {
        Self {
            frame_index,
            format,
            cols,
            rows,
            stride,
            size_in_bytes,
            partial_notify_lines,
            deinterlace: DeinterlaceMode::Blend,
            aspect_ratio: AspectRatioMode::Ignore,
            contrast: 100,
            brightness: 0,
            saturation: 100,
            hue: 0,
        }
    }
}

/// Turns a driver status code into a `Result`.
pub fn check(call: &'static str, status: i32) -> Result<()> {
    if status == MW_SUCCEEDED {
        Ok(())
    } else {
        Err(crate::CaptureError::Driver { call, status })
    }
}

/// Operations the device session needs from a capture card driver.
///
/// Every status query is a synchronous round-trip; nothing is cached here.
pub trait CaptureDriver: Send {
    /// Creates an event of the kind this driver can signal.
    fn create_event(&self) -> Result<Event>;

    fn refresh_devices(&self) -> Result<()>;

    fn channel_count(&self) -> Result<usize>;

    fn device_path(&self, index: usize) -> Result<String>;

    fn open_channel(&self, path: &str) -> Result<ChannelHandle>;

    fn close_channel(&self, channel: ChannelHandle);

    /// Starts capture; `transfer_complete` is raised each time a requested transfer finishes.
    fn start_capture(&self, channel: ChannelHandle, transfer_complete: &Event) -> Result<()>;

    fn stop_capture(&self, channel: ChannelHandle) -> Result<()>;

    fn register_notify(
        &self,
        channel: ChannelHandle,
        event: &Event,
        token: NotifyFlags,
    ) -> Result<NotifyHandle>;

    fn unregister_notify(&self, channel: ChannelHandle, notify: NotifyHandle) -> Result<()>;

    fn notify_status(&self, channel: ChannelHandle, notify: NotifyHandle) -> Result<NotifyFlags>;

    fn register_timer(&self, channel: ChannelHandle, event: &Event) -> Result<NotifyHandle>;

    fn unregister_timer(&self, channel: ChannelHandle, timer: NotifyHandle) -> Result<()>;

    /// Asks the driver to raise the timer's event when the device clock reaches `expiry`.
    fn schedule_timer(
        &self,
        channel: ChannelHandle,
        timer: NotifyHandle,
        expiry: DeviceTicks,
    ) -> Result<()>;

    fn device_time(&self, channel: ChannelHandle) -> Result<DeviceTicks>;

    fn signal_status(&self, channel: ChannelHandle) -> Result<SignalStatus>;

    fn buffer_status(&self, channel: ChannelHandle) -> Result<OnDeviceBufferStatus>;

    fn frame_info(&self, channel: ChannelHandle, frame_index: u8) -> Result<RawFrameInfo>;

    /// Reading the capture status releases the on-device buffer of the completed transfer.
    fn transfer_status(&self, channel: ChannelHandle) -> Result<TransferStatus>;

    /// Starts an asynchronous copy into `buffer` and returns immediately.
    ///
    /// The driver may keep writing to `buffer` until the transfer-complete event fires; the
    /// caller must not read or reuse it before then.
    fn capture_frame(
        &self,
        channel: ChannelHandle,
        request: &FrameRequest,
        buffer: &mut [u8],
    ) -> Result<()>;

    /// Releases the driver instance. Called once, after the channel is closed.
    fn release(&self);
}
