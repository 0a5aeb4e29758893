//! Software capture device for development and tests without hardware or the vendor SDK.
//!
//! The mock keeps its own free-running 100 ns clock, raises frame notifications from a frame
//! clock thread while capturing, and paces timer notifications with one short-lived thread per
//! scheduled tick. Transfers complete immediately with a synthetic test pattern.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CaptureDriver, ChannelHandle, FrameRequest, MW_FAILED, MW_INVALID_PARAMS};
use crate::capture::settings::{AspectRatio, ImageSize};
use crate::capture::status::{
    DeviceTicks, FrameState, OnDeviceBufferStatus, RawFrameInfo, SignalState, SignalStatus,
    TransferStatus,
};
use crate::error::{CaptureError, ConfigError, Result};
use crate::events::{Event, EventSignaller, NotifyFlags, NotifyHandle};

pub const MOCK_FRAME_RATE_HZ: f64 = 2.0;
pub const MAX_MOCK_FRAME_RATE_HZ: f64 = 1000.0;
pub const MOCK_RESOLUTION: ImageSize = ImageSize::new(1920, 1080);
pub const MOCK_ASPECT_RATIO: AspectRatio = AspectRatio { hor: 16, ver: 9 };
pub const MOCK_DEVICE_PATH: &str = "mock://procapture/0";

const MOCK_CHANNEL: ChannelHandle = ChannelHandle(0x4d43);
const MOCK_CACHE_FRAMES: u32 = 4;
// Arbitrary clock epoch so nothing depends on device time starting at zero.
const MOCK_CLOCK_EPOCH: DeviceTicks = DeviceTicks(86_400 * 10_000_000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub frame_rate_hz: f64,
    pub resolution: ImageSize,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: MOCK_FRAME_RATE_HZ,
            resolution: MOCK_RESOLUTION,
        }
    }
}

impl MockConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate_hz > 0.0 && self.frame_rate_hz <= MAX_MOCK_FRAME_RATE_HZ {
            Ok(())
        } else {
            Err(ConfigError::InvalidFrameRate(self.frame_rate_hz))
        }
    }
}

/// Fills a frame with horizontal bands whose shade shifts every frame. Never writes zero.
pub fn fill_test_pattern(buffer: &mut [u8], stride: usize, frame_number: u64) {
    let stride = stride.max(1);
    for (row, line) in buffer.chunks_mut(stride).enumerate() {
        let band = (row / 16) as u64;
        let shade = (band * 17 + frame_number * 29) % 255 + 1;
        line.fill(shade as u8);
    }
}

struct MockNotify {
    handle: NotifyHandle,
    flags: NotifyFlags,
    signaller: EventSignaller,
}

struct MockState {
    channel_open: bool,
    capturing: bool,
    signal_state: SignalState,
    transfer_complete: Option<EventSignaller>,
    notifications: Vec<MockNotify>,
    timers: Vec<(NotifyHandle, EventSignaller)>,
    next_handle: u64,
    pending_status: NotifyFlags,
    // (buffering started, buffering complete) per on-card frame slot
    frame_times: [Option<(DeviceTicks, DeviceTicks)>; MOCK_CACHE_FRAMES as usize],
    frames_buffered: u64,
    last_transfer: TransferStatus,
    partial_transfers: u32,
    stall_transfers: bool,
    frame_clock: Option<(Sender<()>, JoinHandle<()>)>,
    last_timer_fire: Option<Instant>,
    timer_ticks: u64,
    frames_written: u64,
    channels_opened: u32,
    channels_closed: u32,
    stop_calls: u32,
    releases: u32,
}

impl MockState {
    fn newest_slot(&self) -> usize {
        (self.frames_buffered % MOCK_CACHE_FRAMES as u64) as usize
    }

    fn record_frame(&mut self, at: DeviceTicks) {
        self.frames_buffered += 1;
        let slot = self.newest_slot();
        self.frame_times[slot] = Some((at, at));
    }
}

struct Shared {
    epoch: Instant,
    frame_period: DeviceTicks,
    resolution: ImageSize,
    state: Mutex<MockState>,
}

impl Shared {
    fn device_time(&self) -> DeviceTicks {
        MOCK_CLOCK_EPOCH + DeviceTicks::from_duration(self.epoch.elapsed())
    }

    fn instant_at(&self, ticks: DeviceTicks) -> Instant {
        self.epoch + (ticks - MOCK_CLOCK_EPOCH).as_duration()
    }

    /// One frame arrives on the card: raise frame-buffering, then frame-buffered.
    fn buffer_frame(&self) {
        let mut state = self.state.lock();
        if !state.capturing {
            return;
        }
        let now = self.device_time();
        state.record_frame(now);
        state.pending_status |= NotifyFlags::FRAME_BUFFERING | NotifyFlags::FRAME_BUFFERED;
        for flag in [NotifyFlags::FRAME_BUFFERING, NotifyFlags::FRAME_BUFFERED] {
            state
                .notifications
                .iter()
                .filter(|n| n.flags.contains(flag))
                .for_each(|n| n.signaller.set());
        }
    }

    fn fire_timer(&self, signaller: &EventSignaller, rate_hz: f64) {
        let mut state = self.state.lock();
        if !state.channel_open {
            return;
        }
        let now = Instant::now();
        if let Some(last) = state.last_timer_fire {
            let since_last = now.duration_since(last).as_secs_f64();
            if since_last > 1.0 / rate_hz * 1.1 && state.timer_ticks % 10 == 0 {
                warn!(
                    "Mock frame rate is {:.3} Hz, which is lower than the requested {} Hz",
                    1.0 / since_last,
                    rate_hz
                );
            }
        }
        let device_now = self.device_time();
        state.record_frame(device_now);
        state.timer_ticks += 1;
        state.last_timer_fire = Some(now);
        signaller.set();
    }

    fn stop_frame_clock(&self) {
        let clock = self.state.lock().frame_clock.take();
        if let Some((stop, handle)) = clock {
            drop(stop);
            if handle.join().is_err() {
                warn!("Mock frame clock thread panicked");
            }
        }
    }
}

/// Builder for [`MockDriver`].
#[derive(Debug, Clone)]
pub struct MockDriverBuilder {
    config: MockConfig,
    signal_state: SignalState,
}

impl MockDriverBuilder {
    pub fn frame_rate_hz(mut self, rate: f64) -> Self {
        self.config.frame_rate_hz = rate;
        self
    }

    pub fn resolution(mut self, resolution: ImageSize) -> Self {
        self.config.resolution = resolution;
        self
    }

    pub fn signal_state(mut self, state: SignalState) -> Self {
        self.signal_state = state;
        self
    }

    pub fn build(self) -> Result<MockDriver> {
        self.config.validate()?;
        let frame_period = DeviceTicks::from_secs_f64(1.0 / self.config.frame_rate_hz);
        Ok(MockDriver {
            shared: Arc::new(Shared {
                epoch: Instant::now(),
                frame_period,
                resolution: self.config.resolution,
                state: Mutex::new(MockState {
                    channel_open: false,
                    capturing: false,
                    signal_state: self.signal_state,
                    transfer_complete: None,
                    notifications: Vec::new(),
                    timers: Vec::new(),
                    next_handle: 1,
                    pending_status: NotifyFlags::empty(),
                    frame_times: [None; MOCK_CACHE_FRAMES as usize],
                    frames_buffered: 0,
                    last_transfer: TransferStatus::default(),
                    partial_transfers: 0,
                    stall_transfers: false,
                    frame_clock: None,
                    last_timer_fire: None,
                    timer_ticks: 0,
                    frames_written: 0,
                    channels_opened: 0,
                    channels_closed: 0,
                    stop_calls: 0,
                    releases: 0,
                }),
            }),
            rate_hz: self.config.frame_rate_hz,
        })
    }
}

/// A software-only capture card.
pub struct MockDriver {
    shared: Arc<Shared>,
    rate_hz: f64,
}

impl MockDriver {
    pub fn builder() -> MockDriverBuilder {
        MockDriverBuilder {
            config: MockConfig::default(),
            signal_state: SignalState::Locked,
        }
    }

    pub fn with_config(config: &MockConfig) -> Result<Self> {
        Self::builder()
            .frame_rate_hz(config.frame_rate_hz)
            .resolution(config.resolution)
            .build()
    }

    /// Handle for steering the mock and observing its calls after it has been moved into a
    /// session.
    pub fn controls(&self) -> MockControls {
        MockControls(self.shared.clone())
    }

    fn open_state(&self, call: &'static str) -> Result<parking_lot::MutexGuard<'_, MockState>> {
        let state = self.shared.state.lock();
        if state.channel_open {
            Ok(state)
        } else {
            Err(CaptureError::Driver {
                call,
                status: MW_FAILED,
            })
        }
    }

    fn signaller(event: &Event, call: &'static str) -> Result<EventSignaller> {
        event.signaller().ok_or(CaptureError::Driver {
            call,
            status: MW_INVALID_PARAMS,
        })
    }

    fn allocate_handle(state: &mut MockState) -> NotifyHandle {
        let handle = NotifyHandle(state.next_handle);
        state.next_handle += 1;
        handle
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        self.shared.stop_frame_clock();
    }
}

impl CaptureDriver for MockDriver {
    fn create_event(&self) -> Result<Event> {
        Ok(Event::soft())
    }

    fn refresh_devices(&self) -> Result<()> {
        Ok(())
    }

    fn channel_count(&self) -> Result<usize> {
        Ok(1)
    }

    fn device_path(&self, index: usize) -> Result<String> {
        if index == 0 {
            Ok(MOCK_DEVICE_PATH.to_string())
        } else {
            Err(CaptureError::Driver {
                call: "device_path",
                status: MW_INVALID_PARAMS,
            })
        }
    }

    fn open_channel(&self, path: &str) -> Result<ChannelHandle> {
        if path != MOCK_DEVICE_PATH {
            return Err(CaptureError::Driver {
                call: "open_channel",
                status: MW_INVALID_PARAMS,
            });
        }
        let mut state = self.shared.state.lock();
        state.channel_open = true;
        state.channels_opened += 1;
        info!("Mock channel opened at {} Hz", self.rate_hz);
        Ok(MOCK_CHANNEL)
    }

    fn close_channel(&self, _channel: ChannelHandle) {
        self.shared.stop_frame_clock();
        let mut state = self.shared.state.lock();
        state.channel_open = false;
        state.capturing = false;
        state.transfer_complete = None;
        state.notifications.clear();
        state.timers.clear();
        state.channels_closed += 1;
    }

    fn start_capture(&self, _channel: ChannelHandle, transfer_complete: &Event) -> Result<()> {
        let signaller = Self::signaller(transfer_complete, "start_capture")?;
        let mut state = self.open_state("start_capture")?;
        state.transfer_complete = Some(signaller);
        state.capturing = true;

        let wants_frame_clock = state.notifications.iter().any(|n| {
            n.flags
                .intersects(NotifyFlags::FRAME_BUFFERED | NotifyFlags::FRAME_BUFFERING)
        });
        if wants_frame_clock && state.frame_clock.is_none() {
            let (stop_tx, stop_rx) = channel::bounded::<()>(0);
            let shared = self.shared.clone();
            let period = self.shared.frame_period.as_duration();
            let handle = thread::Builder::new()
                .name("mock-frame-clock".into())
                .spawn(move || {
                    let mut next = Instant::now() + period;
                    loop {
                        let wait = next.saturating_duration_since(Instant::now());
                        match stop_rx.recv_timeout(wait) {
                            Err(RecvTimeoutError::Timeout) => {}
                            _ => break,
                        }
                        next += period;
                        shared.buffer_frame();
                    }
                })
                .map_err(|_| CaptureError::Driver {
                    call: "start_capture",
                    status: MW_FAILED,
                })?;
            state.frame_clock = Some((stop_tx, handle));
        }
        debug!("Mock capture started");
        Ok(())
    }

    fn stop_capture(&self, _channel: ChannelHandle) -> Result<()> {
        {
            let mut state = self.open_state("stop_capture")?;
            state.capturing = false;
            state.stop_calls += 1;
        }
        self.shared.stop_frame_clock();
        debug!("Mock capture stopped");
        Ok(())
    }

    fn register_notify(
        &self,
        _channel: ChannelHandle,
        event: &Event,
        token: NotifyFlags,
    ) -> Result<NotifyHandle> {
        let signaller = Self::signaller(event, "register_notify")?;
        let mut state = self.open_state("register_notify")?;
        let handle = Self::allocate_handle(&mut state);
        state.notifications.push(MockNotify {
            handle,
            flags: token,
            signaller,
        });
        Ok(handle)
    }

    fn unregister_notify(&self, _channel: ChannelHandle, notify: NotifyHandle) -> Result<()> {
        let mut state = self.open_state("unregister_notify")?;
        state.notifications.retain(|n| n.handle != notify);
        Ok(())
    }

    fn notify_status(&self, _channel: ChannelHandle, notify: NotifyHandle) -> Result<NotifyFlags> {
        let mut state = self.open_state("notify_status")?;
        let flags = state
            .notifications
            .iter()
            .find(|n| n.handle == notify)
            .map(|n| n.flags)
            .ok_or(CaptureError::Driver {
                call: "notify_status",
                status: MW_INVALID_PARAMS,
            })?;
        let raised = state.pending_status & flags;
        state.pending_status.remove(raised);
        Ok(raised)
    }

    fn register_timer(&self, _channel: ChannelHandle, event: &Event) -> Result<NotifyHandle> {
        let signaller = Self::signaller(event, "register_timer")?;
        let mut state = self.open_state("register_timer")?;
        let handle = Self::allocate_handle(&mut state);
        state.timers.push((handle, signaller));
        Ok(handle)
    }

    fn unregister_timer(&self, _channel: ChannelHandle, timer: NotifyHandle) -> Result<()> {
        let mut state = self.open_state("unregister_timer")?;
        state.timers.retain(|(handle, _)| *handle != timer);
        Ok(())
    }

    fn schedule_timer(
        &self,
        _channel: ChannelHandle,
        timer: NotifyHandle,
        expiry: DeviceTicks,
    ) -> Result<()> {
        let signaller = {
            let state = self.open_state("schedule_timer")?;
            state
                .timers
                .iter()
                .find(|(handle, _)| *handle == timer)
                .map(|(_, signaller)| signaller.clone())
                .ok_or(CaptureError::Driver {
                    call: "schedule_timer",
                    status: MW_INVALID_PARAMS,
                })?
        };

        let shared = self.shared.clone();
        let rate_hz = self.rate_hz;
        let target = shared.instant_at(expiry);
        thread::Builder::new()
            .name("mock-timer".into())
            .spawn(move || {
                let now = Instant::now();
                if target > now {
                    thread::sleep(target - now);
                }
                shared.fire_timer(&signaller, rate_hz);
            })
            .map(|_| ())
            .map_err(|_| CaptureError::Driver {
                call: "schedule_timer",
                status: MW_FAILED,
            })
    }

    fn device_time(&self, _channel: ChannelHandle) -> Result<DeviceTicks> {
        drop(self.open_state("device_time")?);
        Ok(self.shared.device_time())
    }

    fn signal_status(&self, _channel: ChannelHandle) -> Result<SignalStatus> {
        let state = self.open_state("signal_status")?;
        let resolution = self.shared.resolution;
        Ok(SignalStatus {
            state: state.signal_state,
            start_position: (0, 0),
            image_dimensions: resolution,
            total_dimensions: resolution,
            interlaced: false,
            frame_period: self.shared.frame_period,
            aspect_ratio: MOCK_ASPECT_RATIO,
            segmented: false,
        })
    }

    fn buffer_status(&self, _channel: ChannelHandle) -> Result<OnDeviceBufferStatus> {
        let state = self.open_state("buffer_status")?;
        let newest = state.newest_slot() as u8;
        Ok(OnDeviceBufferStatus {
            buffer_size_in_frames: MOCK_CACHE_FRAMES,
            newest_buffering_index: newest,
            buffering_field_index: newest,
            newest_buffered_index: newest,
            buffered_field_index: newest,
            last_buffered_frame_index: newest,
            num_fully_buffered_frames: state.frames_buffered.min(MOCK_CACHE_FRAMES as u64) as u32,
        })
    }

    fn frame_info(&self, _channel: ChannelHandle, frame_index: u8) -> Result<RawFrameInfo> {
        let state = self.open_state("frame_info")?;
        let slot = state.frame_times.get(frame_index as usize).copied().flatten();
        let (started, complete) = slot.unwrap_or_else(|| {
            let now = self.shared.device_time();
            (now, now)
        });
        Ok(RawFrameInfo {
            state: FrameState::Buffered,
            interlaced: false,
            segmented: false,
            top_field_first: true,
            dimensions: self.shared.resolution,
            aspect_ratio: MOCK_ASPECT_RATIO,
            field_start_times: [started, started],
            field_buffered_times: [complete, complete],
        })
    }

    fn transfer_status(&self, _channel: ChannelHandle) -> Result<TransferStatus> {
        Ok(self.open_state("transfer_status")?.last_transfer)
    }

    fn capture_frame(
        &self,
        _channel: ChannelHandle,
        request: &FrameRequest,
        buffer: &mut [u8],
    ) -> Result<()> {
        let mut state = self.open_state("capture_frame")?;
        if !state.capturing {
            return Err(CaptureError::Driver {
                call: "capture_frame",
                status: MW_FAILED,
            });
        }
        let Some(frame) = buffer.get_mut(..request.size_in_bytes) else {
            return Err(CaptureError::Driver {
                call: "capture_frame",
                status: MW_INVALID_PARAMS,
            });
        };

        fill_test_pattern(frame, request.stride as usize, state.frames_written);
        state.frames_written += 1;

        let frame_index = request.frame_index as i32;
        state.last_transfer = if state.partial_transfers > 0 {
            state.partial_transfers -= 1;
            TransferStatus {
                frame_index,
                whole_frame_transferred: false,
                num_lines_transferred: request.rows / 2,
                num_lines_transferred_previously: 0,
            }
        } else {
            TransferStatus {
                frame_index,
                whole_frame_transferred: true,
                num_lines_transferred: request.rows,
                num_lines_transferred_previously: request.rows,
            }
        };

        if !state.stall_transfers {
            if let Some(done) = &state.transfer_complete {
                done.set();
            }
        }
        Ok(())
    }

    fn release(&self) {
        self.shared.state.lock().releases += 1;
    }
}

/// Test hooks and call counters for a [`MockDriver`].
#[derive(Clone)]
pub struct MockControls(Arc<Shared>);

impl MockControls {
    pub fn set_signal_state(&self, signal_state: SignalState) {
        self.0.state.lock().signal_state = signal_state;
    }

    /// Raises every registered signal-change notification.
    pub fn trigger_signal_change(&self) {
        let mut state = self.0.state.lock();
        state.pending_status |= NotifyFlags::SIGNAL_CHANGE;
        state
            .notifications
            .iter()
            .filter(|n| n.flags.contains(NotifyFlags::SIGNAL_CHANGE))
            .for_each(|n| n.signaller.set());
    }

    /// The next `count` transfers report an incomplete frame.
    pub fn inject_partial_transfers(&self, count: u32) {
        self.0.state.lock().partial_transfers = count;
    }

    /// While stalled, transfers never raise their completion event.
    pub fn stall_transfers(&self, stall: bool) {
        self.0.state.lock().stall_transfers = stall;
    }

    pub fn is_capturing(&self) -> bool {
        self.0.state.lock().capturing
    }

    pub fn frame_period(&self) -> Duration {
        self.0.frame_period.as_duration()
    }

    pub fn frames_written(&self) -> u64 {
        self.0.state.lock().frames_written
    }

    pub fn timer_ticks(&self) -> u64 {
        self.0.state.lock().timer_ticks
    }

    pub fn channels_opened(&self) -> u32 {
        self.0.state.lock().channels_opened
    }

    pub fn channels_closed(&self) -> u32 {
        self.0.state.lock().channels_closed
    }

    pub fn stop_calls(&self) -> u32 {
        self.0.state.lock().stop_calls
    }

    pub fn releases(&self) -> u32 {
        self.0.state.lock().releases
    }
}
