//! Ownership of one open capture channel.
//!
//! A [`DeviceSession`] moves through `Closed`, `Open` and `Grabbing`. It owns the channel handle,
//! every event registered against it, and the anchor used to map device ticks onto wall-clock
//! time. Status queries always go to the driver; nothing is cached between frames.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::settings::{CaptureSettings, FrameProperties, TransferMode};
use super::status::{
    DeviceClock, DeviceTicks, FrameInfo, OnDeviceBufferStatus, SignalState, SignalStatus,
    TransferStatus,
};
use super::timer::FrameTimer;
use crate::driver::{CaptureDriver, ChannelHandle, FrameRequest};
use crate::error::{CaptureError, Result};
use crate::events::{DeviceEvents, Notification, NotificationKind, NotifyFlags};
use crate::utils::auto_detect_device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Grabbing,
}

/// Notifications each transfer mode registers at construction.
pub fn notifications_for(mode: TransferMode) -> &'static [NotificationKind] {
    match mode {
        TransferMode::Timer => &[NotificationKind::SignalChange, NotificationKind::Timer],
        TransferMode::Normal => &[
            NotificationKind::SignalChange,
            NotificationKind::FrameBuffered,
        ],
        TransferMode::LowLatency => &[
            NotificationKind::SignalChange,
            NotificationKind::FrameBuffering,
        ],
    }
}

pub struct DeviceSession<D: CaptureDriver> {
    driver: D,
    settings: CaptureSettings,
    channel: Option<ChannelHandle>,
    events: DeviceEvents,
    timer: Option<FrameTimer>,
    clock: DeviceClock,
    state: SessionState,
    transfer_frame_index: Option<u8>,
}

impl<D: CaptureDriver> DeviceSession<D> {
    /// Opens the first channel the driver reports.
    pub fn new(driver: D, settings: CaptureSettings) -> Result<Self> {
        Self::open(driver, settings, None)
    }

    /// Validates `settings`, opens the channel at `path` (or auto-detects one), creates the
    /// session's events and registers the notifications `settings.transfer_mode` needs.
    ///
    /// Invalid settings are rejected before the driver is touched.
    pub fn open(driver: D, settings: CaptureSettings, path: Option<&str>) -> Result<Self> {
        settings.validate()?;

        let path = match path {
            Some(path) => path.to_owned(),
            None => match auto_detect_device(&driver) {
                Ok(found) => found.path,
                Err(e) => return Err(abandon(&driver, None, e)),
            },
        };
        let channel = match driver.open_channel(&path) {
            Ok(channel) => channel,
            Err(e) => return Err(abandon(&driver, None, e)),
        };
        info!("Opened capture channel {}", path);

        let prepared = DeviceEvents::new(|| driver.create_event()).and_then(|events| {
            // Wall clock first: mapped device times then err early, never late.
            let anchor_wall = Utc::now();
            let anchor_ticks = driver.device_time(channel)?;
            Ok((events, DeviceClock::new(anchor_wall, anchor_ticks)))
        });
        let (events, clock) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Err(abandon(&driver, Some(channel), e)),
        };

        let mut session = Self {
            driver,
            settings,
            channel: Some(channel),
            events,
            timer: None,
            clock,
            state: SessionState::Open,
            transfer_frame_index: None,
        };
        session.register_notifications(channel)?;
        Ok(session)
    }

    fn register_notifications(&mut self, channel: ChannelHandle) -> Result<()> {
        for &kind in notifications_for(self.settings.transfer_mode) {
            let event = self.events.get_mut(kind);
            let handle = match event.registration_token() {
                Some(token) => self.driver.register_notify(channel, event.event(), token)?,
                None => self.driver.register_timer(channel, event.event())?,
            };
            event.register(Notification::new(handle, channel));
            if kind == NotificationKind::Timer {
                self.timer = Some(FrameTimer::new(handle));
            }
            debug!(?kind, "notification registered");
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.settings.transfer_mode
    }

    pub fn events(&self) -> &DeviceEvents {
        &self.events
    }

    pub fn frame_properties(&self) -> FrameProperties {
        self.settings.frame_properties()
    }

    fn channel(&self) -> Result<ChannelHandle> {
        self.channel.ok_or(CaptureError::InvalidState {
            expected: SessionState::Open,
            actual: SessionState::Closed,
        })
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Starts capture and checks the input signal. An unlocked signal closes the session.
    #[instrument(skip(self))]
    pub fn start_grabbing(&mut self) -> Result<()> {
        self.expect_state(SessionState::Open)?;
        let channel = self.channel()?;
        self.driver
            .start_capture(channel, &self.events.transfer_complete)?;
        self.state = SessionState::Grabbing;

        let signal = match self.signal_status() {
            Ok(signal) => signal,
            Err(e) => {
                self.shutdown();
                return Err(e);
            }
        };
        info!(
            state = ?signal.state,
            cols = signal.image_dimensions.cols,
            rows = signal.image_dimensions.rows,
            fps = signal.fps(),
            interlaced = signal.interlaced,
            "Grabbing started"
        );
        if signal.state != SignalState::Locked {
            warn!("Input signal is {:?}, closing session", signal.state);
            self.shutdown();
            return Err(CaptureError::SignalNotLocked(signal.state));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop_grabbing(&mut self) -> Result<()> {
        self.expect_state(SessionState::Grabbing)?;
        let channel = self.channel()?;
        self.driver.stop_capture(channel)?;
        self.state = SessionState::Open;
        info!("Grabbing stopped");
        Ok(())
    }

    /// Starts copying a frame from the card into `buffer` and returns when the request was issued.
    ///
    /// Returns immediately. `buffer` belongs to the driver until the transfer-complete event
    /// fires and must not be read before then.
    #[instrument(skip(self, buffer), level = "trace")]
    pub fn start_a_frame_transfer(&mut self, buffer: &mut [u8]) -> Result<DateTime<Utc>> {
        self.expect_state(SessionState::Grabbing)?;
        let properties = self.frame_properties();
        if buffer.len() < properties.size_in_bytes {
            return Err(CaptureError::BufferTooSmall {
                required: properties.size_in_bytes,
                actual: buffer.len(),
            });
        }
        let channel = self.channel()?;

        let buffer_status = self.driver.buffer_status(channel)?;
        let frame_index = self.target_frame_index(&buffer_status);
        let partial_notify_lines = match self.settings.transfer_mode {
            TransferMode::LowLatency => self.settings.num_lines_per_chunk,
            TransferMode::Timer | TransferMode::Normal => 0,
        };
        let request = FrameRequest::new(
            frame_index,
            properties.format,
            properties.dimensions.cols,
            properties.dimensions.rows,
            self.settings.min_stride(),
            properties.size_in_bytes,
            partial_notify_lines,
        );

        let started = Utc::now();
        self.driver.capture_frame(channel, &request, buffer)?;
        self.transfer_frame_index = Some(frame_index);
        Ok(started)
    }

    fn target_frame_index(&self, status: &OnDeviceBufferStatus) -> u8 {
        match self.settings.transfer_mode {
            TransferMode::LowLatency => status.newest_buffering_index,
            TransferMode::Timer | TransferMode::Normal => status.last_buffered_frame_index,
        }
    }

    pub fn signal_status(&self) -> Result<SignalStatus> {
        self.driver.signal_status(self.channel()?)
    }

    pub fn buffer_status(&self) -> Result<OnDeviceBufferStatus> {
        self.driver.buffer_status(self.channel()?)
    }

    /// Info for the frame the current mode would transfer next.
    ///
    /// Reads the buffer status first to learn the frame index; the index may move on between the
    /// two reads.
    pub fn frame_info(&self) -> Result<FrameInfo> {
        let status = self.buffer_status()?;
        self.frame_info_at(self.target_frame_index(&status))
    }

    /// Info for the frame most recently requested with [`Self::start_a_frame_transfer`].
    pub fn transferred_frame_info(&self) -> Result<FrameInfo> {
        match self.transfer_frame_index {
            Some(index) => self.frame_info_at(index),
            None => self.frame_info(),
        }
    }

    fn frame_info_at(&self, frame_index: u8) -> Result<FrameInfo> {
        let raw = self.driver.frame_info(self.channel()?, frame_index)?;
        Ok(raw.into_frame_info(&self.clock))
    }

    /// Reading the transfer status releases the on-card buffer of the last transfer.
    pub fn transfer_status(&self) -> Result<TransferStatus> {
        self.driver.transfer_status(self.channel()?)
    }

    pub fn device_time(&self) -> Result<DeviceTicks> {
        self.driver.device_time(self.channel()?)
    }

    pub fn device_time_as_wall(&self) -> Result<DateTime<Utc>> {
        Ok(self.clock.to_wall(self.device_time()?))
    }

    pub fn fps(&self) -> Result<f64> {
        Ok(self.signal_status()?.fps())
    }

    /// Status bits raised for `kind` since the last read.
    pub fn notification_status(&self, kind: NotificationKind) -> Result<NotifyFlags> {
        let notification = self
            .events
            .get(kind)
            .notification()
            .ok_or(CaptureError::NotRegistered(kind))?;
        if kind == NotificationKind::Timer {
            return Ok(NotifyFlags::empty());
        }
        self.driver
            .notify_status(notification.channel, notification.handle)
    }

    /// Arms the device timer for the next frame tick.
    pub fn schedule_timer_event(&mut self) -> Result<DeviceTicks> {
        let channel = self.channel()?;
        let timer = self
            .timer
            .as_mut()
            .ok_or(CaptureError::NotRegistered(NotificationKind::Timer))?;
        timer.schedule(&self.driver, channel)
    }

    /// Stops capture if running, unregisters notifications, destroys events, closes the channel
    /// and releases the driver. Does nothing on a closed session.
    pub fn shutdown(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if self.state == SessionState::Grabbing {
            if let Err(e) = self.driver.stop_capture(channel) {
                warn!("Failed to stop capture: {}", e);
            }
        }
        for event in self.events.registered() {
            let Some(notification) = event.notification() else {
                continue;
            };
            let result = match event.kind() {
                NotificationKind::Timer => {
                    self.driver.unregister_timer(channel, notification.handle)
                }
                _ => self.driver.unregister_notify(channel, notification.handle),
            };
            if let Err(e) = result {
                warn!("Failed to unregister {:?} notification: {}", event.kind(), e);
            }
        }
        self.events.destroy_all();
        self.timer = None;
        self.driver.close_channel(channel);
        self.driver.release();
        self.state = SessionState::Closed;
        info!("Device session closed");
    }
}

impl<D: CaptureDriver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn abandon<D: CaptureDriver>(
    driver: &D,
    channel: Option<ChannelHandle>,
    error: CaptureError,
) -> CaptureError {
    warn!("Failed to open device session: {}", error);
    if let Some(channel) = channel {
        driver.close_channel(channel);
    }
    driver.release();
    error
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::settings::{ColourFormat, ImageSize};
    use crate::driver::MockDriver;
    use crate::events::wait_for_event;

    const SMALL: ImageSize = ImageSize::new(320, 240);

    fn settings(mode: TransferMode) -> CaptureSettings {
        CaptureSettings::new(SMALL, ColourFormat::Bgr24, mode, 64).unwrap()
    }

    fn mock(rate: f64) -> MockDriver {
        MockDriver::builder()
            .frame_rate_hz(rate)
            .resolution(SMALL)
            .build()
            .unwrap()
    }

    #[test]
    fn each_mode_registers_exactly_one_grab_event() {
        for mode in [
            TransferMode::Timer,
            TransferMode::Normal,
            TransferMode::LowLatency,
        ] {
            let session = DeviceSession::new(mock(2.0), settings(mode)).unwrap();
            let events = session.events();
            let grab_kinds = [
                NotificationKind::Timer,
                NotificationKind::FrameBuffered,
                NotificationKind::FrameBuffering,
            ];
            let registered: Vec<_> = grab_kinds
                .iter()
                .filter(|&&kind| events.get(kind).is_registered())
                .collect();

            assert_eq!(registered.len(), 1, "{mode:?}");
            assert!(events.grab_event(mode).is_registered(), "{mode:?}");
            assert!(events.signal_change.is_registered(), "{mode:?}");
            assert_eq!(session.state(), SessionState::Open);
        }
    }

    #[test]
    fn invalid_chunk_size_fails_before_any_driver_call() {
        for lines in [50, 32] {
            let driver = mock(2.0);
            let controls = driver.controls();
            let bad = CaptureSettings {
                num_lines_per_chunk: lines,
                ..settings(TransferMode::LowLatency)
            };

            let err = DeviceSession::new(driver, bad).err().unwrap();
            assert!(matches!(err, CaptureError::Config(_)), "{err}");
            assert_eq!(controls.channels_opened(), 0);
            assert_eq!(controls.releases(), 0);
        }
    }

    #[test]
    fn transfer_before_grabbing_is_rejected() {
        let mut session = DeviceSession::new(mock(2.0), settings(TransferMode::Normal)).unwrap();
        let mut buffer = vec![0u8; session.frame_properties().size_in_bytes];

        let err = session.start_a_frame_transfer(&mut buffer).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidState {
                expected: SessionState::Grabbing,
                actual: SessionState::Open,
            }
        ));
    }

    #[test]
    fn unlocked_signal_closes_the_session() {
        let driver = MockDriver::builder()
            .resolution(SMALL)
            .signal_state(SignalState::Locking)
            .build()
            .unwrap();
        let controls = driver.controls();
        let mut session = DeviceSession::new(driver, settings(TransferMode::Normal)).unwrap();

        let err = session.start_grabbing().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SignalNotLocked(SignalState::Locking)
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(controls.stop_calls(), 1);
        assert_eq!(controls.channels_closed(), 1);
        assert_eq!(controls.releases(), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let driver = mock(2.0);
        let controls = driver.controls();
        let mut session = DeviceSession::new(driver, settings(TransferMode::Timer)).unwrap();
        session.start_grabbing().unwrap();

        session.shutdown();
        session.shutdown();
        drop(session);

        assert_eq!(controls.stop_calls(), 1);
        assert_eq!(controls.channels_closed(), 1);
        assert_eq!(controls.releases(), 1);
    }

    #[test]
    fn a_completed_transfer_rewrites_the_buffer() {
        let mut session = DeviceSession::new(mock(2.0), settings(TransferMode::Normal)).unwrap();
        session.start_grabbing().unwrap();
        let mut buffer = vec![0u8; session.frame_properties().size_in_bytes];
        let before = buffer.clone();

        session.start_a_frame_transfer(&mut buffer).unwrap();
        wait_for_event(&session.events().transfer_complete, Duration::from_secs(1)).unwrap();

        assert!(session.transfer_status().unwrap().whole_frame_transferred);
        assert_ne!(buffer, before);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut session = DeviceSession::new(mock(2.0), settings(TransferMode::Normal)).unwrap();
        session.start_grabbing().unwrap();
        let mut buffer = vec![0u8; 16];

        assert!(matches!(
            session.start_a_frame_transfer(&mut buffer),
            Err(CaptureError::BufferTooSmall { actual: 16, .. })
        ));
    }

    #[test]
    fn device_time_maps_close_to_now() {
        let session = DeviceSession::new(mock(2.0), settings(TransferMode::Timer)).unwrap();
        let mapped = session.device_time_as_wall().unwrap();
        let skew = (Utc::now() - mapped).num_milliseconds().abs();

        assert!(skew < 50, "skew {skew} ms");
        assert!((session.fps().unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn status_of_unregistered_notification_is_an_error() {
        let mut session = DeviceSession::new(mock(2.0), settings(TransferMode::Normal)).unwrap();
        assert!(matches!(
            session.notification_status(NotificationKind::FrameBuffering),
            Err(CaptureError::NotRegistered(NotificationKind::FrameBuffering))
        ));
        assert!(matches!(
            session.schedule_timer_event(),
            Err(CaptureError::NotRegistered(NotificationKind::Timer))
        ));
        assert_eq!(
            session
                .notification_status(NotificationKind::SignalChange)
                .unwrap(),
            NotifyFlags::empty()
        );
    }
}
