//! Device timer pacing for timer-driven transfers.

use tracing::trace;

use super::status::{DeviceTicks, SignalStatus};
use crate::driver::{CaptureDriver, ChannelHandle};
use crate::error::{CaptureError, Result};
use crate::events::NotifyHandle;

/// Arms the device timer once per frame period.
///
/// Only one tick may be pending at a time: call [`FrameTimer::schedule`] once, wait for the timer
/// event, then schedule again.
#[derive(Debug)]
pub struct FrameTimer {
    handle: NotifyHandle,
    frame_expire: Option<DeviceTicks>,
}

impl FrameTimer {
    pub fn new(handle: NotifyHandle) -> Self {
        Self {
            handle,
            frame_expire: None,
        }
    }

    pub fn handle(&self) -> NotifyHandle {
        self.handle
    }

    /// Device time of the most recently scheduled tick.
    pub fn frame_expire(&self) -> Option<DeviceTicks> {
        self.frame_expire
    }

    /// Moves the expiry one period forward, starting from the current device time the first time.
    pub fn advance(
        &mut self,
        now: impl FnOnce() -> Result<DeviceTicks>,
        period: DeviceTicks,
    ) -> Result<DeviceTicks> {
        let current = match self.frame_expire {
            Some(expire) => expire,
            None => now()?,
        };
        let next = current + period;
        self.frame_expire = Some(next);
        Ok(next)
    }

    pub fn schedule<D: CaptureDriver>(
        &mut self,
        driver: &D,
        channel: ChannelHandle,
    ) -> Result<DeviceTicks> {
        let period = frame_period(&driver.signal_status(channel)?)?;
        let expiry = self.advance(|| driver.device_time(channel), period)?;
        driver.schedule_timer(channel, self.handle, expiry)?;
        trace!(expiry = expiry.0, "frame timer armed");
        Ok(expiry)
    }
}

fn frame_period(signal: &SignalStatus) -> Result<DeviceTicks> {
    if signal.frame_period.0 > 0 {
        Ok(signal.frame_period)
    } else {
        Err(CaptureError::InvalidFramePeriod {
            state: signal.state,
            period: signal.frame_period,
        })
    }
}
