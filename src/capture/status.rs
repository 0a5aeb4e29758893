//! Status snapshots read from the driver, and device clock conversion.

use std::ops::{Add, Sub};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::settings::{AspectRatio, ImageSize};

/// One device clock tick is 100 ns.
pub const DEVICE_TICK_NANOS: i64 = 100;

pub const TICKS_PER_SECOND: i64 = 1_000_000_000 / DEVICE_TICK_NANOS;

/// A reading of the card's free-running clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceTicks(pub i64);

impl DeviceTicks {
    pub fn from_duration(duration: Duration) -> Self {
        Self((duration.as_nanos() / DEVICE_TICK_NANOS as u128) as i64)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * TICKS_PER_SECOND as f64).round() as i64)
    }

    /// Negative tick counts saturate to zero.
    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0.max(0) as u64 * DEVICE_TICK_NANOS as u64)
    }
}

impl Add for DeviceTicks {
    type Output = DeviceTicks;

    fn add(self, rhs: Self) -> Self {
        DeviceTicks(self.0 + rhs.0)
    }
}

impl Sub for DeviceTicks {
    type Output = DeviceTicks;

    fn sub(self, rhs: Self) -> Self {
        DeviceTicks(self.0 - rhs.0)
    }
}

/// Maps device ticks onto wall-clock time using one anchor pair captured when the session opened.
///
/// The anchor is never refreshed: drift is tolerated, discontinuities are not.
#[derive(Debug, Clone, Copy)]
pub struct DeviceClock {
    anchor_wall: DateTime<Utc>,
    anchor_ticks: DeviceTicks,
}

impl DeviceClock {
    pub fn new(anchor_wall: DateTime<Utc>, anchor_ticks: DeviceTicks) -> Self {
        Self {
            anchor_wall,
            anchor_ticks,
        }
    }

    pub fn to_wall(&self, ticks: DeviceTicks) -> DateTime<Utc> {
        let delta = (ticks - self.anchor_ticks).0;
        self.anchor_wall + TimeDelta::nanoseconds(delta.saturating_mul(DEVICE_TICK_NANOS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    None,
    Unsupported,
    Locking,
    Locked,
}

impl SignalState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            3 => SignalState::Locked,
            2 => SignalState::Locking,
            1 => SignalState::Unsupported,
            _ => SignalState::None,
        }
    }
}

/// Input signal description. Always read fresh from the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalStatus {
    pub state: SignalState,
    pub start_position: (u32, u32),
    pub image_dimensions: ImageSize,
    /// Including blanking.
    pub total_dimensions: ImageSize,
    pub interlaced: bool,
    pub frame_period: DeviceTicks,
    pub aspect_ratio: AspectRatio,
    pub segmented: bool,
}

impl SignalStatus {
    pub fn frame_period_s(&self) -> f64 {
        self.frame_period.0 as f64 / TICKS_PER_SECOND as f64
    }

    /// Frames per second; an interlaced signal delivers two fields per period.
    pub fn fps(&self) -> f64 {
        if self.frame_period.0 <= 0 {
            return 0.0;
        }
        let fps = 1.0 / self.frame_period_s();
        if self.interlaced {
            fps * 2.0
        } else {
            fps
        }
    }
}

/// Progress of the most recent frame transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStatus {
    pub frame_index: i32,
    pub whole_frame_transferred: bool,
    pub num_lines_transferred: u32,
    pub num_lines_transferred_previously: u32,
}

/// Occupancy of the on-card frame cache. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OnDeviceBufferStatus {
    /// Maximum number of frames in on-board cache.
    pub buffer_size_in_frames: u32,
    /// Index of the frame currently being buffered.
    pub newest_buffering_index: u8,
    pub buffering_field_index: u8,
    /// Index of the most recently buffered slice.
    pub newest_buffered_index: u8,
    pub buffered_field_index: u8,
    /// Index of the most recently buffered full frame.
    pub last_buffered_frame_index: u8,
    pub num_fully_buffered_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Initial,
    BufferingTopField,
    BufferingBottomField,
    Buffered,
}

impl FrameState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => FrameState::BufferingTopField,
            2 => FrameState::BufferingBottomField,
            3 => FrameState::Buffered,
            _ => FrameState::Initial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Top,
    Bottom,
}

/// Frame information as the driver reports it, with device-clock timestamps per field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFrameInfo {
    pub state: FrameState,
    pub interlaced: bool,
    pub segmented: bool,
    pub top_field_first: bool,
    pub dimensions: ImageSize,
    pub aspect_ratio: AspectRatio,
    pub field_start_times: [DeviceTicks; 2],
    pub field_buffered_times: [DeviceTicks; 2],
}

impl RawFrameInfo {
    /// The field whose timing describes the whole frame: the bottom field completes an
    /// interlaced frame.
    pub fn timing_field(&self) -> Field {
        if self.interlaced {
            Field::Bottom
        } else {
            Field::Top
        }
    }

    pub fn into_frame_info(self, clock: &DeviceClock) -> FrameInfo {
        let i = match self.timing_field() {
            Field::Top => 0,
            Field::Bottom => 1,
        };
        FrameInfo {
            state: self.state,
            interlaced: self.interlaced,
            segmented: self.segmented,
            dimensions: self.dimensions,
            aspect_ratio: self.aspect_ratio,
            buffering_started: clock.to_wall(self.field_start_times[i]),
            buffering_complete: clock.to_wall(self.field_buffered_times[i]),
        }
    }
}

/// Buffering state of a frame with timestamps converted to wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub state: FrameState,
    pub interlaced: bool,
    pub segmented: bool,
    pub dimensions: ImageSize,
    pub aspect_ratio: AspectRatio,
    pub buffering_started: DateTime<Utc>,
    pub buffering_complete: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_maps_ticks_linearly_from_anchor() {
        let anchor = Utc::now();
        let clock = DeviceClock::new(anchor, DeviceTicks(5_000_000));

        assert_eq!(clock.to_wall(DeviceTicks(5_000_000)), anchor);
        assert_eq!(
            clock.to_wall(DeviceTicks(15_000_000)),
            anchor + TimeDelta::seconds(1)
        );
        assert_eq!(
            clock.to_wall(DeviceTicks(4_999_990)),
            anchor - TimeDelta::microseconds(1)
        );
    }

    #[test]
    fn ticks_convert_to_and_from_durations() {
        assert_eq!(DeviceTicks::from_duration(Duration::from_millis(500)), DeviceTicks(5_000_000));
        assert_eq!(DeviceTicks(10).as_duration(), Duration::from_micros(1));
        assert_eq!(DeviceTicks::from_secs_f64(1.0 / 60.0), DeviceTicks(166_667));
        assert_eq!(DeviceTicks(-5).as_duration(), Duration::ZERO);
    }

    #[test]
    fn interlaced_frames_are_timed_by_bottom_field() {
        let clock = DeviceClock::new(Utc::now(), DeviceTicks(0));
        let raw = RawFrameInfo {
            state: FrameState::Buffered,
            interlaced: true,
            segmented: false,
            top_field_first: true,
            dimensions: ImageSize::new(1920, 1080),
            aspect_ratio: AspectRatio { hor: 16, ver: 9 },
            field_start_times: [DeviceTicks(0), DeviceTicks(200)],
            field_buffered_times: [DeviceTicks(100), DeviceTicks(300)],
        };
        let info = raw.into_frame_info(&clock);
        assert_eq!(info.buffering_started, clock.to_wall(DeviceTicks(200)));
        assert_eq!(info.buffering_complete, clock.to_wall(DeviceTicks(300)));

        let progressive = RawFrameInfo {
            interlaced: false,
            ..raw
        }
        .into_frame_info(&clock);
        assert_eq!(progressive.buffering_started, clock.to_wall(DeviceTicks(0)));
    }

    #[test]
    fn interlaced_signal_doubles_fps() {
        let mut status = SignalStatus {
            state: SignalState::Locked,
            start_position: (0, 0),
            image_dimensions: ImageSize::new(1920, 1080),
            total_dimensions: ImageSize::new(2200, 1125),
            interlaced: false,
            frame_period: DeviceTicks(400_000),
            aspect_ratio: AspectRatio { hor: 16, ver: 9 },
            segmented: false,
        };
        assert!((status.fps() - 25.0).abs() < 1e-9);
        status.interlaced = true;
        assert!((status.fps() - 50.0).abs() < 1e-9);
    }
}
