//! Error types for configuration and acquisition.

use thiserror::Error;

use crate::capture::settings::{ColourFormat, ImageSize, MIN_LINES_PER_CHUNK};
use crate::driver::mock::MAX_MOCK_FRAME_RATE_HZ;
use crate::capture::status::{DeviceTicks, SignalState};
use crate::capture::SessionState;
use crate::events::NotificationKind;

/// Problems detected while building or validating settings. Always fatal at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("minimum number of lines per chunk is {MIN_LINES_PER_CHUNK}, got {0}")]
    ChunkTooSmall(u32),

    #[error("number of lines per chunk must be a power of 2, got {0}")]
    ChunkNotPowerOfTwo(u32),

    #[error("colour format {0:?} is not supported")]
    UnsupportedColourFormat(ColourFormat),

    #[error("{dimensions:?} is not a valid frame size for {format:?}")]
    InvalidDimensions {
        dimensions: ImageSize,
        format: ColourFormat,
    },

    #[error("mock frame rate must be in (0, {max}] Hz, got {0}", max = MAX_MOCK_FRAME_RATE_HZ)]
    InvalidFrameRate(f64),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Everything that can go wrong between opening a channel and handing out a frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("input signal not locked (state: {0:?})")]
    SignalNotLocked(SignalState),

    #[error("signal reports frame period {period:?} (state: {state:?}), cannot schedule frame timer")]
    InvalidFramePeriod {
        state: SignalState,
        period: DeviceTicks,
    },

    #[error("timed out after {timeout_ms} ms waiting for {waiting_for}")]
    WaitTimeout {
        waiting_for: &'static str,
        timeout_ms: u64,
    },

    #[error("only part of the frame was transferred ({lines_transferred} of {rows} lines)")]
    PartialFrame { lines_transferred: u32, rows: u32 },

    #[error("driver call {call} failed with status {status}")]
    Driver { call: &'static str, status: i32 },

    #[error("operation requires a {expected:?} session, but it is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("{0:?} notification is not registered in this transfer mode")]
    NotRegistered(NotificationKind),

    #[error("transfer buffer holds {actual} bytes, frame needs {required}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("no frame after {0} consecutive attempts")]
    RetriesExhausted(u32),

    #[error("acquisition controller has been shut down")]
    ShutDown,

    #[error("no capture device found")]
    NoDevice,

    #[error("event wait failed: {0}")]
    Wait(String),

    #[error("failed to load capture library: {0}")]
    Library(String),

    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl CaptureError {
    /// Errors after which another `transfer_when_ready` round may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::PartialFrame { .. })
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
