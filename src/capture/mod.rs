pub mod controller;
pub mod frame;
pub mod session;
pub mod settings;
pub mod status;
pub mod timer;

pub use controller::{AcquisitionController, AcquisitionState};
pub use frame::{VideoFrame, VideoFrameTimestamps};
pub use session::{DeviceSession, SessionState};
pub use settings::{CaptureSettings, ColourFormat, FrameProperties, ImageSize, TransferMode};
pub use timer::FrameTimer;
