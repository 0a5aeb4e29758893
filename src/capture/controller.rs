//! The acquisition state machine.
//!
//! [`AcquisitionController::transfer_when_ready`] waits for the grab event of the session's
//! transfer mode (or a signal change), drives one transfer into the controller's buffer, checks it
//! arrived whole, and copies it out as a timestamped [`VideoFrame`]. Signal changes and partial
//! frames are retried in a bounded loop; anything else shuts the controller down.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::frame::{VideoFrame, VideoFrameTimestamps};
use super::session::{DeviceSession, SessionState};
use super::settings::TransferMode;
use crate::driver::CaptureDriver;
use crate::error::{CaptureError, Result};
use crate::events::{wait_for_any, wait_for_event, WaitError};
use crate::AcquisitionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    WaitingForGrabEvent,
    Transferring,
    WaitingForTransferComplete,
    FrameReady,
    SignalChanged,
    TimedOut,
    Failed,
}

fn grab_event_name(mode: TransferMode) -> &'static str {
    match mode {
        TransferMode::Timer => "the frame timer",
        TransferMode::Normal => "a buffered frame",
        TransferMode::LowLatency => "a frame to start buffering",
    }
}

fn wait_error(error: WaitError, waiting_for: &'static str, timeout: Duration) -> CaptureError {
    match error {
        WaitError::Timeout => CaptureError::WaitTimeout {
            waiting_for,
            timeout_ms: timeout.as_millis() as u64,
        },
        other => CaptureError::Wait(other.to_string()),
    }
}

pub struct AcquisitionController<D: CaptureDriver> {
    session: DeviceSession<D>,
    config: AcquisitionConfig,
    // Written by the driver between start_a_frame_transfer and the transfer-complete event only.
    buffer: Vec<u8>,
    state: AcquisitionState,
    sequence: u64,
    // A timer tick is scheduled and has not fired yet.
    timer_pending: bool,
    shut_down: bool,
}

impl<D: CaptureDriver> AcquisitionController<D> {
    /// Takes ownership of an open session and starts grabbing.
    pub fn new(session: DeviceSession<D>) -> Result<Self> {
        Self::with_config(session, AcquisitionConfig::default())
    }

    pub fn with_config(mut session: DeviceSession<D>, config: AcquisitionConfig) -> Result<Self> {
        let buffer = vec![0u8; session.frame_properties().size_in_bytes];
        session.start_grabbing()?;
        info!(
            mode = ?session.transfer_mode(),
            bytes = buffer.len(),
            "Acquisition controller ready"
        );
        Ok(Self {
            session,
            config,
            buffer,
            state: AcquisitionState::Idle,
            sequence: 0,
            timer_pending: false,
            shut_down: false,
        })
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn session(&self) -> &DeviceSession<D> {
        &self.session
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn frames_acquired(&self) -> u64 {
        self.sequence
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Blocks until a whole frame has been transferred, or fails.
    ///
    /// `timeout` bounds each wait for a grab event. A timeout, a driver failure, or more than
    /// `max_consecutive_misses` rounds without a frame shut the controller down; later calls
    /// return [`CaptureError::ShutDown`].
    #[instrument(skip(self))]
    pub fn transfer_when_ready(&mut self, timeout: Duration) -> Result<VideoFrame> {
        if self.shut_down {
            return Err(CaptureError::ShutDown);
        }

        let mut misses = 0;
        loop {
            match self.attempt(timeout) {
                Ok(Some(frame)) => {
                    self.state = AcquisitionState::FrameReady;
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    warn!("{}, retrying", e);
                    metrics::counter!("partial_frame_retries").increment(1);
                }
                Err(e) => {
                    if !matches!(e, CaptureError::WaitTimeout { .. }) {
                        self.state = AcquisitionState::Failed;
                    }
                    error!("Acquisition failed: {}", e);
                    self.shutdown();
                    return Err(e);
                }
            }

            misses += 1;
            if misses >= self.config.max_consecutive_misses {
                error!("No frame after {} consecutive attempts", misses);
                self.state = AcquisitionState::Failed;
                self.shutdown();
                return Err(CaptureError::RetriesExhausted(misses));
            }
        }
    }

    /// One wait-and-dispatch round. `Ok(None)` means the signal changed.
    fn attempt(&mut self, timeout: Duration) -> Result<Option<VideoFrame>> {
        let mode = self.session.transfer_mode();
        if mode == TransferMode::Timer && !self.timer_pending {
            self.session.schedule_timer_event()?;
            self.timer_pending = true;
        }

        self.state = AcquisitionState::WaitingForGrabEvent;
        let events = self.session.events();
        // Grab event first: a ready frame wins over a simultaneous signal change.
        let fired = wait_for_any(
            &[events.grab_event(mode).event(), events.signal_change.event()],
            timeout,
        );

        match fired {
            Ok(0) => {
                self.timer_pending = false;
                self.transfer(mode).map(Some)
            }
            Ok(_) => {
                self.state = AcquisitionState::SignalChanged;
                metrics::counter!("signal_changes").increment(1);
                match self.session.signal_status() {
                    Ok(signal) => info!(
                        state = ?signal.state,
                        cols = signal.image_dimensions.cols,
                        rows = signal.image_dimensions.rows,
                        "Signal change detected"
                    ),
                    Err(e) => warn!("Signal change detected, status unavailable: {}", e),
                }
                Ok(None)
            }
            Err(e) => {
                if e == WaitError::Timeout {
                    self.state = AcquisitionState::TimedOut;
                    metrics::counter!("wait_timeouts").increment(1);
                }
                Err(wait_error(e, grab_event_name(mode), timeout))
            }
        }
    }

    fn transfer(&mut self, mode: TransferMode) -> Result<VideoFrame> {
        self.state = AcquisitionState::Transferring;
        let transfer_started = self.session.start_a_frame_transfer(&mut self.buffer)?;

        self.state = AcquisitionState::WaitingForTransferComplete;
        let transfer_timeout = self.config.transfer_timeout();
        if let Err(e) = wait_for_event(&self.session.events().transfer_complete, transfer_timeout)
        {
            if e == WaitError::Timeout {
                self.state = AcquisitionState::TimedOut;
                metrics::counter!("wait_timeouts").increment(1);
            }
            return Err(wait_error(e, "transfer completion", transfer_timeout));
        }

        let rows = self.session.settings().dimensions.rows;
        match mode {
            TransferMode::LowLatency => self.wait_for_all_lines(rows)?,
            TransferMode::Timer | TransferMode::Normal => {
                let status = self.session.transfer_status()?;
                if !status.whole_frame_transferred {
                    return Err(CaptureError::PartialFrame {
                        lines_transferred: status.num_lines_transferred,
                        rows,
                    });
                }
            }
        }
        let transfer_complete = Utc::now();
        let info = self.session.transferred_frame_info()?;

        let frame = VideoFrame {
            data: Bytes::copy_from_slice(&self.buffer),
            dimensions: self.session.settings().dimensions,
            format: self.session.settings().colour_format,
            timestamps: VideoFrameTimestamps {
                buffering_started: info.buffering_started,
                buffering_complete: info.buffering_complete,
                transfer_started,
                transfer_complete,
            },
            sequence: self.sequence,
        };
        self.sequence += 1;

        metrics::counter!("frames_acquired").increment(1);
        let latency = transfer_complete - info.buffering_complete;
        metrics::histogram!("frame_latency_ms").record(latency.num_milliseconds() as f64);
        debug!(sequence = frame.sequence, "Frame transferred");
        Ok(frame)
    }

    // Spins on the driver's line counter so the frame is handed out the moment its last line lands.
    fn wait_for_all_lines(&self, rows: u32) -> Result<()> {
        let deadline = Instant::now() + self.config.low_latency_poll_budget();
        loop {
            let status = self.session.transfer_status()?;
            if status.whole_frame_transferred || status.num_lines_transferred >= rows {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::PartialFrame {
                    lines_transferred: status.num_lines_transferred,
                    rows,
                });
            }
            thread::yield_now();
        }
    }

    /// Stops grabbing and closes the session. Runs once; later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.session.state() == SessionState::Grabbing {
            if let Err(e) = self.session.stop_grabbing() {
                warn!("Failed to stop grabbing: {}", e);
            }
        }
        self.session.shutdown();
        info!("Acquisition controller shut down after {} frames", self.sequence);
    }
}

impl<D: CaptureDriver> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::settings::{CaptureSettings, ColourFormat, ImageSize};
    use crate::driver::MockDriver;

    fn controller(mode: TransferMode, rate: f64) -> AcquisitionController<MockDriver> {
        let size = ImageSize::new(64, 48);
        let driver = MockDriver::builder()
            .frame_rate_hz(rate)
            .resolution(size)
            .build()
            .unwrap();
        let settings = CaptureSettings::new(size, ColourFormat::Rgb24, mode, 64).unwrap();
        let session = DeviceSession::new(driver, settings).unwrap();
        AcquisitionController::new(session).unwrap()
    }

    #[test]
    fn starts_idle_and_grabbing() {
        let controller = controller(TransferMode::Normal, 20.0);
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(controller.session().state(), SessionState::Grabbing);
    }

    #[test]
    fn frames_are_numbered_in_order() {
        let mut controller = controller(TransferMode::Normal, 50.0);
        for expected in 0..3 {
            let frame = controller
                .transfer_when_ready(Duration::from_secs(1))
                .unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(controller.state(), AcquisitionState::FrameReady);
        }
        assert_eq!(controller.frames_acquired(), 3);
    }

    #[test]
    fn calls_after_shutdown_are_rejected() {
        let mut controller = controller(TransferMode::Timer, 20.0);
        controller.shutdown();
        controller.shutdown();

        assert!(controller.is_shut_down());
        assert_eq!(controller.session().state(), SessionState::Closed);
        assert!(matches!(
            controller.transfer_when_ready(Duration::from_millis(10)),
            Err(CaptureError::ShutDown)
        ));
    }
}
