//! Frame delivery from a dedicated acquisition thread to consumers.
//!
//! The acquisition thread pulls frames with
//! [`AcquisitionController::transfer_when_ready`] and offers each to a bounded channel. When the
//! consumer lags, the newest frame is dropped and counted rather than stalling acquisition.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use flume::{Receiver, TrySendError};
use tracing::{error, info, warn};

use crate::capture::{AcquisitionController, VideoFrame};
use crate::driver::CaptureDriver;
use crate::error::{CaptureError, Result};

// Written by the acquisition thread, read by the owner; each counter on its own cache line.
#[derive(Default)]
struct Stats {
    frames_delivered: CachePadded<AtomicUsize>,
    frames_dropped: CachePadded<AtomicUsize>,
}

/// Owner side of a running acquisition thread. Dropping it stops and joins the thread.
pub struct AcquisitionHandle {
    frames: Receiver<VideoFrame>,
    stop: Arc<AtomicBool>,
    stats: Arc<Stats>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl AcquisitionHandle {
    pub fn frames(&self) -> &Receiver<VideoFrame> {
        &self.frames
    }

    /// Asks the thread to stop after the frame it is waiting for.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// (delivered, dropped)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.frames_delivered.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }

    /// Stops the thread and returns the error that ended acquisition, if any.
    pub fn join(mut self) -> Result<()> {
        self.stop();
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result,
            Err(_) => {
                error!("Acquisition thread panicked");
                Err(CaptureError::ShutDown)
            }
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.join_thread() {
            warn!("Acquisition ended with error: {}", e);
        }
    }
}

/// Moves `controller` onto its own thread and streams frames into a channel of `capacity`.
pub fn spawn_acquisition<D>(
    mut controller: AcquisitionController<D>,
    capacity: usize,
) -> Result<AcquisitionHandle>
where
    D: CaptureDriver + 'static,
{
    let (tx, rx) = flume::bounded::<VideoFrame>(capacity.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(Stats::default());

    let thread = {
        let stop = stop.clone();
        let stats = stats.clone();
        thread::Builder::new()
            .name("procapture-acquisition".into())
            .spawn(move || {
                let timeout = controller.config().timeout();
                while !stop.load(Ordering::Acquire) {
                    let frame = controller.transfer_when_ready(timeout)?;
                    match tx.try_send(frame) {
                        Ok(()) => {
                            stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Full(frame)) => {
                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("frames_dropped").increment(1);
                            warn!("Consumer lagging, dropped frame {}", frame.sequence);
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            info!("Frame receiver closed");
                            break;
                        }
                    }
                }
                controller.shutdown();
                Ok(())
            })?
    };

    Ok(AcquisitionHandle {
        frames: rx,
        stop,
        stats,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::{CaptureSettings, ColourFormat, DeviceSession, ImageSize, TransferMode};
    use crate::driver::MockDriver;

    fn spawn(capacity: usize) -> (AcquisitionHandle, crate::driver::MockControls) {
        let size = ImageSize::new(64, 48);
        let driver = MockDriver::builder()
            .frame_rate_hz(50.0)
            .resolution(size)
            .build()
            .unwrap();
        let controls = driver.controls();
        let settings =
            CaptureSettings::new(size, ColourFormat::Bgra, TransferMode::Normal, 64).unwrap();
        let session = DeviceSession::new(driver, settings).unwrap();
        let controller = AcquisitionController::new(session).unwrap();
        (spawn_acquisition(controller, capacity).unwrap(), controls)
    }

    #[test]
    fn counters_sit_on_separate_cache_lines() {
        let stats = Stats::default();
        let delivered = &*stats.frames_delivered as *const AtomicUsize as usize;
        let dropped = &*stats.frames_dropped as *const AtomicUsize as usize;
        assert!(delivered.abs_diff(dropped) >= std::mem::align_of::<CachePadded<AtomicUsize>>());
    }

    #[test]
    fn frames_arrive_in_sequence() {
        let (handle, controls) = spawn(4);
        let first = handle.frames().recv_timeout(Duration::from_secs(1)).unwrap();
        let second = handle.frames().recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(second.sequence > first.sequence);
        assert_eq!(first.size_in_bytes(), 64 * 48 * 4);
        handle.join().unwrap();
        assert_eq!(controls.channels_closed(), 1);
    }

    #[test]
    fn lagging_consumer_drops_frames() {
        let (handle, _controls) = spawn(1);
        std::thread::sleep(Duration::from_millis(200));

        let (delivered, dropped) = handle.stats();
        assert_eq!(delivered, 1);
        assert!(dropped > 0);
        handle.join().unwrap();
    }
}
