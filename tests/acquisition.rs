use std::time::Duration;

use chrono::{TimeDelta, Utc};
use procapture::driver::MockControls;
use procapture::{
    AcquisitionConfig, AcquisitionController, AcquisitionState, CaptureError, CaptureSettings,
    ColourFormat, DeviceSession, ImageSize, MockDriver, SessionState, TransferMode,
};

const SIZE: ImageSize = ImageSize::new(320, 240);

fn start(
    mode: TransferMode,
    rate_hz: f64,
    config: AcquisitionConfig,
) -> (AcquisitionController<MockDriver>, MockControls) {
    let driver = MockDriver::builder()
        .frame_rate_hz(rate_hz)
        .resolution(SIZE)
        .build()
        .unwrap();
    let controls = driver.controls();
    let settings = CaptureSettings::new(SIZE, ColourFormat::Bgr24, mode, 64).unwrap();
    let session = DeviceSession::new(driver, settings).unwrap();
    (
        AcquisitionController::with_config(session, config).unwrap(),
        controls,
    )
}

const ALL_MODES: [TransferMode; 3] = [
    TransferMode::Timer,
    TransferMode::Normal,
    TransferMode::LowLatency,
];

#[test]
fn timestamps_are_ordered_and_recent() {
    for mode in ALL_MODES {
        let (mut controller, _) = start(mode, 20.0, AcquisitionConfig::default());
        let frame = controller
            .transfer_when_ready(Duration::from_secs(1))
            .unwrap();
        let now = Utc::now();
        let ts = frame.timestamps;

        assert!(ts.is_ordered(), "{mode:?}: {ts:?}");
        for stamp in [
            ts.buffering_started,
            ts.buffering_complete,
            ts.transfer_started,
            ts.transfer_complete,
        ] {
            let skew = now - stamp;
            assert!(
                skew >= TimeDelta::zero() && skew < TimeDelta::milliseconds(250),
                "{mode:?}: skew {skew}"
            );
        }
    }
}

#[test]
fn frames_match_configured_dimensions() {
    for mode in ALL_MODES {
        let (mut controller, _) = start(mode, 20.0, AcquisitionConfig::default());
        let frame = controller
            .transfer_when_ready(Duration::from_secs(1))
            .unwrap();

        assert_eq!(frame.dimensions, SIZE);
        assert_eq!(frame.format, ColourFormat::Bgr24);
        assert_eq!(frame.size_in_bytes(), 320 * 3 * 240);
        assert!(frame.data.iter().any(|&b| b != 0), "{mode:?}");
    }
}

#[test]
fn timer_mode_paces_frames_at_the_frame_period() {
    let rate_hz = 10.0;
    let (mut controller, controls) =
        start(TransferMode::Timer, rate_hz, AcquisitionConfig::default());

    let starts: Vec<_> = (0..10)
        .map(|_| {
            controller
                .transfer_when_ready(Duration::from_secs(1))
                .unwrap()
                .timestamps
                .buffering_started
        })
        .collect();
    let total = *starts.last().unwrap() - starts[0];
    let mean_s = total.num_microseconds().unwrap() as f64 / 1e6 / (starts.len() - 1) as f64;

    let period = 1.0 / rate_hz;
    assert!(
        (mean_s - period).abs() < period * 0.1,
        "mean period {mean_s} s"
    );
    assert_eq!(controls.timer_ticks(), 10);
}

#[test]
fn grab_timeout_shuts_down_once() {
    let (mut controller, controls) =
        start(TransferMode::Normal, 0.5, AcquisitionConfig::default());

    let err = controller
        .transfer_when_ready(Duration::from_millis(100))
        .unwrap_err();
    assert!(
        matches!(err, CaptureError::WaitTimeout { timeout_ms: 100, .. }),
        "{err}"
    );
    assert_eq!(controller.state(), AcquisitionState::TimedOut);
    assert_eq!(controller.session().state(), SessionState::Closed);

    drop(controller);
    assert_eq!(controls.stop_calls(), 1);
    assert_eq!(controls.channels_closed(), 1);
    assert_eq!(controls.releases(), 1);
}

#[test]
fn stalled_transfer_times_out() {
    let config = AcquisitionConfig {
        transfer_timeout_ms: 100,
        ..AcquisitionConfig::default()
    };
    let (mut controller, controls) = start(TransferMode::Normal, 20.0, config);
    controls.stall_transfers(true);

    let err = controller
        .transfer_when_ready(Duration::from_secs(1))
        .unwrap_err();
    assert!(
        matches!(
            err,
            CaptureError::WaitTimeout {
                waiting_for: "transfer completion",
                timeout_ms: 100
            }
        ),
        "{err}"
    );
    assert_eq!(controller.session().state(), SessionState::Closed);
    assert!(matches!(
        controller.transfer_when_ready(Duration::from_secs(1)),
        Err(CaptureError::ShutDown)
    ));
}

#[test]
fn signal_change_is_retried() {
    let (mut controller, controls) =
        start(TransferMode::Normal, 20.0, AcquisitionConfig::default());
    controls.trigger_signal_change();

    let frame = controller
        .transfer_when_ready(Duration::from_secs(1))
        .unwrap();
    assert_eq!(frame.sequence, 0);
    assert_eq!(controller.state(), AcquisitionState::FrameReady);
}

#[test]
fn partial_frame_is_retried() {
    for mode in [TransferMode::Timer, TransferMode::Normal] {
        let (mut controller, controls) = start(mode, 20.0, AcquisitionConfig::default());
        controls.inject_partial_transfers(1);

        let frame = controller
            .transfer_when_ready(Duration::from_secs(1))
            .unwrap();
        assert_eq!(frame.sequence, 0);
        assert_eq!(controls.frames_written(), 2, "{mode:?}");
    }
}

#[test]
fn low_latency_gives_up_polling_after_budget_and_retries() {
    let config = AcquisitionConfig {
        low_latency_poll_budget_ms: 20,
        ..AcquisitionConfig::default()
    };
    let (mut controller, controls) = start(TransferMode::LowLatency, 20.0, config);
    controls.inject_partial_transfers(1);

    let frame = controller
        .transfer_when_ready(Duration::from_secs(1))
        .unwrap();
    assert_eq!(frame.dimensions, SIZE);
    assert_eq!(controls.frames_written(), 2);
}

#[test]
fn consecutive_misses_are_bounded() {
    let config = AcquisitionConfig {
        max_consecutive_misses: 1,
        ..AcquisitionConfig::default()
    };
    let (mut controller, controls) = start(TransferMode::Timer, 2.0, config);
    controls.trigger_signal_change();

    let err = controller
        .transfer_when_ready(Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, CaptureError::RetriesExhausted(1)), "{err}");
    assert_eq!(controller.state(), AcquisitionState::Failed);
    assert_eq!(controller.session().state(), SessionState::Closed);
    assert_eq!(controls.channels_closed(), 1);
}

#[test]
fn unlocked_signal_fails_controller_construction() {
    let driver = MockDriver::builder()
        .resolution(SIZE)
        .signal_state(procapture::capture::status::SignalState::None)
        .build()
        .unwrap();
    let controls = driver.controls();
    let settings =
        CaptureSettings::new(SIZE, ColourFormat::Bgr24, TransferMode::Normal, 64).unwrap();
    let session = DeviceSession::new(driver, settings).unwrap();

    let err = AcquisitionController::new(session).err().unwrap();
    assert!(matches!(err, CaptureError::SignalNotLocked(_)), "{err}");
    assert_eq!(controls.channels_closed(), 1);
    assert_eq!(controls.releases(), 1);
}
