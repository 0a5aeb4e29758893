//! ProCapture acquisition demo: grabs frames and logs their timing.
//!
//! Usage: `procapture [CONFIG.toml] [FRAMES]`

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use procapture::{
    spawn_acquisition, AcquisitionController, CaptureDriver, Config, DeviceSession, MockDriver,
};

const DEFAULT_FRAMES: usize = 20;

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("ProCapture launching...");

    let mut args = std::env::args_os().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let frames = frame_count(args.next())?;

    let config = Config::load(config_path.as_deref()).wrap_err("failed to load configuration")?;
    info!("Capture settings: {:?}", config.capture);

    if config.device.use_mock {
        let driver = MockDriver::with_config(&config.mock)?;
        run(driver, &config, frames)
    } else {
        run_hardware(&config, frames)
    }
}

fn frame_count(arg: Option<OsString>) -> Result<usize> {
    match arg {
        Some(arg) => Ok(arg
            .to_string_lossy()
            .parse::<NonZeroUsize>()
            .wrap_err("frame count must be a positive integer")?
            .get()),
        None => Ok(DEFAULT_FRAMES),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("procapture=debug"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[cfg(feature = "hardware")]
fn run_hardware(config: &Config, frames: usize) -> Result<()> {
    let driver = procapture::driver::magewell::MagewellDriver::load(
        config.device.library_path.as_deref(),
    )?;
    run(driver, config, frames)
}

#[cfg(not(feature = "hardware"))]
fn run_hardware(_config: &Config, _frames: usize) -> Result<()> {
    Err(color_eyre::eyre::eyre!(
        "built without the `hardware` feature; set device.use_mock = true"
    ))
}

fn run<D: CaptureDriver + 'static>(driver: D, config: &Config, frames: usize) -> Result<()> {
    let session = DeviceSession::open(
        driver,
        config.capture.clone(),
        config.device.path.as_deref(),
    )?;
    info!("Frame properties: {:?}", session.frame_properties());

    let controller = AcquisitionController::with_config(session, config.acquisition.clone())?;
    let acquisition = spawn_acquisition(controller, config.acquisition.queue_capacity)?;

    for frame in acquisition.frames().iter().take(frames) {
        info!(
            sequence = frame.sequence,
            bytes = frame.size_in_bytes(),
            latency_ms = frame.latency().num_milliseconds(),
            buffering_started = %frame.timestamps.buffering_started,
            transfer_complete = %frame.timestamps.transfer_complete,
            "Frame received"
        );
    }

    let (delivered, dropped) = acquisition.stats();
    acquisition.join()?;
    info!(
        "ProCapture shutting down ({} frames delivered, {} dropped)",
        delivered, dropped
    );
    Ok(())
}
