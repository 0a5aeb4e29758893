use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::driver::CaptureDriver;
use crate::error::{CaptureError, Result};

// Detected capture channel info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub index: usize,
    pub path: String,
}

impl FoundDevice {
    pub fn new(index: usize, path: String) -> Self {
        Self { index, path }
    }
}

/// Picks the first channel the driver can name a device path for.
pub fn auto_detect_device<D: CaptureDriver>(driver: &D) -> Result<FoundDevice> {
    info!("Auto-detecting capture channels...");

    driver.refresh_devices()?;
    let count = driver.channel_count()?;
    for index in 0..count {
        match driver.device_path(index) {
            Ok(path) => {
                info!("Found capture channel {}: {}", index, path);
                return Ok(FoundDevice::new(index, path));
            }
            Err(e) => debug!("Skipping channel {}: {}", index, e),
        }
    }

    Err(CaptureError::NoDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MOCK_DEVICE_PATH};

    #[test]
    fn detects_the_mock_channel() {
        let driver = MockDriver::builder().build().unwrap();
        let found = auto_detect_device(&driver).unwrap();
        assert_eq!(found, FoundDevice::new(0, MOCK_DEVICE_PATH.to_string()));
    }
}
