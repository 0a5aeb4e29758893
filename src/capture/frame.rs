use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};

use super::settings::{ColourFormat, ImageSize};

/// Wall-clock timestamps of one acquisition, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameTimestamps {
    pub buffering_started: DateTime<Utc>,
    pub buffering_complete: DateTime<Utc>,
    pub transfer_started: DateTime<Utc>,
    pub transfer_complete: DateTime<Utc>,
}

impl VideoFrameTimestamps {
    /// `buffering_started <= buffering_complete <= transfer_started <= transfer_complete`
    pub fn is_ordered(&self) -> bool {
        self.buffering_started <= self.buffering_complete
            && self.buffering_complete <= self.transfer_started
            && self.transfer_started <= self.transfer_complete
    }
}

/// A captured frame, owned by the caller.
///
/// The pixel data is a copy of the transfer buffer, so it stays valid while the next transfer
/// overwrites that buffer. Cloning shares the bytes.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub dimensions: ImageSize,
    pub format: ColourFormat,
    pub timestamps: VideoFrameTimestamps,
    /// Position in the controller's output, starting at zero.
    pub sequence: u64,
}

impl VideoFrame {
    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    /// Time from the card starting to buffer the frame to the host holding all of it.
    pub fn latency(&self) -> TimeDelta {
        self.timestamps.transfer_complete - self.timestamps.buffering_started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_spans_buffering_start_to_transfer_complete() {
        let start = Utc::now();
        let ms = TimeDelta::milliseconds;
        let frame = VideoFrame {
            data: Bytes::from_static(&[1, 2, 3, 4]),
            dimensions: ImageSize::new(2, 1),
            format: ColourFormat::Yuy2,
            timestamps: VideoFrameTimestamps {
                buffering_started: start,
                buffering_complete: start + ms(16),
                transfer_started: start + ms(17),
                transfer_complete: start + ms(20),
            },
            sequence: 0,
        };

        assert_eq!(frame.latency(), ms(20));
        assert_eq!(frame.size_in_bytes(), 4);
        assert!(frame.timestamps.is_ordered());
    }
}
