//! Acquisition settings and frame geometry.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest chunk the driver will notify on in low-latency mode.
pub const MIN_LINES_PER_CHUNK: u32 = 64;

/// Row alignment used when computing the minimum stride of a frame.
pub const STRIDE_ALIGNMENT: u32 = 2;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Colour formats understood by the capture driver, identified by FOURCC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColourFormat {
    #[serde(rename = "UNK")]
    Unknown,
    Grey,
    Y800,
    Y8,
    Y16,
    Rgb15,
    Rgb16,
    Rgb24,
    Rgba,
    Argb,
    Bgr15,
    Bgr16,
    Bgr24,
    Bgra,
    Abgr,
    Nv16,
    Nv61,
    I422,
    Yv16,
    Yuy2,
    Yuyv,
    Uyvy,
    Yvyu,
    Vyuy,
    I420,
    Iyuv,
    Nv12,
    Yv12,
    Nv21,
    P010,
    P210,
    Iyu2,
    V308,
    Ayuv,
    Uyva,
    V408,
    Vyua,
    V210,
    Y410,
    V410,
    Rgb10,
    Bgr10,
}

impl ColourFormat {
    /// FOURCC code as passed to the driver.
    pub const fn fourcc(self) -> u32 {
        fourcc(self.code())
    }

    const fn code(self) -> &'static [u8; 4] {
        use ColourFormat::*;
        match self {
            Unknown => b"UNKN",
            Grey => b"GREY",
            Y800 => b"Y800",
            Y8 => b"Y8  ",
            Y16 => b"Y16 ",
            Rgb15 => b"RGB5",
            Rgb16 => b"RGB6",
            Rgb24 => b"RGB ",
            Rgba => b"RGBA",
            Argb => b"ARGB",
            Bgr15 => b"BGR5",
            Bgr16 => b"BGR6",
            Bgr24 => b"BGR ",
            Bgra => b"BGRA",
            Abgr => b"ABGR",
            Nv16 => b"NV16",
            Nv61 => b"NV61",
            I422 => b"I422",
            Yv16 => b"YV16",
            Yuy2 => b"YUY2",
            Yuyv => b"YUYV",
            Uyvy => b"UYVY",
            Yvyu => b"YVYU",
            Vyuy => b"VYUY",
            I420 => b"I420",
            Iyuv => b"IYUV",
            Nv12 => b"NV12",
            Yv12 => b"YV12",
            Nv21 => b"NV21",
            P010 => b"P010",
            P210 => b"P210",
            Iyu2 => b"IYU2",
            V308 => b"V308",
            Ayuv => b"AYUV",
            Uyva => b"UYVA",
            V408 => b"v408",
            Vyua => b"VYUA",
            V210 => b"v210",
            Y410 => b"Y410",
            V410 => b"v410",
            Rgb10 => b"RG10",
            Bgr10 => b"BG10",
        }
    }

    /// The FOURCC as a four character string, e.g. `"BGR "`.
    pub fn fourcc_str(self) -> &'static str {
        std::str::from_utf8(self.code()).unwrap_or("????")
    }

    pub fn bits_per_pixel(self) -> u32 {
        use ColourFormat::*;
        match self {
            Grey | Y800 | Y8 => 8,
            I420 | Iyuv | Yv12 | Nv12 | Nv21 => 12,
            Y16 | Rgb15 | Bgr15 | Rgb16 | Bgr16 | Yuy2 | Yuyv | Uyvy | Yvyu | Vyuy | I422 | Yv16
            | Nv16 | Nv61 => 16,
            Iyu2 | V308 | Rgb24 | Bgr24 | P010 | V210 => 24,
            Ayuv | Uyva | V408 | Vyua | Rgba | Bgra | Argb | Abgr | Y410 | V410 | P210 | Rgb10
            | Bgr10 => 32,
            Unknown => 0,
        }
    }

    pub fn num_channels(self) -> u32 {
        use ColourFormat::*;
        match self {
            Y8 | Y16 | Y800 | Grey => 1,
            _ if self.code().contains(&b'A') => 4,
            _ => 3,
        }
    }

    /// Packed formats store all components of a pixel together on one plane.
    pub fn is_packed(self) -> bool {
        use ColourFormat::*;
        !matches!(
            self,
            Nv12 | Nv21 | Yv12 | Iyuv | I420 | I422 | Yv16 | Nv16 | Nv61 | P010 | P210
        )
    }

    pub fn is_rgb(self) -> bool {
        use ColourFormat::*;
        matches!(
            self,
            Rgb15 | Rgb16 | Rgb24 | Rgba | Argb | Bgr15 | Bgr16 | Bgr24 | Bgra | Abgr | Rgb10 | Bgr10
        )
    }

    fn line_bytes(self, cols: u64) -> u64 {
        if self == ColourFormat::V210 {
            cols.div_ceil(48) * 48 * 8 / 3
        } else {
            cols * u64::from(self.bits_per_pixel()) / 8
        }
    }

    /// Bytes per row, rounded up to `align`. `None` if the row does not fit a driver stride.
    pub fn min_stride(self, cols: u32, align: u32) -> Option<u32> {
        let cols = u64::from(cols);
        let line = if self.is_packed() {
            self.line_bytes(cols)
        } else if matches!(self, ColourFormat::P010 | ColourFormat::P210) {
            cols * 2
        } else {
            cols
        };
        let align = u64::from(align.max(1));
        fit_driver_size(line.div_ceil(align) * align)
    }

    /// Size of one frame in bytes, or `None` if the geometry is invalid for this format or the
    /// frame is larger than the driver can address.
    pub fn image_size(self, cols: u32, rows: u32, stride: u32) -> Option<u32> {
        use ColourFormat::*;
        let line = self.line_bytes(u64::from(cols));
        let (cols, rows, stride) = (u128::from(cols), u128::from(rows), u128::from(stride));
        let size = if self == Nv12 {
            cols * rows * 2
        } else if self.is_packed() {
            if stride < u128::from(line) {
                return None;
            }
            stride * rows
        } else {
            if stride < cols {
                return None;
            }
            match self {
                Nv21 | Yv12 | Iyuv | I420 if stride & 1 == 0 && rows & 1 == 0 => stride * rows * 3 / 2,
                I422 | Yv16 | Nv16 | Nv61 if stride & 1 == 0 => stride * rows * 2,
                P010 if stride & 3 == 0 && rows & 1 == 0 => stride * rows * 3 / 2,
                P210 if stride & 3 == 0 => stride * rows * 2,
                _ => return None,
            }
        };
        fit_driver_size(size)
    }
}

// Strides and frame sizes cross the driver boundary as i32.
fn fit_driver_size(bytes: impl TryInto<i32>) -> Option<u32> {
    bytes.try_into().ok().map(|bytes: i32| bytes as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub cols: u32,
    pub rows: u32,
}

impl ImageSize {
    pub const fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AspectRatio {
    pub hor: u32,
    pub ver: u32,
}

/// How frame transfers to the host are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Device timer ticks once per frame period; allows arbitrary pacing.
    Timer,
    /// Transfer starts once a whole frame has been buffered on the card.
    Normal,
    /// Transfer starts as soon as a frame begins buffering, streaming it in chunks.
    LowLatency,
}

/// Dimensions, size and format of the frames a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProperties {
    pub dimensions: ImageSize,
    pub size_in_bytes: usize,
    pub format: ColourFormat,
}

/// In-memory settings for a capture session. Validated before any driver call is made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub dimensions: ImageSize,
    pub colour_format: ColourFormat,
    pub transfer_mode: TransferMode,
    /// Lines per partial notification in low-latency mode.
    pub num_lines_per_chunk: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            dimensions: ImageSize::new(1920, 1080),
            colour_format: ColourFormat::Bgr24,
            transfer_mode: TransferMode::Normal,
            num_lines_per_chunk: MIN_LINES_PER_CHUNK,
        }
    }
}

impl CaptureSettings {
    pub fn new(
        dimensions: ImageSize,
        colour_format: ColourFormat,
        transfer_mode: TransferMode,
        num_lines_per_chunk: u32,
    ) -> Result<Self, ConfigError> {
        let settings = Self {
            dimensions,
            colour_format,
            transfer_mode,
            num_lines_per_chunk,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_chunk_size(self.num_lines_per_chunk)?;
        if self.colour_format == ColourFormat::Unknown {
            return Err(ConfigError::UnsupportedColourFormat(self.colour_format));
        }
        match self.image_size_in_bytes() {
            Some(size) if size > 0 => Ok(()),
            _ => Err(ConfigError::InvalidDimensions {
                dimensions: self.dimensions,
                format: self.colour_format,
            }),
        }
    }

    /// Zero when the settings fail validation.
    pub fn min_stride(&self) -> u32 {
        self.colour_format
            .min_stride(self.dimensions.cols, STRIDE_ALIGNMENT)
            .unwrap_or(0)
    }

    pub fn image_size_in_bytes(&self) -> Option<usize> {
        let stride = self
            .colour_format
            .min_stride(self.dimensions.cols, STRIDE_ALIGNMENT)?;
        self.colour_format
            .image_size(self.dimensions.cols, self.dimensions.rows, stride)
            .map(|size| size as usize)
    }

    pub fn frame_properties(&self) -> FrameProperties {
        FrameProperties {
            dimensions: self.dimensions,
            size_in_bytes: self.image_size_in_bytes().unwrap_or(0),
            format: self.colour_format,
        }
    }
}

fn check_chunk_size(lines: u32) -> Result<(), ConfigError> {
    if lines < MIN_LINES_PER_CHUNK {
        Err(ConfigError::ChunkTooSmall(lines))
    } else if !lines.is_power_of_two() {
        Err(ConfigError::ChunkNotPowerOfTwo(lines))
    } else {
        Ok(())
    }
}
