//! Pixel format definitions and conversions.

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Pixel formats understood by the transcoding pipeline.
///
/// `Jpeg` denotes compressed input; the rest are raw planar/packed layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// JPEG/MJPEG compressed frame from the capture device.
    Jpeg,
    /// Planar 4:2:0, three planes: Y, U, V.
    Yuv420p,
    /// Planar 4:2:2, three planes: Y, U, V.
    Yuv422p,
    /// Packed 4:2:2, single interleaved plane.
    Yuyv,
    /// Semi-planar 4:2:0, two planes: Y, interleaved UV.
    Nv12,
    /// Packed RGB, 3 bytes per pixel.
    Rgb24,
}

impl PixelFormat {
    /// Convert to the V4L2 FourCC the capture device reports for this format.
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Jpeg => fourcc::FourCC::new(b"MJPG"),
            PixelFormat::Yuv420p => fourcc::FourCC::new(b"YU12"),
            PixelFormat::Yuv422p => fourcc::FourCC::new(b"422P"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Nv12 => fourcc::FourCC::new(b"NV12"),
            PixelFormat::Rgb24 => fourcc::FourCC::new(b"RGB3"),
        }
    }

    /// Try to convert from a V4L2 FourCC.
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Jpeg),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420p),
            b"422P" => Some(PixelFormat::Yuv422p),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"NV12" => Some(PixelFormat::Nv12),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    /// Whether this format is compressed (and therefore has no fixed byte layout).
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Jpeg)
    }

    /// Byte size of a frame at `width x height`, or `None` for compressed formats.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize) * (height as usize);
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Yuv420p | PixelFormat::Nv12 => Some(pixels * 3 / 2),
            PixelFormat::Yuv422p | PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Rgb24 => Some(pixels * 3),
        }
    }

    /// Preference order when the capture device offers more than one format
    /// (higher is better; compressed MJPEG wins since it saves USB bandwidth).
    pub fn priority(&self) -> u8 {
        match self {
            PixelFormat::Jpeg => 100,
            PixelFormat::Nv12 => 80,
            PixelFormat::Yuv420p => 75,
            PixelFormat::Yuyv => 70,
            PixelFormat::Yuv422p => 60,
            PixelFormat::Rgb24 => 40,
        }
    }

    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Jpeg,
            PixelFormat::Yuv420p,
            PixelFormat::Yuv422p,
            PixelFormat::Yuyv,
            PixelFormat::Nv12,
            PixelFormat::Rgb24,
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Yuv422p => "YUV422P",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Rgb24 => "RGB24",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "JPEG" | "MJPEG" | "MJPG" => Ok(PixelFormat::Jpeg),
            "YUV420P" | "YUV420" | "I420" => Ok(PixelFormat::Yuv420p),
            "YUV422P" | "YUV422" => Ok(PixelFormat::Yuv422p),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "NV12" => Ok(PixelFormat::Nv12),
            "RGB24" => Ok(PixelFormat::Rgb24),
            _ => Err(format!("unknown pixel format: {}", s)),
        }
    }
}

/// Capture/output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width >= 160 && self.width <= 15360 && self.height >= 120 && self.height <= 8640
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Round up to the encoder's macroblock-aligned dimensions (§4.8): width
    /// to a multiple of 32, height to a multiple of 16.
    pub fn encoder_aligned(&self) -> Resolution {
        let width = self.width.div_ceil(32) * 32;
        let height = self.height.div_ceil(16) * 16;
        Resolution { width, height }
    }

    pub const VGA: Resolution = Resolution { width: 640, height: 480 };
    pub const HD720: Resolution = Resolution { width: 1280, height: 720 };
    pub const HD1080: Resolution = Resolution { width: 1920, height: 1080 };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips() {
        for fmt in PixelFormat::all() {
            let fourcc = fmt.to_fourcc();
            assert_eq!(PixelFormat::from_fourcc(fourcc), Some(*fmt));
        }
    }

    #[test]
    fn encoder_alignment_rounds_up() {
        let r = Resolution::new(1920, 1080).encoder_aligned();
        assert_eq!(r.width, 1920); // already a multiple of 32
        assert_eq!(r.height, 1088); // 1080 -> next multiple of 16
    }

    #[test]
    fn frame_size_matches_subsampling() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 4), Some(24));
        assert_eq!(PixelFormat::Yuv422p.frame_size(4, 4), Some(32));
        assert_eq!(PixelFormat::Jpeg.frame_size(4, 4), None);
    }
}
