//! Capture sources: V4L2 hardware capture and a synthetic source for tests (§4.1, §6).

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;
use v4l::buffer::Type as BufferType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::format::{PixelFormat, Resolution};
use crate::error::{PipelineError, Result};

const MIN_FRAME_SIZE: usize = 128;
const MAX_OPEN_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// One compressed or raw frame pulled off a capture source, with the
/// shutter time used downstream for RTP timestamping.
pub struct CapturedFrame {
    pub data: Bytes,
    pub shutter_usec: u64,
    pub sequence: u64,
}

/// Something that can be polled for frames on a dedicated capture thread.
///
/// Blocking is expected: the capture stage (§5) owns the thread and calls
/// `next_frame` in a loop. A timeout should surface as `Ok` with an empty
/// frame's absence being communicated through [`PipelineError::CaptureLost`]
/// only for genuine device loss, not transient no-signal conditions (the
/// caller handles "no signal" by checking elapsed time between calls).
pub trait CaptureSource: Send {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;
    fn format(&self) -> PixelFormat;
    fn resolution(&self) -> Resolution;
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
    pub buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            resolution: Resolution::HD1080,
            format: PixelFormat::Jpeg,
            fps: 30,
            buffer_count: 2,
        }
    }
}

/// V4L2 memory-mapped capture source.
///
/// `stream` borrows `device` for its whole lifetime. Both are owned here so
/// the pair moves and drops together; `device` is heap-allocated so its
/// address (and therefore the borrow `stream` holds via the unsafe lifetime
/// extension below) stays valid across moves of `V4lCaptureSource` itself.
/// Field order matters: `stream` must drop before `device`.
pub struct V4lCaptureSource {
    stream: MmapStream<'static>,
    device: Box<Device>,
    resolution: Resolution,
    format: PixelFormat,
    sequence: u64,
    start: Instant,
}

impl V4lCaptureSource {
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_OPEN_RETRIES {
            let device = match Device::with_path(&config.device_path) {
                Ok(d) => Box::new(d),
                Err(e) => {
                    last_error = Some(retryable_open_error(&config.device_path, &e, attempt));
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                }
            };

            let wanted = Format::new(config.resolution.width, config.resolution.height, config.format.to_fourcc());
            let actual_format = match device.set_format(&wanted) {
                Ok(f) => f,
                Err(e) => {
                    last_error = Some(retryable_open_error(&config.device_path, &e, attempt));
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                }
            };

            if config.fps > 0 {
                if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
                    warn!("failed to set hardware fps to {}: {e}", config.fps);
                }
            }

            // SAFETY: `device` is heap-allocated (`Box`) and stored alongside
            // `stream` in the same struct with `stream` declared first, so it
            // drops before `device` and never outlives the borrow.
            let device_ref: &'static Device = unsafe { &*(device.as_ref() as *const Device) };
            let stream = MmapStream::with_buffers(device_ref, BufferType::VideoCapture, config.buffer_count)
                .map_err(|e| PipelineError::CaptureLost(format!("failed to create mmap stream: {e}")))?;

            let resolution = Resolution::new(actual_format.width, actual_format.height);
            let format = PixelFormat::from_fourcc(actual_format.fourcc).unwrap_or(config.format);

            return Ok(Self { stream, device, resolution, format, sequence: 0, start: Instant::now() });
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::CaptureLost(format!("failed to open {:?} after retries", config.device_path)).into()
        }))
    }
}

fn retryable_open_error(path: &Path, e: &io::Error, attempt: u32) -> crate::error::AppError {
    warn!("capture device open attempt {} failed for {:?}: {e}", attempt + 1, path);
    PipelineError::CaptureLost(format!("{:?}: {e}", path)).into()
}

impl CaptureSource for V4lCaptureSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        let (buf, meta) = match self.stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => {
                let lost = matches!(e.raw_os_error(), Some(6) | Some(19) | Some(5) | Some(32) | Some(108));
                return if lost {
                    Err(PipelineError::CaptureLost(e.to_string()).into())
                } else {
                    Err(PipelineError::CaptureLost(format!("capture error: {e}")).into())
                };
            }
        };

        let frame_size = meta.bytesused as usize;
        if frame_size < MIN_FRAME_SIZE {
            return Ok(None);
        }
        if self.format.is_compressed() && !is_valid_jpeg(&buf[..frame_size]) {
            return Ok(None);
        }

        let sequence = self.sequence;
        self.sequence += 1;

        Ok(Some(CapturedFrame {
            data: Bytes::copy_from_slice(&buf[..frame_size]),
            shutter_usec: self.start.elapsed().as_micros() as u64,
            sequence,
        }))
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let start = ((data[0] as u16) << 8) | data[1] as u16;
    if start != 0xFFD8 {
        return false;
    }
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

/// Deterministic in-memory capture source for pipeline tests: replays a
/// fixed list of frames (or a generated solid-color JPEG repeated) without
/// touching real V4L2 hardware.
pub struct SyntheticCaptureSource {
    frames: Vec<Bytes>,
    index: usize,
    resolution: Resolution,
    format: PixelFormat,
    sequence: u64,
    start: Instant,
}

impl SyntheticCaptureSource {
    pub fn new(frames: Vec<Bytes>, resolution: Resolution, format: PixelFormat) -> Self {
        Self { frames, index: 0, resolution, format, sequence: 0, start: Instant::now() }
    }
}

impl CaptureSource for SyntheticCaptureSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let data = self.frames[self.index % self.frames.len()].clone();
        self.index += 1;
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Some(CapturedFrame { data, shutter_usec: self.start.elapsed().as_micros() as u64, sequence }))
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_jpeg_header_and_footer_accepted() {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 200]);
        data.extend([0xFF, 0xD9]);
        assert!(is_valid_jpeg(&data));
    }

    #[test]
    fn wrong_header_rejected() {
        let mut data = vec![0x00, 0x00];
        data.extend(vec![0u8; 200]);
        data.extend([0xFF, 0xD9]);
        assert!(!is_valid_jpeg(&data));
    }

    #[test]
    fn synthetic_source_cycles_through_frames() {
        let frames = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let mut source = SyntheticCaptureSource::new(frames, Resolution::VGA, PixelFormat::Jpeg);

        let f0 = source.next_frame().unwrap().unwrap();
        let f1 = source.next_frame().unwrap().unwrap();
        let f2 = source.next_frame().unwrap().unwrap();

        assert_eq!(f0.data, Bytes::from_static(b"a"));
        assert_eq!(f1.data, Bytes::from_static(b"b"));
        assert_eq!(f2.data, Bytes::from_static(b"a"));
        assert_eq!(f2.sequence, 2);
    }
}
