//! Capture -> decode -> encode -> parse video transcoding pipeline.

pub mod capture;
pub mod chroma;
pub mod decoder;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod parser;
pub mod pipeline;
pub mod stage;
pub mod stats;

pub use capture::{CaptureConfig, CaptureSource, CapturedFrame, SyntheticCaptureSource, V4lCaptureSource};
pub use decoder::JpegDecoder;
pub use encoder::{EncodedFrame, EncoderConfig, H264Encoder, SoftwareH264Encoder};
pub use format::{PixelFormat, Resolution};
pub use frame::{Frame, FramePool};
pub use parser::VideoParser;
pub use pipeline::{PipelineState, VideoPipeline, VideoPipelineConfig};
pub use stats::Statistics;
