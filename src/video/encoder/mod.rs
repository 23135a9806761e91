//! H.264 encoding.

pub mod h264;
pub mod traits;

pub use h264::SoftwareH264Encoder;
pub use traits::{EncodedFrame, EncoderConfig, H264Encoder};
