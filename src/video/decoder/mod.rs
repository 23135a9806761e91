//! JPEG/MJPEG decoding into pool-allocated raw frames.

pub mod mjpeg_turbo;

pub use mjpeg_turbo::JpegDecoder;
