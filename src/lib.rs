//! Low-latency capture -> encode -> RTP transcoding pipeline for remote-KVM video,
//! plus the reverse-direction HID input path.

pub mod config;
pub mod error;
pub mod hid;
pub mod rtp;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
