//! H.264 encoder contract (§4.4).

use bytes::Bytes;

use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::frame::Frame;

/// Encoder-side configuration independent of which concrete backend is used.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub gop_size: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::HD1080,
            bitrate_kbps: 4000,
            fps: 30,
            gop_size: 30,
        }
    }
}

/// One encoded access unit, Annex-B framed (start codes included).
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub key_frame: bool,
    pub sequence: u64,
    pub shutter_usec: u64,
}

/// An H.264 encoder taking planar YUV420P frames and producing Annex-B
/// bitstream. Implementations are not required to be `Sync`: the pipeline
/// stage that owns one runs on a single dedicated thread (§5).
pub trait H264Encoder: Send {
    /// Encode one frame captured at `shutter_usec`. May return `None` if
    /// the encoder buffers internally and hasn't produced output yet.
    fn encode(&mut self, frame: &Frame, sequence: u64, shutter_usec: u64) -> Result<Option<EncodedFrame>>;

    /// Force the next encoded frame to be an IDR keyframe.
    fn request_keyframe(&mut self);

    /// Change target bitrate without reinitializing the encoder.
    fn set_bitrate_kbps(&mut self, kbps: u32) -> Result<()>;

    fn config(&self) -> &EncoderConfig;
}
