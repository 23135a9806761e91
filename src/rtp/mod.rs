//! RTP payloadization and SDP generation for the H.264 output stream (§4.6).

mod payloader;

pub use payloader::{triple32, RtpPacket, RtpPayloader};
