//! H.264-over-RTP payloadization (RFC 6184) and SDP offer generation.
//!
//! Grounded directly in `RtpPayloader::WrapH264Rtp`/`GenerateSDP` and the
//! `triple32` SSRC hash from the original encoder: single NAL units that fit
//! in one datagram are sent as-is, larger ones are split into FU-A
//! fragments. Header bytes are built by hand with `BytesMut`/`BufMut`
//! rather than through a general RTP crate, since the wire layout here is
//! exactly the fixed 12-byte header the original writes -- no extensions,
//! no CSRC list.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::video::parser::for_each_nalu;

/// Maximum size of datagrams produced by the payloader, matching the
/// original's `kDatagramBytes`.
pub const DATAGRAM_BYTES: usize = 1200;
const RTP_HEADER_BYTES: usize = 12;
const FU_OVERHEAD_BYTES: usize = RTP_HEADER_BYTES + 2;
const H264_PAYLOAD_TYPE: u8 = 0x60;

/// One wire-ready RTP packet (header + payload).
pub type RtpPacket = Bytes;

/// 32-bit avalanche hash used to derive a pseudo-random SSRC/session id
/// from a time value, without pulling in a general PRNG.
/// https://nullprogram.com/blog/2018/07/31/ (exact bias 0.0209).
pub fn triple32(mut x: u32) -> u32 {
    x ^= x >> 17;
    x = x.wrapping_mul(0xed5ad4bb);
    x ^= x >> 11;
    x = x.wrapping_mul(0xac4c1b51);
    x ^= x >> 15;
    x = x.wrapping_mul(0x31848bab);
    x ^= x >> 14;
    x
}

fn write_rtp_header(dest: &mut BytesMut, marked: bool, sequence_number: u16, pts: u32, ssrc: u32) {
    let mut word0: u32 = 0x8000_0000;
    if marked {
        word0 |= 1 << 23;
    }
    word0 |= (H264_PAYLOAD_TYPE as u32 & 0x7f) << 16;
    word0 |= sequence_number as u32;

    dest.put_u32(word0);
    dest.put_u32(pts);
    dest.put_u32(ssrc);
}

struct ParameterSets {
    sps: Vec<u8>,
    pps: Vec<u8>,
}

/// Wraps H.264 Annex-B access units into RTP packets and tracks the most
/// recent SPS/PPS for SDP generation.
pub struct RtpPayloader {
    ssrc: u32,
    next_sequence: u16,
    parameters: Mutex<ParameterSets>,
}

impl RtpPayloader {
    /// Create a payloader with an SSRC derived from `seed_usec` (typically
    /// the current time in microseconds) via [`triple32`].
    pub fn new(seed_usec: u64) -> Self {
        Self::with_ssrc(triple32(seed_usec as u32))
    }

    /// Create a payloader with an explicit SSRC (used in tests).
    pub fn with_ssrc(ssrc: u32) -> Self {
        Self {
            ssrc,
            next_sequence: 0,
            parameters: Mutex::new(ParameterSets { sps: Vec::new(), pps: Vec::new() }),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Payloadize one Annex-B access unit captured at `shutter_usec`.
    ///
    /// The RTP timestamp is the shutter time scaled to the 90kHz H.264
    /// clock: `shutter_usec * 9 / 100`.
    pub fn wrap_h264(&mut self, shutter_usec: u64, data: &[u8]) -> Vec<RtpPacket> {
        let pts = ((shutter_usec * 9) / 100) as u32;
        let mut packets = Vec::new();

        for_each_nalu(data, |nalu| {
            if nalu.is_empty() {
                return;
            }
            let nal_ref_idc = (nalu[0] >> 5) & 3;
            let nal_unit_type = nalu[0] & 0x1f;

            if nal_unit_type == 7 {
                self.parameters.lock().sps = nalu.to_vec();
            }
            if nal_unit_type == 8 {
                self.parameters.lock().pps = nalu.to_vec();
            }

            let marked = (1..=5).contains(&nal_unit_type);

            if nalu.len() + RTP_HEADER_BYTES <= DATAGRAM_BYTES {
                let mut dest = BytesMut::with_capacity(RTP_HEADER_BYTES + nalu.len());
                write_rtp_header(&mut dest, marked, self.next_sequence, pts, self.ssrc);
                self.next_sequence = self.next_sequence.wrapping_add(1);
                dest.put_slice(nalu);
                packets.push(dest.freeze());
                return;
            }

            let mut src = &nalu[1..];
            let mut remaining = src.len();
            let frag_capacity = DATAGRAM_BYTES - FU_OVERHEAD_BYTES;
            let mut first = true;

            while remaining > 0 {
                let last = remaining <= frag_capacity;
                let frag_bytes = if last { remaining } else { frag_capacity };

                let mut dest = BytesMut::with_capacity(FU_OVERHEAD_BYTES + frag_bytes);
                write_rtp_header(&mut dest, marked && last, self.next_sequence, pts, self.ssrc);
                self.next_sequence = self.next_sequence.wrapping_add(1);

                dest.put_u8(28 | (nal_ref_idc << 5));
                let mut fu_header = nal_unit_type;
                if first {
                    fu_header |= 0x80;
                }
                if last {
                    fu_header |= 0x40;
                }
                dest.put_u8(fu_header);
                dest.put_slice(&src[..frag_bytes]);

                packets.push(dest.freeze());

                src = &src[frag_bytes..];
                remaining -= frag_bytes;
                first = false;
            }
        });

        packets
    }

    /// Generate an SDP offer for the most recently seen SPS/PPS, or `None`
    /// if neither has been observed yet.
    pub fn generate_sdp(&self, seed_usec: u64) -> Option<String> {
        let params = self.parameters.lock();
        if params.sps.is_empty() || params.pps.is_empty() {
            return None;
        }

        let engine = base64::engine::general_purpose::STANDARD;
        let sps_b64 = engine.encode(&params.sps);
        let pps_b64 = engine.encode(&params.pps);

        let seed = seed_usec as u32;
        let id = ((triple32(seed) as u64) | ((triple32(seed.wrapping_add(12345)) as u64) << 32)) >> 1;

        Some(format!(
            "v=0\r\n\
             o=- {id} 1 IN IP4 127.0.0.1\r\n\
             s=Mountpoint 0\r\n\
             t=0 0\r\n\
             m=video 1 RTP/SAVPF 96\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=fmtp:96 sprop-sps={sps_b64}\r\n\
             a=fmtp:96 sprop-pps={pps_b64}\r\n\
             a=rtcp-fb:96 nack\r\n\
             a=rtcp-fb:96 nack pli\r\n\
             a=rtcp-fb:96 goog-remb\r\n\
             a=sendonly\r\n"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b(nal: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 1];
        v.extend_from_slice(nal);
        v
    }

    #[test]
    fn single_nal_fits_one_datagram_with_fixed_ssrc() {
        let mut payloader = RtpPayloader::with_ssrc(0xDEAD_BEEF);
        let mut nal = vec![0x65]; // IDR slice NAL header
        nal.extend(std::iter::repeat(0xAA).take(100));
        let data = annex_b(&nal);

        let packets = payloader.wrap_h264(1_000_000, &data);
        assert_eq!(packets.len(), 1);

        let pkt = &packets[0];
        assert_eq!(pkt.len(), RTP_HEADER_BYTES + nal.len());
        assert_eq!(u32::from_be_bytes(pkt[0..4].try_into().unwrap()) >> 31, 1); // version bit
        assert_eq!((pkt[1] & 0x7f), H264_PAYLOAD_TYPE);
        assert_eq!(pkt[1] & 0x80, 0x80); // marker set for a slice NALU
        let ssrc = u32::from_be_bytes(pkt[8..12].try_into().unwrap());
        assert_eq!(ssrc, 0xDEAD_BEEF);
        assert_eq!(&pkt[RTP_HEADER_BYTES..], &nal[..]);
    }

    #[test]
    fn large_nal_fragments_into_expected_fu_a_sizes() {
        // Reconstructed from the fragmentation scenario: 3 packets of sizes
        // 1200, 1200, 615 with FU-A overhead 14 bytes per packet implies
        // payload fragments of 1186, 1186, 601 bytes plus the 1-byte NAL
        // header that gets replaced by the FU indicator/header pair.
        let mut nal = vec![0x65];
        nal.extend(std::iter::repeat(0xBB).take(1186 + 1186 + 601));

        let mut payloader = RtpPayloader::with_ssrc(1);
        let data = annex_b(&nal);
        let packets = payloader.wrap_h264(0, &data);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 1200);
        assert_eq!(packets[1].len(), 1200);
        assert_eq!(packets[2].len(), 615);

        // FU indicator type == 28, first fragment has the start bit set.
        assert_eq!(packets[0][RTP_HEADER_BYTES] & 0x1f, 28);
        assert_eq!(packets[0][RTP_HEADER_BYTES + 1] & 0x80, 0x80);
        assert_eq!(packets[0][RTP_HEADER_BYTES + 1] & 0x40, 0);
        // Last fragment has the end bit set, not the start bit.
        assert_eq!(packets[2][RTP_HEADER_BYTES + 1] & 0x80, 0);
        assert_eq!(packets[2][RTP_HEADER_BYTES + 1] & 0x40, 0x40);
    }

    #[test]
    fn sdp_is_none_until_sps_and_pps_seen() {
        let payloader = RtpPayloader::with_ssrc(1);
        assert!(payloader.generate_sdp(0).is_none());
    }

    #[test]
    fn sdp_includes_base64_parameter_sets_once_seen() {
        let mut payloader = RtpPayloader::with_ssrc(1);
        let sps = annex_b(&[0x67, 0x01, 0x02]);
        let pps = annex_b(&[0x68, 0x03]);
        let mut data = sps;
        data.extend(pps);
        payloader.wrap_h264(0, &data);

        let sdp = payloader.generate_sdp(42).unwrap();
        assert!(sdp.contains("a=rtpmap:96 H264/90000"));
        assert!(sdp.contains("sprop-sps="));
        assert!(sdp.contains("sprop-pps="));
    }

    #[test]
    fn triple32_is_deterministic() {
        assert_eq!(triple32(0), triple32(0));
        assert_ne!(triple32(0), triple32(1));
    }
}
