//! Annex-B NAL unit scanning and H.264/HEVC picture grouping (§4.5).
//!
//! Grounded in `VideoParser`/`EnumerateAnnexBNalus`/`ReadExpGolomb` from the
//! original encoder: the encoder hands us an Annex-B byte stream per access
//! unit, we split it into NAL units on `00 00 01` start codes, classify each
//! one, and group slice NALUs back into pictures using `first_mb_in_slice`.

use crate::error::{PipelineError, Result};

/// Locate the next `00 00 01` start code in `data`, returning its offset.
pub fn find_annex_b_start(data: &[u8]) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    data.windows(3).position(|w| w == [0, 0, 1])
}

/// Invoke `callback` with each Annex-B NAL unit's byte range (start code
/// stripped, trailing zero-byte trimmed if present). Returns the NAL count.
pub fn for_each_nalu<'a>(data: &'a [u8], mut callback: impl FnMut(&'a [u8])) -> usize {
    let mut count = 0;
    let mut last_offset: isize = -3;

    loop {
        let next_start = (last_offset + 3).max(0) as usize;
        if next_start >= data.len() {
            break;
        }
        let found = match find_annex_b_start(&data[next_start..]) {
            Some(off) => off + next_start,
            None => break,
        };

        if last_offset >= 0 {
            let nal_start = last_offset as usize + 3;
            let mut nal_end = found;
            if nal_end > nal_start && data[nal_end - 1] == 0 {
                nal_end -= 1;
            }
            if nal_end > nal_start {
                callback(&data[nal_start..nal_end]);
                count += 1;
            }
        }

        last_offset = found as isize;
    }

    if last_offset >= 0 {
        let nal_start = last_offset as usize + 3;
        if nal_start <= data.len() {
            callback(&data[nal_start..]);
            count += 1;
        }
    }

    count
}

/// MSB-first bit reader over a byte slice, used for Exp-Golomb decoding.
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Read `count` bits (0..=32) MSB-first, returning 0 once the slice is exhausted.
    pub fn read(&mut self, count: u32) -> u32 {
        let mut value = 0u32;
        for _ in 0..count {
            let byte_index = self.bit_pos / 8;
            let bit = if byte_index < self.data.len() {
                let shift = 7 - (self.bit_pos % 8);
                (self.data[byte_index] >> shift) & 1
            } else {
                0
            };
            value = (value << 1) | bit as u32;
            self.bit_pos += 1;
        }
        value
    }
}

/// Decode one Exp-Golomb coded unsigned value (ue(v)).
pub fn read_exp_golomb(bs: &mut BitReader<'_>) -> u32 {
    let mut zero_count = 0u32;
    while zero_count < 128 {
        if bs.read(1) != 0 {
            break;
        }
        zero_count += 1;
    }
    if zero_count == 0 || zero_count > 32 {
        return 0;
    }
    bs.read(zero_count) + (1u32 << zero_count) - 1
}

/// One NAL unit's classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluKind {
    /// Parameter set (SPS/PPS/VPS) -- prepended to the next keyframe.
    Parameter,
    /// A slice belonging to the picture; `first_slice` marks the picture boundary.
    Slice { first_slice: bool, keyframe: bool },
    /// Access unit delimiter -- ignored.
    AccessUnitDelimiter,
    /// Supplemental enhancement info -- stripped (see design notes).
    Sei,
    /// Anything else, passed through uninterpreted.
    Other,
}

/// Classify one already-extracted H.264 NAL unit.
pub fn classify_h264_nalu(nalu: &[u8]) -> Result<NaluKind> {
    if nalu.is_empty() {
        return Err(PipelineError::ParserInvariant("empty H.264 NAL unit".into()).into());
    }
    let header = nalu[0];
    if header & 0x80 != 0 {
        return Err(PipelineError::ParserInvariant("high-bit set in NAL header".into()).into());
    }
    let nal_unit_type = header & 0x1f;
    Ok(match nal_unit_type {
        7 | 8 => NaluKind::Parameter,
        1 | 5 => {
            if nalu.len() < 2 {
                return Err(PipelineError::ParserInvariant("truncated slice NAL".into()).into());
            }
            let mut bs = BitReader::new(&nalu[1..]);
            let first_mb_in_slice = read_exp_golomb(&mut bs);
            NaluKind::Slice {
                first_slice: first_mb_in_slice == 0,
                keyframe: nal_unit_type == 5,
            }
        }
        9 => NaluKind::AccessUnitDelimiter,
        6 => NaluKind::Sei,
        other => {
            tracing::warn!(nal_unit_type = other, "dropping NAL unit of unrecognized type");
            NaluKind::Other
        }
    })
}

/// Classify one already-extracted HEVC NAL unit.
pub fn classify_hevc_nalu(nalu: &[u8]) -> Result<NaluKind> {
    if nalu.len() < 2 {
        return Err(PipelineError::ParserInvariant("empty/truncated HEVC NAL unit".into()).into());
    }
    let header = u16::from_be_bytes([nalu[0], nalu[1]]);
    if header & 0x8000 != 0 {
        return Err(PipelineError::ParserInvariant("high-bit set in NAL header".into()).into());
    }
    let nal_unit_type = ((header >> 9) & 0x3f) as u8;
    Ok(match nal_unit_type {
        32 | 33 | 34 => NaluKind::Parameter,
        19 | 20 | 1 | 21 => {
            let mut bs = BitReader::new(&nalu[2..]);
            NaluKind::Slice {
                first_slice: bs.read(1) != 0,
                keyframe: nal_unit_type == 19 || nal_unit_type == 20,
            }
        }
        35 => NaluKind::AccessUnitDelimiter,
        39 => NaluKind::Sei,
        other => {
            tracing::warn!(nal_unit_type = other, "dropping NAL unit of unrecognized type");
            NaluKind::Other
        }
    })
}

/// One decoded picture: the keyframe flag and the slice NAL ranges it's made of.
#[derive(Debug, Default, Clone)]
pub struct Picture {
    pub keyframe: bool,
    pub slice_ranges: Vec<(usize, usize)>,
    pub total_bytes: usize,
}

/// Groups an Annex-B access unit's NALUs into parameter sets and pictures.
///
/// Reused across frames by calling [`VideoParser::reset`] between access
/// units, mirroring the encoder's per-call lifecycle.
#[derive(Debug, Default)]
pub struct VideoParser {
    pub nal_unit_count: usize,
    pub parameter_ranges: Vec<(usize, usize)>,
    pub total_parameter_bytes: usize,
    pub pictures: Vec<Picture>,
    write_picture_index: isize,
}

impl VideoParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.nal_unit_count = 0;
        self.parameter_ranges.clear();
        self.total_parameter_bytes = 0;
        self.pictures.clear();
        self.write_picture_index = -1;
    }

    /// Parse one encoder output buffer (Annex-B) into parameter sets and pictures.
    /// `data` is the byte slice the returned ranges are offsets into.
    pub fn parse(&mut self, is_hevc: bool, data: &[u8]) -> Result<()> {
        self.reset();
        let mut first_err = None;

        let base = data.as_ptr() as usize;
        let count = for_each_nalu(data, |nalu| {
            let start = nalu.as_ptr() as usize - base;
            let end = start + nalu.len();
            let result = if is_hevc {
                classify_hevc_nalu(nalu)
            } else {
                classify_h264_nalu(nalu)
            };
            match result {
                Ok(kind) => self.apply(kind, start, end),
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(_) => {}
            }
        });
        self.nal_unit_count = count;

        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(())
    }

    fn apply(&mut self, kind: NaluKind, start: usize, end: usize) {
        match kind {
            NaluKind::Parameter => {
                self.parameter_ranges.push((start, end));
                self.total_parameter_bytes += end - start;
            }
            NaluKind::Slice { first_slice, keyframe } => {
                self.append_slice(start, end, first_slice, keyframe);
            }
            NaluKind::AccessUnitDelimiter | NaluKind::Sei | NaluKind::Other => {}
        }
    }

    fn append_slice(&mut self, start: usize, end: usize, new_picture: bool, keyframe: bool) {
        if new_picture {
            self.write_picture_index += 1;
        }
        if self.write_picture_index < 0 {
            tracing::warn!("dropping slice NAL that arrived before the first picture boundary");
            return;
        }
        let idx = self.write_picture_index as usize;
        if idx >= self.pictures.len() {
            self.pictures.resize_with(idx + 1, Picture::default);
        }
        let picture = &mut self.pictures[idx];
        picture.slice_ranges.push((start, end));
        picture.total_bytes += end - start;
        picture.keyframe = keyframe || picture.keyframe;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_slice(first_mb_zero: bool, nal_type: u8) -> Vec<u8> {
        // header byte + one slice-header byte whose top bits encode
        // first_mb_in_slice via Exp-Golomb: 0 -> "1", nonzero -> "010" (=1)
        let mut v = vec![nal_type];
        if first_mb_zero {
            v.push(0b1000_0000);
        } else {
            v.push(0b0100_0000); // ue(v) = 1
        }
        v
    }

    #[test]
    fn exp_golomb_decodes_known_values() {
        // "1" -> 0
        let mut bs = BitReader::new(&[0b1000_0000]);
        assert_eq!(read_exp_golomb(&mut bs), 0);
        // "010" -> 1
        let mut bs = BitReader::new(&[0b0100_0000]);
        assert_eq!(read_exp_golomb(&mut bs), 1);
        // "011" -> 2
        let mut bs = BitReader::new(&[0b0110_0000]);
        assert_eq!(read_exp_golomb(&mut bs), 2);
    }

    #[test]
    fn finds_start_code_in_literal_scenario_3_stream() {
        let data = [0x00, 0x00, 0x01, 0x67, 0xAA, 0x00, 0x00, 0x01, 0x65, 0xBB];
        assert_eq!(find_annex_b_start(&data), Some(0));
        assert_eq!(find_annex_b_start(&data[3..]), Some(2));
    }

    #[test]
    fn for_each_nalu_splits_two_unit_stream() {
        let data = [0x00, 0x00, 0x01, 0x67, 0xAA, 0x00, 0x00, 0x01, 0x65, 0xBB];
        let mut units = Vec::new();
        let n = for_each_nalu(&data, |nalu| units.push(nalu.to_vec()));
        assert_eq!(n, 2);
        assert_eq!(units[0], vec![0x67, 0xAA]);
        assert_eq!(units[1], vec![0x65, 0xBB]);
    }

    #[test]
    fn trailing_zero_byte_is_trimmed() {
        // second NALU's preceding byte is the trailing zero of the first,
        // which FindAnnexBStart would otherwise include.
        let data = [0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x00, 0x01, 0x65];
        let mut units = Vec::new();
        for_each_nalu(&data, |nalu| units.push(nalu.to_vec()));
        assert_eq!(units[0], vec![0x67]);
    }

    #[test]
    fn classifies_parameter_and_slice_nalus() {
        let sps = [0x67, 0x42, 0x00];
        assert_eq!(classify_h264_nalu(&sps).unwrap(), NaluKind::Parameter);

        let slice = h264_slice(true, 1);
        assert_eq!(
            classify_h264_nalu(&slice).unwrap(),
            NaluKind::Slice { first_slice: true, keyframe: false }
        );

        let idr = h264_slice(true, 5);
        assert_eq!(
            classify_h264_nalu(&idr).unwrap(),
            NaluKind::Slice { first_slice: true, keyframe: true }
        );
    }

    #[test]
    fn high_bit_header_is_rejected() {
        let bad = [0x80, 0x00];
        assert!(classify_h264_nalu(&bad).is_err());
    }

    #[test]
    fn parser_groups_sps_pps_and_two_keyframe_slices_into_one_picture() {
        let sps = [0x00, 0x00, 0x01, 0x67, 0x01];
        let pps = [0x00, 0x00, 0x01, 0x68, 0x02];
        let slice1 = [0x00, 0x00, 0x01, &h264_slice(true, 5)[..]].concat();
        let slice2_nalu = h264_slice(false, 5);
        let slice2 = [&[0x00, 0x00, 0x01][..], &slice2_nalu[..]].concat();

        let mut data = Vec::new();
        data.extend_from_slice(&sps);
        data.extend_from_slice(&pps);
        data.extend_from_slice(&slice1);
        data.extend_from_slice(&slice2);

        let mut parser = VideoParser::new();
        parser.parse(false, &data).unwrap();

        assert_eq!(parser.parameter_ranges.len(), 2);
        assert_eq!(parser.pictures.len(), 1);
        assert!(parser.pictures[0].keyframe);
        assert_eq!(parser.pictures[0].slice_ranges.len(), 2);
    }

    #[test]
    fn dangling_slice_before_first_picture_start_is_dropped() {
        // first_mb_in_slice != 0 as the very first slice: no picture opened yet
        let slice = h264_slice(false, 1);
        let data = [&[0x00, 0x00, 0x01][..], &slice[..]].concat();

        let mut parser = VideoParser::new();
        parser.parse(false, &data).unwrap();
        assert_eq!(parser.pictures.len(), 0);
    }
}
