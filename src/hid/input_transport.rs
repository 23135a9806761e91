//! Decodes the reverse-direction data-channel input stream into HID reports
//! (§6): a truncated-identifier framing over variable-length keyboard/mouse
//! records, fed by a browser-side pre-framing step that escapes the high bit
//! of every byte into a trailing carrier byte per 8-byte group.

use crate::error::{HidError, Result};

/// One decoded input record, ready to hand to a [`super::HidSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputReport {
    Keyboard { modifier: u8, scan_codes: Vec<u8> },
    Mouse { buttons: u8, x: u16, y: u16 },
}

const DEVICE_FLAG_MOUSE: u8 = 0x80;
const PAYLOAD_LEN_MASK: u8 = 0x7F;

/// Expands a stream's per-report identifiers against a running 32-bit
/// counter, so reordered or duplicated reports can be dropped and a wrap of
/// the truncated byte doesn't look like the stream went backwards.
pub struct InputDecoder {
    last_identifier: Option<u32>,
}

impl InputDecoder {
    pub fn new() -> Self {
        Self { last_identifier: None }
    }

    /// Decodes every complete report in `buf`, dropping stale/duplicate ones
    /// in place (they are not reported as errors — only a truncated trailing
    /// report is).
    pub fn decode(&mut self, buf: &[u8]) -> Result<Vec<InputReport>> {
        let mut reports = Vec::new();
        let mut offset = 0;

        while offset < buf.len() {
            if offset + 2 > buf.len() {
                return Err(HidError::Truncated { need: offset + 2, have: buf.len() }.into());
            }

            let identifier_byte = buf[offset];
            let flags = buf[offset + 1];
            let payload_len = (flags & PAYLOAD_LEN_MASK) as usize;
            let is_mouse = flags & DEVICE_FLAG_MOUSE != 0;

            let payload_start = offset + 2;
            let payload_end = payload_start + payload_len;
            if payload_end > buf.len() {
                return Err(HidError::Truncated { need: payload_end, have: buf.len() }.into());
            }
            let payload = &buf[payload_start..payload_end];
            offset = payload_end;

            let expanded = expand_identifier(self.last_identifier.unwrap_or(0), identifier_byte);
            let is_new = self.last_identifier.map(|last| expanded > last).unwrap_or(true);
            if !is_new {
                continue;
            }
            self.last_identifier = Some(expanded);

            reports.push(if is_mouse {
                decode_mouse_payload(payload)?
            } else {
                decode_keyboard_payload(payload)?
            });
        }

        Ok(reports)
    }
}

impl Default for InputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_keyboard_payload(payload: &[u8]) -> Result<InputReport> {
    if payload.is_empty() {
        return Err(HidError::Truncated { need: 1, have: 0 }.into());
    }
    Ok(InputReport::Keyboard { modifier: payload[0], scan_codes: payload[1..].to_vec() })
}

fn decode_mouse_payload(payload: &[u8]) -> Result<InputReport> {
    if payload.len() != 5 {
        return Err(HidError::Truncated { need: 5, have: payload.len() }.into());
    }
    let buttons = payload[0];
    let x = u16::from_le_bytes([payload[1], payload[2]]);
    let y = u16::from_le_bytes([payload[3], payload[4]]);
    Ok(InputReport::Mouse { buttons, x, y })
}

/// Expands an 8-bit truncated identifier against `last`, picking whichever
/// of `base | truncated`, that minus 256, or that plus 256 lands closest to
/// `last` (within a 32-unit bias window that favors treating small backward
/// jumps as reordering rather than a fresh wrap).
fn expand_identifier(last: u32, truncated: u8) -> u32 {
    let base = last & !0xFF;
    let mut candidate = base | truncated as u32;

    if candidate.wrapping_add(32) < last {
        candidate = candidate.wrapping_add(256);
    } else if candidate > last.wrapping_add(256 - 32) {
        candidate = candidate.wrapping_sub(256);
    }

    candidate
}

/// Reverses the browser's pre-framing: every run of up to 8 transmitted
/// bytes is a group whose final byte carries the high bit of each of the
/// preceding bytes in that group, restoring up to 7 original bytes. A
/// trailing partial group is unpacked the same way, one byte shorter.
pub fn unpack_js_binary(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    for group in buf.chunks(8) {
        if group.len() < 2 {
            continue;
        }
        let carrier = group[group.len() - 1];
        for (i, &byte) in group[..group.len() - 1].iter().enumerate() {
            let high_bit = ((carrier >> i) & 1) << 7;
            out.push((byte & 0x7F) | high_bit);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_8_byte_group_restores_high_bits() {
        let encoded = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x55];
        assert_eq!(unpack_js_binary(&encoded), vec![0x81, 0x02, 0x83, 0x04, 0x85, 0x06, 0x87]);
    }

    #[test]
    fn trailing_partial_group_is_unpacked() {
        let encoded = [0x01, 0x02, 0x03, 0x05]; // 3 payload bytes + carrier
        assert_eq!(unpack_js_binary(&encoded), vec![0x81, 0x02, 0x83]);
    }

    #[test]
    fn lone_trailing_carrier_with_no_payload_yields_nothing() {
        assert_eq!(unpack_js_binary(&[0xFF]), Vec::<u8>::new());
    }

    #[test]
    fn identifier_advances_monotonically_across_a_wrap() {
        assert_eq!(expand_identifier(250, 3), 259);
    }

    #[test]
    fn identifier_reordering_is_recognized_as_not_advancing() {
        let last = expand_identifier(250, 3);
        let reordered = expand_identifier(last, 2);
        assert!(reordered <= last);
    }

    #[test]
    fn decode_rejects_a_truncated_trailing_report() {
        let mut decoder = InputDecoder::new();
        let err = decoder.decode(&[0x01, 0x85, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, crate::error::AppError::Hid(HidError::Truncated { .. })));
    }

    #[test]
    fn decode_parses_one_mouse_report() {
        let mut decoder = InputDecoder::new();
        let reports = decoder.decode(&[0x01, 0x85, 0x00, 0x00, 0x80, 0x00, 0x80]).unwrap();
        assert_eq!(reports, vec![InputReport::Mouse { buttons: 0, x: 0x8000, y: 0x8000 }]);
    }

    #[test]
    fn decode_drops_duplicate_identifiers() {
        let mut decoder = InputDecoder::new();
        let first = [0x01, 0x02, 0x00, 0x04];
        let duplicate = [0x01, 0x02, 0x00, 0x05];

        let reports = decoder.decode(&first).unwrap();
        assert_eq!(reports.len(), 1);

        let reports = decoder.decode(&duplicate).unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn decode_parses_consecutive_keyboard_reports_in_one_buffer() {
        let mut decoder = InputDecoder::new();
        let buf = [
            0x01, 0x02, 0x00, 0x04, // identifier 1, keyboard, modifier 0, key 0x04
            0x02, 0x02, 0x00, 0x05, // identifier 2, keyboard, modifier 0, key 0x05
        ];
        let reports = decoder.decode(&buf).unwrap();
        assert_eq!(
            reports,
            vec![
                InputReport::Keyboard { modifier: 0, scan_codes: vec![0x04] },
                InputReport::Keyboard { modifier: 0, scan_codes: vec![0x05] },
            ]
        );
    }
}
