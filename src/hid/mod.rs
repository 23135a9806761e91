//! Reverse-direction HID input: decodes the data-channel wire protocol into
//! keyboard/mouse reports (§4.10, §6) and hands them to a gadget sink.

pub mod ch9329;
pub mod input_transport;
pub mod types;

pub use input_transport::{InputDecoder, InputReport};
pub use types::{KeyboardModifiers, KeyboardReport, MouseReport};

use crate::error::Result;

/// Where decoded HID reports end up: a USB OTG gadget character device, a
/// CH9329 serial bridge, or (in tests) nothing at all. Implementations must
/// be safe to call from any thread without external synchronization.
pub trait HidSink: Send + Sync {
    /// Writes an 8-byte keyboard report: modifier byte plus up to 6 scan
    /// codes (unused slots are zero-padded by the caller).
    fn send_keyboard(&self, modifier: u8, keys: &[u8; 6]) -> Result<()>;

    /// Writes a 5-byte absolute mouse report, little-endian.
    fn send_mouse(&self, buttons: u8, x: u16, y: u16) -> Result<()>;
}

/// Discards every report; used in tests and whenever no gadget is attached.
#[derive(Debug, Default)]
pub struct NullHidSink;

impl HidSink for NullHidSink {
    fn send_keyboard(&self, _modifier: u8, _keys: &[u8; 6]) -> Result<()> {
        Ok(())
    }

    fn send_mouse(&self, _buttons: u8, _x: u16, _y: u16) -> Result<()> {
        Ok(())
    }
}

/// Feeds decoded [`InputReport`]s to a [`HidSink`], tracking which keys are
/// currently held so a single key-up report can clear just that scan code.
pub struct InputRouter<S: HidSink> {
    sink: S,
    decoder: InputDecoder,
    keys_held: [u8; 6],
}

impl<S: HidSink> InputRouter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, decoder: InputDecoder::new(), keys_held: [0; 6] }
    }

    /// Decodes `buf` (already run through [`input_transport::unpack_js_binary`]
    /// if it came from the browser) and forwards every report to the sink.
    pub fn handle(&mut self, buf: &[u8]) -> Result<()> {
        for report in self.decoder.decode(buf)? {
            match report {
                InputReport::Keyboard { modifier, scan_codes } => {
                    self.keys_held = [0; 6];
                    for (slot, code) in self.keys_held.iter_mut().zip(scan_codes.into_iter()) {
                        *slot = code;
                    }
                    self.sink.send_keyboard(modifier, &self.keys_held)?;
                }
                InputReport::Mouse { buttons, x, y } => {
                    self.sink.send_mouse(buttons, x, y)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        keyboard_calls: Mutex<Vec<(u8, [u8; 6])>>,
        mouse_calls: Mutex<Vec<(u8, u16, u16)>>,
    }

    impl HidSink for RecordingSink {
        fn send_keyboard(&self, modifier: u8, keys: &[u8; 6]) -> Result<()> {
            self.keyboard_calls.lock().unwrap().push((modifier, *keys));
            Ok(())
        }

        fn send_mouse(&self, buttons: u8, x: u16, y: u16) -> Result<()> {
            self.mouse_calls.lock().unwrap().push((buttons, x, y));
            Ok(())
        }
    }

    #[test]
    fn router_forwards_mouse_report_to_sink() {
        let mut router = InputRouter::new(RecordingSink::default());
        router.handle(&[0x01, 0x85, 0x00, 0x00, 0x80, 0x00, 0x80]).unwrap();

        let calls = router.sink.mouse_calls.lock().unwrap();
        assert_eq!(*calls, vec![(0, 0x8000, 0x8000)]);
    }

    #[test]
    fn router_zero_pads_keyboard_report_below_six_keys() {
        let mut router = InputRouter::new(RecordingSink::default());
        router.handle(&[0x01, 0x02, 0x00, 0x04]).unwrap();

        let calls = router.sink.keyboard_calls.lock().unwrap();
        assert_eq!(*calls, vec![(0, [0x04, 0, 0, 0, 0, 0])]);
    }

    #[test]
    fn null_sink_accepts_everything() {
        let mut router = InputRouter::new(NullHidSink);
        router.handle(&[0x01, 0x02, 0x00, 0x04]).unwrap();
    }
}
