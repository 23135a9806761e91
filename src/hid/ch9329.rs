//! CH9329 serial HID bridge (WCH 沁恒): a USB HID chip controlled over UART,
//! used as a [`super::HidSink`] when no USB OTG gadget is available.
//!
//! ## Protocol format
//! ```text
//! ┌──────┬──────┬──────┬────────┬──────────────┬──────────┐
//! │Header│ ADDR │ CMD  │  LEN   │     DATA     │   SUM    │
//! ├──────┼──────┼──────┼────────┼──────────────┼──────────┤
//! │57 AB │ 00   │ xx   │   N    │   N bytes    │Checksum  │
//! └──────┴──────┴──────┴────────┴──────────────┴──────────┘
//! ```
//! Checksum: sum of all bytes including the header, modulo 256.

use parking_lot::{Mutex, RwLock};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::types::KeyboardReport;
use super::HidSink;
use crate::error::{HidError, Result};

const PACKET_HEADER: [u8; 2] = [0x57, 0xAB];
const DEFAULT_ADDR: u8 = 0x00;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
const RESPONSE_TIMEOUT_MS: u64 = 500;
const MAX_DATA_LEN: usize = 64;
const CH9329_MOUSE_RESOLUTION: u32 = 4096;
const DEFAULT_RETRY_COUNT: u32 = 3;
const RESET_WAIT_MS: u64 = 2000;
const RETRY_COOLDOWN_MS: u64 = 100;

#[allow(dead_code)]
pub mod cmd {
    pub const GET_INFO: u8 = 0x01;
    pub const SEND_KB_GENERAL_DATA: u8 = 0x02;
    pub const SEND_KB_MEDIA_DATA: u8 = 0x03;
    pub const SEND_MS_ABS_DATA: u8 = 0x04;
    pub const SEND_MS_REL_DATA: u8 = 0x05;
    pub const SEND_MY_HID_DATA: u8 = 0x06;
    pub const GET_PARA_CFG: u8 = 0x08;
    pub const SET_PARA_CFG: u8 = 0x09;
    pub const SET_DEFAULT_CFG: u8 = 0x0C;
    pub const RESET: u8 = 0x0F;
}

const RESPONSE_ERROR_MASK: u8 = 0xC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ch9329Error {
    Success = 0x00,
    Timeout = 0xE1,
    InvalidHeader = 0xE2,
    InvalidCommand = 0xE3,
    ChecksumError = 0xE4,
    ParameterError = 0xE5,
    OperationFailed = 0xE6,
}

impl From<u8> for Ch9329Error {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Ch9329Error::Success,
            0xE1 => Ch9329Error::Timeout,
            0xE2 => Ch9329Error::InvalidHeader,
            0xE3 => Ch9329Error::InvalidCommand,
            0xE4 => Ch9329Error::ChecksumError,
            0xE5 => Ch9329Error::ParameterError,
            _ => Ch9329Error::OperationFailed,
        }
    }
}

impl std::fmt::Display for Ch9329Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Ch9329Error::Success => "success",
            Ch9329Error::Timeout => "serial receive timeout",
            Ch9329Error::InvalidHeader => "invalid packet header",
            Ch9329Error::InvalidCommand => "invalid command code",
            Ch9329Error::ChecksumError => "checksum mismatch",
            Ch9329Error::ParameterError => "parameter error",
            Ch9329Error::OperationFailed => "operation failed",
        };
        write!(f, "{msg}")
    }
}

/// Chip version/status as reported by `GET_INFO`.
#[derive(Debug, Clone, Default)]
pub struct ChipInfo {
    pub version: String,
    pub version_raw: u8,
    pub usb_connected: bool,
    pub num_lock: bool,
    pub caps_lock: bool,
    pub scroll_lock: bool,
}

impl ChipInfo {
    pub fn from_response(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let version_raw = data[0];
        Some(Self {
            version: format!("V{}.{}", version_raw >> 4, version_raw & 0x0F),
            version_raw,
            usb_connected: data[1] == 0x01,
            num_lock: (data[2] & 0x01) != 0,
            caps_lock: (data[2] & 0x02) != 0,
            scroll_lock: (data[2] & 0x04) != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedStatus {
    pub num_lock: bool,
    pub caps_lock: bool,
    pub scroll_lock: bool,
}

impl From<u8> for LedStatus {
    fn from(byte: u8) -> Self {
        Self { num_lock: (byte & 0x01) != 0, caps_lock: (byte & 0x02) != 0, scroll_lock: (byte & 0x04) != 0 }
    }
}

/// A parsed CH9329 response frame.
#[derive(Debug)]
pub struct Response {
    pub address: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
    pub is_error: bool,
    pub error_code: Option<Ch9329Error>,
}

impl Response {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 || bytes[0] != PACKET_HEADER[0] || bytes[1] != PACKET_HEADER[1] {
            return None;
        }

        let address = bytes[2];
        let cmd = bytes[3];
        let len = bytes[4] as usize;
        if bytes.len() < 5 + len + 1 {
            return None;
        }

        let expected_checksum = bytes[5 + len];
        let calculated_checksum = bytes[..5 + len].iter().fold(0u8, |acc, &x| acc.wrapping_add(x));
        if expected_checksum != calculated_checksum {
            warn!("CH9329 checksum mismatch: expected {expected_checksum:02X}, got {calculated_checksum:02X}");
            return None;
        }

        let data = bytes[5..5 + len].to_vec();
        let is_error = (cmd & RESPONSE_ERROR_MASK) == RESPONSE_ERROR_MASK;
        let error_code = if is_error && !data.is_empty() { Some(Ch9329Error::from(data[0])) } else { None };

        Some(Self { address, cmd, data, is_error, error_code })
    }

    pub fn is_success(&self) -> bool {
        !self.is_error && (self.data.is_empty() || self.data[0] == Ch9329Error::Success as u8)
    }
}

const MAX_PACKET_SIZE: usize = 70;

/// Serial-port-backed CH9329 bridge.
///
/// `keyboard_state`/mouse last-position tracking exists so partial updates
/// (a single key release, a click at the last known cursor position) can be
/// folded into a full report before transmission, matching how the chip
/// expects each command to carry the complete current state.
pub struct Ch9329Sink {
    port_path: String,
    baud_rate: u32,
    port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    keyboard_state: Mutex<KeyboardReport>,
    last_abs_x: Mutex<u16>,
    last_abs_y: Mutex<u16>,
    chip_info: RwLock<Option<ChipInfo>>,
    address: u8,
    error_count: AtomicU32,
    reset_in_progress: AtomicBool,
    last_success: Mutex<Option<Instant>>,
    max_retries: u32,
}

impl Ch9329Sink {
    pub fn new(port_path: &str) -> Result<Self> {
        Self::with_baud_rate(port_path, DEFAULT_BAUD_RATE)
    }

    pub fn with_baud_rate(port_path: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self {
            port_path: port_path.to_string(),
            baud_rate,
            port: Mutex::new(None),
            keyboard_state: Mutex::new(KeyboardReport::default()),
            last_abs_x: Mutex::new(0),
            last_abs_y: Mutex::new(0),
            chip_info: RwLock::new(None),
            address: DEFAULT_ADDR,
            error_count: AtomicU32::new(0),
            reset_in_progress: AtomicBool::new(false),
            last_success: Mutex::new(None),
            max_retries: DEFAULT_RETRY_COUNT,
        })
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    pub fn is_port_open(&self) -> bool {
        self.port.lock().is_some()
    }

    fn sink_error(reason: impl Into<String>) -> crate::error::AppError {
        HidError::SinkWrite { sink: "ch9329".to_string(), reason: reason.into() }.into()
    }

    /// Opens the serial port and confirms the chip responds to `GET_INFO`.
    pub fn init(&self) -> Result<()> {
        let port = serialport::new(&self.port_path, self.baud_rate)
            .timeout(Duration::from_millis(RESPONSE_TIMEOUT_MS))
            .open()
            .map_err(|e| Self::sink_error(format!("opening {}: {e}", self.port_path)))?;

        *self.port.lock() = Some(port);
        info!("CH9329 serial port opened: {} @ {} baud", self.port_path, self.baud_rate);

        let info = self.query_chip_info().map_err(|e| {
            *self.port.lock() = None;
            Self::sink_error(format!("chip not responding on {} @ {} baud: {e}", self.port_path, self.baud_rate))
        })?;

        info!(
            "CH9329 chip detected: {}, USB {}",
            info.version,
            if info.usb_connected { "connected" } else { "disconnected" }
        );
        *self.last_success.lock() = Some(Instant::now());
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        let _ = self.reset();
        *self.port.lock() = None;
        info!("CH9329 sink shut down");
        Ok(())
    }

    #[inline]
    fn calculate_checksum(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
    }

    #[inline]
    fn build_packet_buf(&self, cmd: u8, data: &[u8]) -> ([u8; MAX_PACKET_SIZE], usize) {
        debug_assert!(data.len() <= MAX_DATA_LEN, "CH9329 data payload too long");

        let len = data.len() as u8;
        let packet_len = 6 + data.len();
        let mut packet = [0u8; MAX_PACKET_SIZE];
        packet[0] = PACKET_HEADER[0];
        packet[1] = PACKET_HEADER[1];
        packet[2] = self.address;
        packet[3] = cmd;
        packet[4] = len;
        packet[5..5 + data.len()].copy_from_slice(data);
        packet[5 + data.len()] = Self::calculate_checksum(&packet[..5 + data.len()]);
        (packet, packet_len)
    }

    fn build_packet(&self, cmd: u8, data: &[u8]) -> Vec<u8> {
        let (buf, len) = self.build_packet_buf(cmd, data);
        buf[..len].to_vec()
    }

    fn send_packet_raw(&self, cmd: u8, data: &[u8]) -> Result<()> {
        let (packet, packet_len) = self.build_packet_buf(cmd, data);
        let mut guard = self.port.lock();
        match guard.as_mut() {
            Some(port) => {
                port.write_all(&packet[..packet_len]).map_err(|e| Self::sink_error(format!("write: {e}")))?;
                trace!("CH9329 TX [cmd=0x{cmd:02X}]: {:02X?}", &packet[..packet_len]);
                Ok(())
            }
            None => Err(Self::sink_error("port not opened")),
        }
    }

    fn send_packet(&self, cmd: u8, data: &[u8]) -> Result<()> {
        if cmd == cmd::RESET {
            return self.send_packet_raw(cmd, data);
        }

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match self.send_packet_raw(cmd, data) {
                Ok(()) => {
                    self.error_count.store(0, Ordering::Relaxed);
                    *self.last_success.lock() = Some(Instant::now());
                    return Ok(());
                }
                Err(e) => {
                    let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                    last_error = Some(e);
                    if attempt + 1 < self.max_retries {
                        debug!("CH9329 send failed (attempt {}/{}), errors={count}", attempt + 1, self.max_retries);
                        if count >= 2 && !self.reset_in_progress.load(Ordering::Relaxed) {
                            if let Err(reset_err) = self.try_reset_and_recover() {
                                warn!("CH9329 reset failed: {reset_err}");
                            }
                        } else {
                            std::thread::sleep(Duration::from_millis(RETRY_COOLDOWN_MS));
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Self::sink_error("send failed after all retries")))
    }

    fn try_reset_and_recover(&self) -> Result<()> {
        if self.reset_in_progress.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("CH9329: attempting automatic reset and recovery");

        let result = (|| {
            self.send_packet_raw(cmd::RESET, &[])?;
            std::thread::sleep(Duration::from_millis(RESET_WAIT_MS));
            match self.query_chip_info() {
                Ok(info) => {
                    info!("CH9329: recovery successful, chip version {}", info.version);
                    self.error_count.store(0, Ordering::Relaxed);
                    *self.last_success.lock() = Some(Instant::now());
                    Ok(())
                }
                Err(e) => {
                    warn!("CH9329: recovery verification failed: {e}");
                    Err(e)
                }
            }
        })();

        self.reset_in_progress.store(false, Ordering::SeqCst);
        result
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        (*self.last_success.lock()).map(|last| last.elapsed() < Duration::from_secs(30)).unwrap_or(false)
    }

    fn send_and_receive(&self, cmd: u8, data: &[u8]) -> Result<Response> {
        let packet = self.build_packet(cmd, data);
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or_else(|| Self::sink_error("port not opened"))?;

        port.write_all(&packet).map_err(|e| Self::sink_error(format!("write: {e}")))?;
        trace!("CH9329 TX: {packet:02X?}");
        std::thread::sleep(Duration::from_millis(5));

        let mut response_buf = [0u8; 128];
        match port.read(&mut response_buf) {
            Ok(n) if n > 0 => {
                trace!("CH9329 RX: {:02X?}", &response_buf[..n]);
                Response::parse(&response_buf[..n]).ok_or_else(|| Self::sink_error("invalid response"))
            }
            Ok(_) => Err(Self::sink_error("no response")),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(Self::sink_error("response timeout")),
            Err(e) => Err(Self::sink_error(format!("read: {e}"))),
        }
    }

    pub fn query_chip_info(&self) -> Result<ChipInfo> {
        let response = self.send_and_receive(cmd::GET_INFO, &[])?;
        let info = ChipInfo::from_response(&response.data).ok_or_else(|| Self::sink_error("malformed GET_INFO response"))?;
        *self.chip_info.write() = Some(info.clone());
        Ok(info)
    }

    pub fn get_chip_info(&self) -> Option<ChipInfo> {
        self.chip_info.read().clone()
    }

    fn send_keyboard_report(&self, report: &KeyboardReport) -> Result<()> {
        self.send_packet(cmd::SEND_KB_GENERAL_DATA, &report.to_bytes())
    }

    /// Sends absolute mouse position + buttons. CH9329 coordinates run
    /// 0..4095; the wire protocol's 0..32767 range is rescaled on the way in.
    fn send_mouse_absolute(&self, buttons: u8, x: u16, y: u16) -> Result<()> {
        let data = [0x02, buttons, (x & 0xFF) as u8, (x >> 8) as u8, (y & 0xFF) as u8, (y >> 8) as u8, 0u8];
        self.send_packet(cmd::SEND_MS_ABS_DATA, &data)
    }

    pub fn reset(&self) -> Result<()> {
        {
            let mut state = self.keyboard_state.lock();
            state.clear();
            let report = state.clone();
            drop(state);
            self.send_keyboard_report(&report)?;
        }
        *self.last_abs_x.lock() = 0;
        *self.last_abs_y.lock() = 0;
        self.send_mouse_absolute(0, 0, 0)?;
        info!("CH9329 HID state reset");
        Ok(())
    }
}

impl HidSink for Ch9329Sink {
    fn send_keyboard(&self, modifier: u8, keys: &[u8; 6]) -> Result<()> {
        let mut state = self.keyboard_state.lock();
        state.modifiers = modifier;
        state.keys = *keys;
        let report = state.clone();
        drop(state);
        self.send_keyboard_report(&report)
    }

    fn send_mouse(&self, buttons: u8, x: u16, y: u16) -> Result<()> {
        let scaled_x = ((x.min(32767) as u32) * CH9329_MOUSE_RESOLUTION / 32768) as u16;
        let scaled_y = ((y.min(32767) as u32) * CH9329_MOUSE_RESOLUTION / 32768) as u16;
        *self.last_abs_x.lock() = scaled_x;
        *self.last_abs_y.lock() = scaled_y;
        self.send_mouse_absolute(buttons, scaled_x, scaled_y)
    }
}

/// Probes common serial ports/baud rates for a responding CH9329 chip.
pub fn detect_ch9329() -> Option<(String, u32)> {
    let common_ports = ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyAMA0", "/dev/serial0", "/dev/ttyS0"];
    let baud_rates = [9600, 115200, 57600, 38400, 19200];

    for port_path in common_ports {
        if !std::path::Path::new(port_path).exists() {
            continue;
        }
        for baud_rate in baud_rates {
            let Ok(mut port) = serialport::new(port_path, baud_rate).timeout(Duration::from_millis(200)).open() else {
                continue;
            };
            let packet = [0x57, 0xAB, 0x00, cmd::GET_INFO, 0x00, 0x03];
            if port.write_all(&packet).is_err() {
                continue;
            }
            std::thread::sleep(Duration::from_millis(50));
            let mut response = [0u8; 16];
            if let Ok(n) = port.read(&mut response) {
                if n >= 6 && response[0] == PACKET_HEADER[0] && response[1] == PACKET_HEADER[1] {
                    info!("CH9329 detected on {port_path} @ {baud_rate} baud");
                    return Some((port_path.to_string(), baud_rate));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_building() {
        let sink = Ch9329Sink::new("/dev/null").unwrap();

        let packet = sink.build_packet(cmd::GET_INFO, &[]);
        assert_eq!(packet, vec![0x57, 0xAB, 0x00, 0x01, 0x00, 0x03]);

        let data = [0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
        let packet = sink.build_packet(cmd::SEND_KB_GENERAL_DATA, &data);
        assert_eq!(packet[0], 0x57);
        assert_eq!(packet[1], 0xAB);
        assert_eq!(packet[3], cmd::SEND_KB_GENERAL_DATA);
        assert_eq!(packet[4], 8);
        assert_eq!(&packet[5..13], &data);
        let expected_checksum: u8 = packet[..13].iter().fold(0u8, |acc, &x| acc.wrapping_add(x));
        assert_eq!(packet[13], expected_checksum);
    }

    #[test]
    fn test_absolute_mouse_packet() {
        let sink = Ch9329Sink::new("/dev/null").unwrap();
        let data = [0x02, 0x01, 0x00, 0x08, 0x00, 0x08, 0x00];
        let packet = sink.build_packet(cmd::SEND_MS_ABS_DATA, &data);

        assert_eq!(packet[3], cmd::SEND_MS_ABS_DATA);
        assert_eq!(packet[4], 7);
        assert_eq!(packet[5], 0x02);
        assert_eq!(packet[6], 0x01); // buttons
    }

    #[test]
    fn test_checksum_calculation() {
        let packet = [0x57u8, 0xAB, 0x00, 0x01, 0x00];
        assert_eq!(Ch9329Sink::calculate_checksum(&packet), 0x03);

        let packet = [0x57u8, 0xAB, 0x00, 0x02, 0x08, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(Ch9329Sink::calculate_checksum(&packet), 0x10);
    }

    #[test]
    fn test_response_rejects_bad_checksum() {
        let response_bytes = [0x57, 0xAB, 0x00, 0x81, 0x08, 0x31, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0xE0];
        assert!(Response::parse(&response_bytes).is_none());
    }

    #[test]
    fn test_chip_info_parsing() {
        let data = [0x31, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00];
        let info = ChipInfo::from_response(&data).unwrap();
        assert_eq!(info.version, "V3.1");
        assert_eq!(info.version_raw, 0x31);
        assert!(info.usb_connected);
        assert!(info.num_lock);
        assert!(info.caps_lock);
        assert!(!info.scroll_lock);
    }

    #[test]
    fn test_led_status() {
        let led = LedStatus::from(0x07);
        assert!(led.num_lock && led.caps_lock && led.scroll_lock);
        let led = LedStatus::from(0x00);
        assert!(!led.num_lock && !led.caps_lock && !led.scroll_lock);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Ch9329Error::from(0x00), Ch9329Error::Success);
        assert_eq!(Ch9329Error::from(0xE1), Ch9329Error::Timeout);
        assert_eq!(Ch9329Error::from(0xE4), Ch9329Error::ChecksumError);
    }

    #[test]
    fn send_keyboard_without_open_port_reports_sink_error() {
        let sink = Ch9329Sink::new("/dev/null").unwrap();
        let err = sink.send_keyboard(0, &[0; 6]).unwrap_err();
        assert!(matches!(err, crate::error::AppError::Hid(HidError::SinkWrite { .. })));
    }
}
