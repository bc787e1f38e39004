//! Serial driver for the NSRT_mk3_Dev sound level meter.
//!
//! The device speaks a simple command/response protocol over USB CDC serial:
//! each command is a 12-byte little-endian packet (command code, address,
//! byte count), reads return raw bytes and writes are acknowledged with a
//! single `0x06` byte.

use bytes::{BufMut, BytesMut};
use chrono::DateTime;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const BAUD_RATE: u32 = 9600;
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Seconds between the device epoch (1904-01-01) and the Unix epoch.
const DEVICE_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Error type for the NSRT_mk3_Dev driver
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No device found matching {0}")]
    NoDevice(String),

    #[error("Invalid device glob pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),

    #[error("Device did not acknowledge command")]
    NoAcknowledge,

    #[error("Invalid response from device")]
    InvalidResponse,

    #[error("Device did not apply weighting {0:?}")]
    WeightingNotApplied(Weighting),
}

/// Result type for the NSRT_mk3_Dev driver
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Weighting functions supported by the NSRT_mk3_Dev
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// C-weighting (dB-C)
    C = 0,
    /// A-weighting (dB-A)
    A = 1,
    /// Z-weighting (dB-Z)
    Z = 2,
}

impl Weighting {
    /// Human-readable label, as written into the log header.
    pub fn label(self) -> &'static str {
        match self {
            Weighting::C => "dBC",
            Weighting::A => "dBA",
            Weighting::Z => "dBZ",
        }
    }
}

/// Command codes for the NSRT_mk3_Dev device
#[derive(Debug, Clone, Copy)]
enum Command {
    ReadLevel = 0x80000010,
    ReadLEQ = 0x80000011,
    ReadWeighting = 0x80000020,
    ReadModel = 0x80000031,
    ReadSN = 0x80000032,
    ReadFWRev = 0x80000033,
    ReadDOC = 0x80000034,
    ReadDOB = 0x80000035,
    WriteWeighting = 0x00000020,
}

/// Resolve a filesystem glob pattern to the device node of an attached
/// NSRT_mk3_Dev.
///
/// When the pattern matches more than one node the lexicographically first
/// match is used, so repeated runs pick the same device.
pub fn find_device(pattern: &str) -> Result<PathBuf> {
    let mut matches: Vec<PathBuf> = glob::glob(pattern)?.filter_map(|entry| entry.ok()).collect();
    matches.sort();

    matches
        .into_iter()
        .next()
        .ok_or_else(|| DeviceError::NoDevice(pattern.to_string()))
}

/// Encode a command packet (12 bytes, all fields little-endian).
fn encode_command(cmd: Command, address: u32, count: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12);

    buf.put_u32_le(cmd as u32);
    buf.put_u32_le(address);
    buf.put_u32_le(count);

    buf
}

/// Decode a null-terminated string field.
fn decode_string(data: &[u8]) -> String {
    let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());

    String::from_utf8_lossy(&data[..null_pos]).to_string()
}

/// Convert a device timestamp (seconds since the 1904 epoch) to an ISO-8601
/// date string.
fn decode_date(utc_1904: u64) -> Result<String> {
    let unix = utc_1904 as i64 - DEVICE_EPOCH_OFFSET;
    let datetime = DateTime::from_timestamp(unix, 0).ok_or(DeviceError::InvalidResponse)?;

    Ok(datetime.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// The driver for the NSRT_mk3_Dev device
pub struct Nsrt {
    port: Box<dyn SerialPort>,
}

impl Nsrt {
    /// Open the device at a specific serial port
    pub fn open(port_name: &str) -> Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;

        Ok(Self { port })
    }

    /// Send a command to the device
    fn send_command(&mut self, cmd: Command, address: u32, count: u32) -> Result<()> {
        self.port.write_all(&encode_command(cmd, address, count))?;

        Ok(())
    }

    /// Send a command with data to the device
    fn send_command_with_data(&mut self, cmd: Command, address: u32, data: &[u8]) -> Result<()> {
        // Send command packet
        self.send_command(cmd, address, data.len() as u32)?;

        // Send data packet
        self.port.write_all(data)?;

        // Wait for acknowledgment
        let mut ack = [0u8; 1];
        self.port.read_exact(&mut ack)?;

        if ack[0] != 0x06 {
            return Err(DeviceError::NoAcknowledge);
        }

        Ok(())
    }

    /// Send a command and read response data
    fn send_command_and_read(&mut self, cmd: Command, address: u32, count: u32) -> Result<Vec<u8>> {
        // Send command packet
        self.send_command(cmd, address, count)?;

        // Read response
        let mut response = vec![0u8; count as usize];
        self.port.read_exact(&mut response)?;

        Ok(response)
    }

    /// Read a null-terminated string field
    fn read_string(&mut self, cmd: Command) -> Result<String> {
        // String fields are 0-32 bytes, so request 32
        let data = self.send_command_and_read(cmd, 0, 32)?;

        Ok(decode_string(&data))
    }

    /// Read a device timestamp field as an ISO-8601 date string
    fn read_date(&mut self, cmd: Command) -> Result<String> {
        let data = self.send_command_and_read(cmd, 0, 8)?;

        let utc = u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);

        decode_date(utc)
    }

    // High-level API functions

    /// Read the current sound level in dB
    pub fn read_level(&mut self) -> Result<f32> {
        let data = self.send_command_and_read(Command::ReadLevel, 0, 4)?;
        Ok(f32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Read the current LEQ (Equivalent Continuous Sound Level) in dB
    /// and restart integration for the next LEQ measurement
    pub fn read_leq(&mut self) -> Result<f32> {
        let data = self.send_command_and_read(Command::ReadLEQ, 0, 4)?;
        Ok(f32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Read the current weighting curve
    pub fn read_weighting(&mut self) -> Result<Weighting> {
        let data = self.send_command_and_read(Command::ReadWeighting, 0, 1)?;
        match data[0] {
            0 => Ok(Weighting::C),
            1 => Ok(Weighting::A),
            2 => Ok(Weighting::Z),
            _ => Err(DeviceError::InvalidResponse),
        }
    }

    /// Set the weighting curve
    pub fn write_weighting(&mut self, weighting: Weighting) -> Result<()> {
        let data = [weighting as u8];
        self.send_command_with_data(Command::WriteWeighting, 0, &data)
    }

    /// Read the model name
    pub fn read_model(&mut self) -> Result<String> {
        self.read_string(Command::ReadModel)
    }

    /// Read the serial number
    pub fn read_serial_number(&mut self) -> Result<String> {
        self.read_string(Command::ReadSN)
    }

    /// Read the firmware revision
    pub fn read_firmware_revision(&mut self) -> Result<String> {
        self.read_string(Command::ReadFWRev)
    }

    /// Read the date of last calibration
    pub fn read_calibration_date(&mut self) -> Result<String> {
        self.read_date(Command::ReadDOC)
    }

    /// Read the date of birth (manufacturing date)
    pub fn read_birth_date(&mut self) -> Result<String> {
        self.read_date(Command::ReadDOB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_packet_layout() {
        let buf = encode_command(Command::ReadLevel, 0, 4);
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[0..4], &[0x10, 0x00, 0x00, 0x80]);
        assert_eq!(&buf[4..8], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[8..12], &[0x04, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn write_command_packet_layout() {
        let buf = encode_command(Command::WriteWeighting, 0, 1);
        assert_eq!(&buf[0..4], &[0x20, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[8..12], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn string_decoding_stops_at_null() {
        assert_eq!(decode_string(b"NSRT_mk3_Dev\0garbage"), "NSRT_mk3_Dev");
        // No terminator: whole buffer is the string
        assert_eq!(decode_string(b"NSRT_mk3_Dev"), "NSRT_mk3_Dev");
    }

    #[test]
    fn date_decoding() {
        // 1904 epoch offset lands exactly on the Unix epoch
        assert_eq!(decode_date(2_082_844_800).unwrap(), "1970-01-01T00:00:00");
        // 2021-06-15T12:34:56Z
        assert_eq!(
            decode_date(2_082_844_800 + 1_623_760_496).unwrap(),
            "2021-06-15T12:34:56"
        );
    }

    #[test]
    fn weighting_labels() {
        assert_eq!(Weighting::C.label(), "dBC");
        assert_eq!(Weighting::A.label(), "dBA");
        assert_eq!(Weighting::Z.label(), "dBZ");
    }

    #[test]
    fn find_device_reports_pattern() {
        let err = find_device("/nonexistent/usb-Convergence_*").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/usb-Convergence_*"));
    }
}
