//! Device metadata snapshot and the header block written atop every log file.

use crate::device::{self, Nsrt, Weighting};

/// Measurement name recorded in the header, for downstream ingestion.
const MEASUREMENT_NAME: &str = "decibels";

/// CSV column row, written after the metadata comments.
pub const CSV_COLUMNS: &str = "timestamp,leq_level,weighted_level";

/// Identity and calibration metadata read from the device once at startup.
///
/// The snapshot is immutable for the process lifetime; the same header block
/// is written verbatim at the top of every rotated log file.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub date_of_birth: String,
    pub date_of_calibration: String,
    pub weighting: Weighting,
}

impl Metadata {
    /// Read the metadata fields from an open device.
    ///
    /// `weighting` is the verified setting the device is running with, not
    /// necessarily what it reported before startup correction.
    pub fn read_from(nsrt: &mut Nsrt, weighting: Weighting) -> device::Result<Self> {
        Ok(Self {
            model: nsrt.read_model()?,
            serial: nsrt.read_serial_number()?,
            firmware: nsrt.read_firmware_revision()?,
            date_of_birth: nsrt.read_birth_date()?,
            date_of_calibration: nsrt.read_calibration_date()?,
            weighting,
        })
    }

    /// Render the header block: `# key = value` comment lines followed by the
    /// CSV column row. No trailing newline.
    pub fn header_block(&self) -> String {
        let tags = [
            format!("# measurement_name = {MEASUREMENT_NAME}"),
            format!("# model = {}", self.model),
            format!("# serial = {}", self.serial),
            format!("# firmware = {}", self.firmware),
            format!("# date_manufacture = {}", self.date_of_birth),
            format!("# date_calibration = {}", self.date_of_calibration),
            format!("# weighting = {}", self.weighting.label()),
        ];

        format!("{}\n{}", tags.join("\n"), CSV_COLUMNS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        Metadata {
            model: "NSRT_mk3_Dev".to_string(),
            serial: "A1B2C3".to_string(),
            firmware: "1.2".to_string(),
            date_of_birth: "2020-05-01T09:30:00".to_string(),
            date_of_calibration: "2023-11-12T14:00:00".to_string(),
            weighting: Weighting::C,
        }
    }

    #[test]
    fn header_block_layout() {
        let expected = "\
# measurement_name = decibels
# model = NSRT_mk3_Dev
# serial = A1B2C3
# firmware = 1.2
# date_manufacture = 2020-05-01T09:30:00
# date_calibration = 2023-11-12T14:00:00
# weighting = dBC
timestamp,leq_level,weighted_level";
        assert_eq!(sample().header_block(), expected);
    }

    #[test]
    fn header_uses_weighting_label_not_enum() {
        let mut metadata = sample();
        metadata.weighting = Weighting::A;
        assert!(metadata.header_block().contains("# weighting = dBA"));
        assert!(!metadata.header_block().contains("# weighting = A\n"));
    }
}
