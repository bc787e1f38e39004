//! Data collector for the NSRT_mk3_Dev sound level meter.
//!
//! Pairs a small serial driver for the Convergence Instruments NSRT_mk3_Dev
//! with a rotating, header-annotated CSV writer. The `nsrt-collector` binary
//! wires them together: locate the device, snapshot its identity and
//! calibration metadata, make sure the configured frequency weighting is
//! applied, then sample the LEQ and weighted sound levels once per second
//! into a daily-rotating log file.

pub mod device;
pub mod logger;
pub mod metadata;

pub use device::{DeviceError, Nsrt, Weighting};
pub use logger::{LogError, RollingCsvWriter, RollingCsvWriterBuilder};
pub use metadata::Metadata;
