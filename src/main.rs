//! Sound level collection daemon for the NSRT_mk3_Dev.
//!
//! # Usage
//!
//! ```bash
//! # Collect with the defaults (C weighting, America/Los_Angeles, ./measurements)
//! nsrt-collector
//!
//! # A-weighting, UTC timestamps, keep a week of archives
//! nsrt-collector --weighting a --timezone UTC --keep 7
//! ```

use chrono::{DateTime, SecondsFormat, Timelike};
use chrono_tz::Tz;
use clap::{Parser, ValueEnum};
use nsrt_collector::device::{self, DeviceError, Nsrt, Weighting};
use nsrt_collector::logger::RollingCsvWriterBuilder;
use nsrt_collector::metadata::Metadata;
use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "nsrt-collector")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Collect sound level measurements from an NSRT_mk3_Dev into rotating CSV logs")]
struct Cli {
    /// Glob pattern matching the device node
    #[arg(
        long,
        default_value = "/dev/serial/by-id/usb-Convergence_Instruments_NSRT_mk3_Dev-*"
    )]
    device_glob: String,

    /// IANA time zone for record timestamps and the daily rotation boundary
    #[arg(long, default_value = "America/Los_Angeles")]
    timezone: Tz,

    /// Directory for the measurement logs
    #[arg(long, default_value = "measurements")]
    log_dir: PathBuf,

    /// Base name of the active log file
    #[arg(long, default_value = "decibel_measurements.csv")]
    log_file: String,

    /// Frequency weighting the device must apply
    #[arg(short, long, value_enum, default_value = "c")]
    weighting: WeightingArg,

    /// Archived day files to keep (0 keeps everything)
    #[arg(long, default_value = "0")]
    keep: u64,

    /// Verbose mode (per-sample logging)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WeightingArg {
    C,
    A,
    Z,
}

impl From<WeightingArg> for Weighting {
    fn from(arg: WeightingArg) -> Self {
        match arg {
            WeightingArg::C => Weighting::C,
            WeightingArg::A => Weighting::A,
            WeightingArg::Z => Weighting::Z,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("nsrt_collector=debug")
    } else {
        EnvFilter::new("nsrt_collector=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(err) = run(&cli) {
        tracing::error!(%err, "Collector failed");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let device_path = device::find_device(&cli.device_glob)?;
    tracing::info!(path = %device_path.display(), "Found sound level meter");

    let mut nsrt = Nsrt::open(&device_path.to_string_lossy())?;
    let weighting = ensure_weighting(&mut nsrt, cli.weighting.into())?;

    let metadata = Metadata::read_from(&mut nsrt, weighting)?;
    tracing::info!(
        model = %metadata.model,
        serial = %metadata.serial,
        firmware = %metadata.firmware,
        weighting = metadata.weighting.label(),
        "Connected"
    );

    let mut writer = RollingCsvWriterBuilder::new(&cli.log_dir, cli.log_file.as_str(), metadata.header_block())
        .time_zone(cli.timezone)
        .max_keep_files(cli.keep)
        .build()?;
    tracing::info!(
        path = %cli.log_dir.join(&cli.log_file).display(),
        timezone = %cli.timezone,
        "Logging measurements"
    );

    loop {
        let timestamp = format_timestamp(chrono::Utc::now().with_timezone(&cli.timezone));
        let leq = nsrt.read_leq()?;
        let level = nsrt.read_level()?;

        let record = format_record(&timestamp, leq, level);
        tracing::debug!(%record, "Sample");
        writer.write_record(&record)?;

        thread::sleep(SAMPLE_INTERVAL);
    }
}

/// Verify the device runs with the requested weighting, correcting it if
/// necessary. A correction that does not survive a readback is fatal.
fn ensure_weighting(nsrt: &mut Nsrt, target: Weighting) -> device::Result<Weighting> {
    let current = nsrt.read_weighting()?;
    if current != target {
        tracing::info!(from = ?current, to = ?target, "Correcting device weighting");
        nsrt.write_weighting(target)?;
        if nsrt.read_weighting()? != target {
            return Err(DeviceError::WeightingNotApplied(target));
        }
    }
    Ok(target)
}

/// ISO-8601 timestamp with UTC offset, truncated to whole seconds.
fn format_timestamp(now: DateTime<Tz>) -> String {
    let truncated = now.with_nanosecond(0).unwrap_or(now);
    truncated.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// One CSV row: timestamp plus the two levels with two fractional digits.
fn format_record(timestamp: &str, leq: f32, level: f32) -> String {
    format!("{timestamp},{leq:.2},{level:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Los_Angeles;

    #[test]
    fn record_rounds_to_two_fractional_digits() {
        assert_eq!(
            format_record("2024-03-10T07:59:59-07:00", 32.456, 30.1),
            "2024-03-10T07:59:59-07:00,32.46,30.10"
        );
    }

    #[test]
    fn timestamp_truncates_subseconds_and_keeps_offset() {
        // DST transition day in Los Angeles; 07:59:59.5 is already on PDT.
        let t = Los_Angeles
            .with_ymd_and_hms(2024, 3, 10, 7, 59, 59)
            .unwrap()
            .with_nanosecond(500_000_000)
            .unwrap();
        assert_eq!(format_timestamp(t), "2024-03-10T07:59:59-07:00");
    }

    #[test]
    fn timestamp_offset_before_transition() {
        let t = Los_Angeles.with_ymd_and_hms(2024, 3, 10, 1, 30, 0).unwrap();
        assert_eq!(format_timestamp(t), "2024-03-10T01:30:00-08:00");
    }
}
