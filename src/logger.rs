//! Rotating, header-annotated CSV writer.
//!
//! Records append to a single active file. At local midnight in the
//! configured time zone the active file is archived as `<base>.<YYYYMMDD>`
//! (the calendar day it covered) and a fresh file is started. Every file the
//! writer creates begins with the configured header block; the header is
//! written exactly once per file and never again when appending to an
//! existing non-empty file.

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for the rolling CSV writer
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to create log directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open log file '{path}': {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to archive log file '{from}' as '{to}': {source}")]
    ArchiveFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No valid rotation boundary after {0}")]
    InvalidBoundary(String),
}

/// Configures and builds a [`RollingCsvWriter`].
pub struct RollingCsvWriterBuilder {
    directory: PathBuf,
    filename: String,
    header: String,
    time_zone: Tz,
    max_keep_files: u64,
}

impl RollingCsvWriterBuilder {
    /// Start building a writer for `<directory>/<filename>` with the given
    /// header block (without trailing newline).
    pub fn new(directory: impl AsRef<Path>, filename: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            filename: filename.into(),
            header: header.into(),
            time_zone: Tz::UTC,
            max_keep_files: 0,
        }
    }

    /// Time zone whose midnight anchors the daily rotation boundary and names
    /// the archives.
    pub fn time_zone(mut self, time_zone: Tz) -> Self {
        self.time_zone = time_zone;
        self
    }

    /// Maximum number of archived files to keep. 0 keeps everything.
    pub fn max_keep_files(mut self, max_keep_files: u64) -> Self {
        self.max_keep_files = max_keep_files;
        self
    }

    /// Create the log directory if needed and open the active file.
    pub fn build(self) -> Result<RollingCsvWriter, LogError> {
        let now = Utc::now().with_timezone(&self.time_zone);
        self.build_at(now)
    }

    fn build_at(self, now: DateTime<Tz>) -> Result<RollingCsvWriter, LogError> {
        ensure_directory(&self.directory)?;

        let base_path = self.directory.join(&self.filename);
        let (file, needs_header) = open_log_file(&base_path)?;
        let next_boundary = next_midnight_after(now)?;

        Ok(RollingCsvWriter {
            directory: self.directory,
            filename: self.filename,
            base_path,
            header: self.header,
            time_zone: self.time_zone,
            max_keep_files: self.max_keep_files,
            file,
            needs_header,
            next_boundary,
        })
    }
}

/// Append-only CSV writer with daily rotation and header injection.
pub struct RollingCsvWriter {
    directory: PathBuf,
    filename: String,
    base_path: PathBuf,
    header: String,
    time_zone: Tz,
    max_keep_files: u64,
    file: File,
    needs_header: bool,
    next_boundary: DateTime<Tz>,
}

impl RollingCsvWriter {
    /// Append one record, rotating first if the midnight boundary has been
    /// crossed since the file was opened or last rotated.
    pub fn write_record(&mut self, line: &str) -> Result<(), LogError> {
        let now = Utc::now().with_timezone(&self.time_zone);
        self.write_record_at(now, line)
    }

    /// Flush the active file.
    pub fn flush(&mut self) -> Result<(), LogError> {
        self.file.flush()?;
        Ok(())
    }

    fn write_record_at(&mut self, now: DateTime<Tz>, line: &str) -> Result<(), LogError> {
        if now >= self.next_boundary {
            self.rotate(now)?;
        }

        if self.needs_header {
            self.file.write_all(self.header.as_bytes())?;
            self.file.write_all(b"\n")?;
            self.needs_header = false;
        }

        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;

        Ok(())
    }

    /// Archive the active file under the date of the day that just ended and
    /// start a fresh one.
    fn rotate(&mut self, now: DateTime<Tz>) -> Result<(), LogError> {
        // Nothing was ever written to the active file: there is no segment to
        // archive (and an empty file must not become a headerless archive).
        // Move the boundary forward and keep writing to the same file.
        if self.needs_header {
            self.next_boundary = next_midnight_after(now)?;
            return Ok(());
        }

        self.file.flush()?;

        let ended_day = self
            .next_boundary
            .date_naive()
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| LogError::InvalidBoundary(self.next_boundary.to_string()))?;
        let archive = self.archive_path(ended_day);

        fs::rename(&self.base_path, &archive).map_err(|source| LogError::ArchiveFile {
            from: self.base_path.clone(),
            to: archive.clone(),
            source,
        })?;

        let (file, needs_header) = open_log_file(&self.base_path)?;
        self.file = file;
        self.needs_header = needs_header;
        self.next_boundary = next_midnight_after(now)?;

        if self.max_keep_files > 0 {
            self.prune_archives()?;
        }

        Ok(())
    }

    /// Pick the archive name for a finished day. An existing archive is never
    /// overwritten: if the process rotated more than once within the same day
    /// the later segments get numbered names.
    fn archive_path(&self, ended_day: NaiveDate) -> PathBuf {
        let dated = format!("{}.{}", self.filename, ended_day.format("%Y%m%d"));
        let candidate = self.directory.join(&dated);
        if !candidate.exists() {
            return candidate;
        }

        let mut index = 1u64;
        loop {
            let candidate = self.directory.join(format!("{dated}.{index}"));
            if !candidate.exists() {
                return candidate;
            }
            index += 1;
        }
    }

    /// Delete the oldest archives beyond `max_keep_files`. The date suffix
    /// sorts chronologically, so a plain name sort orders the archives.
    fn prune_archives(&self) -> Result<(), LogError> {
        let mut archives: Vec<PathBuf> = fs::read_dir(&self.directory)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| is_archive_name(&self.filename, name))
            })
            .collect();
        archives.sort();

        let keep = self.max_keep_files as usize;
        if archives.len() > keep {
            for path in &archives[..archives.len() - keep] {
                fs::remove_file(path)?;
            }
        }

        Ok(())
    }
}

/// Does `name` look like an archive of `base`, i.e. `<base>.YYYYMMDD` or
/// `<base>.YYYYMMDD.N`?
fn is_archive_name(base: &str, name: &str) -> bool {
    let Some(rest) = name.strip_prefix(base).and_then(|rest| rest.strip_prefix('.')) else {
        return false;
    };

    let (date, index) = match rest.split_once('.') {
        Some((date, index)) => (date, Some(index)),
        None => (rest, None),
    };

    date.len() == 8
        && date.bytes().all(|b| b.is_ascii_digit())
        && index.is_none_or(|i| !i.is_empty() && i.bytes().all(|b| b.is_ascii_digit()))
}

/// Create the log directory if absent, with group-writable permissions.
fn ensure_directory(directory: &Path) -> Result<(), LogError> {
    if directory.is_dir() {
        return Ok(());
    }

    let map_err = |source| LogError::CreateDirectory {
        path: directory.to_path_buf(),
        source,
    };
    fs::create_dir_all(directory).map_err(map_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(directory, fs::Permissions::from_mode(0o775)).map_err(map_err)?;
    }

    Ok(())
}

/// Open the active file for appending, reporting whether it is fresh (and so
/// still needs the header).
fn open_log_file(path: &Path) -> Result<(File, bool), LogError> {
    let map_err = |source| LogError::OpenFile {
        path: path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(map_err)?;
    let len = file.metadata().map_err(map_err)?.len();

    Ok((file, len == 0))
}

/// The first instant of the next calendar day in `t`'s time zone.
///
/// Midnight is resolved through the time zone database, so the boundary is a
/// calendar day and not a fixed 86400-second interval. If a DST jump removes
/// midnight itself, the day starts at the first instant after the gap.
fn next_midnight_after(t: DateTime<Tz>) -> Result<DateTime<Tz>, LogError> {
    let next_day = t
        .date_naive()
        .checked_add_days(Days::new(1))
        .ok_or_else(|| LogError::InvalidBoundary(t.to_string()))?;

    let midnight = next_day.and_time(NaiveTime::MIN);
    match t.timezone().from_local_datetime(&midnight) {
        LocalResult::Single(dt) => Ok(dt),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest),
        LocalResult::None => t
            .timezone()
            .from_local_datetime(&(midnight + chrono::Duration::hours(1)))
            .earliest()
            .ok_or_else(|| LogError::InvalidBoundary(t.to_string())),
    }
}
