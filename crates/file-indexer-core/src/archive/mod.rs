//! Container introspection for ZIP, TAR (plain, gzip, bzip2, xz) and RAR.
//!
//! A container is opened once and walked once: [`ArchiveScanner::scan_entries`]
//! consumes the scanner and hands each regular entry, already read into
//! memory, to a visitor. Directory entries and entries above the size ceiling
//! are never read. Per-entry failures are counted; once the configured
//! threshold is reached the rest of the container is abandoned.

use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::warn;

#[cfg(feature = "rar")]
mod rar;
mod tar;
mod zip;

pub use self::zip::decode_entry_name;

/// Separator between a container path and an entry name in a virtual path.
/// Never valid inside a real path on the scanned filesystems.
pub const VIRTUAL_PATH_SEPARATOR: &str = "::";

pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 500 * 1024 * 1024;
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_FAIL_THRESHOLD: usize = 50;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] ::zip::result::ZipError),

    #[error("RAR error: {0}")]
    Rar(String),

    #[error("Unsupported archive: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    Tar,
    Rar,
}

impl ArchiveKind {
    /// Classifies a path by its (case-insensitive) extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if [
            ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tbz", ".tar.xz", ".txz",
        ]
        .iter()
        .any(|ext| name.ends_with(ext))
        {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".rar") {
            Some(ArchiveKind::Rar)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::Rar => "rar",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{container}::{internal}`, with the container path rendered verbatim.
pub fn virtual_path(container: &Path, internal: &str) -> String {
    format!(
        "{}{}{}",
        container.to_string_lossy(),
        VIRTUAL_PATH_SEPARATOR,
        internal
    )
}

/// Splits a virtual path back into its container and entry name.
pub fn split_virtual_path(path: &str) -> Option<(&str, &str)> {
    path.split_once(VIRTUAL_PATH_SEPARATOR)
}

/// One regular entry extracted from a container.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub modified: NaiveDateTime,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    /// Name of the entry without its directory components.
    pub fn file_name(&self) -> &str {
        self.name
            .trim_end_matches('/')
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub enabled: bool,
    /// Containers larger than this are hashed but not opened.
    pub max_archive_size: u64,
    pub max_entry_size: u64,
    pub fail_threshold: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryScanSummary {
    pub entries: usize,
    pub skipped_large: usize,
    pub failures: usize,
    pub abandoned: bool,
}

/// Shared bookkeeping for the per-format scanners.
pub(crate) struct EntryTally<'a> {
    container: &'a Path,
    max_entry_size: u64,
    fail_threshold: usize,
    summary: EntryScanSummary,
}

impl<'a> EntryTally<'a> {
    fn new(container: &'a Path, options: &ArchiveOptions) -> Self {
        Self {
            container,
            max_entry_size: options.max_entry_size,
            fail_threshold: options.fail_threshold.max(1),
            summary: EntryScanSummary::default(),
        }
    }

    /// True when the entry is too large to read.
    fn oversized(&mut self, name: &str, size: u64) -> bool {
        if size > self.max_entry_size {
            warn!(
                "Skipping oversized entry {} ({} bytes) in {}",
                name,
                size,
                self.container.display()
            );
            self.summary.skipped_large += 1;
            return true;
        }
        false
    }

    /// Records a failed entry. Returns `Break` once the container should be abandoned.
    fn failure(&mut self, name: &str, err: &dyn fmt::Display) -> ControlFlow<()> {
        self.summary.failures += 1;
        warn!(
            "Failed to read entry {} in {}: {}",
            name,
            self.container.display(),
            err
        );
        if self.summary.failures >= self.fail_threshold {
            warn!(
                "Abandoning {} after {} entry failures",
                self.container.display(),
                self.summary.failures
            );
            self.summary.abandoned = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Records a failure that leaves the reader unusable.
    #[cfg_attr(not(feature = "rar"), allow(dead_code))]
    fn fatal(&mut self, name: &str, err: &dyn fmt::Display) {
        self.summary.failures += 1;
        self.summary.abandoned = true;
        warn!(
            "Abandoning {} at entry {}: {}",
            self.container.display(),
            name,
            err
        );
    }

    fn deliver(
        &mut self,
        entry: ArchiveEntry,
        visit: &mut dyn FnMut(ArchiveEntry) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        self.summary.entries += 1;
        visit(entry)
    }

    fn finish(self) -> EntryScanSummary {
        self.summary
    }
}

/// An opened container, ready to be walked once.
pub enum ArchiveScanner {
    Zip(self::zip::ZipScanner),
    Tar(self::tar::TarScanner),
    #[cfg(feature = "rar")]
    Rar(self::rar::RarScanner),
}

impl ArchiveScanner {
    /// Opens `path` according to its extension. Any error here means the
    /// container is unreadable and should be skipped as a whole.
    pub fn open(path: &Path, options: &ArchiveOptions) -> Result<Self, ArchiveError> {
        let kind = ArchiveKind::from_path(path)
            .ok_or_else(|| ArchiveError::Unsupported(path.display().to_string()))?;
        match kind {
            ArchiveKind::Zip => Ok(ArchiveScanner::Zip(self::zip::ZipScanner::open(
                path, options,
            )?)),
            ArchiveKind::Tar => Ok(ArchiveScanner::Tar(self::tar::TarScanner::open(
                path, options,
            )?)),
            #[cfg(feature = "rar")]
            ArchiveKind::Rar => Ok(ArchiveScanner::Rar(self::rar::RarScanner::open(
                path, options,
            )?)),
            #[cfg(not(feature = "rar"))]
            ArchiveKind::Rar => Err(ArchiveError::Unsupported(format!(
                "{} (built without RAR support)",
                path.display()
            ))),
        }
    }

    pub fn kind(&self) -> ArchiveKind {
        match self {
            ArchiveScanner::Zip(_) => ArchiveKind::Zip,
            ArchiveScanner::Tar(_) => ArchiveKind::Tar,
            #[cfg(feature = "rar")]
            ArchiveScanner::Rar(_) => ArchiveKind::Rar,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ArchiveScanner::Zip(s) => s.path(),
            ArchiveScanner::Tar(s) => s.path(),
            #[cfg(feature = "rar")]
            ArchiveScanner::Rar(s) => s.path(),
        }
    }

    /// Walks every regular entry once. The visitor may stop early by
    /// returning `ControlFlow::Break`.
    pub fn scan_entries(
        self,
        visit: &mut dyn FnMut(ArchiveEntry) -> ControlFlow<()>,
    ) -> EntryScanSummary {
        match self {
            ArchiveScanner::Zip(s) => s.scan_entries(visit),
            ArchiveScanner::Tar(s) => s.scan_entries(visit),
            #[cfg(feature = "rar")]
            ArchiveScanner::Rar(s) => s.scan_entries(visit),
        }
    }
}

/// Collects every entry of a container into memory.
pub fn read_all_entries(
    path: &Path,
    options: &ArchiveOptions,
) -> Result<(Vec<ArchiveEntry>, EntryScanSummary), ArchiveError> {
    let scanner = ArchiveScanner::open(path, options)?;
    let mut entries = Vec::new();
    let summary = scanner.scan_entries(&mut |entry| {
        entries.push(entry);
        ControlFlow::Continue(())
    });
    Ok((entries, summary))
}

pub(crate) fn unix_to_naive(secs: i64) -> NaiveDateTime {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// Decodes an MS-DOS packed date/time (date in the high word).
#[cfg_attr(not(feature = "rar"), allow(dead_code))]
pub(crate) fn dos_to_naive(packed: u32) -> NaiveDateTime {
    let date = packed >> 16;
    let time = packed & 0xFFFF;
    NaiveDate::from_ymd_opt(
        ((date >> 9) & 0x7F) as i32 + 1980,
        (date >> 5) & 0x0F,
        date & 0x1F,
    )
    .and_then(|d| d.and_hms_opt((time >> 11) & 0x1F, (time >> 5) & 0x3F, (time & 0x1F) * 2))
    .unwrap_or_default()
}
