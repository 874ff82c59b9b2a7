use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::archive::ArchiveKind;
use crate::engine::ScanSummary;

/// Lifecycle of one scan. `Cancelled` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanState {
    Idle,
    Running,
    Draining,
    Flushing,
    Done,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Done | ScanState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Running => "running",
            ScanState::Draining => "draining",
            ScanState::Flushing => "flushing",
            ScanState::Done => "done",
            ScanState::Cancelled => "cancelled",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ScanState::Idle => 0,
            ScanState::Running => 1,
            ScanState::Draining => 2,
            ScanState::Flushing => 3,
            ScanState::Done => 4,
            ScanState::Cancelled => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanState::Running,
            2 => ScanState::Draining,
            3 => ScanState::Flushing,
            4 => ScanState::Done,
            5 => ScanState::Cancelled,
            _ => ScanState::Idle,
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a recoverable error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorScope {
    FileScan,
    DirList,
    DirEntry,
    ArchiveOpen,
    ArchiveEntry,
    DbFlush,
    Worker,
}

impl ErrorScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorScope::FileScan => "file_scan",
            ErrorScope::DirList => "dir_list",
            ErrorScope::DirEntry => "dir_entry",
            ErrorScope::ArchiveOpen => "archive_open",
            ErrorScope::ArchiveEntry => "archive_entry",
            ErrorScope::DbFlush => "db_flush",
            ErrorScope::Worker => "worker",
        }
    }
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live counters handed to [`ScanObserver::on_progress`] by the ticker.
/// `files_discovered` keeps growing while the walker runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanProgress {
    pub state: ScanState,
    pub directories: usize,
    pub files_discovered: usize,
    pub files_processed: usize,
    pub elapsed: Duration,
}

/// Sink for scan events.
///
/// Every hook is called unconditionally by the engine, from whichever thread
/// produced the event. All methods have default no-op implementations.
pub trait ScanObserver: Send + Sync {
    fn on_scan_start(&self, _root: &str) {}
    fn on_file_scanned(&self) {}
    fn on_dir_scanned(&self) {}
    fn on_archive_scanned(&self, _kind: ArchiveKind) {}
    fn on_archive_entry(&self, _kind: ArchiveKind) {}
    fn on_error(&self, _scope: ErrorScope) {}
    fn on_batch_flushed(&self, _duration_secs: f64, _batch_size: usize) {}
    fn on_progress(&self, _progress: &ScanProgress) {}
    fn on_state_change(&self, _state: ScanState) {}
    fn on_scan_complete(&self, _summary: &ScanSummary) {}
}

/// No-op observer for silent operation.
pub struct SilentObserver;

impl ScanObserver for SilentObserver {}

/// In-process metrics sink built on atomics.
#[derive(Default)]
pub struct CountingObserver {
    files_scanned: AtomicUsize,
    dirs_scanned: AtomicUsize,
    archive_entries: AtomicUsize,
    batches_flushed: AtomicUsize,
    items_flushed: AtomicUsize,
    flush_micros: AtomicU64,
    archives: DashMap<ArchiveKind, usize>,
    errors: DashMap<ErrorScope, usize>,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files_scanned(&self) -> usize {
        self.files_scanned.load(Ordering::Relaxed)
    }

    pub fn dirs_scanned(&self) -> usize {
        self.dirs_scanned.load(Ordering::Relaxed)
    }

    pub fn archive_entries(&self) -> usize {
        self.archive_entries.load(Ordering::Relaxed)
    }

    pub fn batches_flushed(&self) -> usize {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    pub fn items_flushed(&self) -> usize {
        self.items_flushed.load(Ordering::Relaxed)
    }

    pub fn flush_time(&self) -> Duration {
        Duration::from_micros(self.flush_micros.load(Ordering::Relaxed))
    }

    pub fn archives(&self, kind: ArchiveKind) -> usize {
        self.archives.get(&kind).map(|count| *count).unwrap_or(0)
    }

    pub fn errors(&self, scope: ErrorScope) -> usize {
        self.errors.get(&scope).map(|count| *count).unwrap_or(0)
    }

    pub fn total_errors(&self) -> usize {
        self.errors.iter().map(|entry| *entry.value()).sum()
    }
}

impl ScanObserver for CountingObserver {
    fn on_file_scanned(&self) {
        self.files_scanned.fetch_add(1, Ordering::Relaxed);
    }

    fn on_dir_scanned(&self) {
        self.dirs_scanned.fetch_add(1, Ordering::Relaxed);
    }

    fn on_archive_scanned(&self, kind: ArchiveKind) {
        *self.archives.entry(kind).or_insert(0) += 1;
    }

    fn on_archive_entry(&self, _kind: ArchiveKind) {
        self.archive_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn on_error(&self, scope: ErrorScope) {
        *self.errors.entry(scope).or_insert(0) += 1;
    }

    fn on_batch_flushed(&self, duration_secs: f64, batch_size: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.items_flushed.fetch_add(batch_size, Ordering::Relaxed);
        self.flush_micros
            .fetch_add((duration_secs * 1_000_000.0) as u64, Ordering::Relaxed);
    }
}
