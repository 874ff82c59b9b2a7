use std::fs;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{NaiveDateTime, Utc};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver};
use tracing::{debug, error, info, trace, warn};

use crate::archive::{self, ArchiveEntry, ArchiveKind, ArchiveOptions, ArchiveScanner};
use crate::batch::{BatchWriter, DEFAULT_BATCH_SIZE};
use crate::detector::{Change, ChangeDetector, ObservedFile};
use crate::error::{Error, Result};
use crate::hasher;
use crate::progress::{ErrorScope, ScanObserver, ScanProgress, ScanState, SilentObserver};
use crate::scanner::{DirectoryWalker, FileTask, SkipRules, WalkCounters};
use crate::storage::models::{BatchItem, NewFileMeta, Operation};
use crate::storage::Database;

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub machine_name: String,
    /// File-processing threads.
    pub workers: usize,
    /// Directory-traversal threads.
    pub walker_threads: usize,
    pub batch_size: usize,
    /// `None` disables directory skipping entirely.
    pub skip_rules: Option<SkipRules>,
    pub archives: ArchiveOptions,
    pub progress_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            machine_name: "localhost".to_string(),
            workers: num_cpus::get(),
            walker_threads: num_cpus::get(),
            batch_size: DEFAULT_BATCH_SIZE,
            skip_rules: None,
            archives: ArchiveOptions::default(),
            progress_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub root: PathBuf,
    pub state: ScanState,
    pub duration: Duration,
    pub directories: usize,
    pub files_discovered: usize,
    pub added: usize,
    pub modified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub archives_scanned: usize,
    pub archive_entries: usize,
    pub batches_flushed: usize,
    pub failed_flushes: usize,
    /// Paths lost to failed batch flushes; a rescan will pick them up as ADD.
    pub failed_paths: Vec<String>,
}

impl ScanSummary {
    pub fn files_processed(&self) -> usize {
        self.added + self.modified + self.skipped + self.failed
    }
}

#[derive(Debug, Default)]
struct ScanCounters {
    added: AtomicUsize,
    modified: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    archives: AtomicUsize,
    archive_entries: AtomicUsize,
}

impl ScanCounters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn processed(&self) -> usize {
        Self::get(&self.added)
            + Self::get(&self.modified)
            + Self::get(&self.skipped)
            + Self::get(&self.failed)
    }
}

/// Scan orchestrator: one directory-walker pool and one file-worker pool
/// running at the same time, joined by unbounded queues, feeding a shared
/// batch writer.
///
/// Lifecycle: Idle → Running → Draining → Flushing → Done, or Cancelled
/// once the [`CancelToken`] is set. Cancellation lets in-flight directories
/// and files finish, then performs a best-effort final flush.
pub struct Scanner {
    db: Arc<Database>,
    options: ScanOptions,
    skip_rules: Option<Arc<SkipRules>>,
    observer: Arc<dyn ScanObserver>,
    cancel: CancelToken,
    state: AtomicU8,
}

impl Scanner {
    pub fn new(db: Arc<Database>, options: ScanOptions) -> Self {
        let skip_rules = options.skip_rules.clone().map(Arc::new);
        Self {
            db,
            options,
            skip_rules,
            observer: Arc::new(SilentObserver),
            cancel: CancelToken::new(),
            state: AtomicU8::new(ScanState::Idle.to_u8()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ScanObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ScanState) {
        let previous = ScanState::from_u8(self.state.swap(state.to_u8(), Ordering::SeqCst));
        if previous != state {
            debug!("Scan state {} -> {}", previous, state);
            self.observer.on_state_change(state);
        }
    }

    /// Scans one root (directory or single file) into the store.
    ///
    /// Fails up front if the root does not exist or the token is already
    /// cancelled. Every later failure is counted, logged and reported through
    /// the observer; the scan still runs to a terminal state.
    pub fn scan(&self, root: &Path) -> Result<ScanSummary> {
        if !root.exists() {
            return Err(Error::RootNotFound(root.to_path_buf()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let root = std::path::absolute(root)?;
        let start = Instant::now();

        let walker = DirectoryWalker::new(
            self.options.walker_threads,
            self.skip_rules.clone(),
            Arc::clone(&self.observer),
            self.cancel.clone(),
        )?;
        let walk_counters = walker.counters();
        let pipeline = Pipeline {
            options: &self.options,
            detector: ChangeDetector::new(Arc::clone(&self.db), self.options.machine_name.clone()),
            writer: BatchWriter::new(
                Arc::clone(&self.db),
                self.options.batch_size,
                Arc::clone(&self.observer),
            ),
            counters: ScanCounters::default(),
            observer: self.observer.as_ref(),
            cancel: &self.cancel,
        };
        let worker_count = self.options.workers.max(1);

        self.set_state(ScanState::Running);
        self.observer.on_scan_start(&root.to_string_lossy());
        info!(
            "Scanning {} as '{}' with {} workers",
            root.display(),
            self.options.machine_name,
            worker_count
        );

        let (file_tx, file_rx) = unbounded::<FileTask>();
        let (done_tx, done_rx) = bounded::<()>(1);

        let outcome = thread::scope(|s| {
            // Owned by the closure so that a panic below drops both senders:
            // workers then see a disconnected queue and the ticker stops.
            let file_tx = file_tx;
            let done_tx = done_tx;

            let ticker = match thread::Builder::new()
                .name("scan-ticker".to_string())
                .spawn_scoped(s, || {
                    self.run_ticker(&done_rx, &walk_counters, &pipeline.counters, start)
                }) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!("Progress ticker unavailable: {}", err);
                    None
                }
            };

            let mut workers = Vec::with_capacity(worker_count);
            let mut spawn_error = None;
            for i in 0..worker_count {
                let files = file_rx.clone();
                let pipeline = &pipeline;
                match thread::Builder::new()
                    .name(format!("file-worker-{}", i))
                    .spawn_scoped(s, move || pipeline.run_worker(files))
                {
                    Ok(handle) => workers.push(handle),
                    Err(err) => {
                        spawn_error = Some(err);
                        break;
                    }
                }
            }

            if spawn_error.is_none() {
                let stats = walker.walk(&root, &file_tx);
                info!(
                    "Walker finished: {} directories, {} files discovered",
                    stats.directories, stats.files
                );
            }

            if self.cancel.is_cancelled() {
                self.set_state(ScanState::Cancelled);
            } else {
                self.set_state(ScanState::Draining);
            }
            for _ in 0..workers.len() {
                let _ = file_tx.send(FileTask::Shutdown);
            }
            for handle in workers {
                if handle.join().is_err() {
                    error!("File worker terminated abnormally");
                }
            }

            let _ = done_tx.send(());
            if let Some(handle) = ticker {
                let _ = handle.join();
            }

            match spawn_error {
                Some(err) => Err(Error::Io(err)),
                None => Ok(()),
            }
        });

        if !self.cancel.is_cancelled() {
            self.set_state(ScanState::Flushing);
        }
        if let Err(err) = pipeline.writer.flush() {
            error!("Final flush failed: {}", err);
        }
        self.set_state(if self.cancel.is_cancelled() {
            ScanState::Cancelled
        } else {
            ScanState::Done
        });
        outcome?;

        self.observer
            .on_progress(&self.progress(&walk_counters, &pipeline.counters, start));

        let counters = &pipeline.counters;
        let summary = ScanSummary {
            root,
            state: self.state(),
            duration: start.elapsed(),
            directories: walk_counters.directories(),
            files_discovered: walk_counters.files(),
            added: ScanCounters::get(&counters.added),
            modified: ScanCounters::get(&counters.modified),
            skipped: ScanCounters::get(&counters.skipped),
            failed: ScanCounters::get(&counters.failed),
            archives_scanned: ScanCounters::get(&counters.archives),
            archive_entries: ScanCounters::get(&counters.archive_entries),
            batches_flushed: pipeline.writer.batches_flushed(),
            failed_flushes: pipeline.writer.failed_flushes(),
            failed_paths: pipeline.writer.failed_paths(),
        };

        for path in &summary.failed_paths {
            error!("Not indexed (failed flush): {}", path);
        }
        info!(
            "Scan of {} {} in {:.2}s: {} added, {} modified, {} skipped, {} failed",
            summary.root.display(),
            summary.state,
            summary.duration.as_secs_f64(),
            summary.added,
            summary.modified,
            summary.skipped,
            summary.failed
        );
        self.observer.on_scan_complete(&summary);
        Ok(summary)
    }

    fn progress(&self, walk: &WalkCounters, counters: &ScanCounters, start: Instant) -> ScanProgress {
        ScanProgress {
            state: self.state(),
            directories: walk.directories(),
            files_discovered: walk.files(),
            files_processed: counters.processed(),
            elapsed: start.elapsed(),
        }
    }

    fn run_ticker(
        &self,
        done: &Receiver<()>,
        walk: &WalkCounters,
        counters: &ScanCounters,
        start: Instant,
    ) {
        let ticks = tick(self.options.progress_interval.max(Duration::from_millis(10)));
        loop {
            select! {
                recv(ticks) -> _ => self.observer.on_progress(&self.progress(walk, counters, start)),
                recv(done) -> _ => break,
            }
        }
    }
}

/// Per-scan state shared by all file workers.
struct Pipeline<'a> {
    options: &'a ScanOptions,
    detector: ChangeDetector,
    writer: BatchWriter,
    counters: ScanCounters,
    observer: &'a dyn ScanObserver,
    cancel: &'a CancelToken,
}

impl Pipeline<'_> {
    fn run_worker(&self, files: Receiver<FileTask>) {
        // Checked after every receive: a worker that was blocked when the
        // token fired must not start on whatever arrives next.
        while let Ok(FileTask::Scan(path)) = files.recv() {
            if self.cancel.is_cancelled() {
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.process_file(&path))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("Failed to scan file {}: {}", path.display(), err);
                    ScanCounters::bump(&self.counters.failed);
                    self.observer.on_error(ErrorScope::FileScan);
                }
                Err(_) => {
                    error!("Worker panicked while scanning {}", path.display());
                    ScanCounters::bump(&self.counters.failed);
                    self.observer.on_error(ErrorScope::Worker);
                }
            }
        }
    }

    fn process_file(&self, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path)?;
        let observed = ObservedFile::from_metadata(&metadata);
        let path_str = path.to_string_lossy().into_owned();

        let operation = match self.detector.detect(&path_str, &observed)? {
            Change::Skip => {
                trace!("Skipping: {}", path_str);
                ScanCounters::bump(&self.counters.skipped);
                self.observer.on_file_scanned();
                return Ok(());
            }
            Change::Add => Operation::Add,
            Change::Modify => Operation::Mod,
        };

        trace!("Hashing: {}", path_str);
        let hash = hasher::hash_file(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_str.clone());
        self.submit(BatchItem {
            meta: NewFileMeta {
                name,
                path: path_str,
                machine: self.detector.machine().to_string(),
                created: observed.created,
                modified: observed.modified,
                scanned: Utc::now().naive_utc(),
                is_archived: false,
                archive_path: None,
            },
            hash: Some(hash),
            operation,
        });
        self.count_operation(operation);
        self.observer.on_file_scanned();

        let archives = &self.options.archives;
        if archives.enabled {
            if let Some(kind) = ArchiveKind::from_path(path) {
                if metadata.len() > archives.max_archive_size {
                    warn!(
                        "Skipping large archive: {} ({} bytes)",
                        path.display(),
                        metadata.len()
                    );
                } else {
                    self.scan_archive(path, kind);
                }
            }
        }
        Ok(())
    }

    fn scan_archive(&self, path: &Path, kind: ArchiveKind) {
        let scanner = match ArchiveScanner::open(path, &self.options.archives) {
            Ok(scanner) => scanner,
            Err(err) => {
                warn!("Cannot open archive {}: {}", path.display(), err);
                self.observer.on_error(ErrorScope::ArchiveOpen);
                return;
            }
        };
        debug!("Scanning {} archive: {}", kind, path.display());

        let container = path.to_string_lossy().into_owned();
        let scanned = Utc::now().naive_utc();
        // A member name may repeat inside one archive; the last occurrence
        // decides the row, matching what extraction would leave on disk.
        let mut staged: Vec<Option<BatchItem>> = Vec::new();
        let mut slots: AHashMap<String, usize> = AHashMap::new();
        let summary = scanner.scan_entries(&mut |entry| {
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            let name = entry.name.clone();
            match self.prepare_entry(path, &container, entry, scanned) {
                Ok((virtual_path, item)) => match slots.get(&virtual_path) {
                    Some(&slot) => {
                        debug!("Duplicate member {} in {}, keeping the last", name, container);
                        staged[slot] = item;
                    }
                    None => {
                        slots.insert(virtual_path, staged.len());
                        staged.push(item);
                    }
                },
                Err(err) => {
                    warn!("Failed to index {} in {}: {}", name, container, err);
                    self.observer.on_error(ErrorScope::ArchiveEntry);
                }
            }
            ControlFlow::Continue(())
        });

        for item in staged.into_iter().flatten() {
            self.submit(item);
            ScanCounters::bump(&self.counters.archive_entries);
            self.observer.on_archive_entry(kind);
        }
        for _ in 0..summary.failures {
            self.observer.on_error(ErrorScope::ArchiveEntry);
        }
        ScanCounters::bump(&self.counters.archives);
        self.observer.on_archive_scanned(kind);
        debug!(
            "Archive {} done: {} entries, {} oversized, {} failures{}",
            container,
            summary.entries,
            summary.skipped_large,
            summary.failures,
            if summary.abandoned { ", abandoned" } else { "" }
        );
    }

    /// Returns the entry's virtual path and, unless the store already holds
    /// it unchanged, the row to write.
    fn prepare_entry(
        &self,
        container_path: &Path,
        container: &str,
        entry: ArchiveEntry,
        scanned: NaiveDateTime,
    ) -> Result<(String, Option<BatchItem>)> {
        let path = archive::virtual_path(container_path, &entry.name);
        let observed = ObservedFile {
            size: entry.size as i64,
            created: entry.modified,
            modified: entry.modified,
        };
        let operation = match self.detector.detect(&path, &observed)? {
            Change::Skip => {
                trace!("Skipping: {}", path);
                return Ok((path, None));
            }
            Change::Add => Operation::Add,
            Change::Modify => Operation::Mod,
        };

        let hash = hasher::hash_bytes(&entry.data);
        let item = BatchItem {
            meta: NewFileMeta {
                name: entry.file_name().to_string(),
                path: path.clone(),
                machine: self.detector.machine().to_string(),
                created: entry.modified,
                modified: entry.modified,
                scanned,
                is_archived: true,
                archive_path: Some(container.to_string()),
            },
            hash: Some(hash),
            operation,
        };
        Ok((path, Some(item)))
    }

    /// Batch failures are recorded by the writer; the file itself was scanned.
    fn submit(&self, item: BatchItem) {
        if let Err(err) = self.writer.add(item) {
            warn!("Batch write failed: {}", err);
        }
    }

    fn count_operation(&self, operation: Operation) {
        match operation {
            Operation::Add => ScanCounters::bump(&self.counters.added),
            Operation::Mod => ScanCounters::bump(&self.counters.modified),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn missing_root_fails_before_any_work() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let scanner = Scanner::new(db.clone(), ScanOptions::default());
        let err = scanner
            .scan(Path::new("/definitely/not/here/indexer-root"))
            .unwrap_err();
        assert!(matches!(err, Error::RootNotFound(_)));
        assert_eq!(scanner.state(), ScanState::Idle);
        assert_eq!(db.count_files().unwrap(), 0);
    }

    #[test]
    fn pre_cancelled_scan_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let scanner = Scanner::new(db, ScanOptions::default());
        scanner.cancel_token().cancel();
        assert!(matches!(scanner.scan(dir.path()), Err(Error::Cancelled)));
    }

    #[test]
    fn idle_worker_ignores_files_queued_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("late.txt");
        fs::write(&file, "arrived after cancel").unwrap();

        let db = Arc::new(Database::open_in_memory().unwrap());
        let options = ScanOptions::default();
        let observer = Arc::new(crate::CountingObserver::new());
        let cancel = CancelToken::new();
        let pipeline = Pipeline {
            options: &options,
            detector: ChangeDetector::new(Arc::clone(&db), "m"),
            writer: BatchWriter::new(Arc::clone(&db), 1, observer.clone()),
            counters: ScanCounters::default(),
            observer: observer.as_ref(),
            cancel: &cancel,
        };

        let (tx, rx) = unbounded::<FileTask>();
        thread::scope(|s| {
            let worker = s.spawn(|| pipeline.run_worker(rx));
            // Let the worker block on the empty queue first.
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
            tx.send(FileTask::Scan(file.clone())).unwrap();
            let _ = tx.send(FileTask::Shutdown);
            worker.join().unwrap();
        });

        assert_eq!(pipeline.counters.processed(), 0);
        assert_eq!(observer.files_scanned(), 0);
        pipeline.writer.flush().unwrap();
        assert_eq!(db.count_files().unwrap(), 0);
    }
}
