use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use dashmap::DashSet;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, trace, warn};

use super::SkipRules;
use crate::archive::VIRTUAL_PATH_SEPARATOR;
use crate::engine::CancelToken;
use crate::error::Result;
use crate::progress::{ErrorScope, ScanObserver};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Work item on the file queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTask {
    Scan(PathBuf),
    /// One per worker, sent once the walk is over.
    Shutdown,
}

/// Live walker counters, readable while the walk is in progress.
#[derive(Debug, Default)]
pub struct WalkCounters {
    directories: AtomicUsize,
    files: AtomicUsize,
    errors: AtomicUsize,
}

impl WalkCounters {
    pub fn directories(&self) -> usize {
        self.directories.load(Ordering::Relaxed)
    }

    pub fn files(&self) -> usize {
        self.files.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> WalkStats {
        WalkStats {
            directories: self.directories(),
            files: self.files(),
            errors: self.errors(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub directories: usize,
    pub files: usize,
    pub errors: usize,
}

/// Clears a directory's in-flight marker even if visiting it unwinds, so the
/// dispatch loop can still observe an empty set and stop.
struct PendingGuard<'a> {
    pending: &'a DashSet<PathBuf>,
    dir: &'a Path,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.dir);
    }
}

/// Breadth-first traversal on a dedicated rayon pool.
///
/// Directories travel through an unbounded queue; each dequeued directory is
/// listed by one pool task, which pushes files onto the caller's file queue
/// and sub-directories back onto the directory queue. The walk is over when
/// no task is in flight and the directory queue is empty, checked in that order.
pub struct DirectoryWalker {
    pool: ThreadPool,
    rules: Option<Arc<SkipRules>>,
    observer: Arc<dyn ScanObserver>,
    cancel: CancelToken,
    counters: Arc<WalkCounters>,
}

impl DirectoryWalker {
    pub fn new(
        threads: usize,
        rules: Option<Arc<SkipRules>>,
        observer: Arc<dyn ScanObserver>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("dir-walker-{}", i))
            .build()?;
        Ok(Self {
            pool,
            rules,
            observer,
            cancel,
            counters: Arc::new(WalkCounters::default()),
        })
    }

    pub fn counters(&self) -> Arc<WalkCounters> {
        Arc::clone(&self.counters)
    }

    /// Walks `root`, sending every regular file to `files`. A file root is
    /// sent as-is. Returns once traversal is finished or cancelled; tasks
    /// already running are allowed to complete.
    pub fn walk(&self, root: &Path, files: &Sender<FileTask>) -> WalkStats {
        if root.is_file() {
            self.emit_file(root.to_path_buf(), files);
            return self.counters.snapshot();
        }

        let (dir_tx, dir_rx) = unbounded::<PathBuf>();
        let pending: DashSet<PathBuf> = DashSet::new();
        if dir_tx.send(root.to_path_buf()).is_err() {
            return self.counters.snapshot();
        }

        self.pool.in_place_scope(|scope| loop {
            if self.cancel.is_cancelled() {
                info!("Walk cancelled, waiting for in-flight directories");
                break;
            }
            match dir_rx.recv_timeout(POLL_INTERVAL) {
                Ok(dir) => {
                    pending.insert(dir.clone());
                    let dir_tx = dir_tx.clone();
                    let pending = &pending;
                    scope.spawn(move |_| {
                        let _pending = PendingGuard { pending, dir: &dir };
                        self.visit(&dir, &dir_tx, files);
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    if pending.is_empty() && dir_rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        let stats = self.counters.snapshot();
        debug!(
            "Walk of {} finished: {} directories, {} files, {} errors",
            root.display(),
            stats.directories,
            stats.files,
            stats.errors
        );
        stats
    }

    fn visit(&self, dir: &Path, dir_tx: &Sender<PathBuf>, files: &Sender<FileTask>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Error reading directory {}: {}", dir.display(), err);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.observer.on_error(ErrorScope::DirList);
                return;
            }
        };
        self.counters.directories.fetch_add(1, Ordering::Relaxed);
        self.observer.on_dir_scanned();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Error reading entry in directory {}: {}", dir.display(), err);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.observer.on_error(ErrorScope::DirEntry);
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!("Error getting file type for {}: {}", path.display(), err);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.observer.on_error(ErrorScope::DirEntry);
                    continue;
                }
            };

            if file_type.is_symlink() {
                trace!("Skipping symlink {}", path.display());
                continue;
            }
            if path.to_string_lossy().contains(VIRTUAL_PATH_SEPARATOR) {
                warn!(
                    "Skipping {}: name contains the reserved '{}' separator",
                    path.display(),
                    VIRTUAL_PATH_SEPARATOR
                );
                continue;
            }

            if file_type.is_dir() {
                if self
                    .rules
                    .as_ref()
                    .is_some_and(|rules| rules.should_skip(&path))
                {
                    debug!("Skipping directory {}", path.display());
                    continue;
                }
                // The receiver outlives every task, so a send cannot fail mid-walk.
                let _ = dir_tx.send(path);
            } else if file_type.is_file() {
                self.emit_file(path, files);
            }
        }
    }

    fn emit_file(&self, path: PathBuf, files: &Sender<FileTask>) {
        self.counters.files.fetch_add(1, Ordering::Relaxed);
        if files.send(FileTask::Scan(path)).is_err() {
            warn!("File queue closed, dropping discovered file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentObserver;
    use std::collections::BTreeSet;

    fn collect(walker: &DirectoryWalker, root: &Path) -> BTreeSet<PathBuf> {
        let (tx, rx) = unbounded();
        walker.walk(root, &tx);
        drop(tx);
        rx.iter()
            .filter_map(|task| match task {
                FileTask::Scan(path) => Some(path),
                FileTask::Shutdown => None,
            })
            .collect()
    }

    fn walker(rules: Option<SkipRules>) -> DirectoryWalker {
        DirectoryWalker::new(
            4,
            rules.map(Arc::new),
            Arc::new(SilentObserver),
            CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn walks_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("top.txt"), "1").unwrap();
        fs::write(root.join("a/one.txt"), "2").unwrap();
        fs::write(root.join("a/b/c/deep.txt"), "3").unwrap();

        let walker = walker(None);
        let files = collect(&walker, root);
        assert_eq!(files.len(), 3);
        assert!(files.contains(&root.join("a/b/c/deep.txt")));
        assert_eq!(walker.counters().directories(), 4);
    }

    #[test]
    fn skipped_directories_are_not_visited() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(root.join(".cache/blob"), "x").unwrap();
        fs::write(root.join("src/main.rs"), "x").unwrap();

        let files = collect(&walker(Some(SkipRules::parse("node_modules"))), root);
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec![root.join("src/main.rs")]);
    }

    #[test]
    fn file_root_is_emitted_directly() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("single.bin");
        fs::write(&file, "x").unwrap();
        let files = collect(&walker(None), &file);
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec![file]);
    }

    #[test]
    fn cancelled_walk_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        let walker = walker(None);
        walker.cancel.cancel();
        assert!(collect(&walker, dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/f.txt"), "x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();
        std::os::unix::fs::symlink(root.join("real/f.txt"), root.join("f-link")).unwrap();

        let files = collect(&walker(None), root);
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec![root.join("real/f.txt")]);
    }
}
