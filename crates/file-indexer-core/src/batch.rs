use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::progress::{ErrorScope, ScanObserver};
use crate::storage::models::{BatchItem, FlushReport};
use crate::storage::Database;

pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Accumulates scan results from many workers and writes them in batches.
///
/// The pending list is guarded by one mutex. A worker that fills the batch
/// takes it out under the lock and writes it after releasing the lock, so
/// other workers keep appending while the transaction runs. Failed batches
/// are not retried; their paths are kept for a follow-up scan.
pub struct BatchWriter {
    db: Arc<Database>,
    batch_size: usize,
    pending: Mutex<Vec<BatchItem>>,
    observer: Arc<dyn ScanObserver>,
    batches_flushed: AtomicUsize,
    failed_flushes: AtomicUsize,
    failed_paths: Mutex<Vec<String>>,
    totals: Mutex<FlushReport>,
}

impl BatchWriter {
    pub fn new(db: Arc<Database>, batch_size: usize, observer: Arc<dyn ScanObserver>) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            db,
            batch_size,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            observer,
            batches_flushed: AtomicUsize::new(0),
            failed_flushes: AtomicUsize::new(0),
            failed_paths: Mutex::new(Vec::new()),
            totals: Mutex::new(FlushReport::default()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queues one item, writing the batch if it is now full.
    pub fn add(&self, item: BatchItem) -> Result<()> {
        let full = {
            let mut pending = self.pending.lock().map_err(|_| Error::LockPoisoned)?;
            pending.push(item);
            if pending.len() >= self.batch_size {
                Some(mem::replace(
                    &mut *pending,
                    Vec::with_capacity(self.batch_size),
                ))
            } else {
                None
            }
        };
        match full {
            Some(batch) => self.write(batch).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Writes whatever is pending, regardless of batch size.
    pub fn flush(&self) -> Result<FlushReport> {
        let batch = {
            let mut pending = self.pending.lock().map_err(|_| Error::LockPoisoned)?;
            mem::take(&mut *pending)
        };
        self.write(batch)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    pub fn batches_flushed(&self) -> usize {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    pub fn failed_flushes(&self) -> usize {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    /// Paths whose batch failed to commit. They are absent from the store.
    pub fn failed_paths(&self) -> Vec<String> {
        self.failed_paths
            .lock()
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }

    /// Sum of every successful flush so far.
    pub fn totals(&self) -> FlushReport {
        self.totals
            .lock()
            .map(|totals| *totals)
            .unwrap_or_default()
    }

    fn write(&self, batch: Vec<BatchItem>) -> Result<FlushReport> {
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let start = Instant::now();
        match self.db.add_files_batch(&batch) {
            Ok(report) => {
                let secs = start.elapsed().as_secs_f64();
                self.batches_flushed.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut totals) = self.totals.lock() {
                    totals.hashes_inserted += report.hashes_inserted;
                    totals.hashes_reused += report.hashes_reused;
                    totals.files_inserted += report.files_inserted;
                    totals.files_updated += report.files_updated;
                }
                debug!("Flushed batch of {} items in {:.3}s", batch.len(), secs);
                self.observer.on_batch_flushed(secs, batch.len());
                Ok(report)
            }
            Err(err) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Batch flush of {} items failed, items not retried: {}",
                    batch.len(),
                    err
                );
                if let Ok(mut paths) = self.failed_paths.lock() {
                    paths.extend(batch.into_iter().map(|item| item.meta.path));
                }
                self.observer.on_error(ErrorScope::DbFlush);
                Err(err)
            }
        }
    }
}
