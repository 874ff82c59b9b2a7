use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tempfile::tempdir;

use file_indexer_core::batch::BatchWriter;
use file_indexer_core::hasher::hash_bytes;
use file_indexer_core::progress::ErrorScope;
use file_indexer_core::storage::models::{BatchItem, NewFileMeta, Operation};
use file_indexer_core::{CountingObserver, Database, SilentObserver};

fn item(path: String, content: &[u8]) -> BatchItem {
    let now = Utc::now().naive_utc();
    BatchItem {
        meta: NewFileMeta {
            name: path.rsplit('/').next().unwrap().to_string(),
            path,
            machine: "batch-host".into(),
            created: now,
            modified: now,
            scanned: now,
            is_archived: false,
            archive_path: None,
        },
        hash: Some(hash_bytes(content)),
        operation: Operation::Add,
    }
}

#[test]
fn test_concurrent_writers_lose_nothing() {
    const THREADS: usize = 6;
    const PER_THREAD: usize = 137;

    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("batch.db")).unwrap());
    let observer = Arc::new(CountingObserver::new());
    let writer = BatchWriter::new(Arc::clone(&db), 25, observer.clone());

    thread::scope(|s| {
        for t in 0..THREADS {
            let writer = &writer;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let content = format!("thread {} file {}", t, i);
                    writer
                        .add(item(format!("/w{}/{}.txt", t, i), content.as_bytes()))
                        .unwrap();
                }
            });
        }
    });
    writer.flush().unwrap();

    let total = THREADS * PER_THREAD;
    assert_eq!(db.count_files().unwrap() as usize, total);
    assert_eq!(db.count_hashes().unwrap() as usize, total);
    assert_eq!(observer.items_flushed(), total);
    assert_eq!(writer.totals().files_inserted, total);
    assert_eq!(writer.failed_flushes(), 0);
    assert_eq!(writer.pending_len(), 0);
}

#[test]
fn test_shared_content_across_threads_is_stored_once() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let writer = BatchWriter::new(Arc::clone(&db), 10, Arc::new(SilentObserver));

    thread::scope(|s| {
        for t in 0..4 {
            let writer = &writer;
            s.spawn(move || {
                for i in 0..50 {
                    writer
                        .add(item(format!("/copy{}/{}.bin", t, i), b"identical bytes"))
                        .unwrap();
                }
            });
        }
    });
    writer.flush().unwrap();

    assert_eq!(db.count_files().unwrap(), 200);
    assert_eq!(db.count_hashes().unwrap(), 1);
    let totals = writer.totals();
    assert_eq!(totals.hashes_inserted, 1);
    assert_eq!(totals.hashes_reused, writer.batches_flushed() - 1);
}

#[test]
fn test_separate_handles_on_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let first = Arc::new(Database::open(&path).unwrap());
    let second = Arc::new(Database::open(&path).unwrap());

    thread::scope(|s| {
        for (n, db) in [&first, &second].into_iter().enumerate() {
            s.spawn(move || {
                let writer = BatchWriter::new(Arc::clone(db), 16, Arc::new(SilentObserver));
                for i in 0..300 {
                    let content = format!("{}", i % 120);
                    writer
                        .add(item(format!("/h{}/{}", n, i), content.as_bytes()))
                        .unwrap();
                }
                writer.flush().unwrap();
            });
        }
    });

    assert_eq!(first.count_files().unwrap(), 600);
    assert_eq!(first.count_hashes().unwrap(), 120);
}

#[test]
fn test_failed_flush_keeps_paths() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.db");
    let db = Arc::new(Database::open(&path).unwrap());
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("DROP TABLE file_meta;")
        .unwrap();

    let observer = Arc::new(CountingObserver::new());
    let writer = BatchWriter::new(Arc::clone(&db), 2, observer.clone());
    writer.add(item("/lost/a".into(), b"a")).unwrap();
    assert!(writer.add(item("/lost/b".into(), b"b")).is_err());

    assert_eq!(writer.failed_flushes(), 1);
    assert_eq!(writer.failed_paths(), vec!["/lost/a".to_string(), "/lost/b".to_string()]);
    assert_eq!(observer.errors(ErrorScope::DbFlush), 1);
    assert_eq!(writer.batches_flushed(), 0);
    // Hash rows written before the failure roll back with the batch.
    assert_eq!(db.count_hashes().unwrap(), 0);
}
