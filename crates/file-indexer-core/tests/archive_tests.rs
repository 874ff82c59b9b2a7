use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::tempdir;
use xz2::write::XzEncoder;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use file_indexer_core::archive::{read_all_entries, ArchiveKind, ArchiveOptions};
use file_indexer_core::hasher::hash_bytes;
use file_indexer_core::progress::ErrorScope;
use file_indexer_core::{CountingObserver, Database, ScanOptions, Scanner};

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default();
    zip.add_directory("dir/", options).unwrap();
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

fn append_entries<W: Write>(builder: &mut tar::Builder<W>, entries: &[(&str, &[u8])]) {
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
}

fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(File::create(path).unwrap());
    append_entries(&mut builder, entries);
    builder.into_inner().unwrap();
}

fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    append_entries(&mut builder, entries);
    builder.into_inner().unwrap()
}

fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_entries(&mut builder, entries);
    builder.into_inner().unwrap().finish().unwrap();
}

fn options() -> ScanOptions {
    ScanOptions {
        machine_name: "m".to_string(),
        workers: 2,
        walker_threads: 2,
        ..ScanOptions::default()
    }
}

#[test]
fn test_zip_entries_are_indexed_with_virtual_paths() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("x.zip");
    write_zip(
        &zip_path,
        &[("a.txt", b"hello".as_slice()), ("dir/c.txt", b"inside".as_slice())],
    );
    fs::write(dir.path().join("plain.txt"), "hello").unwrap();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let observer = Arc::new(CountingObserver::new());
    let summary = Scanner::new(Arc::clone(&db), options())
        .with_observer(observer.clone())
        .scan(dir.path())
        .unwrap();

    // plain.txt, x.zip, and its two file entries; the directory entry is ignored.
    assert_eq!(summary.added, 2);
    assert_eq!(summary.archives_scanned, 1);
    assert_eq!(summary.archive_entries, 2);
    assert_eq!(observer.archives(ArchiveKind::Zip), 1);
    assert_eq!(observer.archive_entries(), 2);
    assert_eq!(db.count_files().unwrap(), 4);

    let container = zip_path.to_string_lossy().into_owned();
    let inner = db
        .get_file_with_hash(&format!("{}::dir/c.txt", container), "m")
        .unwrap()
        .unwrap();
    assert!(inner.meta.is_archived);
    assert_eq!(inner.meta.name, "c.txt");
    assert_eq!(inner.meta.archive_path.as_deref(), Some(container.as_str()));
    assert_eq!(inner.hash.unwrap().size, 6);

    // Archived content deduplicates against plain files.
    let a = db
        .get_file_with_hash(&format!("{}::a.txt", container), "m")
        .unwrap()
        .unwrap();
    let plain = db
        .get_file_with_hash(&dir.path().join("plain.txt").to_string_lossy(), "m")
        .unwrap()
        .unwrap();
    assert_eq!(a.meta.hash_id, plain.meta.hash_id);

    let stats = db.get_statistics().unwrap();
    assert_eq!(stats.archived_files, 2);
}

#[test]
fn test_unchanged_archive_is_not_reopened() {
    let dir = tempdir().unwrap();
    write_zip(&dir.path().join("x.zip"), &[("a.txt", b"hello".as_slice())]);
    let db = Arc::new(Database::open_in_memory().unwrap());

    Scanner::new(Arc::clone(&db), options()).scan(dir.path()).unwrap();
    let second = Scanner::new(Arc::clone(&db), options()).scan(dir.path()).unwrap();

    assert_eq!(second.skipped, 1);
    assert_eq!(second.archives_scanned, 0);
    assert_eq!(db.count_files().unwrap(), 2);
}

#[test]
fn test_tar_and_tar_gz_entries() {
    let dir = tempdir().unwrap();
    write_tar(
        &dir.path().join("plain.tar"),
        &[("one.txt", b"1".as_slice()), ("sub/two.txt", b"22".as_slice())],
    );
    write_tar_gz(&dir.path().join("packed.tgz"), &[("three.txt", b"333".as_slice())]);

    let db = Arc::new(Database::open_in_memory().unwrap());
    let summary = Scanner::new(Arc::clone(&db), options()).scan(dir.path()).unwrap();

    assert_eq!(summary.archives_scanned, 2);
    assert_eq!(summary.archive_entries, 3);

    let tar_entry = format!(
        "{}::sub/two.txt",
        dir.path().join("plain.tar").to_string_lossy()
    );
    let row = db.get_file_with_hash(&tar_entry, "m").unwrap().unwrap();
    assert!(row.meta.is_archived);
    assert_eq!(row.meta.name, "two.txt");
    assert_eq!(
        row.meta.modified.map(|ts| ts.and_utc().timestamp()),
        Some(1_700_000_000)
    );

    let gz_entry = format!(
        "{}::three.txt",
        dir.path().join("packed.tgz").to_string_lossy()
    );
    assert!(db.get_file_with_hash(&gz_entry, "m").unwrap().is_some());
}

#[test]
fn test_tar_bz2_and_tar_xz_entries() {
    let dir = tempdir().unwrap();
    let raw = tar_bytes(&[("bz/one.txt", b"bzip payload".as_slice())]);
    let mut bz = BzEncoder::new(
        File::create(dir.path().join("a.tar.bz2")).unwrap(),
        bzip2::Compression::default(),
    );
    bz.write_all(&raw).unwrap();
    bz.finish().unwrap();

    let raw = tar_bytes(&[
        ("xz/two.txt", b"xz payload".as_slice()),
        ("xz/three.txt", b"more xz".as_slice()),
    ]);
    let mut xz = XzEncoder::new(File::create(dir.path().join("b.txz")).unwrap(), 6);
    xz.write_all(&raw).unwrap();
    xz.finish().unwrap();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let observer = Arc::new(CountingObserver::new());
    let summary = Scanner::new(Arc::clone(&db), options())
        .with_observer(observer.clone())
        .scan(dir.path())
        .unwrap();

    assert_eq!(summary.archives_scanned, 2);
    assert_eq!(summary.archive_entries, 3);
    assert_eq!(observer.archives(ArchiveKind::Tar), 2);
    assert_eq!(observer.total_errors(), 0);

    let bz_entry = format!(
        "{}::bz/one.txt",
        dir.path().join("a.tar.bz2").to_string_lossy()
    );
    let row = db.get_file_with_hash(&bz_entry, "m").unwrap().unwrap();
    assert_eq!(row.hash.unwrap().size, "bzip payload".len() as i64);

    let xz_container = dir.path().join("b.txz").to_string_lossy().into_owned();
    let xz_entry = format!("{}::xz/three.txt", xz_container);
    let row = db.get_file_with_hash(&xz_entry, "m").unwrap().unwrap();
    assert_eq!(row.meta.name, "three.txt");
    assert_eq!(row.meta.archive_path.as_deref(), Some(xz_container.as_str()));
}

#[test]
fn test_repeated_member_name_keeps_last_occurrence() {
    let dir = tempdir().unwrap();
    let tar_path = dir.path().join("dupes.tar");
    write_tar(
        &tar_path,
        &[
            ("same.txt", b"old".as_slice()),
            ("other.txt", b"x".as_slice()),
            ("same.txt", b"newer content".as_slice()),
        ],
    );

    let db = Arc::new(Database::open_in_memory().unwrap());
    let summary = Scanner::new(Arc::clone(&db), options()).scan(dir.path()).unwrap();

    assert_eq!(summary.archive_entries, 2);
    // The container plus one row per distinct member.
    assert_eq!(db.count_files().unwrap(), 3);
    let entry = format!("{}::same.txt", tar_path.to_string_lossy());
    let row = db.get_file_with_hash(&entry, "m").unwrap().unwrap();
    assert_eq!(
        row.hash.unwrap().signature(),
        hash_bytes(b"newer content").signature
    );

    // A rescan sees the archive unchanged and leaves the single row alone.
    let again = Scanner::new(Arc::clone(&db), options()).scan(dir.path()).unwrap();
    assert_eq!(again.skipped, 1);
    assert_eq!(db.count_files().unwrap(), 3);
}

#[test]
fn test_entry_failures_abandon_container_but_not_the_scan() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("damaged.zip");
    {
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("good.txt", stored).unwrap();
        zip.write_all(b"intact").unwrap();
        for i in 1..=4 {
            zip.start_file(format!("bad{}.bin", i), stored).unwrap();
            zip.write_all(format!("CORRUPT entry {}", i).as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    // Stored data sits verbatim in the file; flipping it breaks every CRC
    // except the intact entry's.
    let mut bytes = fs::read(&zip_path).unwrap();
    let marker = b"CORRUPT";
    let mut flipped = 0;
    for start in 0..bytes.len() - marker.len() {
        if &bytes[start..start + marker.len()] == marker {
            bytes[start..start + marker.len()].copy_from_slice(b"GARBLED");
            flipped += 1;
        }
    }
    assert_eq!(flipped, 4);
    fs::write(&zip_path, bytes).unwrap();
    fs::write(dir.path().join("sibling.txt"), "still here").unwrap();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let observer = Arc::new(CountingObserver::new());
    let summary = Scanner::new(
        Arc::clone(&db),
        ScanOptions {
            archives: ArchiveOptions {
                fail_threshold: 2,
                ..ArchiveOptions::default()
            },
            ..options()
        },
    )
    .with_observer(observer.clone())
    .scan(dir.path())
    .unwrap();

    assert_eq!(observer.errors(ErrorScope::ArchiveEntry), 2);
    assert_eq!(summary.archives_scanned, 1);
    assert_eq!(summary.archive_entries, 1);
    assert_eq!(summary.added, 2);
    assert_eq!(summary.failed, 0);

    let container = zip_path.to_string_lossy().into_owned();
    assert!(db
        .get_file_with_hash(&format!("{}::good.txt", container), "m")
        .unwrap()
        .is_some());
    assert!(db
        .get_file_with_hash(&format!("{}::bad3.bin", container), "m")
        .unwrap()
        .is_none());
    assert!(db
        .get_file_with_hash(&dir.path().join("sibling.txt").to_string_lossy(), "m")
        .unwrap()
        .is_some());
    assert_eq!(db.count_files().unwrap(), 3);
}

#[test]
fn test_oversized_entries_are_skipped() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("big.zip");
    write_zip(
        &zip_path,
        &[("small.txt", b"ok".as_slice()), ("large.bin", [7u8; 64].as_slice())],
    );

    let archive_options = ArchiveOptions {
        max_entry_size: 16,
        ..ArchiveOptions::default()
    };
    let (entries, summary) = read_all_entries(&zip_path, &archive_options).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "small.txt");
    assert_eq!(summary.skipped_large, 1);

    let db = Arc::new(Database::open_in_memory().unwrap());
    let scan = Scanner::new(
        Arc::clone(&db),
        ScanOptions {
            archives: archive_options,
            ..options()
        },
    )
    .scan(dir.path())
    .unwrap();
    assert_eq!(scan.archive_entries, 1);
    assert_eq!(db.count_files().unwrap(), 2);
}

#[test]
fn test_oversized_archive_is_not_opened() {
    let dir = tempdir().unwrap();
    write_zip(&dir.path().join("x.zip"), &[("a.txt", b"hello".as_slice())]);

    let db = Arc::new(Database::open_in_memory().unwrap());
    let summary = Scanner::new(
        Arc::clone(&db),
        ScanOptions {
            archives: ArchiveOptions {
                max_archive_size: 10,
                ..ArchiveOptions::default()
            },
            ..options()
        },
    )
    .scan(dir.path())
    .unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.archives_scanned, 0);
}

#[test]
fn test_corrupt_archive_is_indexed_as_plain_file() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("broken.zip"), "definitely not a zip").unwrap();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let observer = Arc::new(CountingObserver::new());
    let summary = Scanner::new(Arc::clone(&db), options())
        .with_observer(observer.clone())
        .scan(dir.path())
        .unwrap();

    assert_eq!(summary.added, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.archives_scanned, 0);
    assert_eq!(observer.errors(ErrorScope::ArchiveOpen), 1);
    assert_eq!(db.count_files().unwrap(), 1);
}

#[test]
fn test_archive_scanning_can_be_disabled() {
    let dir = tempdir().unwrap();
    write_zip(&dir.path().join("x.zip"), &[("a.txt", b"hello".as_slice())]);

    let db = Arc::new(Database::open_in_memory().unwrap());
    let summary = Scanner::new(
        Arc::clone(&db),
        ScanOptions {
            archives: ArchiveOptions {
                enabled: false,
                ..ArchiveOptions::default()
            },
            ..options()
        },
    )
    .scan(dir.path())
    .unwrap();

    assert_eq!(summary.added, 1);
    assert_eq!(summary.archive_entries, 0);
    assert_eq!(db.get_statistics().unwrap().archived_files, 0);
}
