//! Folding other index databases into the target store.
//!
//! Source rows go through the same batched write path as a scan, so content
//! deduplication holds across merged and scanned rows alike. A row whose
//! `(path, machine)` already exists with the same content signature is
//! skipped; one with different content replaces the stored row in place.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use chrono::{NaiveDateTime, Utc};
use rusqlite::Row;
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::models::{
    BatchItem, ContentSignature, FileHash, NewFileHash, NewFileMeta, Operation,
};
use crate::storage::{parse_timestamp, Database};

pub const MERGE_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub total_files_processed: usize,
    pub files_added: usize,
    pub files_skipped: usize,
    pub hashes_added: usize,
    pub hashes_reused: usize,
}

impl MergeStats {
    fn absorb(&mut self, other: &MergeStats) {
        self.total_files_processed += other.total_files_processed;
        self.files_added += other.files_added;
        self.files_skipped += other.files_skipped;
        self.hashes_added += other.hashes_added;
        self.hashes_reused += other.hashes_reused;
    }
}

/// Merges every source into `target`. Missing sources are logged and skipped;
/// any other failure stops the merge with the error.
pub fn merge_databases(sources: &[PathBuf], target: &Database) -> Result<MergeStats> {
    let mut total = MergeStats::default();
    for source in sources {
        if !source.is_file() {
            warn!("Source database not found: {}", source.display());
            continue;
        }
        info!("Merging {}", source.display());
        let stats = merge_database(source, target)?;
        info!(
            "Merged {}: {} processed, {} written, {} skipped",
            source.display(),
            stats.total_files_processed,
            stats.files_added,
            stats.files_skipped
        );
        total.absorb(&stats);
    }
    Ok(total)
}

pub fn merge_database(source: &Path, target: &Database) -> Result<MergeStats> {
    let source_db = Database::open_read_only(source)?;
    let archive_columns = if source_db.has_column("file_meta", "is_archived")?
        && source_db.has_column("file_meta", "archive_path")?
    {
        "m.is_archived, m.archive_path"
    } else {
        "0, NULL"
    };
    let sql = format!(
        "SELECT m.name, m.path, m.machine, m.created, m.modified, m.scanned, {}, \
                h.id, h.size, h.md5, h.sha1, h.sha256 \
         FROM file_meta m LEFT JOIN file_hash h ON h.id = m.hash_id \
         ORDER BY m.id",
        archive_columns
    );

    let mut batch = MergeBatch::default();
    source_db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            batch.stats.total_files_processed += 1;
            let (meta, hash) = source_row(row)?;

            let existing = target.get_file_with_hash(&meta.path, &meta.machine)?;
            let operation = match existing {
                Some(existing) if adds_no_content(existing.hash.as_ref(), hash.as_ref()) => {
                    batch.stats.files_skipped += 1;
                    continue;
                }
                Some(_) => Operation::Mod,
                None => Operation::Add,
            };
            if hash.is_none() {
                warn!("File without hash: {}", meta.path);
            }
            batch.push(BatchItem {
                meta,
                hash,
                operation,
            });
            if batch.items.len() >= MERGE_BATCH_SIZE {
                batch.flush(target)?;
            }
        }
        Ok(())
    })?;
    batch.flush(target)?;
    Ok(batch.stats)
}

#[derive(Default)]
struct MergeBatch {
    items: Vec<BatchItem>,
    /// `(path, machine)` → index in `items`, so a later source row replaces
    /// an earlier one instead of writing two rows for one identity.
    index: AHashMap<(String, String), usize>,
    stats: MergeStats,
}

impl MergeBatch {
    fn push(&mut self, item: BatchItem) {
        let key = (item.meta.path.clone(), item.meta.machine.clone());
        match self.index.get(&key) {
            Some(&slot) => {
                let operation = self.items[slot].operation;
                self.items[slot] = BatchItem { operation, ..item };
                self.stats.files_skipped += 1;
            }
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
            }
        }
    }

    fn flush(&mut self, target: &Database) -> Result<()> {
        if self.items.is_empty() {
            return Ok(());
        }
        let with_hash = self.items.iter().filter(|item| item.hash.is_some()).count();
        let report = target.add_files_batch(&self.items)?;
        self.stats.hashes_added += report.hashes_inserted;
        self.stats.hashes_reused += with_hash.saturating_sub(report.hashes_inserted);
        self.stats.files_added += self.items.len();
        self.items.clear();
        self.index.clear();
        Ok(())
    }
}

/// True when merging the incoming row would not change what the target knows
/// about the file's content. A hashless row never replaces a hashed one.
fn adds_no_content(existing: Option<&FileHash>, incoming: Option<&NewFileHash>) -> bool {
    match (existing, incoming) {
        (Some(existing), Some(incoming)) => existing.signature() == incoming.signature,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Maps one source row. Missing timestamps fall back to the nearest known one.
fn source_row(row: &Row<'_>) -> rusqlite::Result<(NewFileMeta, Option<NewFileHash>)> {
    let created = parse_timestamp(row.get_ref(3)?);
    let modified = parse_timestamp(row.get_ref(4)?);
    let scanned = parse_timestamp(row.get_ref(5)?);
    let fallback: NaiveDateTime = modified
        .or(created)
        .or(scanned)
        .unwrap_or_else(|| Utc::now().naive_utc());

    let meta = NewFileMeta {
        name: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
        path: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        machine: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        created: created.unwrap_or(fallback),
        modified: modified.unwrap_or(fallback),
        scanned: scanned.unwrap_or(fallback),
        is_archived: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
        archive_path: row.get(7)?,
    };

    let hash = match row.get::<_, Option<i64>>(8)? {
        Some(_) => Some(NewFileHash {
            size: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
            signature: ContentSignature {
                md5: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                sha1: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
                sha256: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            },
        }),
        None => None,
    };
    Ok((meta, hash))
}
