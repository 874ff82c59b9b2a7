use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use tracing::debug;

use super::models::*;
use super::sqlite::{format_timestamp, parse_timestamp, Database};
use crate::error::Result;

/// Signatures per bulk lookup. Three bound parameters each keeps a chunk
/// well under SQLite's parameter limit.
const SIGNATURE_CHUNK: usize = 300;

const FILE_WITH_HASH_COLUMNS: &str = "m.id, m.hash_id, m.name, m.path, m.machine, m.created, \
     m.modified, m.scanned, m.operation, m.is_archived, m.archive_path, \
     h.id, h.size, h.md5, h.sha1, h.sha256";

impl Database {
    // ── Lookups ──────────────────────────────────────────────────

    /// Newest row for `path` on any machine.
    pub fn get_file_with_hash_by_path(&self, path: &str) -> Result<Option<FileWithHash>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM file_meta m LEFT JOIN file_hash h ON h.id = m.hash_id \
                 WHERE m.path = ?1 ORDER BY m.id DESC LIMIT 1",
                FILE_WITH_HASH_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query_map(params![path], file_with_hash_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Newest row for the logical identity `(path, machine)`.
    pub fn get_file_with_hash(&self, path: &str, machine: &str) -> Result<Option<FileWithHash>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM file_meta m LEFT JOIN file_hash h ON h.id = m.hash_id \
                 WHERE m.path = ?1 AND m.machine = ?2 ORDER BY m.id DESC LIMIT 1",
                FILE_WITH_HASH_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query_map(params![path, machine], file_with_hash_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Resolves content signatures to existing hash ids in as few round trips
    /// as the parameter limit allows. Missing signatures are absent from the map.
    pub fn get_existing_hashes_batch(
        &self,
        signatures: &[ContentSignature],
    ) -> Result<AHashMap<ContentSignature, i64>> {
        self.with_conn(|conn| lookup_hash_ids(conn, signatures))
    }

    // ── Batch write ──────────────────────────────────────────────

    /// Writes a batch in one `BEGIN IMMEDIATE` transaction: bulk hash lookup,
    /// in-batch dedup of new content, hash inserts, then file inserts (ADD)
    /// and in-place updates keyed by `(path, machine)` (MOD). Any error rolls
    /// the whole batch back.
    pub fn add_files_batch(&self, items: &[BatchItem]) -> Result<FlushReport> {
        if items.is_empty() {
            return Ok(FlushReport::default());
        }
        let report = self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let report = write_batch(&tx, items)?;
            tx.commit()?;
            Ok(report)
        })?;
        debug!(
            "Batch of {} written: {} hashes inserted, {} reused, {} files inserted, {} updated",
            items.len(),
            report.hashes_inserted,
            report.hashes_reused,
            report.files_inserted,
            report.files_updated
        );
        Ok(report)
    }

    // ── Reporting ────────────────────────────────────────────────

    pub fn get_statistics(&self) -> Result<Statistics> {
        self.with_conn(|conn| {
            let total_files: i64 =
                conn.query_row("SELECT COUNT(*) FROM file_meta", [], |row| row.get(0))?;
            let total_size: i64 = conn.query_row(
                "SELECT COALESCE(SUM(h.size), 0) FROM file_meta m \
                 JOIN file_hash h ON h.id = m.hash_id",
                [],
                |row| row.get(0),
            )?;
            let total_hashes: i64 =
                conn.query_row("SELECT COUNT(*) FROM file_hash", [], |row| row.get(0))?;
            let archived_files: i64 = conn.query_row(
                "SELECT COUNT(*) FROM file_meta WHERE is_archived = 1",
                [],
                |row| row.get(0),
            )?;
            let duplicate_files: i64 = conn.query_row(
                "SELECT COUNT(*) FROM file_meta WHERE hash_id IN \
                 (SELECT hash_id FROM file_meta WHERE hash_id IS NOT NULL \
                  GROUP BY hash_id HAVING COUNT(*) > 1)",
                [],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT COALESCE(machine, '') AS host, COUNT(*) FROM file_meta GROUP BY host",
            )?;
            let machine_stats = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

            Ok(Statistics {
                total_files,
                total_size,
                total_hashes,
                archived_files,
                duplicate_files,
                machine_stats,
            })
        })
    }

    /// Pages through content shared by more than one file row, largest first.
    pub fn find_duplicate_files(&self, filter: &DuplicateFilter) -> Result<DuplicatePage> {
        let page = filter.page.max(1);
        let per_page = filter.per_page.max(1);
        let offset = (page - 1) * per_page;
        let machine = filter.machine.as_deref();

        self.with_conn(|conn| {
            let group_sql = "FROM file_hash h JOIN file_meta m ON m.hash_id = h.id \
                 WHERE h.size >= ?1 AND (?2 IS NULL OR m.machine = ?2) \
                 GROUP BY h.id HAVING COUNT(m.id) > 1";

            let total_groups: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM (SELECT h.id {})", group_sql),
                params![filter.min_size, machine],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT h.id, h.size, h.md5, h.sha1, h.sha256 {} \
                 ORDER BY h.size DESC, h.id ASC LIMIT ?3 OFFSET ?4",
                group_sql
            ))?;
            let hashes = stmt
                .query_map(
                    params![filter.min_size, machine, per_page, offset],
                    file_hash_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut files_stmt = conn.prepare_cached(
                "SELECT m.id, m.hash_id, m.name, m.path, m.machine, m.created, m.modified, \
                        m.scanned, m.operation, m.is_archived, m.archive_path \
                 FROM file_meta m WHERE m.hash_id = ?1 AND (?2 IS NULL OR m.machine = ?2) \
                 ORDER BY m.path",
            )?;
            let mut groups = Vec::with_capacity(hashes.len());
            for hash in hashes {
                let files = files_stmt
                    .query_map(params![hash.id, machine], |row| file_meta_from_row(row, 0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                groups.push(DuplicateGroup { hash, files });
            }

            Ok(DuplicatePage {
                groups,
                total_groups,
                page,
                per_page,
            })
        })
    }

    /// Substring search on name or path; exact match on any digest for `Hash`.
    pub fn search_files(
        &self,
        query: &str,
        kind: SearchKind,
        limit: i64,
    ) -> Result<Vec<FileWithHash>> {
        let condition = match kind {
            SearchKind::Name => "m.name LIKE '%' || ?1 || '%'",
            SearchKind::Path => "m.path LIKE '%' || ?1 || '%'",
            SearchKind::Hash => "(h.md5 = ?1 OR h.sha1 = ?1 OR h.sha256 = ?1)",
        };
        let query = match kind {
            SearchKind::Hash => query.trim().to_ascii_lowercase(),
            _ => query.to_string(),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM file_meta m LEFT JOIN file_hash h ON h.id = m.hash_id \
                 WHERE {} ORDER BY m.id DESC LIMIT ?2",
                FILE_WITH_HASH_COLUMNS, condition
            ))?;
            let rows = stmt
                .query_map(params![query, limit], file_with_hash_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn count_files(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM file_meta", [], |row| row.get(0))?)
        })
    }

    pub fn count_hashes(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM file_hash", [], |row| row.get(0))?)
        })
    }
}

fn write_batch(conn: &Connection, items: &[BatchItem]) -> Result<FlushReport> {
    let mut report = FlushReport::default();

    let mut seen = AHashSet::new();
    let mut distinct: Vec<&NewFileHash> = Vec::new();
    for hash in items.iter().filter_map(|item| item.hash.as_ref()) {
        if seen.insert(&hash.signature) {
            distinct.push(hash);
        }
    }

    let signatures: Vec<ContentSignature> =
        distinct.iter().map(|hash| hash.signature.clone()).collect();
    let mut hash_ids = lookup_hash_ids(conn, &signatures)?;
    report.hashes_reused = hash_ids.len();

    {
        let mut insert_hash = conn.prepare_cached(
            "INSERT INTO file_hash (size, md5, sha1, sha256) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for hash in distinct {
            if hash_ids.contains_key(&hash.signature) {
                continue;
            }
            insert_hash.execute(params![
                hash.size,
                hash.signature.md5,
                hash.signature.sha1,
                hash.signature.sha256
            ])?;
            hash_ids.insert(hash.signature.clone(), conn.last_insert_rowid());
            report.hashes_inserted += 1;
        }
    }

    let mut insert_meta = conn.prepare_cached(
        "INSERT INTO file_meta \
         (hash_id, name, path, machine, created, modified, scanned, operation, \
          is_archived, archive_path) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    let mut update_meta = conn.prepare_cached(
        "UPDATE file_meta SET hash_id = ?1, name = ?2, created = ?5, modified = ?6, \
         scanned = ?7, operation = ?8, is_archived = ?9, archive_path = ?10 \
         WHERE path = ?3 AND machine = ?4",
    )?;

    // A second ADD for the same identity in one batch overwrites the first.
    let mut written: AHashSet<(&str, &str)> = AHashSet::new();
    for item in items {
        let hash_id = item
            .hash
            .as_ref()
            .and_then(|hash| hash_ids.get(&hash.signature).copied());
        let meta = &item.meta;
        let created = format_timestamp(&meta.created);
        let modified = format_timestamp(&meta.modified);
        let scanned = format_timestamp(&meta.scanned);
        let operation = item.operation.as_str();
        let values = params![
            hash_id,
            meta.name,
            meta.path,
            meta.machine,
            created,
            modified,
            scanned,
            operation,
            meta.is_archived,
            meta.archive_path,
        ];
        match item.operation {
            Operation::Add if written.contains(&(meta.path.as_str(), meta.machine.as_str())) => {
                update_meta.execute(values)?;
                report.files_updated += 1;
            }
            Operation::Add => {
                insert_meta.execute(values)?;
                report.files_inserted += 1;
            }
            Operation::Mod => {
                if update_meta.execute(values)? == 0 {
                    insert_meta.execute(values)?;
                    report.files_inserted += 1;
                } else {
                    report.files_updated += 1;
                }
            }
        }
        written.insert((meta.path.as_str(), meta.machine.as_str()));
    }

    Ok(report)
}

fn lookup_hash_ids(
    conn: &Connection,
    signatures: &[ContentSignature],
) -> Result<AHashMap<ContentSignature, i64>> {
    let mut found = AHashMap::with_capacity(signatures.len());
    for chunk in signatures.chunks(SIGNATURE_CHUNK) {
        let tuples = vec!["(?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT MIN(id), md5, sha1, sha256 FROM file_hash \
             WHERE (md5, sha1, sha256) IN (VALUES {}) \
             GROUP BY md5, sha1, sha256",
            tuples
        );
        let bound = chunk
            .iter()
            .flat_map(|sig| [sig.md5.as_str(), sig.sha1.as_str(), sig.sha256.as_str()]);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), |row| {
            Ok((
                ContentSignature {
                    md5: row.get(1)?,
                    sha1: row.get(2)?,
                    sha256: row.get(3)?,
                },
                row.get::<_, i64>(0)?,
            ))
        })?;
        for row in rows {
            let (signature, id) = row?;
            found.insert(signature, id);
        }
    }
    Ok(found)
}

fn file_hash_from_row(row: &Row<'_>) -> rusqlite::Result<FileHash> {
    Ok(FileHash {
        id: row.get(0)?,
        size: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        md5: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        sha1: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        sha256: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
    })
}

fn file_meta_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<FileMeta> {
    Ok(FileMeta {
        id: row.get(base)?,
        hash_id: row.get(base + 1)?,
        name: row.get::<_, Option<String>>(base + 2)?.unwrap_or_default(),
        path: row.get::<_, Option<String>>(base + 3)?.unwrap_or_default(),
        machine: row.get::<_, Option<String>>(base + 4)?.unwrap_or_default(),
        created: parse_timestamp(row.get_ref(base + 5)?),
        modified: parse_timestamp(row.get_ref(base + 6)?),
        scanned: parse_timestamp(row.get_ref(base + 7)?),
        operation: row.get(base + 8)?,
        is_archived: row.get::<_, Option<i64>>(base + 9)?.unwrap_or(0) != 0,
        archive_path: row.get(base + 10)?,
    })
}

fn file_with_hash_from_row(row: &Row<'_>) -> rusqlite::Result<FileWithHash> {
    let meta = file_meta_from_row(row, 0)?;
    let hash = match row.get::<_, Option<i64>>(11)? {
        Some(id) => Some(FileHash {
            id,
            size: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
            md5: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            sha1: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
            sha256: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(FileWithHash { meta, hash })
}
