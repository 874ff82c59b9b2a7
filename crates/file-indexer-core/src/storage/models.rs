use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;

/// What a scan decided to do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Mod,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Mod => "MOD",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(Operation::Add),
            "MOD" => Ok(Operation::Mod),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// The `(md5, sha1, sha256)` triple identifying a file's byte content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentSignature {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

/// A stored content row. Append-only: one row per distinct signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    pub id: i64,
    pub size: i64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

impl FileHash {
    pub fn signature(&self) -> ContentSignature {
        ContentSignature {
            md5: self.md5.clone(),
            sha1: self.sha1.clone(),
            sha256: self.sha256.clone(),
        }
    }
}

/// A stored file row. `(path, machine)` is the logical identity.
///
/// Timestamps and `operation` are optional because rows written by older
/// tools may leave them empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub id: i64,
    pub hash_id: Option<i64>,
    pub name: String,
    pub path: String,
    pub machine: String,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub scanned: Option<NaiveDateTime>,
    pub operation: Option<String>,
    pub is_archived: bool,
    pub archive_path: Option<String>,
}

/// A file row joined with the hash row it references, if that row exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWithHash {
    pub meta: FileMeta,
    pub hash: Option<FileHash>,
}

/// Hash draft produced by the hasher, not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileHash {
    pub size: i64,
    pub signature: ContentSignature,
}

/// File row draft produced by a worker, not yet assigned an id or hash id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileMeta {
    pub name: String,
    pub path: String,
    pub machine: String,
    pub created: NaiveDateTime,
    pub modified: NaiveDateTime,
    pub scanned: NaiveDateTime,
    pub is_archived: bool,
    pub archive_path: Option<String>,
}

/// One pending scan result: the drafts plus the operation decided for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub meta: NewFileMeta,
    pub hash: Option<NewFileHash>,
    pub operation: Operation,
}

/// Outcome of one transactional batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub hashes_inserted: usize,
    pub hashes_reused: usize,
    pub files_inserted: usize,
    pub files_updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_files: i64,
    pub total_size: i64,
    pub total_hashes: i64,
    pub archived_files: i64,
    pub duplicate_files: i64,
    pub machine_stats: BTreeMap<String, i64>,
}

/// Content shared by more than one file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub hash: FileHash,
    pub files: Vec<FileMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateFilter {
    pub machine: Option<String>,
    pub min_size: i64,
    /// 1-based.
    pub page: i64,
    pub per_page: i64,
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self {
            machine: None,
            min_size: 0,
            page: 1,
            per_page: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicatePage {
    pub groups: Vec<DuplicateGroup>,
    pub total_groups: i64,
    pub page: i64,
    pub per_page: i64,
}

impl DuplicatePage {
    pub fn pages(&self) -> i64 {
        if self.per_page <= 0 {
            return 0;
        }
        (self.total_groups + self.per_page - 1) / self.per_page
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Name,
    Path,
    /// Matches any of md5, sha1 or sha256.
    Hash,
}
