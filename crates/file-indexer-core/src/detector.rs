use std::fs::Metadata;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::Result;
use crate::storage::models::FileWithHash;
use crate::storage::Database;

/// The `(size, created, modified)` triple observed on disk or in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedFile {
    pub size: i64,
    pub created: NaiveDateTime,
    pub modified: NaiveDateTime,
}

impl ObservedFile {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let modified = metadata.modified().map(to_naive_utc).unwrap_or_default();
        Self {
            size: metadata.len() as i64,
            created: created_time(metadata).unwrap_or(modified),
            modified,
        }
    }
}

/// Inode change time on Unix, matching what `stat` reports as ctime.
#[cfg(unix)]
fn created_time(metadata: &Metadata) -> Option<NaiveDateTime> {
    use std::os::unix::fs::MetadataExt;
    DateTime::from_timestamp(metadata.ctime(), metadata.ctime_nsec() as u32)
        .map(|dt| dt.naive_utc())
}

#[cfg(not(unix))]
fn created_time(metadata: &Metadata) -> Option<NaiveDateTime> {
    metadata.created().ok().map(to_naive_utc)
}

pub(crate) fn to_naive_utc(time: SystemTime) -> NaiveDateTime {
    DateTime::<Utc>::from(time).naive_utc()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Add,
    Modify,
    Skip,
}

/// Decides the change for one path given its prior store state.
///
/// Size is compared against the linked hash row, so a meta row whose hash
/// reference is dangling can never be skipped.
pub fn classify(observed: &ObservedFile, prior: Option<&FileWithHash>) -> Change {
    let Some(prior) = prior else {
        return Change::Add;
    };
    let size_matches = prior
        .hash
        .as_ref()
        .is_some_and(|hash| hash.size == observed.size);
    if size_matches
        && prior.meta.created == Some(observed.created)
        && prior.meta.modified == Some(observed.modified)
    {
        Change::Skip
    } else {
        Change::Modify
    }
}

pub struct ChangeDetector {
    db: Arc<Database>,
    machine: String,
}

impl ChangeDetector {
    pub fn new(db: Arc<Database>, machine: impl Into<String>) -> Self {
        Self {
            db,
            machine: machine.into(),
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// One joined lookup, then [`classify`].
    pub fn detect(&self, path: &str, observed: &ObservedFile) -> Result<Change> {
        let prior = self.db.get_file_with_hash(path, &self.machine)?;
        Ok(classify(observed, prior.as_ref()))
    }
}
