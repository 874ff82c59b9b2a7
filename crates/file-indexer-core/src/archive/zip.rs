use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use ::zip::{DateTime, ZipArchive};
use chrono::{NaiveDate, NaiveDateTime};
use encoding_rs::{BIG5, GB18030, GBK, UTF_8};
use tracing::{debug, warn};

use super::{ArchiveEntry, ArchiveError, ArchiveOptions, EntryScanSummary, EntryTally};

/// Repairs a ZIP entry name written without the UTF-8 flag.
///
/// `decoded` is the reader's interpretation (UTF-8 when flagged, cp437
/// otherwise); `raw` holds the stored bytes, which is what re-encoding the
/// cp437 text would give back. When the two already agree the name is kept,
/// otherwise GBK, GB18030, UTF-8 and Big5 are tried in that order.
pub fn decode_entry_name(raw: &[u8], decoded: &str) -> String {
    if std::str::from_utf8(raw).is_ok_and(|utf8| utf8 == decoded) {
        return decoded.to_string();
    }
    for encoding in [GBK, GB18030, UTF_8, BIG5] {
        if let Some(name) = encoding.decode_without_bom_handling_and_without_replacement(raw) {
            debug!("Decoded ZIP entry name as {}: {}", encoding.name(), name);
            return name.into_owned();
        }
    }
    warn!("Could not repair ZIP entry name, keeping {:?}", decoded);
    decoded.to_string()
}

pub struct ZipScanner {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
    options: ArchiveOptions,
}

impl ZipScanner {
    pub fn open(path: &Path, options: &ArchiveOptions) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(BufReader::new(file))?;
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            options: options.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scan_entries(
        mut self,
        visit: &mut dyn FnMut(ArchiveEntry) -> ControlFlow<()>,
    ) -> EntryScanSummary {
        let mut tally = EntryTally::new(&self.path, &self.options);

        for index in 0..self.archive.len() {
            let mut file = match self.archive.by_index(index) {
                Ok(file) => file,
                Err(err) => {
                    if tally.failure(&format!("#{}", index), &err).is_break() {
                        break;
                    }
                    continue;
                }
            };
            if file.is_dir() {
                continue;
            }

            let name = decode_entry_name(file.name_raw(), file.name());
            let size = file.size();
            if tally.oversized(&name, size) {
                continue;
            }
            let modified = file
                .last_modified()
                .and_then(zip_time_to_naive)
                .unwrap_or_default();

            let mut data = Vec::with_capacity(size as usize);
            let read = file.read_to_end(&mut data);
            drop(file);
            if let Err(err) = read {
                if tally.failure(&name, &err).is_break() {
                    break;
                }
                continue;
            }

            let entry = ArchiveEntry {
                name,
                size,
                modified,
                data,
            };
            if tally.deliver(entry, visit).is_break() {
                break;
            }
        }

        tally.finish()
    }
}

fn zip_time_to_naive(dt: DateTime) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?.and_hms_opt(
        dt.hour() as u32,
        dt.minute() as u32,
        dt.second() as u32,
    )
}
