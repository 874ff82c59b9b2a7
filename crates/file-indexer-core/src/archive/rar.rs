use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use unrar::Archive;

use super::{
    dos_to_naive, ArchiveEntry, ArchiveError, ArchiveOptions, EntryScanSummary, EntryTally,
};

/// RAR container read through libunrar. The unrar cursor is consumed by
/// every header step, so any error ends the walk.
pub struct RarScanner {
    path: PathBuf,
    options: ArchiveOptions,
}

impl RarScanner {
    pub fn open(path: &Path, options: &ArchiveOptions) -> Result<Self, ArchiveError> {
        // Listing validates the main header without decompressing anything.
        Archive::new(path)
            .open_for_listing()
            .map_err(|err| ArchiveError::Rar(err.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            options: options.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scan_entries(
        self,
        visit: &mut dyn FnMut(ArchiveEntry) -> ControlFlow<()>,
    ) -> EntryScanSummary {
        let mut tally = EntryTally::new(&self.path, &self.options);

        let mut cursor = match Archive::new(&self.path).open_for_processing() {
            Ok(cursor) => cursor,
            Err(err) => {
                tally.fatal("<header>", &err);
                return tally.finish();
            }
        };

        loop {
            let header = match cursor.read_header() {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    tally.fatal("<header>", &err);
                    break;
                }
            };

            let info = header.entry();
            let name = info.filename.to_string_lossy().replace('\\', "/");
            let size = info.unpacked_size;
            let modified = dos_to_naive(info.file_time);
            let wanted = info.is_file() && !tally.oversized(&name, size);

            cursor = if wanted {
                match header.read() {
                    Ok((data, next)) => {
                        let entry = ArchiveEntry {
                            name,
                            size,
                            modified,
                            data,
                        };
                        if tally.deliver(entry, visit).is_break() {
                            break;
                        }
                        next
                    }
                    Err(err) => {
                        tally.fatal(&name, &err);
                        break;
                    }
                }
            } else {
                match header.skip() {
                    Ok(next) => next,
                    Err(err) => {
                        tally.fatal(&name, &err);
                        break;
                    }
                }
            };
        }

        tally.finish()
    }
}
