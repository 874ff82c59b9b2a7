use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use tracing::trace;
use xz2::read::XzDecoder;

use super::{
    unix_to_naive, ArchiveEntry, ArchiveError, ArchiveOptions, EntryScanSummary, EntryTally,
};

const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5A, 0x68];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    fn from_magic_bytes(bytes: &[u8]) -> Self {
        if bytes.starts_with(&BZIP2_MAGIC) {
            Compression::Bzip2
        } else if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if bytes.starts_with(&XZ_MAGIC) {
            Compression::Xz
        } else {
            Compression::None
        }
    }
}

/// TAR stream, transparently decompressed based on its leading bytes.
pub struct TarScanner {
    path: PathBuf,
    reader: Box<dyn Read>,
    options: ArchiveOptions,
}

impl TarScanner {
    pub fn open(path: &Path, options: &ArchiveOptions) -> Result<Self, ArchiveError> {
        let mut reader = BufReader::with_capacity(64 * 1024, File::open(path)?);
        let compression = Compression::from_magic_bytes(reader.fill_buf()?);
        trace!("{} compression: {:?}", path.display(), compression);
        let reader: Box<dyn Read> = match compression {
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Compression::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
            Compression::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
            Compression::None => Box::new(reader),
        };
        Ok(Self {
            path: path.to_path_buf(),
            reader,
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
        let mut archive = ::tar::Archive::new(self.reader);

        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(err) => {
                let _ = tally.failure("<header>", &err);
                return tally.finish();
            }
        };

        for (index, entry) in entries.enumerate() {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if tally.failure(&format!("#{}", index), &err).is_break() {
                        break;
                    }
                    continue;
                }
            };
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = raw_name.strip_prefix("./").unwrap_or(&raw_name).to_string();
            let size = entry.size();
            if tally.oversized(&name, size) {
                continue;
            }
            let modified = entry
                .header()
                .mtime()
                .map(|secs| unix_to_naive(secs as i64))
                .unwrap_or_default();

            let mut data = Vec::with_capacity(size as usize);
            if let Err(err) = entry.read_to_end(&mut data) {
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
