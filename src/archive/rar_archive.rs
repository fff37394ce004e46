use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use unrar::Archive;

use super::{ArchiveEntry, ArchiveReader, ExtractError, WrittenCallback, copy_to_rest};

pub struct RarReader {
    path: PathBuf,
}

impl RarReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

fn rar_error(err: impl Display) -> ExtractError {
    ExtractError::Archive(err.to_string())
}

fn entry_name(filename: &Path) -> String {
    filename.to_string_lossy().replace('\\', "/")
}

impl ArchiveReader for RarReader {
    fn format_name(&self) -> &'static str {
        "RAR"
    }

    fn entries(&self) -> Result<Vec<ArchiveEntry>, String> {
        let listing = Archive::new(&self.path)
            .open_for_listing()
            .map_err(|e| format!("failed to open rar: {e}"))?;
        let mut entries = Vec::new();
        for header in listing {
            let header = header.map_err(|e| format!("failed to read rar entry: {e}"))?;
            if header.is_directory() {
                continue;
            }
            entries.push(ArchiveEntry {
                path: entry_name(&header.filename),
                size: header.unpacked_size,
            });
        }
        Ok(entries)
    }

    fn extract(
        &self,
        wanted: &BTreeMap<String, Vec<PathBuf>>,
        on_written: &mut WrittenCallback<'_>,
    ) -> Result<(), ExtractError> {
        let mut archive = Archive::new(&self.path)
            .open_for_processing()
            .map_err(rar_error)?;

        while let Some(header) = archive.read_header().map_err(rar_error)? {
            let entry = header.entry();
            let dests = if entry.is_file() {
                wanted
                    .get(&entry_name(&entry.filename))
                    .and_then(|dests| dests.split_first())
            } else {
                None
            };
            archive = match dests {
                Some((first, rest)) => {
                    if let Some(parent) = first.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let next = header.extract_to(first).map_err(rar_error)?;
                    on_written(first)?;
                    copy_to_rest(first, rest)?;
                    for dest in rest {
                        on_written(dest)?;
                    }
                    next
                }
                None => header.skip().map_err(rar_error)?,
            };
        }
        Ok(())
    }
}
