use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use super::{ArchiveEntry, ArchiveReader, ExtractError, WrittenCallback, copy_to_rest, write_entry};

pub struct ZipReader {
    path: PathBuf,
}

impl ZipReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn open(&self) -> Result<ZipArchive<File>, String> {
        let file = File::open(&self.path).map_err(|e| format!("failed to open archive: {e}"))?;
        ZipArchive::new(file).map_err(|e| format!("failed to read zip: {e}"))
    }
}

impl ArchiveReader for ZipReader {
    fn format_name(&self) -> &'static str {
        "ZIP"
    }

    fn entries(&self) -> Result<Vec<ArchiveEntry>, String> {
        let mut archive = self.open()?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive
                .by_index(i)
                .map_err(|e| format!("failed to read zip entry {i}: {e}"))?;
            if file.is_dir() {
                continue;
            }
            entries.push(ArchiveEntry {
                path: file.name().replace('\\', "/"),
                size: file.size(),
            });
        }
        Ok(entries)
    }

    fn extract(
        &self,
        wanted: &BTreeMap<String, Vec<PathBuf>>,
        on_written: &mut WrittenCallback<'_>,
    ) -> Result<(), ExtractError> {
        let mut archive = self.open().map_err(ExtractError::Archive)?;
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| ExtractError::Archive(format!("failed to read zip entry {i}: {e}")))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().replace('\\', "/");
            let Some((first, rest)) = wanted.get(&name).and_then(|dests| dests.split_first())
            else {
                continue;
            };
            write_entry(&mut file, first)?;
            on_written(first)?;
            copy_to_rest(first, rest)?;
            for dest in rest {
                on_written(dest)?;
            }
        }
        Ok(())
    }
}
