//! Client archive handling.
//!
//! A [`ClientArchive`] is any supported archive that contains the client
//! executable. Only files below the executable's directory are extracted (to
//! `Client/`), plus the `versions/` tree next to `trunk.txt` when the archive
//! ships one.

mod rar_archive;
mod zip_archive;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::{debug, warn};
use thiserror::Error;

use crate::env::CLIENT_EXECUTABLE;
use crate::error::IoHint;
use crate::util::{ProgressThrottle, REPORTED_PROGRESS_BUFFER, cancel_requested};

pub use rar_archive::RarReader;
pub use zip_archive::ZipReader;

const VERSIONS_MARKER: &str = "trunk.txt";

/// A file stored in an archive, with `/` separated path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Archive(String),
}

impl ExtractError {
    /// Tag reported next to a failed extraction.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Cancelled => "Cancelled",
            Self::Io(err) => IoHint::classify(err).tag(),
            Self::Archive(_) => "ExceptionWhileExtracting",
        }
    }
}

/// Called after every written file. Returning an error stops the extraction.
pub type WrittenCallback<'a> = dyn FnMut(&Path) -> Result<(), ExtractError> + 'a;

/// One archive format.
pub trait ArchiveReader: Send + Sync {
    fn format_name(&self) -> &'static str;

    /// List the file entries. Directory entries are left out.
    fn entries(&self) -> Result<Vec<ArchiveEntry>, String>;

    /// Write every entry found in `wanted` to its destination paths.
    fn extract(
        &self,
        wanted: &BTreeMap<String, Vec<PathBuf>>,
        on_written: &mut WrittenCallback<'_>,
    ) -> Result<(), ExtractError>;
}

pub struct ClientArchive {
    source: PathBuf,
    reader: Box<dyn ArchiveReader>,
    /// Archive path of every file, keyed by its destination below the target.
    plan: BTreeMap<String, String>,
    reported_progress_buffer: f32,
}

impl ClientArchive {
    /// Open `path` with the first format that can read it and contains the client.
    pub fn open(path: &Path) -> Option<Self> {
        let readers: [Box<dyn ArchiveReader>; 2] = [
            Box::new(RarReader::new(path)),
            Box::new(ZipReader::new(path)),
        ];
        for reader in readers {
            let entries = match reader.entries() {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        "archive: {} is not a {} file: {err}",
                        path.display(),
                        reader.format_name()
                    );
                    continue;
                }
            };
            let Some(plan) = build_plan(&entries) else {
                debug!(
                    "archive: {} does not contain {CLIENT_EXECUTABLE}",
                    path.display()
                );
                continue;
            };
            return Some(Self {
                source: path.to_path_buf(),
                reader,
                plan,
                reported_progress_buffer: REPORTED_PROGRESS_BUFFER,
            });
        }
        None
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn format_name(&self) -> &'static str {
        self.reader.format_name()
    }

    pub fn contains_client(&self) -> bool {
        self.plan
            .keys()
            .any(|dest| dest.eq_ignore_ascii_case(&format!("Client/{CLIENT_EXECUTABLE}")))
    }

    pub fn with_progress_buffer(mut self, buffer: f32) -> Self {
        self.reported_progress_buffer = buffer;
        self
    }

    /// Number of files that will be written.
    pub fn file_count(&self) -> usize {
        self.plan.len()
    }

    /// Extract the client below `target`, overwriting existing files.
    ///
    /// `progress` receives `completed / total` after each file, throttled to
    /// the progress buffer, and always sees `0` and `1`.
    pub fn extract_to(
        &self,
        target: &Path,
        cancel: Option<Arc<AtomicBool>>,
        mut progress: impl FnMut(f32),
    ) -> Result<(), ExtractError> {
        let mut wanted: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for (dest, entry_path) in &self.plan {
            wanted
                .entry(entry_path.clone())
                .or_default()
                .push(target.join(dest));
        }

        let total = self.plan.len().max(1) as f32;
        let mut completed = 0usize;
        let mut throttle = ProgressThrottle::new(self.reported_progress_buffer);
        if throttle.should_report(0.0) {
            progress(0.0);
        }

        let mut on_written = |path: &Path| {
            debug!("archive: extracted {}", path.display());
            completed += 1;
            let fraction = (completed as f32 / total).min(1.0);
            if throttle.should_report(fraction) {
                progress(fraction);
            }
            if cancel_requested(&cancel) {
                return Err(ExtractError::Cancelled);
            }
            Ok(())
        };
        self.reader.extract(&wanted, &mut on_written)?;

        // The last written file reports exactly 1.
        if completed < self.plan.len() {
            return Err(ExtractError::Archive(format!(
                "only {completed} of {} files were extracted",
                self.plan.len()
            )));
        }
        Ok(())
    }

    /// Check that every non-empty client file exists below `target`.
    ///
    /// The archive is scanned again; an unreadable archive fails verification.
    pub fn verify(&self, target: &Path) -> bool {
        let entries = match self.reader.entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("archive: failed to re-read {}: {err}", self.source.display());
                return false;
            }
        };
        let Some(plan) = build_plan(&entries) else {
            warn!("archive: {} no longer contains the client", self.source.display());
            return false;
        };
        let sizes: BTreeMap<&str, u64> = entries
            .iter()
            .map(|entry| (entry.path.as_str(), entry.size))
            .collect();

        for (dest, entry_path) in &plan {
            if sizes.get(entry_path.as_str()).copied().unwrap_or(0) == 0 {
                continue;
            }
            let path = target.join(dest);
            if !path.is_file() {
                warn!("archive: {} was not verified correctly", path.display());
                return false;
            }
        }
        true
    }
}

/// Map destination paths (`Client/...`, `versions/...`) to archive entries.
///
/// Returns `None` when the client executable is missing.
fn build_plan(entries: &[ArchiveEntry]) -> Option<BTreeMap<String, String>> {
    let client = find_by_file_name(entries, CLIENT_EXECUTABLE)?;
    let mut plan = BTreeMap::new();
    add_subtree(&mut plan, entries, parent_of(&client.path), "Client");
    if let Some(versions) = find_by_file_name(entries, VERSIONS_MARKER) {
        add_subtree(&mut plan, entries, parent_of(&versions.path), "versions");
    }
    Some(plan)
}

fn find_by_file_name<'a>(entries: &'a [ArchiveEntry], name: &str) -> Option<&'a ArchiveEntry> {
    entries.iter().find(|entry| {
        entry
            .path
            .rsplit('/')
            .next()
            .is_some_and(|file| file.eq_ignore_ascii_case(name))
    })
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn add_subtree(
    plan: &mut BTreeMap<String, String>,
    entries: &[ArchiveEntry],
    parent: &str,
    dest_root: &str,
) {
    for entry in entries {
        let Some(relative) = strip_prefix_ignore_case(&entry.path, parent) else {
            continue;
        };
        if relative.is_empty() || !is_safe_relative(relative) {
            warn!("archive: skipping unsafe entry {}", entry.path);
            continue;
        }
        plan.insert(format!("{dest_root}/{relative}"), entry.path.clone());
    }
}

fn strip_prefix_ignore_case<'a>(path: &'a str, parent: &str) -> Option<&'a str> {
    if parent.is_empty() {
        return Some(path);
    }
    let head = path.get(..parent.len())?;
    if !head.eq_ignore_ascii_case(parent) {
        return None;
    }
    path[parent.len()..].strip_prefix('/')
}

pub(crate) fn is_safe_relative(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Create the parent directories of `path` and copy `reader` into it.
pub(crate) fn write_entry(reader: &mut impl io::Read, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    io::copy(reader, &mut file)?;
    Ok(())
}

/// Copy an already written file to its remaining destinations.
pub(crate) fn copy_to_rest(first: &Path, rest: &[PathBuf]) -> io::Result<()> {
    for dest in rest {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(first, dest)?;
    }
    Ok(())
}
