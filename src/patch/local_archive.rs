use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use serde::Deserialize;
use zip::ZipArchive;
use zip::result::ZipError;

use super::{ClientPatch, PatchContext, PatchState, PatchStatus};
use crate::archive::{is_safe_relative, write_entry};
use crate::boot::LegoDataDictionary;
use crate::engine::models::ServerEntry;
use crate::engine::server_list::ServerList;
use crate::env;
use crate::error::PatchError;
use crate::storage::ArchivePatch;

pub const PATCH_MANIFEST: &str = "patch.json";
const BOOT_CONFIG: &str = "boot.cfg";
const BACKUP_DIR: &str = "originalFiles";

pub const PACKED_CLIENT: &str = "packed-client";
pub const UNPACKED_CLIENT: &str = "unpacked-client";

/// `patch.json` at the root of a patch archive.
#[derive(Debug, Deserialize)]
pub struct PatchManifest {
    pub name: Option<BTreeMap<String, String>>,
    pub description: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub requirements: Option<Vec<String>>,
}

fn invalid(archive: &str, reason: impl Into<String>) -> PatchError {
    PatchError::InvalidArchive {
        archive: archive.to_owned(),
        reason: reason.into(),
    }
}

/// Read the manifest of a patch archive into a settings record.
pub fn read_patch_manifest(path: &Path) -> Result<ArchivePatch, PatchError> {
    let archive_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| invalid(&path.display().to_string(), "no file name"))?;

    let file = File::open(path)?;
    let mut zip = ZipArchive::new(file).map_err(|e| invalid(&archive_name, e.to_string()))?;
    let mut contents = String::new();
    match zip.by_name(PATCH_MANIFEST) {
        Ok(mut entry) => {
            entry
                .read_to_string(&mut contents)
                .map_err(|e| invalid(&archive_name, format!("unreadable {PATCH_MANIFEST}: {e}")))?;
        }
        Err(ZipError::FileNotFound) => {
            return Err(invalid(&archive_name, format!("{PATCH_MANIFEST} not found")));
        }
        Err(err) => return Err(invalid(&archive_name, err.to_string())),
    }

    let manifest: PatchManifest = serde_json::from_str(&contents)
        .map_err(|e| invalid(&archive_name, format!("unreadable {PATCH_MANIFEST}: {e}")))?;
    let (Some(name), Some(description)) = (manifest.name, manifest.description) else {
        return Err(invalid(&archive_name, "name or description missing"));
    };
    Ok(ArchivePatch {
        archive_name,
        name,
        description,
        requirements: manifest.requirements,
        installed: false,
    })
}

/// Check `packed-client` and `unpacked-client` requirements against a client.
pub fn check_requirements(requirements: Option<&[String]>, client_dir: &Path) -> Result<(), PatchError> {
    let Some(requirements) = requirements else {
        return Ok(());
    };
    let packed = client_dir.join("res").join("pack").is_dir();
    let requires = |name: &str| requirements.iter().any(|r| r == name);
    if requires(PACKED_CLIENT) && !packed {
        return Err(PatchError::RequirementNotMet("PackedClientRequired"));
    }
    if requires(UNPACKED_CLIENT) && packed {
        return Err(PatchError::RequirementNotMet("UnpackedClientRequired"));
    }
    Ok(())
}

/// Copy the archive's files into the client, backing up originals once.
///
/// Returns the contents of a bundled `boot.cfg`, which is never copied.
fn install_files(archive: &Path, client_dir: &Path) -> Result<Option<String>, PatchError> {
    let archive_name = archive.display().to_string();
    let mut zip = ZipArchive::new(File::open(archive)?)
        .map_err(|e| invalid(&archive_name, e.to_string()))?;
    let backups = client_dir.join(BACKUP_DIR);
    fs::create_dir_all(&backups)?;

    let mut boot_config = None;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| invalid(&archive_name, e.to_string()))?;
        let name = entry.name().to_owned();
        if entry.is_dir() || name == PATCH_MANIFEST {
            continue;
        }
        if name == BOOT_CONFIG {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            boot_config = Some(text);
            continue;
        }
        if !is_safe_relative(&name) {
            return Err(invalid(&archive_name, format!("unsafe entry path {name}")));
        }

        let target = client_dir.join(&name);
        let backup = backups.join(&name);
        if target.is_file() && !backup.exists() {
            debug!("patch archive: backing up {name}");
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&target, &backup)?;
        }
        debug!("patch archive: replacing {name}");
        write_entry(&mut entry, &target)?;
    }
    Ok(boot_config)
}

/// Restore backed up files, or delete files the archive added.
fn uninstall_files(archive: &Path, client_dir: &Path) -> Result<(), PatchError> {
    let archive_name = archive.display().to_string();
    let mut zip = ZipArchive::new(File::open(archive)?)
        .map_err(|e| invalid(&archive_name, e.to_string()))?;
    let backups = client_dir.join(BACKUP_DIR);

    for index in 0..zip.len() {
        let entry = zip
            .by_index(index)
            .map_err(|e| invalid(&archive_name, e.to_string()))?;
        let name = entry.name();
        if entry.is_dir() || name == PATCH_MANIFEST || name == BOOT_CONFIG || !is_safe_relative(name) {
            continue;
        }
        let target = client_dir.join(name);
        let backup = backups.join(name);
        if !target.is_file() {
            continue;
        }
        if backup.is_file() {
            debug!("patch archive: reverting {name}");
            fs::copy(&backup, &target)?;
        } else {
            debug!("patch archive: deleting {name}");
            fs::remove_file(&target)?;
        }
    }
    Ok(())
}

/// Patch built from a user supplied zip in `PatchArchives/`.
pub struct LocalArchivePatch {
    context: PatchContext,
    server_list: Arc<ServerList>,
    archive_name: String,
    status: PatchStatus,
}

impl LocalArchivePatch {
    pub fn new(context: PatchContext, server_list: Arc<ServerList>, archive_name: &str) -> Self {
        let patch = Self {
            context,
            server_list,
            archive_name: archive_name.to_owned(),
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn archive_path(&self) -> PathBuf {
        archive_path(&self.context, &self.archive_name)
    }

    fn record(&self) -> Option<ArchivePatch> {
        self.context.system_info.read(|s| {
            s.archive_patches
                .iter()
                .find(|patch| patch.archive_name == self.archive_name)
                .cloned()
        })
    }

    fn detect(&self) -> PatchState {
        match self.record() {
            None => PatchState::Incompatible,
            Some(record) if record.installed => PatchState::Installed,
            Some(_) => PatchState::NotInstalled,
        }
    }

    pub fn verify_requirements(&self) -> Result<(), PatchError> {
        let record = self
            .record()
            .ok_or_else(|| PatchError::Incompatible(self.archive_name.clone()))?;
        check_requirements(record.requirements.as_deref(), &self.context.client_dir())
    }

    fn set_installed(&self, installed: bool) -> Result<(), PatchError> {
        self.context.system_info.update(|s| {
            if let Some(record) = s
                .archive_patches
                .iter_mut()
                .find(|patch| patch.archive_name == self.archive_name)
            {
                record.installed = installed;
            }
        });
        self.context.system_info.save().map_err(PatchError::Other)
    }

    fn add_server(&self, boot_config: &str) {
        let entry = boot_config
            .trim()
            .parse::<LegoDataDictionary>()
            .map_err(|e| e.to_string())
            .and_then(|boot| {
                let name = boot.get_str("SERVERNAME").ok_or("SERVERNAME missing")?;
                let address = boot.get_str("AUTHSERVERIP").ok_or("AUTHSERVERIP missing")?;
                Ok(ServerEntry::new(name, address))
            });
        match entry.and_then(|entry| self.server_list.add_entry(entry)) {
            Ok(()) => info!("patch archive {}: added server entry", self.archive_name),
            Err(err) => error!("patch archive {}: failed to add server entry: {err}", self.archive_name),
        }
    }

    /// Forget the archive and delete its copy. The files it installed stay.
    pub async fn remove(&self) -> Result<(), PatchError> {
        self.context
            .system_info
            .update(|s| s.archive_patches.retain(|patch| patch.archive_name != self.archive_name));
        match tokio::fs::remove_file(self.archive_path()).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        self.context.system_info.save().map_err(PatchError::Other)?;
        self.refresh().await
    }
}

pub(crate) fn archive_path(context: &PatchContext, archive_name: &str) -> PathBuf {
    env::patch_archives_dir(&context.system_info.client_parent()).join(archive_name)
}

#[async_trait]
impl ClientPatch for LocalArchivePatch {
    fn id(&self) -> &str {
        &self.archive_name
    }

    fn name(&self) -> String {
        let locale = self.context.system_info.locale();
        self.record()
            .map(|record| record.localized_name(&locale))
            .unwrap_or_else(|| self.archive_name.clone())
    }

    fn description(&self) -> String {
        let locale = self.context.system_info.locale();
        self.record()
            .map(|record| record.localized_description(&locale))
            .unwrap_or_default()
    }

    fn apply_by_default(&self) -> bool {
        false
    }

    fn status(&self) -> &PatchStatus {
        &self.status
    }

    async fn refresh(&self) -> Result<(), PatchError> {
        self.status.set(self.detect());
        Ok(())
    }

    async fn install(&self) -> Result<(), PatchError> {
        self.verify_requirements()?;
        let (archive, client_dir) = (self.archive_path(), self.context.client_dir());
        let boot_config = tokio::task::spawn_blocking(move || install_files(&archive, &client_dir))
            .await
            .map_err(|e| PatchError::Other(format!("patch archive install panicked: {e}")))??;
        if let Some(boot_config) = boot_config {
            self.add_server(&boot_config);
        }
        self.set_installed(true)?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        let (archive, client_dir) = (self.archive_path(), self.context.client_dir());
        tokio::task::spawn_blocking(move || uninstall_files(&archive, &client_dir))
            .await
            .map_err(|e| PatchError::Other(format!("patch archive uninstall panicked: {e}")))??;
        self.set_installed(false)?;
        self.refresh().await
    }

    fn as_archive_patch(&self) -> Option<&LocalArchivePatch> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::patch::tests::context_in;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{"name": {"en_US": "Better Sky"}, "description": {"en_US": "Sky"}}"#;

    struct Fixture {
        _dir: TempDir,
        context: PatchContext,
        servers: Arc<ServerList>,
    }

    fn fixture(files: &[(&str, &str)]) -> (Fixture, LocalArchivePatch) {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        let servers = Arc::new(ServerList::new(context.system_info.clone()));

        let path = archive_path(&context, "sky.zip");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        write_zip(&path, files);
        let record = read_patch_manifest(&path).unwrap();
        context.system_info.update(|s| s.archive_patches.push(record));

        let patch = LocalArchivePatch::new(context.clone(), servers.clone(), "sky.zip");
        (
            Fixture {
                _dir: dir,
                context,
                servers,
            },
            patch,
        )
    }

    #[test]
    fn manifest_requires_name_and_description() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.zip");
        write_zip(&path, &[(PATCH_MANIFEST, r#"{"name": {"en_US": "x"}}"#)]);
        assert!(matches!(
            read_patch_manifest(&path),
            Err(PatchError::InvalidArchive { .. })
        ));

        let path = dir.path().join("empty.zip");
        write_zip(&path, &[("readme.txt", "hi")]);
        assert!(read_patch_manifest(&path).is_err());
    }

    #[test]
    fn checks_client_packing() {
        let dir = TempDir::new().unwrap();
        let packed = vec![PACKED_CLIENT.to_owned()];
        let unpacked = vec![UNPACKED_CLIENT.to_owned()];

        assert!(check_requirements(None, dir.path()).is_ok());
        assert!(check_requirements(Some(packed.as_slice()), dir.path()).is_err());
        assert!(check_requirements(Some(unpacked.as_slice()), dir.path()).is_ok());

        fs::create_dir_all(dir.path().join("res").join("pack")).unwrap();
        assert!(check_requirements(Some(packed.as_slice()), dir.path()).is_ok());
        assert!(matches!(
            check_requirements(Some(unpacked.as_slice()), dir.path()),
            Err(PatchError::RequirementNotMet("UnpackedClientRequired"))
        ));
    }

    #[tokio::test]
    async fn install_backs_up_and_uninstall_restores() {
        let (f, patch) = fixture(&[
            (PATCH_MANIFEST, MANIFEST),
            ("res/", ""),
            ("res/sky.dds", "new sky"),
            ("res/extra.txt", "added"),
            ("boot.cfg", "SERVERNAME=0:Sky Server,\nAUTHSERVERIP=0:sky.example.com"),
        ]);
        let client = f.context.client_dir();
        fs::create_dir_all(client.join("res")).unwrap();
        fs::write(client.join("res/sky.dds"), "old sky").unwrap();
        assert_eq!(patch.state(), PatchState::NotInstalled);
        assert_eq!(patch.name(), "Better Sky");

        patch.install().await.unwrap();
        assert_eq!(patch.state(), PatchState::Installed);
        assert_eq!(fs::read_to_string(client.join("res/sky.dds")).unwrap(), "new sky");
        assert_eq!(
            fs::read_to_string(client.join(BACKUP_DIR).join("res/sky.dds")).unwrap(),
            "old sky"
        );
        assert!(!client.join("boot.cfg").exists());
        assert_eq!(
            f.servers.selected_entry(),
            Some(ServerEntry::new("Sky Server", "sky.example.com"))
        );

        patch.uninstall().await.unwrap();
        assert_eq!(patch.state(), PatchState::NotInstalled);
        assert_eq!(fs::read_to_string(client.join("res/sky.dds")).unwrap(), "old sky");
        assert!(!client.join("res/extra.txt").exists());
    }

    #[tokio::test]
    async fn removed_patch_is_incompatible() {
        let (f, patch) = fixture(&[(PATCH_MANIFEST, MANIFEST)]);
        let path = patch.archive_path();
        assert!(path.exists());

        patch.remove().await.unwrap();
        assert_eq!(patch.state(), PatchState::Incompatible);
        assert!(!path.exists());
        assert!(f.context.system_info.settings().archive_patches.is_empty());
    }
}
