use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use walkdir::WalkDir;
use zip::ZipArchive;

use super::{
    ClientPatch, INSTALLED_VERSION_KEY, PatchContext, PatchState, PatchStatus, RemoteTag,
    move_file, remote_state, remove_dir_if_exists, remove_file_if_exists,
};
use crate::error::PatchError;

pub(crate) const MOD_LOADER_ID: &str = "ModLoader";
const LOADER_DLL: &str = "dinput8.dll";

/// Installs the `dinput8.dll` mod loader and the `mods/` directory it reads.
pub struct ModLoaderPatch {
    context: PatchContext,
    tag: Arc<RemoteTag>,
    status: PatchStatus,
}

impl ModLoaderPatch {
    pub fn new(context: PatchContext, tag: Arc<RemoteTag>) -> Self {
        let patch = Self {
            context,
            tag,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn loader_path(&self) -> PathBuf {
        self.context.client_dir().join(LOADER_DLL)
    }

    fn mods_dir(&self) -> PathBuf {
        self.context.client_dir().join("mods")
    }

    fn detect(&self) -> PatchState {
        remote_state(
            &self.tag,
            self.loader_path().is_file(),
            self.context
                .system_info
                .get_patch_store(MOD_LOADER_ID, INSTALLED_VERSION_KEY),
        )
    }
}

/// Extract a downloaded zip and return the first `dinput8.dll` inside it.
fn unpack_loader(archive: &Path, target: &Path) -> Result<PathBuf, PatchError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| PatchError::Other(format!("failed to open mod loader archive: {e}")))?;
    zip.extract(target)
        .map_err(|e| PatchError::Other(format!("failed to extract mod loader archive: {e}")))?;
    WalkDir::new(target)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == LOADER_DLL)
        .map(|entry| entry.into_path())
        .ok_or_else(|| PatchError::Other(format!("{LOADER_DLL} missing from mod loader archive")))
}

async fn dir_is_empty(path: &Path) -> Result<bool, PatchError> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

#[async_trait]
impl ClientPatch for ModLoaderPatch {
    fn id(&self) -> &str {
        MOD_LOADER_ID
    }

    fn name(&self) -> String {
        "Mod Loader".into()
    }

    fn description(&self) -> String {
        "Allows the installation of client mods.".into()
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
        let tag = self
            .tag
            .latest()
            .ok_or_else(|| PatchError::VersionUnknown(self.tag.repository().to_owned()))?;
        let parent = self.context.system_info.client_parent();
        let download = parent.join("modloader.zip");
        let unpacked = parent.join("modloader");

        info!("patch {}: downloading {tag}", self.id());
        self.context
            .network
            .download_to_path(&self.tag.asset_url(&tag, "mod.zip"), &download, None, |_, _, _| {})
            .await
            .map_err(PatchError::Network)?;

        remove_dir_if_exists(&unpacked).await?;
        let (archive, target) = (download.clone(), unpacked.clone());
        let loader = tokio::task::spawn_blocking(move || unpack_loader(&archive, &target))
            .await
            .map_err(|e| PatchError::Other(format!("mod loader extraction panicked: {e}")))??;

        let destination = self.loader_path();
        remove_file_if_exists(&destination).await?;
        move_file(&loader, &destination).await?;
        tokio::fs::create_dir_all(self.mods_dir()).await?;

        self.context
            .system_info
            .set_patch_store(MOD_LOADER_ID, INSTALLED_VERSION_KEY, Some(&tag))
            .map_err(PatchError::Other)?;

        remove_file_if_exists(&download).await?;
        remove_dir_if_exists(&unpacked).await?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        remove_file_if_exists(&self.loader_path()).await?;
        let mods = self.mods_dir();
        if mods.is_dir() && dir_is_empty(&mods).await? {
            tokio::fs::remove_dir(&mods).await?;
        }
        self.context
            .system_info
            .set_patch_store(MOD_LOADER_ID, INSTALLED_VERSION_KEY, None)
            .map_err(PatchError::Other)?;
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::patch::tests::context_in;
    use tempfile::TempDir;

    #[test]
    fn finds_nested_loader_dll() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("mod.zip");
        write_zip(&archive, &[("mod/", ""), ("mod/dinput8.dll", "dll"), ("README.md", "hi")]);

        let loader = unpack_loader(&archive, &dir.path().join("out")).unwrap();
        assert!(loader.ends_with("mod/dinput8.dll"));
    }

    #[tokio::test]
    async fn state_follows_dll_and_version() {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        let tag = RemoteTag::new("owner/repo");
        let patch = ModLoaderPatch::new(context.clone(), tag.clone());
        assert_eq!(patch.state(), PatchState::Loading);

        tag.resolve("v2");
        patch.refresh().await.unwrap();
        assert_eq!(patch.state(), PatchState::NotInstalled);

        std::fs::write(context.client_dir().join(LOADER_DLL), b"dll").unwrap();
        context
            .system_info
            .set_patch_store(MOD_LOADER_ID, INSTALLED_VERSION_KEY, Some("v1"))
            .unwrap();
        patch.refresh().await.unwrap();
        assert_eq!(patch.state(), PatchState::UpdateAvailable);
    }

    #[tokio::test]
    async fn uninstall_keeps_non_empty_mods_dir() {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        let tag = RemoteTag::new("owner/repo");
        tag.resolve("v1");
        let client = context.client_dir();
        std::fs::write(client.join(LOADER_DLL), b"dll").unwrap();
        std::fs::create_dir_all(client.join("mods").join("something")).unwrap();
        context
            .system_info
            .set_patch_store(MOD_LOADER_ID, INSTALLED_VERSION_KEY, Some("v1"))
            .unwrap();

        let patch = ModLoaderPatch::new(context.clone(), tag);
        assert_eq!(patch.state(), PatchState::Installed);

        patch.uninstall().await.unwrap();
        assert_eq!(patch.state(), PatchState::NotInstalled);
        assert!(!client.join(LOADER_DLL).exists());
        assert!(client.join("mods").exists());
        assert_eq!(
            context
                .system_info
                .get_patch_store(MOD_LOADER_ID, INSTALLED_VERSION_KEY),
            None
        );
    }

    #[tokio::test]
    async fn install_requires_known_version() {
        let dir = TempDir::new().unwrap();
        let tag = RemoteTag::new("owner/repo");
        tag.fail();
        let patch = ModLoaderPatch::new(context_in(&dir), tag);
        assert!(matches!(patch.install().await, Err(PatchError::VersionUnknown(_))));
    }
}
