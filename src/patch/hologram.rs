use async_trait::async_trait;

use super::{ClientPatch, PatchContext, PatchState, PatchStatus};
use crate::error::PatchError;

const SIGN_ANIMATION_PATH: &str = "res/animations/3dui/assembly_sign_anim_sm.kfm";

/// Length-prefixed absolute mesh path left over from the original build machine.
const BROKEN_MESH_PATH: &[u8] = b"\x019\x00\x00\x00Z:\\lwo\\4_game\\client\\res\\mesh\\3DUI\\Assembly_Logo_Sign.nif";
const FIXED_MESH_PATH: &[u8] = b"\x01(\x00\x00\x00.\\..\\..\\mesh\\3DUI\\Assembly_Logo_Sign.nif";

/// Replace the first occurrence of `find` in `data`.
///
/// Returns `None` when `find` is empty or not present.
pub fn replace_first(data: &[u8], find: &[u8], replace: &[u8]) -> Option<Vec<u8>> {
    if find.is_empty() {
        return None;
    }
    let index = data.windows(find.len()).position(|window| window == find)?;
    let mut out = Vec::with_capacity(data.len() - find.len() + replace.len());
    out.extend_from_slice(&data[..index]);
    out.extend_from_slice(replace);
    out.extend_from_slice(&data[index + find.len()..]);
    Some(out)
}

fn contains(data: &[u8], find: &[u8]) -> bool {
    data.windows(find.len()).any(|window| window == find)
}

/// Points the Nimbus Station Assembly vendor sign at a relative mesh path so
/// its hologram renders.
pub struct FixAssemblyVendorHologramPatch {
    context: PatchContext,
    status: PatchStatus,
}

impl FixAssemblyVendorHologramPatch {
    pub fn new(context: PatchContext) -> Self {
        let patch = Self {
            context,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn detect(&self) -> PatchState {
        match std::fs::read(self.context.client_file(SIGN_ANIMATION_PATH)) {
            Err(_) => PatchState::Incompatible,
            Ok(data) if contains(&data, BROKEN_MESH_PATH) => PatchState::NotInstalled,
            Ok(_) => PatchState::Installed,
        }
    }

    async fn swap(&self, find: &[u8], replace: &[u8]) -> Result<(), PatchError> {
        let path = self.context.client_file(SIGN_ANIMATION_PATH);
        if !path.is_file() {
            return Err(PatchError::Incompatible(self.id().to_owned()));
        }
        let data = tokio::fs::read(&path).await?;
        if let Some(patched) = replace_first(&data, find, replace) {
            tokio::fs::write(&path, patched).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClientPatch for FixAssemblyVendorHologramPatch {
    fn id(&self) -> &str {
        "FixAssemblyVendorHologram"
    }

    fn name(&self) -> String {
        "Fix Assembly Vendor Hologram".into()
    }

    fn description(&self) -> String {
        "Fixes the Assembly vendor at Nimbus Station not showing a hologram.".into()
    }

    fn apply_by_default(&self) -> bool {
        true
    }

    fn status(&self) -> &PatchStatus {
        &self.status
    }

    async fn refresh(&self) -> Result<(), PatchError> {
        self.status.set(self.detect());
        Ok(())
    }

    async fn install(&self) -> Result<(), PatchError> {
        self.swap(BROKEN_MESH_PATH, FIXED_MESH_PATH).await?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        self.swap(FIXED_MESH_PATH, BROKEN_MESH_PATH).await?;
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::context_in;
    use tempfile::TempDir;

    #[test]
    fn replaces_only_the_first_match() {
        assert_eq!(replace_first(b"abcabc", b"bc", b"X").unwrap(), b"aXabc");
        assert_eq!(replace_first(b"abc", b"", b"X"), None);
        assert_eq!(replace_first(b"abc", b"zz", b"X"), None);
    }

    #[test]
    fn never_reads_past_the_end() {
        // Partial match at the tail of the buffer.
        assert_eq!(replace_first(b"xxab", b"abc", b"Z"), None);
        assert_eq!(replace_first(b"ab", b"abc", b"Z"), None);
        assert_eq!(replace_first(b"xxabc", b"abc", b"Z").unwrap(), b"xxZ");
    }

    #[tokio::test]
    async fn install_rewrites_mesh_path() {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        let path = context.client_file(SIGN_ANIMATION_PATH);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut original = b"KFM header ".to_vec();
        original.extend_from_slice(BROKEN_MESH_PATH);
        original.extend_from_slice(b" trailer");
        std::fs::write(&path, &original).unwrap();

        let patch = FixAssemblyVendorHologramPatch::new(context);
        assert_eq!(patch.state(), PatchState::NotInstalled);

        patch.install().await.unwrap();
        assert_eq!(patch.state(), PatchState::Installed);
        let patched = std::fs::read(&path).unwrap();
        assert!(contains(&patched, FIXED_MESH_PATH));
        assert!(patched.ends_with(b" trailer"));

        patch.uninstall().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert_eq!(patch.state(), PatchState::NotInstalled);
    }

    #[tokio::test]
    async fn missing_animation_is_incompatible() {
        let dir = TempDir::new().unwrap();
        let patch = FixAssemblyVendorHologramPatch::new(context_in(&dir));
        assert_eq!(patch.state(), PatchState::Incompatible);
        assert!(patch.uninstall().await.is_err());
    }
}
