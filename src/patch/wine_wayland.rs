use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::{ClientPatch, PatchContext, PatchState, PatchStatus};
use crate::env;
use crate::error::PatchError;

pub const WAYLAND_PATCH_ID: &str = "EnableWineWayland";
pub const FORCE_WAYLAND_KEY: &str = "ForceWaylandDriver";

/// Switches the WINE prefix to the Wayland graphics driver.
pub struct EnableWineWaylandPatch {
    context: PatchContext,
    status: PatchStatus,
}

impl EnableWineWaylandPatch {
    pub fn new(context: PatchContext) -> Self {
        let patch = Self {
            context,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn compatible(&self) -> bool {
        self.context.host.is_wayland() && self.context.host.find_program("wine").is_some()
    }

    fn detect(&self) -> PatchState {
        if !self.compatible() {
            return PatchState::Incompatible;
        }
        let forced = self
            .context
            .system_info
            .get_patch_store(WAYLAND_PATCH_ID, FORCE_WAYLAND_KEY)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        if forced {
            PatchState::Installed
        } else {
            PatchState::NotInstalled
        }
    }

    async fn run_reg(&self, args: &[&str]) -> Result<(), PatchError> {
        if !self.compatible() {
            return Err(PatchError::Incompatible(self.id().to_owned()));
        }
        let prefix = env::wine_prefix_dir(&self.context.system_info.client_parent());
        debug!("patch {}: wine reg.exe {}", self.id(), args.join(" "));
        let status = Command::new("wine")
            .arg("reg.exe")
            .args(args)
            .env("WINEPREFIX", &prefix)
            .status()
            .await?;
        if !status.success() {
            return Err(PatchError::Other(format!("reg.exe exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientPatch for EnableWineWaylandPatch {
    fn id(&self) -> &str {
        WAYLAND_PATCH_ID
    }

    fn name(&self) -> String {
        "Enable WINE Wayland".into()
    }

    fn description(&self) -> String {
        "Uses the Wayland driver of WINE instead of XWayland.".into()
    }

    fn apply_by_default(&self) -> bool {
        self.compatible()
    }

    fn status(&self) -> &PatchStatus {
        &self.status
    }

    async fn refresh(&self) -> Result<(), PatchError> {
        self.status.set(self.detect());
        Ok(())
    }

    async fn install(&self) -> Result<(), PatchError> {
        self.run_reg(&[
            "add",
            r"HKCU\Software\Wine\Drivers",
            "/v",
            "Graphics",
            "/d",
            "wayland,x11",
            "/f",
        ])
        .await?;
        self.context
            .system_info
            .set_patch_store(WAYLAND_PATCH_ID, FORCE_WAYLAND_KEY, Some("true"))
            .map_err(PatchError::Other)?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        self.run_reg(&["delete", r"HKCU\Software\Wine\Drivers", "/v", "Graphics", "/f"])
            .await?;
        self.context
            .system_info
            .set_patch_store(WAYLAND_PATCH_ID, FORCE_WAYLAND_KEY, None)
            .map_err(PatchError::Other)?;
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::HostEnvironment;
    use crate::patch::tests::context_in;
    use tempfile::TempDir;

    fn wayland_host(wine_dir: &TempDir) -> HostEnvironment {
        std::fs::write(wine_dir.path().join("wine"), b"").unwrap();
        HostEnvironment {
            os: "linux".into(),
            session_type: Some("wayland".into()),
            path: Some(wine_dir.path().as_os_str().to_owned()),
            flatpak_id: None,
        }
    }

    #[test]
    fn incompatible_without_wayland_session() {
        let dir = TempDir::new().unwrap();
        let patch = EnableWineWaylandPatch::new(context_in(&dir));
        assert_eq!(patch.state(), PatchState::Incompatible);
        assert!(!patch.apply_by_default());
    }

    #[test]
    fn reads_forced_driver_from_store() {
        let dir = TempDir::new().unwrap();
        let wine = TempDir::new().unwrap();
        let mut context = context_in(&dir);
        context.host = wayland_host(&wine);

        let patch = EnableWineWaylandPatch::new(context.clone());
        assert_eq!(patch.state(), PatchState::NotInstalled);
        assert!(patch.apply_by_default());

        context
            .system_info
            .set_patch_store(WAYLAND_PATCH_ID, FORCE_WAYLAND_KEY, Some("True"))
            .unwrap();
        let patch = EnableWineWaylandPatch::new(context);
        assert_eq!(patch.state(), PatchState::Installed);
    }
}
