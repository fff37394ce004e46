use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{Runtime, RuntimeState};
use crate::env::HostEnvironment;
use crate::error::RuntimeError;
use crate::patch::{FORCE_WAYLAND_KEY, WAYLAND_PATCH_ID};
use crate::process::LaunchCommand;
use crate::storage::SystemInfo;

/// Lets the client load the mod loader's `dinput8.dll` over WINE's builtin.
pub(crate) const DLL_OVERRIDES: &str = "dinput8.dll=n,b";

/// WINE found on `PATH`, installed by the user.
pub struct UserInstalledWineRuntime {
    system_info: Arc<SystemInfo>,
    host: HostEnvironment,
}

impl UserInstalledWineRuntime {
    pub fn new(system_info: Arc<SystemInfo>, host: HostEnvironment) -> Self {
        Self { system_info, host }
    }

    fn use_wayland(&self) -> bool {
        let forced = self
            .system_info
            .get_patch_store(WAYLAND_PATCH_ID, FORCE_WAYLAND_KEY)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        if !forced {
            return false;
        }
        if self.host.is_wayland() {
            debug!("runtime: using the WINE Wayland driver");
            true
        } else {
            warn!(
                "runtime: Wayland driver requested but session type is {}",
                self.host.session_type.as_deref().unwrap_or("unknown")
            );
            false
        }
    }
}

#[async_trait]
impl Runtime for UserInstalledWineRuntime {
    fn name(&self) -> &'static str {
        "UserInstalledWine"
    }

    fn state(&self) -> RuntimeState {
        if self.host.is_windows() {
            RuntimeState::Unsupported
        } else if self.host.find_program("wine").is_some() {
            RuntimeState::Installed
        } else {
            RuntimeState::ManualInstallRequired
        }
    }

    async fn install(&self, _cancel: Option<Arc<AtomicBool>>) -> Result<(), RuntimeError> {
        Err(RuntimeError::ManualInstall(self.name().to_owned()))
    }

    fn run_application(
        &self,
        executable: &Path,
        working_dir: &Path,
    ) -> Result<LaunchCommand, RuntimeError> {
        if self.state() != RuntimeState::Installed {
            return Err(RuntimeError::NotInstalled);
        }
        info!("runtime: starting with user installed WINE");
        let prefix = working_dir.join("..").join("WinePrefix");
        let mut command = LaunchCommand::new("wine", working_dir)
            .arg(executable)
            .env("WINEDLLOVERRIDES", DLL_OVERRIDES)
            .env("WINEPREFIX", prefix.display().to_string());
        if self.use_wayland() {
            // Older WINE builds pick XWayland while DISPLAY is set.
            command = command.env("DISPLAY", "");
        }
        Ok(command)
    }
}
