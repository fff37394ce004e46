use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use super::wine::DLL_OVERRIDES;
use super::{Runtime, RuntimeState};
use crate::env::{self, HostEnvironment};
use crate::error::RuntimeError;
use crate::networking::NetworkClient;
use crate::process::LaunchCommand;
use crate::storage::SystemInfo;
use crate::util::{cancel_requested, move_dir, progress_fraction};

pub const WINE_DOWNLOAD_URL: &str =
    "https://github.com/Gcenx/macOS_Wine_builds/releases/download/9.0/wine-stable-9.0-osx64.tar.xz";

/// WINE build downloaded into the launcher directory on macOS.
pub struct MacOsWineRuntime {
    system_info: Arc<SystemInfo>,
    host: HostEnvironment,
    network: NetworkClient,
}

impl MacOsWineRuntime {
    pub fn new(system_info: Arc<SystemInfo>, host: HostEnvironment, network: NetworkClient) -> Self {
        Self {
            system_info,
            host,
            network,
        }
    }

    fn wine_dir(&self) -> PathBuf {
        env::wine_dir(&self.system_info.client_parent())
    }

    fn wine_binary(&self) -> PathBuf {
        self.wine_dir().join("bin").join("wine")
    }
}

fn check_cancel(cancel: &Option<Arc<AtomicBool>>) -> Result<(), RuntimeError> {
    if cancel_requested(cancel) {
        warn!("runtime: install cancelled");
        return Err(RuntimeError::Cancelled);
    }
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), RuntimeError> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl Runtime for MacOsWineRuntime {
    fn name(&self) -> &'static str {
        "MacOsWine"
    }

    fn state(&self) -> RuntimeState {
        if !self.host.is_macos() {
            RuntimeState::Unsupported
        } else if self.wine_binary().is_file() {
            RuntimeState::Installed
        } else {
            RuntimeState::NotInstalled
        }
    }

    async fn install(&self, cancel: Option<Arc<AtomicBool>>) -> Result<(), RuntimeError> {
        if self.state() == RuntimeState::Unsupported {
            return Err(RuntimeError::Unsupported(self.name().to_owned()));
        }
        let parent = self.system_info.client_parent();
        let download = parent.join("wine-download.tar.xz");
        let extract = parent.join("wine-extract");

        check_cancel(&cancel)?;
        if !download.is_file() {
            info!("runtime: downloading WINE to {}", download.display());
            let mut last_logged = 0;
            self.network
                .download_to_path(WINE_DOWNLOAD_URL, &download, cancel.clone(), |done, total, speed| {
                    let percent = (progress_fraction(done, total) * 100.0) as u32;
                    if percent >= last_logged + 10 {
                        last_logged = percent;
                        debug!("runtime: WINE download {percent}% ({speed})");
                    }
                })
                .await
                .map_err(|e| {
                    if cancel_requested(&cancel) {
                        RuntimeError::Cancelled
                    } else {
                        RuntimeError::Other(format!("failed to download WINE: {e}"))
                    }
                })?;
        }

        check_cancel(&cancel)?;
        remove_dir_if_exists(&extract).await?;
        tokio::fs::create_dir_all(&extract).await?;
        // System tar keeps the symbolic links of the bundle intact.
        let status = Command::new("tar")
            .arg("xJf")
            .arg(&download)
            .arg("-C")
            .arg(&extract)
            .status()
            .await?;
        if !status.success() {
            warn!("runtime: discarding unreadable WINE download");
            let _ = tokio::fs::remove_file(&download).await;
            remove_dir_if_exists(&extract).await?;
            return Err(RuntimeError::Other(format!("tar exited with {status}")));
        }

        check_cancel(&cancel)?;
        let wine_dir = self.wine_dir();
        remove_dir_if_exists(&wine_dir).await?;
        let bundled = extract
            .join("Wine Stable.app")
            .join("Contents")
            .join("Resources")
            .join("wine");
        let target = wine_dir.clone();
        tokio::task::spawn_blocking(move || move_dir(&bundled, &target))
            .await
            .map_err(|e| RuntimeError::Other(format!("moving WINE panicked: {e}")))??;

        tokio::fs::remove_file(&download).await?;
        remove_dir_if_exists(&extract).await?;
        info!("runtime: WINE ready at {}", wine_dir.display());
        Ok(())
    }

    fn run_application(
        &self,
        executable: &Path,
        working_dir: &Path,
    ) -> Result<LaunchCommand, RuntimeError> {
        if self.state() != RuntimeState::Installed {
            return Err(RuntimeError::NotInstalled);
        }
        info!("runtime: starting with downloaded WINE for macOS");
        Ok(LaunchCommand::new(self.wine_binary(), working_dir)
            .arg(executable)
            .env("WINEDLLOVERRIDES", DLL_OVERRIDES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runtime_in(dir: &TempDir, os: &str) -> MacOsWineRuntime {
        let info = Arc::new(SystemInfo::load(dir.path().join("launcher.json")));
        MacOsWineRuntime::new(
            info,
            HostEnvironment {
                os: os.into(),
                ..HostEnvironment::default()
            },
            NetworkClient::new(),
        )
    }

    #[test]
    fn state_depends_on_host_and_binary() {
        let dir = TempDir::new().unwrap();
        assert_eq!(runtime_in(&dir, "linux").state(), RuntimeState::Unsupported);

        let runtime = runtime_in(&dir, "macos");
        assert_eq!(runtime.state(), RuntimeState::NotInstalled);

        let binary = runtime.wine_binary();
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, b"").unwrap();
        assert_eq!(runtime.state(), RuntimeState::Installed);

        let command = runtime
            .run_application(Path::new("legouniverse.exe"), dir.path())
            .unwrap();
        assert_eq!(command.program, binary);
        assert_eq!(command.env_value("WINEDLLOVERRIDES"), Some(DLL_OVERRIDES));
    }

    #[tokio::test]
    async fn corrupt_download_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_in(&dir, "macos");
        let download = dir.path().join("wine-download.tar.xz");
        std::fs::write(&download, b"not an archive").unwrap();

        let result = runtime.install(None).await;
        assert!(matches!(result, Err(RuntimeError::Other(_))));
        assert!(!download.exists());
        assert!(!dir.path().join("wine-extract").exists());
        assert_eq!(runtime.state(), RuntimeState::NotInstalled);
    }

    #[tokio::test]
    async fn cancelled_install_stops_early() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_in(&dir, "macos");
        let cancel = Arc::new(AtomicBool::new(true));
        assert!(matches!(
            runtime.install(Some(cancel)).await,
            Err(RuntimeError::Cancelled)
        ));
    }
}
