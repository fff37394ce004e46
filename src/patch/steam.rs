use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use regex::{Captures, Regex};
use sysinfo::{ProcessesToUpdate, System};

use super::{ClientPatch, PatchContext, PatchState, PatchStatus};
use crate::env;
use crate::error::PatchError;
use crate::vdf::{ShortcutsFile, VdfEntry, VdfEntryList};

const STEAM_PATCH_ID: &str = "SteamOneClick";
const STATE_KEY: &str = "State";
const LAST_SHUTDOWN_KEY: &str = "LastSteamShutdownLine";
const PENDING_SETTINGS_CHANGE: &str = "PendingSettingsChange";
const SETTINGS_CHANGED: &str = "SettingsChanged";

const SHORTCUT_NAME: &str = "Nexus LU Launcher";
const SHORTCUT_APP_ID: [u8; 4] = [64, 201, 67, 159];

/// Adds the launcher to Steam as a non-Steam game and switches the client to
/// maximized windowed mode on the next launch.
///
/// Steam side changes are never undone, so the state is whatever was last
/// recorded in the patch store.
pub struct SteamOneClickPatch {
    context: PatchContext,
    candidates: Vec<PathBuf>,
    steam_dir: RwLock<Option<PathBuf>>,
    status: PatchStatus,
}

impl SteamOneClickPatch {
    pub fn new(context: PatchContext) -> Self {
        Self::with_steam_candidates(context, env::steam_candidates())
    }

    pub fn with_steam_candidates(context: PatchContext, candidates: Vec<PathBuf>) -> Self {
        let patch = Self {
            context,
            candidates,
            steam_dir: RwLock::new(None),
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn store(&self, key: &str) -> Option<String> {
        self.context.system_info.get_patch_store(STEAM_PATCH_ID, key)
    }

    fn set_store(&self, key: &str, value: Option<&str>) -> Result<(), PatchError> {
        self.context
            .system_info
            .set_patch_store(STEAM_PATCH_ID, key, value)
            .map_err(PatchError::Other)
    }

    fn detect(&self) -> PatchState {
        let steam_dir = self.candidates.iter().find(|path| path.is_dir()).cloned();
        let found = steam_dir.is_some();
        *self.steam_dir.write() = steam_dir;
        if !found {
            PatchState::Incompatible
        } else if self.store(STATE_KEY).is_some() {
            PatchState::Installed
        } else {
            PatchState::NotInstalled
        }
    }

    fn shortcut(&self) -> Result<VdfEntryList, PatchError> {
        let (executable, launch_options) = match &self.context.host.flatpak_id {
            Some(id) => ("flatpak".to_owned(), format!("\"run\" \"{id}\"")),
            None => (
                std::env::current_exe()?.display().to_string(),
                String::new(),
            ),
        };
        let start_dir = std::env::current_dir()?.display().to_string();
        Ok([
            VdfEntry::text("appid", SHORTCUT_APP_ID),
            VdfEntry::header("AppName", SHORTCUT_NAME),
            VdfEntry::header("Exe", format!("\"{executable}\"")),
            VdfEntry::header("StartDir", format!("\"{start_dir}\"")),
            VdfEntry::header("icon", ""),
            VdfEntry::header("ShortcutPath", ""),
            VdfEntry::header("LaunchOptions", launch_options),
            VdfEntry::zeroed_text("IsHidden"),
            VdfEntry::text("AllowDesktopConfig", [1, 0, 0, 0]),
            VdfEntry::text("AllowOverlay", [1, 0, 0, 0]),
            VdfEntry::zeroed_text("OpenVR"),
            VdfEntry::zeroed_text("Devkit"),
            VdfEntry::header("DevkitGameID", ""),
            VdfEntry::zeroed_text("DevkitOverrideAppId"),
            VdfEntry::zeroed_text("LastPlayTime"),
            VdfEntry::set("tags"),
        ]
        .into_iter()
        .collect())
    }

    /// Stop Steam so it picks up the new shortcut when started again.
    ///
    /// A Flatpak sandbox can't reach the Steam process, so the last shutdown
    /// line of the bootstrap log is recorded instead when Steam looks running.
    async fn restart_steam(&self, steam_dir: &Path) -> Result<(), PatchError> {
        if self.context.host.flatpak_id.is_none() {
            info!("patch {STEAM_PATCH_ID}: shutting down Steam");
            tokio::task::spawn_blocking(stop_steam_processes)
                .await
                .map_err(|e| PatchError::Other(format!("stopping Steam panicked: {e}")))?;
            return Ok(());
        }

        let log_path = steam_dir.join("logs").join("bootstrap_log.txt");
        let Ok(log) = tokio::fs::read_to_string(&log_path).await else {
            return Ok(());
        };
        match last_shutdown_if_running(&log) {
            Some(line) => {
                warn!("patch {STEAM_PATCH_ID}: Steam can't be restarted from a Flatpak, restart it manually");
                self.set_store(LAST_SHUTDOWN_KEY, Some(&line))
            }
            None => {
                info!("patch {STEAM_PATCH_ID}: Steam is not running");
                Ok(())
            }
        }
    }

    /// `lwo.xml` of the client, preferring one inside the WINE prefix.
    fn client_settings_path(&self) -> Option<PathBuf> {
        let users = env::wine_prefix_dir(&self.context.system_info.client_parent())
            .join("drive_c")
            .join("users");
        let in_prefix = std::fs::read_dir(users).ok().and_then(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|user| lwo_xml_under(&user.path().join("AppData").join("Local")))
                .filter(|path| path.is_file())
                .last()
        });
        in_prefix.or_else(|| {
            env::local_app_data()
                .map(|dir| lwo_xml_under(&dir))
                .filter(|path| path.is_file())
        })
    }
}

fn lwo_xml_under(local_app_data: &Path) -> PathBuf {
    local_app_data
        .join("LEGO Software")
        .join("LEGO Universe")
        .join("lwo.xml")
}

fn stop_steam_processes() {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    for process in system.processes_by_exact_name(OsStr::new("steam")) {
        debug!("patch {STEAM_PATCH_ID}: stopping process {}", process.pid());
        if process.kill() {
            let _ = process.wait();
        }
    }
}

/// Last "Shutdown" line of the bootstrap log when a "Startup" line follows it.
fn last_shutdown_if_running(log: &str) -> Option<String> {
    let mut last_startup = None;
    let mut last_shutdown = None;
    for (index, line) in log.lines().enumerate() {
        if line.contains("Shutdown") {
            last_shutdown = Some((index, line));
        } else if line.contains("Startup") {
            last_startup = Some(index);
        }
    }
    match (last_startup, last_shutdown) {
        (None, _) => None,
        (Some(startup), Some((shutdown, _))) if startup < shutdown => None,
        (Some(_), shutdown) => Some(shutdown.map(|(_, line)| line.to_owned()).unwrap_or_default()),
    }
}

/// Set `WINDOWED` and `WINDOW_MAXIMIZED` to 1, adding the latter when absent.
fn maximize_windowed(xml: &str) -> Result<String, PatchError> {
    let regex = |pattern: &str| {
        Regex::new(pattern).map_err(|e| PatchError::Other(format!("invalid settings pattern: {e}")))
    };
    // Self-closing options carry no value and must not swallow their sibling.
    let option =
        regex(r"(?s)<ConfigurableOption\b([^>]*?)(?:/>|>(.*?)</ConfigurableOption>)")?;
    let name = regex(r#"\bname\s*=\s*"([^"]*)""#)?;
    let value = regex(r"<Value>[^<]*</Value>")?;

    let mut has_maximized = false;
    let updated = option.replace_all(xml, |caps: &Captures| {
        let whole = &caps[0];
        let option_name = name.captures(&caps[1]).map(|c| c[1].to_owned());
        let body = caps.get(2).map_or("", |m| m.as_str());
        match option_name.as_deref() {
            Some(found @ ("WINDOWED" | "WINDOW_MAXIMIZED")) if value.is_match(body) => {
                if found == "WINDOW_MAXIMIZED" {
                    has_maximized = true;
                }
                value.replace(whole, "<Value>1</Value>").into_owned()
            }
            _ => whole.to_owned(),
        }
    });
    let mut updated = updated.into_owned();

    if !has_maximized {
        let end = updated
            .rfind("</ConfigurableOptions>")
            .ok_or_else(|| PatchError::Other("settings have no ConfigurableOptions".into()))?;
        updated.insert_str(
            end,
            r#"<ConfigurableOption name="WINDOW_MAXIMIZED" type="7"><ValueSet><Value>1</Value></ValueSet></ConfigurableOption>"#,
        );
    }
    Ok(updated)
}

/// Add the launcher shortcut to one `shortcuts.vdf`. Returns false when it
/// is already present.
fn add_shortcut(path: &Path, shortcut: &VdfEntryList) -> Result<bool, PatchError> {
    let mut file = if path.is_file() {
        ShortcutsFile::from_file(path).map_err(PatchError::Other)?
    } else {
        ShortcutsFile::new("shortcuts")
    };
    if file
        .values
        .iter()
        .any(|(_, entries)| entries.try_get_header("AppName") == Some(SHORTCUT_NAME))
    {
        return Ok(false);
    }
    info!("patch {STEAM_PATCH_ID}: adding shortcut to {}", path.display());
    file.add_entry(shortcut.clone());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    file.write_file(path).map_err(PatchError::Other)?;
    Ok(true)
}

#[async_trait]
impl ClientPatch for SteamOneClickPatch {
    fn id(&self) -> &str {
        STEAM_PATCH_ID
    }

    fn name(&self) -> String {
        "Add To Steam".into()
    }

    fn description(&self) -> String {
        "Adds the launcher to Steam and sets the client to run maximized in a window.".into()
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
        let steam_dir = self
            .steam_dir
            .read()
            .clone()
            .ok_or_else(|| PatchError::Incompatible(STEAM_PATCH_ID.to_owned()))?;
        let shortcut = self.shortcut()?;

        let mut added = false;
        let userdata = steam_dir.join("userdata");
        if userdata.is_dir() {
            for user in std::fs::read_dir(&userdata)?.filter_map(Result::ok) {
                if !user.path().is_dir() {
                    continue;
                }
                let shortcuts = user.path().join("config").join("shortcuts.vdf");
                added |= add_shortcut(&shortcuts, &shortcut)?;
            }
        }
        if added {
            self.restart_steam(&steam_dir).await?;
        }

        if self.store(STATE_KEY).is_none() {
            self.set_store(STATE_KEY, Some(PENDING_SETTINGS_CHANGE))?;
        }
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        self.set_store(STATE_KEY, None)?;
        self.refresh().await
    }

    fn is_pre_launch(&self) -> bool {
        true
    }

    async fn on_client_request_launch(&self) -> Result<(), PatchError> {
        if self.store(STATE_KEY).as_deref() != Some(PENDING_SETTINGS_CHANGE) {
            debug!("patch {STEAM_PATCH_ID}: client settings already changed");
            return Ok(());
        }
        let Some(path) = self.client_settings_path() else {
            warn!("patch {STEAM_PATCH_ID}: lwo.xml not found, expected before the first launch");
            return Ok(());
        };
        let xml = tokio::fs::read_to_string(&path).await?;
        tokio::fs::write(&path, maximize_windowed(&xml)?).await?;
        info!("patch {STEAM_PATCH_ID}: client set to windowed mode");
        self.set_store(STATE_KEY, Some(SETTINGS_CHANGED))
    }
}
