use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::engine::models::ServerEntry;
use crate::env;

pub const DEFAULT_LOCALE: &str = "en_US";

/// Record of a user-supplied patch archive stored under `PatchArchives/`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ArchivePatch {
    pub archive_name: String,
    pub name: BTreeMap<String, String>,
    pub description: BTreeMap<String, String>,
    pub requirements: Option<Vec<String>>,
    pub installed: bool,
}

impl ArchivePatch {
    pub fn localized_name(&self, locale: &str) -> String {
        localized(&self.name, locale).unwrap_or_else(|| self.archive_name.clone())
    }

    pub fn localized_description(&self, locale: &str) -> String {
        localized(&self.description, locale).unwrap_or_default()
    }
}

fn localized(map: &BTreeMap<String, String>, locale: &str) -> Option<String> {
    map.get(locale)
        .or_else(|| map.get(DEFAULT_LOCALE))
        .or_else(|| map.values().next())
        .cloned()
}

/// Contents of `launcher.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LauncherSettings {
    pub servers: Vec<ServerEntry>,
    pub selected_server: Option<String>,
    pub client_parent_location: Option<PathBuf>,
    pub logs_enabled: bool,
    pub locale: String,
    pub patch_store: BTreeMap<String, BTreeMap<String, String>>,
    pub archive_patches: Vec<ArchivePatch>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            selected_server: None,
            client_parent_location: None,
            logs_enabled: false,
            locale: DEFAULT_LOCALE.to_owned(),
            patch_store: BTreeMap::new(),
            archive_patches: Vec::new(),
        }
    }
}

impl LauncherSettings {
    pub fn server_entry(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|server| server.server_name == name)
    }
}

/// In-memory settings backed by `launcher.json`.
///
/// Settings are read once on [`SystemInfo::load`] and only written back by
/// [`SystemInfo::save`]; there is no autosave.
pub struct SystemInfo {
    path: PathBuf,
    settings: RwLock<LauncherSettings>,
    save_lock: Mutex<()>,
}

impl SystemInfo {
    /// Load the settings from the default launcher home.
    pub fn load_default() -> Self {
        Self::load(env::settings_file())
    }

    /// Load the settings from `path`, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<LauncherSettings>(&bytes).unwrap_or_else(|err| {
                warn!("settings: ignoring unreadable {}: {err}", path.display());
                LauncherSettings::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => LauncherSettings::default(),
            Err(err) => {
                warn!("settings: failed to read {}: {err}", path.display());
                LauncherSettings::default()
            }
        };

        let info = Self {
            path,
            settings: RwLock::new(settings),
            save_lock: Mutex::new(()),
        };

        let needs_parent = info.settings.read().client_parent_location.is_none();
        if needs_parent {
            let home = info.home_dir();
            info.settings.write().client_parent_location = Some(home);
            if let Err(err) = info.save() {
                warn!("settings: {err}");
            }
        }
        info
    }

    pub fn settings_path(&self) -> &Path {
        &self.path
    }

    /// Directory containing `launcher.json`.
    pub fn home_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(env::default_app_dir)
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> LauncherSettings {
        self.settings.read().clone()
    }

    /// Read a value out of the settings without cloning all of them.
    pub fn read<R>(&self, f: impl FnOnce(&LauncherSettings) -> R) -> R {
        f(&self.settings.read())
    }

    /// Mutate the settings in memory. Call [`SystemInfo::save`] afterwards.
    pub fn update<R>(&self, f: impl FnOnce(&mut LauncherSettings) -> R) -> R {
        f(&mut self.settings.write())
    }

    pub fn client_parent(&self) -> PathBuf {
        self.read(|s| s.client_parent_location.clone())
            .unwrap_or_else(|| self.home_dir())
    }

    pub fn client_dir(&self) -> PathBuf {
        env::client_dir(&self.client_parent())
    }

    pub fn logs_enabled(&self) -> bool {
        self.read(|s| s.logs_enabled)
    }

    pub fn locale(&self) -> String {
        self.read(|s| s.locale.clone())
    }

    pub fn get_patch_store(&self, patch: &str, key: &str) -> Option<String> {
        self.read(|s| s.patch_store.get(patch).and_then(|m| m.get(key)).cloned())
    }

    /// Set or clear (`None`) a patch store value and save the settings.
    pub fn set_patch_store(&self, patch: &str, key: &str, value: Option<&str>) -> Result<(), String> {
        self.update(|s| match value {
            Some(value) => {
                s.patch_store
                    .entry(patch.to_owned())
                    .or_default()
                    .insert(key.to_owned(), value.to_owned());
            }
            None => {
                if let Some(values) = s.patch_store.get_mut(patch) {
                    values.remove(key);
                    if values.is_empty() {
                        s.patch_store.remove(patch);
                    }
                }
            }
        });
        self.save()
    }

    /// Rewrite `launcher.json` from the in-memory settings.
    pub fn save(&self) -> Result<(), String> {
        let _guard = self.save_lock.lock();
        let (bytes, parent) = {
            let settings = self.settings.read();
            let bytes = serde_json::to_vec_pretty(&*settings)
                .map_err(|e| format!("failed to serialize settings: {e}"))?;
            (bytes, settings.client_parent_location.clone())
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| format!("failed to create settings dir: {e}"))?;
        }
        if let Some(parent) = parent {
            fs::create_dir_all(&parent)
                .map_err(|e| format!("failed to create client parent dir: {e}"))?;
        }
        fs::write(&self.path, bytes).map_err(|e| format!("failed to write settings: {e}"))?;
        debug!("settings: saved {}", self.path.display());
        Ok(())
    }
}
