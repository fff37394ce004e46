use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Name of the client executable inside the client directory.
pub const CLIENT_EXECUTABLE: &str = "legouniverse.exe";

/// Returns the root directory used by the launcher.
///
/// `NLUL_HOME` wins, then `$XDG_DATA_HOME/nlul`, then `~/.nlul`.
pub fn default_app_dir() -> PathBuf {
    if let Some(home) = env::var_os("NLUL_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    if let Some(data_home) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data_home).join("nlul");
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nlul")
}

pub fn home_dir() -> Option<PathBuf> {
    match env::consts::OS {
        "windows" => env::var_os("USERPROFILE").map(PathBuf::from),
        _ => env::var_os("HOME").map(PathBuf::from),
    }
}

pub fn settings_file() -> PathBuf {
    default_app_dir().join("launcher.json")
}

pub fn client_dir(parent: &Path) -> PathBuf {
    parent.join("Client")
}

pub fn client_executable(parent: &Path) -> PathBuf {
    client_dir(parent).join(CLIENT_EXECUTABLE)
}

pub fn wine_dir(parent: &Path) -> PathBuf {
    parent.join("Wine")
}

pub fn wine_prefix_dir(parent: &Path) -> PathBuf {
    parent.join("WinePrefix")
}

pub fn patch_archives_dir(parent: &Path) -> PathBuf {
    parent.join("PatchArchives")
}

pub fn find_in_path_list(path_list: Option<&OsStr>, program: &str) -> Option<PathBuf> {
    let path_list = path_list?;
    env::split_paths(path_list)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Steam install locations checked in order.
pub fn steam_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(r"C:\Program Files (x86)\Steam")];
    if let Some(home) = home_dir() {
        // Arch Linux / Steam Deck, then Debian.
        candidates.push(home.join(".local").join("share").join("Steam"));
        candidates.push(home.join(".steam").join("debian-installation"));
    }
    candidates
}

/// Directory containing the client's `lwo.xml` on Windows hosts.
pub fn local_app_data() -> Option<PathBuf> {
    env::var_os("LOCALAPPDATA").map(PathBuf::from)
}

/// Snapshot of the host facts patches and runtimes decide on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    pub os: String,
    pub session_type: Option<String>,
    pub path: Option<OsString>,
    pub flatpak_id: Option<String>,
}

impl HostEnvironment {
    pub fn current() -> Self {
        Self {
            os: env::consts::OS.to_owned(),
            session_type: env::var("XDG_SESSION_TYPE").ok(),
            path: env::var_os("PATH"),
            flatpak_id: env::var("FLATPAK_ID").ok().filter(|id| !id.is_empty()),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub fn is_macos(&self) -> bool {
        self.os == "macos"
    }

    pub fn is_wayland(&self) -> bool {
        self.session_type
            .as_deref()
            .is_some_and(|session| session.eq_ignore_ascii_case("wayland"))
    }

    pub fn find_program(&self, program: &str) -> Option<PathBuf> {
        find_in_path_list(self.path.as_deref(), program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn builds_layout_under_parent() {
        let parent = Path::new("/data/nlul");
        assert_eq!(
            client_executable(parent),
            PathBuf::from("/data/nlul/Client/legouniverse.exe")
        );
        assert_eq!(wine_prefix_dir(parent), PathBuf::from("/data/nlul/WinePrefix"));
        assert_eq!(
            patch_archives_dir(parent),
            PathBuf::from("/data/nlul/PatchArchives")
        );
    }

    #[test]
    fn finds_program_in_path_list() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wine"), b"#!/bin/sh\n").unwrap();
        let list = env::join_paths([Path::new("/nonexistent"), dir.path()]).unwrap();

        assert_eq!(
            find_in_path_list(Some(&list), "wine"),
            Some(dir.path().join("wine"))
        );
        assert_eq!(find_in_path_list(Some(&list), "steam"), None);
        assert_eq!(find_in_path_list(None, "wine"), None);
    }

    #[test]
    fn detects_wayland_sessions() {
        let mut host = HostEnvironment {
            os: "linux".into(),
            session_type: Some("Wayland".into()),
            ..HostEnvironment::default()
        };
        assert!(host.is_wayland());
        assert!(!host.is_windows());

        host.session_type = Some("x11".into());
        assert!(!host.is_wayland());
        assert_eq!(host.find_program("wine"), None);
    }
}
