use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::{
    ClientPatch, ExclusivityGroup, INSTALLED_VERSION_KEY, PatchContext, PatchState, PatchStatus,
    RemoteTag, move_file, remove_dir_if_exists, remove_file_if_exists,
};
use crate::boot::LegoDataDictionary;
use crate::engine::models::split_port;
use crate::error::PatchError;
use crate::networking::{TCP_PROBE_TIMEOUT, tcp_probe};

pub(crate) const TCP_UDP_ID: &str = "TcpUdp";
pub(crate) const AUTO_TCP_UDP_ID: &str = "AutoTcpUdp";

/// Default port of TCP/UDP servers. 1001 is too commonly used by other software.
const TCP_UDP_PORT: u16 = 21836;

const MOD_DIR: &str = "mods/raknet_replacer";
const DISABLED_MOD_DIR: &str = "disabledmods/raknet_replacer";
const MOD_FILE: &str = "mod.dll";

/// Download the shim into `dir`, replacing an existing copy.
async fn download_shim(
    context: &PatchContext,
    tag: &RemoteTag,
    version: &str,
    dir: &Path,
) -> Result<(), PatchError> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(MOD_FILE);
    remove_file_if_exists(&target).await?;
    context
        .network
        .download_to_path(&tag.asset_url(version, MOD_FILE), &target, None, |_, _, _| {})
        .await
        .map_err(PatchError::Network)
}

fn latest_version(tag: &RemoteTag) -> Result<String, PatchError> {
    tag.latest()
        .ok_or_else(|| PatchError::VersionUnknown(tag.repository().to_owned()))
}

/// Always-on TCP/UDP shim.
pub struct TcpUdpPatch {
    context: PatchContext,
    tag: Arc<RemoteTag>,
    group: Arc<ExclusivityGroup>,
    status: PatchStatus,
}

impl TcpUdpPatch {
    pub fn new(context: PatchContext, tag: Arc<RemoteTag>, group: Arc<ExclusivityGroup>) -> Self {
        let patch = Self {
            context,
            tag,
            group,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn mod_dir(&self) -> PathBuf {
        self.context.client_file(MOD_DIR)
    }

    fn detect(&self) -> PatchState {
        let installed = self.mod_dir().join(MOD_FILE).is_file()
            && self.group.active_other(TCP_UDP_ID).is_none();
        super::remote_state(
            &self.tag,
            installed,
            self.context
                .system_info
                .get_patch_store(TCP_UDP_ID, INSTALLED_VERSION_KEY),
        )
    }
}

#[async_trait]
impl ClientPatch for TcpUdpPatch {
    fn id(&self) -> &str {
        TCP_UDP_ID
    }

    fn name(&self) -> String {
        "TCP/UDP Shim".into()
    }

    fn description(&self) -> String {
        "Enables connecting to community-run servers that use TCP/UDP. Prevents connecting to RakNet servers. Requires the Mod Loader. Can't be installed with Auto TCP/UDP Shim.".into()
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
        let version = latest_version(&self.tag)?;
        self.group.ensure_can_install(TCP_UDP_ID)?;
        download_shim(&self.context, &self.tag, &version, &self.mod_dir()).await?;
        self.context
            .system_info
            .set_patch_store(TCP_UDP_ID, INSTALLED_VERSION_KEY, Some(&version))
            .map_err(PatchError::Other)?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        remove_dir_if_exists(&self.mod_dir()).await?;
        self.context
            .system_info
            .set_patch_store(TCP_UDP_ID, INSTALLED_VERSION_KEY, None)
            .map_err(PatchError::Other)?;
        self.refresh().await
    }
}

/// TCP/UDP shim enabled or disabled per launch depending on the server.
pub struct AutoTcpUdpPatch {
    context: PatchContext,
    tag: Arc<RemoteTag>,
    group: Arc<ExclusivityGroup>,
    status: PatchStatus,
}

impl AutoTcpUdpPatch {
    pub fn new(context: PatchContext, tag: Arc<RemoteTag>, group: Arc<ExclusivityGroup>) -> Self {
        let patch = Self {
            context,
            tag,
            group,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn mod_dir(&self) -> PathBuf {
        self.context.client_file(MOD_DIR)
    }

    fn disabled_mod_dir(&self) -> PathBuf {
        self.context.client_file(DISABLED_MOD_DIR)
    }

    fn detect(&self) -> PatchState {
        let enabled = self.mod_dir().join(MOD_FILE).is_file()
            && self.group.active_other(AUTO_TCP_UDP_ID).is_none();
        let disabled = self.disabled_mod_dir().join(MOD_FILE).is_file();
        super::remote_state(
            &self.tag,
            enabled || disabled,
            self.context
                .system_info
                .get_patch_store(AUTO_TCP_UDP_ID, INSTALLED_VERSION_KEY),
        )
    }

    /// Whether the server in `boot.cfg` looks like a TCP/UDP server.
    async fn server_uses_tcp_udp(&self) -> Result<bool, PatchError> {
        let boot = LegoDataDictionary::from_file(&self.context.client_dir().join("boot.cfg"))
            .await
            .map_err(PatchError::Other)?;
        let address = boot.get_str("AUTHSERVERIP").unwrap_or_default().trim();
        info!("patch {AUTO_TCP_UDP_ID}: checking TCP/UDP for {address}");

        // Any explicit port means TCP/UDP. The stock client can't use one, even 1001.
        let host = match split_port(address) {
            (_, Some(port)) if port.trim().parse::<u16>().is_ok() => {
                info!("patch {AUTO_TCP_UDP_ID}: custom port {port} specified, assuming TCP/UDP");
                return Ok(true);
            }
            (host, _) => host,
        };
        let reachable = tcp_probe(host, TCP_UDP_PORT, TCP_PROBE_TIMEOUT).await;
        if reachable {
            info!("patch {AUTO_TCP_UDP_ID}: port {TCP_UDP_PORT} reachable, assuming TCP/UDP");
        } else {
            info!("patch {AUTO_TCP_UDP_ID}: port {TCP_UDP_PORT} unreachable, assuming RakNet");
        }
        Ok(reachable)
    }

    /// Move the shim from `source` into `target` and drop `source`.
    async fn switch_mod_dir(source: &Path, target: &Path) -> Result<(), PatchError> {
        tokio::fs::create_dir_all(target).await?;
        let source_mod = source.join(MOD_FILE);
        if source_mod.is_file() {
            move_file(&source_mod, &target.join(MOD_FILE)).await?;
        }
        remove_dir_if_exists(source).await
    }
}

#[async_trait]
impl ClientPatch for AutoTcpUdpPatch {
    fn id(&self) -> &str {
        AUTO_TCP_UDP_ID
    }

    fn name(&self) -> String {
        "Auto TCP/UDP Shim".into()
    }

    fn description(&self) -> String {
        "Enables connecting to community-run servers that may or may not use TCP/UDP, decided for the requested server on launch. Requires the Mod Loader. Can't be installed with TCP/UDP Shim.".into()
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
        let version = latest_version(&self.tag)?;
        self.group.ensure_can_install(AUTO_TCP_UDP_ID)?;
        remove_dir_if_exists(&self.disabled_mod_dir()).await?;
        download_shim(&self.context, &self.tag, &version, &self.mod_dir()).await?;
        self.context
            .system_info
            .set_patch_store(AUTO_TCP_UDP_ID, INSTALLED_VERSION_KEY, Some(&version))
            .map_err(PatchError::Other)?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        remove_dir_if_exists(&self.mod_dir()).await?;
        remove_dir_if_exists(&self.disabled_mod_dir()).await?;
        self.context
            .system_info
            .set_patch_store(AUTO_TCP_UDP_ID, INSTALLED_VERSION_KEY, None)
            .map_err(PatchError::Other)?;
        self.refresh().await
    }

    fn is_pre_launch(&self) -> bool {
        true
    }

    async fn on_client_request_launch(&self) -> Result<(), PatchError> {
        if self.server_uses_tcp_udp().await? {
            Self::switch_mod_dir(&self.disabled_mod_dir(), &self.mod_dir()).await
        } else {
            Self::switch_mod_dir(&self.mod_dir(), &self.disabled_mod_dir()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::context_in;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        context: PatchContext,
        tag: Arc<RemoteTag>,
        group: Arc<ExclusivityGroup>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        let tag = RemoteTag::new("owner/repo");
        tag.resolve("v1");
        let group = ExclusivityGroup::new(context.system_info.clone(), &[AUTO_TCP_UDP_ID, TCP_UDP_ID]);
        Fixture {
            _dir: dir,
            context,
            tag,
            group,
        }
    }

    fn place_mod(context: &PatchContext, relative: &str) {
        let dir = context.client_file(relative);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MOD_FILE), b"shim").unwrap();
    }

    #[tokio::test]
    async fn rejects_install_while_other_shim_is_recorded() {
        let f = fixture();
        f.context
            .system_info
            .set_patch_store(AUTO_TCP_UDP_ID, INSTALLED_VERSION_KEY, Some("v1"))
            .unwrap();
        let patch = TcpUdpPatch::new(f.context.clone(), f.tag.clone(), f.group.clone());

        let err = patch.install().await.unwrap_err();
        assert!(matches!(err, PatchError::Conflict { ref other, .. } if other == AUTO_TCP_UDP_ID));
        assert!(!f.context.client_file(MOD_DIR).exists());
    }

    #[tokio::test]
    async fn shared_mod_file_counts_for_one_shim_only() {
        let f = fixture();
        place_mod(&f.context, MOD_DIR);
        f.context
            .system_info
            .set_patch_store(TCP_UDP_ID, INSTALLED_VERSION_KEY, Some("v1"))
            .unwrap();

        let manual = TcpUdpPatch::new(f.context.clone(), f.tag.clone(), f.group.clone());
        let auto = AutoTcpUdpPatch::new(f.context.clone(), f.tag.clone(), f.group.clone());
        assert_eq!(manual.state(), PatchState::Installed);
        assert_eq!(auto.state(), PatchState::NotInstalled);
    }

    #[tokio::test]
    async fn disabled_copy_keeps_auto_shim_installed() {
        let f = fixture();
        place_mod(&f.context, DISABLED_MOD_DIR);
        f.context
            .system_info
            .set_patch_store(AUTO_TCP_UDP_ID, INSTALLED_VERSION_KEY, Some("v1"))
            .unwrap();

        let auto = AutoTcpUdpPatch::new(f.context.clone(), f.tag.clone(), f.group.clone());
        assert_eq!(auto.state(), PatchState::Installed);

        auto.uninstall().await.unwrap();
        assert_eq!(auto.state(), PatchState::NotInstalled);
        assert!(!f.context.client_file(DISABLED_MOD_DIR).exists());
    }

    #[tokio::test]
    async fn explicit_port_enables_shim() {
        let f = fixture();
        place_mod(&f.context, DISABLED_MOD_DIR);
        std::fs::write(
            f.context.client_dir().join("boot.cfg"),
            "SERVERNAME=0:Test,\nAUTHSERVERIP=0:127.0.0.1:2001",
        )
        .unwrap();

        let auto = AutoTcpUdpPatch::new(f.context.clone(), f.tag.clone(), f.group.clone());
        auto.on_client_request_launch().await.unwrap();

        assert!(f.context.client_file(MOD_DIR).join(MOD_FILE).is_file());
        assert!(!f.context.client_file(DISABLED_MOD_DIR).exists());
    }

    #[tokio::test]
    async fn bare_ipv6_host_is_not_read_as_a_port() {
        let f = fixture();
        place_mod(&f.context, DISABLED_MOD_DIR);
        std::fs::write(
            f.context.client_dir().join("boot.cfg"),
            "SERVERNAME=0:Test,\nAUTHSERVERIP=0:::1",
        )
        .unwrap();

        let auto = AutoTcpUdpPatch::new(f.context.clone(), f.tag.clone(), f.group.clone());
        assert!(!auto.server_uses_tcp_udp().await.unwrap());
    }

    #[tokio::test]
    async fn switching_moves_the_shim_and_drops_the_source() {
        let f = fixture();
        place_mod(&f.context, MOD_DIR);
        let enabled = f.context.client_file(MOD_DIR);
        let disabled = f.context.client_file(DISABLED_MOD_DIR);

        AutoTcpUdpPatch::switch_mod_dir(&enabled, &disabled).await.unwrap();
        assert!(disabled.join(MOD_FILE).is_file());
        assert!(!enabled.exists());

        // Nothing to move: the target still exists afterwards.
        AutoTcpUdpPatch::switch_mod_dir(&enabled, &disabled).await.unwrap();
        assert!(disabled.join(MOD_FILE).is_file());
    }

    #[tokio::test]
    async fn pending_tag_reports_loading() {
        let f = fixture();
        let tag = RemoteTag::new("owner/repo");
        assert!(tag.state().is_pending());
        let patch = TcpUdpPatch::new(f.context.clone(), tag, f.group.clone());
        assert_eq!(patch.state(), PatchState::Loading);
    }
}
