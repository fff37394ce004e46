//! Client patches.
//!
//! Every patch derives its own [`PatchState`] from the client files and the
//! patch store. [`ExtendedClientPatch`] wraps a patch for the front end and
//! turns failed operations into extended states instead of errors.

mod dlu_ad;
mod hologram;
mod local_archive;
mod mod_loader;
mod steam;
mod survival_crash;
mod tcp_udp;
mod wine_wayland;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::env::HostEnvironment;
use crate::error::PatchError;
use crate::networking::NetworkClient;
use crate::storage::SystemInfo;

pub use dlu_ad::RemoveDluAdPatch;
pub use hologram::{FixAssemblyVendorHologramPatch, replace_first};
pub(crate) use local_archive::archive_path;
pub use local_archive::{
    LocalArchivePatch, PatchManifest, check_requirements, read_patch_manifest,
};
pub use mod_loader::ModLoaderPatch;
pub use steam::SteamOneClickPatch;
pub use survival_crash::FixAvantGardensSurvivalCrashPatch;
pub use tcp_udp::{AutoTcpUdpPatch, TcpUdpPatch};
pub use wine_wayland::{EnableWineWaylandPatch, FORCE_WAYLAND_KEY, WAYLAND_PATCH_ID};

/// Repository publishing the mod loader and the TCP/UDP shim.
pub const RAKNET_SHIM_REPOSITORY: &str = "lcdr/raknet_shim_dll";
/// Patch store key holding the installed release tag.
pub const INSTALLED_VERSION_KEY: &str = "InstalledVersion";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchState {
    Loading,
    Incompatible,
    NotInstalled,
    Installed,
    UpdateAvailable,
    UpdatesCheckFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtendedPatchState {
    Loading,
    Incompatible,
    NotInstalled,
    Installed,
    UpdateAvailable,
    Installing,
    FailedToInstall,
    Uninstalling,
    FailedToUninstall,
    CheckingForUpdates,
    UpdatesCheckFailed,
    Updating,
    FailedToUpdate,
}

impl From<PatchState> for ExtendedPatchState {
    fn from(state: PatchState) -> Self {
        match state {
            PatchState::Loading => Self::Loading,
            PatchState::Incompatible => Self::Incompatible,
            PatchState::NotInstalled => Self::NotInstalled,
            PatchState::Installed => Self::Installed,
            PatchState::UpdateAvailable => Self::UpdateAvailable,
            PatchState::UpdatesCheckFailed => Self::UpdatesCheckFailed,
        }
    }
}

impl fmt::Display for ExtendedPatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type Listener<T> = Box<dyn Fn(T) + Send + Sync>;

/// Current value plus change listeners.
pub struct Observable<T: Copy + PartialEq> {
    value: Mutex<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Copy + PartialEq + Send + 'static> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> T {
        *self.value.lock()
    }

    /// Store `value` and notify the listeners.
    pub fn set(&self, value: T) {
        *self.value.lock() = value;
        for listener in self.listeners.lock().iter() {
            listener(value);
        }
    }

    /// Like [`Observable::set`], but silent when the value is unchanged.
    pub fn set_if_changed(&self, value: T) {
        if self.get() != value {
            self.set(value);
        }
    }

    pub fn on_changed(&self, listener: impl Fn(T) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_changed(move |value| {
            let _ = tx.send(value);
        });
        rx
    }
}

pub type PatchStatus = Observable<PatchState>;

/// Latest release tag of a remote repository, fetched once in the background.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagState {
    Pending,
    Fetched(String),
    Failed,
}

impl TagState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

pub struct RemoteTag {
    repository: String,
    state: RwLock<TagState>,
}

impl RemoteTag {
    pub fn new(repository: &str) -> Arc<Self> {
        Arc::new(Self {
            repository: repository.to_owned(),
            state: RwLock::new(TagState::Pending),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn state(&self) -> TagState {
        self.state.read().clone()
    }

    pub fn latest(&self) -> Option<String> {
        match &*self.state.read() {
            TagState::Fetched(tag) => Some(tag.clone()),
            _ => None,
        }
    }

    pub fn resolve(&self, tag: &str) {
        *self.state.write() = TagState::Fetched(tag.to_owned());
    }

    pub fn fail(&self) {
        *self.state.write() = TagState::Failed;
    }

    pub async fn fetch(&self, network: &NetworkClient) {
        match network.latest_tag(&self.repository).await {
            Ok(tag) => {
                info!("patch: latest tag of {} is {tag}", self.repository);
                self.resolve(&tag);
            }
            Err(err) => {
                error!("patch: {err}");
                self.fail();
            }
        }
    }

    pub fn asset_url(&self, tag: &str, asset: &str) -> String {
        format!(
            "https://github.com/{}/releases/download/{tag}/{asset}",
            self.repository
        )
    }
}

/// Patches that must never be installed together.
///
/// Membership is decided by the installed-version key each member writes to
/// the patch store, so every member checks the same data.
pub struct ExclusivityGroup {
    system_info: Arc<SystemInfo>,
    members: Vec<&'static str>,
}

impl ExclusivityGroup {
    pub fn new(system_info: Arc<SystemInfo>, members: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            system_info,
            members: members.to_vec(),
        })
    }

    /// Another member that is recorded as installed.
    pub fn active_other(&self, patch: &str) -> Option<&'static str> {
        self.members.iter().copied().find(|member| {
            *member != patch
                && self
                    .system_info
                    .get_patch_store(member, INSTALLED_VERSION_KEY)
                    .is_some()
        })
    }

    pub fn ensure_can_install(&self, patch: &str) -> Result<(), PatchError> {
        match self.active_other(patch) {
            Some(other) => Err(PatchError::Conflict {
                patch: patch.to_owned(),
                other: other.to_owned(),
            }),
            None => Ok(()),
        }
    }
}

/// Shared handles every patch is constructed with.
#[derive(Clone)]
pub struct PatchContext {
    pub system_info: Arc<SystemInfo>,
    pub network: NetworkClient,
    pub host: HostEnvironment,
}

impl PatchContext {
    pub fn new(system_info: Arc<SystemInfo>, network: NetworkClient, host: HostEnvironment) -> Self {
        Self {
            system_info,
            network,
            host,
        }
    }

    pub fn client_dir(&self) -> PathBuf {
        self.system_info.client_dir()
    }

    pub fn client_file(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.client_dir(), |path, part| path.join(part))
    }
}

#[async_trait]
pub trait ClientPatch: Send + Sync {
    /// Stable identifier, also used as the patch store name.
    fn id(&self) -> &str;

    fn name(&self) -> String;

    fn description(&self) -> String;

    fn apply_by_default(&self) -> bool;

    fn status(&self) -> &PatchStatus;

    fn state(&self) -> PatchState {
        self.status().get()
    }

    /// Re-derive the state. Only touches the state.
    async fn refresh(&self) -> Result<(), PatchError>;

    async fn install(&self) -> Result<(), PatchError>;

    async fn uninstall(&self) -> Result<(), PatchError>;

    /// Whether [`ClientPatch::on_client_request_launch`] does anything.
    fn is_pre_launch(&self) -> bool {
        false
    }

    /// Runs after `boot.cfg` is written and before the client starts.
    async fn on_client_request_launch(&self) -> Result<(), PatchError> {
        Ok(())
    }

    /// Present for user supplied archive patches only.
    fn as_archive_patch(&self) -> Option<&LocalArchivePatch> {
        None
    }
}

/// Front end facing wrapper adding in-progress and failure states.
pub struct ExtendedClientPatch {
    patch: Arc<dyn ClientPatch>,
    status: Arc<Observable<ExtendedPatchState>>,
}

impl ExtendedClientPatch {
    pub fn new(patch: Arc<dyn ClientPatch>) -> Self {
        let status = Arc::new(Observable::new(ExtendedPatchState::from(patch.state())));
        let forward = Arc::downgrade(&status);
        patch.status().on_changed(move |state| {
            if let Some(status) = forward.upgrade() {
                status.set_if_changed(state.into());
            }
        });
        Self { patch, status }
    }

    pub fn id(&self) -> &str {
        self.patch.id()
    }

    pub fn name(&self) -> String {
        self.patch.name()
    }

    pub fn description(&self) -> String {
        self.patch.description()
    }

    pub fn apply_by_default(&self) -> bool {
        self.patch.apply_by_default()
    }

    pub fn state(&self) -> ExtendedPatchState {
        self.status.get()
    }

    pub fn patch(&self) -> &Arc<dyn ClientPatch> {
        &self.patch
    }

    pub fn on_changed(&self, listener: impl Fn(ExtendedPatchState) + Send + Sync + 'static) {
        self.status.on_changed(listener);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExtendedPatchState> {
        self.status.subscribe()
    }

    pub async fn refresh(&self) {
        self.status.set_if_changed(ExtendedPatchState::CheckingForUpdates);
        match self.patch.refresh().await {
            Ok(()) => self.status.set_if_changed(self.patch.state().into()),
            Err(err) => {
                error!("patch {}: failed to refresh: {err}", self.id());
                self.status.set_if_changed(ExtendedPatchState::UpdatesCheckFailed);
            }
        }
    }

    pub async fn install(&self) -> Result<(), PatchError> {
        let updating = self.state() == ExtendedPatchState::UpdateAvailable;
        debug!("patch {}: applying", self.id());
        self.status.set_if_changed(if updating {
            ExtendedPatchState::Updating
        } else {
            ExtendedPatchState::Installing
        });
        match self.patch.install().await {
            Ok(()) => {
                info!("patch {}: applied", self.id());
                self.status.set_if_changed(self.patch.state().into());
                Ok(())
            }
            Err(err) => {
                error!("patch {}: failed to install: {err}", self.id());
                self.status.set_if_changed(if updating {
                    ExtendedPatchState::FailedToUpdate
                } else {
                    ExtendedPatchState::FailedToInstall
                });
                Err(err)
            }
        }
    }

    pub async fn uninstall(&self) -> Result<(), PatchError> {
        self.status.set_if_changed(ExtendedPatchState::Uninstalling);
        match self.patch.uninstall().await {
            Ok(()) => {
                info!("patch {}: removed", self.id());
                self.status.set_if_changed(self.patch.state().into());
                Ok(())
            }
            Err(err) => {
                error!("patch {}: failed to remove: {err}", self.id());
                self.status.set_if_changed(ExtendedPatchState::FailedToUninstall);
                Err(err)
            }
        }
    }

    /// Run the pre-launch hook when the patch has one and is in use.
    pub async fn on_client_request_launch(&self) {
        if !self.patch.is_pre_launch() {
            return;
        }
        if matches!(
            self.patch.state(),
            PatchState::Incompatible | PatchState::NotInstalled | PatchState::Loading
        ) {
            return;
        }
        info!("patch {}: running pre-launch action", self.id());
        if let Err(err) = self.patch.on_client_request_launch().await {
            error!("patch {}: pre-launch action failed: {err}", self.id());
        }
    }
}

/// Download-based state derivation shared by the mod loader and shim patches.
pub(crate) fn remote_state(
    tag: &RemoteTag,
    files_present: bool,
    installed_version: Option<String>,
) -> PatchState {
    match tag.state() {
        TagState::Pending => PatchState::Loading,
        _ if !files_present => PatchState::NotInstalled,
        TagState::Failed => PatchState::UpdatesCheckFailed,
        TagState::Fetched(latest) if Some(&latest) != installed_version.as_ref() => {
            PatchState::UpdateAvailable
        }
        TagState::Fetched(_) => PatchState::Installed,
    }
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> Result<(), PatchError> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<(), PatchError> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Move a file, copying when a rename is not possible (across filesystems).
pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<(), PatchError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}

/// Build the default ordered patch set.
pub fn default_patches(
    context: &PatchContext,
    tag: &Arc<RemoteTag>,
) -> Vec<Arc<dyn ClientPatch>> {
    let shim_group = ExclusivityGroup::new(
        context.system_info.clone(),
        &[tcp_udp::AUTO_TCP_UDP_ID, tcp_udp::TCP_UDP_ID],
    );
    vec![
        Arc::new(SteamOneClickPatch::new(context.clone())),
        Arc::new(ModLoaderPatch::new(context.clone(), tag.clone())),
        Arc::new(AutoTcpUdpPatch::new(
            context.clone(),
            tag.clone(),
            shim_group.clone(),
        )),
        Arc::new(TcpUdpPatch::new(context.clone(), tag.clone(), shim_group)),
        Arc::new(FixAssemblyVendorHologramPatch::new(context.clone())),
        Arc::new(FixAvantGardensSurvivalCrashPatch::new(context.clone())),
        Arc::new(RemoveDluAdPatch::new(context.clone())),
        Arc::new(EnableWineWaylandPatch::new(context.clone())),
    ]
}
