//! Client lifecycle: extraction, runtime setup, patching and launching.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::archive::{ClientArchive, ExtractError};
use crate::boot::LegoDataDictionary;
use crate::env::{self, CLIENT_EXECUTABLE, HostEnvironment};
use crate::error::{ClientError, PatchError};
use crate::networking::NetworkClient;
use crate::patch::{
    self, ClientPatch, ExtendedClientPatch, ExtendedPatchState, LocalArchivePatch, PatchContext,
    RAKNET_SHIM_REPOSITORY, RemoteTag, check_requirements, read_patch_manifest,
};
use crate::process::LaunchedClient;
use crate::runtime::{
    MacOsWineRuntime, NativeWindowsRuntime, Runtime, RuntimeState, UserInstalledWineRuntime,
    select_runtime,
};
use crate::storage::SystemInfo;
use crate::util::move_dir;

use self::models::ServerEntry;
use self::server_list::ServerList;
use self::state::{LauncherProgress, LauncherState};

pub mod models;
pub mod server_list;
pub mod state;

/// SHA-256 digests of the client archives known to be unmodified.
pub const KNOWN_GOOD_SIGNATURES: [&str; 4] = [
    // Packed client, rar.
    "8f6c7e84eca3bab93232132a88c4ae6f8367227d7eafeaa0ef9c40e86c14edf5",
    // Packed client with extra locales, rar.
    "c1531bf9401426042e8bab2de04ba1b723042dc01d9907c2635033d417de9e05",
    // Unpacked client with extra locales, rar.
    "0d862f71eedcadc4494c4358261669721b40b2131101cbd6ef476c5a6ec6775b",
    // Unpacked client, zip. Ships the ad removed by `RemoveDluAd`.
    "f0a67205f82165c27c673b5ba9472536d48a3697ae016889ab891b68922947ef",
];

const BOOT_CONFIG: &str = "boot.cfg";
const BOOT_BACKUP: &str = "boot_backup.cfg";

type ProgressListener = Arc<dyn Fn(&LauncherProgress) + Send + Sync>;

/// Clears the in-flight flag when an operation ends.
struct OperationGuard<'a>(&'a AtomicBool);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the [`LauncherState`] and runs one operation at a time.
pub struct ClientState {
    system_info: Arc<SystemInfo>,
    server_list: Arc<ServerList>,
    context: PatchContext,
    tag: Arc<RemoteTag>,
    runtimes: Vec<Arc<dyn Runtime>>,
    patches: RwLock<Vec<Arc<ExtendedClientPatch>>>,
    progress: Mutex<LauncherProgress>,
    listeners: Mutex<Vec<ProgressListener>>,
    busy: AtomicBool,
    cancel_flag: Arc<AtomicBool>,
}

impl ClientState {
    /// Build the launcher for the current host with the default patches and runtimes.
    pub fn new(system_info: Arc<SystemInfo>) -> Arc<Self> {
        let host = HostEnvironment::current();
        let network = NetworkClient::new();
        let runtimes: Vec<Arc<dyn Runtime>> = vec![
            Arc::new(NativeWindowsRuntime::new(host.clone())),
            Arc::new(MacOsWineRuntime::new(
                system_info.clone(),
                host.clone(),
                network.clone(),
            )),
            Arc::new(UserInstalledWineRuntime::new(system_info.clone(), host.clone())),
        ];
        let context = PatchContext::new(system_info, network, host);
        let tag = RemoteTag::new(RAKNET_SHIM_REPOSITORY);
        let patches = patch::default_patches(&context, &tag);
        Self::with_parts(context, tag, runtimes, patches)
    }

    /// Build the launcher from explicit parts. Archive patches recorded in the
    /// settings are appended after `patches`.
    pub fn with_parts(
        context: PatchContext,
        tag: Arc<RemoteTag>,
        runtimes: Vec<Arc<dyn Runtime>>,
        patches: Vec<Arc<dyn ClientPatch>>,
    ) -> Arc<Self> {
        let system_info = context.system_info.clone();
        let server_list = Arc::new(ServerList::new(system_info.clone()));

        let mut extended: Vec<Arc<ExtendedClientPatch>> = patches
            .into_iter()
            .map(|patch| Arc::new(ExtendedClientPatch::new(patch)))
            .collect();
        let archive_names: Vec<String> = system_info.read(|s| {
            s.archive_patches
                .iter()
                .map(|patch| patch.archive_name.clone())
                .collect()
        });
        for name in archive_names {
            let patch = LocalArchivePatch::new(context.clone(), server_list.clone(), &name);
            extended.push(Arc::new(ExtendedClientPatch::new(Arc::new(patch))));
        }

        let state = Arc::new(Self {
            system_info,
            server_list,
            context,
            tag,
            runtimes,
            patches: RwLock::new(extended),
            progress: Mutex::new(LauncherProgress::default()),
            listeners: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        let weak = Arc::downgrade(&state);
        state.server_list.on_changed(move || {
            if let Some(state) = weak.upgrade() {
                state.on_server_list_changed();
            }
        });
        state.initialize();
        state
    }

    pub fn system_info(&self) -> &Arc<SystemInfo> {
        &self.system_info
    }

    pub fn server_list(&self) -> &Arc<ServerList> {
        &self.server_list
    }

    pub fn runtimes(&self) -> &[Arc<dyn Runtime>] {
        &self.runtimes
    }

    /// Runtime used to start the client, if the host supports one.
    pub fn runtime(&self) -> Option<Arc<dyn Runtime>> {
        select_runtime(&self.runtimes)
    }

    pub fn patches(&self) -> Vec<Arc<ExtendedClientPatch>> {
        self.patches.read().clone()
    }

    pub fn patch(&self, id: &str) -> Option<Arc<ExtendedClientPatch>> {
        self.patches.read().iter().find(|patch| patch.id() == id).cloned()
    }

    pub fn progress(&self) -> LauncherProgress {
        self.progress.lock().clone()
    }

    pub fn launcher_state(&self) -> LauncherState {
        self.progress.lock().launcher_state
    }

    /// Run `listener` with every published progress snapshot.
    pub fn on_progress(&self, listener: impl Fn(&LauncherProgress) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LauncherProgress> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_progress(move |progress| {
            let _ = tx.send(progress.clone());
        });
        rx
    }

    fn set_progress(&self, progress: LauncherProgress) {
        let previous = std::mem::replace(&mut *self.progress.lock(), progress.clone());
        if previous.launcher_state != progress.launcher_state {
            debug!(
                "client: {} -> {}",
                previous.launcher_state, progress.launcher_state
            );
        }
        // Listeners run unlocked so they may register more listeners.
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(&progress);
        }
    }

    fn on_server_list_changed(&self) {
        let current = self.launcher_state();
        if !matches!(
            current,
            LauncherState::NoSelectedServer | LauncherState::ReadyToLaunch
        ) {
            return;
        }
        let next = if self.server_list.selected_entry().is_some() {
            LauncherState::ReadyToLaunch
        } else {
            LauncherState::NoSelectedServer
        };
        self.set_progress(LauncherProgress::new(next));
    }

    /// Derive the state from the runtime, the client files and the server list.
    pub fn initialize(&self) {
        let runtime = self.runtime();
        let runtime_name = runtime.as_ref().map_or("Unsupported", |r| r.name());
        let runtime_state = runtime.as_ref().map(|r| r.state());
        let client_present =
            env::client_executable(&self.system_info.client_parent()).is_file();

        let progress = match runtime_state {
            None | Some(RuntimeState::ManualInstallRequired) => {
                LauncherProgress::new(LauncherState::ManualRuntimeNotInstalled)
                    .with_data(runtime_name)
            }
            _ if !client_present => LauncherProgress::new(LauncherState::PendingExtractSelection),
            Some(RuntimeState::NotInstalled) => {
                LauncherProgress::new(LauncherState::RuntimeNotInstalled).with_data(runtime_name)
            }
            _ if self.server_list.selected_entry().is_none() => {
                LauncherProgress::new(LauncherState::NoSelectedServer)
            }
            _ => LauncherProgress::new(LauncherState::ReadyToLaunch),
        };
        self.set_progress(progress);
    }

    /// Fetch the latest release tag, then refresh every patch.
    pub fn start_update_checks(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            state.tag.fetch(&state.context.network).await;
            for patch in state.patches() {
                patch.refresh().await;
            }
        })
    }

    fn begin_operation(&self) -> Result<OperationGuard<'_>, ClientError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(
                "client: rejecting request while {} is running",
                self.launcher_state()
            );
            return Err(ClientError::OperationInProgress);
        }
        self.cancel_flag.store(false, Ordering::SeqCst);
        Ok(OperationGuard(&self.busy))
    }

    /// Whether quitting now would interrupt an operation.
    pub fn has_operation_in_progress(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Ask the running extraction or runtime install to stop.
    pub fn cancel(&self) {
        if !self.has_operation_in_progress() {
            return;
        }
        warn!("client: cancellation requested");
        self.cancel_flag.store(true, Ordering::SeqCst);
        if matches!(
            self.launcher_state(),
            LauncherState::ExtractingClient
                | LauncherState::VerifyingClient
                | LauncherState::InstallingRuntime
                | LauncherState::PatchingClient
        ) {
            self.set_progress(LauncherProgress::progressing(LauncherState::Cancelling));
        }
    }

    fn cancel_requested(&self) -> bool {
        let value = self.cancel_flag.load(Ordering::SeqCst);
        if value {
            debug!("client: cancel flag observed set");
        }
        value
    }

    /// Hash `archive` and compare it with [`KNOWN_GOOD_SIGNATURES`].
    pub async fn check_signature(&self, archive: &Path) -> Result<bool, ClientError> {
        let _guard = self.begin_operation()?;
        info!("client: checking signature of {}", archive.display());
        let previous = self.progress();
        self.set_progress(LauncherProgress::progressing(LauncherState::CheckingSignature));

        let path = archive.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| ClientError::Other(format!("signature check panicked: {e}")));
        self.set_progress(previous);

        let digest = digest??;
        info!("client: signature is {digest}");
        let known = KNOWN_GOOD_SIGNATURES.contains(&digest.as_str());
        if !known {
            warn!("client: signature is not known");
        }
        Ok(known)
    }

    /// Extract and verify a client archive, then prepare the runtime and the
    /// default patches.
    ///
    /// Failures end in [`LauncherState::ExtractFailed`] or
    /// [`LauncherState::VerifyFailed`]; only contract violations are errors.
    pub async fn extract(self: &Arc<Self>, archive_path: &Path) -> Result<(), ClientError> {
        let _guard = self.begin_operation()?;
        let current = self.launcher_state();
        if !current.accepts_archive() {
            return Err(ClientError::InvalidState(current.to_string()));
        }

        info!("client: extracting client from {}", archive_path.display());
        self.set_progress(LauncherProgress::progressing(LauncherState::ExtractingClient));
        let path = archive_path.to_path_buf();
        let archive = match tokio::task::spawn_blocking(move || ClientArchive::open(&path)).await {
            Ok(Some(archive)) => Arc::new(archive),
            Ok(None) => {
                error!(
                    "client: {} is not a supported archive or does not contain {CLIENT_EXECUTABLE}",
                    archive_path.display()
                );
                self.set_progress(
                    LauncherProgress::new(LauncherState::ExtractFailed).with_data("InvalidArchive"),
                );
                return Ok(());
            }
            Err(err) => {
                error!("client: opening the archive panicked: {err}");
                self.set_progress(
                    LauncherProgress::new(LauncherState::ExtractFailed).with_data("InvalidArchive"),
                );
                return Ok(());
            }
        };

        info!(
            "client: extracting {} files with the {} reader",
            archive.file_count(),
            archive.format_name()
        );
        let target = self.system_info.client_parent();
        let extracted = {
            let archive = archive.clone();
            let target = target.clone();
            let cancel = self.cancel_flag.clone();
            let state = Arc::clone(self);
            tokio::task::spawn_blocking(move || {
                archive.extract_to(&target, Some(cancel), |fill| {
                    if state.launcher_state() == LauncherState::ExtractingClient {
                        state.set_progress(LauncherProgress::fill(
                            LauncherState::ExtractingClient,
                            fill,
                        ));
                    }
                })
            })
            .await
            .unwrap_or_else(|e| Err(ExtractError::Archive(format!("extraction panicked: {e}"))))
        };
        if let Err(err) = extracted {
            error!("client: extraction failed: {err}");
            self.set_progress(LauncherProgress::new(LauncherState::ExtractFailed).with_data(err.tag()));
            return Ok(());
        }

        info!("client: verifying client");
        self.set_progress(LauncherProgress::progressing(LauncherState::VerifyingClient));
        let verified = {
            let archive = archive.clone();
            let target = target.clone();
            tokio::task::spawn_blocking(move || archive.verify(&target))
                .await
                .unwrap_or(false)
        };
        if !verified {
            self.set_progress(LauncherProgress::new(LauncherState::VerifyFailed));
            return Ok(());
        }
        if self.cancel_requested() {
            self.set_progress(LauncherProgress::new(LauncherState::ExtractFailed).with_data("Cancelled"));
            return Ok(());
        }

        if let Some(runtime) = self.runtime()
            && runtime.state() == RuntimeState::NotInstalled
        {
            self.install_runtime(&runtime).await;
        }

        if !self.cancel_requested() {
            self.apply_default_patches().await;
        }

        self.initialize();
        info!("client: client is now {}", self.launcher_state());
        Ok(())
    }

    async fn install_runtime(&self, runtime: &Arc<dyn Runtime>) -> bool {
        info!("client: installing runtime {}", runtime.name());
        self.set_progress(
            LauncherProgress::progressing(LauncherState::InstallingRuntime).with_data(runtime.name()),
        );
        match runtime.install(Some(self.cancel_flag.clone())).await {
            Ok(()) => {
                info!("client: installed runtime {}", runtime.name());
                true
            }
            Err(err) => {
                error!("client: failed to install runtime {}: {err}", runtime.name());
                false
            }
        }
    }

    async fn apply_default_patches(&self) {
        info!("client: applying default patches");
        self.set_progress(LauncherProgress::progressing(LauncherState::PatchingClient));
        for patch in self.patches() {
            patch.refresh().await;
            if !patch.apply_by_default() {
                debug!("client: patch {} is not applied by default", patch.id());
                continue;
            }
            if patch.state() != ExtendedPatchState::NotInstalled {
                debug!("client: patch {} is ignored while {}", patch.id(), patch.state());
                continue;
            }
            if patch.install().await.is_err() {
                warn!("client: continuing without patch {}", patch.id());
            }
        }
    }

    /// Move every client directory to `destination` and make it the new parent.
    pub async fn move_client_parent(&self, destination: &Path) -> Result<(), ClientError> {
        let _guard = self.begin_operation()?;
        self.set_progress(LauncherProgress::progressing(LauncherState::MovingClient));
        let existing = self.system_info.client_parent();
        let moved = self.move_clients(&existing, destination).await;
        if let Err(err) = &moved {
            error!("client: failed to move clients: {err}");
        }

        for patch in self.patches() {
            patch.refresh().await;
        }
        self.initialize();
        moved
    }

    async fn move_clients(&self, from: &Path, to: &Path) -> Result<(), ClientError> {
        tokio::fs::create_dir_all(to).await?;
        self.system_info
            .update(|s| s.client_parent_location = Some(to.to_path_buf()));
        self.system_info.save().map_err(ClientError::Other)?;
        if from == to {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let source = entry.path();
            if !source.join(CLIENT_EXECUTABLE).is_file() || to.starts_with(&source) {
                continue;
            }
            let target = to.join(entry.file_name());
            info!(
                "client: moving {} to {}",
                source.display(),
                target.display()
            );
            tokio::task::spawn_blocking(move || move_dir(&source, &target))
                .await
                .map_err(|e| ClientError::Other(format!("moving client panicked: {e}")))??;
        }
        Ok(())
    }

    /// Register a user supplied patch archive.
    pub async fn add_archive_patch(
        &self,
        archive: &Path,
    ) -> Result<Arc<ExtendedClientPatch>, ClientError> {
        let path = archive.to_path_buf();
        let record = tokio::task::spawn_blocking(move || read_patch_manifest(&path))
            .await
            .map_err(|e| ClientError::Other(format!("reading patch archive panicked: {e}")))??;
        let archive_name = record.archive_name.clone();
        let exists = self.system_info.read(|s| {
            s.archive_patches
                .iter()
                .any(|patch| patch.archive_name == archive_name)
        });
        if exists {
            error!("client: patch archive {archive_name} already exists");
            return Err(PatchError::AlreadyExists(archive_name).into());
        }
        check_requirements(
            record.requirements.as_deref(),
            &self.system_info.client_dir(),
        )?;

        let destination = patch::archive_path(&self.context, &archive_name);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(archive, &destination).await?;
        self.system_info.update(|s| s.archive_patches.push(record));
        self.system_info.save().map_err(ClientError::Other)?;

        let patch = LocalArchivePatch::new(
            self.context.clone(),
            self.server_list.clone(),
            &archive_name,
        );
        let extended = Arc::new(ExtendedClientPatch::new(Arc::new(patch)));
        self.patches.write().push(extended.clone());
        info!("client: added patch archive {archive_name}");
        Ok(extended)
    }

    /// Forget a patch archive and delete its stored copy.
    pub async fn remove_archive_patch(&self, archive_name: &str) -> Result<(), ClientError> {
        let patch = self
            .patches()
            .into_iter()
            .find(|patch| {
                patch
                    .patch()
                    .as_archive_patch()
                    .is_some_and(|archive| archive.archive_name() == archive_name)
            })
            .ok_or_else(|| ClientError::Other(format!("no patch archive named {archive_name}")))?;
        if let Some(archive) = patch.patch().as_archive_patch() {
            archive.remove().await?;
        }
        self.patches.write().retain(|other| !Arc::ptr_eq(other, &patch));
        info!("client: removed patch archive {archive_name}");
        Ok(())
    }

    /// Write `boot.cfg`, run the pre-launch patches and start the client.
    ///
    /// `server` defaults to the selected entry. Returns `None` when the
    /// launch failed; the reason is published as the launcher state.
    pub async fn launch(
        &self,
        server: Option<ServerEntry>,
    ) -> Result<Option<LaunchedClient>, ClientError> {
        let _guard = self.begin_operation()?;
        let current = self.launcher_state();
        if !matches!(
            current,
            LauncherState::ReadyToLaunch
                | LauncherState::RuntimeNotInstalled
                | LauncherState::NoSelectedServer
                | LauncherState::LaunchFailed
        ) {
            return Err(ClientError::InvalidState(current.to_string()));
        }
        let Some(server) = server.or_else(|| self.server_list.selected_entry()) else {
            return Err(ClientError::InvalidState(
                LauncherState::NoSelectedServer.to_string(),
            ));
        };

        let Some(runtime) = self.runtime() else {
            error!("client: no runtime supports this system");
            self.set_progress(LauncherProgress::new(LauncherState::LaunchFailed).with_data("NoRuntime"));
            return Ok(None);
        };
        match runtime.state() {
            RuntimeState::Installed => {}
            RuntimeState::NotInstalled => {
                if !self.install_runtime(&runtime).await {
                    self.initialize();
                    return Ok(None);
                }
            }
            _ => {
                self.set_progress(
                    LauncherProgress::new(LauncherState::ManualRuntimeNotInstalled)
                        .with_data(runtime.name()),
                );
                return Ok(None);
            }
        }

        self.set_progress(LauncherProgress::progressing(LauncherState::Launching));
        if let Err(err) = self.write_boot_config(&server).await {
            error!("client: {err}");
            self.set_progress(LauncherProgress::new(LauncherState::LaunchFailed).with_data("BootConfig"));
            return Ok(None);
        }

        info!("client: running pre-launch patches");
        for patch in self.patches() {
            patch.on_client_request_launch().await;
        }

        info!(
            "client: launching with {} ({})",
            server.server_name, server.server_address
        );
        let client_dir = self.system_info.client_dir();
        let launched = runtime
            .run_application(&client_dir.join(CLIENT_EXECUTABLE), &client_dir)
            .map_err(|e| e.to_string())
            .and_then(|command| command.spawn(self.system_info.logs_enabled()));
        match launched {
            Ok(client) => {
                self.set_progress(LauncherProgress::new(LauncherState::Launched));
                Ok(Some(client))
            }
            Err(err) => {
                error!("client: launching the client failed: {err}");
                self.set_progress(
                    LauncherProgress::new(LauncherState::LaunchFailed).with_data("ProcessStart"),
                );
                Ok(None)
            }
        }
    }

    /// Wait for a launched client to exit, then re-derive the state.
    pub async fn wait_for_exit(&self, client: &mut LaunchedClient) -> io::Result<()> {
        let status = client.wait().await;
        match &status {
            Ok(status) => info!("client: process exited with {status}"),
            Err(err) => error!("client: failed to wait for the process: {err}"),
        }
        self.initialize();
        status.map(|_| ())
    }

    async fn write_boot_config(&self, server: &ServerEntry) -> Result<(), String> {
        let client_dir = self.system_info.client_dir();
        let boot_path = client_dir.join(BOOT_CONFIG);
        let mut boot = match LegoDataDictionary::from_file(&boot_path).await {
            Ok(boot) => boot,
            Err(err) => {
                warn!("client: {err}; falling back to {BOOT_BACKUP}");
                LegoDataDictionary::from_file(&client_dir.join(BOOT_BACKUP)).await?
            }
        };
        boot.set("SERVERNAME", server.server_name.as_str());
        boot.set("AUTHSERVERIP", server.server_address.as_str());
        boot.set("LOCALE", self.system_info.locale());
        tokio::fs::write(&boot_path, boot.to_string())
            .await
            .map_err(|e| format!("failed to write {}: {e}", boot_path.display()))
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::process::LaunchCommand;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct TestRuntime(RuntimeState);

    #[async_trait]
    impl Runtime for TestRuntime {
        fn name(&self) -> &'static str {
            "TestRuntime"
        }

        fn state(&self) -> RuntimeState {
            self.0
        }

        async fn install(
            &self,
            _cancel: Option<Arc<AtomicBool>>,
        ) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }

        fn run_application(
            &self,
            _executable: &Path,
            working_dir: &Path,
        ) -> Result<LaunchCommand, crate::error::RuntimeError> {
            Ok(LaunchCommand::new(
                working_dir.join("no-such-client-binary"),
                working_dir,
            ))
        }
    }

    fn state_in(dir: &TempDir, runtime: RuntimeState) -> Arc<ClientState> {
        let info = Arc::new(SystemInfo::load(dir.path().join("launcher.json")));
        let context = PatchContext::new(info, NetworkClient::new(), HostEnvironment::default());
        ClientState::with_parts(
            context,
            RemoteTag::new("owner/repo"),
            vec![Arc::new(TestRuntime(runtime))],
            Vec::new(),
        )
    }

    fn install_client(state: &ClientState, boot: &str) -> PathBuf {
        let client = state.system_info().client_dir();
        std::fs::create_dir_all(&client).unwrap();
        std::fs::write(client.join(CLIENT_EXECUTABLE), b"exe").unwrap();
        std::fs::write(client.join(BOOT_CONFIG), boot).unwrap();
        client
    }

    #[test]
    fn missing_client_waits_for_archive() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        state
            .server_list()
            .add_entry(ServerEntry::new("A", "1.2.3.4"))
            .unwrap();
        state.initialize();
        assert_eq!(state.launcher_state(), LauncherState::PendingExtractSelection);
    }

    #[test]
    fn manual_runtime_takes_priority() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::ManualInstallRequired);
        let progress = state.progress();
        assert_eq!(progress.launcher_state, LauncherState::ManualRuntimeNotInstalled);
        assert_eq!(progress.additional_data.as_deref(), Some("TestRuntime"));
    }

    #[test]
    fn server_selection_toggles_ready_state() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        install_client(&state, "");
        state.initialize();
        assert_eq!(state.launcher_state(), LauncherState::NoSelectedServer);

        state
            .server_list()
            .add_entry(ServerEntry::new("A", "1.2.3.4"))
            .unwrap();
        assert_eq!(state.launcher_state(), LauncherState::ReadyToLaunch);

        state.server_list().remove_entry("A").unwrap();
        assert_eq!(state.launcher_state(), LauncherState::NoSelectedServer);
    }

    #[tokio::test]
    async fn extracts_and_verifies_client() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        let archive = dir.path().join("client.zip");
        write_zip(
            &archive,
            &[
                ("LEGO Universe/", ""),
                ("LEGO Universe/legouniverse.exe", "exe"),
                ("LEGO Universe/boot.cfg", "SERVERNAME=0:Overbuild"),
                ("readme.txt", "ignored"),
            ],
        );
        let mut updates = state.subscribe();

        state.extract(&archive).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(progress) = updates.try_recv() {
            seen.push(progress.launcher_state);
        }
        assert!(seen.contains(&LauncherState::ExtractingClient));
        assert!(seen.contains(&LauncherState::VerifyingClient));
        assert!(seen.contains(&LauncherState::PatchingClient));
        assert_eq!(state.launcher_state(), LauncherState::NoSelectedServer);
        assert!(state.system_info().client_dir().join("boot.cfg").is_file());
        assert!(!dir.path().join("readme.txt").exists());
        assert!(!state.has_operation_in_progress());
    }

    #[tokio::test]
    async fn rejects_archive_without_client() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        let archive = dir.path().join("other.zip");
        write_zip(&archive, &[("game.exe", "exe")]);

        state.extract(&archive).await.unwrap();
        let progress = state.progress();
        assert_eq!(progress.launcher_state, LauncherState::ExtractFailed);
        assert_eq!(progress.additional_data.as_deref(), Some("InvalidArchive"));
    }

    #[test]
    fn listeners_may_call_back_into_the_state() {
        use std::sync::atomic::AtomicUsize;

        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&state);
        let counter = calls.clone();
        state.on_progress(move |_| {
            if let Some(state) = weak.upgrade() {
                let _ = state.launcher_state();
                let _ = state.subscribe();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        state.initialize();
        state.initialize();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn second_operation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        let guard = state.begin_operation().unwrap();
        assert!(state.has_operation_in_progress());
        assert!(matches!(
            state.begin_operation(),
            Err(ClientError::OperationInProgress)
        ));
        drop(guard);
        assert!(!state.has_operation_in_progress());
    }

    #[tokio::test]
    async fn launch_writes_boot_config_from_backup() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        let client = install_client(&state, "not a boot file");
        std::fs::write(
            client.join(BOOT_BACKUP),
            "SERVERNAME=0:Overbuild,AUTHSERVERIP=0:localhost,PATCHSERVERPORT=1:80",
        )
        .unwrap();
        state.initialize();
        state
            .server_list()
            .add_entry(ServerEntry::new("Local", "10.0.0.2:2001"))
            .unwrap();
        assert_eq!(state.launcher_state(), LauncherState::ReadyToLaunch);

        // The test runtime points at a missing binary, so starting fails.
        let launched = state.launch(None).await.unwrap();
        assert!(launched.is_none());
        let progress = state.progress();
        assert_eq!(progress.launcher_state, LauncherState::LaunchFailed);
        assert_eq!(progress.additional_data.as_deref(), Some("ProcessStart"));

        let boot: LegoDataDictionary = std::fs::read_to_string(client.join(BOOT_CONFIG))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(boot.get_str("SERVERNAME"), Some("Local"));
        assert_eq!(boot.get_str("AUTHSERVERIP"), Some("10.0.0.2:2001"));
        assert_eq!(boot.get_str("LOCALE"), Some("en_US"));
        assert!(boot.get("PATCHSERVERPORT").is_some());
    }

    #[tokio::test]
    async fn launch_is_rejected_before_extraction() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        assert!(matches!(
            state.launch(Some(ServerEntry::new("A", "1.2.3.4"))).await,
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn signature_of_unknown_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        let archive = dir.path().join("abc.bin");
        std::fs::write(&archive, b"abc").unwrap();

        assert_eq!(
            sha256_file(&archive).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(!state.check_signature(&archive).await.unwrap());
        assert_eq!(state.launcher_state(), LauncherState::PendingExtractSelection);
    }

    #[tokio::test]
    async fn moves_clients_to_new_parent() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        install_client(&state, "");
        let destination = dir.path().join("elsewhere");

        state.move_client_parent(&destination).await.unwrap();

        assert_eq!(state.system_info().client_parent(), destination);
        assert!(destination.join("Client").join(CLIENT_EXECUTABLE).is_file());
        assert!(!dir.path().join("Client").exists());
        assert_eq!(state.launcher_state(), LauncherState::NoSelectedServer);
    }

    #[tokio::test]
    async fn adds_and_removes_archive_patches() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, RuntimeState::Installed);
        install_client(&state, "");
        let archive = dir.path().join("music.zip");
        write_zip(
            &archive,
            &[
                (
                    "patch.json",
                    r#"{"name":{"en_US":"Music"},"description":{"en_US":"New music"}}"#,
                ),
                ("audio/theme.fev", "music"),
            ],
        );

        let patch = state.add_archive_patch(&archive).await.unwrap();
        assert_eq!(patch.name(), "Music");
        assert_eq!(patch.state(), ExtendedPatchState::NotInstalled);
        assert!(state.patch("music.zip").is_some());
        assert!(matches!(
            state.add_archive_patch(&archive).await,
            Err(ClientError::Patch(PatchError::AlreadyExists(_)))
        ));

        state.remove_archive_patch("music.zip").await.unwrap();
        assert!(state.patch("music.zip").is_none());
        assert!(state.system_info().read(|s| s.archive_patches.is_empty()));
        assert_eq!(patch.state(), ExtendedPatchState::Incompatible);
    }
}
