//! Ways of running the Windows client on the current host.

mod macos;
mod native;
mod wine;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::process::LaunchCommand;

pub use macos::MacOsWineRuntime;
pub use native::NativeWindowsRuntime;
pub use wine::UserInstalledWineRuntime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    Unsupported,
    ManualInstallRequired,
    NotInstalled,
    Installed,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> RuntimeState;

    /// Install the runtime. Only valid in [`RuntimeState::NotInstalled`].
    async fn install(&self, cancel: Option<Arc<AtomicBool>>) -> Result<(), RuntimeError>;

    /// Command that starts `executable` from `working_dir`.
    fn run_application(
        &self,
        executable: &Path,
        working_dir: &Path,
    ) -> Result<LaunchCommand, RuntimeError>;
}

/// Pick the runtime to use: the first installed one, else the first one that
/// is supported at all.
pub fn select_runtime(runtimes: &[Arc<dyn Runtime>]) -> Option<Arc<dyn Runtime>> {
    runtimes
        .iter()
        .find(|runtime| runtime.state() == RuntimeState::Installed)
        .or_else(|| {
            runtimes
                .iter()
                .find(|runtime| runtime.state() != RuntimeState::Unsupported)
        })
        .cloned()
}
