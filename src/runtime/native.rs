use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use log::info;

use super::{Runtime, RuntimeState};
use crate::env::HostEnvironment;
use crate::error::RuntimeError;
use crate::process::LaunchCommand;

pub struct NativeWindowsRuntime {
    host: HostEnvironment,
}

impl NativeWindowsRuntime {
    pub fn new(host: HostEnvironment) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Runtime for NativeWindowsRuntime {
    fn name(&self) -> &'static str {
        "NativeWindows"
    }

    fn state(&self) -> RuntimeState {
        if self.host.is_windows() {
            RuntimeState::Installed
        } else {
            RuntimeState::Unsupported
        }
    }

    async fn install(&self, _cancel: Option<Arc<AtomicBool>>) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported(self.name().to_owned()))
    }

    fn run_application(
        &self,
        executable: &Path,
        working_dir: &Path,
    ) -> Result<LaunchCommand, RuntimeError> {
        if self.state() != RuntimeState::Installed {
            return Err(RuntimeError::NotInstalled);
        }
        info!("runtime: starting natively on Windows");
        Ok(LaunchCommand::new(executable, working_dir))
    }
}
