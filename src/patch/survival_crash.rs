use async_trait::async_trait;

use super::{ClientPatch, PatchContext, PatchState, PatchStatus};
use crate::error::PatchError;

pub(crate) const SCRIPT_PATH: &str = "res/scripts/ai/minigame/survival/l_zone_survival_client.lua";
const BROKEN_CALL: &str = "    PlayerReady(self)";
const FIXED_CALL: &str = "    onPlayerReady(self)";

/// Fixes the Avant Gardens Survival script calling an undefined function for
/// every player except the first.
pub struct FixAvantGardensSurvivalCrashPatch {
    context: PatchContext,
    status: PatchStatus,
}

impl FixAvantGardensSurvivalCrashPatch {
    pub fn new(context: PatchContext) -> Self {
        let patch = Self {
            context,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn detect(&self) -> PatchState {
        match std::fs::read_to_string(self.context.client_file(SCRIPT_PATH)) {
            Err(_) => PatchState::Incompatible,
            Ok(script) if script.contains(BROKEN_CALL) => PatchState::NotInstalled,
            Ok(_) => PatchState::Installed,
        }
    }

    async fn rewrite(&self, from: &str, to: &str) -> Result<(), PatchError> {
        let path = self.context.client_file(SCRIPT_PATH);
        if !path.is_file() {
            return Err(PatchError::Incompatible(self.id().to_owned()));
        }
        let script = tokio::fs::read_to_string(&path).await?;
        tokio::fs::write(&path, script.replace(from, to)).await?;
        Ok(())
    }
}

#[async_trait]
impl ClientPatch for FixAvantGardensSurvivalCrashPatch {
    fn id(&self) -> &str {
        "FixAvantGardensSurvivalCrash"
    }

    fn name(&self) -> String {
        "Fix Avant Gardens Survival Crash".into()
    }

    fn description(&self) -> String {
        "Fixes a mistake in the Avant Gardens Survival script that crashes every player except the first.".into()
    }

    fn apply_by_default(&self) -> bool {
        true
    }

    fn status(&self) -> &PatchStatus {
        &self.status
    }

    async fn refresh(&self) -> Result<(), PatchError> {
        self.status.set(self.detect());
        Ok(())
    }

    async fn install(&self) -> Result<(), PatchError> {
        self.rewrite(BROKEN_CALL, FIXED_CALL).await?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        self.rewrite(FIXED_CALL, BROKEN_CALL).await?;
        self.refresh().await
    }
}
