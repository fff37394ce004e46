use async_trait::async_trait;

use super::{ClientPatch, PatchContext, PatchState, PatchStatus};
use crate::error::PatchError;

const LOCALE_PATH: &str = "locale/locale.xml";
const AD_MARKER: &str = "DLU is coming!";

const REPLACEMENTS: [(&str, &str); 3] = [
    (AD_MARKER, "Build on Nimbus Isle!"),
    (
        "Follow us on Twitter",
        "Get inspired and build on Nimbus Station&apos;s largest Property!",
    ),
    (
        "@darkflameuniv",
        "Look for the launch pad by the water&apos;s edge in Brick Annexe!",
    ),
];

/// Replaces the unreleased "DLU is coming!" loading screen text.
///
/// Once applied the patch reports `Incompatible` so it drops out of view, and
/// it cannot be removed.
pub struct RemoveDluAdPatch {
    context: PatchContext,
    status: PatchStatus,
}

impl RemoveDluAdPatch {
    pub fn new(context: PatchContext) -> Self {
        let patch = Self {
            context,
            status: PatchStatus::new(PatchState::Loading),
        };
        patch.status.set(patch.detect());
        patch
    }

    fn detect(&self) -> PatchState {
        match std::fs::read_to_string(self.context.client_file(LOCALE_PATH)) {
            Ok(locale) if locale.contains(AD_MARKER) => PatchState::NotInstalled,
            _ => PatchState::Incompatible,
        }
    }
}

#[async_trait]
impl ClientPatch for RemoveDluAdPatch {
    fn id(&self) -> &str {
        "RemoveDluAd"
    }

    fn name(&self) -> String {
        "Remove DLU Ad".into()
    }

    fn description(&self) -> String {
        "Replaces the \"DLU is coming!\" loading screen tip.".into()
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
        let path = self.context.client_file(LOCALE_PATH);
        if !path.is_file() {
            return Err(PatchError::Incompatible(self.id().to_owned()));
        }
        let locale = tokio::fs::read_to_string(&path).await?;
        let patched = REPLACEMENTS
            .iter()
            .fold(locale, |text, (from, to)| text.replace(from, to));
        tokio::fs::write(&path, patched).await?;
        self.refresh().await
    }

    async fn uninstall(&self) -> Result<(), PatchError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::context_in;
    use tempfile::TempDir;

    #[tokio::test]
    async fn install_hides_the_patch() {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        let path = context.client_file(LOCALE_PATH);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "<phrase>DLU is coming!</phrase><phrase>Follow us on Twitter</phrase><phrase>@darkflameuniv</phrase>",
        )
        .unwrap();

        let patch = RemoveDluAdPatch::new(context);
        assert_eq!(patch.state(), PatchState::NotInstalled);

        patch.install().await.unwrap();
        assert_eq!(patch.state(), PatchState::Incompatible);
        let locale = std::fs::read_to_string(&path).unwrap();
        assert!(locale.contains("Build on Nimbus Isle!"));
        assert!(locale.contains("Brick Annexe!"));
        assert!(!locale.contains("Twitter"));

        patch.uninstall().await.unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().contains(AD_MARKER));
    }
}
