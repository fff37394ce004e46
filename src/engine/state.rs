use std::fmt;

/// Lifecycle of the client installation, as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LauncherState {
    Uninitialized,

    // Manual runtime requirement.
    ManualRuntimeNotInstalled,

    // Client extracting.
    PendingExtractSelection,
    CheckingSignature,
    ExtractingClient,
    VerifyingClient,
    ExtractFailed,
    VerifyFailed,
    PatchingClient,
    MovingClient,
    Cancelling,

    // Automated runtime.
    RuntimeNotInstalled,
    InstallingRuntime,

    // Ready to play.
    NoSelectedServer,
    ReadyToLaunch,
    Launching,
    Launched,
    LaunchFailed,
}

impl LauncherState {
    /// States where a long running operation owns the launcher.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::CheckingSignature
                | Self::ExtractingClient
                | Self::VerifyingClient
                | Self::PatchingClient
                | Self::MovingClient
                | Self::Cancelling
                | Self::InstallingRuntime
                | Self::Launching
        )
    }

    /// Whether an archive may be extracted from this state.
    pub fn accepts_archive(self) -> bool {
        matches!(
            self,
            Self::PendingExtractSelection
                | Self::ExtractFailed
                | Self::VerifyFailed
                | Self::RuntimeNotInstalled
                | Self::NoSelectedServer
                | Self::ReadyToLaunch
                | Self::Launched
                | Self::LaunchFailed
        )
    }
}

impl fmt::Display for LauncherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressBarState {
    /// No fill.
    #[default]
    Inactive,
    PercentFill,
    /// Animated without a specific amount.
    Progressing,
}

/// Snapshot published on every launcher change.
#[derive(Clone, Debug, PartialEq)]
pub struct LauncherProgress {
    pub launcher_state: LauncherState,
    pub progress_bar_state: ProgressBarState,
    pub progress_bar_fill: Option<f32>,
    pub additional_data: Option<String>,
}

impl LauncherProgress {
    pub fn new(launcher_state: LauncherState) -> Self {
        Self {
            launcher_state,
            progress_bar_state: ProgressBarState::Inactive,
            progress_bar_fill: None,
            additional_data: None,
        }
    }

    pub fn progressing(launcher_state: LauncherState) -> Self {
        Self {
            progress_bar_state: ProgressBarState::Progressing,
            ..Self::new(launcher_state)
        }
    }

    pub fn fill(launcher_state: LauncherState, fill: f32) -> Self {
        Self {
            progress_bar_state: ProgressBarState::PercentFill,
            progress_bar_fill: Some(fill.clamp(0.0, 1.0)),
            ..Self::new(launcher_state)
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.additional_data = Some(data.into());
        self
    }
}

impl Default for LauncherProgress {
    fn default() -> Self {
        Self::new(LauncherState::Uninitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_progress_snapshots() {
        let fill = LauncherProgress::fill(LauncherState::ExtractingClient, 1.5);
        assert_eq!(fill.progress_bar_state, ProgressBarState::PercentFill);
        assert_eq!(fill.progress_bar_fill, Some(1.0));

        let failed = LauncherProgress::new(LauncherState::ExtractFailed).with_data("InvalidArchive");
        assert_eq!(failed.progress_bar_state, ProgressBarState::Inactive);
        assert_eq!(failed.additional_data.as_deref(), Some("InvalidArchive"));
    }

    #[test]
    fn busy_states_do_not_accept_archives() {
        for state in [
            LauncherState::ExtractingClient,
            LauncherState::Launching,
            LauncherState::InstallingRuntime,
        ] {
            assert!(state.is_busy());
            assert!(!state.accepts_archive());
        }
        assert!(LauncherState::VerifyFailed.accepts_archive());
        assert_eq!(LauncherState::ReadyToLaunch.to_string(), "ReadyToLaunch");
    }
}
