//! Core of the Nexus LU launcher: client archives, patches, runtimes and the
//! launch lifecycle of a LEGO Universe client.

pub mod archive;
pub mod boot;
pub mod engine;
pub mod env;
pub mod error;
pub mod networking;
pub mod patch;
pub mod process;
pub mod runtime;
pub mod storage;
pub mod util;
pub mod vdf;

pub use engine::ClientState;
pub use engine::models::ServerEntry;
pub use engine::server_list::ServerList;
pub use engine::state::{LauncherProgress, LauncherState, ProgressBarState};
pub use storage::SystemInfo;
