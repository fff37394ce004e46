use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use nlul_launcher::engine::state::ProgressBarState;
use nlul_launcher::runtime::RuntimeState;
use nlul_launcher::{ClientState, LauncherState, ServerEntry, SystemInfo};

#[derive(Parser, Debug)]
#[command(
    name = "Nexus LU Launcher",
    author,
    version,
    about = "Launcher for LEGO Universe community servers"
)]
struct Cli {
    /// Use this settings file instead of the default `launcher.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the launcher, runtime and server state.
    Status,
    /// Extract a client archive (.zip or .rar).
    Extract {
        archive: PathBuf,
        /// Skip the check against known client archives.
        #[arg(long)]
        skip_signature: bool,
    },
    /// Check an archive against the known client archives.
    VerifySignature { archive: PathBuf },
    /// Launch the client.
    Launch {
        /// Server to use instead of the selected one.
        #[arg(long)]
        server: Option<String>,
    },
    #[command(subcommand)]
    Servers(ServerCommand),
    #[command(subcommand)]
    Patches(PatchCommand),
    /// Move the clients to another parent directory.
    MoveClient { destination: PathBuf },
    /// Show the client output when launching.
    Logs {
        #[arg(value_parser = ["on", "off"])]
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    List,
    Add { name: String, address: String },
    Remove { name: String },
    Select { name: String },
}

#[derive(Subcommand, Debug)]
enum PatchCommand {
    List,
    Install { id: String },
    Uninstall { id: String },
    /// Add a patch archive containing a `patch.json`.
    AddArchive { archive: PathBuf },
    RemoveArchive { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let system_info = Arc::new(match &cli.settings {
        Some(path) => SystemInfo::load(path),
        None => SystemInfo::load_default(),
    });
    let state = ClientState::new(system_info);

    match run(&state, cli.command.unwrap_or(Command::Status)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(state: &Arc<ClientState>, command: Command) -> Result<(), String> {
    match command {
        Command::Status => {
            print_status(state);
            Ok(())
        }
        Command::Extract {
            archive,
            skip_signature,
        } => {
            if !skip_signature && !state.check_signature(&archive).await.map_err(|e| e.to_string())? {
                warn!("archive is not a known client archive; extracting anyway");
            }
            let bar = progress_bar();
            let watcher = watch_progress(state, bar.clone());
            let result = state.extract(&archive).await.map_err(|e| e.to_string());
            watcher.abort();
            bar.finish_and_clear();
            result?;
            report_outcome(state)
        }
        Command::VerifySignature { archive } => {
            let known = state
                .check_signature(&archive)
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", if known { "known client archive" } else { "unknown archive" });
            Ok(())
        }
        Command::Launch { server } => launch(state, server).await,
        Command::Servers(command) => servers(state, command),
        Command::Patches(command) => patches(state, command).await,
        Command::MoveClient { destination } => {
            let bar = progress_bar();
            let watcher = watch_progress(state, bar.clone());
            let result = state.move_client_parent(&destination).await;
            watcher.abort();
            bar.finish_and_clear();
            result.map_err(|e| e.to_string())?;
            println!("clients moved to {}", destination.display());
            Ok(())
        }
        Command::Logs { value } => {
            let enabled = value == "on";
            let system_info = state.system_info();
            system_info.update(|s| s.logs_enabled = enabled);
            system_info.save()
        }
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn watch_progress(state: &ClientState, bar: ProgressBar) -> tokio::task::JoinHandle<()> {
    let mut updates = state.subscribe();
    tokio::spawn(async move {
        while let Some(progress) = updates.recv().await {
            bar.set_message(progress.launcher_state.to_string());
            match progress.progress_bar_state {
                ProgressBarState::PercentFill => {
                    let fill = progress.progress_bar_fill.unwrap_or(0.0);
                    bar.set_position((fill * 100.0).round() as u64);
                }
                ProgressBarState::Progressing => bar.tick(),
                ProgressBarState::Inactive => {}
            }
        }
    })
}

fn report_outcome(state: &ClientState) -> Result<(), String> {
    let progress = state.progress();
    let detail = progress
        .additional_data
        .map(|data| format!(" ({data})"))
        .unwrap_or_default();
    match progress.launcher_state {
        LauncherState::ExtractFailed | LauncherState::VerifyFailed | LauncherState::LaunchFailed => {
            Err(format!("{}{detail}", progress.launcher_state))
        }
        other => {
            println!("{other}{detail}");
            Ok(())
        }
    }
}

fn print_status(state: &ClientState) {
    let progress = state.progress();
    println!("state:   {}", progress.launcher_state);
    if let Some(data) = progress.additional_data {
        println!("detail:  {data}");
    }
    match state.runtime() {
        Some(runtime) => println!("runtime: {} ({:?})", runtime.name(), runtime.state()),
        None => println!("runtime: none"),
    }
    println!("client:  {}", state.system_info().client_dir().display());
    match state.server_list().selected_entry() {
        Some(entry) => println!("server:  {} ({})", entry.server_name, entry.server_address),
        None => println!("server:  none selected"),
    }
}

async fn launch(state: &ClientState, server: Option<String>) -> Result<(), String> {
    let entry = match server {
        Some(name) => Some(
            state
                .server_list()
                .entries()
                .into_iter()
                .find(|entry| entry.server_name == name)
                .ok_or_else(|| format!("no server named {name}"))?,
        ),
        None => None,
    };
    if state.runtime().is_some_and(|runtime| runtime.state() == RuntimeState::NotInstalled) {
        info!("the runtime will be installed before launching");
    }

    let Some(mut client) = state.launch(entry).await.map_err(|e| e.to_string())? else {
        return report_outcome(state);
    };
    if let Some(mut output) = client.output.take() {
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                println!("{line}");
            }
        });
    }
    state
        .wait_for_exit(&mut client)
        .await
        .map_err(|e| format!("failed to wait for the client: {e}"))
}

fn servers(state: &ClientState, command: ServerCommand) -> Result<(), String> {
    let list = state.server_list();
    match command {
        ServerCommand::List => {
            let selected = list.selected_entry().map(|entry| entry.server_name);
            for entry in list.entries() {
                let marker = if selected.as_deref() == Some(entry.server_name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {:<24} {}", entry.server_name, entry.server_address);
            }
            Ok(())
        }
        ServerCommand::Add { name, address } => list.add_entry(ServerEntry::new(name, address)),
        ServerCommand::Remove { name } => list.remove_entry(&name),
        ServerCommand::Select { name } => {
            if !list.entries().iter().any(|entry| entry.server_name == name) {
                return Err(format!("no server named {name}"));
            }
            list.set_server_active(&name)
        }
    }
}

async fn patches(state: &Arc<ClientState>, command: PatchCommand) -> Result<(), String> {
    match command {
        PatchCommand::List => {
            state
                .start_update_checks()
                .await
                .map_err(|e| format!("update check failed: {e}"))?;
            for patch in state.patches() {
                println!(
                    "{:<36} {:<20} {}",
                    patch.id(),
                    patch.state().to_string(),
                    patch.name()
                );
            }
            Ok(())
        }
        PatchCommand::Install { id } => {
            state
                .start_update_checks()
                .await
                .map_err(|e| format!("update check failed: {e}"))?;
            let patch = state.patch(&id).ok_or_else(|| format!("no patch named {id}"))?;
            patch.install().await.map_err(|e| e.to_string())?;
            println!("{id}: {}", patch.state());
            Ok(())
        }
        PatchCommand::Uninstall { id } => {
            let patch = state.patch(&id).ok_or_else(|| format!("no patch named {id}"))?;
            patch.refresh().await;
            patch.uninstall().await.map_err(|e| e.to_string())?;
            println!("{id}: {}", patch.state());
            Ok(())
        }
        PatchCommand::AddArchive { archive } => {
            let patch = state
                .add_archive_patch(&archive)
                .await
                .map_err(|e| e.to_string())?;
            println!("added {} ({})", patch.id(), patch.name());
            Ok(())
        }
        PatchCommand::RemoveArchive { name } => state
            .remove_archive_patch(&name)
            .await
            .map_err(|e| e.to_string()),
    }
}
