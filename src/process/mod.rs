use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Fully resolved client start, produced by a runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, working_dir: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_owned(), value.into()));
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Start the process. With `capture_output`, stdout and stderr lines are
    /// logged and forwarded to [`LaunchedClient::output`].
    pub fn spawn(&self, capture_output: bool) -> Result<LaunchedClient, String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        #[cfg(target_os = "windows")]
        {
            // CREATE_NO_WINDOW
            cmd.creation_flags(0x08000000);
        }

        if capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        debug!(
            "launch: program={} cwd={} env={:?}",
            self.program.display(),
            self.working_dir.display(),
            self.env
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to start client process: {e}"))?;
        info!("launch: process started (pid {:?})", child.id());

        let output = capture_output.then(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump_lines(stdout, tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pump_lines(stderr, tx));
            }
            rx
        });
        Ok(LaunchedClient { child, output })
    }
}

async fn pump_lines(stream: impl AsyncRead + Unpin, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("client: {line}");
        let _ = tx.send(line);
    }
}

/// Running client process.
pub struct LaunchedClient {
    pub child: Child,
    /// Output lines when logging was enabled at launch.
    pub output: Option<mpsc::UnboundedReceiver<String>>,
}

impl LaunchedClient {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}
