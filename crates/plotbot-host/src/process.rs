//! External plotter process abstraction

use async_trait::async_trait;
use plotbot_core::{PlotError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

/// Everything needed to start one plotter instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Fully rendered command line
    pub command_line: String,
    /// Directory the process runs in
    pub working_dir: PathBuf,
    /// File receiving stdout and stderr (appended)
    pub progress_file: PathBuf,
    /// Temporary directory the finished plot is written to
    pub output_dir: PathBuf,
}

/// How a plotter process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Success,
    /// Non-zero exit; `None` when killed by a signal
    Failed(Option<i32>),
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "exit code 0"),
            Self::Failed(Some(code)) => write!(f, "exit code {}", code),
            Self::Failed(None) => write!(f, "terminated by signal"),
        }
    }
}

/// Handle to a running plotter
pub trait PlotProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check; `None` while still running
    fn try_exit(&mut self) -> Result<Option<ExitState>>;
}

/// Trait for spawning plotters (allows scripted doubles in tests)
#[async_trait]
pub trait PlotLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn PlotProcess>>;
}

/// Platform shell used to interpret command lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// `sh -c`
    Posix,
    /// `cmd /C`
    Cmd,
}

impl Shell {
    /// Shell of the current platform
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Cmd
        } else {
            Self::Posix
        }
    }

    fn command(&self, command_line: &str) -> Command {
        let mut command = match self {
            Self::Posix => Command::new("sh"),
            Self::Cmd => Command::new("cmd"),
        };
        match self {
            Self::Posix => command.arg("-c"),
            Self::Cmd => command.arg("/C"),
        };
        command.arg(command_line);
        command
    }
}

/// Spawns plotters through the platform shell
///
/// Children are detached from the service: they keep running when the
/// service stops, and their output goes straight to the progress file.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: Shell,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new(Shell::detect())
    }
}

impl ShellLauncher {
    pub fn new(shell: Shell) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl PlotLauncher for ShellLauncher {
    #[instrument(skip(self, request), fields(progress = %request.progress_file.display()))]
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn PlotProcess>> {
        debug!("Spawning: {}", request.command_line);

        let stdout = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.progress_file)
            .await
            .map_err(|e| PlotError::Launch(format!("Failed to open progress file: {}", e)))?
            .into_std()
            .await;
        let stderr = stdout
            .try_clone()
            .map_err(|e| PlotError::Launch(format!("Failed to open progress file: {}", e)))?;

        let mut command = self.shell.command(&request.command_line);
        command
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| PlotError::Launch(format!("Failed to spawn plotter: {}", e)))?;

        Ok(Box::new(ChildProcess { child }))
    }
}

/// A plotter spawned by [`ShellLauncher`]
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl PlotProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<ExitState>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| PlotError::Monitoring(format!("Failed to query plotter: {}", e)))?;

        Ok(status.map(|status| {
            if status.success() {
                ExitState::Success
            } else {
                ExitState::Failed(status.code())
            }
        }))
    }
}
