//! Scripted plotter launcher for testing

use async_trait::async_trait;
use chrono::Utc;
use plotbot_core::{PlotError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::memory::MemoryDrives;
use crate::process::{ExitState, LaunchRequest, PlotLauncher, PlotProcess};

/// Behaviour of one fake plotter run
///
/// `progress` is appended to the progress file at launch, `final_progress`
/// when the process exits. `{output}` in either text is replaced by the
/// instance's temporary output directory.
#[derive(Debug, Clone)]
pub struct PlotScript {
    progress: String,
    final_progress: String,
    artifact: Option<(String, u64)>,
    exit: ExitState,
    polls_until_exit: u32,
    fail_spawn: bool,
}

impl Default for PlotScript {
    fn default() -> Self {
        Self {
            progress: String::new(),
            final_progress: String::new(),
            artifact: None,
            exit: ExitState::Success,
            polls_until_exit: 1,
            fail_spawn: false,
        }
    }
}

impl PlotScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// A process that never exits
    pub fn running() -> Self {
        Self {
            polls_until_exit: u32::MAX,
            ..Self::default()
        }
    }

    /// A launch that fails before any process exists
    pub fn spawn_failure() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub fn progress(mut self, text: impl Into<String>) -> Self {
        self.progress = text.into();
        self
    }

    pub fn final_progress(mut self, text: impl Into<String>) -> Self {
        self.final_progress = text.into();
        self
    }

    /// File created in the output directory on exit
    pub fn artifact(mut self, name: impl Into<String>, size: u64) -> Self {
        self.artifact = Some((name.into(), size));
        self
    }

    pub fn exit(mut self, exit: ExitState) -> Self {
        self.exit = exit;
        self
    }

    /// Number of `try_exit` calls answered with "still running"
    pub fn polls_until_exit(mut self, polls: u32) -> Self {
        self.polls_until_exit = polls;
        self
    }
}

#[derive(Debug, Default)]
struct LauncherState {
    scripts: VecDeque<PlotScript>,
    launched: Vec<LaunchRequest>,
}

/// Launcher that plays back queued [`PlotScript`]s against [`MemoryDrives`]
///
/// When the queue is empty every launch gets [`PlotScript::running`].
#[derive(Debug, Clone)]
pub struct ScriptedLauncher {
    drives: MemoryDrives,
    state: Arc<Mutex<LauncherState>>,
}

impl ScriptedLauncher {
    pub fn new(drives: MemoryDrives) -> Self {
        Self {
            drives,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_script(self, script: PlotScript) -> Self {
        self.push(script);
        self
    }

    /// Queue a script for the next launch
    pub fn push(&self, script: PlotScript) {
        self.state().scripts.push_back(script);
    }

    /// Requests received so far, in order
    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.state().launched.clone()
    }
}

#[async_trait]
impl PlotLauncher for ScriptedLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn PlotProcess>> {
        let (script, pid) = {
            let mut state = self.state();
            state.launched.push(request.clone());
            let script = state.scripts.pop_front().unwrap_or_else(PlotScript::running);
            (script, 1000 + state.launched.len() as u32)
        };

        if script.fail_spawn {
            return Err(PlotError::Launch(format!(
                "scripted spawn failure for `{}`",
                request.command_line
            )));
        }

        let output = request.output_dir.display().to_string();
        if !script.progress.is_empty() {
            self.drives.append_file(
                &request.progress_file,
                script.progress.replace("{output}", &output).as_bytes(),
            );
        }

        Ok(Box::new(ScriptedProcess {
            drives: self.drives.clone(),
            request: request.clone(),
            script,
            pid,
            polls: 0,
            exited: None,
        }))
    }
}

struct ScriptedProcess {
    drives: MemoryDrives,
    request: LaunchRequest,
    script: PlotScript,
    pid: u32,
    polls: u32,
    exited: Option<ExitState>,
}

impl ScriptedProcess {
    fn finish(&mut self) -> ExitState {
        let output = self.request.output_dir.display().to_string();
        if let Some((name, size)) = &self.script.artifact {
            self.drives
                .add_file(self.request.output_dir.join(name), *size, Utc::now());
        }
        if !self.script.final_progress.is_empty() {
            self.drives.append_file(
                &self.request.progress_file,
                self.script
                    .final_progress
                    .replace("{output}", &output)
                    .as_bytes(),
            );
        }
        self.script.exit
    }
}

impl PlotProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exit(&mut self) -> Result<Option<ExitState>> {
        if let Some(exit) = self.exited {
            return Ok(Some(exit));
        }
        if self.polls < self.script.polls_until_exit {
            self.polls += 1;
            return Ok(None);
        }
        let exit = self.finish();
        self.exited = Some(exit);
        Ok(Some(exit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn request() -> LaunchRequest {
        LaunchRequest {
            command_line: "plot".to_string(),
            working_dir: PathBuf::from("/work"),
            progress_file: PathBuf::from("/work/a.progress"),
            output_dir: PathBuf::from("/cache/abc"),
        }
    }

    #[tokio::test]
    async fn test_script_plays_back() {
        let drives = MemoryDrives::new();
        let launcher = ScriptedLauncher::new(drives.clone()).with_script(
            PlotScript::new()
                .progress("started\n")
                .final_progress("done {output}/p.plot\n")
                .artifact("p.plot", 42)
                .polls_until_exit(2),
        );

        let mut process = launcher.launch(&request()).await.unwrap();
        assert_eq!(process.pid(), Some(1001));
        assert_eq!(process.try_exit().unwrap(), None);
        assert_eq!(process.try_exit().unwrap(), None);
        assert_eq!(process.try_exit().unwrap(), Some(ExitState::Success));
        assert_eq!(process.try_exit().unwrap(), Some(ExitState::Success));

        let progress = drives.contents(Path::new("/work/a.progress")).unwrap();
        assert_eq!(progress, "started\ndone /cache/abc/p.plot\n");
        assert_eq!(drives.free_space(Path::new("/cache")), u64::MAX);
        assert!(drives.exists(Path::new("/cache/abc/p.plot")));
        assert_eq!(launcher.launched().len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let launcher = ScriptedLauncher::new(MemoryDrives::new())
            .with_script(PlotScript::spawn_failure());
        let err = launcher.launch(&request()).await.err().unwrap();
        assert!(matches!(err, PlotError::Launch(_)));
        assert_eq!(launcher.launched().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_runs_forever() {
        let launcher = ScriptedLauncher::new(MemoryDrives::new());
        let mut process = launcher.launch(&request()).await.unwrap();
        for _ in 0..100 {
            assert_eq!(process.try_exit().unwrap(), None);
        }
    }
}
