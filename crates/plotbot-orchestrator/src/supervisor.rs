//! Plot instance supervision
//!
//! The supervisor owns the side effects of an instance's life: it writes
//! the progress header, spawns the plotter, reads and parses progress every
//! tick, hands finished plots to the [`Relocator`] and cleans up. Every
//! decision goes through [`transition`], the supervisor only observes and
//! executes the returned actions.

use chrono::{DateTime, Duration, Utc};
use glob::Pattern;
use plotbot_core::fail_open::fail_open;
use plotbot_core::{InstanceId, PlotError, PlotSize, ResourceShare, Result, SettingsConfig};
use plotbot_host::{is_not_found, Drives, ExitState, LaunchRequest, PlotLauncher, PlotProcess};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{render, CommandContext};
use crate::parser::{parse_progress, ParseOutcome, ProgressParser, ProgressStatus, Terminal};
use crate::recovery::{InstanceHeader, RecoveredInstance, PROGRESS_EXTENSION};
use crate::relocation::{RelocationOutcome, Relocator};
use crate::state_machine::{transition, Action, Event, Level, State};

/// Directory inside a working directory receiving archived progress files
pub const ARCHIVE_DIR: &str = "archive";

/// How an instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    Succeeded { destination: PathBuf },
    Failed { reason: String },
}

/// Everything needed to start one instance
#[derive(Clone)]
pub struct LaunchPlan {
    pub profile: String,
    pub command_template: String,
    pub plot_size: PlotSize,
    pub cache: PathBuf,
    /// Second temporary directory, the same as `cache` with a single cache
    pub cache2: PathBuf,
    pub working_dir: PathBuf,
    pub archive_progress_files: bool,
    pub share: ResourceShare,
    pub parser: Arc<dyn ProgressParser>,
}

/// One plotter run, from launch until its plot is relocated or it fails
pub struct PlotInstance {
    pub id: InstanceId,
    pub profile: String,
    pub cache: PathBuf,
    pub output_dir: PathBuf,
    pub progress_file: PathBuf,
    pub working_dir: PathBuf,
    pub share: ResourceShare,
    pub started: DateTime<Utc>,
    pub status: ProgressStatus,
    archive_progress_files: bool,
    parser: Arc<dyn ProgressParser>,
    state: State,
    process: Option<Box<dyn PlotProcess>>,
    relocation: Option<JoinHandle<Result<RelocationOutcome>>>,
    adopted: bool,
}

impl PlotInstance {
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Still running the plotter, as opposed to waiting for a destination
    pub fn is_plotting(&self) -> bool {
        matches!(self.state, State::Starting | State::Monitoring { .. })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Rebuilt from a progress file at startup; no process handle
    pub fn is_adopted(&self) -> bool {
        self.adopted
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.to_string(),
            profile: self.profile.clone(),
            state: self.state.label(),
            status: self.status.to_string(),
            cache: self.cache.clone(),
            started: self.started,
            pid: self.pid(),
            adopted: self.adopted,
        }
    }
}

impl std::fmt::Debug for PlotInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlotInstance")
            .field("id", &self.id)
            .field("profile", &self.profile)
            .field("state", &self.state)
            .field("progress_file", &self.progress_file)
            .field("adopted", &self.adopted)
            .finish()
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub profile: String,
    pub state: &'static str,
    pub status: String,
    pub cache: PathBuf,
    pub started: DateTime<Utc>,
    pub pid: Option<u32>,
    pub adopted: bool,
}

/// Settings that shape supervision
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_parse_errors: u32,
    pub orphan_timeout: Duration,
    pub retain_failed_files: bool,
}

impl From<&SettingsConfig> for SupervisorSettings {
    fn from(settings: &SettingsConfig) -> Self {
        Self {
            max_parse_errors: settings.max_parse_errors,
            orphan_timeout: Duration::minutes(
                settings.orphan_timeout_minutes.min(i64::MAX as u64 / 60) as i64,
            ),
            retain_failed_files: settings.retain_failed_files,
        }
    }
}

/// Launches, monitors and finishes plot instances
#[derive(Clone)]
pub struct InstanceSupervisor {
    drives: Arc<dyn Drives>,
    launcher: Arc<dyn PlotLauncher>,
    relocator: Relocator,
    settings: SupervisorSettings,
}

impl InstanceSupervisor {
    pub fn new(
        drives: Arc<dyn Drives>,
        launcher: Arc<dyn PlotLauncher>,
        relocator: Relocator,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            drives,
            launcher,
            relocator,
            settings,
        }
    }

    pub fn relocator(&self) -> &Relocator {
        &self.relocator
    }

    /// Start a new instance
    ///
    /// A failed launch has already been cleaned up when the error returns.
    #[instrument(skip_all, fields(profile = %plan.profile))]
    pub async fn launch(&self, plan: LaunchPlan, now: DateTime<Utc>) -> Result<PlotInstance> {
        let id = InstanceId::generate();
        let progress_file = plan.working_dir.join(format!(
            "{}_{}.{}",
            plan.profile, id, PROGRESS_EXTENSION
        ));
        let mut instance = PlotInstance {
            output_dir: plan.cache.join(id.as_str()),
            id,
            profile: plan.profile.clone(),
            cache: plan.cache.clone(),
            progress_file,
            working_dir: plan.working_dir.clone(),
            share: plan.share,
            started: now,
            status: ProgressStatus::default(),
            archive_progress_files: plan.archive_progress_files,
            parser: plan.parser.clone(),
            state: State::Starting,
            process: None,
            relocation: None,
            adopted: false,
        };

        let command_line = render(
            &plan.command_template,
            &CommandContext {
                share: plan.share,
                cache: &plan.cache,
                cache2: &plan.cache2,
                working: &plan.working_dir,
                output: &instance.output_dir,
                size: plan.plot_size.k(),
                progress: &instance.progress_file,
            },
        );
        info!(
            "Starting instance {} on {} with {}",
            instance.id,
            plan.cache.display(),
            plan.share
        );
        debug!("Command: {}", command_line);

        let spawned = match self.prepare(&instance).await {
            Ok(()) => {
                let request = LaunchRequest {
                    command_line,
                    working_dir: plan.working_dir.clone(),
                    progress_file: instance.progress_file.clone(),
                    output_dir: instance.output_dir.clone(),
                };
                self.launcher.launch(&request).await
            }
            Err(e) => Err(e),
        };

        match spawned {
            Ok(process) => {
                let pid = process.pid();
                instance.process = Some(process);
                self.apply(&mut instance, Event::Launched { pid }, now).await;
                Ok(instance)
            }
            Err(e) => {
                let reason = e.to_string();
                self.apply(&mut instance, Event::LaunchFailed { reason: reason.clone() }, now)
                    .await;
                Err(PlotError::Launch(reason))
            }
        }
    }

    /// Create the directories and write the header line
    async fn prepare(&self, instance: &PlotInstance) -> Result<()> {
        self.drives.create_dir_all(&instance.working_dir).await?;
        self.drives.create_dir_all(&instance.output_dir).await?;
        let header = InstanceHeader {
            instance: instance.id.clone(),
            profile: instance.profile.clone(),
            cache: instance.cache.clone(),
            output: instance.output_dir.clone(),
            share: instance.share,
            started: instance.started,
        };
        self.drives
            .append(&instance.progress_file, header.to_line().as_bytes())
            .await
    }

    /// Rebuild an instance found at startup; it starts in Monitoring
    pub fn adopt(
        &self,
        recovered: RecoveredInstance,
        working_dir: &Path,
        archive_progress_files: bool,
        parser: Arc<dyn ProgressParser>,
    ) -> PlotInstance {
        let header = recovered.header;
        info!(
            "Adopting instance {} of <{}> started {}",
            header.instance, header.profile, header.started
        );
        PlotInstance {
            id: header.instance,
            profile: header.profile,
            cache: header.cache,
            output_dir: header.output,
            progress_file: recovered.progress_file,
            working_dir: working_dir.to_path_buf(),
            share: header.share,
            started: header.started,
            status: ProgressStatus::default(),
            archive_progress_files,
            parser,
            state: State::monitoring(),
            process: None,
            relocation: None,
            adopted: true,
        }
    }

    /// Observe an instance once
    ///
    /// Returns the outcome when the instance reached a terminal state during
    /// this poll.
    pub async fn poll(
        &self,
        instance: &mut PlotInstance,
        now: DateTime<Utc>,
    ) -> Option<InstanceOutcome> {
        let event = match instance.state.clone() {
            State::Monitoring { exit_pending, .. } => self.observe(instance, exit_pending, now).await,
            State::Relocating { artifact, .. } => {
                self.observe_relocation(instance, artifact, now).await?
            }
            State::Starting | State::Succeeded { .. } | State::Failed { .. } => return None,
        };
        self.apply(instance, event, now).await
    }

    /// Wait for an in-flight relocation and record its result
    pub async fn finish_relocation(
        &self,
        instance: &mut PlotInstance,
        now: DateTime<Utc>,
    ) -> Option<InstanceOutcome> {
        let handle = instance.relocation.take()?;
        let event = relocation_event(handle.await);
        self.apply(instance, event, now).await
    }

    async fn observe(&self, instance: &mut PlotInstance, exit_pending: bool, now: DateTime<Utc>) -> Event {
        let limit = self.settings.max_parse_errors;

        // Exit first: a plotter's last lines are written before it exits
        let exit = match instance.process.as_mut() {
            Some(process) if !exit_pending => match process.try_exit() {
                Ok(exit) => exit,
                Err(e) => {
                    warn!("Instance {}: cannot observe plotter: {}", instance.id, e);
                    return Event::ProcessVanished;
                }
            },
            _ => None,
        };
        let exited = exit_pending || exit.is_some() || instance.process.is_none();

        let outcome = match self.drives.read(&instance.progress_file).await {
            Ok(raw) => parse_progress(instance.parser.as_ref(), &raw),
            Err(e) => ParseOutcome::Malformed(format!("cannot read progress file: {}", e)),
        };

        let status = match outcome {
            ParseOutcome::Status(status) => status,
            ParseOutcome::Malformed(message) => {
                return match exit {
                    Some(exit @ ExitState::Failed(_)) => Event::ProcessExited { exit },
                    _ => Event::MalformedRead { message, limit },
                };
            }
        };

        if status != instance.status {
            if status.stage != instance.status.stage {
                info!("Instance {} ({}): {}", instance.id, instance.profile, status);
            } else {
                debug!("Instance {} ({}): {}", instance.id, instance.profile, status);
            }
            instance.status = status.clone();
        }

        match status.terminal {
            Some(Terminal::Failure { reason }) => Event::PlotFailed { reason },
            Some(Terminal::Success { .. }) if matches!(exit, Some(ExitState::Failed(_))) => {
                Event::ProcessExited {
                    exit: exit.unwrap_or(ExitState::Failed(None)),
                }
            }
            Some(Terminal::Success { artifact }) if exited => {
                match self.locate_artifact(instance, artifact).await {
                    Ok(artifact) => Event::PlotCompleted { artifact },
                    Err(PlotError::PlottingFailure(reason)) => Event::Error { message: reason },
                    // The plot is likely still there; look again next tick
                    Err(e) => Event::MalformedRead {
                        message: format!("cannot locate finished plot: {}", e),
                        limit,
                    },
                }
            }
            // Finished writing; wait for the process to exit
            Some(Terminal::Success { .. }) => Event::ProgressRead,
            None => match exit {
                Some(exit) => Event::ProcessExited { exit },
                None if instance.adopted && !exit_pending => self.check_orphan(instance, now).await,
                None => Event::ProgressRead,
            },
        }
    }

    /// An adopted instance whose progress file went quiet is gone
    async fn check_orphan(&self, instance: &PlotInstance, now: DateTime<Utc>) -> Event {
        match self.drives.metadata(&instance.progress_file).await {
            Ok(file) if now - file.modified > self.settings.orphan_timeout => {
                warn!(
                    "Instance {}: no progress since {}, assuming the plotter is gone",
                    instance.id, file.modified
                );
                Event::ProcessVanished
            }
            Ok(_) => Event::ProgressRead,
            Err(e) => Event::MalformedRead {
                message: e.to_string(),
                limit: self.settings.max_parse_errors,
            },
        }
    }

    /// Where the finished plot is: the path the plotter printed, or the only
    /// plot in the output directory
    async fn locate_artifact(
        &self,
        instance: &PlotInstance,
        reported: Option<PathBuf>,
    ) -> Result<PathBuf> {
        if let Some(path) = reported {
            match self.drives.metadata(&path).await {
                Ok(_) => return Ok(path),
                Err(e) if is_not_found(&e) => {
                    debug!("Reported plot {} is missing, searching output", path.display())
                }
                Err(e) => return Err(e),
            }
        }

        let pattern = Pattern::new("*.plot").map_err(|e| PlotError::Other(e.to_string()))?;
        let mut plots: Vec<PathBuf> = self
            .drives
            .list_files(&instance.output_dir)
            .await?
            .into_iter()
            .filter(|f| f.file_name().is_some_and(|name| pattern.matches(name)))
            .map(|f| f.path)
            .collect();

        match plots.len() {
            1 => Ok(plots.remove(0)),
            0 => Err(PlotError::PlottingFailure(format!(
                "no plot found in {}",
                instance.output_dir.display()
            ))),
            n => Err(PlotError::PlottingFailure(format!(
                "{} plots found in {}, expected one",
                n,
                instance.output_dir.display()
            ))),
        }
    }

    async fn observe_relocation(
        &self,
        instance: &mut PlotInstance,
        artifact: PathBuf,
        now: DateTime<Utc>,
    ) -> Option<Event> {
        match instance.relocation.take() {
            None => {
                // First attempt, or retry after a deferral
                self.spawn_relocation(instance, artifact, now);
                None
            }
            Some(handle) if !handle.is_finished() => {
                debug!("Instance {}: relocation still running", instance.id);
                instance.relocation = Some(handle);
                None
            }
            Some(handle) => Some(relocation_event(handle.await)),
        }
    }

    fn spawn_relocation(&self, instance: &mut PlotInstance, artifact: PathBuf, now: DateTime<Utc>) {
        let relocator = self.relocator.clone();
        let profile = instance.profile.clone();
        instance.relocation = Some(tokio::spawn(async move {
            match relocator.relocate(&profile, &artifact, now).await {
                Err(e) if is_not_found(&e) => Err(PlotError::PlottingFailure(format!(
                    "{} vanished: {}",
                    artifact.display(),
                    e
                ))),
                other => other,
            }
        }));
    }

    /// Feed an event to the state machine and run the resulting actions
    async fn apply(
        &self,
        instance: &mut PlotInstance,
        event: Event,
        now: DateTime<Utc>,
    ) -> Option<InstanceOutcome> {
        let was_terminal = instance.state.is_terminal();
        let (state, mut actions) = transition(instance.state.clone(), event);
        instance.state = state;

        // Invalid transitions carry no actions; still report them
        if !was_terminal && actions.is_empty() {
            if let State::Failed { reason } = &instance.state {
                actions = vec![
                    Action::Log {
                        level: Level::Error,
                        message: reason.clone(),
                    },
                    Action::CleanupFailed,
                    Action::ReportFailure {
                        reason: reason.clone(),
                    },
                ];
            }
        }

        let mut outcome = None;
        for action in actions {
            match action {
                Action::Log { level, message } => log(instance, level, &message),
                Action::StartRelocation { artifact } => {
                    self.spawn_relocation(instance, artifact, now)
                }
                Action::Finalize => self.finalize(instance).await,
                Action::CleanupFailed => self.cleanup_failed(instance).await,
                Action::ReportFailure { reason } => {
                    outcome = Some(InstanceOutcome::Failed { reason })
                }
                Action::ReportSuccess => {
                    if let State::Succeeded { destination } = &instance.state {
                        outcome = Some(InstanceOutcome::Succeeded {
                            destination: destination.clone(),
                        });
                    }
                }
            }
        }
        outcome
    }

    /// Archive or delete the progress file and drop the output directory
    async fn finalize(&self, instance: &PlotInstance) {
        let drives = self.drives.as_ref();
        if instance.archive_progress_files {
            let archive = instance.working_dir.join(ARCHIVE_DIR);
            fail_open("archive progress file", || async {
                drives.create_dir_all(&archive).await?;
                let name = instance.progress_file.file_name().unwrap_or_default();
                drives
                    .move_file(&instance.progress_file, &archive.join(name))
                    .await
            })
            .await;
        } else {
            fail_open("remove progress file", || {
                ignore_missing(drives.remove_file(&instance.progress_file))
            })
            .await;
        }
        fail_open("remove output directory", || {
            ignore_missing(drives.remove_all(&instance.output_dir))
        })
        .await;
    }

    async fn cleanup_failed(&self, instance: &PlotInstance) {
        if self.settings.retain_failed_files {
            info!(
                "Keeping {} and {} for diagnostics",
                instance.progress_file.display(),
                instance.output_dir.display()
            );
            return;
        }
        let drives = self.drives.as_ref();
        fail_open("remove output directory", || {
            ignore_missing(drives.remove_all(&instance.output_dir))
        })
        .await;
        fail_open("remove progress file", || {
            ignore_missing(drives.remove_file(&instance.progress_file))
        })
        .await;
    }
}

fn relocation_event(
    joined: std::result::Result<Result<RelocationOutcome>, tokio::task::JoinError>,
) -> Event {
    match joined {
        Ok(Ok(RelocationOutcome::Relocated { destination })) => Event::Relocated { destination },
        Ok(Ok(RelocationOutcome::Deferred { reason })) => Event::RelocationDeferred { reason },
        Ok(Err(PlotError::PlottingFailure(reason))) => Event::PlotFailed { reason },
        Ok(Err(e)) => Event::Error {
            message: e.to_string(),
        },
        Err(e) => Event::Error {
            message: format!("relocation task failed: {}", e),
        },
    }
}

async fn ignore_missing(operation: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    match operation.await {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}

fn log(instance: &PlotInstance, level: Level, message: &str) {
    let id = instance.id.as_str();
    let profile = instance.profile.as_str();
    match level {
        Level::Debug => debug!(instance = id, profile, "{}", message),
        Level::Info => info!(instance = id, profile, "{}", message),
        Level::Warn => warn!(instance = id, profile, "{}", message),
        Level::Error => error!(instance = id, profile, "{}", message),
    }
}
