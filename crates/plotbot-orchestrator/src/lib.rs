//! # plotbot-orchestrator
//!
//! Scheduling, supervision and relocation engine for PlotBot.
//!
//! This crate provides:
//! - [`Orchestrator`]: per-profile start decisions and instance tracking
//! - [`InstanceSupervisor`]: launch, monitoring and cleanup of one plotter run,
//!   driven by the pure [`transition`] function
//! - Strategy families resolved by name through the [`Registry`]:
//!   delay policies, drive clearers and progress parsers
//! - [`Relocator`]: moving finished plots under per-drive locks
//! - [`PlotBotService`]: the cron-gated, timer-driven service loop

mod clearer;
mod command;
mod delay;
pub mod parser;
mod orchestrator;
mod recovery;
mod registry;
mod relocation;
mod retry;
mod scheduler;
mod state_machine;
mod supervisor;

pub use clearer::{DriveClearer, OgDateClearer, OgSizeClearer, Selection, ZeroByteClearer};
pub use command::{render, validate_template, CommandContext, PLACEHOLDERS};
pub use delay::{
    DelayContext, DelayPolicy, ProgressFileContainsDelay, RunningInstance, StartLedger,
    StartScope, TimeStartedDelay,
};
pub use orchestrator::{validate_config, Orchestrator, TickReport};
pub use parser::{parse_progress, ParseOutcome, ProgressParser, ProgressStatus, Terminal};
pub use recovery::{
    cleanup_cache, cleanup_failed_copies, scan_progress_files, InstanceHeader, RecoveredInstance,
    PROGRESS_EXTENSION,
};
pub use registry::Registry;
pub use relocation::{Destination, RelocationOutcome, Relocator};
pub use retry::RetryBackoff;
pub use scheduler::{CronGate, PlotBotService, ShutdownHandle};
pub use state_machine::{transition, Action, Event, Level, State};
pub use supervisor::{
    InstanceOutcome, InstanceSummary, InstanceSupervisor, LaunchPlan, PlotInstance,
    SupervisorSettings, ARCHIVE_DIR,
};
