//! # plotbot-host
//!
//! Host capabilities used by the PlotBot orchestrator.
//!
//! This crate provides:
//! - [`Drives`]: free space queries and file operations
//! - [`PlotLauncher`]: spawning the external plotter
//! - [`DriveLocks`]: per-drive serialization of destructive work
//! - In-memory doubles ([`MemoryDrives`], [`ScriptedLauncher`]) for tests

mod drives;
mod locks;
mod memory;
mod process;
mod scripted;

pub use drives::{is_not_found, DriveId, Drives, FileEntry, LocalDrives};
pub use locks::DriveLocks;
pub use memory::MemoryDrives;
pub use process::{
    ChildProcess, ExitState, LaunchRequest, PlotLauncher, PlotProcess, Shell, ShellLauncher,
};
pub use scripted::{PlotScript, ScriptedLauncher};
