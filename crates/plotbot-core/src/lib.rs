//! # plotbot-core
//!
//! Core types for PlotBot, a long-running service that keeps proof-of-space
//! plotters busy on a single host.
//!
//! ## Model
//!
//! - A *profile* describes one plotting job type: budgets, cache directories,
//!   a working directory for progress files, delay policies
//! - An *instance* is one running invocation of the external plotter
//! - A *drive* is a destination that finished plots are relocated to
//! - Strategies (delay policies, clearers, progress parsers) are referenced by
//!   name through [`ComponentSpec`] and resolved once at startup

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    DriveConfig, LoggingConfig, PlotBotConfig, PlotterConfig, RetryConfig, SettingsConfig,
    WorkingDirectories,
};
pub use error::{PlotError, Result};
pub use types::*;
