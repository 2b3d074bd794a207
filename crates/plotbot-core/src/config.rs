//! Configuration management for PlotBot
//!
//! The service is configured from a single TOML file (`plotbot.toml` by
//! default) holding global settings, logging, plotter profiles and
//! destination drives. Everything is validated up front: an invalid file is
//! a [`PlotError::Configuration`] and the service refuses to start.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::{ComponentSpec, PlotError, PlotSize, ResourceShare, Result};

/// File name looked up when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "plotbot.toml";

const DEFAULT_CONFIG_HEADER: &str = "\
# PlotBot configuration
#
# [settings]      tick interval, plotting window (cron), retry and cleanup switches
# [logging]       level, log directory, alert command run for warnings and errors
# [[plotters]]    one block per profile: budgets, cache directories, delay policies
# [[drives]]      destinations for finished plots and the clearers that make room
#
# Run `plotbot validate` after editing.

";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotBotConfig {
    /// Global service settings
    #[serde(default)]
    pub settings: SettingsConfig,

    /// Log output and alerting
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Plotter profiles
    #[serde(default)]
    pub plotters: Vec<PlotterConfig>,

    /// Destination drives for finished plots
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
}

/// Global service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Seconds between ticks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Cron expression restricting when new instances may start
    #[serde(default = "default_plotting_window")]
    pub plotting_window: String,

    /// Evaluate a replacement start in the same tick an instance failed
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Backoff applied to starts after failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Check plot command templates at startup
    #[serde(default = "default_true")]
    pub validate_plot_command: bool,

    /// Seconds a drive is left alone after its clearers came up short
    #[serde(default = "default_drive_clearer_idle_secs")]
    pub drive_clearer_idle_secs: u64,

    /// Log destructive file operations instead of performing them
    #[serde(default)]
    pub test_mode: bool,

    /// Remove stale cache contents at startup
    #[serde(default)]
    pub cleanup_cache: bool,

    /// Remove leftovers of interrupted relocations at startup
    #[serde(default)]
    pub cleanup_failed_copy: bool,

    /// Log idle ticks at debug level
    #[serde(default)]
    pub reduce_idle_messages: bool,

    /// Keep progress files and temporary output of failed instances
    #[serde(default)]
    pub retain_failed_files: bool,

    /// Minutes without progress before an adopted instance counts as vanished
    #[serde(default = "default_orphan_timeout_minutes")]
    pub orphan_timeout_minutes: u64,

    /// Consecutive malformed progress reads tolerated before failing an instance
    #[serde(default = "default_max_parse_errors")]
    pub max_parse_errors: u32,

    /// Plot command used by profiles without their own
    #[serde(default = "default_plot_command")]
    pub default_plot_command: String,

    /// Progress parser used by profiles without their own
    #[serde(default = "default_progress_parser")]
    pub default_progress_parser: ComponentSpec,
}

/// Backoff for starts after failed instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff after the first failure, doubled per further failure (0 = none)
    #[serde(default)]
    pub backoff_base_secs: u64,

    /// Upper bound on the backoff
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

/// Log output and alerting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for `plotbot.log`; console only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Size in MB above which the log file is moved to the archive
    #[serde(default = "default_archive_size_mb")]
    pub archive_size_mb: u64,

    /// Archived log files kept, 0 keeps all
    #[serde(default = "default_max_archive_files")]
    pub max_archive_files: usize,

    /// Program invoked with the message as last argument for alert-worthy events
    #[serde(default)]
    pub alert_command: Option<Vec<String>>,

    /// Minimum level that triggers the alert command
    #[serde(default = "default_alert_level")]
    pub alert_level: String,
}

/// One plotter profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotterConfig {
    /// Unique name identifying this profile
    pub alias: String,

    /// Size class of the plots created
    #[serde(default)]
    pub plot_size: PlotSize,

    /// Maximum concurrent instances
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Threads shared by all instances
    #[serde(default = "default_total_threads")]
    pub total_threads: u32,

    /// Ram (MiB) shared by all instances
    #[serde(default = "default_total_ram")]
    pub total_ram: u32,

    /// Buckets shared by all instances
    #[serde(default = "default_buckets")]
    pub buckets: u32,

    /// Plot command template; the global default is used when unset
    #[serde(default)]
    pub plot_command: Option<String>,

    /// Progress parser; the global default is used when unset
    #[serde(default)]
    pub progress_parser: Option<ComponentSpec>,

    /// Cache and working directories
    pub working_directories: WorkingDirectories,

    /// Delay policies, evaluated in order
    #[serde(default)]
    pub delay: Vec<ComponentSpec>,
}

/// Directories a profile plots in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingDirectories {
    /// Cache (staging) directories
    pub caches: Vec<PathBuf>,

    /// Directory holding the progress files
    pub working_directory: PathBuf,

    /// Archive progress files of finished instances instead of deleting them
    #[serde(default)]
    pub archive_progress_files: bool,
}

/// Destination drive for finished plots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique name identifying this drive
    pub alias: String,

    /// Directory plots are moved into
    pub directory: PathBuf,

    /// Profiles allowed to use this drive; empty means all
    #[serde(default)]
    pub plotters: Vec<String>,

    /// Clearers run in order when the drive lacks space
    #[serde(default)]
    pub clearers: Vec<ComponentSpec>,
}

// Default value providers
fn default_interval_secs() -> u64 {
    60
}

fn default_plotting_window() -> String {
    "* * * * *".to_string()
}

fn default_true() -> bool {
    true
}

fn default_drive_clearer_idle_secs() -> u64 {
    60
}

fn default_orphan_timeout_minutes() -> u64 {
    120
}

fn default_max_parse_errors() -> u32 {
    10
}

fn default_plot_command() -> String {
    "chia_plot -k {size} -r {threads} -u {buckets} -t {cache}/ -2 {cache2}/ -d {output}/"
        .to_string()
}

fn default_progress_parser() -> ComponentSpec {
    ComponentSpec::new("madmax")
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_archive_size_mb() -> u64 {
    10
}

fn default_max_archive_files() -> usize {
    10
}

fn default_alert_level() -> String {
    "warn".to_string()
}

fn default_max_instances() -> usize {
    1
}

fn default_total_threads() -> u32 {
    4
}

fn default_total_ram() -> u32 {
    3390
}

fn default_buckets() -> u32 {
    256
}

impl PlotBotConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PlotError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PlotError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| PlotError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, format!("{}{}", DEFAULT_CONFIG_HEADER, content))?;
        Ok(())
    }

    /// Check structural rules that do not depend on registered components
    pub fn validate(&self) -> Result<()> {
        let settings = &self.settings;
        if settings.interval_secs == 0 {
            return Err(PlotError::config("settings.interval_secs must be larger than 0"));
        }
        if settings.drive_clearer_idle_secs == 0 {
            return Err(PlotError::config(
                "settings.drive_clearer_idle_secs must be larger than 0",
            ));
        }
        if settings.plotting_window.trim().is_empty() {
            return Err(PlotError::config("settings.plotting_window cannot be empty"));
        }
        if self.logging.archive_size_mb == 0 {
            return Err(PlotError::config("logging.archive_size_mb must be larger than 0"));
        }

        if self.plotters.is_empty() {
            return Err(PlotError::config("At least one plotter must be configured"));
        }

        let mut aliases = HashSet::new();
        for plotter in &self.plotters {
            if plotter.alias.trim().is_empty() {
                return Err(PlotError::config("Plotter alias cannot be empty"));
            }
            if !aliases.insert(plotter.alias.as_str()) {
                return Err(PlotError::config(format!(
                    "Plotter alias <{}> is used more than once",
                    plotter.alias
                )));
            }
            plotter.validate()?;
        }

        let mut drive_aliases = HashSet::new();
        for drive in &self.drives {
            if !drive_aliases.insert(drive.alias.as_str()) {
                return Err(PlotError::config(format!(
                    "Drive alias <{}> is used more than once",
                    drive.alias
                )));
            }
            if drive.directory.as_os_str().is_empty() {
                return Err(PlotError::config(format!(
                    "Drive <{}> has no directory",
                    drive.alias
                )));
            }
            if let Some(unknown) = drive.plotters.iter().find(|p| !aliases.contains(p.as_str())) {
                return Err(PlotError::config(format!(
                    "Drive <{}> references unknown plotter <{}>",
                    drive.alias, unknown
                )));
            }
        }

        for plotter in &self.plotters {
            if self.drives_for(&plotter.alias).next().is_none() {
                return Err(PlotError::config(format!(
                    "Plotter <{}> has no destination drive",
                    plotter.alias
                )));
            }
        }

        Ok(())
    }

    /// Drives a profile may relocate plots to
    pub fn drives_for<'a>(&'a self, alias: &'a str) -> impl Iterator<Item = &'a DriveConfig> + 'a {
        self.drives.iter().filter(move |d| d.accepts(alias))
    }

    /// Plot command for a profile, falling back to the global default
    pub fn plot_command_for<'a>(&'a self, plotter: &'a PlotterConfig) -> &'a str {
        plotter
            .plot_command
            .as_deref()
            .unwrap_or(&self.settings.default_plot_command)
    }

    /// Progress parser for a profile, falling back to the global default
    pub fn progress_parser_for<'a>(&'a self, plotter: &'a PlotterConfig) -> &'a ComponentSpec {
        plotter
            .progress_parser
            .as_ref()
            .unwrap_or(&self.settings.default_progress_parser)
    }
}

impl PlotterConfig {
    fn validate(&self) -> Result<()> {
        let alias = &self.alias;
        if self.max_instances == 0 {
            return Err(PlotError::config(format!(
                "Plotter <{}>: max_instances must be larger than 0",
                alias
            )));
        }
        if self.total_threads == 0 || self.total_ram == 0 || self.buckets == 0 {
            return Err(PlotError::config(format!(
                "Plotter <{}>: total_threads, total_ram and buckets must be larger than 0",
                alias
            )));
        }
        let slots = u32::try_from(self.max_instances).unwrap_or(u32::MAX);
        if self.total_threads < slots || self.total_ram < slots || self.buckets < slots {
            return Err(PlotError::config(format!(
                "Plotter <{}>: total_threads, total_ram and buckets must be at least max_instances ({})",
                alias, self.max_instances
            )));
        }
        if self.working_directories.caches.is_empty() {
            return Err(PlotError::config(format!(
                "Plotter <{}>: at least one cache directory is required",
                alias
            )));
        }
        if self.working_directories.working_directory.as_os_str().is_empty() {
            return Err(PlotError::config(format!(
                "Plotter <{}>: working_directory cannot be empty",
                alias
            )));
        }
        if let Some(command) = &self.plot_command {
            if command.trim().is_empty() {
                return Err(PlotError::config(format!(
                    "Plotter <{}>: plot_command cannot be empty",
                    alias
                )));
            }
        }
        Ok(())
    }

    /// Total resources shared by all instances of this profile
    pub fn budget(&self) -> ResourceShare {
        ResourceShare::new(self.total_threads, self.total_ram, self.buckets)
    }
}

impl DriveConfig {
    /// True when the profile may use this drive
    pub fn accepts(&self, alias: &str) -> bool {
        self.plotters.is_empty() || self.plotters.iter().any(|p| p == alias)
    }
}

impl Default for PlotBotConfig {
    fn default() -> Self {
        Self {
            settings: SettingsConfig::default(),
            logging: LoggingConfig::default(),
            plotters: vec![PlotterConfig::default()],
            drives: vec![DriveConfig::default()],
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            plotting_window: default_plotting_window(),
            retry_on_failure: false,
            retry: RetryConfig::default(),
            validate_plot_command: true,
            drive_clearer_idle_secs: default_drive_clearer_idle_secs(),
            test_mode: false,
            cleanup_cache: false,
            cleanup_failed_copy: false,
            reduce_idle_messages: false,
            retain_failed_files: false,
            orphan_timeout_minutes: default_orphan_timeout_minutes(),
            max_parse_errors: default_max_parse_errors(),
            default_plot_command: default_plot_command(),
            default_progress_parser: default_progress_parser(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: 0,
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            archive_size_mb: default_archive_size_mb(),
            max_archive_files: default_max_archive_files(),
            alert_command: None,
            alert_level: default_alert_level(),
        }
    }
}

impl Default for PlotterConfig {
    fn default() -> Self {
        Self {
            alias: "MainPlotter".to_string(),
            plot_size: PlotSize::default(),
            max_instances: default_max_instances(),
            total_threads: default_total_threads(),
            total_ram: default_total_ram(),
            buckets: default_buckets(),
            plot_command: None,
            progress_parser: None,
            working_directories: WorkingDirectories::default(),
            delay: vec![ComponentSpec::new("progress-file-contains").with_arg("Phase 1 took")],
        }
    }
}

impl Default for WorkingDirectories {
    fn default() -> Self {
        Self {
            caches: vec![
                PathBuf::from("/path/to/cache/one"),
                PathBuf::from("/path/to/cache/two"),
            ],
            working_directory: PathBuf::from("/path/to/plotter/working/directory"),
            archive_progress_files: false,
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            alias: "MainDrive".to_string(),
            directory: PathBuf::from("/path/to/destination"),
            plotters: Vec::new(),
            clearers: vec![ComponentSpec::new("zero-byte")],
        }
    }
}
