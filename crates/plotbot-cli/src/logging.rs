//! Subscriber setup: console, optional log file, optional alert command

use anyhow::{Context as _, Result};
use plotbot_core::LoggingConfig;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Name of the log file inside `logging.directory`
pub const LOG_FILE: &str = "plotbot.log";

/// Folder inside `logging.directory` holding archived log files
pub const ARCHIVE_DIR: &str = "archive";

const MB: u64 = 1_000_000;

/// Install the global subscriber
///
/// `RUST_LOG` wins over `logging.level`; `verbose` forces debug.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&config.level)
                .with_context(|| format!("Invalid logging.level `{}`", config.level))?,
        }
    };

    let file_layer = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let file = RotatingFile::open(
                path.clone(),
                config.archive_size_mb.saturating_mul(MB),
                config.max_archive_files,
            )
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    let alert_layer = match &config.alert_command {
        Some(command) => Some(AlertLayer::new(command.clone(), &config.alert_level)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .with(alert_layer)
        .with(filter)
        .init();
    Ok(())
}

/// Log file that moves to the archive once it grows past a size
///
/// The current file becomes `archive/plotbot.1.log`; older archives shift
/// up by one and those beyond `keep` are deleted (`keep == 0` keeps all).
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    keep: usize,
}

impl RotatingFile {
    pub fn open(path: PathBuf, max_bytes: u64, keep: usize) -> io::Result<Self> {
        let file = Self::append_to(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_bytes,
            keep,
        })
    }

    fn append_to(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn archive_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map_or_else(|| PathBuf::from(ARCHIVE_DIR), |dir| dir.join(ARCHIVE_DIR))
    }

    fn archived(&self, n: usize) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map_or_else(|| "plotbot".into(), |s| s.to_string_lossy());
        self.archive_dir().join(format!("{}.{}.log", stem, n))
    }

    /// Highest archive number in use
    fn last_archived(&self) -> usize {
        let mut n = 0;
        while self.archived(n + 1).exists() {
            n += 1;
        }
        n
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        std::fs::create_dir_all(self.archive_dir())?;

        let last = self.last_archived();
        for n in (1..=last).rev() {
            if self.keep > 0 && n >= self.keep {
                std::fs::remove_file(self.archived(n))?;
            } else {
                std::fs::rename(self.archived(n), self.archived(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.archived(1))?;

        self.file = Self::append_to(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Runs an external command for every event at or above a level
///
/// The command gets `"<LEVEL> <message>"` appended as its last argument and
/// is not waited for.
pub struct AlertLayer {
    program: String,
    args: Vec<String>,
    threshold: Level,
}

impl AlertLayer {
    pub fn new(command: Vec<String>, alert_level: &str) -> Result<Self> {
        let threshold: Level = alert_level
            .parse()
            .with_context(|| format!("Invalid logging.alert_level `{}`", alert_level))?;
        let mut command = command.into_iter();
        let program = command
            .next()
            .filter(|program| !program.trim().is_empty())
            .context("logging.alert_command cannot be empty")?;
        Ok(Self {
            program,
            args: command.collect(),
            threshold,
        })
    }

    /// `tracing` orders levels by verbosity, so ERROR < WARN < INFO
    fn triggers(&self, level: &Level) -> bool {
        *level <= self.threshold
    }

    fn dispatch(&self, text: String) {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            // Logging from here would alert again
            Err(e) => eprintln!("alert command `{}` failed: {}", self.program, e),
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = event.metadata().level();
        if !self.triggers(level) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.dispatch(format!("{} {}", level, visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}
