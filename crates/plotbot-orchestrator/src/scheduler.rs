//! Scheduling driver
//!
//! Two clocks drive the service: a fixed interval timer decides when a tick
//! runs, and a cron expression decides whether that tick may start new
//! instances. Supervision runs on every tick regardless of the cron gate.

use chrono::{DateTime, Utc};
use cron::Schedule;
use plotbot_core::{PlotBotConfig, PlotError, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::orchestrator::{Orchestrator, TickReport};

/// Cron-style gate for new starts
#[derive(Debug, Clone)]
pub struct CronGate {
    expression: String,
    schedule: Schedule,
}

impl CronGate {
    /// Parse a cron expression
    ///
    /// Five-field expressions (`min hour dom month dow`) get a leading `0`
    /// seconds field.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let full = match expression.split_whitespace().count() {
            5 => format!("0 {}", expression),
            _ => expression.to_string(),
        };
        let schedule = Schedule::from_str(&full).map_err(|e| {
            PlotError::config(format!("Invalid plotting window `{}`: {}", expression, e))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// True when the schedule fires in `(previous, now]`
    pub fn fired_between(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.schedule
            .after(&previous)
            .next()
            .is_some_and(|fire| fire <= now)
    }
}

/// Handle used to stop a running [`PlotBotService`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<()>,
}

impl ShutdownHandle {
    /// Ask the service to stop after the current tick
    pub async fn stop(&self) {
        info!("Stopping service");
        let _ = self.tx.send(()).await;
    }
}

/// Long-running service: ticks the orchestrator until stopped
pub struct PlotBotService {
    orchestrator: Arc<Orchestrator>,
    gate: CronGate,
    interval: Duration,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl PlotBotService {
    pub fn new(orchestrator: Arc<Orchestrator>, gate: CronGate, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            orchestrator,
            gate,
            interval,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Build the service from the `[settings]` section
    pub fn from_config(orchestrator: Arc<Orchestrator>, config: &PlotBotConfig) -> Result<Self> {
        let gate = CronGate::parse(&config.settings.plotting_window)?;
        Ok(Self::new(
            orchestrator,
            gate,
            Duration::from_secs(config.settings.interval_secs),
        ))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// One tick at `now`, given when the previous tick ran
    pub async fn tick_once(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> TickReport {
        let window_open = self.gate.fired_between(previous, now);
        if !window_open {
            debug!("Plotting window `{}` closed", self.gate.expression());
        }
        self.orchestrator.tick_at(now, window_open).await
    }

    /// Tick until [`ShutdownHandle::stop`] is called
    ///
    /// Plotter processes keep running after shutdown; a restart adopts them
    /// from their progress files.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Starting service: tick every {}s, plotting window `{}`",
            self.interval.as_secs(),
            self.gate.expression()
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let step = chrono::Duration::from_std(self.interval)
            .map_err(|e| PlotError::config(format!("Invalid tick interval: {}", e)))?;
        let mut previous = Utc::now() - step;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let now = Utc::now();
                    let report = self.tick_once(previous, now).await;
                    previous = now;
                    if report.started + report.succeeded + report.failed > 0 {
                        info!(
                            "Tick: {} started, {} finished, {} failed, {} active",
                            report.started, report.succeeded, report.failed, report.active
                        );
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!("Waiting for running relocations...");
        self.orchestrator.drain_relocations().await;
        info!("Service stopped");
        Ok(())
    }
}
