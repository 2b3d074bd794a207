//! Pure state machine for the plot instance lifecycle
//!
//! This module implements a pure functional state machine with NO I/O.
//! All state transitions are deterministic and testable.
//!
//! Key design principles:
//! - Pure function: transition(state, event) -> (state, actions)
//! - No async, no I/O
//! - Invalid transitions go to Failed state (never panic)
//! - Relocating is the first half of success: the plot exists but has not
//!   reached a destination yet

use plotbot_host::ExitState;
use std::path::PathBuf;

/// Instance state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Launch requested, process not confirmed yet
    Starting,
    /// Plotter running; progress file read every tick
    Monitoring {
        /// Consecutive unreadable progress reads
        parse_errors: u32,
        /// Exited with code 0 before reporting success; one more read allowed
        exit_pending: bool,
    },
    /// Plot finished, waiting for a destination
    Relocating { artifact: PathBuf, attempts: u32 },
    /// Plot moved to its destination
    Succeeded { destination: PathBuf },
    /// Failed with reason
    Failed { reason: String },
}

impl State {
    pub fn monitoring() -> Self {
        Self::Monitoring {
            parse_errors: 0,
            exit_pending: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Monitoring { .. } => "monitoring",
            Self::Relocating { .. } => "relocating",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Process spawned
    Launched { pid: Option<u32> },
    /// Spawn failed
    LaunchFailed { reason: String },
    /// Progress file read and parsed without a terminal state
    ProgressRead,
    /// Progress file content is corrupt
    MalformedRead { message: String, limit: u32 },
    /// Parser reported success and the plot was located
    PlotCompleted { artifact: PathBuf },
    /// Parser reported failure
    PlotFailed { reason: String },
    /// Process exited without the parser reporting success
    ProcessExited { exit: ExitState },
    /// Process is gone and can no longer be observed
    ProcessVanished,
    /// No destination could take the plot this time
    RelocationDeferred { reason: String },
    /// Plot moved
    Relocated { destination: PathBuf },
    /// Error occurred
    Error { message: String },
}

/// Severity of a lifecycle log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Actions to execute as side effects of transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Log a lifecycle message
    Log { level: Level, message: String },
    /// Move the plot to a destination, in the background
    StartRelocation { artifact: PathBuf },
    /// Archive or delete the progress file and remove the temporary output
    Finalize,
    /// Remove temporary output and progress file unless retention is on
    CleanupFailed,
    /// Count a failure against the profile's retry backoff
    ReportFailure { reason: String },
    /// Reset the profile's retry backoff
    ReportSuccess,
}

fn log(level: Level, message: impl Into<String>) -> Action {
    Action::Log {
        level,
        message: message.into(),
    }
}

fn fail(reason: String) -> (State, Vec<Action>) {
    let actions = vec![
        log(Level::Error, format!("Instance failed: {}", reason)),
        Action::CleanupFailed,
        Action::ReportFailure {
            reason: reason.clone(),
        },
    ];
    (State::Failed { reason }, actions)
}

/// Pure state transition function
///
/// Takes current state and event, returns new state and actions to execute.
/// This function is completely deterministic and has no side effects.
///
/// # Invalid Transitions
/// Any invalid transition results in a Failed state with descriptive error
/// and no actions. This function never panics.
pub fn transition(state: State, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        // From Starting state
        (State::Starting, Event::Launched { pid }) => {
            let pid = pid.map_or_else(|| "unknown".to_string(), |p| p.to_string());
            (
                State::monitoring(),
                vec![log(Level::Info, format!("Plotter started (pid {})", pid))],
            )
        }

        (State::Starting, Event::LaunchFailed { reason }) => {
            fail(format!("launch error: {}", reason))
        }

        // From Monitoring state
        (State::Monitoring { exit_pending, .. }, Event::ProgressRead) => {
            if exit_pending {
                fail("exited without completion marker".to_string())
            } else {
                (State::monitoring(), vec![])
            }
        }

        (
            State::Monitoring {
                parse_errors,
                exit_pending,
            },
            Event::MalformedRead { message, limit },
        ) => {
            let parse_errors = parse_errors + 1;
            if parse_errors > limit {
                fail(format!(
                    "progress unreadable for {} consecutive reads: {}",
                    parse_errors, message
                ))
            } else {
                (
                    State::Monitoring {
                        parse_errors,
                        exit_pending,
                    },
                    vec![log(
                        Level::Warn,
                        format!("Monitoring error ({}/{}): {}", parse_errors, limit, message),
                    )],
                )
            }
        }

        (State::Monitoring { .. }, Event::PlotCompleted { artifact }) => {
            let actions = vec![
                log(
                    Level::Info,
                    format!("Plot finished: {}", artifact.display()),
                ),
                Action::StartRelocation {
                    artifact: artifact.clone(),
                },
            ];
            (
                State::Relocating {
                    artifact,
                    attempts: 0,
                },
                actions,
            )
        }

        (State::Monitoring { .. }, Event::PlotFailed { reason }) => {
            fail(format!("plotter reported failure: {}", reason))
        }

        (State::Monitoring { exit_pending, .. }, Event::ProcessExited { exit }) => match exit {
            ExitState::Success if !exit_pending => (
                State::Monitoring {
                    parse_errors: 0,
                    exit_pending: true,
                },
                vec![log(
                    Level::Debug,
                    "Plotter exited cleanly, waiting for completion marker",
                )],
            ),
            ExitState::Success => fail("exited without completion marker".to_string()),
            ExitState::Failed(_) => fail(format!("plotter exited abnormally ({})", exit)),
        },

        (State::Monitoring { .. }, Event::ProcessVanished) => {
            fail("plotter process vanished".to_string())
        }

        // From Relocating state
        (State::Relocating { artifact, attempts }, Event::RelocationDeferred { reason }) => {
            let attempts = attempts + 1;
            let level = if attempts == 1 { Level::Warn } else { Level::Debug };
            (
                State::Relocating { artifact, attempts },
                vec![log(
                    level,
                    format!("Relocation deferred (attempt {}): {}", attempts, reason),
                )],
            )
        }

        (State::Relocating { .. }, Event::Relocated { destination }) => {
            let actions = vec![
                log(
                    Level::Info,
                    format!("Plot relocated to {}", destination.display()),
                ),
                Action::Finalize,
                Action::ReportSuccess,
            ];
            (State::Succeeded { destination }, actions)
        }

        // The finished plot disappeared before it could be moved
        (State::Relocating { .. }, Event::PlotFailed { reason }) => {
            fail(format!("plot lost before relocation: {}", reason))
        }

        // Error events from any non-terminal state
        (State::Starting, Event::Error { message })
        | (State::Monitoring { .. }, Event::Error { message }) => fail(message),

        // A relocating plot is finished work; errors only defer it
        (State::Relocating { artifact, attempts }, Event::Error { message }) => (
            State::Relocating { artifact, attempts },
            vec![log(Level::Warn, format!("Relocation error: {}", message))],
        ),

        // Terminal states - no valid transitions
        (State::Succeeded { destination }, event) => (
            State::Failed {
                reason: format!(
                    "Invalid transition from Succeeded state (destination: {}) on event: {:?}",
                    destination.display(),
                    event
                ),
            },
            vec![],
        ),

        (State::Failed { reason }, event) => (
            State::Failed {
                reason: format!(
                    "Invalid transition from Failed state (reason: {}) on event: {:?}",
                    reason, event
                ),
            },
            vec![],
        ),

        // All other invalid transitions
        (state, event) => (
            State::Failed {
                reason: format!(
                    "Invalid state transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
            vec![],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> Event {
        Event::PlotCompleted {
            artifact: PathBuf::from("/cache/a/id/plot-k32-x.plot"),
        }
    }

    #[test]
    fn test_happy_path_full_flow() {
        // Starting -> Monitoring
        let (state, actions) = transition(State::Starting, Event::Launched { pid: Some(42) });
        assert_eq!(state, State::monitoring());
        assert_eq!(actions.len(), 1);

        // Monitoring -> Monitoring
        let (state, actions) = transition(state, Event::ProgressRead);
        assert_eq!(state, State::monitoring());
        assert!(actions.is_empty());

        // Monitoring -> Relocating
        let (state, actions) = transition(state, completed());
        assert!(matches!(state, State::Relocating { attempts: 0, .. }));
        assert!(matches!(actions[1], Action::StartRelocation { .. }));

        // Relocating -> Relocating (deferred)
        let (state, _) = transition(
            state,
            Event::RelocationDeferred {
                reason: "no space".to_string(),
            },
        );
        assert!(matches!(state, State::Relocating { attempts: 1, .. }));

        // Relocating -> Succeeded
        let (state, actions) = transition(
            state,
            Event::Relocated {
                destination: PathBuf::from("/hdd/plot-k32-x.plot"),
            },
        );
        assert!(matches!(state, State::Succeeded { .. }));
        assert!(state.is_terminal());
        assert!(actions.contains(&Action::Finalize));
        assert!(actions.contains(&Action::ReportSuccess));
    }

    #[test]
    fn test_launch_failure() {
        let (state, actions) = transition(
            State::Starting,
            Event::LaunchFailed {
                reason: "no such file".to_string(),
            },
        );
        assert!(matches!(state, State::Failed { ref reason } if reason.contains("launch error")));
        assert!(actions.contains(&Action::CleanupFailed));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ReportFailure { .. })));
    }

    #[test]
    fn test_starting_never_skips_monitoring() {
        let (state, actions) = transition(State::Starting, completed());
        assert!(matches!(state, State::Failed { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_parse_errors_tolerated_up_to_limit() {
        let malformed = || Event::MalformedRead {
            message: "binary data".to_string(),
            limit: 2,
        };

        let (state, _) = transition(State::monitoring(), malformed());
        let (state, actions) = transition(state, malformed());
        assert!(matches!(state, State::Monitoring { parse_errors: 2, .. }));
        assert!(matches!(actions[0], Action::Log { level: Level::Warn, .. }));

        // A good read resets the counter
        let (reset, _) = transition(state.clone(), Event::ProgressRead);
        assert_eq!(reset, State::monitoring());

        let (state, actions) = transition(state, malformed());
        assert!(matches!(state, State::Failed { .. }));
        assert!(actions.contains(&Action::CleanupFailed));
    }

    #[test]
    fn test_clean_exit_gets_one_more_read() {
        let (state, _) = transition(
            State::monitoring(),
            Event::ProcessExited {
                exit: ExitState::Success,
            },
        );
        assert!(matches!(state, State::Monitoring { exit_pending: true, .. }));

        // Completion marker shows up on the extra read
        let (done, _) = transition(state.clone(), completed());
        assert!(matches!(done, State::Relocating { .. }));

        // Or it does not
        let (failed, _) = transition(state, Event::ProgressRead);
        assert!(
            matches!(failed, State::Failed { ref reason } if reason.contains("completion marker"))
        );
    }

    #[test]
    fn test_abnormal_exit() {
        let (state, actions) = transition(
            State::monitoring(),
            Event::ProcessExited {
                exit: ExitState::Failed(Some(137)),
            },
        );
        assert!(matches!(state, State::Failed { ref reason } if reason.contains("137")));
        assert!(actions.contains(&Action::CleanupFailed));
    }

    #[test]
    fn test_error_from_non_terminal_states() {
        let (state, _) = transition(
            State::monitoring(),
            Event::Error {
                message: "boom".to_string(),
            },
        );
        assert!(matches!(state, State::Failed { .. }));

        // Relocating keeps the plot
        let relocating = State::Relocating {
            artifact: PathBuf::from("/cache/p.plot"),
            attempts: 3,
        };
        let (state, actions) = transition(
            relocating.clone(),
            Event::Error {
                message: "copy failed".to_string(),
            },
        );
        assert_eq!(state, relocating);
        assert!(!actions.contains(&Action::CleanupFailed));
    }

    #[test]
    fn test_lost_plot_fails_relocation() {
        let relocating = State::Relocating {
            artifact: PathBuf::from("/cache/p.plot"),
            attempts: 1,
        };
        let (state, actions) = transition(
            relocating,
            Event::PlotFailed {
                reason: "not found".to_string(),
            },
        );
        assert!(matches!(state, State::Failed { ref reason } if reason.contains("plot lost")));
        assert!(actions.contains(&Action::CleanupFailed));
    }

    #[test]
    fn test_terminal_states_reject_all_events() {
        let succeeded = State::Succeeded {
            destination: PathBuf::from("/hdd/p.plot"),
        };
        let (state, actions) = transition(succeeded, Event::ProgressRead);
        assert!(matches!(state, State::Failed { .. }));
        assert!(actions.is_empty());

        let failed = State::Failed {
            reason: "Original error".to_string(),
        };
        let (state, actions) = transition(failed, Event::Launched { pid: None });
        assert!(matches!(state, State::Failed { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_labels() {
        assert_eq!(State::Starting.label(), "starting");
        assert_eq!(State::monitoring().label(), "monitoring");
        assert!(!State::monitoring().is_terminal());
    }
}
