//! Substring marker parser

use plotbot_core::{PlotError, Result};

use super::{ProgressParser, ProgressStatus, Terminal};

/// Reports success once a line contains the success marker and failure
/// once a line contains the (optional) failure marker
///
/// Arguments: `[success_marker, failure_marker?]`.
#[derive(Debug, Clone)]
pub struct StringParser {
    success: String,
    failure: Option<String>,
}

impl StringParser {
    pub fn new(success: impl Into<String>) -> Self {
        Self {
            success: success.into(),
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        match args {
            [success] if !success.is_empty() => Ok(Self::new(success)),
            [success, failure] if !success.is_empty() && !failure.is_empty() => {
                Ok(Self::new(success).with_failure(failure))
            }
            _ => Err(PlotError::config(
                "string parser expects [success_marker, failure_marker?]",
            )),
        }
    }
}

impl ProgressParser for StringParser {
    fn name(&self) -> &str {
        "string"
    }

    fn parse_lines(&self, lines: &[&str]) -> std::result::Result<ProgressStatus, String> {
        let mut status = ProgressStatus {
            stage: lines
                .iter()
                .rev()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .map(str::to_string),
            ..Default::default()
        };

        if let Some(failure) = &self.failure {
            if let Some(line) = lines.iter().find(|l| l.contains(failure.as_str())) {
                status.terminal = Some(Terminal::Failure {
                    reason: line.trim().to_string(),
                });
                return Ok(status);
            }
        }

        if lines.iter().any(|l| l.contains(self.success.as_str())) {
            status.terminal = Some(Terminal::Success { artifact: None });
            status.percent = Some(100.0);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_success_marker() {
        let parser = StringParser::from_args(&args(&["Plot done"])).unwrap();

        let running = parser.parse_lines(&["working", "still working"]).unwrap();
        assert_eq!(running.terminal, None);
        assert_eq!(running.stage.as_deref(), Some("still working"));

        let done = parser.parse_lines(&["working", "Plot done in 3h"]).unwrap();
        assert!(done.is_success());
    }

    #[test]
    fn test_failure_marker_wins() {
        let parser = StringParser::new("done").with_failure("FATAL");
        let status = parser.parse_lines(&["FATAL: disk full", "done"]).unwrap();
        assert_eq!(
            status.terminal,
            Some(Terminal::Failure {
                reason: "FATAL: disk full".to_string()
            })
        );
    }

    #[test]
    fn test_bad_args() {
        assert!(StringParser::from_args(&[]).is_err());
        assert!(StringParser::from_args(&args(&[""])).is_err());
        assert!(StringParser::from_args(&args(&["a", "b", "c"])).is_err());
    }
}
