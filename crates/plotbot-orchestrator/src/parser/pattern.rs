//! Regular-expression driven parser

use plotbot_core::{PlotError, Result};
use regex::Regex;
use std::path::PathBuf;

use super::{ProgressParser, ProgressStatus, Terminal};

/// Structured-line parser configured with `key=pattern` arguments
///
/// - `success=<re>`: required; an optional `path` group captures the plot
/// - `failure=<re>`: optional; an optional `reason` group captures the cause
/// - `progress=<re>`: optional; groups `stage` and/or `percent`
///
/// The last matching progress line wins.
#[derive(Debug, Clone)]
pub struct RegexParser {
    success: Regex,
    failure: Option<Regex>,
    progress: Option<Regex>,
}

fn compile(key: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| PlotError::config(format!("regex parser: invalid {} pattern: {}", key, e)))
}

impl RegexParser {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut success = None;
        let mut failure = None;
        let mut progress = None;

        for arg in args {
            let (key, pattern) = arg.split_once('=').ok_or_else(|| {
                PlotError::config(format!("regex parser: expected key=pattern, got `{}`", arg))
            })?;
            match key.trim() {
                "success" => success = Some(compile(key, pattern)?),
                "failure" => failure = Some(compile(key, pattern)?),
                "progress" => progress = Some(compile(key, pattern)?),
                other => {
                    return Err(PlotError::config(format!(
                        "regex parser: unknown key `{}`",
                        other
                    )))
                }
            }
        }

        let success =
            success.ok_or_else(|| PlotError::config("regex parser: a success pattern is required"))?;
        Ok(Self {
            success,
            failure,
            progress,
        })
    }
}

impl ProgressParser for RegexParser {
    fn name(&self) -> &str {
        "regex"
    }

    fn parse_lines(&self, lines: &[&str]) -> std::result::Result<ProgressStatus, String> {
        let mut status = ProgressStatus::default();

        for &line in lines {
            if let Some(progress) = &self.progress {
                if let Some(caps) = progress.captures(line) {
                    if let Some(stage) = caps.name("stage") {
                        status.stage = Some(stage.as_str().to_string());
                    }
                    if let Some(percent) = caps.name("percent") {
                        let value: f32 = percent
                            .as_str()
                            .parse()
                            .map_err(|_| format!("unreadable percentage `{}`", percent.as_str()))?;
                        if !(0.0..=100.0).contains(&value) {
                            return Err(format!("percentage out of range: {}", value));
                        }
                        status.percent = Some(value);
                    }
                }
            }

            if let Some(failure) = &self.failure {
                if let Some(caps) = failure.captures(line) {
                    let reason = caps
                        .name("reason")
                        .map(|m| m.as_str())
                        .unwrap_or(line)
                        .trim()
                        .to_string();
                    status.terminal = Some(Terminal::Failure { reason });
                    return Ok(status);
                }
            }

            if let Some(caps) = self.success.captures(line) {
                let artifact = caps.name("path").map(|m| PathBuf::from(m.as_str().trim()));
                status.terminal = Some(Terminal::Success { artifact });
                status.percent = Some(100.0);
            }
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RegexParser {
        RegexParser::from_args(&[
            r"success=^DONE (?P<path>\S+)$".to_string(),
            r"failure=^ERR (?P<reason>.+)$".to_string(),
            r"progress=^\[(?P<stage>\w+)\] (?P<percent>[\d.]+)%$".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn test_progress_then_success() {
        let parser = parser();

        let status = parser.parse_lines(&["[copy] 10%", "[write] 55.5%"]).unwrap();
        assert_eq!(status.stage.as_deref(), Some("write"));
        assert_eq!(status.percent, Some(55.5));
        assert_eq!(status.terminal, None);

        let status = parser
            .parse_lines(&["[write] 99%", "DONE /out/plot-k32-a.plot"])
            .unwrap();
        assert_eq!(
            status.terminal,
            Some(Terminal::Success {
                artifact: Some(PathBuf::from("/out/plot-k32-a.plot"))
            })
        );
    }

    #[test]
    fn test_failure_reason_group() {
        let status = parser().parse_lines(&["ERR no space left"]).unwrap();
        assert_eq!(
            status.terminal,
            Some(Terminal::Failure {
                reason: "no space left".to_string()
            })
        );
    }

    #[test]
    fn test_out_of_range_percent_is_malformed() {
        assert!(parser().parse_lines(&["[write] 250%"]).is_err());
    }

    #[test]
    fn test_config_errors() {
        assert!(RegexParser::from_args(&[]).is_err());
        assert!(RegexParser::from_args(&["progress=x".to_string()]).is_err());
        assert!(RegexParser::from_args(&["success=(".to_string()]).is_err());
        assert!(RegexParser::from_args(&["success".to_string()]).is_err());
        assert!(RegexParser::from_args(&["other=x".to_string(), "success=y".to_string()]).is_err());
    }
}
