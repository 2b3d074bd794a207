//! Progress parsers
//!
//! A parser turns the text a plotter appended to its progress file into a
//! [`ProgressStatus`]. Parsers only ever see complete lines: whatever
//! follows the last newline is an in-progress write and is held back until
//! the next read, so a truncated file can never look like a failure.

mod chia;
mod madmax;
mod marker;
mod pattern;

use serde::Serialize;
use std::path::PathBuf;

pub use chia::ChiaParser;
pub use madmax::MadMaxParser;
pub use marker::StringParser;
pub use pattern::RegexParser;

/// Prefix of the instance header line written before the plotter starts
pub const HEADER_PREFIX: &str = "# plotbot";

/// Terminal state reported by a plotter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Terminal {
    /// Plot finished; the path is known when the plotter printed it
    Success { artifact: Option<PathBuf> },
    Failure { reason: String },
}

/// Structured view of a progress file
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressStatus {
    pub stage: Option<String>,
    pub percent: Option<f32>,
    pub terminal: Option<Terminal>,
}

impl ProgressStatus {
    pub fn is_success(&self) -> bool {
        matches!(self.terminal, Some(Terminal::Success { .. }))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.terminal, Some(Terminal::Failure { .. }))
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.terminal {
            Some(Terminal::Success { artifact: Some(path) }) => {
                return write!(f, "finished: {}", path.display())
            }
            Some(Terminal::Success { artifact: None }) => return write!(f, "finished"),
            Some(Terminal::Failure { reason }) => return write!(f, "failed: {}", reason),
            None => {}
        }
        match (&self.stage, self.percent) {
            (Some(stage), Some(percent)) => write!(f, "{} ({:.0}%)", stage, percent),
            (Some(stage), None) => write!(f, "{}", stage),
            (None, Some(percent)) => write!(f, "{:.0}%", percent),
            (None, None) => write!(f, "waiting for output"),
        }
    }
}

/// Result of reading a progress file
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Status(ProgressStatus),
    /// Content that is corrupt rather than merely incomplete
    Malformed(String),
}

/// Parser for one plotter's output format
pub trait ProgressParser: Send + Sync {
    fn name(&self) -> &str;

    /// Interpret complete lines, oldest first
    ///
    /// Returns `Err` with a description when the content cannot come from a
    /// healthy plotter.
    fn parse_lines(&self, lines: &[&str]) -> std::result::Result<ProgressStatus, String>;
}

/// Run `parser` over raw progress file bytes
pub fn parse_progress(parser: &dyn ProgressParser, raw: &[u8]) -> ParseOutcome {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        // Cut inside a multi-byte sequence: still being written
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(e) => {
            return ParseOutcome::Malformed(format!(
                "invalid UTF-8 at byte {}",
                e.valid_up_to()
            ))
        }
    };

    let complete = match text.rfind('\n') {
        Some(end) => &text[..=end],
        None => "",
    };

    let lines: Vec<&str> = complete
        .lines()
        .filter(|line| !line.starts_with(HEADER_PREFIX))
        .collect();

    if let Some(index) = lines.iter().position(|line| line.contains('\0')) {
        return ParseOutcome::Malformed(format!("binary data on line {}", index + 1));
    }

    match parser.parse_lines(&lines) {
        Ok(status) => ParseOutcome::Status(status),
        Err(message) => ParseOutcome::Malformed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LineCounter;

    impl ProgressParser for LineCounter {
        fn name(&self) -> &str {
            "count"
        }

        fn parse_lines(&self, lines: &[&str]) -> std::result::Result<ProgressStatus, String> {
            if lines.iter().any(|l| *l == "corrupt") {
                return Err("corrupt line".to_string());
            }
            Ok(ProgressStatus {
                stage: Some(lines.len().to_string()),
                ..Default::default()
            })
        }
    }

    fn stage_of(outcome: ParseOutcome) -> String {
        match outcome {
            ParseOutcome::Status(status) => status.stage.unwrap_or_default(),
            ParseOutcome::Malformed(m) => panic!("unexpected malformed: {}", m),
        }
    }

    #[test]
    fn test_unterminated_line_is_held_back() {
        assert_eq!(stage_of(parse_progress(&LineCounter, b"a\nb\nhalf")), "2");
        assert_eq!(stage_of(parse_progress(&LineCounter, b"")), "0");
    }

    #[test]
    fn test_header_is_ignored() {
        let raw = b"# plotbot instance=abc profile=p\nline\n";
        assert_eq!(stage_of(parse_progress(&LineCounter, raw)), "1");
    }

    #[test]
    fn test_truncated_utf8_is_partial() {
        // "é" is 0xC3 0xA9; cut after the first byte
        let raw = b"done\ncaf\xC3";
        assert_eq!(stage_of(parse_progress(&LineCounter, raw)), "1");
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let raw = b"ok\n\xFF\xFEgarbage\n";
        assert!(matches!(
            parse_progress(&LineCounter, raw),
            ParseOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_binary_data_is_malformed() {
        let raw = b"ok\n\0\0\0\n";
        assert!(matches!(
            parse_progress(&LineCounter, raw),
            ParseOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_parser_rejection_is_malformed() {
        assert_eq!(
            parse_progress(&LineCounter, b"corrupt\n"),
            ParseOutcome::Malformed("corrupt line".to_string())
        );
        // Not yet a complete line, so not judged
        assert_eq!(stage_of(parse_progress(&LineCounter, b"corrupt")), "0");
    }

    #[test]
    fn test_status_display() {
        let status = ProgressStatus {
            stage: Some("phase 2/4".to_string()),
            percent: Some(37.6),
            terminal: None,
        };
        assert_eq!(status.to_string(), "phase 2/4 (38%)");

        let failed = ProgressStatus {
            terminal: Some(Terminal::Failure {
                reason: "out of space".to_string(),
            }),
            ..Default::default()
        };
        assert!(failed.is_failure());
        assert_eq!(failed.to_string(), "failed: out of space");
    }
}
