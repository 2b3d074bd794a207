//! Parser for the reference `chia plots create` plotter

use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use super::{ProgressParser, ProgressStatus, Terminal};

struct Patterns {
    phase_started: Regex,
    progress: Regex,
    renamed: Regex,
    failure: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        phase_started: Regex::new(r"^Starting phase (\d)/4").expect("valid regex"),
        progress: Regex::new(r"^Progress update: (\S+)").expect("valid regex"),
        renamed: Regex::new(r#"^Renamed final file from "[^"]*" to "([^"]+)""#)
            .expect("valid regex"),
        failure: Regex::new(r"^(Caught plotting error: .*|Traceback \(most recent call last\)|ERROR.*)$")
            .expect("valid regex"),
    })
}

/// Understands the phase banners, `Progress update` fractions and the final
/// rename line of the reference plotter
#[derive(Debug, Clone, Default)]
pub struct ChiaParser;

impl ProgressParser for ChiaParser {
    fn name(&self) -> &str {
        "chia"
    }

    fn parse_lines(&self, lines: &[&str]) -> std::result::Result<ProgressStatus, String> {
        let p = patterns();
        let mut status = ProgressStatus::default();

        for &line in lines {
            let line = line.trim_end();
            if let Some(caps) = p.failure.captures(line) {
                status.terminal = Some(Terminal::Failure {
                    reason: caps[1].to_string(),
                });
                return Ok(status);
            }

            if let Some(caps) = p.phase_started.captures(line) {
                let phase: u32 = caps[1].parse().map_err(|_| format!("bad phase line: {}", line))?;
                if !(1..=4).contains(&phase) {
                    return Err(format!("unknown phase {}", phase));
                }
                status.stage = Some(format!("phase {}/4", phase));
            } else if let Some(caps) = p.progress.captures(line) {
                let fraction: f32 = caps[1]
                    .parse()
                    .map_err(|_| format!("unreadable progress update `{}`", &caps[1]))?;
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(format!("progress update out of range: {}", fraction));
                }
                status.percent = Some(fraction * 100.0);
            } else if let Some(caps) = p.renamed.captures(line) {
                status.stage = Some("finished".to_string());
                status.percent = Some(100.0);
                status.terminal = Some(Terminal::Success {
                    artifact: Some(PathBuf::from(&caps[1])),
                });
            }
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"Starting plotting progress into temporary dirs: /cache/a and /cache/b
Plot size is: 32
Using 128 buckets
Starting phase 1/4: Forward Propagation into tmp files... Sat Jun 19 10:00:00 2021
Progress update: 0.010
Time for phase 1 = 8000.123 seconds. CPU (170.000%) Sat Jun 19 12:13:20 2021
Starting phase 2/4: Backpropagation into tmp files... Sat Jun 19 12:13:20 2021
Progress update: 0.420
Starting phase 3/4: Compression from tmp files into "/cache/a/plot.2.tmp" ... Sat Jun 19 14:00:00 2021
Starting phase 4/4: Write Checkpoint tables into "/cache/a/plot.2.tmp" ... Sat Jun 19 16:00:00 2021
Progress update: 0.980
Total time = 30000.1 seconds. CPU (150.000%) Sat Jun 19 18:20:00 2021
Copied final file from "/cache/a/plot.2.tmp" to "/cache/a/out/plot-k32-x.plot.2.tmp"
Renamed final file from "/cache/a/out/plot-k32-x.plot.2.tmp" to "/cache/a/out/plot-k32-x.plot"
"#;

    #[test]
    fn test_full_log_is_success_with_path() {
        let lines: Vec<&str> = LOG.lines().collect();
        let status = ChiaParser.parse_lines(&lines).unwrap();
        assert_eq!(
            status.terminal,
            Some(Terminal::Success {
                artifact: Some(PathBuf::from("/cache/a/out/plot-k32-x.plot"))
            })
        );
    }

    #[test]
    fn test_mid_run_progress() {
        let lines: Vec<&str> = LOG.lines().take(8).collect();
        let status = ChiaParser.parse_lines(&lines).unwrap();
        assert_eq!(status.stage.as_deref(), Some("phase 2/4"));
        assert!((status.percent.unwrap() - 42.0).abs() < 0.01);
        assert_eq!(status.terminal, None);
    }

    #[test]
    fn test_plotting_error() {
        let status = ChiaParser
            .parse_lines(&[
                "Starting phase 1/4: Forward Propagation",
                "Caught plotting error: Insufficient memory",
            ])
            .unwrap();
        assert_eq!(
            status.terminal,
            Some(Terminal::Failure {
                reason: "Caught plotting error: Insufficient memory".to_string()
            })
        );
    }

    #[test]
    fn test_garbage_progress_is_malformed() {
        assert!(ChiaParser.parse_lines(&["Progress update: lots"]).is_err());
        assert!(ChiaParser.parse_lines(&["Progress update: 7.5"]).is_err());
    }
}
