//! Parser for the madMAx pipelined plotter

use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use super::{ProgressParser, ProgressStatus, Terminal};

struct Patterns {
    table: Regex,
    phase_done: Regex,
    total: Regex,
    copy_started: Regex,
    copy_finished: Regex,
    renamed: Regex,
    failure: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        table: Regex::new(r"^\[P1\] Table (\d) took").expect("valid regex"),
        phase_done: Regex::new(r"^Phase (\d) took").expect("valid regex"),
        total: Regex::new(r"^Total plot creation time was").expect("valid regex"),
        copy_started: Regex::new(r"^Started copy to (.+)$").expect("valid regex"),
        copy_finished: Regex::new(r"^Copy to (.+?) finished").expect("valid regex"),
        renamed: Regex::new(r"^Renamed final plot to (.+)$").expect("valid regex"),
        failure: Regex::new(r"terminate called|what\(\):|^(?i:error|exception)\b")
            .expect("valid regex"),
    })
}

/// Understands `chia_plot` output: P1 tables, `Phase N took`, the total
/// time line and the final copy or rename
///
/// Success needs the total time line followed by the line that places the
/// plot: `Copy to ... finished` or `Renamed final plot to ...`. The total
/// line alone is not enough since the copy is announced after it.
#[derive(Debug, Clone, Default)]
pub struct MadMaxParser;

impl ProgressParser for MadMaxParser {
    fn name(&self) -> &str {
        "madmax"
    }

    fn parse_lines(&self, lines: &[&str]) -> std::result::Result<ProgressStatus, String> {
        let p = patterns();
        let mut phases_done = 0u32;
        let mut tables_done = 0u32;
        let mut created = false;
        let mut copying = false;
        let mut placed = false;
        let mut artifact: Option<PathBuf> = None;

        for &line in lines {
            let line = line.trim_end();
            if p.failure.is_match(line) {
                return Ok(ProgressStatus {
                    stage: Some(format!("phase {}/4", (phases_done + 1).min(4))),
                    percent: None,
                    terminal: Some(Terminal::Failure {
                        reason: line.trim().to_string(),
                    }),
                });
            }

            if let Some(caps) = p.table.captures(line) {
                tables_done = caps[1].parse().map_err(|_| format!("bad table line: {}", line))?;
            } else if let Some(caps) = p.phase_done.captures(line) {
                let phase: u32 = caps[1].parse().map_err(|_| format!("bad phase line: {}", line))?;
                if !(1..=4).contains(&phase) {
                    return Err(format!("unknown phase {}", phase));
                }
                phases_done = phases_done.max(phase);
            } else if p.total.is_match(line) {
                created = true;
                phases_done = 4;
            } else if let Some(caps) = p.copy_started.captures(line) {
                copying = true;
                placed = false;
                artifact = Some(PathBuf::from(caps[1].trim()));
            } else if let Some(caps) = p.copy_finished.captures(line) {
                copying = false;
                placed = true;
                artifact = Some(PathBuf::from(caps[1].trim()));
            } else if let Some(caps) = p.renamed.captures(line) {
                placed = true;
                artifact = Some(PathBuf::from(caps[1].trim()));
            }
        }

        if created && placed && !copying {
            return Ok(ProgressStatus {
                stage: Some("finished".to_string()),
                percent: Some(100.0),
                terminal: Some(Terminal::Success { artifact }),
            });
        }

        let (stage, percent) = if created && copying {
            ("copying".to_string(), 100.0)
        } else if created {
            ("finishing".to_string(), 100.0)
        } else if phases_done == 0 {
            (
                "phase 1/4".to_string(),
                tables_done.min(7) as f32 / 7.0 * 25.0,
            )
        } else {
            (
                format!("phase {}/4", (phases_done + 1).min(4)),
                phases_done as f32 * 25.0,
            )
        };

        Ok(ProgressStatus {
            stage: Some(stage),
            percent: Some(percent),
            terminal: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
Multi-threaded pipelined Chia k32 plotter - 974d6e5
Number of Threads: 8
Plot Name: plot-k32-2021-06-19-10-29-aa11
[P1] Table 1 took 17.1 sec
[P1] Table 2 took 142.6 sec, found 4294967296 matches
Phase 1 took 1023.7 sec
Phase 2 took 400.1 sec
Phase 3 took 800.2 sec, wrote 21877166749 entries to final plot
Phase 4 took 75.1 sec, final plot size is 108835845369 bytes
Total plot creation time was 2300.5 sec (38.3 min)
Started copy to /cache/abc/plot-k32-2021-06-19-10-29-aa11.plot
Copy to /cache/abc/plot-k32-2021-06-19-10-29-aa11.plot finished, took 3.1 sec, 1000 MB/s avg.
";

    fn parse(text: &str) -> ProgressStatus {
        let lines: Vec<&str> = text.lines().collect();
        MadMaxParser.parse_lines(&lines).unwrap()
    }

    #[test]
    fn test_full_log_is_success() {
        let status = parse(LOG);
        assert_eq!(
            status.terminal,
            Some(Terminal::Success {
                artifact: Some(PathBuf::from(
                    "/cache/abc/plot-k32-2021-06-19-10-29-aa11.plot"
                ))
            })
        );
    }

    #[test]
    fn test_every_prefix_is_non_terminal() {
        let lines: Vec<&str> = LOG.lines().collect();
        // Every strict prefix ends before the copy finished
        for end in 0..lines.len() - 1 {
            let status = MadMaxParser.parse_lines(&lines[..end]).unwrap();
            assert_eq!(status.terminal, None, "prefix of {} lines", end);
        }
    }

    #[test]
    fn test_total_line_alone_is_not_success() {
        let status = parse("Phase 4 took 75.1 sec\nTotal plot creation time was 2300.5 sec\n");
        assert_eq!(status.terminal, None);
        assert_eq!(status.stage.as_deref(), Some("finishing"));

        let status = parse(
            "Total plot creation time was 2300.5 sec\nStarted copy to /hdd/plot-k32-x.plot\n",
        );
        assert_eq!(status.terminal, None);
        assert_eq!(status.stage.as_deref(), Some("copying"));
    }

    #[test]
    fn test_phase_progress() {
        let status = parse("[P1] Table 1 took 1 sec\n[P1] Table 2 took 1 sec\n");
        assert_eq!(status.stage.as_deref(), Some("phase 1/4"));
        let percent = status.percent.unwrap();
        assert!(percent > 7.0 && percent < 7.2);

        let status = parse("Phase 1 took 10 sec\nPhase 2 took 10 sec\n");
        assert_eq!(status.stage.as_deref(), Some("phase 3/4"));
        assert_eq!(status.percent, Some(50.0));
    }

    #[test]
    fn test_renamed_without_copy() {
        let status = parse(
            "Total plot creation time was 10 sec\nRenamed final plot to /out/plot-k32-x.plot\n",
        );
        assert!(status.is_success());
    }

    #[test]
    fn test_crash_is_failure() {
        let status = parse(
            "Phase 1 took 10 sec\nterminate called after throwing an instance of 'std::runtime_error'\n",
        );
        assert!(status.is_failure());
    }

    #[test]
    fn test_unknown_phase_is_malformed() {
        assert!(MadMaxParser.parse_lines(&["Phase 9 took 1 sec"]).is_err());
    }
}
