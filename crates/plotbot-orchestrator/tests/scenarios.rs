//! End-to-end scheduling scenarios
//!
//! Drives the orchestrator tick by tick against in-memory drives and a
//! scripted launcher:
//! - Instance caps and delay policies
//! - Relocation with drive clearers
//! - Launch failures, retry backoff and retry_on_failure
//! - Adoption of running instances at startup

use chrono::{DateTime, Duration, Utc};
use plotbot_core::{ComponentSpec, DriveConfig, PlotBotConfig, PlotterConfig, WorkingDirectories};
use plotbot_host::{Drives, MemoryDrives, PlotScript, ScriptedLauncher};
use plotbot_orchestrator::parser::{ChiaParser, MadMaxParser};
use plotbot_orchestrator::{
    parse_progress, DriveClearer, InstanceHeader, Orchestrator, ParseOutcome, ProgressParser,
    Registry, Terminal,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const GB: u64 = 1_000_000_000;

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn minutes(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

/// One profile `fast` using `/cache/a` and `/work`, one drive `/hdd`
fn config() -> PlotBotConfig {
    let mut config = PlotBotConfig::default();
    config.plotters = vec![PlotterConfig {
        alias: "fast".to_string(),
        max_instances: 1,
        plot_command: Some("plot -k {size} -t {cache} -d {output}".to_string()),
        progress_parser: Some(
            ComponentSpec::new("string")
                .with_arg("DONE")
                .with_arg("FAILED"),
        ),
        working_directories: WorkingDirectories {
            caches: vec![PathBuf::from("/cache/a")],
            working_directory: PathBuf::from("/work"),
            archive_progress_files: false,
        },
        delay: Vec::new(),
        ..PlotterConfig::default()
    }];
    config.drives = vec![DriveConfig {
        alias: "hdd".to_string(),
        directory: PathBuf::from("/hdd"),
        plotters: Vec::new(),
        clearers: Vec::new(),
    }];
    config
}

fn finishing_plot(name: &str, size: u64) -> PlotScript {
    PlotScript::new()
        .polls_until_exit(0)
        .progress("Phase 1 took 100 sec\n")
        .final_progress("DONE\n")
        .artifact(name, size)
}

fn orchestrator(
    config: &PlotBotConfig,
    drives: &MemoryDrives,
    launcher: &ScriptedLauncher,
) -> Orchestrator {
    Orchestrator::new(
        config,
        &Registry::default(),
        Arc::new(drives.clone()),
        Arc::new(launcher.clone()),
    )
    .expect("valid configuration")
}

/// Let spawned relocation tasks run
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_active_instances_never_exceed_max() {
    let drives = MemoryDrives::new();
    let launcher = ScriptedLauncher::new(drives.clone());
    let mut config = config();
    config.plotters[0].max_instances = 2;
    config.plotters[0].working_directories.caches =
        vec![PathBuf::from("/cache/a"), PathBuf::from("/cache/b")];
    let orchestrator = orchestrator(&config, &drives, &launcher);

    for tick in 0..6 {
        let report = orchestrator.tick_at(minutes(tick), true).await;
        assert!(report.active <= 2, "tick {}: {:?}", tick, report);
        assert!(report.started <= 1);
    }
    assert_eq!(launcher.launched().len(), 2);

    let instances = orchestrator.instances().await;
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.state == "monitoring"));
}

#[tokio::test]
async fn test_time_started_delay_window() {
    let drives = MemoryDrives::new().with_mount("/hdd", 1000 * GB);
    let launcher = ScriptedLauncher::new(drives.clone())
        .with_script(finishing_plot("plot-k32-1.plot", 101 * GB));
    let mut config = config();
    config.plotters[0].delay = vec![ComponentSpec::new("time-started").with_arg("10")];
    let orchestrator = orchestrator(&config, &drives, &launcher);

    assert_eq!(orchestrator.tick_at(minutes(0), true).await.started, 1);

    // Plot finishes and relocates, the slot is free again
    orchestrator.tick_at(minutes(1), true).await;
    orchestrator.tick_at(minutes(2), true).await;
    settle().await;
    let report = orchestrator.tick_at(minutes(3), true).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.started, 0);
    assert!(drives.exists(Path::new("/hdd/plot-k32-1.plot")));

    // 5 minutes after the last start: still delayed
    let report = orchestrator.tick_at(minutes(5), true).await;
    assert_eq!(report.started, 0);
    assert_eq!(launcher.launched().len(), 1);

    // 11 minutes after the last start: allowed
    let report = orchestrator.tick_at(minutes(11), true).await;
    assert_eq!(report.started, 1);
    assert_eq!(launcher.launched().len(), 2);
}

#[tokio::test]
async fn test_progress_file_contains_waits_for_marker() {
    let drives = MemoryDrives::new();
    let launcher = ScriptedLauncher::new(drives.clone())
        .with_script(PlotScript::running().progress("[P1] Table 1 took 10 sec\n"));
    let mut config = config();
    config.plotters[0].max_instances = 2;
    config.plotters[0].delay =
        vec![ComponentSpec::new("progress-file-contains").with_arg("Phase 1 took")];
    let orchestrator = orchestrator(&config, &drives, &launcher);

    assert_eq!(orchestrator.tick_at(minutes(0), true).await.started, 1);
    assert_eq!(orchestrator.tick_at(minutes(1), true).await.started, 0);

    let first = launcher.launched()[0].progress_file.clone();
    drives.append_file(&first, b"Phase 1 took 600 sec\n");
    assert_eq!(orchestrator.tick_at(minutes(2), true).await.started, 1);
}

#[tokio::test]
async fn test_by_size_clearer_makes_room_for_plot() {
    // 50GB free; OG plots of 101GB and 60GB
    let drives = MemoryDrives::new().with_mount("/hdd", 211 * GB);
    drives.add_file("/hdd/og-a.plot", 101 * GB, t0());
    drives.add_file("/hdd/og-b.plot", 60 * GB, t0());
    let launcher = ScriptedLauncher::new(drives.clone())
        .with_script(finishing_plot("plot-k32-new.plot", 100 * GB));
    let mut config = config();
    config.drives[0].clearers = vec![ComponentSpec::new("og-size").with_arg("pattern=og-*.plot")];
    let orchestrator = orchestrator(&config, &drives, &launcher);

    orchestrator.tick_at(minutes(0), true).await;
    orchestrator.tick_at(minutes(1), false).await;
    orchestrator.tick_at(minutes(2), false).await;
    settle().await;
    let report = orchestrator.tick_at(minutes(3), false).await;

    assert_eq!(report.succeeded, 1);
    assert!(!drives.exists(Path::new("/hdd/og-a.plot")));
    assert!(drives.exists(Path::new("/hdd/og-b.plot")));
    assert!(drives.exists(Path::new("/hdd/plot-k32-new.plot")));
}

#[tokio::test]
async fn test_relocation_deferred_until_space_appears() {
    let drives = MemoryDrives::new().with_mount("/hdd", 150 * GB);
    drives.add_file("/hdd/keep.dat", 100 * GB, t0());
    let launcher = ScriptedLauncher::new(drives.clone())
        .with_script(finishing_plot("plot-k32-late.plot", 100 * GB));
    let mut config = config();
    config.drives[0].clearers = vec![ComponentSpec::new("zero-byte")];
    let orchestrator = orchestrator(&config, &drives, &launcher);

    orchestrator.tick_at(minutes(0), true).await;
    for m in 1..5 {
        let report = orchestrator.tick_at(minutes(m), true).await;
        assert_eq!(report.succeeded, 0);
        // Still relocating: holds its slot
        assert_eq!(report.active, 1);
        settle().await;
    }
    let instances = orchestrator.instances().await;
    assert_eq!(instances[0].state, "relocating");

    // Operator frees space; next attempts succeed
    drives.remove_file(Path::new("/hdd/keep.dat")).await.unwrap();
    let mut succeeded = 0;
    for m in 5..10 {
        succeeded += orchestrator.tick_at(minutes(m), false).await.succeeded;
        settle().await;
    }
    assert_eq!(succeeded, 1);
    assert!(drives.exists(Path::new("/hdd/plot-k32-late.plot")));
}

#[tokio::test]
async fn test_zero_byte_clearer_removes_only_empty_files() {
    let drives = MemoryDrives::new().with_mount("/hdd", 500 * GB);
    drives.add_file("/hdd/crash.plot", 0, t0());
    drives.add_file("/hdd/plot-k32-good.plot", 101 * GB, t0());

    let clearer: Arc<dyn DriveClearer> = Registry::default()
        .clearer(&ComponentSpec::new("zero-byte"))
        .unwrap();
    let freed = clearer.clear(&drives, Path::new("/hdd"), 200 * GB).await.unwrap();

    assert_eq!(freed, 0);
    assert!(!drives.exists(Path::new("/hdd/crash.plot")));
    assert!(drives.exists(Path::new("/hdd/plot-k32-good.plot")));
}

const MADMAX_LOG: &str = "\
Multi-threaded pipelined Chia k32 plotter
Final Directory: /cache/a/ab12cd34/
Number of Threads: 8
[P1] Table 1 took 20.1 sec
[P1] Table 7 took 80.4 sec, found 4294871231 matches
Phase 1 took 900.2 sec
Phase 2 took 400.7 sec
Phase 3 took 800.3 sec, wrote 21877148792 entries to final plot
Phase 4 took 60.5 sec, final plot size is 108835770541 bytes
Total plot creation time was 2161.7 sec (36.0 min)
Renamed final plot to /cache/a/ab12cd34/plot-k32-2021-06-19-10-00-abc.plot
";

const CHIA_LOG: &str = "\
Starting plotting progress into temporary dirs: /cache/a and /cache/a
Starting phase 1/4: Forward Propagation into tmp files... Sat Jun 19 10:00:00 2021
Progress update: 0.100
Starting phase 2/4: Backpropagation into tmp files... Sat Jun 19 12:00:00 2021
Starting phase 3/4: Compression from tmp files... Sat Jun 19 14:00:00 2021
Starting phase 4/4: Write Checkpoint tables... Sat Jun 19 16:00:00 2021
Progress update: 0.980
Renamed final file from \"/cache/a/ab12cd34/plot.plot.2.tmp\" to \"/cache/a/ab12cd34/plot-k32-x.plot\"
";

fn terminal_of(parser: &dyn ProgressParser, raw: &[u8]) -> Option<Terminal> {
    match parse_progress(parser, raw) {
        ParseOutcome::Status(status) => status.terminal,
        ParseOutcome::Malformed(m) => panic!("prefix reported malformed: {}", m),
    }
}

#[test]
fn test_parser_prefixes_are_never_terminal() {
    // Chia: only the complete log is a success
    let full = CHIA_LOG.as_bytes();
    for cut in 0..full.len() {
        assert_eq!(terminal_of(&ChiaParser, &full[..cut]), None, "cut at {}", cut);
    }
    assert_eq!(
        terminal_of(&ChiaParser, full),
        Some(Terminal::Success {
            artifact: Some(PathBuf::from("/cache/a/ab12cd34/plot-k32-x.plot"))
        })
    );

    // madMAx: the plot is only placed by the last line, renamed or copied
    let copied = MADMAX_LOG.replace(
        "Renamed final plot to /cache/a/ab12cd34/plot-k32-2021-06-19-10-00-abc.plot\n",
        "Started copy to /cache/a/ab12cd34/plot-k32-2021-06-19-10-00-abc.plot\n\
         Copy to /cache/a/ab12cd34/plot-k32-2021-06-19-10-00-abc.plot finished, took 2.0 sec\n",
    );
    for log in [MADMAX_LOG, copied.as_str()] {
        let full = log.as_bytes();
        for cut in 0..full.len() {
            assert_eq!(terminal_of(&MadMaxParser, &full[..cut]), None, "cut at {}", cut);
        }
        assert_eq!(
            terminal_of(&MadMaxParser, full),
            Some(Terminal::Success {
                artifact: Some(PathBuf::from(
                    "/cache/a/ab12cd34/plot-k32-2021-06-19-10-00-abc.plot"
                ))
            })
        );
    }
}

#[tokio::test]
async fn test_launch_failure_backs_off() {
    let drives = MemoryDrives::new();
    let launcher = ScriptedLauncher::new(drives.clone())
        .with_script(PlotScript::spawn_failure())
        .with_script(PlotScript::spawn_failure());
    let mut config = config();
    config.settings.retry_on_failure = true;
    config.settings.retry.backoff_base_secs = 60;
    let orchestrator = orchestrator(&config, &drives, &launcher);

    let report = orchestrator.tick_at(t0(), true).await;
    assert_eq!((report.started, report.failed), (0, 1));

    // Within the backoff
    orchestrator.tick_at(t0() + Duration::seconds(30), true).await;
    assert_eq!(launcher.launched().len(), 1);

    // Second failure doubles the delay
    orchestrator.tick_at(t0() + Duration::seconds(61), true).await;
    assert_eq!(launcher.launched().len(), 2);
    orchestrator.tick_at(t0() + Duration::seconds(150), true).await;
    assert_eq!(launcher.launched().len(), 2);
    orchestrator.tick_at(t0() + Duration::seconds(182), true).await;
    assert_eq!(launcher.launched().len(), 3);
}

#[tokio::test]
async fn test_retry_on_failure_replaces_in_same_tick() {
    for retry in [false, true] {
        let drives = MemoryDrives::new();
        let launcher = ScriptedLauncher::new(drives.clone())
            .with_script(PlotScript::running().progress("FAILED: disk error\n"));
        let mut config = config();
        config.settings.retry_on_failure = retry;
        let orchestrator = orchestrator(&config, &drives, &launcher);

        orchestrator.tick_at(minutes(0), true).await;
        let report = orchestrator.tick_at(minutes(1), true).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.started, usize::from(retry), "retry_on_failure = {}", retry);

        let report = orchestrator.tick_at(minutes(2), true).await;
        assert_eq!(report.active, 1);
    }
}

#[tokio::test]
async fn test_startup_adopts_and_cleans() {
    let drives = MemoryDrives::new();
    let header = InstanceHeader::parse(
        "# plotbot instance=ab12cd34 profile=fast cache=/cache/a output=/cache/a/ab12cd34 \
         threads=4 ram=3390 buckets=256 started=2021-06-19T10:00:00+00:00",
    )
    .unwrap();
    drives.write_file("/work/fast_ab12cd34.progress", header.to_line() + "working\n");
    drives.write_file("/cache/b/leftover.tmp", "x");
    drives.write_file("/hdd/plot-k32-half.plot.tmp", "x");

    let launcher = ScriptedLauncher::new(drives.clone());
    let mut config = config();
    config.plotters[0].working_directories.caches =
        vec![PathBuf::from("/cache/a"), PathBuf::from("/cache/b")];
    config.settings.cleanup_cache = true;
    config.settings.cleanup_failed_copy = true;
    let orchestrator = orchestrator(&config, &drives, &launcher);

    assert_eq!(orchestrator.initialize().await.unwrap(), 1);
    assert!(!drives.exists(Path::new("/cache/b/leftover.tmp")));
    assert!(!drives.exists(Path::new("/hdd/plot-k32-half.plot.tmp")));

    let instances = orchestrator.instances().await;
    assert_eq!(instances.len(), 1);
    assert!(instances[0].adopted);
    assert_eq!(instances[0].id, "ab12cd34");

    // The adopted instance fills the only slot
    let report = orchestrator.tick_at(Utc::now(), true).await;
    assert_eq!(report.started, 0);
    assert!(launcher.launched().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_plotter_process_end_to_end() {
    use plotbot_host::{LocalDrives, Shell, ShellLauncher};

    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path();
    let mut config = config();
    config.plotters[0].plot_command = Some(
        "head -c 2048 /dev/zero > {output}/plot-k25-test.plot && echo 'DONE'".to_string(),
    );
    config.plotters[0].plot_size = plotbot_core::PlotSize::K25;
    config.plotters[0].working_directories = WorkingDirectories {
        caches: vec![root.join("cache")],
        working_directory: root.join("work"),
        archive_progress_files: true,
    };
    config.drives[0].directory = root.join("hdd");
    config.drives[0].clearers = vec![ComponentSpec::new("zero-byte")];
    std::fs::create_dir_all(root.join("cache")).unwrap();
    std::fs::create_dir_all(root.join("hdd")).unwrap();

    let orchestrator = Orchestrator::new(
        &config,
        &Registry::default(),
        Arc::new(LocalDrives::new()),
        Arc::new(ShellLauncher::new(Shell::Posix)),
    )
    .unwrap();

    assert_eq!(orchestrator.tick(true).await.started, 1);
    let mut succeeded = 0;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        succeeded += orchestrator.tick(false).await.succeeded;
        if succeeded > 0 {
            break;
        }
    }
    assert_eq!(succeeded, 1);

    let plot = root.join("hdd").join("plot-k25-test.plot");
    assert_eq!(std::fs::metadata(&plot).unwrap().len(), 2048);
    let archived = std::fs::read_dir(root.join("work").join("archive"))
        .unwrap()
        .count();
    assert_eq!(archived, 1);
    assert!(orchestrator.instances().await.is_empty());
    let drives = LocalDrives::new();
    assert!(drives.list_dir(&root.join("cache")).await.unwrap().is_empty());
}
