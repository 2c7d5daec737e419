//! End-to-end dispatcher runs against a fake fingerprinter.
#![cfg(unix)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use filetime::FileTime;
use tunecache::cache::{CacheStore, CorruptPolicy, FlushOutcome, Payload, PathKey};
use tunecache::config::ToolPaths;
use tunecache::dispatcher::{DispatcherConfig, Outcome, RunStats};
use tunecache::error::ExitCode;
use tunecache::mode::Mode;
use tunecache::tool::{Downmixer, ToolFailure, ToolInvoker, WatchdogConfig};

use super::support::{items, script, track, Workspace};

fn reload(ws: &Workspace) -> CacheStore {
    let store = CacheStore::new();
    store
        .load(&ws.cache_path(), Mode::Fingerprint, CorruptPolicy::Abort)
        .unwrap();
    store
}

#[test]
fn test_second_run_recomputes_nothing() {
    let ws = Workspace::new();
    let paths: Vec<_> = (0..5)
        .map(|i| track(ws.path(), &format!("lib/t{}.flac", i), &format!("audio{}", i)))
        .collect();
    let items = items(&paths);

    let (report, summary) = ws.run(&items, 3);
    assert_eq!(summary.recomputed, 5);
    assert!(!summary.has_failures());
    assert!(matches!(report.final_flush, FlushOutcome::Written(5)));
    assert_eq!(ws.invocations(), 5);

    let (report, summary) = ws.run(&items, 3);
    assert_eq!(summary.cached, 5);
    assert_eq!(summary.recomputed, 0);
    assert_eq!(report.final_flush, FlushOutcome::Unchanged);
    assert_eq!(ws.invocations(), 5);
}

#[test]
fn test_results_are_persisted_with_hash() {
    let ws = Workspace::new();
    let path = track(ws.path(), "lib/song.flac", "abc");
    ws.run(&items(&[path.clone()]), 1);

    let store = reload(&ws);
    let entry = store.get(&PathKey::new(&path)).unwrap();
    match &entry.payload {
        Payload::Fingerprint(fp) => {
            assert_eq!(fp.fingerprint, "FP-abc");
            assert_eq!(fp.duration, 12.5);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(
        entry.content_hash.as_deref(),
        Some(tunecache::hashing::hash_bytes(b"abc").as_str())
    );
}

#[test]
fn test_touched_file_with_same_content_is_recomputed() {
    let ws = Workspace::new();
    let path = track(ws.path(), "lib/song.flac", "abc");
    let items = items(&[path.clone()]);
    ws.run(&items, 1);

    let later = SystemTime::now() + Duration::from_secs(30);
    filetime::set_file_mtime(&path, FileTime::from_system_time(later)).unwrap();

    // The content hash still matches its own entry, but the mtime does not
    let (report, summary) = ws.run(&items, 1);
    assert_eq!(report.outcomes[0].1, Outcome::Success);
    assert_eq!(summary.recomputed, 1);
    assert_eq!(ws.invocations(), 2);

    let (_, summary) = ws.run(&items, 1);
    assert_eq!(summary.cached, 1);
    assert_eq!(ws.invocations(), 2);
}

#[test]
fn test_repaired_entry_is_recomputed() {
    let ws = Workspace::new();
    let path = track(ws.path(), "lib/song.flac", "abc");
    let key = PathKey::new(&path);
    std::fs::create_dir_all(ws.cache_path().parent().unwrap()).unwrap();
    std::fs::write(
        ws.cache_path(),
        serde_json::json!({
            "version": 1,
            "tracks": {
                key.as_str(): {
                    "fingerprint": "OLD",
                    "duration": 1.0,
                    "contentHash": tunecache::hashing::hash_bytes(b"abc"),
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let (report, summary) = ws.run(&items(&[path.clone()]), 1);
    assert_eq!(report.outcomes[0].1, Outcome::Success);
    assert_eq!(summary.recomputed, 1);
    assert_eq!(ws.invocations(), 1);

    let entry = reload(&ws).get(&key).unwrap();
    assert!(!entry.needs_refresh);
    assert!(matches!(&entry.payload, Payload::Fingerprint(fp) if fp.fingerprint == "FP-abc"));
}

#[test]
fn test_edited_file_is_recomputed() {
    let ws = Workspace::new();
    let path = track(ws.path(), "lib/song.flac", "abc");
    let items = items(&[path.clone()]);
    ws.run(&items, 1);

    std::fs::write(&path, "abcd").unwrap();
    let later = SystemTime::now() + Duration::from_secs(30);
    filetime::set_file_mtime(&path, FileTime::from_system_time(later)).unwrap();

    let (report, summary) = ws.run(&items, 1);
    assert_eq!(report.outcomes[0].1, Outcome::Success);
    assert_eq!(summary.recomputed, 1);
    assert_eq!(ws.invocations(), 2);

    let entry = reload(&ws).get(&PathKey::new(&path)).unwrap();
    assert!(matches!(&entry.payload, Payload::Fingerprint(fp) if fp.fingerprint == "FP-abcd"));
}

#[test]
fn test_subsecond_mtime_change_is_still_a_hit() {
    let ws = Workspace::new();
    let path = track(ws.path(), "lib/song.flac", "abc");
    filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 100)).unwrap();
    let items = items(&[path.clone()]);
    ws.run(&items, 1);

    filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 900_000_000)).unwrap();
    let (_, summary) = ws.run(&items, 1);
    assert_eq!(summary.cached, 1);
}

#[test]
fn test_periodic_flushes() {
    let ws = Workspace::new();
    let paths: Vec<_> = (0..3)
        .map(|i| track(ws.path(), &format!("lib/t{}.flac", i), &format!("a{}", i)))
        .collect();
    let dispatcher = ws.dispatcher(
        DispatcherConfig::default()
            .with_threads(1)
            .with_flush_every(1),
    );
    let stats = RunStats::new();
    let report = dispatcher.run(&items(&paths), &stats).unwrap();

    assert_eq!(stats.summarize().flushes, 3);
    assert_eq!(report.final_flush, FlushOutcome::Unchanged);
    assert_eq!(reload(&ws).len(), 3);
}

#[test]
fn test_failures_are_recorded_then_skipped() {
    let ws = Workspace::new();
    let good = track(ws.path(), "lib/good.flac", "fine");
    let missing = ws.path().join("lib/gone.flac");
    let items = items(&[good, missing.clone()]);

    let (report, summary) = ws.run(&items, 2);
    assert_eq!(summary.recomputed, 1);
    assert_eq!(summary.failed, 1);
    assert!(summary.has_failures());
    assert!(matches!(
        report.outcomes[1].1,
        Outcome::ErrorRecorded(ToolFailure::NotFound(_))
    ));

    let ledger = std::fs::read_to_string(ws.errors_path()).unwrap();
    assert!(ledger.starts_with("reason,artist,title,album,genre,path"));
    assert!(ledger.contains("gone.flac"));

    let (_, summary) = ws.run(&items, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.cached, 1);
    assert!(!summary.has_failures());
}

#[test]
fn test_unparseable_output_is_a_failure() {
    let ws = Workspace::new();
    let tool = script(ws.path(), "bad-fpcalc", "echo '{\"duration\": 3}'");
    let path = track(ws.path(), "lib/a.flac", "x");

    let tools = ToolPaths {
        fpcalc: tool,
        ..ToolPaths::default()
    };
    let store = Arc::new(CacheStore::new());
    let ledger = Arc::new(tunecache::ledger::ErrorLedger::load(&ws.errors_path()).unwrap());
    let flusher = tunecache::cache::Flusher::new(ws.cache_path(), &store);
    let dispatcher = tunecache::dispatcher::Dispatcher::new(
        Mode::Fingerprint,
        Mode::Fingerprint.tool_spec(&tools),
        Arc::clone(&store),
        ledger,
        flusher,
        DispatcherConfig::default().with_threads(1),
    );
    let stats = RunStats::new();
    let report = dispatcher.run(&items(&[path]), &stats).unwrap();

    assert!(matches!(
        report.outcomes[0].1,
        Outcome::ErrorRecorded(ToolFailure::ParseFailure(_))
    ));
    assert!(store.is_empty());
}

#[test]
fn test_duration_limit_checked_before_spawning() {
    let ws = Workspace::new();
    let path = track(ws.path(), "lib/long.flac", "x");
    let item = tunecache::library::WorkItem::new(1, &path).with_duration(Duration::from_secs(9000));

    let dispatcher = ws.dispatcher(
        DispatcherConfig::default()
            .with_threads(1)
            .with_content_hash(false)
            .with_max_duration(Some(Duration::from_secs(7200))),
    );
    let stats = RunStats::new();
    let report = dispatcher.run(&[item], &stats).unwrap();

    assert!(matches!(
        report.outcomes[0].1,
        Outcome::ErrorRecorded(ToolFailure::DurationExceeded { .. })
    ));
    assert_eq!(ws.invocations(), 0);
}

#[test]
fn test_cancelled_run_starts_nothing() {
    let ws = Workspace::new();
    let paths: Vec<_> = (0..4)
        .map(|i| track(ws.path(), &format!("lib/t{}.flac", i), &format!("a{}", i)))
        .collect();
    let flag = Arc::new(AtomicBool::new(true));
    let dispatcher = ws.dispatcher(
        DispatcherConfig::default()
            .with_threads(2)
            .with_shutdown_flag(flag),
    );
    let stats = RunStats::new();
    let report = dispatcher.run(&items(&paths), &stats).unwrap();

    assert!(report.interrupted);
    assert!(report.outcomes.iter().all(|(_, o)| *o == Outcome::NotStarted));
    assert_eq!(stats.summarize().not_started, 4);
    assert_eq!(ws.invocations(), 0);
    // Nothing was cancelled mid-flight, so nothing went to the ledger
    assert!(!ws.errors_path().exists());
}

#[test]
fn test_downmix_fallback() {
    let ws = Workspace::new();
    // Rejects anything but WAV with a channel error
    let tool = script(
        ws.path(),
        "picky-fpcalc",
        "case \"$2\" in\n  *.wav) printf '{\"duration\": 4, \"fingerprint\": \"MIXED\"}' ;;\n  *) echo 'ERROR: unsupported channel layout (6 channels)' >&2; exit 3 ;;\nesac",
    );
    let ffmpeg = script(
        ws.path(),
        "ffmpeg",
        "for last; do :; done\necho stereo > \"$last\"",
    );
    let path = track(ws.path(), "lib/surround.flac", "six");

    let tools = ToolPaths {
        fpcalc: tool,
        ..ToolPaths::default()
    };
    let store = Arc::new(CacheStore::new());
    let ledger = Arc::new(tunecache::ledger::ErrorLedger::load(&ws.errors_path()).unwrap());
    let flusher = tunecache::cache::Flusher::new(ws.cache_path(), &store);
    let dispatcher = tunecache::dispatcher::Dispatcher::new(
        Mode::Fingerprint,
        Mode::Fingerprint.tool_spec(&tools),
        Arc::clone(&store),
        ledger,
        flusher,
        DispatcherConfig::default().with_threads(1),
    )
    .with_downmixer(
        Downmixer::new(ffmpeg, 2, Duration::from_secs(10)).with_scratch_dir(ws.path().join("mix")),
    );
    let stats = RunStats::new();
    let report = dispatcher.run(&items(&[path.clone()]), &stats).unwrap();

    assert_eq!(report.outcomes[0].1, Outcome::Success);
    let summary = stats.summarize();
    assert_eq!(summary.downmixed, 1);
    assert_eq!(summary.recomputed, 1);
    // The converted file is gone, the result is stored under the original
    assert_eq!(std::fs::read_dir(ws.path().join("mix")).unwrap().count(), 0);
    assert!(store.contains(&PathKey::new(&path)));
}

#[test]
fn test_one_hanging_tool_does_not_hold_up_the_pool() {
    let mut ws = Workspace::new();
    let log = ws.path().join("calls.log");
    // Hangs without using CPU on one input, behaves like fpcalc otherwise
    ws.tool = script(
        ws.path(),
        "hanging-fpcalc",
        &format!(
            "case \"$2\" in\n  */hang.flac) echo 'waiting for next frame' >&2; sleep 60 ;;\nesac\n\
             echo \"$2\" >> '{}'\nprintf '{{\"duration\": 1, \"fingerprint\": \"FP-%s\"}}' \"$(cat \"$2\")\"",
            log.display()
        ),
    );
    let mut paths: Vec<_> = (0..6)
        .map(|i| track(ws.path(), &format!("lib/t{}.flac", i), &format!("a{}", i)))
        .collect();
    paths.insert(2, track(ws.path(), "lib/hang.flac", "stuck"));
    let items = items(&paths);

    let watchdog = WatchdogConfig {
        poll_interval: Duration::from_secs(1),
        idle_polls: 2,
        drain_timeout: Duration::from_secs(1),
        ..WatchdogConfig::default()
    };
    let dispatcher = ws
        .dispatcher(DispatcherConfig::default().with_threads(3))
        .with_invoker(ToolInvoker::new(watchdog).with_scratch_dir(ws.path().join("work")));
    let stats = RunStats::new();
    let started = Instant::now();
    let report = dispatcher.run(&items, &stats).unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));

    // The hanging track is item 3
    for (id, outcome) in &report.outcomes {
        if *id == 3 {
            match outcome {
                Outcome::ErrorRecorded(ToolFailure::Stalled { stderr_tail, .. }) => {
                    assert!(stderr_tail.contains("waiting for next frame"));
                }
                other => panic!("expected a stall, got {:?}", other),
            }
        } else {
            assert_eq!(*outcome, Outcome::Success, "item {}", id);
        }
    }

    let summary = stats.summarize();
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.recomputed, 6);
    assert_eq!(ExitCode::for_run(&summary, report.interrupted), ExitCode::PartialFailure);
    assert_eq!(ws.invocations(), 6);

    let mut ledger = csv::Reader::from_path(ws.errors_path()).unwrap();
    let rows: Vec<csv::StringRecord> = ledger.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert!(row[0].starts_with("stalled after"));
    assert!(row[5].ends_with("hang.flac"));
    let elapsed: f64 = row[7].parse().unwrap();
    assert!(elapsed >= 2.0);
    assert!(row[8].parse::<f64>().is_ok());
    assert_eq!(reload(&ws).len(), 6);
}
