//! Error ledger durability and the retry workflow.

use std::fs;
use std::time::Duration;

use tempfile::tempdir;
use tunecache::cache::PathKey;
use tunecache::ledger::{Diagnostics, ErrorLedger, LEDGER_HEADER};
use tunecache::library::WorkItem;
use tunecache::tool::ToolFailure;

fn stalled() -> ToolFailure {
    ToolFailure::Stalled {
        elapsed: Duration::from_secs(61),
        cpu: Duration::from_millis(400),
        stderr_tail: "decoding frame 1200".to_string(),
    }
}

#[test]
fn test_append_is_visible_to_a_fresh_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state/moods-errors.csv");
    let item = WorkItem::new(4, "/music/Broken, Live.flac")
        .with_display("Band, The", "Song \"Quoted\"")
        .with_duration(Duration::from_secs(241));

    let ledger = ErrorLedger::load(&path).unwrap();
    assert!(ledger.is_empty());
    let failure = stalled();
    ledger
        .append(&item, &failure, Diagnostics::for_failure(&failure, Duration::ZERO))
        .unwrap();
    drop(ledger);

    let reloaded = ErrorLedger::load(&path).unwrap();
    assert_eq!(reloaded.len(), 1);
    let key = PathKey::new(&item.path);
    assert!(reloaded.contains(&key));
    assert!(reloaded.reason(&key).unwrap().starts_with("stalled after 61.0s (0.4s CPU)"));

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let header: Vec<_> = reader.headers().unwrap().iter().map(str::to_string).collect();
    assert_eq!(header, LEDGER_HEADER);
    let row = reader.records().next().unwrap().unwrap();
    assert_eq!(&row[1], "Band, The");
    assert_eq!(&row[2], "Song \"Quoted\"");
    assert_eq!(&row[5], "/music/Broken, Live.flac");
    assert_eq!(&row[6], "241.0");
    assert_eq!(&row[8], "0.4");
}

#[test]
fn test_header_written_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("errors.csv");
    let ledger = ErrorLedger::load(&path).unwrap();
    for i in 0..3 {
        let item = WorkItem::new(i, format!("/m/{}.mp3", i));
        ledger
            .append(&item, &ToolFailure::EmptyOutput, Diagnostics::default())
            .unwrap();
    }
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert_eq!(text.matches("reason,artist").count(), 1);
}

#[test]
fn test_clear_keeps_only_the_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("errors.csv");
    let ledger = ErrorLedger::load(&path).unwrap();
    let item = WorkItem::new(1, "/m/a.mp3");
    ledger
        .append(&item, &ToolFailure::EmptyOutput, Diagnostics::default())
        .unwrap();

    ledger.clear().unwrap();
    assert!(ledger.is_empty());
    assert_eq!(
        fs::read_to_string(&path).unwrap().trim_end(),
        LEDGER_HEADER.join(",")
    );
    assert!(ErrorLedger::load(&path).unwrap().is_empty());
}

#[test]
fn test_rows_from_other_tools_are_tolerated() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("errors.csv");
    fs::write(
        &path,
        "reason,path\n\
         timeout,/m/a.mp3\n\
         rejected,/M/B.MP3\n",
    )
    .unwrap();

    let ledger = ErrorLedger::load(&path).unwrap();
    assert_eq!(ledger.len(), 2);
    // Keys are normalized, so a different spelling of the path still matches
    assert!(ledger.contains(&PathKey::from_str_path("/m/b.mp3")));
}

#[cfg(unix)]
mod retry {
    use super::super::support::{items, track, Workspace};
    use super::*;
    use tunecache::dispatcher::Outcome;

    #[test]
    fn test_retry_after_clear_reprocesses() {
        let ws = Workspace::new();
        let path = track(ws.path(), "lib/flaky.flac", "ok-now");

        // A failure recorded by an earlier run
        let ledger = ErrorLedger::load(&ws.errors_path()).unwrap();
        ledger
            .append(
                &WorkItem::new(1, &path),
                &ToolFailure::EmptyOutput,
                Diagnostics::default(),
            )
            .unwrap();

        let (report, summary) = ws.run(&items(&[path.clone()]), 1);
        assert_eq!(report.outcomes[0].1, Outcome::ErrorSkip);
        assert_eq!(summary.skipped, 1);
        assert_eq!(ws.invocations(), 0);

        ErrorLedger::load(&ws.errors_path()).unwrap().clear().unwrap();
        let (report, _) = ws.run(&items(&[path]), 1);
        assert_eq!(report.outcomes[0].1, Outcome::Success);
        assert_eq!(ws.invocations(), 1);
    }
}
