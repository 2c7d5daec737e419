//! Reuse of results after files move to a new path.
#![cfg(unix)]

use std::fs;

use tunecache::cache::{CacheStore, CorruptPolicy, PathKey};
use tunecache::dispatcher::Outcome;
use tunecache::library::WorkItem;
use tunecache::mode::Mode;

use super::support::{items, track, Workspace};

fn reload(ws: &Workspace) -> CacheStore {
    let store = CacheStore::new();
    store
        .load(&ws.cache_path(), Mode::Fingerprint, CorruptPolicy::Abort)
        .unwrap();
    store
}

#[test]
fn test_moved_library_is_reused_without_invocations() {
    let ws = Workspace::new();
    let old = track(ws.path(), "old-drive/Music/a.flac", "alpha");
    ws.run(&items(&[old.clone()]), 1);
    assert_eq!(ws.invocations(), 1);

    let new = ws.path().join("new-drive/Music/a.flac");
    fs::create_dir_all(new.parent().unwrap()).unwrap();
    fs::rename(&old, &new).unwrap();

    let (report, summary) = ws.run(&items(&[new.clone()]), 1);
    assert_eq!(report.outcomes[0].1, Outcome::CrossMachineHit);
    assert_eq!(summary.cross_machine, 1);
    assert_eq!(summary.recomputed, 0);
    assert_eq!(ws.invocations(), 1);

    // Exactly one entry survives, under the new key
    let store = reload(&ws);
    assert_eq!(store.len(), 1);
    assert!(store.contains(&PathKey::new(&new)));
    assert!(!store.contains(&PathKey::new(&old)));

    // And it is now a plain cache hit
    let (_, summary) = ws.run(&items(&[new]), 1);
    assert_eq!(summary.cached, 1);
}

#[test]
fn test_duplicate_file_in_same_run_copies_entry() {
    let ws = Workspace::new();
    let first = track(ws.path(), "lib/a.flac", "same-bytes");
    ws.run(&items(&[first.clone()]), 1);

    let copy = track(ws.path(), "lib/copy-of-a.flac", "same-bytes");
    let library = vec![WorkItem::new(1, &first), WorkItem::new(2, &copy)];
    let (report, summary) = ws.run(&library, 2);

    assert_eq!(report.outcomes[0].1, Outcome::CacheHit);
    assert_eq!(report.outcomes[1].1, Outcome::CrossMachineHit);
    assert_eq!(summary.cached + summary.cross_machine, 2);
    assert_eq!(ws.invocations(), 1);

    // Both paths are live, so neither evicts the other
    let store = reload(&ws);
    assert_eq!(store.len(), 2);
    assert!(store.contains(&PathKey::new(&first)));
    assert!(store.contains(&PathKey::new(&copy)));
}

#[test]
fn test_two_new_copies_of_one_old_file() {
    let ws = Workspace::new();
    let old = track(ws.path(), "old/a.flac", "payload");
    ws.run(&items(&[old.clone()]), 1);
    fs::remove_file(&old).unwrap();

    let a = track(ws.path(), "new1/a.flac", "payload");
    let b = track(ws.path(), "new2/a.flac", "payload");
    let (_, summary) = ws.run(&items(&[a.clone(), b.clone()]), 2);

    assert_eq!(summary.cross_machine, 2);
    assert_eq!(ws.invocations(), 1);
    let store = reload(&ws);
    assert!(store.contains(&PathKey::new(&a)));
    assert!(store.contains(&PathKey::new(&b)));
    assert!(!store.contains(&PathKey::new(&old)));
}

#[test]
fn test_different_content_is_not_matched() {
    let ws = Workspace::new();
    let old = track(ws.path(), "old/a.flac", "one");
    ws.run(&items(&[old]), 1);

    let other = track(ws.path(), "new/a.flac", "two");
    let (report, _) = ws.run(&items(&[other]), 1);
    assert_eq!(report.outcomes[0].1, Outcome::Success);
    assert_eq!(ws.invocations(), 2);
}
