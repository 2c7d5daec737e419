//! Cache file format, corruption handling and crash safety.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tunecache::cache::persist::{load_cache, temp_path, write_atomic};
use tunecache::cache::{
    CacheEntry, CacheError, CacheStore, CorruptPolicy, Fingerprint, FlushOutcome, Flusher,
    MoodFeatures, Payload, PathKey,
};
use tunecache::mode::Mode;

fn fingerprint(fp: &str, secs: i64) -> CacheEntry {
    CacheEntry::new(
        Payload::Fingerprint(Fingerprint {
            fingerprint: fp.to_string(),
            duration: 30.0,
        }),
        Utc.timestamp_opt(secs, 0).unwrap(),
    )
}

fn quarantined_copies(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".corrupt-"))
        .collect()
}

#[test]
fn test_flushed_work_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fingerprints.json");

    let store = CacheStore::new();
    let flusher = Flusher::new(&path, &store);
    store.put(PathKey::from_str_path("/m/a.flac"), fingerprint("A", 100));
    store.put(
        PathKey::from_str_path("/m/b.flac"),
        fingerprint("B", 200).with_content_hash(Some("beef".to_string())),
    );
    assert_eq!(flusher.flush(&store).unwrap(), FlushOutcome::Written(2));

    // A later put that never gets flushed is lost, nothing else is
    store.put(PathKey::from_str_path("/m/c.flac"), fingerprint("C", 300));
    drop(store);

    let restarted = CacheStore::new();
    restarted
        .load(&path, Mode::Fingerprint, CorruptPolicy::Abort)
        .unwrap();
    assert_eq!(restarted.len(), 2);
    let b = restarted.get(&PathKey::from_str_path("/m/b.flac")).unwrap();
    assert_eq!(b.content_hash.as_deref(), Some("beef"));
    assert!(b.is_fresh(Utc.timestamp_opt(200, 0).unwrap()));
}

#[test]
fn test_document_layout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fingerprints.json");
    let store = CacheStore::new();
    store.put(PathKey::from_str_path("/m/a.flac"), fingerprint("A", 0));
    Flusher::new(&path, &store).flush(&store).unwrap();

    let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(doc["version"], 1);
    assert_eq!(doc["trackCount"], 1);
    assert!(doc["generatedAt"].is_string());
    let track = &doc["tracks"]["/m/a.flac"];
    assert_eq!(track["fingerprint"], "A");
    assert_eq!(track["lastModified"], "1970-01-01T00:00:00Z");
    assert!(track.get("needsRefresh").is_none());
}

#[test]
fn test_corrupt_file_is_quarantined_and_tolerated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("properties.json");
    fs::write(&path, b"{\"tracks\": {\"/a\": ").unwrap();

    let store = CacheStore::new();
    let loaded = store
        .load(&path, Mode::Properties, CorruptPolicy::StartEmpty)
        .unwrap();
    assert_eq!(loaded, 0);
    assert!(store.is_empty());

    let copies = quarantined_copies(dir.path());
    assert_eq!(copies.len(), 1);
    assert!(copies[0].starts_with("properties.json.corrupt-"));
    // The original stays until the next flush replaces it
    assert!(path.exists());
}

#[test]
fn test_corrupt_file_is_fatal_for_moods() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("moods.json");
    fs::write(&path, b"\x00\x01 definitely not json").unwrap();

    let store = CacheStore::new();
    let policy = CorruptPolicy::for_mode(Mode::Moods, None);
    let err = store.load(&path, Mode::Moods, policy).unwrap_err();
    match err {
        CacheError::Corrupt { backup, .. } => assert!(backup.exists()),
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(fs::read(&path).unwrap(), b"\x00\x01 definitely not json");
}

#[test]
fn test_config_can_relax_moods_policy() {
    assert_eq!(
        CorruptPolicy::for_mode(Mode::Moods, Some(false)),
        CorruptPolicy::StartEmpty
    );
    assert_eq!(
        CorruptPolicy::for_mode(Mode::Properties, Some(true)),
        CorruptPolicy::Abort
    );
}

#[test]
fn test_unreadable_record_is_dropped_others_kept() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fingerprints.json");
    fs::write(
        &path,
        r#"{"version": 1, "tracks": {
            "/m/good.flac": {"fingerprint": "G", "duration": 1.5, "lastModified": "2024-05-01T10:00:00Z"},
            "/m/bad.flac": {"fingerprint": 42}
        }}"#,
    )
    .unwrap();

    let loaded = load_cache(&path, Mode::Fingerprint, CorruptPolicy::Abort).unwrap();
    assert_eq!(loaded.entries.len(), 1);
    assert_eq!(loaded.dropped, 1);
    assert!(quarantined_copies(dir.path()).is_empty());
}

#[test]
fn test_legacy_timestamps_and_repairs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("moods.json");
    fs::write(
        &path,
        r#"{"tracks": {
            "/m/legacy.flac": {"bpm": 120.0, "loudness": -9.0, "spectral_centroid": 1500.0,
                "spectral_flux": 0.2, "key": "A", "mode": "minor", "valence": 0.3,
                "arousal": 0.7, "lastModified": "2019-03-04T05:06:07"},
            "/m/broken.flac": {"bpm": 90.0, "loudness": -12.0, "spectral_centroid": 900.0,
                "spectral_flux": 0.1, "key": "C", "mode": "major", "valence": 0.6,
                "arousal": 0.4, "lastModified": "yesterday"}
        }}"#,
    )
    .unwrap();

    let store = CacheStore::new();
    let generation = store.generation();
    store.load(&path, Mode::Moods, CorruptPolicy::Abort).unwrap();

    let legacy = store.get(&PathKey::from_str_path("/m/legacy.flac")).unwrap();
    assert!(legacy.is_fresh(Utc.with_ymd_and_hms(2019, 3, 4, 5, 6, 7).unwrap()));
    assert!(matches!(&legacy.payload, Payload::Moods(MoodFeatures { key, .. }) if key == "A"));

    let broken = store.get(&PathKey::from_str_path("/m/broken.flac")).unwrap();
    assert!(broken.needs_refresh);
    assert!(!broken.is_fresh(broken.last_modified));

    // The repair is written back on the next flush
    assert!(store.generation() > generation);
    let flusher = Flusher::new(&path, &CacheStore::new());
    assert!(matches!(flusher.flush(&store).unwrap(), FlushOutcome::Written(2)));
    let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(doc["tracks"]["/m/broken.flac"]["needsRefresh"], true);
}

#[test]
fn test_newer_version_is_refused_even_when_tolerant() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("properties.json");
    fs::write(&path, r#"{"version": 99, "tracks": {}}"#).unwrap();

    let err = load_cache(&path, Mode::Properties, CorruptPolicy::StartEmpty).unwrap_err();
    assert!(matches!(err, CacheError::UnsupportedVersion { found: 99, .. }));
}

#[test]
fn test_failed_replace_keeps_previous_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.json");
    write_atomic(&path, b"previous").unwrap();

    // A directory squatting on the temp name makes the temp write fail
    fs::create_dir(temp_path(&path)).unwrap();
    assert!(write_atomic(&path, b"next").is_err());
    assert_eq!(fs::read(&path).unwrap(), b"previous");
}

#[test]
fn test_concurrent_puts_and_flushes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fingerprints.json");
    let store = Arc::new(CacheStore::new());
    let flusher = Arc::new(Flusher::new(&path, &store));

    std::thread::scope(|scope| {
        for t in 0..4 {
            let store = Arc::clone(&store);
            let flusher = Arc::clone(&flusher);
            scope.spawn(move || {
                for i in 0..25 {
                    let key = PathKey::from_str_path(&format!("/m/{}-{}.flac", t, i));
                    store.put(key, fingerprint("X", i));
                    if i % 5 == 0 {
                        flusher.try_flush(&store).unwrap();
                    }
                }
            });
        }
    });
    flusher.flush(&store).unwrap();

    let loaded = load_cache(&path, Mode::Fingerprint, CorruptPolicy::Abort).unwrap();
    assert_eq!(loaded.entries.len(), 100);
    assert!(!temp_path(&path).exists());
}
