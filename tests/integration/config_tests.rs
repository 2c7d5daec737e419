//! Layered configuration: defaults, TOML file, environment.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use tempfile::tempdir;
use tunecache::cli::{Cli, Commands};
use tunecache::config::{Config, ConfigError};
use tunecache::mode::Mode;

static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Clear all TUNECACHE_* environment variables to avoid interference.
fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("TUNECACHE_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
fn test_missing_file_gives_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_toml_file_overrides_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
threads = 6
flush_every = 10
idle_polls = 3
poll_interval_ms = 1000
max_duration_secs = 600
cache_dir = "/srv/tunecache"

[tools]
fpcalc = "/opt/chromaprint/fpcalc"
"#,
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.worker_threads(), 6);
    assert_eq!(config.flush_every, 10);
    assert_eq!(config.max_duration(Mode::Moods), Some(Duration::from_secs(600)));
    assert_eq!(config.tools.fpcalc, PathBuf::from("/opt/chromaprint/fpcalc"));
    // Untouched tool paths keep their defaults
    assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));

    let watchdog = config.watchdog();
    assert_eq!(watchdog.poll_interval, Duration::from_secs(1));
    assert_eq!(watchdog.idle_polls, 3);

    assert_eq!(
        config.cache_path(Mode::Fingerprint),
        PathBuf::from("/srv/tunecache/fingerprints.json")
    );
    assert_eq!(
        config.errors_path(Mode::Moods),
        PathBuf::from("/srv/tunecache/moods-errors.csv")
    );
}

#[test]
fn test_env_overrides_file() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "flush_every = 10\ncontent_hash = true\n").unwrap();

    std::env::set_var("TUNECACHE_FLUSH_EVERY", "50");
    std::env::set_var("TUNECACHE_CONTENT_HASH", "false");
    std::env::set_var("TUNECACHE_TOOLS__FFMPEG", "/usr/local/bin/ffmpeg");
    let config = Config::load(Some(&path));
    clear_env();

    let config = config.unwrap();
    assert_eq!(config.flush_every, 50);
    assert!(!config.content_hash);
    assert_eq!(config.tools.ffmpeg, PathBuf::from("/usr/local/bin/ffmpeg"));
}

#[test]
fn test_zero_values_rejected() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "flush_every = 0\n").unwrap();

    let err = Config::load(Some(&path)).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            key: "flush_every",
            ..
        }
    ));
}

#[test]
fn test_malformed_toml_is_an_error() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "threads = \"many\"\n[[[").unwrap();

    let err = Config::load(Some(&path)).unwrap_err();
    assert!(matches!(err, ConfigError::Figment(_)));
    assert!(err.to_string().starts_with("invalid configuration"));
}

#[test]
fn test_mode_default_duration_limits() {
    let config = Config::default();
    assert_eq!(
        config.max_duration(Mode::Moods),
        Some(Duration::from_secs(2 * 60 * 60))
    );
    assert_eq!(config.max_duration(Mode::Fingerprint), None);
}

#[test]
fn test_cli_flags_parse_for_run() {
    let cli = Cli::try_parse_from([
        "tunecache",
        "--config",
        "/etc/tunecache.toml",
        "run",
        "--mode",
        "moods",
        "--dir",
        "/music",
        "-j",
        "3",
        "--flush-every",
        "5",
        "--retry-errors",
    ])
    .unwrap();
    assert_eq!(cli.config, Some(PathBuf::from("/etc/tunecache.toml")));
    match cli.command {
        Commands::Run(args) => {
            assert_eq!(args.mode, Mode::Moods);
            assert_eq!(args.threads, Some(3));
            assert_eq!(args.flush_every, Some(5));
            assert!(args.retry_errors);
            assert!(args.manifest.is_none());
        }
        _ => panic!("expected run command"),
    }
}

#[test]
fn test_saved_config_loads_back() {
    let _lock = ENV_MUTEX.lock().unwrap();
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let config = Config {
        threads: 2,
        max_duration_secs: Some(900),
        link_dir: Some(PathBuf::from("/var/tmp/links")),
        abort_on_corrupt_cache: Some(false),
        ..Config::default()
    };
    fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

    assert_eq!(Config::load(Some(&path)).unwrap(), config);
}
