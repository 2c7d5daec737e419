//! Loading libraries from manifests and directory walks.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::tempdir;
use tunecache::library::manifest::load_manifest;
use tunecache::library::walk::{walk_library, AUDIO_EXTENSIONS};
use tunecache::library::{DirectorySource, LibraryError, LibrarySource, ManifestSource};

#[test]
fn test_manifest_file_with_issues() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("library.csv");
    fs::write(
        &path,
        "id,artist,title,album,genre,path,duration,rating\n\
         10,\"Simon, Paul\",Kodachrome,There Goes,Pop,/m/kodachrome.mp3,213.4,5\n\
         11,Nobody,Missing,,,,\n\
         12,Someone,Odd, , ,/m/odd.mp3,n/a\n",
    )
    .unwrap();

    let library = load_manifest(&path).unwrap();
    assert_eq!(library.items.len(), 2);
    assert_eq!(library.issues.len(), 2);

    let first = &library.items[0];
    assert_eq!(first.id, 10);
    assert_eq!(first.artist, "Simon, Paul");
    assert_eq!(first.display_name(), "Simon, Paul - Kodachrome");
    assert_eq!(first.duration, Some(Duration::from_secs_f64(213.4)));

    let second = &library.items[1];
    assert_eq!(second.id, 12);
    assert_eq!(second.path, PathBuf::from("/m/odd.mp3"));
    assert!(second.duration.is_none());

    assert_eq!(library.issues[0].record, Some(2));
    assert!(library.issues[1].to_string().contains("invalid duration"));
}

#[test]
fn test_missing_manifest() {
    let dir = tempdir().unwrap();
    let result = load_manifest(&dir.path().join("none.csv"));
    assert!(matches!(result, Err(LibraryError::NotFound(_))));
}

#[test]
fn test_walk_nested_library() {
    let dir = tempdir().unwrap();
    for name in [
        "B Artist/Album/01.flac",
        "A Artist/Album/02.ogg",
        "A Artist/Album/01.OPUS",
        "A Artist/Album/notes.txt",
        ".hidden/secret.mp3",
    ] {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"x").unwrap();
    }

    let library = walk_library(dir.path(), AUDIO_EXTENSIONS, None).unwrap();
    let relative: Vec<_> = library
        .items
        .iter()
        .map(|item| item.path.strip_prefix(dir.path()).unwrap().to_path_buf())
        .collect();
    assert_eq!(
        relative,
        vec![
            PathBuf::from("A Artist/Album/01.OPUS"),
            PathBuf::from("A Artist/Album/02.ogg"),
            PathBuf::from("B Artist/Album/01.flac"),
        ]
    );
    let ids: Vec<_> = library.items.iter().map(|item| item.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn test_sources_behind_the_trait() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.wav"), b"x").unwrap();
    let manifest = dir.path().join("library.csv");
    fs::write(&manifest, "path\n/m/one.flac\n/m/two.flac\n").unwrap();

    let sources: Vec<Box<dyn LibrarySource>> = vec![
        Box::new(DirectorySource::new(dir.path())),
        Box::new(ManifestSource { path: manifest }),
    ];
    let counts: Vec<_> = sources
        .iter()
        .map(|source| source.load().unwrap().items.len())
        .collect();
    assert_eq!(counts, vec![1, 2]);
}
