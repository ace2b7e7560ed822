use std::fs;
use std::path::Path;

use rstest::rstest;
use sha1::{Digest, Sha1};
use tempfile::TempDir;

use super::*;
use crate::bencode::{decode, encode, Value};
use crate::config::HashingConfig;

const ANNOUNCE: &str = "http://localhost:6969/announce";

fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

fn write(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
}

fn pool(threads: usize) -> HashingPool {
    HashingPool::new(&HashingConfig::default().with_threads(threads)).unwrap()
}

#[test]
fn test_single_file_piece_layout() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("zeros.bin");
    write(&file, &vec![0u8; 1_048_577]);

    let metainfo = TorrentBuilder::new(&file)
        .announce(ANNOUNCE)
        .piece_length(524_288)
        .hashing(HashingConfig::default().with_threads(2))
        .build_metainfo()
        .unwrap();

    let full = sha1(&vec![0u8; 524_288]);
    let tail = sha1(&[0u8]);
    assert_eq!(metainfo.info.piece_count(), 3);
    assert_eq!(metainfo.info.pieces, vec![full, full, tail]);
    assert_eq!(metainfo.info.total_length, 1_048_577);
    assert_eq!(metainfo.info.piece_size(2), 1);
    assert!(!metainfo.info.multi_file);
    assert_eq!(metainfo.info.name, "zeros.bin");
}

#[test]
fn test_piece_spans_file_boundary() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("bundle");
    let a = root.join("a.bin");
    let b = root.join("sub").join("b.bin");
    write(&a, &vec![0xaa; 300_000]);
    write(&b, &vec![0xbb; 300_000]);

    let bytes = TorrentBuilder::new(&root)
        .files([&a, &b])
        .announce(ANNOUNCE)
        .piece_length(524_288)
        .hashing(HashingConfig::default().with_threads(3))
        .build()
        .unwrap();
    let metainfo = Metainfo::from_bytes(&bytes).unwrap();

    let mut stream = vec![0xaa; 300_000];
    stream.extend(vec![0xbb; 300_000]);
    assert_eq!(metainfo.info.piece_count(), 2);
    assert_eq!(metainfo.info.pieces[0], sha1(&stream[..524_288]));
    assert_eq!(metainfo.info.pieces[1], sha1(&stream[524_288..]));

    let root_value = decode(&bytes).unwrap();
    let files = root_value
        .get("info")
        .and_then(|i| i.get("files"))
        .and_then(Value::as_list)
        .unwrap();
    assert_eq!(
        files[1].get("path"),
        Some(&Value::List(vec![Value::string("sub"), Value::string("b.bin")]))
    );
    assert_eq!(metainfo.info.files[1].path, Path::new("bundle/sub/b.bin"));
    assert_eq!(metainfo.info.files[1].offset, 300_000);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
#[case(8)]
fn test_digests_independent_of_pool_size(#[case] threads: usize) {
    let dir = TempDir::new().unwrap();
    let files: Vec<_> = (0..3u8)
        .map(|i| {
            let path = dir.path().join(format!("part{i}"));
            let data: Vec<u8> = (0..70_001u32).map(|n| (n as u8) ^ i).collect();
            write(&path, &data);
            path
        })
        .collect();

    let mut stream = Vec::new();
    for file in &files {
        stream.extend(fs::read(file).unwrap());
    }
    let expected: Vec<u8> = stream.chunks(16_384).flat_map(sha1).collect();

    assert_eq!(pool(threads).hash_files(&files, 16_384).unwrap(), expected);
}

#[test]
fn test_hash_files_empty_input() {
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join("empty");
    write(&empty, b"");
    assert!(pool(2).hash_files(&[&empty], 1024).unwrap().is_empty());
    assert!(pool(2).hash_files::<&Path>(&[], 1024).unwrap().is_empty());
}

#[test]
fn test_hash_files_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = pool(1)
        .hash_files(&[dir.path().join("nope")], 1024)
        .unwrap_err();
    assert!(matches!(err, MetainfoError::Io(_)));
}

#[test]
fn test_reencoding_preserves_info_hash() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("data.txt");
    write(&file, b"hello bitswarm");

    let bytes = TorrentBuilder::new(&file)
        .announce(ANNOUNCE)
        .add_tracker_tier(["http://a/announce", "http://b/announce"])
        .comment("test")
        .created_by("tests")
        .creation_date(1_700_000_000)
        .piece_length(4)
        .private(true)
        .build()
        .unwrap();

    let metainfo = Metainfo::from_bytes(&bytes).unwrap();
    assert_eq!(metainfo.to_bytes(), bytes);

    let again = Metainfo::from_bytes(&metainfo.to_bytes()).unwrap();
    assert_eq!(again.info_hash, metainfo.info_hash);
    assert_eq!(again.info.pieces, metainfo.info.pieces);
    assert_eq!(again.creation_date, Some(1_700_000_000));
    assert_eq!(again.created_by.as_deref(), Some("tests"));
    assert!(again.info.private);
    assert_eq!(
        metainfo.info_hash,
        InfoHash::from_info_bytes(&metainfo.raw_info())
    );
}

#[test]
fn test_builder_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("same.bin");
    write(&file, &[7u8; 5000]);

    let build = |threads| {
        TorrentBuilder::new(&file)
            .announce(ANNOUNCE)
            .creation_date(42)
            .piece_length(1024)
            .hashing(HashingConfig::default().with_threads(threads))
            .build()
            .unwrap()
    };
    assert_eq!(build(1), build(6));
}

#[test]
fn test_builder_requires_tracker() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("x");
    write(&file, b"x");
    let err = TorrentBuilder::new(&file).build().unwrap_err();
    assert!(matches!(err, MetainfoError::MissingField("announce")));

    let ok = TorrentBuilder::new(&file)
        .add_tracker_tier(["http://tier/announce"])
        .build_metainfo()
        .unwrap();
    assert_eq!(ok.trackers(), vec!["http://tier/announce".to_string()]);
}

#[test]
fn test_builder_rejects_file_outside_parent() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let stray = dir.path().join("stray.bin");
    write(&root.join("inside.bin"), b"in");
    write(&stray, b"out");

    let err = TorrentBuilder::new(&root)
        .add_file(root.join("inside.bin"))
        .add_file(&stray)
        .announce(ANNOUNCE)
        .build()
        .unwrap_err();
    assert!(matches!(err, MetainfoError::OutsideParent(_)));
}

#[test]
fn test_add_directory_lists_sorted_files() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("tree");
    write(&root.join("b.txt"), b"bb");
    write(&root.join("a/z.txt"), b"z");
    write(&root.join("a/c.txt"), b"c");

    let metainfo = TorrentBuilder::new(&root)
        .add_directory()
        .unwrap()
        .announce(ANNOUNCE)
        .piece_length(2)
        .build_metainfo()
        .unwrap();

    let paths: Vec<_> = metainfo.info.files.iter().map(|f| f.path.clone()).collect();
    assert_eq!(
        paths,
        vec![
            Path::new("tree/a/c.txt").to_path_buf(),
            Path::new("tree/a/z.txt").to_path_buf(),
            Path::new("tree/b.txt").to_path_buf(),
        ]
    );
    assert_eq!(metainfo.info.total_length, 4);
    assert_eq!(metainfo.info.piece_count(), 2);
}

fn descriptor(info: Value) -> Vec<u8> {
    encode(&Value::dict([
        ("announce", Value::string(ANNOUNCE)),
        ("info", info),
    ]))
}

#[test]
fn test_parse_rejects_piece_count_mismatch() {
    let bytes = descriptor(Value::dict([
        ("name", Value::string("f")),
        ("piece length", Value::Integer(10)),
        ("length", Value::Integer(25)),
        ("pieces", Value::from(vec![0u8; 40])),
    ]));
    assert!(matches!(
        Metainfo::from_bytes(&bytes),
        Err(MetainfoError::InvalidField("pieces"))
    ));
}

#[test]
fn test_parse_rejects_zero_piece_length() {
    let bytes = descriptor(Value::dict([
        ("name", Value::string("f")),
        ("piece length", Value::Integer(0)),
        ("length", Value::Integer(0)),
        ("pieces", Value::from(Vec::<u8>::new())),
    ]));
    assert!(matches!(
        Metainfo::from_bytes(&bytes),
        Err(MetainfoError::InvalidField("piece length"))
    ));
}

#[test]
fn test_parse_rejects_path_traversal() {
    let bytes = descriptor(Value::dict([
        ("name", Value::string("dir")),
        ("piece length", Value::Integer(16)),
        (
            "files",
            Value::List(vec![Value::dict([
                ("length", Value::Integer(4)),
                (
                    "path",
                    Value::List(vec![Value::string(".."), Value::string("etc")]),
                ),
            ])]),
        ),
        ("pieces", Value::from(vec![0u8; 20])),
    ]));
    assert!(matches!(
        Metainfo::from_bytes(&bytes),
        Err(MetainfoError::InvalidField("path component"))
    ));
}

#[test]
fn test_trackers_deduplicated_in_order() {
    let bytes = encode(&Value::dict([
        ("announce", Value::string("http://a/announce")),
        (
            "announce-list",
            Value::List(vec![
                Value::List(vec![Value::string("http://a/announce")]),
                Value::List(vec![
                    Value::string("http://b/announce"),
                    Value::string("http://c/announce"),
                ]),
            ]),
        ),
        (
            "info",
            Value::dict([
                ("name", Value::string("f")),
                ("piece length", Value::Integer(16)),
                ("length", Value::Integer(1)),
                ("pieces", Value::from(vec![1u8; 20])),
            ]),
        ),
    ]));
    let metainfo = Metainfo::from_bytes(&bytes).unwrap();
    assert_eq!(
        metainfo.trackers(),
        vec!["http://a/announce", "http://b/announce", "http://c/announce"]
    );
}

#[test]
fn test_info_hash_hex() {
    let hash = InfoHash::from_hex("c12fe1c06bba254a9dc9f519b335aa7c1367a88a").unwrap();
    assert_eq!(hash.to_hex(), "c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
    assert_eq!(hash.as_bytes()[0], 0xc1);
    assert!(InfoHash::from_hex("c12f").is_err());
    assert!(matches!(
        InfoHash::from_bytes(&[0u8; 32]),
        Err(MetainfoError::InvalidInfoHashLength(32))
    ));
}
