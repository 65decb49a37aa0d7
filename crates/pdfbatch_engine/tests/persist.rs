use std::fs;

use pdfbatch_engine::{ensure_output_dir, read_json, AtomicFileWriter, PersistError};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    count: usize,
}

#[test]
fn creates_missing_output_dir() {
    let temp = TempDir::new().unwrap();
    let new_dir = temp.path().join("out").join("nested");
    assert!(!new_dir.exists());
    ensure_output_dir(&new_dir).unwrap();
    assert!(new_dir.is_dir());
}

#[test]
fn atomic_write_replaces_existing() {
    let temp = TempDir::new().unwrap();
    let writer = AtomicFileWriter::new(temp.path().to_path_buf());

    let first = writer.write("session.json", b"hello").unwrap();
    assert_eq!(first.file_name().unwrap(), "session.json");
    assert_eq!(fs::read_to_string(&first).unwrap(), "hello");

    let second = writer.write("session.json", b"world").unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read_to_string(&second).unwrap(), "world");

    // No stray temp files are left next to the target.
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
}

#[test]
fn no_partial_file_on_error() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("not_a_dir");
    fs::write(&file_path, "x").unwrap();

    let writer = AtomicFileWriter::new(file_path.clone());
    let result = writer.write("session.json", b"data");
    assert!(result.is_err());
    assert!(!file_path.with_file_name("session.json").exists());
}

#[test]
fn json_round_trip_and_corruption_is_reported() {
    let temp = TempDir::new().unwrap();
    let writer = AtomicFileWriter::new(temp.path().to_path_buf());
    let sample = Sample {
        name: "batch".into(),
        count: 3,
    };
    let path = writer.write_json("sample.json", &sample).unwrap();
    let back: Sample = read_json(&path).unwrap();
    assert_eq!(back, sample);

    fs::write(&path, b"{ not json").unwrap();
    let err = read_json::<Sample>(&path).unwrap_err();
    assert!(matches!(err, PersistError::Json { .. }));
}
