use std::fs;
use std::path::Path;

use strdec::{absolutize, parse_hex_bytes, read_input};
use tempfile::tempdir;

#[test]
fn parse_hex_bytes_accepts_spaced_and_prefixed_input() {
    assert_eq!(parse_hex_bytes("48 65 6c").expect("spaced"), b"Hel".to_vec());
    assert_eq!(parse_hex_bytes("0x486c").expect("prefixed"), vec![0x48, 0x6c]);
    assert_eq!(parse_hex_bytes("").expect("empty"), Vec::<u8>::new());
}

#[test]
fn parse_hex_bytes_rejects_bad_digits() {
    assert!(parse_hex_bytes("abc").is_err());
    assert!(parse_hex_bytes("zz").is_err());
}

#[test]
fn read_input_needs_exactly_one_source() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("buf.bin");
    fs::write(&path, b"raw").expect("write");

    assert_eq!(read_input(None, Some(&path)).expect("file"), b"raw".to_vec());
    assert_eq!(read_input(Some("7261"), None).expect("hex"), b"ra".to_vec());
    assert!(read_input(Some("72"), Some(&path)).is_err());
    assert!(read_input(None, None).is_err());
    assert!(read_input(None, Some(&dir.path().join("missing.bin"))).is_err());
}

#[test]
fn absolutize_keeps_absolute_and_joins_relative() {
    let dir = tempdir().expect("tempdir");
    assert_eq!(absolutize(dir.path()).expect("absolute"), dir.path());

    let relative = absolutize(Path::new("does-not-exist.bin")).expect("relative");
    assert!(relative.is_absolute());
    assert!(relative.ends_with("does-not-exist.bin"));
}
