use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use object::write::{Object, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use predicates::prelude::*;
use tempfile::tempdir;

const KEY: u8 = 0x41;
const PLAINTEXT: &[u8] = b"Hello Test";

const XOR_RULE: &str = r#"
rule xor_decoder {
    strings:
        $xor_loop = { 80 34 08 41 }
    condition:
        any of them
}
"#;

const MISSING_RULE: &str = r#"
rule absent {
    strings:
        $none = { DE AD BE EF }
    condition:
        any of them
}
"#;

fn function_symbol(name: &str, value: u64, size: u64, section: object::write::SectionId) -> Symbol {
    Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::Elf { st_info: 0x12, st_other: 0 },
    }
}

/// x86-64 object with an XOR decode routine and one caller.
///
/// `.text` loads at 0x1000 and `.rodata` (16-byte aligned) right after it at
/// 0x1020, which the caller addresses with `lea rdi, [rip + 9]`.
fn elf_fixture() -> Vec<u8> {
    let mut text = vec![
        0x80, 0x34, 0x08, 0x41, // xor byte [rax + rcx], 0x41
        0xC3, // ret
    ];
    text.resize(0x10, 0x90);
    text.extend_from_slice(&[
        0x48, 0x8D, 0x3D, 0x09, 0x00, 0x00, 0x00, // lea rdi, [rip + 9]
        0xE8, 0xE4, 0xFF, 0xFF, 0xFF, // call decode
        0xC3, // ret
    ]);

    let mut encoded: Vec<u8> = PLAINTEXT.iter().map(|b| b ^ KEY).collect();
    encoded.push(0);

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text_id = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.section_mut(text_id).set_data(text.clone(), 16);
    let ro_id = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.section_mut(ro_id).set_data(encoded, 16);

    obj.add_symbol(function_symbol("decode", 0, 5, text_id));
    obj.add_symbol(function_symbol("caller", 0x10, text.len() as u64 - 0x10, text_id));
    obj.write().expect("write elf")
}

struct Workspace {
    _dir: tempfile::TempDir,
    root: PathBuf,
    binary: PathBuf,
}

fn workspace(rule: &str) -> Workspace {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let binary = root.join("sample.elf");
    fs::write(&binary, elf_fixture()).expect("write binary");
    fs::write(root.join("family.yar"), rule).expect("write rule");
    Workspace { _dir: dir, root, binary }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn scan_prints_decoded_strings() {
    let ws = workspace(XOR_RULE);
    cargo_bin_cmd!("strdec")
        .args(["scan", "--binary", arg(&ws.binary), "--rule", arg(&ws.root.join("family.yar"))])
        .args(["--decoder", "xor:41"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello Test"));
}

#[test]
fn scan_json_report_and_annotations() {
    let ws = workspace(XOR_RULE);
    let notes = ws.root.join("annotations.json");

    let output = cargo_bin_cmd!("strdec")
        .args(["scan", "--json", "--binary", arg(&ws.binary)])
        .args(["--rule", arg(&ws.root.join("family.yar")), "--decoder", "xor:41"])
        .args(["--func-name", "decrypt", "--annotations", arg(&notes)])
        .output()
        .expect("run scan");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("report json");
    assert_eq!(report["status"]["status"], "succeeded");
    assert_eq!(report["strings"][0], "Hello Test");
    assert_eq!(report["encoded_count"], 1);
    assert_eq!(report["records"][0]["codec"], "ascii");

    let notes: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&notes).expect("annotations")).expect("json");
    assert_eq!(notes["renames"]["4096"], "decrypt");
    assert_eq!(notes["renames"]["4128"], "Hello Test");
}

#[test]
fn config_file_supplies_rule_and_decoder() {
    let ws = workspace(XOR_RULE);
    let config = ws.root.join("scan.yaml");
    fs::write(&config, "rule: family.yar\ndecoder: \"xor:41\"\n").expect("write config");

    cargo_bin_cmd!("strdec")
        .args(["scan", "--binary", arg(&ws.binary), "--config", arg(&config)])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello Test"));
}

#[test]
fn patched_output_holds_plaintext() {
    let ws = workspace(XOR_RULE);
    let patched = ws.root.join("patched.elf");

    cargo_bin_cmd!("strdec")
        .args(["scan", "--binary", arg(&ws.binary), "--rule", arg(&ws.root.join("family.yar"))])
        .args(["--decoder", "xor:41", "--patched-output", arg(&patched)])
        .assert()
        .success();

    let original = fs::read(&ws.binary).expect("original");
    let patched = fs::read(&patched).expect("patched");
    assert_eq!(original.len(), patched.len());
    assert!(!contains_bytes(&original, PLAINTEXT));
    assert!(contains_bytes(&patched, PLAINTEXT));
}

#[test]
fn rule_without_matches_fails_the_scan() {
    let ws = workspace(MISSING_RULE);
    cargo_bin_cmd!("strdec")
        .args(["scan", "--binary", arg(&ws.binary), "--rule", arg(&ws.root.join("family.yar"))])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("failed to match"));
}

#[test]
fn scan_without_rule_is_rejected() {
    let ws = workspace(XOR_RULE);
    cargo_bin_cmd!("strdec")
        .args(["scan", "--binary", arg(&ws.binary)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No rule given"));
}

#[test]
fn unknown_decoder_is_rejected() {
    let ws = workspace(XOR_RULE);
    cargo_bin_cmd!("strdec")
        .args(["scan", "--binary", arg(&ws.binary), "--rule", arg(&ws.root.join("family.yar"))])
        .args(["--decoder", "rc4:00"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid decoder"));
}
