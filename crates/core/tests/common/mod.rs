#![allow(dead_code)]

use std::fs;
use std::path::Path;

use strdec_core::context::FrameInfo;
use strdec_core::image::{ImageBuilder, ImageContext};

pub const TEXT: u64 = 0x1000;
pub const DATA: u64 = 0x2000;
/// Decode routine holding the `80 34 08 41` (xor byte [rax+rcx], 0x41) loop.
pub const DECODER: u64 = 0x1000;
pub const DECODER_LOOP: u64 = 0x1004;
pub const CALLER: u64 = 0x1010;
/// `lea` of the encoded string inside the caller.
pub const LOAD_SITE: u64 = 0x1018;
/// `call DECODER` inside the caller.
pub const CALL_SITE: u64 = 0x1020;
pub const CALLER_FRAME: FrameInfo = FrameInfo { id: 7, local_size: 0x20 };

pub const PLAINTEXT: &[u8] = b"Hello Test";
pub const KEY: u8 = 0x41;

pub const XOR_RULE: &str = r#"
rule xor_decoder {
    strings:
        $xor_loop = { 80 34 08 41 }
    condition:
        any of them
}
"#;

pub const CALL_RULE: &str = r#"
rule decoder_call {
    strings:
        $call = { E8 DB FF FF FF }
    condition:
        any of them
}
"#;

pub const MISSING_RULE: &str = r#"
rule absent {
    strings:
        $none = { DE AD BE EF }
    condition:
        any of them
}
"#;

pub fn xor(data: &[u8], key: u8) -> Vec<u8> {
    data.iter().map(|b| b ^ key).collect()
}

pub fn text_bytes() -> Vec<u8> {
    let mut text = vec![0x90; 0x40];
    text[0x04..0x08].copy_from_slice(&[0x80, 0x34, 0x08, 0x41]);
    text[0x18..0x1F].copy_from_slice(&[0x48, 0x8D, 0x05, 0xE1, 0x0F, 0x00, 0x00]);
    text[0x20..0x25].copy_from_slice(&[0xE8, 0xDB, 0xFF, 0xFF, 0xFF]);
    text
}

pub fn data_bytes() -> Vec<u8> {
    let mut data = xor(PLAINTEXT, KEY);
    data.resize(0x40, 0);
    data
}

/// Decoder at `DECODER`, called once from `CALL_SITE` with the encoded
/// string at `DATA` loaded just before the call.
pub fn sample_builder() -> ImageBuilder {
    ImageContext::builder()
        .segment(".text", TEXT, text_bytes(), true)
        .segment(".data", DATA, data_bytes(), false)
        .function(DECODER, 0x1010)
        .function(CALLER, 0x1030)
        .heads([0x1008, LOAD_SITE, CALL_SITE, 0x1025])
        .heads([DECODER_LOOP])
        .xref(CALL_SITE, DECODER)
        .data_ref(LOAD_SITE, DATA)
        .frame(CALLER, CALLER_FRAME)
}

/// Write the flat input file into `dir` and build the matching context.
pub fn sample_image(dir: &Path) -> ImageContext {
    let path = dir.join("sample.bin");
    fs::write(&path, [text_bytes(), data_bytes()].concat()).expect("write input file");
    sample_builder().path(path).build()
}
