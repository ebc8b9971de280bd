mod common;

use common::*;
use strdec_core::charset::Codec;
use strdec_core::context::BinaryContext;
use strdec_core::error::EngineError;
use strdec_core::image::ImageContext;
use strdec_core::split::{find_unrefd_encoded_strings, split_decoded_string};
use strdec_core::string::{DecodedData, EncodedString, StackSlot};

fn decoded_at(location: u64, data: &[u8]) -> EncodedString {
    let mut s = EncodedString::at(location).referenced_from(CALL_SITE);
    s.decoded = Some(DecodedData::Bytes(data.to_vec()));
    s
}

fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

#[test]
fn single_byte_strings_round_trip() {
    let source = decoded_at(DATA, b"kernel32\0GetProcAddress\0ws2_32\0");
    let parts = split_decoded_string(&source, None);

    let texts: Vec<String> = parts.iter().map(EncodedString::text).collect();
    assert_eq!(texts, vec!["kernel32", "GetProcAddress", "ws2_32"]);
    let offsets: Vec<Option<u64>> = parts.iter().map(|p| p.offset).collect();
    assert_eq!(offsets, vec![Some(0), Some(9), Some(24)]);
    assert_eq!(parts[1].size, Some(15));
    assert_eq!(parts[1].decoded, Some(DecodedData::Bytes(b"GetProcAddress\0".to_vec())));
    assert!(parts.iter().all(|p| p.reference == Some(CALL_SITE)));
}

#[test]
fn double_byte_strings_round_trip() {
    let mut buffer = utf16("cmd.exe\0");
    buffer.extend(utf16("open\0"));
    let parts = split_decoded_string(&decoded_at(DATA, &buffer), None);

    assert_eq!(parts.len(), 2);
    let mut first = parts[0].clone();
    assert_eq!(first.decode_unknown_charset(), "cmd.exe");
    assert_eq!(first.codec, Some(Codec::Utf16Le));
    assert_eq!(parts[1].offset, Some(16));
    assert_eq!(parts[1].text(), "open");
}

#[test]
fn mixed_width_buffer_splits_in_order() {
    let mut buffer = utf16("Hi\0");
    buffer.extend_from_slice(b"abc\0de\0");
    let parts = split_decoded_string(&decoded_at(DATA, &buffer), None);

    let starts: Vec<Option<u64>> = parts.iter().map(EncodedString::start).collect();
    assert_eq!(starts, vec![Some(DATA), Some(DATA + 6), Some(DATA + 10)]);
    let texts: Vec<String> = parts.iter().map(EncodedString::text).collect();
    assert_eq!(texts, vec!["Hi", "abc", "de"]);
}

#[test]
fn null_only_and_empty_buffers_yield_nothing() {
    assert!(split_decoded_string(&decoded_at(DATA, b"\0\0\0\0\0\0"), None).is_empty());
    assert!(split_decoded_string(&EncodedString::at(DATA), None).is_empty());
}

#[test]
fn text_data_is_split_as_utf16() {
    let mut source = EncodedString::at(DATA);
    source.decoded = Some(DecodedData::Text("wide".into()));
    let parts = split_decoded_string(&source, None);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].text(), "wide");
}

#[test]
fn text_pieces_stay_wide_when_defined() {
    let mut ctx = sample_builder().build();
    let mut source = EncodedString::at(DATA);
    source.decoded = Some(DecodedData::Text("ab\0cd".into()));
    let parts = split_decoded_string(&source, Some(&mut ctx));

    let texts: Vec<String> = parts.iter().map(EncodedString::text).collect();
    assert_eq!(texts, vec!["ab", "cd"]);
    assert!(parts.iter().all(EncodedString::is_wide));
    assert_eq!(parts[1].offset, Some(6));
    assert_eq!(parts[1].size, Some(6));

    let defined: Vec<(u64, usize, bool)> =
        ctx.annotations().strings.iter().map(|s| (s.address, s.len, s.wide)).collect();
    assert_eq!(defined, vec![(DATA, 4, true), (DATA + 6, 4, true)]);
}

#[test]
fn odd_text_boundaries_keep_whole_code_units() {
    // "a\0b" encodes as 61 00 00 00 62 00; the first `\0\0` run starts mid unit.
    let mut source = EncodedString::at(DATA);
    source.decoded = Some(DecodedData::Text("a\0b".into()));
    let parts = split_decoded_string(&source, None);

    let texts: Vec<String> = parts.iter().map(EncodedString::text).collect();
    assert_eq!(texts, vec!["a", "b"]);
    assert!(parts.iter().all(|p| p.byte_length().is_some_and(|len| len % 2 == 0)));
}

#[test]
fn identified_pieces_are_defined() {
    let mut ctx = sample_builder().build();
    let source = decoded_at(DATA, b"one\0two\0");
    let parts = split_decoded_string(&source, Some(&mut ctx));

    assert_eq!(parts.len(), 2);
    let defined: Vec<(u64, usize)> =
        ctx.annotations().strings.iter().map(|s| (s.address, s.len)).collect();
    assert_eq!(defined, vec![(DATA, 4), (DATA + 4, 4)]);
}

#[test]
fn stack_strings_split_without_addresses() {
    let slot = StackSlot { frame_id: Some(7), stack_offset: Some(0x10), memory_ptr: None };
    let mut source = EncodedString::on_stack(slot);
    source.decoded = Some(DecodedData::Bytes(b"ab\0cd\0".to_vec()));
    let parts = split_decoded_string(&source, None);
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().all(|p| p.start().is_none()));
    assert_eq!(parts[1].offset, Some(3));
}

fn table_image() -> ImageContext {
    let mut data = b"abc\0def\0gh\0ij\0".to_vec();
    data.resize(0x20, 0);
    ImageContext::builder()
        .segment(".data", DATA, data, false)
        .xref(CALL_SITE, DATA)
        .xref(0x1030, DATA + 11)
        .build()
}

#[test]
fn unreferenced_strings_stop_at_the_next_reference() {
    let ctx = table_image();
    let source = EncodedString::at(DATA).referenced_from(CALL_SITE).load(&ctx, 3).expect("load");

    let found = find_unrefd_encoded_strings(&ctx, &source, None).expect("search");

    assert_eq!(found.len(), 2);
    assert_eq!(found[0].start(), Some(DATA + 4));
    assert_eq!(found[0].size, Some(3));
    assert_eq!(found[0].encoded_bytes(), Some(&b"def"[..]));
    assert_eq!(found[1].start(), Some(DATA + 8));
    assert_eq!(found[1].offset, Some(8));
    assert_eq!(found[1].encoded_bytes(), Some(&b"gh"[..]));
    assert!(ctx.xrefs_to(DATA + 11).contains(&0x1030));
}

#[test]
fn unreferenced_search_needs_a_located_sized_string() {
    let ctx = table_image();
    assert_eq!(
        find_unrefd_encoded_strings(&ctx, &EncodedString::at(DATA), None).unwrap_err(),
        EngineError::SizeUnknown
    );
    let stack = EncodedString::on_stack(StackSlot::default());
    assert!(matches!(
        find_unrefd_encoded_strings(&ctx, &stack, None),
        Err(EngineError::Unsupported(_))
    ));
}
