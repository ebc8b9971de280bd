mod common;

use common::*;
use strdec_core::charset::{detect_charset, Codec};
use strdec_core::context::BinaryContext;
use strdec_core::engine::RunContext;
use strdec_core::error::EngineError;
use strdec_core::output::{output_strings, OutputOptions};
use strdec_core::string::{DecodedData, EncodedString, StackSlot, StringSite};

fn decoded(mut s: EncodedString, data: &[u8]) -> EncodedString {
    s.decoded = Some(DecodedData::Bytes(data.to_vec()));
    s
}

#[test]
fn unloaded_pointers_become_stack_strings() {
    let ctx = sample_builder().build();
    let s = EncodedString::factory(&ctx, 0x0117_FF00, CALL_SITE);

    assert!(s.is_stack());
    let slot = s.stack_slot().expect("stack slot");
    assert_eq!(slot.frame_id, Some(CALLER_FRAME.id));
    assert_eq!(slot.stack_offset, Some(0xFF20));
    assert_eq!(slot.memory_ptr, Some(0x0117_FF00));
    assert_eq!(s.reference, Some(CALL_SITE));
    assert_eq!(s.location(), None);
}

#[test]
fn stack_strings_are_never_patched() {
    let mut ctx = sample_builder().build();
    let slot = StackSlot { frame_id: Some(7), stack_offset: Some(0x10), memory_ptr: None };
    let s = decoded(EncodedString::on_stack(slot).referenced_from(CALL_SITE), b"secret\0");

    assert!(!s.patch(&mut ctx, Some(0), true));
    assert!(ctx.annotations().patches.is_empty());
    assert!(ctx.annotations().strings.is_empty());

    let mut run = RunContext::new();
    let mut strings = vec![s];
    let options = OutputOptions { patch: true, ..OutputOptions::default() };
    let lines = output_strings(&mut ctx, &mut strings, &options, &mut run);

    assert_eq!(lines, vec!["secret"]);
    assert!(ctx.annotations().patches.is_empty());
    assert!(run.debug.iter().any(|n| n.starts_with("Skipping patch for stack string")));
}

#[test]
fn stack_strings_rename_frame_members() {
    let mut ctx = sample_builder().build();
    let s = decoded(EncodedString::factory(&ctx, 0x0117_FF00, CALL_SITE), b"hello test\0");

    assert!(s.rename(&mut ctx, None));

    let members = &ctx.annotations().frame_members;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name.as_deref(), Some("aHello_test"));
    assert_eq!(members[0].comment.as_deref(), Some("\"hello test\""));
    assert_eq!(ctx.comment_at(CALL_SITE), Some("\"hello test\""));
}

#[test]
fn stack_strings_have_no_static_size() {
    let ctx = sample_builder().build();
    let mut s = EncodedString::on_stack(StackSlot::default());
    assert!(matches!(s.calc_size(&ctx, 1), Err(EngineError::Unsupported(_))));
    assert_eq!(s.get_bytes(&ctx), Err(EngineError::SizeUnknown));
}

#[test]
fn bytes_require_a_size() {
    let ctx = sample_builder().build();
    let s = EncodedString::at(DATA);
    assert_eq!(s.get_bytes(&ctx), Err(EngineError::SizeUnknown));
    let sized = s.load(&ctx, 4).expect("load");
    assert_eq!(sized.encoded_bytes(), Some(&xor(PLAINTEXT, KEY)[..4]));
    assert!(matches!(
        EncodedString::at(DATA + 0x3E).load(&ctx, 8),
        Err(EngineError::Unreadable { .. })
    ));
}

#[test]
fn wide_sizes_round_up_to_the_character_width() {
    let mut data = b"a\0b\0c\0\0\0".to_vec();
    data.resize(0x10, 0xCC);
    let ctx = sample_builder().segment(".rdata", 0x4000, data, false).build();

    let mut s = EncodedString::at(0x4000);
    assert_eq!(s.calc_size(&ctx, 2), Ok(6));
    assert_eq!(s.encoded_bytes(), Some(&b"a\0b\0c\0"[..]));
}

#[test]
fn equal_strings_collapse_when_deduplicated() {
    let mut ctx = sample_builder().build();
    let a = decoded(EncodedString::at(DATA).referenced_from(CALL_SITE), b"dup\0");
    let b = a.clone();
    let other_ref = decoded(EncodedString::at(DATA).referenced_from(0x1025), b"dup\0");
    assert_eq!(a, b);
    assert_ne!(a, other_ref);

    let mut run = RunContext::new();
    let mut strings = vec![a.clone(), other_ref.clone(), b.clone()];
    let lines = output_strings(&mut ctx, &mut strings, &OutputOptions::default(), &mut run);
    assert_eq!(lines, vec!["dup", "dup"]);

    let mut strings = vec![a, b];
    let options = OutputOptions { dedup: false, rename: false, patch: false };
    let lines = output_strings(&mut ctx, &mut strings, &options, &mut run);
    assert_eq!(lines.len(), 2);
    assert_eq!(run.strings.len(), 4);
}

#[test]
fn located_strings_sort_before_stack_strings() {
    let stack = decoded(EncodedString::on_stack(StackSlot::default()), b"a");
    let located = decoded(EncodedString::at(0xFFFF_0000), b"b");
    let mut all = vec![stack.clone(), located.clone()];
    all.sort();
    assert!(matches!(all[0].site, StringSite::Located(_)));
    assert!(matches!(all[1].site, StringSite::Stack(_)));
}

#[test]
fn output_records_the_detected_codec() {
    let mut ctx = sample_builder().build();
    let wide: Vec<u8> = "wide\0".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let mut strings = vec![decoded(EncodedString::at(DATA), &wide)];
    let mut run = RunContext::new();

    let lines = output_strings(&mut ctx, &mut strings, &OutputOptions::default(), &mut run);

    assert_eq!(lines, vec!["wide"]);
    assert_eq!(strings[0].codec, Some(Codec::Utf16Le));
    assert_eq!(run.strings, vec!["wide"]);
    assert!(strings[0].report().contains("Detected Code Page: utf-16-le"));
}

#[test]
fn long_names_are_truncated_for_the_host() {
    let mut ctx = sample_builder().build();
    let long = "A".repeat(140);
    let s = decoded(EncodedString::at(DATA), long.as_bytes());
    assert!(s.rename(&mut ctx, None));

    let comment = ctx.comment_at(DATA).expect("comment");
    assert!(comment.ends_with(" (truncated)"));
    assert_eq!(comment.len(), 130 + 2 + " (truncated)".len());
    assert_eq!(ctx.name_of(DATA).map(|n| n.len()), Some(30));
}

#[test]
fn detection_is_deterministic() {
    let inputs: [&[u8]; 4] = [b"plain", b"\xcf\xf0\xe8\xe2\xe5\xf2", b"\x81\x40\xff", b"a\0b\0"];
    for input in inputs {
        assert_eq!(detect_charset(input), detect_charset(input));
    }
    assert_eq!(detect_charset(b"seven bit text\r\n").map(|(c, _)| c), Some(Codec::Ascii));
    assert!(fallback_is_non_empty());
}

fn fallback_is_non_empty() -> bool {
    detect_charset(&[0xfe, 0xff, 0xc0, 0x01]).is_some_and(|(_, text)| !text.is_empty())
}
