mod common;

use common::*;
use strdec_core::context::BinaryContext;
use strdec_core::engine::RunContext;
use strdec_core::error::EngineError;
use strdec_core::families::{data_ref_tracer, DataRefTracer};
use strdec_core::function::{locate_functions, FunctionLocator};
use strdec_core::matcher::Match;
use strdec_core::tracer::{find_encoded_strings, find_encoded_strings_inline, StringTracer};

#[test]
fn callers_are_deduplicated_and_exclude_recursion() {
    let mut ctx = sample_builder()
        .xref(CALL_SITE, DECODER)
        .xref(0x1008, DECODER)
        .build();
    let func = FunctionLocator::new(&mut ctx, DECODER_LOOP, Some("$xor_loop"), false).expect("locate");
    assert_eq!(func.start, DECODER);
    assert_eq!(func.end, 0x1010);
    assert_eq!(func.callers, vec![CALL_SITE]);
    assert_eq!(func.to_string(), "sub_1000() : 0x001000 - 0x001010");
}

#[test]
fn same_named_caller_is_not_recursion() {
    // Two static `decode` functions from different units; only the second calls the first.
    let mut ctx = sample_builder()
        .name(DECODER, "decode")
        .name(CALLER, "decode")
        .xref(0x1008, DECODER)
        .build();
    let func = FunctionLocator::new(&mut ctx, DECODER_LOOP, None, false).expect("locate");
    assert_eq!(func.name, "decode");
    assert_eq!(func.callers, vec![CALL_SITE]);
}

#[test]
fn locator_creates_missing_functions_on_request() {
    let mut ctx = sample_builder().build();
    assert_eq!(
        FunctionLocator::new(&mut ctx, 0x1034, None, false).unwrap_err(),
        EngineError::NoFunction(0x1034)
    );
    let func = FunctionLocator::new(&mut ctx, 0x1034, None, true).expect("created");
    assert_eq!((func.start, func.end), (0x1034, 0x1040));
}

#[test]
fn rename_collisions_report_the_host_name() {
    let mut ctx = sample_builder().build();
    let mut run = RunContext::new();
    let matches = [Match::new(DECODER_LOOP, Some("$a")), Match::new(CALL_SITE, Some("$b"))];

    let funcs = locate_functions(&mut ctx, &matches, Some("decode"), &mut run);

    assert_eq!(funcs.len(), 2);
    assert_eq!(funcs[0].name, "decode");
    assert_eq!(funcs[1].name, "decode_0");
    assert!(run.debug.iter().any(|n| n.contains("\"decode\" to \"decode_0\"")));

    let mut first = funcs[0].clone();
    assert_eq!(first.rename(&mut ctx, "").as_deref(), Some("sub_1000"));
    assert_eq!(first.name, "sub_1000");
}

#[test]
fn duplicate_matches_locate_one_function() {
    let mut ctx = sample_builder().build();
    let mut run = RunContext::new();
    let matches = [Match::new(DECODER_LOOP, None), Match::new(0x1008, None)];
    let funcs = locate_functions(&mut ctx, &matches, None, &mut run);
    assert_eq!(funcs.len(), 1);
}

#[test]
fn unwind_metadata_callers_are_skipped() {
    let mut ctx = sample_builder()
        .segment(".pdata", 0x3000, vec![0u8; 0x10], false)
        .xref(0x3000, DECODER)
        .build();
    let mut run = RunContext::new();
    let funcs = locate_functions(&mut ctx, &[Match::new(DECODER_LOOP, None)], None, &mut run);
    assert_eq!(funcs[0].callers, vec![CALL_SITE, 0x3000]);

    let mut factory = data_ref_tracer;
    let strings = find_encoded_strings(&ctx, &funcs, &mut factory, &mut run);

    assert_eq!(strings.len(), 1);
    assert_eq!(strings[0].location(), Some(DATA));
    assert!(run.debug.iter().any(|n| n.contains(".pdata") && n.contains("0x00003000")));
}

#[test]
fn callers_outside_functions_are_skipped() {
    let mut ctx = sample_builder().xref(0x1038, DECODER).build();
    let mut run = RunContext::new();
    let funcs = locate_functions(&mut ctx, &[Match::new(DECODER_LOOP, None)], None, &mut run);

    let mut factory = data_ref_tracer;
    let strings = find_encoded_strings(&ctx, &funcs, &mut factory, &mut run);

    assert_eq!(strings.len(), 1);
    assert!(run.debug.iter().any(|n| n.starts_with("No function exists at 0x1038")));
}

#[test]
fn failed_searches_are_noted() {
    let ctx = sample_builder().build();
    let mut run = RunContext::new();
    let mut factory = data_ref_tracer;
    let strings = find_encoded_strings_inline(
        &ctx,
        &[Match::new(CALL_SITE, None), Match::new(0x1008, None)],
        &mut factory,
        &mut run,
    );
    assert_eq!(strings.len(), 1);
    assert_eq!(run.debug, vec!["Failed to find strings at 0x1008".to_string()]);
}

#[test]
fn lookback_is_bounded() {
    let ctx = sample_builder().build();
    let mut tracer = DataRefTracer::new(&ctx, 0x1025, None).expect("tracer").with_lookback(1);
    assert!(!tracer.search(&ctx));
    assert!(tracer.take_strings().is_empty());

    let mut tracer = DataRefTracer::new(&ctx, 0x1025, None).expect("tracer").with_lookback(2);
    assert!(tracer.search(&ctx));
    assert_eq!(tracer.state().func_start, CALLER);
    let strings = tracer.take_strings();
    assert_eq!(strings[0].encoded_bytes(), Some(&xor(PLAINTEXT, KEY)[..]));
    assert!(ctx.is_loaded(DATA));
}
