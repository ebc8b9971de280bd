//! String tracers and the discovery drivers that run them.
//!
//! A tracer is the family-specific part of a decoder: starting from a
//! pattern hit (inline mode) or from a call site of a located decode
//! function (xref mode), it works out where the encoded string is and how
//! long it is. The drivers run one tracer per candidate and never let a
//! failing candidate stop the batch.

use crate::context::BinaryContext;
use crate::engine::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::function::FunctionLocator;
use crate::matcher::Match;
use crate::string::EncodedString;

/// Segment holding exception/unwind metadata; references from it are not call sites.
pub const UNWIND_SEGMENT: &str = ".pdata";

/// State common to every tracer.
#[derive(Debug, Clone)]
pub struct TracerState {
    /// Address the search starts at.
    pub initial_offset: u64,
    /// Identifier of the pattern hit behind this candidate.
    pub identifier: Option<String>,
    /// Start of the function containing `initial_offset`.
    pub func_start: u64,
    /// Strings found by the search.
    pub encoded_strings: Vec<EncodedString>,
}

impl TracerState {
    /// Fails with `NoFunction` when `initial_offset` is not inside a function.
    pub fn new(
        ctx: &dyn BinaryContext,
        initial_offset: u64,
        identifier: Option<&str>,
    ) -> EngineResult<Self> {
        let func = ctx.function_at(initial_offset).ok_or(EngineError::NoFunction(initial_offset))?;
        Ok(Self {
            initial_offset,
            identifier: identifier.map(str::to_string),
            func_start: func.start,
            encoded_strings: Vec::new(),
        })
    }
}

/// Family-specific search for encoded strings around one candidate address.
pub trait StringTracer {
    /// Locate the string(s), pushing them onto `state_mut().encoded_strings`.
    ///
    /// Returns whether anything was found.
    fn search(&mut self, ctx: &dyn BinaryContext) -> bool;

    fn state(&self) -> &TracerState;

    fn state_mut(&mut self) -> &mut TracerState;

    /// Take the strings found so far.
    fn take_strings(&mut self) -> Vec<EncodedString> {
        std::mem::take(&mut self.state_mut().encoded_strings)
    }
}

/// Builds a tracer for `(ctx, address, identifier)`.
pub type TracerFactory<'a> =
    dyn FnMut(&dyn BinaryContext, u64, Option<&str>) -> EngineResult<Box<dyn StringTracer>> + 'a;

fn trace_one(
    ctx: &dyn BinaryContext,
    address: u64,
    identifier: Option<&str>,
    factory: &mut TracerFactory<'_>,
    run: &mut RunContext,
) -> Vec<EncodedString> {
    let mut tracer = match factory(ctx, address, identifier) {
        Ok(tracer) => tracer,
        Err(EngineError::NoFunction(_)) => {
            run.note(format!(
                "No function exists at 0x{address:X}. Create a function at this location to obtain strings."
            ));
            return Vec::new();
        }
        Err(err) => {
            run.note(format!("Error tracing at 0x{address:X}: {err}"));
            return Vec::new();
        }
    };
    if tracer.search(ctx) {
        tracer.take_strings()
    } else {
        run.note(format!("Failed to find strings at 0x{address:X}"));
        Vec::new()
    }
}

/// Run a tracer at every match address.
pub fn find_encoded_strings_inline(
    ctx: &dyn BinaryContext,
    matches: &[Match],
    factory: &mut TracerFactory<'_>,
    run: &mut RunContext,
) -> Vec<EncodedString> {
    let mut encoded_strings = Vec::new();
    for m in matches {
        encoded_strings.extend(trace_one(ctx, m.address, m.identifier.as_deref(), factory, run));
    }
    encoded_strings
}

/// Run a tracer at every non-recursive call site of each located function.
///
/// Call sites inside the unwind metadata segment are skipped.
pub fn find_encoded_strings(
    ctx: &dyn BinaryContext,
    funcs: &[FunctionLocator],
    factory: &mut TracerFactory<'_>,
    run: &mut RunContext,
) -> Vec<EncodedString> {
    let mut encoded_strings = Vec::new();
    for func in funcs {
        for &caller in &func.callers {
            if ctx.segment_name(caller).as_deref() == Some(UNWIND_SEGMENT) {
                run.note(format!(
                    "Segment {UNWIND_SEGMENT} for ref 0x{caller:08X} is not a relevant code segment and will be skipped"
                ));
                continue;
            }
            encoded_strings.extend(trace_one(ctx, caller, func.identifier.as_deref(), factory, run));
        }
    }
    encoded_strings
}
