//! Engine entry point and per-run bookkeeping.

use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::BinaryContext;
use crate::decode::decode_strings;
use crate::error::{EngineError, EngineResult};
use crate::function::locate_functions;
use crate::matcher::{Match, PatternMatcher, RawMatch};
use crate::output::{output_strings, OutputOptions};
use crate::string::{DecodedData, EncodedString, StringRecord};
use crate::tracer::{find_encoded_strings, find_encoded_strings_inline, TracerFactory};

/// Accumulator owned by one [`run`].
#[derive(Debug, Default)]
pub struct RunContext {
    /// Every string the tracers produced.
    pub encoded_strings: Vec<EncodedString>,
    /// Strings that decoded successfully.
    pub decoded_strings: Vec<EncodedString>,
    /// Plain text of every reported string.
    pub strings: Vec<String>,
    /// Ordered notes from every skipped candidate and no-op.
    pub debug: Vec<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `message` at debug level and keep it in the audit trail.
    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{message}");
        self.debug.push(message);
    }
}

/// Options for one engine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Write decoded strings back into the image.
    pub patch: bool,
    /// Name given to located decode functions (xref mode only).
    pub rename_name: Option<String>,
    /// Trace from the match addresses themselves instead of from callers.
    pub inline: bool,
    pub dedup: bool,
    /// Comment and rename decoded strings in the host.
    pub rename: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            patch: false,
            rename_name: Some("string_decode_function".into()),
            inline: false,
            dedup: true,
            rename: true,
        }
    }
}

impl RunOptions {
    fn output(&self) -> OutputOptions {
        OutputOptions { dedup: self.dedup, rename: self.rename, patch: self.patch }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed { reason: String },
}

/// Outcome of a run. A failed run carries its reason and no output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    /// Escaped text of each reported string, in output order.
    pub output: Vec<String>,
    /// Plain text of each reported string.
    pub strings: Vec<String>,
    pub records: Vec<StringRecord>,
    pub encoded_count: usize,
    pub debug: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Compute the SHA-256 hash of a file and return it as a hex string.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Locate the input file on disk.
///
/// The recorded path wins when it exists. Otherwise a file with the input's
/// name next to the database is accepted if its hash matches the one the
/// host recorded.
pub fn find_input_file(ctx: &dyn BinaryContext) -> EngineResult<PathBuf> {
    let recorded = ctx.input_file_path();
    if recorded.is_file() {
        return Ok(recorded);
    }

    let candidate = match (ctx.database_dir(), ctx.input_file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => return Err(EngineError::MissingInputFile(recorded)),
    };
    let Some(expected) = ctx.input_file_hash() else {
        return Err(EngineError::MissingInputFile(recorded));
    };
    if candidate.is_file() {
        match sha256_file(&candidate) {
            Ok(actual) if actual.eq_ignore_ascii_case(&expected) => {
                debug!("Using {} for missing input file {}", candidate.display(), recorded.display());
                return Ok(candidate);
            }
            Ok(_) => warn!("Hash of {} does not match the input file", candidate.display()),
            Err(err) => warn!("Failed to hash {}: {err}", candidate.display()),
        }
    }
    Err(EngineError::MissingInputFile(recorded))
}

/// Scan the input file and resolve every hit to the head of its item.
///
/// Fails with `PatternMatchFailure` when the rule does not match.
pub fn collect_matches<M: PatternMatcher>(
    ctx: &dyn BinaryContext,
    matcher: &M,
    rule: &M::Rule,
    path: &Path,
    run: &mut RunContext,
) -> EngineResult<Vec<Match>> {
    let mut raw: Vec<RawMatch> = Vec::new();
    let matched = matcher.scan(rule, path, &mut |hits: &[RawMatch]| raw.extend_from_slice(hits))?;
    if !matched {
        return Err(EngineError::PatternMatchFailure);
    }

    let mut matches = Vec::with_capacity(raw.len());
    for hit in raw {
        match ctx.address_of_file_offset(hit.offset) {
            Some(address) => matches.push(Match::new(address, Some(&hit.identifier))),
            None => run.note(format!(
                "Match {} at file offset 0x{:X} does not map to an address",
                hit.identifier, hit.offset
            )),
        }
    }
    if matches.is_empty() {
        return Err(EngineError::PatternMatchFailure);
    }
    Ok(matches)
}

/// Run the whole pipeline: match, trace, decode, report.
///
/// Fatal conditions (missing input file, rule errors, no matches) end the
/// run with [`RunStatus::Failed`] and no output. Failures of individual
/// candidates are noted in the report and skipped.
pub fn run<M, D>(
    ctx: &mut dyn BinaryContext,
    matcher: &M,
    rule_text: &str,
    factory: &mut TracerFactory<'_>,
    decode: D,
    options: &RunOptions,
) -> RunReport
where
    M: PatternMatcher,
    D: FnMut(&EncodedString) -> Option<DecodedData>,
{
    let started_at = Utc::now().to_rfc3339();
    let mut run = RunContext::new();

    let (status, output) = match execute(ctx, matcher, rule_text, factory, decode, options, &mut run) {
        Ok(output) => (RunStatus::Succeeded, output),
        Err(err) => {
            warn!("String decoding failed: {err}");
            run.note(err.to_string());
            run.strings.clear();
            (RunStatus::Failed { reason: err.to_string() }, Vec::new())
        }
    };

    let records = run.decoded_strings.iter().map(EncodedString::record).collect();
    RunReport {
        status,
        output,
        strings: run.strings,
        records,
        encoded_count: run.encoded_strings.len(),
        debug: run.debug,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
    }
}

fn execute<M, D>(
    ctx: &mut dyn BinaryContext,
    matcher: &M,
    rule_text: &str,
    factory: &mut TracerFactory<'_>,
    decode: D,
    options: &RunOptions,
    run: &mut RunContext,
) -> EngineResult<Vec<String>>
where
    M: PatternMatcher,
    D: FnMut(&EncodedString) -> Option<DecodedData>,
{
    let path = find_input_file(&*ctx)?;
    let rule = matcher.compile(rule_text)?;
    let matches = collect_matches(&*ctx, matcher, &rule, &path, run)?;
    info!("{} pattern match(es) in {}", matches.len(), path.display());

    let mut encoded = if options.inline {
        find_encoded_strings_inline(&*ctx, &matches, factory, run)
    } else {
        let funcs = locate_functions(ctx, &matches, options.rename_name.as_deref(), run);
        for func in &funcs {
            info!("Located {func} with {} caller(s)", func.caller_count());
        }
        find_encoded_strings(&*ctx, &funcs, factory, run)
    };

    let mut decoded = decode_strings(&mut encoded, decode, run);
    run.encoded_strings = encoded;

    let output = output_strings(ctx, &mut decoded, &options.output(), run);
    run.decoded_strings = decoded;
    Ok(output)
}
