use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use strdec_core::families::{BuiltinDecoder, DataRefTracer, MAX_LOOKBACK};
use strdec_core::image::ImageContext;
use strdec_core::matcher::SignatureMatcher;
use strdec_core::tracer::StringTracer;
use strdec_core::{run, BinaryContext, EngineResult, RunOptions, RunReport, RunStatus};
use tracing::info;

use crate::absolutize;
use crate::commands::ScanConfig;

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Binary to analyze (PE, ELF or Mach-O).
    #[arg(long)]
    pub binary: PathBuf,

    /// Rule file locating the decode routine or the inline decode sites.
    #[arg(long)]
    pub rule: Option<PathBuf>,

    /// YAML or JSON file with saved scan settings.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Decoder: `none` or `xor:<hex key>`.
    #[arg(long)]
    pub decoder: Option<String>,

    /// Instructions to walk back from a call site when looking for the string.
    #[arg(long)]
    pub lookback: Option<usize>,

    /// Trace from the rule matches themselves instead of from callers.
    #[arg(long, default_value_t = false)]
    pub inline: bool,

    /// Name given to located decode functions.
    #[arg(long)]
    pub func_name: Option<String>,

    /// Leave located decode functions unnamed.
    #[arg(long, default_value_t = false)]
    pub no_func_rename: bool,

    /// Write decoded strings over the encoded bytes.
    #[arg(long, default_value_t = false)]
    pub patch: bool,

    /// Skip naming and commenting decoded strings.
    #[arg(long, default_value_t = false)]
    pub no_rename: bool,

    /// Report duplicate strings.
    #[arg(long, default_value_t = false)]
    pub no_dedup: bool,

    /// Emit the full run report as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Write the annotations made during the run to this JSON file.
    #[arg(long)]
    pub annotations: Option<PathBuf>,

    /// Write a copy of the binary with patches applied (implies `--patch`).
    #[arg(long)]
    pub patched_output: Option<PathBuf>,
}

/// Settings for one scan after merging the config file and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub rule: PathBuf,
    pub decoder: BuiltinDecoder,
    pub lookback: usize,
    pub options: RunOptions,
}

impl ScanPlan {
    pub fn from_args(args: &ScanArgs) -> Result<Self> {
        let config = match &args.config {
            Some(path) => ScanConfig::load(path)?,
            None => ScanConfig::default(),
        };

        let rule = args
            .rule
            .clone()
            .or(config.rule)
            .ok_or_else(|| anyhow!("No rule given; pass --rule or set `rule` in the config"))?;

        let decoder = match args.decoder.as_deref().or(config.decoder.as_deref()) {
            Some(name) => name
                .parse::<BuiltinDecoder>()
                .with_context(|| format!("Invalid decoder: {name}"))?,
            None => BuiltinDecoder::Identity,
        };

        let mut options = config.options;
        options.inline |= args.inline;
        options.patch |= args.patch || args.patched_output.is_some();
        if let Some(name) = &args.func_name {
            options.rename_name = Some(name.clone());
        }
        if args.no_func_rename {
            options.rename_name = None;
        }
        if args.no_rename {
            options.rename = false;
        }
        if args.no_dedup {
            options.dedup = false;
        }

        Ok(Self {
            rule,
            decoder,
            lookback: args.lookback.or(config.lookback).unwrap_or(MAX_LOOKBACK),
            options,
        })
    }
}

/// Load the binary and run the engine with the merged settings.
pub fn run_scan(binary: &Path, plan: &ScanPlan) -> Result<(ImageContext, RunReport)> {
    let rule_text = fs::read_to_string(&plan.rule)
        .with_context(|| format!("Failed to read rule: {}", plan.rule.display()))?;
    let mut ctx = ImageContext::from_file(binary)?;

    let lookback = plan.lookback;
    let mut factory = |ctx: &dyn BinaryContext,
                       address: u64,
                       identifier: Option<&str>|
     -> EngineResult<Box<dyn StringTracer>> {
        Ok(Box::new(DataRefTracer::new(ctx, address, identifier)?.with_lookback(lookback)))
    };
    let decoder = &plan.decoder;

    info!("Scanning {} with {} (decoder {decoder})", binary.display(), plan.rule.display());
    let report = run(
        &mut ctx,
        &SignatureMatcher,
        &rule_text,
        &mut factory,
        |s| decoder.decode(s),
        &plan.options,
    );
    Ok((ctx, report))
}

/// `scan`: decode the strings of one binary and print them.
pub fn scan_command(args: &ScanArgs) -> Result<()> {
    let plan = ScanPlan::from_args(args)?;
    let binary = absolutize(&args.binary)?;
    let (ctx, report) = run_scan(&binary, &plan)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in &report.output {
            println!("{line}");
        }
    }

    if let Some(path) = &args.annotations {
        let json = serde_json::to_string_pretty(ctx.annotations())?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write annotations: {}", path.display()))?;
    }

    if let Some(path) = &args.patched_output {
        let original = fs::read(&binary)
            .with_context(|| format!("Failed to re-read binary: {}", binary.display()))?;
        fs::write(path, ctx.patched_file(&original))
            .with_context(|| format!("Failed to write patched binary: {}", path.display()))?;
    }

    match report.status {
        RunStatus::Succeeded => {
            info!("Decoded {} of {} string(s)", report.strings.len(), report.encoded_count);
            Ok(())
        }
        RunStatus::Failed { reason } => Err(anyhow!("String decoding failed: {reason}")),
    }
}
