use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use strdec::commands::{detect_command, scan_command, split_command, ScanArgs};
use strdec::init_tracing;

/// Find and decode obfuscated strings in compiled binaries.
///
/// This CLI is a thin wrapper around `strdec-core`; the engine, tracers and
/// charset detection all live in the library.
#[derive(Parser, Debug)]
#[command(name = "strdec", version, about = "Obfuscated string decoder", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Locate encoded strings with a rule, decode them and report the plaintext.
    Scan(ScanArgs),

    /// Split a decoded buffer of back-to-back null-terminated strings.
    Split {
        /// Buffer as hex text.
        #[arg(long)]
        hex: Option<String>,

        /// Buffer read from a file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Guess the text encoding of a byte buffer.
    Detect {
        /// Buffer as hex text.
        #[arg(long)]
        hex: Option<String>,

        /// Buffer read from a file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the library version.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan(args) => scan_command(&args)?,
        Command::Split { hex, file, json } => split_command(hex.as_deref(), file.as_deref(), json)?,
        Command::Detect { hex, file, json } => {
            detect_command(hex.as_deref(), file.as_deref(), json)?
        }
        Command::Version => println!("strdec v{}", strdec_core::version()),
    }

    Ok(())
}
