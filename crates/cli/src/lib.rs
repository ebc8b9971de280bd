use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

pub mod commands;

/// Resolve `path` against the current directory without requiring it to exist.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => {
            let cwd = env::current_dir().context("Failed to get current directory")?;
            Ok(cwd.join(path))
        }
    }
}

/// Parse a hex string such as `48 65 6c` or `48656c` into bytes.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(anyhow!("Invalid hex digit {bad:?} in: {text}"));
    }
    if digits.len() % 2 != 0 {
        return Err(anyhow!("Odd number of hex digits: {text}"));
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("Invalid hex text")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("Invalid hex byte: {pair}"))
        })
        .collect()
}

/// Read raw input given either as `--hex` text or a `--file` path.
pub fn read_input(hex: Option<&str>, file: Option<&Path>) -> Result<Vec<u8>> {
    match (hex, file) {
        (Some(hex), None) => parse_hex_bytes(hex),
        (None, Some(path)) => {
            fs::read(path).with_context(|| format!("Failed to read input: {}", path.display()))
        }
        (Some(_), Some(_)) => Err(anyhow!("Pass either --hex or --file, not both")),
        (None, None) => Err(anyhow!("Pass --hex or --file")),
    }
}

/// Install the stderr log subscriber. `RUST_LOG` overrides the verbosity flag.
pub fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A subscriber may already be installed when commands run in-process.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
