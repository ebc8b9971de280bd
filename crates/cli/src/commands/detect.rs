use std::path::Path;

use anyhow::{anyhow, Result};
use strdec_core::charset::{detect_charset, escape_text};

/// `detect`: print the best-fit codec and the decoded text.
pub fn detect_command(hex: Option<&str>, file: Option<&Path>, json: bool) -> Result<()> {
    let data = crate::read_input(hex, file)?;
    let (codec, text) = detect_charset(&data).ok_or_else(|| anyhow!("No text found in input"))?;

    if json {
        let value = serde_json::json!({ "codec": codec.name(), "text": text });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{codec}\t{}", escape_text(&text));
    }
    Ok(())
}
