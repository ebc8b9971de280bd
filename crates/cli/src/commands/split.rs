use std::path::Path;

use anyhow::Result;
use strdec_core::charset::{detect_charset, escape_text};
use strdec_core::split::split_ranges;

use crate::read_input;

/// One string carved out of a decoded buffer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SplitPiece {
    pub offset: usize,
    pub size: usize,
    pub codec: Option<&'static str>,
    pub text: String,
}

/// Split a buffer of back-to-back null-terminated strings.
pub fn split_buffer(data: &[u8]) -> Vec<SplitPiece> {
    split_ranges(data)
        .into_iter()
        .map(|(start, end)| {
            let mut bytes = data[start..end].to_vec();
            bytes.push(0);
            let detected = detect_charset(&bytes);
            SplitPiece {
                offset: start,
                size: end - start,
                codec: detected.as_ref().map(|(codec, _)| codec.name()),
                text: detected.map(|(_, text)| text).unwrap_or_default(),
            }
        })
        .collect()
}

/// `split`: print each string in the buffer with its offset.
pub fn split_command(hex: Option<&str>, file: Option<&Path>, json: bool) -> Result<()> {
    let data = read_input(hex, file)?;
    let pieces = split_buffer(&data);

    if json {
        println!("{}", serde_json::to_string_pretty(&pieces)?);
        return Ok(());
    }
    for piece in &pieces {
        println!(
            "0x{:04X}\t{}\t{}",
            piece.offset,
            piece.codec.unwrap_or("-"),
            escape_text(&piece.text)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_width_buffer_splits() {
        let mut data = b"cmd\0".to_vec();
        data.extend_from_slice(&[b'o', 0, b'k', 0, 0, 0]);
        let pieces = split_buffer(&data);

        assert_eq!(pieces.len(), 2);
        assert_eq!((pieces[0].offset, pieces[0].text.as_str()), (0, "cmd"));
        assert_eq!(pieces[1].offset, 4);
        assert_eq!(pieces[1].text, "ok");
        assert_eq!(pieces[1].codec, Some("utf-16-le"));
    }
}
