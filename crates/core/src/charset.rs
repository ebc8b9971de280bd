//! Text encoding detection for decoded string data.
//!
//! Decoders usually hand back raw bytes without saying what code page they
//! are in. Detection decodes the bytes with every candidate in
//! [`CODE_PAGES`], scores each output by how many characters would still
//! need an escape sequence to be printed, and keeps the lowest score. The
//! first candidate wins ties, so the order of [`CODE_PAGES`] matters.

use std::fmt;

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

/// A byte-to-text decoding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Codec {
    #[serde(rename = "ascii")]
    Ascii,
    #[serde(rename = "utf-32-be")]
    Utf32Be,
    #[serde(rename = "utf-32-le")]
    Utf32Le,
    #[serde(rename = "utf-16-be")]
    Utf16Be,
    #[serde(rename = "utf-16-le")]
    Utf16Le,
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "gb18030")]
    Gb18030,
    #[serde(rename = "gbk")]
    Gbk,
    #[serde(rename = "gb2312")]
    Gb2312,
    #[serde(rename = "big5-hkscs")]
    Big5Hkscs,
    #[serde(rename = "big5")]
    Big5,
    #[serde(rename = "koi8-r")]
    Koi8R,
    #[serde(rename = "iso8859-5")]
    Iso8859_5,
    #[serde(rename = "cp1251")]
    Cp1251,
    #[serde(rename = "mac-cyrillic")]
    MacCyrillic,
    #[serde(rename = "cp949")]
    Cp949,
    #[serde(rename = "iso8859-6")]
    Iso8859_6,
    #[serde(rename = "cp1256")]
    Cp1256,
    #[serde(rename = "latin1")]
    Latin1,
}

/// Candidate codecs in priority order.
///
/// General encodings first, then Chinese, Cyrillic, Korean and Arabic code
/// pages. `Latin1` decodes every byte sequence, so detection always succeeds
/// on non-empty input.
pub const CODE_PAGES: [Codec; 19] = [
    Codec::Ascii,
    Codec::Utf32Be,
    Codec::Utf32Le,
    Codec::Utf16Be,
    Codec::Utf16Le,
    Codec::Utf8,
    Codec::Gb18030,
    Codec::Gbk,
    Codec::Gb2312,
    Codec::Big5Hkscs,
    Codec::Big5,
    Codec::Koi8R,
    Codec::Iso8859_5,
    Codec::Cp1251,
    Codec::MacCyrillic,
    Codec::Cp949,
    Codec::Iso8859_6,
    Codec::Cp1256,
    Codec::Latin1,
];

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Ascii => "ascii",
            Codec::Utf32Be => "utf-32-be",
            Codec::Utf32Le => "utf-32-le",
            Codec::Utf16Be => "utf-16-be",
            Codec::Utf16Le => "utf-16-le",
            Codec::Utf8 => "utf-8",
            Codec::Gb18030 => "gb18030",
            Codec::Gbk => "gbk",
            Codec::Gb2312 => "gb2312",
            Codec::Big5Hkscs => "big5-hkscs",
            Codec::Big5 => "big5",
            Codec::Koi8R => "koi8-r",
            Codec::Iso8859_5 => "iso8859-5",
            Codec::Cp1251 => "cp1251",
            Codec::MacCyrillic => "mac-cyrillic",
            Codec::Cp949 => "cp949",
            Codec::Iso8859_6 => "iso8859-6",
            Codec::Cp1256 => "cp1256",
            Codec::Latin1 => "latin1",
        }
    }

    /// Look up a codec by name (case-insensitive, `_` and `-` interchangeable).
    pub fn from_name(name: &str) -> Option<Codec> {
        let wanted = name.trim().to_ascii_lowercase().replace('_', "-");
        CODE_PAGES.iter().copied().find(|c| c.name() == wanted)
    }

    /// UTF-16 and UTF-32 variants, whose buffers may carry misaligned trailing nulls.
    pub fn is_wide(&self) -> bool {
        matches!(self, Codec::Utf16Be | Codec::Utf16Le | Codec::Utf32Be | Codec::Utf32Le)
    }

    fn encoding(&self) -> Option<&'static Encoding> {
        match self {
            Codec::Utf16Be => Some(encoding_rs::UTF_16BE),
            Codec::Utf16Le => Some(encoding_rs::UTF_16LE),
            Codec::Utf8 => Some(encoding_rs::UTF_8),
            Codec::Gb18030 => Some(encoding_rs::GB18030),
            Codec::Gbk | Codec::Gb2312 => Some(encoding_rs::GBK),
            Codec::Big5Hkscs | Codec::Big5 => Some(encoding_rs::BIG5),
            Codec::Koi8R => Some(encoding_rs::KOI8_R),
            Codec::Iso8859_5 => Some(encoding_rs::ISO_8859_5),
            Codec::Cp1251 => Some(encoding_rs::WINDOWS_1251),
            Codec::MacCyrillic => Some(encoding_rs::X_MAC_CYRILLIC),
            Codec::Cp949 => Some(encoding_rs::EUC_KR),
            Codec::Iso8859_6 => Some(encoding_rs::ISO_8859_6),
            Codec::Cp1256 => Some(encoding_rs::WINDOWS_1256),
            Codec::Ascii | Codec::Utf32Be | Codec::Utf32Le | Codec::Latin1 => None,
        }
    }

    /// Strictly decode `bytes`; any malformed sequence fails the whole decode.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Codec::Ascii => {
                if bytes.is_ascii() {
                    Some(bytes.iter().map(|&b| b as char).collect())
                } else {
                    None
                }
            }
            Codec::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
            Codec::Utf32Be => decode_utf32(bytes, u32::from_be_bytes),
            Codec::Utf32Le => decode_utf32(bytes, u32::from_le_bytes),
            other => other
                .encoding()
                .and_then(|enc| enc.decode_without_bom_handling_and_without_replacement(bytes))
                .map(|text| text.into_owned()),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn decode_utf32(bytes: &[u8], read: fn([u8; 4]) -> u32) -> Option<String> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| char::from_u32(read([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect()
}

/// Number of escape bytes `c` needs when rendered with [`escape_text`].
///
/// `\xNN` escapes count one, `\uNNNN` and `\UNNNNNNNN` escapes count two.
/// Printable ASCII and the `\t`, `\n`, `\r` shorthands count nothing.
fn escape_weight(c: char) -> usize {
    match c {
        '\t' | '\n' | '\r' => 0,
        ' '..='~' => 0,
        '\0'..='\u{ff}' => 1,
        _ => 2,
    }
}

/// Score how much of `text` still looks like binary junk.
pub fn raw_byte_score(text: &str) -> usize {
    text.chars().map(escape_weight).sum()
}

/// Render `text` with non-printable characters escaped.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ' '..='~' => out.push(c),
            '\0'..='\u{ff}' => out.push_str(&format!("\\x{:02x}", c as u32)),
            '\u{100}'..='\u{ffff}' => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push_str(&format!("\\U{:08x}", c as u32)),
        }
    }
    out
}

/// Decode with `codec`, trimming trailing nulls one at a time for wide codecs.
///
/// Trailing null characters are stripped from the result.
pub fn decode_with(codec: Codec, bytes: &[u8]) -> Option<String> {
    if let Some(text) = codec.decode(bytes) {
        return Some(text.trim_end_matches('\0').to_string());
    }
    if !codec.is_wide() {
        return None;
    }
    let mut data = bytes;
    while let Some((&0, rest)) = data.split_last() {
        data = rest;
        if let Some(text) = codec.decode(data) {
            return Some(text.trim_end_matches('\0').to_string());
        }
    }
    None
}

/// Pick the best-fit codec for `bytes`.
///
/// Returns `None` when no candidate produced non-empty text (empty or all-null input).
pub fn detect_charset(bytes: &[u8]) -> Option<(Codec, String)> {
    let mut best: Option<(Codec, String, usize)> = None;
    for codec in CODE_PAGES {
        let Some(output) = decode_with(codec, bytes) else { continue };
        let score = raw_byte_score(&output);
        let replace = match &best {
            None => true,
            Some((_, text, _)) if text.is_empty() => true,
            Some((_, _, best_score)) => score < *best_score,
        };
        if replace {
            best = Some((codec, output, score));
        }
    }
    best.and_then(|(codec, text, _)| if text.is_empty() { None } else { Some((codec, text)) })
}

/// Render `text` for host names and comments: ASCII with `?` for anything else.
pub fn display_ascii(text: &str) -> String {
    text.chars().map(|c| if c.is_ascii() { c } else { '?' }).collect()
}
