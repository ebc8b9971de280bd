//! Splitting decoded buffers into individual strings.
//!
//! Some families decode a whole string table at once. The table holds
//! null-terminated strings back to back, and single-byte and UTF-16 strings
//! may be mixed in the same table, so neither `\0` nor `\0\0` alone is a
//! usable separator.
//!
//! The buffer is first cut into sections at every `\0\0` run, which always
//! ends a block regardless of character width. Each section is then carved
//! from the right: find the rightmost `\0`, walk back two bytes at a time
//! while the byte is still `\0`, and the first non-null byte found marks the
//! character just before the next string. A null run that reaches the
//! section start means the whole remainder is one wide string.

use tracing::debug;

use crate::context::BinaryContext;
use crate::error::{EngineError, EngineResult};
use crate::string::{DecodedData, EncodedString};

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Widen a byte range to whole UTF-16 code units.
fn unit_aligned(start: usize, end: usize, len: usize) -> (usize, usize) {
    (start & !1, (end + (end & 1)).min(len))
}

fn utf16_text(bytes: &[u8]) -> String {
    let units = bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
}

/// Start of the rightmost string in `data[section_start..string_end]`.
fn string_start_in(data: &[u8], section_start: usize, string_end: usize) -> usize {
    let Some(null) = data[section_start..string_end].iter().rposition(|&b| b == 0) else {
        return section_start;
    };
    let mut cursor = (section_start + null) as isize;
    let floor = section_start as isize;
    while cursor >= floor && data[cursor as usize] == 0 {
        cursor -= 2;
    }
    if cursor >= floor {
        // Undo the last step and skip the terminator.
        (cursor + 3) as usize
    } else {
        section_start
    }
}

/// Carve `(start, end)` ranges of every string in `data`, right to left per section.
pub fn split_ranges(data: &[u8]) -> Vec<(usize, usize)> {
    let size = data.len();
    let mut ranges = Vec::new();
    let mut section_start = 0;
    let mut section_end = find(data, b"\0\0").unwrap_or(size);

    loop {
        let mut string_end = section_end;
        loop {
            let string_start = string_start_in(data, section_start, string_end);
            if string_start < string_end {
                ranges.push((string_start, string_end));
            }
            if string_start == section_start {
                break;
            }
            string_end = string_start - 1;
        }

        if section_end >= size {
            break;
        }
        section_start = section_end + 2;
        while section_start < size && data[section_start] == 0 {
            section_start += 1;
        }
        section_end = find(&data[section_start..], b"\0\0").map_or(size, |i| i + section_start);
    }

    ranges.sort_unstable();
    ranges
}

/// Split one decoded string into the strings it contains.
///
/// Every piece is a copy of `decoded` with its own decoded data, `offset`
/// relative to the decoded buffer and `size` (terminator included). Byte
/// pieces are re-terminated with a single `\0`. Text sources are split on
/// their UTF-16LE form and stay text, so each piece is still defined as a
/// wide string. Results are sorted by start address. With `identify` each
/// piece is also defined as a string in the host.
pub fn split_decoded_string(
    decoded: &EncodedString,
    mut identify: Option<&mut dyn BinaryContext>,
) -> Vec<EncodedString> {
    let Some(source) = decoded.decoded.as_ref() else {
        debug!("Nothing to split for {:?}: no decoded data", decoded.site);
        return Vec::new();
    };
    let wide = matches!(source, DecodedData::Text(_));
    let data = source.to_bytes();

    let mut results: Vec<EncodedString> = split_ranges(&data)
        .into_iter()
        .filter_map(|(start, end)| {
            let (start, end) = if wide { unit_aligned(start, end, data.len()) } else { (start, end) };
            if start >= end {
                return None;
            }
            let slice = &data[start..end];
            let (piece_data, size) = if wide {
                (DecodedData::Text(utf16_text(slice)), slice.len() + 2)
            } else {
                let mut bytes = slice.to_vec();
                bytes.push(0);
                let size = bytes.len();
                (DecodedData::Bytes(bytes), size)
            };

            let mut piece = decoded.clone();
            piece.size = Some(size as u64);
            piece.offset = Some(start as u64);
            piece.codec = None;
            let encoded =
                decoded.encoded_bytes().and_then(|enc| enc.get(start..(start + size).min(enc.len())));
            piece.replace_encoded_bytes(encoded.map(<[u8]>::to_vec));
            piece.decoded = Some(piece_data);
            Some(piece)
        })
        .collect();

    results.sort_by_key(|s| (s.start(), s.offset));

    if let Some(ctx) = identify.as_deref_mut() {
        for piece in &results {
            piece.define(ctx);
        }
    }
    results
}

/// Carve the unreferenced strings that follow a known located string.
///
/// Scanning starts right after `encoded` and stops at the first address
/// something references. `delimiter` defaults to `\0\0` for text data and
/// `\0` otherwise.
pub fn find_unrefd_encoded_strings(
    ctx: &dyn BinaryContext,
    encoded: &EncodedString,
    delimiter: Option<&[u8]>,
) -> EngineResult<Vec<EncodedString>> {
    let location = encoded
        .location()
        .ok_or(EngineError::Unsupported("unreferenced string search for stack strings"))?;
    let size = encoded.size.ok_or(EngineError::SizeUnknown)?;
    let delimiter: &[u8] = match delimiter {
        Some(d) if !d.is_empty() => d,
        _ if encoded.is_wide() => b"\0\0",
        _ => b"\0",
    };
    let dlen = delimiter.len();
    let referenced = |addr: u64| !ctx.xrefs_to(addr).is_empty();
    let is_delimiter = |addr: u64| ctx.read_bytes(addr, dlen).as_deref() == Some(delimiter);

    let mut results = Vec::new();
    let mut index = location + size;

    while ctx.is_loaded(index) && !referenced(index) {
        if is_delimiter(index) {
            if dlen > 1 && (0..dlen as u64).any(|i| referenced(index + i)) {
                break;
            }
            index += dlen as u64;
            continue;
        }

        // Step forward until the delimiter is right aligned.
        while !referenced(index) && is_delimiter(index + 1) {
            index += 1;
        }
        if referenced(index) {
            break;
        }
        let start = index;

        index += 1;
        while ctx.is_loaded(index) && !referenced(index) && !is_delimiter(index) {
            index += 1;
        }

        let mut piece = encoded.clone();
        piece.offset = Some(start - location);
        piece.size = Some(index - start);
        piece.decoded = None;
        piece.codec = None;
        let bytes = ctx
            .read_bytes(start, (index - start) as usize)
            .ok_or(EngineError::Unreadable { address: start, len: (index - start) as usize })?;
        piece.replace_encoded_bytes(Some(bytes));
        results.push(piece);
    }

    Ok(results)
}
