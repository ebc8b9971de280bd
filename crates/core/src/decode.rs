//! Decode pipeline: apply a family decode function to every traced string.

use crate::engine::RunContext;
use crate::string::{DecodedData, EncodedString};

/// Decode every string that has encoded bytes.
///
/// `decode` returns `None` (or empty data) to abort a string on purpose;
/// such strings are noted and dropped. Strings that never got a size are
/// skipped. Decoded data is stored on the entries of `strings` and the
/// successful ones are returned.
pub fn decode_strings<F>(
    strings: &mut [EncodedString],
    mut decode: F,
    run: &mut RunContext,
) -> Vec<EncodedString>
where
    F: FnMut(&EncodedString) -> Option<DecodedData>,
{
    let mut decoded_strings = Vec::new();
    for encoded in strings.iter_mut() {
        if encoded.encoded_bytes().is_none() {
            run.note(match encoded.location() {
                Some(location) => format!("Unable to find string at: 0x{location:X}"),
                None => format!("Unable to find stack string referenced at: {:?}", encoded.reference),
            });
            continue;
        }
        encoded.decoded = decode(&*encoded).filter(|data| !data.is_empty());
        if encoded.decoded.is_some() {
            decoded_strings.push(encoded.clone());
        } else {
            run.note(format!("Failed to decode string: {:?}", encoded.site));
        }
    }
    decoded_strings
}
