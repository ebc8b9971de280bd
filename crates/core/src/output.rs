//! Output stage: report decoded strings and annotate the host.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::BinaryContext;
use crate::engine::RunContext;
use crate::string::EncodedString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Collapse equal strings before reporting.
    pub dedup: bool,
    pub rename: bool,
    pub patch: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self { dedup: true, rename: true, patch: false }
    }
}

/// Report every string and apply the requested annotations.
///
/// Strings are sorted (and deduplicated when asked), their codec is detected
/// and recorded, and the escaped text of each is returned in output order.
/// The plain text goes to `run.strings`.
pub fn output_strings(
    ctx: &mut dyn BinaryContext,
    strings: &mut Vec<EncodedString>,
    options: &OutputOptions,
    run: &mut RunContext,
) -> Vec<String> {
    strings.sort();
    if options.dedup {
        strings.dedup();
    }

    let mut lines = Vec::with_capacity(strings.len());
    for encoded in strings.iter_mut() {
        let text = encoded.decode_unknown_charset();
        lines.push(encoded.to_string());
        run.strings.push(text.trim_end_matches('\0').to_string());
        info!("{}\n", encoded.report());

        if options.rename && !encoded.rename(ctx, None) {
            run.note(format!("Unable to rename string {:?}", encoded.site));
        }
        if options.patch {
            if encoded.is_stack() {
                run.note(format!(
                    "Skipping patch for stack string referenced at {:?}",
                    encoded.reference
                ));
            } else if !encoded.patch(ctx, None, true) {
                run.note(format!("Unable to patch string {:?}", encoded.site));
            }
        }
    }
    lines
}
