//! Built-in tracer and decoders.
//!
//! These cover the common case of a decode routine called with a pointer to
//! a null-terminated encoded blob in a data section, and a single-key or
//! rolling XOR encoding. Families with other conventions implement
//! [`StringTracer`] and supply their own decode function.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::BinaryContext;
use crate::error::{EngineError, EngineResult};
use crate::string::{DecodedData, EncodedString};
use crate::tracer::{StringTracer, TracerState};

/// How far back from the call site a data reference is looked for.
pub const MAX_LOOKBACK: usize = 16;

/// Finds the string whose address is loaded shortly before the call site.
///
/// Walks back through instruction heads of the containing function and takes
/// the first data reference that lands outside any function. The string is
/// sized by its single-byte null terminator.
#[derive(Debug, Clone)]
pub struct DataRefTracer {
    state: TracerState,
    max_lookback: usize,
}

impl DataRefTracer {
    pub fn new(ctx: &dyn BinaryContext, address: u64, identifier: Option<&str>) -> EngineResult<Self> {
        Ok(Self { state: TracerState::new(ctx, address, identifier)?, max_lookback: MAX_LOOKBACK })
    }

    pub fn with_lookback(mut self, max_lookback: usize) -> Self {
        self.max_lookback = max_lookback;
        self
    }

    fn string_ref(&self, ctx: &dyn BinaryContext) -> Option<(u64, u64)> {
        let mut head = self.state.initial_offset;
        for _ in 0..self.max_lookback {
            head = ctx.prev_head(head).filter(|&h| h >= self.state.func_start)?;
            let target = ctx
                .data_refs_from(head)
                .into_iter()
                .find(|&to| ctx.is_loaded(to) && ctx.function_at(to).is_none());
            if let Some(target) = target {
                return Some((head, target));
            }
        }
        None
    }
}

impl StringTracer for DataRefTracer {
    fn search(&mut self, ctx: &dyn BinaryContext) -> bool {
        let Some((head, target)) = self.string_ref(ctx) else {
            debug!("No data reference before 0x{:X}", self.state.initial_offset);
            return false;
        };
        let mut encoded = EncodedString::factory(ctx, target, self.state.initial_offset);
        match encoded.calc_size(ctx, 1) {
            Ok(_) => {
                debug!("String at 0x{target:X} loaded at 0x{head:X}");
                self.state.encoded_strings.push(encoded);
                true
            }
            Err(err) => {
                debug!("Unable to size string at 0x{target:X}: {err}");
                false
            }
        }
    }

    fn state(&self) -> &TracerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TracerState {
        &mut self.state
    }
}

/// Tracer factory for [`DataRefTracer`].
pub fn data_ref_tracer(
    ctx: &dyn BinaryContext,
    address: u64,
    identifier: Option<&str>,
) -> EngineResult<Box<dyn StringTracer>> {
    Ok(Box::new(DataRefTracer::new(ctx, address, identifier)?))
}

/// Repeating-key XOR. A key stored on the string overrides this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XorDecoder {
    pub key: Vec<u8>,
}

impl XorDecoder {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn decode(&self, encoded: &EncodedString) -> Option<DecodedData> {
        let key = encoded.key.as_deref().unwrap_or(&self.key);
        if key.is_empty() {
            return None;
        }
        let data = encoded.encoded_bytes()?;
        Some(DecodedData::Bytes(
            data.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect(),
        ))
    }
}

/// Decoders selectable by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinDecoder {
    /// Report the encoded bytes unchanged.
    Identity,
    Xor(XorDecoder),
}

impl BuiltinDecoder {
    pub fn decode(&self, encoded: &EncodedString) -> Option<DecodedData> {
        match self {
            BuiltinDecoder::Identity => encoded.encoded_bytes().map(|b| DecodedData::Bytes(b.to_vec())),
            BuiltinDecoder::Xor(xor) => xor.decode(encoded),
        }
    }
}

impl FromStr for BuiltinDecoder {
    type Err = EngineError;

    /// `none` or `xor:<hex key>`, e.g. `xor:41` or `xor:de ad be ef`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(BuiltinDecoder::Identity);
        }
        let Some(hex) = s.strip_prefix("xor:") else {
            return Err(EngineError::Rule(format!("Unknown decoder: {s}")));
        };
        let key = crate::matcher::parse_hex_pattern(hex)?
            .into_iter()
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| EngineError::Rule(format!("Wildcards are not allowed in a key: {hex}")))?;
        if key.is_empty() {
            return Err(EngineError::Rule("Empty XOR key".into()));
        }
        Ok(BuiltinDecoder::Xor(XorDecoder::new(key)))
    }
}

impl fmt::Display for BuiltinDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinDecoder::Identity => f.write_str("none"),
            BuiltinDecoder::Xor(xor) => {
                f.write_str("xor:")?;
                for b in &xor.key {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}
