//! Encoded string model.
//!
//! An [`EncodedString`] follows one candidate from discovery to report:
//! a tracer creates it with a site (and usually a size, which pulls the
//! encoded bytes), the decode pipeline fills in [`DecodedData`], and charset
//! detection records the [`Codec`] that turns those bytes into text.
//!
//! Strings live either at a fixed address in the image ([`StringSite::Located`])
//! or in a function's stack frame ([`StringSite::Stack`]). Stack strings have no
//! static bytes to read or patch; those operations report `Unsupported` or
//! become logged no-ops instead.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::charset::{self, Codec};
use crate::context::BinaryContext;
use crate::error::{EngineError, EngineResult};

/// Longest comment applied to the host, in characters.
pub const MAX_COMMENT_LENGTH: usize = 130;
/// Longest name applied to the host, in characters.
pub const MAX_NAME_LENGTH: usize = 30;

/// Output of a decode function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DecodedData {
    /// Raw decoded bytes; the text encoding still has to be detected.
    Bytes(Vec<u8>),
    /// Text the decoder already produced.
    Text(String),
}

impl DecodedData {
    pub fn is_empty(&self) -> bool {
        match self {
            DecodedData::Bytes(b) => b.is_empty(),
            DecodedData::Text(t) => t.is_empty(),
        }
    }

    /// Byte form of the data. Text is encoded as UTF-16LE, matching how wide
    /// strings are laid out in the image.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DecodedData::Bytes(b) => b.clone(),
            DecodedData::Text(t) => t.encode_utf16().flat_map(|u| u.to_le_bytes()).collect(),
        }
    }
}

impl From<Vec<u8>> for DecodedData {
    fn from(bytes: Vec<u8>) -> Self {
        DecodedData::Bytes(bytes)
    }
}

impl From<String> for DecodedData {
    fn from(text: String) -> Self {
        DecodedData::Text(text)
    }
}

/// Location of a string that was built on the stack.
///
/// Frame id and offset are optional because tracers can't always recover them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackSlot {
    pub frame_id: Option<u64>,
    pub stack_offset: Option<i64>,
    /// Pointer to the string observed during emulation, if any.
    pub memory_ptr: Option<u64>,
}

/// Where a string lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StringSite {
    Located(u64),
    Stack(StackSlot),
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
enum SortKey<'a> {
    Located {
        location: u64,
        reference: Option<u64>,
        decoded: Option<&'a DecodedData>,
    },
    Stack {
        reference: Option<u64>,
        frame_id: Option<u64>,
        stack_offset: Option<i64>,
        decoded: Option<&'a DecodedData>,
    },
}

/// One encoded string candidate and its decode state.
#[derive(Debug, Clone)]
pub struct EncodedString {
    pub site: StringSite,
    /// Address the string is used from.
    pub reference: Option<u64>,
    /// Byte length of the encoded region.
    pub size: Option<u64>,
    /// Offset from the site at which the data actually starts.
    pub offset: Option<u64>,
    /// Per-string key material.
    pub key: Option<Vec<u8>>,
    encoded_bytes: Option<Vec<u8>>,
    pub decoded: Option<DecodedData>,
    pub codec: Option<Codec>,
}

impl EncodedString {
    fn with_site(site: StringSite) -> Self {
        Self {
            site,
            reference: None,
            size: None,
            offset: None,
            key: None,
            encoded_bytes: None,
            decoded: None,
            codec: None,
        }
    }

    /// A string at a fixed address. Call [`load`](Self::load) once the size is known.
    pub fn at(location: u64) -> Self {
        Self::with_site(StringSite::Located(location))
    }

    /// A string materialized on the stack.
    pub fn on_stack(slot: StackSlot) -> Self {
        Self::with_site(StringSite::Stack(slot))
    }

    /// Build a located string if `location` is in the image, otherwise treat
    /// it as an emulated stack pointer and resolve the frame from `reference`.
    pub fn factory(ctx: &dyn BinaryContext, location: u64, reference: u64) -> Self {
        if ctx.is_loaded(location) {
            return Self::at(location).referenced_from(reference);
        }

        let frame = ctx.frame_layout(reference);
        let model = ctx.stack_model();
        let stack_offset = frame.map(|f| {
            location.wrapping_add(model.rsp_offset).wrapping_add(f.local_size).wrapping_sub(model.stack_base)
                as i64
        });
        if frame.is_none() {
            debug!("No frame for stack string referenced at 0x{reference:X}");
        }
        Self::on_stack(StackSlot {
            frame_id: frame.map(|f| f.id),
            stack_offset,
            memory_ptr: Some(location),
        })
        .referenced_from(reference)
    }

    pub fn referenced_from(mut self, reference: u64) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the size and pull the encoded bytes from the image.
    ///
    /// Stack strings only record the size; their bytes come from
    /// [`set_encoded_bytes`](Self::set_encoded_bytes).
    pub fn load(mut self, ctx: &dyn BinaryContext, size: u64) -> EngineResult<Self> {
        self.size = Some(size);
        if self.is_located() {
            self.encoded_bytes = Some(self.get_bytes(ctx)?);
        }
        Ok(self)
    }

    /// Supply encoded bytes directly (e.g. read from emulated memory).
    pub fn set_encoded_bytes(&mut self, bytes: Vec<u8>) {
        self.size = Some(bytes.len() as u64);
        self.encoded_bytes = Some(bytes);
    }

    /// Swap the encoded bytes without touching `size`.
    pub(crate) fn replace_encoded_bytes(&mut self, bytes: Option<Vec<u8>>) {
        self.encoded_bytes = bytes;
    }

    pub fn encoded_bytes(&self) -> Option<&[u8]> {
        self.encoded_bytes.as_deref()
    }

    pub fn location(&self) -> Option<u64> {
        match self.site {
            StringSite::Located(location) => Some(location),
            StringSite::Stack(_) => None,
        }
    }

    pub fn stack_slot(&self) -> Option<&StackSlot> {
        match &self.site {
            StringSite::Stack(slot) => Some(slot),
            StringSite::Located(_) => None,
        }
    }

    pub fn is_located(&self) -> bool {
        matches!(self.site, StringSite::Located(_))
    }

    pub fn is_stack(&self) -> bool {
        !self.is_located()
    }

    /// Address where the data starts (`location + offset`).
    pub fn start(&self) -> Option<u64> {
        self.location().map(|loc| loc + self.offset.unwrap_or(0))
    }

    pub fn end(&self) -> Option<u64> {
        Some(self.start()? + self.byte_length()? as u64)
    }

    /// Decoded data in the form written back to the image.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match &self.decoded {
            Some(data) if !data.is_empty() => Some(data.to_bytes()),
            _ => None,
        }
    }

    pub fn byte_length(&self) -> Option<usize> {
        self.as_bytes().map(|b| b.len())
    }

    /// Whether the decoded data should be defined as a wide string.
    pub fn is_wide(&self) -> bool {
        matches!(self.decoded, Some(DecodedData::Text(_)))
    }

    /// Read `size` bytes at the string location.
    pub fn get_bytes(&self, ctx: &dyn BinaryContext) -> EngineResult<Vec<u8>> {
        let size = self.size.ok_or(EngineError::SizeUnknown)?;
        let location = match self.site {
            StringSite::Located(location) => location,
            StringSite::Stack(_) => return Err(EngineError::Unsupported("read stack string bytes")),
        };
        if size == 0 {
            return Ok(Vec::new());
        }
        ctx.read_bytes(location, size as usize)
            .ok_or(EngineError::Unreadable { address: location, len: size as usize })
    }

    /// Find the next null terminator of `width` bytes and set the size from it.
    ///
    /// The size is rounded up to a multiple of `width`. Encoded bytes are
    /// pulled if they were not already present.
    pub fn calc_size(&mut self, ctx: &dyn BinaryContext, width: usize) -> EngineResult<u64> {
        let location = match self.site {
            StringSite::Located(location) => location,
            StringSite::Stack(_) => {
                return Err(EngineError::Unsupported("size calculation for stack strings"))
            }
        };
        let width = width.max(1);
        let pattern = vec!["00"; width].join(" ");
        let end = ctx
            .find_binary_pattern(location, &pattern)
            .ok_or(EngineError::TerminatorNotFound(location))?;

        let mut size = end.saturating_sub(location);
        while size % width as u64 != 0 {
            size += 1;
        }
        self.size = Some(size);
        if self.encoded_bytes.is_none() {
            self.encoded_bytes = Some(self.get_bytes(ctx)?);
        }
        Ok(size)
    }

    /// References to the string: data xrefs for located strings, stack
    /// variable xrefs for stack strings.
    pub fn xrefs_to(&self, ctx: &dyn BinaryContext) -> EngineResult<Vec<u64>> {
        match self.site {
            StringSite::Located(location) => Ok(ctx.xrefs_to(location)),
            StringSite::Stack(slot) => {
                let reference = self
                    .reference
                    .ok_or(EngineError::Unsupported("stack xrefs without a reference"))?;
                match (slot.frame_id, slot.stack_offset) {
                    (Some(frame_id), Some(stack_offset)) => {
                        Ok(ctx.stack_var_xrefs(frame_id, stack_offset, reference))
                    }
                    _ => Err(EngineError::Unsupported("stack xrefs without frame and offset")),
                }
            }
        }
    }

    /// Text of the decoded data, detecting and recording the codec if needed.
    pub fn decode_unknown_charset(&mut self) -> String {
        let (codec, text) = self.resolve_text();
        if codec.is_some() {
            self.codec = codec;
        }
        text
    }

    /// Same as [`decode_unknown_charset`](Self::decode_unknown_charset) without recording the codec.
    pub fn text(&self) -> String {
        self.resolve_text().1
    }

    fn resolve_text(&self) -> (Option<Codec>, String) {
        let bytes = match &self.decoded {
            None => return (None, String::new()),
            Some(DecodedData::Text(text)) => return (None, text.clone()),
            Some(DecodedData::Bytes(bytes)) => bytes,
        };
        if let Some(codec) = self.codec {
            if let Some(text) = charset::decode_with(codec, bytes) {
                return (Some(codec), text);
            }
            debug!("Recorded codec {codec} no longer decodes the data, detecting again");
        }
        match charset::detect_charset(bytes) {
            Some((codec, text)) => (Some(codec), text),
            None => (None, String::new()),
        }
    }

    /// Printable name for the host (non-ASCII replaced by `?`).
    pub fn display_name(&self) -> String {
        charset::display_ascii(&self.text())
    }

    /// Multi-line human readable report.
    pub fn report(&self) -> String {
        let mut text = String::new();
        if let StringSite::Stack(slot) = &self.site {
            if let Some(frame_id) = slot.frame_id {
                text.push_str(&format!("Frame ID: 0x{frame_id:X}\n"));
            }
            if let Some(stack_offset) = slot.stack_offset {
                text.push_str(&format!("Stack Offset: {}\n", signed_hex(stack_offset)));
            }
        }
        if let Some(location) = self.location() {
            text.push_str(&format!("EA:  0x{location:X}\n"));
        }
        if let Some(reference) = self.reference {
            text.push_str(&format!("Ref: 0x{reference:X}\n"));
        }
        if let Some(offset) = self.offset {
            text.push_str(&format!("Offset: 0x{offset:X}\n"));
        }
        if let Some(decoded) = &self.decoded {
            let (codec, dec) = self.resolve_text();
            if let Some(codec) = codec.or(self.codec) {
                text.push_str(&format!("Detected Code Page: {codec}\n"));
            }
            text.push_str(&format!("Raw Dec: {decoded:?}\n"));
            text.push_str(&format!("Dec: {dec}"));
        }
        text
    }

    /// Comment and rename the string in the host. Defaults to the decoded text.
    pub fn rename(&self, ctx: &mut dyn BinaryContext, name: Option<&str>) -> bool {
        let name = name.map(str::to_string).unwrap_or_else(|| self.display_name());
        if name.is_empty() {
            debug!("Unable to rename encoded string due to no decoded string: {:?}", self.site);
            return false;
        }
        let comment = truncated_comment(&name);

        match self.site {
            StringSite::Located(location) => {
                ctx.comment(location, &comment);
                if let Some(reference) = self.reference {
                    ctx.comment(reference, &comment);
                }
                let short: String = name.chars().take(MAX_NAME_LENGTH).collect();
                ctx.rename(location, &short).is_some()
            }
            StringSite::Stack(slot) => {
                let mut applied = false;
                if let (Some(frame_id), Some(stack_offset)) = (slot.frame_id, slot.stack_offset) {
                    ctx.set_frame_member_comment(frame_id, stack_offset, &comment);
                    let var_name = stack_var_name(&name);
                    applied = ctx.rename_frame_member(frame_id, stack_offset, &var_name);
                    if !applied {
                        warn!("Failed to rename stack member at offset {}", signed_hex(stack_offset));
                    }
                }
                if let Some(reference) = self.reference {
                    ctx.comment(reference, &comment);
                }
                applied
            }
        }
    }

    /// Overwrite the encoded bytes in the image with the decoded data.
    ///
    /// `fill` pads the patch up to the encoded length when the decoded data
    /// is shorter. Stack strings have no static bytes, so patching them does
    /// nothing.
    pub fn patch(&self, ctx: &mut dyn BinaryContext, fill: Option<u8>, define: bool) -> bool {
        let Some(start) = self.start() else {
            debug!("Skipping patch for stack string referenced at {:?}", self.reference);
            return false;
        };
        let Some(mut data) = self.as_bytes() else {
            return false;
        };
        if let (Some(fill), Some(encoded)) = (fill, self.encoded_bytes.as_ref()) {
            if data.len() < encoded.len() {
                data.resize(encoded.len(), fill);
            }
        }
        if !ctx.patch_bytes(start, &data) {
            warn!("Failed to patch decoded string at 0x{start:X}");
            return false;
        }
        if define {
            self.define(ctx);
        }
        true
    }

    /// Define the decoded string in the host.
    pub fn define(&self, ctx: &mut dyn BinaryContext) -> bool {
        let (Some(start), Some(len)) = (self.start(), self.byte_length()) else {
            return false;
        };
        let defined = ctx.define_string(start, len, self.is_wide());
        if !defined {
            debug!("Unable to define string at 0x{start:X}");
        }
        defined
    }

    /// Serializable summary of the string.
    pub fn record(&self) -> StringRecord {
        let slot = self.stack_slot();
        StringRecord {
            location: self.location(),
            reference: self.reference,
            offset: self.offset,
            size: self.size,
            frame_id: slot.and_then(|s| s.frame_id),
            stack_offset: slot.and_then(|s| s.stack_offset),
            codec: self.codec,
            text: self.text(),
        }
    }

    fn sort_key(&self) -> SortKey<'_> {
        match &self.site {
            StringSite::Located(location) => SortKey::Located {
                location: *location,
                reference: self.reference,
                decoded: self.decoded.as_ref(),
            },
            StringSite::Stack(slot) => SortKey::Stack {
                reference: self.reference,
                frame_id: slot.frame_id,
                stack_offset: slot.stack_offset,
                decoded: self.decoded.as_ref(),
            },
        }
    }
}

fn truncated_comment(name: &str) -> String {
    let shown: String = name.chars().take(MAX_COMMENT_LENGTH).collect();
    let mut comment = format!("\"{shown}\"");
    if name.chars().count() > MAX_COMMENT_LENGTH {
        comment.push_str(" (truncated)");
    }
    comment
}

/// Stack member name: `a` + capitalized name with invalid characters replaced.
/// `-0x10` rather than the two's complement form.
fn signed_hex(value: i64) -> String {
    let sign = if value < 0 { "-" } else { "" };
    format!("{sign}0x{:X}", value.unsigned_abs())
}

fn stack_var_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(MAX_NAME_LENGTH)
        .map(|c| if c.is_ascii_alphanumeric() || "_$?@".contains(c) { c } else { '_' })
        .collect();
    let mut chars = cleaned.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
        None => String::new(),
    };
    format!("a{capitalized}")
}

impl PartialEq for EncodedString {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for EncodedString {}

impl Hash for EncodedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
    }
}

impl PartialOrd for EncodedString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EncodedString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for EncodedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&charset::escape_text(&self.text()))
    }
}

/// Flat, serializable view of a reported string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<Codec>,
    pub text: String,
}
