//! In-memory binary context.
//!
//! [`ImageContext`] answers every [`BinaryContext`] query from plain tables:
//! segments with their bytes, function bounds, cross references, instruction
//! heads and stack frames. Annotations made through the trait (renames,
//! comments, patches, string definitions) are recorded in [`Annotations`] so
//! they can be exported after a run.
//!
//! Contexts are assembled with [`ImageContext::builder`], or loaded from a
//! PE/ELF/Mach-O file with `ImageContext::from_file` when the
//! `image-loader` feature is enabled.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{BinaryContext, FrameInfo, FunctionRange};
use crate::matcher::{parse_hex_pattern, scan};

#[cfg(feature = "image-loader")]
mod loader;

/// A loaded region of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub start: u64,
    pub bytes: Vec<u8>,
    pub executable: bool,
    /// Offset of the first byte in the input file, when file-backed.
    pub file_offset: Option<u64>,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }

    fn file_range(&self) -> Option<(u64, u64)> {
        self.file_offset.map(|off| (off, off + self.bytes.len() as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub address: u64,
    pub original: Vec<u8>,
    pub patched: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinedString {
    pub address: u64,
    pub len: usize,
    pub wide: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMemberNote {
    pub frame_id: u64,
    pub stack_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Everything a run changed in the context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub renames: BTreeMap<u64, String>,
    pub comments: BTreeMap<u64, String>,
    pub patches: Vec<PatchRecord>,
    pub strings: Vec<DefinedString>,
    pub frame_members: Vec<FrameMemberNote>,
}

impl Annotations {
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
            && self.comments.is_empty()
            && self.patches.is_empty()
            && self.strings.is_empty()
            && self.frame_members.is_empty()
    }

    fn frame_member(&mut self, frame_id: u64, stack_offset: i64) -> &mut FrameMemberNote {
        let pos = self
            .frame_members
            .iter()
            .position(|m| m.frame_id == frame_id && m.stack_offset == stack_offset);
        let idx = match pos {
            Some(idx) => idx,
            None => {
                self.frame_members.push(FrameMemberNote {
                    frame_id,
                    stack_offset,
                    name: None,
                    comment: None,
                });
                self.frame_members.len() - 1
            }
        };
        &mut self.frame_members[idx]
    }
}

/// Binary context backed by in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct ImageContext {
    path: PathBuf,
    sha256: Option<String>,
    database_dir: Option<PathBuf>,
    arch: Option<String>,
    segments: Vec<Segment>,
    functions: BTreeMap<u64, FunctionRange>,
    names: BTreeMap<u64, String>,
    /// target -> sources
    xrefs: BTreeMap<u64, Vec<u64>>,
    /// source -> data targets
    data_refs: BTreeMap<u64, Vec<u64>>,
    heads: BTreeSet<u64>,
    /// function start -> frame
    frames: BTreeMap<u64, FrameInfo>,
    stack_xrefs: BTreeMap<(u64, i64), Vec<u64>>,
    annotations: Annotations,
}

impl ImageContext {
    pub fn builder() -> ImageBuilder {
        ImageBuilder::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arch(&self) -> Option<&str> {
        self.arch.as_deref()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_by_name(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionRange> {
        self.functions.values()
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn comment_at(&self, address: u64) -> Option<&str> {
        self.annotations.comments.get(&address).map(String::as_str)
    }

    /// Copy of the input file `original` with every recorded patch applied.
    ///
    /// Patches outside the file-backed part of a segment are dropped.
    pub fn patched_file(&self, original: &[u8]) -> Vec<u8> {
        let mut out = original.to_vec();
        for patch in &self.annotations.patches {
            let Some(offset) = self.file_offset_of(patch.address) else {
                warn!("Patch at 0x{:X} has no file backing", patch.address);
                continue;
            };
            let start = offset as usize;
            match out.get_mut(start..start + patch.patched.len()) {
                Some(dest) => dest.copy_from_slice(&patch.patched),
                None => warn!("Patch at 0x{:X} runs past the end of the file", patch.address),
            }
        }
        out
    }

    fn file_offset_of(&self, address: u64) -> Option<u64> {
        let seg = self.segment(address)?;
        Some(seg.file_offset? + (address - seg.start))
    }

    fn segment(&self, address: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    fn segment_mut(&mut self, address: u64) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.contains(address))
    }

    fn default_name(&self, address: u64) -> String {
        if self.functions.contains_key(&address) {
            format!("sub_{address:X}")
        } else {
            format!("unk_{address:X}")
        }
    }

    fn name_taken(&self, name: &str, address: u64) -> bool {
        self.names.iter().any(|(&at, n)| at != address && n == name)
            || self.functions.keys().any(|&at| at != address && format!("sub_{at:X}") == name)
    }
}

impl BinaryContext for ImageContext {
    fn read_bytes(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let seg = self.segment(address)?;
        let start = (address - seg.start) as usize;
        seg.bytes.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }

    fn function_at(&self, address: u64) -> Option<FunctionRange> {
        self.functions
            .range(..=address)
            .next_back()
            .map(|(_, f)| *f)
            .filter(|f| f.contains(address))
    }

    fn create_function(&mut self, address: u64) -> bool {
        if self.function_at(address).is_some() {
            return true;
        }
        let Some(seg) = self.segment(address).filter(|s| s.executable) else {
            return false;
        };
        let next = self.functions.range(address..).next().map(|(&start, _)| start);
        let end = next.map_or(seg.end(), |n| n.min(seg.end()));
        self.functions.insert(address, FunctionRange::new(address, end));
        self.heads.insert(address);
        debug!("Created function 0x{address:X}-0x{end:X}");
        true
    }

    fn xrefs_to(&self, address: u64) -> Vec<u64> {
        self.xrefs.get(&address).cloned().unwrap_or_default()
    }

    fn name_of(&self, address: u64) -> Option<String> {
        self.names.get(&address).cloned().or_else(|| {
            self.functions.contains_key(&address).then(|| self.default_name(address))
        })
    }

    fn rename(&mut self, address: u64, name: &str) -> Option<String> {
        if !self.is_loaded(address) {
            return None;
        }
        if name.is_empty() {
            self.names.remove(&address);
            self.annotations.renames.remove(&address);
            return Some(self.default_name(address));
        }

        let mut applied = name.to_string();
        let mut suffix = 0;
        while self.name_taken(&applied, address) {
            applied = format!("{name}_{suffix}");
            suffix += 1;
        }
        self.names.insert(address, applied.clone());
        self.annotations.renames.insert(address, applied.clone());
        Some(applied)
    }

    fn comment(&mut self, address: u64, text: &str) {
        self.annotations.comments.insert(address, text.to_string());
    }

    fn patch_bytes(&mut self, address: u64, bytes: &[u8]) -> bool {
        let Some(seg) = self.segment_mut(address) else {
            return false;
        };
        let start = (address - seg.start) as usize;
        let Some(target) = seg.bytes.get_mut(start..start + bytes.len()) else {
            return false;
        };
        let original = target.to_vec();
        target.copy_from_slice(bytes);
        self.annotations.patches.push(PatchRecord { address, original, patched: bytes.to_vec() });
        true
    }

    fn define_string(&mut self, address: u64, len: usize, is_wide: bool) -> bool {
        if self.read_bytes(address, len).is_none() {
            return false;
        }
        self.annotations.strings.retain(|s| s.address != address);
        self.annotations.strings.push(DefinedString { address, len, wide: is_wide });
        true
    }

    fn find_binary_pattern(&self, start: u64, pattern: &str) -> Option<u64> {
        let pattern = parse_hex_pattern(pattern).ok()?;
        let seg = self.segment(start)?;
        let from = (start - seg.start) as usize;
        scan(&seg.bytes[from..], &pattern).map(|i| start + i as u64)
    }

    fn frame_layout(&self, address: u64) -> Option<FrameInfo> {
        let func = self.function_at(address)?;
        self.frames.get(&func.start).copied()
    }

    fn segment_name(&self, address: u64) -> Option<String> {
        self.segment(address).map(|s| s.name.clone())
    }

    fn input_file_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn input_file_hash(&self) -> Option<String> {
        self.sha256.clone()
    }

    fn address_of_file_offset(&self, offset: u64) -> Option<u64> {
        let seg = self.segments.iter().find(|s| {
            s.file_range().is_some_and(|(start, end)| offset >= start && offset < end)
        })?;
        let address = seg.start + (offset - seg.file_offset?);
        if !seg.executable {
            return Some(address);
        }
        let head = self.heads.range(seg.start..=address).next_back().copied();
        Some(head.unwrap_or(address))
    }

    fn stack_var_xrefs(&self, frame_id: u64, stack_offset: i64, reference: u64) -> Vec<u64> {
        let Some(func) = self.function_at(reference) else {
            return Vec::new();
        };
        self.stack_xrefs
            .get(&(frame_id, stack_offset))
            .map(|refs| refs.iter().copied().filter(|&r| func.contains(r)).collect())
            .unwrap_or_default()
    }

    fn set_frame_member_comment(&mut self, frame_id: u64, stack_offset: i64, text: &str) -> bool {
        if !self.frames.values().any(|f| f.id == frame_id) {
            return false;
        }
        self.annotations.frame_member(frame_id, stack_offset).comment = Some(text.to_string());
        true
    }

    fn rename_frame_member(&mut self, frame_id: u64, stack_offset: i64, name: &str) -> bool {
        if !self.frames.values().any(|f| f.id == frame_id) {
            return false;
        }
        self.annotations.frame_member(frame_id, stack_offset).name = Some(name.to_string());
        true
    }

    fn database_dir(&self) -> Option<PathBuf> {
        self.database_dir.clone()
    }

    fn data_refs_from(&self, address: u64) -> Vec<u64> {
        self.data_refs.get(&address).cloned().unwrap_or_default()
    }

    fn prev_head(&self, address: u64) -> Option<u64> {
        self.heads.range(..address).next_back().copied()
    }
}

/// Incremental construction of an [`ImageContext`].
///
/// Segments added with [`segment`](Self::segment) are file-backed and laid out
/// back to back in the order they are added, so concatenating their bytes
/// gives the matching flat input file.
#[derive(Debug, Default)]
pub struct ImageBuilder {
    image: ImageContext,
    next_file_offset: u64,
}

impl ImageBuilder {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image.path = path.into();
        self
    }

    pub fn sha256(mut self, hash: impl Into<String>) -> Self {
        self.image.sha256 = Some(hash.into());
        self
    }

    pub fn database_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image.database_dir = Some(dir.into());
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.image.arch = Some(arch.into());
        self
    }

    pub fn segment(mut self, name: &str, start: u64, bytes: impl Into<Vec<u8>>, executable: bool) -> Self {
        let bytes = bytes.into();
        let file_offset = Some(self.next_file_offset);
        self.next_file_offset += bytes.len() as u64;
        self.image.segments.push(Segment { name: name.into(), start, bytes, executable, file_offset });
        self
    }

    /// Segment with no file backing (e.g. `.bss`).
    pub fn virtual_segment(mut self, name: &str, start: u64, size: usize) -> Self {
        self.image.segments.push(Segment {
            name: name.into(),
            start,
            bytes: vec![0; size],
            executable: false,
            file_offset: None,
        });
        self
    }

    pub fn push_segment(mut self, segment: Segment) -> Self {
        self.image.segments.push(segment);
        self
    }

    pub fn function(mut self, start: u64, end: u64) -> Self {
        self.image.functions.insert(start, FunctionRange::new(start, end));
        self.image.heads.insert(start);
        self
    }

    pub fn name(mut self, address: u64, name: &str) -> Self {
        self.image.names.insert(address, name.into());
        self
    }

    /// Reference from `from` to `to`.
    pub fn xref(mut self, from: u64, to: u64) -> Self {
        let sources = self.image.xrefs.entry(to).or_default();
        if !sources.contains(&from) {
            sources.push(from);
        }
        self
    }

    /// Data reference from the instruction at `from`. Also recorded as an xref to `to`.
    pub fn data_ref(mut self, from: u64, to: u64) -> Self {
        let targets = self.image.data_refs.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
        self.xref(from, to)
    }

    pub fn head(mut self, address: u64) -> Self {
        self.image.heads.insert(address);
        self
    }

    pub fn heads(mut self, addresses: impl IntoIterator<Item = u64>) -> Self {
        self.image.heads.extend(addresses);
        self
    }

    pub fn frame(mut self, function_start: u64, frame: FrameInfo) -> Self {
        self.image.frames.insert(function_start, frame);
        self
    }

    pub fn stack_xref(mut self, frame_id: u64, stack_offset: i64, from: u64) -> Self {
        self.image.stack_xrefs.entry((frame_id, stack_offset)).or_default().push(from);
        self
    }

    pub fn build(mut self) -> ImageContext {
        self.image.segments.sort_by_key(|s| s.start);
        self.image
    }
}
