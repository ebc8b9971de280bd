//! Binary context: the capability surface the engine needs from an analysis host.
//!
//! The engine never disassembles or emulates anything itself. Everything it
//! knows about the binary (bytes, functions, references, names, stack frames)
//! comes through this trait, and every annotation it makes (renames, comments,
//! patches, string definitions) goes back through it.
//!
//! Hosts that lack one of the optional primitives can rely on the provided
//! defaults; the affected features then degrade to logged no-ops.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bounds of a function known to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRange {
    pub start: u64,
    pub end: u64,
}

impl FunctionRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// Stack frame layout of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Host identifier of the frame structure.
    pub id: u64,
    /// Size of the local variable area.
    pub local_size: u64,
}

/// Geometry of the emulated stack used by tracers that report stack pointers.
///
/// A pointer observed during emulation is converted to a frame offset with
/// `pointer + rsp_offset + local_size - stack_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackModel {
    pub stack_base: u64,
    pub rsp_offset: u64,
}

impl Default for StackModel {
    fn default() -> Self {
        Self { stack_base: 0x0118_0000, rsp_offset: 0x0001_0000 }
    }
}

/// Capabilities consumed from the disassembly/analysis host.
pub trait BinaryContext {
    /// Read `len` bytes at `address`, or `None` if the range is not loaded.
    fn read_bytes(&self, address: u64, len: usize) -> Option<Vec<u8>>;

    /// Function containing `address`.
    fn function_at(&self, address: u64) -> Option<FunctionRange>;

    /// Ask the host to create a function containing `address`.
    fn create_function(&mut self, address: u64) -> bool;

    /// Addresses that reference `address`.
    fn xrefs_to(&self, address: u64) -> Vec<u64>;

    /// Name currently applied at `address`.
    fn name_of(&self, address: u64) -> Option<String>;

    /// Apply `name` at `address` and return the name the host actually set.
    ///
    /// An empty name resets to the host default. Collisions are resolved by the
    /// host, so the returned name may differ from the requested one.
    fn rename(&mut self, address: u64, name: &str) -> Option<String>;

    /// Set a repeatable comment at `address`.
    fn comment(&mut self, address: u64, text: &str);

    /// Overwrite the static image bytes at `address`.
    fn patch_bytes(&mut self, address: u64, bytes: &[u8]) -> bool;

    /// Define a string object of `len` bytes at `address`.
    fn define_string(&mut self, address: u64, len: usize, is_wide: bool) -> bool;

    /// Find the next occurrence of a hex pattern (e.g. `"00 00"`) at or after `start`.
    fn find_binary_pattern(&self, start: u64, pattern: &str) -> Option<u64>;

    /// Stack frame of the function containing `address`.
    fn frame_layout(&self, address: u64) -> Option<FrameInfo>;

    /// Name of the segment containing `address`.
    fn segment_name(&self, address: u64) -> Option<String>;

    /// Path of the input file the analysis was created from.
    fn input_file_path(&self) -> PathBuf;

    /// Hex SHA-256 digest of the input file as recorded by the host.
    fn input_file_hash(&self) -> Option<String>;

    /// Whether `address` is backed by the loaded image.
    fn is_loaded(&self, address: u64) -> bool {
        self.segment_name(address).is_some()
    }

    /// Map a file offset to the head of the item covering it.
    fn address_of_file_offset(&self, _offset: u64) -> Option<u64> {
        None
    }

    /// References to a stack variable, resolved in the function containing `reference`.
    fn stack_var_xrefs(&self, _frame_id: u64, _stack_offset: i64, _reference: u64) -> Vec<u64> {
        Vec::new()
    }

    /// Set a repeatable comment on a stack frame member.
    fn set_frame_member_comment(&mut self, _frame_id: u64, _stack_offset: i64, _text: &str) -> bool {
        false
    }

    /// Rename a stack frame member.
    fn rename_frame_member(&mut self, _frame_id: u64, _stack_offset: i64, _name: &str) -> bool {
        false
    }

    /// Directory holding the analysis database.
    fn database_dir(&self) -> Option<PathBuf> {
        None
    }

    /// File name of the input file.
    fn input_file_name(&self) -> Option<String> {
        self.input_file_path().file_name().and_then(|n| n.to_str()).map(str::to_string)
    }

    /// Data addresses referenced by the instruction at `address`.
    fn data_refs_from(&self, _address: u64) -> Vec<u64> {
        Vec::new()
    }

    /// Head of the item preceding `address`.
    fn prev_head(&self, _address: u64) -> Option<u64> {
        None
    }

    /// Emulated stack geometry used to turn stack pointers into frame offsets.
    fn stack_model(&self) -> StackModel {
        StackModel::default()
    }
}
