//! Loading an [`ImageContext`] from a PE/ELF/Mach-O file.
//!
//! Sections come from `goblin`. Functions come from symbols (ELF function
//! symbols, PE exports and entry point, Mach-O symbols in code sections).
//! A linear `capstone` sweep over each executable section records
//! instruction heads, direct call edges and operands that point into
//! non-executable sections.

use std::fs;
use std::path::Path;

use anyhow::Context;
use capstone::arch::ArchOperand;
use capstone::{arch, prelude::*, Capstone, InsnGroupId, InsnGroupType};
use goblin::{elf, mach, pe, Object};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{ImageContext, Segment};
use crate::context::FunctionRange;
use crate::error::{EngineError, EngineResult};

/// Load address for relocatable objects, whose sections all start at zero.
const RELOCATABLE_BASE: u64 = 0x1000;

/// Largest in-memory section the loader will materialize.
const MAX_SECTION_SIZE: u64 = 1 << 28;

#[derive(Debug, Clone)]
struct SymbolInfo {
    name: String,
    address: u64,
    size: Option<u64>,
}

struct Layout {
    arch: Option<&'static str>,
    segments: Vec<Segment>,
    symbols: Vec<SymbolInfo>,
}

fn arch_of(obj: &Object) -> Option<&'static str> {
    match obj {
        Object::Elf(elf) => match elf.header.e_machine {
            elf::header::EM_X86_64 => Some("x86_64"),
            elf::header::EM_386 => Some("x86"),
            elf::header::EM_AARCH64 => Some("arm64"),
            elf::header::EM_ARM => Some("arm"),
            _ => None,
        },
        Object::PE(pe) => match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Some("x86"),
            pe::header::COFF_MACHINE_X86_64 => Some("x86_64"),
            pe::header::COFF_MACHINE_ARM => Some("arm"),
            pe::header::COFF_MACHINE_ARM64 => Some("arm64"),
            _ => None,
        },
        Object::Mach(mach::Mach::Binary(bin)) => match bin.header.cputype() {
            mach::cputype::CPU_TYPE_X86 => Some("x86"),
            mach::cputype::CPU_TYPE_X86_64 => Some("x86_64"),
            mach::cputype::CPU_TYPE_ARM => Some("arm"),
            mach::cputype::CPU_TYPE_ARM64 => Some("arm64"),
            _ => None,
        },
        _ => None,
    }
}

fn make_cs(arch: &str) -> EngineResult<Capstone> {
    let built = match arch {
        "x86_64" => Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build(),
        "x86" => Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).detail(true).build(),
        "arm" => Capstone::new().arm().mode(arch::arm::ArchMode::Arm).detail(true).build(),
        "arm64" => Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build(),
        other => return Err(EngineError::Image(format!("No disassembler for {other}"))),
    };
    built.map_err(|e| EngineError::Image(format!("capstone init failed: {e}")))
}

/// Reject section sizes taken from headers that can't belong to a real image.
fn section_size(name: &str, size: u64) -> EngineResult<usize> {
    if size > MAX_SECTION_SIZE {
        return Err(EngineError::Image(format!(
            "Section {name:?} claims 0x{size:X} bytes (limit 0x{MAX_SECTION_SIZE:X})"
        )));
    }
    usize::try_from(size).map_err(|_| EngineError::Image(format!("Section {name:?} is too large")))
}

/// File bytes at `offset`, zero-filled to `size`. `size` must already be checked.
fn file_slice(bytes: &[u8], offset: u64, size: usize) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
    let end = start.saturating_add(size).min(bytes.len());
    let mut data = bytes[start..end].to_vec();
    data.resize(size, 0);
    data
}

fn elf_layout(elf: &elf::Elf, bytes: &[u8]) -> EngineResult<Layout> {
    use elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS};

    let relocatable = elf.header.e_type == elf::header::ET_REL;
    let mut bases = vec![None; elf.section_headers.len()];
    let mut segments = Vec::new();
    let mut cursor = RELOCATABLE_BASE;

    for (idx, sh) in elf.section_headers.iter().enumerate() {
        if sh.sh_flags & u64::from(SHF_ALLOC) == 0 || sh.sh_size == 0 {
            continue;
        }
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
        let size = section_size(&name, sh.sh_size)?;
        let start = if relocatable {
            let align = sh.sh_addralign.clamp(1, MAX_SECTION_SIZE);
            cursor = cursor.div_ceil(align) * align;
            let start = cursor;
            cursor += sh.sh_size;
            start
        } else {
            sh.sh_addr
        };
        bases[idx] = Some(start);

        let nobits = sh.sh_type == SHT_NOBITS;
        segments.push(Segment {
            name,
            start,
            bytes: if nobits { vec![0; size] } else { file_slice(bytes, sh.sh_offset, size) },
            executable: sh.sh_flags & u64::from(SHF_EXECINSTR) != 0,
            file_offset: (!nobits).then_some(sh.sh_offset),
        });
    }

    let mut symbols = Vec::new();
    for sym in elf.syms.iter() {
        if !sym.is_function() || sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
            continue;
        }
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let address = if relocatable {
            match bases.get(sym.st_shndx).copied().flatten() {
                Some(base) => base + sym.st_value,
                None => continue,
            }
        } else {
            sym.st_value
        };
        let size = (sym.st_size > 0).then_some(sym.st_size);
        symbols.push(SymbolInfo { name: name.to_string(), address, size });
    }

    Ok(Layout { arch: None, segments, symbols })
}

fn pe_layout(pe: &pe::PE, bytes: &[u8]) -> EngineResult<Layout> {
    use pe::section_table::IMAGE_SCN_MEM_EXECUTE;

    let image_base = pe.image_base as u64;
    let segments = pe
        .sections
        .iter()
        .map(|sec| {
            let name = sec.name().unwrap_or_default().to_string();
            let size = section_size(&name, u64::from(sec.virtual_size.max(sec.size_of_raw_data)))?;
            let raw = (sec.size_of_raw_data as usize).min(size);
            let mut data = file_slice(bytes, u64::from(sec.pointer_to_raw_data), raw);
            data.resize(size, 0);
            Ok(Segment {
                name,
                start: image_base + u64::from(sec.virtual_address),
                bytes: data,
                executable: sec.characteristics & IMAGE_SCN_MEM_EXECUTE != 0,
                file_offset: (sec.size_of_raw_data > 0).then_some(u64::from(sec.pointer_to_raw_data)),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let mut symbols: Vec<SymbolInfo> = pe
        .exports
        .iter()
        .filter(|exp| exp.rva != 0)
        .filter_map(|exp| {
            let name = exp.name.unwrap_or_default();
            (!name.is_empty()).then(|| SymbolInfo {
                name: name.to_string(),
                address: image_base + exp.rva as u64,
                size: None,
            })
        })
        .collect();
    if pe.entry != 0 {
        symbols.push(SymbolInfo {
            name: "start".into(),
            address: image_base + pe.entry as u64,
            size: None,
        });
    }

    Ok(Layout { arch: None, segments, symbols })
}

fn mach_layout(bin: &mach::MachO) -> EngineResult<Layout> {
    const CODE_FLAGS: u32 = 0x8000_0000 | 0x0000_0400;

    let segments: Vec<Segment> = bin
        .segments
        .sections()
        .flatten()
        .filter_map(Result::ok)
        .filter(|(sec, _)| sec.size > 0)
        .map(|(sec, data)| {
            let name = sec.name().unwrap_or("").to_string();
            let size = section_size(&name, sec.size)?;
            let mut bytes = data[..data.len().min(size)].to_vec();
            bytes.resize(size, 0);
            Ok(Segment {
                name,
                start: sec.addr,
                bytes,
                executable: sec.flags & CODE_FLAGS != 0,
                file_offset: (sec.offset != 0).then_some(u64::from(sec.offset)),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let symbols = bin
        .symbols()
        .filter_map(Result::ok)
        .filter(|(name, nlist)| !name.is_empty() && nlist.n_value != 0)
        .filter(|(_, nlist)| segments.iter().any(|s| s.executable && s.contains(nlist.n_value)))
        .map(|(name, nlist)| SymbolInfo {
            name: name.trim_start_matches('_').to_string(),
            address: nlist.n_value,
            size: None,
        })
        .collect();

    Ok(Layout { arch: None, segments, symbols })
}

fn is_group(detail: &capstone::InsnDetail, group: u8) -> bool {
    detail.groups().any(|g| g == InsnGroupId(group))
}

fn call_target(detail: &capstone::InsnDetail) -> Option<u64> {
    detail.arch_detail().operands().iter().find_map(|op| match op {
        ArchOperand::X86Operand(op) => match op.op_type {
            arch::x86::X86OperandType::Imm(imm) => Some(imm as u64),
            _ => None,
        },
        ArchOperand::ArmOperand(op) => match op.op_type {
            arch::arm::ArmOperandType::Imm(imm) => Some(imm as u64),
            _ => None,
        },
        ArchOperand::Arm64Operand(op) => match op.op_type {
            arch::arm64::Arm64OperandType::Imm(imm) => Some(imm as u64),
            _ => None,
        },
        _ => None,
    })
}

/// Candidate data addresses named by the operands of one instruction.
fn operand_targets(cs: &Capstone, detail: &capstone::InsnDetail, next_address: u64) -> Vec<u64> {
    let mut targets = Vec::new();
    for op in detail.arch_detail().operands() {
        match op {
            ArchOperand::X86Operand(op) => match op.op_type {
                arch::x86::X86OperandType::Imm(imm) => targets.push(imm as u64),
                arch::x86::X86OperandType::Mem(mem) => {
                    let base = cs.reg_name(mem.base());
                    if base.as_deref() == Some("rip") {
                        targets.push(next_address.wrapping_add(mem.disp() as u64));
                    } else if mem.base().0 == 0 && mem.index().0 == 0 {
                        targets.push(mem.disp() as u64);
                    }
                }
                _ => {}
            },
            ArchOperand::ArmOperand(op) => {
                if let arch::arm::ArmOperandType::Imm(imm) = op.op_type {
                    targets.push(imm as u32 as u64);
                }
            }
            ArchOperand::Arm64Operand(op) => {
                if let arch::arm64::Arm64OperandType::Imm(imm) = op.op_type {
                    targets.push(imm as u64);
                }
            }
            _ => {}
        }
    }
    targets
}

fn sweep(image: &mut ImageContext, cs: &Capstone) {
    let code: Vec<(u64, Vec<u8>)> = image
        .segments
        .iter()
        .filter(|s| s.executable)
        .map(|s| (s.start, s.bytes.clone()))
        .collect();

    for (seg_start, bytes) in code {
        let mut offset = 0usize;
        while offset < bytes.len() {
            let address = seg_start + offset as u64;
            let insns = match cs.disasm_all(&bytes[offset..], address) {
                Ok(insns) if !insns.is_empty() => insns,
                _ => {
                    offset += 1;
                    continue;
                }
            };
            for insn in insns.iter() {
                let from = insn.address();
                let next = from + insn.bytes().len() as u64;
                offset = (next - seg_start) as usize;
                image.heads.insert(from);

                let Ok(detail) = cs.insn_detail(&insn) else { continue };
                if is_group(&detail, InsnGroupType::CS_GRP_CALL as u8) {
                    if let Some(target) = call_target(&detail) {
                        if image.segment(target).is_some_and(|s| s.executable) {
                            image.add_xref(from, target);
                        }
                    }
                    continue;
                }
                if is_group(&detail, InsnGroupType::CS_GRP_JUMP as u8) {
                    continue;
                }
                for target in operand_targets(cs, &detail, next) {
                    if image.segment(target).is_some_and(|s| !s.executable) {
                        image.add_data_ref(from, target);
                    }
                }
            }
        }
    }
}

fn functions_from(symbols: &mut Vec<SymbolInfo>, image: &mut ImageContext) {
    symbols.sort_by_key(|s| s.address);
    symbols.dedup_by_key(|s| s.address);
    let starts: Vec<u64> = symbols.iter().map(|s| s.address).collect();

    for (idx, sym) in symbols.iter().enumerate() {
        let code = image.segment(sym.address).filter(|s| s.executable);
        let Some(seg_end) = code.map(Segment::end) else {
            continue;
        };
        let next = starts.get(idx + 1).copied().filter(|&n| n < seg_end).unwrap_or(seg_end);
        let end = sym
            .size
            .map_or(next, |size| (sym.address + size).min(seg_end))
            .max(sym.address + 1);
        image.functions.insert(sym.address, FunctionRange::new(sym.address, end));
        image.names.insert(sym.address, sym.name.clone());
        image.heads.insert(sym.address);
    }
}

impl ImageContext {
    /// Parse a PE/ELF/Mach-O image already read into memory.
    pub fn from_bytes(path: &Path, bytes: &[u8]) -> EngineResult<Self> {
        let obj = Object::parse(bytes)
            .map_err(|e| EngineError::Image(format!("Failed to parse {}: {e}", path.display())))?;
        let arch = arch_of(&obj);
        let mut layout = match &obj {
            Object::Elf(elf) => elf_layout(elf, bytes)?,
            Object::PE(pe) => pe_layout(pe, bytes)?,
            Object::Mach(mach::Mach::Binary(bin)) => mach_layout(bin)?,
            _ => return Err(EngineError::Image(format!("Unsupported image format: {}", path.display()))),
        };
        layout.arch = arch;

        let mut image = ImageContext {
            path: path.to_path_buf(),
            sha256: Some(format!("{:x}", Sha256::digest(bytes))),
            database_dir: path.parent().map(Path::to_path_buf),
            arch: layout.arch.map(str::to_string),
            segments: layout.segments,
            ..ImageContext::default()
        };
        image.segments.sort_by_key(|s| s.start);

        match layout.arch.map(make_cs) {
            Some(Ok(cs)) => sweep(&mut image, &cs),
            Some(Err(err)) => debug!("Skipping disassembly: {err}"),
            None => debug!("Unknown architecture, skipping disassembly"),
        }

        functions_from(&mut layout.symbols, &mut image);
        if image.functions.is_empty() {
            let mut targets: Vec<SymbolInfo> = image
                .xrefs
                .keys()
                .filter(|&&to| image.segment(to).is_some_and(|s| s.executable))
                .map(|&to| SymbolInfo { name: format!("sub_{to:X}"), address: to, size: None })
                .collect();
            functions_from(&mut targets, &mut image);
            image.names.clear();
        }

        info!(
            "Loaded {}: {} segment(s), {} function(s), {} head(s)",
            path.display(),
            image.segments.len(),
            image.functions.len(),
            image.heads.len()
        );
        Ok(image)
    }

    /// Read and parse the image at `path`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read binary: {}", path.display()))?;
        Ok(Self::from_bytes(path, &bytes)?)
    }

    fn add_xref(&mut self, from: u64, to: u64) {
        let sources = self.xrefs.entry(to).or_default();
        if !sources.contains(&from) {
            sources.push(from);
        }
    }

    fn add_data_ref(&mut self, from: u64, to: u64) {
        let targets = self.data_refs.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
        self.add_xref(from, to);
    }
}
