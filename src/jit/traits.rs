//! Per-bytecode-kind traits and the emitter interfaces they point to.
//!
//! The tables are produced by the stencil build and are read-only at runtime.

use std::fmt;
use std::sync::Arc;

use super::code_block::CodeBlock;
use super::codebuf::SectionWriter;

/// Bytes taken by an opcode at the start of every bytecode.
pub const OPCODE_LEN: usize = 2;

/// Every bytecode's slow-path data starts with its opcode (u16) and the
/// region-relative address of its fast path (u32).
pub const SLOW_PATH_DATA_HEADER_LEN: usize = 6;

/// A conditional branch whose target was not known when it was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondBrLatePatchRecord {
    /// Low 32 bits of the destination bytecode's address
    pub dst_ptr32: u32,
    /// Region offset of the rel32 displacement to patch
    pub site: u32,
}

/// Write cursors handed to the emitters, one per output stream.
pub struct EmitCursors<'r> {
    /// Absolute address of the region start
    pub region_addr: usize,
    pub data: SectionWriter<'r>,
    pub fast: SectionWriter<'r>,
    pub slow: SectionWriter<'r>,
    pub slow_path_data: SectionWriter<'r>,
    late_patches: Vec<CondBrLatePatchRecord>,
}

impl<'r> EmitCursors<'r> {
    pub fn new(
        region_addr: usize,
        data: SectionWriter<'r>,
        fast: SectionWriter<'r>,
        slow: SectionWriter<'r>,
        slow_path_data: SectionWriter<'r>,
        num_late_patches: usize,
    ) -> Self {
        Self {
            region_addr,
            data,
            fast,
            slow,
            slow_path_data,
            late_patches: Vec::with_capacity(num_late_patches),
        }
    }

    /// Register a rel32 at region offset `site` that must jump to the bytecode at `dst_ptr32`.
    pub fn add_late_patch(&mut self, dst_ptr32: u32, site: usize) {
        self.late_patches.push(CondBrLatePatchRecord {
            dst_ptr32,
            site: site as u32,
        });
    }

    pub fn late_patches(&self) -> &[CondBrLatePatchRecord] {
        &self.late_patches
    }

    pub fn into_late_patches(self) -> Vec<CondBrLatePatchRecord> {
        self.late_patches
    }
}

/// Emits the code of one bytecode.
///
/// On return every cursor must have moved by exactly the lengths in the
/// bytecode's [`BytecodeTrait`]; the slow-path data cursor starts right after
/// the header written by the driver.
pub trait BytecodeEmitter: Send + Sync {
    fn emit(&self, bytecode: &[u8], bytecode_ptr32: u32, cur: &mut EmitCursors<'_>);
}

/// Emits the function entry prologue at the start of the fast path.
pub trait EntryEmitter: Send + Sync {
    fn emit(&self, code_block: &CodeBlock, cur: &mut EmitCursors<'_>);
}

#[derive(Clone)]
pub struct BytecodeTrait {
    pub fast_path_len: u32,
    pub slow_path_len: u32,
    pub data_section_len: u32,
    pub data_section_align: u32,
    pub num_cond_br_late_patches: u32,
    /// Including the header
    pub slow_path_data_len: u32,
    pub bytecode_len: u32,
    pub emitter: Arc<dyn BytecodeEmitter>,
}

impl fmt::Debug for BytecodeTrait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytecodeTrait")
            .field("fast_path_len", &self.fast_path_len)
            .field("slow_path_len", &self.slow_path_len)
            .field("data_section_len", &self.data_section_len)
            .field("data_section_align", &self.data_section_align)
            .field("num_cond_br_late_patches", &self.num_cond_br_late_patches)
            .field("slow_path_data_len", &self.slow_path_data_len)
            .field("bytecode_len", &self.bytecode_len)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct FunctionEntryTrait {
    pub fast_path_len: u32,
    pub slow_path_len: u32,
    /// Prologue constants, laid out at the start of the data section
    pub data_section_len: u32,
    pub emitter: Arc<dyn EntryEmitter>,
}

impl fmt::Debug for FunctionEntryTrait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntryTrait")
            .field("fast_path_len", &self.fast_path_len)
            .field("slow_path_len", &self.slow_path_len)
            .field("data_section_len", &self.data_section_len)
            .finish_non_exhaustive()
    }
}

/// All trait tables the baseline JIT needs.
#[derive(Debug)]
pub struct TraitTables {
    bytecodes: Vec<BytecodeTrait>,
    /// Entry traits for non-variadic functions, by number of fixed args
    nova_entries: Vec<FunctionEntryTrait>,
    /// Entry traits for variadic functions, by number of fixed args
    va_entries: Vec<FunctionEntryTrait>,
    /// Entries up to this many fixed args are specialized
    specialization_threshold: usize,
    /// Size class of a generic IC entry, by IC trait kind
    ic_steppings: Vec<u8>,
}

impl TraitTables {
    /// Both entry tables must hold `specialization_threshold + 2` traits: one
    /// per specialized arg count and a final generic one.
    pub fn new(
        bytecodes: Vec<BytecodeTrait>,
        nova_entries: Vec<FunctionEntryTrait>,
        va_entries: Vec<FunctionEntryTrait>,
        specialization_threshold: usize,
        ic_steppings: Vec<u8>,
    ) -> Self {
        assert_eq!(nova_entries.len(), specialization_threshold + 2);
        assert_eq!(va_entries.len(), specialization_threshold + 2);
        assert!(bytecodes.len() < u16::MAX as usize);
        for (opcode, t) in bytecodes.iter().enumerate() {
            assert!(
                t.data_section_align.is_power_of_two() && t.data_section_align <= 16,
                "opcode {}: bad data section alignment {}",
                opcode,
                t.data_section_align
            );
            assert!(
                t.slow_path_data_len as usize >= SLOW_PATH_DATA_HEADER_LEN,
                "opcode {}: slow path data shorter than its header",
                opcode
            );
            assert!(t.bytecode_len as usize >= OPCODE_LEN);
        }
        Self {
            bytecodes,
            nova_entries,
            va_entries,
            specialization_threshold,
            ic_steppings,
        }
    }

    /// Number of bytecode kinds. This value is also the stream terminator opcode.
    pub fn num_kinds(&self) -> usize {
        self.bytecodes.len()
    }

    pub fn terminator_opcode(&self) -> u16 {
        self.bytecodes.len() as u16
    }

    pub fn bytecode(&self, opcode: u16) -> &BytecodeTrait {
        self.bytecodes
            .get(opcode as usize)
            .unwrap_or_else(|| panic!("unknown opcode {}", opcode))
    }

    pub fn entry_trait(&self, is_variadic: bool, num_fixed_args: usize) -> &FunctionEntryTrait {
        let idx = num_fixed_args.min(self.specialization_threshold + 1);
        if is_variadic {
            &self.va_entries[idx]
        } else {
            &self.nova_entries[idx]
        }
    }

    pub fn ic_stepping(&self, ic_trait_kind: u16) -> u8 {
        self.ic_steppings
            .get(ic_trait_kind as usize)
            .copied()
            .unwrap_or_else(|| panic!("unknown IC trait kind {}", ic_trait_kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl EntryEmitter for Nop {
        fn emit(&self, _: &CodeBlock, _: &mut EmitCursors<'_>) {}
    }

    fn entry(fast_path_len: u32) -> FunctionEntryTrait {
        FunctionEntryTrait {
            fast_path_len,
            slow_path_len: 0,
            data_section_len: 0,
            emitter: Arc::new(Nop),
        }
    }

    #[test]
    fn test_entry_trait_selection() {
        let nova = (0..4).map(entry).collect();
        let va = (10..14).map(entry).collect();
        let tables = TraitTables::new(Vec::new(), nova, va, 2, vec![0, 3]);

        assert_eq!(tables.entry_trait(false, 0).fast_path_len, 0);
        assert_eq!(tables.entry_trait(false, 2).fast_path_len, 2);
        assert_eq!(tables.entry_trait(false, 3).fast_path_len, 3);
        assert_eq!(tables.entry_trait(false, 100).fast_path_len, 3);
        assert_eq!(tables.entry_trait(true, 1).fast_path_len, 11);
        assert_eq!(tables.entry_trait(true, 7).fast_path_len, 13);
        assert_eq!(tables.terminator_opcode(), 0);
        assert_eq!(tables.ic_stepping(1), 3);
    }

    #[test]
    #[should_panic]
    fn test_entry_table_length_checked() {
        TraitTables::new(Vec::new(), vec![entry(0)], vec![entry(0)], 2, Vec::new());
    }
}
