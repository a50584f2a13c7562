//! Emitters built from precompiled stencils: copy the bytes, then patch the holes.

use std::sync::Arc;

use super::code_block::CodeBlock;
use super::codebuf::SectionWriter;
use super::memory::REGION_ALIGNMENT;
use super::traits::{
    BytecodeEmitter, BytecodeTrait, EmitCursors, EntryEmitter, FunctionEntryTrait,
    SLOW_PATH_DATA_HEADER_LEN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Data,
    Fast,
    Slow,
}

/// What goes into a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoleKind {
    /// 4 bytes copied from the bytecode
    BytecodeOperand32 { operand_offset: usize },
    /// rel32 from the end of the hole to this stencil's copy of `target`, plus `addend`
    SectionRel32 { target: Section, addend: i32 },
    /// Absolute address of this stencil's copy of `target`, plus `addend`
    SectionAbs64 { target: Section, addend: i64 },
    /// rel32 to the bytecode that is `i32` (read from the operand) bytes away;
    /// resolved after every bytecode is emitted
    CondBrLatePatch { operand_offset: usize },
}

impl HoleKind {
    fn width(&self) -> usize {
        match self {
            HoleKind::SectionAbs64 { .. } => 8,
            _ => 4,
        }
    }

    fn reads_bytecode(&self) -> bool {
        matches!(
            self,
            HoleKind::BytecodeOperand32 { .. } | HoleKind::CondBrLatePatch { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    pub section: Section,
    pub offset: usize,
    pub kind: HoleKind,
}

/// Emitter for one bytecode kind (or one function entry) from its stencil.
///
/// The slow-path data of a bytecode is the header followed by the
/// region-relative address of its slow path.
#[derive(Debug, Clone)]
pub struct CopyPatchEmitter {
    fast: Vec<u8>,
    slow: Vec<u8>,
    data: Vec<u8>,
    data_align: u32,
    holes: Vec<Hole>,
}

const SLOW_PATH_DATA_PAYLOAD_LEN: usize = 4;

impl CopyPatchEmitter {
    pub fn new(fast: Vec<u8>, slow: Vec<u8>, data: Vec<u8>, data_align: u32, holes: Vec<Hole>) -> Self {
        let res = Self {
            fast,
            slow,
            data,
            data_align,
            holes,
        };
        for hole in &res.holes {
            let len = res.template(hole.section).len();
            assert!(
                hole.offset + hole.kind.width() <= len,
                "hole {:?} outside of a {}-byte template",
                hole,
                len
            );
        }
        res
    }

    fn template(&self, section: Section) -> &[u8] {
        match section {
            Section::Data => &self.data,
            Section::Fast => &self.fast,
            Section::Slow => &self.slow,
        }
    }

    pub fn num_cond_br_late_patches(&self) -> usize {
        self.holes
            .iter()
            .filter(|h| matches!(h.kind, HoleKind::CondBrLatePatch { .. }))
            .count()
    }

    /// Wrap into the trait of a bytecode kind whose bytecodes are `bytecode_len` bytes long.
    pub fn into_bytecode_trait(self, bytecode_len: u32) -> BytecodeTrait {
        for hole in &self.holes {
            if let HoleKind::BytecodeOperand32 { operand_offset }
            | HoleKind::CondBrLatePatch { operand_offset } = hole.kind
            {
                assert!(operand_offset + 4 <= bytecode_len as usize, "operand past bytecode end");
            }
        }
        BytecodeTrait {
            fast_path_len: self.fast.len() as u32,
            slow_path_len: self.slow.len() as u32,
            data_section_len: self.data.len() as u32,
            data_section_align: self.data_align,
            num_cond_br_late_patches: self.num_cond_br_late_patches() as u32,
            slow_path_data_len: (SLOW_PATH_DATA_HEADER_LEN + SLOW_PATH_DATA_PAYLOAD_LEN) as u32,
            bytecode_len,
            emitter: Arc::new(self),
        }
    }

    /// Wrap into a function entry trait. Entry stencils have no bytecode
    /// operands; their data section lands at offset 0 of the region.
    pub fn into_entry_trait(self) -> FunctionEntryTrait {
        assert!(
            self.data_align as usize <= REGION_ALIGNMENT,
            "entry data section needs more than region alignment"
        );
        assert!(
            !self.holes.iter().any(|h| h.kind.reads_bytecode()),
            "entry stencil refers to a bytecode"
        );
        FunctionEntryTrait {
            fast_path_len: self.fast.len() as u32,
            slow_path_len: self.slow.len() as u32,
            data_section_len: self.data.len() as u32,
            emitter: Arc::new(self),
        }
    }

    fn copy_and_patch(&self, bytecode: Option<(&[u8], u32)>, cur: &mut EmitCursors<'_>) {
        let starts = [
            (Section::Data, cur.data.region_offset()),
            (Section::Fast, cur.fast.region_offset()),
            (Section::Slow, cur.slow.region_offset()),
        ];
        let start_of = |s: Section| starts.iter().find(|(k, _)| *k == s).map_or(0, |(_, o)| *o);

        cur.data.write(&self.data);
        cur.fast.write(&self.fast);
        cur.slow.write(&self.slow);

        for hole in &self.holes {
            let at = start_of(hole.section) + hole.offset;
            let bytes: Vec<u8> = match hole.kind {
                HoleKind::BytecodeOperand32 { operand_offset } => {
                    let (bc, _) = bytecode.expect("bytecode operand hole in entry stencil");
                    bc[operand_offset..operand_offset + 4].to_vec()
                }
                HoleKind::SectionRel32 { target, addend } => {
                    let dst = start_of(target) as i64 + addend as i64;
                    ((dst - (at as i64 + 4)) as i32).to_le_bytes().to_vec()
                }
                HoleKind::SectionAbs64 { target, addend } => {
                    let addr = (cur.region_addr + start_of(target)) as u64;
                    addr.wrapping_add(addend as u64).to_le_bytes().to_vec()
                }
                HoleKind::CondBrLatePatch { operand_offset } => {
                    let (bc, ptr32) = bytecode.expect("late patch hole in entry stencil");
                    let mut rel = [0u8; 4];
                    rel.copy_from_slice(&bc[operand_offset..operand_offset + 4]);
                    let dst_ptr32 = ptr32.wrapping_add(i32::from_le_bytes(rel) as u32);
                    cur.add_late_patch(dst_ptr32, at);
                    vec![0; 4]
                }
            };
            let w = writer(cur, hole.section);
            let rel_at = at - w.base();
            w.write_at(rel_at, &bytes);
        }

        cur.data.advance(self.data.len());
        cur.fast.advance(self.fast.len());
        cur.slow.advance(self.slow.len());
    }
}

fn writer<'a, 'r>(cur: &'a mut EmitCursors<'r>, section: Section) -> &'a mut SectionWriter<'r> {
    match section {
        Section::Data => &mut cur.data,
        Section::Fast => &mut cur.fast,
        Section::Slow => &mut cur.slow,
    }
}

impl BytecodeEmitter for CopyPatchEmitter {
    fn emit(&self, bytecode: &[u8], bytecode_ptr32: u32, cur: &mut EmitCursors<'_>) {
        let slow_start = cur.slow.region_offset() as u32;
        self.copy_and_patch(Some((bytecode, bytecode_ptr32)), cur);
        cur.slow_path_data.emit_u32(slow_start);
    }
}

impl EntryEmitter for CopyPatchEmitter {
    fn emit(&self, _code_block: &CodeBlock, cur: &mut EmitCursors<'_>) {
        self.copy_and_patch(None, cur);
    }
}
