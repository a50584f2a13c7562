//! Baseline JIT code generation.
//!
//! A function is compiled by copying one stencil per bytecode into a single
//! region laid out as
//!
//! ```text
//!  0           data_len     fast_path_offset        slow_path_offset           total_len
//!  | data section | pad+align | fast path | pad (7) | slow path | pad (7) |
//! ```
//!
//! The pads exist because an emitter may write up to 7 bytes past its end.
//! Conditional branches to bytecodes not emitted yet are recorded and
//! patched once everything is in place.

use std::sync::Arc;

use log::{debug, info, trace};
use serde::Serialize;
use thiserror::Error;

use super::code_block::{
    BaselineCodeBlock, CodeBlock, SlowPathDataIndex, find_bytecode_index,
    index_is_strictly_increasing, read_slow_path_data_header,
};
use super::codebuf::{SECTION_SLACK, SectionWriter, split_sections};
use super::context::JitContext;
use super::memory::{MemoryError, REGION_ALIGNMENT};
use super::traits::{CondBrLatePatchRecord, EmitCursors, FunctionEntryTrait, OPCODE_LEN, TraitTables};

#[derive(Debug, Error)]
pub enum JitError {
    #[error("failed to allocate JIT memory: {0}")]
    Memory(#[from] MemoryError),
}

/// Fill pattern of the pads between sections: `ud2` then `nop`s.
const GAP_FILL_HEAD: [u8; 2] = [0x0f, 0x0b];
const GAP_FILL_NOP: u8 = 0x90;

/// Byte offsets of the sections inside one JIT region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegionLayout {
    pub data_len: usize,
    pub fast_path_offset: usize,
    pub fast_path_len: usize,
    pub slow_path_offset: usize,
    pub slow_path_len: usize,
    pub total_len: usize,
}

impl RegionLayout {
    pub fn compute(data_len: usize, fast_path_len: usize, slow_path_len: usize) -> Self {
        let mut fast_path_offset = data_len;
        if data_len > 0 {
            fast_path_offset += SECTION_SLACK;
        }
        let fast_path_offset = fast_path_offset.next_multiple_of(REGION_ALIGNMENT);
        let slow_path_offset = fast_path_offset + fast_path_len + SECTION_SLACK;
        let total_len = slow_path_offset + slow_path_len + SECTION_SLACK;
        Self {
            data_len,
            fast_path_offset,
            fast_path_len,
            slow_path_offset,
            slow_path_len,
            total_len,
        }
    }

    pub fn fast_path_end(&self) -> usize {
        self.fast_path_offset + self.fast_path_len
    }

    pub fn slow_path_end(&self) -> usize {
        self.slow_path_offset + self.slow_path_len
    }

    /// The three pads, as region ranges.
    pub fn gaps(&self) -> [std::ops::Range<usize>; 3] {
        [
            self.data_len..self.fast_path_offset,
            self.fast_path_end()..self.slow_path_offset,
            self.slow_path_end()..self.total_len,
        ]
    }
}

/// Totals of the size pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CodegenSizes {
    pub fast_path_len: usize,
    pub slow_path_len: usize,
    pub data_section_len: usize,
    pub num_cond_br_late_patches: usize,
    pub slow_path_data_len: usize,
    pub num_bytecodes: usize,
}

fn read_opcode(bytecode: &[u8], offset: usize) -> u16 {
    assert!(
        offset + OPCODE_LEN <= bytecode.len(),
        "bytecode stream is not terminated"
    );
    u16::from_le_bytes([bytecode[offset], bytecode[offset + 1]])
}

/// Walk the bytecode stream once and add up what every bytecode needs.
pub fn compute_sizes<'t>(
    tables: &'t TraitTables,
    code_block: &CodeBlock,
) -> (CodegenSizes, &'t FunctionEntryTrait) {
    let entry = tables.entry_trait(code_block.is_variadic(), code_block.num_fixed_args());
    let mut sizes = CodegenSizes {
        fast_path_len: entry.fast_path_len as usize,
        slow_path_len: entry.slow_path_len as usize,
        data_section_len: entry.data_section_len as usize,
        ..CodegenSizes::default()
    };

    let bytecode = code_block.bytecode();
    let terminator = tables.terminator_opcode();
    let mut offset = 0;
    loop {
        let opcode = read_opcode(bytecode, offset);
        if opcode == terminator {
            break;
        }
        let t = tables.bytecode(opcode);
        sizes.fast_path_len += t.fast_path_len as usize;
        sizes.slow_path_len += t.slow_path_len as usize;
        sizes.data_section_len = sizes
            .data_section_len
            .next_multiple_of(t.data_section_align as usize)
            + t.data_section_len as usize;
        sizes.num_cond_br_late_patches += t.num_cond_br_late_patches as usize;
        sizes.slow_path_data_len += t.slow_path_data_len as usize;
        sizes.num_bytecodes += 1;
        offset += t.bytecode_len as usize;
    }
    assert_eq!(
        offset + OPCODE_LEN,
        bytecode.len(),
        "{}: trailing bytes after the terminator",
        code_block.name()
    );
    (sizes, entry)
}

fn fill_gap(gap: &mut [u8]) {
    gap.fill(GAP_FILL_NOP);
    if gap.len() >= GAP_FILL_HEAD.len() {
        gap[..GAP_FILL_HEAD.len()].copy_from_slice(&GAP_FILL_HEAD);
    }
}

/// Result of a compilation request.
#[derive(Debug, Clone)]
pub struct CompiledEntry {
    pub baseline: Arc<BaselineCodeBlock>,
    /// Absolute address to jump to
    pub entry: usize,
}

/// Compile `code_block` and make the JIT code its entry point.
///
/// Compiling the same code block twice is a caller bug and panics.
pub fn compile_function_to_baseline_jit(
    ctx: &JitContext,
    code_block: &CodeBlock,
) -> Result<CompiledEntry, JitError> {
    assert!(
        !code_block.has_baseline(),
        "{}: already compiled to baseline JIT",
        code_block.name()
    );
    let (baseline, installed) = compile_and_publish(ctx, code_block)?;
    assert!(installed, "{}: baseline JIT code published twice", code_block.name());
    let entry = baseline.jit_entry();
    Ok(CompiledEntry { baseline, entry })
}

/// Compile and try to publish. Another thread may publish first, in which
/// case its code is returned and ours is dropped.
fn compile_and_publish(ctx: &JitContext, code_block: &CodeBlock) -> Result<(Arc<BaselineCodeBlock>, bool), JitError> {
    let tables = ctx.trait_tables();
    let (sizes, entry_trait) = compute_sizes(tables, code_block);
    let layout = RegionLayout::compute(sizes.data_section_len, sizes.fast_path_len, sizes.slow_path_len);
    debug!(
        target: "copa::jit",
        "{}: {} bytecodes, data {} fast {} slow {} total {} bytes",
        code_block.name(),
        sizes.num_bytecodes,
        layout.data_len,
        layout.fast_path_len,
        layout.slow_path_len,
        layout.total_len
    );

    let mut region = ctx.allocator().allocate_given_size(layout.total_len)?;
    let region_addr = region.addr();
    let mut slow_path_data = vec![0u8; sizes.slow_path_data_len];
    let mut index = Vec::with_capacity(sizes.num_bytecodes);
    let base_ptr32 = code_block.bytecode_ptr32(0);

    let late_patches = {
        let (data, fast, slow) = split_sections(
            region.as_mut_slice(),
            (0, layout.data_len),
            (layout.fast_path_offset, layout.fast_path_len),
            (layout.slow_path_offset, layout.slow_path_len),
        );
        let spd_len = slow_path_data.len();
        let spd = SectionWriter::new(&mut slow_path_data, 0, spd_len);
        let mut cur = EmitCursors::new(region_addr, data, fast, slow, spd, sizes.num_cond_br_late_patches);

        entry_trait.emitter.emit(code_block, &mut cur);
        if ctx.config().verify_codegen {
            verify_entry(code_block, entry_trait, &cur);
        }
        emit_bytecodes(tables, code_block, &mut cur, &mut index);

        if ctx.config().verify_codegen {
            verify_cursors(code_block, &sizes, &cur);
        }
        cur.into_late_patches()
    };

    assert!(
        index_is_strictly_increasing(&index, base_ptr32),
        "{}: slow path data index is not strictly increasing",
        code_block.name()
    );

    let code = region.as_mut_slice();
    resolve_late_patches(code, &late_patches, &index, base_ptr32, &slow_path_data);
    for gap in layout.gaps() {
        fill_gap(&mut code[gap]);
    }

    let baseline = Arc::new(BaselineCodeBlock::new(region, layout, slow_path_data, index, base_ptr32));
    let (baseline, installed) = code_block.publish(baseline);
    if !installed {
        debug!(target: "copa::jit", "{}: already published by another thread", code_block.name());
        return Ok((baseline, false));
    }
    ctx.record_baseline_compilation();

    let entry = baseline.jit_entry();
    if ctx.config().trace {
        info!(target: "copa::jit", "[JIT] compiled {} at {:#x}", code_block.name(), entry);
    } else {
        trace!(target: "copa::jit", "compiled {} at {:#x}", code_block.name(), entry);
    }
    Ok((baseline, true))
}

fn emit_bytecodes(
    tables: &TraitTables,
    code_block: &CodeBlock,
    cur: &mut EmitCursors<'_>,
    index: &mut Vec<SlowPathDataIndex>,
) {
    let bytecode = code_block.bytecode();
    let terminator = tables.terminator_opcode();
    let mut offset = 0;
    loop {
        let opcode = read_opcode(bytecode, offset);
        if opcode == terminator {
            break;
        }
        let t = tables.bytecode(opcode);
        let len = t.bytecode_len as usize;
        let ptr32 = code_block.bytecode_ptr32(offset);

        cur.data.align_to(t.data_section_align as usize);
        index.push(SlowPathDataIndex {
            bytecode_ptr32: ptr32,
            slow_path_data_offset: cur.slow_path_data.position() as u32,
        });
        cur.slow_path_data.emit_u16(opcode);
        let jit_offset = cur.fast.region_offset() as u32;
        cur.slow_path_data.emit_u32(jit_offset);

        t.emitter.emit(&bytecode[offset..offset + len], ptr32, cur);
        offset += len;
    }
}

/// The entry emitter fills exactly its own share of each section.
fn verify_entry(code_block: &CodeBlock, entry: &FunctionEntryTrait, cur: &EmitCursors<'_>) {
    let name = code_block.name();
    assert_eq!(cur.fast.position(), entry.fast_path_len as usize, "{}: entry fast path length mismatch", name);
    assert_eq!(cur.slow.position(), entry.slow_path_len as usize, "{}: entry slow path length mismatch", name);
    assert_eq!(
        cur.data.position(),
        entry.data_section_len as usize,
        "{}: entry data section length mismatch",
        name
    );
}

fn verify_cursors(code_block: &CodeBlock, sizes: &CodegenSizes, cur: &EmitCursors<'_>) {
    let name = code_block.name();
    assert_eq!(cur.fast.position(), sizes.fast_path_len, "{}: fast path length mismatch", name);
    assert_eq!(cur.slow.position(), sizes.slow_path_len, "{}: slow path length mismatch", name);
    assert_eq!(
        cur.data.position(),
        sizes.data_section_len,
        "{}: data section length mismatch",
        name
    );
    assert_eq!(
        cur.slow_path_data.position(),
        sizes.slow_path_data_len,
        "{}: slow path data length mismatch",
        name
    );
    assert_eq!(
        cur.late_patches().len(),
        sizes.num_cond_br_late_patches,
        "{}: late patch count mismatch",
        name
    );
}

/// Point every recorded rel32 at the fast path of its destination bytecode.
fn resolve_late_patches(
    code: &mut [u8],
    late_patches: &[CondBrLatePatchRecord],
    index: &[SlowPathDataIndex],
    base_ptr32: u32,
    slow_path_data: &[u8],
) {
    // Records of one bytecode usually share their destination.
    let mut cached: Option<(u32, usize)> = None;
    for rec in late_patches {
        let bc_index = match cached {
            Some((ptr32, i)) if ptr32 == rec.dst_ptr32 => i,
            _ => {
                let i = find_bytecode_index(index, base_ptr32, rec.dst_ptr32).unwrap_or_else(|| {
                    panic!("late patch destination {:#x} is not a bytecode", rec.dst_ptr32)
                });
                cached = Some((rec.dst_ptr32, i));
                i
            }
        };
        debug_assert_eq!(index[bc_index].bytecode_ptr32, rec.dst_ptr32);

        let (_, target) = read_slow_path_data_header(slow_path_data, index[bc_index].slow_path_data_offset as usize);
        let site = rec.site as usize;
        let disp = target as i64 - (site as i64 + 4);
        code[site..site + 4].copy_from_slice(&(disp as i32).to_le_bytes());
    }
}

/// Enter JIT code in the middle of a running function.
///
/// Reuses the code if the function got compiled in the meantime (for example
/// by a recursive call), otherwise compiles it first. Threads racing to
/// compile the same function all end up in the code published first.
pub fn compile_for_on_stack_replacement(
    ctx: &JitContext,
    code_block: &CodeBlock,
    current_bytecode_ptr: usize,
) -> Result<CompiledEntry, JitError> {
    let baseline = match code_block.baseline() {
        Some(baseline) => baseline.clone(),
        None => compile_and_publish(ctx, code_block)?.0,
    };
    let entry = baseline
        .jit_address_for_bytecode(current_bytecode_ptr as u32)
        .unwrap_or_else(|| {
            panic!(
                "{}: OSR target {:#x} is not a bytecode boundary",
                code_block.name(),
                current_bytecode_ptr
            )
        });
    trace!(target: "copa::jit", "OSR into {} at {:#x}", code_block.name(), entry);
    Ok(CompiledEntry { baseline, entry })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_without_data() {
        let l = RegionLayout::compute(0, 40, 10);
        assert_eq!(l.fast_path_offset, 0);
        assert_eq!(l.slow_path_offset, 47);
        assert_eq!(l.total_len, 64);
        assert!(l.gaps()[0].is_empty());
    }

    #[test]
    fn test_layout_with_data() {
        let l = RegionLayout::compute(9, 16, 0);
        // 9 + 7 = 16 is already aligned
        assert_eq!(l.fast_path_offset, 16);
        let l = RegionLayout::compute(10, 16, 0);
        assert_eq!(l.fast_path_offset, 32);
        assert_eq!(l.slow_path_offset, 55);
        assert_eq!(l.total_len, 62);
        assert!(l.fast_path_len + SECTION_SLACK + l.slow_path_len + SECTION_SLACK <= l.total_len);
    }

    #[test]
    fn test_fill_gap() {
        let mut g = [0u8; 5];
        fill_gap(&mut g);
        assert_eq!(g, [0x0f, 0x0b, 0x90, 0x90, 0x90]);
        let mut g = [0u8; 1];
        fill_gap(&mut g);
        assert_eq!(g, [0x90]);
    }

    #[test]
    fn test_resolve_late_patches_with_cache() {
        let index = [
            SlowPathDataIndex {
                bytecode_ptr32: 100,
                slow_path_data_offset: 0,
            },
            SlowPathDataIndex {
                bytecode_ptr32: 104,
                slow_path_data_offset: 6,
            },
        ];
        let spd = [0, 0, 0x20, 0, 0, 0, 1, 0, 0x40, 0, 0, 0];
        let mut code = [0u8; 64];
        let patches = [
            CondBrLatePatchRecord { dst_ptr32: 104, site: 0x28 },
            CondBrLatePatchRecord { dst_ptr32: 104, site: 0x30 },
            CondBrLatePatchRecord { dst_ptr32: 100, site: 0x38 },
        ];
        resolve_late_patches(&mut code, &patches, &index, 100, &spd);
        assert_eq!(i32::from_le_bytes(code[0x28..0x2c].try_into().unwrap()), 0x40 - 0x2c);
        assert_eq!(i32::from_le_bytes(code[0x30..0x34].try_into().unwrap()), 0x40 - 0x34);
        assert_eq!(i32::from_le_bytes(code[0x38..0x3c].try_into().unwrap()), 0x20 - 0x3c);
    }

    #[test]
    #[should_panic(expected = "is not a bytecode")]
    fn test_unresolvable_late_patch() {
        let mut code = [0u8; 8];
        let patches = [CondBrLatePatchRecord { dst_ptr32: 7, site: 0 }];
        resolve_late_patches(&mut code, &patches, &[], 0, &[]);
    }
}
