use std::sync::Arc;

use copa::config::JitConfig;
use copa::jit::codegen::compute_sizes;
use copa::jit::traits::{BytecodeEmitter, EmitCursors, EntryEmitter};
use copa::jit::{
    BytecodeTrait, CodeBlock, FunctionEntryTrait, CopyPatchEmitter, Hole, HoleKind, JitContext, Section, TraitTables,
    compile_for_on_stack_replacement, compile_function_to_baseline_jit,
};

const OP_LOAD: u16 = 0;
const OP_BRANCH: u16 = 1;
const OP_RET: u16 = 2;
const TERMINATOR: u16 = 3;

fn bytecode_traits() -> Vec<BytecodeTrait> {
    // mov $imm32, %eax
    let load = CopyPatchEmitter::new(
        vec![0xb8, 0, 0, 0, 0],
        Vec::new(),
        Vec::new(),
        1,
        vec![Hole {
            section: Section::Fast,
            offset: 1,
            kind: HoleKind::BytecodeOperand32 { operand_offset: 2 },
        }],
    );
    // je <target>; slow path int3; data holds the address of the fast path
    let branch = CopyPatchEmitter::new(
        vec![0x0f, 0x84, 0, 0, 0, 0],
        vec![0xcc],
        vec![0; 8],
        8,
        vec![
            Hole {
                section: Section::Fast,
                offset: 2,
                kind: HoleKind::CondBrLatePatch { operand_offset: 2 },
            },
            Hole {
                section: Section::Data,
                offset: 0,
                kind: HoleKind::SectionAbs64 {
                    target: Section::Fast,
                    addend: 0,
                },
            },
        ],
    );
    let ret = CopyPatchEmitter::new(vec![0xc3], Vec::new(), Vec::new(), 1, Vec::new());
    vec![
        load.into_bytecode_trait(6),
        branch.into_bytecode_trait(6),
        ret.into_bytecode_trait(2),
    ]
}

fn tables() -> Arc<TraitTables> {
    let entry = |len: usize| CopyPatchEmitter::new(vec![0x90; len], Vec::new(), Vec::new(), 1, Vec::new()).into_entry_trait();
    // specialization threshold 0: one table entry for zero args, one generic
    let nova = vec![entry(1), entry(3)];
    let va = vec![entry(2), entry(4)];
    Arc::new(TraitTables::new(bytecode_traits(), nova, va, 0, vec![0]))
}

fn ctx() -> JitContext {
    let config = JitConfig {
        verify_codegen: true,
        ..JitConfig::default()
    };
    JitContext::new(config, tables())
}

struct BytecodeBuilder(Vec<u8>);

impl BytecodeBuilder {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn op(mut self, opcode: u16, operand: Option<i32>) -> Self {
        self.0.extend_from_slice(&opcode.to_le_bytes());
        if let Some(v) = operand {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        self
    }

    fn finish(self) -> Vec<u8> {
        self.op(TERMINATOR, None).0
    }
}

/// ```text
///  0: load 7
///  6: branch +12   (-> 18)
/// 12: load 9
/// 18: ret
/// 20: branch -20   (-> 0)
/// 26: ret
/// ```
fn sample_function(name: &str) -> CodeBlock {
    let bytecode = BytecodeBuilder::new()
        .op(OP_LOAD, Some(7))
        .op(OP_BRANCH, Some(12))
        .op(OP_LOAD, Some(9))
        .op(OP_RET, None)
        .op(OP_BRANCH, Some(-20))
        .op(OP_RET, None)
        .finish();
    CodeBlock::new(name, bytecode, 0, false, 0xdead_0000)
}

fn read_i32(code: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(code[at..at + 4].try_into().unwrap())
}

#[test]
fn test_size_pass() {
    let tables = tables();
    let cb = sample_function("f");
    let (sizes, entry) = compute_sizes(&tables, &cb);
    assert_eq!(entry.fast_path_len, 1);
    assert_eq!(sizes.num_bytecodes, 6);
    assert_eq!(sizes.fast_path_len, 1 + 5 + 6 + 5 + 1 + 6 + 1);
    assert_eq!(sizes.slow_path_len, 2);
    assert_eq!(sizes.data_section_len, 16);
    assert_eq!(sizes.num_cond_br_late_patches, 2);
    assert_eq!(sizes.slow_path_data_len, 6 * 10);
}

#[test]
fn test_compile_layout() {
    let ctx = ctx();
    let cb = sample_function("f");
    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    let baseline = &compiled.baseline;
    let layout = baseline.layout();

    assert_eq!(layout.data_len, 16);
    assert_eq!(layout.fast_path_offset, 32);
    assert_eq!(layout.slow_path_offset, 32 + 25 + 7);
    assert_eq!(layout.total_len, 64 + 2 + 7);
    assert!(layout.fast_path_len + 7 + layout.slow_path_len + 7 <= layout.total_len);
    assert_eq!(baseline.region_addr() % 16, 0);

    let code = baseline.code();
    // entry prologue, then the first load with its operand patched in
    assert_eq!(code[32], 0x90);
    assert_eq!(&code[33..38], &[0xb8, 7, 0, 0, 0]);
    assert_eq!(&code[44..49], &[0xb8, 9, 0, 0, 0]);
    assert_eq!(code[56], 0xc3);
    assert_eq!(&code[64..66], &[0xcc, 0xcc]);

    // data section holds the absolute address of each branch's fast path
    let addr = baseline.region_addr() as u64;
    assert_eq!(u64::from_le_bytes(code[0..8].try_into().unwrap()), addr + 38);
    assert_eq!(u64::from_le_bytes(code[8..16].try_into().unwrap()), addr + 50);
}

#[test]
fn test_gaps_are_filled() {
    let ctx = ctx();
    let cb = sample_function("f");
    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    let baseline = &compiled.baseline;
    let code = baseline.code();
    for gap in baseline.layout().gaps() {
        let bytes = &code[gap];
        assert_eq!(&bytes[..2], &[0x0f, 0x0b]);
        assert!(bytes[2..].iter().all(|&b| b == 0x90));
    }
}

#[test]
fn test_late_patches_resolve_to_destination() {
    let ctx = ctx();
    let cb = sample_function("f");
    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    let baseline = &compiled.baseline;
    let code = baseline.code();

    let target_of = |bc_offset: usize| {
        let idx = baseline.find_bytecode_index(cb.bytecode_ptr32(bc_offset)).unwrap();
        assert_eq!(baseline.index()[idx].bytecode_ptr32, cb.bytecode_ptr32(bc_offset));
        baseline.jit_offset_of(idx) as i64
    };

    // forward branch at fast offset 38, rel32 at 40, to the ret at bytecode 18
    assert_eq!(target_of(18), 49);
    assert_eq!(read_i32(code, 40) as i64, target_of(18) - 44);
    // backward branch at fast offset 50 to the first load
    assert_eq!(target_of(0), 33);
    assert_eq!(read_i32(code, 52) as i64, target_of(0) - 56);
}

#[test]
fn test_slow_path_data_index() {
    let ctx = ctx();
    let cb = sample_function("f");
    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    let baseline = &compiled.baseline;

    let index = baseline.index();
    assert_eq!(index.len(), 6);
    for pair in index.windows(2) {
        let base = cb.bytecode_ptr32(0);
        assert!(pair[0].bytecode_ptr32.wrapping_sub(base) < pair[1].bytecode_ptr32.wrapping_sub(base));
        assert!(pair[0].slow_path_data_offset < pair[1].slow_path_data_offset);
    }
    let opcodes: Vec<u16> = (0..6).map(|i| baseline.opcode_of(i)).collect();
    assert_eq!(opcodes, vec![OP_LOAD, OP_BRANCH, OP_LOAD, OP_RET, OP_BRANCH, OP_RET]);

    // the payload after the header is the slow path address of the bytecode
    let spd = baseline.slow_path_data();
    let off = index[4].slow_path_data_offset as usize + 6;
    assert_eq!(u32::from_le_bytes(spd[off..off + 4].try_into().unwrap()), 65);
}

#[test]
fn test_entry_point_published() {
    let ctx = ctx();
    let cb = sample_function("f");
    assert_eq!(cb.best_entry_point(), 0xdead_0000);
    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    assert_eq!(compiled.entry, compiled.baseline.region_addr() + 32);
    assert_eq!(cb.best_entry_point(), compiled.entry);
    assert_eq!(ctx.num_baseline_compilations(), 1);
}

#[test]
#[should_panic(expected = "already compiled")]
fn test_double_compile_panics() {
    let ctx = ctx();
    let cb = sample_function("f");
    compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    let _ = compile_function_to_baseline_jit(&ctx, &cb);
}

#[test]
fn test_osr_reuses_existing_code() {
    let ctx = ctx();
    let cb = sample_function("f");
    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();

    let osr = compile_for_on_stack_replacement(&ctx, &cb, cb.bytecode_ptr(18)).unwrap();
    assert!(Arc::ptr_eq(&osr.baseline, &compiled.baseline));
    assert_eq!(osr.entry, compiled.baseline.region_addr() + 49);
    assert_eq!(ctx.num_baseline_compilations(), 1);
}

#[test]
fn test_osr_compiles_on_demand() {
    let ctx = ctx();
    let cb = sample_function("f");
    let osr = compile_for_on_stack_replacement(&ctx, &cb, cb.bytecode_ptr(12)).unwrap();
    assert!(cb.has_baseline());
    assert_eq!(osr.entry, osr.baseline.region_addr() + 44);
    assert_eq!(ctx.num_baseline_compilations(), 1);
}

#[test]
#[should_panic(expected = "not a bytecode boundary")]
fn test_osr_into_middle_of_bytecode() {
    let ctx = ctx();
    let cb = sample_function("f");
    let _ = compile_for_on_stack_replacement(&ctx, &cb, cb.bytecode_ptr(3));
}

#[test]
fn test_concurrent_osr_shares_one_compilation() {
    let ctx = ctx();
    let cb = sample_function("f");
    let (ctx, cb) = (&ctx, &cb);
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(move || compile_for_on_stack_replacement(ctx, cb, cb.bytecode_ptr(18)).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let published = cb.baseline().unwrap();
    for osr in &results {
        assert!(Arc::ptr_eq(&osr.baseline, published));
        assert_eq!(osr.entry, published.region_addr() + 49);
    }
    assert_eq!(cb.best_entry_point(), published.jit_entry());
    assert_eq!(ctx.num_baseline_compilations(), 1);
}

/// Entry whose data section holds 12 bytes, the first 8 being the absolute
/// address of the function entry.
fn entry_with_data() -> FunctionEntryTrait {
    CopyPatchEmitter::new(
        vec![0x90],
        Vec::new(),
        vec![0; 12],
        8,
        vec![Hole {
            section: Section::Data,
            offset: 0,
            kind: HoleKind::SectionAbs64 {
                target: Section::Fast,
                addend: 0,
            },
        }],
    )
    .into_entry_trait()
}

#[test]
fn test_entry_data_section() {
    let entry = |len: usize| CopyPatchEmitter::new(vec![0x90; len], Vec::new(), Vec::new(), 1, Vec::new()).into_entry_trait();
    let tables = TraitTables::new(
        bytecode_traits(),
        vec![entry_with_data(), entry(3)],
        vec![entry(2), entry(4)],
        0,
        vec![0],
    );
    let config = JitConfig {
        verify_codegen: true,
        ..JitConfig::default()
    };
    let ctx = JitContext::new(config, Arc::new(tables));
    // 0: branch +6; 6: ret
    let bytecode = BytecodeBuilder::new().op(OP_BRANCH, Some(6)).op(OP_RET, None).finish();
    let cb = CodeBlock::new("f", bytecode, 0, false, 0);

    let (sizes, entry_trait) = compute_sizes(ctx.trait_tables(), &cb);
    assert_eq!(entry_trait.data_section_len, 12);
    // 12 bytes of entry data, padded to 16 for the branch's 8
    assert_eq!(sizes.data_section_len, 24);

    let compiled = compile_function_to_baseline_jit(&ctx, &cb).unwrap();
    let baseline = &compiled.baseline;
    let layout = baseline.layout();
    assert_eq!(layout.data_len, 24);
    assert_eq!(layout.fast_path_offset, 32);

    let code = baseline.code();
    let addr = baseline.region_addr() as u64;
    assert_eq!(u64::from_le_bytes(code[0..8].try_into().unwrap()), addr + 32);
    assert_eq!(&code[8..12], &[0, 0, 0, 0]);
    assert_eq!(u64::from_le_bytes(code[16..24].try_into().unwrap()), addr + 33);
    assert_eq!(code[32], 0x90);
    assert_eq!(&code[33..35], &[0x0f, 0x84]);
    assert_eq!(code[39], 0xc3);
    // the branch lands right after itself
    assert_eq!(read_i32(code, 35), 0);
}

/// Claims a data section but writes none.
struct ShortEntry;

impl EntryEmitter for ShortEntry {
    fn emit(&self, _: &CodeBlock, _: &mut EmitCursors<'_>) {}
}

#[test]
#[should_panic(expected = "entry data section length mismatch")]
fn test_entry_inconsistency_detected() {
    let entry = || FunctionEntryTrait {
        fast_path_len: 0,
        slow_path_len: 0,
        data_section_len: 8,
        emitter: Arc::new(ShortEntry),
    };
    let tables = TraitTables::new(bytecode_traits(), vec![entry(), entry()], vec![entry(), entry()], 0, Vec::new());
    let ctx = JitContext::new(
        JitConfig {
            verify_codegen: true,
            ..JitConfig::default()
        },
        Arc::new(tables),
    );
    let cb = CodeBlock::new("bad", BytecodeBuilder::new().op(OP_RET, None).finish(), 0, false, 0);
    let _ = compile_function_to_baseline_jit(&ctx, &cb);
}

#[test]
fn test_entry_trait_selection() {
    let ctx = ctx();
    let bytecode = BytecodeBuilder::new().op(OP_RET, None).finish();

    let va = CodeBlock::new("va", bytecode.clone(), 0, true, 0);
    let compiled = compile_function_to_baseline_jit(&ctx, &va).unwrap();
    assert_eq!(compiled.baseline.layout().fast_path_len, 2 + 1);

    let many_args = CodeBlock::new("many", bytecode, 9, false, 0);
    let compiled = compile_function_to_baseline_jit(&ctx, &many_args).unwrap();
    assert_eq!(compiled.baseline.layout().fast_path_len, 3 + 1);
    assert_eq!(compiled.baseline.layout().data_len, 0);
    assert_eq!(compiled.baseline.layout().fast_path_offset, 0);
}

#[test]
fn test_regions_never_overlap() {
    let ctx = ctx();
    let blocks: Vec<CodeBlock> = (0..16).map(|i| sample_function(&format!("f{}", i))).collect();
    let compiled: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = blocks
            .iter()
            .map(|cb| {
                let ctx = &ctx;
                s.spawn(move || compile_function_to_baseline_jit(ctx, cb).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut ranges: Vec<(usize, usize)> = compiled
        .iter()
        .map(|c| (c.baseline.region_addr(), c.baseline.region_addr() + c.baseline.layout().total_len))
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }
    assert_eq!(ctx.num_baseline_compilations(), 16);
}

#[test]
#[should_panic(expected = "not terminated")]
fn test_unterminated_bytecode() {
    let ctx = ctx();
    let bytecode = BytecodeBuilder::new().op(OP_LOAD, Some(1)).0;
    let cb = CodeBlock::new("bad", bytecode, 0, false, 0);
    let _ = compile_function_to_baseline_jit(&ctx, &cb);
}

/// Writes its stencil but forgets to move the fast path cursor.
struct Forgetful;

impl BytecodeEmitter for Forgetful {
    fn emit(&self, _: &[u8], _: u32, cur: &mut EmitCursors<'_>) {
        cur.fast.write(&[0xc3]);
        cur.slow_path_data.advance(4);
    }
}

#[test]
#[should_panic(expected = "fast path length mismatch")]
fn test_emitter_inconsistency_detected() {
    let mut traits = bytecode_traits();
    traits[OP_RET as usize].emitter = Arc::new(Forgetful);
    traits[OP_RET as usize].slow_path_data_len = 10;
    let entry = || CopyPatchEmitter::new(Vec::new(), Vec::new(), Vec::new(), 1, Vec::new()).into_entry_trait();
    let tables = TraitTables::new(traits, vec![entry(), entry()], vec![entry(), entry()], 0, Vec::new());
    let ctx = JitContext::new(
        JitConfig {
            verify_codegen: true,
            ..JitConfig::default()
        },
        Arc::new(tables),
    );
    let cb = CodeBlock::new("bad", BytecodeBuilder::new().op(OP_RET, None).finish(), 0, false, 0);
    let _ = compile_function_to_baseline_jit(&ctx, &cb);
}
