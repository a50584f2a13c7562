//! Hot/cold splitting at the IR level.
//!
//! Cold blocks are found from block-frequency estimates. Only the cold blocks
//! that can be reached from the entry without first passing through another
//! cold block get a slow-path marker: those are the places where the assembly
//! scan will first run into cold code.

use log::debug;

use super::ir::{BlockFrequencyInfo, BlockId, Inst, IrFunction};
use super::magic::{MOVE_TO_FALLTHROUGH_MARKER, SLOW_PATH_MARKER};

/// Result of analyzing one function for hot/cold splitting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColdSplitAnalysis {
    /// Every block below the cold threshold
    pub cold_blocks: Vec<BlockId>,
    /// The cold blocks that receive a slow-path marker
    pub marked_blocks: Vec<BlockId>,
    /// The block whose dispatch to the next bytecode should become a fallthrough
    pub fallthrough_block: Option<BlockId>,
}

/// Non-empty blocks whose relative frequency is below `threshold`.
pub fn find_cold_blocks(f: &IrFunction, bfi: &BlockFrequencyInfo, threshold: f64) -> Vec<BlockId> {
    f.block_ids()
        .filter(|&bb| !f.block(bb).is_empty())
        .filter(|&bb| bfi.relative_freq(bb) < threshold)
        .collect()
}

/// Cold blocks reachable from the entry when all other cold blocks are removed.
pub fn blocks_needing_marker(f: &IrFunction, cold_blocks: &[BlockId]) -> Vec<BlockId> {
    cold_blocks
        .iter()
        .copied()
        .filter(|&bb| {
            let others: Vec<BlockId> = cold_blocks.iter().copied().filter(|&o| o != bb).collect();
            f.is_reachable_avoiding(bb, &others)
        })
        .collect()
}

/// The most frequent block that tail-calls `placeholder`, if it is hot enough.
///
/// Ties go to the first block found.
pub fn select_fallthrough_block(
    f: &IrFunction,
    bfi: &BlockFrequencyInfo,
    placeholder: &str,
    threshold: f64,
) -> Option<BlockId> {
    let mut best: Option<(BlockId, f64)> = None;
    for bb in f.block_ids() {
        let block = f.block(bb);
        if block.is_empty() || block.terminating_tail_call() != Some(placeholder) {
            continue;
        }
        let freq = bfi.relative_freq(bb);
        if best.is_none_or(|(_, max)| freq > max) {
            best = Some((bb, freq));
        }
    }

    match best {
        Some((bb, freq)) if freq >= threshold => Some(bb),
        Some(_) => {
            debug!(target: "copa::stencil", "{}: dispatch to next bytecode is in the slow path", f.name);
            None
        }
        None => {
            debug!(target: "copa::stencil", "{}: no dispatch to next bytecode found", f.name);
            None
        }
    }
}

/// Run the analysis without touching the function.
pub fn analyze(
    f: &IrFunction,
    bfi: &BlockFrequencyInfo,
    placeholder: Option<&str>,
    threshold: f64,
) -> ColdSplitAnalysis {
    assert_eq!(
        f.blocks.len(),
        bfi.num_blocks(),
        "block frequency info does not cover function {}",
        f.name
    );
    let cold_blocks = find_cold_blocks(f, bfi, threshold);
    let marked_blocks = blocks_needing_marker(f, &cold_blocks);
    let fallthrough_block = placeholder.and_then(|p| select_fallthrough_block(f, bfi, p, threshold));
    ColdSplitAnalysis {
        cold_blocks,
        marked_blocks,
        fallthrough_block,
    }
}

/// Inject the magic markers described by `analysis` into `f`.
pub fn inject_markers(f: &mut IrFunction, analysis: &ColdSplitAnalysis) {
    if let Some(bb) = analysis.fallthrough_block {
        let insts = &mut f.blocks[bb.0].insts;
        assert!(matches!(insts.last(), Some(Inst::TailCall(_))));
        let at = insts.len() - 1;
        insts.insert(at, Inst::InlineAsm(MOVE_TO_FALLTHROUGH_MARKER.inline_asm()));
    }
    for &bb in &analysis.marked_blocks {
        f.blocks[bb.0]
            .insts
            .insert(0, Inst::InlineAsm(SLOW_PATH_MARKER.inline_asm()));
    }
}
