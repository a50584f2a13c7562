//! A minimal control-flow-graph IR for stencil functions.
//!
//! Instruction selection and register allocation happen upstream; this model
//! only carries what the lowering pass looks at: block structure, successor
//! edges, inline asm, and must-tail calls to placeholder globals.

use std::collections::VecDeque;

/// Index of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// An IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    /// Opaque, already-selected instruction text (AT&T syntax)
    Op(String),
    /// Inline asm in LLVM syntax, statements separated by `;`
    InlineAsm(String),
    /// Unconditional branch
    Br(BlockId),
    /// Conditional branch, `cond` is the x86 condition suffix (`e`, `ne`, `b`, ...)
    CondBr {
        cond: String,
        taken: BlockId,
        not_taken: BlockId,
    },
    /// Must-tail call to a global symbol, terminates the block
    TailCall(String),
    Ret,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Br(_) | Inst::CondBr { .. } | Inst::TailCall(_) | Inst::Ret)
    }
}

/// A basic block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicBlock {
    pub insts: Vec<Inst>,
}

impl BasicBlock {
    pub fn new(insts: Vec<Inst>) -> Self {
        Self { insts }
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|i| i.is_terminator())
    }

    /// Callee of the terminating must-tail call, if any.
    pub fn terminating_tail_call(&self) -> Option<&str> {
        match self.terminator() {
            Some(Inst::TailCall(callee)) => Some(callee),
            _ => None,
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.terminator() {
            Some(Inst::Br(t)) => vec![*t],
            Some(Inst::CondBr { taken, not_taken, .. }) => vec![*taken, *not_taken],
            _ => Vec::new(),
        }
    }
}

/// A function in the stencil IR. Block 0 is the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    pub name: String,
    pub blocks: Vec<BasicBlock>,
}

impl IrFunction {
    pub fn new(name: impl Into<String>, blocks: Vec<BasicBlock>) -> Self {
        Self {
            name: name.into(),
            blocks,
        }
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len()).map(BlockId)
    }

    /// Can `to` be reached from the entry without passing through `excluded`?
    ///
    /// A block in `excluded` is never entered, even if it is the entry.
    pub fn is_reachable_avoiding(&self, to: BlockId, excluded: &[BlockId]) -> bool {
        let mut visited = vec![false; self.blocks.len()];
        for b in excluded {
            visited[b.0] = true;
        }
        let mut queue = VecDeque::new();
        let entry = self.entry();
        if visited[entry.0] {
            return false;
        }
        visited[entry.0] = true;
        queue.push_back(entry);

        while let Some(cur) = queue.pop_front() {
            if cur == to {
                return true;
            }
            for succ in self.block(cur).successors() {
                if !visited[succ.0] {
                    visited[succ.0] = true;
                    queue.push_back(succ);
                }
            }
        }
        false
    }
}

/// Block execution-frequency estimates, as produced by a block-frequency analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockFrequencyInfo {
    entry_freq: u64,
    block_freqs: Vec<u64>,
}

impl BlockFrequencyInfo {
    /// `block_freqs[i]` is the frequency of block `i`.
    ///
    /// Panics if the entry frequency is zero.
    pub fn new(entry_freq: u64, block_freqs: Vec<u64>) -> Self {
        assert!(entry_freq != 0, "entry frequency must be non-zero");
        Self {
            entry_freq,
            block_freqs,
        }
    }

    pub fn entry_freq(&self) -> u64 {
        self.entry_freq
    }

    pub fn num_blocks(&self) -> usize {
        self.block_freqs.len()
    }

    /// Frequency of `bb` relative to the function entry.
    pub fn relative_freq(&self, bb: BlockId) -> f64 {
        self.block_freqs[bb.0] as f64 / self.entry_freq as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> IrFunction {
        IrFunction::new(
            "diamond",
            vec![
                BasicBlock::new(vec![Inst::CondBr {
                    cond: "e".into(),
                    taken: BlockId(1),
                    not_taken: BlockId(2),
                }]),
                BasicBlock::new(vec![Inst::Br(BlockId(3))]),
                BasicBlock::new(vec![Inst::Br(BlockId(3))]),
                BasicBlock::new(vec![Inst::Ret]),
            ],
        )
    }

    #[test]
    fn test_successors() {
        let f = diamond();
        assert_eq!(f.block(BlockId(0)).successors(), vec![BlockId(1), BlockId(2)]);
        assert!(f.block(BlockId(3)).successors().is_empty());
    }

    #[test]
    fn test_reachability_avoiding() {
        let f = diamond();
        assert!(f.is_reachable_avoiding(BlockId(3), &[BlockId(1)]));
        assert!(!f.is_reachable_avoiding(BlockId(3), &[BlockId(1), BlockId(2)]));
        assert!(!f.is_reachable_avoiding(BlockId(1), &[BlockId(0)]));
    }

    #[test]
    fn test_relative_freq() {
        let bfi = BlockFrequencyInfo::new(8, vec![8, 4, 4, 8]);
        assert_eq!(bfi.relative_freq(BlockId(1)), 0.5);
    }

    #[test]
    fn test_tail_call_terminator() {
        let bb = BasicBlock::new(vec![Inst::Op("nop".into()), Inst::TailCall("__next".into())]);
        assert_eq!(bb.terminating_tail_call(), Some("__next"));
        assert!(bb.successors().is_empty());
    }
}
