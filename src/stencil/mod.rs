//! Stencil lowering: turns one compiled bytecode implementation into a
//! fast path / slow path pair ready for copy-and-patch.
//!
//! The pass runs in two phases around code generation:
//!
//! 1. IR phase ([`StencilLoweringPass::run_ir_rewrite_phase`]): find cold
//!    blocks and inject magic markers. The function is sealed afterwards,
//!    since any later IR transformation could move the markers.
//! 2. ASM phase ([`StencilLoweringPass::run_asm_rewrite_phase`]): find the
//!    markers again in the printed assembly, split the function into two
//!    sections and make the dispatch to the next bytecode a fallthrough.

pub mod asm;
pub mod hot_cold;
pub mod ir;
pub mod magic;
pub mod printer;
pub mod rewrite;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::config::LoweringConfig;
use asm::{read_assembly_file, write_lines};
use hot_cold::ColdSplitAnalysis;
use ir::{BlockFrequencyInfo, IrFunction};
use magic::{MOVE_TO_FALLTHROUGH_MARKER, SLOW_PATH_MARKER};
use rewrite::{FallthroughRewrite, SlowPathSplit};

/// Structural problems in the assembly handed to the ASM phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoweringError {
    #[error("label {label} is directly preceded by another label")]
    ConsecutiveLabels { label: String },
    #[error("label {label} is defined more than once")]
    DuplicateLabel { label: String },
    #[error("{function}: no jump to the next bytecode after the fallthrough marker")]
    MissingJumpToNext { function: String },
    #[error("malformed conditional branch: {line:?}")]
    MalformedBranch { line: String },
    #[error("more than one label starting with {prefix}")]
    DuplicateFunctionEnd { prefix: String },
    #[error("no label starting with {prefix}")]
    MissingFunctionEnd { prefix: String },
}

/// A function that went through the IR phase and must not be changed anymore.
#[derive(Debug, Clone)]
pub struct SealedFunction(IrFunction);

impl SealedFunction {
    pub fn function(&self) -> &IrFunction {
        &self.0
    }

    /// Print with the reference printer, as function number `fn_index` of its module.
    pub fn print(&self, fn_index: usize) -> String {
        printer::print_function(&self.0, fn_index)
    }
}

/// Summary of what the ASM phase did to one function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsmRewriteReport {
    pub function: String,
    pub fast_path_lines: usize,
    pub slow_path_lines: usize,
    pub slow_path: SlowPathSplit,
    pub fallthrough: FallthroughRewrite,
}

#[derive(Debug, Clone)]
pub struct AsmRewriteOutput {
    pub asm: String,
    pub report: AsmRewriteReport,
}

pub struct StencilLoweringPass {
    config: LoweringConfig,
    analysis: ColdSplitAnalysis,
}

impl StencilLoweringPass {
    /// Run the IR phase on `f`.
    pub fn run_ir_rewrite_phase(
        mut f: IrFunction,
        bfi: &BlockFrequencyInfo,
        config: &LoweringConfig,
    ) -> (Self, SealedFunction) {
        let analysis = hot_cold::analyze(
            &f,
            bfi,
            config.fallthrough_placeholder.as_deref(),
            config.cold_threshold,
        );
        debug!(
            target: "copa::stencil",
            "{}: {} cold blocks, {} slow path markers, fallthrough block {:?}",
            f.name,
            analysis.cold_blocks.len(),
            analysis.marked_blocks.len(),
            analysis.fallthrough_block
        );
        hot_cold::inject_markers(&mut f, &analysis);
        let pass = Self {
            config: config.clone(),
            analysis,
        };
        (pass, SealedFunction(f))
    }

    /// A pass for assembly whose IR phase ran elsewhere.
    pub fn for_asm(config: &LoweringConfig) -> Self {
        Self {
            config: config.clone(),
            analysis: ColdSplitAnalysis::default(),
        }
    }

    pub fn analysis(&self) -> &ColdSplitAnalysis {
        &self.analysis
    }

    /// Run the ASM phase on the printed assembly of `func_name`.
    pub fn run_asm_rewrite_phase(
        &self,
        asm: &str,
        func_name: &str,
    ) -> Result<AsmRewriteOutput, LoweringError> {
        let mut file = read_assembly_file(asm);
        let footer =
            rewrite::split_function_footer(&mut file, &self.config.function_end_label_prefix)?;

        let slow_path = rewrite::rewrite_slow_path_hint(&mut file)?;
        let mut slow = file.split_off(slow_path.separation_line);
        let mut fast = file;

        let fallthrough = rewrite::rewrite_move_to_fallthrough_hint(
            func_name,
            &mut fast,
            self.config.fallthrough_placeholder.as_deref(),
        )?;

        // The marker may also sit in cold code, where it is not acted upon.
        MOVE_TO_FALLTHROUGH_MARKER.strip(&mut fast);
        MOVE_TO_FALLTHROUGH_MARKER.strip(&mut slow);
        debug_assert_eq!(SLOW_PATH_MARKER.count(&fast) + SLOW_PATH_MARKER.count(&slow), 0);

        let mut out = String::new();
        write_lines(&mut out, &fast);
        out += &format!("\t.section\t{},\"ax\",@progbits\n", self.config.slow_path_section);
        write_lines(&mut out, &slow);
        out += &format!("\t.section\t{},\"ax\",@progbits\n", self.config.fast_path_section);
        write_lines(&mut out, &footer);

        let report = AsmRewriteReport {
            function: func_name.to_string(),
            fast_path_lines: fast.len(),
            slow_path_lines: slow.len(),
            slow_path,
            fallthrough,
        };
        Ok(AsmRewriteOutput { asm: out, report })
    }
}
