//! Assembly-level rewrites: fast/slow path separation and the
//! move-to-fallthrough heuristic.
//!
//! We do this by parsing the assembly LLVM generated. Crude, but the markers
//! injected by the IR phase make the interesting spots easy to find.

use std::collections::{HashMap, HashSet};

use log::info;
use serde::Serialize;

use super::LoweringError;
use super::asm::AsmLine;
use super::magic::{MOVE_TO_FALLTHROUGH_MARKER, SLOW_PATH_MARKER};

/// Prefix of the local labels this pass synthesizes.
const SYNTHESIZED_LABEL_PREFIX: &str = ".Lcopa_ft_";

/// Can control reach the label at `line` by falling through from the previous instruction?
///
/// Only unconditional jumps and `ud2` are treated as barriers.
pub fn label_can_be_reached_by_fallthrough(
    file: &[AsmLine],
    line: usize,
) -> Result<bool, LoweringError> {
    assert!(file[line].is_local_label());
    for prev in file[..line].iter().rev() {
        if prev.is_local_label() {
            return Err(LoweringError::ConsecutiveLabels {
                label: file[line].label_name().to_string(),
            });
        }
        if prev.is_instruction() {
            return Ok(!prev.is_barrier());
        }
    }
    Ok(true)
}

/// Outcome of slow-path extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlowPathSplit {
    /// First line of the slow path; equals the file length if there is no slow path
    pub separation_line: usize,
    /// Whether a `jmp` to the split label had to be added to replace a fallthrough
    pub synthesized_jump: bool,
}

/// Remove every slow-path marker and find where the slow path begins.
///
/// The split point is the nearest label preceding the first marker. If that
/// label could be reached by falling through, an explicit `jmp` to it is
/// appended to the fast path, since the two halves end up in different sections.
pub fn rewrite_slow_path_hint(file: &mut Vec<AsmLine>) -> Result<SlowPathSplit, LoweringError> {
    let Some(marker) = SLOW_PATH_MARKER.find_first(file) else {
        return Ok(SlowPathSplit {
            separation_line: file.len(),
            synthesized_jump: false,
        });
    };

    let mut line = marker;
    while line > 0 && !file[line].is_local_label() {
        line -= 1;
    }

    if !file[line].is_local_label() {
        // No label to split at (seen in unoptimized builds); keep everything hot.
        SLOW_PATH_MARKER.strip(file);
        return Ok(SlowPathSplit {
            separation_line: file.len(),
            synthesized_jump: false,
        });
    }

    let synthesized_jump = label_can_be_reached_by_fallthrough(file, line)?;
    if synthesized_jump {
        let label = file[line].label_name().to_string();
        file.insert(line, AsmLine::instruction("jmp", &label));
        line += 1;
    }

    // All markers sit after the split label, so `line` stays valid.
    SLOW_PATH_MARKER.strip(file);

    Ok(SlowPathSplit {
        separation_line: line,
        synthesized_jump,
    })
}

/// What the move-to-fallthrough rewrite did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallthroughRewrite {
    /// No marker in the fast path
    NoHint,
    /// The jump to the next bytecode is already the last line
    AlreadyLast,
    /// Code after the jump was hoisted above it, behind a preceding barrier
    BarrierSwap { removed_jumps: usize },
    /// A forward conditional branch was inverted so its target became the fallthrough body
    BranchInversion,
    /// Reached the start of the function without an eligible barrier or branch
    NoCandidate,
}

fn is_jump_to(line: &AsmLine, symbol: Option<&str>) -> bool {
    if line.opcode() != Some("jmp") {
        return false;
    }
    let Some(symbol) = symbol else {
        return true;
    };
    // tolerate a trailing `# TAILCALL` comment
    line.num_words() >= 2 && {
        let target = line.word(1);
        target == symbol || target.strip_suffix("@PLT") == Some(symbol)
    }
}

fn invert_condition(opcode: &str) -> String {
    match opcode.strip_prefix("jn") {
        Some(rest) => format!("j{}", rest),
        None => format!("jn{}", &opcode[1..]),
    }
}

fn collect_labels(file: &[AsmLine]) -> Result<HashMap<String, usize>, LoweringError> {
    let mut labels = HashMap::new();
    for (i, line) in file.iter().enumerate() {
        if line.is_local_label() {
            let name = line.label_name().to_string();
            if labels.insert(name.clone(), i).is_some() {
                return Err(LoweringError::DuplicateLabel { label: name });
            }
        }
    }
    Ok(labels)
}

fn fresh_label(labels: &HashMap<String, usize>) -> String {
    (0..)
        .map(|n| format!("{}{}", SYNTHESIZED_LABEL_PREFIX, n))
        .find(|l| !labels.contains_key(l))
        .unwrap_or_default()
}

/// Remove two-word jumps whose target is the next non-blank line.
fn remove_jumps_to_next_label(file: &mut Vec<AsmLine>) -> usize {
    let mut to_remove = HashSet::new();
    for (i, line) in file.iter().enumerate() {
        if !line.is_instruction() || line.num_words() != 2 || !line.word(0).starts_with('j') {
            continue;
        }
        let next = file[i + 1..].iter().find(|l| !l.is_comment_or_empty());
        if let Some(next) = next {
            if next.is_local_label() && next.label_name() == line.word(1) {
                to_remove.insert(i);
            }
        }
    }
    let removed = to_remove.len();
    let mut i = 0;
    file.retain(|_| {
        let keep = !to_remove.contains(&i);
        i += 1;
        keep
    });
    removed
}

/// Reorder the fast path so it falls through into the next bytecode instead
/// of ending with a jump to it.
///
/// Starting from the move-to-fallthrough marker, scan backward for the nearest
/// barrier or conditional branch.
///
/// For a barrier:
///
/// ```text
///     jmp ...                   jmp ...
///     XXXXX            ===>     YYYYY
///     jmp next_bc               XXXXX
///     YYYYY                     jmp next_bc
/// ```
///
/// A common shape is `jcc A; jmp B; A: XXXXX; jmp next_bc; B: YYYYY`, where
/// the `jmp B` becomes redundant after the swap and is removed.
///
/// For a forward conditional branch whose target cannot be reached by fallthrough:
///
/// ```text
///  /- jcc Z                   jncc T   -|
///  |  XXXXX                   ZZZZZ     |
///  |  jmp next_bc    ===>     YYYYY     |
///  |  YYYYY                 T:          |
///  \->ZZZZZ                   XXXXX  <--/
///                             jmp next_bc
/// ```
pub fn rewrite_move_to_fallthrough_hint(
    fn_name: &str,
    file: &mut Vec<AsmLine>,
    next_bytecode_symbol: Option<&str>,
) -> Result<FallthroughRewrite, LoweringError> {
    let Some(marker) = MOVE_TO_FALLTHROUGH_MARKER.find_first(file) else {
        return Ok(FallthroughRewrite::NoHint);
    };

    let jmp_next = (marker..file.len())
        .find(|&i| is_jump_to(&file[i], next_bytecode_symbol))
        .ok_or_else(|| LoweringError::MissingJumpToNext {
            function: fn_name.to_string(),
        })?;

    if jmp_next == file.len() - 1 {
        return Ok(FallthroughRewrite::AlreadyLast);
    }

    let labels = collect_labels(file)?;

    for line in (0..=marker).rev() {
        if !file[line].is_instruction() {
            continue;
        }
        if file[line].is_barrier() {
            let mut new_file = Vec::with_capacity(file.len());
            new_file.extend_from_slice(&file[..=line]);
            new_file.extend_from_slice(&file[jmp_next + 1..]);
            new_file.extend_from_slice(&file[line + 1..=jmp_next]);
            debug_assert_eq!(new_file.len(), file.len());
            *file = new_file;

            let removed_jumps = remove_jumps_to_next_label(file);
            return Ok(FallthroughRewrite::BarrierSwap { removed_jumps });
        }

        let opcode = file[line].word(0).to_string();
        if !opcode.starts_with('j') {
            continue;
        }
        if file[line].num_words() != 2 {
            return Err(LoweringError::MalformedBranch {
                line: file[line].to_string(),
            });
        }

        // Targets that are not local labels (symbols, slow-path labels) are left alone.
        let Some(&defined_line) = labels.get(file[line].word(1)) else {
            continue;
        };
        if defined_line <= jmp_next || label_can_be_reached_by_fallthrough(file, defined_line)? {
            continue;
        }

        let tmp_label = fresh_label(&labels);
        file[line].set_word(0, invert_condition(&opcode));
        file[line].set_word(1, tmp_label.as_str());

        let mut new_file = Vec::with_capacity(file.len() + 1);
        new_file.extend_from_slice(&file[..=line]);
        new_file.extend_from_slice(&file[defined_line..]);
        new_file.extend_from_slice(&file[jmp_next + 1..defined_line]);
        new_file.push(AsmLine::label(&tmp_label));
        new_file.extend_from_slice(&file[line + 1..=jmp_next]);
        debug_assert_eq!(new_file.len(), file.len() + 1);
        *file = new_file;
        return Ok(FallthroughRewrite::BranchInversion);
    }

    info!(
        target: "copa::stencil",
        "[NOTE] Failed to rewrite JIT stencil to eliminate jmp to fallthrough (function name = {}).",
        fn_name
    );
    Ok(FallthroughRewrite::NoCandidate)
}

/// Split off the function-end boilerplate, starting at the unique label with `prefix`.
pub fn split_function_footer(
    file: &mut Vec<AsmLine>,
    prefix: &str,
) -> Result<Vec<AsmLine>, LoweringError> {
    let mut end_line = None;
    for (i, line) in file.iter().enumerate() {
        if line.is_local_label() && line.label_name().starts_with(prefix) {
            if end_line.is_some() {
                return Err(LoweringError::DuplicateFunctionEnd {
                    prefix: prefix.to_string(),
                });
            }
            end_line = Some(i);
        }
    }
    let end_line = end_line.ok_or_else(|| LoweringError::MissingFunctionEnd {
        prefix: prefix.to_string(),
    })?;
    Ok(file.split_off(end_line))
}
