//! Magic instruction sequences used as landmarks between compilation phases.
//!
//! The IR phase injects these sequences as inline asm, the ASM phase finds
//! them again in the printed assembly, and the final image assembler finds the
//! hot/cold barrier in raw machine code. All three sides derive their view of
//! a sequence from the tables in this module, never from their own literals.
//!
//! Every sequence has the same shape:
//!
//! ```text
//!     N * hlt
//!     movq $imm0, %rax
//!     movq $imm1, %rax
//!     M * (ud2; hlt)
//! ```

use super::asm::AsmLine;

const HLT: u8 = 0xf4;
const UD2: [u8; 2] = [0x0f, 0x0b];
/// `movq $imm32, %rax` (REX.W C7 /0 id)
const MOVQ_IMM32_RAX: [u8; 3] = [0x48, 0xc7, 0xc0];

/// Description of one magic sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicSequence {
    /// Number of leading `hlt`
    pub hlt_prefix: usize,
    /// The two tagged immediates moved into `%rax`
    pub tags: [u32; 2],
    /// Number of trailing `ud2; hlt` pairs
    pub trailer_pairs: usize,
}

/// Marks the first block of a slow path.
pub const SLOW_PATH_MARKER: MagicSequence = MagicSequence {
    hlt_prefix: 12,
    tags: [0xdee2333, 0x114514],
    trailer_pairs: 2,
};

/// Marks the dispatch to the next bytecode that should become a fallthrough.
pub const MOVE_TO_FALLTHROUGH_MARKER: MagicSequence = MagicSequence {
    hlt_prefix: 12,
    tags: [0x1357986, 0x32123456],
    trailer_pairs: 2,
};

/// Separates hot and cold code when whole functions are spliced into one image.
///
/// Must be longer than 128 bytes so every jump across it uses a rel32 operand.
pub const HOT_COLD_BARRIER: MagicSequence = MagicSequence {
    hlt_prefix: 35,
    tags: [0x1919810, 0x1337abcd],
    trailer_pairs: 37,
};

/// Machine-code length of [`HOT_COLD_BARRIER`].
pub const HOT_COLD_BARRIER_SIZE: usize = HOT_COLD_BARRIER.machine_code_len();

const _: () = assert!(SLOW_PATH_MARKER.machine_code_len() % 32 == 0);
const _: () = assert!(MOVE_TO_FALLTHROUGH_MARKER.machine_code_len() % 32 == 0);
const _: () = assert!(HOT_COLD_BARRIER_SIZE % 32 == 0);
const _: () = assert!(HOT_COLD_BARRIER_SIZE > 128);

impl MagicSequence {
    /// Number of assembly lines the sequence prints as.
    pub const fn num_lines(&self) -> usize {
        self.hlt_prefix + 2 + self.trailer_pairs * 2
    }

    pub const fn machine_code_len(&self) -> usize {
        self.hlt_prefix + 2 * (MOVQ_IMM32_RAX.len() + 4) + self.trailer_pairs * (UD2.len() + 1)
    }

    /// The sequence in LLVM inline asm syntax (`$$` escapes a literal `$`).
    pub fn inline_asm(&self) -> String {
        let mut res = "hlt; ".repeat(self.hlt_prefix);
        for tag in self.tags {
            res += &format!("movq $${:#x}, %rax; ", tag);
        }
        res += &"ud2; hlt; ".repeat(self.trailer_pairs);
        res
    }

    /// The sequence as LLVM's asm printer emits it, one instruction per line.
    ///
    /// Immediates are printed in decimal, which is what the ASM phase matches on.
    pub fn att_lines(&self) -> Vec<String> {
        let mut res = Vec::with_capacity(self.num_lines());
        res.extend(std::iter::repeat_n("\thlt".to_string(), self.hlt_prefix));
        for tag in self.tags {
            res.push(format!("\tmovq\t${}, %rax", tag));
        }
        for _ in 0..self.trailer_pairs {
            res.push("\tud2".to_string());
            res.push("\thlt".to_string());
        }
        res
    }

    /// The sequence as a standalone AT&T assembly snippet.
    pub fn att_asm(&self) -> String {
        let mut res = String::new();
        for line in self.att_lines() {
            res += &line;
            res.push('\n');
        }
        res
    }

    pub fn machine_code(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(self.machine_code_len());
        res.extend(std::iter::repeat_n(HLT, self.hlt_prefix));
        for tag in self.tags {
            res.extend_from_slice(&MOVQ_IMM32_RAX);
            res.extend_from_slice(&tag.to_le_bytes());
        }
        for _ in 0..self.trailer_pairs {
            res.extend_from_slice(&UD2);
            res.push(HLT);
        }
        res
    }

    /// Does the sequence start at `line`?
    pub fn matches_at(&self, file: &[AsmLine], line: usize) -> bool {
        if line + self.num_lines() > file.len() {
            return false;
        }
        let lines = &file[line..line + self.num_lines()];
        let is_single = |l: &AsmLine, op: &str| l.num_words() == 1 && l.word(0) == op;
        let is_tag = |l: &AsmLine, tag: u32| {
            l.num_words() == 3
                && l.word(0) == "movq"
                && l.word(1) == format!("${},", tag)
                && l.word(2) == "%rax"
        };

        let (prefix, rest) = lines.split_at(self.hlt_prefix);
        if !prefix.iter().all(|l| is_single(l, "hlt")) {
            return false;
        }
        if !is_tag(&rest[0], self.tags[0]) || !is_tag(&rest[1], self.tags[1]) {
            return false;
        }
        rest[2..]
            .chunks(2)
            .all(|pair| is_single(&pair[0], "ud2") && is_single(&pair[1], "hlt"))
    }

    /// Index of the first line where the sequence starts.
    pub fn find_first(&self, file: &[AsmLine]) -> Option<usize> {
        (0..file.len()).find(|&i| self.matches_at(file, i))
    }

    pub fn count(&self, file: &[AsmLine]) -> usize {
        let mut n = 0;
        let mut k = 0;
        while k < file.len() {
            if self.matches_at(file, k) {
                n += 1;
                k += self.num_lines();
            } else {
                k += 1;
            }
        }
        n
    }

    /// Remove every occurrence of the sequence.
    pub fn strip(&self, file: &mut Vec<AsmLine>) {
        let mut out = Vec::with_capacity(file.len());
        let mut k = 0;
        while k < file.len() {
            if self.matches_at(file, k) {
                k += self.num_lines();
            } else {
                out.push(file[k].clone());
                k += 1;
            }
        }
        *file = out;
    }
}

/// The hot/cold barrier in plain AT&T syntax, ready to be spliced between
/// the hot and cold halves of an assembly file.
pub fn hot_cold_barrier_att_asm() -> String {
    HOT_COLD_BARRIER.att_asm()
}

/// Every byte offset where the hot/cold barrier occurs in `machine_code`.
pub fn hot_cold_barrier_offsets(machine_code: &[u8]) -> Vec<usize> {
    let pattern = HOT_COLD_BARRIER.machine_code();
    debug_assert_eq!(pattern.len(), HOT_COLD_BARRIER_SIZE);
    machine_code
        .windows(pattern.len())
        .enumerate()
        .filter(|(_, window)| *window == pattern.as_slice())
        .map(|(offset, _)| offset)
        .collect()
}

/// Find the byte offset of the hot/cold barrier in assembled machine code.
///
/// Panics unless the barrier occurs exactly once.
pub fn locate_hot_cold_splitting_barrier(machine_code: &[u8]) -> usize {
    match hot_cold_barrier_offsets(machine_code).as_slice() {
        [offset] => *offset,
        [] => panic!("hot/cold barrier not found in machine code"),
        [first, second, ..] => panic!(
            "hot/cold barrier found twice (offsets {} and {})",
            first, second
        ),
    }
}

/// Split machine code at the hot/cold barrier, dropping the barrier itself.
pub fn split_at_hot_cold_barrier(machine_code: &[u8]) -> (&[u8], &[u8]) {
    let offset = locate_hot_cold_splitting_barrier(machine_code);
    (
        &machine_code[..offset],
        &machine_code[offset + HOT_COLD_BARRIER_SIZE..],
    )
}
