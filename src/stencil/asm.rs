//! A makeshift model of LLVM-generated AT&T assembly text.
//!
//! Each line is split into alternating whitespace and non-whitespace runs.
//! Untouched lines serialize back byte-for-byte, so rewrites only ever
//! replace whole lines.

use std::fmt;

/// One line of assembly text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsmLine {
    /// Raw runs; concatenated they give back the parsed line
    components: Vec<String>,
    /// Indices into `components` of the non-whitespace runs
    word_idx: Vec<usize>,
}

impl AsmLine {
    /// Parse a single line (without its trailing newline).
    pub fn parse(line: &str) -> Self {
        let mut res = AsmLine::default();
        let mut chars = line.chars().peekable();
        let Some(&first) = chars.peek() else {
            return res;
        };

        let mut in_space = first.is_whitespace();
        let mut cur = String::new();
        for c in chars {
            if c.is_whitespace() != in_space {
                res.push_run(std::mem::take(&mut cur), in_space);
                in_space = !in_space;
            }
            cur.push(c);
        }
        res.push_run(cur, in_space);
        res
    }

    fn push_run(&mut self, run: String, is_space: bool) {
        self.components.push(run);
        if !is_space {
            self.word_idx.push(self.components.len() - 1);
        }
    }

    /// Build an instruction line in the `\t<op>\t<operand>` shape LLVM prints.
    pub fn instruction(opcode: &str, operand: &str) -> Self {
        Self::parse(&format!("\t{}\t{}", opcode, operand))
    }

    /// Build a label definition line.
    pub fn label(name: &str) -> Self {
        Self::parse(&format!("{}:", name))
    }

    /// Number of non-whitespace tokens.
    pub fn num_words(&self) -> usize {
        self.word_idx.len()
    }

    /// Get the `ord`-th non-whitespace token.
    pub fn word(&self, ord: usize) -> &str {
        &self.components[self.word_idx[ord]]
    }

    /// Replace the `ord`-th token, keeping the surrounding whitespace.
    pub fn set_word(&mut self, ord: usize, value: impl Into<String>) {
        let idx = self.word_idx[ord];
        self.components[idx] = value.into();
    }

    fn first_word(&self) -> Option<&str> {
        self.word_idx.first().map(|&i| self.components[i].as_str())
    }

    /// A local label definition such as `.LBB0_3:`.
    pub fn is_local_label(&self) -> bool {
        self.num_words() == 1 && {
            let w = self.word(0);
            w.starts_with('.') && w.ends_with(':')
        }
    }

    /// The label name without the trailing colon.
    ///
    /// Panics if the line is not a local label.
    pub fn label_name(&self) -> &str {
        assert!(self.is_local_label(), "not a label line: {:?}", self.to_string());
        let w = self.word(0);
        &w[..w.len() - 1]
    }

    pub fn is_comment_or_empty(&self) -> bool {
        match self.first_word() {
            None => true,
            Some(w) => w.starts_with('#'),
        }
    }

    /// Anything that is not a directive, a comment or a label.
    pub fn is_instruction(&self) -> bool {
        match self.first_word() {
            None => false,
            Some(w) => !(w.starts_with('.') || w.starts_with('#') || w.ends_with(':')),
        }
    }

    /// The mnemonic, if this is an instruction line.
    pub fn opcode(&self) -> Option<&str> {
        if self.is_instruction() { self.first_word() } else { None }
    }

    /// Unconditional jumps and `ud2`: control never falls through these.
    pub fn is_barrier(&self) -> bool {
        matches!(self.opcode(), Some("jmp" | "jmpq" | "ud2"))
    }
}

impl fmt::Display for AsmLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for comp in &self.components {
            f.write_str(comp)?;
        }
        Ok(())
    }
}

/// Parse a whole file into lines.
///
/// Lines are split on `\n` only. A `\r` before it stays in the line as
/// trailing whitespace, so CRLF files are written back unchanged.
pub fn read_assembly_file(contents: &str) -> Vec<AsmLine> {
    let mut lines: Vec<&str> = contents.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines.into_iter().map(AsmLine::parse).collect()
}

/// Serialize lines back to text, one `\n` per line.
pub fn write_lines(out: &mut String, lines: &[AsmLine]) {
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_whitespace() {
        for text in [
            "\tmovq\t$233710387, %rax",
            "  addq   %rbx,%rcx   ",
            ".LBB0_1:",
            "",
            "   ",
            "\t# comment with  spaces",
        ] {
            assert_eq!(AsmLine::parse(text).to_string(), text);
        }
    }

    #[test]
    fn test_words() {
        let line = AsmLine::parse("\tmovq\t$1131796, %rax");
        assert_eq!(line.num_words(), 3);
        assert_eq!(line.word(0), "movq");
        assert_eq!(line.word(1), "$1131796,");
        assert_eq!(line.word(2), "%rax");
    }

    #[test]
    fn test_classification() {
        let label = AsmLine::parse(".LBB0_1:");
        assert!(label.is_local_label());
        assert!(!label.is_instruction());
        assert_eq!(label.label_name(), ".LBB0_1");

        let func_label = AsmLine::parse("my_func:");
        assert!(!func_label.is_local_label());
        assert!(!func_label.is_instruction());

        let directive = AsmLine::parse("\t.p2align\t4, 0x90");
        assert!(!directive.is_instruction());
        assert!(!directive.is_comment_or_empty());

        let comment = AsmLine::parse("\t# %bb.0:");
        assert!(comment.is_comment_or_empty());
        assert!(!comment.is_instruction());

        assert!(AsmLine::parse("").is_comment_or_empty());

        let jmp = AsmLine::parse("\tjmp\t.LBB0_2");
        assert!(jmp.is_instruction());
        assert!(jmp.is_barrier());
        assert!(!AsmLine::parse("\tjne\t.LBB0_2").is_barrier());
    }

    #[test]
    fn test_label_with_trailing_comment_is_not_label() {
        let line = AsmLine::parse(".LBB0_1:   # %slow");
        assert!(!line.is_local_label());
    }

    #[test]
    fn test_set_word_keeps_spacing() {
        let mut line = AsmLine::parse("\tjne\t.LBB0_4");
        line.set_word(0, "je");
        line.set_word(1, ".Ltmp");
        assert_eq!(line.to_string(), "\tje\t.Ltmp");
    }

    #[test]
    fn test_crlf_file() {
        let text = "\tjne\t.LBB0_2\r\n.LBB0_2:\r\n\r\n\tretq\r\n";
        let file = read_assembly_file(text);
        assert_eq!(file.len(), 4);
        assert_eq!(file[0].word(1), ".LBB0_2");
        assert!(file[1].is_local_label());
        assert_eq!(file[1].label_name(), ".LBB0_2");
        assert!(file[2].is_comment_or_empty());
        assert_eq!(file[3].opcode(), Some("retq"));

        let mut out = String::new();
        write_lines(&mut out, &file);
        assert_eq!(out, text);
    }

    #[test]
    fn test_read_without_final_newline() {
        assert_eq!(read_assembly_file("\tnop\n\tretq").len(), 2);
        assert_eq!(read_assembly_file("\tnop\n\n").len(), 2);
        assert!(read_assembly_file("").is_empty());
    }
}
