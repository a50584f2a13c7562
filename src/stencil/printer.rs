//! Reference AT&T assembly printer for [`IrFunction`].
//!
//! Output follows the shape of LLVM's x86-64 asm printer closely enough for
//! the ASM phase: one instruction per line, local block labels `.LBB<f>_<n>:`,
//! inline asm wrapped in `#APP`/`#NO_APP` with immediates printed in decimal,
//! and a `.Lfunc_end<f>:` footer.

use super::ir::{BlockId, Inst, IrFunction};

fn block_label(fn_index: usize, bb: BlockId) -> String {
    format!(".LBB{}_{}", fn_index, bb.0)
}

/// Split `op operands` into the tab-separated form LLVM prints.
fn format_instruction(text: &str) -> String {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((op, operands)) => format!("\t{}\t{}", op, operands.trim()),
        None => format!("\t{}", text),
    }
}

/// Turn one inline asm statement into what the assembler would print back.
fn normalize_inline_asm(stmt: &str) -> String {
    let stmt = stmt.replace("$$", "$");
    let normalized: Vec<String> = stmt
        .split(' ')
        .map(|tok| {
            let Some(hex) = tok.strip_prefix("$0x") else {
                return tok.to_string();
            };
            let (digits, suffix) = hex.split_at(hex.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(hex.len()));
            match u64::from_str_radix(digits, 16) {
                Ok(v) => format!("${}{}", v, suffix),
                Err(_) => tok.to_string(),
            }
        })
        .collect();
    format_instruction(&normalized.join(" "))
}

/// Print `f` as the `fn_index`-th function of a module.
pub fn print_function(f: &IrFunction, fn_index: usize) -> String {
    let mut printer = AsmPrinter::new(fn_index);
    printer.print(f);
    printer.output
}

struct AsmPrinter {
    output: String,
    fn_index: usize,
}

impl AsmPrinter {
    fn new(fn_index: usize) -> Self {
        Self {
            output: String::new(),
            fn_index,
        }
    }

    fn writeln(&mut self, s: &str) {
        self.output.push_str(s);
        self.output.push('\n');
    }

    fn label(&self, bb: BlockId) -> String {
        block_label(self.fn_index, bb)
    }

    fn print(&mut self, f: &IrFunction) {
        let name = &f.name;
        self.writeln("\t.text");
        self.writeln(&format!("\t.globl\t{}", name));
        self.writeln("\t.p2align\t4, 0x90");
        self.writeln(&format!("\t.type\t{},@function", name));
        self.writeln(&format!("{}:", name));
        self.writeln("\t.cfi_startproc");

        for bb in f.block_ids() {
            if bb == f.entry() {
                self.writeln("# %bb.0:");
            } else {
                let label = self.label(bb);
                self.writeln(&format!("{}:", label));
            }
            let next = BlockId(bb.0 + 1);
            for inst in &f.block(bb).insts {
                self.print_inst(inst, next);
            }
        }

        let fn_index = self.fn_index;
        self.writeln(&format!(".Lfunc_end{}:", fn_index));
        self.writeln(&format!("\t.size\t{}, .Lfunc_end{}-{}", name, fn_index, name));
        self.writeln("\t.cfi_endproc");
    }

    /// `next` is the block laid out right after the current one.
    fn print_inst(&mut self, inst: &Inst, next: BlockId) {
        match inst {
            Inst::Op(text) => self.writeln(&format_instruction(text)),
            Inst::InlineAsm(text) => {
                self.writeln("\t#APP");
                for stmt in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                    self.writeln(&normalize_inline_asm(stmt));
                }
                self.writeln("\t#NO_APP");
            }
            Inst::Br(target) => {
                if *target != next {
                    let line = format!("\tjmp\t{}", self.label(*target));
                    self.writeln(&line);
                }
            }
            Inst::CondBr {
                cond,
                taken,
                not_taken,
            } => {
                let line = format!("\tj{}\t{}", cond, self.label(*taken));
                self.writeln(&line);
                if *not_taken != next {
                    let line = format!("\tjmp\t{}", self.label(*not_taken));
                    self.writeln(&line);
                }
            }
            Inst::TailCall(callee) => self.writeln(&format!("\tjmp\t{}@PLT", callee)),
            Inst::Ret => self.writeln("\tretq"),
        }
    }
}
