//! Code blocks: the bytecode of one function instance and, once compiled,
//! its baseline JIT code.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use super::codegen::RegionLayout;
use super::memory::JitRegion;
use super::traits::SLOW_PATH_DATA_HEADER_LEN;

pub struct CodeBlock {
    name: String,
    /// Bytecode stream, ending with the terminator opcode
    bytecode: Vec<u8>,
    num_fixed_args: usize,
    is_variadic: bool,
    interpreter_entry: usize,
    best_entry_point: AtomicUsize,
    baseline: OnceLock<Arc<BaselineCodeBlock>>,
}

impl CodeBlock {
    pub fn new(
        name: impl Into<String>,
        bytecode: Vec<u8>,
        num_fixed_args: usize,
        is_variadic: bool,
        interpreter_entry: usize,
    ) -> Self {
        Self {
            name: name.into(),
            bytecode,
            num_fixed_args,
            is_variadic,
            interpreter_entry,
            best_entry_point: AtomicUsize::new(interpreter_entry),
            baseline: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn num_fixed_args(&self) -> usize {
        self.num_fixed_args
    }

    pub fn is_variadic(&self) -> bool {
        self.is_variadic
    }

    pub fn interpreter_entry(&self) -> usize {
        self.interpreter_entry
    }

    /// Address of the bytecode at `offset`.
    pub fn bytecode_ptr(&self, offset: usize) -> usize {
        self.bytecode.as_ptr() as usize + offset
    }

    /// Low 32 bits of [`Self::bytecode_ptr`].
    pub fn bytecode_ptr32(&self, offset: usize) -> u32 {
        self.bytecode_ptr(offset) as u32
    }

    /// The fastest available entry: JIT code once compiled, the interpreter before.
    pub fn best_entry_point(&self) -> usize {
        self.best_entry_point.load(Ordering::Acquire)
    }

    pub fn baseline(&self) -> Option<&Arc<BaselineCodeBlock>> {
        self.baseline.get()
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.get().is_some()
    }

    /// Install compiled code and switch the entry point over to it.
    ///
    /// Only the first publication takes effect. Returns the installed code
    /// and whether it is `baseline`.
    pub(super) fn publish(&self, baseline: Arc<BaselineCodeBlock>) -> (Arc<BaselineCodeBlock>, bool) {
        let mut installed = false;
        let winner = self
            .baseline
            .get_or_init(|| {
                installed = true;
                baseline
            })
            .clone();
        if installed {
            self.best_entry_point.store(winner.jit_entry(), Ordering::Release);
        }
        (winner, installed)
    }
}

impl std::fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBlock")
            .field("name", &self.name)
            .field("bytecode_len", &self.bytecode.len())
            .field("num_fixed_args", &self.num_fixed_args)
            .field("is_variadic", &self.is_variadic)
            .field("has_baseline", &self.has_baseline())
            .finish()
    }
}

/// One entry per bytecode, in bytecode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowPathDataIndex {
    pub bytecode_ptr32: u32,
    pub slow_path_data_offset: u32,
}

/// Binary search the index for the bytecode at `ptr32`.
///
/// Pointers are compared as offsets from `base_ptr32` so a stream that
/// crosses a 4 GiB boundary still sorts correctly.
pub fn find_bytecode_index(index: &[SlowPathDataIndex], base_ptr32: u32, ptr32: u32) -> Option<usize> {
    let key = ptr32.wrapping_sub(base_ptr32);
    index
        .binary_search_by_key(&key, |e| e.bytecode_ptr32.wrapping_sub(base_ptr32))
        .ok()
}

/// Is the index strictly increasing in both fields?
pub fn index_is_strictly_increasing(index: &[SlowPathDataIndex], base_ptr32: u32) -> bool {
    index.windows(2).all(|w| {
        w[0].bytecode_ptr32.wrapping_sub(base_ptr32) < w[1].bytecode_ptr32.wrapping_sub(base_ptr32)
            && w[0].slow_path_data_offset < w[1].slow_path_data_offset
    })
}

/// Read the header at the start of one bytecode's slow-path data.
pub fn read_slow_path_data_header(data: &[u8], offset: usize) -> (u16, u32) {
    let h = &data[offset..offset + SLOW_PATH_DATA_HEADER_LEN];
    let opcode = u16::from_le_bytes([h[0], h[1]]);
    let jit_addr = u32::from_le_bytes([h[2], h[3], h[4], h[5]]);
    (opcode, jit_addr)
}

/// Baseline JIT code of one function instance.
#[derive(Debug)]
pub struct BaselineCodeBlock {
    region: JitRegion,
    layout: RegionLayout,
    slow_path_data: Vec<u8>,
    index: Vec<SlowPathDataIndex>,
    base_ptr32: u32,
}

impl BaselineCodeBlock {
    pub(super) fn new(
        region: JitRegion,
        layout: RegionLayout,
        slow_path_data: Vec<u8>,
        index: Vec<SlowPathDataIndex>,
        base_ptr32: u32,
    ) -> Self {
        Self {
            region,
            layout,
            slow_path_data,
            index,
            base_ptr32,
        }
    }

    pub fn region_addr(&self) -> usize {
        self.region.addr()
    }

    /// Absolute address of the function entry (the fast path start).
    pub fn jit_entry(&self) -> usize {
        self.region.addr() + self.layout.fast_path_offset
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// The whole region: data section, fast path, slow path and paddings.
    pub fn code(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn slow_path_data(&self) -> &[u8] {
        &self.slow_path_data
    }

    pub fn index(&self) -> &[SlowPathDataIndex] {
        &self.index
    }

    pub fn num_bytecodes(&self) -> usize {
        self.index.len()
    }

    pub fn find_bytecode_index(&self, ptr32: u32) -> Option<usize> {
        find_bytecode_index(&self.index, self.base_ptr32, ptr32)
    }

    pub fn opcode_of(&self, bytecode_index: usize) -> u16 {
        let offset = self.index[bytecode_index].slow_path_data_offset as usize;
        read_slow_path_data_header(&self.slow_path_data, offset).0
    }

    /// Region-relative address of the fast path of the `bytecode_index`-th bytecode.
    pub fn jit_offset_of(&self, bytecode_index: usize) -> u32 {
        let offset = self.index[bytecode_index].slow_path_data_offset as usize;
        read_slow_path_data_header(&self.slow_path_data, offset).1
    }

    /// Absolute address to jump to for the bytecode at `ptr32`.
    pub fn jit_address_for_bytecode(&self, ptr32: u32) -> Option<usize> {
        self.find_bytecode_index(ptr32)
            .map(|i| self.region.addr() + self.jit_offset_of(i) as usize)
    }
}
