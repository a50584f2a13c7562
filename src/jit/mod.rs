//! Baseline JIT: composes precompiled stencils into executable code at runtime.
//!
//! - Executable memory allocation, shared between threads
//! - Bounds-checked section cursors
//! - Trait tables describing every bytecode kind
//! - The codegen driver and on-stack replacement entry
//! - Generic inline caches
//!
//! This module is only compiled when the `jit` feature is enabled.

pub mod code_block;
pub mod codebuf;
pub mod codegen;
pub mod context;
pub mod ic;
pub mod memory;
pub mod stencil_emitter;
pub mod traits;

pub use code_block::{BaselineCodeBlock, CodeBlock, SlowPathDataIndex};
pub use codegen::{
    CompiledEntry, JitError, RegionLayout, compile_for_on_stack_replacement,
    compile_function_to_baseline_jit,
};
pub use context::JitContext;
pub use ic::{CacheState, GenericIcSite, IcArena};
pub use memory::{JitMemoryAllocator, JitRegion, MemoryError};
pub use stencil_emitter::{CopyPatchEmitter, Hole, HoleKind, Section};
pub use traits::{BytecodeTrait, FunctionEntryTrait, TraitTables};
