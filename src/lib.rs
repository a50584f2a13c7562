//! copa - copy-and-patch code generation
//!
//! This library provides the stencil lowering pass, which turns a compiled
//! bytecode implementation into a fast path / slow path template, and the
//! baseline JIT that stitches those templates together at runtime.

pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod stencil;

// Re-export commonly used types
pub use config::{Config, JitConfig, LoweringConfig};
pub use stencil::{LoweringError, StencilLoweringPass};
