//! AArch64 backend stub.
//!
//! Declining every block forces the per-thread loop onto the reference
//! interpreter, which keeps the emulator correct on hosts the code
//! generator does not target yet.

use super::CompileContext;
use crate::cpu::block_cache::NativeEntry;
use crate::ir::IrBlock;

/// Placeholder backend; compiles nothing.
#[derive(Default)]
pub struct AArch64Backend;

impl AArch64Backend {
    /// Creates the stub.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Always `None`.
    pub fn compile(&mut self, _ir: &IrBlock, _ctx: &CompileContext) -> Option<NativeEntry> {
        None
    }
}
