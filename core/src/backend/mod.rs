//! Code-generation backends.
//!
//! A closed set of backends sits behind one tagged enum: no virtual
//! hierarchy, each backend owns its own code memory. All of them honor the
//! same contract: `compile` turns one IR block into a native entry point
//! `unsafe extern "C" fn(*mut CpuCore)` or declines with `None`, in which
//! case the execution loop single-steps the reference interpreter instead.

mod aarch64;
mod interpreter;
mod jit;

pub use aarch64::AArch64Backend;
pub use interpreter::InterpreterBackend;
pub use jit::JitBackend;

use crate::cpu::CpuCore;
use crate::cpu::block_cache::NativeEntry;
use crate::cpu::state::X86State;
use crate::ir::IrBlock;

/// Which backend a core runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// IR walker; always compiles.
    Interpreter,
    /// Native code via cranelift.
    Jit,
    /// Stub; never compiles, forcing the fallback path.
    AArch64,
}

/// Compile-time constants a backend may bake into generated code.
pub struct CompileContext {
    /// The owning thread's context pointer.
    pub ctx_ptr: *mut X86State,
    /// Guest RIP of the block entry.
    pub entry_rip: u64,
    /// Host base of the guest address space (for inline memory access).
    pub mem_base: *mut u8,
    /// The core, for host helper calls.
    pub core_ptr: *mut CpuCore,
}

/// The backend instance owned by a core.
pub enum Backend {
    /// IR-walking interpreter.
    Interpreter(InterpreterBackend),
    /// Cranelift JIT.
    Jit(JitBackend),
    /// AArch64 stub.
    AArch64(AArch64Backend),
}

impl Backend {
    /// Instantiates the requested backend.
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Interpreter => Backend::Interpreter(InterpreterBackend::new()),
            BackendKind::Jit => Backend::Jit(JitBackend::new()),
            BackendKind::AArch64 => Backend::AArch64(AArch64Backend::new()),
        }
    }

    /// Backend display name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Interpreter(_) => "Interpreter",
            Backend::Jit(_) => "JIT",
            Backend::AArch64(_) => "AArch64",
        }
    }

    /// Compiles one IR block; `None` means "not compilable here".
    pub fn compile(&mut self, ir: &IrBlock, ctx: &CompileContext) -> Option<NativeEntry> {
        match self {
            Backend::Interpreter(backend) => backend.compile(ir, ctx),
            Backend::Jit(backend) => backend.compile(ir, ctx),
            Backend::AArch64(backend) => backend.compile(ir, ctx),
        }
    }
}
