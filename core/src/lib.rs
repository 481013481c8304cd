//! User-space x86-64 Linux binary emulator.
//!
//! The pipeline: guest bytes are fetched through the shared address space
//! ([`memmap`]), decoded against static instruction tables ([`x86`]), lifted
//! into a compact byte-buffer IR ([`ir`]), run through the pass managers, and
//! compiled by one of the [`backend`]s into a native entry point cached per
//! thread. Each guest thread runs on its own host thread ([`cpu`]); Linux
//! syscalls are serviced in-process by the [`hle`] layer. Instructions the
//! lifter cannot handle fall back to a single-step reference interpreter.

pub mod backend;
pub mod cpu;
pub mod hle;
pub mod ir;
pub mod loader;
pub mod memmap;
pub mod x86;

pub use cpu::CpuCore;
pub use loader::Core;
pub use memmap::Memmap;
