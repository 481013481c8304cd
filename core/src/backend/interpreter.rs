//! IR-walking interpreter backend.
//!
//! `compile` hands back one fixed trampoline for every block. When invoked,
//! the trampoline locates the current thread through the thread-local slot,
//! fetches the cached IR block for the thread's current RIP, and walks it
//! with a per-evaluation value table keyed by IR offset.

use std::collections::BTreeMap;

use super::CompileContext;
use crate::cpu::block_cache::NativeEntry;
use crate::cpu::{CpuCore, with_current_thread};
use crate::ir::{IrBlock, IrInst, IrOp, IrRef, SYSCALL_MAX_ARGS, SelectCmp};

/// The interpreter backend. Stateless; all evaluation state is per call.
#[derive(Default)]
pub struct InterpreterBackend;

impl InterpreterBackend {
    /// Creates the backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Every block "compiles" to the same trampoline.
    pub fn compile(&mut self, _ir: &IrBlock, _ctx: &CompileContext) -> Option<NativeEntry> {
        Some(interpreter_trampoline)
    }
}

/// Native entry for every interpreted block.
///
/// # Safety
///
/// Called only from the execution loop with the owning core pointer and
/// the current-thread slot installed.
unsafe extern "C" fn interpreter_trampoline(core: *mut CpuCore) {
    with_current_thread(|thread| {
        // SAFETY: trampoline contract: we are the owning thread.
        let state = unsafe { thread.state_mut() };
        let rip = state.rip;
        // SAFETY: same contract.
        let ir_cache = unsafe { thread.ir_cache_mut() };
        let Some(ir) = ir_cache.get(&rip) else {
            emu_log::fatal(format_args!(
                "interpreter invoked without a cached IR block for rip {rip:#x}"
            ));
        };
        // SAFETY: the core pointer is valid for the duration of the run loop.
        let core = unsafe { &*core };
        walk_block(core, state, ir);
    });
}

/// Executes one IR block against the architectural state.
fn walk_block(core: &CpuCore, state: &mut crate::cpu::state::X86State, ir: &IrBlock) {
    let mut values: BTreeMap<IrRef, u64> = BTreeMap::new();
    let value = |values: &BTreeMap<IrRef, u64>, r: IrRef| -> u64 {
        values.get(&r).copied().unwrap_or(0)
    };

    let mut offset = IrRef(0);
    let len = ir.len() as u32;
    while offset.0 < len {
        let op = ir.op_at(offset);
        let mut next = IrRef(offset.0 + op.size() as u32);

        match ir.inst_at(offset) {
            IrInst::BeginBlock | IrInst::RipMarker { .. } | IrInst::JmpTarget => {}
            IrInst::EndBlock { rip_increment } => {
                // A mid-stream EndBlock means a taken branch already stored
                // RIP; either way the walk is over.
                state.rip = state.rip.wrapping_add(rip_increment);
                return;
            }
            IrInst::CondJump { cond, target, .. } => {
                if value(&values, cond) != 0 {
                    next = target;
                }
            }
            IrInst::Constant { value: v } => {
                values.insert(offset, v);
            }
            IrInst::LoadContext { size, offset: ctx } => {
                emu_log::throw_assert!(size == 8, "LoadContext only handles 8-byte slots");
                let slot = context_slot(state, ctx);
                values.insert(offset, *slot);
            }
            IrInst::StoreContext {
                size,
                offset: ctx,
                arg,
            } => {
                emu_log::throw_assert!(size == 8, "StoreContext only handles 8-byte slots");
                let v = value(&values, arg);
                *context_slot(state, ctx) = v;
            }
            IrInst::LoadMem { size, base, index } => {
                let mut addr = value(&values, base);
                if !index.is_invalid() {
                    addr = addr.wrapping_add(value(&values, index));
                }
                let loaded = match size {
                    4 => core.mem().read_u32(addr).map(u64::from),
                    8 => core.mem().read_u64(addr),
                    _ => emu_log::fatal(format_args!("unhandled LoadMem size {size}")),
                };
                let Some(loaded) = loaded else {
                    emu_log::error!("LoadMem from unmapped guest address {addr:#x}");
                    values.insert(offset, 0);
                    offset = next;
                    continue;
                };
                values.insert(offset, loaded);
            }
            IrInst::Bin { op, args } => {
                let a = value(&values, args[0]);
                let b = value(&values, args[1]);
                let result = match op {
                    IrOp::Add => a.wrapping_add(b),
                    IrOp::Sub => a.wrapping_sub(b),
                    IrOp::Or => a | b,
                    IrOp::Xor => a ^ b,
                    IrOp::Shl => a.wrapping_shl(b as u32),
                    IrOp::Shr => a.wrapping_shr(b as u32),
                    IrOp::And => a & b,
                    IrOp::Nand => a & !b,
                    IrOp::BitExtract => (a >> b) & 1,
                    _ => unreachable!("non-binary op decoded as Bin"),
                };
                values.insert(offset, result);
            }
            IrInst::Select { cmp, args } => {
                let a = value(&values, args[0]);
                let b = value(&values, args[1]);
                let hit = match cmp {
                    SelectCmp::Eq => a == b,
                    SelectCmp::Neq => a != b,
                };
                let chosen = if hit { args[2] } else { args[3] };
                let v = value(&values, chosen);
                values.insert(offset, v);
            }
            IrInst::Trunc16 { arg } => {
                let v = value(&values, arg) & 0xFFFF;
                values.insert(offset, v);
            }
            IrInst::Trunc32 { arg } => {
                let v = value(&values, arg) & 0xFFFF_FFFF;
                values.insert(offset, v);
            }
            IrInst::Syscall { args } => {
                let mut call = crate::hle::SyscallArguments {
                    args: [0; SYSCALL_MAX_ARGS],
                };
                for (slot, arg) in call.args.iter_mut().zip(args.iter()) {
                    *slot = value(&values, *arg);
                }
                let result = core.syscalls().handle(&call);
                values.insert(offset, result);
            }
            IrInst::Jump { .. } | IrInst::Return | IrInst::Call { .. } | IrInst::ExternCall { .. } => {
                emu_log::fatal(format_args!(
                    "interpreter hit unimplemented IR op {}",
                    op.name()
                ));
            }
        }

        offset = next;
    }
}

fn context_slot(state: &mut crate::cpu::state::X86State, offset: u32) -> &mut u64 {
    let base: *mut crate::cpu::state::X86State = state;
    // SAFETY: offsets come from the lifter, which only emits slot offsets
    // inside X86State; every slot is a naturally aligned u64.
    unsafe { &mut *(base.cast::<u8>().add(offset as usize)).cast::<u64>() }
}
