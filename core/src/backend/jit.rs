//! Native JIT backend on cranelift.
//!
//! Each IR block becomes one native function `fn(core_ptr)`. The owning
//! thread's context pointer and the guest memory base are baked in as
//! constants at compile time; every context access is a load/store at a
//! constant offset, and guest memory loads inline the single-add
//! `host = guest + base` translation the address-space invariant
//! guarantees. Syscalls call back into the HLE layer through an imported
//! host helper with a stack-allocated argument array.
//!
//! Control flow: a pre-scan collects the guest RIPs targeted by any
//! `CondJump`; RIP markers matching one of them open their own basic
//! block, and cond-jump edges connect straight to those blocks (backward
//! or forward). A `CondJump` whose target RIP lies outside the block keeps
//! the linear shape: the taken path stores RIP and returns.
//!
//! Within one guest instruction the lifter only references values it
//! created itself, so no SSA value ever crosses a marker-block boundary -
//! which is what lets the translation use plain cranelift values without a
//! variable layer.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    AbiParam, Block, InstBuilder, MemFlags, StackSlotData, StackSlotKind, Value, types,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};

use super::CompileContext;
use crate::cpu::CpuCore;
use crate::cpu::block_cache::NativeEntry;
use crate::hle::SyscallArguments;
use crate::ir::{IrBlock, IrInst, IrOp, IrRef, SYSCALL_MAX_ARGS, SelectCmp};

/// Host helper the generated code calls for `Syscall` records.
///
/// # Safety
///
/// Invoked only from generated blocks, with the live core pointer and a
/// pointer to a 7-slot argument array on the caller's stack.
unsafe extern "C" fn emu_jit_syscall(core: *mut CpuCore, args: *const u64) -> u64 {
    // SAFETY: caller contract above.
    let core = unsafe { &*core };
    // SAFETY: caller contract above.
    let raw = unsafe { std::slice::from_raw_parts(args, SYSCALL_MAX_ARGS) };
    let mut call = SyscallArguments {
        args: [0; SYSCALL_MAX_ARGS],
    };
    call.args.copy_from_slice(raw);
    core.syscalls().handle(&call)
}

/// The cranelift-backed JIT.
pub struct JitBackend {
    module: JITModule,
    builder_ctx: FunctionBuilderContext,
    syscall_func: FuncId,
    next_block_id: u64,
}

// SAFETY: the module's raw code-memory pointers make it !Send by default,
// but every mutation goes through the core's backend lock and finalized
// function pointers are valid process-wide for the module's lifetime.
unsafe impl Send for JitBackend {}

impl JitBackend {
    /// Creates the backend for the host ISA.
    #[must_use]
    pub fn new() -> Self {
        let mut jit_builder = match JITBuilder::new(cranelift_module::default_libcall_names()) {
            Ok(builder) => builder,
            Err(err) => emu_log::fatal(format_args!("could not create JIT builder: {err}")),
        };
        jit_builder.symbol("emu_jit_syscall", emu_jit_syscall as *const u8);
        let mut module = JITModule::new(jit_builder);

        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(types::I64));
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));
        let syscall_func = match module.declare_function("emu_jit_syscall", Linkage::Import, &sig) {
            Ok(id) => id,
            Err(err) => emu_log::fatal(format_args!("could not declare syscall helper: {err}")),
        };

        Self {
            module,
            builder_ctx: FunctionBuilderContext::new(),
            syscall_func,
            next_block_id: 0,
        }
    }

    /// Compiles one block; declines (with an error log) if codegen fails.
    pub fn compile(&mut self, ir: &IrBlock, ctx: &CompileContext) -> Option<NativeEntry> {
        let name = format!("block_{:x}_{}", ctx.entry_rip, self.next_block_id);
        self.next_block_id += 1;

        let mut codegen = self.module.make_context();
        codegen
            .func
            .signature
            .params
            .push(AbiParam::new(types::I64));

        let func_id = match self
            .module
            .declare_function(&name, Linkage::Export, &codegen.func.signature)
        {
            Ok(id) => id,
            Err(err) => {
                emu_log::error!("JIT declare failed for {name}: {err}");
                return None;
            }
        };

        {
            let mut builder = FunctionBuilder::new(&mut codegen.func, &mut self.builder_ctx);
            let mut translator = BlockTranslator::new(&mut builder, &mut self.module, self.syscall_func, ctx);
            translator.translate(ir);
            builder.seal_all_blocks();
            builder.finalize();
        }

        if let Err(err) = self.module.define_function(func_id, &mut codegen) {
            emu_log::error!("JIT compile failed for {name}: {err}");
            self.module.clear_context(&mut codegen);
            return None;
        }
        self.module.clear_context(&mut codegen);
        if let Err(err) = self.module.finalize_definitions() {
            emu_log::error!("JIT finalize failed for {name}: {err}");
            return None;
        }

        let code = self.module.get_finalized_function(func_id);
        // SAFETY: the finalized function was built with the NativeEntry
        // signature (one pointer-sized argument, no return).
        Some(unsafe { std::mem::transmute::<*const u8, NativeEntry>(code) })
    }
}

impl Default for JitBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-function translation state.
struct BlockTranslator<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    values: HashMap<IrRef, Value>,
    /// Blocks opened for RIPs that some CondJump targets.
    rip_blocks: HashMap<u64, Block>,
    /// Fall-through block of the innermost pending CondJump.
    pending_fall: Option<Block>,
    /// True while skipping a taken-path epilogue that was replaced by a
    /// direct edge to a marker block.
    skipping_taken_path: bool,
    ctx_base: Value,
    mem_base: Value,
    core_param: Value,
    syscall_ref: cranelift_codegen::ir::FuncRef,
}

impl<'a, 'b> BlockTranslator<'a, 'b> {
    fn new(
        builder: &'a mut FunctionBuilder<'b>,
        module: &mut JITModule,
        syscall_func: FuncId,
        ctx: &CompileContext,
    ) -> Self {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);

        let core_param = builder.block_params(entry)[0];
        let ctx_base = builder.ins().iconst(types::I64, ctx.ctx_ptr as i64);
        let mem_base = builder.ins().iconst(types::I64, ctx.mem_base as i64);
        let syscall_ref = module.declare_func_in_func(syscall_func, builder.func);

        Self {
            builder,
            values: HashMap::new(),
            rip_blocks: HashMap::new(),
            pending_fall: None,
            skipping_taken_path: false,
            ctx_base,
            mem_base,
            core_param,
            syscall_ref,
        }
    }

    fn value(&self, r: IrRef) -> Value {
        *self
            .values
            .get(&r)
            .unwrap_or_else(|| panic!("JIT referenced undefined IR value %{}", r.0))
    }

    fn load_ctx(&mut self, offset: u32) -> Value {
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), self.ctx_base, offset as i32)
    }

    fn store_ctx(&mut self, offset: u32, value: Value) {
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, self.ctx_base, offset as i32);
    }

    /// Emits the whole function body.
    fn translate(&mut self, ir: &IrBlock) {
        // Pre-scan: which RIPs are branch targets, and which of those have
        // markers in this block.
        let mut target_rips: Vec<u64> = Vec::new();
        for (_, inst) in ir.iter() {
            if let IrInst::CondJump { rip_target, .. } = inst {
                target_rips.push(rip_target);
            }
        }
        for (_, inst) in ir.iter() {
            if let IrInst::RipMarker { rip } = inst {
                if target_rips.contains(&rip) && !self.rip_blocks.contains_key(&rip) {
                    let block = self.builder.create_block();
                    self.rip_blocks.insert(rip, block);
                }
            }
        }

        for (offset, inst) in ir.iter() {
            if self.skipping_taken_path {
                // The direct-edge CondJump already encoded the taken path;
                // drop its epilogue records up to the fall-through label.
                if matches!(inst, IrInst::JmpTarget) {
                    let fall = self.pending_fall.take().expect("fall block pending");
                    self.builder.switch_to_block(fall);
                    self.skipping_taken_path = false;
                }
                continue;
            }
            self.translate_inst(ir, offset, inst);
        }
    }

    fn translate_inst(&mut self, _ir: &IrBlock, offset: IrRef, inst: IrInst) {
        match inst {
            IrInst::BeginBlock => {}
            IrInst::RipMarker { rip } => {
                if let Some(&block) = self.rip_blocks.get(&rip) {
                    // Fall into the marker's own block.
                    self.builder.ins().jump(block, &[]);
                    self.builder.switch_to_block(block);
                }
            }
            IrInst::EndBlock { rip_increment } => {
                let rip = self.load_ctx(crate::cpu::state::X86State::RIP_OFFSET as u32);
                let bumped = self.builder.ins().iadd_imm(rip, rip_increment as i64);
                self.store_ctx(crate::cpu::state::X86State::RIP_OFFSET as u32, bumped);
                self.builder.ins().return_(&[]);
            }
            IrInst::JmpTarget => {
                if let Some(fall) = self.pending_fall.take() {
                    self.builder.switch_to_block(fall);
                }
            }
            IrInst::CondJump {
                cond,
                target: _,
                rip_target,
            } => {
                let cond_value = self.value(cond);
                let fall = self.builder.create_block();
                if let Some(&target_block) = self.rip_blocks.get(&rip_target) {
                    // Direct edge: the branch lands inside this function.
                    // cond != 0 means fall through; zero means taken.
                    self.builder
                        .ins()
                        .brif(cond_value, fall, &[], target_block, &[]);
                    self.pending_fall = Some(fall);
                    self.skipping_taken_path = true;
                } else {
                    let taken = self.builder.create_block();
                    self.builder.ins().brif(cond_value, fall, &[], taken, &[]);
                    self.builder.switch_to_block(taken);
                    self.pending_fall = Some(fall);
                }
            }
            IrInst::Constant { value } => {
                let v = self.builder.ins().iconst(types::I64, value as i64);
                self.values.insert(offset, v);
            }
            IrInst::LoadContext { size, offset: ctx } => {
                emu_log::throw_assert!(size == 8, "JIT LoadContext only handles 8-byte slots");
                let v = self.load_ctx(ctx);
                self.values.insert(offset, v);
            }
            IrInst::StoreContext {
                size,
                offset: ctx,
                arg,
            } => {
                emu_log::throw_assert!(size == 8, "JIT StoreContext only handles 8-byte slots");
                let v = self.value(arg);
                self.store_ctx(ctx, v);
            }
            IrInst::LoadMem { size, base, index } => {
                let mut guest = self.value(base);
                if !index.is_invalid() {
                    let i = self.value(index);
                    guest = self.builder.ins().iadd(guest, i);
                }
                // Direct-mapped fast path: host = guest + base.
                let host = self.builder.ins().iadd(guest, self.mem_base);
                let v = match size {
                    4 => {
                        let narrow =
                            self.builder
                                .ins()
                                .load(types::I32, MemFlags::trusted(), host, 0);
                        self.builder.ins().uextend(types::I64, narrow)
                    }
                    8 => self
                        .builder
                        .ins()
                        .load(types::I64, MemFlags::trusted(), host, 0),
                    _ => emu_log::fatal(format_args!("unhandled JIT LoadMem size {size}")),
                };
                self.values.insert(offset, v);
            }
            IrInst::Bin { op, args } => {
                let a = self.value(args[0]);
                let b = self.value(args[1]);
                let v = match op {
                    IrOp::Add => self.builder.ins().iadd(a, b),
                    IrOp::Sub => self.builder.ins().isub(a, b),
                    IrOp::Or => self.builder.ins().bor(a, b),
                    IrOp::Xor => self.builder.ins().bxor(a, b),
                    IrOp::Shl => self.builder.ins().ishl(a, b),
                    IrOp::Shr => self.builder.ins().ushr(a, b),
                    IrOp::And => self.builder.ins().band(a, b),
                    IrOp::Nand => {
                        let inverted = self.builder.ins().bnot(b);
                        self.builder.ins().band(a, inverted)
                    }
                    IrOp::BitExtract => {
                        let shifted = self.builder.ins().ushr(a, b);
                        self.builder.ins().band_imm(shifted, 1)
                    }
                    _ => unreachable!("non-binary op decoded as Bin"),
                };
                self.values.insert(offset, v);
            }
            IrInst::Select { cmp, args } => {
                let a = self.value(args[0]);
                let b = self.value(args[1]);
                let t = self.value(args[2]);
                let f = self.value(args[3]);
                let code = match cmp {
                    SelectCmp::Eq => IntCC::Equal,
                    SelectCmp::Neq => IntCC::NotEqual,
                };
                let hit = self.builder.ins().icmp(code, a, b);
                let v = self.builder.ins().select(hit, t, f);
                self.values.insert(offset, v);
            }
            IrInst::Trunc16 { arg } => {
                let v = self.value(arg);
                let v = self.builder.ins().band_imm(v, 0xFFFF);
                self.values.insert(offset, v);
            }
            IrInst::Trunc32 { arg } => {
                let v = self.value(arg);
                let v = self.builder.ins().band_imm(v, 0xFFFF_FFFF);
                self.values.insert(offset, v);
            }
            IrInst::Syscall { args } => {
                let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    (SYSCALL_MAX_ARGS * 8) as u32,
                    3,
                ));
                for (i, arg) in args.iter().enumerate() {
                    let v = self.value(*arg);
                    self.builder.ins().stack_store(v, slot, (i * 8) as i32);
                }
                let args_ptr = self.builder.ins().stack_addr(types::I64, slot, 0);
                let call = self
                    .builder
                    .ins()
                    .call(self.syscall_ref, &[self.core_param, args_ptr]);
                let result = self.builder.inst_results(call)[0];
                self.values.insert(offset, result);
            }
            IrInst::Jump { .. } | IrInst::Return | IrInst::Call { .. } | IrInst::ExternCall { .. } => {
                emu_log::fatal(format_args!("JIT hit unimplemented IR op at %{}", offset.0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::state::{X86State, reg};

    fn compile_and_run(ir: &IrBlock, state: &mut X86State) {
        let mut backend = JitBackend::new();
        let ctx = CompileContext {
            ctx_ptr: std::ptr::from_mut(state),
            entry_rip: state.rip,
            mem_base: std::ptr::null_mut(),
            core_ptr: std::ptr::null_mut(),
        };
        let entry = backend.compile(ir, &ctx).expect("JIT must compile");
        // SAFETY: the block touches only the context record; no syscalls,
        // no memory loads, so the null core/mem pointers are never used.
        unsafe { entry(std::ptr::null_mut()) };
    }

    #[test]
    fn add_constant_updates_context_and_rip() {
        // rax += 5; rip += 7
        let mut ir = IrBlock::new();
        ir.push_begin_block();
        ir.push_rip_marker(0x1000);
        let load = ir.push_load_context(8, X86State::greg_offset(reg::RAX) as u32);
        let five = ir.push_constant(5);
        let sum = ir.push_bin(IrOp::Add, load, five);
        ir.push_store_context(8, X86State::greg_offset(reg::RAX) as u32, sum);
        ir.push_end_block(7);

        let mut state = X86State::new();
        state.rip = 0x1000;
        state.gregs[reg::RAX] = 10;
        compile_and_run(&ir, &mut state);
        assert_eq!(state.gregs[reg::RAX], 15);
        assert_eq!(state.rip, 0x1007);
    }

    #[test]
    fn cond_jump_skips_taken_path_when_nonzero() {
        // cond != 0 jumps to the fall-through label; the taken path would
        // store a new RIP and return.
        let mut ir = IrBlock::new();
        ir.push_begin_block();
        ir.push_rip_marker(0x2000);
        let cond = ir.push_constant(1);
        let cj = ir.push_cond_jump(cond, 0x3000);
        let target = ir.push_constant(0x3000);
        ir.push_store_context(8, X86State::RIP_OFFSET as u32, target);
        ir.push_end_block(0);
        let jt = ir.push_jmp_target();
        ir.patch_cond_jump_target(cj, jt);
        let one = ir.push_constant(1);
        ir.push_store_context(8, X86State::greg_offset(reg::RBX) as u32, one);
        ir.push_end_block(4);

        let mut state = X86State::new();
        state.rip = 0x2000;
        compile_and_run(&ir, &mut state);
        // Fall-through path taken: rbx written, rip advanced by 4.
        assert_eq!(state.gregs[reg::RBX], 1);
        assert_eq!(state.rip, 0x2004);
    }

    #[test]
    fn cond_jump_taken_path_sets_rip() {
        let mut ir = IrBlock::new();
        ir.push_begin_block();
        ir.push_rip_marker(0x2000);
        let cond = ir.push_constant(0);
        let cj = ir.push_cond_jump(cond, 0x3000);
        let target = ir.push_constant(0x3000);
        ir.push_store_context(8, X86State::RIP_OFFSET as u32, target);
        ir.push_end_block(0);
        let jt = ir.push_jmp_target();
        ir.patch_cond_jump_target(cj, jt);
        ir.push_end_block(4);

        let mut state = X86State::new();
        state.rip = 0x2000;
        compile_and_run(&ir, &mut state);
        assert_eq!(state.rip, 0x3000, "taken path must store the branch target");
    }
}
