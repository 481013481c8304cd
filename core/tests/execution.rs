//! End-to-end dispatch tests.
//!
//! Each test builds a core over a real shared address space, places raw
//! machine code at a known guest address, and drives thread 1 through
//! `run_once`: the same find-or-compile-or-fallback path the execution
//! loop uses. The clone test additionally lets the spawned child run on
//! its own host thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use emu_core::backend::BackendKind;
use emu_core::cpu::state::{X86State, flag_bit, reg};
use emu_core::cpu::{CpuCore, ThreadState};
use emu_core::memmap::Memmap;

const CODE_BASE: u64 = 0x10000;
const STACK_BASE: u64 = 0x200000;
const STACK_SIZE: u64 = 0x100000;
const SCRATCH_BASE: u64 = 0x400000;

struct Harness {
    core: Arc<CpuCore>,
    thread: Arc<ThreadState>,
}

impl Harness {
    fn new(backend: BackendKind, code: &[u8]) -> Self {
        let mut mem = Memmap::new();
        mem.allocate(1 << 31).expect("shm allocation failed");
        let mem = Arc::new(mem);
        mem.map_region(CODE_BASE, 0x10000).expect("code region");
        mem.map_region(STACK_BASE, STACK_SIZE).expect("stack region");
        mem.map_region(SCRATCH_BASE, 0x10000).expect("scratch region");
        assert!(mem.write_bytes(CODE_BASE, code), "code must fit the region");

        let core = CpuCore::new(Arc::clone(&mem), backend);
        let mut state = X86State::new();
        state.rip = CODE_BASE;
        state.gregs[reg::RSP] = STACK_BASE + STACK_SIZE - 0x100;
        let thread = CpuCore::init_thread(&core, state);
        Self { core, thread }
    }

    /// One find-or-compile-or-fallback dispatch.
    fn step(&self) {
        CpuCore::run_once(&self.core, &self.thread);
    }

    fn state(&self) -> X86State {
        // SAFETY: the spawned execution thread stays parked at its start
        // barrier for the whole test; this test thread is the only one
        // driving dispatch.
        unsafe { self.thread.state_mut() }.clone()
    }

    fn state_mut(&self) -> &mut X86State {
        // SAFETY: see `state`.
        unsafe { self.thread.state_mut() }
    }
}

// ---------------------------------------------------------------------------
// Spec scenarios, on the interpreter backend
// ---------------------------------------------------------------------------

#[test]
fn register_move() {
    // mov rax, rcx
    let h = Harness::new(BackendKind::Interpreter, &[0x48, 0x89, 0xC8]);
    h.state_mut().gregs[reg::RCX] = 0xDEAD_BEEF;
    h.step();
    let state = h.state();
    assert_eq!(state.gregs[reg::RAX], 0xDEAD_BEEF);
    assert_eq!(state.rip, CODE_BASE + 3, "rip advances by the block length");
}

#[test]
fn xor_zero() {
    // xor eax, eax
    let h = Harness::new(BackendKind::Interpreter, &[0x31, 0xC0]);
    h.state_mut().gregs[reg::RAX] = 0xFFFF_FFFF_FFFF_FFFF;
    h.step();
    assert_eq!(h.state().gregs[reg::RAX], 0);
}

#[test]
fn add_immediate() {
    // add rax, 5
    let h = Harness::new(BackendKind::Interpreter, &[0x48, 0x83, 0xC0, 0x05]);
    h.state_mut().gregs[reg::RAX] = 10;
    h.step();
    let state = h.state();
    assert_eq!(state.gregs[reg::RAX], 15);
    assert_eq!(state.rflags >> flag_bit::ZF & 1, 0, "nonzero result clears ZF");
}

#[test]
fn conditional_branch_falls_through_on_equal() {
    // cmp eax, ebx; jne +5; mov eax, 1; L1: mov ebx, 2
    let code = [
        0x39, 0xD8, // cmp eax, ebx
        0x75, 0x05, // jne L1
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xBB, 0x02, 0x00, 0x00, 0x00, // L1: mov ebx, 2
    ];
    let h = Harness::new(BackendKind::Interpreter, &code);
    h.state_mut().gregs[reg::RAX] = 7;
    h.state_mut().gregs[reg::RBX] = 7;
    h.step();
    let state = h.state();
    assert_eq!(state.gregs[reg::RAX], 1, "equal operands: JNE not taken");
    assert_eq!(state.gregs[reg::RBX], 2);
}

#[test]
fn conditional_branch_taken_on_not_equal() {
    let code = [
        0x39, 0xD8, // cmp eax, ebx
        0x75, 0x05, // jne L1
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xBB, 0x02, 0x00, 0x00, 0x00, // L1: mov ebx, 2
    ];
    let h = Harness::new(BackendKind::Interpreter, &code);
    h.state_mut().gregs[reg::RAX] = 7;
    h.state_mut().gregs[reg::RBX] = 9;
    h.step();
    let state = h.state();
    assert_eq!(state.gregs[reg::RAX], 7, "taken branch skips mov eax, 1");
    assert_eq!(state.rip, CODE_BASE + 9, "taken branch lands on L1");
}

#[test]
fn getuid_syscall_returns_fixed_identity() {
    // mov eax, 102; syscall
    let code = [0xB8, 0x66, 0x00, 0x00, 0x00, 0x0F, 0x05];
    let h = Harness::new(BackendKind::Interpreter, &code);
    h.step();
    let state = h.state();
    assert_eq!(state.gregs[reg::RAX], 1, "HLE identity is fixed at 1");
    assert_eq!(state.rip, CODE_BASE + 7, "syscall stores the successor RIP");
}

#[test]
fn lock_prefix_always_falls_back() {
    // lock inc dword [rax]: never lifted; the reference interpreter
    // executes it.
    let code = [0xF0, 0xFF, 0x00];
    let h = Harness::new(BackendKind::Interpreter, &code);
    h.state_mut().gregs[reg::RAX] = SCRATCH_BASE;
    h.core.mem().write_u32(SCRATCH_BASE, 41);
    h.step();
    assert_eq!(h.core.mem().read_u32(SCRATCH_BASE), Some(42));
    assert_eq!(h.state().rip, CODE_BASE + 3);
}

#[test]
fn unsupported_instruction_single_steps_then_block_resumes() {
    // push rcx (not liftable: no store-to-memory IR op) then mov rax, rcx.
    let code = [0x51, 0x48, 0x89, 0xC8];
    let h = Harness::new(BackendKind::Interpreter, &code);
    h.state_mut().gregs[reg::RCX] = 0x1234;
    let rsp_before = h.state().gregs[reg::RSP];

    h.step(); // fallback: push rcx
    let state = h.state();
    assert_eq!(state.gregs[reg::RSP], rsp_before - 8);
    assert_eq!(h.core.mem().read_u64(state.gregs[reg::RSP]), Some(0x1234));
    assert_eq!(state.rip, CODE_BASE + 1);

    h.step(); // lifted block: mov rax, rcx
    assert_eq!(h.state().gregs[reg::RAX], 0x1234);
}

#[test]
fn stub_backend_runs_everything_on_the_reference() {
    let h = Harness::new(BackendKind::AArch64, &[0x48, 0x89, 0xC8]); // mov rax, rcx
    h.state_mut().gregs[reg::RCX] = 77;
    h.step();
    assert_eq!(h.state().gregs[reg::RAX], 77);
    assert_eq!(h.state().rip, CODE_BASE + 3);
}

// ---------------------------------------------------------------------------
// Interpreter / JIT equivalence
// ---------------------------------------------------------------------------

fn run_on(backend: BackendKind, code: &[u8], seed: impl Fn(&mut X86State), steps: usize) -> X86State {
    let h = Harness::new(backend, code);
    seed(h.state_mut());
    for _ in 0..steps {
        h.step();
    }
    h.state()
}

fn assert_equivalent(code: &[u8], seed: impl Fn(&mut X86State) + Copy, steps: usize) {
    let interp = run_on(BackendKind::Interpreter, code, seed, steps);
    let jit = run_on(BackendKind::Jit, code, seed, steps);
    assert_eq!(interp.rip, jit.rip, "rip diverged for {code:02x?}");
    assert_eq!(interp.rflags, jit.rflags, "rflags diverged for {code:02x?}");
    for i in 0..16 {
        assert_eq!(
            interp.gregs[i], jit.gregs[i],
            "{} diverged for {code:02x?}",
            reg::name(i)
        );
    }
}

#[test]
fn jit_matches_interpreter_on_lifted_blocks() {
    // Register move.
    assert_equivalent(&[0x48, 0x89, 0xC8], |s| s.gregs[reg::RCX] = 0xDEAD_BEEF, 1);
    // XOR-zero with flag writes.
    assert_equivalent(&[0x31, 0xC0], |s| s.gregs[reg::RAX] = !0, 1);
    // Add immediate.
    assert_equivalent(&[0x48, 0x83, 0xC0, 0x05], |s| s.gregs[reg::RAX] = 10, 1);
    // ALU chain with 32-bit truncation.
    assert_equivalent(
        &[
            0xB8, 0xFF, 0xFF, 0xFF, 0xFF, // mov eax, 0xFFFFFFFF
            0x83, 0xC0, 0x02, // add eax, 2 (wraps in 32 bits)
            0x89, 0xC3, // mov ebx, eax
        ],
        |_| {},
        1,
    );
    // Conditional branch, both directions.
    let branchy = [
        0x39u8, 0xD8, // cmp eax, ebx
        0x75, 0x05, // jne +5
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xBB, 0x02, 0x00, 0x00, 0x00, // mov ebx, 2
    ];
    assert_equivalent(
        &branchy,
        |s| {
            s.gregs[reg::RAX] = 7;
            s.gregs[reg::RBX] = 7;
        },
        2,
    );
    assert_equivalent(
        &branchy,
        |s| {
            s.gregs[reg::RAX] = 7;
            s.gregs[reg::RBX] = 9;
        },
        2,
    );
    // RET through a prepared stack.
    assert_equivalent(&[0xC3], |s| s.gregs[reg::RSP] = STACK_BASE + 0x800, 1);
    // Syscall (gettid).
    assert_equivalent(&[0xB8, 0xBA, 0x00, 0x00, 0x00, 0x0F, 0x05], |_| {}, 1);
}

// ---------------------------------------------------------------------------
// Lifted-IR invariants
// ---------------------------------------------------------------------------

#[test]
fn lifted_blocks_end_with_endblock_and_reference_backwards() {
    use emu_core::ir::{IrInst, IrOp, IrRef};

    // A block exercising flags, branches and a syscall.
    let code = [
        0x39, 0xD8, // cmp eax, ebx
        0x75, 0x05, // jne +5
        0xB8, 0x66, 0x00, 0x00, 0x00, // mov eax, 102
        0x0F, 0x05, // syscall
    ];
    let h = Harness::new(BackendKind::Interpreter, &code);
    h.step();

    // SAFETY: only this test thread drives the parked guest thread.
    let ir_cache = unsafe { h.thread.ir_cache_mut() };
    let ir = ir_cache.get(&CODE_BASE).expect("block was lifted");

    // The final record is the block's EndBlock.
    let records: Vec<(IrRef, IrInst)> = ir.iter().collect();
    let (last_at, last) = records.last().expect("block not empty");
    assert!(matches!(last, IrInst::EndBlock { .. }), "last record: {last:?}");
    assert_eq!(
        last_at.0 as usize + IrOp::EndBlock.size(),
        ir.len(),
        "nothing follows the final EndBlock"
    );

    // Every value operand refers to an earlier record.
    for (at, inst) in &records {
        let operands: Vec<IrRef> = match *inst {
            IrInst::Bin { args, .. } => args.to_vec(),
            IrInst::Select { args, .. } => args.to_vec(),
            IrInst::StoreContext { arg, .. } => vec![arg],
            IrInst::Trunc16 { arg } | IrInst::Trunc32 { arg } => vec![arg],
            IrInst::Syscall { args } => args.to_vec(),
            IrInst::LoadMem { base, index, .. } => vec![base, index],
            IrInst::CondJump { cond, .. } => vec![cond],
            _ => vec![],
        };
        for operand in operands {
            if !operand.is_invalid() {
                assert!(
                    operand < *at,
                    "operand %{} of record %{} refers forward",
                    operand.0,
                    at.0
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Clone + exit
// ---------------------------------------------------------------------------

#[test]
fn clone_and_exit_clears_child_tid() {
    const CHILD_STACK: u64 = STACK_BASE + STACK_SIZE - 0x8000;
    const CHILD_TID_ADDR: u64 = SCRATCH_BASE + 0x100;
    const TLS_ADDR: u64 = SCRATCH_BASE + 0x2000;
    // CLONE_VM | CLONE_THREAD
    const FLAGS: u32 = 0x0001_0100;

    #[rustfmt::skip]
    let mut code = vec![
        0xB8, 0x38, 0x00, 0x00, 0x00,             // mov eax, 56 (clone)
        0x48, 0xC7, 0xC7, 0, 0, 0, 0,             // mov rdi, flags
        0x48, 0xC7, 0xC6, 0, 0, 0, 0,             // mov rsi, child_stack
        0x48, 0xC7, 0xC2, 0, 0, 0, 0,             // mov rdx, parent_tid_addr
        0x49, 0xC7, 0xC2, 0, 0, 0, 0,             // mov r10, child_tid_addr
        0x49, 0xC7, 0xC0, 0, 0, 0, 0,             // mov r8, tls
        0x0F, 0x05,                               // syscall
        // Both threads resume here; the child sees rax == 0.
        0x83, 0xF8, 0x00,                         // cmp eax, 0
        0x75, 0x07,                               // jne parent
        0xB8, 0x3C, 0x00, 0x00, 0x00,             // mov eax, 60 (exit)
        0x0F, 0x05,                               // syscall
        // parent:
        0x90,                                     // nop
    ];
    code[8..12].copy_from_slice(&FLAGS.to_le_bytes());
    code[15..19].copy_from_slice(&(CHILD_STACK as u32).to_le_bytes());
    code[22..26].copy_from_slice(&((SCRATCH_BASE + 0x80) as u32).to_le_bytes());
    code[29..33].copy_from_slice(&(CHILD_TID_ADDR as u32).to_le_bytes());
    code[36..40].copy_from_slice(&(TLS_ADDR as u32).to_le_bytes());

    let h = Harness::new(BackendKind::Interpreter, &code);
    h.core.mem().write_u64(CHILD_TID_ADDR, 0x5555);

    // Parent: one block ending at the clone syscall.
    h.step();
    let parent = h.state();
    let child_tid = parent.gregs[reg::RAX];
    assert!(child_tid > 1, "parent must see a positive child TID");

    let threads = h.core.threads();
    assert_eq!(threads.len(), 2);
    let child = Arc::clone(&threads[1]);
    assert_eq!(child.tid(), child_tid);

    // The child host thread was released by clone; wait for the guest
    // child to run its exit.
    let deadline = Instant::now() + Duration::from_secs(10);
    while child.is_running() || h.core.mem().read_u64(CHILD_TID_ADDR) != Some(0) {
        assert!(
            Instant::now() < deadline,
            "child did not exit and clear its TID word (word = {:?})",
            h.core.mem().read_u64(CHILD_TID_ADDR)
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    // SAFETY: the child's execution loop has finished.
    let child_state = unsafe { child.state_mut() }.clone();
    assert_eq!(child_state.gregs[reg::RSP], CHILD_STACK, "child stack installed");
    assert_eq!(child_state.fs, TLS_ADDR, "child TLS installed");

    // Parent side: not taken the child path.
    h.step();
    assert_eq!(h.state().gregs[reg::RAX], child_tid, "parent keeps the TID");
}
