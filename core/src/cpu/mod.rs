//! CPU core: thread states, block compilation, and the execution loops.
//!
//! Every guest thread owns a host OS thread running [`execution_thread`]:
//! look up the current RIP in the thread's block cache, compile the block
//! on a miss, invoke the native entry, or single-step the reference
//! interpreter when nothing could be lifted. Translation state (block
//! cache, IR cache, dispatch builder, reference emulator) is strictly
//! per-thread; only the address space, the syscall handler and the
//! backend are shared.

pub mod block_cache;
pub mod reference;
pub mod state;

use std::cell::Cell;
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::backend::{Backend, BackendKind, CompileContext};
use crate::hle::{SyscallArguments, SyscallHandler};
use crate::ir::IrBlock;
use crate::ir::passes::PassSchedule;
use crate::memmap::Memmap;
use crate::x86::decoder::decode;
use crate::x86::dispatch::OpDispatchBuilder;
use crate::x86::tables::{DecodeFlags, InstFlags};

use block_cache::{BlockCache, NativeEntry};
use reference::{ReferenceCpu, StepExit};
use state::{X86State, reg};

/// Longest instruction sequence lifted into one block.
const MAX_BLOCK_INSTRUCTIONS: usize = 64;

// ---------------------------------------------------------------------------
// Current-thread slot
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_THREAD: Cell<*const ThreadState> = const { Cell::new(std::ptr::null()) };
}

/// Runs `f` with the guest thread bound to this host thread.
///
/// Generated code and the syscall handler locate the guest context through
/// this slot; it is installed for the duration of every dispatch.
pub fn with_current_thread<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
    CURRENT_THREAD.with(|slot| {
        let ptr = slot.get();
        emu_log::throw_assert!(!ptr.is_null(), "no current guest thread installed");
        // SAFETY: installed by `CurrentThreadGuard` for a live ThreadState
        // whose Arc outlives the guard.
        f(unsafe { &*ptr })
    })
}

struct CurrentThreadGuard {
    previous: *const ThreadState,
}

impl CurrentThreadGuard {
    fn install(thread: &ThreadState) -> Self {
        let previous = CURRENT_THREAD.with(|slot| slot.replace(std::ptr::from_ref(thread)));
        Self { previous }
    }
}

impl Drop for CurrentThreadGuard {
    fn drop(&mut self) {
        CURRENT_THREAD.with(|slot| slot.set(self.previous));
    }
}

// ---------------------------------------------------------------------------
// Thread state
// ---------------------------------------------------------------------------

/// Start barrier: a freshly spawned execution thread parks here until the
/// creator finishes its bookkeeping.
struct StartBarrier {
    lock: Mutex<bool>,
    cv: Condvar,
}

impl StartBarrier {
    fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut released = self.lock.lock().expect("start barrier lock");
        while !*released {
            released = self.cv.wait(released).expect("start barrier wait");
        }
    }

    fn release(&self) {
        *self.lock.lock().expect("start barrier lock") = true;
        self.cv.notify_all();
    }
}

/// Everything one guest thread owns.
///
/// The `UnsafeCell` members form the thread's private translation state:
/// they are touched only by the owning host thread once it runs, and by
/// the creating thread before the start barrier is released. That
/// discipline is what the `unsafe` accessors encode.
pub struct ThreadState {
    state: UnsafeCell<X86State>,
    block_cache: UnsafeCell<BlockCache>,
    ir_cache: UnsafeCell<BTreeMap<u64, IrBlock>>,
    builder: UnsafeCell<OpDispatchBuilder>,
    reference: UnsafeCell<ReferenceCpu>,
    start: StartBarrier,
    stop: AtomicBool,
    running: AtomicBool,
    paused: AtomicBool,
    blocked: AtomicBool,
    tid: u64,
    parent_tid: u64,
    child_tid_addr: AtomicU64,
    robust_list: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: the UnsafeCell members are confined to the owning host thread
// (see the struct docs); everything else is atomics and locks.
unsafe impl Send for ThreadState {}
// SAFETY: see above.
unsafe impl Sync for ThreadState {}

impl ThreadState {
    fn new(state: X86State, tid: u64, parent_tid: u64, reference: ReferenceCpu) -> Self {
        Self {
            state: UnsafeCell::new(state),
            block_cache: UnsafeCell::new(BlockCache::new()),
            ir_cache: UnsafeCell::new(BTreeMap::new()),
            builder: UnsafeCell::new(OpDispatchBuilder::new()),
            reference: UnsafeCell::new(reference),
            start: StartBarrier::new(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            tid,
            parent_tid,
            child_tid_addr: AtomicU64::new(0),
            robust_list: AtomicU64::new(0),
            join: Mutex::new(None),
        }
    }

    /// Guest thread id.
    #[must_use]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// TID of the creating thread (0 for thread 1).
    #[must_use]
    pub fn parent_tid(&self) -> u64 {
        self.parent_tid
    }

    /// Architectural state of this thread.
    ///
    /// # Safety
    ///
    /// Only the owning host thread (or its creator before the start
    /// barrier is released) may call this; the reference is exclusive by
    /// that discipline, not by the borrow checker.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn state_mut(&self) -> &mut X86State {
        // SAFETY: caller contract above.
        unsafe { &mut *self.state.get() }
    }

    /// Block cache. Same contract as [`Self::state_mut`].
    ///
    /// # Safety
    ///
    /// Owning-thread access only.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn block_cache_mut(&self) -> &mut BlockCache {
        // SAFETY: caller contract above.
        unsafe { &mut *self.block_cache.get() }
    }

    /// IR cache. Same contract as [`Self::state_mut`].
    ///
    /// # Safety
    ///
    /// Owning-thread access only.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn ir_cache_mut(&self) -> &mut BTreeMap<u64, IrBlock> {
        // SAFETY: caller contract above.
        unsafe { &mut *self.ir_cache.get() }
    }

    /// Dispatch builder. Same contract as [`Self::state_mut`].
    ///
    /// # Safety
    ///
    /// Owning-thread access only.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn builder_mut(&self) -> &mut OpDispatchBuilder {
        // SAFETY: caller contract above.
        unsafe { &mut *self.builder.get() }
    }

    /// Reference emulator. Same contract as [`Self::state_mut`].
    ///
    /// # Safety
    ///
    /// Owning-thread access only.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn reference_mut(&self) -> &mut ReferenceCpu {
        // SAFETY: caller contract above.
        unsafe { &mut *self.reference.get() }
    }

    /// Releases the start barrier; the execution thread begins running.
    pub fn release_start(&self) {
        self.start.release();
    }

    /// Cooperative stop: the execution loop exits before the next block.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once a stop was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// True while the execution loop is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True while parked at a blocking suspension point (futex, sleep).
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Marks this thread blocked/unblocked around a host wait.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Address to clear (and futex-wake) when this thread exits.
    #[must_use]
    pub fn child_tid_addr(&self) -> u64 {
        self.child_tid_addr.load(Ordering::SeqCst)
    }

    /// Records the clear-on-exit address (`set_tid_address`, `clone`).
    pub fn set_child_tid_addr(&self, addr: u64) {
        self.child_tid_addr.store(addr, Ordering::SeqCst);
    }

    /// Records the robust-futex list head (`set_robust_list`).
    pub fn set_robust_list(&self, addr: u64) {
        self.robust_list.store(addr, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// The core
// ---------------------------------------------------------------------------

/// Owns every thread state, the backend, the address space view, and the
/// syscall handler.
pub struct CpuCore {
    mem: Arc<Memmap>,
    syscalls: SyscallHandler,
    backend: Mutex<Backend>,
    passes: Mutex<PassSchedule>,
    threads: Mutex<Vec<Arc<ThreadState>>>,
    stop: AtomicBool,
    pause_requested: AtomicBool,
    broadcast_lock: Mutex<()>,
    next_tid: AtomicU64,
}

impl CpuCore {
    /// Creates a core over a shared address space with the chosen backend.
    #[must_use]
    pub fn new(mem: Arc<Memmap>, backend: BackendKind) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<CpuCore>| Self {
            syscalls: SyscallHandler::new(weak.clone(), Arc::clone(&mem)),
            backend: Mutex::new(Backend::new(backend)),
            passes: Mutex::new(PassSchedule::new()),
            threads: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            broadcast_lock: Mutex::new(()),
            next_tid: AtomicU64::new(1),
            mem,
        })
    }

    /// The shared guest address space.
    #[must_use]
    pub fn mem(&self) -> &Memmap {
        &self.mem
    }

    /// The syscall handler.
    #[must_use]
    pub fn syscalls(&self) -> &SyscallHandler {
        &self.syscalls
    }

    /// Requests a global cooperative stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once a global stop was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Snapshot of the thread list.
    #[must_use]
    pub fn threads(&self) -> Vec<Arc<ThreadState>> {
        self.threads.lock().expect("thread list lock").clone()
    }

    fn make_reference(&self) -> ReferenceCpu {
        let mut reference = ReferenceCpu::new(Arc::clone(&self.mem));
        let mem = Arc::clone(&self.mem);
        reference.set_unmapped_hook(Box::new(move |rip, addr| {
            emu_log::error!("attempted to access unmapped {addr:#x} (rip {rip:#x})");
            for region in mem.regions() {
                emu_log::error!("  region {:#x}+{:#x}", region.offset, region.size);
            }
        }));
        reference
    }

    /// Creates the initial guest thread (TID 1) with its execution thread
    /// parked at the start barrier.
    pub fn init_thread(core: &Arc<Self>, state: X86State) -> Arc<ThreadState> {
        let tid = core.next_tid.fetch_add(1, Ordering::SeqCst);
        let thread = Arc::new(ThreadState::new(state, tid, 0, core.make_reference()));
        Self::register_and_spawn(core, &thread);
        thread
    }

    /// Creates a guest thread for `clone`. The caller finishes its
    /// bookkeeping and then calls [`ThreadState::release_start`].
    pub fn new_thread(
        core: &Arc<Self>,
        state: X86State,
        _parent_tid_ptr: u64,
        child_tid_ptr: u64,
    ) -> Arc<ThreadState> {
        let parent_tid = with_current_thread(ThreadState::tid);
        let tid = core.next_tid.fetch_add(1, Ordering::SeqCst);
        // The child's reference emulator reads through the shared address
        // space, so it observes every region the parent mapped.
        let thread = Arc::new(ThreadState::new(
            state,
            tid,
            parent_tid,
            core.make_reference(),
        ));
        if child_tid_ptr != 0 {
            thread.set_child_tid_addr(child_tid_ptr);
        }
        Self::register_and_spawn(core, &thread);
        thread
    }

    fn register_and_spawn(core: &Arc<Self>, thread: &Arc<ThreadState>) {
        core.threads
            .lock()
            .expect("thread list lock")
            .push(Arc::clone(thread));

        let core_for_thread = Arc::clone(core);
        let state = Arc::clone(thread);
        let handle = std::thread::spawn(move || execution_thread(&core_for_thread, &state));
        *thread.join.lock().expect("join slot lock") = Some(handle);
    }

    // -- region broadcast -----------------------------------------------------

    /// Maps a region while every other runnable thread is parked at its
    /// pause point, so no thread observes the region list mid-update.
    pub fn map_region_on_all(&self, offset: u64, size: u64) {
        let me = CURRENT_THREAD.with(Cell::get);

        // Serialize broadcasters. A guest thread parked here counts as
        // blocked so the winning broadcaster does not wait on it.
        if !me.is_null() {
            // SAFETY: `me` is this host thread's installed ThreadState.
            unsafe { &*me }.set_blocked(true);
        }
        let _serial = self.broadcast_lock.lock().expect("broadcast lock");
        if !me.is_null() {
            // SAFETY: see above.
            unsafe { &*me }.set_blocked(false);
        }

        let others: Vec<Arc<ThreadState>> = self
            .threads
            .lock()
            .expect("thread list lock")
            .iter()
            .filter(|t| !std::ptr::eq(Arc::as_ptr(t), me))
            .cloned()
            .collect();

        self.pause_requested.store(true, Ordering::SeqCst);
        for thread in &others {
            while thread.is_running()
                && !thread.is_blocked()
                && !thread.paused.load(Ordering::SeqCst)
            {
                std::hint::spin_loop();
            }
        }

        if let Err(err) = self.mem.map_region(offset, size) {
            emu_log::error!("broadcast map of {offset:#x}+{size:#x} failed: {err}");
        }

        self.pause_requested.store(false, Ordering::SeqCst);
    }

    // -- dispatch -------------------------------------------------------------

    /// One dispatch step: find or compile the block at the thread's RIP
    /// and run it, falling back to a reference single-step.
    pub fn run_once(core: &Arc<Self>, thread: &Arc<ThreadState>) {
        let _guard = CurrentThreadGuard::install(thread);
        // SAFETY: we are the owning thread for the duration of this call.
        let rip = unsafe { thread.state_mut() }.rip;
        // SAFETY: same.
        let cached = unsafe { thread.block_cache_mut() }.find(rip);
        let entry = cached.or_else(|| Self::compile_block(core, thread));

        match entry {
            Some(entry) => {
                let core_ptr: *const CpuCore = Arc::as_ptr(core);
                // SAFETY: the entry was produced by our backend for this
                // thread; core and thread outlive the call.
                unsafe { entry(core_ptr.cast_mut()) };
            }
            None => core.fallback_single_step(thread),
        }
    }

    /// Lifts (or reuses) the IR for the block at the thread's RIP, runs
    /// the pass schedule, and asks the backend for native code.
    fn compile_block(core: &Arc<Self>, thread: &Arc<ThreadState>) -> Option<NativeEntry> {
        // SAFETY: owning thread.
        let state = unsafe { thread.state_mut() };
        let rip = state.rip;

        // SAFETY: owning thread.
        let ir_cache = unsafe { thread.ir_cache_mut() };
        if !ir_cache.contains_key(&rip) {
            let mut ir = core.lift_block(thread, rip)?;
            core.passes.lock().expect("pass lock").run(&mut ir);
            ir_cache.insert(rip, ir);
        }
        let ir = ir_cache.get(&rip).expect("inserted above");

        let ctx = CompileContext {
            ctx_ptr: std::ptr::from_mut(state),
            entry_rip: rip,
            mem_base: core.mem.base(),
            core_ptr: Arc::as_ptr(core).cast_mut(),
        };
        let entry = core.backend.lock().expect("backend lock").compile(ir, &ctx)?;
        // SAFETY: owning thread.
        unsafe { thread.block_cache_mut() }.insert(rip, entry);
        Some(entry)
    }

    /// The lifter loop: decode and dispatch instructions until a block
    /// boundary, a decode failure, or the instruction cap.
    fn lift_block(&self, thread: &ThreadState, rip: u64) -> Option<IrBlock> {
        // SAFETY: owning thread.
        let builder = unsafe { thread.builder_mut() };
        builder.begin_block();

        let mut total_len: u64 = 0;
        let mut instructions = 0usize;
        let mut rip_setter = false;

        loop {
            let address = rip.wrapping_add(total_len);
            let code = self.fetch_code(address);

            let bail = |builder: &mut OpDispatchBuilder| {
                // Nothing lifted: hand the instruction to the fallback.
                builder.reset();
                None::<IrBlock>
            };

            let Some(decoded) = decode(&code) else {
                emu_log::error!("unknown instruction encoding at {address:#x}");
                if instructions == 0 {
                    return bail(builder);
                }
                break;
            };

            // LOCKed instructions are never lifted; their atomicity is the
            // reference interpreter's problem.
            if decoded.flags.contains(DecodeFlags::LOCK) {
                if instructions == 0 {
                    return bail(builder);
                }
                break;
            }

            builder.add_rip_marker(address);
            builder.dispatch(&decoded, &code);
            if builder.had_decode_failure() {
                if instructions == 0 {
                    return bail(builder);
                }
                break;
            }

            total_len += u64::from(decoded.size);
            instructions += 1;

            let flags = decoded.info.flags;
            if flags.contains(InstFlags::SETS_RIP) {
                rip_setter = true;
            }
            if flags.contains(InstFlags::BLOCK_END) || instructions >= MAX_BLOCK_INSTRUCTIONS {
                break;
            }
        }

        builder.end_block(if rip_setter { 0 } else { total_len });
        let ir = builder.working_ir().clone();
        builder.reset();
        Some(ir)
    }

    /// Copies up to one fetch window of guest bytes at `address`.
    fn fetch_code(&self, address: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16);
        for i in 0..16u64 {
            match self.mem.read_u8(address + i) {
                Some(byte) => bytes.push(byte),
                None => break,
            }
        }
        bytes
    }

    // -- fallback -------------------------------------------------------------

    /// The load-into-reference / run-one-step / store-from-reference
    /// sandwich for instructions the lifter cannot handle.
    pub fn fallback_single_step(&self, thread: &ThreadState) {
        // SAFETY: owning thread.
        let state = unsafe { thread.state_mut() };
        // SAFETY: owning thread.
        let reference = unsafe { thread.reference_mut() };

        reference.load_state(state);
        let exit = reference.step();
        reference.store_state(state);

        match exit {
            StepExit::Continue => {}
            StepExit::Syscall => {
                let call = SyscallArguments {
                    args: [
                        state.gregs[reg::RAX],
                        state.gregs[reg::RDI],
                        state.gregs[reg::RSI],
                        state.gregs[reg::RDX],
                        state.gregs[reg::R10],
                        state.gregs[reg::R8],
                        state.gregs[reg::R9],
                    ],
                };
                let result = self.syscalls.handle(&call);
                state.gregs[reg::RAX] = result;
                state.rip = state.rip.wrapping_add(2);
            }
            StepExit::Unsupported { opcode } => {
                emu_log::error!(
                    "reference interpreter cannot execute opcode {opcode:#04x} at rip {:#x}; stopping thread {}",
                    state.rip,
                    thread.tid()
                );
                thread.request_stop();
            }
        }
    }

    /// Releases every thread currently parked at its start barrier and
    /// joins them all; returns when the guest is done.
    pub fn run(core: &Arc<Self>) {
        for thread in core.threads() {
            thread.release_start();
        }

        // Thread 1 decides the process lifetime.
        let first = core.threads().into_iter().next();
        if let Some(first) = first {
            join_thread(&first);
        }
        core.request_stop();
        // Unblock anything parked on a futex so it can observe the stop.
        core.syscalls.wake_all_futexes();

        loop {
            let pending: Vec<Arc<ThreadState>> = core
                .threads()
                .into_iter()
                .filter(|t| t.join.lock().expect("join slot lock").is_some())
                .collect();
            if pending.is_empty() {
                break;
            }
            for thread in pending {
                join_thread(&thread);
            }
        }
    }
}

fn join_thread(thread: &Arc<ThreadState>) {
    let handle = thread.join.lock().expect("join slot lock").take();
    if let Some(handle) = handle {
        // A parked thread that never ran still honors the stop flag once
        // released.
        thread.release_start();
        if handle.join().is_err() {
            emu_log::error!("execution thread {} panicked", thread.tid());
        }
    }
}

/// The per-thread execution loop.
fn execution_thread(core: &Arc<CpuCore>, thread: &Arc<ThreadState>) {
    thread.start.wait();
    thread.running.store(true, Ordering::SeqCst);

    while !core.stop_requested() && !thread.stop_requested() {
        CpuCore::run_once(core, thread);

        // SAFETY: owning thread.
        let rip = unsafe { thread.state_mut() }.rip;
        if rip == 0 && thread.tid() == 1 {
            emu_log::debug!("thread 1 reached rip 0, stopping");
            core.request_stop();
        }

        // Pause acknowledge: park while a broadcast map is in flight.
        if core.pause_requested.load(Ordering::SeqCst) {
            thread.paused.store(true, Ordering::SeqCst);
            while core.pause_requested.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            thread.paused.store(false, Ordering::SeqCst);
        }
    }

    thread.running.store(false, Ordering::SeqCst);
    if thread.tid() == 1 {
        core.request_stop();
    }
}
