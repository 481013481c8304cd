//! High-level emulation of the Linux syscall ABI.
//!
//! Generated code funnels every guest `syscall` into
//! [`SyscallHandler::handle`] with a seven-slot argument record -
//! `args[0]` is the syscall number, `args[1..]` are RDI, RSI, RDX, R10,
//! R8, R9. The handler resolves the current guest thread through the
//! thread-local slot, services the call against host resources, and
//! returns the value to place in RAX. Unknown syscalls log an error and
//! return `-1`; the emulator keeps running.

mod files;
mod futex;

pub use files::{FdEntry, FileManager};
pub use futex::{Futex, FutexTable};

use std::sync::{Arc, Mutex, Weak};

use crate::cpu::state::reg;
use crate::cpu::{CpuCore, with_current_thread};
use crate::ir::SYSCALL_MAX_ARGS;
use crate::memmap::{Memmap, PAGE_SIZE, align_down, align_up};

/// The in-register syscall argument record.
pub struct SyscallArguments {
    /// `args[0]` is the syscall number; the rest follow the kernel ABI
    /// register order.
    pub args: [u64; SYSCALL_MAX_ARGS],
}

const NEG1: u64 = -1i64 as u64;

// Linux x86-64 syscall numbers the handler services.
const SYSCALL_READ: u64 = 0;
const SYSCALL_WRITE: u64 = 1;
const SYSCALL_OPEN: u64 = 2;
const SYSCALL_CLOSE: u64 = 3;
const SYSCALL_FSTAT: u64 = 5;
const SYSCALL_LSEEK: u64 = 8;
const SYSCALL_MMAP: u64 = 9;
const SYSCALL_MPROTECT: u64 = 10;
const SYSCALL_BRK: u64 = 12;
const SYSCALL_RT_SIGACTION: u64 = 13;
const SYSCALL_RT_SIGPROCMASK: u64 = 14;
const SYSCALL_WRITEV: u64 = 20;
const SYSCALL_ACCESS: u64 = 21;
const SYSCALL_NANOSLEEP: u64 = 35;
const SYSCALL_GETPID: u64 = 39;
const SYSCALL_CLONE: u64 = 56;
const SYSCALL_EXIT: u64 = 60;
const SYSCALL_UNAME: u64 = 63;
const SYSCALL_READLINK: u64 = 89;
const SYSCALL_GETUID: u64 = 102;
const SYSCALL_GETGID: u64 = 104;
const SYSCALL_GETEUID: u64 = 107;
const SYSCALL_GETEGID: u64 = 108;
const SYSCALL_ARCH_PRCTL: u64 = 158;
const SYSCALL_GETTID: u64 = 186;
const SYSCALL_FUTEX: u64 = 202;
const SYSCALL_SET_TID_ADDRESS: u64 = 218;
const SYSCALL_CLOCK_GETTIME: u64 = 228;
const SYSCALL_EXIT_GROUP: u64 = 231;
const SYSCALL_TGKILL: u64 = 234;
const SYSCALL_OPENAT: u64 = 257;
const SYSCALL_SET_ROBUST_LIST: u64 = 273;
const SYSCALL_PRLIMIT64: u64 = 302;

/// `arch_prctl` sub-operation to set the FS base.
const ARCH_SET_FS: u64 = 0x1002;

/// `clone(2)` flag: write the child TID to the parent's pointer.
const CLONE_PARENT_SETTID: u64 = 0x0010_0000;

/// Heap base handed out by `brk`.
const BRK_BASE: u64 = 0xA000_0000;
/// Size of the heap region reserved on the first `brk` call: 256 MiB.
const BRK_RESERVE: u64 = 0x1000_0000;
/// Start of the monotonic `mmap` allocation cursor.
const MMAP_BASE: u64 = 0xD000_0000;

/// Identity values for the simulated process.
///
/// One process, fixed credentials; only the TID varies per thread.
struct ThreadManagement;

impl ThreadManagement {
    const fn uid() -> u64 {
        1
    }
    const fn gid() -> u64 {
        1
    }
    const fn euid() -> u64 {
        1
    }
    const fn egid() -> u64 {
        1
    }
    const fn pid() -> u64 {
        1
    }
}

/// Moving program-break state.
struct BrkState {
    initialized: bool,
    base: u64,
    size: u64,
}

/// Services the guest's Linux syscalls.
pub struct SyscallHandler {
    core: Weak<CpuCore>,
    mem: Arc<Memmap>,
    files: Mutex<FileManager>,
    futexes: FutexTable,
    brk: Mutex<BrkState>,
    last_mmap: Mutex<u64>,
}

impl SyscallHandler {
    /// Creates the handler. `core` is the owning core, provided weakly
    /// because the core owns the handler.
    #[must_use]
    pub fn new(core: Weak<CpuCore>, mem: Arc<Memmap>) -> Self {
        Self {
            core,
            mem,
            files: Mutex::new(FileManager::new()),
            futexes: FutexTable::new(),
            brk: Mutex::new(BrkState {
                initialized: false,
                base: 0,
                size: 0,
            }),
            last_mmap: Mutex::new(MMAP_BASE),
        }
    }

    fn core(&self) -> Arc<CpuCore> {
        match self.core.upgrade() {
            Some(core) => core,
            None => emu_log::fatal(format_args!("syscall issued after core teardown")),
        }
    }

    /// Wakes every futex waiter; used during shutdown so blocked guest
    /// threads observe the stop flag.
    pub fn wake_all_futexes(&self) {
        self.futexes.wake_all();
    }

    /// Services one syscall and returns the value for RAX.
    #[allow(clippy::too_many_lines)]
    pub fn handle(&self, call: &SyscallArguments) -> u64 {
        let args = &call.args;
        let tid = with_current_thread(crate::cpu::ThreadState::tid);
        emu_log::debug!("{tid}: syscall {}", args[0]);

        match args[0] {
            // -- identity -----------------------------------------------------
            SYSCALL_GETUID => ThreadManagement::uid(),
            SYSCALL_GETGID => ThreadManagement::gid(),
            SYSCALL_GETEUID => ThreadManagement::euid(),
            SYSCALL_GETEGID => ThreadManagement::egid(),
            SYSCALL_GETPID => ThreadManagement::pid(),
            SYSCALL_GETTID => tid,

            // -- files --------------------------------------------------------
            SYSCALL_READ => self
                .files
                .lock()
                .expect("file lock")
                .read(args[1] as i32, args[2], args[3]),
            SYSCALL_WRITE => {
                self.files
                    .lock()
                    .expect("file lock")
                    .write(&self.mem, args[1] as i32, args[2], args[3])
            }
            SYSCALL_OPEN => {
                let Some(path) = self.mem.read_cstr(args[1], 4096) else {
                    return NEG1;
                };
                self.files
                    .lock()
                    .expect("file lock")
                    .open(&path, args[2] as i32, args[3] as u32)
            }
            SYSCALL_CLOSE => self.files.lock().expect("file lock").close(args[1] as i32),
            SYSCALL_FSTAT => {
                self.files
                    .lock()
                    .expect("file lock")
                    .fstat(&self.mem, args[1] as i32, args[2])
            }
            SYSCALL_LSEEK => {
                self.files
                    .lock()
                    .expect("file lock")
                    .lseek(args[1] as i32, args[2], args[3] as i32)
            }
            SYSCALL_WRITEV => {
                self.files
                    .lock()
                    .expect("file lock")
                    .writev(&self.mem, args[1] as i32, args[2], args[3])
            }
            SYSCALL_ACCESS => {
                let Some(path) = self.mem.read_cstr(args[1], 4096) else {
                    return NEG1;
                };
                self.files
                    .lock()
                    .expect("file lock")
                    .access(&path, args[2] as i32)
            }
            SYSCALL_READLINK => {
                let Some(path) = self.mem.read_cstr(args[1], 4096) else {
                    return NEG1;
                };
                self.files
                    .lock()
                    .expect("file lock")
                    .readlink(&path, args[2], args[3])
            }
            SYSCALL_OPENAT => {
                let Some(path) = self.mem.read_cstr(args[2], 4096) else {
                    return NEG1;
                };
                self.files.lock().expect("file lock").openat(
                    args[1] as i32,
                    &path,
                    args[3] as i32,
                    args[4] as u32,
                )
            }

            // -- memory -------------------------------------------------------
            SYSCALL_BRK => self.sys_brk(args[1]),
            SYSCALL_MMAP => self.sys_mmap(args[2]),
            SYSCALL_MPROTECT => 0,

            // -- threading ----------------------------------------------------
            SYSCALL_CLONE => self.sys_clone(args),
            SYSCALL_EXIT => self.sys_exit(args[1]),
            SYSCALL_SET_TID_ADDRESS => with_current_thread(|thread| {
                thread.set_child_tid_addr(args[1]);
                thread.tid()
            }),
            SYSCALL_SET_ROBUST_LIST => with_current_thread(|thread| {
                thread.set_robust_list(args[1]);
                0
            }),
            SYSCALL_FUTEX => self.sys_futex(args),

            // -- time ---------------------------------------------------------
            SYSCALL_CLOCK_GETTIME => self.sys_clock_gettime(args[1], args[2]),
            SYSCALL_NANOSLEEP => self.sys_nanosleep(args[1], args[2]),

            // -- system -------------------------------------------------------
            SYSCALL_ARCH_PRCTL => self.sys_arch_prctl(args[1], args[2]),
            SYSCALL_UNAME => self.sys_uname(args[1]),

            // Accepted and ignored.
            SYSCALL_RT_SIGACTION
            | SYSCALL_RT_SIGPROCMASK
            | SYSCALL_EXIT_GROUP
            | SYSCALL_TGKILL
            | SYSCALL_PRLIMIT64 => 0,

            unknown => {
                emu_log::error!("unknown syscall: {unknown}");
                NEG1
            }
        }
    }

    // -- memory ---------------------------------------------------------------

    fn sys_brk(&self, requested: u64) -> u64 {
        let mut brk = self.brk.lock().expect("brk lock");
        if requested == 0 {
            if !brk.initialized {
                self.core().map_region_on_all(BRK_BASE, BRK_RESERVE);
                brk.base = BRK_BASE;
                brk.initialized = true;
            }
            brk.base
        } else {
            let added = requested.wrapping_sub(brk.base);
            brk.size = brk.size.wrapping_add(added);
            emu_log::debug!(
                "brk grows by {added:#x} (base {:#x}, break {:#x})",
                brk.base,
                brk.base + brk.size
            );
            brk.base + brk.size
        }
    }

    /// `mmap` ignores everything except the length: allocations come from
    /// a monotonic cursor and are always readable/writable/shared.
    fn sys_mmap(&self, len: u64) -> u64 {
        let mut last = self.last_mmap.lock().expect("mmap lock");
        let base = align_down(*last, PAGE_SIZE);
        let size = align_up(len, PAGE_SIZE);
        *last += size;
        self.core().map_region_on_all(base, size);
        base
    }

    // -- threading ------------------------------------------------------------

    fn sys_clone(&self, args: &[u64; SYSCALL_MAX_ARGS]) -> u64 {
        // args: 1=flags, 2=new_sp, 3=parent_tidptr, 4=child_tidptr, 5=tls
        let flags = args[1];
        emu_log::debug!(
            "clone(flags={:#x}, sp={:#x}, parent_tid={:#x}, child_tid={:#x}, tls={:#x})",
            flags,
            args[2],
            args[3],
            args[4],
            args[5]
        );

        let core = self.core();
        // SAFETY: reading our own thread's state from its own host thread.
        let mut child_state = with_current_thread(|t| unsafe { t.state_mut() }.clone());
        child_state.gregs[reg::RAX] = 0;
        child_state.gregs[reg::RSP] = args[2];
        child_state.fs = args[5];
        // RIP currently holds the syscall instruction's address; the child
        // resumes right after it.
        child_state.rip = child_state.rip.wrapping_add(2);
        // The kernel hands a fresh thread these as zero.
        child_state.gregs[reg::RBX] = 0;
        child_state.gregs[reg::RBP] = 0;

        let child = CpuCore::new_thread(&core, child_state, args[3], args[4]);
        let child_tid = child.tid();
        if flags & CLONE_PARENT_SETTID != 0 {
            self.mem.write_u64(args[3], child_tid);
        }
        child.release_start();
        child_tid
    }

    fn sys_exit(&self, status: u64) -> u64 {
        with_current_thread(|thread| {
            emu_log::info!("thread {} exited with {}", thread.tid(), status as i64);
            thread.request_stop();
            let clear_addr = thread.child_tid_addr();
            if clear_addr != 0 {
                self.mem.write_u64(clear_addr, 0);
                self.futexes.wake(clear_addr, 1);
            }
        });
        0
    }

    fn sys_futex(&self, args: &[u64; SYSCALL_MAX_ARGS]) -> u64 {
        // args: 1=uaddr, 2=op, 3=val, 4=utime, 5=uaddr2, 6=val3
        let uaddr = args[1];
        let op = args[2] & 0xF;
        match op {
            // FUTEX_WAIT
            0 => {
                emu_log::throw_assert!(args[4] == 0, "timed futex waits are not supported");
                let Some(word) = self.mem.translate(uaddr) else {
                    emu_log::error!("futex wait on unmapped address {uaddr:#x}");
                    return NEG1;
                };
                let core = self.core();
                with_current_thread(|thread| thread.set_blocked(true));
                self.futexes.wait(
                    uaddr,
                    word.cast::<u32>().cast_const(),
                    args[3] as u32,
                    || core.stop_requested(),
                );
                with_current_thread(|thread| thread.set_blocked(false));
                0
            }
            // FUTEX_WAKE
            1 => {
                self.futexes.wake(uaddr, args[3]);
                0
            }
            unknown => emu_log::fatal(format_args!("unknown futex command: {unknown}")),
        }
    }

    // -- time -----------------------------------------------------------------

    fn sys_clock_gettime(&self, clock_id: u64, tp: u64) -> u64 {
        // SAFETY: clock_gettime fills the zeroed struct.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: valid pointer to the struct above.
        let result = unsafe { libc::clock_gettime(clock_id as libc::clockid_t, &mut ts) };
        if result == 0 {
            self.mem.write_u64(tp, ts.tv_sec as u64);
            self.mem.write_u64(tp + 8, ts.tv_nsec as u64);
        }
        result as u64
    }

    fn sys_nanosleep(&self, req: u64, rem: u64) -> u64 {
        let (Some(sec), Some(nsec)) = (self.mem.read_u64(req), self.mem.read_u64(req + 8)) else {
            return NEG1;
        };
        let request = libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        };
        // SAFETY: nanosleep fills the zeroed struct on interruption.
        let mut remaining: libc::timespec = unsafe { std::mem::zeroed() };
        with_current_thread(|thread| thread.set_blocked(true));
        // SAFETY: valid pointers to the structs above.
        let result = unsafe { libc::nanosleep(&request, &mut remaining) };
        with_current_thread(|thread| thread.set_blocked(false));
        if rem != 0 {
            self.mem.write_u64(rem, remaining.tv_sec as u64);
            self.mem.write_u64(rem + 8, remaining.tv_nsec as u64);
        }
        result as u64
    }

    // -- system ---------------------------------------------------------------

    fn sys_arch_prctl(&self, option: u64, value: u64) -> u64 {
        match option {
            ARCH_SET_FS => {
                // SAFETY: writing our own thread's state from its own host
                // thread.
                with_current_thread(|thread| unsafe { thread.state_mut() }.fs = value);
                0
            }
            unknown => {
                emu_log::error!("unknown arch_prctl option {unknown:#x}");
                self.core().request_stop();
                0
            }
        }
    }

    /// Fills the caller's `utsname` record with the fixed identity.
    fn sys_uname(&self, buf: u64) -> u64 {
        const FIELD: u64 = 65;
        let fields: [&[u8]; 5] = [b"Linux\0", b"Emu\0", b"4.19\0", b"#1\0", b"x86_64\0"];
        for (i, field) in fields.iter().enumerate() {
            if !self.mem.write_bytes(buf + i as u64 * FIELD, field) {
                return NEG1;
            }
        }
        0
    }
}
