//! Program loading and emulator lifetime.
//!
//! [`Core`] wires the pieces together: allocate the shared guest address
//! space, map the deterministic initial layout (ELF image, stack, TLS
//! scratch), place the initial stack words, seed thread 1's registers,
//! and hand control to the CPU core's run loop.
//!
//! Initial guest layout:
//!
//! | Region        | Guest base    | Size    |
//! |---------------|---------------|---------|
//! | ELF image     | per program   | span    |
//! | heap (brk)    | `0xA000_0000` | 256 MiB (on first `brk`) |
//! | TLS scratch   | `0xB000_0000` | 4 KiB   |
//! | stack         | `0xC000_0000` | 8 MiB   |
//! | mmap cursor   | `0xD000_0000` | grows   |

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use emu_elf::{ElfContainer, ElfError};

use crate::backend::BackendKind;
use crate::cpu::CpuCore;
use crate::cpu::state::{X86State, reg};
use crate::memmap::{Memmap, MemmapError, PAGE_SIZE, align_down, align_up};

/// Total span of the shared guest address space.
const GUEST_SPACE: u64 = 1 << 33;
/// Guest base of the TLS scratch page.
const FS_OFFSET: u64 = 0xB000_0000;
/// Guest base of the initial stack.
const STACK_OFFSET: u64 = 0xC000_0000;
/// Initial stack size.
const STACK_SIZE: u64 = 8 * 1024 * 1024;
/// Gap left between the stack image and the stack top.
const STACK_SAFE_ZONE: u64 = 0x1000;

/// Errors surfaced while bringing a guest up.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The executable could not be read.
    #[error("could not read executable: {0}")]
    Io(#[from] std::io::Error),
    /// The executable is not a loadable ELF.
    #[error("could not parse executable: {0}")]
    Elf(#[from] ElfError),
    /// The address space could not be set up.
    #[error("could not set up guest memory: {0}")]
    Memmap(#[from] MemmapError),
}

/// The emulator instance.
pub struct Core {
    mem: Arc<Memmap>,
    cpu: Arc<CpuCore>,
}

impl Core {
    /// Allocates the guest address space and builds the CPU core.
    pub fn new(backend: BackendKind) -> Result<Self, LoadError> {
        let mut mem = Memmap::new();
        mem.allocate(GUEST_SPACE)?;
        let mem = Arc::new(mem);
        let cpu = CpuCore::new(Arc::clone(&mem), backend);
        Ok(Self { mem, cpu })
    }

    /// The CPU core (for tests and front-end diagnostics).
    #[must_use]
    pub fn cpu(&self) -> &Arc<CpuCore> {
        &self.cpu
    }

    /// The guest address space.
    #[must_use]
    pub fn mem(&self) -> &Arc<Memmap> {
        &self.mem
    }

    /// Loads the guest executable and prepares thread 1.
    ///
    /// `_args` is accepted for front-end symmetry; the initial argv image
    /// is the fixed placeholder shape, byte-for-byte.
    pub fn load(&self, file: &Path, _args: &[String]) -> Result<(), LoadError> {
        let data = std::fs::read(file)?;
        let elf = ElfContainer::parse(&data)?;

        // ELF image, at its own addresses rounded to page boundaries.
        let (low, _high, span) = elf.layout();
        let image_base = align_down(low, PAGE_SIZE);
        let image_size = align_up(span + (low - image_base), PAGE_SIZE);
        self.mem.map_region(image_base, image_size)?;

        // Stack and TLS scratch.
        self.mem.map_region(STACK_OFFSET, STACK_SIZE)?;
        self.mem.map_region(FS_OFFSET, PAGE_SIZE)?;

        // Initial stack image: argc, two argv slots, the argv bytes.
        let values: [u8; 30] = [
            2, 0, 0, 0, 0, 0, 0, 0, // argument count
            0, 0, 0, 0, 0, 0, 0, 0, // argv[0] pointer
            0, 0, 0, 0, 0, 0, 0, 0, // argv[1] pointer
            b'B', b'u', b't', b't', b's', 0, // argv[0] bytes
        ];
        let mut rsp = STACK_OFFSET + STACK_SIZE;
        rsp -= values.len() as u64 + STACK_SAFE_ZONE;
        let arg0_offset = rsp + 8;
        let arg0_value = rsp + 24;
        self.mem.write_bytes(rsp, &values);
        self.mem.write_u64(arg0_offset, arg0_value);
        self.mem.write_u64(arg0_offset + 8, arg0_value);

        // Segment bytes land after the regions exist; BSS tails stay on
        // the zeroed backing pages.
        elf.write_loadable_segments(|bytes, addr| {
            if !self.mem.write_bytes(addr, bytes) {
                emu_log::error!("segment bytes at {addr:#x} fell outside the image mapping");
            }
        });

        let mut state = X86State::new();
        state.rip = elf.entry_point();
        state.gregs[reg::RSP] = rsp;
        emu_log::info!(
            "loaded {} (entry {:#x}, rsp {:#x})",
            file.display(),
            state.rip,
            rsp
        );

        CpuCore::init_thread(&self.cpu, state);
        Ok(())
    }

    /// Runs the guest to completion.
    pub fn run(&self) {
        CpuCore::run(&self.cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF64 executable with one loadable segment.
    fn synthetic_elf(code: &[u8], vaddr: u64) -> Vec<u8> {
        let mut image = vec![0u8; 64 + 56];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        image[24..32].copy_from_slice(&vaddr.to_le_bytes()); // entry
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        let file_off = image.len() as u64;
        image[64..68].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image[72..80].copy_from_slice(&file_off.to_le_bytes());
        image[80..88].copy_from_slice(&vaddr.to_le_bytes());
        image[96..104].copy_from_slice(&(code.len() as u64).to_le_bytes());
        image[104..112].copy_from_slice(&(code.len() as u64).to_le_bytes());
        image.extend_from_slice(code);
        image
    }

    #[test]
    fn initial_stack_image_is_byte_exact() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("emu-loader-test-{}", std::process::id()));
        std::fs::write(&path, synthetic_elf(&[0x90, 0xC3], 0x40_0000)).expect("write elf");

        let core = Core::new(BackendKind::AArch64).expect("core setup");
        core.load(&path, &[]).expect("load failed");
        let _ = std::fs::remove_file(&path);

        let rsp = STACK_OFFSET + STACK_SIZE - (30 + STACK_SAFE_ZONE);
        let threads = core.cpu().threads();
        assert_eq!(threads.len(), 1);
        // SAFETY: the thread is parked at its start barrier.
        let state = unsafe { threads[0].state_mut() };
        assert_eq!(state.gregs[reg::RSP], rsp);
        assert_eq!(state.rip, 0x40_0000);

        let mem = core.mem();
        assert_eq!(mem.read_u64(rsp), Some(2), "argc");
        assert_eq!(mem.read_u64(rsp + 8), Some(rsp + 24), "argv[0] pointer");
        assert_eq!(mem.read_u64(rsp + 16), Some(rsp + 24), "argv[1] pointer");
        assert_eq!(mem.read_cstr(rsp + 24, 16).as_deref(), Some("Butts"));

        // Program bytes landed at their guest address.
        assert_eq!(mem.read_u8(0x40_0000), Some(0x90));
        assert_eq!(mem.read_u8(0x40_0001), Some(0xC3));
    }
}
