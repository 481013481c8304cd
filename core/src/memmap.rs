//! Guest address space.
//!
//! One large file-backed shared mapping provides the physical backing for
//! the whole guest address space. Guest regions are carved out of it at
//! fixed offsets so that for every mapped region
//! `host_ptr == base + guest_offset` holds: generated code can translate a
//! guest virtual address with a single add.
//!
//! The backing is a POSIX shared-memory object (unlinked immediately after
//! creation) so that all host threads of the emulated process observe one
//! coherent guest memory.

use std::ffi::CString;
use std::sync::Mutex;

use thiserror::Error;

/// Guest page size.
pub const PAGE_SIZE: u64 = 4096;

/// Rounds `value` up to a multiple of `size`.
#[must_use]
pub const fn align_up(value: u64, size: u64) -> u64 {
    value + (size - value % size) % size
}

/// Rounds `value` down to a multiple of `size`.
#[must_use]
pub const fn align_down(value: u64, size: u64) -> u64 {
    value - value % size
}

/// Errors produced by address-space management.
#[derive(Debug, Error)]
pub enum MemmapError {
    /// `shm_open` failed.
    #[error("could not open shared memory object (errno {0})")]
    ShmOpen(i32),
    /// `ftruncate` failed.
    #[error("could not size shared memory object (errno {0})")]
    ShmSize(i32),
    /// `mmap` failed.
    #[error("could not map region at guest offset {offset:#x} (errno {errno})")]
    Map {
        /// Requested guest offset.
        offset: u64,
        /// Host errno.
        errno: i32,
    },
    /// The region overlaps an existing mapping.
    #[error("region {offset:#x}+{size:#x} overlaps an existing mapping")]
    Overlap {
        /// Requested guest offset.
        offset: u64,
        /// Requested size.
        size: u64,
    },
}

/// One mapped guest region.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    /// Host pointer to the start of the region.
    pub ptr: *mut u8,
    /// Guest offset of the region.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

// SAFETY: a `MemRegion` is a description of a mapping, not an owner of
// thread-affine state; the pointed-to pages are shared by design.
unsafe impl Send for MemRegion {}
// SAFETY: same as above; all mutation of the record itself happens under
// the `Memmap` region lock.
unsafe impl Sync for MemRegion {}

/// The shared guest address space.
pub struct Memmap {
    shm_fd: i32,
    shm_size: u64,
    base: *mut u8,
    regions: Mutex<Vec<MemRegion>>,
}

// SAFETY: the raw base pointer refers to a process-shared mapping whose
// lifetime matches the `Memmap`; the region list is behind a mutex.
unsafe impl Send for Memmap {}
// SAFETY: see above.
unsafe impl Sync for Memmap {}

impl Memmap {
    /// Creates an empty, unallocated address space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shm_fd: -1,
            shm_size: 0,
            base: std::ptr::null_mut(),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Acquires the file-backed shared region of `size` bytes and fixes the
    /// host base for the emulator's lifetime.
    ///
    /// The shm object is unlinked right after creation so nothing is left
    /// in `/dev/shm` when the emulator dies. The base is reserved by one
    /// non-fixed mapping of the whole object; every later region maps over
    /// a slice of that reservation with `MAP_FIXED`.
    pub fn allocate(&mut self, size: u64) -> Result<(), MemmapError> {
        // Unique per allocation so concurrent emulators (and test threads)
        // never collide in the O_EXCL window before the unlink below.
        static NEXT_SHM_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let id = NEXT_SHM_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        let name = CString::new(format!("/EmuSHM.{pid}.{id}")).expect("static name");
        // SAFETY: plain libc calls with a valid C string; O_EXCL guards
        // against racing another emulator instance on the same name.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(MemmapError::ShmOpen(errno()));
        }
        // SAFETY: unlink by the name we just created.
        unsafe {
            libc::shm_unlink(name.as_ptr());
        }
        // SAFETY: fd is the object just opened.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let errno = errno();
            // SAFETY: closing the fd we own.
            unsafe { libc::close(fd) };
            return Err(MemmapError::ShmSize(errno));
        }

        self.shm_fd = fd;
        self.shm_size = size;

        // Reserve the base: one mapping of the entire object, placed
        // wherever the kernel likes, never moved afterwards.
        // SAFETY: fd is valid and sized; we request a fresh mapping.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemmapError::Map {
                offset: 0,
                errno: errno(),
            });
        }
        self.base = base.cast();
        Ok(())
    }

    /// Establishes a guest region at `offset` of `size` bytes.
    ///
    /// With `fixed` (the default used everywhere after [`Self::allocate`])
    /// the host pointer is exactly `base + offset`. Returns the host
    /// pointer of the new region.
    pub fn map_region(&self, offset: u64, size: u64) -> Result<*mut u8, MemmapError> {
        let mut regions = self.regions.lock().expect("region lock poisoned");
        for region in regions.iter() {
            let overlaps = offset < region.offset + region.size && region.offset < offset + size;
            if overlaps {
                return Err(MemmapError::Overlap { offset, size });
            }
        }

        // SAFETY: the target range lies inside the base reservation made by
        // `allocate`; MAP_FIXED replaces our own reservation pages only.
        let ptr = unsafe {
            libc::mmap(
                self.base.add(offset as usize).cast(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.shm_fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemmapError::Map {
                offset,
                errno: errno(),
            });
        }
        let ptr: *mut u8 = ptr.cast();
        emu_log::debug!("mapped region {:#x}+{:#x} at {:p}", offset, size, ptr);
        regions.push(MemRegion { ptr, offset, size });
        Ok(ptr)
    }

    /// Removes the region record starting at `ptr` and releases its pages
    /// back to the base reservation.
    pub fn unmap_region(&self, ptr: *mut u8, size: u64) {
        let mut regions = self.regions.lock().expect("region lock poisoned");
        if let Some(index) = regions.iter().position(|r| r.ptr == ptr) {
            let region = regions.remove(index);
            // SAFETY: re-mapping our own reservation slice back to fresh
            // shared pages of the same object keeps the base contiguous.
            unsafe {
                libc::mmap(
                    region.ptr.cast(),
                    size as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    self.shm_fd,
                    region.offset as libc::off_t,
                );
            }
        }
    }

    /// Translates a guest address to a host pointer.
    ///
    /// Linear scan over the region list; returns `None` when the address is
    /// not inside any mapped region.
    #[must_use]
    pub fn translate(&self, guest: u64) -> Option<*mut u8> {
        let regions = self.regions.lock().expect("region lock poisoned");
        for region in regions.iter() {
            if guest >= region.offset && guest < region.offset + region.size {
                // SAFETY: in-bounds offset within the region's mapping.
                return Some(unsafe { region.ptr.add((guest - region.offset) as usize) });
            }
        }
        None
    }

    /// `base + offset`, without a bounds check.
    ///
    /// For generated code paths that already validated the guest range.
    #[must_use]
    pub fn base_offset(&self, offset: u64) -> *mut u8 {
        // SAFETY: caller contract: offset is within the allocated span.
        unsafe { self.base.add(offset as usize) }
    }

    /// Host base of the whole guest address space.
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Snapshot of the current region list, for diagnostics.
    #[must_use]
    pub fn regions(&self) -> Vec<MemRegion> {
        self.regions.lock().expect("region lock poisoned").clone()
    }

    // -- typed guest accessors ------------------------------------------------
    //
    // Every read/write below goes through `translate`, so unmapped accesses
    // surface as None/false instead of faulting the host.

    /// Reads a `u64` at a guest address.
    #[must_use]
    pub fn read_u64(&self, guest: u64) -> Option<u64> {
        // SAFETY: translate returned a pointer with at least the region
        // remainder valid; guest code that straddles a region edge is out of
        // contract for the flat layout this emulator builds.
        self.translate(guest)
            .map(|p| unsafe { p.cast::<u64>().read_unaligned() })
    }

    /// Reads a `u32` at a guest address.
    #[must_use]
    pub fn read_u32(&self, guest: u64) -> Option<u32> {
        // SAFETY: see `read_u64`.
        self.translate(guest)
            .map(|p| unsafe { p.cast::<u32>().read_unaligned() })
    }

    /// Reads a `u16` at a guest address.
    #[must_use]
    pub fn read_u16(&self, guest: u64) -> Option<u16> {
        // SAFETY: see `read_u64`.
        self.translate(guest)
            .map(|p| unsafe { p.cast::<u16>().read_unaligned() })
    }

    /// Reads a single byte at a guest address.
    #[must_use]
    pub fn read_u8(&self, guest: u64) -> Option<u8> {
        // SAFETY: see `read_u64`.
        self.translate(guest).map(|p| unsafe { p.read() })
    }

    /// Writes a `u64` to a guest address. Returns false when unmapped.
    pub fn write_u64(&self, guest: u64, value: u64) -> bool {
        match self.translate(guest) {
            // SAFETY: see `read_u64`.
            Some(p) => unsafe {
                p.cast::<u64>().write_unaligned(value);
                true
            },
            None => false,
        }
    }

    /// Writes a `u32` to a guest address. Returns false when unmapped.
    pub fn write_u32(&self, guest: u64, value: u32) -> bool {
        match self.translate(guest) {
            // SAFETY: see `read_u64`.
            Some(p) => unsafe {
                p.cast::<u32>().write_unaligned(value);
                true
            },
            None => false,
        }
    }

    /// Writes a `u16` to a guest address. Returns false when unmapped.
    pub fn write_u16(&self, guest: u64, value: u16) -> bool {
        match self.translate(guest) {
            // SAFETY: see `read_u64`.
            Some(p) => unsafe {
                p.cast::<u16>().write_unaligned(value);
                true
            },
            None => false,
        }
    }

    /// Writes a single byte to a guest address. Returns false when unmapped.
    pub fn write_u8(&self, guest: u64, value: u8) -> bool {
        match self.translate(guest) {
            // SAFETY: see `read_u64`.
            Some(p) => unsafe {
                p.write(value);
                true
            },
            None => false,
        }
    }

    /// Copies `bytes` into guest memory at `guest`. Returns false when any
    /// part of the range is unmapped.
    pub fn write_bytes(&self, guest: u64, bytes: &[u8]) -> bool {
        match self.translate(guest) {
            Some(p) => {
                if self.translate(guest + bytes.len() as u64 - 1).is_none() {
                    return false;
                }
                // SAFETY: both ends of the destination translate inside one
                // contiguous region (regions never overlap and are mapped
                // whole).
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
                }
                true
            }
            None => false,
        }
    }

    /// Reads a NUL-terminated guest string, up to `max` bytes.
    #[must_use]
    pub fn read_cstr(&self, guest: u64, max: usize) -> Option<String> {
        let mut bytes = Vec::new();
        for i in 0..max as u64 {
            let byte = self.read_u8(guest + i)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Default for Memmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Memmap {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: unmapping the reservation made in `allocate`.
            unsafe {
                libc::munmap(self.base.cast(), self.shm_size as usize);
            }
        }
        if self.shm_fd >= 0 {
            // SAFETY: closing the fd we own.
            unsafe {
                libc::close(self.shm_fd);
            }
        }
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped() -> Memmap {
        let mut mem = Memmap::new();
        mem.allocate(1 << 30).expect("shm allocation failed");
        mem
    }

    #[test]
    fn translate_is_base_plus_offset() {
        let mem = mapped();
        mem.map_region(0x1000, 0x2000).expect("map failed");
        // Invariant: translate(a) - base == a for every mapped a.
        for addr in [0x1000u64, 0x1FFF, 0x2ABC, 0x2FFF] {
            let host = mem.translate(addr).expect("address should be mapped");
            assert_eq!(host as u64 - mem.base() as u64, addr, "addr {addr:#x}");
        }
        assert!(mem.translate(0xFFF).is_none());
        assert!(mem.translate(0x3000).is_none());
    }

    #[test]
    fn regions_do_not_overlap() {
        let mem = mapped();
        mem.map_region(0x4000, 0x1000).expect("map failed");
        assert!(matches!(
            mem.map_region(0x4800, 0x1000),
            Err(MemmapError::Overlap { .. })
        ));
        // Adjacent is fine.
        mem.map_region(0x5000, 0x1000).expect("adjacent map failed");
    }

    #[test]
    fn shared_backing_is_coherent_across_regions() {
        let mem = mapped();
        mem.map_region(0x10000, 0x1000).expect("map failed");
        assert!(mem.write_u64(0x10010, 0xDEAD_BEEF));
        assert_eq!(mem.read_u64(0x10010), Some(0xDEAD_BEEF));
        // The backing pages start zeroed.
        assert_eq!(mem.read_u64(0x10800), Some(0));
    }

    #[test]
    fn cstr_read_stops_at_nul() {
        let mem = mapped();
        mem.map_region(0x20000, 0x1000).expect("map failed");
        assert!(mem.write_bytes(0x20000, b"Butts\0junk"));
        assert_eq!(mem.read_cstr(0x20000, 64).as_deref(), Some("Butts"));
    }
}
