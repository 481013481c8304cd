//! Guest file-descriptor management.
//!
//! The guest's descriptor table is simulated: descriptors handed out by
//! `openat` are book-keeping entries, while the standard streams forward
//! straight to the host. Everything the emulator cannot (or does not yet)
//! service answers the way the kernel would: `-1`.

use std::collections::HashMap;

use crate::Memmap;

/// A guest file descriptor.
pub struct FdEntry {
    /// The guest-visible descriptor number.
    pub fd: i32,
    /// Path the guest opened.
    pub name: String,
    /// Open flags as passed by the guest.
    pub flags: i32,
    /// Mode as passed by the guest.
    pub mode: u32,
}

/// Owns the simulated descriptor table.
pub struct FileManager {
    next_fd: i32,
    fds: HashMap<i32, FdEntry>,
}

const NEG1: u64 = -1i64 as u64;

impl FileManager {
    /// Creates the table; descriptors start after the standard streams.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_fd: 3,
            fds: HashMap::new(),
        }
    }

    /// `read(2)`: not serviced yet; reads return 0 (EOF).
    pub fn read(&mut self, fd: i32, _buf: u64, _count: u64) -> u64 {
        emu_log::debug!("read({fd}) unserviced, returning EOF");
        0
    }

    /// `write(2)`: forwarded to the host descriptor of the same number.
    pub fn write(&mut self, mem: &Memmap, fd: i32, buf: u64, count: u64) -> u64 {
        let Some(host_ptr) = mem.translate(buf) else {
            return NEG1;
        };
        if mem.translate(buf + count.saturating_sub(1)).is_none() {
            return NEG1;
        }
        // SAFETY: both ends of the guest buffer translate inside one
        // mapped region.
        let written = unsafe { libc::write(fd, host_ptr.cast(), count as usize) };
        written as u64
    }

    /// `open(2)`: accepted and ignored (legacy path of `openat`).
    pub fn open(&mut self, pathname: &str, _flags: i32, _mode: u32) -> u64 {
        emu_log::debug!("open({pathname}) unserviced");
        0
    }

    /// `close(2)`: drops the book-keeping entry when one exists.
    pub fn close(&mut self, fd: i32) -> u64 {
        self.fds.remove(&fd);
        0
    }

    /// `fstat(2)`: forwarded to the host for the standard output streams,
    /// refused for everything else.
    pub fn fstat(&mut self, mem: &Memmap, fd: i32, buf: u64) -> u64 {
        if fd == libc::STDOUT_FILENO || fd == libc::STDERR_FILENO {
            // SAFETY: fstat fills the zeroed host struct.
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            // SAFETY: valid pointer to the struct above.
            let result = unsafe { libc::fstat(fd, &mut stat) };
            if result == 0 {
                let bytes: &[u8] = {
                    let ptr = std::ptr::from_ref(&stat).cast::<u8>();
                    // SAFETY: plain-old-data view of the host struct.
                    unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<libc::stat>()) }
                };
                if !mem.write_bytes(buf, bytes) {
                    return NEG1;
                }
            }
            result as u64
        } else {
            emu_log::debug!("fstat on unknown fd {fd}");
            NEG1
        }
    }

    /// `lseek(2)`: not serviced yet.
    pub fn lseek(&mut self, fd: i32, _offset: u64, _whence: i32) -> u64 {
        emu_log::debug!("lseek({fd}) unserviced");
        0
    }

    /// `writev(2)`: standard streams gather-write to the host; simulated
    /// descriptors log and report the byte count; unknown descriptors are
    /// refused.
    pub fn writev(&mut self, mem: &Memmap, fd: i32, iov: u64, iovcnt: u64) -> u64 {
        let known = self.fds.contains_key(&fd);
        let stdio = fd == libc::STDOUT_FILENO || fd == libc::STDERR_FILENO;
        if !known && !stdio {
            emu_log::debug!("writev on unknown fd {fd}");
            return NEG1;
        }

        let mut total: u64 = 0;
        for i in 0..iovcnt {
            let entry = iov + i * 16;
            let (Some(base), Some(len)) = (mem.read_u64(entry), mem.read_u64(entry + 8)) else {
                return NEG1;
            };
            if stdio {
                let written = self.write(mem, fd, base, len);
                if written == NEG1 {
                    return NEG1;
                }
                total += written;
            } else {
                emu_log::debug!("writev[{i}] fd {fd}: {len} bytes at {base:#x}");
                total += len;
            }
        }
        total
    }

    /// `access(2)`: refused.
    pub fn access(&mut self, pathname: &str, _mode: i32) -> u64 {
        emu_log::debug!("access({pathname}) refused");
        NEG1
    }

    /// `readlink(2)`: refused.
    pub fn readlink(&mut self, path: &str, _buf: u64, _bufsiz: u64) -> u64 {
        emu_log::debug!("readlink({path}) refused");
        NEG1
    }

    /// `openat(2)`: allocates a simulated descriptor.
    pub fn openat(&mut self, _dirfd: i32, pathname: &str, flags: i32, mode: u32) -> u64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        emu_log::debug!("opened {pathname} as fd {fd}");
        self.fds.insert(
            fd,
            FdEntry {
                fd,
                name: pathname.to_owned(),
                flags,
                mode,
            },
        );
        fd as u64
    }
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openat_allocates_dense_descriptors() {
        let mut files = FileManager::new();
        assert_eq!(files.openat(-100, "/dev/tty", 0, 0), 3);
        assert_eq!(files.openat(-100, "/etc/ld.so.cache", 0, 0), 4);
        assert_eq!(files.close(3), 0);
        assert_eq!(files.openat(-100, "/again", 0, 0), 5);
    }

    #[test]
    fn writev_refuses_unknown_descriptors() {
        let mut files = FileManager::new();
        let mut mem = Memmap::new();
        mem.allocate(1 << 24).expect("shm allocation failed");
        assert_eq!(files.writev(&mem, 9, 0, 0), NEG1);
    }

    #[test]
    fn writev_counts_simulated_descriptors() {
        let mut files = FileManager::new();
        let mut mem = Memmap::new();
        mem.allocate(1 << 24).expect("shm allocation failed");
        mem.map_region(0x1000, 0x1000).expect("map failed");
        // One iovec: base 0x1100, len 5.
        assert!(mem.write_u64(0x1000, 0x1100));
        assert!(mem.write_u64(0x1008, 5));
        let fd = files.openat(-100, "/dev/tty", 0, 0) as i32;
        assert_eq!(files.writev(&mem, fd, 0x1000, 1), 5);
    }
}
