//! ELF64 executable reader.
//!
//! A deliberately small, zero-copy view over a static x86-64 ELF
//! executable: enough to learn where the loadable segments go, where
//! execution starts, and to hand the segment bytes to a mapper. Dynamic
//! objects, relocations and section-level detail are out of scope: the
//! consumer maps program headers, nothing else.

use thiserror::Error;

/// ELF magic bytes.
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// `EI_CLASS` value for 64-bit objects.
const ELFCLASS64: u8 = 2;
/// `EI_DATA` value for little-endian objects.
const ELFDATA2LSB: u8 = 1;
/// `e_machine` value for x86-64.
const EM_X86_64: u16 = 62;
/// `e_type` value for executables.
const ET_EXEC: u16 = 2;
/// `p_type` value for loadable segments.
const PT_LOAD: u32 = 1;

/// Errors produced while parsing an ELF image.
#[derive(Debug, Error)]
pub enum ElfError {
    /// The file is smaller than an ELF64 header.
    #[error("file too short for an ELF64 header")]
    TooShort,
    /// The magic bytes are not `\x7fELF`.
    #[error("bad ELF magic")]
    BadMagic,
    /// Not a 64-bit little-endian object.
    #[error("unsupported ELF class/encoding (need ELF64, little-endian)")]
    UnsupportedFormat,
    /// Not an `ET_EXEC` x86-64 image.
    #[error("unsupported ELF type/machine (type={etype:#x}, machine={machine:#x})")]
    UnsupportedObject {
        /// Value of `e_type`.
        etype: u16,
        /// Value of `e_machine`.
        machine: u16,
    },
    /// A program header or segment extends past the end of the file.
    #[error("truncated ELF: {0}")]
    Truncated(&'static str),
    /// The image has no `PT_LOAD` segment.
    #[error("no loadable segments")]
    NoLoadableSegments,
}

/// A loadable program segment, borrowing its file bytes from the image.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment<'a> {
    /// Guest virtual address of the segment.
    pub vaddr: u64,
    /// File bytes (`p_filesz` long). The remainder up to [`Self::memsz`]
    /// is zero-filled by the mapper's backing pages.
    pub data: &'a [u8],
    /// Total in-memory size (`p_memsz`, >= `data.len()`).
    pub memsz: u64,
}

/// A parsed ELF64 executable.
///
/// Borrows the raw file bytes; segment data is served zero-copy.
pub struct ElfContainer<'a> {
    entry: u64,
    segments: Vec<LoadSegment<'a>>,
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(bytes)
}

impl<'a> ElfContainer<'a> {
    /// Parses an ELF64 executable from raw file bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < 64 {
            return Err(ElfError::TooShort);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedFormat);
        }

        let etype = read_u16(data, 16);
        let machine = read_u16(data, 18);
        if etype != ET_EXEC || machine != EM_X86_64 {
            return Err(ElfError::UnsupportedObject { etype, machine });
        }

        let entry = read_u64(data, 24);
        let phoff = read_u64(data, 32) as usize;
        let phentsize = read_u16(data, 54) as usize;
        let phnum = read_u16(data, 56) as usize;

        if phentsize < 56 {
            return Err(ElfError::Truncated("program header entry size"));
        }
        let table_end = phoff
            .checked_add(phentsize.checked_mul(phnum).ok_or(ElfError::TooShort)?)
            .ok_or(ElfError::TooShort)?;
        if table_end > data.len() {
            return Err(ElfError::Truncated("program header table"));
        }

        let mut segments = Vec::new();
        for i in 0..phnum {
            let ph = phoff + i * phentsize;
            if read_u32(data, ph) != PT_LOAD {
                continue;
            }
            let offset = read_u64(data, ph + 8) as usize;
            let vaddr = read_u64(data, ph + 16);
            let filesz = read_u64(data, ph + 32) as usize;
            let memsz = read_u64(data, ph + 40);

            let end = offset.checked_add(filesz).ok_or(ElfError::TooShort)?;
            if end > data.len() {
                return Err(ElfError::Truncated("segment file data"));
            }
            segments.push(LoadSegment {
                vaddr,
                data: &data[offset..end],
                memsz,
            });
        }

        if segments.is_empty() {
            return Err(ElfError::NoLoadableSegments);
        }

        Ok(Self { entry, segments })
    }

    /// Guest virtual address of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.entry
    }

    /// Returns `(lowest_vaddr, highest_vaddr, span)` over all loadable
    /// segments, where `span = highest - lowest` counts `p_memsz` (so BSS
    /// tails are covered by the mapping).
    #[must_use]
    pub fn layout(&self) -> (u64, u64, u64) {
        let low = self.segments.iter().map(|s| s.vaddr).min().unwrap_or(0);
        let high = self
            .segments
            .iter()
            .map(|s| s.vaddr + s.memsz)
            .max()
            .unwrap_or(0);
        (low, high, high - low)
    }

    /// The loadable segments in file order.
    #[must_use]
    pub fn segments(&self) -> &[LoadSegment<'a>] {
        &self.segments
    }

    /// Hands every loadable segment's file bytes to `writer` as
    /// `(bytes, guest_vaddr)`. BSS tails are not delivered; backing pages
    /// are expected to start zeroed.
    pub fn write_loadable_segments(&self, mut writer: impl FnMut(&[u8], u64)) {
        for seg in &self.segments {
            writer(seg.data, seg.vaddr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal ELF64 executable with one PT_LOAD segment holding
    /// `code` at `vaddr`.
    fn synthetic_elf(code: &[u8], vaddr: u64, entry: u64) -> Vec<u8> {
        let mut image = vec![0u8; 64 + 56];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let file_off = image.len() as u64;
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&file_off.to_le_bytes());
        image[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
        image[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        // memsz: file size plus an 0x100 BSS tail
        image[ph + 40..ph + 48].copy_from_slice(&(code.len() as u64 + 0x100).to_le_bytes());

        image.extend_from_slice(code);
        image
    }

    #[test]
    fn parses_entry_and_layout() {
        let image = synthetic_elf(&[0x90, 0x90, 0xC3], 0x40_0000, 0x40_0001);
        let elf = ElfContainer::parse(&image).expect("parse failed");
        assert_eq!(elf.entry_point(), 0x40_0001);
        let (low, high, span) = elf.layout();
        assert_eq!(low, 0x40_0000);
        assert_eq!(high, 0x40_0000 + 3 + 0x100);
        assert_eq!(span, 3 + 0x100);
    }

    #[test]
    fn delivers_segment_bytes() {
        let code = [0x48, 0x89, 0xC8];
        let image = synthetic_elf(&code, 0x40_0000, 0x40_0000);
        let elf = ElfContainer::parse(&image).expect("parse failed");
        let mut seen = Vec::new();
        elf.write_loadable_segments(|bytes, addr| seen.push((bytes.to_vec(), addr)));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, code);
        assert_eq!(seen[0].1, 0x40_0000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = synthetic_elf(&[0x90], 0x1000, 0x1000);
        image[0] = 0x7E;
        assert!(matches!(
            ElfContainer::parse(&image),
            Err(ElfError::BadMagic)
        ));
    }

    #[test]
    fn rejects_truncated_segment() {
        let mut image = synthetic_elf(&[0x90; 16], 0x1000, 0x1000);
        image.truncate(image.len() - 8);
        assert!(matches!(
            ElfContainer::parse(&image),
            Err(ElfError::Truncated(_))
        ));
    }
}
