//! Guest architectural state.
//!
//! The layout of [`X86State`] is ABI: generated native code addresses the
//! record by raw byte offsets from the context pointer, so the struct is
//! `#[repr(C)]` and the offsets are exported as constants computed with
//! `offset_of!`.

use std::mem::offset_of;

/// Internal general-purpose register numbering.
///
/// This is *not* the ModRM encoding order: the decoder maps ModRM register
/// fields through [`crate::x86::dispatch`]'s GPR index table.
pub mod reg {
    /// RAX.
    pub const RAX: usize = 0;
    /// RBX.
    pub const RBX: usize = 1;
    /// RCX.
    pub const RCX: usize = 2;
    /// RDX.
    pub const RDX: usize = 3;
    /// RSI.
    pub const RSI: usize = 4;
    /// RDI.
    pub const RDI: usize = 5;
    /// RBP.
    pub const RBP: usize = 6;
    /// RSP.
    pub const RSP: usize = 7;
    /// R8.
    pub const R8: usize = 8;
    /// R9.
    pub const R9: usize = 9;
    /// R10.
    pub const R10: usize = 10;
    /// R11.
    pub const R11: usize = 11;
    /// R12.
    pub const R12: usize = 12;
    /// R13.
    pub const R13: usize = 13;
    /// R14.
    pub const R14: usize = 14;
    /// R15.
    pub const R15: usize = 15;

    /// ModRM-encoding-order register map: index = (rex_bit << 3) | bits.
    ///
    /// The hardware encoding order differs from the internal numbering
    /// above; every ModRM/opcode-embedded register field goes through this
    /// table.
    pub const MODRM_ORDER: [usize; 16] = [
        RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15,
    ];

    /// Register display name.
    #[must_use]
    pub const fn name(index: usize) -> &'static str {
        match index {
            RAX => "RAX",
            RBX => "RBX",
            RCX => "RCX",
            RDX => "RDX",
            RSI => "RSI",
            RDI => "RDI",
            RBP => "RBP",
            RSP => "RSP",
            R8 => "R8",
            R9 => "R9",
            R10 => "R10",
            R11 => "R11",
            R12 => "R12",
            R13 => "R13",
            R14 => "R14",
            R15 => "R15",
            _ => "UNK",
        }
    }
}

/// RFLAGS bit positions the lifter materializes.
pub mod flag_bit {
    /// Carry flag.
    pub const CF: u64 = 0;
    /// Zero flag.
    pub const ZF: u64 = 6;
    /// Sign flag.
    pub const SF: u64 = 7;
    /// Overflow flag.
    pub const OF: u64 = 11;
}

/// Per-thread guest architectural state.
///
/// The host address of this record is the "context pointer" handed to every
/// generated native block.
#[repr(C)]
#[derive(Clone)]
pub struct X86State {
    /// Instruction pointer.
    pub rip: u64,
    /// General-purpose registers, indexed by [`reg`].
    pub gregs: [u64; 16],
    /// SSE registers as two 64-bit halves each.
    pub xmm: [[u64; 2]; 16],
    /// GS segment base.
    pub gs: u64,
    /// FS segment base.
    pub fs: u64,
    /// Flags register; only CF/ZF/SF/OF are maintained by lifted code.
    pub rflags: u64,
}

impl X86State {
    /// Fresh state with the poison pattern the emulator seeds XMM with.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rip: !0,
            gregs: [0; 16],
            xmm: [[0xDEAD_BEEF, 0xBAD0_DAD1]; 16],
            gs: 0,
            fs: 0,
            rflags: 0,
        }
    }

    /// Context offset of the RIP slot.
    pub const RIP_OFFSET: u64 = offset_of!(X86State, rip) as u64;
    /// Context offset of `gregs[0]`.
    pub const GREGS_OFFSET: u64 = offset_of!(X86State, gregs) as u64;
    /// Context offset of `xmm[0][0]`.
    pub const XMM_OFFSET: u64 = offset_of!(X86State, xmm) as u64;
    /// Context offset of the GS base.
    pub const GS_OFFSET: u64 = offset_of!(X86State, gs) as u64;
    /// Context offset of the FS base.
    pub const FS_OFFSET: u64 = offset_of!(X86State, fs) as u64;
    /// Context offset of RFLAGS.
    pub const RFLAGS_OFFSET: u64 = offset_of!(X86State, rflags) as u64;

    /// Context offset of a general-purpose register.
    #[must_use]
    pub const fn greg_offset(index: usize) -> u64 {
        Self::GREGS_OFFSET + (index as u64) * 8
    }
}

impl Default for X86State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_offsets_are_stable() {
        // Generated code bakes these in; pin them.
        assert_eq!(X86State::RIP_OFFSET, 0);
        assert_eq!(X86State::GREGS_OFFSET, 8);
        assert_eq!(X86State::XMM_OFFSET, 8 + 16 * 8);
        assert_eq!(X86State::GS_OFFSET, 8 + 16 * 8 + 16 * 16);
        assert_eq!(X86State::FS_OFFSET, X86State::GS_OFFSET + 8);
        assert_eq!(X86State::RFLAGS_OFFSET, X86State::FS_OFFSET + 8);
        assert_eq!(X86State::greg_offset(reg::RSP), 8 + 7 * 8);
    }
}
