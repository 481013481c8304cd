//! Static x86-64 instruction tables.
//!
//! Three maps drive the decoder: the one-byte map, the two-byte map
//! (`0F xx`), and a ModRM-extension map for group opcodes, keyed
//! `(opcode << 8) | (modrm.reg & mask)` where `mask` comes from the group
//! entry's `more_bytes` field (the group prefix entries reuse that field as
//! a reg-bit count). The three-byte `0F 38`/`0F 3A` maps are acknowledged
//! by the decoder but intentionally left empty.
//!
//! Entries record only what block formation and length computation need:
//! an instruction class, the flag set below, and the count of fixed
//! trailing bytes (immediates). Lifting behavior is attached afterwards by
//! [`crate::x86::dispatch::install_handlers`].

use std::sync::OnceLock;

use bitflags::bitflags;

use super::decoder::DecodedInst;
use super::dispatch::OpDispatchBuilder;

bitflags! {
    /// Static per-instruction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstFlags: u8 {
        /// The instruction always carries a ModRM byte.
        const HAS_MODRM = 1 << 0;
        /// Immediate width doubles under REX.W.
        const DISPLACE_SIZE_MUL_2 = 1 << 1;
        /// Immediate width halves under an operand-size prefix.
        const DISPLACE_SIZE_DIV_2 = 1 << 2;
        /// The low opcode bits encode a register; a REX prefix never
        /// implies ModRM for these.
        const REX_IN_BYTE = 1 << 3;
        /// The instruction writes RIP itself; the lifter ends the block
        /// with a zero RIP increment.
        const SETS_RIP = 1 << 4;
        /// The instruction ends a block.
        const BLOCK_END = 1 << 5;
    }
}

bitflags! {
    /// Run-time observations made while decoding one instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DecodeFlags: u8 {
        /// A REX prefix was consumed.
        const REX = 1 << 0;
        /// A 0x66 operand-size prefix was consumed.
        const OPSIZE = 1 << 1;
        /// A 0x67 address-size prefix was consumed.
        const ADSIZE = 1 << 2;
        /// A ModRM byte is part of the encoding.
        const MODRM = 1 << 3;
        /// A SIB byte is part of the encoding.
        const SIB = 1 << 4;
        /// A LOCK prefix was consumed.
        const LOCK = 1 << 5;
    }
}

/// Instruction class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstClass {
    /// No entry; decoding fails.
    Unknown,
    /// Encodable but architecturally invalid in 64-bit mode.
    Invalid,
    /// Legacy prefix (segment overrides, REP/REPNZ, 0x66/0x67, LOCK).
    LegacyPrefix,
    /// REX prefix byte (0x40..0x4F).
    RexPrefix,
    /// Group opcode; the real entry lives in the ModRM-extension map.
    ModRmTablePrefix,
    /// A real instruction.
    Inst,
}

/// Handler that lifts one decoded instruction into IR.
pub type DispatchFn = fn(&mut OpDispatchBuilder, &DecodedInst, &[u8]);

/// Static metadata for one opcode.
#[derive(Clone, Copy)]
pub struct InstInfo {
    /// Mnemonic, for diagnostics.
    pub name: &'static str,
    /// Instruction class.
    pub class: InstClass,
    /// Static flags.
    pub flags: InstFlags,
    /// Fixed trailing byte count (immediate), before displacement scaling.
    /// For [`InstClass::ModRmTablePrefix`] entries this is the count of
    /// significant `modrm.reg` bits instead.
    pub more_bytes: u8,
    /// IR lifter, when one exists.
    pub dispatch: Option<DispatchFn>,
}

const UNKNOWN: InstInfo = InstInfo {
    name: "UND",
    class: InstClass::Unknown,
    flags: InstFlags::empty(),
    more_bytes: 0,
    dispatch: None,
};

const fn info(name: &'static str, class: InstClass, flags: InstFlags, more_bytes: u8) -> InstInfo {
    InstInfo {
        name,
        class,
        flags,
        more_bytes,
        dispatch: None,
    }
}

/// The three decode maps.
pub struct Tables {
    /// One-byte opcode map.
    pub base: Vec<InstInfo>,
    /// Two-byte (`0F xx`) opcode map.
    pub second: Vec<InstInfo>,
    /// ModRM-extension map, keyed `(opcode << 8) | reg`.
    pub modrm: Vec<InstInfo>,
}

fn fill(table: &mut [InstInfo], entries: &[(u16, u8, InstInfo)]) {
    for &(opcode, count, entry) in entries {
        for i in 0..u16::from(count) {
            let index = usize::from(opcode + i);
            emu_log::throw_assert!(
                matches!(table[index].class, InstClass::Unknown),
                "duplicate table entry for opcode {index:#x}"
            );
            table[index] = entry;
        }
    }
}

#[rustfmt::skip]
fn build_tables() -> Tables {
    use InstClass::{Inst, Invalid, LegacyPrefix, ModRmTablePrefix, RexPrefix};

    const NONE: InstFlags = InstFlags::empty();
    const MODRM: InstFlags = InstFlags::HAS_MODRM;
    const DIV2: InstFlags = InstFlags::DISPLACE_SIZE_DIV_2;
    const MUL2: InstFlags = InstFlags::DISPLACE_SIZE_MUL_2;
    const REXB: InstFlags = InstFlags::REX_IN_BYTE;
    const RIP_END: InstFlags = InstFlags::SETS_RIP.union(InstFlags::BLOCK_END);

    let base_entries: &[(u16, u8, InstInfo)] = &[
        // Prefixes
        (0x66, 1, info("",      LegacyPrefix, NONE, 0)),
        (0x67, 1, info("",      LegacyPrefix, NONE, 0)),
        (0x2E, 1, info("CS",    LegacyPrefix, NONE, 0)),
        (0x3E, 1, info("DS",    LegacyPrefix, NONE, 0)),
        (0x26, 1, info("ES",    LegacyPrefix, NONE, 0)),
        (0x64, 1, info("FS",    LegacyPrefix, NONE, 0)),
        (0x65, 1, info("GS",    LegacyPrefix, NONE, 0)),
        (0x36, 1, info("SS",    LegacyPrefix, NONE, 0)),
        (0xF0, 1, info("LOCK",  LegacyPrefix, NONE, 0)),
        (0xF2, 1, info("REP",   LegacyPrefix, NONE, 0)),
        (0xF3, 1, info("REPNZ", LegacyPrefix, NONE, 0)),

        // REX
        (0x40, 16, info("", RexPrefix, NONE, 0)),

        // Instructions
        (0x01, 1, info("ADD",    Inst, MODRM.union(DIV2), 0)),
        (0x03, 1, info("ADD",    Inst, MODRM,             0)),
        (0x05, 1, info("ADD",    Inst, DIV2,              4)),
        (0x08, 4, info("OR",     Inst, MODRM,             0)),
        (0x20, 4, info("AND",    Inst, MODRM,             0)),
        (0x25, 1, info("AND",    Inst, DIV2,              4)),
        (0x29, 1, info("SUB",    Inst, MODRM.union(DIV2), 0)),
        (0x2B, 1, info("SUB",    Inst, MODRM,             0)),
        (0x2C, 1, info("SUB",    Inst, NONE,              1)),
        (0x2D, 1, info("SUB",    Inst, DIV2,              4)),
        (0x30, 4, info("XOR",    Inst, MODRM,             0)),
        (0x38, 4, info("CMP",    Inst, MODRM,             0)),
        (0x3C, 1, info("CMP",    Inst, NONE,              1)),
        (0x3D, 1, info("CMP",    Inst, REXB.union(DIV2),  4)),
        (0x50, 8, info("PUSH",   Inst, REXB,              0)),
        (0x58, 8, info("POP",    Inst, REXB,              0)),
        (0x63, 1, info("MOVSXD", Inst, MODRM,             0)),
        (0x69, 1, info("IMUL",   Inst, MODRM.union(DIV2), 4)),
        (0x70, 1, info("JO",     Inst, NONE,              1)),
        (0x71, 1, info("JNO",    Inst, NONE,              1)),
        (0x72, 1, info("JB",     Inst, NONE,              1)),
        (0x73, 1, info("JNB",    Inst, NONE,              1)),
        (0x74, 1, info("JZ",     Inst, NONE,              1)),
        (0x75, 1, info("JNZ",    Inst, NONE,              1)),
        (0x76, 1, info("JBE",    Inst, NONE,              1)),
        (0x77, 1, info("JNBE",   Inst, NONE,              1)),
        (0x78, 1, info("JS",     Inst, NONE,              1)),
        (0x79, 1, info("JNS",    Inst, NONE,              1)),
        (0x7A, 1, info("JP",     Inst, NONE,              1)),
        (0x7B, 1, info("JNP",    Inst, NONE,              1)),
        (0x7C, 1, info("JL",     Inst, NONE,              1)),
        (0x7D, 1, info("JNL",    Inst, NONE,              1)),
        (0x7E, 1, info("JLE",    Inst, NONE,              1)),
        (0x7F, 1, info("JNLE",   Inst, NONE,              1)),
        (0x82, 1, info("[INV]",  Invalid, NONE,           0)),
        (0x84, 2, info("TEST",   Inst, MODRM,             0)),
        (0x88, 5, info("MOV",    Inst, MODRM,             0)),
        (0x8D, 1, info("LEA",    Inst, MODRM,             0)),
        (0x8E, 1, info("MOV",    Inst, MODRM,             0)),
        (0x90, 1, info("NOP",    Inst, NONE,              0)),
        (0x98, 1, info("CDQE",   Inst, NONE,              0)),
        (0x99, 1, info("CQO",    Inst, NONE,              0)),
        (0xA0, 4, info("MOV",    Inst, NONE,              0)),
        (0xA8, 1, info("TEST",   Inst, NONE,              1)),
        (0xA9, 1, info("TEST",   Inst, DIV2,              4)),
        (0xAA, 2, info("STOS",   Inst, NONE,              0)),
        (0xB0, 8, info("MOV",    Inst, REXB,              1)),
        (0xB8, 8, info("MOV",    Inst, REXB.union(DIV2).union(MUL2), 4)),
        (0xC2, 2, info("RET",    Inst, RIP_END,           0)),
        (0xC4, 2, info("[INV]",  Invalid, NONE,           0)),
        (0xC6, 1, info("MOV",    Inst, MODRM,             1)),
        (0xC7, 1, info("MOV",    Inst, MODRM,             4)),
        (0xD4, 3, info("[INV]",  Invalid, NONE,           0)),
        (0xE8, 1, info("CALL",   Inst, RIP_END.union(DIV2), 4)),
        (0xE9, 1, info("JMP",    Inst, RIP_END.union(DIV2), 4)),
        (0xEB, 1, info("JMP",    Inst, RIP_END,           1)),

        // ModRM-extension groups; more_bytes holds the reg-bit count.
        (0x80, 1, info("", ModRmTablePrefix, MODRM, 3)),
        (0x81, 1, info("", ModRmTablePrefix, MODRM, 3)),
        (0x83, 1, info("", ModRmTablePrefix, MODRM, 3)),
        (0xC0, 1, info("", ModRmTablePrefix, MODRM, 3)),
        (0xC1, 1, info("", ModRmTablePrefix, MODRM, 3)),
        (0xD0, 4, info("", ModRmTablePrefix, MODRM, 3)),
        (0xD8, 1, info("", ModRmTablePrefix, MODRM, 3)),
        (0xF6, 2, info("", ModRmTablePrefix, MODRM, 3)),
        (0xFF, 1, info("", ModRmTablePrefix, MODRM, 3)),
    ];

    let second_entries: &[(u16, u8, InstInfo)] = &[
        (0x05, 1, info("SYSCALL", Inst, RIP_END,        0)),
        (0x1F, 1, info("NOP",     Inst, MODRM,          0)),
        (0x31, 1, info("RDTSC",   Inst, NONE,           0)),
        (0x40, 1, info("CMOVO",   Inst, MODRM,          0)),
        (0x41, 1, info("CMOVNO",  Inst, MODRM,          0)),
        (0x42, 1, info("CMOVB",   Inst, MODRM,          0)),
        (0x43, 1, info("CMOVNB",  Inst, MODRM,          0)),
        (0x44, 1, info("CMOVZ",   Inst, MODRM,          0)),
        (0x45, 1, info("CMOVNZ",  Inst, MODRM,          0)),
        (0x46, 1, info("CMOVBE",  Inst, MODRM,          0)),
        (0x47, 1, info("CMOVNBE", Inst, MODRM,          0)),
        (0x48, 1, info("CMOVS",   Inst, MODRM,          0)),
        (0x49, 1, info("CMOVNS",  Inst, MODRM,          0)),
        (0x4A, 1, info("CMOVP",   Inst, MODRM,          0)),
        (0x4B, 1, info("CMOVNP",  Inst, MODRM,          0)),
        (0x4C, 1, info("CMOVL",   Inst, MODRM,          0)),
        (0x4D, 1, info("CMOVNL",  Inst, MODRM,          0)),
        (0x4E, 1, info("CMOVLE",  Inst, MODRM,          0)),
        (0x4F, 1, info("CMOVNLE", Inst, MODRM,          0)),

        (0x6E, 1, info("MOVD",    Inst, MODRM,          0)),
        (0x6F, 1, info("MOVDQU",  Inst, MODRM,          0)),
        (0x7E, 1, info("MOVD",    Inst, MODRM,          0)),
        (0x7F, 1, info("MOVDQU",  Inst, MODRM,          0)),

        (0x80, 1, info("JO",      Inst, DIV2,           4)),
        (0x81, 1, info("JNO",     Inst, DIV2,           4)),
        (0x82, 1, info("JB",      Inst, DIV2,           4)),
        (0x83, 1, info("JNB",     Inst, DIV2,           4)),
        (0x84, 1, info("JZ",      Inst, DIV2,           4)),
        (0x85, 1, info("JNZ",     Inst, DIV2,           4)),
        (0x86, 1, info("JBE",     Inst, DIV2,           4)),
        (0x87, 1, info("JNBE",    Inst, DIV2,           4)),
        (0x88, 1, info("JS",      Inst, DIV2,           4)),
        (0x89, 1, info("JNS",     Inst, DIV2,           4)),
        (0x8A, 1, info("JP",      Inst, DIV2,           4)),
        (0x8B, 1, info("JNP",     Inst, DIV2,           4)),
        (0x8C, 1, info("JL",      Inst, DIV2,           4)),
        (0x8D, 1, info("JNL",     Inst, DIV2,           4)),
        (0x8E, 1, info("JLE",     Inst, DIV2,           4)),
        (0x8F, 1, info("JNLE",    Inst, DIV2,           4)),
        (0x90, 1, info("SETO",    Inst, MODRM,          0)),
        (0x91, 1, info("SETNO",   Inst, MODRM,          0)),
        (0x92, 1, info("SETB",    Inst, MODRM,          0)),
        (0x93, 1, info("SETNB",   Inst, MODRM,          0)),
        (0x94, 1, info("SETZ",    Inst, MODRM,          0)),
        (0x95, 1, info("SETNZ",   Inst, MODRM,          0)),
        (0x96, 1, info("SETBE",   Inst, MODRM,          0)),
        (0x97, 1, info("SETNBE",  Inst, MODRM,          0)),
        (0x98, 1, info("SETS",    Inst, MODRM,          0)),
        (0x99, 1, info("SETNS",   Inst, MODRM,          0)),
        (0x9A, 1, info("SETP",    Inst, MODRM,          0)),
        (0x9B, 1, info("SETNP",   Inst, MODRM,          0)),
        (0x9C, 1, info("SETL",    Inst, MODRM,          0)),
        (0x9D, 1, info("SETNL",   Inst, MODRM,          0)),
        (0x9E, 1, info("SETLE",   Inst, MODRM,          0)),
        (0x9F, 1, info("SETNLE",  Inst, MODRM,          0)),
        (0xA2, 1, info("CPUID",   Inst, NONE,           0)),
        (0xA3, 1, info("BT",      Inst, MODRM,          0)),
        (0xAF, 1, info("IMUL",    Inst, MODRM,          0)),
        (0xB0, 2, info("CMPXCHG", Inst, MODRM,          0)),
        (0xB6, 2, info("MOVZX",   Inst, MODRM,          0)),
        (0xBA, 1, info("BT",      Inst, MODRM,          1)),
        (0xBC, 2, info("BSF",     Inst, MODRM,          0)),
        (0xBE, 2, info("MOVSX",   Inst, MODRM,          0)),

        // SSE
        (0x10, 2, info("MOVUPS",     Inst, MODRM,      0)),
        (0x16, 2, info("MOVHPS",     Inst, MODRM,      0)),
        (0x29, 1, info("MOVAPS",     Inst, MODRM,      0)),
        (0xEB, 1, info("POR",        Inst, MODRM,      0)),

        // SSE2
        (0x60, 1, info("PUNPCKLBW",  Inst, MODRM,      0)),
        (0x61, 1, info("PUNPCKLWD",  Inst, MODRM,      0)),
        (0x62, 1, info("PUNPCKLDQ",  Inst, MODRM,      0)),
        (0x66, 1, info("PCMPGTD",    Inst, MODRM,      0)),
        (0x6A, 1, info("PUNPCKHDQ",  Inst, MODRM,      0)),
        (0x6C, 1, info("PUNPCKLQDQ", Inst, MODRM,      0)),
        (0x6D, 1, info("PUNPCKHQDQ", Inst, MODRM,      0)),
        (0x70, 1, info("PSHUFD",     Inst, MODRM,      1)),
        (0x72, 1, info("PSLLD",      Inst, MODRM,      1)),
        (0x73, 1, info("PSLLQ",      Inst, MODRM,      1)),
        (0x74, 1, info("PCMPEQB",    Inst, MODRM,      0)),
        (0x76, 1, info("PCMPEQD",    Inst, MODRM,      0)),
        (0xD4, 1, info("PADDQ",      Inst, MODRM,      0)),
        (0xD6, 1, info("MOVQ",       Inst, MODRM,      0)),
        (0xD7, 1, info("PMOVMSKB",   Inst, MODRM,      0)),
        (0xEF, 1, info("PXOR",       Inst, MODRM,      0)),
        (0xFE, 1, info("PADDD",      Inst, MODRM,      0)),
    ];

    let modrm_entries: &[(u16, u8, InstInfo)] = &[
        (0x8000, 1, info("ADD",  Inst, MODRM,              1)),
        (0x8001, 1, info("OR",   Inst, MODRM,              1)),
        (0x8002, 1, info("ADC",  Inst, MODRM,              1)),
        (0x8003, 1, info("SBB",  Inst, MODRM,              1)),
        (0x8004, 1, info("AND",  Inst, MODRM,              1)),
        (0x8005, 1, info("SUB",  Inst, MODRM,              1)),
        (0x8006, 1, info("XOR",  Inst, MODRM,              1)),
        (0x8007, 1, info("CMP",  Inst, MODRM,              1)),

        (0x8100, 1, info("ADD",  Inst, MODRM.union(DIV2),  4)),
        (0x8101, 1, info("OR",   Inst, MODRM.union(DIV2),  4)),
        (0x8102, 1, info("ADC",  Inst, MODRM.union(DIV2),  4)),
        (0x8103, 1, info("SBB",  Inst, MODRM.union(DIV2),  4)),
        (0x8104, 1, info("AND",  Inst, MODRM.union(DIV2),  4)),
        (0x8105, 1, info("SUB",  Inst, MODRM.union(DIV2),  4)),
        (0x8106, 1, info("XOR",  Inst, MODRM.union(DIV2),  4)),
        (0x8107, 1, info("CMP",  Inst, MODRM.union(DIV2),  4)),

        (0x8300, 1, info("ADD",  Inst, MODRM,              1)),
        (0x8301, 1, info("OR",   Inst, MODRM,              1)),
        (0x8302, 1, info("ADC",  Inst, MODRM,              1)),
        (0x8303, 1, info("SBB",  Inst, MODRM,              1)),
        (0x8304, 1, info("AND",  Inst, MODRM,              1)),
        (0x8305, 1, info("SUB",  Inst, MODRM,              1)),
        (0x8306, 1, info("XOR",  Inst, MODRM,              1)),
        (0x8307, 1, info("CMP",  Inst, MODRM,              1)),

        (0xC000, 1, info("ROL",  Inst, MODRM,              1)),
        (0xC001, 1, info("ROR",  Inst, MODRM,              1)),
        (0xC002, 1, info("RCL",  Inst, MODRM,              1)),
        (0xC003, 1, info("RCR",  Inst, MODRM,              1)),
        (0xC004, 1, info("SHL",  Inst, MODRM,              1)),
        (0xC005, 1, info("SHR",  Inst, MODRM,              1)),
        (0xC006, 1, info("SHL",  Inst, MODRM,              1)),
        (0xC007, 1, info("SAR",  Inst, MODRM,              1)),

        (0xC100, 1, info("ROL",  Inst, MODRM,              1)),
        (0xC101, 1, info("ROR",  Inst, MODRM,              1)),
        (0xC102, 1, info("RCL",  Inst, MODRM,              1)),
        (0xC103, 1, info("RCR",  Inst, MODRM,              1)),
        (0xC104, 1, info("SHL",  Inst, MODRM,              1)),
        (0xC105, 1, info("SHR",  Inst, MODRM,              1)),
        (0xC106, 1, info("SHL",  Inst, MODRM,              1)),
        (0xC107, 1, info("SAR",  Inst, MODRM,              1)),

        (0xD000, 1, info("ROL",  Inst, MODRM,              0)),
        (0xD001, 1, info("ROR",  Inst, MODRM,              0)),
        (0xD002, 1, info("RCL",  Inst, MODRM,              0)),
        (0xD003, 1, info("RCR",  Inst, MODRM,              0)),
        (0xD004, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD005, 1, info("SHR",  Inst, MODRM,              0)),
        (0xD006, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD007, 1, info("SAR",  Inst, MODRM,              0)),

        (0xD100, 1, info("ROL",  Inst, MODRM,              0)),
        (0xD101, 1, info("ROR",  Inst, MODRM,              0)),
        (0xD102, 1, info("RCL",  Inst, MODRM,              0)),
        (0xD103, 1, info("RCR",  Inst, MODRM,              0)),
        (0xD104, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD105, 1, info("SHR",  Inst, MODRM,              0)),
        (0xD106, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD107, 1, info("SAR",  Inst, MODRM,              0)),

        (0xD200, 1, info("ROL",  Inst, MODRM,              0)),
        (0xD201, 1, info("ROR",  Inst, MODRM,              0)),
        (0xD202, 1, info("RCL",  Inst, MODRM,              0)),
        (0xD203, 1, info("RCR",  Inst, MODRM,              0)),
        (0xD204, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD205, 1, info("SHR",  Inst, MODRM,              0)),
        (0xD206, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD207, 1, info("SAR",  Inst, MODRM,              0)),

        (0xD300, 1, info("ROL",  Inst, MODRM,              0)),
        (0xD301, 1, info("ROR",  Inst, MODRM,              0)),
        (0xD302, 1, info("RCL",  Inst, MODRM,              0)),
        (0xD303, 1, info("RCR",  Inst, MODRM,              0)),
        (0xD304, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD305, 1, info("SHR",  Inst, MODRM,              0)),
        (0xD306, 1, info("SHL",  Inst, MODRM,              0)),
        (0xD307, 1, info("SAR",  Inst, MODRM,              0)),

        (0xF600, 2, info("TEST", Inst, MODRM,              1)),
        (0xF604, 1, info("MUL",  Inst, MODRM,              0)),
        (0xF606, 1, info("DIV",  Inst, MODRM,              1)),
        (0xF700, 2, info("TEST", Inst, MODRM.union(DIV2),  4)),
        (0xF702, 1, info("NOT",  Inst, MODRM,              0)),
        (0xF703, 1, info("NEG",  Inst, MODRM,              0)),
        (0xF704, 1, info("MUL",  Inst, MODRM,              0)),
        (0xF705, 1, info("IMUL", Inst, MODRM,              0)),
        (0xF706, 1, info("DIV",  Inst, MODRM,              0)),
        (0xF707, 1, info("IDIV", Inst, MODRM,              0)),

        (0xFF00, 1, info("INC",   Inst, MODRM,                          0)),
        (0xFF01, 1, info("DEC",   Inst, MODRM,                          0)),
        (0xFF02, 1, info("CALL",  Inst, RIP_END.union(MODRM),           0)),
        (0xFF03, 1, info("CALLF", Inst, RIP_END.union(MODRM),           0)),
        (0xFF04, 1, info("JMP",   Inst, RIP_END.union(MODRM),           0)),
        (0xFF05, 1, info("JMPF",  Inst, RIP_END.union(MODRM),           0)),
        (0xFF06, 1, info("PUSH",  Inst, MODRM,                          0)),
    ];

    let mut tables = Tables {
        base: vec![UNKNOWN; 256],
        second: vec![UNKNOWN; 256],
        modrm: vec![UNKNOWN; 1 << 16],
    };
    fill(&mut tables.base, base_entries);
    fill(&mut tables.second, second_entries);
    fill(&mut tables.modrm, modrm_entries);
    super::dispatch::install_handlers(&mut tables);
    tables
}

static TABLES: OnceLock<Tables> = OnceLock::new();

/// The process-wide instruction tables, built on first use.
pub fn tables() -> &'static Tables {
    TABLES.get_or_init(build_tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_classes_are_prefixes() {
        let t = tables();
        for opcode in [0x66usize, 0x67, 0x2E, 0x3E, 0x26, 0x64, 0x65, 0x36, 0xF0, 0xF2, 0xF3] {
            assert!(
                matches!(t.base[opcode].class, InstClass::LegacyPrefix),
                "opcode {opcode:#x} should be a legacy prefix"
            );
        }
        for opcode in 0x40..=0x4F {
            assert!(matches!(t.base[opcode].class, InstClass::RexPrefix));
        }
    }

    #[test]
    fn block_enders_carry_flags() {
        let t = tables();
        // RET, CALL, JMP set RIP and end blocks.
        for opcode in [0xC2usize, 0xC3, 0xE8, 0xE9, 0xEB] {
            assert!(t.base[opcode].flags.contains(InstFlags::SETS_RIP));
            assert!(t.base[opcode].flags.contains(InstFlags::BLOCK_END));
        }
        // SYSCALL too (two-byte map).
        assert!(t.second[0x05].flags.contains(InstFlags::BLOCK_END));
        assert!(t.second[0x05].flags.contains(InstFlags::SETS_RIP));
        // Jcc continues the block.
        assert!(!t.base[0x75].flags.contains(InstFlags::BLOCK_END));
    }

    #[test]
    fn group_entries_resolve_by_reg_bits() {
        let t = tables();
        assert!(matches!(t.base[0x83].class, InstClass::ModRmTablePrefix));
        assert_eq!(t.modrm[0x8300].name, "ADD");
        assert_eq!(t.modrm[0x8307].name, "CMP");
        assert_eq!(t.modrm[0xFF02].name, "CALL");
        assert_eq!(t.modrm[0xC104].name, "SHL");
    }
}
