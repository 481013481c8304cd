//! Reference single-step interpreter.
//!
//! The fallback path of the translator: a self-contained x86-64 integer
//! interpreter that executes exactly one guest instruction per [`step`]
//! call. It decodes independently of the DBT tables, keeps its own copy of
//! the architectural state, computes real RFLAGS for the ALU subset, and
//! reads guest memory through the shared address space.
//!
//! Coverage is the common integer subset (data movement, ALU, stack,
//! control flow, string ops, multiply/divide, setcc/cmovcc, bit tests).
//! `SYSCALL` and anything outside the subset surface as [`StepExit`]
//! values so the core can service or report them; the interpreter never
//! aborts the process.
//!
//! [`step`]: ReferenceCpu::step

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Memmap;
use crate::cpu::state::{X86State, reg};

/// RFLAGS bit masks the interpreter maintains.
mod rflags {
    pub const CF: u64 = 1 << 0;
    pub const PF: u64 = 1 << 2;
    pub const ZF: u64 = 1 << 6;
    pub const SF: u64 = 1 << 7;
    pub const DF: u64 = 1 << 10;
    pub const OF: u64 = 1 << 11;
}

/// Why a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// One instruction executed; RIP advanced.
    Continue,
    /// A `SYSCALL` instruction was reached. RIP still points at it; the
    /// caller services the call and advances RIP past the two-byte opcode.
    Syscall,
    /// An encoding outside the supported subset (or an unreadable fetch).
    Unsupported {
        /// First opcode byte, for diagnostics.
        opcode: u8,
    },
}

/// Callback invoked on unmapped guest accesses: `(rip, address)`.
pub type UnmappedHook = Box<dyn Fn(u64, u64) + Send>;

/// Internal arm outcome; folded into [`StepExit`] by [`ReferenceCpu::step`].
enum ExecOutcome {
    /// Fall through; RIP advances by the decoded length.
    Continue,
    /// The arm wrote RIP itself.
    Jumped,
    /// `SYSCALL` reached.
    Syscall,
    /// Outside the supported subset.
    Unsupported {
        /// Offending opcode byte.
        opcode: u8,
    },
}

/// Number of valid bytes prefetched per instruction.
const FETCH_WINDOW: usize = 16;

/// Instruction byte cursor over the prefetch window.
struct Cursor {
    buf: [u8; FETCH_WINDOW],
    valid: usize,
    pos: usize,
    ok: bool,
}

impl Cursor {
    fn u8(&mut self) -> u8 {
        if self.pos >= self.valid {
            self.ok = false;
            return 0;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.pos >= self.valid { 0 } else { self.buf[self.pos] }
    }

    fn u16(&mut self) -> u16 {
        u16::from(self.u8()) | u16::from(self.u8()) << 8
    }

    fn u32(&mut self) -> u32 {
        u32::from(self.u16()) | u32::from(self.u16()) << 16
    }

    fn u64(&mut self) -> u64 {
        u64::from(self.u32()) | u64::from(self.u32()) << 32
    }

    fn i8(&mut self) -> i64 {
        i64::from(self.u8() as i8)
    }

    fn i32(&mut self) -> i64 {
        i64::from(self.u32() as i32)
    }

    /// Immediate of `bits` width, sign-extended to 64.
    fn imm(&mut self, bits: u32) -> u64 {
        match bits {
            8 => self.i8() as u64,
            16 => i64::from(self.u16() as i16) as u64,
            64 => self.u64(),
            _ => self.i32() as u64,
        }
    }
}

/// Decoded prefix state.
#[derive(Default, Clone, Copy)]
struct Prefixes {
    rex: u8,
    has_rex: bool,
    opsize: bool,
    rep: bool,
    repne: bool,
    seg_fs: bool,
    seg_gs: bool,
}

impl Prefixes {
    fn rex_w(&self) -> bool {
        self.rex & 0b1000 != 0
    }

    fn rex_r(&self) -> u8 {
        (self.rex >> 2) & 1
    }

    fn rex_x(&self) -> u8 {
        (self.rex >> 1) & 1
    }

    fn rex_b(&self) -> u8 {
        self.rex & 1
    }

    /// Default operand size under the REX.W / 0x66 rules.
    fn opbits(&self) -> u32 {
        if self.rex_w() {
            64
        } else if self.opsize {
            16
        } else {
            32
        }
    }
}

/// A resolved operand location.
#[derive(Clone, Copy)]
enum Place {
    /// Register (internal index); `high` selects AH/CH/DH/BH for byte ops.
    Reg { index: usize, high: bool },
    /// Guest memory address.
    Mem { addr: u64 },
}

/// Parsed ModRM byte with the r/m operand resolved.
struct ModRm {
    mod_bits: u8,
    reg_bits: u8,
    /// `reg` field mapped through REX.R.
    reg_index: usize,
    /// The r/m operand.
    place: Place,
}

const fn width_mask(bits: u32) -> u64 {
    if bits == 64 { !0 } else { (1u64 << bits) - 1 }
}

const fn width_msb(bits: u32) -> u64 {
    1 << (bits - 1)
}

/// The reference emulator instance owned by one thread.
pub struct ReferenceCpu {
    state: X86State,
    mem: Arc<Memmap>,
    unmapped_hook: Option<UnmappedHook>,
}

impl ReferenceCpu {
    /// Creates an instance over the shared address space.
    #[must_use]
    pub fn new(mem: Arc<Memmap>) -> Self {
        Self {
            state: X86State::new(),
            mem,
            unmapped_hook: None,
        }
    }

    /// Installs the unmapped-access hook.
    pub fn set_unmapped_hook(&mut self, hook: UnmappedHook) {
        self.unmapped_hook = Some(hook);
    }

    /// Copies the thread's architectural state in.
    pub fn load_state(&mut self, state: &X86State) {
        self.state = state.clone();
    }

    /// Copies the architectural state back out.
    pub fn store_state(&self, out: &mut X86State) {
        *out = self.state.clone();
    }

    /// Direct state access (tests and the syscall sandwich).
    #[must_use]
    pub fn state(&self) -> &X86State {
        &self.state
    }

    /// Mutable state access.
    pub fn state_mut(&mut self) -> &mut X86State {
        &mut self.state
    }

    // -- memory ---------------------------------------------------------------

    fn report_unmapped(&self, addr: u64) {
        if let Some(hook) = &self.unmapped_hook {
            hook(self.state.rip, addr);
        } else {
            emu_log::error!(
                "unmapped guest access at {:#x} (rip {:#x})",
                addr,
                self.state.rip
            );
        }
    }

    fn mem_read(&self, addr: u64, bits: u32) -> u64 {
        let value = match bits {
            8 => self.mem.read_u8(addr).map(u64::from),
            16 => self.mem.read_u16(addr).map(u64::from),
            32 => self.mem.read_u32(addr).map(u64::from),
            _ => self.mem.read_u64(addr),
        };
        match value {
            Some(v) => v,
            None => {
                self.report_unmapped(addr);
                0
            }
        }
    }

    fn mem_write(&self, addr: u64, bits: u32, value: u64) {
        let ok = match bits {
            8 => self.mem.write_u8(addr, value as u8),
            16 => self.mem.write_u16(addr, value as u16),
            32 => self.mem.write_u32(addr, value as u32),
            _ => self.mem.write_u64(addr, value),
        };
        if !ok {
            self.report_unmapped(addr);
        }
    }

    // -- registers ------------------------------------------------------------

    fn read_gpr(&self, index: usize, bits: u32) -> u64 {
        self.state.gregs[index] & width_mask(bits)
    }

    /// Writes honoring the architectural merge rules: 32-bit writes zero
    /// the upper half, 8/16-bit writes merge.
    fn write_gpr(&mut self, index: usize, bits: u32, value: u64) {
        let slot = &mut self.state.gregs[index];
        match bits {
            8 => *slot = (*slot & !0xFF) | (value & 0xFF),
            16 => *slot = (*slot & !0xFFFF) | (value & 0xFFFF),
            32 => *slot = value & 0xFFFF_FFFF,
            _ => *slot = value,
        }
    }

    fn read_place(&self, place: Place, bits: u32) -> u64 {
        match place {
            Place::Reg { index, high } => {
                if high {
                    (self.state.gregs[index] >> 8) & 0xFF
                } else {
                    self.read_gpr(index, bits)
                }
            }
            Place::Mem { addr } => self.mem_read(addr, bits),
        }
    }

    fn write_place(&mut self, place: Place, bits: u32, value: u64) {
        match place {
            Place::Reg { index, high } => {
                if high {
                    let slot = &mut self.state.gregs[index];
                    *slot = (*slot & !0xFF00) | ((value & 0xFF) << 8);
                } else {
                    self.write_gpr(index, bits, value);
                }
            }
            Place::Mem { addr } => self.mem_write(addr, bits, value),
        }
    }

    /// Byte-register operand for a 3-bit field: without REX, indices 4..7
    /// select the legacy high-byte registers.
    fn byte_reg(p: &Prefixes, rex_bit: u8, bits: u8) -> Place {
        if !p.has_rex && (4..8).contains(&bits) {
            Place::Reg {
                index: reg::MODRM_ORDER[usize::from(bits - 4)],
                high: true,
            }
        } else {
            Place::Reg {
                index: reg::MODRM_ORDER[usize::from(rex_bit << 3 | bits)],
                high: false,
            }
        }
    }

    // -- effective addresses --------------------------------------------------

    /// Parses ModRM (and SIB/displacement). `imm_after` is the byte count
    /// of immediates that follow, needed to resolve RIP-relative operands.
    fn decode_modrm(&self, cur: &mut Cursor, p: &Prefixes, imm_after: usize, byte_op: bool) -> ModRm {
        let modrm = cur.u8();
        let mod_bits = modrm >> 6;
        let reg_bits = (modrm >> 3) & 0b111;
        let rm_bits = modrm & 0b111;
        let reg_index = reg::MODRM_ORDER[usize::from(p.rex_r() << 3 | reg_bits)];

        if mod_bits == 0b11 {
            let place = if byte_op {
                Self::byte_reg(p, p.rex_b(), rm_bits)
            } else {
                Place::Reg {
                    index: reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | rm_bits)],
                    high: false,
                }
            };
            return ModRm {
                mod_bits,
                reg_bits,
                reg_index,
                place,
            };
        }

        let mut base: Option<usize> = None;
        let mut index: Option<(usize, u32)> = None;
        let mut disp: i64 = 0;
        let mut rip_rel = false;

        if rm_bits == 0b100 {
            // SIB byte.
            let sib = cur.u8();
            let scale = 1u32 << (sib >> 6);
            let index_bits = p.rex_x() << 3 | ((sib >> 3) & 0b111);
            let base_bits = sib & 0b111;

            // index 0b100 without REX.X means "no index".
            if index_bits != 0b100 {
                index = Some((reg::MODRM_ORDER[usize::from(index_bits)], scale));
            }
            if base_bits == 0b101 && mod_bits == 0b00 {
                disp = cur.i32();
            } else {
                base = Some(reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | base_bits)]);
            }
        } else if mod_bits == 0b00 && rm_bits == 0b101 {
            rip_rel = true;
            disp = cur.i32();
        } else {
            base = Some(reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | rm_bits)]);
        }

        match mod_bits {
            0b01 => disp = disp.wrapping_add(cur.i8()),
            0b10 => disp = disp.wrapping_add(cur.i32()),
            _ => {}
        }

        let mut addr = disp as u64;
        if let Some(b) = base {
            addr = addr.wrapping_add(self.state.gregs[b]);
        }
        if let Some((i, scale)) = index {
            addr = addr.wrapping_add(self.state.gregs[i].wrapping_mul(u64::from(scale)));
        }
        if rip_rel {
            let next_rip = self
                .state
                .rip
                .wrapping_add(cur.pos as u64)
                .wrapping_add(imm_after as u64);
            addr = next_rip.wrapping_add(disp as u64);
        }
        if p.seg_fs {
            addr = addr.wrapping_add(self.state.fs);
        }
        if p.seg_gs {
            addr = addr.wrapping_add(self.state.gs);
        }

        ModRm {
            mod_bits,
            reg_bits,
            reg_index,
            place: Place::Mem { addr },
        }
    }

    // -- flags ----------------------------------------------------------------

    fn set_flag(&mut self, mask: u64, value: bool) {
        if value {
            self.state.rflags |= mask;
        } else {
            self.state.rflags &= !mask;
        }
    }

    fn flag(&self, mask: u64) -> bool {
        self.state.rflags & mask != 0
    }

    fn flags_result(&mut self, result: u64, bits: u32) {
        let masked = result & width_mask(bits);
        self.set_flag(rflags::ZF, masked == 0);
        self.set_flag(rflags::SF, masked & width_msb(bits) != 0);
        self.set_flag(rflags::PF, (masked as u8).count_ones() % 2 == 0);
    }

    fn flags_logic(&mut self, result: u64, bits: u32) {
        self.flags_result(result, bits);
        self.set_flag(rflags::CF, false);
        self.set_flag(rflags::OF, false);
    }

    fn flags_add(&mut self, a: u64, b: u64, carry_in: u64, bits: u32) -> u64 {
        let mask = width_mask(bits);
        let (a, b) = (a & mask, b & mask);
        let total = u128::from(a) + u128::from(b) + u128::from(carry_in);
        let result = (total as u64) & mask;
        self.set_flag(rflags::CF, total >> bits != 0);
        self.set_flag(
            rflags::OF,
            (a ^ result) & (b ^ result) & width_msb(bits) != 0,
        );
        self.flags_result(result, bits);
        result
    }

    fn flags_sub(&mut self, a: u64, b: u64, borrow_in: u64, bits: u32) -> u64 {
        let mask = width_mask(bits);
        let (a, b) = (a & mask, b & mask);
        let result = a.wrapping_sub(b).wrapping_sub(borrow_in) & mask;
        self.set_flag(
            rflags::CF,
            u128::from(b) + u128::from(borrow_in) > u128::from(a),
        );
        self.set_flag(rflags::OF, (a ^ b) & (a ^ result) & width_msb(bits) != 0);
        self.flags_result(result, bits);
        result
    }

    /// Condition-code test, opcode low-nibble order.
    fn cond(&self, code: u8) -> bool {
        let cf = self.flag(rflags::CF);
        let zf = self.flag(rflags::ZF);
        let sf = self.flag(rflags::SF);
        let of = self.flag(rflags::OF);
        let pf = self.flag(rflags::PF);
        match code & 0xF {
            0x0 => of,
            0x1 => !of,
            0x2 => cf,
            0x3 => !cf,
            0x4 => zf,
            0x5 => !zf,
            0x6 => cf || zf,
            0x7 => !cf && !zf,
            0x8 => sf,
            0x9 => !sf,
            0xA => pf,
            0xB => !pf,
            0xC => sf != of,
            0xD => sf == of,
            0xE => zf || sf != of,
            _ => !zf && sf == of,
        }
    }

    // -- stack ----------------------------------------------------------------

    fn push64(&mut self, value: u64) {
        let rsp = self.state.gregs[reg::RSP].wrapping_sub(8);
        self.state.gregs[reg::RSP] = rsp;
        self.mem_write(rsp, 64, value);
    }

    fn pop64(&mut self) -> u64 {
        let rsp = self.state.gregs[reg::RSP];
        let value = self.mem_read(rsp, 64);
        self.state.gregs[reg::RSP] = rsp.wrapping_add(8);
        value
    }

    // -- ALU dispatch ---------------------------------------------------------

    /// Executes ALU operation `index` (table order: ADD OR ADC SBB AND SUB
    /// XOR CMP); returns the result to store (CMP stores nothing).
    fn alu(&mut self, index: u8, a: u64, b: u64, bits: u32) -> Option<u64> {
        match index {
            0 => Some(self.flags_add(a, b, 0, bits)),
            1 => {
                let r = (a | b) & width_mask(bits);
                self.flags_logic(r, bits);
                Some(r)
            }
            2 => {
                let c = u64::from(self.flag(rflags::CF));
                Some(self.flags_add(a, b, c, bits))
            }
            3 => {
                let c = u64::from(self.flag(rflags::CF));
                Some(self.flags_sub(a, b, c, bits))
            }
            4 => {
                let r = (a & b) & width_mask(bits);
                self.flags_logic(r, bits);
                Some(r)
            }
            5 => Some(self.flags_sub(a, b, 0, bits)),
            6 => {
                let r = (a ^ b) & width_mask(bits);
                self.flags_logic(r, bits);
                Some(r)
            }
            _ => {
                self.flags_sub(a, b, 0, bits);
                None
            }
        }
    }

    fn shift(&mut self, kind: u8, value: u64, amount: u64, bits: u32) -> Option<u64> {
        let mask_amount = if bits == 64 { 0x3F } else { 0x1F };
        let amount = amount & mask_amount;
        if amount == 0 {
            return Some(value & width_mask(bits));
        }
        let mask = width_mask(bits);
        let value = value & mask;
        match kind {
            // rol / ror: result plus CF, nothing else.
            0 | 1 => {
                let amt = (amount % u64::from(bits)) as u32;
                if amt == 0 {
                    return Some(value);
                }
                let r = if kind == 0 {
                    (value << amt | value >> (bits - amt)) & mask
                } else {
                    (value >> amt | value << (bits - amt)) & mask
                };
                self.set_flag(
                    rflags::CF,
                    if kind == 0 {
                        r & 1 != 0
                    } else {
                        r & width_msb(bits) != 0
                    },
                );
                Some(r)
            }
            4 | 6 => {
                let r = value.wrapping_shl(amount as u32) & mask;
                self.set_flag(rflags::CF, amount <= u64::from(bits) && value >> (u64::from(bits) - amount) & 1 != 0);
                self.flags_result(r, bits);
                return Some(r);
            }
            5 => {
                let r = value >> amount;
                self.set_flag(rflags::CF, value >> (amount - 1) & 1 != 0);
                self.flags_result(r, bits);
                return Some(r);
            }
            7 => {
                let sign_extended = if value & width_msb(bits) != 0 {
                    value | !mask
                } else {
                    value
                };
                let r = ((sign_extended as i64) >> amount) as u64 & mask;
                self.set_flag(rflags::CF, (sign_extended as i64) >> (amount - 1) & 1 != 0);
                self.flags_result(r, bits);
                Some(r)
            }
            _ => None, // RCL/RCR
        }
    }

    // -- string ops -----------------------------------------------------------

    fn string_op(&mut self, opcode: u8, p: &Prefixes) -> ExecOutcome {
        let bits = if opcode & 1 == 0 { 8 } else { p.opbits() };
        let step = u64::from(bits / 8);
        let backwards = self.flag(rflags::DF);
        let advance = |value: u64| {
            if backwards {
                value.wrapping_sub(step)
            } else {
                value.wrapping_add(step)
            }
        };

        loop {
            if (p.rep || p.repne) && self.state.gregs[reg::RCX] == 0 {
                break;
            }
            let mut condition: Option<bool> = None;
            match opcode {
                // movs
                0xA4 | 0xA5 => {
                    let value = self.mem_read(self.state.gregs[reg::RSI], bits);
                    self.mem_write(self.state.gregs[reg::RDI], bits, value);
                    self.state.gregs[reg::RSI] = advance(self.state.gregs[reg::RSI]);
                    self.state.gregs[reg::RDI] = advance(self.state.gregs[reg::RDI]);
                }
                // stos
                0xAA | 0xAB => {
                    let value = self.read_gpr(reg::RAX, bits);
                    self.mem_write(self.state.gregs[reg::RDI], bits, value);
                    self.state.gregs[reg::RDI] = advance(self.state.gregs[reg::RDI]);
                }
                // lods
                0xAC | 0xAD => {
                    let value = self.mem_read(self.state.gregs[reg::RSI], bits);
                    self.write_gpr(reg::RAX, bits.max(8), value);
                    self.state.gregs[reg::RSI] = advance(self.state.gregs[reg::RSI]);
                }
                // scas
                _ => {
                    let value = self.mem_read(self.state.gregs[reg::RDI], bits);
                    let acc = self.read_gpr(reg::RAX, bits);
                    self.flags_sub(acc, value, 0, bits);
                    self.state.gregs[reg::RDI] = advance(self.state.gregs[reg::RDI]);
                    condition = Some(self.flag(rflags::ZF));
                }
            }

            if p.rep || p.repne {
                self.state.gregs[reg::RCX] = self.state.gregs[reg::RCX].wrapping_sub(1);
                match condition {
                    // REPE/REPNE termination for scas.
                    Some(zf) if p.rep && !zf => break,
                    Some(zf) if p.repne && zf => break,
                    _ => {}
                }
            } else {
                break;
            }
        }
        ExecOutcome::Continue
    }

    // -- the step -------------------------------------------------------------

    /// Executes exactly one instruction at the current RIP.
    pub fn step(&mut self) -> StepExit {
        let mut cur = Cursor {
            buf: [0; FETCH_WINDOW],
            valid: 0,
            pos: 0,
            ok: true,
        };
        for i in 0..FETCH_WINDOW {
            match self.mem.read_u8(self.state.rip + i as u64) {
                Some(byte) => {
                    cur.buf[i] = byte;
                    cur.valid = i + 1;
                }
                None => break,
            }
        }
        if cur.valid == 0 {
            self.report_unmapped(self.state.rip);
            return StepExit::Unsupported { opcode: 0 };
        }

        let mut p = Prefixes::default();
        loop {
            match cur.peek() {
                0x66 => {
                    p.opsize = true;
                    cur.u8();
                }
                0x67 | 0xF0 | 0x2E | 0x3E | 0x26 | 0x36 => {
                    cur.u8();
                }
                0x64 => {
                    p.seg_fs = true;
                    cur.u8();
                }
                0x65 => {
                    p.seg_gs = true;
                    cur.u8();
                }
                0xF2 => {
                    p.repne = true;
                    cur.u8();
                }
                0xF3 => {
                    p.rep = true;
                    cur.u8();
                }
                0x40..=0x4F => {
                    p.rex = cur.u8() & 0xF;
                    p.has_rex = true;
                }
                _ => break,
            }
        }

        let opcode = cur.u8();
        let outcome = self.execute(opcode, &mut cur, &p);
        if !cur.ok {
            return StepExit::Unsupported { opcode };
        }
        match outcome {
            ExecOutcome::Continue => {
                self.state.rip = self.state.rip.wrapping_add(cur.pos as u64);
                StepExit::Continue
            }
            ExecOutcome::Jumped => StepExit::Continue,
            ExecOutcome::Syscall => StepExit::Syscall,
            ExecOutcome::Unsupported { opcode } => StepExit::Unsupported { opcode },
        }
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, opcode: u8, cur: &mut Cursor, p: &Prefixes) -> ExecOutcome {
        use ExecOutcome::{Continue, Jumped, Syscall, Unsupported};

        let opbits = p.opbits();

        // Generic ALU block: 00..3D, forms 0..5.
        if opcode < 0x40 && opcode != 0x0F && (opcode & 7) < 6 {
            let alu_index = opcode >> 3;
            let form = opcode & 7;
            match form {
                // op r/m8, r8
                0 => {
                    let m = self.decode_modrm(cur, p, 0, true);
                    let src = Self::byte_reg(p, p.rex_r(), m.reg_bits);
                    let a = self.read_place(m.place, 8);
                    let b = self.read_place(src, 8);
                    if let Some(r) = self.alu(alu_index, a, b, 8) {
                        self.write_place(m.place, 8, r);
                    }
                }
                // op r/m, r
                1 => {
                    let m = self.decode_modrm(cur, p, 0, false);
                    let a = self.read_place(m.place, opbits);
                    let b = self.read_gpr(m.reg_index, opbits);
                    if let Some(r) = self.alu(alu_index, a, b, opbits) {
                        self.write_place(m.place, opbits, r);
                    }
                }
                // op r8, r/m8
                2 => {
                    let m = self.decode_modrm(cur, p, 0, true);
                    let dst = Self::byte_reg(p, p.rex_r(), m.reg_bits);
                    let a = self.read_place(dst, 8);
                    let b = self.read_place(m.place, 8);
                    if let Some(r) = self.alu(alu_index, a, b, 8) {
                        self.write_place(dst, 8, r);
                    }
                }
                // op r, r/m
                3 => {
                    let m = self.decode_modrm(cur, p, 0, false);
                    let a = self.read_gpr(m.reg_index, opbits);
                    let b = self.read_place(m.place, opbits);
                    if let Some(r) = self.alu(alu_index, a, b, opbits) {
                        self.write_gpr(m.reg_index, opbits, r);
                    }
                }
                // op al, imm8
                4 => {
                    let imm = cur.imm(8);
                    let a = self.read_gpr(reg::RAX, 8);
                    if let Some(r) = self.alu(alu_index, a, imm, 8) {
                        self.write_gpr(reg::RAX, 8, r);
                    }
                }
                // op eax, imm
                _ => {
                    let imm = cur.imm(opbits.min(32));
                    let a = self.read_gpr(reg::RAX, opbits);
                    if let Some(r) = self.alu(alu_index, a, imm, opbits) {
                        self.write_gpr(reg::RAX, opbits, r);
                    }
                }
            }
            return Continue;
        }

        match opcode {
            // Two-byte map.
            0x0F => {
                let second = cur.u8();
                match second {
                    0x05 => return Syscall,
                    // Long NOP: consume the addressing bytes.
                    0x1F => {
                        let _ = self.decode_modrm(cur, p, 0, false);
                    }
                    0x31 => {
                        // rdtsc: a monotonic counter is all callers need.
                        static TSC: AtomicU64 = AtomicU64::new(0x4000);
                        let tsc = TSC.fetch_add(64, Ordering::Relaxed);
                        self.write_gpr(reg::RAX, 32, tsc & 0xFFFF_FFFF);
                        self.write_gpr(reg::RDX, 32, tsc >> 32);
                    }
                    // cmovcc
                    0x40..=0x4F => {
                        let m = self.decode_modrm(cur, p, 0, false);
                        let value = if self.cond(second) {
                            self.read_place(m.place, opbits)
                        } else {
                            self.read_gpr(m.reg_index, opbits)
                        };
                        self.write_gpr(m.reg_index, opbits, value);
                    }
                    // jcc rel32
                    0x80..=0x8F => {
                        let disp = cur.i32();
                        if self.cond(second) {
                            self.state.rip = self
                                .state
                                .rip
                                .wrapping_add(cur.pos as u64)
                                .wrapping_add(disp as u64);
                            return Jumped;
                        }
                    }
                    // setcc r/m8
                    0x90..=0x9F => {
                        let m = self.decode_modrm(cur, p, 0, true);
                        let value = u64::from(self.cond(second));
                        self.write_place(m.place, 8, value);
                    }
                    0xA2 => {
                        // cpuid: report no extended features.
                        let leaf = self.read_gpr(reg::RAX, 32);
                        let (a, b, c, d) = match leaf {
                            0 => (1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69),
                            _ => (0, 0, 0, 0),
                        };
                        self.write_gpr(reg::RAX, 32, a);
                        self.write_gpr(reg::RBX, 32, b);
                        self.write_gpr(reg::RCX, 32, c);
                        self.write_gpr(reg::RDX, 32, d);
                    }
                    // bt r/m, r
                    0xA3 => {
                        let m = self.decode_modrm(cur, p, 0, false);
                        let value = self.read_place(m.place, opbits);
                        let index = self.read_gpr(m.reg_index, opbits) & u64::from(opbits - 1);
                        self.set_flag(rflags::CF, value >> index & 1 != 0);
                    }
                    // imul r, r/m
                    0xAF => {
                        let m = self.decode_modrm(cur, p, 0, false);
                        let a = self.read_gpr(m.reg_index, opbits) as i64;
                        let b = self.read_place(m.place, opbits) as i64;
                        let r = a.wrapping_mul(b) as u64;
                        self.write_gpr(m.reg_index, opbits, r);
                    }
                    // cmpxchg r/m, r
                    0xB0 | 0xB1 => {
                        let bits = if second == 0xB0 { 8 } else { opbits };
                        let m = self.decode_modrm(cur, p, 0, second == 0xB0);
                        let current = self.read_place(m.place, bits);
                        let acc = self.read_gpr(reg::RAX, bits);
                        self.flags_sub(acc, current, 0, bits);
                        if acc == current {
                            let new = if second == 0xB0 {
                                self.read_place(Self::byte_reg(p, p.rex_r(), m.reg_bits), 8)
                            } else {
                                self.read_gpr(m.reg_index, bits)
                            };
                            self.write_place(m.place, bits, new);
                        } else {
                            self.write_gpr(reg::RAX, bits, current);
                        }
                    }
                    // movzx r, r/m8 / r/m16
                    0xB6 | 0xB7 => {
                        let src_bits = if second == 0xB6 { 8 } else { 16 };
                        let m = self.decode_modrm(cur, p, 0, second == 0xB6);
                        let value = self.read_place(m.place, src_bits);
                        self.write_gpr(m.reg_index, opbits.max(32), value);
                    }
                    // bt/bts/btr/btc r/m, imm8
                    0xBA => {
                        let m = self.decode_modrm(cur, p, 1, false);
                        let index = u64::from(cur.u8()) & u64::from(opbits - 1);
                        let value = self.read_place(m.place, opbits);
                        self.set_flag(rflags::CF, value >> index & 1 != 0);
                        let updated = match m.reg_bits {
                            5 => value | 1 << index,
                            6 => value & !(1 << index),
                            7 => value ^ 1 << index,
                            _ => value,
                        };
                        if m.reg_bits >= 5 {
                            self.write_place(m.place, opbits, updated);
                        }
                    }
                    // bsf/bsr
                    0xBC | 0xBD => {
                        let m = self.decode_modrm(cur, p, 0, false);
                        let value = self.read_place(m.place, opbits);
                        self.set_flag(rflags::ZF, value == 0);
                        if value != 0 {
                            let found = if second == 0xBC {
                                u64::from(value.trailing_zeros())
                            } else {
                                u64::from(63 - value.leading_zeros())
                            };
                            self.write_gpr(m.reg_index, opbits, found);
                        }
                    }
                    // movsx r, r/m8 / r/m16
                    0xBE | 0xBF => {
                        let src_bits = if second == 0xBE { 8 } else { 16 };
                        let m = self.decode_modrm(cur, p, 0, second == 0xBE);
                        let raw = self.read_place(m.place, src_bits);
                        let value = if src_bits == 8 {
                            i64::from(raw as u8 as i8) as u64
                        } else {
                            i64::from(raw as u16 as i16) as u64
                        };
                        self.write_gpr(m.reg_index, opbits, value);
                    }
                    // xadd r/m, r
                    0xC0 | 0xC1 => {
                        let bits = if second == 0xC0 { 8 } else { opbits };
                        let m = self.decode_modrm(cur, p, 0, second == 0xC0);
                        let dst = self.read_place(m.place, bits);
                        let src = self.read_gpr(m.reg_index, bits);
                        let sum = self.flags_add(dst, src, 0, bits);
                        self.write_gpr(m.reg_index, bits, dst);
                        self.write_place(m.place, bits, sum);
                    }
                    _ => return Unsupported { opcode: second },
                }
                Continue
            }

            // push r / pop r
            0x50..=0x57 => {
                let index = reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | (opcode & 7))];
                let value = self.state.gregs[index];
                self.push64(value);
                Continue
            }
            0x58..=0x5F => {
                let index = reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | (opcode & 7))];
                let value = self.pop64();
                self.state.gregs[index] = value;
                Continue
            }

            // movsxd r, r/m32
            0x63 => {
                let m = self.decode_modrm(cur, p, 0, false);
                let raw = self.read_place(m.place, 32);
                self.write_gpr(m.reg_index, 64, i64::from(raw as u32 as i32) as u64);
                Continue
            }

            // push imm
            0x68 => {
                let imm = cur.imm(32);
                self.push64(imm);
                Continue
            }
            0x6A => {
                let imm = cur.imm(8);
                self.push64(imm);
                Continue
            }

            // imul r, r/m, imm
            0x69 | 0x6B => {
                let imm_len = if opcode == 0x69 { 4 } else { 1 };
                let m = self.decode_modrm(cur, p, imm_len, false);
                let imm = cur.imm(if opcode == 0x69 { 32 } else { 8 }) as i64;
                let a = self.read_place(m.place, opbits) as i64;
                self.write_gpr(m.reg_index, opbits, a.wrapping_mul(imm) as u64);
                Continue
            }

            // jcc rel8
            0x70..=0x7F => {
                let disp = cur.i8();
                if self.cond(opcode) {
                    self.state.rip = self
                        .state
                        .rip
                        .wrapping_add(cur.pos as u64)
                        .wrapping_add(disp as u64);
                    return Jumped;
                }
                Continue
            }

            // ALU group imm
            0x80 | 0x81 | 0x83 => {
                let byte_op = opcode == 0x80;
                let bits = if byte_op { 8 } else { opbits };
                let imm_len = match opcode {
                    0x81 => {
                        if p.opsize {
                            2
                        } else {
                            4
                        }
                    }
                    _ => 1,
                };
                let m = self.decode_modrm(cur, p, imm_len, byte_op);
                let imm = cur.imm(if opcode == 0x81 { bits.min(32) } else { 8 });
                let a = self.read_place(m.place, bits);
                if let Some(r) = self.alu(m.reg_bits, a, imm, bits) {
                    self.write_place(m.place, bits, r);
                }
                Continue
            }

            // test r/m, r
            0x84 | 0x85 => {
                let byte_op = opcode == 0x84;
                let bits = if byte_op { 8 } else { opbits };
                let m = self.decode_modrm(cur, p, 0, byte_op);
                let a = self.read_place(m.place, bits);
                let b = if byte_op {
                    self.read_place(Self::byte_reg(p, p.rex_r(), m.reg_bits), 8)
                } else {
                    self.read_gpr(m.reg_index, bits)
                };
                self.flags_logic(a & b, bits);
                Continue
            }

            // xchg r/m, r
            0x86 | 0x87 => {
                let byte_op = opcode == 0x86;
                let bits = if byte_op { 8 } else { opbits };
                let m = self.decode_modrm(cur, p, 0, byte_op);
                let reg_place = if byte_op {
                    Self::byte_reg(p, p.rex_r(), m.reg_bits)
                } else {
                    Place::Reg {
                        index: m.reg_index,
                        high: false,
                    }
                };
                let a = self.read_place(m.place, bits);
                let b = self.read_place(reg_place, bits);
                self.write_place(m.place, bits, b);
                self.write_place(reg_place, bits, a);
                Continue
            }

            // mov
            0x88 | 0x89 => {
                let byte_op = opcode == 0x88;
                let bits = if byte_op { 8 } else { opbits };
                let m = self.decode_modrm(cur, p, 0, byte_op);
                let value = if byte_op {
                    self.read_place(Self::byte_reg(p, p.rex_r(), m.reg_bits), 8)
                } else {
                    self.read_gpr(m.reg_index, bits)
                };
                self.write_place(m.place, bits, value);
                Continue
            }
            0x8A | 0x8B => {
                let byte_op = opcode == 0x8A;
                let bits = if byte_op { 8 } else { opbits };
                let m = self.decode_modrm(cur, p, 0, byte_op);
                let value = self.read_place(m.place, bits);
                if byte_op {
                    self.write_place(Self::byte_reg(p, p.rex_r(), m.reg_bits), 8, value);
                } else {
                    self.write_gpr(m.reg_index, bits, value);
                }
                Continue
            }

            // lea
            0x8D => {
                let m = self.decode_modrm(cur, p, 0, false);
                match m.place {
                    Place::Mem { addr } => self.write_gpr(m.reg_index, opbits, addr),
                    Place::Reg { .. } => return Unsupported { opcode },
                }
                Continue
            }

            // pop r/m
            0x8F => {
                let m = self.decode_modrm(cur, p, 0, false);
                let value = self.pop64();
                self.write_place(m.place, 64, value);
                Continue
            }

            // xchg rax, r (0x90 with neither REX.B nor operand size is NOP)
            0x90..=0x97 => {
                let index = reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | (opcode & 7))];
                if index != reg::RAX {
                    let a = self.read_gpr(reg::RAX, opbits);
                    let b = self.read_gpr(index, opbits);
                    self.write_gpr(reg::RAX, opbits, b);
                    self.write_gpr(index, opbits, a);
                }
                Continue
            }

            // cdqe / cwde
            0x98 => {
                if p.rex_w() {
                    let value = i64::from(self.read_gpr(reg::RAX, 32) as u32 as i32) as u64;
                    self.write_gpr(reg::RAX, 64, value);
                } else {
                    let value = i32::from(self.read_gpr(reg::RAX, 16) as u16 as i16) as u32;
                    self.write_gpr(reg::RAX, 32, u64::from(value));
                }
                Continue
            }
            // cqo / cdq
            0x99 => {
                if p.rex_w() {
                    let sign = (self.state.gregs[reg::RAX] as i64) >> 63;
                    self.write_gpr(reg::RDX, 64, sign as u64);
                } else {
                    let sign = (self.read_gpr(reg::RAX, 32) as u32 as i32) >> 31;
                    self.write_gpr(reg::RDX, 32, sign as u32 as u64);
                }
                Continue
            }

            // pushfq / popfq
            0x9C => {
                let flags = self.state.rflags;
                self.push64(flags);
                Continue
            }
            0x9D => {
                self.state.rflags = self.pop64();
                Continue
            }

            // string ops
            0xA4 | 0xA5 | 0xAA | 0xAB | 0xAC | 0xAD | 0xAE | 0xAF => self.string_op(opcode, p),

            // test al/eax, imm
            0xA8 => {
                let imm = cur.imm(8);
                let a = self.read_gpr(reg::RAX, 8);
                self.flags_logic(a & imm, 8);
                Continue
            }
            0xA9 => {
                let imm = cur.imm(opbits.min(32));
                let a = self.read_gpr(reg::RAX, opbits);
                self.flags_logic(a & imm, opbits);
                Continue
            }

            // mov r8, imm8
            0xB0..=0xB7 => {
                let imm = u64::from(cur.u8());
                let place = Self::byte_reg(p, p.rex_b(), opcode & 7);
                self.write_place(place, 8, imm);
                Continue
            }
            // mov r, imm
            0xB8..=0xBF => {
                let index = reg::MODRM_ORDER[usize::from(p.rex_b() << 3 | (opcode & 7))];
                let value = if p.rex_w() {
                    cur.u64()
                } else if p.opsize {
                    u64::from(cur.u16())
                } else {
                    u64::from(cur.u32())
                };
                self.write_gpr(index, opbits, value);
                Continue
            }

            // shift groups
            0xC0 | 0xC1 => {
                let byte_op = opcode == 0xC0;
                let bits = if byte_op { 8 } else { opbits };
                let m = self.decode_modrm(cur, p, 1, byte_op);
                let amount = u64::from(cur.u8());
                let value = self.read_place(m.place, bits);
                match self.shift(m.reg_bits, value, amount, bits) {
                    Some(r) => self.write_place(m.place, bits, r),
                    None => return Unsupported { opcode },
                }
                Continue
            }
            0xD0..=0xD3 => {
                let byte_op = opcode & 1 == 0;
                let bits = if byte_op { 8 } else { opbits };
                let m = self.decode_modrm(cur, p, 0, byte_op);
                let amount = if opcode >= 0xD2 {
                    self.read_gpr(reg::RCX, 8)
                } else {
                    1
                };
                let value = self.read_place(m.place, bits);
                match self.shift(m.reg_bits, value, amount, bits) {
                    Some(r) => self.write_place(m.place, bits, r),
                    None => return Unsupported { opcode },
                }
                Continue
            }

            // ret (imm16 form pops the extra bytes)
            0xC2 => {
                let extra = u64::from(cur.u16());
                let target = self.pop64();
                self.state.gregs[reg::RSP] =
                    self.state.gregs[reg::RSP].wrapping_add(extra);
                self.state.rip = target;
                Jumped
            }
            0xC3 => {
                self.state.rip = self.pop64();
                Jumped
            }

            // mov r/m, imm
            0xC6 => {
                let m = self.decode_modrm(cur, p, 1, true);
                let imm = u64::from(cur.u8());
                self.write_place(m.place, 8, imm);
                Continue
            }
            0xC7 => {
                let imm_len = if p.opsize { 2 } else { 4 };
                let m = self.decode_modrm(cur, p, imm_len, false);
                let imm = cur.imm(opbits.min(32));
                self.write_place(m.place, opbits, imm);
                Continue
            }

            // leave
            0xC9 => {
                self.state.gregs[reg::RSP] = self.state.gregs[reg::RBP];
                let value = self.pop64();
                self.state.gregs[reg::RBP] = value;
                Continue
            }

            // call rel32
            0xE8 => {
                let disp = cur.i32();
                let next = self.state.rip.wrapping_add(cur.pos as u64);
                self.push64(next);
                self.state.rip = next.wrapping_add(disp as u64);
                Jumped
            }
            // jmp rel
            0xE9 => {
                let disp = cur.i32();
                self.state.rip = self
                    .state
                    .rip
                    .wrapping_add(cur.pos as u64)
                    .wrapping_add(disp as u64);
                Jumped
            }
            0xEB => {
                let disp = cur.i8();
                self.state.rip = self
                    .state
                    .rip
                    .wrapping_add(cur.pos as u64)
                    .wrapping_add(disp as u64);
                Jumped
            }

            // unary group
            0xF6 | 0xF7 => {
                let byte_op = opcode == 0xF6;
                let bits = if byte_op { 8 } else { opbits };
                // TEST carries an immediate, the rest of the group doesn't.
                let peek_reg = (cur.peek() >> 3) & 0b111;
                let imm_len = if peek_reg <= 1 {
                    if byte_op {
                        1
                    } else if p.opsize {
                        2
                    } else {
                        4
                    }
                } else {
                    0
                };
                let m = self.decode_modrm(cur, p, imm_len, byte_op);
                match m.reg_bits {
                    0 | 1 => {
                        let imm = cur.imm(if byte_op { 8 } else { bits.min(32) });
                        let a = self.read_place(m.place, bits);
                        self.flags_logic(a & imm, bits);
                    }
                    2 => {
                        let a = self.read_place(m.place, bits);
                        self.write_place(m.place, bits, !a);
                    }
                    3 => {
                        let a = self.read_place(m.place, bits);
                        let r = self.flags_sub(0, a, 0, bits);
                        self.write_place(m.place, bits, r);
                    }
                    4 => {
                        // mul: RDX:RAX = RAX * r/m
                        let a = u128::from(self.read_gpr(reg::RAX, bits));
                        let b = u128::from(self.read_place(m.place, bits));
                        let product = a * b;
                        let low = (product & u128::from(width_mask(bits))) as u64;
                        let high = (product >> bits) as u64;
                        if byte_op {
                            self.write_gpr(reg::RAX, 16, low | high << 8);
                        } else {
                            self.write_gpr(reg::RAX, bits, low);
                            self.write_gpr(reg::RDX, bits, high);
                        }
                        self.set_flag(rflags::CF, high != 0);
                        self.set_flag(rflags::OF, high != 0);
                    }
                    5 => {
                        // imul (one-operand form)
                        let mask = width_mask(bits);
                        let sext = |v: u64| -> i128 {
                            if v & width_msb(bits) != 0 {
                                (v | !mask) as i64 as i128
                            } else {
                                v as i128
                            }
                        };
                        let a = sext(self.read_gpr(reg::RAX, bits));
                        let b = sext(self.read_place(m.place, bits));
                        let product = a * b;
                        let low = (product as u64) & mask;
                        let high = ((product >> bits) as u64) & mask;
                        if byte_op {
                            self.write_gpr(reg::RAX, 16, low | high << 8);
                        } else {
                            self.write_gpr(reg::RAX, bits, low);
                            self.write_gpr(reg::RDX, bits, high);
                        }
                    }
                    6 => {
                        // div: RDX:RAX / r/m
                        let divisor = u128::from(self.read_place(m.place, bits));
                        if divisor == 0 {
                            return Unsupported { opcode };
                        }
                        let dividend = if byte_op {
                            u128::from(self.read_gpr(reg::RAX, 16))
                        } else {
                            u128::from(self.read_gpr(reg::RDX, bits)) << bits
                                | u128::from(self.read_gpr(reg::RAX, bits))
                        };
                        let quotient = (dividend / divisor) as u64;
                        let remainder = (dividend % divisor) as u64;
                        if byte_op {
                            self.write_gpr(reg::RAX, 16, quotient & 0xFF | remainder << 8);
                        } else {
                            self.write_gpr(reg::RAX, bits, quotient);
                            self.write_gpr(reg::RDX, bits, remainder);
                        }
                    }
                    _ => {
                        // idiv
                        let mask = width_mask(bits);
                        let sext = |v: u64| -> i128 {
                            if v & width_msb(bits) != 0 {
                                (v | !mask) as i64 as i128
                            } else {
                                v as i128
                            }
                        };
                        let divisor = sext(self.read_place(m.place, bits));
                        if divisor == 0 {
                            return Unsupported { opcode };
                        }
                        let dividend: i128 = if byte_op {
                            i128::from(self.read_gpr(reg::RAX, 16) as u16 as i16)
                        } else {
                            let high = self.read_gpr(reg::RDX, bits);
                            let low = self.read_gpr(reg::RAX, bits);
                            let joined = (u128::from(high) << bits) | u128::from(low);
                            // Sign through the doubled width.
                            if high & width_msb(bits) != 0 {
                                (joined | (!0u128 << (2 * bits).min(127))) as i128
                            } else {
                                joined as i128
                            }
                        };
                        let quotient = (dividend / divisor) as u64 & mask;
                        let remainder = (dividend % divisor) as u64 & mask;
                        if byte_op {
                            self.write_gpr(reg::RAX, 16, quotient & 0xFF | remainder << 8);
                        } else {
                            self.write_gpr(reg::RAX, bits, quotient);
                            self.write_gpr(reg::RDX, bits, remainder);
                        }
                    }
                }
                Continue
            }

            // cld / std
            0xFC => {
                self.set_flag(rflags::DF, false);
                Continue
            }
            0xFD => {
                self.set_flag(rflags::DF, true);
                Continue
            }

            // inc/dec r/m8
            0xFE => {
                let m = self.decode_modrm(cur, p, 0, true);
                let a = self.read_place(m.place, 8);
                let carry = self.flag(rflags::CF);
                let r = match m.reg_bits {
                    0 => self.flags_add(a, 1, 0, 8),
                    1 => self.flags_sub(a, 1, 0, 8),
                    _ => return Unsupported { opcode },
                };
                self.set_flag(rflags::CF, carry); // inc/dec preserve CF
                self.write_place(m.place, 8, r);
                Continue
            }

            // inc/dec/call/jmp/push r/m
            0xFF => {
                let m = self.decode_modrm(cur, p, 0, false);
                match m.reg_bits {
                    0 | 1 => {
                        let a = self.read_place(m.place, opbits);
                        let carry = self.flag(rflags::CF);
                        let r = if m.reg_bits == 0 {
                            self.flags_add(a, 1, 0, opbits)
                        } else {
                            self.flags_sub(a, 1, 0, opbits)
                        };
                        self.set_flag(rflags::CF, carry);
                        self.write_place(m.place, opbits, r);
                        Continue
                    }
                    2 => {
                        let target = self.read_place(m.place, 64);
                        let next = self.state.rip.wrapping_add(cur.pos as u64);
                        self.push64(next);
                        self.state.rip = target;
                        Jumped
                    }
                    4 => {
                        self.state.rip = self.read_place(m.place, 64);
                        Jumped
                    }
                    6 => {
                        let value = self.read_place(m.place, 64);
                        self.push64(value);
                        Continue
                    }
                    _ => Unsupported { opcode },
                }
            }

            _ => Unsupported { opcode },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(code: &[u8]) -> ReferenceCpu {
        let mut mem = Memmap::new();
        mem.allocate(1 << 30).expect("shm allocation failed");
        mem.map_region(0x1000, 0x10000).expect("code region");
        mem.map_region(0x20000, 0x10000).expect("stack region");
        assert!(mem.write_bytes(0x1000, code));
        let mut cpu = ReferenceCpu::new(Arc::new(mem));
        cpu.state.rip = 0x1000;
        cpu.state.gregs[reg::RSP] = 0x2F000;
        cpu
    }

    #[test]
    fn mov_and_alu_with_flags() {
        // mov rcx, 10; mov rax, 3; add rax, rcx
        let mut cpu = harness(&[
            0x48, 0xC7, 0xC1, 0x0A, 0x00, 0x00, 0x00, // mov rcx, 10
            0x48, 0xC7, 0xC0, 0x03, 0x00, 0x00, 0x00, // mov rax, 3
            0x48, 0x01, 0xC8, // add rax, rcx
        ]);
        for _ in 0..3 {
            assert_eq!(cpu.step(), StepExit::Continue);
        }
        assert_eq!(cpu.state.gregs[reg::RAX], 13);
        assert!(!cpu.flag(rflags::ZF));
        assert_eq!(cpu.state.rip, 0x1000 + 17);
    }

    #[test]
    fn sub_to_zero_sets_zf_and_cmp_borrow_sets_cf() {
        // mov eax, 5; sub eax, 5; cmp eax, 1
        let mut cpu = harness(&[
            0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
            0x83, 0xE8, 0x05, // sub eax, 5
            0x83, 0xF8, 0x01, // cmp eax, 1
        ]);
        cpu.step();
        cpu.step();
        assert!(cpu.flag(rflags::ZF));
        cpu.step();
        assert!(cpu.flag(rflags::CF), "0 - 1 must borrow");
        assert!(!cpu.flag(rflags::ZF));
    }

    #[test]
    fn push_pop_call_ret_roundtrip() {
        // call +0; (at target) pop rax
        let mut cpu = harness(&[
            0xE8, 0x00, 0x00, 0x00, 0x00, // call next
            0x58, // pop rax
        ]);
        assert_eq!(cpu.step(), StepExit::Continue);
        assert_eq!(cpu.state.rip, 0x1005);
        assert_eq!(cpu.step(), StepExit::Continue);
        // The pushed return address was 0x1005.
        assert_eq!(cpu.state.gregs[reg::RAX], 0x1005);
    }

    #[test]
    fn conditional_branch_follows_flags() {
        // xor eax, eax; jz +2; (skipped: mov al, 1); mov cl, 2
        let mut cpu = harness(&[
            0x31, 0xC0, // xor eax, eax
            0x74, 0x02, // jz +2
            0xB0, 0x01, // mov al, 1
            0xB1, 0x02, // mov cl, 2
        ]);
        cpu.step();
        assert!(cpu.flag(rflags::ZF));
        cpu.step();
        assert_eq!(cpu.state.rip, 0x1006, "jz taken must skip mov al, 1");
        cpu.step();
        assert_eq!(cpu.state.gregs[reg::RCX] & 0xFF, 2);
        assert_eq!(cpu.state.gregs[reg::RAX] & 0xFF, 0);
    }

    #[test]
    fn memory_operands_and_sib() {
        // mov [rsp+8], rcx; mov rax, [rsp+8]
        let mut cpu = harness(&[
            0x48, 0x89, 0x4C, 0x24, 0x08, // mov [rsp+8], rcx
            0x48, 0x8B, 0x44, 0x24, 0x08, // mov rax, [rsp+8]
        ]);
        cpu.state.gregs[reg::RCX] = 0xDEAD_BEEF;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.state.gregs[reg::RAX], 0xDEAD_BEEF);
    }

    #[test]
    fn rep_stosq_fills_memory() {
        // rep stosq with rcx=4, rax=0x11, rdi=0x21000
        let mut cpu = harness(&[0xF3, 0x48, 0xAB]);
        cpu.state.gregs[reg::RCX] = 4;
        cpu.state.gregs[reg::RAX] = 0x11;
        cpu.state.gregs[reg::RDI] = 0x21000;
        assert_eq!(cpu.step(), StepExit::Continue);
        assert_eq!(cpu.state.gregs[reg::RCX], 0);
        for i in 0..4u64 {
            assert_eq!(cpu.mem.read_u64(0x21000 + i * 8), Some(0x11));
        }
    }

    #[test]
    fn syscall_surfaces_without_advancing() {
        let mut cpu = harness(&[0x0F, 0x05]);
        assert_eq!(cpu.step(), StepExit::Syscall);
        assert_eq!(cpu.state.rip, 0x1000, "caller advances past syscall");
    }

    #[test]
    fn unsupported_opcodes_are_reported() {
        // ud2
        let mut cpu = harness(&[0x0F, 0x0B]);
        assert!(matches!(cpu.step(), StepExit::Unsupported { .. }));
    }

    #[test]
    fn byte_registers_merge_high_and_low() {
        // mov ah, 0x12 then mov al, 0x34
        let mut cpu = harness(&[0xB4, 0x12, 0xB0, 0x34]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.state.gregs[reg::RAX] & 0xFFFF, 0x1234);
    }

    #[test]
    fn thirty_two_bit_writes_zero_extend() {
        let mut cpu = harness(&[0xB8, 0x01, 0x00, 0x00, 0x00]); // mov eax, 1
        cpu.state.gregs[reg::RAX] = 0xFFFF_FFFF_FFFF_FFFF;
        cpu.step();
        assert_eq!(cpu.state.gregs[reg::RAX], 1);
    }
}
