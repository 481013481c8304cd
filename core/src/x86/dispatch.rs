//! Opcode-to-IR lifting.
//!
//! [`OpDispatchBuilder`] owns the working IR block for the instruction
//! sequence currently being lifted. Per-opcode handlers follow one pattern:
//! resolve operand registers from ModRM/REX, `LoadContext` the sources,
//! emit the arithmetic, `StoreContext` the destination, and materialize the
//! flag bits encoded conditional branches will read.
//!
//! Handlers never abort: an encoding a handler cannot express (memory
//! destinations, byte-size ALU forms, exotic addressing) sets the builder's
//! decode-failure flag and returns, and the compile path falls back to the
//! reference interpreter for that instruction.
//!
//! Flag coverage is deliberately partial and documented per handler:
//!
//! - AND/OR/XOR/TEST: ZF and SF from the result; CF and OF cleared
//!   (architecturally exact).
//! - ADD/SUB/CMP/INC/DEC: ZF and SF from the result; ADD/SUB/CMP set CF
//!   from the 64-bit carry-out for 32-bit operands (64-bit operand forms do
//!   not write CF); OF is cleared, an approximation: code that branches on
//!   signed overflow of lifted instructions is out of this lifter's scope
//!   and lands on the reference interpreter via JO/JNO lifting of real
//!   flags it cannot see. INC/DEC leave CF untouched.
//! - Shifts and BT write only what their handler states (BT: CF).

use std::collections::HashMap;

use crate::cpu::state::{X86State, flag_bit, reg};
use crate::ir::{IrBlock, IrOp, IrRef, SelectCmp};

use super::decoder::DecodedInst;
use super::tables::{DecodeFlags, Tables};

/// ModRM-order GPR map: index = (rex_bit << 3) | modrm_bits.
///
/// Note the order differs from the internal `reg::*` numbering.
const GPR_MAP: [usize; 16] = reg::MODRM_ORDER;

const fn modrm_mod(modrm: u8) -> u8 {
    modrm >> 6
}

const fn modrm_reg(modrm: u8) -> u8 {
    (modrm >> 3) & 0b111
}

const fn modrm_rm(modrm: u8) -> u8 {
    modrm & 0b111
}

/// Builds IR for one basic block of guest instructions.
pub struct OpDispatchBuilder {
    ir: IrBlock,
    rip_locations: HashMap<u64, IrRef>,
    current_rip: u64,
    decode_failure: bool,
}

impl Default for OpDispatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OpDispatchBuilder {
    /// Creates a builder with an empty working block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ir: IrBlock::new(),
            rip_locations: HashMap::new(),
            current_rip: 0,
            decode_failure: false,
        }
    }

    /// Opens the working block.
    pub fn begin_block(&mut self) {
        self.ir.push_begin_block();
    }

    /// Closes the working block with a fall-through RIP increment
    /// (0 when a RIP-setting instruction already stored RIP).
    pub fn end_block(&mut self, rip_increment: u64) {
        self.ir.push_end_block(rip_increment);
    }

    /// Records the guest RIP of the next lifted instruction.
    pub fn add_rip_marker(&mut self, rip: u64) {
        self.current_rip = rip;
        let marker = self.ir.push_rip_marker(rip);
        self.rip_locations.insert(rip, marker);
    }

    /// Lifts one decoded instruction; `code` starts at its first byte.
    pub fn dispatch(&mut self, decoded: &DecodedInst, code: &[u8]) {
        match decoded.info.dispatch {
            Some(handler) => handler(self, decoded, code),
            None => self.decode_failure = true,
        }
    }

    /// The IR built so far.
    #[must_use]
    pub fn working_ir(&self) -> &IrBlock {
        &self.ir
    }

    /// Clears the working block, the RIP map, and the failure flag.
    pub fn reset(&mut self) {
        self.ir.reset();
        self.rip_locations.clear();
        self.decode_failure = false;
    }

    /// True when a handler could not lift its instruction.
    #[must_use]
    pub fn had_decode_failure(&self) -> bool {
        self.decode_failure
    }

    // -- emission helpers -----------------------------------------------------

    fn constant(&mut self, value: u64) -> IrRef {
        self.ir.push_constant(value)
    }

    fn load_ctx(&mut self, offset: u64) -> IrRef {
        self.ir.push_load_context(8, offset as u32)
    }

    fn store_ctx(&mut self, value: IrRef, offset: u64) {
        self.ir.push_store_context(8, offset as u32, value);
    }

    fn load_greg(&mut self, index: usize) -> IrRef {
        self.load_ctx(X86State::greg_offset(index))
    }

    fn store_greg(&mut self, value: IrRef, index: usize) {
        self.store_ctx(value, X86State::greg_offset(index));
    }

    /// Masks `value` to `size_bits` (32 or 64; anything else is a handler
    /// contract violation handled by the callers as decode failure).
    fn truncate(&mut self, value: IrRef, size_bits: u32) -> IrRef {
        match size_bits {
            16 => self.ir.push_trunc16(value),
            32 => self.ir.push_trunc32(value),
            _ => value,
        }
    }

    /// Reads one RFLAGS bit as a 0/1 value, optionally negated.
    fn get_flag_bit(&mut self, bit: u64, negate: bool) -> IrRef {
        let rflags = self.load_ctx(X86State::RFLAGS_OFFSET);
        let pos = self.constant(bit);
        let extracted = self.ir.push_bin(IrOp::BitExtract, rflags, pos);
        if negate {
            let one = self.constant(1);
            self.ir.push_bin(IrOp::Xor, extracted, one)
        } else {
            extracted
        }
    }

    /// Writes a 0/1 value into one RFLAGS bit: read flags, clear the bit,
    /// shift the value into place, or, store.
    fn set_flag(&mut self, value: IrRef, bit: u64) {
        let rflags = self.load_ctx(X86State::RFLAGS_OFFSET);
        let mask = self.constant(1 << bit);
        let cleared = self.ir.push_bin(IrOp::Nand, rflags, mask);
        let pos = self.constant(bit);
        let shifted = self.ir.push_bin(IrOp::Shl, value, pos);
        let merged = self.ir.push_bin(IrOp::Or, cleared, shifted);
        self.store_ctx(merged, X86State::RFLAGS_OFFSET);
    }

    fn clear_flag(&mut self, bit: u64) {
        let zero = self.constant(0);
        self.set_flag(zero, bit);
    }

    /// ZF from a (already truncated) result.
    fn set_zf(&mut self, result: IrRef) {
        let zero = self.constant(0);
        let one = self.constant(1);
        let zf = self.ir.push_select(SelectCmp::Eq, result, zero, one, zero);
        self.set_flag(zf, flag_bit::ZF);
    }

    /// SF from the result's top bit for the operand size.
    fn set_sf(&mut self, result: IrRef, size_bits: u32) {
        let pos = self.constant(u64::from(size_bits) - 1);
        let sf = self.ir.push_bin(IrOp::BitExtract, result, pos);
        self.set_flag(sf, flag_bit::SF);
    }

    /// CF from the carry-out bit of an untruncated 64-bit result; only
    /// meaningful when both operands were clean `size_bits`-wide values.
    fn set_cf_carry(&mut self, raw_result: IrRef, size_bits: u32) {
        let pos = self.constant(u64::from(size_bits));
        let cf = self.ir.push_bin(IrOp::BitExtract, raw_result, pos);
        self.set_flag(cf, flag_bit::CF);
    }

    // -- operand resolution ---------------------------------------------------

    /// Operand size in bits for the default/REX.W split. Handlers that see
    /// an operand-size prefix fail before calling this.
    fn op_size(decoded: &DecodedInst, code: &[u8]) -> u32 {
        if decoded.flags.contains(DecodeFlags::REX) && code[0] & 0b1000 != 0 {
            64
        } else {
            32
        }
    }

    /// True when the encoding is the plain `[REX] opcode...` layout the
    /// handlers parse. Segment overrides, REP prefixes and address-size
    /// overrides push the lifter onto the fallback path.
    fn prefixes_lifted(decoded: &DecodedInst, code: &[u8]) -> bool {
        const SEG_REP: [u8; 8] = [0x26, 0x2E, 0x36, 0x3E, 0x64, 0x65, 0xF2, 0xF3];
        if decoded.flags.contains(DecodeFlags::ADSIZE) || SEG_REP.contains(&code[0]) {
            return false;
        }
        if decoded.flags.contains(DecodeFlags::REX) && !(0x40..=0x4F).contains(&code[0]) {
            return false;
        }
        true
    }

    /// Resolves the ModRM byte of a `[REX] [0F...] opcode modrm` encoding.
    /// `prefix_bytes` counts the escape bytes (operand/address-size
    /// prefixes were rejected before this is called).
    fn modrm_byte(decoded: &DecodedInst, code: &[u8]) -> u8 {
        let index = usize::from(decoded.prefix_bytes)
            + usize::from(decoded.flags.contains(DecodeFlags::REX))
            + 1;
        code[index]
    }

    /// Maps the ModRM `rm` field to an internal register index.
    fn rm_register(decoded: &DecodedInst, code: &[u8]) -> usize {
        let modrm = Self::modrm_byte(decoded, code);
        let rex_b = if decoded.flags.contains(DecodeFlags::REX) {
            code[0] & 0b0001
        } else {
            0
        };
        GPR_MAP[usize::from(rex_b << 3 | modrm_rm(modrm))]
    }

    /// Maps the ModRM `reg` field to an internal register index.
    fn reg_register(decoded: &DecodedInst, code: &[u8]) -> usize {
        let modrm = Self::modrm_byte(decoded, code);
        let rex_r = if decoded.flags.contains(DecodeFlags::REX) {
            (code[0] & 0b0100) >> 2
        } else {
            0
        };
        GPR_MAP[usize::from(rex_r << 3 | modrm_reg(modrm))]
    }

    /// Common guards for register-direct ModRM handlers. Returns false
    /// (with the failure flag set) when the encoding is out of scope.
    fn require_direct_modrm(&mut self, decoded: &DecodedInst, code: &[u8]) -> bool {
        if !decoded.flags.contains(DecodeFlags::MODRM)
            || decoded.flags.contains(DecodeFlags::OPSIZE)
            || decoded.flags.contains(DecodeFlags::SIB)
            || !Self::prefixes_lifted(decoded, code)
            || modrm_mod(Self::modrm_byte(decoded, code)) != 0b11
        {
            self.decode_failure = true;
            return false;
        }
        true
    }

    /// Reads the trailing immediate, sign-extending `imm_len` bytes and
    /// masking to the operand size.
    fn trailing_imm(decoded: &DecodedInst, code: &[u8], imm_len: usize, size_bits: u32) -> u64 {
        let at = usize::from(decoded.size) - imm_len;
        let raw: i64 = match imm_len {
            1 => i64::from(code[at] as i8),
            2 => i64::from(i16::from_le_bytes([code[at], code[at + 1]])),
            4 => i64::from(i32::from_le_bytes([
                code[at],
                code[at + 1],
                code[at + 2],
                code[at + 3],
            ])),
            8 => i64::from_le_bytes(code[at..at + 8].try_into().expect("in-bounds")),
            _ => 0,
        };
        if size_bits == 32 {
            u64::from(raw as u32)
        } else {
            raw as u64
        }
    }
}

// ---------------------------------------------------------------------------
// ALU handlers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum AluKind {
    Add,
    Sub,
    Or,
    And,
    Xor,
    Cmp,
    Test,
}

impl AluKind {
    const fn ir_op(self) -> IrOp {
        match self {
            AluKind::Add => IrOp::Add,
            AluKind::Sub | AluKind::Cmp => IrOp::Sub,
            AluKind::Or => IrOp::Or,
            AluKind::And | AluKind::Test => IrOp::And,
            AluKind::Xor => IrOp::Xor,
        }
    }

    /// Logic ops clear CF/OF; ADD/SUB/CMP get CF from the carry-out.
    const fn is_logic(self) -> bool {
        matches!(self, AluKind::Or | AluKind::And | AluKind::Xor | AluKind::Test)
    }

    const fn stores_result(self) -> bool {
        !matches!(self, AluKind::Cmp | AluKind::Test)
    }
}

impl OpDispatchBuilder {
    /// Computes `dst kind src`, sets flags, stores when the kind does.
    fn alu_emit(
        &mut self,
        kind: AluKind,
        dst_value: IrRef,
        src_value: IrRef,
        size_bits: u32,
        dst_reg: Option<usize>,
    ) {
        let (a, b) = if size_bits == 32 {
            (self.truncate(dst_value, 32), self.truncate(src_value, 32))
        } else {
            (dst_value, src_value)
        };
        let raw = self.ir.push_bin(kind.ir_op(), a, b);
        let result = self.truncate(raw, size_bits);

        self.set_zf(result);
        self.set_sf(result, size_bits);
        if kind.is_logic() {
            self.clear_flag(flag_bit::CF);
        } else if size_bits == 32 {
            self.set_cf_carry(raw, 32);
        }
        // OF is cleared rather than computed; see the module docs.
        self.clear_flag(flag_bit::OF);

        if kind.stores_result() {
            if let Some(dst) = dst_reg {
                self.store_greg(result, dst);
            }
        }
    }

    /// `op r/m, r`: register-direct destinations only.
    fn alu_rm_r(&mut self, kind: AluKind, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let dst = Self::rm_register(decoded, code);
        let src = Self::reg_register(decoded, code);
        let dst_value = self.load_greg(dst);
        let src_value = self.load_greg(src);
        self.alu_emit(kind, dst_value, src_value, size, Some(dst));
    }

    /// `op r, r/m`: register-direct sources only.
    fn alu_r_rm(&mut self, kind: AluKind, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let dst = Self::reg_register(decoded, code);
        let src = Self::rm_register(decoded, code);
        let dst_value = self.load_greg(dst);
        let src_value = self.load_greg(src);
        self.alu_emit(kind, dst_value, src_value, size, Some(dst));
    }

    /// `op eax/rax, imm32`.
    fn alu_eax_imm(&mut self, kind: AluKind, decoded: &DecodedInst, code: &[u8]) {
        if decoded.flags.contains(DecodeFlags::OPSIZE) || !Self::prefixes_lifted(decoded, code) {
            self.decode_failure = true;
            return;
        }
        let size = Self::op_size(decoded, code);
        let imm = Self::trailing_imm(decoded, code, 4, size);
        let dst_value = self.load_greg(reg::RAX);
        let src_value = self.constant(imm);
        self.alu_emit(kind, dst_value, src_value, size, Some(reg::RAX));
    }

    /// `op r/m, imm` from the `81`/`83` groups.
    fn alu_imm_rm(&mut self, kind: AluKind, imm_len: usize, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let imm = Self::trailing_imm(decoded, code, imm_len, size);
        let dst = Self::rm_register(decoded, code);
        let dst_value = self.load_greg(dst);
        let src_value = self.constant(imm);
        self.alu_emit(kind, dst_value, src_value, size, Some(dst));
    }
}

macro_rules! alu_handlers {
    ($(($rm_r:ident, $r_rm:ident, $kind:expr)),* $(,)?) => {
        impl OpDispatchBuilder {
            $(
                fn $rm_r(&mut self, decoded: &DecodedInst, code: &[u8]) {
                    self.alu_rm_r($kind, decoded, code);
                }
                fn $r_rm(&mut self, decoded: &DecodedInst, code: &[u8]) {
                    self.alu_r_rm($kind, decoded, code);
                }
            )*
        }
    };
}

alu_handlers!(
    (add_rm_r, add_r_rm, AluKind::Add),
    (sub_rm_r, sub_r_rm, AluKind::Sub),
    (or_rm_r, or_r_rm, AluKind::Or),
    (and_rm_r, and_r_rm, AluKind::And),
    (xor_rm_r, xor_r_rm, AluKind::Xor),
    (cmp_rm_r, cmp_r_rm, AluKind::Cmp),
);

impl OpDispatchBuilder {
    // TEST only has the r/m, r direction.
    fn test_rm_r(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.alu_rm_r(AluKind::Test, decoded, code);
    }
}

// ---------------------------------------------------------------------------
// Condition codes
// ---------------------------------------------------------------------------

/// Jcc condition, in opcode order.
#[derive(Clone, Copy)]
enum Cond {
    O,
    No,
    B,
    Nb,
    Z,
    Nz,
    Be,
    Nbe,
    S,
    Ns,
    P,
    Np,
    L,
    Nl,
    Le,
    Nle,
}

impl OpDispatchBuilder {
    /// Value that is nonzero when the branch is *not* taken: the CondJump
    /// in the Jcc pattern jumps over the taken-path epilogue to the
    /// fall-through JmpTarget.
    fn not_taken_value(&mut self, cond: Cond) -> Option<IrRef> {
        let value = match cond {
            Cond::O => self.get_flag_bit(flag_bit::OF, true),
            Cond::No => self.get_flag_bit(flag_bit::OF, false),
            Cond::B => self.get_flag_bit(flag_bit::CF, true),
            Cond::Nb => self.get_flag_bit(flag_bit::CF, false),
            Cond::Z => self.get_flag_bit(flag_bit::ZF, true),
            Cond::Nz => self.get_flag_bit(flag_bit::ZF, false),
            Cond::Be | Cond::Nbe => {
                let cf = self.get_flag_bit(flag_bit::CF, false);
                let zf = self.get_flag_bit(flag_bit::ZF, false);
                let either = self.ir.push_bin(IrOp::Or, cf, zf);
                if matches!(cond, Cond::Be) {
                    let one = self.constant(1);
                    self.ir.push_bin(IrOp::Xor, either, one)
                } else {
                    either
                }
            }
            Cond::S => self.get_flag_bit(flag_bit::SF, true),
            Cond::Ns => self.get_flag_bit(flag_bit::SF, false),
            // Parity is not materialized by any lifted instruction.
            Cond::P | Cond::Np => return None,
            Cond::L | Cond::Nl => {
                let sf = self.get_flag_bit(flag_bit::SF, false);
                let of = self.get_flag_bit(flag_bit::OF, false);
                let differ = self.ir.push_bin(IrOp::Xor, sf, of);
                if matches!(cond, Cond::L) {
                    let one = self.constant(1);
                    self.ir.push_bin(IrOp::Xor, differ, one)
                } else {
                    differ
                }
            }
            Cond::Le | Cond::Nle => {
                let zf = self.get_flag_bit(flag_bit::ZF, false);
                let sf = self.get_flag_bit(flag_bit::SF, false);
                let of = self.get_flag_bit(flag_bit::OF, false);
                let differ = self.ir.push_bin(IrOp::Xor, sf, of);
                let taken = self.ir.push_bin(IrOp::Or, zf, differ);
                if matches!(cond, Cond::Le) {
                    let one = self.constant(1);
                    self.ir.push_bin(IrOp::Xor, taken, one)
                } else {
                    taken
                }
            }
        };
        Some(value)
    }

    /// The common Jcc lifting: CondJump over the taken-path epilogue
    /// (store branch target into RIP, EndBlock 0), then the fall-through
    /// JmpTarget. The block keeps going after a Jcc.
    fn jcc_common(&mut self, cond: Cond, decoded: &DecodedInst, code: &[u8]) {
        if decoded.flags.contains(DecodeFlags::OPSIZE) || !Self::prefixes_lifted(decoded, code) {
            self.decode_failure = true;
            return;
        }
        let Some(not_taken) = self.not_taken_value(cond) else {
            self.decode_failure = true;
            return;
        };

        let imm_len = if decoded.info.more_bytes == 1 { 1 } else { 4 };
        let disp = Self::trailing_imm(decoded, code, imm_len, 64) as i64;
        let rip_target = self
            .current_rip
            .wrapping_add(u64::from(decoded.size))
            .wrapping_add(disp as u64);

        let cond_jump = self.ir.push_cond_jump(not_taken, rip_target);
        let target_const = self.constant(rip_target);
        self.store_ctx(target_const, X86State::RIP_OFFSET);
        self.ir.push_end_block(0);
        let fall_through = self.ir.push_jmp_target();
        self.ir.patch_cond_jump_target(cond_jump, fall_through);
    }
}

macro_rules! jcc_handlers {
    ($(($name:ident, $cond:expr)),* $(,)?) => {
        impl OpDispatchBuilder {
            $(
                fn $name(&mut self, decoded: &DecodedInst, code: &[u8]) {
                    self.jcc_common($cond, decoded, code);
                }
            )*
        }
    };
}

jcc_handlers!(
    (jo_op, Cond::O),
    (jno_op, Cond::No),
    (jb_op, Cond::B),
    (jnb_op, Cond::Nb),
    (jz_op, Cond::Z),
    (jnz_op, Cond::Nz),
    (jbe_op, Cond::Be),
    (jnbe_op, Cond::Nbe),
    (js_op, Cond::S),
    (jns_op, Cond::Ns),
    (jp_op, Cond::P),
    (jnp_op, Cond::Np),
    (jl_op, Cond::L),
    (jnl_op, Cond::Nl),
    (jle_op, Cond::Le),
    (jnle_op, Cond::Nle),
);

// ---------------------------------------------------------------------------
// Data movement, control flow, system
// ---------------------------------------------------------------------------

impl OpDispatchBuilder {
    /// `mov r/m, r` (0x89), register-direct. 32-bit stores zero-extend.
    fn mov_rm_r(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let dst = Self::rm_register(decoded, code);
        let src = Self::reg_register(decoded, code);
        let value = self.load_greg(src);
        let value = self.truncate(value, size);
        self.store_greg(value, dst);
    }

    /// `mov r, r/m` (0x8B): register-direct source, or a simple memory
    /// load `[base]` / `[base + disp8/32]` without SIB.
    fn mov_r_rm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if !decoded.flags.contains(DecodeFlags::MODRM)
            || decoded.flags.contains(DecodeFlags::OPSIZE)
            || decoded.flags.contains(DecodeFlags::SIB)
            || !Self::prefixes_lifted(decoded, code)
        {
            self.decode_failure = true;
            return;
        }
        let size = Self::op_size(decoded, code);
        let modrm = Self::modrm_byte(decoded, code);
        let dst = Self::reg_register(decoded, code);

        match modrm_mod(modrm) {
            0b11 => {
                let value = self.load_greg(Self::rm_register(decoded, code));
                let value = self.truncate(value, size);
                self.store_greg(value, dst);
            }
            0b00 if modrm_rm(modrm) != 0b101 => {
                let base = self.load_greg(Self::rm_register(decoded, code));
                let loaded = self
                    .ir
                    .push_load_mem((size / 8) as u8, base, IrRef::INVALID);
                self.store_greg(loaded, dst);
            }
            0b01 | 0b10 => {
                let disp_len = if modrm_mod(modrm) == 0b01 { 1 } else { 4 };
                let disp = Self::trailing_imm(decoded, code, disp_len, 64);
                let base = self.load_greg(Self::rm_register(decoded, code));
                let disp_const = self.constant(disp);
                let loaded = self.ir.push_load_mem((size / 8) as u8, base, disp_const);
                self.store_greg(loaded, dst);
            }
            _ => {
                // RIP-relative loads stay on the fallback path.
                self.decode_failure = true;
            }
        }
    }

    /// `mov r, imm` (0xB8+r): imm64 under REX.W, imm32 zero-extended
    /// otherwise.
    fn mov_imm_reg(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if decoded.flags.contains(DecodeFlags::OPSIZE) || !Self::prefixes_lifted(decoded, code) {
            self.decode_failure = true;
            return;
        }
        let has_rex = decoded.flags.contains(DecodeFlags::REX);
        let opcode = if has_rex { code[1] } else { code[0] };
        let rex_b = if has_rex { code[0] & 1 } else { 0 };
        let dst = GPR_MAP[usize::from(rex_b << 3 | (opcode & 0b111))];

        let wide = has_rex && code[0] & 0b1000 != 0;
        let imm = if wide {
            Self::trailing_imm(decoded, code, 8, 64)
        } else {
            Self::trailing_imm(decoded, code, 4, 32)
        };
        let value = self.constant(imm);
        self.store_greg(value, dst);
    }

    /// `mov r/m, imm32` (0xC7 /0), register-direct; imm sign-extends under
    /// REX.W.
    fn mov_imm_rm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let dst = Self::rm_register(decoded, code);
        let imm = Self::trailing_imm(decoded, code, 4, size);
        let value = self.constant(imm);
        self.store_greg(value, dst);
    }

    /// `movzx r, r/m8` / `movzx r, r/m16` (0F B6/B7), register-direct.
    fn movzx(&mut self, decoded: &DecodedInst, code: &[u8], src_bits: u32) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let dst = Self::reg_register(decoded, code);
        let src = Self::rm_register(decoded, code);
        let value = self.load_greg(src);
        let mask = self.constant(if src_bits == 8 { 0xFF } else { 0xFFFF });
        let value = self.ir.push_bin(IrOp::And, value, mask);
        self.store_greg(value, dst);
    }

    fn movzx8(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.movzx(decoded, code, 8);
    }

    fn movzx16(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.movzx(decoded, code, 16);
    }

    /// `lea r, [m]` (0x8D): the effective address itself is the result.
    /// Register-base and RIP-relative forms, no SIB.
    fn lea_op(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if !decoded.flags.contains(DecodeFlags::MODRM)
            || decoded.flags.contains(DecodeFlags::OPSIZE)
            || decoded.flags.contains(DecodeFlags::SIB)
            || !Self::prefixes_lifted(decoded, code)
        {
            self.decode_failure = true;
            return;
        }
        let size = Self::op_size(decoded, code);
        let modrm = Self::modrm_byte(decoded, code);
        let dst = Self::reg_register(decoded, code);

        let address = match modrm_mod(modrm) {
            0b00 if modrm_rm(modrm) == 0b101 => {
                // RIP-relative: next-RIP + disp32, computable at lift time.
                let disp = Self::trailing_imm(decoded, code, 4, 64) as i64;
                let next_rip = self.current_rip.wrapping_add(u64::from(decoded.size));
                self.constant(next_rip.wrapping_add(disp as u64))
            }
            0b00 => self.load_greg(Self::rm_register(decoded, code)),
            0b01 | 0b10 => {
                let disp_len = if modrm_mod(modrm) == 0b01 { 1 } else { 4 };
                let disp = Self::trailing_imm(decoded, code, disp_len, 64);
                let base = self.load_greg(Self::rm_register(decoded, code));
                let disp_const = self.constant(disp);
                self.ir.push_bin(IrOp::Add, base, disp_const)
            }
            _ => {
                // mod 11 encodes a register, which LEA cannot take.
                self.decode_failure = true;
                return;
            }
        };
        let address = self.truncate(address, size);
        self.store_greg(address, dst);
    }

    /// `pop r` (0x58+r): load from [RSP], bump RSP by 8.
    fn pop_reg(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if decoded.flags.contains(DecodeFlags::OPSIZE) || !Self::prefixes_lifted(decoded, code) {
            self.decode_failure = true;
            return;
        }
        let has_rex = decoded.flags.contains(DecodeFlags::REX);
        let opcode = if has_rex { code[1] } else { code[0] };
        let rex_b = if has_rex { code[0] & 1 } else { 0 };
        let dst = GPR_MAP[usize::from(rex_b << 3 | (opcode & 0b111))];

        let rsp = self.load_greg(reg::RSP);
        let value = self.ir.push_load_mem(8, rsp, IrRef::INVALID);
        let eight = self.constant(8);
        let new_rsp = self.ir.push_bin(IrOp::Add, rsp, eight);
        self.store_greg(new_rsp, reg::RSP);
        self.store_greg(value, dst);
    }

    /// `ret` (0xC3): pop the return address into RIP.
    fn ret_op(&mut self, _decoded: &DecodedInst, _code: &[u8]) {
        let rsp = self.load_greg(reg::RSP);
        let return_address = self.ir.push_load_mem(8, rsp, IrRef::INVALID);
        let eight = self.constant(8);
        let new_rsp = self.ir.push_bin(IrOp::Add, rsp, eight);
        self.store_greg(new_rsp, reg::RSP);
        self.store_ctx(return_address, X86State::RIP_OFFSET);
    }

    /// `jmp rel8/rel32` (0xEB/0xE9): store the target into RIP; the block
    /// ends with a zero increment.
    fn jmp_rel(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if decoded.flags.contains(DecodeFlags::OPSIZE) || !Self::prefixes_lifted(decoded, code) {
            self.decode_failure = true;
            return;
        }
        let imm_len = if decoded.info.more_bytes == 1 { 1 } else { 4 };
        let disp = Self::trailing_imm(decoded, code, imm_len, 64) as i64;
        let target = self
            .current_rip
            .wrapping_add(u64::from(decoded.size))
            .wrapping_add(disp as u64);
        let target_const = self.constant(target);
        self.store_ctx(target_const, X86State::RIP_OFFSET);
    }

    /// `syscall` (0F 05). RIP is stored twice: the syscall's own address
    /// before the call (the HLE layer reads it: `clone` computes the
    /// child's resume point from it), the successor address after.
    fn syscall_op(&mut self, _decoded: &DecodedInst, _code: &[u8]) {
        const ARG_REGS: [usize; crate::ir::SYSCALL_MAX_ARGS] = [
            reg::RAX,
            reg::RDI,
            reg::RSI,
            reg::RDX,
            reg::R10,
            reg::R8,
            reg::R9,
        ];

        let own_rip = self.constant(self.current_rip);
        self.store_ctx(own_rip, X86State::RIP_OFFSET);

        let mut args = [IrRef::INVALID; crate::ir::SYSCALL_MAX_ARGS];
        for (slot, &index) in args.iter_mut().zip(ARG_REGS.iter()) {
            *slot = self.load_greg(index);
        }
        let result = self.ir.push_syscall(args);
        self.store_greg(result, reg::RAX);

        let next_rip = self.constant(self.current_rip.wrapping_add(2));
        self.store_ctx(next_rip, X86State::RIP_OFFSET);
    }

    /// `shl/shr r/m, imm8` (0xC1 /4, /5, /6), register-direct.
    /// Flags are left untouched by shifts in this lifter.
    fn shift_imm(&mut self, decoded: &DecodedInst, code: &[u8], op: IrOp) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let dst = Self::rm_register(decoded, code);
        let amount = u64::from(code[usize::from(decoded.size) - 1]) & 0x3F;
        let value = self.load_greg(dst);
        let value = self.truncate(value, size);
        let amount_const = self.constant(amount);
        let shifted = self.ir.push_bin(op, value, amount_const);
        let shifted = self.truncate(shifted, size);
        self.store_greg(shifted, dst);
    }

    fn shl_imm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.shift_imm(decoded, code, IrOp::Shl);
    }

    fn shr_imm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.shift_imm(decoded, code, IrOp::Shr);
    }

    /// `bt r/m, r` (0F A3), register-direct: CF = selected bit.
    fn bt_rm_r(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let value = self.load_greg(Self::rm_register(decoded, code));
        let index = self.load_greg(Self::reg_register(decoded, code));
        let mask = self.constant(u64::from(size) - 1);
        let index = self.ir.push_bin(IrOp::And, index, mask);
        let bit = self.ir.push_bin(IrOp::BitExtract, value, index);
        self.set_flag(bit, flag_bit::CF);
    }

    /// `bt r/m, imm8` (0F BA /4), register-direct: CF = selected bit.
    /// Other reg-field selections (BTS/BTR/BTC) fall back.
    fn bt_imm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let modrm = Self::modrm_byte(decoded, code);
        if modrm_reg(modrm) != 4 {
            self.decode_failure = true;
            return;
        }
        let size = Self::op_size(decoded, code);
        let value = self.load_greg(Self::rm_register(decoded, code));
        let index = u64::from(code[usize::from(decoded.size) - 1]) & (u64::from(size) - 1);
        let index_const = self.constant(index);
        let bit = self.ir.push_bin(IrOp::BitExtract, value, index_const);
        self.set_flag(bit, flag_bit::CF);
    }

    /// `inc/dec r/m` (0xFF /0, /1), register-direct. CF is preserved
    /// (architectural); ZF/SF set, OF cleared.
    fn inc_dec(&mut self, decoded: &DecodedInst, code: &[u8], op: IrOp) {
        if !self.require_direct_modrm(decoded, code) {
            return;
        }
        let size = Self::op_size(decoded, code);
        let dst = Self::rm_register(decoded, code);
        let value = self.load_greg(dst);
        let value = self.truncate(value, size);
        let one = self.constant(1);
        let raw = self.ir.push_bin(op, value, one);
        let result = self.truncate(raw, size);
        self.set_zf(result);
        self.set_sf(result, size);
        self.clear_flag(flag_bit::OF);
        self.store_greg(result, dst);
    }

    fn inc_rm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.inc_dec(decoded, code, IrOp::Add);
    }

    fn dec_rm(&mut self, decoded: &DecodedInst, code: &[u8]) {
        self.inc_dec(decoded, code, IrOp::Sub);
    }

    /// NOP forms (0x90, 0F 1F): nothing to emit.
    fn nop_op(&mut self, _decoded: &DecodedInst, _code: &[u8]) {}

    // ALU immediate-form thin wrappers, named for the install table.
    fn add_eax_imm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_eax_imm(AluKind::Add, d, c);
    }
    fn sub_eax_imm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_eax_imm(AluKind::Sub, d, c);
    }
    fn and_eax_imm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_eax_imm(AluKind::And, d, c);
    }
    fn cmp_eax_imm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_eax_imm(AluKind::Cmp, d, c);
    }
    fn test_eax_imm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_eax_imm(AluKind::Test, d, c);
    }
    fn add_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Add, 4, d, c);
    }
    fn or_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Or, 4, d, c);
    }
    fn and_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::And, 4, d, c);
    }
    fn sub_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Sub, 4, d, c);
    }
    fn xor_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Xor, 4, d, c);
    }
    fn cmp_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Cmp, 4, d, c);
    }
    fn add_imm8_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Add, 1, d, c);
    }
    fn or_imm8_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Or, 1, d, c);
    }
    fn and_imm8_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::And, 1, d, c);
    }
    fn sub_imm8_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Sub, 1, d, c);
    }
    fn xor_imm8_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Xor, 1, d, c);
    }
    fn cmp_imm8_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Cmp, 1, d, c);
    }
    fn test_imm32_rm(&mut self, d: &DecodedInst, c: &[u8]) {
        self.alu_imm_rm(AluKind::Test, 4, d, c);
    }
}

// ---------------------------------------------------------------------------
// Handler installation
// ---------------------------------------------------------------------------

/// Thin free-function shims: the tables store plain `fn` pointers.
macro_rules! shim {
    ($name:ident) => {{
        fn shim(b: &mut OpDispatchBuilder, d: &DecodedInst, c: &[u8]) {
            b.$name(d, c);
        }
        shim
    }};
}

/// Attaches lifters to the freshly built decode tables.
pub(crate) fn install_handlers(tables: &mut Tables) {
    type Entry = (u16, u8, super::tables::DispatchFn);

    let base: &[Entry] = &[
        (0x01, 1, shim!(add_rm_r)),
        (0x03, 1, shim!(add_r_rm)),
        (0x05, 1, shim!(add_eax_imm)),
        (0x09, 1, shim!(or_rm_r)),
        (0x0B, 1, shim!(or_r_rm)),
        (0x21, 1, shim!(and_rm_r)),
        (0x23, 1, shim!(and_r_rm)),
        (0x25, 1, shim!(and_eax_imm)),
        (0x29, 1, shim!(sub_rm_r)),
        (0x2B, 1, shim!(sub_r_rm)),
        (0x2D, 1, shim!(sub_eax_imm)),
        (0x31, 1, shim!(xor_rm_r)),
        (0x33, 1, shim!(xor_r_rm)),
        (0x39, 1, shim!(cmp_rm_r)),
        (0x3B, 1, shim!(cmp_r_rm)),
        (0x3D, 1, shim!(cmp_eax_imm)),
        (0x58, 8, shim!(pop_reg)),
        (0x70, 1, shim!(jo_op)),
        (0x71, 1, shim!(jno_op)),
        (0x72, 1, shim!(jb_op)),
        (0x73, 1, shim!(jnb_op)),
        (0x74, 1, shim!(jz_op)),
        (0x75, 1, shim!(jnz_op)),
        (0x76, 1, shim!(jbe_op)),
        (0x77, 1, shim!(jnbe_op)),
        (0x78, 1, shim!(js_op)),
        (0x79, 1, shim!(jns_op)),
        (0x7A, 1, shim!(jp_op)),
        (0x7B, 1, shim!(jnp_op)),
        (0x7C, 1, shim!(jl_op)),
        (0x7D, 1, shim!(jnl_op)),
        (0x7E, 1, shim!(jle_op)),
        (0x7F, 1, shim!(jnle_op)),
        (0x85, 1, shim!(test_rm_r)),
        (0x89, 1, shim!(mov_rm_r)),
        (0x8B, 1, shim!(mov_r_rm)),
        (0x8D, 1, shim!(lea_op)),
        (0x90, 1, shim!(nop_op)),
        (0xA9, 1, shim!(test_eax_imm)),
        (0xB8, 8, shim!(mov_imm_reg)),
        (0xC2, 2, shim!(ret_op)),
        (0xC7, 1, shim!(mov_imm_rm)),
        (0xE9, 1, shim!(jmp_rel)),
        (0xEB, 1, shim!(jmp_rel)),
    ];

    let second: &[Entry] = &[
        (0x05, 1, shim!(syscall_op)),
        (0x1F, 1, shim!(nop_op)),
        (0x80, 1, shim!(jo_op)),
        (0x81, 1, shim!(jno_op)),
        (0x82, 1, shim!(jb_op)),
        (0x83, 1, shim!(jnb_op)),
        (0x84, 1, shim!(jz_op)),
        (0x85, 1, shim!(jnz_op)),
        (0x86, 1, shim!(jbe_op)),
        (0x87, 1, shim!(jnbe_op)),
        (0x88, 1, shim!(js_op)),
        (0x89, 1, shim!(jns_op)),
        (0x8A, 1, shim!(jp_op)),
        (0x8B, 1, shim!(jnp_op)),
        (0x8C, 1, shim!(jl_op)),
        (0x8D, 1, shim!(jnl_op)),
        (0x8E, 1, shim!(jle_op)),
        (0x8F, 1, shim!(jnle_op)),
        (0xA3, 1, shim!(bt_rm_r)),
        (0xB6, 1, shim!(movzx8)),
        (0xB7, 1, shim!(movzx16)),
        (0xBA, 1, shim!(bt_imm)),
    ];

    let modrm: &[Entry] = &[
        (0x8100, 1, shim!(add_imm32_rm)),
        (0x8101, 1, shim!(or_imm32_rm)),
        (0x8104, 1, shim!(and_imm32_rm)),
        (0x8105, 1, shim!(sub_imm32_rm)),
        (0x8106, 1, shim!(xor_imm32_rm)),
        (0x8107, 1, shim!(cmp_imm32_rm)),
        (0x8300, 1, shim!(add_imm8_rm)),
        (0x8301, 1, shim!(or_imm8_rm)),
        (0x8304, 1, shim!(and_imm8_rm)),
        (0x8305, 1, shim!(sub_imm8_rm)),
        (0x8306, 1, shim!(xor_imm8_rm)),
        (0x8307, 1, shim!(cmp_imm8_rm)),
        (0xC104, 1, shim!(shl_imm)),
        (0xC105, 1, shim!(shr_imm)),
        (0xC106, 1, shim!(shl_imm)),
        (0xF700, 2, shim!(test_imm32_rm)),
        (0xFF00, 1, shim!(inc_rm)),
        (0xFF01, 1, shim!(dec_rm)),
    ];

    let mut install = |table: &mut [super::tables::InstInfo], entries: &[Entry]| {
        for &(opcode, count, handler) in entries {
            for i in 0..u16::from(count) {
                let slot = &mut table[usize::from(opcode + i)];
                emu_log::throw_assert!(
                    slot.dispatch.is_none(),
                    "duplicate dispatch handler for opcode {:#x}",
                    opcode + i
                );
                slot.dispatch = Some(handler);
            }
        }
    };
    install(&mut tables.base, base);
    install(&mut tables.second, second);
    install(&mut tables.modrm, modrm);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrInst;
    use crate::x86::decoder::decode;

    fn lift(code: &[u8], rip: u64) -> (OpDispatchBuilder, DecodedInst) {
        let decoded = decode(code).expect("test encoding must decode");
        let mut builder = OpDispatchBuilder::new();
        builder.begin_block();
        builder.add_rip_marker(rip);
        builder.dispatch(&decoded, code);
        (builder, decoded)
    }

    fn insts(builder: &OpDispatchBuilder) -> Vec<IrInst> {
        builder.working_ir().iter().map(|(_, inst)| inst).collect()
    }

    #[test]
    fn mov_reg_reg_is_load_store() {
        // mov rax, rcx
        let (builder, _) = lift(&[0x48, 0x89, 0xC8], 0x1000);
        assert!(!builder.had_decode_failure());
        let seq = insts(&builder);
        assert!(matches!(
            seq[2],
            IrInst::LoadContext { size: 8, offset } if u64::from(offset) == X86State::greg_offset(reg::RCX)
        ));
        assert!(matches!(
            seq[3],
            IrInst::StoreContext { size: 8, offset, .. } if u64::from(offset) == X86State::greg_offset(reg::RAX)
        ));
    }

    #[test]
    fn mov_32bit_truncates() {
        // mov eax, ecx zero-extends into rax.
        let (builder, _) = lift(&[0x89, 0xC8], 0x1000);
        assert!(!builder.had_decode_failure());
        let seq = insts(&builder);
        assert!(seq.iter().any(|i| matches!(i, IrInst::Trunc32 { .. })));
    }

    #[test]
    fn xor_lifts_with_flag_writes() {
        // xor eax, eax
        let (builder, _) = lift(&[0x31, 0xC0], 0x1000);
        assert!(!builder.had_decode_failure());
        let seq = insts(&builder);
        assert!(
            seq.iter()
                .any(|i| matches!(i, IrInst::Bin { op: IrOp::Xor, .. }))
        );
        // ZF/SF/CF/OF writes all store to RFLAGS.
        let rflags_stores = seq
            .iter()
            .filter(|i| {
                matches!(i, IrInst::StoreContext { offset, .. }
                    if u64::from(*offset) == X86State::RFLAGS_OFFSET)
            })
            .count();
        assert_eq!(rflags_stores, 4);
    }

    #[test]
    fn jcc_cond_jump_targets_fall_through() {
        // jne +0x10 at rip 0x2000; rip_target = 0x2000 + 2 + 0x10.
        let (builder, decoded) = lift(&[0x75, 0x10], 0x2000);
        assert!(!builder.had_decode_failure());
        assert_eq!(decoded.size, 2);

        let records: Vec<(IrRef, IrInst)> = builder.working_ir().iter().collect();
        let cond_jump = records
            .iter()
            .find_map(|(_, inst)| match inst {
                IrInst::CondJump {
                    target, rip_target, ..
                } => Some((*target, *rip_target)),
                _ => None,
            })
            .expect("Jcc must emit a CondJump");
        assert_eq!(cond_jump.1, 0x2012);

        // The target must be the JmpTarget record, and the records between
        // must be the taken-path epilogue ending in EndBlock{0}.
        assert!(matches!(
            builder.working_ir().inst_at(cond_jump.0),
            IrInst::JmpTarget
        ));
        assert!(records.iter().any(|(_, inst)| matches!(
            inst,
            IrInst::EndBlock { rip_increment: 0 }
        )));
        assert!(records.iter().any(|(_, inst)| matches!(
            inst,
            IrInst::StoreContext { offset, .. } if u64::from(*offset) == X86State::RIP_OFFSET
        )));
    }

    #[test]
    fn syscall_loads_the_abi_registers_in_order() {
        let (builder, _) = lift(&[0x0F, 0x05], 0x3000);
        assert!(!builder.had_decode_failure());
        let seq = insts(&builder);
        let loads: Vec<u64> = seq
            .iter()
            .filter_map(|inst| match inst {
                IrInst::LoadContext { offset, .. } => Some(u64::from(*offset)),
                _ => None,
            })
            .collect();
        let expected: Vec<u64> = [
            reg::RAX,
            reg::RDI,
            reg::RSI,
            reg::RDX,
            reg::R10,
            reg::R8,
            reg::R9,
        ]
        .iter()
        .map(|&r| X86State::greg_offset(r))
        .collect();
        assert_eq!(loads, expected);
        assert!(seq.iter().any(|i| matches!(i, IrInst::Syscall { .. })));
    }

    #[test]
    fn ret_pops_into_rip() {
        let (builder, _) = lift(&[0xC3], 0x4000);
        assert!(!builder.had_decode_failure());
        let seq = insts(&builder);
        assert!(
            seq.iter()
                .any(|i| matches!(i, IrInst::LoadMem { size: 8, .. }))
        );
        assert!(seq.iter().any(|i| matches!(
            i,
            IrInst::StoreContext { offset, .. } if u64::from(*offset) == X86State::RIP_OFFSET
        )));
    }

    #[test]
    fn unsupported_forms_set_the_failure_flag() {
        // mov r/m8, r8 has no handler.
        let (builder, _) = lift(&[0x88, 0xC8], 0x1000);
        assert!(builder.had_decode_failure());
        // Memory-destination add: mod != 11.
        let (builder, _) = lift(&[0x01, 0x08], 0x1000);
        assert!(builder.had_decode_failure());
        // Parity branch.
        let (builder, _) = lift(&[0x7A, 0x01], 0x1000);
        assert!(builder.had_decode_failure());
    }

    #[test]
    fn failure_leaves_block_reusable_after_reset() {
        let (mut builder, _) = lift(&[0x88, 0xC8], 0x1000);
        assert!(builder.had_decode_failure());
        builder.reset();
        assert!(!builder.had_decode_failure());
        assert!(builder.working_ir().is_empty());
    }
}
