//! The intrusive IR container.

use std::fmt::Write as _;

use super::{IrInst, IrOp, IrRef, SYSCALL_MAX_ARGS, SelectCmp};

/// A packed, append-only buffer of IR records.
///
/// Records are appended with the typed `push_*` methods, each returning the
/// new record's [`IrRef`]. Once built, a block is immutable apart from
/// [`IrBlock::patch_cond_jump_target`], which resolves the one forward
/// reference the lifter needs (a `CondJump` aimed at a `JmpTarget` that is
/// emitted a few records later).
#[derive(Clone, Default)]
pub struct IrBlock {
    buf: Vec<u8>,
}

impl IrBlock {
    /// Creates an empty block.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Total encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no record has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discards all records.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    // -- append ---------------------------------------------------------------

    fn begin_record(&mut self, op: IrOp) -> IrRef {
        let offset = IrRef(self.buf.len() as u32);
        self.buf.push(op as u8);
        offset
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_ref(&mut self, value: IrRef) {
        self.put_u32(value.0);
    }

    /// Appends a `Constant`.
    pub fn push_constant(&mut self, value: u64) -> IrRef {
        let r = self.begin_record(IrOp::Constant);
        self.put_u64(value);
        r
    }

    /// Appends a `LoadContext`.
    pub fn push_load_context(&mut self, size: u8, offset: u32) -> IrRef {
        let r = self.begin_record(IrOp::LoadContext);
        self.put_u8(size);
        self.put_u32(offset);
        r
    }

    /// Appends a `StoreContext`.
    pub fn push_store_context(&mut self, size: u8, offset: u32, arg: IrRef) -> IrRef {
        let r = self.begin_record(IrOp::StoreContext);
        self.put_u8(size);
        self.put_u32(offset);
        self.put_ref(arg);
        r
    }

    /// Appends a `LoadMem`; pass [`IrRef::INVALID`] for a missing index.
    pub fn push_load_mem(&mut self, size: u8, base: IrRef, index: IrRef) -> IrRef {
        let r = self.begin_record(IrOp::LoadMem);
        self.put_u8(size);
        self.put_ref(base);
        self.put_ref(index);
        r
    }

    /// Appends a two-operand arithmetic/logic record.
    ///
    /// `op` must be one of the binary ops; anything else is a lifter bug.
    pub fn push_bin(&mut self, op: IrOp, a: IrRef, b: IrRef) -> IrRef {
        emu_log::throw_assert!(
            matches!(
                op,
                IrOp::Add
                    | IrOp::Sub
                    | IrOp::Or
                    | IrOp::Xor
                    | IrOp::Shl
                    | IrOp::Shr
                    | IrOp::And
                    | IrOp::Nand
                    | IrOp::BitExtract
            ),
            "push_bin called with non-binary op {}",
            op.name()
        );
        let r = self.begin_record(op);
        self.put_ref(a);
        self.put_ref(b);
        r
    }

    /// Appends a `Select`.
    pub fn push_select(&mut self, cmp: SelectCmp, a: IrRef, b: IrRef, t: IrRef, f: IrRef) -> IrRef {
        let r = self.begin_record(IrOp::Select);
        self.put_u8(cmp as u8);
        self.put_ref(a);
        self.put_ref(b);
        self.put_ref(t);
        self.put_ref(f);
        r
    }

    /// Appends a `Trunc_16`.
    pub fn push_trunc16(&mut self, arg: IrRef) -> IrRef {
        let r = self.begin_record(IrOp::Trunc16);
        self.put_ref(arg);
        r
    }

    /// Appends a `Trunc_32`.
    pub fn push_trunc32(&mut self, arg: IrRef) -> IrRef {
        let r = self.begin_record(IrOp::Trunc32);
        self.put_ref(arg);
        r
    }

    /// Appends a `BeginBlock`.
    pub fn push_begin_block(&mut self) -> IrRef {
        self.begin_record(IrOp::BeginBlock)
    }

    /// Appends an `EndBlock`.
    pub fn push_end_block(&mut self, rip_increment: u64) -> IrRef {
        let r = self.begin_record(IrOp::EndBlock);
        self.put_u64(rip_increment);
        r
    }

    /// Appends a `CondJump` whose target is patched later.
    pub fn push_cond_jump(&mut self, cond: IrRef, rip_target: u64) -> IrRef {
        let r = self.begin_record(IrOp::CondJump);
        self.put_ref(cond);
        self.put_ref(IrRef::INVALID);
        self.put_u64(rip_target);
        r
    }

    /// Appends a `JmpTarget`.
    pub fn push_jmp_target(&mut self) -> IrRef {
        self.begin_record(IrOp::JmpTarget)
    }

    /// Appends a `Syscall`.
    pub fn push_syscall(&mut self, args: [IrRef; SYSCALL_MAX_ARGS]) -> IrRef {
        let r = self.begin_record(IrOp::Syscall);
        for arg in args {
            self.put_ref(arg);
        }
        r
    }

    /// Appends a `RIPMarker`.
    pub fn push_rip_marker(&mut self, rip: u64) -> IrRef {
        let r = self.begin_record(IrOp::RipMarker);
        self.put_u64(rip);
        r
    }

    /// Resolves a forward `CondJump` to its `JmpTarget` record.
    pub fn patch_cond_jump_target(&mut self, cond_jump: IrRef, target: IrRef) {
        let at = cond_jump.0 as usize;
        emu_log::throw_assert!(
            self.buf.get(at) == Some(&(IrOp::CondJump as u8)),
            "patch target of a non-CondJump record at {}",
            cond_jump.0
        );
        // tag(1) + cond(4), then the target field.
        let field = at + 5;
        self.buf[field..field + 4].copy_from_slice(&target.0.to_le_bytes());
    }

    // -- read -----------------------------------------------------------------

    fn get_u8(&self, at: usize) -> u8 {
        self.buf[at]
    }

    fn get_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.buf[at..at + 4].try_into().expect("in-bounds"))
    }

    fn get_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.buf[at..at + 8].try_into().expect("in-bounds"))
    }

    fn get_ref(&self, at: usize) -> IrRef {
        IrRef(self.get_u32(at))
    }

    /// Opcode tag of the record at `offset`.
    #[must_use]
    pub fn op_at(&self, offset: IrRef) -> IrOp {
        let tag = self.get_u8(offset.0 as usize);
        match IrOp::from_tag(tag) {
            Some(op) => op,
            None => emu_log::fatal(format_args!(
                "corrupt IR block: unknown op tag {tag} at offset {}",
                offset.0
            )),
        }
    }

    /// Decodes the record at `offset`.
    #[must_use]
    pub fn inst_at(&self, offset: IrRef) -> IrInst {
        let op = self.op_at(offset);
        let p = offset.0 as usize + 1;
        match op {
            IrOp::Constant => IrInst::Constant {
                value: self.get_u64(p),
            },
            IrOp::LoadContext => IrInst::LoadContext {
                size: self.get_u8(p),
                offset: self.get_u32(p + 1),
            },
            IrOp::StoreContext => IrInst::StoreContext {
                size: self.get_u8(p),
                offset: self.get_u32(p + 1),
                arg: self.get_ref(p + 5),
            },
            IrOp::LoadMem => IrInst::LoadMem {
                size: self.get_u8(p),
                base: self.get_ref(p + 1),
                index: self.get_ref(p + 5),
            },
            IrOp::Add
            | IrOp::Sub
            | IrOp::Or
            | IrOp::Xor
            | IrOp::Shl
            | IrOp::Shr
            | IrOp::And
            | IrOp::Nand
            | IrOp::BitExtract => IrInst::Bin {
                op,
                args: [self.get_ref(p), self.get_ref(p + 4)],
            },
            IrOp::Select => IrInst::Select {
                cmp: if self.get_u8(p) == SelectCmp::Eq as u8 {
                    SelectCmp::Eq
                } else {
                    SelectCmp::Neq
                },
                args: [
                    self.get_ref(p + 1),
                    self.get_ref(p + 5),
                    self.get_ref(p + 9),
                    self.get_ref(p + 13),
                ],
            },
            IrOp::Trunc16 => IrInst::Trunc16 {
                arg: self.get_ref(p),
            },
            IrOp::Trunc32 => IrInst::Trunc32 {
                arg: self.get_ref(p),
            },
            IrOp::BeginBlock => IrInst::BeginBlock,
            IrOp::EndBlock => IrInst::EndBlock {
                rip_increment: self.get_u64(p),
            },
            IrOp::Jump => IrInst::Jump {
                target: self.get_ref(p),
            },
            IrOp::CondJump => IrInst::CondJump {
                cond: self.get_ref(p),
                target: self.get_ref(p + 4),
                rip_target: self.get_u64(p + 8),
            },
            IrOp::JmpTarget => IrInst::JmpTarget,
            IrOp::Return => IrInst::Return,
            IrOp::Call => IrInst::Call {
                target: self.get_ref(p),
            },
            IrOp::ExternCall => IrInst::ExternCall {
                target: self.get_ref(p),
            },
            IrOp::Syscall => {
                let mut args = [IrRef::INVALID; SYSCALL_MAX_ARGS];
                for (i, slot) in args.iter_mut().enumerate() {
                    *slot = self.get_ref(p + i * 4);
                }
                IrInst::Syscall { args }
            }
            IrOp::RipMarker => IrInst::RipMarker {
                rip: self.get_u64(p),
            },
        }
    }

    /// Iterates `(offset, decoded record)` in emission order.
    pub fn iter(&self) -> IrIter<'_> {
        IrIter {
            block: self,
            offset: 0,
        }
    }

    /// Renders the block in the textual form the original dumper used
    /// (`%offset = Op args`).
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (at, inst) in self.iter() {
            let off = at.0;
            match inst {
                IrInst::Constant { value } => {
                    let _ = writeln!(out, "%{off} = Constant {value:#x}");
                }
                IrInst::LoadContext { size, offset } => {
                    let _ = writeln!(out, "%{off} = LoadContext {size} {offset:#x}");
                }
                IrInst::StoreContext { size, offset, arg } => {
                    let _ = writeln!(out, "StoreContext {size} {offset:#x} %{}", arg.0);
                }
                IrInst::LoadMem { size, base, index } => {
                    if index.is_invalid() {
                        let _ = writeln!(out, "%{off} = LoadMem {size} [%{}]", base.0);
                    } else {
                        let _ = writeln!(out, "%{off} = LoadMem {size} [%{} + %{}]", base.0, index.0);
                    }
                }
                IrInst::Bin { op, args } => {
                    let _ = writeln!(out, "%{off} = {} %{} %{}", op.name(), args[0].0, args[1].0);
                }
                IrInst::Select { cmp, args } => {
                    let name = match cmp {
                        SelectCmp::Eq => "SelectEQ",
                        SelectCmp::Neq => "SelectNEQ",
                    };
                    let _ = writeln!(
                        out,
                        "%{off} = {name} %{} %{} %{} %{}",
                        args[0].0, args[1].0, args[2].0, args[3].0
                    );
                }
                IrInst::Trunc16 { arg } => {
                    let _ = writeln!(out, "%{off} = Trunc_16 %{}", arg.0);
                }
                IrInst::Trunc32 { arg } => {
                    let _ = writeln!(out, "%{off} = Trunc_32 %{}", arg.0);
                }
                IrInst::BeginBlock => {
                    let _ = writeln!(out, "BeginBlock");
                }
                IrInst::EndBlock { rip_increment } => {
                    let _ = writeln!(out, "EndBlock {rip_increment}");
                }
                IrInst::Jump { target } => {
                    let _ = writeln!(out, "Jump %{}", target.0);
                }
                IrInst::CondJump {
                    cond,
                    target,
                    rip_target,
                } => {
                    let _ = writeln!(out, "CondJump %{} %{} {rip_target:#x}", cond.0, target.0);
                }
                IrInst::JmpTarget => {
                    let _ = writeln!(out, "%{off}: JmpTarget");
                }
                IrInst::Return => {
                    let _ = writeln!(out, "Return");
                }
                IrInst::Call { target } => {
                    let _ = writeln!(out, "Call %{}", target.0);
                }
                IrInst::ExternCall { target } => {
                    let _ = writeln!(out, "ExternCall %{}", target.0);
                }
                IrInst::Syscall { args } => {
                    let _ = write!(out, "%{off} = Syscall");
                    for arg in args {
                        let _ = write!(out, " %{}", arg.0);
                    }
                    let _ = writeln!(out);
                }
                IrInst::RipMarker { rip } => {
                    let _ = writeln!(out, "RIPMarker {rip:#x}");
                }
            }
        }
        out
    }
}

/// Iterator over `(offset, record)` pairs.
pub struct IrIter<'a> {
    block: &'a IrBlock,
    offset: usize,
}

impl Iterator for IrIter<'_> {
    type Item = (IrRef, IrInst);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.len() {
            return None;
        }
        let at = IrRef(self.offset as u32);
        let op = self.block.op_at(at);
        let inst = self.block.inst_at(at);
        self.offset += op.size();
        Some((at, inst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_record_starts() {
        let mut ir = IrBlock::new();
        let begin = ir.push_begin_block();
        let c = ir.push_constant(42);
        let load = ir.push_load_context(8, 8);
        let add = ir.push_bin(IrOp::Add, load, c);
        ir.push_store_context(8, 8, add);
        ir.push_end_block(3);

        assert_eq!(begin, IrRef(0));
        assert_eq!(c, IrRef(IrOp::BeginBlock.size() as u32));
        let decoded: Vec<_> = ir.iter().collect();
        assert_eq!(decoded.len(), 6);
        assert_eq!(decoded[1].1, IrInst::Constant { value: 42 });
        assert_eq!(
            decoded[3].1,
            IrInst::Bin {
                op: IrOp::Add,
                args: [load, c]
            }
        );
    }

    #[test]
    fn operands_always_refer_backwards() {
        let mut ir = IrBlock::new();
        ir.push_begin_block();
        let a = ir.push_constant(1);
        let b = ir.push_constant(2);
        let sum = ir.push_bin(IrOp::Add, a, b);
        ir.push_store_context(8, 16, sum);
        ir.push_end_block(0);

        for (at, inst) in ir.iter() {
            let operands: Vec<IrRef> = match inst {
                IrInst::Bin { args, .. } => args.to_vec(),
                IrInst::StoreContext { arg, .. } => vec![arg],
                IrInst::Select { args, .. } => args.to_vec(),
                IrInst::Syscall { args } => args.to_vec(),
                IrInst::LoadMem { base, index, .. } => vec![base, index],
                _ => vec![],
            };
            for operand in operands {
                if !operand.is_invalid() {
                    assert!(
                        operand < at,
                        "operand %{} of record %{} refers forward",
                        operand.0,
                        at.0
                    );
                }
            }
        }
    }

    #[test]
    fn cond_jump_patch_lands_on_jmp_target() {
        let mut ir = IrBlock::new();
        ir.push_begin_block();
        let cond = ir.push_constant(1);
        let cj = ir.push_cond_jump(cond, 0x1000);
        ir.push_end_block(0);
        let target = ir.push_jmp_target();
        ir.patch_cond_jump_target(cj, target);

        match ir.inst_at(cj) {
            IrInst::CondJump {
                target: t,
                rip_target,
                ..
            } => {
                assert_eq!(t, target);
                assert_eq!(rip_target, 0x1000);
                assert_eq!(ir.op_at(t), IrOp::JmpTarget);
            }
            other => panic!("expected CondJump, decoded {other:?}"),
        }
    }

    #[test]
    fn copied_blocks_decode_identically() {
        let mut ir = IrBlock::new();
        ir.push_begin_block();
        let v = ir.push_constant(7);
        ir.push_store_context(8, 8, v);
        ir.push_end_block(2);

        let copy = ir.clone();
        let a: Vec<_> = ir.iter().collect();
        let b: Vec<_> = copy.iter().collect();
        assert_eq!(a, b);
    }
}
