//! Instruction decoder.
//!
//! Consumes prefixes and the opcode, resolves the table entry, and computes
//! the exact encoded length (prefixes + opcode + ModRM + SIB + displacement
//! + immediate). The decoder never interprets operands: that is the
//! lifter's job: it only has to agree with the hardware about how many
//! bytes the instruction occupies and which table entry describes it.

use super::tables::{DecodeFlags, InstClass, InstFlags, InstInfo, tables};

/// A decoded instruction: table entry plus run-time length information.
#[derive(Clone, Copy)]
pub struct DecodedInst {
    /// The table entry.
    pub info: &'static InstInfo,
    /// Total encoded length in bytes.
    pub size: u8,
    /// Number of prefix bytes consumed (escape bytes included).
    pub prefix_bytes: u8,
    /// Run-time decode observations.
    pub flags: DecodeFlags,
}

/// Outcome of resolving a leaf table entry.
struct LeafLength {
    /// The instruction wants to be re-dispatched (prefix entry).
    again: bool,
    /// ModRM/SIB/displacement/immediate byte count.
    additional: usize,
}

/// Computes the trailing length for a resolved table entry.
///
/// `at` is the index of the (unconsumed) ModRM byte in `code`. Returns
/// `None` when the byte stream ends inside the instruction.
#[allow(clippy::too_many_arguments)]
fn leaf_length(
    entry: &'static InstInfo,
    code: &[u8],
    at: usize,
    rex_modrm_hint: bool,
    rex_sib_hint: bool,
    widening: bool,
    narrowing: bool,
    flags: &mut DecodeFlags,
) -> Option<LeafLength> {
    if matches!(entry.class, InstClass::LegacyPrefix) {
        // Segment overrides and REP/REPNZ: recognized and skipped.
        return Some(LeafLength {
            again: true,
            additional: 0,
        });
    }

    let mut has_modrm = entry.flags.contains(InstFlags::HAS_MODRM) || rex_modrm_hint;
    if entry.flags.contains(InstFlags::REX_IN_BYTE) {
        has_modrm = false;
    }

    let mut has_sib = rex_sib_hint;
    let mut disp = 0usize;

    if has_modrm {
        let modrm = *code.get(at)?;
        let mod_bits = modrm >> 6;
        let rm = modrm & 0b111;

        // SIB present when the encoding is not register-direct and rm
        // selects the SIB escape.
        has_sib = has_sib || (mod_bits != 0b11 && rm == 0b100);

        if mod_bits == 0b01 {
            disp = 1;
        } else if mod_bits == 0b10 {
            disp = 4;
        } else if mod_bits == 0 && rm == 0b101 {
            disp = 4; // RIP-relative
        }

        if has_sib {
            let sib = *code.get(at + 1)?;
            // SIB base 0b101 with mod 00 means a 32-bit displacement.
            if sib & 0b111 == 0b101 && disp == 0 {
                disp = 4;
            }
        }
    }

    let mut additional = 0usize;
    if has_modrm {
        additional += 1;
        *flags |= DecodeFlags::MODRM;
    }
    if has_sib {
        additional += 1;
        *flags |= DecodeFlags::SIB;
    }
    additional += disp;

    let mut imm = usize::from(entry.more_bytes);
    if entry.flags.contains(InstFlags::DISPLACE_SIZE_MUL_2) && widening {
        imm *= 2;
    }
    if entry.flags.contains(InstFlags::DISPLACE_SIZE_DIV_2) && narrowing {
        imm /= 2;
    }
    additional += imm;

    Some(LeafLength {
        again: false,
        additional,
    })
}

/// Decodes one instruction from `code`.
///
/// Returns `None` for unknown encodings and for byte streams that end
/// mid-instruction; the caller treats both as a fatal decode error for the
/// block being lifted.
#[must_use]
pub fn decode(code: &[u8]) -> Option<DecodedInst> {
    let t = tables();

    let mut size = 0usize;
    let mut prefix_bytes = 0u8;
    let mut flags = DecodeFlags::empty();
    let mut rex_modrm_hint = false;
    let mut rex_sib_hint = false;
    let mut widening = false;
    let mut narrowing = false;
    let mut info: Option<&'static InstInfo> = None;

    loop {
        let mut again = false;
        let mut additional = 0usize;
        let op = *code.get(size)?;
        size += 1;

        match op {
            0x0F => {
                // Escape to the two-byte map (or further escapes).
                prefix_bytes += 1;
                let next = *code.get(size)?;
                size += 1;
                match next {
                    0x0F => {
                        // 3DNow!: acknowledged, not populated.
                        prefix_bytes += 1;
                        let _ = *code.get(size)?;
                        size += 1;
                    }
                    0x38 | 0x3A => {
                        // Three-byte maps: acknowledged, left empty.
                        prefix_bytes += 1;
                    }
                    _ => {
                        let entry = &t.second[usize::from(next)];
                        let leaf = leaf_length(
                            entry,
                            code,
                            size,
                            rex_modrm_hint,
                            rex_sib_hint,
                            widening,
                            narrowing,
                            &mut flags,
                        )?;
                        again = leaf.again;
                        additional = leaf.additional;
                        info = Some(entry);
                    }
                }
            }
            0x66 => {
                narrowing = true;
                prefix_bytes += 1;
                flags |= DecodeFlags::OPSIZE;
                again = true;
            }
            0x67 => {
                prefix_bytes += 1;
                flags |= DecodeFlags::ADSIZE;
                again = true;
            }
            0x40..=0x4F => {
                // REX. W widens immediates; R/B hint that a ModRM byte
                // follows, X that a SIB byte does.
                if op & 0b0101 != 0 {
                    rex_modrm_hint = true;
                }
                if op & 0b0010 != 0 {
                    rex_sib_hint = true;
                }
                if op & 0b1000 != 0 {
                    widening = true;
                }
                flags |= DecodeFlags::REX;
                again = true;
            }
            0xF0 => {
                flags |= DecodeFlags::LOCK;
                again = true;
            }
            _ => {
                let entry = &t.base[usize::from(op)];
                if matches!(entry.class, InstClass::ModRmTablePrefix) {
                    // Group opcode: the reg field selects the leaf.
                    let modrm = *code.get(size)?;
                    let mask = (1u16 << entry.more_bytes) - 1;
                    let key = (u16::from(op) << 8) | (u16::from(modrm >> 3) & 0b111 & mask);
                    let leaf_entry = &t.modrm[usize::from(key)];
                    let leaf = leaf_length(
                        leaf_entry,
                        code,
                        size,
                        rex_modrm_hint,
                        rex_sib_hint,
                        widening,
                        narrowing,
                        &mut flags,
                    )?;
                    again = leaf.again;
                    additional = leaf.additional;
                    info = Some(leaf_entry);
                } else {
                    let leaf = leaf_length(
                        entry,
                        code,
                        size,
                        rex_modrm_hint,
                        rex_sib_hint,
                        widening,
                        narrowing,
                        &mut flags,
                    )?;
                    again = leaf.again;
                    additional = leaf.additional;
                    info = Some(entry);
                }
            }
        }

        // Consume ModRM/SIB/displacement/immediate bytes.
        if size + additional > code.len() {
            return None;
        }
        size += additional;

        if !again {
            break;
        }
    }

    let info = info?;
    if matches!(info.class, InstClass::Unknown) {
        return None;
    }
    Some(DecodedInst {
        info,
        size: size as u8,
        prefix_bytes,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len_of(bytes: &[u8]) -> u8 {
        decode(bytes)
            .unwrap_or_else(|| panic!("decode failed for {bytes:02x?}"))
            .size
    }

    #[test]
    fn consumes_exactly_the_encoded_length() {
        // Every decoded instruction of length n consumed exactly n bytes.
        let cases: &[(&[u8], u8)] = &[
            (&[0x90], 1),                                     // nop
            (&[0x31, 0xC0], 2),                               // xor eax, eax
            (&[0x48, 0x89, 0xC8], 3),                         // mov rax, rcx
            (&[0x48, 0x83, 0xC0, 0x05], 4),                   // add rax, 5
            (&[0x05, 0x44, 0x33, 0x22, 0x11], 5),             // add eax, imm32
            (&[0x66, 0x05, 0x22, 0x11], 4),                   // add ax, imm16 (halved)
            (&[0xB8, 0x78, 0x56, 0x34, 0x12], 5),             // mov eax, imm32
            (&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8], 10),      // mov rax, imm64 (doubled)
            (&[0x75, 0x10], 2),                               // jnz rel8
            (&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00], 6),       // jnz rel32
            (&[0x0F, 0x05], 2),                               // syscall
            (&[0xC3], 1),                                     // ret
            (&[0xEB, 0xFE], 2),                               // jmp rel8
            (&[0xE9, 0x00, 0x00, 0x00, 0x00], 5),             // jmp rel32
            (&[0x8B, 0x45, 0x08], 3),                         // mov eax, [rbp+8]
            (&[0x8B, 0x44, 0x24, 0x08], 4),                   // mov eax, [rsp+8] (SIB)
            (&[0x8B, 0x84, 0x24, 0x00, 0x01, 0x00, 0x00], 7), // mov eax, [rsp+0x100]
            (&[0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 6),       // mov eax, [rip+0x10]
            (&[0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00], 6),       // mov eax, imm32 (C7)
            (&[0x66, 0x83, 0x78, 0x36, 0x38], 5),             // cmp word [rax+0x36], 0x38
            (&[0x0F, 0xB6, 0xC0], 3),                         // movzx eax, al
            (&[0x58], 1),                                     // pop rax
            (&[0x41, 0x58], 2),                               // pop r8 (REX.B, no ModRM)
            (&[0xF7, 0xC0, 0x01, 0x00, 0x00, 0x00], 6),       // test eax, imm32
        ];
        for &(bytes, expected) in cases {
            assert_eq!(len_of(bytes), expected, "length of {bytes:02x?}");
        }
    }

    #[test]
    fn sib_base_101_adds_displacement() {
        // mov eax, [rbp + rax*2]: SIB base 0b101 with mod 00 forces disp32.
        assert_eq!(len_of(&[0x8B, 0x04, 0x45, 0, 0, 0, 0]), 7);
    }

    #[test]
    fn lock_prefix_is_observed() {
        let decoded = decode(&[0xF0, 0xFF, 0x00]).expect("lock inc dword [rax]");
        assert!(decoded.flags.contains(DecodeFlags::LOCK));
        assert_eq!(decoded.info.name, "INC");
    }

    #[test]
    fn group_opcodes_resolve_through_reg_field() {
        let decoded = decode(&[0x83, 0xE8, 0x01]).expect("sub eax, 1");
        assert_eq!(decoded.info.name, "SUB");
        let decoded = decode(&[0xC1, 0xE0, 0x04]).expect("shl eax, 4");
        assert_eq!(decoded.info.name, "SHL");
        let decoded = decode(&[0xFF, 0xE0]).expect("jmp rax");
        assert_eq!(decoded.info.name, "JMP");
    }

    #[test]
    fn unknown_and_truncated_encodings_fail() {
        assert!(decode(&[0x0F, 0x38, 0x00]).is_none(), "empty three-byte map");
        assert!(decode(&[0x48]).is_none(), "lone REX prefix");
        assert!(decode(&[0x83, 0xE8]).is_none(), "immediate cut short");
        assert!(decode(&[]).is_none(), "empty stream");
    }

    #[test]
    fn prefix_bytes_are_counted() {
        let decoded = decode(&[0x0F, 0x05]).expect("syscall");
        assert_eq!(decoded.prefix_bytes, 1);
        let decoded = decode(&[0x66, 0x05, 0x22, 0x11]).expect("add ax, imm16");
        assert_eq!(decoded.prefix_bytes, 1);
        assert!(decoded.flags.contains(DecodeFlags::OPSIZE));
    }

    #[test]
    fn rex_flags_reach_the_result() {
        let decoded = decode(&[0x48, 0x89, 0xC8]).expect("mov rax, rcx");
        assert!(decoded.flags.contains(DecodeFlags::REX));
        assert!(decoded.flags.contains(DecodeFlags::MODRM));
        assert!(!decoded.flags.contains(DecodeFlags::SIB));
    }
}
