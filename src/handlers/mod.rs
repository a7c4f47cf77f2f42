//! Opcode compile handlers (spec §4.6): one function per instruction family in this build's
//! representative coverage list. Each handler decodes the subset of 68k addressing modes this
//! build translates directly — register-direct (`Dn`/`An`) operands and immediate data — and
//! calls through to [`crate::midlayer::MidLayer`]. Any other addressing mode, and any opcode
//! outside the coverage list, returns [`CompileError::Untranslatable`] so the compile driver
//! falls back to an interpreter call for that one instruction (spec §4.6: "unconditionally").

use crate::backend::x86_64::AluOp;
use crate::backend::{Backend, Size};
use crate::error::CompileError;
use crate::flags::FlagsDefined;
use crate::midlayer::MidLayer;
use crate::vreg::{VRegState, VRegStatus};

/// A decoded operand this build knows how to translate directly.
#[derive(Debug, Clone, Copy)]
enum Operand {
    /// A data or address virtual register index (0-15).
    Reg(usize),
    /// An immediate value, not yet materialized into any virtual register.
    Imm(i32),
}

fn decode_size_0011(bits: u16) -> Option<Size> {
    match bits {
        0b00 => Some(Size::B),
        0b01 => Some(Size::W),
        0b10 => Some(Size::L),
        _ => None,
    }
}

/// Decodes a 6-bit effective-address field (`mmmrrr`) into an [`Operand`], recognizing only the
/// register-direct modes this build compiles (spec §1 Non-goals scope everything else to the
/// interpreter by returning `None`).
fn decode_ea_register_direct(mode: u8, reg: u8) -> Option<Operand> {
    match mode {
        0b000 => Some(Operand::Reg(reg as usize)), // Dn
        0b001 => Some(Operand::Reg(8 + reg as usize)), // An
        _ => None,
    }
}

/// Puts an [`Operand`] into a scratch virtual register slot if it is an immediate, so mid-layer
/// calls that expect a vreg index always have one; for a register operand, the index is handed
/// through unchanged. `scratch_vreg` must not be live across this call's caller's operation.
fn materialize_operand(regs: &mut [VRegState], operand: Operand, scratch_vreg: usize) -> usize {
    match operand {
        Operand::Reg(v) => v,
        Operand::Imm(value) => {
            regs[scratch_vreg].status = VRegStatus::IsConst;
            regs[scratch_vreg].real_reg = crate::vreg::VRegState::UNALLOCATED;
            regs[scratch_vreg].val = value;
            scratch_vreg
        }
    }
}

/// `VREG_FLAGTMP` doubles as the scratch slot for a freshly-decoded immediate operand: by the
/// time a handler needs it for that purpose, any genuine X-flag spill that used it has already
/// been flushed by the preceding instruction's flag materialization.
const SCRATCH_IMM_VREG: usize = crate::vreg::VREG_FLAGTMP;

/// `MOVEQ #data,Dn`: `0111 ddd0 dddddddd`.
pub fn try_moveq<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf100 != 0x7000 {
        return None;
    }
    let dn = ((opcode >> 9) & 0x7) as usize;
    let data = (opcode & 0xff) as i8;
    Some(mid.moveq(regs, buf, dn, data))
}

/// `MOVE.sz <ea>,<ea>` and `MOVEA.sz <ea>,An`: `00SS dddmmm MMMrrr` (destination first in the
/// 68k's unusual field order: bits 11-9 = dest reg, bits 8-6 = dest mode).
pub fn try_move<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    let top2 = (opcode >> 12) & 0xf;
    if !(0b0001..=0b0011).contains(&top2) {
        return None;
    }
    let size = decode_size_0011(match top2 {
        0b0001 => 0b00,
        0b0011 => 0b01,
        0b0010 => 0b10,
        _ => return None,
    })?;
    let src_mode = ((opcode >> 3) & 0x7) as u8;
    let src_reg = (opcode & 0x7) as u8;
    let dst_mode = ((opcode >> 6) & 0x7) as u8;
    let dst_reg = ((opcode >> 9) & 0x7) as u8;

    let src = decode_ea_register_direct(src_mode, src_reg)?;
    let dst = decode_ea_register_direct(dst_mode, dst_reg)?;

    let Operand::Reg(dst_v) = dst else { return Some(Err(CompileError::Untranslatable)) };
    let src_v = materialize_operand(regs, src, SCRATCH_IMM_VREG);

    let result = mid.mov_l(regs, buf, dst_v, src_v, size);
    if result.is_ok() && dst_v < 8 {
        // MOVE to Dn sets CZNV; MOVEA (dst_v >= 8) leaves flags untouched.
        mid.flags.note_native_flags(FlagsDefined::CZNV);
    }
    Some(result)
}

/// `ADD`/`ADDA <ea>,Dn` or `Dn,<ea>`: `1101 ddd opmode mmmrrr` (register-direct destinations
/// only, per this build's coverage). `ADDQ #data,<ea>` is decoded separately since its immediate
/// is embedded in the opcode word itself rather than decoded from an `<ea>` source.
pub fn try_add<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf000 != 0xd000 {
        return None;
    }
    let dn = ((opcode >> 9) & 0x7) as usize;
    let opmode = (opcode >> 6) & 0x7;
    let ea_mode = ((opcode >> 3) & 0x7) as u8;
    let ea_reg = (opcode & 0x7) as u8;
    let ea = decode_ea_register_direct(ea_mode, ea_reg)?;

    let size = match opmode & 0x3 {
        0b000 => Size::B,
        0b001 => Size::W,
        0b010 => Size::L,
        _ => return None,
    };
    let ea_v = materialize_operand(regs, ea, SCRATCH_IMM_VREG);

    if opmode & 0x4 != 0 {
        // <ea> += Dn, result stored to <ea>; this build only compiles the register-direct <ea>.
        let Operand::Reg(ea_reg_v) = ea else { return Some(Err(CompileError::Untranslatable)) };
        Some(mid.add(regs, buf, ea_reg_v, dn, size))
    } else {
        Some(mid.add(regs, buf, dn, ea_v, size))
    }
}

/// `ADDQ #<data>,<ea>`: `0101 ddd0 ssmmmrrr`, data field 1-8 (0 encodes 8).
pub fn try_addq<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf100 != 0x5000 {
        return None;
    }
    let size = decode_size_0011(((opcode >> 6) & 0x3) as u16)?;
    let data = ((opcode >> 9) & 0x7) as i64;
    let data = if data == 0 { 8 } else { data };
    let ea_mode = ((opcode >> 3) & 0x7) as u8;
    let ea_reg = (opcode & 0x7) as u8;
    let Operand::Reg(dst_v) = decode_ea_register_direct(ea_mode, ea_reg)? else {
        return Some(Err(CompileError::Untranslatable));
    };
    Some(mid.add_imm(regs, buf, dst_v, data, size))
}

/// `SUB`/`SUBA <ea>,Dn` or `Dn,<ea>`: `1001 ddd opmode mmmrrr`, same shape as `ADD`.
pub fn try_sub<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf000 != 0x9000 {
        return None;
    }
    let dn = ((opcode >> 9) & 0x7) as usize;
    let opmode = (opcode >> 6) & 0x7;
    let ea_mode = ((opcode >> 3) & 0x7) as u8;
    let ea_reg = (opcode & 0x7) as u8;
    let ea = decode_ea_register_direct(ea_mode, ea_reg)?;
    let size = match opmode & 0x3 {
        0b000 => Size::B,
        0b001 => Size::W,
        0b010 => Size::L,
        _ => return None,
    };
    let ea_v = materialize_operand(regs, ea, SCRATCH_IMM_VREG);

    if opmode & 0x4 != 0 {
        let Operand::Reg(ea_reg_v) = ea else { return Some(Err(CompileError::Untranslatable)) };
        Some(mid.sub(regs, buf, ea_reg_v, dn, size))
    } else {
        Some(mid.sub(regs, buf, dn, ea_v, size))
    }
}

/// `CMP`/`CMPA <ea>,Dn`: `1011 ddd opmode mmmrrr` restricted to the compare-only opmodes.
pub fn try_cmp<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf000 != 0xb000 {
        return None;
    }
    let opmode = (opcode >> 6) & 0x7;
    if opmode & 0x4 != 0 {
        return None; // CMPM/EOR share this major opcode; not in this build's coverage.
    }
    let dn = ((opcode >> 9) & 0x7) as usize;
    let ea_mode = ((opcode >> 3) & 0x7) as u8;
    let ea_reg = (opcode & 0x7) as u8;
    let ea = decode_ea_register_direct(ea_mode, ea_reg)?;
    let size = decode_size_0011(opmode)?;
    let ea_v = materialize_operand(regs, ea, SCRATCH_IMM_VREG);
    Some(mid.cmp(regs, buf, dn, ea_v, size))
}

/// `NEG.sz <ea>`: `0100 0100 ssmmmrrr`. `NEGX` (`0100 0000 ...`) is not decoded here; it falls
/// back to the interpreter per this build's Open Question decision (`DESIGN.md`).
pub fn try_neg<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xff00 != 0x4400 {
        return None;
    }
    let size = decode_size_0011(((opcode >> 6) & 0x3) as u16)?;
    let mode = ((opcode >> 3) & 0x7) as u8;
    let reg = (opcode & 0x7) as u8;
    let Operand::Reg(v) = decode_ea_register_direct(mode, reg)? else {
        return Some(Err(CompileError::Untranslatable));
    };
    Some(mid.neg(regs, buf, v, size))
}

/// `NOT.sz <ea>`: `0100 0110 ssmmmrrr`.
pub fn try_not<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xff00 != 0x4600 {
        return None;
    }
    let size = decode_size_0011(((opcode >> 6) & 0x3) as u16)?;
    let mode = ((opcode >> 3) & 0x7) as u8;
    let reg = (opcode & 0x7) as u8;
    let Operand::Reg(v) = decode_ea_register_direct(mode, reg)? else {
        return Some(Err(CompileError::Untranslatable));
    };
    Some(mid.not(regs, buf, v, size))
}

/// `AND`/`OR <ea>,Dn` or `Dn,<ea>`: `1100 ddd opmode mmmrrr` / `1000 ddd opmode mmmrrr`.
/// `EOR Dn,<ea>` is `1011 ddd 1ss mmmrrr` (opmode high bit set, sharing `CMP`'s major opcode).
pub fn try_bitwise<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    let major = (opcode >> 12) & 0xf;
    let op = match major {
        0b1100 => AluOp::And,
        0b1000 => AluOp::Or,
        0b1011 if (opcode >> 8) & 0x1 != 0 => AluOp::Xor,
        _ => return None,
    };
    let opmode = (opcode >> 6) & 0x7;
    let dn = ((opcode >> 9) & 0x7) as usize;
    let ea_mode = ((opcode >> 3) & 0x7) as u8;
    let ea_reg = (opcode & 0x7) as u8;
    let ea = decode_ea_register_direct(ea_mode, ea_reg)?;
    let size = decode_size_0011(opmode & 0x3)?;

    if op == AluOp::Xor || opmode & 0x4 != 0 {
        let Operand::Reg(ea_reg_v) = ea else { return Some(Err(CompileError::Untranslatable)) };
        Some(mid.bitwise(regs, buf, op, ea_reg_v, dn, size))
    } else {
        let ea_v = materialize_operand(regs, ea, SCRATCH_IMM_VREG);
        Some(mid.bitwise(regs, buf, op, dn, ea_v, size))
    }
}

/// `TST.sz <ea>`: `0100 1010 ssmmmrrr`.
pub fn try_tst<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xff00 != 0x4a00 {
        return None;
    }
    let size = decode_size_0011(((opcode >> 6) & 0x3) as u16)?;
    let mode = ((opcode >> 3) & 0x7) as u8;
    let reg = (opcode & 0x7) as u8;
    let Operand::Reg(v) = decode_ea_register_direct(mode, reg)? else {
        return Some(Err(CompileError::Untranslatable));
    };
    Some(mid.tst(regs, buf, v, size))
}

/// `CLR.sz <ea>`: `0100 0010 ssmmmrrr`.
pub fn try_clr<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xff00 != 0x4200 {
        return None;
    }
    let size = decode_size_0011(((opcode >> 6) & 0x3) as u16)?;
    let mode = ((opcode >> 3) & 0x7) as u8;
    let reg = (opcode & 0x7) as u8;
    let Operand::Reg(v) = decode_ea_register_direct(mode, reg)? else {
        return Some(Err(CompileError::Untranslatable));
    };
    Some(mid.clr(regs, buf, v, size))
}

/// `SWAP Dn`: `0100 1000 01000 rrr`.
pub fn try_swap<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xfff8 != 0x4840 {
        return None;
    }
    let dn = (opcode & 0x7) as usize;
    Some(mid.swap(regs, buf, dn))
}

/// The shift/rotate family on a data register by an immediate count: `1110 ccc d ss i01 rrr`
/// (`i`=0 selects immediate-count form, bits 4-3 select which of ROR/ROL/ASR/ASL/LSR/LSL).
pub fn try_shift<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf000 != 0xe000 {
        return None;
    }
    if (opcode >> 6) & 0x3 == 0b11 {
        return None; // memory-operand shift form, not in this build's coverage.
    }
    if (opcode >> 5) & 0x1 != 0 {
        return None; // register-specified count form, not in this build's coverage.
    }
    let size = decode_size_0011(((opcode >> 6) & 0x3) as u16)?;
    let count_field = (opcode >> 9) & 0x7;
    let count = if count_field == 0 { 8 } else { count_field as u8 };
    let direction_left = (opcode >> 8) & 0x1 != 0;
    let kind = (opcode >> 3) & 0x3;
    let op = match (kind, direction_left) {
        (0b00, false) => crate::backend::x86_64::ShiftOp::Shr,
        (0b00, true) => crate::backend::x86_64::ShiftOp::Shl,
        (0b01, false) => crate::backend::x86_64::ShiftOp::Sar,
        (0b01, true) => crate::backend::x86_64::ShiftOp::Shl,
        (0b11, false) => crate::backend::x86_64::ShiftOp::Ror,
        (0b11, true) => crate::backend::x86_64::ShiftOp::Rol,
        _ => return None, // ROXR/ROXL (kind 0b10): needs X-flag plumbing, out of this build's coverage.
    };
    let dn = (opcode & 0x7) as usize;
    Some(mid.shift_ri(regs, buf, op, dn, count, size))
}

/// `LEA (An),Am`: `0100 aaa 111 010 rrr`. Only the `(An)` source addressing mode is in this
/// build's coverage (spec §1 Non-goals scope every other `<ea>` mode — displacement, indexed,
/// absolute, PC-relative — to the interpreter); `(An)`'s effective address is just An's own
/// contents, so no address arithmetic is needed before the register-to-register move.
pub fn try_lea<B: Backend>(mid: &mut MidLayer<B>, regs: &mut [VRegState], buf: &mut Vec<u8>, opcode: u16) -> Option<Result<(), CompileError>> {
    if opcode & 0xf1f8 != 0x41d0 {
        return None;
    }
    let an = 8 + ((opcode >> 9) & 0x7) as usize;
    let src_an = 8 + (opcode & 0x7) as usize;

    let addr_reg = match mid.alloc.readreg(regs, buf, src_an, Size::L) {
        Ok(reg) => reg,
        Err(err) => return Some(Err(err)),
    };
    let result = mid.lea(regs, buf, an, addr_reg);
    mid.alloc.unlock(addr_reg);
    Some(result)
}

/// Attempts every handler in coverage order, returning the first match.
pub fn compile_opcode<B: Backend>(
    mid: &mut MidLayer<B>,
    regs: &mut [VRegState],
    buf: &mut Vec<u8>,
    opcode: u16,
) -> Result<(), CompileError> {
    try_moveq(mid, regs, buf, opcode)
        .or_else(|| try_move(mid, regs, buf, opcode))
        .or_else(|| try_addq(mid, regs, buf, opcode))
        .or_else(|| try_add(mid, regs, buf, opcode))
        .or_else(|| try_sub(mid, regs, buf, opcode))
        .or_else(|| try_cmp(mid, regs, buf, opcode))
        .or_else(|| try_neg(mid, regs, buf, opcode))
        .or_else(|| try_not(mid, regs, buf, opcode))
        .or_else(|| try_lea(mid, regs, buf, opcode))
        .or_else(|| try_bitwise(mid, regs, buf, opcode))
        .or_else(|| try_tst(mid, regs, buf, opcode))
        .or_else(|| try_clr(mid, regs, buf, opcode))
        .or_else(|| try_swap(mid, regs, buf, opcode))
        .or_else(|| try_shift(mid, regs, buf, opcode))
        .unwrap_or(Err(CompileError::Untranslatable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86_64::X86_64;
    use crate::vreg::VRegFile;

    #[test]
    fn moveq_decodes_sign_extended_immediate() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // MOVEQ #-1,D3: 0111 011 0 11111111
        let opcode = 0x76ffu16;
        let result = try_moveq(&mut mid, &mut file.gpr, &mut buf, opcode);
        assert!(result.is_some());
        result.unwrap().unwrap();
        assert_eq!(file.gpr[3].status, VRegStatus::Dirty);
    }

    #[test]
    fn add_dn_dn_compiles_via_coverage_dispatch() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // ADD.L D1,D0: 1101 000 010 000 001
        let opcode = 0xd081u16;
        compile_opcode(&mut mid, &mut file.gpr, &mut buf, opcode).unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn unknown_opcode_is_untranslatable() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        let err = compile_opcode(&mut mid, &mut file.gpr, &mut buf, 0xa000).unwrap_err();
        assert_eq!(err, CompileError::Untranslatable);
    }

    #[test]
    fn neg_l_d0_compiles() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // NEG.L D0: 0100 0100 10 000 000
        let opcode = 0x4480u16;
        compile_opcode(&mut mid, &mut file.gpr, &mut buf, opcode).unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn swap_d0_compiles() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        let opcode = 0x4840u16; // SWAP D0
        compile_opcode(&mut mid, &mut file.gpr, &mut buf, opcode).unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn lea_an_indirect_copies_the_source_address_register() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // LEA (A1),A0: 0100 000 111 010 001 = 0x41d1
        let opcode = 0x41d1u16;
        compile_opcode(&mut mid, &mut file.gpr, &mut buf, opcode).unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn lea_outside_an_indirect_mode_is_untranslatable() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // LEA $10(A1),A0: same aaa/opcode class but mode=101 (An with displacement), not (An).
        let opcode = 0x41e9u16;
        let err = compile_opcode(&mut mid, &mut file.gpr, &mut buf, opcode).unwrap_err();
        assert_eq!(err, CompileError::Untranslatable);
    }

    #[test]
    fn ror_w_immediate_compiles() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // ROR.W #1,D0: 1110 001 0 01 011 000
        let opcode = 0xe258u16;
        compile_opcode(&mut mid, &mut file.gpr, &mut buf, opcode).unwrap();
        assert!(!buf.is_empty());
    }
}
