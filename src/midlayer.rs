//! The mid-layer (spec §4.4): register-aware wrapper functions over the encoder, generic over
//! [`Backend`]. Compile handlers only ever call functions here — never the allocator, flag
//! engine, or encoder directly — so handlers stay backend-agnostic and oblivious to register
//! lifetimes.

use crate::backend::x86_64::{self, AluOp, GpReg, ShiftOp};
use crate::backend::{Backend, Size};
use crate::error::CompileError;
use crate::flags::{FlagState, FlagsDefined};
use crate::regalloc::RegAlloc;
use crate::vreg::{VRegState, VRegStatus};

/// Bundles the pieces a compile handler needs to turn one guest operation into host code:
/// the virtual register file, its allocator, and the pending-flags tracker.
pub struct MidLayer<B: Backend> {
    pub alloc: RegAlloc<B>,
    pub flags: FlagState,
}

impl<B: Backend> MidLayer<B> {
    pub fn new() -> Self {
        Self {
            alloc: RegAlloc::new(),
            flags: FlagState::new(),
        }
    }

    /// `MOVE <ea>,<ea>`/`MOVEA`: copies `src` into `dst` without reading `dst`'s old value
    /// (spec handler list: MOVE, MOVEA). Sets CZNV for the MOVE form; MOVEA does not touch
    /// flags, left to the caller by simply not calling [`Self::note_flags_czn`] afterward.
    pub fn mov_l(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        src: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        if regs[src].status == VRegStatus::IsConst {
            let imm = regs[src].val as i64;
            self.alloc.forget_about(regs, dst);
            let d = self.alloc.writereg(regs, buf, dst, size)?;
            x86_64::emit_mov_ri(buf, size, d, imm)?;
            self.alloc.unlock(d);
            return Ok(());
        }

        let s = self.alloc.readreg(regs, buf, src, size)?;
        self.alloc.forget_about(regs, dst);
        let d = self.alloc.writereg(regs, buf, dst, size)?;
        x86_64::emit_mov_rr(buf, size, d, s);
        self.alloc.unlock(s);
        self.alloc.unlock(d);
        Ok(())
    }

    /// `MOVEQ #imm,Dn`: materializes a sign-extended 8-bit immediate directly, always at
    /// longword width, and always sets CZNV (the V and C it clears; MOVEQ never sets them).
    pub fn moveq(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        imm: i8,
    ) -> Result<(), CompileError> {
        self.alloc.forget_about(regs, dst);
        let d = self.alloc.writereg(regs, buf, dst, Size::L)?;
        x86_64::emit_mov_ri(buf, Size::L, d, imm as i64)?;
        x86_64::emit_alu_rr(buf, AluOp::Or, Size::L, d, d); // sets ZF/SF/CF=0/OF=0 from the value.
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `ADD`/`ADDA`/`ADDQ`/`ADDX` share this core: `dst += src`. `dst` is read-modify-written;
    /// `ADDA` (no flags) is obtained by the caller simply not calling `note_native_flags`.
    pub fn add(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        src: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        if regs[src].status == VRegStatus::IsConst {
            let imm = regs[src].val as i64;
            return self.add_imm(regs, buf, dst, imm, size);
        }
        let s = self.alloc.readreg(regs, buf, src, size)?;
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_alu_rr(buf, AluOp::Add, size, d, s);
        self.alloc.unlock(s);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNVX);
        Ok(())
    }

    /// `ADDQ #imm,<ea>`: when `dst` is a live full-width register not about to be read before
    /// its next write, the allocator can absorb the immediate into the lazy offset and skip
    /// emitting any code at all (spec §4.2 offset propagation).
    pub fn add_imm(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        imm: i64,
        size: Size,
    ) -> Result<(), CompileError> {
        if size == Size::L && self.alloc.add_offset(regs, dst, imm as i32) {
            // Flags are not updated here: a lazily-offset register that is later read via
            // `readreg` realizes the add with a real instruction, which will define flags at
            // that point. Until then no consumer can have observed stale flags, since nothing
            // between the two points can read CCR without forcing realization first.
            return Ok(());
        }
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_alu_ri(buf, AluOp::Add, size, d, imm)?;
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNVX);
        Ok(())
    }

    /// `SUB`/`SUBA`/`SUBQ`/`SUBX`: `dst -= src`.
    pub fn sub(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        src: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        if regs[src].status == VRegStatus::IsConst {
            let imm = regs[src].val as i64;
            if size == Size::L && self.alloc.add_offset(regs, dst, -(imm as i32)) {
                return Ok(());
            }
            let d = self.alloc.rmw(regs, buf, dst, size, size)?;
            x86_64::emit_alu_ri(buf, AluOp::Sub, size, d, imm)?;
            self.alloc.unlock(d);
            self.flags.note_native_flags(FlagsDefined::CZNVX);
            return Ok(());
        }
        let s = self.alloc.readreg(regs, buf, src, size)?;
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_alu_rr(buf, AluOp::Sub, size, d, s);
        self.alloc.unlock(s);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNVX);
        Ok(())
    }

    /// `NEG <ea>`: `dst = -dst`. `NEGX` additionally folds in the X flag via the caller (not
    /// modeled here — this build compiles NEG only, NEGX falls back to the interpreter; see
    /// `DESIGN.md`).
    pub fn neg(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_neg_r(buf, size, d);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNVX);
        Ok(())
    }

    /// `NOT <ea>`: `dst = !dst`. 68k `NOT` sets CZN and always clears V/C, which `CZNV` from a
    /// bitwise host op does too (the host OF/CF after a NOT-equivalent sequence are always 0).
    pub fn not(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_not_r(buf, size, d);
        // NOT doesn't set host flags; synthesize them with a harmless self-test.
        x86_64::emit_test_rr(buf, size, d, d);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `AND`/`OR`/`EOR <ea>,<ea>`: `dst op= src`.
    pub fn bitwise(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        op: AluOp,
        dst: usize,
        src: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        debug_assert!(matches!(op, AluOp::And | AluOp::Or | AluOp::Xor));
        if regs[src].status == VRegStatus::IsConst {
            let imm = regs[src].val as i64;
            let d = self.alloc.rmw(regs, buf, dst, size, size)?;
            x86_64::emit_alu_ri(buf, op, size, d, imm)?;
            self.alloc.unlock(d);
            self.flags.note_native_flags(FlagsDefined::CZNV);
            return Ok(());
        }
        let s = self.alloc.readreg(regs, buf, src, size)?;
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_alu_rr(buf, op, size, d, s);
        self.alloc.unlock(s);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `CMP`/`CMPA <ea>,<ea>`: flag-setting, non-destructive subtraction.
    pub fn cmp(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        src: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        if regs[src].status == VRegStatus::IsConst {
            let imm = regs[src].val as i64;
            let d = self.alloc.readreg(regs, buf, dst, size)?;
            x86_64::emit_alu_ri(buf, AluOp::Cmp, size, d, imm)?;
            self.alloc.unlock(d);
            self.flags.note_native_flags(FlagsDefined::CZNV);
            return Ok(());
        }
        let s = self.alloc.readreg(regs, buf, src, size)?;
        let d = self.alloc.readreg(regs, buf, dst, size)?;
        x86_64::emit_alu_rr(buf, AluOp::Cmp, size, d, s);
        self.alloc.unlock(s);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `TST <ea>`: sets CZN from the operand, clears V/C, changes nothing else.
    pub fn tst(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        let d = self.alloc.readreg(regs, buf, dst, size)?;
        x86_64::emit_test_rr(buf, size, d, d);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `CLR <ea>`: sets `dst` to zero, Z set, N/V/C clear. Implemented as a write of the
    /// constant zero (never a read-xor-write) so no stale value is ever observed.
    pub fn clr(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        size: Size,
    ) -> Result<(), CompileError> {
        self.alloc.forget_about(regs, dst);
        let d = self.alloc.writereg(regs, buf, dst, size)?;
        x86_64::emit_alu_rr(buf, AluOp::Xor, size, d, d);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `ROR`/`ROL`/`ASR`/`ASL`/`LSR`/`LSL <ea>` by an immediate count. Only C is defined by
    /// ROR/ROL, and X is untouched; the arithmetic/logical shifts define CZNV and set X = C.
    pub fn shift_ri(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        op: ShiftOp,
        dst: usize,
        count: u8,
        size: Size,
    ) -> Result<(), CompileError> {
        let d = self.alloc.rmw(regs, buf, dst, size, size)?;
        x86_64::emit_shift_ri(buf, op, size, d, count)?;
        self.alloc.unlock(d);
        let defined = match op {
            ShiftOp::Rol | ShiftOp::Ror => FlagsDefined::ROTATE,
            ShiftOp::Shl | ShiftOp::Shr | ShiftOp::Sar => FlagsDefined::CZNVX,
        };
        self.flags.note_native_flags(defined);
        Ok(())
    }

    /// `SWAP Dn`: exchanges the upper and lower words of a data register. 68k sets CZN from the
    /// 32-bit result and always clears V/C; implemented as a 16-bit rotate of the full register.
    pub fn swap(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
    ) -> Result<(), CompileError> {
        let d = self.alloc.rmw(regs, buf, dst, Size::L, Size::L)?;
        x86_64::emit_shift_ri(buf, ShiftOp::Rol, Size::L, d, 16)?;
        x86_64::emit_test_rr(buf, Size::L, d, d);
        self.alloc.unlock(d);
        self.flags.note_native_flags(FlagsDefined::CZNV);
        Ok(())
    }

    /// `LEA <ea>,An`: computes an effective address and stores it without touching flags. The
    /// address itself is computed by the handler (68k addressing modes are its job, not the
    /// mid-layer's); this just performs the register-to-register move of an already-computed
    /// host value, identical in shape to `mov_l` but named for the handler's intent.
    pub fn lea(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        dst: usize,
        addr_reg: GpReg,
    ) -> Result<(), CompileError> {
        self.alloc.forget_about(regs, dst);
        let d = self.alloc.writereg(regs, buf, dst, Size::L)?;
        x86_64::emit_mov_rr(buf, Size::L, d, addr_reg);
        self.alloc.unlock(d);
        Ok(())
    }

    /// Flushes every dirty virtual register to memory and forces pending flags into the guest
    /// CCR byte, using `ccr_reg` as scratch. Called at block boundaries and before any call out
    /// to the interpreter fallback or a memory-access callback, both of which may clobber
    /// arbitrary host registers and read the guest CCR.
    pub fn sync_to_memory(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        ccr_reg: GpReg,
        state_ptr: GpReg,
        current_ccr: crate::guest::Ccr,
    ) -> crate::guest::Ccr {
        let ccr = self.flags.materialize_flags(buf, ccr_reg, state_ptr, current_ccr);
        self.alloc.flush(regs, buf);
        ccr
    }
}

impl<B: Backend> Default for MidLayer<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86_64::X86_64;
    use crate::vreg::VRegFile;

    #[test]
    fn add_two_registers_emits_code_and_defines_flags() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        mid.add(&mut file.gpr, &mut buf, 0, 1, Size::L).unwrap();

        assert!(!buf.is_empty());
        assert_eq!(file.gpr[0].status, VRegStatus::Dirty);
        assert_eq!(mid.flags.flags_in_flags(), crate::flags::Validity::Valid);
    }

    #[test]
    fn add_immediate_to_live_address_register_is_lazy() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        // Put vreg 8 (A0) into a live, full-width register first.
        let d = mid.alloc.writereg(&mut file.gpr, &mut buf, 8, Size::L).unwrap();
        mid.alloc.unlock(d);
        buf.clear();

        mid.add_imm(&mut file.gpr, &mut buf, 8, 4, Size::L).unwrap();

        assert!(buf.is_empty(), "offset propagation should avoid emitting code");
        assert_eq!(file.gpr[8].val, 4);
    }

    #[test]
    fn neg_defines_cznv() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        mid.neg(&mut file.gpr, &mut buf, 0, Size::L).unwrap();

        assert!(!buf.is_empty());
        assert_eq!(file.gpr[0].status, VRegStatus::Dirty);
    }

    #[test]
    fn swap_rotates_by_sixteen() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        mid.swap(&mut file.gpr, &mut buf, 0).unwrap();

        // emit_shift_ri(Rol, L, d, 16) -> REX? + 0xc1 /0 ib(16); assert opcode byte present.
        assert!(buf.iter().any(|&b| b == 0xc1));
    }

    #[test]
    fn clr_zeroes_without_reading_old_value() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        mid.clr(&mut file.gpr, &mut buf, 0, Size::L).unwrap();

        assert_eq!(file.gpr[0].status, VRegStatus::Dirty);
    }

    #[test]
    fn rotate_only_defines_carry() {
        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let mut buf = Vec::new();

        mid.shift_ri(&mut file.gpr, &mut buf, ShiftOp::Ror, 0, 3, Size::L).unwrap();

        assert!(mid.flags.flags_in_flags() == crate::flags::Validity::Valid);
    }
}
