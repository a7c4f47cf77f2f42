//! The lazy condition-flag engine (spec §4.3). Most 68k instructions set the CCR, but the bulk
//! of them are never inspected before the next flag-setting instruction runs, so flags are left
//! sitting in the host RFLAGS register until a real consumer forces them to materialize into the
//! guest CCR byte.

use crate::backend::x86_64::{self, GpReg};
use crate::backend::Cond;
use crate::guest::Ccr;

/// Whether a cached copy of the flags is still good to use or has been clobbered since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Trash,
}

/// The two bits of state the distilled design tracks per in-progress block compile: whether
/// native RFLAGS currently holds the live condition codes, and whether a `pushfq`'d copy on the
/// native stack does. Both can be `Trash` at once (flags fully materialized into the guest CCR,
/// or simply never produced yet); both `Valid` at once never happens, since `flags_to_stack`
/// consumes the host-flags copy.
pub struct FlagState {
    flags_in_flags: Validity,
    flags_on_stack: Validity,
    /// Which of C/V/Z/N the last flag-setting native op actually defined; bits outside this set
    /// must come from the guest CCR byte, not from RFLAGS, when materializing. X is tracked
    /// separately since it is not a native x86 flag.
    defined: FlagsDefined,
}

/// Which 68k condition bits a given native op defines, plus whether X should be set equal to C
/// alongside it. Most of the ISA (MOVE, AND/OR/EOR, CMP, TST, CLR, NOT, ROR/ROL) leaves X alone;
/// the add/subtract family and the non-rotating shifts set X = C every time they set C at all
/// (68k §3.1). ADDX/SUBX/ROXL/ROXR instead read X independently via [`FlagState::duplicate_carry`]
/// / [`FlagState::restore_carry`]; this build does not compile them (`DESIGN.md`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagsDefined {
    pub c: bool,
    pub v: bool,
    pub z: bool,
    pub n: bool,
    pub x: bool,
}

impl FlagsDefined {
    /// `AND`/`OR`/`EOR`/`CMP`/`TST`/`CLR`/`NOT`/`MOVE`/`SWAP`: CZNV, X untouched.
    pub const CZNV: Self = Self {
        c: true,
        v: true,
        z: true,
        n: true,
        x: false,
    };

    /// `ADD`/`ADDA`/`ADDQ`/`SUB`/`SUBA`/`SUBQ`/`NEG`/`ASL`/`ASR`/`LSL`/`LSR`: CZNV, and X mirrors C.
    pub const CZNVX: Self = Self {
        c: true,
        v: true,
        z: true,
        n: true,
        x: true,
    };

    pub const NONE: Self = Self {
        c: false,
        v: false,
        z: false,
        n: false,
        x: false,
    };

    /// ROR/ROL: C is defined, V/Z/N/X are not (68k leaves them unaffected).
    pub const ROTATE: Self = Self {
        c: true,
        v: false,
        z: false,
        n: false,
        x: false,
    };
}

impl FlagState {
    pub fn new() -> Self {
        Self {
            flags_in_flags: Validity::Trash,
            flags_on_stack: Validity::Trash,
            defined: FlagsDefined::NONE,
        }
    }

    pub fn flags_in_flags(&self) -> Validity {
        self.flags_in_flags
    }

    pub fn flags_on_stack(&self) -> Validity {
        self.flags_on_stack
    }

    /// Which of C/V/Z/N the most recent native op defined (spec §4.3 liveness bookkeeping: the
    /// compile driver consults this to decide whether a `Bcc`'s tested bit is actually live in
    /// host flags before branching on them directly).
    pub fn defined(&self) -> FlagsDefined {
        self.defined
    }

    /// Called by the mid-layer right after emitting a native instruction that sets condition
    /// codes. From here on `defined` lives in RFLAGS until something forces it out.
    pub fn note_native_flags(&mut self, defined: FlagsDefined) {
        self.flags_in_flags = Validity::Valid;
        self.flags_on_stack = Validity::Trash;
        self.defined = defined;
    }

    /// A block's entry `smallstate` can promise `flags_in_flags = Valid` carried over from a
    /// predecessor block without this block re-deriving it (spec §9 open question, resolved:
    /// the promise is trusted unconditionally rather than re-verified — see `DESIGN.md`).
    pub fn assume_entry_state(&mut self, flags_in_flags: Validity, defined: FlagsDefined) {
        self.flags_in_flags = flags_in_flags;
        self.flags_on_stack = Validity::Trash;
        self.defined = defined;
    }

    /// Spills RFLAGS to the native stack via `pushfq` ahead of a clobbering call or register
    /// reallocation. No-op if flags are already elsewhere.
    pub fn flags_to_stack(&mut self, buf: &mut Vec<u8>) {
        if self.flags_in_flags == Validity::Valid {
            x86_64::emit_pushfq(buf);
            self.flags_on_stack = Validity::Valid;
            self.flags_in_flags = Validity::Trash;
        }
    }

    /// Restores a previously stacked RFLAGS image back into the host flags register.
    pub fn restore_from_stack(&mut self, buf: &mut Vec<u8>) {
        if self.flags_on_stack == Validity::Valid {
            x86_64::emit_popfq(buf);
            self.flags_in_flags = Validity::Valid;
            self.flags_on_stack = Validity::Trash;
        }
    }

    /// Forces whatever flags are pending into the guest CCR byte fields, emitting one `setcc`
    /// plus a byte store per bit the pending flags actually define and leaving the rest of
    /// `current` untouched. `ccr_reg` is a scratch host register the mid-layer has pinned for
    /// this purpose; `state_ptr` is the register holding `&GuestState` (spec §6). Both are
    /// clobbered (`ccr_reg` fully; `state_ptr` is only read).
    pub fn materialize_flags(
        &mut self,
        buf: &mut Vec<u8>,
        ccr_reg: GpReg,
        state_ptr: GpReg,
        current: Ccr,
    ) -> Ccr {
        use crate::backend::Size;
        use crate::backend::x86_64::Mem;
        use crate::guest::GuestState;

        if self.flags_on_stack == Validity::Valid {
            self.restore_from_stack(buf);
        }
        if self.flags_in_flags != Validity::Valid {
            return current;
        }

        let mut result = current;
        if self.defined.c {
            x86_64::emit_setcc(buf, Cond::Cs, ccr_reg);
            x86_64::emit_mov_mr(buf, Size::B, Mem::disp(state_ptr, GuestState::offset_of_flag_c()), ccr_reg);
            result.set(Ccr::C, true);
            if self.defined.x {
                // `ccr_reg` still holds the 0/1 carry byte the store above just wrote; reuse it
                // rather than re-running setcc.
                x86_64::emit_mov_mr(buf, Size::B, Mem::disp(state_ptr, GuestState::offset_of_flag_x()), ccr_reg);
                result.set(Ccr::X, true);
            }
        }
        if self.defined.z {
            x86_64::emit_setcc(buf, Cond::Eq, ccr_reg);
            x86_64::emit_mov_mr(buf, Size::B, Mem::disp(state_ptr, GuestState::offset_of_flag_z()), ccr_reg);
            result.set(Ccr::Z, true);
        }
        if self.defined.n {
            x86_64::emit_setcc(buf, Cond::Mi, ccr_reg);
            x86_64::emit_mov_mr(buf, Size::B, Mem::disp(state_ptr, GuestState::offset_of_flag_n()), ccr_reg);
            result.set(Ccr::N, true);
        }
        if self.defined.v {
            x86_64::emit_setcc(buf, Cond::Vs, ccr_reg);
            x86_64::emit_mov_mr(buf, Size::B, Mem::disp(state_ptr, GuestState::offset_of_flag_v()), ccr_reg);
            result.set(Ccr::V, true);
        }

        self.flags_in_flags = Validity::Trash;
        self.defined = FlagsDefined::NONE;
        result
    }

    /// Copies the carry flag into the guest X virtual register without disturbing C (ADDX/SUBX
    /// and ROXL/ROXR read X independently of C). `scratch` receives 0 or 1, ready to store into
    /// VREG_FLAGX.
    pub fn duplicate_carry(&self, buf: &mut Vec<u8>, scratch: GpReg) {
        debug_assert_eq!(self.flags_in_flags, Validity::Valid, "carry must be live in host flags");
        x86_64::emit_setcc(buf, Cond::Cs, scratch);
    }

    /// The inverse: loads a previously saved X value (0 or 1) back into host carry via `bt` on
    /// `scratch`'s bit 0, ahead of a ROXL/ROXR that consumes it.
    pub fn restore_carry(&self, buf: &mut Vec<u8>, scratch: GpReg) {
        let _ = x86_64::emit_bt_ri(buf, crate::backend::Size::L, scratch, 0);
    }
}

impl Default for FlagState {
    fn default() -> Self {
        Self::new()
    }
}
