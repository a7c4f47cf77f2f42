//! The virtual register space: an indexed array of integer virtual registers (guest D0-A7 plus
//! a handful of fixed-purpose slots) and a parallel array of FP virtual registers.

use num_derive::FromPrimitive;

/// Number of guest integer registers (D0-D7, A0-A7).
pub const NUM_GUEST_GPRS: usize = 16;

/// FLAGX: the 68k X flag, tracked as its own virtual byte because it survives many operations
/// that clobber the other condition codes.
pub const VREG_FLAGX: usize = 16;
/// FLAGTMP: scratch slot host flags are spilled into when they must survive a clobbering op.
pub const VREG_FLAGTMP: usize = 17;
/// PC_P: host-pointer form of the guest program counter.
pub const VREG_PC_P: usize = 18;
/// NEXT_HANDLER: a register-shaped slot that never materializes to memory; used to carry the
/// address of the next dispatch handler between the tail of one block and chained entry.
pub const VREG_NEXT_HANDLER: usize = 19;

/// Total integer virtual register count.
pub const NUM_VREGS: usize = 20;

/// FP_RESULT: holds the result of the most recent FPU compile-time operation before it is
/// written back to a guest FP virtual register.
pub const VFPREG_RESULT: usize = 8;
/// Total FP virtual register count (FP0-FP7 plus FP_RESULT).
pub const NUM_VFPREGS: usize = 9;

/// The lifecycle state of a virtual register's cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum VRegStatus {
    /// No meaningful value is cached; the in-memory copy (if any) is canonical by convention.
    Undef,
    /// The canonical in-memory copy is up to date and no host register claims this value.
    InMem,
    /// A host register holds this value and it matches memory (no write-back owed).
    Clean,
    /// A host register holds this value and it is newer than the in-memory copy.
    Dirty,
    /// No host register is allocated; the value is a compile-time-known constant.
    IsConst,
}

/// What must happen to reclaim a virtual register's host-register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedFlush {
    /// The value is scratch: dropping it is always safe, nothing to preserve.
    Scratch,
    /// The value must be written to its canonical memory location before eviction.
    ToMem,
    /// The value must be preserved by calling back into a specific recovery handler (used for
    /// virtual registers, like NEXT_HANDLER, that have no ordinary memory backing).
    Handler,
}

/// Per-virtual-register bookkeeping (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct VRegState {
    pub status: VRegStatus,
    /// Index of the host register currently caching this value, or `-1`.
    pub real_reg: i16,
    /// This virtual register's position within `real_reg`'s holdings list.
    pub real_ind: u8,
    /// If `IsConst`, the constant value. If `Clean`/`Dirty`, an offset such that the true guest
    /// value equals `host_reg_contents + val` (lazy offset propagation, spec §4.2).
    pub val: i32,
    /// How many low bytes of the host register reflect the guest value: 1, 2, or 4.
    pub validsize: u8,
    /// How many low bytes are dirty (newer than memory) and not yet flushed.
    pub dirtysize: u8,
    /// Byte offset into [`crate::guest::GuestState`] backing this virtual register, or `-1` for
    /// slots with no memory backing (NEXT_HANDLER).
    pub mem_offset: i32,
    pub needflush: NeedFlush,
}

impl VRegState {
    pub const UNALLOCATED: i16 = -1;

    fn fresh(mem_offset: i32, needflush: NeedFlush) -> Self {
        Self {
            status: VRegStatus::InMem,
            real_reg: Self::UNALLOCATED,
            real_ind: 0,
            val: 0,
            validsize: 4,
            dirtysize: 0,
            mem_offset,
            needflush,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.real_reg != Self::UNALLOCATED
    }

    /// Invariant check (spec §3): a virtual register with status CLEAN/DIRTY must be allocated;
    /// INMEM/ISCONST must not be. Offsets are only valid at full width.
    pub fn check_invariants(&self) -> bool {
        let alloc_matches_status = match self.status {
            VRegStatus::Clean | VRegStatus::Dirty => self.is_allocated(),
            VRegStatus::InMem | VRegStatus::IsConst | VRegStatus::Undef => !self.is_allocated(),
        };
        let offset_only_at_full_width = self.val == 0 || self.validsize == 4;

        alloc_matches_status && offset_only_at_full_width
    }
}

/// The full integer virtual register file plus the FP virtual register file.
pub struct VRegFile {
    pub gpr: [VRegState; NUM_VREGS],
    pub fpr: [VRegState; NUM_VFPREGS],
}

impl VRegFile {
    pub fn new() -> Self {
        use crate::guest::GuestState;

        let mut gpr = [VRegState::fresh(0, NeedFlush::ToMem); NUM_VREGS];
        for i in 0..NUM_GUEST_GPRS {
            gpr[i].mem_offset = GuestState::offset_of_reg(i);
        }
        gpr[VREG_FLAGX] = VRegState::fresh(-1, NeedFlush::ToMem);
        gpr[VREG_FLAGTMP] = VRegState::fresh(-1, NeedFlush::ToMem);
        gpr[VREG_PC_P] = VRegState::fresh(GuestState::offset_of_pc_p(), NeedFlush::ToMem);
        gpr[VREG_NEXT_HANDLER] = VRegState::fresh(-1, NeedFlush::Handler);

        let fpr = [VRegState::fresh(-1, NeedFlush::ToMem); NUM_VFPREGS];

        Self { gpr, fpr }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for VRegFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_has_no_allocated_registers() {
        let file = VRegFile::new();

        assert!(file.gpr.iter().all(|v| !v.is_allocated()));
        assert!(file.fpr.iter().all(|v| !v.is_allocated()));
    }

    #[test]
    fn next_handler_has_no_memory_backing() {
        let file = VRegFile::new();

        assert_eq!(file.gpr[VREG_NEXT_HANDLER].mem_offset, -1);
        assert_eq!(file.gpr[VREG_NEXT_HANDLER].needflush, NeedFlush::Handler);
    }

    #[test]
    fn invariant_rejects_offset_on_partial_width() {
        let mut v = VRegState::fresh(0, NeedFlush::ToMem);
        v.val = 4;
        v.validsize = 2;

        assert!(!v.check_invariants());

        v.validsize = 4;
        assert!(v.check_invariants());
    }

    #[test]
    fn invariant_rejects_clean_without_allocation() {
        let mut v = VRegState::fresh(0, NeedFlush::ToMem);
        v.status = VRegStatus::Clean;

        assert!(!v.check_invariants());

        v.real_reg = 0;
        assert!(v.check_invariants());
    }
}
