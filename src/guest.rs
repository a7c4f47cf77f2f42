//! The guest state vector: the C-ABI-compatible struct whose field offsets are baked into
//! emitted code (spec §6). Changing field order is a rebuild requirement.

use bitflags::bitflags;

bitflags! {
    /// Mirrors `regs.spcflags`, the control word checked at every block boundary. A non-zero
    /// value means "exit the cache and handle pending events."
    #[derive(Default)]
    pub struct SpecialFlags: u32 {
        /// A timer, device, or inter-thread interrupt is pending.
        const INTERRUPT   = 1 << 0;
        /// The guest executed a `STOP` or equivalent and is waiting for an event.
        const STOPPED     = 1 << 1;
        /// A guest trap (illegal instruction, privilege violation, address error) is pending.
        const TRAP        = 1 << 2;
        /// The embedder requested the core return to the outer loop (e.g. for a UI event).
        const BREAK       = 1 << 3;
        /// The embedder flagged the cache for a hard flush before the next dispatch.
        const FLUSH_HARD  = 1 << 4;
        /// The embedder flagged the cache for a lazy flush before the next dispatch.
        const FLUSH_LAZY  = 1 << 5;
    }
}

bitflags! {
    /// The 68k condition code register bit layout: X at bit 4, N at 3, Z at 2, V at 1, C at 0.
    #[derive(Default)]
    pub struct Ccr: u8 {
        const C = 1 << 0;
        const V = 1 << 1;
        const Z = 1 << 2;
        const N = 1 << 3;
        const X = 1 << 4;
    }
}

/// Guest index of the sixteen integer registers D0-D7, A0-A7, in storage order.
pub const NUM_GPRS: usize = 16;
/// Guest index of the eight extended-precision FPU registers.
pub const NUM_FPRS: usize = 8;

/// An 80-bit extended-precision value, stored as the reference stores it: high 64 bits of
/// mantissa plus 16 bits of sign/exponent. This build does not interpret FPU exception
/// semantics (spec §1 Non-goals); the bits are carried and round-tripped only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct ExtendedFloat {
    pub mantissa: u64,
    pub sign_exponent: u16,
    _pad: [u8; 6],
}

impl ExtendedFloat {
    pub const ZERO: ExtendedFloat = ExtendedFloat {
        mantissa: 0,
        sign_exponent: 0,
        _pad: [0; 6],
    };
}

/// The process-wide 68k architectural state. Field order is load-bearing: the encoder emits
/// base-plus-displacement accesses computed from [`GuestState::offset_of`], and any reordering
/// here requires recompiling every cached block (in practice, a full flush at startup).
#[repr(C)]
#[derive(Debug, Clone)]
pub struct GuestState {
    /// D0-D7 followed by A0-A7, in that order (guest virtual-register indices 0-15 map directly).
    pub regs: [u32; NUM_GPRS],
    /// Host pointer to the next guest instruction to execute.
    pub pc_p: *mut u8,
    /// The same program counter in guest address space, kept in sync at block boundaries.
    pub pc: u32,
    /// Individual condition code flags, one byte each so the interpreter and compiled code can
    /// set/test a single flag without masking.
    pub flag_c: u8,
    pub flag_v: u8,
    pub flag_z: u8,
    pub flag_n: u8,
    pub flag_x: u8,
    /// Trace/mask bits from the status register's system byte.
    pub sr_system: u8,
    /// User-mode and supervisor-mode stack pointer shadows (A7 aliases whichever is active).
    pub usp: u32,
    pub ssp: u32,
    /// The eight FPU data registers.
    pub fp: [ExtendedFloat; NUM_FPRS],
    /// FPU control register.
    pub fpcr: u32,
    /// FPU status register.
    pub fpsr: u32,
    /// FPU instruction address register.
    pub fpiar: u32,
    /// Control word polled at every chained jump and fallback exit (spec §5).
    pub spcflags: SpecialFlags,
}

impl GuestState {
    /// Builds a zeroed guest state with `pc_p` null; the embedder is expected to point it at
    /// guest memory before the first [`crate::JitEngine::enter`].
    pub fn new() -> Self {
        Self {
            regs: [0; NUM_GPRS],
            pc_p: std::ptr::null_mut(),
            pc: 0,
            flag_c: 0,
            flag_v: 0,
            flag_z: 0,
            flag_n: 0,
            flag_x: 0,
            sr_system: 0,
            usp: 0,
            ssp: 0,
            fp: [ExtendedFloat::ZERO; NUM_FPRS],
            fpcr: 0,
            fpsr: 0,
            fpiar: 0,
            spcflags: SpecialFlags::empty(),
        }
    }

    /// Packs the individual flag bytes into a single 68k CCR byte.
    pub fn ccr(&self) -> Ccr {
        let mut ccr = Ccr::empty();
        ccr.set(Ccr::C, self.flag_c != 0);
        ccr.set(Ccr::V, self.flag_v != 0);
        ccr.set(Ccr::Z, self.flag_z != 0);
        ccr.set(Ccr::N, self.flag_n != 0);
        ccr.set(Ccr::X, self.flag_x != 0);
        ccr
    }

    /// Unpacks a CCR byte back into the individual flag bytes.
    pub fn set_ccr(&mut self, ccr: Ccr) {
        self.flag_c = ccr.contains(Ccr::C) as u8;
        self.flag_v = ccr.contains(Ccr::V) as u8;
        self.flag_z = ccr.contains(Ccr::Z) as u8;
        self.flag_n = ccr.contains(Ccr::N) as u8;
        self.flag_x = ccr.contains(Ccr::X) as u8;
    }

    /// Byte offset of a guest GPR within the struct, used by the mid-layer to build
    /// base-plus-displacement memory operands for spills and reloads.
    pub fn offset_of_reg(index: usize) -> i32 {
        debug_assert!(index < NUM_GPRS);
        (memoffset_regs() + index * std::mem::size_of::<u32>()) as i32
    }

    pub fn offset_of_pc_p() -> i32 {
        memoffset_pc_p() as i32
    }

    /// Byte offset of the guest-space integer PC (as opposed to `pc_p`'s host pointer form),
    /// which is all compiled code ever writes directly: the outer [`crate::JitEngine::enter`]
    /// loop derives `pc_p` from it via [`crate::memory::GuestMemory::native_address`] in Rust,
    /// since compiled code has no way to call back into that trait (spec §9).
    pub fn offset_of_pc() -> i32 {
        memoffset_pc() as i32
    }

    pub fn offset_of_spcflags() -> i32 {
        memoffset_spcflags() as i32
    }

    pub fn offset_of_flag_c() -> i32 {
        memoffset_flag_c() as i32
    }

    pub fn offset_of_flag_v() -> i32 {
        (memoffset_flag_c() + 1) as i32
    }

    pub fn offset_of_flag_z() -> i32 {
        (memoffset_flag_c() + 2) as i32
    }

    pub fn offset_of_flag_n() -> i32 {
        (memoffset_flag_c() + 3) as i32
    }

    pub fn offset_of_flag_x() -> i32 {
        (memoffset_flag_c() + 4) as i32
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

/// These three helpers compute field offsets via a dummy instance rather than
/// `memoffset::offset_of!`, to avoid adding a dependency purely for offset arithmetic that is
/// exercised once at startup and in one test below.
fn memoffset_regs() -> usize {
    let base = std::mem::MaybeUninit::<GuestState>::uninit();
    let base_ptr = base.as_ptr();
    unsafe {
        let field_ptr = std::ptr::addr_of!((*base_ptr).regs);
        (field_ptr as usize) - (base_ptr as usize)
    }
}

fn memoffset_pc_p() -> usize {
    let base = std::mem::MaybeUninit::<GuestState>::uninit();
    let base_ptr = base.as_ptr();
    unsafe {
        let field_ptr = std::ptr::addr_of!((*base_ptr).pc_p);
        (field_ptr as usize) - (base_ptr as usize)
    }
}

fn memoffset_pc() -> usize {
    let base = std::mem::MaybeUninit::<GuestState>::uninit();
    let base_ptr = base.as_ptr();
    unsafe {
        let field_ptr = std::ptr::addr_of!((*base_ptr).pc);
        (field_ptr as usize) - (base_ptr as usize)
    }
}

fn memoffset_spcflags() -> usize {
    let base = std::mem::MaybeUninit::<GuestState>::uninit();
    let base_ptr = base.as_ptr();
    unsafe {
        let field_ptr = std::ptr::addr_of!((*base_ptr).spcflags);
        (field_ptr as usize) - (base_ptr as usize)
    }
}

/// `flag_c` is the first of five consecutive one-byte fields (`flag_c/v/z/n/x`); the other four
/// offsets are derived from this one rather than each re-deriving their own `MaybeUninit` probe.
fn memoffset_flag_c() -> usize {
    let base = std::mem::MaybeUninit::<GuestState>::uninit();
    let base_ptr = base.as_ptr();
    unsafe {
        let field_ptr = std::ptr::addr_of!((*base_ptr).flag_c);
        (field_ptr as usize) - (base_ptr as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ccr_round_trips_through_flag_bytes() {
        let mut state = GuestState::new();
        let ccr = Ccr::N | Ccr::X;

        state.set_ccr(ccr);

        assert_eq!(state.flag_n, 1);
        assert_eq!(state.flag_x, 1);
        assert_eq!(state.flag_z, 0);
        assert_eq!(state.ccr(), ccr);
    }

    #[test]
    fn reg_offsets_are_four_byte_strided() {
        assert_eq!(
            GuestState::offset_of_reg(1) - GuestState::offset_of_reg(0),
            std::mem::size_of::<u32>() as i32
        );
    }

    #[test]
    fn special_flags_default_to_empty() {
        assert!(GuestState::new().spcflags.is_empty());
    }

    #[test]
    fn flag_byte_offsets_are_consecutive() {
        assert_eq!(GuestState::offset_of_flag_v(), GuestState::offset_of_flag_c() + 1);
        assert_eq!(GuestState::offset_of_flag_z(), GuestState::offset_of_flag_c() + 2);
        assert_eq!(GuestState::offset_of_flag_n(), GuestState::offset_of_flag_c() + 3);
        assert_eq!(GuestState::offset_of_flag_x(), GuestState::offset_of_flag_c() + 4);
    }
}
