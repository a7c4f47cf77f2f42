//! The x86-64 encoder: the one host backend this build ships (spec §1). Every method appends
//! bytes to a cache-buffer cursor and returns `Err` on any encoding that cannot be represented
//! (spec §4.1); the caller (the mid-layer) propagates that as a block-scoped [`CompileError`].

use crate::backend::{check_signed, fits_signed, Backend, Cond, HostFeatures, PatchSite, RegCaps, Size};
use crate::error::CompileError;

/// A general-purpose x86-64 register, numbered the way the ModR/M/SIB `reg`/`rm`/`base`/`index`
/// fields expect: 0-7 are the legacy registers, 8-15 require `REX.R`/`REX.X`/`REX.B` to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpReg(pub u8);

#[allow(non_upper_case_globals)]
impl GpReg {
    pub const Rax: GpReg = GpReg(0);
    pub const Rcx: GpReg = GpReg(1);
    pub const Rdx: GpReg = GpReg(2);
    pub const Rbx: GpReg = GpReg(3);
    pub const Rsp: GpReg = GpReg(4);
    pub const Rbp: GpReg = GpReg(5);
    pub const Rsi: GpReg = GpReg(6);
    pub const Rdi: GpReg = GpReg(7);
    pub const R8: GpReg = GpReg(8);
    pub const R9: GpReg = GpReg(9);
    pub const R10: GpReg = GpReg(10);
    pub const R11: GpReg = GpReg(11);
    pub const R12: GpReg = GpReg(12);
    pub const R13: GpReg = GpReg(13);
    pub const R14: GpReg = GpReg(14);
    pub const R15: GpReg = GpReg(15);

    fn low3(self) -> u8 {
        self.0 & 0x7
    }

    fn is_ext(self) -> bool {
        self.0 >= 8
    }

    /// Whether this register needs a REX prefix just to be *named* at byte granularity (SPL,
    /// BPL, SIL, DIL all require one, since without REX those ModR/M encodings mean AH/CH/DH/BH).
    fn needs_rex_for_byte(self) -> bool {
        matches!(self.0, 4..=7)
    }
}

/// A memory operand, in the addressing-mode shapes the spec names (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub enum Mem {
    /// `[base + disp]`.
    Base { base: GpReg, disp: i32 },
    /// `[base + index*scale + disp]`, with either `base` or `index` optionally absent.
    Indexed {
        base: Option<GpReg>,
        index: Option<GpReg>,
        scale: u8,
        disp: i32,
    },
    /// `[rip + disp]`, available only in 64-bit mode.
    RipRelative { disp: i32 },
}

impl Mem {
    pub fn disp(base: GpReg, disp: i32) -> Self {
        Mem::Base { base, disp }
    }
}

/// The eight ALU operations sharing one opcode-group layout (`/0`.."/7"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::Adc => 2,
            AluOp::Sbb => 3,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// The shift/rotate family sharing the `0xC0`/`0xC1`/`0xD2`/`0xD3` opcode group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn ext(self) -> u8 {
        match self {
            ShiftOp::Rol => 0,
            ShiftOp::Ror => 1,
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }
}

fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Cs => 0x2,
        Cond::Cc => 0x3,
        Cond::Mi => 0x8,
        Cond::Pl => 0x9,
        Cond::Vs => 0x0,
        Cond::Vc => 0x1,
        Cond::Hi => 0x7,
        Cond::Ls => 0x6,
        Cond::Ge => 0xd,
        Cond::Lt => 0xc,
        Cond::Gt => 0xf,
        Cond::Le => 0xe,
    }
}

fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

fn sib(scale_log2: u8, index: u8, base: u8) -> u8 {
    (scale_log2 << 6) | ((index & 0x7) << 3) | (base & 0x7)
}

fn scale_log2(scale: u8) -> u8 {
    match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => panic!("invalid SIB scale {scale}, must be 1/2/4/8"),
    }
}

/// REX prefix bits, emitted lazily: only written out if at least one bit is set, or a legacy
/// byte register needing disambiguation from AH/CH/DH/BH is present (spec §4.1).
#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    fn byte(self) -> u8 {
        0x40 | (self.w as u8) << 3 | (self.r as u8) << 2 | (self.x as u8) << 1 | (self.b as u8)
    }

    fn needed(self) -> bool {
        self.w || self.r || self.x || self.b
    }
}

fn emit_rex(buf: &mut Vec<u8>, rex: Rex, force: bool) {
    if rex.needed() || force {
        buf.push(rex.byte());
    }
}

/// Prepends the `0x66` operand-size override for 16-bit operations.
fn emit_size_prefix(buf: &mut Vec<u8>, size: Size) {
    if size == Size::W {
        buf.push(0x66);
    }
}

/// Encodes the ModR/M (and SIB/displacement, if any) for a memory operand, choosing the minimal
/// displacement encoding (spec §4.1: "zero-byte displacement if possible, 8-bit vs 32-bit").
/// Returns the `(REX.X, REX.B)` bits the memory operand's base/index registers demand.
fn encode_mem(buf: &mut Vec<u8>, reg_field: u8, mem: Mem) -> (bool, bool) {
    match mem {
        Mem::RipRelative { disp } => {
            buf.push(modrm(0b00, reg_field, 0b101));
            buf.extend_from_slice(&disp.to_le_bytes());
            (false, false)
        }
        Mem::Base { base, disp } => {
            let rm = base.low3();
            let forces_sib = rm == 0b100; // RSP/R12 as base always need a SIB byte.
            let needs_disp8_anyway = rm == 0b101; // RBP/R13 as base with disp=0 would mean "no base".
            let mod_ = if disp == 0 && !needs_disp8_anyway {
                0b00
            } else if fits_signed(disp as i64, 8) {
                0b01
            } else {
                0b10
            };

            if forces_sib {
                buf.push(modrm(mod_, reg_field, 0b100));
                buf.push(sib(0, 0b100, rm)); // index=0b100 means "no index".
            } else {
                buf.push(modrm(mod_, reg_field, rm));
            }

            match mod_ {
                0b00 => {}
                0b01 => buf.push(disp as i8 as u8),
                _ => buf.extend_from_slice(&disp.to_le_bytes()),
            }

            (false, base.is_ext())
        }
        Mem::Indexed {
            base,
            index,
            scale,
            disp,
        } => {
            let base_rm = base.map(GpReg::low3).unwrap_or(0b101);
            let needs_disp8_anyway = base.is_none() || base_rm == 0b101;
            let mod_ = if base.is_some() && disp == 0 && !needs_disp8_anyway {
                0b00
            } else if base.is_some() && fits_signed(disp as i64, 8) {
                0b01
            } else {
                0b10
            };

            buf.push(modrm(mod_, reg_field, 0b100));
            let index_field = index.map(GpReg::low3).unwrap_or(0b100);
            buf.push(sib(scale_log2(scale.max(1)), index_field, base_rm));

            if base.is_none() {
                buf.extend_from_slice(&disp.to_le_bytes());
            } else {
                match mod_ {
                    0b00 => {}
                    0b01 => buf.push(disp as i8 as u8),
                    _ => buf.extend_from_slice(&disp.to_le_bytes()),
                }
            }

            (
                index.map(GpReg::is_ext).unwrap_or(false),
                base.map(GpReg::is_ext).unwrap_or(false),
            )
        }
    }
}

fn emit_imm(buf: &mut Vec<u8>, size: Size, imm: i64) -> Result<(), CompileError> {
    match size {
        Size::B => {
            check_signed(imm, 8)?;
            buf.push(imm as i8 as u8);
        }
        Size::W => {
            check_signed(imm, 16)?;
            buf.extend_from_slice(&(imm as i16).to_le_bytes());
        }
        Size::L | Size::Q => {
            check_signed(imm, 32)?;
            buf.extend_from_slice(&(imm as i32).to_le_bytes());
        }
    }
    Ok(())
}

/// `mov dst, src` (register to register).
pub fn emit_mov_rr(buf: &mut Vec<u8>, size: Size, dst: GpReg, src: GpReg) {
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: dst.is_ext(),
        x: false,
        b: src.is_ext(),
    };
    let force = size == Size::B && (dst.needs_rex_for_byte() || src.needs_rex_for_byte());
    emit_rex(buf, rex, force);
    buf.push(if size == Size::B { 0x8a } else { 0x8b });
    buf.push(modrm(0b11, dst.low3(), src.low3()));
}

/// `mov dst, imm`. Uses the short `B8+rd` form when the size is not 64-bit; for a 64-bit
/// destination, emits the full 10-byte `REX.W B8+rd imm64` form so arbitrary pointers can be
/// materialized (needed to embed the `JitEngine` context pointer into dispatch stubs, spec §9).
pub fn emit_mov_ri(buf: &mut Vec<u8>, size: Size, dst: GpReg, imm: i64) -> Result<(), CompileError> {
    if size == Size::Q {
        let rex = Rex {
            w: true,
            r: false,
            x: false,
            b: dst.is_ext(),
        };
        emit_rex(buf, rex, true);
        buf.push(0xb8 + dst.low3());
        buf.extend_from_slice(&(imm as u64).to_le_bytes());
        return Ok(());
    }

    emit_size_prefix(buf, size);
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    let force = size == Size::B && dst.needs_rex_for_byte();
    emit_rex(buf, rex, force);
    buf.push(if size == Size::B { 0xb0 } else { 0xb8 } + dst.low3());
    emit_imm(buf, size, imm)
}

/// `mov dst, [mem]` (load).
pub fn emit_mov_rm(buf: &mut Vec<u8>, size: Size, dst: GpReg, mem: Mem) {
    emit_size_prefix(buf, size);
    let (rex_x, rex_b) = peek_mem_rex(mem);
    let rex = Rex {
        w: size == Size::Q,
        r: dst.is_ext(),
        x: rex_x,
        b: rex_b,
    };
    emit_rex(buf, rex, false);
    buf.push(if size == Size::B { 0x8a } else { 0x8b });
    encode_mem(buf, dst.low3(), mem);
}

/// `mov [mem], src` (store).
pub fn emit_mov_mr(buf: &mut Vec<u8>, size: Size, mem: Mem, src: GpReg) {
    emit_size_prefix(buf, size);
    let (rex_x, rex_b) = peek_mem_rex(mem);
    let rex = Rex {
        w: size == Size::Q,
        r: src.is_ext(),
        x: rex_x,
        b: rex_b,
    };
    emit_rex(buf, rex, false);
    buf.push(if size == Size::B { 0x88 } else { 0x89 });
    encode_mem(buf, src.low3(), mem);
}

/// `mov [mem], imm`.
pub fn emit_mov_mi(buf: &mut Vec<u8>, size: Size, mem: Mem, imm: i64) -> Result<(), CompileError> {
    emit_size_prefix(buf, size);
    let (rex_x, rex_b) = peek_mem_rex(mem);
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: rex_x,
        b: rex_b,
    };
    emit_rex(buf, rex, false);
    buf.push(if size == Size::B { 0xc6 } else { 0xc7 });
    encode_mem(buf, 0, mem);
    emit_imm(buf, size, imm)
}

/// Reads the REX.X/REX.B bits a memory operand will need without emitting anything, so callers
/// can build the whole REX byte before the opcode.
fn peek_mem_rex(mem: Mem) -> (bool, bool) {
    let mut scratch = Vec::new();
    encode_mem(&mut scratch, 0, mem)
}

/// `op dst, src` (register-register ALU, destination in the ModR/M `reg` field).
pub fn emit_alu_rr(buf: &mut Vec<u8>, op: AluOp, size: Size, dst: GpReg, src: GpReg) {
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: dst.is_ext(),
        x: false,
        b: src.is_ext(),
    };
    let force = size == Size::B && (dst.needs_rex_for_byte() || src.needs_rex_for_byte());
    emit_rex(buf, rex, force);
    let base = op.ext() * 8;
    buf.push(base + if size == Size::B { 0x02 } else { 0x03 });
    buf.push(modrm(0b11, dst.low3(), src.low3()));
}

/// `op dst, imm`, choosing the one-byte sign-extended immediate form when it fits (spec §4.1's
/// "minimal encoding" principle applied to immediates as well as addressing).
pub fn emit_alu_ri(
    buf: &mut Vec<u8>,
    op: AluOp,
    size: Size,
    dst: GpReg,
    imm: i64,
) -> Result<(), CompileError> {
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    let force = size == Size::B && dst.needs_rex_for_byte();
    emit_rex(buf, rex, force);

    if size == Size::B {
        buf.push(0x80);
        buf.push(modrm(0b11, op.ext(), dst.low3()));
        return emit_imm(buf, Size::B, imm);
    }

    if fits_signed(imm, 8) {
        buf.push(0x83);
        buf.push(modrm(0b11, op.ext(), dst.low3()));
        emit_imm(buf, Size::B, imm)
    } else {
        buf.push(0x81);
        buf.push(modrm(0b11, op.ext(), dst.low3()));
        emit_imm(buf, if size == Size::W { Size::W } else { Size::L }, imm)
    }
}

/// `op dst, [mem]`.
pub fn emit_alu_rm(buf: &mut Vec<u8>, op: AluOp, size: Size, dst: GpReg, mem: Mem) {
    emit_size_prefix(buf, size);
    let (rex_x, rex_b) = peek_mem_rex(mem);
    let rex = Rex {
        w: size == Size::Q,
        r: dst.is_ext(),
        x: rex_x,
        b: rex_b,
    };
    emit_rex(buf, rex, false);
    let base = op.ext() * 8;
    buf.push(base + if size == Size::B { 0x02 } else { 0x03 });
    encode_mem(buf, dst.low3(), mem);
}

/// `neg dst` / `not dst` share the `0xF6`/`0xF7` opcode group.
pub fn emit_neg_r(buf: &mut Vec<u8>, size: Size, dst: GpReg) {
    emit_unary_f7(buf, size, dst, 3);
}

pub fn emit_not_r(buf: &mut Vec<u8>, size: Size, dst: GpReg) {
    emit_unary_f7(buf, size, dst, 2);
}

fn emit_unary_f7(buf: &mut Vec<u8>, size: Size, dst: GpReg, ext: u8) {
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    let force = size == Size::B && dst.needs_rex_for_byte();
    emit_rex(buf, rex, force);
    buf.push(if size == Size::B { 0xf6 } else { 0xf7 });
    buf.push(modrm(0b11, ext, dst.low3()));
}

/// `test dst, src`.
pub fn emit_test_rr(buf: &mut Vec<u8>, size: Size, dst: GpReg, src: GpReg) {
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: src.is_ext(),
        x: false,
        b: dst.is_ext(),
    };
    let force = size == Size::B && (dst.needs_rex_for_byte() || src.needs_rex_for_byte());
    emit_rex(buf, rex, force);
    buf.push(if size == Size::B { 0x84 } else { 0x85 });
    buf.push(modrm(0b11, src.low3(), dst.low3()));
}

/// `shift dst, imm8`.
pub fn emit_shift_ri(
    buf: &mut Vec<u8>,
    op: ShiftOp,
    size: Size,
    dst: GpReg,
    count: u8,
) -> Result<(), CompileError> {
    if !fits_signed(count as i64, 8) {
        return Err(CompileError::ImmediateOutOfRange);
    }
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    let force = size == Size::B && dst.needs_rex_for_byte();
    emit_rex(buf, rex, force);
    buf.push(if size == Size::B { 0xc0 } else { 0xc1 });
    buf.push(modrm(0b11, op.ext(), dst.low3()));
    buf.push(count);
    Ok(())
}

/// `shift dst, cl`.
pub fn emit_shift_rcl(buf: &mut Vec<u8>, op: ShiftOp, size: Size, dst: GpReg) {
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    let force = size == Size::B && dst.needs_rex_for_byte();
    emit_rex(buf, rex, force);
    buf.push(if size == Size::B { 0xd2 } else { 0xd3 });
    buf.push(modrm(0b11, op.ext(), dst.low3()));
}

/// `setcc dst` (byte destination, zero-extends nothing — caller must clear the register first
/// if a full-width zero/one is needed).
pub fn emit_setcc(buf: &mut Vec<u8>, cond: Cond, dst: GpReg) {
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    emit_rex(buf, rex, dst.needs_rex_for_byte());
    buf.push(0x0f);
    buf.push(0x90 + cond_code(cond));
    buf.push(modrm(0b11, 0, dst.low3()));
}

/// Emits a forward conditional branch with a placeholder `rel32` and returns the
/// [`PatchSite`] of the displacement field so the caller can patch it once the target is known
/// (spec §4.1: "Branch patching").
pub fn emit_jcc_forward(buf: &mut Vec<u8>, cond: Cond) -> PatchSite {
    buf.push(0x0f);
    buf.push(0x80 + cond_code(cond));
    let site = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    site
}

/// Emits an unconditional forward jump with a placeholder `rel32`.
pub fn emit_jmp_forward(buf: &mut Vec<u8>) -> PatchSite {
    buf.push(0xe9);
    let site = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    site
}

/// Patches a previously emitted `rel32` field at `site` to branch to `target_offset` (both byte
/// offsets from the start of the cache buffer).
pub fn patch_rel32(buf: &mut [u8], site: PatchSite, target_offset: usize) {
    let rel = target_offset as i64 - (site as i64 + 4);
    buf[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
}

/// `jmp [reg]` (used for the PC-indexed dispatch jump, spec §4.5).
pub fn emit_jmp_indirect_r(buf: &mut Vec<u8>, reg: GpReg) {
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: reg.is_ext(),
    };
    emit_rex(buf, rex, false);
    buf.push(0xff);
    buf.push(modrm(0b11, 4, reg.low3()));
}

/// `call [reg]` (used to call the guest-memory access callbacks and the interpreter fallback).
pub fn emit_call_indirect_r(buf: &mut Vec<u8>, reg: GpReg) {
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: reg.is_ext(),
    };
    emit_rex(buf, rex, false);
    buf.push(0xff);
    buf.push(modrm(0b11, 2, reg.low3()));
}

pub fn emit_push_r(buf: &mut Vec<u8>, reg: GpReg) {
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: reg.is_ext(),
    };
    emit_rex(buf, rex, false);
    buf.push(0x50 + reg.low3());
}

pub fn emit_pop_r(buf: &mut Vec<u8>, reg: GpReg) {
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: reg.is_ext(),
    };
    emit_rex(buf, rex, false);
    buf.push(0x58 + reg.low3());
}

pub fn emit_pushfq(buf: &mut Vec<u8>) {
    buf.push(0x9c);
}

pub fn emit_popfq(buf: &mut Vec<u8>) {
    buf.push(0x9d);
}

pub fn emit_ret(buf: &mut Vec<u8>) {
    buf.push(0xc3);
}

pub fn emit_int3(buf: &mut Vec<u8>) {
    buf.push(0xcc);
}

/// `lea dst, [mem]`.
pub fn emit_lea(buf: &mut Vec<u8>, size: Size, dst: GpReg, mem: Mem) {
    emit_size_prefix(buf, size);
    let (rex_x, rex_b) = peek_mem_rex(mem);
    let rex = Rex {
        w: size == Size::Q,
        r: dst.is_ext(),
        x: rex_x,
        b: rex_b,
    };
    emit_rex(buf, rex, false);
    buf.push(0x8d);
    encode_mem(buf, dst.low3(), mem);
}

/// `movzx dst(dst_size), src(src_size)` (register to register).
pub fn emit_movzx_rr(buf: &mut Vec<u8>, dst_size: Size, dst: GpReg, src_size: Size, src: GpReg) {
    assert!(src_size != Size::L || dst_size == Size::Q, "movzx l->l is a no-op, use emit_mov_rr");
    let rex = Rex {
        w: dst_size == Size::Q,
        r: dst.is_ext(),
        x: false,
        b: src.is_ext(),
    };
    emit_rex(buf, rex, src.needs_rex_for_byte());
    buf.push(0x0f);
    buf.push(if src_size == Size::B { 0xb6 } else { 0xb7 });
    buf.push(modrm(0b11, dst.low3(), src.low3()));
}

/// `movsx dst(dst_size), src(src_size)` (register to register).
pub fn emit_movsx_rr(buf: &mut Vec<u8>, dst_size: Size, dst: GpReg, src_size: Size, src: GpReg) {
    let rex = Rex {
        w: dst_size == Size::Q,
        r: dst.is_ext(),
        x: false,
        b: src.is_ext(),
    };
    emit_rex(buf, rex, src.needs_rex_for_byte());
    buf.push(0x0f);
    if src_size == Size::L {
        buf.pop(); // movsxd uses 0x63 without the 0x0f escape.
        buf.push(0x63);
    } else {
        buf.push(if src_size == Size::B { 0xbe } else { 0xbf });
    }
    buf.push(modrm(0b11, dst.low3(), src.low3()));
}

/// `bswap dst`.
pub fn emit_bswap(buf: &mut Vec<u8>, size: Size, dst: GpReg) {
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    emit_rex(buf, rex, false);
    buf.push(0x0f);
    buf.push(0xc8 + dst.low3());
}

/// `bt dst, imm8` (bit test, used by the flag engine to pull a single bit out of RFLAGS).
pub fn emit_bt_ri(buf: &mut Vec<u8>, size: Size, dst: GpReg, bit: u8) -> Result<(), CompileError> {
    check_signed(bit as i64, 8)?;
    emit_size_prefix(buf, size);
    let rex = Rex {
        w: size == Size::Q,
        r: false,
        x: false,
        b: dst.is_ext(),
    };
    emit_rex(buf, rex, false);
    buf.push(0x0f);
    buf.push(0xba);
    buf.push(modrm(0b11, 4, dst.low3()));
    buf.push(bit);
    Ok(())
}

/// The standard x86 multi-byte NOP table, one entry per length 1..=9, used to pad to an
/// alignment boundary (spec §4.1).
const NOP_TABLE: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

fn emit_nop(buf: &mut Vec<u8>, len: usize) {
    if len == 0 {
        return;
    }
    if len <= NOP_TABLE.len() {
        buf.extend_from_slice(NOP_TABLE[len - 1]);
        return;
    }
    // Longer than the largest table entry: emit the largest entry repeatedly, then the
    // remainder, same approach real assemblers take.
    let chunk = NOP_TABLE.len();
    buf.extend_from_slice(NOP_TABLE[chunk - 1]);
    emit_nop(buf, len - chunk);
}

/// Pads `buf` with NOPs until its length is a multiple of `boundary`.
pub fn align_to(buf: &mut Vec<u8>, boundary: usize) {
    debug_assert!(boundary.is_power_of_two());
    let remainder = buf.len() % boundary;
    if remainder != 0 {
        emit_nop(buf, boundary - remainder);
    }
}

/// Marker type implementing the cross-backend [`Backend`] trait for x86-64.
pub struct X86_64;

impl Backend for X86_64 {
    const NUM_HOST_REGS: usize = 16;

    fn reg_caps(_reg: usize) -> RegCaps {
        // Every GPR is byte- and word-addressable on x86-64 (unlike x86-32, where only
        // {AL,BL,CL,DL} are byte-addressable without REX); the allocator's capability check is
        // kept so a narrower future backend inherits it at no cost.
        RegCaps {
            can_byte: true,
            can_word: true,
        }
    }

    fn align_to(buf: &mut Vec<u8>, boundary: usize) {
        align_to(buf, boundary);
    }

    fn detect_features() -> HostFeatures {
        HostFeatures {
            sse2: is_x86_feature_detected(),
            cmov: is_x86_feature_detected(),
        }
    }

    /// x86-64 keeps the instruction cache coherent with the data cache in hardware; there is
    /// nothing to do here. Matches `hy-rs::mmap::flush_icache`'s own x86-64 no-op.
    fn flush_icache(_addr: *const u8, _len: usize) {}
}

#[cfg(target_arch = "x86_64")]
fn is_x86_feature_detected() -> bool {
    // x86-64 mandates SSE2 and CMOV as part of the baseline ISA.
    true
}

#[cfg(not(target_arch = "x86_64"))]
fn is_x86_feature_detected() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_rr_64bit_emits_rex_w() {
        let mut buf = Vec::new();
        emit_mov_rr(&mut buf, Size::Q, GpReg::Rax, GpReg::Rcx);
        assert_eq!(buf, vec![0x48, 0x8b, 0xc1]);
    }

    #[test]
    fn mov_rr_extended_register_sets_rex_b() {
        let mut buf = Vec::new();
        emit_mov_rr(&mut buf, Size::L, GpReg::Rax, GpReg::R9);
        assert_eq!(buf, vec![0x41, 0x8b, 0xc1]);
    }

    #[test]
    fn alu_ri_uses_imm8_form_when_it_fits() {
        let mut buf = Vec::new();
        emit_alu_ri(&mut buf, AluOp::Add, Size::L, GpReg::Rax, 5).unwrap();
        assert_eq!(buf, vec![0x83, 0xc0, 0x05]);
    }

    #[test]
    fn alu_ri_falls_back_to_imm32_form() {
        let mut buf = Vec::new();
        emit_alu_ri(&mut buf, AluOp::Add, Size::L, GpReg::Rax, 0x1000).unwrap();
        assert_eq!(buf, vec![0x81, 0xc0, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn alu_ri_rejects_oversized_byte_immediate() {
        let mut buf = Vec::new();
        let err = emit_alu_ri(&mut buf, AluOp::Add, Size::B, GpReg::Rax, 200).unwrap_err();
        assert_eq!(err, CompileError::ImmediateOutOfRange);
    }

    #[test]
    fn mem_base_rsp_forces_sib_byte() {
        let mut buf = Vec::new();
        emit_mov_rm(&mut buf, Size::L, GpReg::Rax, Mem::disp(GpReg::Rsp, 0));
        // 8b 04 24 = mov eax, [rsp] via SIB with no index.
        assert_eq!(buf, vec![0x8b, 0x04, 0x24]);
    }

    #[test]
    fn mem_base_rbp_zero_disp_forces_disp8() {
        let mut buf = Vec::new();
        emit_mov_rm(&mut buf, Size::L, GpReg::Rax, Mem::disp(GpReg::Rbp, 0));
        assert_eq!(buf, vec![0x8b, 0x45, 0x00]);
    }

    #[test]
    fn mem_disp_picks_minimal_encoding() {
        let mut buf = Vec::new();
        emit_mov_rm(&mut buf, Size::L, GpReg::Rax, Mem::disp(GpReg::Rbx, 4));
        assert_eq!(buf, vec![0x8b, 0x43, 0x04]);

        let mut buf = Vec::new();
        emit_mov_rm(&mut buf, Size::L, GpReg::Rax, Mem::disp(GpReg::Rbx, 1000));
        assert_eq!(buf[0], 0x8b);
        assert_eq!(buf[1], 0x83); // mod=10, reg=000, rm=011
        assert_eq!(&buf[2..6], &1000i32.to_le_bytes());
    }

    #[test]
    fn jcc_forward_then_patch_yields_correct_rel32() {
        let mut buf = vec![0u8; 10];
        let site = emit_jcc_forward(&mut buf, Cond::Eq);
        let after_jcc = buf.len();
        buf.extend_from_slice(&[0x90, 0x90]); // filler
        let target = buf.len();

        patch_rel32(&mut buf, site, target);

        let rel = i32::from_le_bytes(buf[site..site + 4].try_into().unwrap());
        assert_eq!(rel, (target as i64 - (site as i64 + 4)) as i32);
        assert_eq!(after_jcc, site + 4);
    }

    #[test]
    fn align_to_pads_to_boundary() {
        let mut buf = vec![0u8; 13];
        align_to(&mut buf, 16);
        assert_eq!(buf.len(), 16);

        let mut buf2 = vec![0u8; 16];
        align_to(&mut buf2, 16);
        assert_eq!(buf2.len(), 16);
    }

    #[test]
    fn align_to_beyond_largest_nop_chains_entries() {
        let mut buf = Vec::new();
        align_to(&mut buf, 32);
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn setcc_emits_rex_for_spl_style_byte_register() {
        let mut buf = Vec::new();
        emit_setcc(&mut buf, Cond::Eq, GpReg::Rsp);
        assert_eq!(buf, vec![0x40, 0x0f, 0x94, 0xc4]);
    }
}
