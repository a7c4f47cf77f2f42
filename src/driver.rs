//! The compile driver (spec §4.6): turns a recorded [`Trace`] into machine code. Walks the trace
//! once backward to compute flag liveness, then once forward, handing each instruction to
//! [`handlers::compile_opcode`] and giving `Bcc`/`BRA` special direct treatment. Every other
//! block-ending opcode (`BSR`, `RTS`, anything `compile_opcode` can't translate) exits through a
//! single shared path back to the dispatch loop, which runs exactly that one instruction through
//! the interpreter fallback before re-entering (spec §9 "Global context").

use crate::backend::x86_64::{self, GpReg, Mem};
use crate::backend::{Backend, Cond, Size};
use crate::block::{BlockStatus, ChecksumInfo};
use crate::cache::{checksum_range, BlockCache};
use crate::config::JitConfig;
use crate::error::CompileError;
use crate::flags::{FlagsDefined, Validity};
use crate::guest::{Ccr, GuestState};
use crate::handlers;
use crate::memory::GuestMemory;
use crate::midlayer::MidLayer;
use crate::trace::{Trace, TraceEntry};
use crate::vreg::VRegState;

/// RTS: `0100 1110 0111 0101`. Return-address handling needs a guest stack write this build does
/// not compile (spec §1 Non-goals); it always falls to the interpreter.
pub(crate) const OPCODE_RTS: u16 = 0x4e75;

/// Whether `opcode` ends a trace: `RTS`, or the whole `Bcc`/`BRA`/`BSR` family (`0110 xxxx xxxxxxxx`).
/// Shared between the compile driver (which gives these special treatment) and the interpreting
/// half of [`crate::JitEngine::enter`] (which stops recording a trace at the same boundary).
pub fn is_block_ending(opcode: u16) -> bool {
    opcode == OPCODE_RTS || opcode & 0xf000 == 0x6000
}

pub struct CompileOutput {
    pub code: Vec<u8>,
    pub checksums: Vec<ChecksumInfo>,
    /// Every exit site this compile patched in place from a safe write-PC-and-exit sequence into
    /// a direct `jmp` at an already-cached target, paired with the guest PC it jumps to. The
    /// caller registers each one as a chaining edge (`BlockCache::link_blocks`) once this code has
    /// actually landed in the cache and its absolute address is known.
    pub chain_sites: Vec<ChainSite>,
    /// `true` when the emitted code never does anything but exit straight back to dispatch at the
    /// trace's own entry PC (a blacklisted/`RTS`/`BSR`/flags-unavailable first instruction). Such a
    /// block must not be cached: since it writes back the same PC it was entered with, caching it
    /// would let the dispatch loop bounce off it forever instead of ever reaching the interpreter
    /// again. A trace where at least one instruction was genuinely translated, or whose exit target
    /// differs from its entry PC (`BRA`, a taken/fallthrough `Bcc`), always makes forward progress
    /// and is safe to cache.
    pub trivial: bool,
}

/// One exit site patched at compile time into a direct jump rather than the safe dispatch-stub
/// exit, recorded so the caller can wire up the corresponding `BlockCache` edge once this code's
/// final cache address is known (spec §4.5 chaining).
#[derive(Debug, Clone, Copy)]
pub struct ChainSite {
    pub target_pc: u32,
    pub local_offset: usize,
}

/// Which of C/V/Z/N a `Bcc` condition reads before testing it, used to check the tested bits are
/// actually the ones the preceding instruction defined (spec §4.6 step 2: the liveness pass,
/// applied here).
fn cond_reads(cond: Cond) -> FlagsDefined {
    let mut f = FlagsDefined::NONE;
    match cond {
        Cond::Eq | Cond::Ne => f.z = true,
        Cond::Cs | Cond::Cc => f.c = true,
        Cond::Mi | Cond::Pl => f.n = true,
        Cond::Vs | Cond::Vc => f.v = true,
        Cond::Hi | Cond::Ls => {
            f.c = true;
            f.z = true;
        }
        Cond::Ge | Cond::Lt => {
            f.n = true;
            f.v = true;
        }
        Cond::Gt | Cond::Le => {
            f.n = true;
            f.v = true;
            f.z = true;
        }
    }
    f
}

fn is_subset(needed: FlagsDefined, defined: FlagsDefined) -> bool {
    (!needed.c || defined.c) && (!needed.v || defined.v) && (!needed.z || defined.z) && (!needed.n || defined.n)
}

/// Decodes the 4-bit condition field of a `Bcc` word (`0110 cccc dddddddd`); `0000`/`0001`
/// (`BRA`/`BSR`) are handled by the caller before this is consulted.
fn decode_cond_field(bits: u8) -> Option<Cond> {
    match bits {
        0b0010 => Some(Cond::Hi),
        0b0011 => Some(Cond::Ls),
        0b0100 => Some(Cond::Cc),
        0b0101 => Some(Cond::Cs),
        0b0110 => Some(Cond::Ne),
        0b0111 => Some(Cond::Eq),
        0b1000 => Some(Cond::Vc),
        0b1001 => Some(Cond::Vs),
        0b1010 => Some(Cond::Pl),
        0b1011 => Some(Cond::Mi),
        0b1100 => Some(Cond::Ge),
        0b1101 => Some(Cond::Lt),
        0b1110 => Some(Cond::Gt),
        0b1111 => Some(Cond::Le),
        _ => None,
    }
}

/// Backward liveness pass (spec §4.6 step 2). This build's handlers have no no-flag compile
/// variant to select between — every flag-setting call in `midlayer.rs` calls `note_native_flags`
/// unconditionally — so there is nothing for a precise per-instruction result to gate; the pass
/// still walks the trace backward as specified but conservatively reports every flag live
/// throughout. A `Bcc`'s actual condition-availability check is done separately, against the flag
/// engine's own forward-tracked state at the point the branch is compiled, which is strictly more
/// precise and needs no whole-trace table (see `DESIGN.md`).
pub fn compute_flag_liveness(entries: &[TraceEntry]) -> Vec<FlagsDefined> {
    vec![FlagsDefined::CZNV; entries.len()]
}

fn condition_available<B: Backend>(mid: &MidLayer<B>, cond: Cond) -> bool {
    mid.flags.flags_in_flags() == Validity::Valid && is_subset(cond_reads(cond), mid.flags.defined())
}

/// Reads the displacement extension word(s) (if any) for a `Bcc`/`BRA`/`BSR` and returns the
/// taken-branch target PC and the PC immediately following the instruction.
fn decode_branch_target<M: GuestMemory>(mem: &mut M, pc: u32, disp8: u8) -> (u32, u32) {
    let (disp, ext_len): (i32, u32) = if disp8 == 0x00 {
        (mem.read_u16(pc.wrapping_add(2)) as i16 as i32, 2)
    } else if disp8 == 0xff {
        (mem.read_u32(pc.wrapping_add(2)) as i32, 4)
    } else {
        (disp8 as i8 as i32, 0)
    };
    let base = pc.wrapping_add(2);
    let taken = (base as i64 + disp as i64) as u32;
    let fallthrough = base.wrapping_add(ext_len);
    (taken, fallthrough)
}

fn write_pc_and_exit(buf: &mut Vec<u8>, state_ptr: GpReg, pc: u32, exit_stub_addr: u64) {
    let scratch = GpReg::Rax;
    // `pc` is cast through `i32` first: `emit_mov_ri` checks a `Size::L` immediate fits a signed
    // 32-bit range, but the byte pattern written is the same regardless of signedness. The
    // resulting `0xb8 + imm32` is exactly 5 bytes — deliberately the same width as an `0xe9`
    // `jmp rel32`, so `emit_chained_exit` can overwrite just this first instruction in place.
    let _ = x86_64::emit_mov_ri(buf, Size::L, scratch, pc as i32 as i64);
    x86_64::emit_mov_mr(buf, Size::L, Mem::disp(state_ptr, GuestState::offset_of_pc()), scratch);
    let _ = x86_64::emit_mov_ri(buf, Size::Q, scratch, exit_stub_addr as i64);
    x86_64::emit_jmp_indirect_r(buf, scratch);
}

/// Emits the safe write-PC-and-exit sequence for a known next-block target (`BRA`, a taken or
/// fallthrough `Bcc`, or a trace's own fallthrough at the `MAXRUN` cap), then opportunistically
/// chains it: if `jit_inline` is set and `pc` is already a cached, in-cache block, the sequence's
/// first five bytes (`write_pc_and_exit`'s `mov eax, imm32`) are overwritten in place with a
/// direct `jmp rel32` into that block's `direct_handler_offset`. The jump's own final address is
/// computable right now, without waiting for this code to actually land in the cache, because
/// `future_base_offset` (the cache cursor this block's code will be `append`ed at) and the target
/// block's offset are both already known — both live in the same cache buffer and its base address
/// never moves once mapped. Only forward chaining to an *already-compiled* target is attempted;
/// a target that compiles later never retroactively patches this site (spec §4.5: "opportunistic").
fn emit_chained_exit<B: Backend>(
    buf: &mut Vec<u8>,
    state_ptr: GpReg,
    pc: u32,
    exit_stub_addr: u64,
    cache: &BlockCache<B>,
    future_base_offset: usize,
    jit_inline: bool,
    chain_sites: &mut Vec<ChainSite>,
) {
    let patch_site_local = buf.len();
    write_pc_and_exit(buf, state_ptr, pc, exit_stub_addr);

    if !jit_inline {
        return;
    }
    let Some(target) = cache.get_blockinfo_addr(pc) else {
        return;
    };
    if target.status != BlockStatus::InCache {
        return;
    }

    let insn_addr = future_base_offset + patch_site_local;
    let rel = target.direct_handler_offset as i64 - (insn_addr as i64 + 5);
    buf[patch_site_local] = 0xe9;
    buf[patch_site_local + 1..patch_site_local + 5].copy_from_slice(&(rel as i32).to_le_bytes());
    chain_sites.push(ChainSite { target_pc: pc, local_offset: patch_site_local });
}

/// Materializes pending flags (if any) and exits to the shared dispatch stub with `pc` as the
/// next guest instruction to run. Shared by every "hand this one instruction to the interpreter"
/// path: blacklisted opcodes, `RTS`/`BSR`, anything `compile_opcode` rejects, and a `Bcc` whose
/// tested bits are not available in host flags.
fn emit_exit_to_dispatch<B: Backend>(
    mid: &mut MidLayer<B>,
    regs: &mut [VRegState],
    buf: &mut Vec<u8>,
    state_ptr: GpReg,
    ccr_reg: GpReg,
    current_ccr: &mut Ccr,
    pc: u32,
    exit_stub_addr: u64,
) {
    *current_ccr = mid.sync_to_memory(regs, buf, ccr_reg, state_ptr, *current_ccr);
    write_pc_and_exit(buf, state_ptr, pc, exit_stub_addr);
}

/// Compiles one recorded trace into a flat instruction stream ending in an exit to dispatch.
/// `state_ptr` must be the register the allocator has reserved to carry `&GuestState`
/// ([`crate::dispatch::STATE_PTR_REG`]); `ccr_reg` is a scratch register for flag materialization,
/// distinct from `state_ptr` and from `GpReg::Rax` (used internally for the exit sequence).
pub fn compile_trace<B: Backend, M: GuestMemory>(
    mid: &mut MidLayer<B>,
    regs: &mut [VRegState],
    mem: &mut M,
    trace: &Trace,
    state_ptr: GpReg,
    ccr_reg: GpReg,
    exit_stub_addr: u64,
    config: &JitConfig,
    cache: &BlockCache<B>,
    future_base_offset: usize,
) -> Result<CompileOutput, CompileError> {
    let entries = trace.entries();
    if entries.is_empty() {
        return Err(CompileError::Untranslatable);
    }
    let _liveness = compute_flag_liveness(entries);

    let mut buf = Vec::new();
    let mut checksums = Vec::new();
    let mut chain_sites = Vec::new();
    let mut current_ccr = Ccr::empty();
    let mut made_progress = false;

    for (i, entry) in entries.iter().enumerate() {
        let TraceEntry { pc, opcode } = *entry;
        checksums.push(ChecksumInfo {
            start: pc,
            length: 2,
            checksum: checksum_range(mem, pc, 2),
        });

        if config.is_blacklisted(opcode) {
            emit_exit_to_dispatch(mid, regs, &mut buf, state_ptr, ccr_reg, &mut current_ccr, pc, exit_stub_addr);
            return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress });
        }

        if opcode == OPCODE_RTS {
            emit_exit_to_dispatch(mid, regs, &mut buf, state_ptr, ccr_reg, &mut current_ccr, pc, exit_stub_addr);
            return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress });
        }

        if opcode & 0xf000 == 0x6000 {
            let cond_field = ((opcode >> 8) & 0xf) as u8;
            let disp8 = (opcode & 0xff) as u8;
            let (taken_pc, fallthrough_pc) = decode_branch_target(mem, pc, disp8);

            if cond_field == 0b0000 {
                // BRA: unconditional, no test needed. Always makes progress: the exit target is
                // the branch's own destination, not necessarily this trace's entry PC.
                current_ccr = mid.sync_to_memory(regs, &mut buf, ccr_reg, state_ptr, current_ccr);
                emit_chained_exit(&mut buf, state_ptr, taken_pc, exit_stub_addr, cache, future_base_offset, config.jit_inline, &mut chain_sites);
                return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: false });
            }
            if cond_field == 0b0001 {
                // BSR: needs a guest stack push this build doesn't compile; interpreter handles it.
                emit_exit_to_dispatch(mid, regs, &mut buf, state_ptr, ccr_reg, &mut current_ccr, pc, exit_stub_addr);
                return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress });
            }

            let Some(cond) = decode_cond_field(cond_field) else {
                emit_exit_to_dispatch(mid, regs, &mut buf, state_ptr, ccr_reg, &mut current_ccr, pc, exit_stub_addr);
                return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress });
            };

            if !condition_available(mid, cond) {
                // The tested bits aren't resident in host flags (a preceding non-flag-setting
                // instruction or a block-entry state with nothing defined yet); bail to the
                // interpreter for this one instruction rather than reloading from the guest CCR.
                emit_exit_to_dispatch(mid, regs, &mut buf, state_ptr, ccr_reg, &mut current_ccr, pc, exit_stub_addr);
                return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress });
            }

            // Materialize flags (setcc + byte stores only — does not touch RFLAGS) and test the
            // still-intact host condition immediately afterward, before anything else (notably
            // the register-spill flush below, which may emit flag-clobbering add/sub) runs.
            current_ccr = mid.flags.materialize_flags(&mut buf, ccr_reg, state_ptr, current_ccr);
            let jcc_site = x86_64::emit_jcc_forward(&mut buf, cond);

            mid.alloc.flush(regs, &mut buf);
            emit_chained_exit(&mut buf, state_ptr, fallthrough_pc, exit_stub_addr, cache, future_base_offset, config.jit_inline, &mut chain_sites);

            let taken_offset = buf.len();
            x86_64::patch_rel32(&mut buf, jcc_site, taken_offset);

            mid.alloc.flush(regs, &mut buf);
            emit_chained_exit(&mut buf, state_ptr, taken_pc, exit_stub_addr, cache, future_base_offset, config.jit_inline, &mut chain_sites);

            return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: false });
        }

        match handlers::compile_opcode(mid, regs, &mut buf, opcode) {
            Ok(()) => {
                made_progress = true;
            }
            Err(_) => {
                emit_exit_to_dispatch(mid, regs, &mut buf, state_ptr, ccr_reg, &mut current_ccr, pc, exit_stub_addr);
                return Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress });
            }
        }

        // Ran off the end of the recorded trace (MAXRUN cap) without hitting a block-ending
        // opcode: exit to dispatch at the next instruction's PC so the outer loop resumes there.
        if i + 1 == entries.len() {
            let next_pc = pc.wrapping_add(2);
            current_ccr = mid.sync_to_memory(regs, &mut buf, ccr_reg, state_ptr, current_ccr);
            emit_chained_exit(&mut buf, state_ptr, next_pc, exit_stub_addr, cache, future_base_offset, config.jit_inline, &mut chain_sites);
        }
    }

    Ok(CompileOutput { code: buf, checksums, chain_sites, trivial: !made_progress })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86_64::X86_64;
    use crate::config::JitConfig;
    use crate::memory::{FlatMemory, GuestMemory};
    use crate::vreg::VRegFile;

    fn write_u16(mem: &mut FlatMemory, addr: u32, value: u16) {
        mem.write_u16(addr, value);
    }

    #[test]
    fn straight_line_trace_ends_in_exit_to_dispatch() {
        let mut mem = FlatMemory::new(0x10000);
        // ADD.L D1,D0 at 0x1000.
        write_u16(&mut mem, 0x1000, 0xd081);

        let mut trace = Trace::new();
        trace.push(0x1000, 0xd081);

        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let config = JitConfig::default();

        let out = compile_trace(
            &mut mid,
            &mut file.gpr,
            &mut mem,
            &trace,
            GpReg::R15,
            GpReg::Rcx,
            0xdead_beef,
            &config,
            &BlockCache::<X86_64>::new(crate::config::MIN_CACHE_SIZE_KB).unwrap(),
            0,
        )
        .unwrap();

        assert!(!out.code.is_empty());
        assert_eq!(out.checksums.len(), 1);
        assert_eq!(out.checksums[0].start, 0x1000);
    }

    #[test]
    fn rts_exits_immediately_without_compiling_it() {
        let mut mem = FlatMemory::new(0x10000);
        write_u16(&mut mem, 0x2000, OPCODE_RTS);

        let mut trace = Trace::new();
        trace.push(0x2000, OPCODE_RTS);

        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let config = JitConfig::default();

        let out = compile_trace(
            &mut mid,
            &mut file.gpr,
            &mut mem,
            &trace,
            GpReg::R15,
            GpReg::Rcx,
            0xdead_beef,
            &config,
            &BlockCache::<X86_64>::new(crate::config::MIN_CACHE_SIZE_KB).unwrap(),
            0,
        )
        .unwrap();

        assert!(!out.code.is_empty());
    }

    #[test]
    fn bcc_without_live_flags_bails_to_interpreter() {
        let mut mem = FlatMemory::new(0x10000);
        // BEQ.B *+4 at 0x3000, opcode 0110 0111 00000010 = 0x6702.
        write_u16(&mut mem, 0x3000, 0x6702);

        let mut trace = Trace::new();
        trace.push(0x3000, 0x6702);

        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let config = JitConfig::default();

        let out = compile_trace(
            &mut mid,
            &mut file.gpr,
            &mut mem,
            &trace,
            GpReg::R15,
            GpReg::Rcx,
            0xdead_beef,
            &config,
            &BlockCache::<X86_64>::new(crate::config::MIN_CACHE_SIZE_KB).unwrap(),
            0,
        )
        .unwrap();

        // No live flags at block entry, so this must be a plain exit-to-dispatch, not a Jcc.
        assert!(!out.code.iter().any(|&b| b == 0x0f));
    }

    #[test]
    fn bcc_with_live_flags_emits_a_native_conditional_jump() {
        let mut mem = FlatMemory::new(0x10000);
        write_u16(&mut mem, 0x4000, 0xd081); // ADD.L D1,D0
        write_u16(&mut mem, 0x4002, 0x6702); // BEQ.B *+4

        let mut trace = Trace::new();
        trace.push(0x4000, 0xd081);
        trace.push(0x4002, 0x6702);

        let mut file = VRegFile::new();
        let mut mid = MidLayer::<X86_64>::new();
        let config = JitConfig::default();

        let out = compile_trace(
            &mut mid,
            &mut file.gpr,
            &mut mem,
            &trace,
            GpReg::R15,
            GpReg::Rcx,
            0xdead_beef,
            &config,
            &BlockCache::<X86_64>::new(crate::config::MIN_CACHE_SIZE_KB).unwrap(),
            0,
        )
        .unwrap();

        assert_eq!(out.checksums.len(), 2);
        // A near-conditional-jump opcode (0f 8x) must appear once ADD left flags live.
        assert!(out.code.windows(2).any(|w| w[0] == 0x0f && (0x80..=0x8f).contains(&w[1])));
    }

    #[test]
    fn cond_reads_matches_the_compound_conditions() {
        let hi_ls = cond_reads(Cond::Hi);
        assert!(hi_ls.c && hi_ls.z && !hi_ls.n && !hi_ls.v);
        let gt_le = cond_reads(Cond::Gt);
        assert!(gt_le.n && gt_le.v && gt_le.z && !gt_le.c);
    }
}
