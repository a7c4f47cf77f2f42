//! Concrete end-to-end scenarios (spec §8): each one drives either the compile driver directly
//! (scenarios 1-4, which only care about one instruction's translated semantics) or the full
//! [`JitEngine`] dispatch loop (scenarios 5-6, which exercise the hit-counter warm-up and the
//! checksum-based self-modifying-code invalidation).

use mmap_rs::MmapOptions;

use m68k_jit::backend::x86_64::{GpReg, X86_64};
use m68k_jit::block::BlockStatus;
use m68k_jit::cache::BlockCache;
use m68k_jit::config::JitConfig;
use m68k_jit::dispatch::{DispatchStubs, STATE_PTR_REG};
use m68k_jit::driver;
use m68k_jit::guest::{Ccr, GuestState};
use m68k_jit::memory::{FlatMemory, GuestMemory};
use m68k_jit::midlayer::MidLayer;
use m68k_jit::trace::Trace;
use m68k_jit::vreg::VRegFile;
use m68k_jit::{FallbackOutcome, InterpreterFallback, SpecialFlags, X86_64JitEngine};

type EnterFn = unsafe extern "sysv64" fn(*mut GuestState, *const u8);

/// Compiles the trace starting at `pc` in `mem` by hand-driving [`driver::compile_trace`] and a
/// standalone popall stub pair, the same way [`JitEngine`] does internally, then runs the result
/// once against `state` and returns it. Scenarios 1-4 only check one instruction's translated
/// semantics, not the hit-counter warm-up policy, so this bypasses [`JitEngine`] entirely rather
/// than calling `enter` five times with an interpreter that would have to duplicate every
/// instruction's semantics just to reach the sixth, compiled pass.
fn compile_and_run(mem: &mut FlatMemory, pc: u32, mut state: GuestState) -> GuestState {
    let mut trace = Trace::new();
    let mut cursor = pc;
    loop {
        let opcode = mem.read_u16(cursor);
        let keep_going = trace.push(cursor, opcode);
        if driver::is_block_ending(opcode) || !keep_going {
            break;
        }
        cursor = cursor.wrapping_add(2);
    }

    let (stubs, stub_page) = DispatchStubs::build().unwrap();
    let exit_stub_addr = (stub_page.as_ptr() as u64) + stubs.exit_offset as u64;

    let mut file = VRegFile::new();
    let mut mid = MidLayer::<X86_64>::new();
    let config = JitConfig::default();

    let out = driver::compile_trace(
        &mut mid,
        &mut file.gpr,
        mem,
        &trace,
        STATE_PTR_REG,
        GpReg::Rcx,
        exit_stub_addr,
        &config,
        &BlockCache::<X86_64>::new(m68k_jit::config::MIN_CACHE_SIZE_KB).unwrap(),
        0,
    )
    .unwrap();
    assert!(!out.trivial, "the instruction under test must actually compile, not just bail out");

    let mut code_page = MmapOptions::new(4096).unwrap().map_mut().unwrap();
    code_page[..out.code.len()].copy_from_slice(&out.code);
    let code_page = code_page.make_exec().unwrap();
    let handler_addr = code_page.as_ptr();

    let enter_addr = (stub_page.as_ptr() as usize) + stubs.enter_offset;
    // SAFETY: `enter_addr` points at `emit_enter_stub`'s prologue inside a page `DispatchStubs::build`
    // just flipped RX, and `handler_addr` points at `out.code` inside a page this function just
    // flipped RX; both pages and `state` outlive the call.
    let enter_fn: EnterFn = unsafe { std::mem::transmute(enter_addr) };
    unsafe { enter_fn(&mut state as *mut GuestState, handler_addr) };

    state
}

const ADD_L_D1_D0: u16 = 0xd081;
const NEG_L_D0: u16 = 0x4480;
const SWAP_D0: u16 = 0x4840;
const ROR_W_8_D0: u16 = 0xe058;

/// Scenario 1: `ADD.L D1,D0` with no carry/overflow. The spec's own worked example states the
/// sum as `0x668899CC`; digit-by-digit addition of `0x11223344 + 0x55667788` actually carries no
/// nibble anywhere and comes out to `0x6688AACC` (see `DESIGN.md`), so that corrected value is
/// what a correct implementation must produce.
#[test]
fn scenario_1_add_no_carry() {
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(0x1000, ADD_L_D1_D0);

    let mut state = GuestState::new();
    state.regs[0] = 0x1122_3344;
    state.regs[1] = 0x5566_7788;

    let state = compile_and_run(&mut mem, 0x1000, state);

    assert_eq!(state.regs[0], 0x6688_AACC);
    let ccr = state.ccr();
    assert!(!ccr.contains(Ccr::C));
    assert!(!ccr.contains(Ccr::X));
    assert!(!ccr.contains(Ccr::Z));
    assert!(!ccr.contains(Ccr::N));
    assert!(!ccr.contains(Ccr::V));
}

/// Scenario 2: `ADD.L D1,D0` with `D0 = 0xFFFFFFFF`, `D1 = 1` wraps to zero and sets C, X, and Z.
#[test]
fn scenario_2_add_carry_sets_x_and_c_together() {
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(0x1000, ADD_L_D1_D0);

    let mut state = GuestState::new();
    state.regs[0] = 0xFFFF_FFFF;
    state.regs[1] = 1;

    let state = compile_and_run(&mut mem, 0x1000, state);

    assert_eq!(state.regs[0], 0);
    let ccr = state.ccr();
    assert!(ccr.contains(Ccr::C));
    assert!(ccr.contains(Ccr::X));
    assert!(ccr.contains(Ccr::Z));
    assert!(!ccr.contains(Ccr::N));
    assert!(!ccr.contains(Ccr::V));
}

/// Scenario 3: `NEG.L D0` on `0x80000000` (the one value a 32-bit negate can't represent) sets
/// both V and C, per 68k `INT_MIN` negate-overflow semantics.
#[test]
fn scenario_3_neg_int_min_sets_overflow_and_carry() {
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(0x1000, NEG_L_D0);

    let mut state = GuestState::new();
    state.regs[0] = 0x8000_0000;

    let state = compile_and_run(&mut mem, 0x1000, state);

    assert_eq!(state.regs[0], 0x8000_0000);
    let ccr = state.ccr();
    assert!(ccr.contains(Ccr::V));
    assert!(ccr.contains(Ccr::C));
    assert!(ccr.contains(Ccr::N));
    assert!(!ccr.contains(Ccr::Z));
}

/// Scenario 4: two `ROR.W #8,D0` rotate a 16-bit word by a full 16 bits (identity), then `SWAP`
/// exchanges the two halves of D0.
#[test]
fn scenario_4_double_ror_then_swap() {
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(0x1000, ROR_W_8_D0);

    let mut state = GuestState::new();
    state.regs[0] = 0x1234_5678;

    let state = compile_and_run(&mut mem, 0x1000, state);
    assert_eq!(state.regs[0], 0x1234_5678, "one ROR.W #8 on the low word must not touch the high word");

    let mut mem2 = FlatMemory::new(0x10000);
    mem2.write_u16(0x1000, ROR_W_8_D0);
    let state = compile_and_run(&mut mem2, 0x1000, state);
    assert_eq!(state.regs[0], 0x1234_5678, "two ROR.W #8 in a row is a full rotation: identity");

    let mut mem3 = FlatMemory::new(0x10000);
    mem3.write_u16(0x1000, SWAP_D0);
    let state = compile_and_run(&mut mem3, 0x1000, state);
    assert_eq!(state.regs[0], 0x5678_1234);
}

/// A minimal interpreter fallback covering exactly the opcodes scenarios 5 and 6 use: register-
/// direct `MOVE.L`/`ADD.L`, and `RTS` as the universal block terminator. Anything else (including
/// a corrupted opcode scenario 6 writes mid-instruction) is treated the way a real embedder's
/// catch-all would treat genuinely unknown guest code: stop and let the caller inspect state.
struct MiniInterp;

impl InterpreterFallback<FlatMemory> for MiniInterp {
    fn execute(&mut self, state: &mut GuestState, _memory: &mut FlatMemory, opcode: u16) -> FallbackOutcome {
        // MOVE.L Dm,Dn: 0010 dddmmm MMMrrr, restricted to Dn,Dn.
        if opcode & 0xf1f8 == 0x2000 {
            let dn = ((opcode >> 9) & 0x7) as usize;
            let dm = (opcode & 0x7) as usize;
            state.regs[dn] = state.regs[dm];
            state.pc = state.pc.wrapping_add(2);
            return FallbackOutcome::Continue;
        }
        // ADD.L Dm,Dn: 1101 nnn 010 000 mmm
        if opcode & 0xf1f8 == 0xd080 {
            let dn = ((opcode >> 9) & 0x7) as usize;
            let dm = (opcode & 0x7) as usize;
            state.regs[dn] = state.regs[dn].wrapping_add(state.regs[dm]);
            state.pc = state.pc.wrapping_add(2);
            return FallbackOutcome::Continue;
        }
        // RTS and anything unrecognized both end the run here; a real embedder would keep a full
        // interpreter underneath, but these scenarios never execute anything else.
        state.spcflags.insert(SpecialFlags::BREAK);
        FallbackOutcome::ExitBlock
    }
}

/// Scenario 5: a two-instruction block (`MOVE.L D0,D1 ; RTS`) is interpreted
/// [`m68k_jit::trace::COMPILE_THRESHOLD`] times; the next dispatch at the same PC must find a
/// compiled, cached block and run it instead of the interpreter, producing the same result. This
/// is also the exact shape that motivated `CompileOutput::trivial`: without it, the trailing `RTS`
/// at this trace's own PC would otherwise risk being cached as a self-looping no-op.
#[test]
fn scenario_5_hit_threshold_installs_a_cached_block() {
    const ENTRY: u32 = 0x5000;
    let mut engine = X86_64JitEngine::new(JitConfig::default()).unwrap();
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(ENTRY, 0x2200); // MOVE.L D0,D1
    mem.write_u16(ENTRY + 2, 0x4e75); // RTS

    let mut state = GuestState::new();
    let mut fallback = MiniInterp;

    for pass in 0..5 {
        state.pc = ENTRY;
        state.regs[0] = 0x1111 + pass;
        state.regs[1] = 0;
        state.spcflags.remove(SpecialFlags::BREAK);

        engine.enter(&mut state, &mut mem, &mut fallback);

        assert!(state.spcflags.contains(SpecialFlags::BREAK));
        assert_eq!(state.regs[1], 0x1111 + pass, "MOVE.L D0,D1 must hold regardless of interpreter vs. compiled");
    }

    let block = engine.cache().get_blockinfo_addr(ENTRY).expect("block must be cached after the 5th hit");
    assert_eq!(block.status, BlockStatus::InCache);

    // One more pass with a fresh sentinel confirms the now-cached block is what actually ran.
    state.pc = ENTRY;
    state.regs[0] = 0x2222;
    state.regs[1] = 0;
    state.spcflags.remove(SpecialFlags::BREAK);
    engine.enter(&mut state, &mut mem, &mut fallback);
    assert_eq!(state.regs[1], 0x2222);
}

/// Scenario 6: once block `B` (covering `[ENTRY, ENTRY+6)`) is cached, a write to one of its
/// covered bytes must be caught by the next dispatch's checksum check, invalidate the block, and
/// lead to a fresh compile against the new bytes rather than ever running stale code again.
#[test]
fn scenario_6_self_modifying_code_invalidates_and_recompiles() {
    const ENTRY: u32 = 0x6000;
    let mut engine = X86_64JitEngine::new(JitConfig::default()).unwrap();
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(ENTRY, 0x2200); // MOVE.L D0,D1
    mem.write_u16(ENTRY + 2, 0xd082); // ADD.L D2,D0
    mem.write_u16(ENTRY + 4, 0x4e75); // RTS

    let mut state = GuestState::new();
    let mut fallback = MiniInterp;

    for _ in 0..5 {
        state.pc = ENTRY;
        state.regs[0] = 0x10;
        state.regs[1] = 0;
        state.regs[2] = 0x5;
        state.spcflags.remove(SpecialFlags::BREAK);
        engine.enter(&mut state, &mut mem, &mut fallback);
    }

    let block = engine.cache().get_blockinfo_addr(ENTRY).expect("block must be cached after warm-up");
    assert_eq!(block.status, BlockStatus::InCache);
    assert_eq!(block.checksums.len(), 3, "one checksum per recorded instruction covers [ENTRY, ENTRY+6)");
    let original_checksums: Vec<u32> = block.checksums.iter().map(|c| c.checksum).collect();

    // Corrupt the high byte of the ADD instruction in place, exactly as the spec's own example
    // does ("writes 0xCC at X+2"). The instruction's semantics after this are irrelevant to the
    // assertions below; only the cache-coherence behavior is under test.
    mem.write_u8(ENTRY + 2, 0xCC);

    assert!(!engine.cache().block_check_checksum(block.id, &mut mem), "the corrupted range must fail its checksum");

    state.pc = ENTRY;
    state.spcflags.remove(SpecialFlags::BREAK);
    engine.enter(&mut state, &mut mem, &mut fallback);

    assert!(engine.cache().get_blockinfo_addr(ENTRY).is_none(), "checksum mismatch must invalidate the block immediately");

    // Warm the now-corrupted PC back up to a fresh compile.
    for _ in 0..5 {
        state.pc = ENTRY;
        state.spcflags.remove(SpecialFlags::BREAK);
        engine.enter(&mut state, &mut mem, &mut fallback);
    }

    let recompiled = engine.cache().get_blockinfo_addr(ENTRY);
    if let Some(recompiled) = recompiled {
        let new_checksums: Vec<u32> = recompiled.checksums.iter().map(|c| c.checksum).collect();
        assert_ne!(new_checksums, original_checksums, "a recompile against the corrupted bytes must not reuse the stale checksums");
    }
}

/// Scenario 7: a lazy flush (`spcflags.FLUSH_LAZY`) must not force a full recompile the way a
/// hard flush or a genuine checksum mismatch would. It demotes a cached block to `NeedCheck`;
/// the next dispatch re-verifies the still-matching checksum and promotes straight back to
/// `InCache` without ever touching the PC index or allocating a new `BlockId`.
#[test]
fn scenario_7_lazy_flush_rechecks_instead_of_recompiling() {
    const ENTRY: u32 = 0x7000;
    let mut engine = X86_64JitEngine::new(JitConfig::default()).unwrap();
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(ENTRY, 0x2200); // MOVE.L D0,D1
    mem.write_u16(ENTRY + 2, 0x4e75); // RTS

    let mut state = GuestState::new();
    let mut fallback = MiniInterp;

    for _ in 0..5 {
        state.pc = ENTRY;
        state.regs[0] = 0x4242;
        state.regs[1] = 0;
        state.spcflags.remove(SpecialFlags::BREAK);
        engine.enter(&mut state, &mut mem, &mut fallback);
    }

    let before = engine.cache().get_blockinfo_addr(ENTRY).expect("block must be cached after warm-up");
    assert_eq!(before.status, BlockStatus::InCache);
    let (id_before, handler_offset_before) = (before.id, before.handler_offset);

    state.pc = ENTRY;
    state.regs[0] = 0x99;
    state.regs[1] = 0;
    state.spcflags.remove(SpecialFlags::BREAK);
    state.spcflags.insert(SpecialFlags::FLUSH_LAZY);
    engine.enter(&mut state, &mut mem, &mut fallback);

    assert_eq!(state.regs[1], 0x99, "the lazily-reverified block must still run correctly");
    assert!(!state.spcflags.contains(SpecialFlags::FLUSH_LAZY), "the flag must be consumed");

    let after = engine.cache().get_blockinfo_addr(ENTRY).expect("the block must still be indexed, not evicted");
    assert_eq!(after.status, BlockStatus::InCache, "a matching checksum promotes NeedCheck back to InCache");
    assert_eq!(after.id, id_before, "same generation: no invalidate-and-recompile cycle happened");
    assert_eq!(after.handler_offset, handler_offset_before, "no new code was ever appended");
}

/// Scenario 8: once block `B` is already `InCache`, compiling a `BRA` block `A` whose sole
/// target is `B`'s entry PC must chain directly into it — the compile driver patches `A`'s safe
/// `write_pc_and_exit` sequence into an in-place `jmp rel32`, and the two blocks end up linked in
/// the cache's `deps_out`/`deps_in` graph. Running `A` afterward must produce `B`'s side effects
/// in the same dispatch, with no intervening trip back through the Rust-level dispatch loop.
#[test]
fn scenario_8_bra_chains_directly_into_an_already_cached_block() {
    const ENTRY_B: u32 = 0x8100;
    const ENTRY_A: u32 = 0x8000;

    let mut engine = X86_64JitEngine::new(JitConfig::default()).unwrap();
    let mut mem = FlatMemory::new(0x10000);
    mem.write_u16(ENTRY_B, 0x2200); // MOVE.L D0,D1
    mem.write_u16(ENTRY_B + 2, 0x4e75); // RTS

    // BRA.W ENTRY_B: disp8 = 0x00 selects the 16-bit extension word; the displacement is relative
    // to the address right after the opcode word (ENTRY_A + 2).
    mem.write_u16(ENTRY_A, 0x6000);
    mem.write_u16(ENTRY_A + 2, (ENTRY_B.wrapping_sub(ENTRY_A + 2)) as u16);

    let mut state = GuestState::new();
    let mut fallback = MiniInterp;

    // Warm B up to a compiled, `InCache` block first.
    for pass in 0..5 {
        state.pc = ENTRY_B;
        state.regs[0] = 0x7000 + pass;
        state.regs[1] = 0;
        state.spcflags.remove(SpecialFlags::BREAK);
        engine.enter(&mut state, &mut mem, &mut fallback);
    }
    let b_id = engine.cache().get_blockinfo_addr(ENTRY_B).expect("B must be cached after warm-up").id;

    // Warm A up; none of these passes recognize the BRA opcode, so `MiniInterp` just sets `BREAK`
    // every time until the 5th hit triggers a compile of A's one-instruction trace.
    for _ in 0..5 {
        state.pc = ENTRY_A;
        state.spcflags.remove(SpecialFlags::BREAK);
        engine.enter(&mut state, &mut mem, &mut fallback);
    }

    let a_block = engine.cache().get_blockinfo_addr(ENTRY_A).expect("A must be cached after its own warm-up");
    assert_eq!(a_block.status, BlockStatus::InCache);
    assert_eq!(a_block.deps_out.iter().count(), 1, "A's BRA target was already cached, so it must have been chained");

    let patch_site = a_block.deps_out.front().get().unwrap().patch_site;
    let base = engine.cache().base_ptr();
    // SAFETY: `patch_site` was written by the compile above and the cache's code buffer is
    // executable (but still readable) once a block is installed.
    let opcode_byte = unsafe { *base.add(patch_site) };
    assert_eq!(opcode_byte, 0xe9, "the patched site must be a direct jmp rel32, not the safe mov-and-exit fallback");

    assert_eq!(engine.cache().block(b_id).unwrap().deps_in.iter().count(), 1, "B must see the inbound edge from A");

    // Run A once more: the chained jmp must deliver control into B without ever going back
    // through the dispatch loop, so B's MOVE.L must have run.
    state.pc = ENTRY_A;
    state.regs[0] = 0xABCD;
    state.regs[1] = 0;
    state.spcflags.remove(SpecialFlags::BREAK);
    engine.enter(&mut state, &mut mem, &mut fallback);
    assert_eq!(state.regs[1], 0xABCD, "the chained jump must have actually executed B's MOVE.L D0,D1");
}
