//! The outer loop (spec §9 "Global context"): owns the block cache, the mid-layer, and the
//! popall dispatch stubs, and is the only thing the embedder calls into. [`JitEngine::enter`]
//! alternates between dispatching into compiled code and recording/interpreting a trace, exactly
//! as the reference's `execute_normal_68k`/`exec_nostats` do, minus the statistics counters (spec
//! §1 Non-goals).

use crate::backend::{Backend, HostFeatures};
use crate::block::BlockStatus;
use crate::cache::BlockCache;
use crate::config::JitConfig;
use crate::dispatch::{DispatchStubs, STATE_PTR_REG};
use crate::driver::{self, CompileOutput};
use crate::error::{CompileError, Error};
use crate::guest::{GuestState, SpecialFlags};
use crate::interp::{FallbackOutcome, InterpreterFallback};
use crate::memory::GuestMemory;
use crate::midlayer::MidLayer;
use crate::trace::{HitCounter, Trace};
use crate::vreg::VRegFile;

/// The host register the mid-layer uses as CCR-materialization scratch. Unlike
/// [`crate::dispatch::STATE_PTR_REG`] this is not locked in the allocator: it is only read
/// immediately before a flush, by which point nothing the allocator still cares about lives in
/// it (mirrors how [`crate::driver::compile_trace`]'s own tests exercise it).
const CCR_SCRATCH_REG: crate::backend::x86_64::GpReg = crate::backend::x86_64::GpReg::Rcx;

/// Signature of the popall entry stub: takes the guest state pointer and the absolute address of
/// the compiled handler to jump into, System V AMD64 argument order (spec §4.7).
type EnterFn = unsafe extern "sysv64" fn(*mut GuestState, *const u8);

/// Ties the block cache, register allocator, flag engine, and dispatch stubs together into the
/// one object the embedder owns (spec §6: "the JIT context is a single opaque handle").
pub struct JitEngine<B: Backend> {
    config: JitConfig,
    cache: BlockCache<B>,
    mid: MidLayer<B>,
    regs: VRegFile,
    trace: Trace,
    hits: HitCounter,
    stubs: DispatchStubs,
    stub_page: mmap_rs::Mmap,
    features: HostFeatures,
}

impl<B: Backend> JitEngine<B> {
    /// Builds a fresh engine: maps the code cache, emits the popall stubs into their own RX page,
    /// and probes host CPU features once (spec §9: "detected once at startup, not per block").
    /// Heap-allocated since the cache's internal arena and index table are large fixed-size
    /// structures a caller should not want to move around on the stack.
    pub fn new(config: JitConfig) -> Result<Box<Self>, Error> {
        let cache = BlockCache::new(config.cache_size_kb)?;
        let (stubs, stub_page) = DispatchStubs::build()?;
        let features = B::detect_features();

        Ok(Box::new(Self {
            config,
            cache,
            mid: MidLayer::new(),
            regs: VRegFile::new(),
            trace: Trace::new(),
            hits: HitCounter::new(),
            stubs,
            stub_page,
            features,
        }))
    }

    pub fn features(&self) -> HostFeatures {
        self.features
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Read-only access to the block cache, for embedders that want to inspect block status or
    /// coverage (e.g. a debugger overlay) without routing everything through `enter`.
    pub fn cache(&self) -> &BlockCache<B> {
        &self.cache
    }

    fn exit_stub_addr(&self) -> u64 {
        (self.stub_page.as_ptr() as u64) + self.stubs.exit_offset as u64
    }

    fn enter_fn(&self) -> EnterFn {
        let addr = (self.stub_page.as_ptr() as usize) + self.stubs.enter_offset;
        // SAFETY: the popall page was mapped RX by `DispatchStubs::build` and `enter_offset`
        // points at a valid `emit_enter_stub` prologue for the lifetime of `self.stub_page`.
        unsafe { std::mem::transmute::<usize, EnterFn>(addr) }
    }

    /// Runs the guest until an interrupt/trap/break/stopped flag is observed in `state.spcflags`.
    /// Each iteration either dispatches straight into a cached, checksum-valid compiled block, or
    /// falls through to the interpreter for one instruction while feeding a [`Trace`] that the
    /// compile driver consumes once the PC crosses [`crate::trace::COMPILE_THRESHOLD`] (spec §2).
    pub fn enter<M, F>(&mut self, state: &mut GuestState, memory: &mut M, fallback: &mut F)
    where
        M: GuestMemory,
        F: InterpreterFallback<M>,
    {
        loop {
            let want_hard = state.spcflags.contains(SpecialFlags::FLUSH_HARD);
            let want_lazy = state.spcflags.contains(SpecialFlags::FLUSH_LAZY);
            if want_hard && want_lazy && self.config.jit_lazy_flush {
                // Both apply at once: prefer the cheaper lazy (checksum-recheck) invalidation
                // over the hard flush, per `JitConfig::jit_lazy_flush`'s documented preference.
                self.cache.flush_lazy();
            } else {
                if want_hard {
                    self.cache.flush_hard();
                }
                if want_lazy {
                    self.cache.flush_lazy();
                }
            }
            state.spcflags.remove(SpecialFlags::FLUSH_HARD | SpecialFlags::FLUSH_LAZY);
            if state.spcflags.intersects(
                SpecialFlags::INTERRUPT | SpecialFlags::STOPPED | SpecialFlags::TRAP | SpecialFlags::BREAK,
            ) {
                return;
            }

            let pc = state.pc;

            if let Some(block) = self.cache.get_blockinfo_addr(pc) {
                let id = block.id;
                let handler_offset = block.handler_offset;
                let eligible = matches!(block.status, BlockStatus::InCache | BlockStatus::NeedCheck);
                if eligible && self.cache.block_check_checksum(id, memory) {
                    if block.status == BlockStatus::NeedCheck {
                        // The checksum still matches what it was compiled against: a lazy flush
                        // only asked for re-verification, not a recompile, so promote straight
                        // back to `InCache` and dispatch as usual.
                        if let Some(block) = self.cache.block_mut(id) {
                            block.status = BlockStatus::InCache;
                        }
                    }
                    self.cache.raise_in_cl_list(id);
                    let handler_addr = unsafe { self.cache.base_ptr().add(handler_offset) };
                    let enter_fn = self.enter_fn();
                    // SAFETY: `handler_addr` was written by a prior `begin_compile`/`append`/
                    // `finish_compile` cycle for this exact block id, which flips the cache page
                    // executable before any dispatch can reach here; `state` is a valid, live
                    // `&mut GuestState` for the duration of the call, and the stub never retains
                    // either pointer past its own `ret`.
                    unsafe { enter_fn(state as *mut GuestState, handler_addr) };
                    continue;
                }
                // Either stale status or a checksum mismatch (self-modifying code touched this
                // block's guest range): invalidate and fall through to recompile/interpret below.
                if let Err(err) = self.cache.invalidate_block(id) {
                    tracing::warn!(?err, pc, "failed to invalidate block");
                }
            }

            if self.hits.bump(pc) {
                if self.try_compile(pc, memory).is_ok() {
                    self.hits.forget(pc);
                    continue;
                }
            }

            let opcode = memory.read_u16(pc);
            match fallback.execute(state, memory, opcode) {
                FallbackOutcome::Continue | FallbackOutcome::ExitBlock => {}
            }
        }
    }

    /// Records a trace starting at `pc` directly from guest memory (this build's
    /// [`InterpreterFallback`] has no trace-recording cooperation point, per spec §9's framing of
    /// the interpreter as an external, opaque handler table) and hands it to the compile driver.
    /// On success, installs the resulting code into the cache and marks the block `InCache`.
    /// Every failure here is block-scoped (spec §4.6): the caller just keeps interpreting `pc`.
    fn try_compile<M: GuestMemory>(&mut self, entry_pc: u32, memory: &mut M) -> Result<(), CompileError> {
        self.trace.clear();
        let mut pc = entry_pc;
        loop {
            let opcode = memory.read_u16(pc);
            let keep_going = self.trace.push(pc, opcode);
            if driver::is_block_ending(opcode) || !keep_going {
                break;
            }
            pc = pc.wrapping_add(2);
        }

        let exit_stub_addr = self.exit_stub_addr();
        let future_base_offset = self.cache.cursor();
        let output: CompileOutput = driver::compile_trace(
            &mut self.mid,
            &mut self.regs.gpr,
            memory,
            &self.trace,
            STATE_PTR_REG,
            CCR_SCRATCH_REG,
            exit_stub_addr,
            &self.config,
            &self.cache,
            future_base_offset,
        )?;

        if output.trivial {
            // Nothing was actually translated (the first instruction was blacklisted, `RTS`,
            // `BSR`, or a `Bcc` whose flags aren't resident): caching this would install a block
            // that exits straight back to `entry_pc` forever, starving the interpreter of a
            // chance to ever run it again. Leave the hit counter alone and keep interpreting.
            return Err(CompileError::Untranslatable);
        }

        let id = match self.cache.get_blockinfo_addr(entry_pc) {
            Some(block) => block.id,
            None => self.cache.get_blockinfo_addr_new(entry_pc),
        };

        self.cache
            .begin_compile()
            .map_err(|_| CompileError::CacheExhausted)?;
        let offset = self.cache.append(&output.code);
        self.cache
            .finish_compile()
            .map_err(|_| CompileError::CacheExhausted)?;

        for csi in &output.checksums {
            self.cache.register_coverage(id, csi.start, csi.length);
        }

        if let Some(block) = self.cache.block_mut(id) {
            block.handler_offset = offset;
            block.direct_handler_offset = offset;
            block.code_len = output.code.len();
            block.checksums = output.checksums;
            block.status = BlockStatus::InCache;
        }

        // Register each compile-time chain site (driver::emit_chained_exit already patched the
        // bytes themselves) as a `BlockCache` edge, so a later invalidation of the target knows to
        // repatch this block back to its safe dispatch-stub fallback.
        for site in &output.chain_sites {
            if let Some(target_id) = self.cache.get_blockinfo_addr(site.target_pc).map(|b| b.id) {
                self.cache.link_blocks(id, target_id, offset + site.local_offset);
            }
        }

        if self.config.jit_debug {
            tracing::debug!(
                pc = entry_pc,
                code_len = output.code.len(),
                chain_sites = output.chain_sites.len(),
                "compiled block"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86_64::X86_64;
    use crate::guest::GuestState;
    use crate::interp::FallbackOutcome;
    use crate::memory::FlatMemory;

    struct CountingFallback {
        steps: usize,
    }

    impl InterpreterFallback<FlatMemory> for CountingFallback {
        fn execute(&mut self, state: &mut GuestState, _memory: &mut FlatMemory, _opcode: u16) -> FallbackOutcome {
            self.steps += 1;
            state.pc = state.pc.wrapping_add(2);
            if self.steps >= 50 {
                state.spcflags.insert(SpecialFlags::BREAK);
            }
            FallbackOutcome::Continue
        }
    }

    #[test]
    fn engine_runs_until_break_flag_is_observed() {
        let mut engine = JitEngine::<X86_64>::new(JitConfig::default()).unwrap();
        let mut mem = FlatMemory::new(0x10000);
        // NOP at every PC the counting fallback walks over; opcode value is irrelevant since
        // `CountingFallback` never decodes it.
        let mut state = GuestState::new();
        let mut fallback = CountingFallback { steps: 0 };

        engine.enter(&mut state, &mut mem, &mut fallback);

        assert!(state.spcflags.contains(SpecialFlags::BREAK));
        assert_eq!(fallback.steps, 50);
    }

    #[test]
    fn hard_flush_flag_clears_the_cache_and_is_consumed() {
        let mut engine = JitEngine::<X86_64>::new(JitConfig::default()).unwrap();
        let id = engine.cache.get_blockinfo_addr_new(0x1000);
        assert!(engine.cache.block(id).is_some());

        let mut mem = FlatMemory::new(0x10000);
        let mut state = GuestState::new();
        state.spcflags.insert(SpecialFlags::FLUSH_HARD | SpecialFlags::BREAK);
        let mut fallback = CountingFallback { steps: 0 };

        engine.enter(&mut state, &mut mem, &mut fallback);

        assert!(engine.cache.get_blockinfo_addr(0x1000).is_none());
        assert!(!state.spcflags.contains(SpecialFlags::FLUSH_HARD));
    }

    #[test]
    fn engine_reports_detected_host_features() {
        let engine = JitEngine::<X86_64>::new(JitConfig::default()).unwrap();
        assert!(engine.features().sse2);
    }
}
