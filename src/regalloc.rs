//! The shadow-register allocator (spec §4.2): the bidirectional map between virtual registers
//! (backed by [`crate::vreg::VRegState`]) and host registers, with lazy spill, offset
//! propagation, partial-width tracking, and constant propagation. One [`RegAlloc`] instance
//! serves the integer virtual-register file; a second, smaller one serves the FP file.

use std::marker::PhantomData;

use crate::backend::x86_64::{self, GpReg, Mem};
use crate::backend::{Backend, Size};
use crate::dispatch::STATE_PTR_REG;
use crate::error::CompileError;
use crate::vreg::{NeedFlush, VRegState, VRegStatus};

/// Per-host-register bookkeeping. `holds` supports alias tracking: after `mov d0, d1` both
/// virtual registers legitimately mirror the same host register's value until one is written.
struct HostSlot {
    locked: bool,
    touched: u32,
    holds: Vec<usize>,
}

impl HostSlot {
    fn empty() -> Self {
        Self {
            locked: false,
            touched: 0,
            holds: Vec::new(),
        }
    }
}

pub struct RegAlloc<B: Backend> {
    host: Vec<HostSlot>,
    clock: u32,
    _backend: PhantomData<B>,
}

impl<B: Backend> RegAlloc<B> {
    pub fn new() -> Self {
        let mut host: Vec<HostSlot> = (0..B::NUM_HOST_REGS).map(|_| HostSlot::empty()).collect();
        // `STATE_PTR_REG` carries `&GuestState` across the whole compiled block (spec §9); it is
        // never available for the allocator to hand out, so every spill/reload can address guest
        // memory off it unconditionally.
        let reserved = STATE_PTR_REG.0 as usize;
        if reserved < host.len() {
            host[reserved].locked = true;
        }
        Self {
            host,
            clock: 0,
            _backend: PhantomData,
        }
    }

    fn tick(&mut self) -> u32 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    /// Picks an eviction victim: the unlocked host register with the oldest `touched` time. All
    /// locked means every register is pinned by the in-flight instruction, an allocator bug
    /// (spec §4.2 says the allocator never fails to produce a *satisfiable* request, and running
    /// out with everything locked means the mid-layer asked for more simultaneous pins than
    /// exist — a translator bug, not a guest-triggerable condition).
    fn pick_victim(&self) -> usize {
        self.host
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.locked)
            .min_by_key(|(_, s)| s.touched)
            .map(|(i, _)| i)
            .expect("register allocator exhausted: every host register locked simultaneously")
    }

    /// Writes a host register's current contents back to memory for every virtual register it
    /// holds that is `Dirty`, then clears its alias list. Does not touch `Clean`/`InMem` holders
    /// beyond downgrading their bookkeeping, since they owe nothing.
    fn evict(&mut self, regs: &mut [VRegState], buf: &mut Vec<u8>, host_reg: usize) {
        let holders = std::mem::take(&mut self.host[host_reg].holds);
        for &v in &holders {
            if regs[v].status == VRegStatus::Dirty {
                self.writeback(regs, buf, v, host_reg);
            }
            if regs[v].real_reg == host_reg as i16 {
                regs[v].status = VRegStatus::InMem;
                regs[v].real_reg = VRegState::UNALLOCATED;
                regs[v].val = 0;
            }
        }
    }

    /// Emits the store that reconciles virtual register `v`'s dirty bytes back to its canonical
    /// memory slot, honoring the lazy offset (`val`) and partial-dirty-width tracking.
    fn writeback(&mut self, regs: &mut [VRegState], buf: &mut Vec<u8>, v: usize, host_reg: usize) {
        let r = &regs[v];
        match r.needflush {
            NeedFlush::Scratch => {}
            NeedFlush::Handler => {
                // No ordinary memory slot; the caller (mid-layer) is responsible for routing
                // this virtual register's writeback through its recovery handler instead.
            }
            NeedFlush::ToMem => {
                debug_assert!(r.mem_offset >= 0, "ToMem vreg with no memory slot");
                let size = match r.dirtysize {
                    1 => Size::B,
                    2 => Size::W,
                    _ => Size::L,
                };
                let host = GpReg(host_reg as u8);
                if r.val != 0 {
                    // The true value is host_reg + val; realize it into the register before the
                    // store rather than teaching the store path about the offset.
                    let _ = x86_64::emit_alu_ri(buf, x86_64::AluOp::Add, Size::L, host, r.val as i64);
                }
                x86_64::emit_mov_mr(buf, size, Mem::disp(STATE_PTR_REG, r.mem_offset), host);
                if r.val != 0 {
                    let _ = x86_64::emit_alu_ri(buf, x86_64::AluOp::Sub, Size::L, host, r.val as i64);
                }
            }
        }
        regs[v].dirtysize = 0;
    }

    fn alloc_free_reg(&mut self, regs: &mut [VRegState], buf: &mut Vec<u8>) -> usize {
        if let Some(free) = self.host.iter().position(|s| s.holds.is_empty() && !s.locked) {
            return free;
        }
        let victim = self.pick_victim();
        self.evict(regs, buf, victim);
        victim
    }

    /// `readreg`: returns a host register holding at least `size` valid low bytes of `vreg`,
    /// locking it against eviction until [`Self::unlock`] is called.
    pub fn readreg(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        vreg: usize,
        size: Size,
    ) -> Result<GpReg, CompileError> {
        if regs[vreg].is_allocated() {
            let host_reg = regs[vreg].real_reg as usize;
            if regs[vreg].val != 0 {
                // Realize a pending offset before handing out the register for general use;
                // only writereg-style lazy updates are allowed to leave it outstanding.
                let delta = regs[vreg].val;
                let host = GpReg(host_reg as u8);
                let _ = x86_64::emit_alu_ri(buf, x86_64::AluOp::Add, Size::L, host, delta as i64);
                regs[vreg].val = 0;
                regs[vreg].validsize = 4;
            }
            if (regs[vreg].validsize as u32) < size.bits() / 8 {
                self.widen(regs, buf, vreg, size);
            }
            self.host[host_reg].locked = true;
            self.host[host_reg].touched = self.tick();
            return Ok(GpReg(host_reg as u8));
        }

        let host_reg = self.alloc_free_reg(regs, buf);
        let host = GpReg(host_reg as u8);

        match regs[vreg].status {
            VRegStatus::IsConst => {
                x86_64::emit_mov_ri(buf, Size::L, host, regs[vreg].val as i64)
                    .map_err(|_| CompileError::AllocatorInfeasible)?;
                regs[vreg].val = 0;
            }
            VRegStatus::InMem | VRegStatus::Undef => {
                debug_assert!(regs[vreg].mem_offset >= 0, "InMem vreg with no memory slot");
                x86_64::emit_mov_rm(buf, Size::L, host, Mem::disp(STATE_PTR_REG, regs[vreg].mem_offset));
            }
            VRegStatus::Clean | VRegStatus::Dirty => unreachable!("already handled by is_allocated branch"),
        }

        regs[vreg].status = VRegStatus::Clean;
        regs[vreg].real_reg = host_reg as i16;
        regs[vreg].validsize = 4;
        self.host[host_reg].holds.push(vreg);
        self.host[host_reg].locked = true;
        self.host[host_reg].touched = self.tick();
        let _ = size;
        Ok(host)
    }

    fn widen(&mut self, regs: &mut [VRegState], buf: &mut Vec<u8>, vreg: usize, size: Size) {
        let host_reg = regs[vreg].real_reg as usize;
        let host = GpReg(host_reg as u8);
        debug_assert!(regs[vreg].mem_offset >= 0);
        // Reload the full width from memory; any as-yet-unflushed dirty low bytes are still in
        // the register and untouched by a same-register load of the wider memory image... in
        // practice this path is only reached for Clean registers (Dirty registers are always
        // validsize 4 because partial writes immediately widen on write, see `rmw`).
        debug_assert_eq!(regs[vreg].status, VRegStatus::Clean);
        x86_64::emit_mov_rm(buf, Size::L, host, Mem::disp(STATE_PTR_REG, regs[vreg].mem_offset));
        regs[vreg].validsize = 4;
        let _ = size;
    }

    /// `writereg`: returns a host register to overwrite wholesale at `size`; the old contents
    /// are not preserved. Marks the virtual register dirty at `size` once the caller has emitted
    /// the defining instruction.
    pub fn writereg(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        vreg: usize,
        size: Size,
    ) -> Result<GpReg, CompileError> {
        let host_reg = if regs[vreg].is_allocated() {
            regs[vreg].real_reg as usize
        } else {
            let hr = self.alloc_free_reg(regs, buf);
            regs[vreg].real_reg = hr as i16;
            self.host[hr].holds.push(vreg);
            hr
        };

        // A fresh write invalidates every other alias of this host register, since they no
        // longer reflect what the register is about to hold.
        let others: Vec<usize> = self.host[host_reg]
            .holds
            .iter()
            .copied()
            .filter(|&v| v != vreg)
            .collect();
        for v in others {
            regs[v].status = VRegStatus::InMem;
            regs[v].real_reg = VRegState::UNALLOCATED;
        }
        self.host[host_reg].holds = vec![vreg];

        regs[vreg].status = VRegStatus::Dirty;
        regs[vreg].val = 0;
        regs[vreg].validsize = (size.bits() / 8) as u8;
        regs[vreg].dirtysize = (size.bits() / 8) as u8;

        self.host[host_reg].locked = true;
        self.host[host_reg].touched = self.tick();
        Ok(GpReg(host_reg as u8))
    }

    /// `rmw`: read-modify-write. Ensures `rsize` valid bits are loaded (like `readreg`), then
    /// marks `wsize` bits dirty once the caller's instruction has run (like `writereg`), without
    /// dropping validity of bits between `rsize` and `wsize` the way a fresh `writereg` would.
    pub fn rmw(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        vreg: usize,
        wsize: Size,
        rsize: Size,
    ) -> Result<GpReg, CompileError> {
        let host = self.readreg(regs, buf, vreg, rsize)?;
        let host_reg = host.0 as usize;
        regs[vreg].status = VRegStatus::Dirty;
        regs[vreg].dirtysize = regs[vreg].dirtysize.max((wsize.bits() / 8) as u8);
        regs[vreg].validsize = regs[vreg].validsize.max((wsize.bits() / 8) as u8);
        self.host[host_reg].touched = self.tick();
        Ok(host)
    }

    /// `readreg_specific`: like `readreg`, but demands a particular host register (used for
    /// fixed-register calling conventions around calls into the memory-access callbacks and
    /// interpreter fallback). Evicts whatever currently occupies `wanted` if necessary.
    pub fn readreg_specific(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        vreg: usize,
        size: Size,
        wanted: GpReg,
    ) -> Result<(), CompileError> {
        let wanted_idx = wanted.0 as usize;
        if regs[vreg].is_allocated() && regs[vreg].real_reg as usize == wanted_idx {
            self.host[wanted_idx].locked = true;
            self.host[wanted_idx].touched = self.tick();
            return Ok(());
        }

        if !self.host[wanted_idx].holds.is_empty() {
            self.evict(regs, buf, wanted_idx);
        }

        let current = self.readreg(regs, buf, vreg, size)?;
        if current != wanted {
            x86_64::emit_mov_rr(buf, size, wanted, current);
            self.unlock(current);
            self.host[wanted_idx].holds = vec![vreg];
            self.host[wanted_idx].locked = true;
            self.host[wanted_idx].touched = self.tick();
            regs[vreg].real_reg = wanted_idx as i16;
        }
        Ok(())
    }

    /// `writereg_specific`: like `writereg`, pinned to a particular host register.
    pub fn writereg_specific(
        &mut self,
        regs: &mut [VRegState],
        buf: &mut Vec<u8>,
        vreg: usize,
        size: Size,
        wanted: GpReg,
    ) -> Result<(), CompileError> {
        let wanted_idx = wanted.0 as usize;
        if !self.host[wanted_idx].holds.is_empty()
            && self.host[wanted_idx].holds != vec![vreg]
        {
            self.evict(regs, buf, wanted_idx);
        }
        regs[vreg].real_reg = wanted_idx as i16;
        self.host[wanted_idx].holds = vec![vreg];
        let _ = self.writereg(regs, buf, vreg, size)?;
        Ok(())
    }

    /// Releases the lock `readreg`/`writereg` placed on a host register, making it eligible for
    /// eviction again. Does not change its contents or ownership.
    pub fn unlock(&mut self, host_reg: GpReg) {
        self.host[host_reg.0 as usize].locked = false;
    }

    /// `flush`: writes back every dirty virtual register to memory. Called at block exits and
    /// ahead of calls into untranslated code, where nothing can be assumed about which host
    /// registers survive.
    pub fn flush(&mut self, regs: &mut [VRegState], buf: &mut Vec<u8>) {
        for host_reg in 0..self.host.len() {
            let holders = self.host[host_reg].holds.clone();
            for v in holders {
                if regs[v].status == VRegStatus::Dirty {
                    self.writeback(regs, buf, v, host_reg);
                    regs[v].status = VRegStatus::Clean;
                }
            }
        }
    }

    /// `forget_about`: drops any host-register association for `vreg` without writeback, used
    /// when the compile handler has proven the virtual register's current value is dead (e.g.
    /// the destination of a MOVE whose source is about to overwrite it).
    pub fn forget_about(&mut self, regs: &mut [VRegState], vreg: usize) {
        if regs[vreg].is_allocated() {
            let host_reg = regs[vreg].real_reg as usize;
            self.host[host_reg].holds.retain(|&v| v != vreg);
        }
        regs[vreg].status = VRegStatus::Undef;
        regs[vreg].real_reg = VRegState::UNALLOCATED;
        regs[vreg].val = 0;
        regs[vreg].validsize = 4;
        regs[vreg].dirtysize = 0;
    }

    /// Offset propagation (spec §4.2): absorbs `delta` into a live full-width Clean/Dirty
    /// virtual register's lazy offset instead of emitting an `add` immediately, returning `true`
    /// if it could. ADDQ/SUBQ to an address register that is never read before its next write
    /// can skip code generation entirely this way.
    pub fn add_offset(&mut self, regs: &mut [VRegState], vreg: usize, delta: i32) -> bool {
        if !regs[vreg].is_allocated() || regs[vreg].validsize != 4 {
            return false;
        }
        regs[vreg].val = regs[vreg].val.wrapping_add(delta);
        regs[vreg].status = VRegStatus::Dirty;
        regs[vreg].dirtysize = 4;
        true
    }
}

impl<B: Backend> Default for RegAlloc<B> {
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
    fn writereg_then_readreg_reuses_same_host_register() {
        let mut file = VRegFile::new();
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        let w = alloc.writereg(&mut file.gpr, &mut buf, 0, Size::L).unwrap();
        alloc.unlock(w);
        let r = alloc.readreg(&mut file.gpr, &mut buf, 0, Size::L).unwrap();

        assert_eq!(w, r);
    }

    #[test]
    fn const_vreg_materializes_on_readreg() {
        let mut file = VRegFile::new();
        file.gpr[0].status = VRegStatus::IsConst;
        file.gpr[0].val = 42;
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        let r = alloc.readreg(&mut file.gpr, &mut buf, 0, Size::L).unwrap();

        assert_eq!(file.gpr[0].status, VRegStatus::Clean);
        assert_eq!(file.gpr[0].real_reg, r.0 as i16);
        assert!(!buf.is_empty());
    }

    #[test]
    fn add_offset_is_absorbed_without_emitting_code() {
        let mut file = VRegFile::new();
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        let w = alloc.writereg(&mut file.gpr, &mut buf, 8, Size::L).unwrap();
        alloc.unlock(w);
        buf.clear();

        let absorbed = alloc.add_offset(&mut file.gpr, 8, 4);

        assert!(absorbed);
        assert!(buf.is_empty());
        assert_eq!(file.gpr[8].val, 4);
        assert_eq!(file.gpr[8].status, VRegStatus::Dirty);
    }

    #[test]
    fn readreg_realizes_pending_offset_before_handing_out_register() {
        let mut file = VRegFile::new();
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        let w = alloc.writereg(&mut file.gpr, &mut buf, 8, Size::L).unwrap();
        alloc.unlock(w);
        alloc.add_offset(&mut file.gpr, 8, 4);
        buf.clear();

        let _ = alloc.readreg(&mut file.gpr, &mut buf, 8, Size::L).unwrap();

        assert_eq!(file.gpr[8].val, 0);
        assert!(!buf.is_empty());
    }

    #[test]
    fn flush_writes_back_every_dirty_register() {
        let mut file = VRegFile::new();
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        let w = alloc.writereg(&mut file.gpr, &mut buf, 0, Size::L).unwrap();
        alloc.unlock(w);
        buf.clear();

        alloc.flush(&mut file.gpr, &mut buf);

        assert_eq!(file.gpr[0].status, VRegStatus::Clean);
        assert!(!buf.is_empty());
    }

    #[test]
    fn forget_about_drops_association_without_writeback() {
        let mut file = VRegFile::new();
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        let w = alloc.writereg(&mut file.gpr, &mut buf, 0, Size::L).unwrap();
        alloc.unlock(w);
        buf.clear();

        alloc.forget_about(&mut file.gpr, 0);

        assert!(buf.is_empty());
        assert!(!file.gpr[0].is_allocated());
    }

    #[test]
    fn eviction_spills_dirty_victim_before_reuse() {
        let mut file = VRegFile::new();
        let mut alloc = RegAlloc::<X86_64>::new();
        let mut buf = Vec::new();

        // Fill every host register with a dirty write, then demand one more: something must
        // be evicted and spilled.
        for v in 0..X86_64::NUM_HOST_REGS {
            let w = alloc.writereg(&mut file.gpr, &mut buf, v, Size::L).unwrap();
            alloc.unlock(w);
        }
        buf.clear();

        let extra_vreg = X86_64::NUM_HOST_REGS; // VREG_FLAGX, distinct from all the above.
        let _ = alloc.writereg(&mut file.gpr, &mut buf, extra_vreg, Size::L).unwrap();

        assert!(!buf.is_empty(), "eviction of a dirty register must emit a store");
    }
}
