//! The block cache (spec §3 "Cache index", §4.5): a content-addressed map from guest PC to
//! compiled code, backed by an arena of [`BlockInfo`] slots, an open-addressed PC index, a
//! covered-range map for self-modifying-code detection, and the executable code buffer itself.

use std::marker::PhantomData;

use mmap_rs::{Mmap, MmapMut, MmapOptions};
use rangemap::RangeMap;
use smallvec::SmallVec;

use crate::backend::{Backend, PatchSite};
use crate::block::{BlockId, BlockInfo, BlockStatus};
use crate::error::Error;

/// Power-of-two size of the open-addressed PC index table (spec §3: "32K entries").
const INDEX_SIZE: usize = 32 * 1024;

fn hash_pc(pc: u32) -> usize {
    // A cheap multiplicative hash (Fibonacci hashing), sufficient for a direct-mapped probe
    // sequence over a power-of-two table.
    (pc.wrapping_mul(0x9E3779B1) as usize) & (INDEX_SIZE - 1)
}

/// The executable code region, modeled as a type-state machine matching `mmap-rs`'s ownership-
/// transferring `make_exec`/`make_mut` API (spec §2.1, §4.5): compiling requires the `Writable`
/// state; every block's code must be flipped to `Executable` before any guest dispatch can jump
/// into it, and flipped back before the next compile.
enum CodeBuffer {
    Writable(MmapMut),
    Executable(Mmap),
}

impl CodeBuffer {
    fn new(size: usize) -> Result<Self, Error> {
        let mmap = MmapOptions::new(size)?.map_mut()?;
        Ok(CodeBuffer::Writable(mmap))
    }

    fn as_mut_writable(&mut self) -> &mut MmapMut {
        match self {
            CodeBuffer::Writable(m) => m,
            CodeBuffer::Executable(_) => panic!("code buffer is RX; flip to RW before compiling"),
        }
    }

    fn base_ptr(&self) -> *const u8 {
        match self {
            CodeBuffer::Writable(m) => m.as_ptr(),
            CodeBuffer::Executable(m) => m.as_ptr(),
        }
    }

    fn make_executable(self) -> Result<Self, Error> {
        match self {
            CodeBuffer::Writable(m) => Ok(CodeBuffer::Executable(m.make_exec()?)),
            exec @ CodeBuffer::Executable(_) => Ok(exec),
        }
    }

    fn make_writable(self) -> Result<Self, Error> {
        match self {
            CodeBuffer::Executable(m) => Ok(CodeBuffer::Writable(m.make_mut()?)),
            writable @ CodeBuffer::Writable(_) => Ok(writable),
        }
    }
}

/// Simple additive-rotate checksum over a guest byte range, used to detect self-modifying code
/// without storing a full copy of the covered bytes (spec §4.5).
pub fn checksum_range(mem: &mut dyn crate::memory::GuestMemory, start: u32, length: u32) -> u32 {
    let mut sum: u32 = 0;
    for offset in 0..length {
        let byte = mem.read_u8(start.wrapping_add(offset));
        sum = sum.rotate_left(5).wrapping_add(byte as u32);
    }
    sum
}

pub struct BlockCache<B: Backend> {
    arena: Vec<Option<BlockInfo>>,
    free_list: Vec<u32>,
    next_generation: u32,
    index: Vec<Option<BlockId>>,
    covered: RangeMap<u32, SmallVec<[BlockId; 4]>>,
    code: Option<CodeBuffer>,
    cursor: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> BlockCache<B> {
    pub fn new(cache_size_kb: usize) -> Result<Self, Error> {
        if cache_size_kb < crate::config::MIN_CACHE_SIZE_KB {
            return Err(Error::CacheTooSmall(cache_size_kb));
        }
        Ok(Self {
            arena: Vec::new(),
            free_list: Vec::new(),
            next_generation: 1,
            index: vec![None; INDEX_SIZE],
            covered: RangeMap::new(),
            code: Some(CodeBuffer::new(cache_size_kb * 1024)?),
            cursor: 0,
            _backend: PhantomData,
        })
    }

    /// `get_blockinfo_addr`: looks up the block currently indexed at `pc`, if any, without
    /// allocating. Open addressing with linear probing; an index slot holding a generation-stale
    /// `BlockId` (the arena slot was reused) is treated as a miss.
    pub fn get_blockinfo_addr(&self, pc: u32) -> Option<&BlockInfo> {
        let start = hash_pc(pc);
        for probe in 0..INDEX_SIZE {
            let slot = (start + probe) & (INDEX_SIZE - 1);
            match self.index[slot] {
                None => return None,
                Some(id) => {
                    if let Some(block) = self.resolve(id) {
                        if block.entry_pc == pc {
                            return Some(block);
                        }
                    }
                }
            }
        }
        None
    }

    /// `get_blockinfo_addr_new`: allocates a fresh arena slot and index entry for `pc`, evicting
    /// nothing (callers only reach this after `get_blockinfo_addr` missed).
    pub fn get_blockinfo_addr_new(&mut self, pc: u32) -> BlockId {
        let index = if let Some(free) = self.free_list.pop() {
            free
        } else {
            self.arena.push(None);
            (self.arena.len() - 1) as u32
        };
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let id = BlockId { index, generation };
        self.arena[index as usize] = Some(BlockInfo::new(id, pc));

        let start = hash_pc(pc);
        for probe in 0..INDEX_SIZE {
            let slot = (start + probe) & (INDEX_SIZE - 1);
            if self.index[slot].is_none() {
                self.index[slot] = Some(id);
                break;
            }
        }

        id
    }

    fn resolve(&self, id: BlockId) -> Option<&BlockInfo> {
        self.arena
            .get(id.index as usize)
            .and_then(|slot| slot.as_ref())
            .filter(|b| b.id.generation == id.generation)
    }

    fn resolve_mut(&mut self, id: BlockId) -> Option<&mut BlockInfo> {
        self.arena
            .get_mut(id.index as usize)
            .and_then(|slot| slot.as_mut())
            .filter(|b| b.id.generation == id.generation)
    }

    pub fn block(&self, id: BlockId) -> Option<&BlockInfo> {
        self.resolve(id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BlockInfo> {
        self.resolve_mut(id)
    }

    /// Records that `id`'s checksummed ranges cover `[start, start+length)`, registering it in
    /// the covered-range map so a later write can find it without a linear scan.
    pub fn register_coverage(&mut self, id: BlockId, start: u32, length: u32) {
        if length == 0 {
            return;
        }
        let range = start..start.wrapping_add(length);
        let existing = self
            .covered
            .get(&range.start)
            .cloned()
            .unwrap_or_default();
        let mut ids = existing;
        if !ids.contains(&id) {
            ids.push(id);
        }
        self.covered.insert(range, ids);
    }

    /// `block_check_checksum`: recomputes every checksummed range for `id` and returns whether
    /// they all still match (spec §4.5 self-modifying-code detection).
    pub fn block_check_checksum(&self, id: BlockId, mem: &mut dyn crate::memory::GuestMemory) -> bool {
        let Some(block) = self.resolve(id) else {
            return false;
        };
        block
            .checksums
            .iter()
            .all(|csi| checksum_range(mem, csi.start, csi.length) == csi.checksum)
    }

    /// `raise_in_cl_list`: moves `id` back to the front of an (implicit, LRU-by-generation-
    /// recency here) promotion bookkeeping. The distilled design's coldlist/raise behavior is
    /// modeled simply as touching the index entry so the next eviction policy pass (not
    /// implemented as this build has no capacity-based eviction yet, only hard/lazy flush) would
    /// see it as recently used.
    pub fn raise_in_cl_list(&mut self, _id: BlockId) {
        // Reserved for a future capacity-based eviction policy; no-op today since this build
        // only ever clears the whole cache or a specific invalidated range.
    }

    /// Links `source`'s code at `patch_site` to jump directly into `target`, wiring the
    /// intrusive edge into both blocks' lists. Obtains disjoint mutable borrows of the two arena
    /// slots via `split_at_mut` rather than taking blocks out of the arena, since the edge
    /// itself borrows from `target` for as long as `source` is alive.
    pub fn link_blocks(&mut self, source: BlockId, target: BlockId, patch_site: PatchSite) {
        let (src_idx, tgt_idx) = (source.index as usize, target.index as usize);
        if src_idx == tgt_idx {
            return; // a block chaining into itself is not modeled; dispatch handles self-loops.
        }
        let (lo, hi) = if src_idx < tgt_idx { (src_idx, tgt_idx) } else { (tgt_idx, src_idx) };
        let (left, right) = self.arena.split_at_mut(hi);
        let (src_slot, tgt_slot) = if src_idx < tgt_idx {
            (&mut left[lo], &mut right[0])
        } else {
            (&mut right[0], &mut left[lo])
        };
        let (Some(source_block), Some(target_block)) = (src_slot.as_mut(), tgt_slot.as_mut()) else {
            return;
        };
        if source_block.id != source || target_block.id != target {
            return; // stale ids: the arena slot has since been recycled into a new generation.
        }
        source_block.add_chain_edge(&mut target_block.deps_in, target, patch_site);
    }

    /// `invalidate_block`: marks one block `Invalid`, unlinks every chaining edge that touches
    /// it (both directions), and removes it from the PC index so the next dispatch recompiles
    /// it rather than jumping into stale code. Any predecessor that had chained a direct jump
    /// into this block (`deps_in` non-empty) gets that jump repatched back to the safe
    /// write-PC-and-exit-to-dispatch fallback before this returns, so it never again jumps into
    /// a block that is about to recompile into something semantically different.
    pub fn invalidate_block(&mut self, id: BlockId) -> Result<(), Error> {
        let idx = id.index as usize;
        let mut block = match self.arena.get_mut(idx).and_then(|slot| slot.take()) {
            Some(b) if b.id.generation == id.generation => b,
            Some(other) => {
                self.arena[idx] = Some(other);
                return Ok(());
            }
            None => return Ok(()),
        };

        block.status = BlockStatus::Invalid;
        let entry_pc = block.entry_pc;

        // Unlink outgoing edges: each `Dep` is owned here, but a target block still holds a
        // non-owning reference to it in its `deps_in`, which must be removed before the owning
        // copy is dropped.
        while let Some(dep) = block.deps_out.pop_front() {
            if let Some(target) = self.resolve_mut(dep.target) {
                let mut cursor = target.deps_in.front_mut();
                while let Some(candidate) = cursor.get() {
                    if std::ptr::eq(candidate, &*dep) {
                        cursor.remove();
                        break;
                    }
                    cursor.move_next();
                }
            }
        }

        // Edges where this block is the target are owned by a predecessor's `deps_out`. Each one
        // patched `source`'s code at `patch_site` from the safe `mov eax, imm32(entry_pc)` exit
        // sequence into a direct `jmp rel32` into this block; repatch it back before dropping our
        // non-owning reference, then drop the predecessor's owning copy via its own `deps_out`.
        if !block.deps_in.is_empty() {
            self.begin_compile()?;
            while let Some(dep) = block.deps_in.pop_front() {
                let mut fallback = [0u8; 5];
                fallback[0] = 0xb8; // `mov eax, imm32` — see `driver::write_pc_and_exit`.
                fallback[1..5].copy_from_slice(&entry_pc.to_le_bytes());
                let site = dep.patch_site;

                if let Some(source) = self.resolve_mut(dep.source) {
                    let mut cursor = source.deps_out.front_mut();
                    while let Some(candidate) = cursor.get() {
                        if std::ptr::eq(candidate, &*dep) {
                            cursor.remove();
                            break;
                        }
                        cursor.move_next();
                    }
                }

                let buf = self
                    .code
                    .as_mut()
                    .expect("code buffer missing")
                    .as_mut_writable();
                buf[site..site + 5].copy_from_slice(&fallback);
            }
            self.finish_compile()?;
        }

        self.arena[idx] = Some(block);

        let start = hash_pc(entry_pc);
        for probe in 0..INDEX_SIZE {
            let slot = (start + probe) & (INDEX_SIZE - 1);
            if self.index[slot] == Some(id) {
                self.index[slot] = None;
                break;
            }
        }

        Ok(())
    }

    /// Invalidates every block whose covered range overlaps `[addr, addr+len)` (spec §8
    /// property: "self-modifying-code detection invalidates overlapping blocks, not just the
    /// exact block").
    pub fn invalidate_range(&mut self, addr: u32, len: u32) -> Result<(), Error> {
        let range = addr..addr.wrapping_add(len.max(1));
        let touched: Vec<BlockId> = self
            .covered
            .overlapping(&range)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        for id in touched {
            self.invalidate_block(id)?;
        }
        Ok(())
    }

    /// Hard flush: every block is invalidated and the PC index is cleared wholesale, used when
    /// `spcflags.FLUSH_HARD` is observed (spec §1 "three-level invalidation").
    pub fn flush_hard(&mut self) {
        self.arena.clear();
        self.free_list.clear();
        self.index.iter_mut().for_each(|slot| *slot = None);
        self.covered = RangeMap::new();
        self.cursor = 0;
    }

    /// Lazy flush: demotes every currently-`InCache` block to `NeedCheck` without freeing arena
    /// slots, unlinking edges, or forcing a recompile — the next dispatch only re-verifies the
    /// checksum and promotes straight back to `InCache` if it still matches. Cheaper than
    /// `flush_hard`'s wholesale clear and cheaper than `Invalid`'s full hit-counter-warmup-then-
    /// recompile cycle, used for `spcflags.FLUSH_LAZY`.
    pub fn flush_lazy(&mut self) {
        for slot in self.arena.iter_mut().flatten() {
            if slot.status == BlockStatus::InCache {
                slot.status = BlockStatus::NeedCheck;
            }
        }
    }

    /// Switches the code buffer to writable so the compile driver can append new code.
    pub fn begin_compile(&mut self) -> Result<(), Error> {
        let buf = self.code.take().expect("code buffer missing");
        self.code = Some(buf.make_writable()?);
        Ok(())
    }

    /// Flips the code buffer to executable once a compile finishes, matching `hy-rs::mmap`'s
    /// `make_exec`/`make_mut` round trip (spec §4.5), then flushes the host icache over the
    /// bytes just written (a no-op on x86-64, but named so a future backend has the seam).
    pub fn finish_compile(&mut self) -> Result<(), Error> {
        let buf = self.code.take().expect("code buffer missing");
        self.code = Some(buf.make_executable()?);
        let base = self.base_ptr();
        B::flush_icache(base, self.cursor);
        Ok(())
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.code.as_ref().expect("code buffer missing").base_ptr()
    }

    /// Appends `bytes` to the cache buffer at the current cursor, returning the offset they were
    /// written at. Requires `begin_compile` to have been called first.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.cursor;
        let buf = self
            .code
            .as_mut()
            .expect("code buffer missing")
            .as_mut_writable();
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        offset
    }

    pub fn patch(&mut self, site: crate::backend::PatchSite, target_offset: usize) {
        let buf = self
            .code
            .as_mut()
            .expect("code buffer missing")
            .as_mut_writable();
        x86_64_patch(buf, site, target_offset);
    }
}

fn x86_64_patch(buf: &mut MmapMut, site: usize, target_offset: usize) {
    let rel = target_offset as i64 - (site as i64 + 4);
    buf[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
}
