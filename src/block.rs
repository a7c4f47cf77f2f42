//! Block metadata (spec §3 "Block"). A `BlockInfo` describes one translated region: where its
//! code lives in the cache buffer, which guest byte ranges it was compiled from (for checksum
//! invalidation), and its chaining edges to/from other blocks.

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};
use num_derive::FromPrimitive;

use crate::backend::PatchSite;
use crate::flags::Validity;

/// A safe stand-in for the reference's raw `BasicBlock *`: an arena slot index plus a generation
/// counter, so a `BlockId` captured before an invalidation cannot be mistaken for whatever block
/// later occupies the same slot (spec §3, §9 "Arena + back-edges").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub index: u32,
    pub generation: u32,
}

/// Lifecycle state of one arena slot (spec §2.1: enum-with-repr + `FromPrimitive`, matching the
/// teacher's `Vmcs`/`VmxReason` convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum BlockStatus {
    /// The slot holds no block.
    Empty,
    /// Compiled, checksummed, and reachable from the cache index.
    InCache,
    /// A lazy flush touched this block without proving its covered range actually changed; the
    /// next dispatch only needs to re-verify the checksum and, if it still matches, promote back
    /// to `InCache` rather than pay for a full recompile.
    NeedCheck,
    /// A write touched this block's covered range; it must recompile before its next dispatch.
    Invalid,
}

/// One contiguous guest byte range this block's correctness depends on, with the checksum
/// computed over it at compile time (spec §3 "Cache index" / §4.5 self-modifying-code detection).
#[derive(Debug, Clone, Copy)]
pub struct ChecksumInfo {
    pub start: u32,
    pub length: u32,
    pub checksum: u32,
}

/// A chaining edge: `source`'s compiled code, at `patch_site`, jumps directly into `target`
/// rather than back through dispatch. Carries two intrusive links so it can live in both
/// endpoints' edge lists at once (spec §4.5/§9: "either endpoint's invalidation can unlink its
/// own edges in O(1)").
pub struct Dep {
    out_link: LinkedListLink,
    in_link: LinkedListLink,
    pub source: BlockId,
    pub target: BlockId,
    pub patch_site: PatchSite,
}

intrusive_adapter!(pub OutAdapter = Box<Dep>: Dep { out_link: LinkedListLink });
intrusive_adapter!(pub InAdapter = UnsafeRef<Dep>: Dep { in_link: LinkedListLink });

/// Metadata for one translated region (spec §3 "Block").
pub struct BlockInfo {
    pub id: BlockId,
    pub status: BlockStatus,
    /// Guest PC this block was compiled from; the cache index key.
    pub entry_pc: u32,
    /// Byte offset into the cache buffer of the PC-indexed (checked) entry point, reached via
    /// the dispatch table and always conservative about incoming flag state.
    pub handler_offset: usize,
    /// Byte offset of the direct-chain entry point, reachable only from a predecessor this
    /// compile observed and proved a matching `flags_in_flags` state for (spec §9: block-
    /// boundary flag-state matching is otherwise not attempted).
    pub direct_handler_offset: usize,
    pub code_len: usize,
    pub checksums: Vec<ChecksumInfo>,
    /// Edges where this block is the source, owned here.
    pub deps_out: LinkedList<OutAdapter>,
    /// Edges where this block is the target, referencing the same `Dep` nodes owned by a
    /// predecessor's `deps_out`.
    pub deps_in: LinkedList<InAdapter>,
    pub entry_flags_in_flags: Validity,
}

impl BlockInfo {
    pub fn new(id: BlockId, entry_pc: u32) -> Self {
        Self {
            id,
            status: BlockStatus::Empty,
            entry_pc,
            handler_offset: 0,
            direct_handler_offset: 0,
            code_len: 0,
            checksums: Vec::new(),
            deps_out: LinkedList::new(OutAdapter::new()),
            deps_in: LinkedList::new(InAdapter::new()),
            entry_flags_in_flags: Validity::Trash,
        }
    }

    /// Links `self -> target` as a chained jump. The `Dep` is owned by `self.deps_out`; `target`
    /// only ever sees it through an `UnsafeRef` in its `deps_in`, which is valid as long as
    /// `self` outlives `target`'s reference to it — guaranteed here because unlinking a block
    /// always walks its own `deps_out` and removes the matching `deps_in` entries first
    /// (see [`crate::cache::BlockCache::invalidate_block`]).
    pub fn add_chain_edge(&mut self, target_deps_in: &mut LinkedList<InAdapter>, target: BlockId, patch_site: PatchSite) {
        let dep = Box::new(Dep {
            out_link: LinkedListLink::new(),
            in_link: LinkedListLink::new(),
            source: self.id,
            target,
            patch_site,
        });
        // SAFETY: `dep` is about to be pushed into `self.deps_out`, which owns it for the rest
        // of its lifetime; the `UnsafeRef` handed to `target_deps_in` is a second, non-owning
        // view of the same allocation and is removed before the owning list drops it.
        let shared = unsafe { UnsafeRef::from_raw(&*dep as *const Dep) };
        self.deps_out.push_back(dep);
        target_deps_in.push_back(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_block_has_no_edges() {
        let block = BlockInfo::new(BlockId { index: 0, generation: 0 }, 0x1000);
        assert!(block.deps_out.is_empty());
        assert!(block.deps_in.is_empty());
        assert_eq!(block.status, BlockStatus::Empty);
    }

    #[test]
    fn chain_edge_appears_in_both_lists() {
        let mut source = BlockInfo::new(BlockId { index: 0, generation: 0 }, 0x1000);
        let mut target = BlockInfo::new(BlockId { index: 1, generation: 0 }, 0x2000);

        source.add_chain_edge(&mut target.deps_in, target.id, 42);

        assert_eq!(source.deps_out.iter().count(), 1);
        assert_eq!(target.deps_in.iter().count(), 1);
        assert_eq!(target.deps_in.front().get().unwrap().patch_site, 42);

        // Drop target's (non-owning) list before source's (owning) list to respect the
        // documented invariant above.
        while target.deps_in.pop_front().is_some() {}
    }
}
