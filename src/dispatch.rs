//! Dispatch stubs (spec §4.7): the `popall_*` prologue/epilogue glue emitted once, at
//! [`crate::JitEngine::new`] time, into a dedicated RX page. Every exit from compiled code back
//! to the outer loop, and every entry into it, passes through one of these.

use mmap_rs::{Mmap, MmapMut, MmapOptions};

use crate::backend::x86_64::{self, GpReg};
use crate::backend::Size;
use crate::error::Error;

/// Byte offsets of each stub within the popall page, resolved once at construction.
#[derive(Debug, Clone, Copy)]
pub struct DispatchStubs {
    /// Entry point from the embedder: saves callee-preserved host registers, loads the guest
    /// state pointer, and jumps into the PC-indexed handler table. The Rust analogue of
    /// `pushall_call_handler`.
    pub enter_offset: usize,
    /// Exit point compiled blocks jump to when `spcflags` is non-zero at a checked boundary:
    /// restores callee-preserved registers and returns control to [`crate::JitEngine::enter`].
    pub exit_offset: usize,
    len: usize,
}

/// Which host GPR is reserved to carry the `&GuestState` pointer across compiled code (spec §9:
/// "the dispatch stubs embed `&JitEngine as *const _`/state pointer as an absolute immediate").
pub const STATE_PTR_REG: GpReg = GpReg::R15;

fn emit_enter_stub(buf: &mut Vec<u8>) {
    // Save callee-saved registers we are about to clobber (System V AMD64 ABI: rbx, rbp,
    // r12-r15), matching `hy-rs`'s save/restore framing around its VM-entry trampoline.
    for reg in [GpReg::Rbx, GpReg::Rbp, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15] {
        x86_64::emit_push_r(buf, reg);
    }
    // System V: first argument (the `&mut GuestState`) arrives in RDI; keep it pinned in R15
    // for the lifetime of the dispatch loop.
    x86_64::emit_mov_rr(buf, Size::Q, STATE_PTR_REG, GpReg::Rdi);
    // Jump through the handler pointer the caller placed in RSI (second argument): the resolved
    // `BlockInfo::handler_offset` address for the current PC.
    x86_64::emit_jmp_indirect_r(buf, GpReg::Rsi);
}

fn emit_exit_stub(buf: &mut Vec<u8>) {
    for reg in [GpReg::R15, GpReg::R14, GpReg::R13, GpReg::R12, GpReg::Rbp, GpReg::Rbx] {
        x86_64::emit_pop_r(buf, reg);
    }
    x86_64::emit_ret(buf);
}

impl DispatchStubs {
    /// Emits the stubs into a fresh RW mapping and flips it to RX, returning both the stub
    /// offsets and the mapping itself (kept alive by the caller for the engine's lifetime).
    pub fn build() -> Result<(Self, Mmap), Error> {
        let mut code = Vec::new();

        let enter_offset = code.len();
        emit_enter_stub(&mut code);
        let exit_offset = code.len();
        emit_exit_stub(&mut code);

        const PAGE_SIZE: usize = 4096;
        let len = code.len().max(1);
        let mapped_len = ((len + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE;

        let mut mapping: MmapMut = MmapOptions::new(mapped_len)?.map_mut()?;
        mapping[..code.len()].copy_from_slice(&code);
        let mapping = mapping.make_exec()?;

        Ok((
            Self {
                enter_offset,
                exit_offset,
                len,
            },
            mapping,
        ))
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
