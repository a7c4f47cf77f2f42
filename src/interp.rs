//! The interpreter fallback contract (spec §6). Each guest opcode has a handler in the
//! surrounding emulator; a compiled block that contains an untranslated opcode calls through
//! this trait instead of emitting native code for it.

use crate::guest::GuestState;
use crate::memory::GuestMemory;

/// What happened after the interpreter executed one fallback instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// Execution should continue into the next instruction in the same block.
    Continue,
    /// The instruction altered control flow (branch, trap, etc.); the compiled block must exit
    /// back to dispatch rather than falling through to the next compiled instruction.
    ExitBlock,
}

/// Implemented by the surrounding emulator's interpreter core.
pub trait InterpreterFallback<M: GuestMemory> {
    /// Executes exactly one guest instruction at `state.pc_p` against `memory`, advancing
    /// `state.pc_p`/`state.pc` past it.
    fn execute(&mut self, state: &mut GuestState, memory: &mut M, opcode: u16) -> FallbackOutcome;
}

/// A no-op fallback used only where a trace is guaranteed to be fully covered by compile
/// handlers (tests exercising a single mid-layer operation in isolation).
pub struct UnreachableFallback;

impl<M: GuestMemory> InterpreterFallback<M> for UnreachableFallback {
    fn execute(&mut self, _state: &mut GuestState, _memory: &mut M, opcode: u16) -> FallbackOutcome {
        panic!("interpreter fallback invoked for opcode {opcode:#06x} with no interpreter wired up");
    }
}
