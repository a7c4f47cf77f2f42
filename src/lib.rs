//! `m68k-jit`: a dynamic binary translator from Motorola 68k machine code to x86-64 host code,
//! embedded inside a 68k CPU emulator (spec §1 OVERVIEW).
//!
//! An embedder owns a [`JitEngine`], feeds it a [`GuestState`], a [`memory::GuestMemory`]
//! implementation, and an [`interp::InterpreterFallback`] for the opcodes this build's compile
//! handlers don't cover, and calls [`JitEngine::enter`] in its own run loop. See `demos/` for a
//! minimal embedding.

pub mod backend;
pub mod block;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod flags;
pub mod guest;
pub mod handlers;
pub mod interp;
pub mod memory;
pub mod midlayer;
pub mod regalloc;
pub mod trace;
pub mod vreg;

pub use backend::x86_64::X86_64;
pub use backend::{Backend, HostFeatures};
pub use config::JitConfig;
pub use engine::JitEngine;
pub use error::{CompileError, Error};
pub use guest::{Ccr, GuestState, SpecialFlags};
pub use interp::{FallbackOutcome, InterpreterFallback, UnreachableFallback};
pub use memory::{FlatMemory, GuestMemory};

/// The concrete engine type most embedders want: the x86-64 backend, which is the only one this
/// build ships (spec §9 "single target host ISA").
pub type X86_64JitEngine = JitEngine<X86_64>;
