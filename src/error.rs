//! Error types for the crate, following the [`thiserror`] convention used throughout.

use thiserror::Error;

/// Process-level errors: setup and teardown failures that the embedder must handle.
///
/// Translation-layer failures never surface here; see [`CompileError`] for those.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to map the executable code cache.
    #[error("failed to map jit code cache")]
    Mmap(#[from] mmap_rs::error::Error),
    /// Wraps I/O errors encountered while setting up the cache or popall page.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// `cachesize` was below the minimum required for the JIT to engage.
    #[error("cache size {0} KB is below the minimum of {min} KB", min = crate::config::MIN_CACHE_SIZE_KB)]
    CacheTooSmall(usize),
}

/// Block-scoped compile failures. These never propagate to the embedder: on `Err`, the
/// compile driver discards the partial block and the guest PC re-enters the interpreter.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CompileError {
    /// An immediate value did not fit the field width of the instruction being encoded.
    #[error("immediate value out of range for encoding")]
    ImmediateOutOfRange,
    /// The requested register class has no free or evictable member.
    #[error("register allocator could not satisfy request")]
    AllocatorInfeasible,
    /// The cache ran out of space for this block.
    #[error("code cache exhausted")]
    CacheExhausted,
    /// The trace's opcode has no compile handler and no fallback could be emitted.
    #[error("opcode not translatable")]
    Untranslatable,
}
