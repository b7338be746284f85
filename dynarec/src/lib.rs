//! A block-caching dynamic recompiler core for guest CPU emulation.
//!
//! The embedding emulator implements [Guest] (instruction decoding, memory, exception delivery)
//! and builds a [Jit] with [JitBuilder]. The [Jit] then translates guest code into blocks on
//! demand, chains blocks together, keeps the cache coherent when guest code changes, and runs
//! the guest until told to stop.

#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::new_without_default)]

pub(crate) mod backpatch;
pub(crate) mod cache;
pub(crate) mod compile;
pub mod config;
mod dispatch;
#[cfg(unix)]
pub mod fastmem;
pub mod guest;
pub mod hle;
pub(crate) mod linker;
mod log;
pub(crate) mod regalloc;
#[cfg(test)]
pub(crate) mod testing;

pub use self::{
    cache::{BlockId, CompiledBlock, ExitLink},
    compile::CodeAddr,
    config::{BackendKind, JitBuilder},
    guest::{
        AccessWidth, AluOp, Cond, Decoded, Guest, GuestAddr, GuestException, GuestReg,
        GuestState, Inst, ShiftOp,
    },
    hle::{HookFn, HookKind},
};
use parking_lot::Mutex;
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Why a [Jit] could not do what it was asked to.
#[derive(Error, Debug)]
pub enum JitError {
    /// Generated code faulted in a way that could not be recovered from. The [Jit] stays halted
    /// until [Jit::reset].
    #[error("Halted: {0}")]
    Halted(HaltInfo),
    #[error("The JIT has been shut down")]
    ShutDown,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Cannot allocate code memory: {0}")]
    CodeMemory(io::Error),
    /// Something went wrong that is probably the result of a bug.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Where and why generated code faulted unrecoverably.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HaltInfo {
    /// The code address of the faulting instruction.
    pub native_addr: CodeAddr,
    /// The guest address of the block containing `native_addr`, if it is in a block.
    pub block: Option<GuestAddr>,
    /// The guest pc the dispatcher entered generated code at.
    pub pc: GuestAddr,
    pub reason: String,
}

impl fmt::Display for HaltInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault at {}", self.native_addr)?;
        if let Some(b) = self.block {
            write!(f, " in block {b:#x}")?;
        }
        write!(f, " (pc {:#x}): {}", self.pc, self.reason)
    }
}

/// How long [Jit::run] should run for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunLimit {
    /// Until stopped with a [StopHandle].
    Forever,
    /// At most this many returns to the dispatcher.
    Dispatches(u64),
}

/// Why [Jit::run] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    Stopped,
    LimitReached,
}

/// What a [Jit] is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// Not running.
    Idle,
    /// Between blocks: timing, exceptions, invalidation, lookup and translation.
    Dispatch,
    /// Running generated code.
    Execute,
    /// Generated code faulted and the fault is being handled.
    Faulted,
    /// An unrecoverable fault happened. Only [Jit::reset] leaves this state.
    Halted,
}

/// Asks a running [Jit] to return from [Jit::run]. The request is seen the next time the [Jit]
/// returns to its dispatcher.
#[derive(Clone, Debug)]
pub struct StopHandle(pub(crate) Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Queues guest code invalidations, typically from a thread emulating DMA. The queue is drained
/// the next time the [Jit] returns to its dispatcher.
#[derive(Clone, Debug)]
pub struct InvalidationHandle(pub(crate) Arc<Mutex<Vec<(GuestAddr, u32)>>>);

impl InvalidationHandle {
    /// Ask for every block overlapping `[start, start + len)` to be evicted.
    pub fn invalidate(&self, start: GuestAddr, len: u32) {
        self.0.lock().push((start, len));
    }
}

/// A snapshot of a [Jit]'s cache and counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    /// The number of blocks in the cache.
    pub occupancy: usize,
    pub capacity: usize,
    /// Code buffer use, in the backend's units (bytes, or ops).
    pub code_used: usize,
    pub code_capacity: usize,
    pub lookups: u64,
    pub translations: u64,
    pub cache_clears: u64,
    pub blocks_invalidated: u64,
    pub faults_handled: u64,
    /// Per-block data, sorted by guest address. Run counts are only gathered if profiling was
    /// enabled with [JitBuilder::profiling].
    pub blocks: Vec<BlockProfile>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockProfile {
    pub start: GuestAddr,
    pub num_insts: u32,
    pub run_count: u64,
}

/// A recompiler driving one guest core.
pub trait Jit<G: Guest> {
    /// Run the guest until `limit` is reached or a [StopHandle] asks it to stop.
    fn run(&mut self, limit: RunLimit) -> Result<RunExit, JitError>;
    /// Perform one dispatch: look up (or translate) and run the block at the current pc.
    fn single_step(&mut self) -> Result<(), JitError>;

    /// Translate the block at `addr` if it is not already cached. Returns `None` if the first
    /// instruction cannot be decoded.
    fn translate(&mut self, addr: GuestAddr) -> Result<Option<BlockId>, JitError>;
    /// Find the cached block starting at `addr`.
    fn lookup(&mut self, addr: GuestAddr) -> Option<BlockId>;
    fn block(&self, id: BlockId) -> Option<&CompiledBlock>;
    /// Where does exit `idx` of block `id` currently lead? `None` means the dispatcher.
    fn exit_target(&self, id: BlockId, idx: usize) -> Option<CodeAddr>;
    /// Link exit `idx` of block `id` to its target, if the target is cached.
    fn link_exit(&mut self, id: BlockId, idx: usize) -> bool;
    fn unlink_exit(&mut self, id: BlockId, idx: usize);

    /// Evict every block overlapping `[start, start + len)`. Must not be called while guest code
    /// runs: other threads should use an [InvalidationHandle].
    fn invalidate_range(&mut self, start: GuestAddr, len: u32);
    fn invalidation_handle(&self) -> InvalidationHandle;
    fn stop_handle(&self) -> StopHandle;
    /// Hook the guest code at `addr`. Any block containing `addr` is evicted.
    fn register_hook(&mut self, addr: GuestAddr, kind: HookKind, f: HookFn<G>);
    fn clear_cache(&mut self);

    /// Clear the cache and the guest state, and restart at `pc`. This is the only way out of
    /// [DispatchState::Halted].
    fn reset(&mut self, pc: GuestAddr);
    /// Release the cache. Afterwards [Jit::run] fails with [JitError::ShutDown].
    fn shutdown(&mut self);

    fn profile(&self) -> Profile;
    fn status(&self) -> DispatchState;
    fn backend(&self) -> BackendKind;
    fn state(&self) -> &GuestState;
    fn state_mut(&mut self) -> &mut GuestState;
    fn guest(&self) -> &G;
    fn guest_mut(&mut self) -> &mut G;
}
