//! Code generation: the interface every backend implements, and the translator which drives it.
//!
//! A backend plays two roles. As an [Emitter] it turns the translator's small vocabulary of
//! operations into code for one block at a time. As a [Backend] it owns the code buffer those
//! blocks live in, patches their exits, and executes them. The rest of the crate only sees these
//! two traits.

use crate::{
    cache::BlockId,
    config::BackendKind,
    guest::{AccessWidth, AluOp, Cond, Guest, GuestAddr, GuestException, GuestState, ShiftOp},
    hle::{HookId, HookTable},
};
use std::{fmt, ops::Range};
use thiserror::Error;

pub(crate) mod ops;
pub(crate) mod translate;
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub(crate) mod x64;

/// A failure to translate a block.
#[derive(Error, Debug)]
pub(crate) enum CompilationError {
    /// The block slot table or the code buffer is full. The cache must be flushed before
    /// translation can be retried.
    #[error("Cache full")]
    CacheFull,
    /// Something went wrong when translating that is probably the result of a bug.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// An address in a backend's code buffer. For native backends this is a host address; for the
/// op-stream backend it is an index into the op buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeAddr(pub usize);

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The maximum number of host registers any backend exposes to the register allocator.
pub(crate) const MAX_HOST_REGS: usize = 16;

/// A host register that the register allocator can hand out.
pub(crate) trait HostReg: Copy + fmt::Debug + fmt::Display + PartialEq + Eq + 'static {
    /// A dense index, unique per register, less than [MAX_HOST_REGS].
    fn idx(self) -> usize;
}

/// The operations a backend must be able to emit.
///
/// All values are 32 bits wide unless stated otherwise; a register holding a 32-bit value always
/// has its upper bits clear.
pub(crate) trait Emitter {
    type Reg: HostReg;
    type Label: Copy + fmt::Debug;

    /// The registers the allocator may hand out, in order of preference.
    fn allocatable(&self) -> &'static [Self::Reg];

    /// Load the guest state field at `off` (64 bits if `wide`) into `dst`.
    fn load_state(&mut self, dst: Self::Reg, off: u32, wide: bool);
    fn store_state(&mut self, src: Self::Reg, off: u32, wide: bool);
    fn copy(&mut self, dst: Self::Reg, src: Self::Reg, wide: bool);
    /// `dst = (src >> shift) as u32` where `src` is 64 bits wide.
    fn extract(&mut self, dst: Self::Reg, src: Self::Reg, shift: u8);

    fn mov_imm(&mut self, dst: Self::Reg, imm: u32);
    fn alu(&mut self, op: AluOp, dst: Self::Reg, a: Self::Reg, b: Self::Reg);
    fn add_imm(&mut self, dst: Self::Reg, a: Self::Reg, imm: i32);
    fn shift_imm(&mut self, op: ShiftOp, dst: Self::Reg, a: Self::Reg, amount: u8);
    /// `acc += zext(a) * zext(b)` where `acc` is 64 bits wide.
    fn mul_acc(&mut self, acc: Self::Reg, a: Self::Reg, b: Self::Reg);

    /// Load from guest memory at `base + offset`. The access is a backpatch site: it must be
    /// registered so that a fault on it can later be rewritten into a slow-path call.
    fn guest_load(
        &mut self,
        pc: GuestAddr,
        dst: Self::Reg,
        base: Self::Reg,
        offset: i16,
        width: AccessWidth,
        signed: bool,
    );
    fn guest_store(
        &mut self,
        pc: GuestAddr,
        src: Self::Reg,
        base: Self::Reg,
        offset: i16,
        width: AccessWidth,
    );

    /// Call [Guest::interpret]. The caller must have flushed all dirty registers.
    fn call_interpret(&mut self, pc: GuestAddr, word: u32);
    /// If a guest exception is pending, charge `cycles` and return to the dispatcher with the
    /// guest pc set to `next`. Only valid when no registers are dirty.
    fn exit_if_exception(&mut self, next: GuestAddr, cycles: u32);
    /// Call the host-call hook `id`. The caller must have flushed all dirty registers.
    fn call_hook(&mut self, id: HookId);
    /// Increment the run counter at `counter`.
    fn count_run(&mut self, counter: *mut u64);

    fn new_label(&mut self) -> Self::Label;
    /// Attach `l` to the next emitted operation.
    fn bind(&mut self, l: Self::Label);
    fn jump(&mut self, l: Self::Label);
    /// Jump to `l` if `cond(a, b)` holds.
    fn branch_if(&mut self, cond: Cond, a: Self::Reg, b: Self::Reg, l: Self::Label);

    fn set_pc(&mut self, pc: GuestAddr);
    /// Mark `exc` as pending.
    fn raise(&mut self, exc: GuestException);
    /// Ask the dispatcher to invalidate the cache line containing the address in `addr`.
    fn request_invalidate(&mut self, addr: Self::Reg);

    /// Charge `cycles`, then leave the block for `target`: via the dispatcher if the timeslice is
    /// exhausted, otherwise through a linkable exit which initially also leads to the dispatcher.
    /// Returns the exit's patch site.
    fn exit(&mut self, target: GuestAddr, cycles: u32) -> CodeAddr;
    /// Charge `cycles` and return to the dispatcher with the guest pc set to the value of `pc`.
    fn exit_indirect(&mut self, pc: Self::Reg, cycles: u32);
    /// Charge `cycles` and return to the dispatcher. The guest pc must already have been set.
    fn exit_to_dispatcher(&mut self, cycles: u32);
}

/// The result of emitting a block.
#[derive(Debug)]
pub(crate) struct BlockCode {
    pub(crate) checked_entry: CodeAddr,
    pub(crate) normal_entry: CodeAddr,
    /// The code addresses the block occupies.
    pub(crate) code: Range<usize>,
    /// Each exit's patch site and guest target, in emission order.
    pub(crate) exits: Vec<(CodeAddr, GuestAddr)>,
}

/// How code is mutated after it has been emitted. Every write to finalised code goes through a
/// backend's implementation of this trait.
pub(crate) trait CodePatcher {
    /// Point the exit at `site` to `target`, or back to the dispatcher if `target` is `None`.
    fn patch_exit(&mut self, site: CodeAddr, target: Option<CodeAddr>);
    /// Where does the exit at `site` currently lead? `None` means the dispatcher.
    fn exit_target(&self, site: CodeAddr) -> Option<CodeAddr>;
    /// The block `id`, occupying `code`, has been evicted.
    fn forget_block(&mut self, id: BlockId, code: Range<usize>);
    /// Discard all blocks. Code addresses previously handed out become invalid.
    fn clear_code(&mut self);
}

/// Everything a block needs while it runs.
pub(crate) struct ExecEnv<'a, G> {
    pub(crate) state: &'a mut GuestState,
    pub(crate) guest: &'a mut G,
    pub(crate) hooks: &'a mut HookTable<G>,
}

/// How execution of generated code ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExecOutcome {
    /// Control returned to the dispatcher normally.
    Exited,
    /// A fault at `native_addr` could not be recovered from.
    Halted { native_addr: usize, reason: String },
}

pub(crate) trait Backend<G: Guest>: Emitter + CodePatcher {
    fn kind(&self) -> BackendKind;

    /// Start emitting block `id`, which begins at guest address `start`. Returns the block's
    /// checked and normal entries.
    fn begin_block(
        &mut self,
        id: BlockId,
        start: GuestAddr,
    ) -> Result<(CodeAddr, CodeAddr), CompilationError>;
    fn end_block(&mut self) -> Result<BlockCode, CompilationError>;
    /// Throw away the block currently being emitted.
    fn abandon_block(&mut self);

    /// How much space is left for new blocks, in the units of [Self::min_block_space].
    fn code_free(&self) -> usize;
    /// The least space a new block is allowed to start with.
    fn min_block_space(&self) -> usize;
    fn code_used(&self) -> usize;
    fn code_capacity(&self) -> usize;
    /// Is the space reserved for backpatch trampolines close to running out?
    fn trampolines_nearly_full(&self) -> bool {
        false
    }

    /// Run generated code starting at `entry` until it returns to the dispatcher.
    fn execute(&mut self, entry: CodeAddr, env: &mut ExecEnv<'_, G>) -> ExecOutcome;

    /// How many faulting accesses have been rewritten into slow-path calls?
    fn faults_handled(&self) -> u64;

    /// A human readable rendering of the code in `code`, for `DYNAREC_LOG_IR`.
    fn disassemble(&self, code: Range<usize>) -> String;
}
