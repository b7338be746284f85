//! The portable backend: blocks are translated into a stream of pre-decoded operations which a
//! small executor (see [exec]) runs. The op stream mirrors what the native backend emits closely
//! enough that everything above the [Backend] trait (register allocation, linking, backpatching)
//! is exercised identically by both.
//!
//! "Code addresses" in this backend are indexes into the op buffer.

use crate::{
    backpatch::{AccessKind, AccessSite, Backpatch, BackpatchError, SiteTable},
    cache::BlockId,
    compile::{
        Backend, BlockCode, CodeAddr, CodePatcher, CompilationError, Emitter, ExecEnv,
        ExecOutcome, HostReg,
    },
    config::BackendKind,
    guest::{AccessWidth, AluOp, Cond, Guest, GuestAddr, GuestException, ShiftOp},
    hle::HookId,
};
use index_vec::IndexVec;
use std::{fmt, ops::Range};

mod exec;

/// The number of virtual registers the executor provides.
pub(crate) const NUM_OREGS: usize = 12;

/// A virtual register of the op executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OReg(u8);

impl fmt::Display for OReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl HostReg for OReg {
    fn idx(self) -> usize {
        usize::from(self.0)
    }
}

static OREGS: [OReg; NUM_OREGS] = [
    OReg(0),
    OReg(1),
    OReg(2),
    OReg(3),
    OReg(4),
    OReg(5),
    OReg(6),
    OReg(7),
    OReg(8),
    OReg(9),
    OReg(10),
    OReg(11),
];

/// The first register that host calls are treated as clobbering. The executor overwrites these
/// with garbage on every call so that allocator bugs show up in tests.
const FIRST_CALLER_SAVED: usize = 6;

/// The smallest number of free ops a new block may start with.
const MIN_BLOCK_OPS: usize = 32;

index_vec::define_index_type! {
    pub(crate) struct OpLabel = u32;
}

/// One operation. Operations which name another operation (jumps and links) do so by index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Op {
    /// The checked entry of a block: return to the dispatcher if the timeslice is used up.
    CheckDowncount,
    LoadState { dst: OReg, off: u32, wide: bool },
    StoreState { src: OReg, off: u32, wide: bool },
    Copy { dst: OReg, src: OReg, wide: bool },
    Extract { dst: OReg, src: OReg, shift: u8 },
    MovImm { dst: OReg, imm: u32 },
    Alu { op: AluOp, dst: OReg, a: OReg, b: OReg },
    AddImm { dst: OReg, a: OReg, imm: i32 },
    ShiftImm { op: ShiftOp, dst: OReg, a: OReg, amount: u8 },
    MulAcc { acc: OReg, a: OReg, b: OReg },
    /// A guest load. Until backpatched (`slow == false`) it only succeeds if the guest can
    /// translate the address to host memory.
    Load {
        pc: GuestAddr,
        dst: OReg,
        base: OReg,
        offset: i16,
        width: AccessWidth,
        signed: bool,
        slow: bool,
    },
    Store {
        pc: GuestAddr,
        src: OReg,
        base: OReg,
        offset: i16,
        width: AccessWidth,
        slow: bool,
    },
    Interpret { pc: GuestAddr, word: u32 },
    ExitIfException { next: GuestAddr, cycles: u32 },
    Hook(HookId),
    CountRun(*mut u64),
    Jump(usize),
    BranchIf { cond: Cond, a: OReg, b: OReg, target: usize },
    SetPc(GuestAddr),
    Raise(GuestException),
    Invalidate(OReg),
    /// Set the pc to `target`, charge `cycles`, and return to the dispatcher if the timeslice is
    /// used up. Otherwise fall through to the following [Op::Link].
    Exit { target: GuestAddr, cycles: u32 },
    /// A patchable jump to the op at the given index, or to the dispatcher if `None`.
    Link(Option<usize>),
    ExitIndirect { pc: OReg, cycles: u32 },
    ExitToDispatcher { cycles: u32 },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wid = |wide: bool| if wide { 64 } else { 32 };
        match *self {
            Op::CheckDowncount => write!(f, "check_downcount"),
            Op::LoadState { dst, off, wide } => write!(f, "{dst} = state{}[{off}]", wid(wide)),
            Op::StoreState { src, off, wide } => write!(f, "state{}[{off}] = {src}", wid(wide)),
            Op::Copy { dst, src, wide } => write!(f, "{dst} = {src} ; {}", wid(wide)),
            Op::Extract { dst, src, shift } => write!(f, "{dst} = {src} >> {shift}"),
            Op::MovImm { dst, imm } => write!(f, "{dst} = {imm:#x}"),
            Op::Alu { op, dst, a, b } => write!(f, "{dst} = {op} {a}, {b}"),
            Op::AddImm { dst, a, imm } => write!(f, "{dst} = add {a}, {imm}"),
            Op::ShiftImm { op, dst, a, amount } => write!(f, "{dst} = {op} {a}, {amount}"),
            Op::MulAcc { acc, a, b } => write!(f, "{acc} += {a} * {b}"),
            Op::Load {
                pc,
                dst,
                base,
                offset,
                width,
                signed,
                slow,
            } => {
                let s = if signed { "s" } else { "z" };
                let path = if slow { "slow" } else { "fast" };
                write!(
                    f,
                    "{dst} = load{}{s} [{base} + {offset}] ; {path} {pc:#x}",
                    width.bytes() * 8
                )
            }
            Op::Store {
                pc,
                src,
                base,
                offset,
                width,
                slow,
            } => {
                let path = if slow { "slow" } else { "fast" };
                write!(
                    f,
                    "store{} [{base} + {offset}], {src} ; {path} {pc:#x}",
                    width.bytes() * 8
                )
            }
            Op::Interpret { pc, word } => write!(f, "interpret {pc:#x}, {word:#010x}"),
            Op::ExitIfException { next, cycles } => {
                write!(f, "exit_if_exception {next:#x}, {cycles}")
            }
            Op::Hook(id) => write!(f, "hook {}", id.index()),
            Op::CountRun(_) => write!(f, "count_run"),
            Op::Jump(t) => write!(f, "jump {t}"),
            Op::BranchIf { cond, a, b, target } => write!(f, "b{cond} {a}, {b}, {target}"),
            Op::SetPc(pc) => write!(f, "pc = {pc:#x}"),
            Op::Raise(exc) => write!(f, "raise {exc}"),
            Op::Invalidate(r) => write!(f, "icbi {r}"),
            Op::Exit { target, cycles } => write!(f, "exit {target:#x}, {cycles}"),
            Op::Link(Some(t)) => write!(f, "link {t}"),
            Op::Link(None) => write!(f, "link dispatcher"),
            Op::ExitIndirect { pc, cycles } => write!(f, "exit {pc}, {cycles}"),
            Op::ExitToDispatcher { cycles } => write!(f, "exit dispatcher, {cycles}"),
        }
    }
}

/// The op buffer. Blocks are appended and never move; space is only reclaimed by
/// [OpBuf::clear].
pub(crate) struct OpBuf {
    ops: Vec<Op>,
    cap: usize,
}

impl OpBuf {
    fn new(cap: usize) -> Self {
        Self {
            ops: Vec::new(),
            cap,
        }
    }

    fn push(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub(crate) fn get(&self, at: usize) -> Option<Op> {
        self.ops.get(at).copied()
    }

    /// Overwrite the op at `at`. Every change to an op after its block has been finalised goes
    /// through here.
    fn patch(&mut self, at: usize, op: Op) {
        self.ops[at] = op;
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn truncate(&mut self, len: usize) {
        self.ops.truncate(len);
    }

    fn clear(&mut self) {
        self.ops.clear();
    }
}

/// The state of the block being emitted.
struct InProgress {
    id: BlockId,
    start: usize,
    labels: IndexVec<OpLabel, Option<usize>>,
    /// Ops whose target field holds a label index which must be resolved.
    fixups: Vec<usize>,
    exits: Vec<(CodeAddr, GuestAddr)>,
}

pub(crate) struct OpsBackend {
    buf: OpBuf,
    cur: Option<InProgress>,
    sites: SiteTable,
}

impl OpsBackend {
    /// Create a backend whose op buffer holds at most `cap` ops.
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: OpBuf::new(cap),
            cur: None,
            sites: SiteTable::default(),
        }
    }

    fn cur(&mut self) -> &mut InProgress {
        self.cur
            .as_mut()
            .expect("emitting outside of begin_block/end_block")
    }

    fn push_fixup(&mut self, op: Op) {
        let at = self.buf.push(op);
        self.cur().fixups.push(at);
    }

    fn register_site(&mut self, at: usize, pc: GuestAddr, kind: AccessKind) {
        let block = self.cur().id;
        self.sites.register(
            at,
            AccessSite {
                pc,
                block,
                kind,
                window: at..at + 1,
            },
        );
    }
}

impl Emitter for OpsBackend {
    type Reg = OReg;
    type Label = OpLabel;

    fn allocatable(&self) -> &'static [OReg] {
        &OREGS
    }

    fn load_state(&mut self, dst: OReg, off: u32, wide: bool) {
        self.buf.push(Op::LoadState { dst, off, wide });
    }

    fn store_state(&mut self, src: OReg, off: u32, wide: bool) {
        self.buf.push(Op::StoreState { src, off, wide });
    }

    fn copy(&mut self, dst: OReg, src: OReg, wide: bool) {
        self.buf.push(Op::Copy { dst, src, wide });
    }

    fn extract(&mut self, dst: OReg, src: OReg, shift: u8) {
        self.buf.push(Op::Extract { dst, src, shift });
    }

    fn mov_imm(&mut self, dst: OReg, imm: u32) {
        self.buf.push(Op::MovImm { dst, imm });
    }

    fn alu(&mut self, op: AluOp, dst: OReg, a: OReg, b: OReg) {
        self.buf.push(Op::Alu { op, dst, a, b });
    }

    fn add_imm(&mut self, dst: OReg, a: OReg, imm: i32) {
        self.buf.push(Op::AddImm { dst, a, imm });
    }

    fn shift_imm(&mut self, op: ShiftOp, dst: OReg, a: OReg, amount: u8) {
        self.buf.push(Op::ShiftImm { op, dst, a, amount });
    }

    fn mul_acc(&mut self, acc: OReg, a: OReg, b: OReg) {
        self.buf.push(Op::MulAcc { acc, a, b });
    }

    fn guest_load(
        &mut self,
        pc: GuestAddr,
        dst: OReg,
        base: OReg,
        offset: i16,
        width: AccessWidth,
        signed: bool,
    ) {
        let at = self.buf.push(Op::Load {
            pc,
            dst,
            base,
            offset,
            width,
            signed,
            slow: false,
        });
        self.register_site(at, pc, AccessKind::Load { width, signed });
    }

    fn guest_store(&mut self, pc: GuestAddr, src: OReg, base: OReg, offset: i16, width: AccessWidth) {
        let at = self.buf.push(Op::Store {
            pc,
            src,
            base,
            offset,
            width,
            slow: false,
        });
        self.register_site(at, pc, AccessKind::Store { width });
    }

    fn call_interpret(&mut self, pc: GuestAddr, word: u32) {
        self.buf.push(Op::Interpret { pc, word });
    }

    fn exit_if_exception(&mut self, next: GuestAddr, cycles: u32) {
        self.buf.push(Op::ExitIfException { next, cycles });
    }

    fn call_hook(&mut self, id: HookId) {
        self.buf.push(Op::Hook(id));
    }

    fn count_run(&mut self, counter: *mut u64) {
        self.buf.push(Op::CountRun(counter));
    }

    fn new_label(&mut self) -> OpLabel {
        self.cur().labels.push(None)
    }

    fn bind(&mut self, l: OpLabel) {
        let at = self.buf.len();
        self.cur().labels[l] = Some(at);
    }

    fn jump(&mut self, l: OpLabel) {
        self.push_fixup(Op::Jump(l.index()));
    }

    fn branch_if(&mut self, cond: Cond, a: OReg, b: OReg, l: OpLabel) {
        self.push_fixup(Op::BranchIf {
            cond,
            a,
            b,
            target: l.index(),
        });
    }

    fn set_pc(&mut self, pc: GuestAddr) {
        self.buf.push(Op::SetPc(pc));
    }

    fn raise(&mut self, exc: GuestException) {
        self.buf.push(Op::Raise(exc));
    }

    fn request_invalidate(&mut self, addr: OReg) {
        self.buf.push(Op::Invalidate(addr));
    }

    fn exit(&mut self, target: GuestAddr, cycles: u32) -> CodeAddr {
        self.buf.push(Op::Exit { target, cycles });
        let site = CodeAddr(self.buf.push(Op::Link(None)));
        self.cur().exits.push((site, target));
        site
    }

    fn exit_indirect(&mut self, pc: OReg, cycles: u32) {
        self.buf.push(Op::ExitIndirect { pc, cycles });
    }

    fn exit_to_dispatcher(&mut self, cycles: u32) {
        self.buf.push(Op::ExitToDispatcher { cycles });
    }
}

impl CodePatcher for OpsBackend {
    fn patch_exit(&mut self, site: CodeAddr, target: Option<CodeAddr>) {
        debug_assert!(matches!(self.buf.get(site.0), Some(Op::Link(_))));
        self.buf.patch(site.0, Op::Link(target.map(|x| x.0)));
    }

    fn exit_target(&self, site: CodeAddr) -> Option<CodeAddr> {
        match self.buf.get(site.0) {
            Some(Op::Link(t)) => t.map(CodeAddr),
            _ => None,
        }
    }

    fn forget_block(&mut self, _id: BlockId, code: Range<usize>) {
        self.sites.forget_range(code);
    }

    fn clear_code(&mut self) {
        self.buf.clear();
        self.sites.clear();
    }
}

impl Backpatch for OpsBackend {
    fn site_table(&mut self) -> &mut SiteTable {
        &mut self.sites
    }

    fn rewrite_site(&mut self, fault_addr: usize, site: &AccessSite) -> Result<usize, BackpatchError> {
        let op = match (self.buf.get(fault_addr), site.kind) {
            (Some(Op::Load { pc, dst, base, offset, width, signed, slow: false }), AccessKind::Load { .. }) => {
                Op::Load { pc, dst, base, offset, width, signed, slow: true }
            }
            (Some(Op::Store { pc, src, base, offset, width, slow: false }), AccessKind::Store { .. }) => {
                Op::Store { pc, src, base, offset, width, slow: true }
            }
            (op, _) => {
                return Err(BackpatchError::Rewrite {
                    addr: fault_addr,
                    reason: format!("expected a fast {:?}, found {op:?}", site.kind),
                })
            }
        };
        self.buf.patch(fault_addr, op);
        Ok(fault_addr)
    }
}

impl<G: Guest> Backend<G> for OpsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ops
    }

    fn begin_block(
        &mut self,
        id: BlockId,
        _start: GuestAddr,
    ) -> Result<(CodeAddr, CodeAddr), CompilationError> {
        debug_assert!(self.cur.is_none());
        let start = self.buf.push(Op::CheckDowncount);
        self.cur = Some(InProgress {
            id,
            start,
            labels: IndexVec::new(),
            fixups: Vec::new(),
            exits: Vec::new(),
        });
        Ok((CodeAddr(start), CodeAddr(start + 1)))
    }

    fn end_block(&mut self) -> Result<BlockCode, CompilationError> {
        let cur = self
            .cur
            .take()
            .ok_or_else(|| CompilationError::InternalError("no block in progress".into()))?;
        if self.buf.len() > self.buf.cap {
            self.buf.truncate(cur.start);
            self.sites.forget_range(cur.start..usize::MAX);
            return Err(CompilationError::CacheFull);
        }
        for &at in &cur.fixups {
            let resolve = |l: usize| {
                cur.labels
                    .get(OpLabel::from_usize(l))
                    .copied()
                    .flatten()
                    .ok_or_else(|| CompilationError::InternalError(format!("label {l} never bound")))
            };
            let op = match self.buf.get(at) {
                Some(Op::Jump(l)) => Op::Jump(resolve(l)?),
                Some(Op::BranchIf { cond, a, b, target }) => Op::BranchIf {
                    cond,
                    a,
                    b,
                    target: resolve(target)?,
                },
                op => {
                    return Err(CompilationError::InternalError(format!(
                        "op {at} is not a branch: {op:?}"
                    )))
                }
            };
            self.buf.ops[at] = op;
        }
        Ok(BlockCode {
            checked_entry: CodeAddr(cur.start),
            normal_entry: CodeAddr(cur.start + 1),
            code: cur.start..self.buf.len(),
            exits: cur.exits,
        })
    }

    fn abandon_block(&mut self) {
        if let Some(cur) = self.cur.take() {
            self.buf.truncate(cur.start);
            self.sites.forget_range(cur.start..usize::MAX);
        }
    }

    fn code_free(&self) -> usize {
        self.buf.cap.saturating_sub(self.buf.len())
    }

    fn min_block_space(&self) -> usize {
        MIN_BLOCK_OPS
    }

    fn code_used(&self) -> usize {
        self.buf.len()
    }

    fn code_capacity(&self) -> usize {
        self.buf.cap
    }

    fn execute(&mut self, entry: CodeAddr, env: &mut ExecEnv<'_, G>) -> ExecOutcome {
        self.run(entry.0, env)
    }

    fn faults_handled(&self) -> u64 {
        self.sites.handled()
    }

    fn disassemble(&self, code: Range<usize>) -> String {
        code.filter_map(|i| self.buf.get(i).map(|op| format!("{i:>6}: {op}\n")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backpatch::handle_fault,
        cache::BlockStore,
        compile::translate::{translate, Translation},
        config::JitBuilder,
        guest::{GuestReg, Inst},
        hle::HookTable,
        testing::TestGuest,
    };
    use fm::{FMBuilder, FMatcher};
    use regex::Regex;
    use std::sync::LazyLock;

    static PTN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{.+?\}\}").unwrap());
    static PTN_RE_IGNORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{_}\}").unwrap());
    static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap());

    fn fmatcher(ptn: &str) -> FMatcher<'_> {
        FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
            .build()
            .unwrap()
    }

    /// Translate `insts` at 0x1000, returning the backend and the block's code range.
    fn translate_ops(insts: &[Inst]) -> (OpsBackend, Range<usize>) {
        let cfg = JitBuilder::new().backend(BackendKind::Ops).config();
        let mut store = BlockStore::new(&cfg);
        let mut be = OpsBackend::new(1024);
        let mut g = TestGuest::new().program(0x1000, insts);
        let hooks = HookTable::new();
        let Translation::Block(id) =
            translate(&cfg, &mut store, &mut be, &mut g, &hooks, 0x1000).unwrap()
        else {
            panic!()
        };
        let code = store.block(id).unwrap().code.clone();
        (be, code)
    }

    fn dis(be: &OpsBackend, code: Range<usize>) -> String {
        <OpsBackend as Backend<TestGuest>>::disassemble(be, code)
    }

    #[test]
    fn load_is_rewritten_to_the_slow_path() {
        let (mut be, code) = translate_ops(&[
            Inst::Load {
                width: AccessWidth::Half,
                signed: true,
                rd: GuestReg::Gpr(1),
                ra: GuestReg::Gpr(2),
                offset: 8,
            },
            Inst::Sync,
        ]);
        fmatcher(
            "{{_}}: check_downcount
             ...
             {{_}}: {{b}} = state32[8]
             {{_}}: {{d}} = load16s [{{b}} + 8] ; fast 0x1000
             {{_}}: state32[4] = {{d}}
             {{_}}: pc = 0x1008
             {{_}}: exit dispatcher, 2",
        )
        .matches(&dis(&be, code.clone()))
        .unwrap();

        let at = code
            .clone()
            .find(|&i| matches!(be.buf.get(i), Some(Op::Load { .. })))
            .unwrap();
        assert_eq!(handle_fault(&mut be, at), Ok(at));
        assert!(dis(&be, code).contains("; slow 0x1000"));
        assert_eq!(be.sites.handled(), 1);
        assert!(handle_fault(&mut be, at).is_err());
    }

    #[test]
    fn exits_are_patched_in_place() {
        let (mut be, code) = translate_ops(&[Inst::Branch {
            target: 0x2000,
            link: false,
        }]);
        let site = code
            .clone()
            .find(|&i| matches!(be.buf.get(i), Some(Op::Link(_))))
            .map(CodeAddr)
            .unwrap();
        assert_eq!(be.exit_target(site), None);
        be.patch_exit(site, Some(CodeAddr(7)));
        assert_eq!(be.exit_target(site), Some(CodeAddr(7)));
        fmatcher(
            "...
             {{_}}: exit 0x2000, 1
             {{_}}: link 7",
        )
        .matches(&dis(&be, code))
        .unwrap();
        be.patch_exit(site, None);
        assert_eq!(be.exit_target(site), None);
    }
}
