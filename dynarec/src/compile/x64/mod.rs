//! The native x86-64 backend.
//!
//! Generated code runs with a few registers in fixed roles (see [reg]): `rbp` points at the
//! [GuestState], `r15` at the base of the fast memory window, and `rax` is a scratch register
//! the allocator never hands out. Blocks are entered through a shared trampoline which saves the
//! host's callee-saved registers and stack pointer, and every exit to the dispatcher goes through
//! a shared stub which restores them.
//!
//! Guest memory accesses are emitted as a single `[r15 + rax]` access, padded so that a `jmp
//! rel32` fits over it. If the access faults, the fault handler rewrites the site into a jump to
//! a trampoline, in the far region of the code buffer, which calls the guest's slow read or write
//! routine and jumps back.

mod asm;
mod codebuf;
mod fault;
mod reg;

use self::{
    asm::{Asm, LabelIdx, decode_one, jmp_rel32, jmp_rel32_target},
    codebuf::CodeBuf,
    fault::FaultTarget,
    reg::{ALLOCATABLE, CALLEE_SAVED, CALLER_SAVED, MEMBASE, Reg, SCRATCH, STATE},
};
use crate::{
    backpatch::{AccessKind, AccessSite, Backpatch, BackpatchError, SiteTable, handle_fault},
    cache::BlockId,
    compile::{
        Backend, BlockCode, CodeAddr, CodePatcher, CompilationError, Emitter, ExecEnv,
        ExecOutcome,
    },
    config::{BackendKind, Config},
    guest::{
        AccessWidth, AluOp, CTX_OFF, Cond, DOWNCOUNT_OFF, EXCEPTIONS_OFF, EXIT_FLAGS_OFF,
        EXIT_INVALIDATE, Guest, GuestAddr, GuestException, GuestState, INVALIDATE_ADDR_OFF,
        MEMBASE_OFF, PC_OFF, SAVED_SP_OFF, ShiftOp,
    },
    hle::HookId,
    JitError,
};
use iced_x86::{Code, Instruction as Op, MemoryOperand, Mnemonic, OpKind, Register};
use smallvec::SmallVec;
use std::{marker::PhantomData, mem, ops::Range};

/// The least space, in bytes, a block may start with.
const MIN_BLOCK_BYTES: usize = 4096;
const BLOCK_ALIGN: usize = 16;
/// When less than this many bytes of trampoline space remain, the dispatcher should flush.
const TRAMPOLINE_RESERVE: usize = 4096;
/// The size of a `jmp rel32`, and thus the least a backpatch site may occupy.
const JMP_REL32_LEN: usize = 5;

fn mem_at(base: Reg, disp: i32) -> MemoryOperand {
    MemoryOperand::with_base_displ(base.to_reg64(), i64::from(disp))
}

/// The [GuestState] field at `off`.
fn field(off: u32) -> MemoryOperand {
    mem_at(STATE, off as i32)
}

/// The guest memory operand of a fast access: the address is always computed into `eax`.
fn fastmem_operand() -> MemoryOperand {
    MemoryOperand::with_base_index(MEMBASE.to_reg64(), SCRATCH.to_reg64())
}

fn mov32(a: &mut Asm, dst: Reg, src: Reg) {
    a.push_inst(Op::with2(Code::Mov_r32_rm32, dst.to_reg32(), src.to_reg32()));
}

/// Call the host function at `f`. The arguments must already be in place.
fn call_abs(a: &mut Asm, f: usize) {
    a.push_inst(Op::with2(Code::Mov_r64_imm64, Register::RAX, f as u64));
    a.push_inst(Op::with1(Code::Call_rm64, Register::RAX));
}

/// Load the execution context pointer into the first argument register.
fn load_ctx(a: &mut Asm) {
    a.push_inst(Op::with2(Code::Mov_r64_rm64, Register::RDI, field(CTX_OFF)));
}

/// Save `regs` around a call, keeping the stack 16 byte aligned.
fn push_regs(a: &mut Asm, regs: &[Reg]) {
    for r in regs {
        a.push_inst(Op::with1(Code::Push_r64, r.to_reg64()));
    }
    if regs.len() % 2 == 1 {
        a.push_inst(Op::with2(Code::Sub_rm64_imm8, Register::RSP, 8i32));
    }
}

fn pop_regs(a: &mut Asm, regs: &[Reg]) {
    if regs.len() % 2 == 1 {
        a.push_inst(Op::with2(Code::Add_rm64_imm8, Register::RSP, 8i32));
    }
    for r in regs.iter().rev() {
        a.push_inst(Op::with1(Code::Pop_r64, r.to_reg64()));
    }
}

/// Read guest memory at the address in `eax` through [Guest::read] into `dst`.
fn slow_load(a: &mut Asm, dst: Reg, width: AccessWidth, signed: bool, read: usize) {
    let saved = CALLER_SAVED
        .iter()
        .copied()
        .filter(|r| *r != dst)
        .collect::<SmallVec<[Reg; 8]>>();
    push_regs(a, &saved);
    a.push_inst(Op::with2(Code::Mov_r32_rm32, Register::ESI, Register::EAX));
    a.push_inst(Op::with2(Code::Mov_r32_imm32, Register::EDX, width.bytes() as u32));
    a.push_inst(Op::with2(Code::Mov_r32_imm32, Register::ECX, u32::from(signed)));
    load_ctx(a);
    call_abs(a, read);
    pop_regs(a, &saved);
    mov32(a, dst, SCRATCH);
}

/// Write `src` to guest memory at the address in `eax` through [Guest::write].
fn slow_store(a: &mut Asm, src: Reg, width: AccessWidth, write: usize) {
    push_regs(a, &CALLER_SAVED);
    // `src` may be any of the argument registers, so it has to be moved first.
    a.push_inst(Op::with2(Code::Mov_r32_rm32, Register::EDX, src.to_reg32()));
    a.push_inst(Op::with2(Code::Mov_r32_rm32, Register::ESI, Register::EAX));
    a.push_inst(Op::with2(Code::Mov_r32_imm32, Register::ECX, width.bytes() as u32));
    load_ctx(a);
    call_abs(a, write);
    pop_regs(a, &CALLER_SAVED);
}

fn load_code(width: AccessWidth, signed: bool) -> Code {
    match (width, signed) {
        (AccessWidth::Byte, false) => Code::Movzx_r32_rm8,
        (AccessWidth::Byte, true) => Code::Movsx_r32_rm8,
        (AccessWidth::Half, false) => Code::Movzx_r32_rm16,
        (AccessWidth::Half, true) => Code::Movsx_r32_rm16,
        (AccessWidth::Word, _) => Code::Mov_r32_rm32,
    }
}

// The host side of calls from generated code. `ctx` is always the `ExecEnv` the running block
// was entered with, stored in the guest state by `execute`.

extern "sysv64" fn slow_read<G: Guest>(ctx: usize, addr: u32, width: u32, signed: u32) -> u32 {
    let env = unsafe { &mut *(ctx as *mut ExecEnv<'_, G>) };
    match AccessWidth::from_bytes(width as usize) {
        Some(w) => w.extend(env.guest.read(addr, w), signed != 0),
        None => 0,
    }
}

extern "sysv64" fn slow_write<G: Guest>(ctx: usize, addr: u32, val: u32, width: u32) {
    let env = unsafe { &mut *(ctx as *mut ExecEnv<'_, G>) };
    if let Some(w) = AccessWidth::from_bytes(width as usize) {
        env.guest.write(addr, w, val);
    }
}

extern "sysv64" fn interpret<G: Guest>(ctx: usize, pc: u32, word: u32) {
    let env = unsafe { &mut *(ctx as *mut ExecEnv<'_, G>) };
    env.guest.interpret(env.state, pc, word);
}

extern "sysv64" fn call_hook<G: Guest>(ctx: usize, id: u32) {
    let env = unsafe { &mut *(ctx as *mut ExecEnv<'_, G>) };
    env.hooks.call(HookId::from_raw(id), env.state, env.guest);
}

/// A block being assembled.
struct InProgress {
    asm: Asm,
    id: BlockId,
    base: usize,
    normal_entry: usize,
    exits: Vec<(CodeAddr, GuestAddr)>,
    /// Access sites, keyed by the address of their faulting instruction.
    sites: Vec<(usize, AccessSite)>,
}

pub(crate) struct X64Backend<G> {
    code: CodeBuf,
    /// Bytes of the near region in use.
    near_used: usize,
    /// Bytes of the far region in use.
    far_used: usize,
    /// Bytes of the far region taken by the shared routines, which survive a cache clear.
    far_shared: usize,
    /// `extern "sysv64" fn(state: *mut GuestState, entry: usize)`.
    enter: usize,
    /// Returns from `enter` to the dispatcher.
    exit_stub: usize,
    /// Does the guest provide a fast memory window? If not, every access calls the slow path.
    fastmem: bool,
    cur: Option<InProgress>,
    sites: SiteTable,
    /// Set by the fault handler when a fault could not be recovered from.
    halted: Option<(usize, String)>,
    _guest: PhantomData<fn(&mut G)>,
}

impl<G: Guest + 'static> X64Backend<G> {
    pub(crate) fn new(cfg: &Config, fastmem: bool) -> Result<Self, JitError> {
        let mut code = CodeBuf::new(cfg.code_size, cfg.far_code_size + TRAMPOLINE_RESERVE)
            .map_err(JitError::CodeMemory)?;
        let far = code.far().start;
        let mut a = Asm::new(far);

        // Entry: rdi = state, rsi = the code to jump to. After pushing the callee-saved registers
        // the stack is 8 bytes off 16 byte alignment.
        for r in CALLEE_SAVED {
            a.push_inst(Op::with1(Code::Push_r64, r.to_reg64()));
        }
        a.push_inst(Op::with2(Code::Sub_rm64_imm8, Register::RSP, 8i32));
        a.push_inst(Op::with2(
            Code::Mov_rm64_r64,
            mem_at(Reg::RDI, SAVED_SP_OFF as i32),
            Register::RSP,
        ));
        a.push_inst(Op::with2(Code::Mov_r64_rm64, STATE.to_reg64(), Register::RDI));
        a.push_inst(Op::with2(
            Code::Mov_r64_rm64,
            MEMBASE.to_reg64(),
            mem_at(Reg::RDI, MEMBASE_OFF as i32),
        ));
        a.push_inst(Op::with1(Code::Jmp_rm64, Register::RSI));

        let exit_stub = a.addr();
        a.push_inst(Op::with2(Code::Mov_r64_rm64, Register::RSP, field(SAVED_SP_OFF)));
        a.push_inst(Op::with2(Code::Add_rm64_imm8, Register::RSP, 8i32));
        for r in CALLEE_SAVED.iter().rev() {
            a.push_inst(Op::with1(Code::Pop_r64, r.to_reg64()));
        }
        a.push_inst(Ok(Op::with(Code::Retnq)));

        let bytes = a
            .finish()
            .map_err(|e| JitError::Internal(e.to_string()))?;
        code.write(far, &bytes);
        let far_shared = bytes.len().next_multiple_of(BLOCK_ALIGN);
        Ok(Self {
            code,
            near_used: 0,
            far_used: far_shared,
            far_shared,
            enter: far,
            exit_stub,
            fastmem,
            cur: None,
            sites: SiteTable::default(),
            halted: None,
            _guest: PhantomData,
        })
    }
}

impl<G> X64Backend<G> {
    fn cur(&mut self) -> &mut InProgress {
        self.cur.as_mut().expect("no block is being emitted")
    }

    fn asm(&mut self) -> &mut Asm {
        &mut self.cur().asm
    }

    /// Subtract `cycles` from the downcount, setting the flags on the result.
    fn charge(&mut self, cycles: u32) {
        self.asm().push_inst(Op::with2(
            Code::Sub_rm32_imm32,
            field(DOWNCOUNT_OFF),
            cycles as i32,
        ));
    }

    fn jmp_exit_stub(&mut self) {
        let stub = self.exit_stub as u64;
        self.asm()
            .push_inst(Op::with_branch(Code::Jmp_rel32_64, stub));
    }

    /// Compute `base + offset` into `eax`, wrapping at 32 bits.
    fn effective_addr(&mut self, base: Reg, offset: i16) {
        self.asm().push_inst(Op::with2(
            Code::Lea_r32_m,
            Register::EAX,
            mem_at(base, i32::from(offset)),
        ));
    }

    /// Emit a fast memory access `op` and register it as a backpatch site.
    fn fast_access(&mut self, pc: GuestAddr, op: Result<Op, iced_x86::IcedError>, kind: AccessKind) {
        let cur = self.cur();
        let start = cur.asm.addr();
        cur.asm.push_inst(op);
        let len = cur.asm.addr() - start;
        if len < JMP_REL32_LEN {
            cur.asm.push_nops(JMP_REL32_LEN - len);
        }
        let site = AccessSite {
            pc,
            block: cur.id,
            kind,
            window: start..cur.asm.addr(),
        };
        cur.sites.push((start, site));
    }
}

impl<G: Guest> Emitter for X64Backend<G> {
    type Reg = Reg;
    type Label = LabelIdx;

    fn allocatable(&self) -> &'static [Reg] {
        &ALLOCATABLE
    }

    fn load_state(&mut self, dst: Reg, off: u32, wide: bool) {
        let op = if wide {
            Op::with2(Code::Mov_r64_rm64, dst.to_reg64(), field(off))
        } else {
            Op::with2(Code::Mov_r32_rm32, dst.to_reg32(), field(off))
        };
        self.asm().push_inst(op);
    }

    fn store_state(&mut self, src: Reg, off: u32, wide: bool) {
        let op = if wide {
            Op::with2(Code::Mov_rm64_r64, field(off), src.to_reg64())
        } else {
            Op::with2(Code::Mov_rm32_r32, field(off), src.to_reg32())
        };
        self.asm().push_inst(op);
    }

    fn copy(&mut self, dst: Reg, src: Reg, wide: bool) {
        let op = if wide {
            Op::with2(Code::Mov_r64_rm64, dst.to_reg64(), src.to_reg64())
        } else {
            Op::with2(Code::Mov_r32_rm32, dst.to_reg32(), src.to_reg32())
        };
        self.asm().push_inst(op);
    }

    fn extract(&mut self, dst: Reg, src: Reg, shift: u8) {
        let a = self.asm();
        if shift == 0 {
            mov32(a, dst, src);
            return;
        }
        if dst != src {
            a.push_inst(Op::with2(Code::Mov_r64_rm64, dst.to_reg64(), src.to_reg64()));
        }
        a.push_inst(Op::with2(Code::Shr_rm64_imm8, dst.to_reg64(), u32::from(shift)));
        if shift < 32 {
            mov32(a, dst, dst);
        }
    }

    fn mov_imm(&mut self, dst: Reg, imm: u32) {
        self.asm()
            .push_inst(Op::with2(Code::Mov_r32_imm32, dst.to_reg32(), imm));
    }

    fn alu(&mut self, op: AluOp, dst: Reg, a: Reg, b: Reg) {
        let code = match op {
            AluOp::Add => Code::Add_rm32_r32,
            AluOp::Sub => Code::Sub_rm32_r32,
            AluOp::And => Code::And_rm32_r32,
            AluOp::Or => Code::Or_rm32_r32,
            AluOp::Xor => Code::Xor_rm32_r32,
            AluOp::Mul => Code::Imul_r32_rm32,
        };
        let asm = self.asm();
        let rhs = if dst == a {
            b
        } else if dst == b && op.is_commutative() {
            a
        } else if dst == b {
            mov32(asm, SCRATCH, b);
            mov32(asm, dst, a);
            SCRATCH
        } else {
            mov32(asm, dst, a);
            b
        };
        asm.push_inst(Op::with2(code, dst.to_reg32(), rhs.to_reg32()));
    }

    fn add_imm(&mut self, dst: Reg, a: Reg, imm: i32) {
        self.asm()
            .push_inst(Op::with2(Code::Lea_r32_m, dst.to_reg32(), mem_at(a, imm)));
    }

    fn shift_imm(&mut self, op: ShiftOp, dst: Reg, a: Reg, amount: u8) {
        let asm = self.asm();
        if dst != a {
            mov32(asm, dst, a);
        }
        let amount = amount & 31;
        if amount == 0 {
            return;
        }
        let code = match op {
            ShiftOp::Shl => Code::Shl_rm32_imm8,
            ShiftOp::Shr => Code::Shr_rm32_imm8,
            ShiftOp::Sar => Code::Sar_rm32_imm8,
        };
        asm.push_inst(Op::with2(code, dst.to_reg32(), u32::from(amount)));
    }

    fn mul_acc(&mut self, acc: Reg, a: Reg, b: Reg) {
        let asm = self.asm();
        // Either operand may be an accumulator, so only the low halves take part. `mul` leaves
        // the 64-bit product in edx:eax, and rdx may hold a guest value.
        mov32(asm, SCRATCH, a);
        asm.push_inst(Op::with1(Code::Push_r64, Register::RDX));
        asm.push_inst(Op::with1(Code::Mul_rm32, b.to_reg32()));
        asm.push_inst(Op::with2(Code::Shl_rm64_imm8, Register::RDX, 32u32));
        asm.push_inst(Op::with2(Code::Or_rm64_r64, Register::RAX, Register::RDX));
        asm.push_inst(Op::with1(Code::Pop_r64, Register::RDX));
        asm.push_inst(Op::with2(Code::Add_rm64_r64, acc.to_reg64(), Register::RAX));
    }

    fn guest_load(
        &mut self,
        pc: GuestAddr,
        dst: Reg,
        base: Reg,
        offset: i16,
        width: AccessWidth,
        signed: bool,
    ) {
        self.effective_addr(base, offset);
        if self.fastmem {
            let op = Op::with2(load_code(width, signed), dst.to_reg32(), fastmem_operand());
            self.fast_access(pc, op, AccessKind::Load { width, signed });
        } else {
            slow_load(self.asm(), dst, width, signed, slow_read::<G> as usize);
        }
    }

    fn guest_store(&mut self, pc: GuestAddr, src: Reg, base: Reg, offset: i16, width: AccessWidth) {
        self.effective_addr(base, offset);
        if self.fastmem {
            let op = match width {
                AccessWidth::Byte => Op::with2(Code::Mov_rm8_r8, fastmem_operand(), src.to_reg8()),
                AccessWidth::Half => {
                    Op::with2(Code::Mov_rm16_r16, fastmem_operand(), src.to_reg16())
                }
                AccessWidth::Word => {
                    Op::with2(Code::Mov_rm32_r32, fastmem_operand(), src.to_reg32())
                }
            };
            self.fast_access(pc, op, AccessKind::Store { width });
        } else {
            slow_store(self.asm(), src, width, slow_write::<G> as usize);
        }
    }

    fn call_interpret(&mut self, pc: GuestAddr, word: u32) {
        let a = self.asm();
        load_ctx(a);
        a.push_inst(Op::with2(Code::Mov_r32_imm32, Register::ESI, pc));
        a.push_inst(Op::with2(Code::Mov_r32_imm32, Register::EDX, word));
        call_abs(a, interpret::<G> as usize);
    }

    fn exit_if_exception(&mut self, next: GuestAddr, cycles: u32) {
        let skip = self.asm().mk_label();
        self.asm()
            .push_inst(Op::with2(Code::Cmp_rm32_imm8, field(EXCEPTIONS_OFF), 0i32));
        self.asm()
            .push_label_branch(Op::with_branch(Code::Je_rel32_64, 0), skip);
        self.set_pc(next);
        self.charge(cycles);
        self.jmp_exit_stub();
        self.asm().bind(skip);
    }

    fn call_hook(&mut self, id: HookId) {
        let a = self.asm();
        load_ctx(a);
        a.push_inst(Op::with2(Code::Mov_r32_imm32, Register::ESI, id.raw()));
        call_abs(a, call_hook::<G> as usize);
    }

    fn count_run(&mut self, counter: *mut u64) {
        let a = self.asm();
        a.push_inst(Op::with2(Code::Mov_r64_imm64, Register::RAX, counter as u64));
        a.push_inst(Op::with1(
            Code::Inc_rm64,
            MemoryOperand::with_base(Register::RAX),
        ));
    }

    fn new_label(&mut self) -> LabelIdx {
        self.asm().mk_label()
    }

    fn bind(&mut self, l: LabelIdx) {
        self.asm().bind(l);
    }

    fn jump(&mut self, l: LabelIdx) {
        self.asm()
            .push_label_branch(Op::with_branch(Code::Jmp_rel32_64, 0), l);
    }

    fn branch_if(&mut self, cond: Cond, a: Reg, b: Reg, l: LabelIdx) {
        let code = match cond {
            Cond::Eq => Code::Je_rel32_64,
            Cond::Ne => Code::Jne_rel32_64,
            Cond::LtU => Code::Jb_rel32_64,
            Cond::GeU => Code::Jae_rel32_64,
            Cond::Lt => Code::Jl_rel32_64,
            Cond::Ge => Code::Jge_rel32_64,
        };
        let asm = self.asm();
        asm.push_inst(Op::with2(Code::Cmp_rm32_r32, a.to_reg32(), b.to_reg32()));
        asm.push_label_branch(Op::with_branch(code, 0), l);
    }

    fn set_pc(&mut self, pc: GuestAddr) {
        self.asm()
            .push_inst(Op::with2(Code::Mov_rm32_imm32, field(PC_OFF), pc));
    }

    fn raise(&mut self, exc: GuestException) {
        self.asm()
            .push_inst(Op::with2(Code::Or_rm32_imm32, field(EXCEPTIONS_OFF), exc.bit()));
    }

    fn request_invalidate(&mut self, addr: Reg) {
        let a = self.asm();
        a.push_inst(Op::with2(
            Code::Mov_rm32_r32,
            field(INVALIDATE_ADDR_OFF),
            addr.to_reg32(),
        ));
        a.push_inst(Op::with2(
            Code::Or_rm32_imm32,
            field(EXIT_FLAGS_OFF),
            EXIT_INVALIDATE,
        ));
    }

    fn exit(&mut self, target: GuestAddr, cycles: u32) -> CodeAddr {
        self.set_pc(target);
        self.charge(cycles);
        let stub = self.exit_stub as u64;
        self.asm()
            .push_inst(Op::with_branch(Code::Jle_rel32_64, stub));
        // The patchable jump: to the exit stub until linked.
        let site = CodeAddr(self.asm().addr());
        self.jmp_exit_stub();
        self.cur().exits.push((site, target));
        site
    }

    fn exit_indirect(&mut self, pc: Reg, cycles: u32) {
        self.asm()
            .push_inst(Op::with2(Code::Mov_rm32_r32, field(PC_OFF), pc.to_reg32()));
        self.charge(cycles);
        self.jmp_exit_stub();
    }

    fn exit_to_dispatcher(&mut self, cycles: u32) {
        if cycles > 0 {
            self.charge(cycles);
        }
        self.jmp_exit_stub();
    }
}

impl<G> CodePatcher for X64Backend<G> {
    fn patch_exit(&mut self, site: CodeAddr, target: Option<CodeAddr>) {
        let to = target.map_or(self.exit_stub, |t| t.0);
        self.code.patch(site.0, &jmp_rel32(site.0, to));
    }

    fn exit_target(&self, site: CodeAddr) -> Option<CodeAddr> {
        let code = self.code.bytes(site.0..site.0 + JMP_REL32_LEN);
        jmp_rel32_target(site.0, code)
            .filter(|t| *t != self.exit_stub)
            .map(CodeAddr)
    }

    fn forget_block(&mut self, _id: BlockId, code: Range<usize>) {
        self.sites.forget_range(code);
    }

    fn clear_code(&mut self) {
        self.near_used = 0;
        self.far_used = self.far_shared;
        self.sites.clear();
    }
}

impl<G: Guest> Backpatch for X64Backend<G> {
    fn site_table(&mut self) -> &mut SiteTable {
        &mut self.sites
    }

    fn rewrite_site(
        &mut self,
        fault_addr: usize,
        site: &AccessSite,
    ) -> Result<usize, BackpatchError> {
        let err = |reason: &str| BackpatchError::Rewrite {
            addr: fault_addr,
            reason: reason.to_owned(),
        };
        let inst = decode_one(self.code.bytes(fault_addr..site.window.end), fault_addr);
        if inst.is_invalid()
            || inst.memory_base() != MEMBASE.to_reg64()
            || inst.memory_index() != SCRATCH.to_reg64()
        {
            return Err(err("not a fast memory access"));
        }
        let width =
            AccessWidth::from_bytes(inst.memory_size().size()).ok_or_else(|| err("bad width"))?;
        let (kind, value) = match inst.mnemonic() {
            Mnemonic::Mov if inst.op0_kind() == OpKind::Memory => {
                (AccessKind::Store { width }, inst.op1_register())
            }
            Mnemonic::Mov | Mnemonic::Movzx => (
                AccessKind::Load {
                    width,
                    signed: false,
                },
                inst.op0_register(),
            ),
            Mnemonic::Movsx => (
                AccessKind::Load {
                    width,
                    signed: true,
                },
                inst.op0_register(),
            ),
            _ => return Err(err("not a fast memory access")),
        };
        if kind != site.kind {
            return Err(err("instruction does not match its registered access"));
        }
        let value = Reg::from_iced(value).ok_or_else(|| err("unexpected value register"))?;

        let at = self.code.far().start + self.far_used;
        let mut a = Asm::new(at);
        match kind {
            AccessKind::Load { width, signed } => {
                slow_load(&mut a, value, width, signed, slow_read::<G> as usize)
            }
            AccessKind::Store { width } => {
                slow_store(&mut a, value, width, slow_write::<G> as usize)
            }
        }
        a.push_inst(Op::with_branch(Code::Jmp_rel32_64, site.window.end as u64));
        let tramp = a.finish().map_err(|e| err(&e.to_string()))?;
        if at + tramp.len() > self.code.far().end {
            return Err(err("trampoline space exhausted"));
        }
        self.code.write(at, &tramp);
        self.far_used += tramp.len().next_multiple_of(BLOCK_ALIGN);

        let mut patch = jmp_rel32(site.window.start, at).to_vec();
        patch.resize(site.window.len(), 0xCC);
        self.code.patch(site.window.start, &patch);
        Ok(at)
    }
}

impl<G: Guest + 'static> FaultTarget for X64Backend<G> {
    fn owns(&self, rip: usize) -> bool {
        self.code.contains(rip)
    }

    fn recover(&mut self, rip: usize) -> usize {
        match handle_fault(self, rip) {
            Ok(resume) => resume,
            Err(e) => {
                self.halted = Some((rip, e.to_string()));
                self.exit_stub
            }
        }
    }
}

impl<G: Guest + 'static> Backend<G> for X64Backend<G> {
    fn kind(&self) -> BackendKind {
        BackendKind::X64
    }

    fn begin_block(
        &mut self,
        id: BlockId,
        _start: GuestAddr,
    ) -> Result<(CodeAddr, CodeAddr), CompilationError> {
        if self.cur.is_some() {
            return Err(CompilationError::InternalError(
                "a block is already being emitted".into(),
            ));
        }
        let near = self.code.near();
        let off = self.near_used.next_multiple_of(BLOCK_ALIGN);
        if off + MIN_BLOCK_BYTES > near.len() {
            return Err(CompilationError::CacheFull);
        }
        let base = near.start + off;
        let mut asm = Asm::new(base);
        // The checked entry returns to the dispatcher if the timeslice is already exhausted.
        asm.push_inst(Op::with2(Code::Cmp_rm32_imm8, field(DOWNCOUNT_OFF), 0i32));
        asm.push_inst(Op::with_branch(Code::Jle_rel32_64, self.exit_stub as u64));
        let normal_entry = asm.addr();
        self.cur = Some(InProgress {
            asm,
            id,
            base,
            normal_entry,
            exits: Vec::new(),
            sites: Vec::new(),
        });
        Ok((CodeAddr(base), CodeAddr(normal_entry)))
    }

    fn end_block(&mut self) -> Result<BlockCode, CompilationError> {
        let cur = self
            .cur
            .take()
            .ok_or_else(|| CompilationError::InternalError("no block is being emitted".into()))?;
        let bytes = cur.asm.finish()?;
        let end = cur.base + bytes.len();
        if end > self.code.near().end {
            return Err(CompilationError::CacheFull);
        }
        self.code.write(cur.base, &bytes);
        self.near_used = end - self.code.near().start;
        for (fault_addr, site) in cur.sites {
            self.sites.register(fault_addr, site);
        }
        Ok(BlockCode {
            checked_entry: CodeAddr(cur.base),
            normal_entry: CodeAddr(cur.normal_entry),
            code: cur.base..end,
            exits: cur.exits,
        })
    }

    fn abandon_block(&mut self) {
        self.cur = None;
    }

    fn code_free(&self) -> usize {
        self.code.near().len() - self.near_used
    }

    fn min_block_space(&self) -> usize {
        MIN_BLOCK_BYTES
    }

    fn code_used(&self) -> usize {
        self.near_used
    }

    fn code_capacity(&self) -> usize {
        self.code.near().len()
    }

    fn trampolines_nearly_full(&self) -> bool {
        self.code.far().len() - self.far_used < TRAMPOLINE_RESERVE
    }

    fn execute(&mut self, entry: CodeAddr, env: &mut ExecEnv<'_, G>) -> ExecOutcome {
        let state: *mut GuestState = &mut *env.state;
        let ctx = (env as *mut ExecEnv<'_, G>).addr();
        let enter = unsafe {
            mem::transmute::<usize, extern "sysv64" fn(*mut GuestState, usize)>(self.enter)
        };
        unsafe {
            (*state).rt.ctx = ctx;
        }
        let me: *mut dyn FaultTarget = self as *mut Self;
        fault::with_active(me, || enter(state, entry.0));
        unsafe {
            (*state).rt.ctx = 0;
        }
        match self.halted.take() {
            Some((native_addr, reason)) => ExecOutcome::Halted {
                native_addr,
                reason,
            },
            None => ExecOutcome::Exited,
        }
    }

    fn faults_handled(&self) -> u64 {
        self.sites.handled()
    }

    fn disassemble(&self, code: Range<usize>) -> String {
        asm::disassemble(self.code.bytes(code.clone()), code.start)
    }
}
