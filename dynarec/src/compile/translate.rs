//! The translator: turns a run of guest instructions into one block of code.
//!
//! A block starts at the requested address and continues until an instruction which transfers
//! control (branches, traps, `Sync`, `Icbi`), until the configured maximum number of
//! instructions, or until the next instruction is at an address with a host-call hook. A
//! conditional branch which skips forward over a handful of straight-line instructions doesn't
//! end the block: both paths are translated inline and the register allocator reconciles them at
//! the branch target.
//!
//! Cycle accounting is per block: every exit charges the cycles of all instructions translated
//! before it, including instructions a forward skip may have jumped over.

use crate::{
    cache::{BlockId, BlockStore},
    compile::{Backend, CompilationError, Emitter},
    config::Config,
    guest::{Cond, Decoded, Guest, GuestAddr, GuestException, GuestReg, Inst},
    hle::{HookId, HookKind, HookTable},
    regalloc::{Access, RegAlloc},
};
use smallvec::SmallVec;

/// The cycles charged for a block that only calls a replacing hook.
const HOOK_CYCLES: u32 = 1;
/// The guest bytes a replacing hook's block is deemed to cover, so that invalidating the hooked
/// address evicts it.
const HOOK_BYTES: u32 = 4;

/// The result of translating at an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Translation {
    /// A block was created and finalised.
    Block(BlockId),
    /// The first instruction could not be decoded: the guest must take this exception. Nothing
    /// was added to the cache.
    Fault(GuestException),
}

/// Translate the block starting at `start` and add it to `store`.
pub(crate) fn translate<G: Guest, B: Backend<G>>(
    cfg: &Config,
    store: &mut BlockStore,
    be: &mut B,
    guest: &mut G,
    hooks: &HookTable<G>,
    start: GuestAddr,
) -> Result<Translation, CompilationError> {
    let hook = hooks.lookup(start);
    let first = match hook {
        Some((_, HookKind::Replace)) => None,
        _ => match decode(guest, start) {
            Ok(d) => Some(d),
            Err(exc) => return Ok(Translation::Fault(exc)),
        },
    };

    let id = store.allocate(start, be.code_free(), be.min_block_space())?;
    let counter = cfg.profiling.then(|| store.run_counter(id));
    let mut t = Translator {
        cfg,
        ra: RegAlloc::new(be.allocatable()),
        be: &mut *be,
        guest,
        hooks,
        cycles: 0,
        insts: 0,
    };
    let end = match t.emit_block(id, start, first, hook, counter) {
        Ok(end) => end,
        Err(e) => {
            be.abandon_block();
            store.abandon(id);
            return Err(e);
        }
    };
    let insts = t.insts as u32;
    let code = match be.end_block() {
        Ok(code) => code,
        Err(e) => {
            store.abandon(id);
            return Err(e);
        }
    };
    store.finalize(id, code, end.wrapping_sub(start).max(1), insts, be);
    Ok(Translation::Block(id))
}

/// Decode the instruction at `addr`, rejecting encodings that name registers the guest doesn't
/// have.
fn decode<G: Guest>(guest: &mut G, addr: GuestAddr) -> Result<Decoded, GuestException> {
    let d = guest.decode(addr)?;
    if d.len == 0 || d.inst.operands().iter().any(|r| !r.is_valid()) {
        return Err(GuestException::Program);
    }
    Ok(d)
}

/// Can `inst` be translated inside a forward skip?
fn is_straight_line(inst: &Inst) -> bool {
    !inst.ends_block() && !matches!(inst, Inst::Interpret { .. })
}

struct Translator<'a, G: Guest, B: Backend<G>> {
    cfg: &'a Config,
    be: &'a mut B,
    guest: &'a mut G,
    hooks: &'a HookTable<G>,
    ra: RegAlloc<B::Reg>,
    /// Cycles of every instruction translated so far.
    cycles: u32,
    insts: usize,
}

impl<G: Guest, B: Backend<G>> Translator<'_, G, B> {
    /// Emit the whole block, returning the guest address just past its last instruction.
    fn emit_block(
        &mut self,
        id: BlockId,
        start: GuestAddr,
        first: Option<Decoded>,
        hook: Option<(HookId, HookKind)>,
        counter: Option<*mut u64>,
    ) -> Result<GuestAddr, CompilationError> {
        self.be.begin_block(id, start)?;
        if let Some(c) = counter {
            self.be.count_run(c);
        }
        if let Some((hid, kind)) = hook {
            self.be.call_hook(hid);
            if kind == HookKind::Replace {
                self.cycles += HOOK_CYCLES;
                self.be.exit_to_dispatcher(self.cycles);
                return Ok(start.wrapping_add(HOOK_BYTES));
            }
        }

        let mut pc = start;
        let mut d = first.ok_or_else(|| {
            CompilationError::InternalError(format!("nothing to translate at {start:#x}"))
        })?;
        loop {
            self.insts += 1;
            self.cycles += d.cycles;
            let mut next = pc.wrapping_add(d.len);
            match d.inst {
                Inst::BranchCond { cond, ra, rb, target } => {
                    match self.skippable(next, target) {
                        Some(skipped) => {
                            self.emit_skip(cond, ra, rb, skipped)?;
                            next = target;
                        }
                        None => {
                            self.emit_branch_cond(next, cond, ra, rb, target)?;
                            return Ok(next);
                        }
                    }
                }
                inst if inst.ends_block() => {
                    self.emit_terminator(pc, next, inst)?;
                    return Ok(next);
                }
                inst => self.emit_straight_line(pc, next, inst)?,
            }

            if self.insts >= self.cfg.max_block_insts || self.hooks.lookup(next).is_some() {
                return self.fallthrough(next);
            }
            match decode(self.guest, next) {
                Ok(x) => {
                    d = x;
                    pc = next;
                }
                // Let the dispatcher raise the exception if execution really gets there.
                Err(_) => return self.fallthrough(next),
            }
        }
    }

    /// End the block with a linkable exit to `next`.
    fn fallthrough(&mut self, next: GuestAddr) -> Result<GuestAddr, CompilationError> {
        self.ra.flush_all(self.be);
        self.be.exit(next, self.cycles);
        Ok(next)
    }

    fn acquire(&mut self, reg: GuestReg, access: Access) -> Result<B::Reg, CompilationError> {
        self.ra.acquire(self.be, reg, access)
    }

    fn emit_straight_line(
        &mut self,
        pc: GuestAddr,
        next: GuestAddr,
        inst: Inst,
    ) -> Result<(), CompilationError> {
        self.ra.begin_inst(&inst.operands());
        match inst {
            Inst::LoadImm { rd, imm } => {
                let d = self.acquire(rd, Access::Write)?;
                self.be.mov_imm(d, imm);
            }
            Inst::Move { rd, rs } => {
                if rd != rs {
                    let s = self.acquire(rs, Access::Read)?;
                    let d = self.acquire(rd, Access::Write)?;
                    self.be.copy(d, s, rd.is_wide() && rs.is_wide());
                }
            }
            Inst::AddImm { rd, ra, imm } => {
                let a = self.acquire(ra, Access::Read)?;
                let d = self.acquire(rd, Access::Write)?;
                self.be.add_imm(d, a, imm);
            }
            Inst::Alu { op, rd, ra, rb } => {
                let a = self.acquire(ra, Access::Read)?;
                let b = self.acquire(rb, Access::Read)?;
                let d = self.acquire(rd, Access::Write)?;
                self.be.alu(op, d, a, b);
            }
            Inst::ShiftImm { op, rd, ra, amount } => {
                let a = self.acquire(ra, Access::Read)?;
                let d = self.acquire(rd, Access::Write)?;
                self.be.shift_imm(op, d, a, amount);
            }
            Inst::MulAcc { acc, ra, rb } => {
                let a = self.acquire(ra, Access::Read)?;
                let b = self.acquire(rb, Access::Read)?;
                let c = self.acquire(GuestReg::Acc(acc), Access::ReadWrite)?;
                self.be.mul_acc(c, a, b);
            }
            Inst::Load {
                width,
                signed,
                rd,
                ra,
                offset,
            } => {
                let a = self.acquire(ra, Access::Read)?;
                let d = self.acquire(rd, Access::Write)?;
                self.be.guest_load(pc, d, a, offset, width, signed);
            }
            Inst::Store {
                width,
                rs,
                ra,
                offset,
            } => {
                let s = self.acquire(rs, Access::Read)?;
                let a = self.acquire(ra, Access::Read)?;
                self.be.guest_store(pc, s, a, offset, width);
            }
            Inst::Interpret { word } => {
                self.ra.flush_all(self.be);
                self.be.call_interpret(pc, word);
                self.ra.end_inst();
                self.ra.reset();
                self.be.exit_if_exception(next, self.cycles);
                return Ok(());
            }
            _ => {
                return Err(CompilationError::InternalError(format!(
                    "{inst:?} at {pc:#x} is not a straight-line instruction"
                )))
            }
        }
        self.ra.end_inst();
        Ok(())
    }

    /// If the conditional branch whose fall-through is `next` can be translated as a forward
    /// skip to `target`, return the instructions it skips.
    fn skippable(
        &mut self,
        next: GuestAddr,
        target: GuestAddr,
    ) -> Option<SmallVec<[(GuestAddr, Decoded); 4]>> {
        if self.cfg.max_skip_insts == 0 || target <= next {
            return None;
        }
        let mut skipped = SmallVec::new();
        let mut addr = next;
        while addr < target {
            if skipped.len() == self.cfg.max_skip_insts
                || self.insts + skipped.len() >= self.cfg.max_block_insts
                || self.hooks.lookup(addr).is_some()
            {
                return None;
            }
            let d = decode(self.guest, addr).ok()?;
            if !is_straight_line(&d.inst) {
                return None;
            }
            skipped.push((addr, d));
            addr = addr.checked_add(d.len)?;
        }
        (addr == target).then_some(skipped)
    }

    /// Translate a conditional branch over `skipped` inline. Afterwards both paths are at the
    /// branch target with the same allocator state.
    fn emit_skip(
        &mut self,
        cond: Cond,
        ra: GuestReg,
        rb: GuestReg,
        skipped: SmallVec<[(GuestAddr, Decoded); 4]>,
    ) -> Result<(), CompilationError> {
        self.ra.begin_inst(&[ra, rb]);
        let a = self.acquire(ra, Access::Read)?;
        let b = self.acquire(rb, Access::Read)?;
        self.ra.end_inst();
        let taken = self.ra.snapshot();
        let l = self.be.new_label();
        self.be.branch_if(cond, a, b, l);
        for (pc, d) in skipped {
            self.insts += 1;
            self.cycles += d.cycles;
            self.emit_straight_line(pc, pc.wrapping_add(d.len), d.inst)?;
        }
        self.ra.merge(self.be, &taken, l);
        Ok(())
    }

    /// End the block with a conditional branch: a taken exit to `target` and a not-taken exit to
    /// `next`.
    fn emit_branch_cond(
        &mut self,
        next: GuestAddr,
        cond: Cond,
        ra: GuestReg,
        rb: GuestReg,
        target: GuestAddr,
    ) -> Result<(), CompilationError> {
        self.ra.begin_inst(&[ra, rb]);
        let a = self.acquire(ra, Access::Read)?;
        let b = self.acquire(rb, Access::Read)?;
        self.ra.flush_all(self.be);
        let taken = self.be.new_label();
        self.be.branch_if(cond, a, b, taken);
        self.ra.end_inst();
        self.be.exit(next, self.cycles);
        self.be.bind(taken);
        self.be.exit(target, self.cycles);
        Ok(())
    }

    fn emit_terminator(
        &mut self,
        pc: GuestAddr,
        next: GuestAddr,
        inst: Inst,
    ) -> Result<(), CompilationError> {
        self.ra.begin_inst(&inst.operands());
        match inst {
            Inst::Branch { target, link } => {
                if link {
                    let lr = self.acquire(GuestReg::Lr, Access::Write)?;
                    self.be.mov_imm(lr, next);
                }
                self.ra.flush_all(self.be);
                self.be.exit(target, self.cycles);
            }
            Inst::BranchReg { ra, link } => {
                let a = self.acquire(ra, Access::Read)?;
                let t = if link {
                    // `ra` may be the link register itself.
                    let t = self.ra.scratch(self.be)?;
                    self.be.copy(t, a, false);
                    let lr = self.acquire(GuestReg::Lr, Access::Write)?;
                    self.be.mov_imm(lr, next);
                    t
                } else {
                    a
                };
                self.ra.flush_all(self.be);
                self.be.exit_indirect(t, self.cycles);
            }
            Inst::Trap { kind } => {
                self.ra.flush_all(self.be);
                self.be.set_pc(next);
                self.be.raise(kind);
                self.be.exit_to_dispatcher(self.cycles);
            }
            Inst::Sync => {
                self.ra.flush_all(self.be);
                self.be.set_pc(next);
                self.be.exit_to_dispatcher(self.cycles);
            }
            Inst::Icbi { ra, offset } => {
                let a = self.acquire(ra, Access::Read)?;
                let t = self.ra.scratch(self.be)?;
                self.be.add_imm(t, a, i32::from(offset));
                self.be.request_invalidate(t);
                self.ra.flush_all(self.be);
                self.be.set_pc(next);
                self.be.exit_to_dispatcher(self.cycles);
            }
            _ => {
                return Err(CompilationError::InternalError(format!(
                    "{inst:?} at {pc:#x} does not end a block"
                )))
            }
        }
        self.ra.end_inst();
        Ok(())
    }
}
