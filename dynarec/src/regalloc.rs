//! The register allocator: maps guest registers onto host registers for the duration of a block.
//!
//! Every guest register has a home in [crate::guest::GuestState]. While a block is translated,
//! the allocator tracks, per guest register, whether its current value is in a host register and
//! whether that value differs from the home copy ("dirty"). Loads are emitted lazily, the first
//! time a register is read; stores are deferred until the register is evicted or until
//! [RegAlloc::flush_all] (which must happen before any exit from generated code and before any
//! call into host code).
//!
//! Guest registers which are views into a wider register (the accumulator halves) have no
//! storage of their own in the allocator: reading one while the parent is resident extracts the
//! bits from the parent. Writing a view evicts the parent (after writing it back if dirty);
//! writing a parent evicts its views. Reading a parent first writes back dirty views, so that the
//! home location is current.
//!
//! The allocator's state is a plain value ([RegState]). To translate a conditional skip over a
//! few instructions, the translator takes a [RegAlloc::snapshot] at the branch, translates the
//! skipped instructions, and then [RegAlloc::merge]s the snapshot back in: the result is the
//! state both paths agree on, with each path writing back whatever dirty values the other can't
//! account for.

use crate::{
    compile::{CompilationError, Emitter, HostReg, MAX_HOST_REGS},
    guest::{GuestReg, NUM_SLOTS},
};
use smallvec::SmallVec;

/// How an instruction uses a guest register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    /// The current value is needed.
    Read,
    /// The register is overwritten without being read.
    Write,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    /// If the value is in a host register, its position in [RegAlloc::regs].
    loc: Option<u8>,
    dirty: bool,
    /// The instruction clock when this slot was last used.
    last_use: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Owner {
    Guest(u8),
    /// A temporary, freed at the end of the instruction.
    Scratch,
}

/// A snapshot of the allocator's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RegState {
    slots: [Slot; NUM_SLOTS],
    owners: [Option<Owner>; MAX_HOST_REGS],
}

impl RegState {
    fn new() -> Self {
        Self {
            slots: [Slot {
                loc: None,
                dirty: false,
                last_use: 0,
            }; NUM_SLOTS],
            owners: [None; MAX_HOST_REGS],
        }
    }
}

pub(crate) struct RegAlloc<R: HostReg> {
    /// The registers we may allocate, in order of preference.
    regs: &'static [R],
    st: RegState,
    /// A bitmask of positions in `regs` that may not be evicted before [Self::end_inst].
    locked: u32,
    /// The guest registers the current instruction names.
    operands: SmallVec<[GuestReg; 3]>,
    clock: u32,
}

impl<R: HostReg> RegAlloc<R> {
    pub(crate) fn new(regs: &'static [R]) -> Self {
        assert!(regs.len() <= MAX_HOST_REGS);
        Self {
            regs,
            st: RegState::new(),
            locked: 0,
            operands: SmallVec::new(),
            clock: 0,
        }
    }

    /// Start allocating for an instruction naming `operands`.
    pub(crate) fn begin_inst(&mut self, operands: &[GuestReg]) {
        debug_assert_eq!(self.locked, 0);
        self.clock += 1;
        self.operands.clear();
        self.operands.extend_from_slice(operands);
    }

    /// Finish the current instruction: unlock its registers and free its scratch registers.
    pub(crate) fn end_inst(&mut self) {
        for owner in self.st.owners.iter_mut() {
            if *owner == Some(Owner::Scratch) {
                *owner = None;
            }
        }
        self.locked = 0;
        self.operands.clear();
    }

    /// Return a host register holding `reg`, emitting whatever loads, extracts and write-backs
    /// that requires. The register stays locked until [Self::end_inst] or [Self::release].
    pub(crate) fn acquire<E: Emitter<Reg = R>>(
        &mut self,
        e: &mut E,
        reg: GuestReg,
        access: Access,
    ) -> Result<R, CompilationError> {
        let s = reg.slot();
        if let Some((parent, _)) = reg.parent() {
            if access != Access::Read {
                self.evict_slot(e, parent.slot())?;
            }
        } else if let Some(views) = reg.views() {
            for v in views {
                self.write_back(e, v.slot());
                if access != Access::Read {
                    self.evict_slot(e, v.slot())?;
                }
            }
        }

        if let Some(pos) = self.st.slots[s].loc {
            let slot = &mut self.st.slots[s];
            slot.last_use = self.clock;
            slot.dirty |= access != Access::Read;
            self.locked |= 1 << pos;
            return Ok(self.regs[usize::from(pos)]);
        }

        let pos = self.alloc_pos(e)?;
        let r = self.regs[usize::from(pos)];
        if access != Access::Write {
            match reg
                .parent()
                .and_then(|(p, shift)| self.st.slots[p.slot()].loc.map(|ppos| (ppos, shift)))
            {
                Some((ppos, shift)) => e.extract(r, self.regs[usize::from(ppos)], shift),
                None => e.load_state(r, reg.state_offset(), reg.is_wide()),
            }
        }
        self.st.owners[usize::from(pos)] = Some(Owner::Guest(s as u8));
        self.st.slots[s] = Slot {
            loc: Some(pos),
            dirty: access != Access::Read,
            last_use: self.clock,
        };
        self.locked |= 1 << pos;
        Ok(r)
    }

    /// Return a host register not associated with any guest register. It is freed at
    /// [Self::end_inst].
    pub(crate) fn scratch<E: Emitter<Reg = R>>(&mut self, e: &mut E) -> Result<R, CompilationError> {
        let pos = self.alloc_pos(e)?;
        self.st.owners[usize::from(pos)] = Some(Owner::Scratch);
        self.locked |= 1 << pos;
        Ok(self.regs[usize::from(pos)])
    }

    /// Allow `reg`'s host register to be evicted again before the end of the instruction.
    pub(crate) fn release(&mut self, reg: GuestReg) {
        if let Some(pos) = self.st.slots[reg.slot()].loc {
            self.locked &= !(1 << pos);
        }
    }

    /// Write every dirty register back to its home. Values stay resident.
    pub(crate) fn flush_all<E: Emitter<Reg = R>>(&mut self, e: &mut E) {
        for s in 0..NUM_SLOTS {
            self.write_back(e, s);
        }
    }

    /// Forget every resident value, e.g. after a call into host code which may have changed the
    /// guest state or clobbered host registers. Everything must have been flushed beforehand.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.st.slots.iter().all(|x| !x.dirty));
        self.st = RegState::new();
        self.locked = 0;
    }

    pub(crate) fn snapshot(&self) -> RegState {
        debug_assert_eq!(self.locked, 0);
        self.st.clone()
    }

    /// Reconcile the current (fall-through) state with `taken`, the state on a path which jumps
    /// to `taken_label`. Afterwards the fall-through path and the taken path both arrive at the
    /// same point in the same state.
    ///
    /// A register stays resident only if both paths hold it in the same host register with the
    /// same dirtiness. Each path writes back its dirty registers that don't meet that condition.
    /// The taken path's write-backs need a stub, which is only emitted if there are any.
    pub(crate) fn merge<E: Emitter<Reg = R>>(
        &mut self,
        e: &mut E,
        taken: &RegState,
        taken_label: E::Label,
    ) {
        debug_assert_eq!(self.locked, 0);
        let mut keep = [false; NUM_SLOTS];
        for (s, k) in keep.iter_mut().enumerate() {
            let (ft, tk) = (&self.st.slots[s], &taken.slots[s]);
            *k = ft.loc.is_some() && ft.loc == tk.loc && ft.dirty == tk.dirty;
        }

        for (s, k) in keep.iter().enumerate() {
            if !k {
                self.write_back(e, s);
            }
        }
        let taken_stores = (0..NUM_SLOTS)
            .filter(|&s| !keep[s] && taken.slots[s].dirty)
            .filter_map(|s| taken.slots[s].loc.map(|pos| (s, pos)))
            .collect::<SmallVec<[_; 8]>>();
        if taken_stores.is_empty() {
            e.bind(taken_label);
        } else {
            let join = e.new_label();
            e.jump(join);
            e.bind(taken_label);
            for (s, pos) in taken_stores {
                let reg = GuestReg::from_slot(s);
                e.store_state(
                    self.regs[usize::from(pos)],
                    reg.state_offset(),
                    reg.is_wide(),
                );
            }
            e.bind(join);
        }

        let mut joined = RegState::new();
        for (s, &k) in keep.iter().enumerate() {
            if k {
                let ft = self.st.slots[s];
                joined.slots[s] = Slot {
                    last_use: ft.last_use.max(taken.slots[s].last_use),
                    ..ft
                };
                if let Some(pos) = ft.loc {
                    joined.owners[usize::from(pos)] = Some(Owner::Guest(s as u8));
                }
            }
        }
        self.st = joined;
    }

    /// If `reg` is in a host register, which?
    #[cfg(test)]
    pub(crate) fn location(&self, reg: GuestReg) -> Option<R> {
        self.st.slots[reg.slot()]
            .loc
            .map(|pos| self.regs[usize::from(pos)])
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self, reg: GuestReg) -> bool {
        self.st.slots[reg.slot()].dirty
    }

    /// If slot `s` is dirty, store it to its home and mark it clean.
    fn write_back<E: Emitter<Reg = R>>(&mut self, e: &mut E, s: usize) {
        let slot = &mut self.st.slots[s];
        if let (true, Some(pos)) = (slot.dirty, slot.loc) {
            let reg = GuestReg::from_slot(s);
            e.store_state(
                self.regs[usize::from(pos)],
                reg.state_offset(),
                reg.is_wide(),
            );
            slot.dirty = false;
        }
    }

    /// Write back slot `s` if needed and then release its host register.
    fn evict_slot<E: Emitter<Reg = R>>(
        &mut self,
        e: &mut E,
        s: usize,
    ) -> Result<(), CompilationError> {
        if let Some(pos) = self.st.slots[s].loc {
            if self.locked & (1 << pos) != 0 {
                return Err(CompilationError::InternalError(format!(
                    "{} and one of its views used by the same instruction",
                    GuestReg::from_slot(s)
                )));
            }
            self.write_back(e, s);
            self.st.slots[s].loc = None;
            self.st.owners[usize::from(pos)] = None;
        }
        Ok(())
    }

    /// Find a free host register, evicting a guest register if necessary.
    ///
    /// Clean registers are evicted in preference to dirty ones (which need a store). Among
    /// those, the least recently used goes first, with ties going against registers that the
    /// current instruction doesn't name.
    fn alloc_pos<E: Emitter<Reg = R>>(&mut self, e: &mut E) -> Result<u8, CompilationError> {
        if let Some(pos) = (0..self.regs.len()).find(|&i| self.st.owners[i].is_none()) {
            return Ok(pos as u8);
        }
        let victim = (0..self.regs.len())
            .filter(|&pos| self.locked & (1 << pos) == 0)
            .filter_map(|pos| match self.st.owners[pos] {
                Some(Owner::Guest(s)) => Some((pos, usize::from(s))),
                _ => None,
            })
            .min_by_key(|&(_, s)| {
                let slot = &self.st.slots[s];
                let is_operand = self.operands.iter().any(|r| r.slot() == s);
                (slot.dirty, slot.last_use, is_operand)
            });
        match victim {
            Some((pos, s)) => {
                self.evict_slot(e, s)?;
                Ok(pos as u8)
            }
            None => Err(CompilationError::InternalError(
                "every host register is in use by the current instruction".into(),
            )),
        }
    }
}
