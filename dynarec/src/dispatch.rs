//! The dispatch loop: the glue between the block store, the translator and a backend.
//!
//! Each dispatch accounts for elapsed time, delivers a pending guest exception, finds (or
//! translates) the block at the guest pc, and runs it. Generated code returns here when the
//! timeslice runs out, when an exit is not linked, or when it needs the dispatcher to do
//! something (deliver an exception, invalidate a cache line).

use crate::{
    cache::{BlockId, BlockStore, CompiledBlock, Invalidated},
    compile::{
        translate::{self, Translation},
        Backend, CodeAddr, CompilationError, ExecEnv, ExecOutcome,
    },
    config::{BackendKind, Config},
    guest::{Guest, GuestAddr, GuestException, GuestState, EXIT_INVALIDATE},
    hle::{HookFn, HookKind, HookTable},
    linker,
    log::{
        stats::{Stats, TimingState},
        Log, Verbosity,
    },
    BlockProfile, DispatchState, HaltInfo, InvalidationHandle, Jit, JitError, Profile, RunExit,
    RunLimit, StopHandle,
};
use parking_lot::Mutex;
use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// The size of a guest instruction cache line, which `Icbi` invalidates.
const ICACHE_LINE: u32 = 32;

pub(crate) struct Core<G: Guest, B: Backend<G>> {
    cfg: Config,
    be: B,
    store: BlockStore,
    guest: G,
    hooks: HookTable<G>,
    /// Boxed so that the address generated code is handed stays put.
    state: Box<GuestState>,
    /// The base of the guest's fast memory window, or 0.
    membase: usize,
    status: DispatchState,
    halt: Option<HaltInfo>,
    shut_down: bool,
    stop: Arc<AtomicBool>,
    inval: Arc<Mutex<Vec<(GuestAddr, u32)>>>,
    log: Log,
    stats: Stats,
    /// The downcount at the start of the current timeslice.
    slice_start: i32,
    lookups: u64,
    translations: u64,
    cache_clears: u64,
    blocks_invalidated: u64,
}

impl<G: Guest, B: Backend<G>> Core<G, B> {
    pub(crate) fn new(cfg: Config, be: B, guest: G) -> Result<Self, JitError> {
        let log = Log::new().map_err(|e| JitError::Config(e.to_string()))?;
        let membase = guest.fastmem_base().map_or(0, |p| p.as_ptr().addr());
        Ok(Self {
            store: BlockStore::new(&cfg),
            cfg,
            be,
            guest,
            hooks: HookTable::new(),
            state: Box::new(GuestState::new(0)),
            membase,
            status: DispatchState::Idle,
            halt: None,
            shut_down: false,
            stop: Arc::new(AtomicBool::new(false)),
            inval: Arc::new(Mutex::new(Vec::new())),
            log,
            stats: Stats::new(),
            slice_start: 0,
            lookups: 0,
            translations: 0,
            cache_clears: 0,
            blocks_invalidated: 0,
        })
    }

    fn check_runnable(&self) -> Result<(), JitError> {
        if self.shut_down {
            return Err(JitError::ShutDown);
        }
        match &self.halt {
            Some(h) => Err(JitError::Halted(h.clone())),
            None => Ok(()),
        }
    }

    /// Perform one dispatch.
    fn step(&mut self) -> Result<(), JitError> {
        self.status = DispatchState::Dispatch;
        self.stats.timing_state(TimingState::Dispatching);
        self.drain_invalidations();
        if self.be.trampolines_nearly_full() {
            self.clear("backpatch trampoline space is nearly exhausted");
        }
        if self.state.downcount <= 0 {
            self.new_timeslice();
        }
        if self.deliver_exception() {
            // The handler may have moved the pc, so start afresh next time round.
            return Ok(());
        }

        let pc = self.state.pc;
        self.lookups += 1;
        let id = match self.store.lookup(pc) {
            Some(id) => id,
            None => match self.translate_at(pc)? {
                Translation::Block(id) => id,
                Translation::Fault(exc) => {
                    if self.log.enabled(Verbosity::JitEvent) {
                        self.log.log(
                            Verbosity::JitEvent,
                            &format!("cannot translate at {pc:#x}: raising {exc}"),
                        );
                    }
                    self.guest.raise_exception(&mut self.state, exc);
                    return Ok(());
                }
            },
        };
        let entry = self
            .store
            .block(id)
            .map(|b| b.checked_entry)
            .ok_or_else(|| JitError::Internal(format!("block {id:?} vanished")))?;

        self.state.rt.membase = self.membase;
        self.state.rt.exit_flags = 0;
        let handled = self.be.faults_handled();
        self.status = DispatchState::Execute;
        self.stats.block_entered();
        self.stats.timing_state(TimingState::Executing);
        let outcome = {
            let mut env = ExecEnv {
                state: &mut *self.state,
                guest: &mut self.guest,
                hooks: &mut self.hooks,
            };
            self.be.execute(entry, &mut env)
        };
        self.stats.timing_state(TimingState::Dispatching);
        self.status = DispatchState::Dispatch;

        let handled = self.be.faults_handled() - handled;
        if handled > 0 {
            self.stats.backpatched(handled);
            self.log.log(
                Verbosity::JitEvent,
                &format!("rewrote {handled} faulting access(es) into slow-path calls"),
            );
        }

        match outcome {
            ExecOutcome::Exited => {
                if self.state.rt.exit_flags & EXIT_INVALIDATE != 0 {
                    let line = self.state.rt.invalidate_addr & !(ICACHE_LINE - 1);
                    self.invalidate(line, ICACHE_LINE);
                }
                Ok(())
            }
            ExecOutcome::Halted {
                native_addr,
                reason,
            } => {
                self.status = DispatchState::Faulted;
                let info = HaltInfo {
                    native_addr: CodeAddr(native_addr),
                    block: self.store.block_at_code(native_addr).map(|(_, b)| b.start),
                    pc,
                    reason,
                };
                self.log.log(Verbosity::Error, &format!("halted: {info}"));
                self.status = DispatchState::Halted;
                self.halt = Some(info.clone());
                Err(JitError::Halted(info))
            }
        }
    }

    /// Account for the cycles used since the last timeslice started and begin a new one.
    fn new_timeslice(&mut self) {
        let elapsed = i64::from(self.slice_start) - i64::from(self.state.downcount);
        self.state.downcount = self.cfg.timeslice;
        if elapsed > 0 {
            let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
            self.guest.advance_time(&mut self.state, elapsed);
        }
        // The guest may have shortened the slice to hit an event.
        self.slice_start = self.state.downcount;
    }

    /// Deliver the highest priority pending exception, if there is one. Returns `true` if an
    /// exception was delivered.
    fn deliver_exception(&mut self) -> bool {
        while self.state.exceptions != 0 {
            let bit = self.state.exceptions.trailing_zeros();
            self.state.exceptions &= !(1 << bit);
            match GuestException::from_repr(bit as u8) {
                Some(exc) => {
                    self.guest.raise_exception(&mut self.state, exc);
                    return true;
                }
                None => self.log.log(
                    Verbosity::Warning,
                    &format!("discarding unknown exception bit {bit}"),
                ),
            }
        }
        false
    }

    /// Translate the block at `pc`. If the cache is full, clear it and try once more.
    fn translate_at(&mut self, pc: GuestAddr) -> Result<Translation, JitError> {
        let mut cleared = false;
        loop {
            self.stats.timing_state(TimingState::Compiling);
            let r = translate::translate(
                &self.cfg,
                &mut self.store,
                &mut self.be,
                &mut self.guest,
                &self.hooks,
                pc,
            );
            self.stats.timing_state(TimingState::Dispatching);
            match r {
                Ok(Translation::Block(id)) => {
                    self.translations += 1;
                    self.stats.block_translated();
                    if self.log.dumps_code(self.be.kind()) {
                        if let Some(b) = self.store.block(id) {
                            self.log.dump_code(&format!(
                                "--- block {pc:#x} ({} instructions) ---\n{}--- end block ---\n",
                                b.num_insts,
                                self.be.disassemble(b.code.clone())
                            ));
                        }
                    }
                    if self.log.enabled(Verbosity::JitEvent) {
                        let n = self.store.block(id).map_or(0, |b| b.num_insts);
                        self.log.log(
                            Verbosity::JitEvent,
                            &format!("translated block at {pc:#x} ({n} instructions)"),
                        );
                    }
                    return Ok(Translation::Block(id));
                }
                Ok(t @ Translation::Fault(_)) => return Ok(t),
                Err(CompilationError::CacheFull) if !cleared => {
                    cleared = true;
                    self.clear("cache full");
                }
                Err(CompilationError::CacheFull) => {
                    return Err(JitError::Internal(format!(
                        "the block at {pc:#x} does not fit in an empty cache"
                    )))
                }
                Err(e) => return Err(JitError::Internal(e.to_string())),
            }
        }
    }

    fn drain_invalidations(&mut self) {
        let reqs = mem::take(&mut *self.inval.lock());
        for (start, len) in reqs {
            self.invalidate(start, len);
        }
    }

    fn invalidate(&mut self, start: GuestAddr, len: u32) {
        match self.store.invalidate(start, len, &mut self.be) {
            Invalidated::Evicted(0) => (),
            Invalidated::Evicted(n) => {
                self.blocks_invalidated += n as u64;
                self.stats.blocks_invalidated(n);
                if self.log.enabled(Verbosity::CacheEvent) {
                    self.log.log(
                        Verbosity::CacheEvent,
                        &format!("evicted {n} block(s) overlapping {start:#x}+{len:#x}"),
                    );
                }
            }
            Invalidated::Flushed => {
                self.cache_clears += 1;
                self.stats.cache_cleared();
                self.log.log(
                    Verbosity::CacheEvent,
                    &format!("invalidating {start:#x}+{len:#x} flushed the cache"),
                );
            }
        }
    }

    fn clear(&mut self, why: &str) {
        self.store.clear(&mut self.be);
        self.cache_clears += 1;
        self.stats.cache_cleared();
        self.log
            .log(Verbosity::CacheEvent, &format!("cache cleared: {why}"));
    }
}

impl<G: Guest, B: Backend<G>> Jit<G> for Core<G, B> {
    fn run(&mut self, limit: RunLimit) -> Result<RunExit, JitError> {
        self.check_runnable()?;
        let mut n = 0;
        let r = loop {
            if self.stop.swap(false, Ordering::AcqRel) {
                break Ok(RunExit::Stopped);
            }
            if let RunLimit::Dispatches(max) = limit {
                if n >= max {
                    break Ok(RunExit::LimitReached);
                }
            }
            if let Err(e) = self.step() {
                break Err(e);
            }
            n += 1;
        };
        if self.status != DispatchState::Halted {
            self.status = DispatchState::Idle;
        }
        self.stats.timing_state(TimingState::None);
        r
    }

    fn single_step(&mut self) -> Result<(), JitError> {
        self.check_runnable()?;
        let r = self.step();
        if self.status != DispatchState::Halted {
            self.status = DispatchState::Idle;
        }
        self.stats.timing_state(TimingState::None);
        r
    }

    fn translate(&mut self, addr: GuestAddr) -> Result<Option<BlockId>, JitError> {
        self.check_runnable()?;
        if let Some(id) = self.store.find(addr) {
            return Ok(Some(id));
        }
        let r = match self.translate_at(addr)? {
            Translation::Block(id) => Some(id),
            Translation::Fault(_) => None,
        };
        self.stats.timing_state(TimingState::None);
        Ok(r)
    }

    fn lookup(&mut self, addr: GuestAddr) -> Option<BlockId> {
        self.lookups += 1;
        self.store.lookup(addr)
    }

    fn block(&self, id: BlockId) -> Option<&CompiledBlock> {
        self.store.block(id).filter(|b| b.is_valid())
    }

    fn exit_target(&self, id: BlockId, idx: usize) -> Option<CodeAddr> {
        self.store
            .exit(id, idx)
            .and_then(|e| self.be.exit_target(e.site))
    }

    fn link_exit(&mut self, id: BlockId, idx: usize) -> bool {
        linker::link_exit(&mut self.store, &mut self.be, id, idx)
    }

    fn unlink_exit(&mut self, id: BlockId, idx: usize) {
        linker::unlink_exit(&mut self.store, &mut self.be, id, idx)
    }

    fn invalidate_range(&mut self, start: GuestAddr, len: u32) {
        self.invalidate(start, len);
    }

    fn invalidation_handle(&self) -> InvalidationHandle {
        InvalidationHandle(Arc::clone(&self.inval))
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    fn register_hook(&mut self, addr: GuestAddr, kind: HookKind, f: HookFn<G>) {
        self.hooks.register(addr, kind, f);
        self.invalidate(addr, 1);
    }

    fn clear_cache(&mut self) {
        self.clear("requested by the embedder");
    }

    fn reset(&mut self, pc: GuestAddr) {
        self.clear("reset");
        *self.state = GuestState::new(pc);
        self.slice_start = 0;
        self.halt = None;
        self.status = DispatchState::Idle;
        self.stop.store(false, Ordering::Release);
        self.inval.lock().clear();
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            self.stats.output();
            self.store.clear(&mut self.be);
            self.shut_down = true;
            self.status = DispatchState::Idle;
        }
    }

    fn profile(&self) -> Profile {
        let mut blocks = self
            .store
            .iter()
            .map(|(id, b)| BlockProfile {
                start: b.start,
                num_insts: b.num_insts,
                run_count: self.store.run_count(id),
            })
            .collect::<Vec<_>>();
        blocks.sort_by_key(|b| b.start);
        Profile {
            occupancy: self.store.occupancy(),
            capacity: self.store.capacity(),
            code_used: self.be.code_used(),
            code_capacity: self.be.code_capacity(),
            lookups: self.lookups,
            translations: self.translations,
            cache_clears: self.cache_clears,
            blocks_invalidated: self.blocks_invalidated,
            faults_handled: self.be.faults_handled(),
            blocks,
        }
    }

    fn status(&self) -> DispatchState {
        self.status
    }

    fn backend(&self) -> BackendKind {
        self.be.kind()
    }

    fn state(&self) -> &GuestState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut GuestState {
        &mut self.state
    }

    fn guest(&self) -> &G {
        &self.guest
    }

    fn guest_mut(&mut self) -> &mut G {
        &mut self.guest
    }
}

impl<G: Guest, B: Backend<G>> Drop for Core<G, B> {
    fn drop(&mut self) {
        if !self.shut_down {
            self.stats.output();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backpatch::Backpatch,
        compile::ops::OpsBackend,
        guest::{AccessWidth, AluOp, Cond, Decoded, GuestReg, Inst},
        testing::{TestGuest, MMIO_VALUE, VECTOR},
        JitBuilder,
    };
    use std::thread;

    const R0: GuestReg = GuestReg::Gpr(0);
    const R1: GuestReg = GuestReg::Gpr(1);
    const R2: GuestReg = GuestReg::Gpr(2);
    const R3: GuestReg = GuestReg::Gpr(3);
    const R4: GuestReg = GuestReg::Gpr(4);

    fn kinds() -> Vec<BackendKind> {
        #[allow(unused_mut)]
        let mut v = vec![BackendKind::Ops];
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        v.push(BackendKind::X64);
        v
    }

    fn builder(kind: BackendKind) -> JitBuilder {
        JitBuilder::new()
            .backend(kind)
            .code_size(1 << 16)
            .far_code_size(1 << 16)
            .max_blocks(256)
            .fast_map_bits(8)
    }

    /// Build one JIT per backend, each driving the guest `guest` returns.
    fn jits(
        cfg: impl Fn(JitBuilder) -> JitBuilder,
        guest: impl Fn() -> TestGuest,
    ) -> Vec<Box<dyn Jit<TestGuest>>> {
        kinds()
            .into_iter()
            .map(|k| {
                let jit = cfg(builder(k)).build(guest()).unwrap();
                assert_eq!(jit.backend(), k);
                jit
            })
            .collect()
    }

    fn at(jit: &mut Box<dyn Jit<TestGuest>>, pc: GuestAddr) -> &mut Box<dyn Jit<TestGuest>> {
        jit.state_mut().pc = pc;
        jit
    }

    #[test]
    fn straight_line_block() {
        let prog = [
            Inst::LoadImm { rd: R1, imm: 5 },
            Inst::AddImm {
                rd: R2,
                ra: R1,
                imm: 3,
            },
            Inst::Alu {
                op: AluOp::Add,
                rd: R3,
                ra: R1,
                rb: R2,
            },
            Inst::Sync,
        ];
        for mut jit in jits(|b| b, || TestGuest::new().program(0x1000, &prog)) {
            at(&mut jit, 0x1000).single_step().unwrap();
            let s = jit.state();
            assert_eq!(&s.gpr[..5], &[0, 5, 8, 13, 0]);
            assert!(s.gpr[5..].iter().all(|&x| x == 0));
            assert_eq!((s.lr, s.pc, s.acc), (0, 0x1010, [0, 0]));
            assert_eq!(jit.status(), DispatchState::Idle);
            let p = jit.profile();
            assert_eq!((p.occupancy, p.translations, p.lookups), (1, 1, 1));
            assert_eq!(p.blocks[0].num_insts, 4);
        }
    }

    #[test]
    fn linked_exit_skips_the_dispatcher() {
        let guest = || {
            TestGuest::new()
                .program(
                    0x1000,
                    &[
                        Inst::AddImm {
                            rd: R1,
                            ra: R1,
                            imm: 1,
                        },
                        Inst::Sync,
                    ],
                )
                .program(
                    0x2000,
                    &[Inst::BranchCond {
                        cond: Cond::Eq,
                        ra: R0,
                        rb: R0,
                        target: 0x1000,
                    }],
                )
        };
        for mut jit in jits(|b| b.block_linking(false), guest) {
            let a = jit.translate(0x1000).unwrap().unwrap();
            let b = jit.translate(0x2000).unwrap().unwrap();
            // Exit 0 is the fall through, exit 1 the taken branch.
            assert_eq!(jit.block(b).unwrap().exits[1].target, 0x1000);
            assert_eq!(jit.exit_target(b, 1), None);
            assert!(jit.link_exit(b, 1));
            assert!(!jit.link_exit(b, 0));
            assert_eq!(
                jit.exit_target(b, 1),
                Some(jit.block(a).unwrap().normal_entry)
            );

            // The first dispatch only starts the timeslice.
            let lookups = jit.profile().lookups;
            at(&mut jit, 0x2000).single_step().unwrap();
            assert_eq!(jit.state().gpr[1], 1);
            assert_eq!(jit.state().pc, 0x1008);
            assert_eq!(jit.profile().lookups, lookups + 1);

            jit.unlink_exit(b, 1);
            assert_eq!(jit.exit_target(b, 1), None);
            at(&mut jit, 0x2000).single_step().unwrap();
            assert_eq!(jit.state().gpr[1], 1);
            assert_eq!(jit.state().pc, 0x1000);
            assert_eq!(jit.profile().lookups, lookups + 2);
        }
    }

    #[test]
    fn self_linked_loop_runs_for_a_timeslice() {
        let prog = [
            Inst::AddImm {
                rd: R1,
                ra: R1,
                imm: 1,
            },
            Inst::Branch {
                target: 0x1000,
                link: false,
            },
        ];
        for mut jit in jits(
            |b| b.timeslice(100).profiling(true),
            || TestGuest::new().program(0x1000, &prog),
        ) {
            assert_eq!(
                at(&mut jit, 0x1000).run(RunLimit::Dispatches(5)).unwrap(),
                RunExit::LimitReached
            );
            // Each iteration costs 2 cycles, so a slice of 100 runs 50 of them.
            assert_eq!(jit.state().gpr[1], 250);
            assert_eq!(jit.state().downcount, 0);
            assert_eq!(jit.guest().elapsed, 400);
            let p = jit.profile();
            assert_eq!((p.lookups, p.translations), (5, 1));
            assert_eq!(p.blocks.len(), 1);
            assert_eq!(p.blocks[0].run_count, 250);
        }
    }

    /// The parts of a [GuestState] guest code can see.
    fn visible(s: &GuestState) -> (Vec<u32>, u32, GuestAddr, i32, u32, Vec<u64>) {
        (
            s.gpr.to_vec(),
            s.lr,
            s.pc,
            s.downcount,
            s.exceptions,
            s.acc.to_vec(),
        )
    }

    #[test]
    fn moves_round_trip_through_the_allocator() {
        let gpr = GuestReg::Gpr;
        let mut prog = Vec::new();
        // Every guest register is live at once, so the allocator has to evict.
        for i in 0..16 {
            prog.push(Inst::Move {
                rd: gpr(i + 1),
                rs: gpr(i + 16),
            });
        }
        prog.extend([
            Inst::Move {
                rd: GuestReg::Lr,
                rs: gpr(5),
            },
            Inst::Move {
                rd: GuestReg::AccLo(0),
                rs: gpr(7),
            },
            Inst::Move {
                rd: GuestReg::AccHi(1),
                rs: GuestReg::Lr,
            },
            Inst::Move {
                rd: gpr(30),
                rs: GuestReg::AccHi(0),
            },
            Inst::Move {
                rd: GuestReg::Acc(1),
                rs: GuestReg::Acc(0),
            },
            Inst::Move {
                rd: gpr(31),
                rs: GuestReg::Acc(1),
            },
            Inst::Move {
                rd: GuestReg::AccHi(0),
                rs: gpr(0),
            },
            Inst::Move {
                rd: gpr(2),
                rs: gpr(1),
            },
            Inst::Move {
                rd: GuestReg::Acc(0),
                rs: gpr(3),
            },
            Inst::Move {
                rd: gpr(17),
                rs: gpr(17),
            },
        ]);
        prog.push(Inst::Sync);

        let mut seed = GuestState::new(0x1000);
        for (i, r) in seed.gpr.iter_mut().enumerate() {
            *r = 0x0101_0101 * (i as u32 + 1);
        }
        seed.lr = 0xCAFE_0000;
        seed.acc = [0x1111_2222_3333_4444, 0x5555_6666_7777_8888];

        let mut expected = seed.clone();
        for inst in &prog {
            if let Inst::Move { rd, rs } = *inst {
                let wide = rd.is_wide() && rs.is_wide();
                let v = expected.read(rs);
                expected.write(rd, if wide { v } else { v & 0xFFFF_FFFF });
            }
        }
        expected.pc = 0x1000 + 4 * prog.len() as GuestAddr;
        expected.downcount = 1000 - prog.len() as i32;

        for mut jit in jits(
            |b| b.timeslice(1000),
            || TestGuest::new().program(0x1000, &prog),
        ) {
            *jit.state_mut() = seed.clone();
            jit.single_step().unwrap();
            assert_eq!(visible(jit.state()), visible(&expected));
        }
    }

    #[test]
    fn mul_acc_uses_the_low_half_of_wide_operands() {
        let prog = [
            Inst::LoadImm { rd: R1, imm: 3 },
            Inst::MulAcc {
                acc: 0,
                ra: R1,
                rb: GuestReg::Acc(1),
            },
            Inst::MulAcc {
                acc: 0,
                ra: GuestReg::Acc(1),
                rb: R1,
            },
            Inst::MulAcc {
                acc: 0,
                ra: GuestReg::AccHi(1),
                rb: R1,
            },
            Inst::Sync,
        ];
        for mut jit in jits(|b| b, || TestGuest::new().program(0x1000, &prog)) {
            jit.state_mut().acc = [0x10, 0x1_0000_0002];
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.state().acc, [0x10 + 6 + 6 + 3, 0x1_0000_0002]);
        }
    }

    #[test]
    fn unaligned_blocks_in_one_word() {
        let guest = || {
            let mut g = TestGuest::new();
            for (addr, inst, len) in [
                (0x1000, Inst::LoadImm { rd: R1, imm: 1 }, 1),
                (
                    0x1001,
                    Inst::AddImm {
                        rd: R2,
                        ra: R2,
                        imm: 1,
                    },
                    3,
                ),
                (0x1004, Inst::Sync, 4),
            ] {
                g.prog.insert(
                    addr,
                    Decoded {
                        inst,
                        len,
                        cycles: 1,
                    },
                );
            }
            g
        };
        for mut jit in jits(|b| b, guest) {
            jit.translate(0x1000).unwrap().unwrap();
            let b = jit.translate(0x1001).unwrap().unwrap();
            jit.invalidate_range(0x1000, 1);
            assert_eq!(jit.lookup(0x1000), None);
            assert_eq!(jit.lookup(0x1001), Some(b));

            at(&mut jit, 0x1001).single_step().unwrap();
            assert_eq!((jit.state().gpr[2], jit.state().pc), (1, 0x1008));
            assert_eq!(jit.profile().translations, 2);

            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(&jit.state().gpr[1..3], &[1, 2]);
            let p = jit.profile();
            assert_eq!((p.occupancy, p.translations), (2, 3));
        }
    }

    #[test]
    fn slow_path_access_is_backpatched_once() {
        let prog = [
            Inst::LoadImm {
                rd: R2,
                imm: 0x2_0000,
            },
            Inst::Load {
                width: AccessWidth::Word,
                signed: false,
                rd: R1,
                ra: R2,
                offset: 4,
            },
            Inst::Load {
                width: AccessWidth::Half,
                signed: false,
                rd: R3,
                ra: R0,
                offset: 0x100,
            },
            Inst::Sync,
        ];
        let guest = || {
            let mut g = TestGuest::new().program(0x1000, &prog);
            g.write_ram(0x100, 0xAAAA_BBBB);
            g
        };
        for mut jit in jits(|b| b, guest) {
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.state().gpr[1], MMIO_VALUE);
            assert_eq!(jit.state().gpr[3], 0xBBBB);
            assert_eq!(jit.guest().mmio_reads, [0x2_0004]);
            assert_eq!(jit.profile().faults_handled, 1);

            jit.state_mut().gpr[1] = 0;
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.state().gpr[1], MMIO_VALUE);
            assert_eq!(jit.guest().mmio_reads, [0x2_0004, 0x2_0004]);
            assert_eq!(jit.profile().faults_handled, 1);
            assert_eq!(jit.profile().translations, 1);
        }
    }

    #[test]
    fn stores_reach_ram_and_mmio() {
        let prog = [
            Inst::LoadImm {
                rd: R1,
                imm: 0xDEAD_BEEF,
            },
            Inst::LoadImm {
                rd: R2,
                imm: 0x3_0000,
            },
            Inst::Store {
                width: AccessWidth::Word,
                rs: R1,
                ra: R0,
                offset: 0x200,
            },
            Inst::Store {
                width: AccessWidth::Byte,
                rs: R1,
                ra: R2,
                offset: -1,
            },
            Inst::Sync,
        ];
        let with_fastmem = || TestGuest::new().program(0x1000, &prog);
        let without = || TestGuest::new().program(0x1000, &prog).without_fastmem();
        for guest in [&with_fastmem as &dyn Fn() -> TestGuest, &without] {
            for mut jit in jits(|b| b, guest) {
                at(&mut jit, 0x1000).single_step().unwrap();
                assert_eq!(jit.guest().read_ram(0x200), 0xDEAD_BEEF);
                assert_eq!(jit.guest().mmio_writes, [(0x2_FFFF, 0xEF)]);
            }
        }
    }

    #[test]
    fn forward_skip_stays_in_one_block() {
        let prog = [
            Inst::BranchCond {
                cond: Cond::Eq,
                ra: R1,
                rb: R0,
                target: 0x100c,
            },
            Inst::AddImm {
                rd: R2,
                ra: R2,
                imm: 1,
            },
            Inst::AddImm {
                rd: R3,
                ra: R3,
                imm: 1,
            },
            Inst::AddImm {
                rd: R4,
                ra: R4,
                imm: 1,
            },
            Inst::Sync,
        ];
        for mut jit in jits(
            |b| b.timeslice(1000),
            || TestGuest::new().program(0x1000, &prog),
        ) {
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(&jit.state().gpr[1..5], &[0, 0, 0, 1]);
            // Skipped instructions are charged too.
            assert_eq!(jit.state().downcount, 1000 - 5);

            jit.state_mut().gpr[1] = 1;
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(&jit.state().gpr[1..5], &[1, 1, 1, 2]);
            assert_eq!(jit.state().pc, 0x1014);
            let p = jit.profile();
            assert_eq!((p.occupancy, p.translations), (1, 1));
            assert_eq!(p.blocks[0].num_insts, 5);
        }
    }

    #[test]
    fn traps_are_delivered_at_the_next_dispatch() {
        let guest = || {
            TestGuest::new()
                .program(
                    0x1000,
                    &[Inst::Trap {
                        kind: GuestException::Syscall,
                    }],
                )
                .program(VECTOR, &[Inst::Sync])
        };
        for mut jit in jits(|b| b, guest) {
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.state().pc, 0x1004);
            assert_eq!(jit.state().exceptions, GuestException::Syscall.bit());
            assert!(jit.guest().exceptions.is_empty());

            jit.single_step().unwrap();
            assert_eq!(jit.state().exceptions, 0);
            assert_eq!(
                jit.guest().exceptions,
                [(0x1004, GuestException::Syscall)]
            );
            assert_eq!(jit.state().lr, 0x1004);
            assert_eq!(jit.state().pc, VECTOR);

            jit.single_step().unwrap();
            assert_eq!(jit.state().pc, VECTOR + 4);
        }
    }

    #[test]
    fn pending_exceptions_are_delivered_in_priority_order() {
        for mut jit in jits(|b| b, TestGuest::new) {
            jit.state_mut().set_exception(GuestException::External);
            jit.state_mut().set_exception(GuestException::DataAccess);
            at(&mut jit, 0x1000).single_step().unwrap();
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(
                jit.guest().exceptions,
                [
                    (0x1000, GuestException::DataAccess),
                    (0x1000, GuestException::External)
                ]
            );
            assert_eq!(jit.profile().translations, 0);
        }
    }

    #[test]
    fn undecodable_code_raises_without_caching() {
        for mut jit in jits(|b| b, TestGuest::new) {
            at(&mut jit, 0x5000).single_step().unwrap();
            assert_eq!(
                jit.guest().exceptions,
                [(0x5000, GuestException::InstructionFetch)]
            );
            assert_eq!(jit.state().pc, VECTOR);
            assert_eq!(jit.profile().occupancy, 0);
            assert_eq!(jit.translate(0x5000).unwrap(), None);
        }
    }

    #[test]
    fn interpreted_instructions() {
        let prog = [
            Inst::LoadImm { rd: R1, imm: 10 },
            Inst::Interpret { word: 1 },
            Inst::AddImm {
                rd: R1,
                ra: R1,
                imm: 1,
            },
            Inst::Interpret { word: 99 },
            Inst::AddImm {
                rd: R4,
                ra: R4,
                imm: 1,
            },
            Inst::Sync,
        ];
        for mut jit in jits(|b| b, || TestGuest::new().program(0x1000, &prog)) {
            at(&mut jit, 0x1000).single_step().unwrap();
            // The interpreter's write to r1 is seen by the instruction after it.
            assert_eq!(jit.state().gpr[1], 12);
            // The second interpretation raised an exception, so the block stopped after it.
            assert_eq!(jit.state().gpr[4], 0);
            assert_eq!(jit.state().pc, 0x1010);
            assert_eq!(jit.guest().interpreted, [(0x1004, 1), (0x100c, 99)]);
            jit.single_step().unwrap();
            assert_eq!(jit.guest().exceptions, [(0x1010, GuestException::Program)]);
        }
    }

    #[test]
    fn hooks() {
        let guest = || {
            TestGuest::new()
                .program(
                    0x1000,
                    &[
                        Inst::AddImm {
                            rd: R1,
                            ra: R1,
                            imm: 1,
                        },
                        Inst::Sync,
                    ],
                )
                .program(0x2000, &[Inst::Sync])
        };
        for mut jit in jits(|b| b, guest) {
            jit.translate(0x1000).unwrap().unwrap();
            jit.register_hook(
                0x1000,
                HookKind::Start,
                Box::new(|s: &mut GuestState, _: &mut TestGuest| s.gpr[6] += 1),
            );
            assert_eq!(jit.lookup(0x1000), None);
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!((jit.state().gpr[1], jit.state().gpr[6]), (1, 1));

            // A replaced function is never decoded.
            jit.register_hook(
                0x3000,
                HookKind::Replace,
                Box::new(|s: &mut GuestState, g: &mut TestGuest| {
                    s.gpr[5] = g.decodes.len() as u32;
                    s.pc = s.lr;
                }),
            );
            jit.state_mut().lr = 0x2000;
            at(&mut jit, 0x3000).single_step().unwrap();
            assert_eq!(jit.state().pc, 0x2000);
            assert!(jit.state().gpr[5] > 0);
            assert!(!jit.guest().decodes.contains(&0x3000));
            jit.single_step().unwrap();
            assert_eq!(jit.state().pc, 0x2004);
        }
    }

    #[test]
    fn icbi_invalidates_the_line() {
        let guest = || {
            TestGuest::new()
                .program(0x1000, &[Inst::LoadImm { rd: R1, imm: 7 }, Inst::Sync])
                .program(
                    0x2000,
                    &[
                        Inst::LoadImm {
                            rd: R2,
                            imm: 0x1010,
                        },
                        Inst::Icbi { ra: R2, offset: 4 },
                    ],
                )
        };
        for mut jit in jits(|b| b, guest) {
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.state().gpr[1], 7);

            jit.guest_mut()
                .load(0x1000, &[Inst::LoadImm { rd: R1, imm: 9 }, Inst::Sync]);
            at(&mut jit, 0x2000).single_step().unwrap();
            assert_eq!(jit.state().pc, 0x2008);
            assert_eq!(jit.lookup(0x1000), None);
            assert!(jit.lookup(0x2000).is_some());
            assert_eq!(jit.profile().blocks_invalidated, 1);

            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.state().gpr[1], 9);
        }
    }

    #[test]
    fn invalidation_from_another_thread() {
        let prog = [Inst::LoadImm { rd: R1, imm: 7 }, Inst::Sync];
        for mut jit in jits(|b| b, || TestGuest::new().program(0x1000, &prog)) {
            at(&mut jit, 0x1000).single_step().unwrap();
            let h = jit.invalidation_handle();
            thread::spawn(move || h.invalidate(0x1004, 4))
                .join()
                .unwrap();
            // Nothing happens until the next dispatch.
            assert!(jit.lookup(0x1000).is_some());
            at(&mut jit, 0x1000).single_step().unwrap();
            let p = jit.profile();
            assert_eq!((p.blocks_invalidated, p.translations), (1, 2));
        }
    }

    #[test]
    fn full_cache_is_cleared_and_retried() {
        let prog = |next| {
            [Inst::Branch {
                target: next,
                link: false,
            }]
        };
        let guest = || {
            TestGuest::new()
                .program(0x1000, &prog(0x1010))
                .program(0x1010, &prog(0x1020))
                .program(0x1020, &[Inst::Sync])
        };
        for mut jit in jits(|b| b.max_blocks(2), guest) {
            at(&mut jit, 0x1000).single_step().unwrap();
            jit.single_step().unwrap();
            assert_eq!(jit.profile().occupancy, 2);
            jit.single_step().unwrap();
            assert_eq!(jit.state().pc, 0x1024);
            let p = jit.profile();
            assert_eq!((p.occupancy, p.translations, p.cache_clears), (1, 3, 1));
            assert_eq!(p.blocks[0].start, 0x1020);
        }
    }

    #[test]
    fn clearing_is_idempotent() {
        let prog = [Inst::LoadImm { rd: R1, imm: 1 }, Inst::Sync];
        for mut jit in jits(|b| b, || TestGuest::new().program(0x1000, &prog)) {
            at(&mut jit, 0x1000).single_step().unwrap();
            jit.clear_cache();
            let used = jit.profile().code_used;
            jit.clear_cache();
            let p = jit.profile();
            assert_eq!((p.occupancy, p.cache_clears, p.code_used), (0, 2, used));
            at(&mut jit, 0x1000).single_step().unwrap();
            assert_eq!(jit.profile().occupancy, 1);
        }
    }

    #[test]
    fn stop_reset_and_shutdown() {
        let prog = [Inst::Branch {
            target: 0x1000,
            link: false,
        }];
        for mut jit in jits(
            |b| b.timeslice(10),
            || TestGuest::new().program(0x1000, &prog),
        ) {
            let stop = jit.stop_handle();
            stop.stop();
            assert_eq!(
                at(&mut jit, 0x1000).run(RunLimit::Forever).unwrap(),
                RunExit::Stopped
            );
            assert_eq!(jit.profile().lookups, 0);

            let t = thread::spawn(move || stop.stop());
            t.join().unwrap();
            assert_eq!(jit.run(RunLimit::Forever).unwrap(), RunExit::Stopped);

            jit.run(RunLimit::Dispatches(3)).unwrap();
            jit.state_mut().gpr[9] = 9;
            jit.reset(0x1000);
            assert_eq!(jit.state().gpr[9], 0);
            assert_eq!(jit.profile().occupancy, 0);
            assert_eq!(jit.status(), DispatchState::Idle);

            jit.shutdown();
            assert!(matches!(
                jit.run(RunLimit::Dispatches(1)),
                Err(JitError::ShutDown)
            ));
            assert!(matches!(jit.translate(0x1000), Err(JitError::ShutDown)));
        }
    }

    /// Make the slow-path load at 0x1004 unrecoverable by forgetting its access site.
    fn check_halt<B: Backend<TestGuest> + Backpatch>(mut core: Core<TestGuest, B>) {
        core.guest.load(
            0x1000,
            &[
                Inst::LoadImm {
                    rd: R2,
                    imm: 0x2_0000,
                },
                Inst::Load {
                    width: AccessWidth::Word,
                    signed: true,
                    rd: R1,
                    ra: R2,
                    offset: 0,
                },
                Inst::Sync,
            ],
        );
        core.translate(0x1000).unwrap().unwrap();
        core.be.site_table().clear();
        let info = match at_core(&mut core, 0x1000).single_step() {
            Err(JitError::Halted(info)) => info,
            r => panic!("{r:?}"),
        };
        assert_eq!(info.block, Some(0x1000));
        assert_eq!(info.pc, 0x1000);
        assert_eq!(core.status(), DispatchState::Halted);
        assert!(matches!(
            core.run(RunLimit::Dispatches(1)),
            Err(JitError::Halted(_))
        ));

        core.reset(0x1000);
        core.single_step().unwrap();
        assert_eq!(core.state().gpr[1], MMIO_VALUE);
        assert_eq!(core.profile().faults_handled, 1);
    }

    fn at_core<B: Backend<TestGuest>>(
        core: &mut Core<TestGuest, B>,
        pc: GuestAddr,
    ) -> &mut Core<TestGuest, B> {
        core.state.pc = pc;
        core
    }

    #[test]
    fn halt_and_reset_ops() {
        let cfg = builder(BackendKind::Ops).config();
        let be = OpsBackend::new(cfg.code_size);
        check_halt(Core::new(cfg, be, TestGuest::new()).unwrap());
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn halt_and_reset_x64() {
        let cfg = builder(BackendKind::X64).config();
        let be = crate::compile::x64::X64Backend::new(&cfg, true).unwrap();
        check_halt(Core::new(cfg, be, TestGuest::new()).unwrap());
    }
}
