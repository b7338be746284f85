//! The op executor.

use super::{Op, OpsBackend, FIRST_CALLER_SAVED, NUM_OREGS};
use crate::{
    backpatch::handle_fault,
    compile::{ExecEnv, ExecOutcome},
    guest::{AccessWidth, Guest, GuestState, EXIT_INVALIDATE},
};
use std::ptr::NonNull;

/// The value caller-saved registers hold after a call into host code.
const CLOBBERED: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Read the guest state field at byte offset `off`.
fn state_read(state: &GuestState, off: u32, wide: bool) -> u64 {
    let p = (state as *const GuestState).cast::<u8>();
    debug_assert!(off as usize + if wide { 8 } else { 4 } <= size_of::<GuestState>());
    // Offsets come from `GuestReg::state_offset` and are within the struct.
    unsafe {
        let p = p.add(off as usize);
        if wide {
            p.cast::<u64>().read_unaligned()
        } else {
            u64::from(p.cast::<u32>().read_unaligned())
        }
    }
}

fn state_write(state: &mut GuestState, off: u32, wide: bool, val: u64) {
    let p = (state as *mut GuestState).cast::<u8>();
    debug_assert!(off as usize + if wide { 8 } else { 4 } <= size_of::<GuestState>());
    unsafe {
        let p = p.add(off as usize);
        if wide {
            p.cast::<u64>().write_unaligned(val)
        } else {
            p.cast::<u32>().write_unaligned(val as u32)
        }
    }
}

/// Read little-endian guest memory through a host pointer.
fn host_read(p: NonNull<u8>, width: AccessWidth) -> u32 {
    let p = p.as_ptr();
    unsafe {
        match width {
            AccessWidth::Byte => u32::from(p.read()),
            AccessWidth::Half => u32::from(u16::from_le(p.cast::<u16>().read_unaligned())),
            AccessWidth::Word => u32::from_le(p.cast::<u32>().read_unaligned()),
        }
    }
}

fn host_write(p: NonNull<u8>, width: AccessWidth, val: u32) {
    let p = p.as_ptr();
    unsafe {
        match width {
            AccessWidth::Byte => p.write(val as u8),
            AccessWidth::Half => p.cast::<u16>().write_unaligned((val as u16).to_le()),
            AccessWidth::Word => p.cast::<u32>().write_unaligned(val.to_le()),
        }
    }
}

impl OpsBackend {
    /// Run ops from `entry` until one returns to the dispatcher.
    pub(super) fn run<G: Guest>(&mut self, entry: usize, env: &mut ExecEnv<'_, G>) -> ExecOutcome {
        let mut regs = [0u64; NUM_OREGS];
        let r = |regs: &[u64; NUM_OREGS], x: super::OReg| regs[usize::from(x.0)];
        let r32 = |regs: &[u64; NUM_OREGS], x: super::OReg| regs[usize::from(x.0)] as u32;
        let clobber = |regs: &mut [u64; NUM_OREGS]| {
            regs[FIRST_CALLER_SAVED..].fill(CLOBBERED);
        };
        let charge = |state: &mut GuestState, cycles: u32| {
            state.downcount = state.downcount.wrapping_sub(cycles as i32);
        };

        let mut ip = entry;
        loop {
            let Some(op) = self.buf.get(ip) else {
                return ExecOutcome::Halted {
                    native_addr: ip,
                    reason: "execution ran off the end of the op buffer".into(),
                };
            };
            ip += 1;
            match op {
                Op::CheckDowncount => {
                    if env.state.downcount <= 0 {
                        return ExecOutcome::Exited;
                    }
                }
                Op::LoadState { dst, off, wide } => {
                    regs[usize::from(dst.0)] = state_read(env.state, off, wide)
                }
                Op::StoreState { src, off, wide } => {
                    state_write(env.state, off, wide, r(&regs, src))
                }
                Op::Copy { dst, src, wide } => {
                    let v = r(&regs, src);
                    regs[usize::from(dst.0)] = if wide { v } else { v & 0xFFFF_FFFF };
                }
                Op::Extract { dst, src, shift } => {
                    regs[usize::from(dst.0)] = (r(&regs, src) >> shift) & 0xFFFF_FFFF
                }
                Op::MovImm { dst, imm } => regs[usize::from(dst.0)] = u64::from(imm),
                Op::Alu { op, dst, a, b } => {
                    regs[usize::from(dst.0)] = u64::from(op.eval(r32(&regs, a), r32(&regs, b)))
                }
                Op::AddImm { dst, a, imm } => {
                    regs[usize::from(dst.0)] = u64::from(r32(&regs, a).wrapping_add(imm as u32))
                }
                Op::ShiftImm { op, dst, a, amount } => {
                    regs[usize::from(dst.0)] = u64::from(op.eval(r32(&regs, a), amount))
                }
                Op::MulAcc { acc, a, b } => {
                    let prod = u64::from(r32(&regs, a)) * u64::from(r32(&regs, b));
                    regs[usize::from(acc.0)] = r(&regs, acc).wrapping_add(prod);
                }
                Op::Load {
                    dst,
                    base,
                    offset,
                    width,
                    signed,
                    slow,
                    ..
                } => {
                    let addr = r32(&regs, base).wrapping_add(offset as i32 as u32);
                    let v = if slow {
                        env.guest.read(addr, width)
                    } else {
                        match env.guest.translate(addr, width) {
                            Some(p) => host_read(p, width),
                            None => {
                                match handle_fault(self, ip - 1) {
                                    Ok(resume) => ip = resume,
                                    Err(e) => {
                                        return ExecOutcome::Halted {
                                            native_addr: ip - 1,
                                            reason: e.to_string(),
                                        }
                                    }
                                }
                                continue;
                            }
                        }
                    };
                    regs[usize::from(dst.0)] = u64::from(width.extend(v, signed));
                }
                Op::Store {
                    src,
                    base,
                    offset,
                    width,
                    slow,
                    ..
                } => {
                    let addr = r32(&regs, base).wrapping_add(offset as i32 as u32);
                    let v = r32(&regs, src);
                    if slow {
                        env.guest.write(addr, width, v);
                    } else {
                        match env.guest.translate(addr, width) {
                            Some(p) => host_write(p, width, v),
                            None => match handle_fault(self, ip - 1) {
                                Ok(resume) => ip = resume,
                                Err(e) => {
                                    return ExecOutcome::Halted {
                                        native_addr: ip - 1,
                                        reason: e.to_string(),
                                    }
                                }
                            },
                        }
                    }
                }
                Op::Interpret { pc, word } => {
                    env.guest.interpret(env.state, pc, word);
                    clobber(&mut regs);
                }
                Op::ExitIfException { next, cycles } => {
                    if env.state.exceptions != 0 {
                        env.state.pc = next;
                        charge(env.state, cycles);
                        return ExecOutcome::Exited;
                    }
                }
                Op::Hook(id) => {
                    env.hooks.call(id, env.state, env.guest);
                    clobber(&mut regs);
                }
                Op::CountRun(p) => unsafe { *p += 1 },
                Op::Jump(t) => ip = t,
                Op::BranchIf { cond, a, b, target } => {
                    if cond.eval(r32(&regs, a), r32(&regs, b)) {
                        ip = target;
                    }
                }
                Op::SetPc(pc) => env.state.pc = pc,
                Op::Raise(exc) => env.state.set_exception(exc),
                Op::Invalidate(a) => {
                    env.state.rt.invalidate_addr = r32(&regs, a);
                    env.state.rt.exit_flags |= EXIT_INVALIDATE;
                }
                Op::Exit { target, cycles } => {
                    env.state.pc = target;
                    charge(env.state, cycles);
                    if env.state.downcount <= 0 {
                        return ExecOutcome::Exited;
                    }
                }
                Op::Link(Some(t)) => ip = t,
                Op::Link(None) => return ExecOutcome::Exited,
                Op::ExitIndirect { pc, cycles } => {
                    env.state.pc = r32(&regs, pc);
                    charge(env.state, cycles);
                    return ExecOutcome::Exited;
                }
                Op::ExitToDispatcher { cycles } => {
                    charge(env.state, cycles);
                    return ExecOutcome::Exited;
                }
            }
        }
    }
}
