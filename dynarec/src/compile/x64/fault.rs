//! Catching faults in generated code.
//!
//! A fast memory access to an address outside guest RAM touches the `PROT_NONE` part of the
//! fast memory window and raises `SIGSEGV`. The handler asks the backend whose code is running on
//! this thread to recover; if it can, execution resumes wherever the backend says. Faults outside
//! generated code, or on threads not running generated code, are passed to the default action.

use libc::{
    SA_NODEFER, SA_SIGINFO, SIG_DFL, SIGBUS, SIGSEGV, c_int, c_void, sigaction, sigemptyset,
    siginfo_t, ucontext_t,
};
use std::{cell::Cell, mem, ptr, sync::Once};

/// Something which can recover from faults in code it generated.
pub(super) trait FaultTarget {
    /// Is `rip` inside code this target generated?
    fn owns(&self, rip: usize) -> bool;
    /// Recover from a fault at `rip`, returning the address to resume at.
    fn recover(&mut self, rip: usize) -> usize;
}

thread_local! {
    static ACTIVE: Cell<Option<*mut dyn FaultTarget>> = const { Cell::new(None) };
}

static INSTALL: Once = Once::new();

fn install() {
    INSTALL.call_once(|| unsafe {
        for sig in [SIGSEGV, SIGBUS] {
            let mut sa: sigaction = mem::zeroed();
            sa.sa_sigaction = on_fault as usize;
            sa.sa_flags = SA_SIGINFO | SA_NODEFER;
            sigemptyset(&mut sa.sa_mask);
            sigaction(sig, &sa, ptr::null_mut());
        }
    });
}

/// Run `f` with `target` registered as the code running on this thread.
pub(super) fn with_active<R>(target: *mut dyn FaultTarget, f: impl FnOnce() -> R) -> R {
    install();
    let prev = ACTIVE.with(|a| a.replace(Some(target)));
    let r = f();
    ACTIVE.with(|a| a.set(prev));
    r
}

extern "C" fn on_fault(sig: c_int, _info: *mut siginfo_t, ctx: *mut c_void) {
    let uc = ctx.cast::<ucontext_t>();
    let rip = unsafe { (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] } as usize;
    let target = ACTIVE.with(|a| a.get());
    match target {
        Some(t) if unsafe { (*t).owns(rip) } => {
            let resume = unsafe { (*t).recover(rip) };
            unsafe {
                (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] = resume as i64;
            }
        }
        _ => unsafe {
            // Not ours: restore the default action. Returning re-executes the faulting
            // instruction, which then takes it.
            let mut sa: sigaction = mem::zeroed();
            sa.sa_sigaction = SIG_DFL;
            sigemptyset(&mut sa.sa_mask);
            sigaction(sig, &sa, ptr::null_mut());
        },
    }
}
