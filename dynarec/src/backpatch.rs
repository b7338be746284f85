//! Fault-based backpatching.
//!
//! Generated code accesses guest memory on the assumption that the address lies in the fast
//! memory window. When that assumption is wrong the access faults, and the backend hands the
//! faulting code address to [handle_fault]. If the address is one the translator registered as
//! a guest memory access, the backend rewrites the access in place so that it (and every later
//! execution of it) goes through the guest's slow read/write routines, and execution resumes.
//! A fault anywhere else is a bug in the generated code and cannot be recovered from.
//!
//! [handle_fault] can be reached from a signal handler while a block is running. It therefore
//! never translates, and refuses to run if a previous invocation has not yet finished.

use crate::{
    cache::BlockId,
    guest::{AccessWidth, GuestAddr},
};
use std::{collections::BTreeMap, ops::Range};
use thiserror::Error;

/// What kind of guest memory access a site performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AccessKind {
    Load { width: AccessWidth, signed: bool },
    Store { width: AccessWidth },
}

/// A guest memory access in generated code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AccessSite {
    /// The guest instruction the access belongs to.
    pub(crate) pc: GuestAddr,
    pub(crate) block: BlockId,
    pub(crate) kind: AccessKind,
    /// The code that may be overwritten when the site is rewritten. This always contains the
    /// faulting instruction but may start before it.
    pub(crate) window: Range<usize>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum BackpatchError {
    #[error("no guest memory access registered at {0:#x}")]
    UnknownSite(usize),
    #[error("fault at {0:#x} while a previous fault was being handled")]
    Reentered(usize),
    #[error("cannot rewrite the access at {addr:#x}: {reason}")]
    Rewrite { addr: usize, reason: String },
}

/// The registered access sites of every live block, keyed by the code address of the
/// instruction that can fault.
#[derive(Default)]
pub(crate) struct SiteTable {
    sites: BTreeMap<usize, AccessSite>,
    busy: bool,
    handled: u64,
}

impl SiteTable {
    pub(crate) fn register(&mut self, fault_addr: usize, site: AccessSite) {
        debug_assert!(site.window.contains(&fault_addr));
        self.sites.insert(fault_addr, site);
    }

    /// Forget every site whose faulting instruction lies in `code`.
    pub(crate) fn forget_range(&mut self, code: Range<usize>) {
        let doomed = self
            .sites
            .range(code)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        for k in doomed {
            self.sites.remove(&k);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.sites.clear();
    }

    pub(crate) fn get(&self, fault_addr: usize) -> Option<&AccessSite> {
        self.sites.get(&fault_addr)
    }

    /// How many sites have been rewritten?
    pub(crate) fn handled(&self) -> u64 {
        self.handled
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sites.len()
    }
}

/// A backend whose generated code can be backpatched.
pub(crate) trait Backpatch {
    fn site_table(&mut self) -> &mut SiteTable;

    /// Rewrite `site`, which faulted at `fault_addr`, so that it calls the slow access routine.
    /// Returns the code address execution should resume at.
    fn rewrite_site(&mut self, fault_addr: usize, site: &AccessSite)
        -> Result<usize, BackpatchError>;
}

/// Handle a fault at `fault_addr` in `b`'s generated code, returning the address to resume at.
///
/// A site is rewritten at most once: after a successful rewrite it is removed from the table,
/// so a second fault at the same address is reported as [BackpatchError::UnknownSite].
pub(crate) fn handle_fault<B: Backpatch + ?Sized>(
    b: &mut B,
    fault_addr: usize,
) -> Result<usize, BackpatchError> {
    let tbl = b.site_table();
    if tbl.busy {
        return Err(BackpatchError::Reentered(fault_addr));
    }
    let site = tbl
        .get(fault_addr)
        .cloned()
        .ok_or(BackpatchError::UnknownSite(fault_addr))?;
    tbl.busy = true;
    let r = b.rewrite_site(fault_addr, &site);
    let tbl = b.site_table();
    tbl.busy = false;
    if r.is_ok() {
        tbl.sites.remove(&fault_addr);
        tbl.handled += 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Code is a byte per address: 0 for a fast access, 1 once rewritten.
    struct ByteCode {
        code: Vec<u8>,
        sites: SiteTable,
        nested: bool,
    }

    impl Backpatch for ByteCode {
        fn site_table(&mut self) -> &mut SiteTable {
            &mut self.sites
        }

        fn rewrite_site(
            &mut self,
            fault_addr: usize,
            site: &AccessSite,
        ) -> Result<usize, BackpatchError> {
            if self.nested {
                return handle_fault(self, fault_addr);
            }
            for b in &mut self.code[site.window.clone()] {
                *b = 1;
            }
            Ok(site.window.start)
        }
    }

    fn code() -> ByteCode {
        let mut sites = SiteTable::default();
        sites.register(
            5,
            AccessSite {
                pc: 0x1000,
                block: BlockId::from_usize(0),
                kind: AccessKind::Load {
                    width: AccessWidth::Word,
                    signed: false,
                },
                window: 4..6,
            },
        );
        ByteCode {
            code: vec![0; 8],
            sites,
            nested: false,
        }
    }

    #[test]
    fn rewrites_once() {
        let mut c = code();
        assert_eq!(handle_fault(&mut c, 5), Ok(4));
        assert_eq!(c.code, [0, 0, 0, 0, 1, 1, 0, 0]);
        assert_eq!(c.sites.handled(), 1);
        assert_eq!(handle_fault(&mut c, 5), Err(BackpatchError::UnknownSite(5)));
        assert_eq!(c.sites.handled(), 1);
    }

    #[test]
    fn unknown_site() {
        let mut c = code();
        assert_eq!(handle_fault(&mut c, 4), Err(BackpatchError::UnknownSite(4)));
        assert_eq!(c.code, [0; 8]);
    }

    #[test]
    fn reentry_is_refused() {
        let mut c = code();
        c.nested = true;
        assert_eq!(handle_fault(&mut c, 5), Err(BackpatchError::Reentered(5)));
        // The site survives a failed rewrite, and the guard is released.
        c.nested = false;
        assert_eq!(handle_fault(&mut c, 5), Ok(4));
    }

    #[test]
    fn forget_range() {
        let mut c = code();
        c.sites.forget_range(0..5);
        assert_eq!(c.sites.len(), 1);
        c.sites.forget_range(5..6);
        assert_eq!(c.sites.len(), 0);
    }
}
