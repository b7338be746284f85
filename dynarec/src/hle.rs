//! Host-call hooks: guest addresses whose code is replaced by, or prefixed with, a call into host
//! code (high level emulation of well known guest functions).

use crate::guest::{GuestAddr, GuestState};
use index_vec::IndexVec;
use std::collections::HashMap;

index_vec::define_index_type! {
    /// The index of a hook in a [HookTable].
    pub struct HookId = u32;
}

/// What happens to the guest code at a hooked address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// The guest code at the address is never executed: the hook runs instead and must leave
    /// `GuestState::pc` pointing at where execution continues (typically `lr`).
    Replace,
    /// The hook runs, then the guest code at the address executes as normal.
    Start,
}

/// A host function called in place of, or before, guest code.
pub type HookFn<G> = Box<dyn FnMut(&mut GuestState, &mut G)>;

struct Hook<G> {
    kind: HookKind,
    f: HookFn<G>,
}

pub(crate) struct HookTable<G> {
    hooks: IndexVec<HookId, Hook<G>>,
    by_addr: HashMap<GuestAddr, HookId>,
}

impl<G> HookTable<G> {
    pub(crate) fn new() -> Self {
        Self {
            hooks: IndexVec::new(),
            by_addr: HashMap::new(),
        }
    }

    /// Register `f` at `addr`, replacing any previous hook there.
    pub(crate) fn register(&mut self, addr: GuestAddr, kind: HookKind, f: HookFn<G>) -> HookId {
        match self.by_addr.get(&addr) {
            Some(&id) => {
                self.hooks[id] = Hook { kind, f };
                id
            }
            None => {
                let id = self.hooks.push(Hook { kind, f });
                self.by_addr.insert(addr, id);
                id
            }
        }
    }

    pub(crate) fn lookup(&self, addr: GuestAddr) -> Option<(HookId, HookKind)> {
        self.by_addr
            .get(&addr)
            .map(|&id| (id, self.hooks[id].kind))
    }

    pub(crate) fn call(&mut self, id: HookId, state: &mut GuestState, guest: &mut G) {
        (self.hooks[id].f)(state, guest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregister_replaces() {
        let mut t = HookTable::<u32>::new();
        let a = t.register(0x100, HookKind::Start, Box::new(|_, g| *g += 1));
        let b = t.register(0x100, HookKind::Replace, Box::new(|_, g| *g += 10));
        assert_eq!(a, b);
        assert_eq!(t.lookup(0x100), Some((a, HookKind::Replace)));
        assert_eq!(t.lookup(0x104), None);
        let mut g = 0;
        let mut s = GuestState::new(0);
        t.call(a, &mut s, &mut g);
        assert_eq!(g, 10);
    }
}
