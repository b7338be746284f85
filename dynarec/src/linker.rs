//! Block linking: redirecting a block's exits straight to the blocks they target, so that chains
//! of blocks run without returning to the dispatcher.
//!
//! Linking is purely an optimisation. An unlinked exit leads to the dispatcher, which looks the
//! target up itself, so the only correctness requirement is that a linked exit never leads to a
//! block which has been evicted.

use crate::{
    cache::{BlockId, BlockStore},
    compile::CodePatcher,
    guest::GuestAddr,
};

/// Point exit `idx` of block `id` at its target's normal entry. Returns `true` if the exit is now
/// linked, or `false` if the exit doesn't exist or no finalised block exists at its target.
pub(crate) fn link_exit<P: CodePatcher + ?Sized>(
    store: &mut BlockStore,
    patcher: &mut P,
    id: BlockId,
    idx: usize,
) -> bool {
    let Some(exit) = store.exit(id, idx) else {
        return false;
    };
    let Some(entry) = store
        .find(exit.target)
        .and_then(|t| store.block(t))
        .map(|b| b.normal_entry)
    else {
        return false;
    };
    if !exit.linked || patcher.exit_target(exit.site) != Some(entry) {
        patcher.patch_exit(exit.site, Some(entry));
        store.set_linked(id, idx, true);
    }
    true
}

/// Point exit `idx` of block `id` back at the dispatcher.
pub(crate) fn unlink_exit<P: CodePatcher + ?Sized>(
    store: &mut BlockStore,
    patcher: &mut P,
    id: BlockId,
    idx: usize,
) {
    if let Some(exit) = store.exit(id, idx) {
        if exit.linked {
            patcher.patch_exit(exit.site, None);
            store.set_linked(id, idx, false);
        }
    }
}

/// Link a freshly finalised block: every exit already waiting on its start address, and each of
/// its own exits whose target exists (including itself).
pub(crate) fn link_new_block<P: CodePatcher + ?Sized>(
    store: &mut BlockStore,
    patcher: &mut P,
    id: BlockId,
) {
    let Some(start) = store.block(id).map(|b| b.start) else {
        return;
    };
    for (from, idx) in store.exits_to(start).to_vec() {
        link_exit(store, patcher, from, idx);
    }
    let nexits = store.block(id).map(|b| b.exits.len()).unwrap_or(0);
    for idx in 0..nexits {
        link_exit(store, patcher, id, idx);
    }
}

/// Unlink every exit leading to `start`, other than those belonging to `except` (which is being
/// evicted and whose code will never run again).
pub(crate) fn unlink_incoming<P: CodePatcher + ?Sized>(
    store: &mut BlockStore,
    patcher: &mut P,
    start: GuestAddr,
    except: BlockId,
) {
    for (from, idx) in store.exits_to(start).to_vec() {
        if from != except {
            unlink_exit(store, patcher, from, idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::tests::MapPatcher, config::JitBuilder};

    #[test]
    fn link_and_unlink() {
        let cfg = JitBuilder::new().block_linking(false).config();
        let mut s = BlockStore::new(&cfg);
        let mut p = MapPatcher::default();
        let a = s.allocate(0x10, 1, 1).unwrap();
        let code = p.code(&[0x20, 0x10]);
        s.finalize(a, code, 4, 1, &mut p);
        // Linking is disabled, so nothing happened automatically.
        assert!(!s.exit(a, 1).unwrap().linked);
        // No block at 0x20.
        assert!(!link_exit(&mut s, &mut p, a, 0));
        // A self link.
        assert!(link_exit(&mut s, &mut p, a, 1));
        let site = s.exit(a, 1).unwrap().site;
        assert_eq!(p.exit_target(site), Some(s.block(a).unwrap().normal_entry));
        // Out of range exit.
        assert!(!link_exit(&mut s, &mut p, a, 2));
        unlink_exit(&mut s, &mut p, a, 1);
        assert_eq!(p.exit_target(site), None);
        assert!(!s.exit(a, 1).unwrap().linked);
        s.check_consistency(&p);
    }
}
