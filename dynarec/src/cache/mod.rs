//! The block store: the set of translated blocks, indexed by guest address.
//!
//! A block moves through three states. [BlockStore::allocate] reserves a slot while the block is
//! being translated; [BlockStore::finalize] makes it visible to lookups; [BlockStore::invalidate]
//! or [BlockStore::clear] evict it. Only finalised blocks are in the address index, and the
//! [bitmap::ValidBlockBitmap] has a bit set for exactly the addresses where a finalised block
//! starts.
//!
//! Besides the index, the store keeps two secondary maps which must stay in sync with it: a
//! page map from 4KiB guest pages to the blocks whose source overlaps them (for invalidation),
//! and a reverse link index from guest addresses to the exits that target them (for linking).

use crate::{
    compile::{BlockCode, CodeAddr, CodePatcher, CompilationError},
    config::Config,
    guest::GuestAddr,
    linker,
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::{cell::Cell, collections::HashMap, ops::Range};

pub(crate) mod bitmap;

use bitmap::ValidBlockBitmap;

index_vec::define_index_type! {
    /// The index of a slot in the block store. Slots are reused after eviction.
    pub struct BlockId = u32;
}

/// log2 of the size of the pages used for invalidation bookkeeping.
const PAGE_SHIFT: u32 = 12;
/// Most blocks start on a word boundary, so the fast map ignores the low address bits.
const FAST_SHIFT: u32 = 2;

/// A reserved jump at the end of a block which can be redirected to another block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitLink {
    /// Where the jump lives in the code buffer.
    pub site: CodeAddr,
    /// The guest address the exit continues at.
    pub target: GuestAddr,
    /// Does the jump currently lead directly to the target's block?
    pub linked: bool,
}

/// A translated block.
#[derive(Clone, Debug)]
pub struct CompiledBlock {
    pub start: GuestAddr,
    /// The number of bytes of guest code translated.
    pub guest_bytes: u32,
    pub num_insts: u32,
    /// The entry used by the dispatcher, which checks the timeslice first.
    pub checked_entry: CodeAddr,
    /// The entry used by linked exits.
    pub normal_entry: CodeAddr,
    /// The code addresses the block occupies.
    pub code: Range<usize>,
    pub exits: SmallVec<[ExitLink; 2]>,
    finalized: bool,
}

impl CompiledBlock {
    /// Is this block finalised (i.e. visible to lookups)?
    pub fn is_valid(&self) -> bool {
        self.finalized
    }

    /// Does this block's guest source overlap `[start, end)`?
    fn overlaps(&self, start: u64, end: u64) -> bool {
        let bstart = u64::from(self.start);
        bstart < end && start < bstart + u64::from(self.guest_bytes.max(1))
    }
}

pub(crate) struct BlockStore {
    slots: IndexVec<BlockId, Option<CompiledBlock>>,
    /// Evicted slots available for reuse.
    free: Vec<BlockId>,
    max_blocks: usize,
    /// Per-slot run counters. Generated code increments these through raw pointers, so the
    /// allocation must never move.
    run_counts: Box<[Cell<u64>]>,
    index: HashMap<GuestAddr, BlockId>,
    /// A direct-mapped cache in front of `index`.
    fast_map: Box<[Option<BlockId>]>,
    fast_mask: u32,
    bitmap: ValidBlockBitmap,
    pages: HashMap<u32, SmallVec<[BlockId; 4]>>,
    /// The reverse link index: for each guest address, the `(block, exit index)` pairs whose
    /// exits target it.
    links_to: HashMap<GuestAddr, Vec<(BlockId, usize)>>,
    linking: bool,
    flush_threshold: usize,
}

/// What an invalidation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Invalidated {
    /// This many blocks were evicted individually.
    Evicted(usize),
    /// So many blocks overlapped that the whole cache was cleared.
    Flushed,
}

impl BlockStore {
    pub(crate) fn new(cfg: &Config) -> Self {
        let fast_len = 1usize << cfg.fast_map_bits;
        Self {
            slots: IndexVec::with_capacity(cfg.max_blocks),
            free: Vec::new(),
            max_blocks: cfg.max_blocks,
            run_counts: (0..cfg.max_blocks).map(|_| Cell::new(0)).collect(),
            index: HashMap::new(),
            fast_map: vec![None; fast_len].into_boxed_slice(),
            fast_mask: (fast_len - 1) as u32,
            bitmap: ValidBlockBitmap::new(),
            pages: HashMap::new(),
            links_to: HashMap::new(),
            linking: cfg.block_linking,
            flush_threshold: cfg.flush_threshold,
        }
    }

    fn fast_idx(&self, addr: GuestAddr) -> usize {
        ((addr >> FAST_SHIFT) & self.fast_mask) as usize
    }

    /// Find the finalised block starting at `addr` without updating any lookup caches.
    pub(crate) fn find(&self, addr: GuestAddr) -> Option<BlockId> {
        if !self.bitmap.test(addr) {
            return None;
        }
        if let Some(id) = self.fast_map[self.fast_idx(addr)] {
            if matches!(&self.slots[id], Some(b) if b.finalized && b.start == addr) {
                return Some(id);
            }
        }
        self.index.get(&addr).copied()
    }

    /// Find the finalised block starting at `addr`, caching the result in the fast map.
    pub(crate) fn lookup(&mut self, addr: GuestAddr) -> Option<BlockId> {
        let id = self.find(addr)?;
        let i = self.fast_idx(addr);
        self.fast_map[i] = Some(id);
        Some(id)
    }

    /// Return the block in slot `id`, whether or not it has been finalised.
    pub(crate) fn block(&self, id: BlockId) -> Option<&CompiledBlock> {
        self.slots.get(id).and_then(|x| x.as_ref())
    }

    /// Iterate over all finalised blocks.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockId, &CompiledBlock)> {
        self.slots
            .iter_enumerated()
            .filter_map(|(id, b)| b.as_ref().filter(|b| b.finalized).map(|b| (id, b)))
    }

    /// Return the finalised block whose code contains `addr`, if any.
    pub(crate) fn block_at_code(&self, addr: usize) -> Option<(BlockId, &CompiledBlock)> {
        self.iter().find(|(_, b)| b.code.contains(&addr))
    }

    /// How many blocks are finalised?
    pub(crate) fn occupancy(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_blocks
    }

    pub(crate) fn run_count(&self, id: BlockId) -> u64 {
        self.run_counts[id.index()].get()
    }

    /// A pointer to `id`'s run counter, for generated code to increment.
    pub(crate) fn run_counter(&self, id: BlockId) -> *mut u64 {
        self.run_counts[id.index()].as_ptr()
    }

    /// Reserve a slot for a new block starting at `start`. Fails with
    /// [CompilationError::CacheFull] if there are no free slots or if `code_free` is less than
    /// `code_needed`.
    pub(crate) fn allocate(
        &mut self,
        start: GuestAddr,
        code_free: usize,
        code_needed: usize,
    ) -> Result<BlockId, CompilationError> {
        if code_free < code_needed {
            return Err(CompilationError::CacheFull);
        }
        let blk = CompiledBlock {
            start,
            guest_bytes: 0,
            num_insts: 0,
            checked_entry: CodeAddr(0),
            normal_entry: CodeAddr(0),
            code: 0..0,
            exits: SmallVec::new(),
            finalized: false,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(blk);
                id
            }
            None if self.slots.len() < self.max_blocks => self.slots.push(Some(blk)),
            None => return Err(CompilationError::CacheFull),
        };
        self.run_counts[id.index()].set(0);
        Ok(id)
    }

    /// Release a slot reserved by [Self::allocate] whose translation did not complete.
    pub(crate) fn abandon(&mut self, id: BlockId) {
        debug_assert!(matches!(&self.slots[id], Some(b) if !b.finalized));
        self.slots[id] = None;
        self.free.push(id);
    }

    /// Make the block in slot `id` visible to lookups and, if linking is enabled, link it to its
    /// neighbours.
    pub(crate) fn finalize<P: CodePatcher + ?Sized>(
        &mut self,
        id: BlockId,
        code: BlockCode,
        guest_bytes: u32,
        num_insts: u32,
        patcher: &mut P,
    ) {
        let start = self.slots[id]
            .as_ref()
            .expect("finalising a block that was never allocated")
            .start;
        // The dispatcher only translates on a lookup miss, so there is never an existing block
        // here. If there is, it is stale: replace it rather than corrupt the index.
        debug_assert!(
            !self.index.contains_key(&start),
            "a block already starts at {start:#x}"
        );
        if let Some(old) = self.index.get(&start).copied() {
            self.evict(old, patcher);
        }
        let Some(blk) = self.slots[id].as_mut() else {
            return;
        };
        debug_assert!(!blk.finalized);
        blk.guest_bytes = guest_bytes;
        blk.num_insts = num_insts;
        blk.checked_entry = code.checked_entry;
        blk.normal_entry = code.normal_entry;
        blk.code = code.code;
        blk.exits = code
            .exits
            .iter()
            .map(|&(site, target)| ExitLink {
                site,
                target,
                linked: false,
            })
            .collect();
        blk.finalized = true;
        let end = u64::from(start) + u64::from(guest_bytes.max(1));
        for (i, &(_, target)) in code.exits.iter().enumerate() {
            self.links_to.entry(target).or_default().push((id, i));
        }
        for page in (u64::from(start) >> PAGE_SHIFT)..=((end - 1) >> PAGE_SHIFT) {
            self.pages.entry(page as u32).or_default().push(id);
        }
        self.index.insert(start, id);
        self.bitmap.set(start);
        let i = self.fast_idx(start);
        self.fast_map[i] = Some(id);
        if self.linking {
            linker::link_new_block(self, patcher, id);
        }
    }

    pub(crate) fn exit(&self, id: BlockId, idx: usize) -> Option<ExitLink> {
        self.block(id)
            .filter(|b| b.finalized)
            .and_then(|b| b.exits.get(idx).copied())
    }

    pub(crate) fn set_linked(&mut self, id: BlockId, idx: usize, linked: bool) {
        if let Some(b) = self.slots[id].as_mut() {
            b.exits[idx].linked = linked;
        }
    }

    /// The exits that target `addr`.
    pub(crate) fn exits_to(&self, addr: GuestAddr) -> &[(BlockId, usize)] {
        self.links_to.get(&addr).map(|x| x.as_slice()).unwrap_or(&[])
    }

    /// Evict every block whose guest source overlaps `[start, start + len)`, returning what was
    /// done. If more than the flush threshold of blocks overlap, the whole cache is cleared.
    pub(crate) fn invalidate<P: CodePatcher + ?Sized>(
        &mut self,
        start: GuestAddr,
        len: u32,
        patcher: &mut P,
    ) -> Invalidated {
        if len == 0 {
            return Invalidated::Evicted(0);
        }
        let (s, e) = (u64::from(start), u64::from(start) + u64::from(len));
        let mut victims: SmallVec<[BlockId; 8]> = SmallVec::new();
        for page in (s >> PAGE_SHIFT)..=((e - 1) >> PAGE_SHIFT) {
            if let Some(ids) = self.pages.get(&(page as u32)) {
                for &id in ids {
                    if !victims.contains(&id)
                        && matches!(&self.slots[id], Some(b) if b.overlaps(s, e))
                    {
                        victims.push(id);
                    }
                }
            }
        }
        if victims.len() > self.flush_threshold {
            self.clear(patcher);
            return Invalidated::Flushed;
        }
        for &id in &victims {
            self.evict(id, patcher);
        }
        Invalidated::Evicted(victims.len())
    }

    /// Remove a finalised block from every index and unlink every exit that leads to it.
    fn evict<P: CodePatcher + ?Sized>(&mut self, id: BlockId, patcher: &mut P) {
        let Some(blk) = self.slots[id].take() else {
            return;
        };
        debug_assert!(blk.finalized);
        let start = blk.start;
        linker::unlink_incoming(self, patcher, start, id);
        for (i, e) in blk.exits.iter().enumerate() {
            if let Some(v) = self.links_to.get_mut(&e.target) {
                v.retain(|&x| x != (id, i));
                if v.is_empty() {
                    self.links_to.remove(&e.target);
                }
            }
        }
        let end = u64::from(start) + u64::from(blk.guest_bytes.max(1));
        for page in (u64::from(start) >> PAGE_SHIFT)..=((end - 1) >> PAGE_SHIFT) {
            if let Some(v) = self.pages.get_mut(&(page as u32)) {
                v.retain(|x| *x != id);
                if v.is_empty() {
                    self.pages.remove(&(page as u32));
                }
            }
        }
        self.index.remove(&start);
        self.bitmap.clear(start);
        let i = self.fast_idx(start);
        if self.fast_map[i] == Some(id) {
            self.fast_map[i] = None;
        }
        patcher.forget_block(id, blk.code);
        self.free.push(id);
    }

    /// Evict every block and reset the code buffer. Clearing an empty store is harmless.
    pub(crate) fn clear<P: CodePatcher + ?Sized>(&mut self, patcher: &mut P) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.fast_map.iter_mut().for_each(|x| *x = None);
        self.bitmap.reset();
        self.pages.clear();
        self.links_to.clear();
        patcher.clear_code();
    }

    /// Check the store's internal invariants, panicking if any is violated.
    #[cfg(test)]
    pub(crate) fn check_consistency<P: CodePatcher + ?Sized>(&self, patcher: &P) {
        assert_eq!(self.bitmap.count(), self.index.len());
        for (&addr, &id) in &self.index {
            assert!(self.bitmap.test(addr));
            let b = self.block(id).unwrap();
            assert!(b.finalized);
            assert_eq!(b.start, addr);
        }
        for (id, b) in self.iter() {
            assert_eq!(self.index.get(&b.start), Some(&id));
            for (i, e) in b.exits.iter().enumerate() {
                assert!(self.exits_to(e.target).contains(&(id, i)));
                match patcher.exit_target(e.site) {
                    Some(t) => {
                        assert!(e.linked);
                        let tid = self.find(e.target).unwrap();
                        assert_eq!(self.block(tid).unwrap().normal_entry, t);
                    }
                    None => assert!(!e.linked),
                }
            }
        }
        for (target, v) in &self.links_to {
            for &(id, i) in v {
                assert_eq!(self.exit(id, i).unwrap().target, *target);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::JitBuilder;
    use proptest::prelude::*;

    /// A [CodePatcher] which records exit targets in a map, standing in for a real code buffer.
    #[derive(Default)]
    pub(crate) struct MapPatcher {
        pub(crate) exits: HashMap<CodeAddr, CodeAddr>,
        pub(crate) forgotten: Vec<BlockId>,
        pub(crate) clears: usize,
        next: usize,
    }

    impl MapPatcher {
        /// Fabricate the code for a block with exits to `targets`.
        pub(crate) fn code(&mut self, targets: &[GuestAddr]) -> BlockCode {
            let base = self.next;
            self.next += 16 + targets.len() * 16;
            BlockCode {
                checked_entry: CodeAddr(base),
                normal_entry: CodeAddr(base + 8),
                code: base..self.next,
                exits: targets
                    .iter()
                    .enumerate()
                    .map(|(i, &t)| (CodeAddr(base + 16 + i * 16), t))
                    .collect(),
            }
        }
    }

    impl CodePatcher for MapPatcher {
        fn patch_exit(&mut self, site: CodeAddr, target: Option<CodeAddr>) {
            match target {
                Some(t) => self.exits.insert(site, t),
                None => self.exits.remove(&site),
            };
        }

        fn exit_target(&self, site: CodeAddr) -> Option<CodeAddr> {
            self.exits.get(&site).copied()
        }

        fn forget_block(&mut self, id: BlockId, _code: Range<usize>) {
            self.forgotten.push(id);
        }

        fn clear_code(&mut self) {
            self.exits.clear();
            self.clears += 1;
        }
    }

    fn store(max_blocks: usize) -> BlockStore {
        let cfg = JitBuilder::new()
            .max_blocks(max_blocks)
            .fast_map_bits(4)
            .flush_threshold(8)
            .config();
        BlockStore::new(&cfg)
    }

    fn add(s: &mut BlockStore, p: &mut MapPatcher, start: GuestAddr, bytes: u32, targets: &[GuestAddr]) -> BlockId {
        let id = s.allocate(start, 1, 1).unwrap();
        let code = p.code(targets);
        s.finalize(id, code, bytes, bytes / 4, p);
        id
    }

    #[test]
    fn lookup_is_stable() {
        let mut p = MapPatcher::default();
        let mut s = store(16);
        assert_eq!(s.lookup(0x1000), None);
        let id = add(&mut s, &mut p, 0x1000, 12, &[0x2000]);
        for _ in 0..3 {
            assert_eq!(s.lookup(0x1000), Some(id));
        }
        // Addresses inside the block are not block starts.
        assert_eq!(s.lookup(0x1004), None);
        s.check_consistency(&p);
    }

    #[test]
    fn allocate_fails_when_full() {
        let mut p = MapPatcher::default();
        let mut s = store(2);
        add(&mut s, &mut p, 0x0, 4, &[]);
        add(&mut s, &mut p, 0x4, 4, &[]);
        assert!(matches!(s.allocate(0x8, 1, 1), Err(CompilationError::CacheFull)));
        s.clear(&mut p);
        assert!(s.allocate(0x8, 1, 1).is_ok());
        // Not enough code space.
        assert!(matches!(s.allocate(0xC, 10, 11), Err(CompilationError::CacheFull)));
    }

    #[test]
    fn abandoned_slots_are_reused() {
        let mut s = store(1);
        let id = s.allocate(0x100, 1, 1).unwrap();
        s.abandon(id);
        assert_eq!(s.allocate(0x200, 1, 1).unwrap(), id);
        assert_eq!(s.find(0x100), None);
    }

    #[test]
    fn new_blocks_link_both_ways() {
        let mut p = MapPatcher::default();
        let mut s = store(16);
        // 0x2000 exits to 0x1000, which doesn't exist yet.
        let a = add(&mut s, &mut p, 0x2000, 8, &[0x1000]);
        assert!(!s.exit(a, 0).unwrap().linked);
        // 0x1000 loops to itself and exits to 0x2000.
        let b = add(&mut s, &mut p, 0x1000, 8, &[0x1000, 0x2000]);
        let bn = s.block(b).unwrap().normal_entry;
        let an = s.block(a).unwrap().normal_entry;
        assert_eq!(p.exit_target(s.exit(a, 0).unwrap().site), Some(bn));
        assert_eq!(p.exit_target(s.exit(b, 0).unwrap().site), Some(bn));
        assert_eq!(p.exit_target(s.exit(b, 1).unwrap().site), Some(an));
        s.check_consistency(&p);
    }

    #[test]
    fn invalidate_evicts_and_unlinks() {
        let mut p = MapPatcher::default();
        let mut s = store(16);
        let a = add(&mut s, &mut p, 0x2000, 8, &[0x1000]);
        let b = add(&mut s, &mut p, 0x1000, 16, &[0x3000]);
        assert!(s.exit(a, 0).unwrap().linked);
        // A write to the last word of 0x1000's source.
        assert_eq!(s.invalidate(0x100C, 4, &mut p), Invalidated::Evicted(1));
        assert_eq!(s.lookup(0x1000), None);
        assert!(!s.exit(a, 0).unwrap().linked);
        assert_eq!(p.exit_target(s.exit(a, 0).unwrap().site), None);
        assert_eq!(p.forgotten, vec![b]);
        // The exit from 0x2000 is still waiting on 0x1000 and relinks when it reappears.
        let c = add(&mut s, &mut p, 0x1000, 16, &[]);
        assert_eq!(
            p.exit_target(s.exit(a, 0).unwrap().site),
            Some(s.block(c).unwrap().normal_entry)
        );
        // A write just past the block's end touches nothing.
        assert_eq!(s.invalidate(0x1010, 4, &mut p), Invalidated::Evicted(0));
        s.check_consistency(&p);
    }

    #[test]
    fn invalidate_spanning_pages() {
        let mut p = MapPatcher::default();
        let mut s = store(16);
        add(&mut s, &mut p, 0x1FF8, 16, &[]);
        assert_eq!(s.invalidate(0x2004, 1, &mut p), Invalidated::Evicted(1));
        assert_eq!(s.occupancy(), 0);
    }

    #[test]
    fn unaligned_neighbours_are_tracked_separately() {
        let mut p = MapPatcher::default();
        let mut s = store(16);
        add(&mut s, &mut p, 0x1000, 1, &[]);
        let b = add(&mut s, &mut p, 0x1001, 3, &[]);
        assert_eq!(s.invalidate(0x1000, 1, &mut p), Invalidated::Evicted(1));
        assert_eq!(s.lookup(0x1000), None);
        assert_eq!(s.lookup(0x1001), Some(b));
        s.check_consistency(&p);
        // Both fast map entries share a slot.
        add(&mut s, &mut p, 0x1002, 2, &[]);
        assert_eq!(s.lookup(0x1001), Some(b));
        s.check_consistency(&p);
    }

    #[test]
    fn dense_invalidation_flushes() {
        let mut p = MapPatcher::default();
        let mut s = store(64);
        for i in 0..16 {
            add(&mut s, &mut p, i * 8, 8, &[]);
        }
        assert_eq!(s.invalidate(0, 0x1000, &mut p), Invalidated::Flushed);
        assert_eq!(p.clears, 1);
        assert_eq!(s.occupancy(), 0);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut p = MapPatcher::default();
        let mut s = store(16);
        add(&mut s, &mut p, 0x1000, 8, &[0x1000]);
        s.clear(&mut p);
        s.clear(&mut p);
        assert_eq!(s.lookup(0x1000), None);
        assert_eq!(s.occupancy(), 0);
        s.check_consistency(&p);
        add(&mut s, &mut p, 0x1000, 8, &[]);
        assert!(s.lookup(0x1000).is_some());
    }

    #[derive(Clone, Debug)]
    enum StoreOp {
        Add { start: u32, words: u32, targets: Vec<u32> },
        Invalidate { start: u32, len: u32 },
        Link { which: usize, exit: usize },
        Unlink { which: usize, exit: usize },
        Clear,
    }

    fn store_op() -> impl Strategy<Value = StoreOp> {
        // Keep addresses in a small window so that blocks collide often. Starts need not be
        // aligned.
        let addr = (0u32..192).prop_map(|x| 0x1000 + x);
        prop_oneof![
            6 => (addr.clone(), 1u32..6, prop::collection::vec(addr.clone(), 0..3))
                .prop_map(|(start, words, targets)| StoreOp::Add { start, words, targets }),
            3 => (addr, 1u32..16).prop_map(|(start, len)| StoreOp::Invalidate { start, len }),
            2 => (0usize..32, 0usize..3).prop_map(|(which, exit)| StoreOp::Link { which, exit }),
            2 => (0usize..32, 0usize..3).prop_map(|(which, exit)| StoreOp::Unlink { which, exit }),
            1 => Just(StoreOp::Clear),
        ]
    }

    proptest! {
        #[test]
        fn bitmap_tracks_index(ops in prop::collection::vec(store_op(), 1..200)) {
            let mut p = MapPatcher::default();
            let mut s = store(24);
            for op in ops {
                match op {
                    StoreOp::Add { start, words, targets } => {
                        if s.lookup(start).is_none() {
                            match s.allocate(start, 1, 1) {
                                Ok(id) => {
                                    let code = p.code(&targets);
                                    s.finalize(id, code, words * 4, words, &mut p);
                                }
                                Err(_) => s.clear(&mut p),
                            }
                        }
                    }
                    StoreOp::Invalidate { start, len } => {
                        s.invalidate(start, len, &mut p);
                        for a in start..start + len {
                            prop_assert!(s.iter().all(|(_, b)| !b.overlaps(u64::from(a), u64::from(a) + 1)));
                        }
                    }
                    StoreOp::Link { which, exit } => {
                        let ids = s.iter().map(|(id, _)| id).collect::<Vec<_>>();
                        if !ids.is_empty() {
                            let id = ids[which % ids.len()];
                            linker::link_exit(&mut s, &mut p, id, exit);
                        }
                    }
                    StoreOp::Unlink { which, exit } => {
                        let ids = s.iter().map(|(id, _)| id).collect::<Vec<_>>();
                        if !ids.is_empty() {
                            let id = ids[which % ids.len()];
                            linker::unlink_exit(&mut s, &mut p, id, exit);
                        }
                    }
                    StoreOp::Clear => s.clear(&mut p),
                }
                s.check_consistency(&p);
            }
        }
    }
}
