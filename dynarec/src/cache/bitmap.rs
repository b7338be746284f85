//! A bitmap with one bit per byte of the 32-bit guest address space.
//!
//! Guest instructions need not be aligned, so a bit must name exactly one address: two blocks
//! starting a byte apart cannot share one. The space is 2^32 bits, so the bitmap is two-level: a
//! fixed top level of leaf pointers, with leaves allocated the first time a bit inside them is
//! set. Address ranges that never contain code cost one null pointer per 256KiB of guest space.

use crate::guest::GuestAddr;

/// Each leaf is this many `u64` words.
const LEAF_WORDS: usize = 4096;
const LEAF_BITS: usize = LEAF_WORDS * 64;
const NUM_LEAVES: usize = (1usize << 32) / LEAF_BITS;

pub(crate) struct ValidBlockBitmap {
    leaves: Box<[Option<Box<[u64; LEAF_WORDS]>>]>,
    /// How many bits are set?
    count: usize,
}

impl ValidBlockBitmap {
    pub(crate) fn new() -> Self {
        Self {
            leaves: (0..NUM_LEAVES).map(|_| None).collect(),
            count: 0,
        }
    }

    fn split(addr: GuestAddr) -> (usize, usize, u64) {
        let addr = addr as usize;
        let leaf = addr / LEAF_BITS;
        let bit = addr % LEAF_BITS;
        (leaf, bit / 64, 1 << (bit % 64))
    }

    pub(crate) fn test(&self, addr: GuestAddr) -> bool {
        let (leaf, word, mask) = Self::split(addr);
        match &self.leaves[leaf] {
            Some(l) => l[word] & mask != 0,
            None => false,
        }
    }

    pub(crate) fn set(&mut self, addr: GuestAddr) {
        let (leaf, word, mask) = Self::split(addr);
        let l = self.leaves[leaf].get_or_insert_with(|| Box::new([0; LEAF_WORDS]));
        if l[word] & mask == 0 {
            l[word] |= mask;
            self.count += 1;
        }
    }

    pub(crate) fn clear(&mut self, addr: GuestAddr) {
        let (leaf, word, mask) = Self::split(addr);
        if let Some(l) = &mut self.leaves[leaf] {
            if l[word] & mask != 0 {
                l[word] &= !mask;
                self.count -= 1;
            }
        }
    }

    /// Clear every bit, releasing the leaves.
    pub(crate) fn reset(&mut self) {
        if self.count > 0 {
            self.leaves.iter_mut().for_each(|l| *l = None);
            self.count = 0;
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }
}
