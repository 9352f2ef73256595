//! # Slot Bitmap
//!
//! Fixed-size bit vector, one bit per table slot. A set bit means the slot is
//! owned by a live mapping.
//!
//! The bitmap is stored as `u64` words. Bits past `len` in the last word are
//! never set, so word-level scans need no masking beyond the search limit.

use alloc::vec;
use alloc::vec::Vec;

/// Bits per bitmap word
const BITS_PER_WORD: usize = u64::BITS as usize;

/// Fixed-length bitset
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    /// Storage: each u64 tracks 64 slots
    words: Vec<u64>,
    /// Number of valid bits
    len: usize,
}

impl Bitmap {
    /// Create a cleared bitmap of `len` bits
    pub fn new(len: usize) -> Self {
        let word_count = len.div_ceil(BITS_PER_WORD);
        Self {
            words: vec![0u64; word_count],
            len,
        }
    }

    /// Number of bits
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has no bits at all
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn split(bit: usize) -> (usize, u64) {
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    /// Test one bit
    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        let (word, mask) = Self::split(bit);
        self.words[word] & mask != 0
    }

    /// Set one bit
    #[inline]
    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        let (word, mask) = Self::split(bit);
        self.words[word] |= mask;
    }

    /// Clear one bit
    #[inline]
    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        let (word, mask) = Self::split(bit);
        self.words[word] &= !mask;
    }

    /// Set every bit in `[start, start + count)`
    pub fn set_range(&mut self, start: usize, count: usize) {
        for bit in start..start + count {
            self.set(bit);
        }
    }

    /// Clear every bit in `[start, start + count)`
    pub fn clear_range(&mut self, start: usize, count: usize) {
        for bit in start..start + count {
            self.clear(bit);
        }
    }

    /// First set bit in `[start, start + count)`, if any
    pub fn first_set_in(&self, start: usize, count: usize) -> Option<usize> {
        (start..start + count).find(|&bit| self.test(bit))
    }

    /// Index of the first clear bit in `[start, limit)`, or `limit` if none
    pub fn find_next_zero(&self, start: usize, limit: usize) -> usize {
        let limit = limit.min(self.len);
        if start >= limit {
            return limit;
        }

        let mut word_idx = start / BITS_PER_WORD;
        // Pretend the bits below `start` are set so they are skipped
        let mut word = self.words[word_idx] | ((1u64 << (start % BITS_PER_WORD)) - 1);

        loop {
            if word != u64::MAX {
                let bit = word_idx * BITS_PER_WORD + (!word).trailing_zeros() as usize;
                return bit.min(limit);
            }
            word_idx += 1;
            if word_idx * BITS_PER_WORD >= limit {
                return limit;
            }
            word = self.words[word_idx];
        }
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no bit is set
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("set", &self.count_ones())
            .finish()
    }
}
