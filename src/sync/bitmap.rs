//! Lock-free atomic bitmap, used for one access-generation: one bit per block, set lazily as
//! blocks are touched and cleared in bulk when the generation rotates.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    pub fn new(len: usize) -> Self {
        let num_words = len.div_ceil(64);
        AtomicBitmap {
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    #[inline]
    fn word_and_bit(index: usize) -> (usize, u64) {
        (index / 64, 1u64 << (index % 64))
    }

    /// Set bit `index`. Concurrent sets from other threads are safe, via atomic OR.
    pub fn set(&self, index: usize) {
        debug_assert!(index < self.len);
        let (word, bit) = Self::word_and_bit(index);
        self.words[word].fetch_or(bit, Ordering::Relaxed);
    }

    /// Test bit `index`. May race with a concurrent `set`/`clear_all`; stale reads only misjudge
    /// heat, never cause unsoundness.
    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let (word, bit) = Self::word_and_bit(index);
        self.words[word].load(Ordering::Relaxed) & bit != 0
    }

    /// Clear every bit, used when a generation is overwritten on rotation. No bit is ever cleared
    /// any other way.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test_round_trip() {
        let bitmap = AtomicBitmap::new(200);
        assert!(!bitmap.test(130));
        bitmap.set(130);
        assert!(bitmap.test(130));
        assert!(!bitmap.test(129));
    }

    #[test]
    fn clear_all_resets_every_bit() {
        let bitmap = AtomicBitmap::new(128);
        bitmap.set(0);
        bitmap.set(64);
        bitmap.set(127);
        bitmap.clear_all();
        for i in 0..128 {
            assert!(!bitmap.test(i));
        }
    }

    #[test]
    fn handles_lengths_not_a_multiple_of_64() {
        let bitmap = AtomicBitmap::new(65);
        bitmap.set(64);
        assert!(bitmap.test(64));
    }
}
