//! Fixed-length block bitmap.
//!
//! One bit per block of a slab. The allocator keeps one to record which
//! blocks are handed out; the collector keeps a parallel one per cycle to
//! record which blocks it reached.

/// A fixed-length bit vector with one bit per slab block.
///
/// # Example
///
/// ```
/// use slab_alloc::BlockBitmap;
///
/// let mut bitmap = BlockBitmap::new(64);
/// assert!(!bitmap.get(3));
///
/// bitmap.set(3);
/// assert!(bitmap.get(3));
/// assert_eq!(bitmap.count_ones(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    words: Vec<u64>,
    len: usize,
}

impl BlockBitmap {
    /// Create an all-clear bitmap of `len` bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length bitmap.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, u64) {
        assert!(
            index < self.len,
            "block index {index} out of range for bitmap of {} bits",
            self.len
        );
        (index / 64, 1u64 << (index % 64))
    }

    /// Test a bit.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        self.words[word] & mask != 0
    }

    /// Set a bit, returning whether it was previously clear.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set(&mut self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let was_clear = self.words[word] & mask == 0;
        self.words[word] |= mask;
        was_clear
    }

    /// Clear a bit, returning whether it was previously set.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn clear(&mut self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let was_set = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        was_set
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `self & !other`: bits set here but not in `other`.
    ///
    /// # Panics
    ///
    /// Panics if the bitmaps differ in length.
    #[must_use]
    pub fn and_not(&self, other: &Self) -> Self {
        assert_eq!(self.len, other.len, "bitmap length mismatch");
        Self {
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a & !b)
                .collect(),
            len: self.len,
        }
    }

    /// Returns `true` if every bit set here is also set in `other`.
    ///
    /// # Panics
    ///
    /// Panics if the bitmaps differ in length.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        assert_eq!(self.len, other.len, "bitmap length mismatch");
        self.words.iter().zip(&other.words).all(|(a, b)| a & !b == 0)
    }

    /// Index of the lowest clear bit, if any.
    #[must_use]
    pub fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i * 64 + w.trailing_ones() as usize)
            .filter(|&index| index < self.len)
    }

    /// Iterate over the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * 64 + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::BlockBitmap;

    #[test]
    fn test_bitmap_new() {
        let bitmap = BlockBitmap::new(100);
        assert_eq!(bitmap.len(), 100);
        assert_eq!(bitmap.count_ones(), 0);
        assert_eq!(bitmap.first_clear(), Some(0));
    }

    #[test]
    fn test_bitmap_set_clear() {
        let mut bitmap = BlockBitmap::new(128);

        assert!(bitmap.set(0));
        assert!(bitmap.set(127));
        assert!(!bitmap.set(0), "second set reports already-set");

        assert!(bitmap.get(0));
        assert!(bitmap.get(127));
        assert!(!bitmap.get(1));

        assert!(bitmap.clear(0));
        assert!(!bitmap.clear(0));
        assert_eq!(bitmap.count_ones(), 1);
    }

    #[test]
    fn test_bitmap_and_not() {
        let mut allocated = BlockBitmap::new(64);
        let mut used = BlockBitmap::new(64);
        for i in 0..40 {
            allocated.set(i);
        }
        for i in 0..10 {
            used.set(i * 2);
        }

        let reclaimable = allocated.and_not(&used);
        assert_eq!(reclaimable.count_ones(), 30);
        assert!(used.is_subset_of(&allocated));
        assert!(!allocated.is_subset_of(&used));
    }

    #[test]
    fn test_bitmap_first_clear_respects_len() {
        let mut bitmap = BlockBitmap::new(3);
        bitmap.set(0);
        bitmap.set(1);
        assert_eq!(bitmap.first_clear(), Some(2));
        bitmap.set(2);
        assert_eq!(bitmap.first_clear(), None);
    }

    #[test]
    fn test_bitmap_iter_ones() {
        let mut bitmap = BlockBitmap::new(200);
        for i in [3, 64, 65, 199] {
            bitmap.set(i);
        }
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![3, 64, 65, 199]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bitmap_out_of_range_panics() {
        let bitmap = BlockBitmap::new(8);
        let _ = bitmap.get(8);
    }
}
