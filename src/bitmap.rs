use core::ops::Range;

/// The number of units tracked by each chunk's occupancy bitmap.
///
/// This bounds how many distinct allocation slots one chunk can address: a
/// chunk of `S` bytes with unit size `A` exposes `min(BITMAP_UNITS, S / A)`
/// units.
pub const BITMAP_UNITS: usize = 1024;

const WORDS: usize = BITMAP_UNITS / u64::BITS as usize;

/// A fixed-size occupancy map. A set bit marks an occupied unit.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: [u64; WORDS],
}

impl Bitmap {
    /// Returns a bitmap with every unit free.
    #[inline]
    pub const fn new() -> Bitmap {
        Bitmap { words: [0; WORDS] }
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < BITMAP_UNITS);

        let (word, mask) = Self::index_and_mask(index);
        self.words[word] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < BITMAP_UNITS);

        let (word, mask) = Self::index_and_mask(index);
        let word = &mut self.words[word];
        *word = match value {
            true => *word | mask,
            false => *word & !mask,
        };
    }

    /// Sets every bit in `range` to `value`.
    pub fn set_range(&mut self, range: Range<usize>, value: bool) {
        for bit in range {
            self.set(bit, value);
        }
    }

    /// Returns `true` if every bit in `range` has the value `value`.
    pub fn all(&self, range: Range<usize>, value: bool) -> bool {
        range.into_iter().all(|bit| self.get(bit) == value)
    }

    /// Returns the number of set bits.
    #[cfg(test)]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let map = Bitmap::new();
        assert!(map.all(0..BITMAP_UNITS, false));
        assert_eq!(map.count_ones(), 0);
    }

    #[test]
    fn set_and_clear_across_word_boundary() {
        let mut map = Bitmap::new();
        map.set_range(60..70, true);

        assert!(!map.get(59));
        assert!(map.all(60..70, true));
        assert!(!map.get(70));
        assert_eq!(map.count_ones(), 10);

        map.set(64, false);
        assert!(!map.get(64));
        assert!(!map.all(60..70, true));
        assert_eq!(map.count_ones(), 9);
    }

    #[test]
    fn last_bit() {
        let mut map = Bitmap::new();
        map.set(BITMAP_UNITS - 1, true);
        assert!(map.get(BITMAP_UNITS - 1));
        assert_eq!(map.count_ones(), 1);
    }

    #[test]
    #[should_panic]
    fn out_of_range_panics() {
        Bitmap::new().get(BITMAP_UNITS);
    }
}
