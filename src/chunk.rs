//! Chunks: contiguous address ranges subdivided into alignment units.

use core::{cmp, num::NonZeroUsize};

use crate::bitmap::{Bitmap, BITMAP_UNITS};

/// Index of a chunk slot within its node's chunk table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ChunkId(u16);

impl ChunkId {
    #[inline]
    pub fn new(index: usize) -> ChunkId {
        ChunkId(index.try_into().expect("chunk index overflowed a u16"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0.into()
    }
}

/// An entry in a node's chunk table.
#[derive(Debug)]
pub enum ChunkSlot {
    /// An unused slot, linked into the node's chunk free list.
    Free { next: Option<ChunkId> },
    /// A live chunk, linked into the node's in-use list.
    InUse(Chunk),
}

impl ChunkSlot {
    #[inline]
    pub fn as_chunk(&self) -> Option<&Chunk> {
        match self {
            ChunkSlot::InUse(c) => Some(c),
            ChunkSlot::Free { .. } => None,
        }
    }

    #[inline]
    pub fn as_chunk_mut(&mut self) -> Option<&mut Chunk> {
        match self {
            ChunkSlot::InUse(c) => Some(c),
            ChunkSlot::Free { .. } => None,
        }
    }
}

/// Returns the number of `unit`-sized units needed to hold `size` bytes.
///
/// Zero-sized requests still occupy one unit so that every allocation has a
/// distinct address.
#[inline]
pub fn units_for(size: usize, unit: usize) -> usize {
    cmp::max(1, size / unit + usize::from(size % unit != 0))
}

/// A contiguous range of memory owned by exactly one node.
#[derive(Debug)]
pub struct Chunk {
    pub next: Option<ChunkId>,
    min: usize,
    max: usize,
    align: usize,
    free_bytes: usize,
    bitmap: Bitmap,
}

impl Chunk {
    /// Creates a chunk spanning `[min, max)` with every unit free.
    pub fn new(min: usize, max: usize, align: usize) -> Chunk {
        debug_assert!(min <= max);
        debug_assert!(align.is_power_of_two());

        Chunk {
            next: None,
            min,
            max,
            align,
            free_bytes: max - min,
            bitmap: Bitmap::new(),
        }
    }

    #[cfg(test)]
    pub fn min(&self) -> usize {
        self.min
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.max - self.min
    }

    #[cfg(test)]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.min <= addr && addr < self.max
    }

    /// Returns the number of addressable units.
    #[inline]
    pub fn units(&self) -> usize {
        cmp::min(BITMAP_UNITS, self.size() / self.align)
    }

    #[inline]
    fn unit_addr(&self, unit: usize) -> usize {
        self.min + unit * self.align
    }

    /// Returns the unit containing `addr`.
    #[inline]
    fn unit_of(&self, addr: usize) -> usize {
        (addr - self.min) / self.align
    }

    /// Returns `true` if the unit containing `addr` is occupied.
    pub fn is_occupied(&self, addr: usize) -> bool {
        let unit = self.unit_of(addr);
        unit < self.units() && self.bitmap.get(unit)
    }

    /// Attempts to carve `size` bytes aligned to `align` out of this chunk.
    ///
    /// Returns the address of the block and the number of bytes it consumed,
    /// which is `size` rounded up to a whole number of units.
    ///
    /// `align` must be a power of two no smaller than the chunk's unit.
    pub fn try_allocate(&mut self, size: usize, align: usize) -> Option<(NonZeroUsize, usize)> {
        debug_assert!(align.is_power_of_two());
        debug_assert!(align >= self.align);

        if size > self.free_bytes {
            return None;
        }

        let needed = units_for(size, self.align);
        let mut run = 0;
        let mut start = 0;

        for unit in 0..self.units() {
            if self.bitmap.get(unit) {
                run = 0;
                continue;
            }

            if run == 0 {
                // Only aligned units may begin a run.
                if self.unit_addr(unit) & (align - 1) != 0 {
                    continue;
                }

                start = unit;
            }

            run += 1;

            if run == needed {
                self.bitmap.set_range(start..start + run, true);

                let consumed = run * self.align;
                self.free_bytes -= consumed;

                return NonZeroUsize::new(self.unit_addr(start)).map(|addr| (addr, consumed));
            }
        }

        None
    }

    /// Marks the block of `size` bytes at `addr` free again.
    ///
    /// Returns the number of bytes released.
    pub fn release(&mut self, addr: usize, size: usize) -> usize {
        debug_assert!(self.contains(addr));

        let start = self.unit_of(addr);
        let end = cmp::min(start + units_for(size, self.align), self.units());

        debug_assert!(
            self.bitmap.all(start..end, true),
            "released block was not allocated"
        );

        self.bitmap.set_range(start..end, false);

        let released = (end - start) * self.align;
        self.free_bytes = cmp::min(self.free_bytes + released, self.size());

        released
    }
}
