//! The static size-class table.
//!
//! Small requests (at most [`MAX_SMALL_SIZE`] bytes, aligned to at most a page)
//! are rounded up into one of a fixed set of object sizes. Up to 128 bytes the
//! classes are spaced 16 bytes apart (plus an 8-byte class); after that every
//! doubling is split into eight evenly spaced classes, so adjacent classes never
//! differ by more than 12.5%.
//!
//! Everything here is computed at compile time.

use crate::pages::{PAGE_SHIFT, PAGE_SIZE};

/// The largest request served from a size class. Larger requests get a span
/// of their own.
pub const MAX_SMALL_SIZE: usize = 256 * 1024;

/// The largest supported alignment. Requests for larger alignments fail.
pub const MAX_ALIGNMENT: usize = PAGE_SIZE << 13;

/// The alignment of C-style entry points that do not take an alignment, and
/// the largest alignment a [`FreeHint`](crate::FreeHint) without an alignment
/// stands for.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Number of size classes, including the reserved class `0`.
pub(crate) const NUM_CLASSES: usize = 98;

/// Objects moved between a fast cache and a central list per transfer are
/// bounded by this and by [`TRANSFER_BYTES`].
pub(crate) const MAX_BATCH: usize = 32;
const MIN_BATCH: usize = 2;
const TRANSFER_BYTES: usize = 64 * 1024;

const CLASS_INDEX_LEN: usize = class_index(MAX_SMALL_SIZE) + 1;

/// Index into the dense reverse-lookup array: 8-byte granularity up to 1 KiB,
/// 128-byte granularity above.
#[inline]
const fn class_index(size: usize) -> usize {
    if size <= 1024 {
        (size + 7) >> 3
    } else {
        (size + 127 + (120 << 7)) >> 7
    }
}

/// A size class.
///
/// Class `0` is reserved and never returned from lookups; valid classes are
/// numbered from `1` in increasing order of object size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    pub(crate) const fn from_index(index: usize) -> Self {
        debug_assert!(index > 0 && index < NUM_CLASSES);
        SizeClass(index as u8)
    }

    /// This class's dense index, in `1..NUM_CLASSES`.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The byte size of objects in this class.
    #[inline]
    pub fn size(self) -> usize {
        SIZE_CLASSES.sizes[self.index()] as usize
    }

    /// The number of pages in each span carved for this class.
    #[inline]
    pub fn pages(self) -> usize {
        SIZE_CLASSES.pages[self.index()] as usize
    }

    /// The number of objects moved per fast cache refill or flush.
    #[inline]
    pub fn batch_size(self) -> usize {
        SIZE_CLASSES.batch[self.index()] as usize
    }

    /// The number of objects in each span of this class.
    #[inline]
    pub fn objects_per_span(self) -> usize {
        (self.pages() << PAGE_SHIFT) / self.size()
    }

    /// The alignment every object of this class is guaranteed to have.
    #[inline]
    pub fn natural_alignment(self) -> usize {
        let size = self.size();
        (size & size.wrapping_neg()).min(PAGE_SIZE)
    }
}

/// The mapping from request sizes to [`SizeClass`]es.
#[derive(Debug)]
pub struct SizeClassTable {
    sizes: [u32; NUM_CLASSES],
    pages: [u8; NUM_CLASSES],
    batch: [u8; NUM_CLASSES],
    index: [u8; CLASS_INDEX_LEN],
}

/// The process-wide table. It is immutable.
pub(crate) static SIZE_CLASSES: SizeClassTable = SizeClassTable::build();

impl SizeClassTable {
    const fn build() -> Self {
        let mut sizes = [0_u32; NUM_CLASSES];
        let mut pages = [0_u8; NUM_CLASSES];
        let mut batch = [0_u8; NUM_CLASSES];
        let mut index = [0_u8; CLASS_INDEX_LEN];

        let mut n = 1;
        let mut size = 8;
        while size <= MAX_SMALL_SIZE {
            sizes[n] = size as u32;
            n += 1;
            size = if size < 16 {
                16
            } else if size < 128 {
                size + 16
            } else {
                // Eight steps per doubling.
                let pow = 1 << (usize::BITS - 1 - size.leading_zeros());
                size + pow / 8
            };
        }
        assert!(n == NUM_CLASSES);

        let mut c = 1;
        while c < NUM_CLASSES {
            let size = sizes[c] as usize;

            // The smallest span that wastes no more than an eighth of itself.
            let mut p = 1;
            loop {
                let bytes = p << PAGE_SHIFT;
                if bytes >= size && (bytes % size) * 8 <= bytes {
                    break;
                }
                p += 1;
            }
            assert!(p <= u8::MAX as usize);
            pages[c] = p as u8;

            let mut b = TRANSFER_BYTES / size;
            if b < MIN_BATCH {
                b = MIN_BATCH;
            }
            if b > MAX_BATCH {
                b = MAX_BATCH;
            }
            batch[c] = b as u8;
            c += 1;
        }

        // Fill the reverse lookup: every index up to a class's own index maps
        // to the smallest class at least that large.
        let mut i = 0;
        let mut c = 1;
        while i < CLASS_INDEX_LEN {
            while class_index(sizes[c] as usize) < i {
                c += 1;
            }
            index[i] = c as u8;
            i += 1;
        }

        SizeClassTable {
            sizes,
            pages,
            batch,
            index,
        }
    }

    /// The process-wide size-class table.
    pub fn get() -> &'static SizeClassTable {
        &SIZE_CLASSES
    }

    /// The smallest class whose objects hold `size` bytes and are aligned to
    /// `align`, or `None` if the request must take the page-level path.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub fn classify(&self, size: usize, align: usize) -> Option<SizeClass> {
        debug_assert!(align.is_power_of_two());
        if size > MAX_SMALL_SIZE || align > PAGE_SIZE {
            return None;
        }
        let mut c = self.index[class_index(size)] as usize;
        // Every class size is a multiple of 8.
        if align <= 8 {
            return Some(SizeClass(c as u8));
        }
        while c < NUM_CLASSES {
            if (self.sizes[c] as usize) % align == 0 {
                return Some(SizeClass(c as u8));
            }
            c += 1;
        }
        None
    }

    /// Iterate over every valid size class in increasing size order.
    pub fn classes(&self) -> impl Iterator<Item = SizeClass> {
        (1..NUM_CLASSES).map(|c| SizeClass(c as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_increasing_with_bounded_growth() {
        let table = SizeClassTable::get();
        let mut prev = 0;
        for class in table.classes() {
            let size = class.size();
            assert!(size > prev);
            assert_eq!(size % 8, 0);
            if prev >= 128 {
                assert!(size - prev <= prev / 8, "{prev} -> {size}");
            }
            prev = size;
        }
        assert_eq!(prev, MAX_SMALL_SIZE);
    }

    #[test]
    fn classify_picks_smallest_fitting_class() {
        let table = SizeClassTable::get();
        let classes: Vec<_> = table.classes().collect();
        for size in 0..=MAX_SMALL_SIZE {
            let class = table.classify(size, 1).unwrap();
            assert!(class.size() >= size);
            if class.index() > 1 {
                let below = classes[class.index() - 2];
                assert!(below.size() < size, "size {size} skipped {below:?}");
            }
        }
        assert_eq!(table.classify(MAX_SMALL_SIZE + 1, 1), None);
    }

    #[test]
    fn classify_honors_alignment() {
        let table = SizeClassTable::get();
        for size in [0, 1, 7, 8, 9, 24, 100, 1000, 5000, 70_000] {
            let mut align = 1;
            while align <= PAGE_SIZE {
                if let Some(class) = table.classify(size, align) {
                    assert!(class.size() >= size);
                    assert_eq!(class.size() % align, 0);
                    assert!(class.natural_alignment() >= align);
                }
                align *= 2;
            }
        }
        assert_eq!(table.classify(1, 16).unwrap().size(), 16);
        assert_eq!(table.classify(8, 2 * PAGE_SIZE), None);
    }

    #[test]
    fn spans_bound_internal_waste() {
        for class in SizeClassTable::get().classes() {
            let bytes = class.pages() * PAGE_SIZE;
            assert!(class.objects_per_span() >= 1);
            assert!(bytes % class.size() <= bytes / 8, "{class:?}");
            assert!((MIN_BATCH..=MAX_BATCH).contains(&class.batch_size()));
        }
    }
}
