//! Page geometry shared by the page heap, the page map and the size classes.

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 13;

/// The size of the pages that spans are made of.
///
/// This is the allocator's own page, independent of the operating system's
/// page size (which must divide it).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The page containing `addr`.
#[inline]
pub(crate) const fn page_of(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

/// The first address of `page`.
#[inline]
pub(crate) const fn page_addr(page: usize) -> usize {
    page << PAGE_SHIFT
}

/// The number of pages needed to hold `bytes`, or `None` on overflow.
#[inline]
pub(crate) const fn pages_for(bytes: usize) -> Option<usize> {
    match bytes.checked_add(PAGE_SIZE - 1) {
        Some(b) => Some(b >> PAGE_SHIFT),
        None => None,
    }
}

/// The number of bytes in `pages` pages.
#[inline]
pub(crate) const fn bytes_of(pages: usize) -> usize {
    pages << PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(pages_for(0), Some(0));
        assert_eq!(pages_for(1), Some(1));
        assert_eq!(pages_for(PAGE_SIZE), Some(1));
        assert_eq!(pages_for(PAGE_SIZE + 1), Some(2));
        assert_eq!(pages_for(usize::MAX), None);
        assert_eq!(page_addr(page_of(3 * PAGE_SIZE + 17)), 3 * PAGE_SIZE);
        assert_eq!(bytes_of(4), 4 * PAGE_SIZE);
    }
}
