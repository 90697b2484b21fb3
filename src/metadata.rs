//! Allocation of span records.
//!
//! Records are bump-allocated out of chunks mapped from the OS collaborator and
//! recycled through a free set. They are never returned to the OS: span
//! records are tiny and their number is bounded by the peak number of spans.

use core::{mem, ptr::NonNull};

use crate::{
    pages::PAGE_SIZE,
    span::{RecordSet, Span},
    system::SystemAllocator,
};

const CHUNK_BYTES: usize = 128 * 1024;

/// Hands out `&'static Span<'static>` records. Used under the page heap lock.
pub(crate) struct SpanAllocator {
    recycled: RecordSet,
    /// Bump region of the current chunk.
    cursor: usize,
    end: usize,
    /// Bytes mapped for records.
    mapped: usize,
    /// Records currently handed out.
    live: usize,
}

impl SpanAllocator {
    pub(crate) const fn new() -> Self {
        SpanAllocator {
            recycled: RecordSet::new(),
            cursor: 0,
            end: 0,
            mapped: 0,
            live: 0,
        }
    }

    /// Get a fresh record. Its contents are reset by the caller with
    /// [`Span::init`].
    pub(crate) fn allocate(&mut self, system: &SystemAllocator) -> Option<&'static Span<'static>> {
        if let Some(span) = self.recycled.pop_root() {
            self.live += 1;
            return Some(span);
        }

        let size = mem::size_of::<Span<'static>>();
        let align = mem::align_of::<Span<'static>>();
        let mut start = (self.cursor + align - 1) & !(align - 1);
        if self.cursor == 0 || start + size > self.end {
            let chunk = system.map(CHUNK_BYTES, PAGE_SIZE)?;
            self.mapped += CHUNK_BYTES;
            self.cursor = chunk.as_ptr() as usize;
            self.end = self.cursor + CHUNK_BYTES;
            start = self.cursor;
        }
        self.cursor = start + size;

        let ptr = NonNull::new(start as *mut Span<'static>)?;
        // Safety: `ptr` is properly aligned, within a chunk we own, and not
        // aliased by any other record.
        unsafe {
            ptr.as_ptr().write(Span::new());
            self.live += 1;
            Some(&*ptr.as_ptr())
        }
    }

    /// Recycle a record.
    ///
    /// ### Safety
    ///
    /// The record must have come from this allocator, must not be in any tree,
    /// and must not be referenced by the page map or anyone else.
    pub(crate) unsafe fn deallocate(&mut self, span: &'static Span<'static>) {
        debug_assert!(self.live > 0);
        self.live -= 1;
        span.retire();
        self.recycled.insert(span);
    }

    /// Bytes of OS memory used for records.
    pub(crate) fn mapped_bytes(&self) -> usize {
        self.mapped
    }

    /// Records currently in use.
    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_recycled() {
        let system = SystemAllocator::new();
        let mut records = SpanAllocator::new();

        let a = records.allocate(&system).unwrap();
        let b = records.allocate(&system).unwrap();
        assert!(!core::ptr::eq(a, b));
        assert_eq!(records.live(), 2);
        assert_eq!(records.mapped_bytes(), CHUNK_BYTES);

        unsafe { records.deallocate(a) };
        let c = records.allocate(&system).unwrap();
        assert!(core::ptr::eq(a, c));
        assert_eq!(records.mapped_bytes(), CHUNK_BYTES);
    }

    #[test]
    fn chunks_are_added_on_demand() {
        let system = SystemAllocator::new();
        let mut records = SpanAllocator::new();
        let per_chunk = CHUNK_BYTES / mem::size_of::<Span<'static>>();
        for _ in 0..per_chunk + 1 {
            records.allocate(&system).unwrap();
        }
        assert_eq!(records.mapped_bytes(), 2 * CHUNK_BYTES);
        assert_eq!(records.live(), per_chunk + 1);
    }
}
