//! Per-class pools shared by every fast cache.
//!
//! A central free list owns the spans of one size class (in one partition).
//! Fast caches refill from it and flush to it in batches. Each list has its
//! own lock, so classes never contend with each other; the page heap lock is
//! only ever taken while holding a central list lock, never the other way
//! around.

use crate::{
    lock::Mutex,
    object_list::ObjectList,
    page_heap::PageHeap,
    size_class::SizeClass,
    span::{Span, SpanSet},
};

struct Pool {
    /// Spans with at least one available object.
    nonempty: SpanSet,
    /// Available objects across all of this list's spans.
    free_objects: usize,
    /// Spans owned by this list.
    spans: usize,
}

// Safety: the pool's spans are owned by this list and only touched under its
// lock.
unsafe impl Send for Pool {}

/// Point-in-time counters of one central free list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CentralStats {
    pub(crate) free_objects: usize,
    pub(crate) spans: usize,
}

pub(crate) struct CentralFreeList {
    pool: Mutex<Pool>,
}

impl CentralFreeList {
    pub(crate) const fn new() -> Self {
        CentralFreeList {
            pool: Mutex::new(Pool {
                nonempty: SpanSet::new(),
                free_objects: 0,
                spans: 0,
            }),
        }
    }

    /// Take up to `n` objects of `class`, carving new spans from the heap as
    /// needed. Returns fewer objects (possibly none) only if the heap is out
    /// of memory.
    pub(crate) fn remove_range(
        &self,
        heap: &PageHeap,
        class: SizeClass,
        cold: bool,
        n: usize,
        memory_limit: usize,
    ) -> ObjectList {
        let mut out = ObjectList::new();
        let mut pool = self.pool.lock();
        while out.len() < n {
            let span = match pool.nonempty.pop_root() {
                Some(span) => span,
                None => match heap.allocate_small(class, cold, memory_limit) {
                    Some(span) => {
                        pool.free_objects += span.available();
                        pool.spans += 1;
                        span
                    }
                    None => break,
                },
            };
            while out.len() < n {
                let Some(obj) = span.pop_object() else { break };
                // Safety: the object was just taken out of its span.
                unsafe { out.push(obj) };
                pool.free_objects -= 1;
            }
            if !span.is_full() {
                pool.nonempty.insert(span);
            }
        }
        out
    }

    /// Return objects to their spans. Spans whose objects are all back are
    /// returned to the page heap.
    ///
    /// ### Safety
    ///
    /// Every object must have been handed out by [`Self::remove_range`] of this
    /// list and must not be used any more.
    pub(crate) unsafe fn insert_range(&self, heap: &PageHeap, objects: ObjectList) {
        let mut pool = self.pool.lock();
        for obj in objects {
            let Some(span) = heap.lookup(obj) else {
                debug_assert!(false, "{obj:p} has no span");
                continue;
            };
            let was_full = span.is_full();
            span.push_object(obj);
            pool.free_objects += 1;

            if span.allocated() == 0 {
                if !was_full {
                    pool.nonempty.remove(span);
                }
                pool.free_objects -= span.available();
                pool.spans -= 1;
                release_span(heap, span);
            } else if was_full {
                pool.nonempty.insert(span);
            }
        }
    }

    pub(crate) fn stats(&self) -> CentralStats {
        let pool = self.pool.lock();
        CentralStats {
            free_objects: pool.free_objects,
            spans: pool.spans,
        }
    }
}

fn release_span(heap: &PageHeap, span: &'static Span<'static>) {
    // Safety: every object of the span is back and the span is in none of
    // this list's sets.
    unsafe { heap.deallocate(span) };
}
