//! The page heap: the source of truth for which pages are free.
//!
//! Free spans are organized into a 3-layer free list:
//!
//! 1. By partition: hot pages and cold pages never share a span, so cold
//!    allocations cluster and can be released independently of hot ones.
//!
//! 2. By state: spans whose pages are still backed by physical memory and spans
//!    whose backing has been released to the OS.
//!
//! 3. By length: exact-length buckets for short spans (any member of a bucket
//!    fits equally well), and a splay tree ordered by length for long spans.
//!
//! When allocating we search the backed buckets from the requested length
//! upwards, then the released buckets, then the long-span trees. In the
//! long-span trees we accept a span that exceeds the request by at most
//! `1 / ACCEPTABLE_WASTE_DIVISOR` first, and only then widen the search. Since
//! we split spans, the excess is not lost, but carving small allocations out
//! of huge spans breaks up long free runs that a later large allocation might
//! have wanted.
//!
//! Freed spans are immediately merged with their free neighbors of the same
//! partition and state.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    lock::Mutex,
    metadata::SpanAllocator,
    page_map::{ClassTag, PageMap},
    pages::{bytes_of, page_of, PAGE_SIZE},
    size_class::SizeClass,
    span::{FitRange, LengthSet, Span, SpanSet, SpanState},
    system::SystemAllocator,
};

/// Free spans of up to this many pages live in exact-length buckets.
pub(crate) const MAX_BUCKET_PAGES: usize = 128;

/// The heap grows by at least this many pages at a time.
pub(crate) const MIN_GROWTH_PAGES: usize = 128;

/// See the module documentation.
///
/// NB: keep this a power of two so that the compiler can strength-reduce the
/// division into a shift.
const ACCEPTABLE_WASTE_DIVISOR: usize = 8;

type SpanRef = &'static Span<'static>;

struct FreeLists {
    buckets: [SpanSet; MAX_BUCKET_PAGES],
    long: LengthSet,
    /// Total pages in this set.
    pages: usize,
}

impl FreeLists {
    const fn new() -> Self {
        FreeLists {
            buckets: [const { SpanSet::new() }; MAX_BUCKET_PAGES],
            long: LengthSet::new(),
            pages: 0,
        }
    }

    fn insert(&mut self, span: SpanRef) {
        if span.pages() <= MAX_BUCKET_PAGES {
            self.buckets[span.pages() - 1].insert(span);
        } else {
            self.long.insert(span);
        }
        self.pages += span.pages();
    }

    fn remove(&mut self, span: SpanRef) {
        let removed = if span.pages() <= MAX_BUCKET_PAGES {
            self.buckets[span.pages() - 1].remove(span)
        } else {
            self.long.remove(span)
        };
        debug_assert!(removed.is_some_and(|s| ptr::eq(s, span)));
        self.pages -= span.pages();
    }

    fn take_bucket(&mut self, pages: usize) -> Option<SpanRef> {
        let span = self.buckets[pages - 1].pop_root()?;
        self.pages -= span.pages();
        Some(span)
    }

    fn take_long(&mut self, want: usize) -> Option<SpanRef> {
        let mut max = want.saturating_add(want / ACCEPTABLE_WASTE_DIVISOR);
        loop {
            if let Some(span) = self.long.remove(&FitRange { min: want, max }) {
                self.pages -= span.pages();
                return Some(span);
            }
            if max == usize::MAX {
                return None;
            }
            max = max.saturating_mul(2);
        }
    }

    /// Take the longest-first span for release.
    fn take_for_release(&mut self) -> Option<SpanRef> {
        if let Some(span) = self.long.pop_root() {
            self.pages -= span.pages();
            return Some(span);
        }
        (1..=MAX_BUCKET_PAGES)
            .rev()
            .find_map(|pages| self.take_bucket(pages))
    }
}

struct Partition {
    backed: FreeLists,
    returned: FreeLists,
}

impl Partition {
    const fn new() -> Self {
        Partition {
            backed: FreeLists::new(),
            returned: FreeLists::new(),
        }
    }
}

/// A snapshot of page heap accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct HeapStats {
    /// Bytes mapped for heap pages.
    pub(crate) system_bytes: usize,
    /// Free bytes still backed by physical memory.
    pub(crate) free_bytes: usize,
    /// Free bytes whose backing has been released.
    pub(crate) unmapped_bytes: usize,
    /// The cold partition's share of `free_bytes`.
    pub(crate) cold_free_bytes: usize,
    /// The cold partition's share of `unmapped_bytes`.
    pub(crate) cold_unmapped_bytes: usize,
    /// Bytes mapped for span records and the page map.
    pub(crate) metadata_bytes: usize,
    /// Span records in use.
    pub(crate) spans: usize,
}

/// The result of looking up a pointer that should be a page-level
/// allocation.
#[derive(Clone, Copy, Debug)]
pub(crate) enum LargeLookup {
    Live(SpanRef),
    /// The pointer is the start of a free span.
    Freed,
    Unknown,
}

struct PageHeapInner {
    hot: Partition,
    cold: Partition,
    records: SpanAllocator,
    system_bytes: usize,
}

// Safety: the free sets only contain records owned by this heap, and the heap
// is only accessed through its mutex.
unsafe impl Send for PageHeapInner {}

pub(crate) struct PageHeap {
    inner: Mutex<PageHeapInner>,
    map: PageMap,
    system: SystemAllocator,
    unlogged_growth: AtomicUsize,
}

impl PageHeap {
    pub(crate) const fn new() -> Self {
        PageHeap {
            inner: Mutex::new(PageHeapInner {
                hot: Partition::new(),
                cold: Partition::new(),
                records: SpanAllocator::new(),
                system_bytes: 0,
            }),
            map: PageMap::new(),
            system: SystemAllocator::new(),
            unlogged_growth: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn map(&self) -> &PageMap {
        &self.map
    }

    #[inline]
    pub(crate) fn system(&self) -> &SystemAllocator {
        &self.system
    }

    /// Allocate a span of `pages` pages whose start is aligned to
    /// `align_pages` pages, for a page-level allocation.
    ///
    /// The span is returned in the `Large` state with its ends registered in
    /// the page map; the caller fills in the allocation's details.
    /// `memory_limit` of zero means unlimited.
    pub(crate) fn allocate_large(
        &self,
        pages: usize,
        align_pages: usize,
        cold: bool,
        memory_limit: usize,
    ) -> Option<SpanRef> {
        debug_assert!(pages > 0);
        debug_assert!(align_pages.is_power_of_two());
        let mut inner = self.inner.lock();
        inner.allocate(self, pages, align_pages, cold, memory_limit)
    }

    /// Allocate a span carved into objects of `class`, with every page
    /// registered in the page map.
    pub(crate) fn allocate_small(
        &self,
        class: SizeClass,
        cold: bool,
        memory_limit: usize,
    ) -> Option<SpanRef> {
        let mut inner = self.inner.lock();
        let span = inner.allocate(self, class.pages(), 1, cold, memory_limit)?;
        span.init_small(class);
        self.map.register_small(span, ClassTag::new(class, cold));
        Some(span)
    }

    /// Log heap growth that happened since the last call.
    ///
    /// Growth happens under locks, where logging is not allowed, so it is
    /// logged after the fact by whoever triggered it.
    pub(crate) fn log_growth(&self) {
        let grown = self.unlogged_growth.swap(0, Ordering::Relaxed);
        if grown > 0 {
            event!(
                Debug,
                "grew page heap by {} pages ({} bytes mapped in total)",
                grown,
                self.system.bytes_mapped()
            );
        }
    }

    /// Return a small or large span to the free sets.
    ///
    /// ### Safety
    ///
    /// The span must have been allocated from this heap, and nothing may use
    /// its pages any more.
    pub(crate) unsafe fn deallocate(&self, span: SpanRef) {
        let mut inner = self.inner.lock();
        debug_assert!(!span.is_free());
        if let SpanState::Small(_) = span.state() {
            self.map.clear_small(span);
        }
        span.set_sample(None);
        span.set_state(SpanState::Free);
        inner.insert_free(&self.map, span);
    }

    /// Give the tail of a large span back to the heap so that it is `pages`
    /// pages long. Returns `false` if that is not possible.
    pub(crate) fn shrink(&self, span: SpanRef, pages: usize) -> bool {
        debug_assert_eq!(span.state(), SpanState::Large);
        if pages == 0 || pages >= span.pages() {
            return pages == span.pages();
        }
        let mut inner = self.inner.lock();
        let Some(tail) = inner.records.allocate(&self.system) else {
            return false;
        };
        tail.init(
            span.first_page() + pages,
            span.pages() - pages,
            SpanState::Free,
            span.is_cold(),
        );
        span.set_range(span.first_page(), pages);
        self.map.register_ends(span);
        inner.insert_free(&self.map, tail);
        true
    }

    /// Release whole backed free spans until at least `budget_pages` pages have
    /// been released or no backed free span is left. Returns the number of
    /// pages released.
    pub(crate) fn release(&self, budget_pages: usize, cold_only: bool) -> usize {
        let mut inner = self.inner.lock();
        inner.release(self, budget_pages, cold_only)
    }

    /// Find the page-level allocation starting at `ptr`.
    pub(crate) fn lookup_large(&self, ptr: NonNull<u8>) -> LargeLookup {
        let addr = ptr.as_ptr() as usize;
        if addr % PAGE_SIZE != 0 {
            return LargeLookup::Unknown;
        }
        let page = page_of(addr);
        match self.map.get(page) {
            Some(span) if span.first_page() == page => match span.state() {
                SpanState::Large => LargeLookup::Live(span),
                SpanState::Free | SpanState::Returned => LargeLookup::Freed,
                SpanState::Small(_) => LargeLookup::Unknown,
            },
            Some(span) if span.is_free() && span.contains_page(page) => LargeLookup::Freed,
            _ => LargeLookup::Unknown,
        }
    }

    /// Find the span owning `ptr`, whatever its state.
    pub(crate) fn lookup(&self, ptr: NonNull<u8>) -> Option<SpanRef> {
        let page = page_of(ptr.as_ptr() as usize);
        let span = self.map.get(page)?;
        if span.contains_page(page) {
            Some(span)
        } else {
            None
        }
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let inner = self.inner.lock();
        let free = inner.hot.backed.pages + inner.cold.backed.pages;
        let unmapped = inner.hot.returned.pages + inner.cold.returned.pages;
        HeapStats {
            system_bytes: inner.system_bytes,
            free_bytes: bytes_of(free),
            unmapped_bytes: bytes_of(unmapped),
            cold_free_bytes: bytes_of(inner.cold.backed.pages),
            cold_unmapped_bytes: bytes_of(inner.cold.returned.pages),
            metadata_bytes: inner.records.mapped_bytes() + self.map.mapped_bytes(),
            spans: inner.records.live(),
        }
    }
}

impl PageHeapInner {
    fn lists(&mut self, cold: bool, state: SpanState) -> &mut FreeLists {
        let partition = if cold { &mut self.cold } else { &mut self.hot };
        match state {
            SpanState::Returned => &mut partition.returned,
            _ => &mut partition.backed,
        }
    }

    fn unmapped_pages(&self) -> usize {
        self.hot.returned.pages + self.cold.returned.pages
    }

    /// Insert a free span, first merging it with its free neighbors of the
    /// same partition and state.
    fn insert_free(&mut self, map: &PageMap, span: SpanRef) {
        debug_assert!(span.is_free());
        let state = span.state();
        let cold = span.is_cold();
        let mergeable =
            |other: SpanRef| !ptr::eq(other, span) && other.state() == state && other.is_cold() == cold;

        if let Some(prev) = span.first_page().checked_sub(1).and_then(|p| map.get(p)) {
            if prev.end_page() == span.first_page() && mergeable(prev) {
                self.lists(cold, state).remove(prev);
                span.set_range(prev.first_page(), prev.pages() + span.pages());
                // Safety: `prev` is in no tree any more and its pages now
                // belong to `span`, whose ends are registered below.
                unsafe { self.records.deallocate(prev) };
            }
        }
        if let Some(next) = map.get(span.end_page()) {
            if next.first_page() == span.end_page() && mergeable(next) {
                self.lists(cold, state).remove(next);
                span.set_range(span.first_page(), span.pages() + next.pages());
                // Safety: as above.
                unsafe { self.records.deallocate(next) };
            }
        }

        map.register_ends(span);
        self.lists(cold, state).insert(span);
    }

    /// Take a free span of at least `want` pages out of the free sets.
    fn take(&mut self, want: usize, cold: bool) -> Option<SpanRef> {
        let partition = if cold { &mut self.cold } else { &mut self.hot };
        if want <= MAX_BUCKET_PAGES {
            for lists in [&mut partition.backed, &mut partition.returned] {
                if let Some(span) = (want..=MAX_BUCKET_PAGES).find_map(|n| lists.take_bucket(n)) {
                    return Some(span);
                }
            }
        }
        partition
            .backed
            .take_long(want)
            .or_else(|| partition.returned.take_long(want))
    }

    fn allocate(
        &mut self,
        heap: &PageHeap,
        pages: usize,
        align_pages: usize,
        cold: bool,
        memory_limit: usize,
    ) -> Option<SpanRef> {
        let want = pages.checked_add(align_pages - 1)?;

        // Records for the prefix and suffix we might trim off, reserved up
        // front so that carving cannot fail half-way.
        let head = self.records.allocate(&heap.system)?;
        let Some(tail) = self.records.allocate(&heap.system) else {
            // Safety: fresh record, referenced by nobody.
            unsafe { self.records.deallocate(head) };
            return None;
        };

        let span = match self.take(want, cold) {
            Some(span) => Some(span),
            None => match self.grow(heap, want, cold, memory_limit) {
                Some(pages) => {
                    heap.unlogged_growth.fetch_add(pages, Ordering::Relaxed);
                    self.take(want, cold)
                }
                None => None,
            },
        };
        let Some(span) = span else {
            // Safety: fresh records, referenced by nobody.
            unsafe {
                self.records.deallocate(head);
                self.records.deallocate(tail);
            }
            return None;
        };

        let unused = self.carve(&heap.map, span, pages, align_pages, head, tail);
        for record in unused.into_iter().flatten() {
            // Safety: unused records were never published.
            unsafe { self.records.deallocate(record) };
        }
        Some(span)
    }

    /// Trim a span taken from the free sets down to `pages` pages aligned to
    /// `align_pages`, returning the excess to the free sets. Returns the
    /// records that were not needed.
    fn carve(
        &mut self,
        map: &PageMap,
        span: SpanRef,
        pages: usize,
        align_pages: usize,
        head: SpanRef,
        tail: SpanRef,
    ) -> [Option<SpanRef>; 2] {
        let state = span.state();
        let cold = span.is_cold();
        debug_assert!(span.is_free());
        span.set_state(SpanState::Large);

        let mut unused = [Some(head), Some(tail)];

        let first = span.first_page();
        let aligned = (first + align_pages - 1) & !(align_pages - 1);
        if aligned > first {
            let prefix = aligned - first;
            span.set_range(aligned, span.pages() - prefix);
            head.init(first, prefix, state, cold);
            self.insert_free(map, head);
            unused[0] = None;
        }
        if span.pages() > pages {
            tail.init(span.first_page() + pages, span.pages() - pages, state, cold);
            span.set_range(span.first_page(), pages);
            self.insert_free(map, tail);
            unused[1] = None;
        }

        debug_assert_eq!(span.pages(), pages);
        debug_assert_eq!(span.first_page() % align_pages, 0);
        map.register_ends(span);
        unused
    }

    /// Map fresh pages for at least `want` pages. Returns the number of pages
    /// added.
    fn grow(&mut self, heap: &PageHeap, want: usize, cold: bool, memory_limit: usize) -> Option<usize> {
        let pages = want.max(MIN_GROWTH_PAGES);
        let bytes = pages.checked_mul(PAGE_SIZE)?;
        if bytes > isize::MAX as usize {
            return None;
        }

        if memory_limit != 0 {
            let physical = |inner: &Self| inner.system_bytes - bytes_of(inner.unmapped_pages());
            let over = (physical(self) + bytes).saturating_sub(memory_limit);
            if over > 0 {
                self.release(heap, over.div_ceil(PAGE_SIZE), false);
                if physical(self) + bytes > memory_limit {
                    return None;
                }
            }
        }

        let ptr = heap.system.map(bytes, PAGE_SIZE)?;
        let first = page_of(ptr.as_ptr() as usize);
        let span = if heap.map.ensure(&heap.system, first, pages) {
            self.records.allocate(&heap.system)
        } else {
            None
        };
        let Some(span) = span else {
            // Safety: the mapping is fresh and nothing refers to it yet.
            unsafe { heap.system.unmap(ptr, bytes, PAGE_SIZE) };
            return None;
        };
        span.init(first, pages, SpanState::Free, cold);
        self.system_bytes += bytes;
        self.insert_free(&heap.map, span);
        Some(pages)
    }

    fn release(&mut self, heap: &PageHeap, budget_pages: usize, cold_only: bool) -> usize {
        let mut released = 0;
        for cold in [true, false] {
            if !cold && cold_only {
                break;
            }
            while released < budget_pages {
                let partition = if cold { &mut self.cold } else { &mut self.hot };
                let Some(span) = partition.backed.take_for_release() else {
                    break;
                };
                // Safety: the span is free and out of the free sets; nobody
                // touches its pages.
                if unsafe { heap.system.release(span.start(), span.bytes()) } {
                    released += span.pages();
                    span.set_state(SpanState::Returned);
                    self.insert_free(&heap.map, span);
                } else {
                    self.insert_free(&heap.map, span);
                    return released;
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> &'static PageHeap {
        Box::leak(Box::new(PageHeap::new()))
    }

    #[test]
    fn allocate_aligned_spans() {
        let heap = heap();
        for align_pages in [1, 2, 8, 64, 256] {
            let span = heap.allocate_large(3, align_pages, false, 0).unwrap();
            assert_eq!(span.pages(), 3);
            assert_eq!(span.first_page() % align_pages, 0);
            assert_eq!(span.state(), SpanState::Large);
            assert!(matches!(heap.lookup_large(span.start()), LargeLookup::Live(s) if ptr::eq(s, span)));
        }
    }

    #[test]
    fn growth_is_accounted() {
        let heap = heap();
        let span = heap.allocate_large(1, 1, false, 0).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.system_bytes, MIN_GROWTH_PAGES * PAGE_SIZE);
        assert_eq!(stats.free_bytes, (MIN_GROWTH_PAGES - 1) * PAGE_SIZE);
        assert_eq!(stats.unmapped_bytes, 0);

        unsafe { heap.deallocate(span) };
        let stats = heap.stats();
        assert_eq!(stats.free_bytes, MIN_GROWTH_PAGES * PAGE_SIZE);
    }

    #[test]
    fn freed_neighbors_coalesce() {
        let heap = heap();
        let a = heap.allocate_large(4, 1, false, 0).unwrap();
        let b = heap.allocate_large(4, 1, false, 0).unwrap();
        let c = heap.allocate_large(4, 1, false, 0).unwrap();
        // The three allocations plus the free remainder.
        assert_eq!(heap.stats().spans, 4);

        unsafe {
            heap.deallocate(a);
            heap.deallocate(c);
            heap.deallocate(b);
        }
        // Everything merged back into a single free span.
        assert_eq!(heap.stats().spans, 1);
        let whole = heap.allocate_large(MIN_GROWTH_PAGES, 1, false, 0).unwrap();
        assert_eq!(heap.stats().system_bytes, MIN_GROWTH_PAGES * PAGE_SIZE);
        assert!(matches!(heap.lookup_large(whole.start()), LargeLookup::Live(_)));
    }

    #[test]
    fn double_free_is_detected() {
        let heap = heap();
        let span = heap.allocate_large(2, 1, false, 0).unwrap();
        let ptr = span.start();
        unsafe { heap.deallocate(span) };
        assert!(matches!(heap.lookup_large(ptr), LargeLookup::Freed));
        assert!(matches!(
            heap.lookup_large(NonNull::new(PAGE_SIZE as *mut u8).unwrap()),
            LargeLookup::Unknown
        ));
    }

    #[test]
    fn hot_and_cold_do_not_mix() {
        let heap = heap();
        let hot = heap.allocate_large(1, 1, false, 0).unwrap();
        let cold = heap.allocate_large(1, 1, true, 0).unwrap();
        assert!(!hot.is_cold());
        assert!(cold.is_cold());
        let stats = heap.stats();
        assert_eq!(stats.system_bytes, 2 * MIN_GROWTH_PAGES * PAGE_SIZE);
        assert_eq!(stats.cold_free_bytes, (MIN_GROWTH_PAGES - 1) * PAGE_SIZE);
    }

    #[test]
    fn release_is_whole_span_and_idempotent() {
        let heap = heap();
        let span = heap.allocate_large(8, 1, false, 0).unwrap();
        let free = heap.stats().free_bytes;

        // Releasing a single page still releases the whole free span.
        let released = heap.release(1, false);
        assert_eq!(bytes_of(released), free);
        let stats = heap.stats();
        assert_eq!(stats.free_bytes, 0);
        assert_eq!(stats.unmapped_bytes, free);

        assert_eq!(heap.release(usize::MAX, false), 0);
        assert_eq!(heap.stats().unmapped_bytes, free);

        // Reusing released pages takes them out of the unmapped count.
        let reused = heap.allocate_large(16, 1, false, 0).unwrap();
        assert_eq!(heap.stats().unmapped_bytes, free - 16 * PAGE_SIZE);
        unsafe {
            reused.start().as_ptr().write_bytes(1, 16 * PAGE_SIZE);
            heap.deallocate(reused);
            heap.deallocate(span);
        }
        let stats = heap.stats();
        assert_eq!(stats.free_bytes + stats.unmapped_bytes, stats.system_bytes);
    }

    #[test]
    fn cold_only_release() {
        let heap = heap();
        heap.allocate_large(1, 1, false, 0).unwrap();
        heap.allocate_large(1, 1, true, 0).unwrap();
        let released = heap.release(usize::MAX, true);
        assert_eq!(released, MIN_GROWTH_PAGES - 1);
        let stats = heap.stats();
        assert_eq!(stats.cold_unmapped_bytes, bytes_of(released));
        assert_eq!(stats.free_bytes, (MIN_GROWTH_PAGES - 1) * PAGE_SIZE);
    }

    #[test]
    fn shrink_in_place() {
        let heap = heap();
        let span = heap.allocate_large(10, 1, false, 0).unwrap();
        let free = heap.stats().free_bytes;
        assert!(heap.shrink(span, 4));
        assert_eq!(span.pages(), 4);
        assert_eq!(heap.stats().free_bytes, free + 6 * PAGE_SIZE);
        assert!(!heap.shrink(span, 5));
    }

    #[test]
    fn memory_limit_fails_growth() {
        let heap = heap();
        let limit = 2 * MIN_GROWTH_PAGES * PAGE_SIZE;
        let a = heap.allocate_large(MIN_GROWTH_PAGES, 1, false, limit).unwrap();
        let b = heap.allocate_large(MIN_GROWTH_PAGES, 1, false, limit).unwrap();
        assert!(heap.allocate_large(1, 1, false, limit).is_none());

        // Free pages are released before giving up.
        unsafe { heap.deallocate(b) };
        let c = heap.allocate_large(MIN_GROWTH_PAGES, 1, true, limit).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.unmapped_bytes, MIN_GROWTH_PAGES * PAGE_SIZE);
        assert!(stats.system_bytes - stats.unmapped_bytes <= limit);
        unsafe {
            heap.deallocate(a);
            heap.deallocate(c);
        }
    }

    #[test]
    fn small_spans_are_tagged() {
        let heap = heap();
        let class = crate::size_class::SizeClassTable::get()
            .classify(4096 + 512, 1)
            .unwrap();
        let span = heap.allocate_small(class, true, 0).unwrap();
        let pages = span.first_page()..span.end_page();
        assert_eq!(pages.len(), class.pages());
        for page in pages.clone() {
            let tag = heap.map().class_tag(page).unwrap();
            assert_eq!(tag.class(), class);
            assert!(tag.is_cold());
        }
        unsafe { heap.deallocate(span) };
        for page in pages {
            assert!(heap.map().class_tag(page).is_none());
        }
    }
}
