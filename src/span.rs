//! Span records.
//!
//! A span is a run of contiguous pages owned by exactly one party: the page
//! heap's free sets, one central free list (as slots of a single size class),
//! or one page-level allocation. Its record lives in engine metadata, not in
//! the span's own pages, so free pages may be released to the OS.
//!
//! Records are linked into intrusive splay trees. A record is a member of at
//! most one tree at any moment, so all the tree tags below share one node.
//!
//! Note: the `'a` lifetime is used internally to this module as much as
//! possible, but outside this module is always erased to `'static`; the
//! records' lifetimes are managed manually by the metadata allocator.

use core::{
    cell::Cell,
    cmp::Ordering,
    ptr::{self, NonNull},
    sync::atomic::{self, AtomicBool, AtomicU32, AtomicU8, AtomicUsize},
};

use intrusive_splay_tree::{Node, SplayTree, TreeOrd};

use crate::{
    pages::{bytes_of, page_addr},
    sampler::AllocationRecord,
    size_class::SizeClass,
};

/// What a span is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SpanState {
    /// In a page heap free set; pages are backed by physical memory.
    Free,
    /// In a page heap free set; physical backing has been released.
    Returned,
    /// Carved into objects of one size class and owned by a central list.
    Small(SizeClass),
    /// A single page-level (or sampled) allocation.
    Large,
}

impl SpanState {
    const FREE: u8 = 0;
    const RETURNED: u8 = 1;
    const LARGE: u8 = 2;
    const SMALL: u8 = 3;

    fn encode(self) -> u8 {
        match self {
            SpanState::Free => Self::FREE,
            SpanState::Returned => Self::RETURNED,
            SpanState::Large => Self::LARGE,
            SpanState::Small(class) => Self::SMALL + class.index() as u8,
        }
    }

    fn decode(bits: u8) -> Self {
        match bits {
            Self::FREE => SpanState::Free,
            Self::RETURNED => SpanState::Returned,
            Self::LARGE => SpanState::Large,
            class => SpanState::Small(SizeClass::from_index((class - Self::SMALL) as usize)),
        }
    }
}

const RELAXED: atomic::Ordering = atomic::Ordering::Relaxed;

pub(crate) struct Span<'a> {
    first_page: AtomicUsize,
    pages: AtomicUsize,
    state: AtomicU8,
    cold: AtomicBool,

    /// Object size of a small span; usable capacity of a large one.
    object_size: AtomicUsize,
    /// An object was resized in place to a request of another class, so hints
    /// for this span are only checked against its capacity.
    resized: AtomicBool,

    // Small spans.
    slots: AtomicU32,
    /// Slot index plus one of the first free slot, `0` if none.
    free_head: AtomicU32,
    /// Slots below this index have been handed out at least once.
    carved: AtomicU32,
    /// Objects currently outside the span.
    allocated: AtomicU32,

    // Large and sampled spans.
    requested: AtomicUsize,
    align: AtomicUsize,
    sampled: AtomicBool,
    sample: Cell<Option<AllocationRecord>>,

    node: Node<'a>,
}

// Safety: every field that is read without holding the owner's lock is
// atomic. `sample` and the tree node are only touched while holding the lock
// of whichever party owns the span (the page heap, one central list, or the
// sampled set), and ownership is transferred only under those locks.
unsafe impl Sync for Span<'_> {}
unsafe impl Send for Span<'_> {}

impl core::fmt::Debug for Span<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Span")
            .field("first_page", &self.first_page())
            .field("pages", &self.pages())
            .field("state", &self.state())
            .field("cold", &self.is_cold())
            .finish_non_exhaustive()
    }
}

impl<'a> Span<'a> {
    pub(crate) fn new() -> Self {
        Span {
            first_page: AtomicUsize::new(0),
            pages: AtomicUsize::new(0),
            state: AtomicU8::new(SpanState::FREE),
            cold: AtomicBool::new(false),
            object_size: AtomicUsize::new(0),
            resized: AtomicBool::new(false),
            slots: AtomicU32::new(0),
            free_head: AtomicU32::new(0),
            carved: AtomicU32::new(0),
            allocated: AtomicU32::new(0),
            requested: AtomicUsize::new(0),
            align: AtomicUsize::new(0),
            sampled: AtomicBool::new(false),
            sample: Cell::new(None),
            node: Node::default(),
        }
    }

    /// Reset this record to describe a free run of pages.
    pub(crate) fn init(&self, first_page: usize, pages: usize, state: SpanState, cold: bool) {
        debug_assert!(pages > 0);
        self.set_range(first_page, pages);
        self.set_state(state);
        self.cold.store(cold, RELAXED);
        self.object_size.store(0, RELAXED);
        self.resized.store(false, RELAXED);
        self.slots.store(0, RELAXED);
        self.free_head.store(0, RELAXED);
        self.carved.store(0, RELAXED);
        self.allocated.store(0, RELAXED);
        self.requested.store(0, RELAXED);
        self.align.store(0, RELAXED);
        self.set_sample(None);
    }

    /// Forget this record's page range so that stale page map entries still
    /// pointing at it never match a real span.
    pub(crate) fn retire(&self) {
        self.first_page.store(0, RELAXED);
        self.pages.store(0, RELAXED);
        self.set_state(SpanState::Large);
        self.set_sample(None);
    }

    #[inline]
    pub(crate) fn first_page(&self) -> usize {
        self.first_page.load(RELAXED)
    }

    #[inline]
    pub(crate) fn last_page(&self) -> usize {
        self.end_page() - 1
    }

    /// The page just past the end of this span.
    #[inline]
    pub(crate) fn end_page(&self) -> usize {
        self.first_page() + self.pages()
    }

    #[inline]
    pub(crate) fn pages(&self) -> usize {
        self.pages.load(RELAXED)
    }

    #[inline]
    pub(crate) fn bytes(&self) -> usize {
        bytes_of(self.pages())
    }

    #[inline]
    pub(crate) fn start(&self) -> NonNull<u8> {
        let addr = page_addr(self.first_page());
        // Page zero is never mapped, so spans never start at null.
        NonNull::new(addr as *mut u8).unwrap_or(NonNull::dangling())
    }

    #[inline]
    pub(crate) fn contains_page(&self, page: usize) -> bool {
        page >= self.first_page() && page < self.end_page()
    }

    #[inline]
    pub(crate) fn state(&self) -> SpanState {
        SpanState::decode(self.state.load(atomic::Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        matches!(self.state(), SpanState::Free | SpanState::Returned)
    }

    #[inline]
    pub(crate) fn is_cold(&self) -> bool {
        self.cold.load(RELAXED)
    }

    /// Move the start of this span. Only valid while the span is in no tree.
    pub(crate) fn set_range(&self, first_page: usize, pages: usize) {
        debug_assert!(pages > 0);
        self.first_page.store(first_page, RELAXED);
        self.pages.store(pages, RELAXED);
    }

    pub(crate) fn set_state(&self, state: SpanState) {
        self.state.store(state.encode(), atomic::Ordering::Release);
    }

    /// Whether an object of this span was resized in place to a request of
    /// another class.
    #[inline]
    pub(crate) fn is_resized(&self) -> bool {
        self.resized.load(RELAXED)
    }

    pub(crate) fn mark_resized(&self) {
        self.resized.store(true, RELAXED);
    }

    // ---- Large and sampled spans ------------------------------------------

    /// Mark this span as a page-level allocation of `requested` bytes aligned
    /// to `align`, with `capacity` usable bytes.
    pub(crate) fn set_large(&self, requested: usize, align: usize, capacity: usize) {
        debug_assert!(requested <= capacity && capacity <= self.bytes());
        self.set_state(SpanState::Large);
        self.requested.store(requested, RELAXED);
        self.align.store(align, RELAXED);
        self.object_size.store(capacity, RELAXED);
    }

    /// The usable capacity of a large or sampled allocation.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.object_size.load(RELAXED)
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.object_size.store(capacity, RELAXED);
    }

    /// The requested size of a large or sampled allocation.
    #[inline]
    pub(crate) fn requested(&self) -> usize {
        self.requested.load(RELAXED)
    }

    /// The alignment a large or sampled allocation was requested with.
    #[inline]
    pub(crate) fn align(&self) -> usize {
        self.align.load(RELAXED)
    }

    /// Record a new request for a large or sampled allocation resized in
    /// place. The sample record, if any, is updated separately.
    pub(crate) fn set_request(&self, requested: usize, align: usize) {
        debug_assert!(requested <= self.capacity());
        self.requested.store(requested, RELAXED);
        self.align.store(align, RELAXED);
    }

    #[inline]
    pub(crate) fn is_sampled(&self) -> bool {
        self.sampled.load(RELAXED)
    }

    /// The sample record of a sampled allocation. Only its owner or the holder
    /// of the sampled set's lock may call this.
    #[inline]
    pub(crate) fn sample(&self) -> Option<AllocationRecord> {
        self.sample.get()
    }

    pub(crate) fn set_sample(&self, record: Option<AllocationRecord>) {
        self.sampled.store(record.is_some(), RELAXED);
        self.sample.set(record);
    }

    // ---- Small spans -------------------------------------------------------

    /// Dedicate this span to objects of `class`.
    pub(crate) fn init_small(&self, class: SizeClass) {
        let capacity = class.objects_per_span();
        debug_assert!(capacity > 0 && capacity <= u32::MAX as usize);
        self.object_size.store(class.size(), RELAXED);
        self.resized.store(false, RELAXED);
        self.slots.store(capacity as u32, RELAXED);
        self.free_head.store(0, RELAXED);
        self.carved.store(0, RELAXED);
        self.allocated.store(0, RELAXED);
        self.set_state(SpanState::Small(class));
    }

    /// Objects currently handed out from this span.
    #[inline]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(RELAXED) as usize
    }

    /// Objects still available in this span.
    #[inline]
    pub(crate) fn available(&self) -> usize {
        (self.slots.load(RELAXED) - self.allocated.load(RELAXED)) as usize
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.allocated.load(RELAXED) == self.slots.load(RELAXED)
    }

    #[inline]
    fn slot_ptr(&self, slot: u32) -> *mut u8 {
        let offset = slot as usize * self.object_size.load(RELAXED);
        self.start().as_ptr().wrapping_add(offset)
    }

    /// Whether `ptr` is the start of one of this small span's slots.
    pub(crate) fn is_slot_start(&self, ptr: NonNull<u8>) -> bool {
        let size = self.object_size.load(RELAXED);
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.start().as_ptr() as usize);
        size != 0
            && offset < self.bytes()
            && offset % size == 0
            && offset / size < self.slots.load(RELAXED) as usize
    }

    /// Take one free object out of a small span.
    ///
    /// Previously freed slots are reused before untouched slots are carved.
    pub(crate) fn pop_object(&self) -> Option<NonNull<u8>> {
        let head = self.free_head.load(RELAXED);
        let carved = self.carved.load(RELAXED);
        let slot = if head != 0 {
            let slot = head - 1;
            // Safety: free slots hold the index link written by `push_object`.
            let next = unsafe { ptr::read_unaligned(self.slot_ptr(slot).cast::<u32>()) };
            self.free_head.store(next, RELAXED);
            slot
        } else if carved < self.slots.load(RELAXED) {
            self.carved.store(carved + 1, RELAXED);
            carved
        } else {
            return None;
        };
        self.allocated.fetch_add(1, RELAXED);
        NonNull::new(self.slot_ptr(slot))
    }

    /// Return an object to this small span.
    ///
    /// ### Safety
    ///
    /// `ptr` must be a slot of this span that is currently handed out.
    pub(crate) unsafe fn push_object(&self, ptr: NonNull<u8>) {
        debug_assert!(self.is_slot_start(ptr));
        debug_assert!(self.allocated() > 0);
        let offset = ptr.as_ptr() as usize - self.start().as_ptr() as usize;
        let slot = (offset / self.object_size.load(RELAXED)) as u32;
        ptr::write_unaligned(ptr.as_ptr().cast::<u32>(), self.free_head.load(RELAXED));
        self.free_head.store(slot + 1, RELAXED);
        self.allocated.fetch_sub(1, RELAXED);
    }
}

/// Free sets and per-class non-empty sets, ordered by start page.
pub(crate) struct ByAddress;
pub(crate) type SpanSet = SplayTree<'static, ByAddress>;

impl<'a> TreeOrd<'a, ByAddress> for Span<'a> {
    fn tree_cmp(&self, other: &'a Span<'a>) -> Ordering {
        self.first_page().cmp(&other.first_page())
    }
}

intrusive_splay_tree::impl_intrusive_node! {
    impl<'a> IntrusiveNode<'a> for ByAddress
    where
        type Elem = Span<'a>,
        node = node;
}

/// Free sets of long spans, ordered by length and then start page.
pub(crate) struct ByLength;
pub(crate) type LengthSet = SplayTree<'static, ByLength>;

impl<'a> TreeOrd<'a, ByLength> for Span<'a> {
    fn tree_cmp(&self, other: &'a Span<'a>) -> Ordering {
        self.pages()
            .cmp(&other.pages())
            .then_with(|| self.first_page().cmp(&other.first_page()))
    }
}

/// Search key matching any span whose length is in `min..=max`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FitRange {
    pub(crate) min: usize,
    pub(crate) max: usize,
}

impl<'a> TreeOrd<'a, ByLength> for FitRange {
    fn tree_cmp(&self, span: &'a Span<'a>) -> Ordering {
        let pages = span.pages();
        if pages < self.min {
            Ordering::Greater
        } else if pages > self.max {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

intrusive_splay_tree::impl_intrusive_node! {
    impl<'a> IntrusiveNode<'a> for ByLength
    where
        type Elem = Span<'a>,
        node = node;
}

/// Recycled records, ordered by the record's own address (their page ranges
/// are stale).
pub(crate) struct ByRecord;
pub(crate) type RecordSet = SplayTree<'static, ByRecord>;

impl<'a> TreeOrd<'a, ByRecord> for Span<'a> {
    fn tree_cmp(&self, other: &'a Span<'a>) -> Ordering {
        (self as *const Span<'a>).cmp(&(other as *const Span<'a>))
    }
}

intrusive_splay_tree::impl_intrusive_node! {
    impl<'a> IntrusiveNode<'a> for ByRecord
    where
        type Elem = Span<'a>,
        node = node;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pages::PAGE_SIZE, size_class::SizeClassTable};

    fn leak_span() -> &'static Span<'static> {
        Box::leak(Box::new(Span::new()))
    }

    #[test]
    fn carve_then_reuse_slots() {
        let class = SizeClassTable::get().classify(48, 1).unwrap();
        let mut memory = vec![0_u8; class.pages() * PAGE_SIZE * 2];
        let base = (memory.as_mut_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let span = leak_span();
        span.init(base / PAGE_SIZE, class.pages(), SpanState::Free, false);
        span.init_small(class);

        let capacity = class.objects_per_span();
        let objects: Vec<_> = (0..capacity).map(|_| span.pop_object().unwrap()).collect();
        assert!(span.is_full());
        assert!(span.pop_object().is_none());
        for (i, obj) in objects.iter().enumerate() {
            assert_eq!(obj.as_ptr() as usize, base + i * class.size());
            assert!(span.is_slot_start(*obj));
        }
        assert!(!span.is_slot_start(NonNull::new((base + 1) as *mut u8).unwrap()));

        unsafe {
            span.push_object(objects[3]);
            span.push_object(objects[7]);
        }
        assert_eq!(span.available(), 2);
        // Last in, first out.
        assert_eq!(span.pop_object(), Some(objects[7]));
        assert_eq!(span.pop_object(), Some(objects[3]));
        assert!(span.pop_object().is_none());
    }

    #[test]
    fn address_tree_finds_spans_by_start_page() {
        let mut set = SpanSet::new();
        let spans: Vec<_> = [(10, 2), (20, 5), (40, 1)]
            .into_iter()
            .map(|(first, pages)| {
                let span = leak_span();
                span.init(first, pages, SpanState::Free, false);
                set.insert(span);
                span
            })
            .collect();
        let found = set.find(spans[1]).unwrap();
        assert!(ptr::eq(found, spans[1]));
        assert!(set.remove(spans[0]).is_some_and(|s| ptr::eq(s, spans[0])));
        assert!(set.find(spans[0]).is_none());

        let mut order = vec![];
        while let Some(span) = set.pop_root() {
            order.push(span.first_page());
        }
        order.sort();
        assert_eq!(order, [20, 40]);
    }

    #[test]
    fn states_survive_the_atomic_encoding() {
        let span = leak_span();
        span.init(7, 1, SpanState::Returned, true);
        assert_eq!(span.state(), SpanState::Returned);
        assert!(span.is_free() && span.is_cold());
        for class in SizeClassTable::get().classes() {
            span.set_state(SpanState::Small(class));
            assert_eq!(span.state(), SpanState::Small(class));
        }
        span.set_state(SpanState::Large);
        assert!(!span.is_free());
    }

    #[test]
    fn length_tree_respects_fit_range() {
        let mut set = LengthSet::new();
        for (first, pages) in [(1000, 200), (2000, 300), (3000, 1000)] {
            let span = leak_span();
            span.init(first, pages, SpanState::Free, false);
            set.insert(span);
        }
        assert!(set.find(&FitRange { min: 201, max: 250 }).is_none());
        let span = set.remove(&FitRange { min: 250, max: 320 }).unwrap();
        assert_eq!(span.pages(), 300);
        let span = set
            .remove(&FitRange {
                min: 250,
                max: usize::MAX,
            })
            .unwrap();
        assert_eq!(span.pages(), 1000);
    }
}
