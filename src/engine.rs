//! The allocation engine.
//!
//! An [`Engine`] ties the layers together: requests are classified by the
//! size-class table, sampled requests take a dedicated span, pooled small
//! requests go through the caller's [`FastCache`] (if any) and the central
//! free lists, and everything else is served by the page heap directly.
//!
//! The engine does not know about threads. Callers pass in the fast cache of
//! their execution context, or `None` to go straight to the central lists; the
//! [`frontend`](crate::frontend) module keeps one cache per thread for the
//! process-wide engine.
//!
//! Lock order: a central list lock may be held while taking the page heap
//! lock, never the other way around. The sampled set's lock is a leaf.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{
    central_free_list::CentralFreeList,
    error::{fatal, UsageError},
    fast_cache::FastCache,
    frontend::{HotCold, SizedPtr},
    lock::Mutex,
    object_list::ObjectList,
    page_heap::{LargeLookup, PageHeap},
    pages::{bytes_of, page_of, pages_for, PAGE_SHIFT},
    params::Parameters,
    sampler::{AllocationRecord, Sampler},
    size_class::{SizeClass, DEFAULT_ALIGNMENT, MAX_ALIGNMENT, NUM_CLASSES, SIZE_CLASSES},
    span::{Span, SpanSet, SpanState},
    stats::Stats,
    AllocError,
};

/// Extra room reserved for records sampled while a profile is being taken.
const PROFILE_SLACK: usize = 16;

/// An allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    /// The number of bytes requested. Zero is allowed and still yields a
    /// unique pointer.
    pub size: usize,
    /// The required alignment: a power of two no larger than
    /// [`MAX_ALIGNMENT`].
    pub align: usize,
    /// Where the allocation should be placed.
    pub hot_cold: HotCold,
}

impl Request {
    /// A request for `size` bytes aligned to `align`, with the default
    /// placement hint.
    pub const fn new(size: usize, align: usize) -> Self {
        Request {
            size,
            align,
            hot_cold: HotCold::DEFAULT,
        }
    }

    /// The same request with a different placement hint.
    pub const fn with_hot_cold(self, hot_cold: HotCold) -> Self {
        Request { hot_cold, ..self }
    }

    fn is_valid(&self) -> bool {
        self.align.is_power_of_two()
            && self.align <= MAX_ALIGNMENT
            && self.size <= isize::MAX as usize - (self.align - 1)
    }
}

/// What the caller of a free remembers about the allocation.
///
/// A supplied size must lie between the requested size and the usable
/// capacity of the allocation, and a supplied alignment must be the one the
/// allocation was made with. A size without an alignment stands for an
/// allocation made with at most [`DEFAULT_ALIGNMENT`]. Anything else is a
/// fatal usage error.
///
/// Pooled small objects do not remember their requested size, so for them a
/// size is accepted when a request of that size would have been placed in the
/// object's size class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FreeHint {
    /// The size the allocation was requested (or last resized) with.
    pub size: Option<usize>,
    /// The alignment the allocation was requested with.
    pub align: Option<usize>,
}

impl FreeHint {
    /// No hint.
    pub const NONE: FreeHint = FreeHint {
        size: None,
        align: None,
    };

    /// A size hint for an allocation made with at most the default
    /// alignment.
    pub const fn sized(size: usize) -> Self {
        FreeHint {
            size: Some(size),
            align: None,
        }
    }

    /// An alignment hint, optionally with a size hint.
    pub const fn aligned(size: Option<usize>, align: usize) -> Self {
        FreeHint {
            size,
            align: Some(align),
        }
    }
}

struct SampledSet {
    spans: SpanSet,
    objects: usize,
    bytes: usize,
}

// Safety: the sampled spans are only touched under the set's lock, or by the
// single owner of the allocation.
unsafe impl Send for SampledSet {}

/// An allocator instance: one page heap, its central free lists, and the
/// bookkeeping of sampled allocations.
///
/// The process-wide instance behind the [`frontend`](crate::frontend) entry
/// points is an `Engine` in a `static`; further engines may be created for
/// isolated heaps. Memory of an engine is never unmapped, so engines are meant
/// to live for the rest of the process.
pub struct Engine {
    heap: PageHeap,
    central: [CentralFreeList; NUM_CLASSES],
    cold_central: [CentralFreeList; NUM_CLASSES],
    sampled: Mutex<SampledSet>,
    /// Sampler for calls made without a fast cache.
    sampler: Mutex<Sampler>,
    params: Parameters,
    /// Bytes held by fast caches, as last published by each cache.
    cached_bytes: AtomicUsize,
    /// Bytes allocated over the engine's lifetime, merged from samplers.
    allocated_bytes: AtomicU64,
    /// Bytes released beyond what earlier [`Engine::release`] calls asked for.
    release_credit: AtomicUsize,
    next_context: AtomicU64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create a new engine. No memory is mapped until the first allocation.
    pub const fn new() -> Self {
        Engine {
            heap: PageHeap::new(),
            central: [const { CentralFreeList::new() }; NUM_CLASSES],
            cold_central: [const { CentralFreeList::new() }; NUM_CLASSES],
            sampled: Mutex::new(SampledSet {
                spans: SpanSet::new(),
                objects: 0,
                bytes: 0,
            }),
            sampler: Mutex::new(Sampler::new(0x2545_F491_4F6C_DD1D)),
            params: Parameters::new(),
            cached_bytes: AtomicUsize::new(0),
            allocated_bytes: AtomicU64::new(0),
            release_credit: AtomicUsize::new(0),
            next_context: AtomicU64::new(1),
        }
    }

    /// This engine's tunable parameters.
    #[inline]
    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Allocate memory for `request`.
    ///
    /// Returns the address and the usable capacity, which is at least
    /// `request.size` and always what [`Engine::allocated_size`] reports for
    /// the address. Fails for invalid alignments, sizes beyond `isize::MAX`
    /// and when the heap cannot grow.
    pub fn allocate(
        &self,
        mut cache: Option<&mut FastCache>,
        request: Request,
    ) -> Result<SizedPtr, AllocError> {
        let Request {
            size,
            align,
            hot_cold,
        } = request;
        if !request.is_valid() {
            event!(Warn, "rejecting allocation of {size} bytes aligned to {align}");
            return Err(AllocError);
        }

        let rate = self.params.sampling_rate().bytes();
        let weight = match cache.as_deref_mut() {
            Some(cache) => cache.sample(self, size, rate),
            None => self.sample_uncached(size, rate),
        };

        let result = if let Some(weight) = weight {
            let context = cache.as_deref().map_or(0, FastCache::context);
            self.allocate_sampled(request, weight, context)
        } else {
            match SIZE_CLASSES.classify(size, align) {
                Some(class) => {
                    let ptr = match cache {
                        Some(cache) if !hot_cold.is_cold() => cache.allocate(self, class),
                        _ => self.allocate_uncached(class, hot_cold.is_cold()),
                    };
                    ptr.map(|ptr| SizedPtr {
                        ptr,
                        size: class.size(),
                    })
                }
                None => self.allocate_large(size, align, hot_cold.is_cold()),
            }
        };

        if result.is_err() {
            event!(Warn, "out of memory allocating {size} bytes aligned to {align}");
        }
        result
    }

    /// Free an allocation of this engine.
    ///
    /// Invalid frees (a hint inconsistent with the allocation, a pointer this
    /// engine never handed out, a page-level allocation freed twice) terminate
    /// the process.
    ///
    /// ### Safety
    ///
    /// `ptr` must not be used after this call. If `cache` is given it must not
    /// have been used with another engine.
    pub unsafe fn deallocate(&self, cache: Option<&mut FastCache>, ptr: NonNull<u8>, hint: FreeHint) {
        let addr = ptr.as_ptr() as usize;
        if let Some(tag) = self.heap.map().class_tag(page_of(addr)) {
            let class = tag.class();
            let Some(span) = self.small_span(ptr, class) else {
                fatal(UsageError::ForeignPointer { ptr: addr });
            };
            if let Err(err) = check_small(ptr, class, span.is_resized(), hint) {
                fatal(err);
            }
            match cache {
                Some(cache) if !tag.is_cold() => cache.deallocate(self, class, ptr),
                _ => self.deallocate_uncached(class, tag.is_cold(), ptr),
            }
            return;
        }

        match self.heap.lookup_large(ptr) {
            LargeLookup::Live(span) => {
                if let Err(err) = check_large(span, ptr, hint) {
                    fatal(err);
                }
                self.deallocate_large(span);
            }
            LargeLookup::Freed => fatal(UsageError::DoubleFree { ptr: addr }),
            LargeLookup::Unknown => fatal(UsageError::ForeignPointer { ptr: addr }),
        }
    }

    /// Resize an allocation.
    ///
    /// The allocation is resized in place, keeping its address and contents,
    /// whenever its capacity already holds `new.size` bytes at `new.align`.
    /// Page-level allocations shrunk to half their pages or less give the tail
    /// pages back to the heap. Otherwise a new allocation is made, the first
    /// `min(old size, new.size)` bytes are copied, and the old allocation is
    /// freed. On failure the old allocation is left untouched.
    ///
    /// `old` is validated like the hint of [`Engine::deallocate`]; its size,
    /// if given, bounds the bytes copied.
    ///
    /// ### Safety
    ///
    /// As for [`Engine::deallocate`]. On success the old pointer must no
    /// longer be used unless it is the returned one.
    pub unsafe fn reallocate(
        &self,
        mut cache: Option<&mut FastCache>,
        ptr: NonNull<u8>,
        old: FreeHint,
        new: Request,
    ) -> Result<SizedPtr, AllocError> {
        if !new.is_valid() {
            return Err(AllocError);
        }
        let addr = ptr.as_ptr() as usize;
        let aligned = addr % new.align == 0;

        let capacity = if let Some(tag) = self.heap.map().class_tag(page_of(addr)) {
            let class = tag.class();
            let Some(span) = self.small_span(ptr, class) else {
                fatal(UsageError::ForeignPointer { ptr: addr });
            };
            if let Err(err) = check_small(ptr, class, span.is_resized(), old) {
                fatal(err);
            }
            let capacity = class.size();
            if new.size <= capacity && aligned {
                if !maps_to(class, new.size, Some(new.align)) {
                    span.mark_resized();
                }
                return Ok(SizedPtr {
                    ptr,
                    size: capacity,
                });
            }
            capacity
        } else {
            match self.heap.lookup_large(ptr) {
                LargeLookup::Live(span) => {
                    if let Err(err) = check_large(span, ptr, old) {
                        fatal(err);
                    }
                    if new.size <= span.capacity() && aligned {
                        return Ok(self.resize_large_in_place(span, new));
                    }
                    span.capacity()
                }
                LargeLookup::Freed => fatal(UsageError::DoubleFree { ptr: addr }),
                LargeLookup::Unknown => fatal(UsageError::ForeignPointer { ptr: addr }),
            }
        };

        let moved = self.allocate(cache.as_deref_mut(), new)?;
        let copy = old.size.unwrap_or(capacity).min(new.size);
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.ptr.as_ptr(), copy);
        self.deallocate(cache, ptr, old);
        Ok(moved)
    }

    /// The usable capacity of the allocation at `ptr`, or `None` if `ptr` is
    /// not an allocation of this engine.
    pub fn allocated_size(&self, ptr: *const u8) -> Option<usize> {
        let ptr = NonNull::new(ptr.cast_mut())?;
        if let Some(tag) = self.heap.map().class_tag(page_of(ptr.as_ptr() as usize)) {
            let class = tag.class();
            return self.small_span(ptr, class).map(|_| class.size());
        }
        match self.heap.lookup_large(ptr) {
            LargeLookup::Live(span) => Some(span.capacity()),
            LargeLookup::Freed | LargeLookup::Unknown => None,
        }
    }

    /// The capacity an allocation of `size` bytes aligned to `align` would
    /// get, or `None` if such a request would fail.
    pub fn good_size(&self, size: usize, align: usize) -> Option<usize> {
        if !Request::new(size, align).is_valid() {
            return None;
        }
        match SIZE_CLASSES.classify(size, align) {
            Some(class) => Some(class.size()),
            None => pages_for(size.max(1)).map(bytes_of),
        }
    }

    /// Whether the allocation at `ptr` was placed in the cold partition.
    pub fn is_cold(&self, ptr: *const u8) -> bool {
        let Some(ptr) = NonNull::new(ptr.cast_mut()) else {
            return false;
        };
        if let Some(tag) = self.heap.map().class_tag(page_of(ptr.as_ptr() as usize)) {
            return tag.is_cold();
        }
        matches!(self.heap.lookup_large(ptr), LargeLookup::Live(span) if span.is_cold())
    }

    /// Whether the allocation at `ptr` was sampled.
    pub fn is_sampled(&self, ptr: *const u8) -> bool {
        NonNull::new(ptr.cast_mut()).is_some_and(|ptr| {
            matches!(
                self.heap.lookup_large(ptr),
                LargeLookup::Live(span) if span.is_sampled()
            )
        })
    }

    /// Release whole free spans to the OS until at least `bytes` bytes (at
    /// least one page) have been released or no releasable span is left.
    /// Returns the number of bytes released.
    ///
    /// Whole spans often release more than was asked for. The excess is
    /// credited to later calls, which release only what the credit does not
    /// already cover.
    pub fn release(&self, bytes: usize) -> usize {
        let bytes = bytes.max(1);
        let credit = self
            .release_credit
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |credit| {
                Some(credit.saturating_sub(bytes))
            })
            .unwrap_or_else(|credit| credit);
        if credit >= bytes {
            event!(Debug, "release of {bytes} bytes covered by earlier releases");
            return 0;
        }
        let owed = bytes - credit;
        let released = self.release_pages(owed, false);
        if released > owed {
            self.release_credit
                .fetch_add(released - owed, Ordering::Relaxed);
        }
        released
    }

    /// Like [`Engine::release`], but only releases cold-partition spans.
    pub fn release_cold(&self, bytes: usize) -> usize {
        self.release_pages(bytes, true)
    }

    fn release_pages(&self, bytes: usize, cold_only: bool) -> usize {
        let pages = pages_for(bytes).unwrap_or(usize::MAX >> PAGE_SHIFT).max(1);
        let released = bytes_of(self.heap.release(pages, cold_only));
        event!(
            Debug,
            "released {released} bytes to the OS ({bytes} bytes requested{})",
            if cold_only { ", cold only" } else { "" }
        );
        released
    }

    /// A snapshot of this engine's accounting.
    pub fn stats(&self) -> Stats {
        let heap = self.heap.stats();
        let central_cache_free_bytes = SIZE_CLASSES
            .classes()
            .map(|class| {
                let hot = self.central[class.index()].stats().free_objects;
                let cold = self.cold_central[class.index()].stats().free_objects;
                (hot + cold) * class.size()
            })
            .sum();
        let (sampled_objects, sampled_bytes) = {
            let sampled = self.sampled.lock();
            (sampled.objects, sampled.bytes)
        };
        Stats {
            system_bytes: heap.system_bytes,
            pageheap_free_bytes: heap.free_bytes,
            pageheap_unmapped_bytes: heap.unmapped_bytes,
            pageheap_cold_free_bytes: heap.cold_free_bytes,
            pageheap_cold_unmapped_bytes: heap.cold_unmapped_bytes,
            central_cache_free_bytes,
            fast_cache_free_bytes: self.cached_bytes.load(Ordering::Relaxed),
            metadata_bytes: heap.metadata_bytes,
            os_bytes_allocated: self.heap.system().bytes_mapped(),
            spans: heap.spans,
            sampled_objects,
            sampled_bytes,
            total_allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
        }
    }

    /// The value of the numeric property `key`, or `None` if there is no such
    /// property. See [`Stats`] for the property names.
    pub fn numeric_property(&self, key: &str) -> Option<usize> {
        self.stats().property(&self.params, key)
    }

    /// A human-readable report of this engine's accounting.
    pub fn stats_report(&self) -> String {
        self.stats().to_string()
    }

    /// The records of the sampled allocations that are currently live.
    ///
    /// The sum of their weights estimates the live heap size.
    pub fn profile(&self) -> Vec<AllocationRecord> {
        // Reserve space before taking the lock: the reservation may itself
        // allocate from this engine.
        let expected = self.sampled.lock().objects;
        let mut records = Vec::with_capacity(expected + PROFILE_SLACK);

        let mut sampled = self.sampled.lock();
        let mut visited = SpanSet::new();
        while let Some(span) = sampled.spans.pop_root() {
            if records.len() < records.capacity() {
                records.extend(span.sample());
            }
            visited.insert(span);
        }
        sampled.spans = visited;
        drop(sampled);
        records
    }

    // ---- Crate-internal plumbing for fast caches ----------------------------

    pub(crate) fn next_context(&self) -> u64 {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_allocated(&self, bytes: usize) {
        self.allocated_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Replace a cache's previously published byte count with `now`. Returns
    /// the total over all caches.
    pub(crate) fn publish_cached(&self, before: usize, now: usize) -> usize {
        if now >= before {
            let delta = now - before;
            self.cached_bytes.fetch_add(delta, Ordering::Relaxed) + delta
        } else {
            let delta = before - now;
            self.cached_bytes
                .fetch_sub(delta, Ordering::Relaxed)
                .saturating_sub(delta)
        }
    }

    /// Take up to `n` hot objects of `class` from its central list.
    pub(crate) fn remove_batch(&self, class: SizeClass, n: usize) -> ObjectList {
        let objects = self.central[class.index()].remove_range(
            &self.heap,
            class,
            false,
            n,
            self.params.memory_limit(),
        );
        self.heap.log_growth();
        objects
    }

    /// Give hot objects of `class` back to its central list.
    ///
    /// ### Safety
    ///
    /// The objects must be free hot objects of `class` from this engine.
    pub(crate) unsafe fn insert_batch(&self, class: SizeClass, objects: ObjectList) {
        if !objects.is_empty() {
            self.central[class.index()].insert_range(&self.heap, objects);
        }
    }

    #[cfg(test)]
    pub(crate) fn heap(&self) -> &PageHeap {
        &self.heap
    }

    /// The span of the pooled object at `ptr`, if `ptr` is the start of an
    /// object slot of a `class` span.
    fn small_span(&self, ptr: NonNull<u8>, class: SizeClass) -> Option<&'static Span<'static>> {
        let span = self.heap.lookup(ptr)?;
        (span.state() == SpanState::Small(class) && span.is_slot_start(ptr)).then_some(span)
    }

    // ---- Slow paths ---------------------------------------------------------

    fn sample_uncached(&self, size: usize, rate: usize) -> Option<usize> {
        self.add_allocated(size.max(1));
        match rate {
            0 => None,
            1 => Some(size.max(1)),
            _ => {
                let mut sampler = self.sampler.lock();
                let weight = sampler.sample(size, rate);
                sampler.take_unmerged();
                weight
            }
        }
    }

    fn central_list(&self, class: SizeClass, cold: bool) -> &CentralFreeList {
        if cold {
            &self.cold_central[class.index()]
        } else {
            &self.central[class.index()]
        }
    }

    fn allocate_uncached(&self, class: SizeClass, cold: bool) -> Result<NonNull<u8>, AllocError> {
        let mut objects = self.central_list(class, cold).remove_range(
            &self.heap,
            class,
            cold,
            1,
            self.params.memory_limit(),
        );
        self.heap.log_growth();
        objects.pop().ok_or(AllocError)
    }

    unsafe fn deallocate_uncached(&self, class: SizeClass, cold: bool, ptr: NonNull<u8>) {
        let mut objects = ObjectList::new();
        objects.push(ptr);
        self.central_list(class, cold)
            .insert_range(&self.heap, objects);
    }

    /// Get a span of at least `bytes` bytes aligned to `align`, in the
    /// `Large` state.
    fn allocate_span(
        &self,
        bytes: usize,
        align: usize,
        cold: bool,
    ) -> Result<&'static Span<'static>, AllocError> {
        let pages = pages_for(bytes.max(1)).ok_or(AllocError)?;
        let align_pages = (align >> PAGE_SHIFT).max(1);
        let span = self
            .heap
            .allocate_large(pages, align_pages, cold, self.params.memory_limit());
        self.heap.log_growth();
        span.ok_or(AllocError)
    }

    fn allocate_large(&self, size: usize, align: usize, cold: bool) -> Result<SizedPtr, AllocError> {
        let span = self.allocate_span(size, align, cold)?;
        span.set_large(size, align, span.bytes());
        event!(
            Trace,
            "page-level allocation of {size} bytes at {:p} ({} pages)",
            span.start(),
            span.pages()
        );
        Ok(SizedPtr {
            ptr: span.start(),
            size: span.capacity(),
        })
    }

    /// Sampled allocations get a span of their own so that their record can
    /// hang off it. Their capacity is what the same unsampled request would
    /// get, so sampling is invisible to capacity queries.
    fn allocate_sampled(&self, request: Request, weight: usize, context: u64) -> Result<SizedPtr, AllocError> {
        let Request {
            size,
            align,
            hot_cold,
        } = request;
        let capacity = match SIZE_CLASSES.classify(size, align) {
            Some(class) => class.size(),
            None => pages_for(size.max(1)).map(bytes_of).ok_or(AllocError)?,
        };
        let span = self.allocate_span(capacity, align, hot_cold.is_cold())?;
        span.set_large(size, align, capacity);
        span.set_sample(Some(AllocationRecord {
            requested_size: size,
            allocated_size: capacity,
            align,
            hot_cold,
            context,
            weight,
        }));

        let mut sampled = self.sampled.lock();
        sampled.spans.insert(span);
        sampled.objects += 1;
        sampled.bytes += capacity;
        drop(sampled);

        Ok(SizedPtr {
            ptr: span.start(),
            size: capacity,
        })
    }

    unsafe fn deallocate_large(&self, span: &'static Span<'static>) {
        if span.is_sampled() {
            let mut sampled = self.sampled.lock();
            let removed = sampled.spans.remove(span);
            debug_assert!(removed.is_some_and(|s| ptr::eq(s, span)));
            sampled.objects -= 1;
            sampled.bytes -= span.capacity();
        }
        self.heap.deallocate(span);
    }

    fn resize_large_in_place(&self, span: &'static Span<'static>, new: Request) -> SizedPtr {
        if span.is_sampled() {
            let _sampled = self.sampled.lock();
            span.set_request(new.size, new.align);
            if let Some(mut record) = span.sample() {
                record.requested_size = new.size;
                record.align = new.align;
                span.set_sample(Some(record));
            }
        } else {
            let pages = pages_for(new.size.max(1)).unwrap_or(usize::MAX);
            let shrunk = pages.saturating_mul(2) <= span.pages() && self.heap.shrink(span, pages);
            if shrunk {
                span.set_capacity(span.bytes());
            }
            span.set_request(new.size, new.align);
            if shrunk {
                event!(Trace, "shrunk page-level allocation at {:p} to {pages} pages", span.start());
            }
        }
        SizedPtr {
            ptr: span.start(),
            size: span.capacity(),
        }
    }
}

/// Whether a request of `size` bytes aligned to `align` would be placed in
/// `class`. Without an alignment, any alignment up to the default is assumed.
fn maps_to(class: SizeClass, size: usize, align: Option<usize>) -> bool {
    match align {
        Some(align) => SIZE_CLASSES.classify(size, align) == Some(class),
        None => [1, DEFAULT_ALIGNMENT]
            .into_iter()
            .any(|align| SIZE_CLASSES.classify(size, align) == Some(class)),
    }
}

/// The smallest size hint that [`maps_to`] `class`.
fn smallest_hint(class: SizeClass, align: Option<usize>) -> usize {
    let (mut lo, mut hi) = (0, class.size());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if maps_to(class, mid, align) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Validate a free hint for a pooled object of `class`.
///
/// A hint size must map to `class` at the hinted alignment. Once an object of
/// the span was resized in place to a request of another class (`resized`),
/// the size is only bounded by the capacity.
fn check_small(ptr: NonNull<u8>, class: SizeClass, resized: bool, hint: FreeHint) -> Result<(), UsageError> {
    let addr = ptr.as_ptr() as usize;
    if let Some(align) = hint.align {
        let consistent = align.is_power_of_two()
            && addr % align == 0
            && (resized || SIZE_CLASSES.classify(class.size(), align) == Some(class));
        if !consistent {
            return Err(UsageError::AlignmentMismatch { ptr: addr, align });
        }
    }
    if let Some(size) = hint.size {
        let fits = if resized {
            size <= class.size()
        } else {
            maps_to(class, size, hint.align)
        };
        if !fits {
            return Err(UsageError::SizeOutOfRange {
                ptr: addr,
                size,
                min: if resized { 0 } else { smallest_hint(class, hint.align) },
                max: class.size(),
            });
        }
    }
    Ok(())
}

/// Validate a free hint for a page-level or sampled allocation, which record
/// their request.
///
/// A request that maps to a size class (a sampled small allocation, or a
/// page-level one shrunk in place) is judged like a pooled object of that
/// class. Any other alignment hint must be the recorded alignment.
fn check_large(span: &Span<'_>, ptr: NonNull<u8>, hint: FreeHint) -> Result<(), UsageError> {
    let addr = ptr.as_ptr() as usize;
    let requested = span.requested();
    if let Some(size) = hint.size {
        if size < requested || size > span.capacity() {
            return Err(UsageError::SizeOutOfRange {
                ptr: addr,
                size,
                min: requested,
                max: span.capacity(),
            });
        }
    }
    let align = match hint {
        FreeHint { align: Some(align), .. } => align,
        FreeHint { size: Some(_), .. } => DEFAULT_ALIGNMENT,
        FreeHint { .. } => return Ok(()),
    };
    let consistent = align.is_power_of_two()
        && addr % align == 0
        && match SIZE_CLASSES.classify(requested, span.align()) {
            Some(class) => maps_to(class, requested, hint.align),
            None => hint.align.is_none() || align == span.align(),
        };
    if !consistent {
        return Err(UsageError::AlignmentMismatch { ptr: addr, align });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pages::PAGE_SIZE, sampler::SamplingRate, size_class::MAX_SMALL_SIZE};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn engine() -> &'static Engine {
        let _ = env_logger::try_init();
        let engine: &'static Engine = Box::leak(Box::new(Engine::new()));
        engine.parameters().set_sampling_rate(SamplingRate::NEVER);
        engine
    }

    #[test]
    fn capacity_matches_good_size() {
        let engine = engine();
        let mut cache = FastCache::new();
        let mut rng = StdRng::seed_from_u64(0xdead_beef);
        let mut live = vec![];
        for _ in 0..1000 {
            let size = match rng.gen_range(0..4) {
                0 => rng.gen_range(0..64),
                1 => rng.gen_range(0..4096),
                2 => rng.gen_range(0..MAX_SMALL_SIZE),
                _ => rng.gen_range(0..4 * MAX_SMALL_SIZE),
            };
            let align = 1 << rng.gen_range(0..16);
            let got = engine
                .allocate(Some(&mut cache), Request::new(size, align))
                .unwrap();
            assert!(got.size >= size);
            assert_eq!(got.ptr.as_ptr() as usize % align, 0);
            assert_eq!(engine.good_size(size, align), Some(got.size));
            assert_eq!(engine.allocated_size(got.ptr.as_ptr()), Some(got.size));
            live.push((got, size, align));
        }
        for (got, size, align) in live {
            unsafe {
                engine.deallocate(
                    Some(&mut cache),
                    got.ptr,
                    FreeHint::aligned(Some(size), align),
                )
            };
        }
        cache.flush(engine);
        assert_eq!(engine.stats().current_allocated_bytes(), 0);
    }

    #[test]
    fn invalid_requests_fail() {
        let engine = engine();
        for request in [
            Request::new(8, 3),
            Request::new(8, MAX_ALIGNMENT * 2),
            Request::new(usize::MAX, 1),
            Request::new(isize::MAX as usize, 16),
        ] {
            assert!(engine.allocate(None, request).is_err(), "{request:?}");
            assert_eq!(engine.good_size(request.size, request.align), None);
        }
    }

    #[test]
    fn zero_sized_allocations_are_distinct() {
        let engine = engine();
        let a = engine.allocate(None, Request::new(0, 1)).unwrap();
        let b = engine.allocate(None, Request::new(0, 1)).unwrap();
        assert_ne!(a.ptr, b.ptr);
        unsafe {
            engine.deallocate(None, a.ptr, FreeHint::sized(0));
            engine.deallocate(None, b.ptr, FreeHint::NONE);
        }
    }

    #[test]
    fn foreign_pointers_have_no_size() {
        let engine = engine();
        let local = 0_u64;
        assert_eq!(engine.allocated_size(&local as *const u64 as *const u8), None);
        assert_eq!(engine.allocated_size(ptr::null()), None);

        let big = engine.allocate(None, Request::new(3 * PAGE_SIZE, 1)).unwrap();
        let interior = big.ptr.as_ptr().wrapping_add(PAGE_SIZE);
        assert_eq!(engine.allocated_size(interior), None);
        unsafe { engine.deallocate(None, big.ptr, FreeHint::NONE) };
        assert_eq!(engine.allocated_size(big.ptr.as_ptr()), None);
    }

    #[test]
    fn reallocate_in_place_and_moving() {
        let engine = engine();
        let mut cache = FastCache::new();
        let a = engine.allocate(Some(&mut cache), Request::new(10, 16)).unwrap();
        unsafe { a.ptr.as_ptr().write_bytes(0xa5, 10) };

        // Growing within the class keeps the address.
        let b = unsafe {
            engine.reallocate(Some(&mut cache), a.ptr, FreeHint::NONE, Request::new(a.size, 16))
        }
        .unwrap();
        assert_eq!(a.ptr, b.ptr);

        // Growing beyond it moves and copies.
        let c = unsafe {
            engine.reallocate(Some(&mut cache), b.ptr, FreeHint::sized(10), Request::new(1000, 16))
        }
        .unwrap();
        assert_ne!(c.ptr, b.ptr);
        let bytes = unsafe { core::slice::from_raw_parts(c.ptr.as_ptr(), 10) };
        assert!(bytes.iter().all(|b| *b == 0xa5));

        unsafe { engine.deallocate(Some(&mut cache), c.ptr, FreeHint::sized(1000)) };
        cache.flush(engine);
    }

    #[test]
    fn large_shrink_gives_pages_back() {
        let engine = engine();
        let a = engine.allocate(None, Request::new(64 * PAGE_SIZE, 1)).unwrap();
        assert_eq!(a.size, 64 * PAGE_SIZE);
        let free_before = engine.stats().pageheap_free_bytes;

        // Shrinking by less than half keeps every page.
        let b = unsafe {
            engine.reallocate(None, a.ptr, FreeHint::NONE, Request::new(40 * PAGE_SIZE, 1))
        }
        .unwrap();
        assert_eq!((b.ptr, b.size), (a.ptr, 64 * PAGE_SIZE));

        let c = unsafe {
            engine.reallocate(None, b.ptr, FreeHint::sized(40 * PAGE_SIZE), Request::new(PAGE_SIZE, 1))
        }
        .unwrap();
        assert_eq!((c.ptr, c.size), (a.ptr, PAGE_SIZE));
        assert_eq!(engine.allocated_size(c.ptr.as_ptr()), Some(PAGE_SIZE));
        assert_eq!(
            engine.stats().pageheap_free_bytes,
            free_before + 63 * PAGE_SIZE
        );
        unsafe { engine.deallocate(None, c.ptr, FreeHint::sized(PAGE_SIZE)) };
    }

    #[test]
    fn always_sampled_allocations() {
        let engine = engine();
        engine.parameters().set_sampling_rate(SamplingRate::ALWAYS);
        let mut cache = FastCache::new();
        let mut live = vec![];
        for (size, align) in [(0, 1), (10, 16), (1000, 64), (MAX_SMALL_SIZE + 1, 8), (100, 4096)] {
            let got = engine
                .allocate(Some(&mut cache), Request::new(size, align))
                .unwrap();
            assert!(engine.is_sampled(got.ptr.as_ptr()));
            assert_eq!(engine.good_size(size, align), Some(got.size));
            assert_eq!(engine.allocated_size(got.ptr.as_ptr()), Some(got.size));
            assert_eq!(got.ptr.as_ptr() as usize % align, 0);
            live.push((got, size, align));
        }

        let profile = engine.profile();
        assert_eq!(profile.len(), live.len());
        assert!(profile.iter().all(|r| r.context == cache.context()));
        let stats = engine.stats();
        assert_eq!(stats.sampled_objects, live.len());
        assert_eq!(
            stats.sampled_bytes,
            live.iter().map(|(got, ..)| got.size).sum::<usize>()
        );

        for (got, size, align) in live {
            unsafe {
                engine.deallocate(Some(&mut cache), got.ptr, FreeHint::aligned(Some(size), align))
            };
        }
        assert!(engine.profile().is_empty());
        assert_eq!(engine.stats().sampled_objects, 0);
    }

    #[test]
    fn sized_frees_accept_the_whole_range() {
        let engine = engine();
        for rate in [SamplingRate::NEVER, SamplingRate::ALWAYS] {
            engine.parameters().set_sampling_rate(rate);
            for (size, align) in [(1, 1), (100, 8), (5000, 256), (MAX_SMALL_SIZE + 1, 16)] {
                let capacity = engine.good_size(size, align).unwrap();
                for k in [size, (size + capacity) / 2, capacity] {
                    let got = engine.allocate(None, Request::new(size, align)).unwrap();
                    assert_eq!(got.size, capacity);
                    unsafe { engine.deallocate(None, got.ptr, FreeHint::aligned(Some(k), align)) };
                    if align <= DEFAULT_ALIGNMENT {
                        let got = engine.allocate(None, Request::new(size, align)).unwrap();
                        unsafe { engine.deallocate(None, got.ptr, FreeHint::sized(k)) };
                    }
                }
            }
        }
        engine.parameters().set_sampling_rate(SamplingRate::NEVER);
    }

    #[test]
    fn small_hints_must_map_to_the_class() {
        let ptr = NonNull::new(0x10_0000 as *mut u8).unwrap();
        let class = SIZE_CLASSES.classify(1000, 16).unwrap();
        let check = |resized, hint| check_small(ptr, class, resized, hint);

        assert_eq!(check(false, FreeHint::sized(1000)), Ok(()));
        assert_eq!(check(false, FreeHint::sized(class.size())), Ok(()));
        assert_eq!(check(false, FreeHint::aligned(Some(1000), 16)), Ok(()));
        assert_eq!(check(false, FreeHint::aligned(None, 8)), Ok(()));
        assert!(matches!(
            check(false, FreeHint::sized(class.size() + 1)),
            Err(UsageError::SizeOutOfRange { max, .. }) if max == class.size()
        ));
        match check(false, FreeHint::sized(1)) {
            Err(UsageError::SizeOutOfRange { min, max, .. }) => {
                assert!(min > 1 && min <= 1000);
                assert_eq!(check(false, FreeHint::sized(min)), Ok(()));
                assert!(check(false, FreeHint::sized(min - 1)).is_err());
                assert_eq!(max, class.size());
            }
            other => panic!("{other:?}"),
        }
        assert!(matches!(
            check(false, FreeHint::aligned(Some(1000), 4096)),
            Err(UsageError::AlignmentMismatch { align: 4096, .. })
        ));
        assert!(matches!(
            check(false, FreeHint::aligned(None, 3)),
            Err(UsageError::AlignmentMismatch { align: 3, .. })
        ));

        // After an in-place resize to another class only the capacity counts.
        assert_eq!(check(true, FreeHint::sized(1)), Ok(()));
        assert_eq!(check(true, FreeHint::aligned(Some(1), 4096)), Ok(()));
        assert!(check(true, FreeHint::sized(class.size() + 1)).is_err());
    }

    #[test]
    fn large_and_sampled_hints_must_match_the_request() {
        let engine = engine();
        let live = |got: SizedPtr| match engine.heap().lookup_large(got.ptr) {
            LargeLookup::Live(span) => span,
            other => panic!("{other:?}"),
        };

        let mb = 1 << 20;
        let large = engine.allocate(None, Request::new(mb, 16)).unwrap();
        let span = live(large);
        assert_eq!(check_large(span, large.ptr, FreeHint::aligned(Some(mb), 16)), Ok(()));
        assert_eq!(check_large(span, large.ptr, FreeHint::sized(mb)), Ok(()));
        assert!(matches!(
            check_large(span, large.ptr, FreeHint::aligned(Some(mb), 4096)),
            Err(UsageError::AlignmentMismatch { align: 4096, .. })
        ));
        assert!(matches!(
            check_large(span, large.ptr, FreeHint::sized(mb - 1)),
            Err(UsageError::SizeOutOfRange { min, .. }) if min == mb
        ));

        engine.parameters().set_sampling_rate(SamplingRate::ALWAYS);
        let sampled = engine.allocate(None, Request::new(100, 16)).unwrap();
        engine.parameters().set_sampling_rate(SamplingRate::NEVER);
        let span = live(sampled);
        assert!(span.is_sampled());
        // Judged like the pooled object it stands in for.
        assert_eq!(check_large(span, sampled.ptr, FreeHint::aligned(Some(100), 8)), Ok(()));
        assert_eq!(check_large(span, sampled.ptr, FreeHint::sized(sampled.size)), Ok(()));
        assert!(matches!(
            check_large(span, sampled.ptr, FreeHint::aligned(Some(100), 4096)),
            Err(UsageError::AlignmentMismatch { align: 4096, .. })
        ));
        assert!(check_large(span, sampled.ptr, FreeHint::sized(99)).is_err());

        unsafe {
            engine.deallocate(None, large.ptr, FreeHint::aligned(Some(mb), 16));
            engine.deallocate(None, sampled.ptr, FreeHint::aligned(Some(100), 16));
        }
    }

    #[test]
    fn interior_pointers_are_not_objects() {
        let engine = engine();
        let got = engine.allocate(None, Request::new(100, 16)).unwrap();
        assert_eq!(engine.allocated_size(got.ptr.as_ptr()), Some(got.size));
        for offset in [1, 8, 16, got.size - 8] {
            assert_eq!(engine.allocated_size(got.ptr.as_ptr().wrapping_add(offset)), None);
        }
        unsafe { engine.deallocate(None, got.ptr, FreeHint::sized(100)) };
    }

    #[test]
    fn in_place_resize_to_another_class_relaxes_hints() {
        let engine = engine();
        let a = engine.allocate(None, Request::new(1000, 16)).unwrap();
        let b = unsafe { engine.reallocate(None, a.ptr, FreeHint::sized(1000), Request::new(10, 16)) }
            .unwrap();
        assert_eq!(a, b);
        // Freeing with the new size must not be mistaken for a bad hint.
        unsafe { engine.deallocate(None, b.ptr, FreeHint::sized(10)) };

        let big = engine.allocate(None, Request::new(2 * PAGE_SIZE, 16)).unwrap();
        let moved = unsafe {
            engine.reallocate(None, big.ptr, FreeHint::NONE, Request::new(MAX_SMALL_SIZE + 1, 4096))
        }
        .unwrap();
        let shrunk = unsafe {
            engine.reallocate(None, moved.ptr, FreeHint::NONE, Request::new(MAX_SMALL_SIZE, 4096))
        }
        .unwrap();
        assert_eq!(shrunk.ptr, moved.ptr);
        unsafe {
            engine.deallocate(None, shrunk.ptr, FreeHint::aligned(Some(MAX_SMALL_SIZE), 4096))
        };
    }

    #[test]
    fn over_release_is_credited_to_later_calls() {
        let engine = engine();
        let mb = 1 << 20;
        let unmapped = || engine.stats().pageheap_unmapped_bytes;
        let a = engine.allocate(None, Request::new(mb, 16)).unwrap();
        let b = engine.allocate(None, Request::new(mb, 16)).unwrap();
        engine.release(usize::MAX);
        let starting = unmapped();

        // Nothing to release while both are live.
        engine.release(usize::MAX);
        assert_eq!(unmapped(), starting);
        engine.release(mb);
        assert_eq!(unmapped(), starting);

        unsafe { engine.deallocate(None, a.ptr, FreeHint::NONE) };
        // The whole span goes, half of it in excess.
        engine.release(mb / 2);
        assert_eq!(unmapped(), starting + mb);
        // Covered by the excess.
        assert_eq!(engine.release(mb / 4), 0);
        assert_eq!(unmapped(), starting + mb);

        unsafe { engine.deallocate(None, b.ptr, FreeHint::NONE) };
        // Uses up the remaining quarter and releases `b`.
        engine.release(mb / 2);
        assert_eq!(unmapped(), starting + 2 * mb);
        assert_eq!(engine.release(mb / 2), 0);
        assert_eq!(unmapped(), starting + 2 * mb);

        engine.release(usize::MAX);
        assert_eq!(unmapped(), starting + 2 * mb);

        let a = engine.allocate(None, Request::new(mb, 16)).unwrap();
        unsafe { engine.deallocate(None, a.ptr, FreeHint::NONE) };
        assert_eq!(unmapped(), starting + mb);

        // Less than a page still releases something.
        engine.release(1);
        assert_eq!(unmapped(), starting + 2 * mb);
    }

    #[test]
    fn release_accounting() {
        let engine = engine();
        let mb = 1 << 20;
        let a = engine.allocate(None, Request::new(mb, 16)).unwrap();
        let b = engine.allocate(None, Request::new(mb, 16)).unwrap();
        let unmapped = |e: &Engine| e.stats().pageheap_unmapped_bytes;

        // Nothing is free yet.
        let starting = unmapped(engine);
        assert_eq!(engine.release(mb), 0);
        assert_eq!(unmapped(engine), starting);

        unsafe { engine.deallocate(None, a.ptr, FreeHint::NONE) };
        // Whole spans only: asking for half releases the full mebibyte.
        assert_eq!(engine.release(mb / 2), mb);
        assert_eq!(unmapped(engine), starting + mb);
        // Idempotent.
        assert_eq!(engine.release(mb), 0);
        assert_eq!(unmapped(engine), starting + mb);

        // Reusing the released pages takes them off the unmapped count.
        let c = engine.allocate(None, Request::new(mb, 16)).unwrap();
        assert_eq!(unmapped(engine), starting);

        unsafe {
            engine.deallocate(None, b.ptr, FreeHint::NONE);
            engine.deallocate(None, c.ptr, FreeHint::NONE);
        }
        // Less than a page still releases something.
        assert!(engine.release(1) > 0);
        let free = engine.stats().pageheap_free_bytes;
        assert_eq!(engine.release(usize::MAX), free);
        assert_eq!(engine.stats().pageheap_free_bytes, 0);
    }

    #[test]
    fn many_objects_of_one_class() {
        let engine = engine();
        let mut cache = FastCache::new();
        for _ in 0..2 {
            let objects: Vec<_> = (0..70_000)
                .map(|_| engine.allocate(Some(&mut cache), Request::new(10, 8)).unwrap())
                .collect();
            for got in objects {
                unsafe { engine.deallocate(Some(&mut cache), got.ptr, FreeHint::sized(10)) };
            }
        }
        assert!(cache.cached_bytes() <= engine.parameters().fast_cache_budget());
        cache.flush(engine);
        assert_eq!(cache.cached_bytes(), 0);
        let stats = engine.stats();
        assert_eq!(stats.current_allocated_bytes(), 0);
        assert_eq!(stats.fast_cache_free_bytes, 0);
    }

    #[test]
    fn cold_requests_use_the_cold_partition() {
        let engine = engine();
        let mut cache = FastCache::new();
        for size in [16, 2048, 100_000, 1 << 20] {
            let cold = engine
                .allocate(Some(&mut cache), Request::new(size, 16).with_hot_cold(HotCold(0)))
                .unwrap();
            let hot = engine
                .allocate(Some(&mut cache), Request::new(size, 16).with_hot_cold(HotCold(255)))
                .unwrap();
            assert!(engine.is_cold(cold.ptr.as_ptr()), "{size}");
            assert!(!engine.is_cold(hot.ptr.as_ptr()), "{size}");
            unsafe {
                engine.deallocate(Some(&mut cache), cold.ptr, FreeHint::sized(size));
                engine.deallocate(Some(&mut cache), hot.ptr, FreeHint::sized(size));
            }
        }
        cache.flush(engine);
        assert!(engine.stats().pageheap_cold_free_bytes > 0);
        assert!(engine.release_cold(usize::MAX) > 0);
        assert_eq!(engine.stats().pageheap_cold_free_bytes, 0);
        assert!(engine.stats().pageheap_free_bytes > 0);
    }

    #[test]
    fn memory_limit_turns_into_allocation_failure() {
        let engine = engine();
        engine.parameters().set_memory_limit(4 << 20);
        let a = engine.allocate(None, Request::new(2 << 20, 1)).unwrap();
        assert!(engine.allocate(None, Request::new(4 << 20, 1)).is_err());
        unsafe { engine.deallocate(None, a.ptr, FreeHint::NONE) };
        // Freed (and released) pages count against the limit no more.
        let b = engine.allocate(None, Request::new(3 << 20, 1)).unwrap();
        unsafe { engine.deallocate(None, b.ptr, FreeHint::NONE) };
    }

    #[test]
    fn numeric_properties() {
        let engine = engine();
        let a = engine.allocate(None, Request::new(PAGE_SIZE * 300, 1)).unwrap();
        assert_eq!(
            engine.numeric_property("generic.current_allocated_bytes"),
            Some(PAGE_SIZE * 300)
        );
        assert_eq!(engine.numeric_property("spanmalloc.pageheap_unmapped_bytes"), Some(0));
        assert_eq!(engine.numeric_property("no.such.property"), None);

        let report = engine.stats_report();
        let line = report
            .lines()
            .find(|l| l.starts_with("MmapSysAllocator: "))
            .unwrap();
        let bytes: usize = line["MmapSysAllocator: ".len()..]
            .trim_end_matches(" bytes allocated")
            .parse()
            .unwrap();
        assert!(bytes >= PAGE_SIZE * 300);
        unsafe { engine.deallocate(None, a.ptr, FreeHint::NONE) };
        assert!(engine.heap().stats().free_bytes >= PAGE_SIZE * 300);
    }
}
