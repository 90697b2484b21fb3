//! The public allocation entry points of the process-wide engine.
//!
//! Every entry point is a thin adapter over [`allocate`] (or the matching free
//! and resize operations of [`Engine`]), fixing the alignment, the placement
//! hint and what happens on failure. Each thread gets its own [`FastCache`],
//! created on first use and flushed back to the engine when the thread exits.
//!
//! Entry points that differ only in being the array form of another, or in
//! being the `delete` spelling of a free, are re-exports of the same function,
//! so their addresses compare equal.
//!
//! # Example
//!
//! ```
//! use spanmalloc::frontend;
//!
//! let p = frontend::malloc(100);
//! assert!(!p.is_null());
//! assert!(frontend::allocated_size(p).unwrap() >= 100);
//! unsafe { frontend::free_sized(p, 100) };
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    cell::{Cell, UnsafeCell},
    ptr::{self, NonNull},
};

use cfg_if::cfg_if;

use crate::{
    engine::{Engine, FreeHint, Request},
    error::out_of_memory,
    fast_cache::FastCache,
    params::Parameters,
    sampler::AllocationRecord,
    size_class::DEFAULT_ALIGNMENT,
    stats::Stats,
    AllocError, Allocator,
};

cfg_if! {
    if #[cfg(unix)] {
        use libc::{EINVAL, ENOMEM};
    } else {
        const EINVAL: i32 = 22;
        const ENOMEM: i32 = 12;
    }
}

/// A placement hint: how often an allocation is expected to be touched.
///
/// Values below [`HotCold::DEFAULT`] ask for the cold partition, whose pages
/// cluster away from hot data and can be released on their own. The hint never
/// overrides size or alignment requirements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HotCold(pub u8);

impl HotCold {
    /// Rarely touched.
    pub const COLDEST: HotCold = HotCold(0);

    /// No preference; what the unhinted entry points use.
    pub const DEFAULT: HotCold = HotCold(128);

    /// Frequently touched.
    pub const HOTTEST: HotCold = HotCold(255);

    /// Whether this hint asks for the cold partition.
    #[inline]
    pub fn is_cold(self) -> bool {
        self.0 < Self::DEFAULT.0
    }
}

impl Default for HotCold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// An allocation together with its usable capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizedPtr {
    /// The allocation's address.
    pub ptr: NonNull<u8>,
    /// The number of usable bytes at `ptr`.
    pub size: usize,
}

/// What an entry point does when an allocation cannot be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailurePolicy {
    /// Return null (or `None`).
    Null,
    /// Terminate the process.
    Abort,
}

static ENGINE: Engine = Engine::new();

struct LocalCache {
    busy: Cell<bool>,
    cache: UnsafeCell<FastCache>,
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        self.cache.get_mut().flush(&ENGINE);
    }
}

std::thread_local! {
    static CACHE: LocalCache = const {
        LocalCache {
            busy: Cell::new(false),
            cache: UnsafeCell::new(FastCache::new()),
        }
    };
}

/// Exclusive access to the current thread's fast cache.
struct CacheGuard(*const LocalCache);

impl CacheGuard {
    /// `None` while the thread's cache is in use further up the stack (an
    /// allocation made from inside the allocator, e.g. by a logger) or after
    /// it was torn down; callers then use the central lists directly.
    #[inline]
    fn acquire() -> Option<CacheGuard> {
        CACHE
            .try_with(|local| {
                if local.busy.replace(true) {
                    None
                } else {
                    Some(CacheGuard(local))
                }
            })
            .ok()
            .flatten()
    }

    #[inline]
    fn cache(&mut self) -> &mut FastCache {
        // Safety: the thread-local outlives any call made on its thread, and
        // `busy` makes this the only reference to the cache.
        unsafe { &mut *(*self.0).cache.get() }
    }
}

impl Drop for CacheGuard {
    #[inline]
    fn drop(&mut self) {
        // Safety: as above.
        unsafe { (*self.0).busy.set(false) };
    }
}

#[inline]
fn with_cache<R>(f: impl FnOnce(Option<&mut FastCache>) -> R) -> R {
    let mut guard = CacheGuard::acquire();
    f(guard.as_mut().map(CacheGuard::cache))
}

/// The process-wide engine behind these entry points.
pub fn engine() -> &'static Engine {
    &ENGINE
}

/// The process-wide engine's parameters.
pub fn parameters() -> &'static Parameters {
    ENGINE.parameters()
}

// ---- The canonical allocation primitive ------------------------------------

/// Allocate `size` bytes aligned to `align` with placement hint `hot_cold`.
///
/// Returns the address and the usable capacity. On failure (no memory, an
/// alignment that is not a power of two or exceeds
/// [`MAX_ALIGNMENT`](crate::MAX_ALIGNMENT), a size beyond `isize::MAX`) returns
/// `None` or terminates the process, per `policy`.
#[inline]
pub fn allocate(size: usize, align: usize, hot_cold: HotCold, policy: FailurePolicy) -> Option<SizedPtr> {
    match policy {
        FailurePolicy::Null => try_allocate(size, align, hot_cold).ok(),
        FailurePolicy::Abort => Some(allocate_or_abort(size, align, hot_cold)),
    }
}

#[inline]
fn try_allocate(size: usize, align: usize, hot_cold: HotCold) -> Result<SizedPtr, AllocError> {
    let request = Request::new(size, align).with_hot_cold(hot_cold);
    with_cache(|cache| ENGINE.allocate(cache, request))
}

#[inline]
fn allocate_or_abort(size: usize, align: usize, hot_cold: HotCold) -> SizedPtr {
    match try_allocate(size, align, hot_cold) {
        Ok(allocation) => allocation,
        Err(AllocError) => out_of_memory(size, align),
    }
}

#[inline]
fn allocate_or_null(size: usize, align: usize, hot_cold: HotCold) -> *mut u8 {
    allocate(size, align, hot_cold, FailurePolicy::Null)
        .map_or(ptr::null_mut(), |allocation| allocation.ptr.as_ptr())
}

#[inline]
unsafe fn deallocate(ptr: *mut u8, hint: FreeHint) {
    if let Some(ptr) = NonNull::new(ptr) {
        with_cache(|cache| ENGINE.deallocate(cache, ptr, hint));
    }
}

// ---- C-style entry points ---------------------------------------------------

/// Allocate `size` bytes aligned to 16. Returns null on failure.
pub fn malloc(size: usize) -> *mut u8 {
    allocate_or_null(size, DEFAULT_ALIGNMENT, HotCold::DEFAULT)
}

/// Allocate `n * size` zeroed bytes. Returns null on failure, including when
/// the product overflows.
pub fn calloc(n: usize, size: usize) -> *mut u8 {
    let Some(total) = n.checked_mul(size) else {
        return ptr::null_mut();
    };
    let ptr = malloc(total);
    if !ptr.is_null() {
        // Safety: `ptr` holds at least `total` bytes.
        unsafe { ptr.write_bytes(0, total) };
    }
    ptr
}

/// Resize the allocation at `ptr` to `size` bytes.
///
/// A null `ptr` allocates. The allocation keeps its address whenever its
/// capacity already holds `size` bytes; otherwise the contents are moved. On
/// failure returns null and leaves the old allocation untouched.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of the process-wide engine.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
        return malloc(size);
    };
    let request = Request::new(size, DEFAULT_ALIGNMENT);
    with_cache(|cache| ENGINE.reallocate(cache, old, FreeHint::NONE, request))
        .map_or(ptr::null_mut(), |allocation| allocation.ptr.as_ptr())
}

/// Allocate `size` bytes aligned to `align`, which must be a power of two.
/// Returns null on failure.
pub fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
    allocate_or_null(size, align, HotCold::DEFAULT)
}

/// Same as [`aligned_alloc`].
pub fn memalign(align: usize, size: usize) -> *mut u8 {
    aligned_alloc(align, size)
}

/// Allocate `size` bytes aligned to `align` into `*out`.
///
/// Returns `0` on success, `EINVAL` if `align` is not a power-of-two multiple
/// of the pointer size or exceeds [`MAX_ALIGNMENT`](crate::MAX_ALIGNMENT), and
/// `ENOMEM` if there is no memory. `*out` is only written on success.
pub fn posix_memalign(out: &mut *mut u8, align: usize, size: usize) -> i32 {
    if !align.is_power_of_two()
        || align % core::mem::size_of::<*mut u8>() != 0
        || align > crate::MAX_ALIGNMENT
    {
        return EINVAL;
    }
    match allocate(size, align, HotCold::DEFAULT, FailurePolicy::Null) {
        Some(allocation) => {
            *out = allocation.ptr.as_ptr();
            0
        }
        None => ENOMEM,
    }
}

/// Free an allocation. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of the process-wide engine.
pub unsafe fn free(ptr: *mut u8) {
    deallocate(ptr, FreeHint::NONE);
}

/// Free an allocation of `size` bytes. A size outside the range the allocation
/// could have been requested with terminates the process.
///
/// # Safety
///
/// As for [`free`].
pub unsafe fn free_sized(ptr: *mut u8, size: usize) {
    deallocate(ptr, FreeHint::sized(size));
}

/// Free an allocation of `size` bytes aligned to `align`. Hints inconsistent
/// with the allocation terminate the process.
///
/// # Safety
///
/// As for [`free`].
pub unsafe fn free_aligned_sized(ptr: *mut u8, align: usize, size: usize) {
    deallocate(ptr, FreeHint::aligned(Some(size), align));
}

// ---- `new` and `delete` -----------------------------------------------------

/// Allocate `size` bytes aligned to 16, terminating the process on failure.
pub fn new(size: usize) -> NonNull<u8> {
    allocate_or_abort(size, DEFAULT_ALIGNMENT, HotCold::DEFAULT).ptr
}

/// Allocate `size` bytes aligned to 16. Returns null on failure.
pub fn new_nothrow(size: usize) -> *mut u8 {
    allocate_or_null(size, DEFAULT_ALIGNMENT, HotCold::DEFAULT)
}

/// Allocate `size` bytes aligned to `align`, terminating the process on
/// failure.
pub fn new_aligned(size: usize, align: usize) -> NonNull<u8> {
    allocate_or_abort(size, align, HotCold::DEFAULT).ptr
}

/// Allocate `size` bytes aligned to `align`. Returns null on failure.
pub fn new_aligned_nothrow(size: usize, align: usize) -> *mut u8 {
    allocate_or_null(size, align, HotCold::DEFAULT)
}

/// Allocate `size` bytes with a placement hint, terminating the process on
/// failure.
pub fn new_hot_cold(size: usize, hot_cold: HotCold) -> NonNull<u8> {
    allocate_or_abort(size, DEFAULT_ALIGNMENT, hot_cold).ptr
}

/// Allocate `size` bytes with a placement hint. Returns null on failure.
pub fn new_hot_cold_nothrow(size: usize, hot_cold: HotCold) -> *mut u8 {
    allocate_or_null(size, DEFAULT_ALIGNMENT, hot_cold)
}

/// Allocate `size` bytes and report the usable capacity, terminating the
/// process on failure.
pub fn size_returning_new(size: usize) -> SizedPtr {
    allocate_or_abort(size, DEFAULT_ALIGNMENT, HotCold::DEFAULT)
}

/// Allocate `size` bytes and report the usable capacity.
pub fn size_returning_new_nothrow(size: usize) -> Option<SizedPtr> {
    allocate(size, DEFAULT_ALIGNMENT, HotCold::DEFAULT, FailurePolicy::Null)
}

/// [`size_returning_new`] with a placement hint.
pub fn size_returning_new_hot_cold(size: usize, hot_cold: HotCold) -> SizedPtr {
    allocate_or_abort(size, DEFAULT_ALIGNMENT, hot_cold)
}

/// [`size_returning_new_nothrow`] with a placement hint.
pub fn size_returning_new_hot_cold_nothrow(size: usize, hot_cold: HotCold) -> Option<SizedPtr> {
    allocate(size, DEFAULT_ALIGNMENT, hot_cold, FailurePolicy::Null)
}

/// [`size_returning_new`] with an alignment.
pub fn size_returning_new_aligned(size: usize, align: usize) -> SizedPtr {
    allocate_or_abort(size, align, HotCold::DEFAULT)
}

/// [`size_returning_new_nothrow`] with an alignment.
pub fn size_returning_new_aligned_nothrow(size: usize, align: usize) -> Option<SizedPtr> {
    allocate(size, align, HotCold::DEFAULT, FailurePolicy::Null)
}

/// [`size_returning_new`] with an alignment and a placement hint.
pub fn size_returning_new_aligned_hot_cold(size: usize, align: usize, hot_cold: HotCold) -> SizedPtr {
    allocate_or_abort(size, align, hot_cold)
}

/// [`size_returning_new_nothrow`] with an alignment and a placement hint.
pub fn size_returning_new_aligned_hot_cold_nothrow(
    size: usize,
    align: usize,
    hot_cold: HotCold,
) -> Option<SizedPtr> {
    allocate(size, align, hot_cold, FailurePolicy::Null)
}

pub use self::{free as delete, free as delete_nothrow, free_sized as delete_sized};

/// Free an allocation made with alignment `align`.
///
/// # Safety
///
/// As for [`free`].
pub unsafe fn delete_aligned(ptr: *mut u8, align: usize) {
    deallocate(ptr, FreeHint::aligned(None, align));
}

/// Free an allocation of `size` bytes made with alignment `align`.
///
/// # Safety
///
/// As for [`free`].
pub unsafe fn delete_sized_aligned(ptr: *mut u8, size: usize, align: usize) {
    deallocate(ptr, FreeHint::aligned(Some(size), align));
}

pub use self::{
    delete_aligned as delete_array_aligned, delete_sized_aligned as delete_array_sized_aligned,
    free as delete_array, free as delete_array_nothrow, free_sized as delete_array_sized,
    new as new_array, new_aligned as new_array_aligned,
    new_aligned_nothrow as new_array_aligned_nothrow, new_hot_cold as new_array_hot_cold,
    new_hot_cold_nothrow as new_array_hot_cold_nothrow, new_nothrow as new_array_nothrow,
};

// ---- Introspection ------------------------------------------------------------

/// The usable capacity of the allocation at `ptr`, or `None` if it is not an
/// allocation of the process-wide engine.
pub fn allocated_size(ptr: *const u8) -> Option<usize> {
    ENGINE.allocated_size(ptr)
}

/// The capacity an allocation of `size` bytes aligned to `align` would get.
pub fn good_size(size: usize, align: usize) -> Option<usize> {
    ENGINE.good_size(size, align)
}

/// Whether the allocation at `ptr` lives in the cold partition.
pub fn is_cold(ptr: *const u8) -> bool {
    ENGINE.is_cold(ptr)
}

/// Whether the allocation at `ptr` was sampled.
pub fn is_sampled(ptr: *const u8) -> bool {
    ENGINE.is_sampled(ptr)
}

/// See [`Engine::numeric_property`].
pub fn numeric_property(key: &str) -> Option<usize> {
    ENGINE.numeric_property(key)
}

/// See [`Engine::stats`].
pub fn stats() -> Stats {
    ENGINE.stats()
}

/// See [`Engine::stats_report`].
pub fn stats_report() -> String {
    ENGINE.stats_report()
}

/// See [`Engine::profile`].
pub fn profile() -> Vec<AllocationRecord> {
    ENGINE.profile()
}

/// Release at least `bytes` bytes (at least one page) of free memory to the
/// OS, if there is that much.
pub fn release_memory_to_system(bytes: usize) {
    ENGINE.release(bytes);
}

/// Give the current thread's cached objects back to the central lists.
pub fn flush_local_cache() {
    if let Some(mut guard) = CacheGuard::acquire() {
        guard.cache().flush(&ENGINE);
    }
}

// ---- Rust allocator traits ----------------------------------------------------

/// The process-wide engine as a Rust allocator.
///
/// ```no_run
/// #[global_allocator]
/// static GLOBAL: spanmalloc::SpanMalloc = spanmalloc::SpanMalloc;
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanMalloc;

unsafe impl GlobalAlloc for SpanMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate_or_null(layout.size(), layout.align(), HotCold::DEFAULT)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        deallocate(ptr, FreeHint::aligned(Some(layout.size()), layout.align()));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        let hint = FreeHint::aligned(Some(layout.size()), layout.align());
        let request = Request::new(new_size, layout.align());
        with_cache(|cache| ENGINE.reallocate(cache, old, hint, request))
            .map_or(ptr::null_mut(), |allocation| allocation.ptr.as_ptr())
    }
}

unsafe impl Allocator for SpanMalloc {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let allocation = allocate(layout.size(), layout.align(), HotCold::DEFAULT, FailurePolicy::Null)
            .ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(allocation.ptr, allocation.size))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        deallocate(
            ptr.as_ptr(),
            FreeHint::aligned(Some(layout.size()), layout.align()),
        );
    }
}
