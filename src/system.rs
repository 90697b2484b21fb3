//! The operating-system collaborator.
//!
//! Everything the engine owns (heap pages, span records, page-map nodes)
//! ultimately comes from [`SystemAllocator::map`]. Memory the engine has
//! started using is never unmapped again; releasing memory to the system only
//! drops the physical backing of a range while keeping the addresses reserved,
//! so released pages can be reused transparently by simply touching them
//! again.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use cfg_if::cfg_if;

use crate::pages::PAGE_SIZE;

/// The name of the low-level allocator in statistics reports.
pub(crate) const NAME: &str = "MmapSysAllocator";

/// Maps zeroed, page-aligned memory and releases its physical backing.
#[derive(Debug)]
pub(crate) struct SystemAllocator {
    /// Bytes mapped for the owning engine.
    mapped: AtomicUsize,
}

impl SystemAllocator {
    pub(crate) const fn new() -> Self {
        SystemAllocator {
            mapped: AtomicUsize::new(0),
        }
    }

    /// Map `bytes` of zeroed memory aligned to `align`.
    ///
    /// `bytes` must be a non-zero multiple of [`PAGE_SIZE`] and `align` a power
    /// of two that is at least [`PAGE_SIZE`].
    pub(crate) fn map(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert_ne!(bytes, 0);
        debug_assert_eq!(bytes % PAGE_SIZE, 0);
        debug_assert!(align.is_power_of_two() && align >= PAGE_SIZE);

        let ptr = os::map(bytes, align)?;
        debug_assert_eq!(ptr.as_ptr() as usize % align, 0);
        self.mapped.fetch_add(bytes, Ordering::Relaxed);
        Some(ptr)
    }

    /// Drop the physical backing of the given range.
    ///
    /// Returns `true` if the range was released. Its contents are unspecified
    /// afterwards.
    ///
    /// ### Safety
    ///
    /// The range must have been returned by [`SystemAllocator::map`] and must
    /// not be in use by anyone.
    pub(crate) unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> bool {
        debug_assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        debug_assert_eq!(bytes % PAGE_SIZE, 0);
        os::release(ptr, bytes)
    }

    /// Give back a mapping that was never put to use.
    ///
    /// ### Safety
    ///
    /// `ptr`, `bytes` and `align` must be exactly those of one earlier
    /// [`SystemAllocator::map`] call, and nothing may reference the mapping.
    pub(crate) unsafe fn unmap(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        os::unmap(ptr, bytes, align);
        self.mapped.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Total bytes mapped and not unmapped again.
    pub(crate) fn bytes_mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }
}

cfg_if! {
    if #[cfg(unix)] {
        mod os {
            use core::ptr::{self, NonNull};

            pub(super) fn map(bytes: usize, align: usize) -> Option<NonNull<u8>> {
                // Over-map so that an aligned range is guaranteed to fit, then
                // give the slop at either end back.
                let total = bytes.checked_add(align)?;
                // Safety: anonymous private mapping with no address hint.
                let base = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        total,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if base == libc::MAP_FAILED {
                    return None;
                }

                let base = base as usize;
                let start = (base + align - 1) & !(align - 1);
                let head = start - base;
                let tail = total - head - bytes;
                // Safety: both ranges are part of the mapping we just created
                // and nobody else knows about them. Failure to trim only wastes
                // address space.
                unsafe {
                    if head != 0 {
                        libc::munmap(base as *mut libc::c_void, head);
                    }
                    if tail != 0 {
                        libc::munmap((start + bytes) as *mut libc::c_void, tail);
                    }
                }
                NonNull::new(start as *mut u8)
            }

            pub(super) unsafe fn release(ptr: NonNull<u8>, bytes: usize) -> bool {
                libc::madvise(ptr.as_ptr().cast(), bytes, libc::MADV_DONTNEED) == 0
            }

            pub(super) unsafe fn unmap(ptr: NonNull<u8>, bytes: usize, _align: usize) {
                libc::munmap(ptr.as_ptr().cast(), bytes);
            }
        }
    } else {
        mod os {
            use core::ptr::NonNull;
            use std::alloc::{GlobalAlloc, Layout, System};

            pub(super) fn map(bytes: usize, align: usize) -> Option<NonNull<u8>> {
                let layout = Layout::from_size_align(bytes, align).ok()?;
                // Safety: `bytes` is non-zero.
                NonNull::new(unsafe { System.alloc_zeroed(layout) })
            }

            pub(super) unsafe fn release(_ptr: NonNull<u8>, _bytes: usize) -> bool {
                // No portable way to drop physical backing while keeping the
                // range reserved.
                false
            }

            pub(super) unsafe fn unmap(ptr: NonNull<u8>, bytes: usize, align: usize) {
                System.dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(bytes, align));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_aligned_and_zeroed() {
        let system = SystemAllocator::new();
        for align in [PAGE_SIZE, 4 * PAGE_SIZE, 1 << 20] {
            let ptr = system.map(2 * PAGE_SIZE, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 2 * PAGE_SIZE) };
            assert!(bytes.iter().all(|b| *b == 0));
        }
        assert_eq!(system.bytes_mapped(), 6 * PAGE_SIZE);
    }

    #[test]
    fn enormous_maps_fail() {
        let system = SystemAllocator::new();
        let bytes = (isize::MAX as usize) & !(PAGE_SIZE - 1);
        assert!(system.map(bytes, PAGE_SIZE).is_none());
        assert_eq!(system.bytes_mapped(), 0);
    }

    #[test]
    fn unmapping_takes_bytes_off_the_count() {
        let system = SystemAllocator::new();
        let keep = system.map(PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = system.map(4 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(system.bytes_mapped(), 5 * PAGE_SIZE);
        unsafe { system.unmap(ptr, 4 * PAGE_SIZE, 2 * PAGE_SIZE) };
        assert_eq!(system.bytes_mapped(), PAGE_SIZE);
        unsafe { keep.as_ptr().write(1) };
    }

    #[cfg(unix)]
    #[test]
    fn released_pages_can_be_touched_again() {
        let system = SystemAllocator::new();
        let ptr = system.map(PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, PAGE_SIZE);
            assert!(system.release(ptr, PAGE_SIZE));
            ptr.as_ptr().write(7);
            assert_eq!(ptr.as_ptr().read(), 7);
        }
    }
}
