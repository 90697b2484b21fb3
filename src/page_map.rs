//! Page number to span lookups.
//!
//! A two-level radix tree covering the whole user address space. The root and
//! the leaves are mapped lazily from the OS collaborator and never freed.
//! Lookups are lock-free; every update is made while holding the lock of the
//! span's owner.

use core::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    pages::{PAGE_SHIFT, PAGE_SIZE},
    size_class::SizeClass,
    span::Span,
    system::SystemAllocator,
};

const ADDRESS_BITS: usize = if usize::BITS >= 64 { 48 } else { usize::BITS as usize };
const PAGE_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = if PAGE_BITS < 18 { PAGE_BITS } else { 18 };
const ROOT_BITS: usize = PAGE_BITS - LEAF_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

/// Class tag bit marking a span of the cold partition.
const COLD_TAG: u8 = 0x80;

struct Leaf {
    spans: [AtomicPtr<Span<'static>>; LEAF_LEN],
    /// Size class tag of small spans: `0` for anything else.
    classes: [AtomicU8; LEAF_LEN],
}

type Root = [AtomicPtr<Leaf>; ROOT_LEN];

/// The class of a pooled small object, as recorded in the page map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ClassTag(u8);

impl ClassTag {
    pub(crate) fn new(class: SizeClass, cold: bool) -> Self {
        ClassTag(class.index() as u8 | if cold { COLD_TAG } else { 0 })
    }

    pub(crate) fn class(self) -> SizeClass {
        SizeClass::from_index((self.0 & !COLD_TAG) as usize)
    }

    pub(crate) fn is_cold(self) -> bool {
        self.0 & COLD_TAG != 0
    }
}

pub(crate) struct PageMap {
    root: AtomicPtr<Root>,
    mapped: AtomicUsize,
}

impl PageMap {
    pub(crate) const fn new() -> Self {
        PageMap {
            root: AtomicPtr::new(ptr::null_mut()),
            mapped: AtomicUsize::new(0),
        }
    }

    /// Bytes of OS memory used by the map.
    pub(crate) fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Make sure the nodes covering `first..first + pages` exist.
    ///
    /// Returns `false` if the range is outside the covered address space or
    /// the nodes could not be mapped. Callers serialize calls to this method
    /// (the page heap lock).
    pub(crate) fn ensure(&self, system: &SystemAllocator, first: usize, pages: usize) -> bool {
        let Some(end) = first.checked_add(pages) else {
            return false;
        };
        if end > 1 << PAGE_BITS {
            return false;
        }

        if self.root.load(Ordering::Acquire).is_null() {
            let bytes = round_to_page(mem::size_of::<Root>());
            let Some(root) = system.map(bytes, PAGE_SIZE) else {
                return false;
            };
            self.mapped.fetch_add(bytes, Ordering::Relaxed);
            // Zeroed memory is a valid array of null pointers.
            self.root.store(root.as_ptr().cast(), Ordering::Release);
        }
        let Some(root) = self.root() else {
            return false;
        };

        let mut key = first >> LEAF_BITS;
        while key <= (end - 1) >> LEAF_BITS {
            if root[key].load(Ordering::Acquire).is_null() {
                let bytes = round_to_page(mem::size_of::<Leaf>());
                let Some(leaf) = system.map(bytes, PAGE_SIZE) else {
                    return false;
                };
                self.mapped.fetch_add(bytes, Ordering::Relaxed);
                root[key].store(leaf.as_ptr().cast(), Ordering::Release);
            }
            key += 1;
        }
        true
    }

    fn root(&self) -> Option<&'static Root> {
        let root = NonNull::new(self.root.load(Ordering::Acquire))?;
        // Safety: the root, once published, is never unmapped.
        Some(unsafe { &*root.as_ptr() })
    }

    fn leaf(&self, page: usize) -> Option<&'static Leaf> {
        if page >= 1 << PAGE_BITS {
            return None;
        }
        let root = self.root()?;
        let leaf = NonNull::new(root[page >> LEAF_BITS].load(Ordering::Acquire))?;
        // Safety: leaves, once published, are never unmapped.
        Some(unsafe { &*leaf.as_ptr() })
    }

    /// The span registered for `page`, if any.
    ///
    /// Only pages a span registered are meaningful; callers validate that the
    /// returned span actually contains the page.
    #[inline]
    pub(crate) fn get(&self, page: usize) -> Option<&'static Span<'static>> {
        let leaf = self.leaf(page)?;
        let span = NonNull::new(leaf.spans[page & (LEAF_LEN - 1)].load(Ordering::Acquire))?;
        // Safety: span records are never unmapped.
        Some(unsafe { &*span.as_ptr() })
    }

    /// The class tag of `page` if it belongs to a small span.
    #[inline]
    pub(crate) fn class_tag(&self, page: usize) -> Option<ClassTag> {
        let leaf = self.leaf(page)?;
        match leaf.classes[page & (LEAF_LEN - 1)].load(Ordering::Acquire) {
            0 => None,
            tag => Some(ClassTag(tag)),
        }
    }

    /// Register `span` for one page. The covering leaf must exist.
    pub(crate) fn set(&self, page: usize, span: Option<&'static Span<'static>>) {
        if let Some(leaf) = self.leaf(page) {
            let ptr = span.map_or(ptr::null_mut(), |s| s as *const Span<'static> as *mut _);
            leaf.spans[page & (LEAF_LEN - 1)].store(ptr, Ordering::Release);
        } else {
            debug_assert!(false, "page {page:#x} has no leaf");
        }
    }

    fn set_tag(&self, page: usize, tag: u8) {
        if let Some(leaf) = self.leaf(page) {
            leaf.classes[page & (LEAF_LEN - 1)].store(tag, Ordering::Release);
        }
    }

    /// Register the first and last page of `span`.
    pub(crate) fn register_ends(&self, span: &'static Span<'static>) {
        self.set(span.first_page(), Some(span));
        self.set(span.last_page(), Some(span));
    }

    /// Register every page of a small span along with its class tag.
    pub(crate) fn register_small(&self, span: &'static Span<'static>, tag: ClassTag) {
        for page in span.first_page()..span.end_page() {
            self.set(page, Some(span));
            self.set_tag(page, tag.0);
        }
    }

    /// Clear the class tags of a small span being returned to the page heap.
    pub(crate) fn clear_small(&self, span: &'static Span<'static>) {
        for page in span.first_page()..span.end_page() {
            self.set_tag(page, 0);
        }
    }
}

fn round_to_page(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
