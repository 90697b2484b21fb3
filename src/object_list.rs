//! Singly-linked lists of free objects, threaded through the objects' own
//! first word.
//!
//! These carry objects between fast caches and central lists, where objects of
//! one class may come from many different spans.

use core::ptr::NonNull;

#[derive(Debug)]
pub(crate) struct ObjectList {
    head: Option<NonNull<u8>>,
    len: usize,
}

// Safety: the list owns the free objects it links; nobody else accesses them.
unsafe impl Send for ObjectList {}

impl ObjectList {
    pub(crate) const fn new() -> Self {
        ObjectList { head: None, len: 0 }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Add a free object to the front of the list.
    ///
    /// ### Safety
    ///
    /// `obj` must be a free object of at least pointer size and alignment that
    /// nothing else references.
    #[inline]
    pub(crate) unsafe fn push(&mut self, obj: NonNull<u8>) {
        obj.cast::<Option<NonNull<u8>>>().as_ptr().write(self.head);
        self.head = Some(obj);
        self.len += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = self.head?;
        // Safety: every object in the list had its link written by `push`.
        self.head = unsafe { obj.cast::<Option<NonNull<u8>>>().as_ptr().read() };
        self.len -= 1;
        Some(obj)
    }

    /// Split off up to `n` objects from the front of the list.
    pub(crate) fn split_front(&mut self, n: usize) -> ObjectList {
        let mut taken = ObjectList::new();
        for _ in 0..n {
            let Some(obj) = self.pop() else { break };
            // Safety: `obj` was free and owned by this list.
            unsafe { taken.push(obj) };
        }
        taken
    }

    /// Move every object of `other` into this list.
    pub(crate) fn append(&mut self, mut other: ObjectList) {
        while let Some(obj) = other.pop() {
            // Safety: `obj` was free and owned by `other`.
            unsafe { self.push(obj) };
        }
    }
}

impl Iterator for ObjectList {
    type Item = NonNull<u8>;

    #[inline]
    fn next(&mut self) -> Option<NonNull<u8>> {
        self.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}
