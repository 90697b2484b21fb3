//! Per-execution-context caches of free objects.
//!
//! A fast cache keeps, for each size class, a list of free objects that its
//! context can pop and push without any synchronization. Lists are refilled
//! from and flushed to the central free lists in batches.
//!
//! Each list's length limit starts at one object and grows as the list is
//! refilled ("slow start"), first by one object per refill up to the batch
//! size and then by a batch at a time. A list that keeps overflowing its limit
//! has the limit lowered again. When the cache as a whole goes over its byte
//! budget it is scavenged: every list gives back half of the objects it did not
//! need since the last scavenge (its low-water mark).

use core::ptr::NonNull;

use crate::{
    engine::Engine,
    object_list::ObjectList,
    sampler::Sampler,
    size_class::{SizeClass, NUM_CLASSES, SIZE_CLASSES},
    AllocError,
};

/// Upper bound of a list's length limit.
const MAX_DYNAMIC_LENGTH: usize = 8192;

/// Overflows tolerated before a list's length limit is lowered.
const MAX_OVERAGES: u32 = 3;

/// Cached byte counts are published to the engine once they drift this far.
const PUBLISH_THRESHOLD: usize = 16 * 1024;

#[derive(Debug)]
struct ClassCache {
    objects: ObjectList,
    max_length: u32,
    overages: u32,
    /// Fewest objects held since the last scavenge.
    low_water: u32,
}

impl ClassCache {
    const fn new() -> Self {
        ClassCache {
            objects: ObjectList::new(),
            max_length: 1,
            overages: 0,
            low_water: 0,
        }
    }

    #[inline]
    fn len(&self) -> u32 {
        // Never longer than `MAX_DYNAMIC_LENGTH + 1`.
        self.objects.len() as u32
    }
}

/// The free objects of one execution context.
///
/// A cache is bound to the first [`Engine`] it is used with and must only be
/// used with that engine afterwards. Its objects go back to the engine with
/// [`FastCache::flush`]; a cache dropped without flushing leaks them.
#[derive(Debug)]
pub struct FastCache {
    classes: [ClassCache; NUM_CLASSES],
    /// Bytes of free objects held.
    bytes: usize,
    /// What the engine was last told `bytes` is.
    published: usize,
    sampler: Sampler,
    context: u64,
    /// Address of the engine this cache is bound to, `0` if unbound.
    owner: usize,
}

impl Default for FastCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FastCache {
    /// An empty cache, not yet bound to an engine.
    pub const fn new() -> Self {
        FastCache {
            classes: [const { ClassCache::new() }; NUM_CLASSES],
            bytes: 0,
            published: 0,
            sampler: Sampler::new(0),
            context: 0,
            owner: 0,
        }
    }

    /// The id of this cache's execution context, as recorded in
    /// [`AllocationRecord::context`](crate::AllocationRecord::context). Zero
    /// until the cache is first used.
    #[inline]
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Bytes of free objects held by this cache.
    #[inline]
    pub fn cached_bytes(&self) -> usize {
        self.bytes
    }

    /// Give every cached object back to `engine`.
    ///
    /// # Panics
    ///
    /// Panics if the cache is bound to a different engine.
    pub fn flush(&mut self, engine: &Engine) {
        if self.owner == 0 {
            return;
        }
        self.bind(engine);
        for class in SIZE_CLASSES.classes() {
            let list = &mut self.classes[class.index()];
            let objects = core::mem::replace(&mut list.objects, ObjectList::new());
            list.low_water = 0;
            self.bytes -= objects.len() * class.size();
            // Safety: cached objects are free objects of `class` from `engine`.
            unsafe { engine.insert_batch(class, objects) };
        }
        debug_assert_eq!(self.bytes, 0);
        engine.add_allocated(self.sampler.take_unmerged());
        self.publish(engine);
    }

    fn bind(&mut self, engine: &Engine) {
        let addr = engine as *const Engine as usize;
        if self.owner == addr {
            return;
        }
        assert_eq!(self.owner, 0, "fast cache used with a second engine");
        self.owner = addr;
        self.context = engine.next_context();
        let seed = self.context.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (self as *const Self as u64);
        self.sampler = Sampler::new(seed);
    }

    /// Account an allocation of `size` bytes with the sampler. Returns the
    /// sample weight if it should be sampled.
    #[inline]
    pub(crate) fn sample(&mut self, engine: &Engine, size: usize, rate: usize) -> Option<usize> {
        self.bind(engine);
        let weight = self.sampler.sample(size, rate);
        if weight.is_some() || self.sampler.should_merge() {
            engine.add_allocated(self.sampler.take_unmerged());
        }
        weight
    }

    #[inline]
    pub(crate) fn allocate(&mut self, engine: &Engine, class: SizeClass) -> Result<NonNull<u8>, AllocError> {
        self.bind(engine);
        let list = &mut self.classes[class.index()];
        if let Some(obj) = list.objects.pop() {
            list.low_water = list.low_water.min(list.len());
            self.bytes -= class.size();
            return Ok(obj);
        }
        self.refill(engine, class)
    }

    /// ### Safety
    ///
    /// `ptr` must be a free hot object of `class` from `engine`.
    #[inline]
    pub(crate) unsafe fn deallocate(&mut self, engine: &Engine, class: SizeClass, ptr: NonNull<u8>) {
        self.bind(engine);
        let list = &mut self.classes[class.index()];
        list.objects.push(ptr);
        self.bytes += class.size();
        if list.len() > list.max_length {
            self.list_too_long(engine, class);
        }

        let budget = engine.parameters().fast_cache_budget();
        if self.bytes > budget {
            self.scavenge(engine, budget);
        } else if self.bytes.abs_diff(self.published) >= PUBLISH_THRESHOLD {
            self.publish(engine);
        }
    }

    fn batch_size(engine: &Engine, class: SizeClass) -> usize {
        class
            .batch_size()
            .min(engine.parameters().max_batch())
            .max(1)
    }

    fn refill(&mut self, engine: &Engine, class: SizeClass) -> Result<NonNull<u8>, AllocError> {
        let batch = Self::batch_size(engine, class);
        let list = &mut self.classes[class.index()];
        let want = (list.max_length as usize).clamp(1, batch);
        let mut objects = engine.remove_batch(class, want);
        let first = objects.pop().ok_or(AllocError)?;
        self.bytes += objects.len() * class.size();
        list.objects.append(objects);

        let max_length = list.max_length as usize;
        let grown = if max_length < batch {
            max_length + 1
        } else {
            let grown = (max_length + batch).min(MAX_DYNAMIC_LENGTH);
            grown - grown % batch
        };
        list.max_length = grown as u32;

        self.publish(engine);
        Ok(first)
    }

    /// A list went over its length limit: adjust the limit, then give back a
    /// batch, or more if the list is still over the adjusted limit.
    fn list_too_long(&mut self, engine: &Engine, class: SizeClass) {
        let batch = Self::batch_size(engine, class);
        let list = &mut self.classes[class.index()];

        let max_length = list.max_length as usize;
        if max_length < batch {
            list.max_length += 1;
        } else if max_length > batch {
            list.overages += 1;
            if list.overages > MAX_OVERAGES {
                list.max_length -= batch as u32;
                list.overages = 0;
            }
        }

        let excess = list.objects.len().saturating_sub(list.max_length as usize);
        let objects = list.objects.split_front(batch.max(excess));
        list.low_water = list.low_water.min(list.len());
        self.bytes -= objects.len() * class.size();

        // Safety: cached objects are free objects of `class` from `engine`.
        unsafe { engine.insert_batch(class, objects) };
        self.publish(engine);
    }

    /// Shed cached objects until at most `target` bytes are left.
    fn scavenge(&mut self, engine: &Engine, target: usize) {
        let before = self.bytes;
        for class in SIZE_CLASSES.classes() {
            let batch = Self::batch_size(engine, class);
            let list = &mut self.classes[class.index()];
            let low_water = list.low_water as usize;
            if low_water > 0 {
                let objects = list.objects.split_front((low_water / 2).max(1));
                self.bytes -= objects.len() * class.size();
                // Safety: as above.
                unsafe { engine.insert_batch(class, objects) };
                let max_length = list.max_length as usize;
                if max_length > batch {
                    list.max_length = (max_length - batch).max(batch) as u32;
                }
            }
            list.low_water = list.len();
        }

        // Everything was in use recently; halve every list instead.
        while self.bytes > target {
            for class in SIZE_CLASSES.classes() {
                let list = &mut self.classes[class.index()];
                if list.objects.is_empty() {
                    continue;
                }
                let objects = list.objects.split_front(list.objects.len().div_ceil(2));
                list.low_water = list.len();
                self.bytes -= objects.len() * class.size();
                // Safety: as above.
                unsafe { engine.insert_batch(class, objects) };
            }
        }

        event!(
            Trace,
            "scavenged fast cache of context {}: {before} -> {} bytes",
            self.context,
            self.bytes
        );
        engine.publish_cached(self.published, self.bytes);
        self.published = self.bytes;
    }

    /// Tell the engine how many bytes this cache holds. If all caches together
    /// are over their shared budget, shed half of this one.
    fn publish(&mut self, engine: &Engine) {
        let total = engine.publish_cached(self.published, self.bytes);
        self.published = self.bytes;
        if total > engine.parameters().overall_fast_cache_budget() && self.bytes > 0 {
            self.scavenge(engine, self.bytes / 2);
        }
    }
}
