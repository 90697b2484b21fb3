//! Runtime-tunable engine parameters.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{sampler::SamplingRate, size_class::MAX_BATCH};

/// Default per-context fast cache budget.
pub(crate) const DEFAULT_FAST_CACHE_BUDGET: usize = 4 * 1024 * 1024;

/// Default budget shared by all fast caches.
pub(crate) const DEFAULT_OVERALL_FAST_CACHE_BUDGET: usize = 32 * 1024 * 1024;

/// The tunable parameters of an [`Engine`](crate::Engine).
///
/// Every parameter may be changed at any time from any thread; changes take
/// effect on subsequent operations.
#[derive(Debug)]
pub struct Parameters {
    sampling_rate: AtomicUsize,
    fast_cache_budget: AtomicUsize,
    overall_fast_cache_budget: AtomicUsize,
    max_batch: AtomicUsize,
    background_release_rate: AtomicUsize,
    memory_limit: AtomicUsize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameters {
    /// The default parameters.
    pub const fn new() -> Self {
        Parameters {
            sampling_rate: AtomicUsize::new(SamplingRate::DEFAULT.0),
            fast_cache_budget: AtomicUsize::new(DEFAULT_FAST_CACHE_BUDGET),
            overall_fast_cache_budget: AtomicUsize::new(DEFAULT_OVERALL_FAST_CACHE_BUDGET),
            max_batch: AtomicUsize::new(MAX_BATCH),
            background_release_rate: AtomicUsize::new(0),
            memory_limit: AtomicUsize::new(0),
        }
    }

    /// The mean number of bytes between sampled allocations.
    #[inline]
    pub fn sampling_rate(&self) -> SamplingRate {
        SamplingRate(self.sampling_rate.load(Ordering::Relaxed))
    }

    /// Set the sampling rate. [`SamplingRate::NEVER`] disables sampling and
    /// [`SamplingRate::ALWAYS`] samples every allocation.
    pub fn set_sampling_rate(&self, rate: SamplingRate) {
        let old = self.sampling_rate.swap(rate.0, Ordering::Relaxed);
        if old != rate.0 {
            event!(Info, "sampling rate changed from {old} to {} bytes", rate.0);
        }
    }

    /// The byte budget of each execution context's fast cache.
    #[inline]
    pub fn fast_cache_budget(&self) -> usize {
        self.fast_cache_budget.load(Ordering::Relaxed)
    }

    /// Set the byte budget of each execution context's fast cache.
    pub fn set_fast_cache_budget(&self, bytes: usize) {
        self.fast_cache_budget.store(bytes, Ordering::Relaxed);
        event!(Info, "fast cache budget set to {bytes} bytes");
    }

    /// The byte budget shared by all fast caches.
    #[inline]
    pub fn overall_fast_cache_budget(&self) -> usize {
        self.overall_fast_cache_budget.load(Ordering::Relaxed)
    }

    /// Set the byte budget shared by all fast caches.
    pub fn set_overall_fast_cache_budget(&self, bytes: usize) {
        self.overall_fast_cache_budget
            .store(bytes, Ordering::Relaxed);
        event!(Info, "overall fast cache budget set to {bytes} bytes");
    }

    /// The most objects moved between a fast cache and a central list at once.
    #[inline]
    pub fn max_batch(&self) -> usize {
        self.max_batch.load(Ordering::Relaxed)
    }

    /// Set the most objects moved between a fast cache and a central list at
    /// once. Clamped to `1..=32`.
    pub fn set_max_batch(&self, objects: usize) {
        let objects = objects.clamp(1, MAX_BATCH);
        self.max_batch.store(objects, Ordering::Relaxed);
        event!(Info, "transfer batch limit set to {objects} objects");
    }

    /// Bytes per second a [`BackgroundReleaser`](crate::BackgroundReleaser)
    /// returns to the OS. Zero disables background release.
    #[inline]
    pub fn background_release_rate(&self) -> usize {
        self.background_release_rate.load(Ordering::Relaxed)
    }

    /// Set the background release rate in bytes per second.
    pub fn set_background_release_rate(&self, bytes_per_second: usize) {
        self.background_release_rate
            .store(bytes_per_second, Ordering::Relaxed);
        event!(Info, "background release rate set to {bytes_per_second} bytes/s");
    }

    /// The soft limit on physical heap bytes. Zero means unlimited.
    #[inline]
    pub fn memory_limit(&self) -> usize {
        self.memory_limit.load(Ordering::Relaxed)
    }

    /// Set the soft limit on physical heap bytes. When growing the heap would
    /// exceed it, free pages are released first and the growth fails if that
    /// is not enough. Zero means unlimited.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.memory_limit.store(bytes, Ordering::Relaxed);
        event!(Info, "memory limit set to {bytes} bytes");
    }
}
