//! Allocation sampling.
//!
//! Each execution context owns a [`Sampler`] that counts down the bytes it has
//! allocated until the next sample. Distances between samples are drawn from
//! an exponential distribution whose mean is the sampling rate, so whether an
//! allocation is sampled depends on how many bytes were allocated, not on how
//! many calls were made.

use crate::frontend::HotCold;

/// How often allocations are sampled, as a mean number of bytes between
/// samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SamplingRate(pub usize);

impl SamplingRate {
    /// Never sample.
    pub const NEVER: SamplingRate = SamplingRate(0);

    /// Sample every allocation.
    pub const ALWAYS: SamplingRate = SamplingRate(1);

    /// The default rate: on average one sample per 2 MiB allocated.
    pub const DEFAULT: SamplingRate = SamplingRate(2 * 1024 * 1024);

    /// The mean number of bytes between samples.
    #[inline]
    pub fn bytes(self) -> usize {
        self.0
    }
}

impl Default for SamplingRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What is known about a sampled allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    /// The size the caller asked for.
    pub requested_size: usize,
    /// The usable capacity handed out.
    pub allocated_size: usize,
    /// The alignment the caller asked for.
    pub align: usize,
    /// The placement hint the caller gave.
    pub hot_cold: HotCold,
    /// The execution context that made the allocation, or `0` if it was made
    /// without a fast cache.
    pub context: u64,
    /// The number of allocated bytes this sample stands for.
    pub weight: usize,
}

/// Per-context allocated-bytes totals are merged into the engine at least this
/// often.
pub(crate) const MERGE_INTERVAL: usize = 1024 * 1024;

const PRNG_MULT: u64 = 0x5_DEEC_E66D;
const PRNG_ADD: u64 = 0xB;
const PRNG_MASK: u64 = (1 << 48) - 1;
const PRNG_Q_BITS: u32 = 26;

#[derive(Debug)]
pub(crate) struct Sampler {
    /// Bytes left before the next sample.
    bytes_until_sample: usize,
    /// The rate `bytes_until_sample` was drawn with.
    rate: usize,
    /// 48-bit LCG state.
    rnd: u64,
    /// Bytes allocated since the last merge into the engine's total.
    unmerged: usize,
}

impl Sampler {
    pub(crate) const fn new(seed: u64) -> Self {
        Sampler {
            bytes_until_sample: 0,
            rate: 0,
            rnd: seed & PRNG_MASK,
            unmerged: 0,
        }
    }

    /// Account an allocation of `size` bytes. Returns the sample's weight if
    /// this allocation should be sampled.
    #[inline]
    pub(crate) fn sample(&mut self, size: usize, rate: usize) -> Option<usize> {
        let size = size.max(1);
        self.unmerged = self.unmerged.saturating_add(size);
        match rate {
            0 => return None,
            1 => return Some(size),
            _ => {}
        }
        if rate != self.rate {
            self.rate = rate;
            self.bytes_until_sample = self.next_interval();
        }
        if size < self.bytes_until_sample {
            self.bytes_until_sample -= size;
            return None;
        }
        self.bytes_until_sample = self.next_interval();
        Some(weight(size, rate))
    }

    /// Whether enough bytes have accumulated to merge them into the engine.
    #[inline]
    pub(crate) fn should_merge(&self) -> bool {
        self.unmerged >= MERGE_INTERVAL
    }

    /// Take the bytes allocated since the last call.
    pub(crate) fn take_unmerged(&mut self) -> usize {
        core::mem::take(&mut self.unmerged)
    }

    fn next_random(&mut self) -> u64 {
        self.rnd = self.rnd.wrapping_mul(PRNG_MULT).wrapping_add(PRNG_ADD) & PRNG_MASK;
        self.rnd
    }

    /// Draw an exponentially distributed distance with mean `self.rate`.
    fn next_interval(&mut self) -> usize {
        // A uniform value in (0, 1].
        let q = (self.next_random() >> (48 - PRNG_Q_BITS)) + 1;
        let u = q as f64 / (1_u64 << PRNG_Q_BITS) as f64;
        let interval = -u.ln() * self.rate as f64;
        // `as` saturates.
        (interval as usize).max(1)
    }
}

/// An allocation of `size` bytes is sampled with probability
/// `1 - exp(-size / rate)`; weighting it by the inverse keeps the sum of
/// weights an unbiased estimate of the bytes allocated.
fn weight(size: usize, rate: usize) -> usize {
    let size = size as f64;
    let p = 1.0 - (-size / rate as f64).exp();
    if p <= 0.0 {
        return rate;
    }
    (size / p) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_and_always() {
        let mut sampler = Sampler::new(1);
        for _ in 0..10_000 {
            assert_eq!(sampler.sample(64, SamplingRate::NEVER.bytes()), None);
        }
        for size in [0, 1, 64, 1 << 20] {
            assert_eq!(
                sampler.sample(size, SamplingRate::ALWAYS.bytes()),
                Some(size.max(1))
            );
        }
    }

    #[test]
    fn sampled_fraction_tracks_bytes_not_calls() {
        let rate = 64 * 1024;
        for size in [16, 1024] {
            let mut sampler = Sampler::new(0x1234);
            let total = 64 * 1024 * 1024;
            let mut samples = 0;
            let mut weight = 0;
            for _ in 0..total / size {
                if let Some(w) = sampler.sample(size, rate) {
                    samples += 1;
                    weight += w;
                }
            }
            let expected = total / rate;
            assert!(
                samples > expected * 8 / 10 && samples < expected * 12 / 10,
                "size {size}: {samples} samples, expected about {expected}"
            );
            assert!(weight > total * 8 / 10 && weight < total * 12 / 10);
        }
    }

    #[test]
    fn merges_every_mebibyte() {
        let mut sampler = Sampler::new(7);
        sampler.sample(MERGE_INTERVAL - 1, 0);
        assert!(!sampler.should_merge());
        sampler.sample(1, 0);
        assert!(sampler.should_merge());
        assert_eq!(sampler.take_unmerged(), MERGE_INTERVAL);
        assert!(!sampler.should_merge());
    }

    #[test]
    fn large_allocations_are_weighted_by_their_size() {
        let rate = 1024;
        assert!(weight(1 << 20, rate) >= 1 << 20);
        assert!(weight(1, rate) >= rate - 1);
    }
}
