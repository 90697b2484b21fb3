//! Heap accounting snapshots, numeric properties and the text report.

use core::fmt;

use crate::{params::Parameters, system};

/// A snapshot of an engine's accounting.
///
/// The counters are gathered one layer at a time, so under concurrent traffic
/// a snapshot may mix slightly different moments; every single counter is
/// exact for its layer. Fast cache bytes are published lazily by each cache
/// and may lag behind by a few KiB per execution context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes of pages the page heap obtained from the OS.
    pub system_bytes: usize,
    /// Bytes in free spans that are backed by physical memory.
    pub pageheap_free_bytes: usize,
    /// Bytes in free spans whose physical memory was released to the OS.
    pub pageheap_unmapped_bytes: usize,
    /// The part of `pageheap_free_bytes` in the cold partition.
    pub pageheap_cold_free_bytes: usize,
    /// The part of `pageheap_unmapped_bytes` in the cold partition.
    pub pageheap_cold_unmapped_bytes: usize,
    /// Bytes of free objects held by the central free lists.
    pub central_cache_free_bytes: usize,
    /// Bytes of free objects held by fast caches.
    pub fast_cache_free_bytes: usize,
    /// Bytes used by span records and the page map.
    pub metadata_bytes: usize,
    /// Bytes mapped from the OS for any purpose.
    pub os_bytes_allocated: usize,
    /// Span records in use.
    pub spans: usize,
    /// Live sampled allocations.
    pub sampled_objects: usize,
    /// Capacity of the live sampled allocations.
    pub sampled_bytes: usize,
    /// Bytes allocated over the engine's lifetime.
    pub total_allocated_bytes: u64,
}

impl Stats {
    /// Bytes handed out to the application (including internal
    /// fragmentation).
    pub fn current_allocated_bytes(&self) -> usize {
        self.system_bytes
            .saturating_sub(self.pageheap_free_bytes)
            .saturating_sub(self.pageheap_unmapped_bytes)
            .saturating_sub(self.central_cache_free_bytes)
            .saturating_sub(self.fast_cache_free_bytes)
    }

    /// Bytes of heap backed by physical memory.
    pub fn heap_size(&self) -> usize {
        self.system_bytes
            .saturating_sub(self.pageheap_unmapped_bytes)
    }

    pub(crate) fn property(&self, params: &Parameters, key: &str) -> Option<usize> {
        let value = match key {
            "generic.current_allocated_bytes" => self.current_allocated_bytes(),
            "generic.heap_size" => self.heap_size(),
            "spanmalloc.pageheap_free_bytes" => self.pageheap_free_bytes,
            "spanmalloc.pageheap_unmapped_bytes" => self.pageheap_unmapped_bytes,
            "spanmalloc.pageheap_cold_free_bytes" => self.pageheap_cold_free_bytes,
            "spanmalloc.pageheap_cold_unmapped_bytes" => self.pageheap_cold_unmapped_bytes,
            "spanmalloc.central_cache_free_bytes" => self.central_cache_free_bytes,
            "spanmalloc.fast_cache_free_bytes" => self.fast_cache_free_bytes,
            "spanmalloc.metadata_bytes" => self.metadata_bytes,
            "spanmalloc.system_bytes" => self.system_bytes,
            "spanmalloc.sampled_objects" => self.sampled_objects,
            "spanmalloc.sampled_bytes" => self.sampled_bytes,
            "spanmalloc.total_allocated_bytes" => {
                usize::try_from(self.total_allocated_bytes).unwrap_or(usize::MAX)
            }
            "spanmalloc.sampling_rate" => params.sampling_rate().bytes(),
            "spanmalloc.fast_cache_budget" => params.fast_cache_budget(),
            "spanmalloc.overall_fast_cache_budget" => params.overall_fast_cache_budget(),
            "spanmalloc.memory_limit" => params.memory_limit(),
            _ => return None,
        };
        Some(value)
    }
}

const MIB: f64 = 1024.0 * 1024.0;

fn row(f: &mut fmt::Formatter<'_>, bytes: usize, what: &str) -> fmt::Result {
    writeln!(
        f,
        "MALLOC: {bytes:>14} ({:>9.1} MiB) {what}",
        bytes as f64 / MIB
    )
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------------------------------------------------")?;
        row(f, self.current_allocated_bytes(), "Bytes in use by application")?;
        row(f, self.pageheap_free_bytes, "Bytes in page heap freelist")?;
        row(f, self.central_cache_free_bytes, "Bytes in central cache freelist")?;
        row(f, self.fast_cache_free_bytes, "Bytes in fast cache freelists")?;
        row(f, self.metadata_bytes, "Bytes in malloc metadata")?;
        writeln!(f, "MALLOC:   ------------")?;
        row(f, self.heap_size(), "Actual memory used (physical + swap)")?;
        row(f, self.pageheap_unmapped_bytes, "Bytes released to OS (aka unmapped)")?;
        writeln!(f, "MALLOC:   ------------")?;
        row(f, self.system_bytes, "Virtual address space used")?;
        writeln!(f, "MALLOC:")?;
        writeln!(f, "MALLOC: {:>14}              Spans in use", self.spans)?;
        writeln!(
            f,
            "MALLOC: {:>14}              Sampled objects ({} bytes)",
            self.sampled_objects, self.sampled_bytes
        )?;
        writeln!(
            f,
            "MALLOC: {:>14}              Bytes allocated over lifetime",
            self.total_allocated_bytes
        )?;
        writeln!(f, "------------------------------------------------")?;
        writeln!(
            f,
            "Cold partition: {} bytes free, {} bytes unmapped",
            self.pageheap_cold_free_bytes, self.pageheap_cold_unmapped_bytes
        )?;
        writeln!(f, "------------------------------------------------")?;
        writeln!(f, "{}: {} bytes allocated", system::NAME, self.os_bytes_allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Stats {
        Stats {
            system_bytes: 10 << 20,
            pageheap_free_bytes: 2 << 20,
            pageheap_unmapped_bytes: 1 << 20,
            central_cache_free_bytes: 4096,
            fast_cache_free_bytes: 8192,
            os_bytes_allocated: 11 << 20,
            ..Stats::default()
        }
    }

    #[test]
    fn derived_counters() {
        let stats = sample();
        assert_eq!(stats.current_allocated_bytes(), (7 << 20) - 4096 - 8192);
        assert_eq!(stats.heap_size(), 9 << 20);
        assert_eq!(Stats::default().current_allocated_bytes(), 0);
    }

    #[test]
    fn properties() {
        let stats = sample();
        let params = Parameters::new();
        assert_eq!(
            stats.property(&params, "generic.current_allocated_bytes"),
            Some(stats.current_allocated_bytes())
        );
        assert_eq!(
            stats.property(&params, "spanmalloc.pageheap_unmapped_bytes"),
            Some(1 << 20)
        );
        assert_eq!(
            stats.property(&params, "spanmalloc.sampling_rate"),
            Some(params.sampling_rate().bytes())
        );
        assert_eq!(stats.property(&params, "generic.bogus"), None);
    }

    #[test]
    fn report_ends_with_the_os_allocator_line() {
        let report = sample().to_string();
        assert!(report.contains("Bytes in use by application"));
        assert_eq!(
            report.lines().last(),
            Some(format!("MmapSysAllocator: {} bytes allocated", 11 << 20).as_str())
        );
    }
}
