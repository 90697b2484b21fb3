#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;

#[macro_use]
mod logging;

mod central_free_list;
mod engine;
mod error;
mod fast_cache;
pub mod frontend;
mod lock;
mod metadata;
mod object_list;
mod page_heap;
mod page_map;
mod pages;
mod params;
mod release;
mod sampler;
mod size_class;
mod span;
mod stats;
mod system;

pub use engine::{Engine, FreeHint, Request};
pub use error::UsageError;
pub use fast_cache::FastCache;
pub use frontend::{FailurePolicy, HotCold, SizedPtr, SpanMalloc};
pub use pages::{PAGE_SHIFT, PAGE_SIZE};
pub use params::Parameters;
pub use release::BackgroundReleaser;
pub use sampler::{AllocationRecord, SamplingRate};
pub use size_class::{
    SizeClass, SizeClassTable, DEFAULT_ALIGNMENT, MAX_ALIGNMENT, MAX_SMALL_SIZE,
};
pub use stats::Stats;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
