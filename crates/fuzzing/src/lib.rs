//! Shared fuzzing and testing infrastructure for `spanmalloc`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use spanmalloc::{Engine, FastCache, FreeHint, HotCold, Request, SamplingRate, DEFAULT_ALIGNMENT};
use std::{collections::BTreeMap, ptr::NonNull};

/// The layout of a test allocation.
//
// Note: `std::alloc::Layout` cannot get a default mutator because of the
// orphan rules, and it does not implement bincode's traits either.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct Layout {
    size: usize,
    align: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self { size: 0, align: 1 }
    }
}

impl Layout {
    /// Create a new `Layout` from the given size and alignment.
    pub fn new(size: usize, align: usize) -> Option<Self> {
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        Some(Layout {
            size: layout.size(),
            align: layout.align(),
        })
    }

    /// Like `Layout::new(...).unwrap()`.
    pub fn unwrap_new(size: usize, align: usize) -> Self {
        Self::new(size, align).expect("Layout::unwrap_new on bad size/align")
    }
}

impl DefaultMutate for Layout {
    type DefaultMutate = LayoutMutator;
}

/// A mutator for `Layout`s with configurable maximums for size and alignment.
///
/// Half of the generated layouts are small (at most `small_size` bytes), so
/// that the per-class paths see as much traffic as the page-level ones.
#[derive(Debug)]
pub struct LayoutMutator {
    pub small_size: usize,
    pub max_size: usize,
    pub max_align: usize,
}

impl Default for LayoutMutator {
    fn default() -> Self {
        Self {
            small_size: 1024,
            max_size: 320 * 1024,
            max_align: 64 * 1024,
        }
    }
}

fn round_down_to_pow2(x: usize) -> usize {
    if x == 0 {
        1
    } else {
        1 << (usize::BITS - 1 - x.leading_zeros())
    }
}

impl Mutate<Layout> for LayoutMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        layout: &mut Layout,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                layout.size
            } else {
                self.max_size
            };
            layout.size = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max_align_log2 = if ctx.shrink() {
                layout.align.trailing_zeros() as usize
            } else {
                self.max_align.trailing_zeros() as usize
            };
            let align_log2 = ctx.rng().gen_index(max_align_log2 + 1).unwrap();
            layout.align = 1 << align_log2;
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Layout> for LayoutMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Layout> {
        let max_size = if context.rng().gen_bool() {
            self.small_size
        } else {
            self.max_size
        };
        let size = m::range(0..=max_size).generate(context)?;
        let align = m::range(1..=self.max_align).generate(context)?;
        let align = round_down_to_pow2(align);
        Ok(Layout { size, align })
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Allocate `layout` with the given placement hint.
    Alloc { id: u32, layout: Layout, hot_cold: u8 },
    /// Free without a hint.
    Free { id: u32 },
    /// Free with the requested size and, optionally, the alignment. The
    /// alignment is always passed when it exceeds the default.
    SizedFree { id: u32, with_align: bool },
    /// Resize to `layout.size` bytes, keeping the original alignment.
    Realloc { id: u32, layout: Layout },
    /// Switch between sampling every allocation and the default rate.
    Sample { always: bool },
    /// Flush the fast cache and release up to `release` bytes to the OS.
    Trim { release: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                    hot_cold: m::range(0..=u8::MAX).generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::SizedFree {
                    id: ctx.rng().gen_u32(),
                    with_align: ctx.rng().gen_bool(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Sample {
                    always: ctx.rng().gen_bool(),
                })
            },
            |ctx| {
                Ok(Op::Trim {
                    release: m::range(0..=1_u32 << 20).generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Free { id }
                    | Op::SizedFree { id, .. }
                    | Op::Realloc { id, .. } => {
                        *id = new_id;
                    }
                    Op::Sample { .. } | Op::Trim { .. } => {}
                }
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_op = if ctx.rng().gen_bool() {
                        Op::Free { id }
                    } else {
                        Op::SizedFree {
                            id,
                            with_align: ctx.rng().gen_bool(),
                        }
                    };
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, free_op);
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let layout = m::default::<Layout>().generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Realloc { id, layout });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// The engine shared by every run of [`Ops::run`].
static ENGINE: Engine = Engine::new();

/// The bincode configuration [`Ops`] are serialized with in fuzzer inputs.
pub const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Ops {
    /// Decode ops from a fuzzer input.
    pub fn decode(data: &[u8]) -> Option<Self> {
        bincode::decode_from_slice(data, bincode_config())
            .ok()
            .map(|(ops, _)| ops)
    }

    /// Encode these ops into `out`, dropping ops off the end until they fit.
    /// Returns the encoded length, or `None` if not even an empty sequence
    /// fits.
    pub fn encode_truncating(&mut self, out: &mut [u8]) -> Option<usize> {
        loop {
            if let Ok(len) = bincode::encode_into_slice(&*self, &mut *out, bincode_config()) {
                return Some(len);
            }
            if !self.pop() {
                return None;
            }
        }
    }

    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation. Returns `false` if there was none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit, on an
    /// engine shared between runs and a fresh fast cache.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        ENGINE
            .parameters()
            .set_sampling_rate(SamplingRate::DEFAULT);
        let mut cache = FastCache::new();
        let result = self.run_with_engine(&ENGINE, &mut cache, allocation_limit);
        cache.flush(&ENGINE);
        result
    }

    /// Run these test operations on `engine` through `cache`, with the given
    /// allocation limit.
    pub fn run_with_engine(
        &self,
        engine: &Engine,
        cache: &mut FastCache,
        allocation_limit: usize,
    ) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc {
                    id,
                    layout,
                    hot_cold,
                } => {
                    if live.beyond_allocation_limit(layout.size) {
                        continue;
                    }
                    if let Some(old) = live.remove(id) {
                        free(engine, cache, id, old, FreeHint::NONE)?;
                    }

                    let hot_cold = HotCold(hot_cold);
                    let request = Request::new(layout.size, layout.align).with_hot_cold(hot_cold);
                    if let Ok(allocation) = engine.allocate(Some(&mut *cache), request) {
                        let alloc = LiveAlloc {
                            ptr: allocation.ptr,
                            capacity: allocation.size,
                            size: layout.size,
                            align: layout.align,
                            hot_cold,
                        };
                        log::debug!("new allocation: id{id} -> {alloc:?}");

                        ensure!(
                            engine.good_size(layout.size, layout.align) == Some(alloc.capacity),
                            "capacity of a new allocation differs from `good_size`",
                        );
                        check_live(engine, &live, &alloc)?;
                        fill(&alloc, id);
                        live.insert(id, alloc);
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(id) {
                        free(engine, cache, id, alloc, FreeHint::NONE)?;
                    }
                }

                Op::SizedFree { id, with_align } => {
                    if let Some(alloc) = live.remove(id) {
                        let hint = if with_align || alloc.align > DEFAULT_ALIGNMENT {
                            FreeHint::aligned(Some(alloc.size), alloc.align)
                        } else {
                            FreeHint::sized(alloc.size)
                        };
                        free(engine, cache, id, alloc, hint)?;
                    }
                }

                Op::Realloc { id, layout } => {
                    let Some(old) = live.remove(id) else {
                        continue;
                    };
                    if live.beyond_allocation_limit(layout.size) {
                        live.insert(id, old);
                        continue;
                    }
                    check_contents(&old, id, old.size)?;

                    let hint = FreeHint::aligned(Some(old.size), old.align);
                    let request = Request::new(layout.size, old.align).with_hot_cold(old.hot_cold);
                    match unsafe { engine.reallocate(Some(&mut *cache), old.ptr, hint, request) } {
                        Ok(allocation) => {
                            let alloc = LiveAlloc {
                                ptr: allocation.ptr,
                                capacity: allocation.size,
                                size: layout.size,
                                ..old
                            };
                            log::debug!("resized allocation: id{id} -> {alloc:?}");

                            check_live(engine, &live, &alloc)?;
                            check_contents(&alloc, id, old.size.min(alloc.size))
                                .map_err(|e| format!("{e} (contents lost while resizing)"))?;
                            fill(&alloc, id);
                            live.insert(id, alloc);
                        }
                        Err(_) => {
                            // Resizing failed; the old allocation is untouched.
                            live.insert(id, old);
                        }
                    }
                }

                Op::Sample { always } => {
                    let rate = if always {
                        SamplingRate::ALWAYS
                    } else {
                        SamplingRate::DEFAULT
                    };
                    engine.parameters().set_sampling_rate(rate);
                }

                Op::Trim { release } => {
                    cache.flush(engine);
                    engine.release(release as usize);
                }
            }
        }

        // Finally, free any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            free(engine, cache, id, alloc, FreeHint::NONE)?;
        }

        let stats = engine.stats();
        ensure!(
            stats.pageheap_free_bytes + stats.pageheap_unmapped_bytes <= stats.system_bytes,
            "page heap holds more free bytes than it ever obtained",
        );

        Ok(())
    }
}

/// The byte a live allocation is filled with.
fn pattern(id: u32) -> u8 {
    (id as u8) | 0x80
}

const FREE_POISON_PATTERN: u8 = 0xFF;

/// Fill all of an allocation's capacity with its id's pattern.
fn fill(alloc: &LiveAlloc, id: u32) {
    unsafe { alloc.ptr.as_ptr().write_bytes(pattern(id), alloc.capacity) };
}

/// Check that the first `len` bytes of an allocation still hold its pattern.
fn check_contents(alloc: &LiveAlloc, id: u32, len: usize) -> Result<(), String> {
    let slice = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), len) };
    ensure!(
        slice.iter().all(|b| *b == pattern(id)),
        "bytes of live allocation id{id} were overwritten",
    );
    Ok(())
}

/// Check the properties every live allocation has.
fn check_live(engine: &Engine, live: &LiveMap, alloc: &LiveAlloc) -> Result<(), String> {
    let start = alloc.ptr.as_ptr() as usize;
    ensure!(
        start % alloc.align == 0,
        "allocation at {start:#x} is not aligned to {}",
        alloc.align,
    );
    ensure!(
        alloc.size <= alloc.capacity,
        "capacity {} is less than the requested size {}",
        alloc.capacity,
        alloc.size,
    );
    ensure!(
        engine.allocated_size(alloc.ptr.as_ptr()) == Some(alloc.capacity),
        "`allocated_size` disagrees with the capacity handed out",
    );
    ensure!(
        engine.is_cold(alloc.ptr.as_ptr()) == alloc.hot_cold.is_cold(),
        "allocation placed in the wrong partition for hint {:?}",
        alloc.hot_cold,
    );

    let end = start + alloc.capacity;
    for other in live.map.values() {
        let other_start = other.ptr.as_ptr() as usize;
        let other_end = other_start + other.capacity;
        ensure!(
            end <= other_start || other_end <= start,
            "two distinct live allocations should never overlap",
        );
    }
    Ok(())
}

fn free(
    engine: &Engine,
    cache: &mut FastCache,
    id: u32,
    alloc: LiveAlloc,
    hint: FreeHint,
) -> Result<(), String> {
    log::debug!("freeing id{id} -> {alloc:?} with {hint:?}");
    check_contents(&alloc, id, alloc.size)?;
    unsafe {
        alloc.ptr.as_ptr().write_bytes(FREE_POISON_PATTERN, alloc.capacity);
        engine.deallocate(Some(cache), alloc.ptr, hint);
    }
    Ok(())
}

/// A currently-live allocation.
#[derive(Clone, Copy)]
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// The usable capacity handed out.
    capacity: usize,
    /// Requested size at allocation (or last resize) time.
    size: usize,
    /// Requested alignment at allocation time.
    align: usize,
    hot_cold: HotCold,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc {
            ptr,
            capacity,
            size,
            align,
            hot_cold,
        } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("capacity", &capacity)
            .field("size", &size)
            .field("align", &align)
            .field("hot_cold", &hot_cold.0)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    ///
    /// Note: this is a sum of the requested allocation sizes, and does not
    /// include the extra capacity the allocator handed out.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and free old entries before adding new ones"
        );
    }

    /// Remove a live allocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }
}
