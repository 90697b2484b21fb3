#![no_main]

//! Random sequences of allocations, sized and unsized frees, resizes, sampling
//! switches and trims against a shared engine, checking the engine's
//! invariants after every step.

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use spanmalloc_fuzzing::Ops;

/// Requested bytes that may be live at once.
const LIVE_BYTES: usize = 4 << 20;

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Plain byte-level mutation one time in eight.
    if seed % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = Ops::decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }
    match ops.encode_truncating(data) {
        Some(len) => len,
        None => fuzzer_mutate(data, size, max_size),
    }
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = Ops::decode(data) else {
        return;
    };
    if let Err(failure) = ops.run(LIVE_BYTES) {
        panic!("{failure}");
    }
});
