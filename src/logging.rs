//! Re-entrancy-safe logging.
//!
//! Loggers are free to allocate, and when this crate is installed as the
//! global allocator those allocations come straight back into the engine. If
//! the engine logs from inside such an allocation, we would recurse into the
//! logger forever. Every log call in this crate therefore goes through
//! [`event!`], which drops messages emitted while the current thread is already
//! inside a logger.
//!
//! Log calls are never made while an allocator lock is held.

use core::cell::Cell;

std::thread_local! {
    static IN_LOGGER: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` unless the current thread is already running a logging call.
pub(crate) fn guarded(f: impl FnOnce()) {
    let entered = IN_LOGGER
        .try_with(|flag| !flag.replace(true))
        .unwrap_or(false);
    if !entered {
        return;
    }
    f();
    let _ = IN_LOGGER.try_with(|flag| flag.set(false));
}

/// Like `log::log!`, but suppressed when re-entered from within a logger.
macro_rules! event {
    ($level:ident, $($arg:tt)+) => {
        if log::log_enabled!(log::Level::$level) {
            $crate::logging::guarded(|| log::log!(log::Level::$level, $($arg)+));
        }
    };
}
