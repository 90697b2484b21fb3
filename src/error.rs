//! Usage errors and process termination.

use std::io::Write;

/// An invalid free.
///
/// These always terminate the process: they mean the heap may already be
/// corrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// The size passed to a sized free is outside the sizes the allocation
    /// could have been requested with.
    #[error("free of {ptr:#x} with size {size}, but its size is in {min}..={max}")]
    SizeOutOfRange {
        /// The freed address.
        ptr: usize,
        /// The size passed to the free.
        size: usize,
        /// The smallest accepted size.
        min: usize,
        /// The largest accepted size.
        max: usize,
    },

    /// The alignment passed to an aligned free is not one the allocation
    /// could have been requested with.
    #[error("free of {ptr:#x} with alignment {align}, which it was not allocated with")]
    AlignmentMismatch {
        /// The freed address.
        ptr: usize,
        /// The alignment passed to the free.
        align: usize,
    },

    /// The pointer was not handed out by this allocator.
    #[error("free of {ptr:#x}, which was not allocated by this allocator")]
    ForeignPointer {
        /// The freed address.
        ptr: usize,
    },

    /// The pointer is a page-level allocation that was already freed.
    #[error("double free of {ptr:#x}")]
    DoubleFree {
        /// The freed address.
        ptr: usize,
    },
}

/// Report a usage error and abort the process.
#[cold]
pub(crate) fn fatal(err: UsageError) -> ! {
    // Stderr is unbuffered, so this does not allocate.
    let _ = writeln!(std::io::stderr(), "spanmalloc: fatal: {err}");
    event!(Error, "{err}");
    std::process::abort()
}

/// Report that an abort-on-failure allocation could not be satisfied and
/// abort the process.
#[cold]
pub(crate) fn out_of_memory(size: usize, align: usize) -> ! {
    let _ = writeln!(
        std::io::stderr(),
        "spanmalloc: out of memory allocating {size} bytes aligned to {align}"
    );
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = UsageError::SizeOutOfRange {
            ptr: 0x1000,
            size: 9,
            min: 10,
            max: 16,
        };
        assert_eq!(
            err.to_string(),
            "free of 0x1000 with size 9, but its size is in 10..=16"
        );
        assert_eq!(
            UsageError::DoubleFree { ptr: 0x2000 }.to_string(),
            "double free of 0x2000"
        );
    }
}
