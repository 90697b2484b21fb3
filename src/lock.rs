//! A mutex container for the engine's internal state, parameterized over any
//! type `L` that implements the `Lock` trait.
//!
//! Locking never allocates and never poisons, and every mutex is
//! const-constructible so that it can live in the global engine.

use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A trait for providing mutual exclusion.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then this method must provide
///   actual mutual exclusion and prevent against unsynchronized accesses.
///
/// * The implementation must never allocate memory.
pub(crate) unsafe trait Lock {
    /// Lock this mutex, waiting until it is available.
    fn lock(&self);

    /// Attempt to lock this mutex without waiting.
    fn try_lock(&self) -> bool;

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A test-and-test-and-set spin lock that yields to the scheduler when
/// contended for a while.
#[derive(Debug)]
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const SPINS_BEFORE_YIELD: u32 = 64;

    pub(crate) const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        let mut spins = 0;
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                if spins < Self::SPINS_BEFORE_YIELD {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub(crate) struct Mutex<T, L = SpinLock> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T> Mutex<T, SpinLock> {
    pub(crate) const fn new(value: T) -> Self {
        Mutex {
            lock: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a, T, L = SpinLock>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_is_held_until_the_guard_drops() {
        let mutex = Mutex::new(5);
        let guard = mutex.lock();
        assert!(!mutex.lock.try_lock());
        drop(guard);
        assert!(mutex.lock.try_lock());
        mutex.lock.unlock();
        assert_eq!(*mutex.lock(), 5);
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let mutex = Arc::new(Mutex::new(0_usize));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 40_000);
    }
}
