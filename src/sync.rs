//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections plus two lock types for thread code.
//!
//! - [`Spinlock`] busy-waits and never touches the scheduler. Usable from
//!   interrupt context as long as the holder cannot be preempted by the
//!   waiter.
//! - [`Mutex`] gives the CPU away while the lock is held elsewhere. It may
//!   yield, so it must not be taken from an interrupt handler.
//!
//! Both use one `AtomicBool` lock word: claimed with an Acquire
//! compare-exchange, released with a Release store.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// On the target this is `cortex-m`'s single-core implementation; host
/// builds use the `critical-section` std implementation.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

// ---------------------------------------------------------------------------
// Lock word
// ---------------------------------------------------------------------------

struct LockWord(AtomicBool);

impl LockWord {
    const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    fn try_claim(&self) -> bool {
        self.0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    fn is_held(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Spinlock
// ---------------------------------------------------------------------------

pub struct Spinlock<T> {
    word: LockWord,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by the lock word.
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            word: LockWord::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Spin until the lock is ours.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while !self.word.try_claim() {
            while self.word.is_held() {
                core::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        // A spurious failure of the weak exchange is retried; a held lock is not
        loop {
            if self.word.try_claim() {
                return Some(SpinlockGuard { lock: self });
            }
            if self.word.is_held() {
                return None;
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.is_held()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.word.release();
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// What a waiting thread does between attempts.
pub trait Relax {
    fn relax();
}

/// Give the rest of the slice to another thread.
pub struct Reschedule;

impl Relax for Reschedule {
    #[inline]
    fn relax() {
        crate::kernel::reschedule();
    }
}

/// Busy-wait.
pub struct Spin;

impl Relax for Spin {
    #[inline]
    fn relax() {
        core::hint::spin_loop();
    }
}

/// Cooperative mutex: a contended `lock` yields the CPU and retries.
/// With the default `Reschedule`, a contended `lock` between
/// `suspend_scheduler` and `resume_scheduler` panics rather than spin.
///
/// # Usage
/// ```ignore
/// static UART: Mutex<Option<Uart>> = Mutex::new(None);
///
/// let mut uart = UART.lock();
/// ```
pub struct Mutex<T, R: Relax = Reschedule> {
    word: LockWord,
    value: UnsafeCell<T>,
    _relax: PhantomData<fn() -> R>,
}

// SAFETY: access to `value` is serialized by the lock word.
unsafe impl<T: Send, R: Relax> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Relax> Send for Mutex<T, R> {}

impl<T, R: Relax> Mutex<T, R> {
    pub const fn new(value: T) -> Self {
        Self {
            word: LockWord::new(),
            value: UnsafeCell::new(value),
            _relax: PhantomData,
        }
    }

    /// Acquire the lock, relaxing between attempts. Not for interrupt
    /// context.
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            R::relax();
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        loop {
            if self.word.try_claim() {
                return Some(MutexGuard { mutex: self });
            }
            if self.word.is_held() {
                return None;
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.is_held()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct MutexGuard<'a, T, R: Relax> {
    mutex: &'a Mutex<T, R>,
}

impl<T, R: Relax> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, R: Relax> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T, R: Relax> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        self.mutex.word.release();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    struct Yield;

    impl Relax for Yield {
        fn relax() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_critical_section_returns_value() {
        let value = critical_section(|_cs| 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_spinlock_guard_releases() {
        let lock = Spinlock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock().unwrap(), 6);
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    fn test_spinlock_contention() {
        let lock = Arc::new(Spinlock::new(0u64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_mutex_contention_with_relax() {
        let mutex: Arc<Mutex<Vec<usize>, Yield>> = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<_> = (0..4)
            .map(|id| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        mutex.lock().push(id);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let values = mutex.lock();
        assert_eq!(values.len(), 4_000);
        for id in 0..4 {
            assert_eq!(values.iter().filter(|&&v| v == id).count(), 1_000);
        }
    }

    #[test]
    fn test_mutex_try_lock() {
        let mut mutex: Mutex<u8, Spin> = Mutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        *mutex.get_mut() = 9;
        assert_eq!(*mutex.try_lock().unwrap(), 9);
    }
}
