// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A simple spin lock guarding the manual-reset event state.
///
/// Critical sections are a handful of instructions, so spinning beats
/// parking.
pub(crate) struct SpinLock<T> {
    handle: UnsafeCell<T>,
    lock: AtomicBool,
}

// It's a lock, as long as the content can be sent between
// threads, it's Sync and Send.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a lock with the given value.
    pub fn new(t: T) -> SpinLock<T> {
        SpinLock {
            handle: UnsafeCell::new(t),
            lock: AtomicBool::new(false),
        }
    }

    /// It's safe to use swap here. If previous is false, then the lock
    /// is taken, loop will break, set it to true is expected;
    /// If previous is true, then the loop will go on until others swap
    /// back a false, set it to true changes nothing.
    pub fn lock(&self) -> LockGuard<'_, T> {
        while self.lock.swap(true, Ordering::SeqCst) {
            hint::spin_loop();
        }
        LockGuard { inner: self }
    }
}

/// A guard for `SpinLock`.
pub(crate) struct LockGuard<'a, T> {
    inner: &'a SpinLock<T>,
}

impl<'a, T> Deref for LockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.inner.handle.get() }
    }
}

impl<'a, T> DerefMut for LockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.inner.handle.get() }
    }
}

impl<'a, T> Drop for LockGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.lock.swap(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, TryRecvError};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_lock() {
        let lock1 = Arc::new(SpinLock::new(2));
        let lock2 = lock1.clone();
        let guard = lock1.lock();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut guard = lock2.lock();
            *guard += 1;
            tx.send(()).unwrap();
        });
        thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        drop(guard);
        assert_eq!(rx.recv(), Ok(()));
        handle.join().unwrap();
        assert_eq!(3, *lock1.lock());
    }
}
