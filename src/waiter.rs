// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Decoupling the start of a one-shot asynchronous operation from the
//! `.await` that consumes its result.
//!
//! A [`Waiter`] is armed with [`Waiter::initiate`], which hands the
//! initiating function a completion handle. Exactly one completion lands in
//! the handle; [`Waiter::wait`] picks it up whenever the caller gets around
//! to it, suspending only if the result has not arrived yet.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::sync::SpinLock;

enum EventState<T> {
    Empty,
    Waiting(Waker),
    Set(T),
}

/// A cell that stores either "no result yet", the result, or the waker of
/// the single task currently awaiting it.
///
/// The stored result survives delivery: repeated waits resolve immediately
/// with the same value until the event is reset.
pub(crate) struct ManualResetEvent<T> {
    state: SpinLock<EventState<T>>,
}

impl<T> ManualResetEvent<T> {
    pub fn new() -> ManualResetEvent<T> {
        ManualResetEvent {
            state: SpinLock::new(EventState::Empty),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        debug_assert!(
            !matches!(*state, EventState::Waiting(_)),
            "reset with a pending wait"
        );
        *state = EventState::Empty;
    }

    /// Stores the result. Wakes the pending waiter, if any, after the lock
    /// is released so the woken task can poll immediately.
    pub fn set(&self, value: T) {
        let prev = {
            let mut state = self.state.lock();
            debug_assert!(
                !matches!(*state, EventState::Set(_)),
                "second completion delivered to a manual-reset event"
            );
            mem::replace(&mut *state, EventState::Set(value))
        };
        if let EventState::Waiting(waker) = prev {
            waker.wake();
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), EventState::Set(_))
    }

    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<T>
    where
        T: Clone,
    {
        let mut state = self.state.lock();
        match &*state {
            EventState::Set(value) => Poll::Ready(value.clone()),
            _ => {
                *state = EventState::Waiting(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Revokes a pending wait. A result that has already arrived wins over
    /// the cancellation and stays stored.
    pub fn cancel_wait(&self) {
        let mut state = self.state.lock();
        if let EventState::Waiting(_) = &*state {
            *state = EventState::Empty;
        }
    }
}

/// Hold-the-last-result primitive: start now, await later.
///
/// At most one suspended wait is permitted at a time. Dropping a pending
/// [`Wait`] future revokes the suspension; a later `wait` may be issued
/// again.
pub struct Waiter<T> {
    event: Arc<ManualResetEvent<T>>,
}

impl<T: Send + 'static> Waiter<T> {
    pub fn new() -> Waiter<T> {
        Waiter {
            event: Arc::new(ManualResetEvent::new()),
        }
    }

    /// Arms the waiter and calls `f` with the completion handle. `f` is
    /// expected to pass the handle to some asynchronous operation's start
    /// entry point; exactly one completion must be delivered through it.
    ///
    /// A result stored by a previous initiation is discarded.
    pub fn initiate<F>(&mut self, f: F)
    where
        F: FnOnce(WaiterHandle<T>),
    {
        self.event.reset();
        f(WaiterHandle {
            event: self.event.clone(),
        })
    }

    /// True iff the result has arrived and `wait` would resolve
    /// immediately.
    pub fn is_ready(&self) -> bool {
        self.event.is_ready()
    }

    /// Resolves with the initiated operation's result. May be called any
    /// number of times; once the result is present every call resolves
    /// immediately with the same value, until the next `initiate`.
    pub fn wait(&self) -> Wait<'_, T> {
        Wait { event: &self.event }
    }
}

impl<T: Send + 'static> Default for Waiter<T> {
    fn default() -> Waiter<T> {
        Waiter::new()
    }
}

/// Completion handle of a [`Waiter`]. Deliver the result with
/// [`WaiterHandle::complete`].
pub struct WaiterHandle<T> {
    event: Arc<ManualResetEvent<T>>,
}

impl<T: Send> WaiterHandle<T> {
    pub fn complete(self, value: T) {
        self.event.set(value);
    }
}

/// Future returned by [`Waiter::wait`].
pub struct Wait<'a, T> {
    event: &'a ManualResetEvent<T>,
}

impl<T: Clone + Send> Future for Wait<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.event.poll_wait(cx)
    }
}

impl<T> Drop for Wait<'_, T> {
    fn drop(&mut self) {
        // No-op if the result already arrived; only revokes a suspension
        // that is still pending.
        self.event.cancel_wait();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use futures::executor::block_on;
    use futures::future::FutureExt;

    use super::*;

    #[test]
    fn test_set_before_wait() {
        let mut waiter = Waiter::new();
        waiter.initiate(|handle| handle.complete(42));
        assert!(waiter.is_ready());
        assert_eq!(42, block_on(waiter.wait()));
    }

    #[test]
    fn test_wait_before_set() {
        let mut waiter = Waiter::new();
        let mut handle = None;
        waiter.initiate(|h| handle = Some(h));
        assert!(!waiter.is_ready());
        let handle = handle.unwrap();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.complete(7);
        });
        assert_eq!(7, block_on(waiter.wait()));
        t.join().unwrap();
    }

    #[test]
    fn test_result_survives_repeated_waits() {
        let mut waiter = Waiter::new();
        waiter.initiate(|handle| handle.complete(true));
        assert_eq!(true, block_on(waiter.wait()));
        assert_eq!(true, block_on(waiter.wait()));
        assert!(waiter.is_ready());
        waiter.initiate(|handle| handle.complete(false));
        assert_eq!(false, block_on(waiter.wait()));
    }

    #[test]
    fn test_dropping_pending_wait_allows_rewait() {
        let mut waiter = Waiter::new();
        let mut handle = None;
        waiter.initiate(|h| handle = Some(h));
        {
            let mut wait = waiter.wait();
            let mut cx = Context::from_waker(futures::task::noop_waker_ref());
            assert!(wait.poll_unpin(&mut cx).is_pending());
        }
        handle.unwrap().complete(3);
        assert_eq!(3, block_on(waiter.wait()));
    }
}
