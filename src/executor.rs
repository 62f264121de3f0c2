// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Lightweight executor handles over a [`GrpcContext`].
//!
//! A handle is a reference to the context, an allocator for the operation
//! records it submits and three orthogonal option bits. Handles are cheap
//! values; any number of them may reference one context. The
//! work-tracking variety participates in the context's outstanding-work
//! counter and thereby keeps `run` from returning.
//!
//! [`GrpcContext`]: crate::GrpcContext

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use libc::c_void;
use log::debug;

use crate::alloc::{HeapAlloc, WorkAlloc};
use crate::context::Inner;
use crate::error::{Error, Result};
use crate::grpc_sys::grpc_completion_queue;
use crate::op::{Completion, Nullary, OpHandler};
use crate::task;
use crate::waiter::ManualResetEvent;

const BLOCKING_NEVER: u32 = 1;
const RELATIONSHIP_CONTINUATION: u32 = 1 << 1;
const OUTSTANDING_WORK_TRACKED: u32 = 1 << 2;

const DEFAULT_OPTIONS: u32 = BLOCKING_NEVER;

fn is_blocking_never(options: u32) -> bool {
    options & BLOCKING_NEVER != 0
}

fn set_blocking_never(options: u32, value: bool) -> u32 {
    if value {
        options | BLOCKING_NEVER
    } else {
        options & !BLOCKING_NEVER
    }
}

fn is_relationship_continuation(options: u32) -> bool {
    options & RELATIONSHIP_CONTINUATION != 0
}

fn set_relationship_continuation(options: u32, value: bool) -> u32 {
    if value {
        options | RELATIONSHIP_CONTINUATION
    } else {
        options & !RELATIONSHIP_CONTINUATION
    }
}

fn is_outstanding_work_tracked(options: u32) -> bool {
    options & OUTSTANDING_WORK_TRACKED != 0
}

fn set_outstanding_work_tracked(options: u32, value: bool) -> u32 {
    if value {
        options | OUTSTANDING_WORK_TRACKED
    } else {
        options & !OUTSTANDING_WORK_TRACKED
    }
}

/// Executor handle of a [`crate::GrpcContext`].
///
/// The default handle never runs work inline, treats submissions as forks
/// and does not track outstanding work. Variants with other properties are
/// derived through the `with_*` methods; each derived handle refers to the
/// same context.
pub struct GrpcExecutor<A: WorkAlloc = HeapAlloc> {
    inner: Arc<Inner>,
    alloc: A,
    options: u32,
}

impl GrpcExecutor {
    pub(crate) fn from_inner(inner: Arc<Inner>) -> GrpcExecutor {
        GrpcExecutor {
            inner,
            alloc: HeapAlloc,
            options: DEFAULT_OPTIONS,
        }
    }
}

impl<A: WorkAlloc> GrpcExecutor<A> {
    fn with_options(&self, options: u32) -> GrpcExecutor<A> {
        if is_outstanding_work_tracked(options) {
            self.inner.work_started();
        }
        GrpcExecutor {
            inner: self.inner.clone(),
            alloc: self.alloc.clone(),
            options,
        }
    }

    /// The allocator submissions through this handle are allocated with.
    pub fn get_allocator(&self) -> A {
        self.alloc.clone()
    }

    /// Whether the current thread is the context's worker thread.
    pub fn running_in_this_thread(&self) -> bool {
        self.inner.is_running_in_this_thread()
    }

    /// Forwards to the context. Handlers running on the worker use this to
    /// stop the context they are being run by.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Runs `f` inline when called from the worker thread, posts it
    /// otherwise.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.is_running_in_this_thread() {
            f();
        } else {
            self.post(f);
        }
    }

    /// Queues `f` for the worker. Never runs it inline. Posting to a
    /// context whose teardown has begun quietly drops `f`.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.inner.submit(&self.alloc, Nullary(f)) {
            debug!("dropping posted work: {}", e);
        }
    }

    /// Same as [`GrpcExecutor::post`].
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(f)
    }

    /// Submits `f` according to the handle's blocking property: a
    /// blocking-never handle posts, any other handle dispatches.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if is_blocking_never(self.options) {
            self.post(f)
        } else {
            self.dispatch(f)
        }
    }

    /// Returns a future that completes on the worker thread.
    pub fn schedule(&self) -> Schedule<A> {
        Schedule {
            exec: self.clone(),
            state: None,
        }
    }

    /// Spawns a future polled on the worker thread.
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        task::spawn(&self.inner, f)
    }

    /// Low-level initiation: allocates an operation record, hands its tag
    /// to `start` together with the raw completion queue, and calls
    /// `handler` with the event's `ok` once gRPC fires the tag.
    ///
    /// `start` must submit the tag to this completion queue exactly once.
    pub fn initiate<F, H>(&self, start: F, handler: H) -> Result<()>
    where
        F: FnOnce(*mut grpc_completion_queue, *mut c_void),
        H: FnOnce(bool) + Send + 'static,
    {
        self.inner.initiate(&self.alloc, start, Completion(handler))
    }

    /// Derives a handle with the blocking-never property set to `value`.
    /// A blocking-never handle's `execute` always posts.
    pub fn with_blocking_never(&self, value: bool) -> GrpcExecutor<A> {
        self.with_options(set_blocking_never(self.options, value))
    }

    /// Derives a handle with the relationship-continuation property set to
    /// `value`, marking submissions as continuations of the submitting
    /// task rather than forks.
    pub fn with_relationship_continuation(&self, value: bool) -> GrpcExecutor<A> {
        self.with_options(set_relationship_continuation(self.options, value))
    }

    /// Derives a handle that counts as outstanding work for as long as it
    /// (or any clone of it) is alive.
    pub fn with_outstanding_work_tracked(&self, value: bool) -> GrpcExecutor<A> {
        self.with_options(set_outstanding_work_tracked(self.options, value))
    }

    /// Derives a handle submitting through `alloc`.
    pub fn with_allocator<B: WorkAlloc>(&self, alloc: B) -> GrpcExecutor<B> {
        if is_outstanding_work_tracked(self.options) {
            self.inner.work_started();
        }
        GrpcExecutor {
            inner: self.inner.clone(),
            alloc,
            options: self.options,
        }
    }

}

impl<A: WorkAlloc> Clone for GrpcExecutor<A> {
    fn clone(&self) -> GrpcExecutor<A> {
        if is_outstanding_work_tracked(self.options) {
            self.inner.work_started();
        }
        GrpcExecutor {
            inner: self.inner.clone(),
            alloc: self.alloc.clone(),
            options: self.options,
        }
    }
}

impl<A: WorkAlloc> Drop for GrpcExecutor<A> {
    fn drop(&mut self) {
        if is_outstanding_work_tracked(self.options) {
            self.inner.work_finished();
        }
    }
}

/// Two handles are equal iff they can be interchanged with identical
/// effects: same context, same options, equal allocator.
impl<A: WorkAlloc> PartialEq for GrpcExecutor<A> {
    fn eq(&self, other: &GrpcExecutor<A>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            && self.options == other.options
            && self.alloc == other.alloc
    }
}

impl<A: WorkAlloc> fmt::Debug for GrpcExecutor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcExecutor")
            .field("context", &Arc::as_ptr(&self.inner))
            .field("options", &self.options)
            .finish()
    }
}

struct ScheduleHandler {
    event: Arc<ManualResetEvent<Result<()>>>,
}

impl OpHandler for ScheduleHandler {
    fn on_complete(self, _ok: bool) {
        self.event.set(Ok(()));
    }

    fn on_drain(self) {
        self.event.set(Err(Error::QueueShutdown));
    }
}

/// Future returned by [`GrpcExecutor::schedule`].
///
/// The first poll enqueues a nullary operation; the future resolves on the
/// worker thread once that operation runs, or with
/// [`Error::QueueShutdown`] when the context is torn down first.
pub struct Schedule<A: WorkAlloc = HeapAlloc> {
    exec: GrpcExecutor<A>,
    state: Option<Arc<ManualResetEvent<Result<()>>>>,
}

impl<A: WorkAlloc> Future for Schedule<A> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = unsafe { self.get_unchecked_mut() };
        if this.state.is_none() {
            let event = Arc::new(ManualResetEvent::new());
            let handler = ScheduleHandler {
                event: event.clone(),
            };
            if let Err(e) = this.exec.inner.submit(&this.exec.alloc, handler) {
                return Poll::Ready(Err(e));
            }
            this.state = Some(event);
        }
        this.state.as_ref().unwrap().poll_wait(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_bits_are_orthogonal() {
        assert!(is_blocking_never(BLOCKING_NEVER));
        assert!(!is_blocking_never(OUTSTANDING_WORK_TRACKED));
        assert!(is_blocking_never(set_blocking_never(
            OUTSTANDING_WORK_TRACKED,
            true
        )));
        assert!(!is_blocking_never(set_blocking_never(BLOCKING_NEVER, false)));

        assert!(is_outstanding_work_tracked(OUTSTANDING_WORK_TRACKED));
        assert!(!is_outstanding_work_tracked(BLOCKING_NEVER));
        assert!(is_outstanding_work_tracked(set_outstanding_work_tracked(
            BLOCKING_NEVER,
            true
        )));
        assert!(!is_outstanding_work_tracked(set_outstanding_work_tracked(
            OUTSTANDING_WORK_TRACKED,
            false
        )));

        assert!(is_relationship_continuation(set_relationship_continuation(
            DEFAULT_OPTIONS,
            true
        )));
        assert!(!is_relationship_continuation(DEFAULT_OPTIONS));
    }
}
