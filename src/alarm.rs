// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! One-shot deadline completions over the native gRPC alarm.

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use log::debug;

use crate::alloc::HeapAlloc;
use crate::context::{GrpcContext, Inner};
use crate::cq::Deadline;
use crate::grpc_sys::{self, grpc_alarm};
use crate::op::OpHandler;
use crate::waiter::ManualResetEvent;

struct CallbackHandler<F> {
    armed: Arc<AtomicBool>,
    f: F,
}

impl<F: FnOnce(bool) + Send + 'static> OpHandler for CallbackHandler<F> {
    fn on_complete(self, ok: bool) {
        self.armed.store(false, Ordering::Relaxed);
        (self.f)(ok)
    }

    fn on_drain(self) {
        self.armed.store(false, Ordering::Relaxed);
    }
}

struct EventHandler {
    armed: Arc<AtomicBool>,
    event: Arc<ManualResetEvent<bool>>,
}

impl OpHandler for EventHandler {
    fn on_complete(self, ok: bool) {
        self.armed.store(false, Ordering::Relaxed);
        self.event.set(ok);
    }

    fn on_drain(self) {
        // The awaiting task must not hang just because the context went
        // away first; a dropped wait reads as cancellation.
        self.armed.store(false, Ordering::Relaxed);
        self.event.set(false);
    }
}

/// An alarm bound to one execution context.
///
/// [`Alarm::wait`] schedules a single completion at a deadline: the handler
/// receives true when the deadline fired and false when the wait was
/// cancelled. At most one wait may be in flight per alarm; starting a
/// second one is a contract violation.
pub struct Alarm {
    inner: Arc<Inner>,
    raw: *mut grpc_alarm,
    armed: Arc<AtomicBool>,
}

// The only operation reachable through a shared reference is `cancel`,
// which the C core documents as thread-safe.
unsafe impl Send for Alarm {}
unsafe impl Sync for Alarm {}

impl Alarm {
    pub fn new(ctx: &GrpcContext) -> Alarm {
        Alarm {
            inner: ctx.inner().clone(),
            raw: unsafe { grpc_sys::grpc_alarm_create(ptr::null_mut()) },
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn arm<H: OpHandler>(
        inner: &Arc<Inner>,
        raw: *mut grpc_alarm,
        armed: &Arc<AtomicBool>,
        deadline: Deadline,
        handler: H,
    ) {
        let was_armed = armed.swap(true, Ordering::Relaxed);
        debug_assert!(!was_armed, "a wait is already in flight on this alarm");
        let res = inner.initiate(
            &HeapAlloc,
            |cq, tag| unsafe { grpc_sys::grpc_alarm_set(raw, cq, deadline.spec(), tag, ptr::null_mut()) },
            handler,
        );
        if res.is_err() {
            armed.store(false, Ordering::Relaxed);
            debug!("alarm not armed, completion queue is shutting down");
        }
    }

    /// Schedules `f` to run on the worker when `deadline` fires (`ok =
    /// true`) or the wait is cancelled (`ok = false`).
    ///
    /// If the context's teardown has already begun, `f` is dropped without
    /// being invoked.
    pub fn wait<F>(&mut self, deadline: Deadline, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let handler = CallbackHandler {
            armed: self.armed.clone(),
            f,
        };
        Alarm::arm(&self.inner, self.raw, &self.armed, deadline, handler);
    }

    /// Like [`Alarm::wait`], but consumes the alarm and hands it back to
    /// the handler, so the caller does not need to keep it alive until the
    /// completion.
    pub fn wait_into<F>(self, deadline: Deadline, f: F)
    where
        F: FnOnce(bool, Alarm) + Send + 'static,
    {
        let inner = self.inner.clone();
        let raw = self.raw;
        let armed = self.armed.clone();
        let handler = CallbackHandler {
            armed: armed.clone(),
            f: move |ok| f(ok, self),
        };
        Alarm::arm(&inner, raw, &armed, deadline, handler);
    }

    /// Resolves to the wait's `ok`. Dropping the future before it resolves
    /// cancels the wait.
    pub fn wait_async(&mut self, deadline: Deadline) -> AlarmFuture<'_> {
        let event = Arc::new(ManualResetEvent::new());
        let handler = EventHandler {
            armed: self.armed.clone(),
            event: event.clone(),
        };
        Alarm::arm(&self.inner, self.raw, &self.armed, deadline, handler);
        AlarmFuture { alarm: self, event }
    }

    /// Cancels the wait in flight, if any. Its completion is still
    /// delivered, promptly and with `ok = false`. Thread-safe.
    pub fn cancel(&self) {
        unsafe { grpc_sys::grpc_alarm_cancel(self.raw, ptr::null_mut()) }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        // Destroying cancels a pending wait; its completion still arrives
        // through the queue with ok = false.
        unsafe { grpc_sys::grpc_alarm_destroy(self.raw, ptr::null_mut()) }
    }
}

/// Future returned by [`Alarm::wait_async`].
pub struct AlarmFuture<'a> {
    alarm: &'a Alarm,
    event: Arc<ManualResetEvent<bool>>,
}

impl Future for AlarmFuture<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        self.event.poll_wait(cx)
    }
}

impl Drop for AlarmFuture<'_> {
    fn drop(&mut self) {
        if !self.event.is_ready() {
            self.alarm.cancel();
        }
    }
}
