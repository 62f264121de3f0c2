// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Thin wrappers around the gRPC C core completion queue and its time type.
//!
//! The completion queue is the only OS-level wait in this crate: one call to
//! `grpc_completion_queue_next` per event-loop iteration. Everything else is
//! layered on top of the `(tag, ok)` pairs it produces.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;
use std::thread;
use std::time::Duration;

use libc::c_void;

use crate::error::{Error, Result};
use crate::grpc_sys::{self, gpr_clock_type, gpr_timespec, grpc_completion_queue, grpc_completion_type};

static GRPC_INIT: Once = Once::new();

/// Initializes the gRPC C core exactly once per process. The core is never
/// torn down again; `grpc_shutdown` is not worth the ordering headaches it
/// causes for short-lived contexts.
pub(crate) fn grpc_init_once() {
    GRPC_INIT.call_once(|| unsafe {
        grpc_sys::grpc_init();
    });
}

/// A point in time understood by the gRPC C core.
///
/// Deadlines are expressed on the monotonic clock. The two infinities are
/// the sentinels the C core reserves for "never" and "immediately".
#[derive(Clone, Copy)]
pub struct Deadline {
    spec: gpr_timespec,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn infinite_future() -> Deadline {
        grpc_init_once();
        Deadline {
            spec: unsafe { grpc_sys::gpr_inf_future(gpr_clock_type::GPR_CLOCK_MONOTONIC) },
        }
    }

    /// A deadline that has always been expired. Used to request immediate
    /// completion-queue timeouts and immediately-firing alarms.
    pub fn infinite_past() -> Deadline {
        grpc_init_once();
        Deadline {
            spec: unsafe { grpc_sys::gpr_inf_past(gpr_clock_type::GPR_CLOCK_MONOTONIC) },
        }
    }

    /// The current point in time.
    pub fn now() -> Deadline {
        grpc_init_once();
        Deadline {
            spec: unsafe { grpc_sys::gpr_now(gpr_clock_type::GPR_CLOCK_MONOTONIC) },
        }
    }

    pub(crate) fn spec(self) -> gpr_timespec {
        self.spec
    }
}

impl From<Duration> for Deadline {
    /// A deadline `dur` from now.
    fn from(dur: Duration) -> Deadline {
        let span = unsafe {
            grpc_sys::gpr_time_from_micros(dur.as_micros() as i64, gpr_clock_type::GPR_TIMESPAN)
        };
        Deadline {
            spec: unsafe { grpc_sys::gpr_time_add(Deadline::now().spec, span) },
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum EventType {
    QueueShutdown,
    QueueTimeout,
    OpComplete,
}

/// One `(tag, ok)` pair popped off the completion queue.
pub(crate) struct Event {
    pub event_type: EventType,
    pub success: bool,
    pub tag: *mut c_void,
}

/// Owned handle to a `grpc_completion_queue`.
///
/// Only the worker thread pops events. Other threads submit work (alarms,
/// wake-ups) through gRPC's thread-safe submission API, but each submission
/// must hold a [`CqRef`] so that shutdown cannot begin while a submission is
/// in flight.
pub(crate) struct CompletionQueue {
    cq: *mut grpc_completion_queue,
    shutdown_requested: AtomicBool,
    borrows: AtomicUsize,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    pub fn new() -> CompletionQueue {
        grpc_init_once();
        CompletionQueue {
            cq: unsafe { grpc_sys::grpc_completion_queue_create_for_next(ptr::null_mut()) },
            shutdown_requested: AtomicBool::new(false),
            borrows: AtomicUsize::new(0),
        }
    }

    /// Borrows the queue for one submission. Fails once shutdown has been
    /// requested.
    pub fn borrow(&self) -> Result<CqRef<'_>> {
        self.borrows.fetch_add(1, Ordering::SeqCst);
        if self.shutdown_requested.load(Ordering::SeqCst) {
            self.borrows.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::QueueShutdown);
        }
        Ok(CqRef { cq: self })
    }

    /// Pops the next event, blocking up to `deadline`. Worker thread only.
    pub fn next(&self, deadline: Deadline) -> Event {
        let e = unsafe {
            grpc_sys::grpc_completion_queue_next(self.cq, deadline.spec(), ptr::null_mut())
        };
        let event_type = match e.type_ {
            grpc_completion_type::GRPC_QUEUE_SHUTDOWN => EventType::QueueShutdown,
            grpc_completion_type::GRPC_QUEUE_TIMEOUT => EventType::QueueTimeout,
            grpc_completion_type::GRPC_OP_COMPLETE => EventType::OpComplete,
        };
        Event {
            event_type,
            success: e.success != 0,
            tag: e.tag,
        }
    }

    /// Requests shutdown, waits out in-flight submissions and shuts the
    /// queue down. After this returns, `next` eventually reports
    /// `QueueShutdown` once all pending events have been drained.
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.borrows.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        unsafe {
            grpc_sys::grpc_completion_queue_shutdown(self.cq);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // The owning context has already drained the queue to the
        // QueueShutdown event by the time the last reference goes away.
        unsafe { grpc_sys::grpc_completion_queue_destroy(self.cq) }
    }
}

/// Guard proving the completion queue will stay alive for one submission.
pub(crate) struct CqRef<'a> {
    cq: &'a CompletionQueue,
}

impl CqRef<'_> {
    pub fn as_ptr(&self) -> *mut grpc_completion_queue {
        self.cq.cq
    }
}

impl Drop for CqRef<'_> {
    fn drop(&mut self) {
        self.cq.borrows.fetch_sub(1, Ordering::SeqCst);
    }
}
