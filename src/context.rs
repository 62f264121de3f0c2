// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! The execution context: one cooperatively scheduled worker multiplexing
//! two event sources, locally posted work and completion-queue events.
//!
//! The worker drains the local queue, then blocks on the completion queue
//! for a single event per iteration. Work posted from other threads lands
//! in the remote queue; the producer responsible for its empty-to-non-empty
//! transition arms the work alarm, which surfaces on the completion queue
//! as a wake-up event.

use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use libc::c_void;
use log::debug;

use crate::alloc::{Arena, WorkAlloc};
use crate::cq::{CompletionQueue, CqRef, Deadline, EventType};
use crate::error::{Error, Result};
use crate::executor::GrpcExecutor;
use crate::grpc_sys::{self, grpc_alarm, grpc_completion_queue};
use crate::op::{alloc_op, OpHandler, OpHead};
use crate::queue::{AtomicOpQueue, OpQueue};
use crate::task;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Why a run loop handed control back.
enum Exit {
    Stopped,
    Predicate,
    Timeout,
    Shutdown,
}

enum Step {
    Continue,
    Timeout,
    Shutdown,
}

/// Shared state behind a [`GrpcContext`] and all handles derived from it.
pub(crate) struct Inner {
    pub(crate) cq: CompletionQueue,
    work_alarm: *mut grpc_alarm,
    /// Whether the work alarm is currently armed. Exactly-once arming.
    has_work: AtomicBool,
    outstanding_work: AtomicUsize,
    stopped: AtomicBool,
    /// Guards against two concurrent workers; a contract violation.
    running: AtomicBool,
    worker_thread: AtomicU64,
    local_queue: UnsafeCell<OpQueue>,
    remote_queue: AtomicOpQueue,
    processing_local: Cell<bool>,
    check_remote: Cell<bool>,
    arena: UnsafeCell<Arena>,
}

// The raw pointers and cells are only ever touched by the worker thread,
// which is unique by contract (enforced through `running` and the
// thread-identity check). Cross-thread state is atomic or internally
// synchronized.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn new() -> Inner {
        let cq = CompletionQueue::new();
        let work_alarm = unsafe { grpc_sys::grpc_alarm_create(ptr::null_mut()) };
        Inner {
            cq,
            work_alarm,
            has_work: AtomicBool::new(false),
            outstanding_work: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            worker_thread: AtomicU64::new(0),
            local_queue: UnsafeCell::new(OpQueue::new()),
            remote_queue: AtomicOpQueue::new(),
            processing_local: Cell::new(false),
            check_remote: Cell::new(false),
            arena: UnsafeCell::new(Arena::new()),
        }
    }

    fn has_work_tag(&self) -> *mut c_void {
        &self.has_work as *const AtomicBool as *mut c_void
    }

    pub fn is_running_in_this_thread(&self) -> bool {
        self.worker_thread.load(Ordering::Relaxed) == current_thread_id()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed) && !self.is_running_in_this_thread() {
            // The worker may be blocked on the completion queue.
            self.trigger_work_alarm();
        }
    }

    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Relaxed);
    }

    pub fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    pub fn work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.stop();
        }
    }

    pub fn outstanding_work(&self) -> usize {
        self.outstanding_work.load(Ordering::Relaxed)
    }

    fn set_work_alarm(&self, cq: &CqRef<'_>) {
        unsafe {
            grpc_sys::grpc_alarm_set(
                self.work_alarm,
                cq.as_ptr(),
                Deadline::infinite_past().spec(),
                self.has_work_tag(),
                ptr::null_mut(),
            );
        }
    }

    /// Arms the work alarm unless it is already armed.
    fn trigger_work_alarm(&self) {
        if !self.has_work.swap(true, Ordering::AcqRel) {
            match self.cq.borrow() {
                Ok(cq) => self.set_work_alarm(&cq),
                Err(_) => debug!("work alarm not armed, completion queue is shutting down"),
            }
        }
    }

    fn trigger_work_alarm_with(&self, cq: &CqRef<'_>) {
        if !self.has_work.swap(true, Ordering::AcqRel) {
            self.set_work_alarm(cq);
        }
    }

    /// Worker only. Queues an operation on the local queue.
    pub(crate) fn add_local_operation(&self, op: *mut OpHead) {
        debug_assert!(self.is_running_in_this_thread());
        unsafe { (*self.local_queue.get()).push_back(op) };
        if !self.processing_local.get() {
            self.trigger_work_alarm();
        }
    }

    /// Allocates an operation for `handler` and queues it. Fails without
    /// side effect once shutdown has begun.
    pub(crate) fn submit<H: OpHandler, A: WorkAlloc>(&self, alloc: &A, handler: H) -> Result<()> {
        if self.cq.is_shutdown() {
            return Err(Error::QueueShutdown);
        }
        if self.is_running_in_this_thread() {
            self.work_started();
            let op = alloc_op(self, alloc, handler);
            self.add_local_operation(op);
        } else {
            // Hold the queue borrow across the push so that teardown cannot
            // drain the remote queue before this operation lands in it.
            let cq = self.cq.borrow()?;
            self.work_started();
            let op = alloc_op(self, alloc, handler);
            if self.remote_queue.enqueue(op) {
                self.trigger_work_alarm_with(&cq);
            }
        }
        Ok(())
    }

    /// Low-level initiation: allocates an operation, hands its tag to
    /// `start` and completes the handler with the event's `ok` once the
    /// completion queue fires the tag.
    pub(crate) fn initiate<F, H, A>(&self, alloc: &A, start: F, handler: H) -> Result<()>
    where
        F: FnOnce(*mut grpc_completion_queue, *mut c_void),
        H: OpHandler,
        A: WorkAlloc,
    {
        let cq = self.cq.borrow()?;
        self.work_started();
        let op = alloc_op(self, alloc, handler);
        start(cq.as_ptr(), OpHead::tag(op));
        Ok(())
    }

    pub(crate) fn arena_alloc(&self, layout: Layout) -> Option<*mut u8> {
        debug_assert!(self.is_running_in_this_thread());
        unsafe { (*self.arena.get()).alloc(layout) }
    }

    pub(crate) unsafe fn arena_dealloc(&self, ptr: *mut u8, layout: Layout) {
        debug_assert!(self.is_running_in_this_thread());
        (*self.arena.get()).dealloc(ptr, layout)
    }

    /// Completes queued local operations until the queue is empty or, when
    /// handlers are being invoked, until the context is stopped.
    fn process_local_queue(&self, ok: bool, invoke: bool) -> usize {
        let mut n = 0;
        self.processing_local.set(true);
        loop {
            if invoke && self.is_stopped() {
                break;
            }
            let op = unsafe { (*self.local_queue.get()).pop_front() };
            if op.is_null() {
                break;
            }
            unsafe { OpHead::complete(op, self, ok, invoke) };
            self.work_finished();
            n += 1;
        }
        self.processing_local.set(false);
        n
    }

    /// One loop iteration: local work first, then a single completion-queue
    /// event.
    fn do_one(&self, deadline: Deadline, cq_only: bool) -> (usize, Step) {
        let mut n = 0;
        if !cq_only {
            if self.check_remote.get() {
                let drained = self.remote_queue.try_mark_inactive_or_dequeue_all();
                if drained.is_empty() {
                    self.check_remote.set(false);
                } else {
                    unsafe { (*self.local_queue.get()).append(drained) };
                }
            }
            n += self.process_local_queue(true, true);
        }
        if self.is_stopped() {
            return (n, Step::Continue);
        }
        // While remote work may still be pending the worker must not block:
        // producers only arm the work alarm on the queue's inactive-to-
        // non-empty transition.
        let may_have_remote_work = !cq_only && self.check_remote.get();
        let wait = if may_have_remote_work {
            Deadline::infinite_past()
        } else {
            deadline
        };
        let e = self.cq.next(wait);
        match e.event_type {
            EventType::QueueShutdown => (n, Step::Shutdown),
            EventType::QueueTimeout => {
                if may_have_remote_work {
                    (n, Step::Continue)
                } else {
                    (n, Step::Timeout)
                }
            }
            EventType::OpComplete => {
                if e.tag == self.has_work_tag() {
                    self.has_work.store(false, Ordering::Release);
                    self.check_remote.set(true);
                } else {
                    let op = unsafe { OpHead::from_tag(e.tag) };
                    let invoke = !self.is_stopped();
                    unsafe { OpHead::complete(op, self, e.success, invoke) };
                    self.work_finished();
                    n += 1;
                }
                (n, Step::Continue)
            }
        }
    }

    fn run_loop<P: FnMut() -> bool>(
        &self,
        deadline: Deadline,
        cq_only: bool,
        mut keep_going: P,
    ) -> (usize, Exit) {
        let mut total = 0;
        let exit = loop {
            if self.is_stopped() {
                break Exit::Stopped;
            }
            if !keep_going() {
                break Exit::Predicate;
            }
            let (n, step) = self.do_one(deadline, cq_only);
            total += n;
            match step {
                Step::Continue => {}
                Step::Timeout => break Exit::Timeout,
                Step::Shutdown => break Exit::Shutdown,
            }
        };
        (total, exit)
    }

    /// Stops the context, shuts the completion queue down and drains every
    /// pending event and queued operation, freeing their records without
    /// invoking handlers.
    fn teardown(&self) {
        self.stop();
        // Claim worker identity: destruction while a worker is running is a
        // contract violation, so from here the dropping thread is the
        // worker.
        self.worker_thread
            .store(current_thread_id(), Ordering::Relaxed);
        self.cq.shutdown();
        let mut dropped = 0;
        loop {
            let e = self.cq.next(Deadline::infinite_future());
            match e.event_type {
                EventType::QueueShutdown => break,
                EventType::QueueTimeout => continue,
                EventType::OpComplete => {
                    if e.tag == self.has_work_tag() {
                        self.has_work.store(false, Ordering::Release);
                        continue;
                    }
                    let op = unsafe { OpHead::from_tag(e.tag) };
                    unsafe { OpHead::complete(op, self, e.success, false) };
                    self.work_finished();
                    dropped += 1;
                }
            }
        }
        // Operations still sitting in the queues were never handed to the
        // completion queue and have to be freed here.
        let remote = self.remote_queue.dequeue_all();
        unsafe { (*self.local_queue.get()).append(remote) };
        dropped += self.process_local_queue(false, false);
        if dropped > 0 {
            debug!("dropped {} operations during context teardown", dropped);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The completion queue is destroyed afterwards by its own Drop.
        unsafe { grpc_sys::grpc_alarm_destroy(self.work_alarm, ptr::null_mut()) };
    }
}

/// Marks the current thread as the worker for the duration of a run call.
struct WorkerSession<'a> {
    inner: &'a Inner,
}

impl<'a> WorkerSession<'a> {
    fn begin(inner: &'a Inner) -> WorkerSession<'a> {
        let unique = inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(unique, "only one thread may run a GrpcContext at a time");
        inner
            .worker_thread
            .store(current_thread_id(), Ordering::Relaxed);
        WorkerSession { inner }
    }
}

impl Drop for WorkerSession<'_> {
    fn drop(&mut self) {
        // A handler panic unwinds through here; leave the context stopped
        // so the caller observes a valid, quiescent state.
        if thread::panicking() {
            self.inner.stopped.store(true, Ordering::Relaxed);
        }
        self.inner.running.store(false, Ordering::Release);
    }
}

/// An execution context driving a gRPC completion queue.
///
/// All asynchronous completions of a context are delivered on the single
/// thread running one of the `run`/`poll` methods. Handles created from the
/// context ([`GrpcExecutor`], [`crate::Alarm`]) stay valid after the
/// context is dropped; submitting through them then becomes a no-op.
pub struct GrpcContext {
    inner: Arc<Inner>,
}

impl GrpcContext {
    pub fn new() -> GrpcContext {
        GrpcContext {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Returns an executor handle bound to this context.
    pub fn executor(&self) -> GrpcExecutor {
        GrpcExecutor::from_inner(self.inner.clone())
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Runs the worker loop until the context is stopped or runs out of
    /// outstanding work. Returns true iff at least one operation was
    /// processed.
    ///
    /// Returns immediately when there is no outstanding work or the context
    /// is stopped; call [`GrpcContext::reset`] to make a stopped context
    /// runnable again.
    pub fn run(&self) -> bool {
        if self.inner.outstanding_work() == 0 || self.inner.is_stopped() {
            return false;
        }
        let _session = WorkerSession::begin(&self.inner);
        let (n, _) = self
            .inner
            .run_loop(Deadline::infinite_future(), false, || true);
        n > 0
    }

    /// Like [`GrpcContext::run`], but gives up once `deadline` passes.
    /// Returns true if the loop ended because of stop or work drain, false
    /// on timeout.
    pub fn run_until(&self, deadline: Deadline) -> bool {
        if self.inner.is_stopped() {
            return true;
        }
        let _session = WorkerSession::begin(&self.inner);
        let (_, exit) = self.inner.run_loop(deadline, false, || true);
        !matches!(exit, Exit::Timeout)
    }

    /// Like [`GrpcContext::run`], but re-evaluates `pred` before every
    /// iteration and stops as soon as it returns false.
    pub fn run_while<P: FnMut() -> bool>(&self, pred: P) -> bool {
        if self.inner.is_stopped() {
            return false;
        }
        let _session = WorkerSession::begin(&self.inner);
        let (n, _) = self
            .inner
            .run_loop(Deadline::infinite_future(), false, pred);
        n > 0
    }

    /// Processes local work and already-ready completion-queue events
    /// without blocking. Returns true iff anything was handled.
    pub fn poll(&self) -> bool {
        if self.inner.is_stopped() {
            return false;
        }
        let _session = WorkerSession::begin(&self.inner);
        let (n, _) = self
            .inner
            .run_loop(Deadline::infinite_past(), false, || true);
        n > 0
    }

    /// Like [`GrpcContext::poll`], but consumes only completion-queue
    /// events, leaving the work queues untouched.
    pub fn poll_completion_queue(&self) -> bool {
        if self.inner.is_stopped() {
            return false;
        }
        let _session = WorkerSession::begin(&self.inner);
        let (n, _) = self.inner.run_loop(Deadline::infinite_past(), true, || true);
        n > 0
    }

    /// Like [`GrpcContext::run`], but consumes only completion-queue
    /// events. Useful when work is posted through a host event loop and
    /// this context only delivers gRPC completions.
    pub fn run_completion_queue(&self) -> bool {
        if self.inner.is_stopped() {
            return false;
        }
        let _session = WorkerSession::begin(&self.inner);
        let (n, _) = self
            .inner
            .run_loop(Deadline::infinite_future(), true, || true);
        n > 0
    }

    /// Signals the worker to stop after the current iteration. Queued work
    /// is retained and handled after `reset` and a new `run`. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Makes a stopped context runnable again.
    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Spawns a future that is polled on the worker thread. The context
    /// counts the task as outstanding work until the future completes.
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        task::spawn(&self.inner, f);
    }
}

impl Default for GrpcContext {
    fn default() -> GrpcContext {
        GrpcContext::new()
    }
}

impl Drop for GrpcContext {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
