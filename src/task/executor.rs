// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Polls spawned futures on the execution context's worker thread.
//!
//! A wake-up re-enters the context through its work queues: from the worker
//! thread it lands on the local queue, from any other thread it lands on
//! the remote queue and the work alarm wakes the completion queue. The
//! future itself is only ever polled by the worker.

use std::cell::UnsafeCell;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use log::debug;

use crate::alloc::HeapAlloc;
use crate::context::Inner;
use crate::op::OpHandler;

/// When a future is spawned, it is scheduled for its first poll and marked
/// NOTIFIED. After an uneventful poll it becomes IDLE; a wake-up moves it
/// back to NOTIFIED and schedules it. While the worker polls it is
/// POLLING; a wake-up arriving during the poll moves it to NOTIFIED and
/// the worker polls again before giving the task up. Once the future
/// resolves the task is COMPLETED.
const NOTIFIED: u8 = 1;
const IDLE: u8 = 2;
const POLLING: u8 = 3;
const COMPLETED: u8 = 4;

/// Maintains the spawned future with state, so that it can be notified and
/// polled efficiently.
pub(crate) struct SpawnTask {
    handle: UnsafeCell<Option<BoxFuture<'static, ()>>>,
    state: AtomicU8,
    inner: Arc<Inner>,
}

// The future is only ever touched by the thread that won the transition to
// POLLING; the state machine serializes access to the cell.
unsafe impl Send for SpawnTask {}
unsafe impl Sync for SpawnTask {}

impl SpawnTask {
    fn new(f: BoxFuture<'static, ()>, inner: Arc<Inner>) -> SpawnTask {
        SpawnTask {
            handle: UnsafeCell::new(Some(f)),
            state: AtomicU8::new(NOTIFIED),
            inner,
        }
    }

    /// Returns true exactly when the caller is responsible for scheduling
    /// the task.
    fn mark_notified(&self) -> bool {
        loop {
            match self.state.compare_exchange_weak(
                IDLE,
                NOTIFIED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(POLLING) => match self.state.compare_exchange_weak(
                    POLLING,
                    NOTIFIED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Err(IDLE) | Err(POLLING) => continue,
                    // On success the worker polls the future again; on
                    // failure the future is resolved. Either way no
                    // scheduling is needed.
                    _ => return false,
                },
                Err(IDLE) => continue,
                _ => return false,
            }
        }
    }
}

impl Drop for SpawnTask {
    fn drop(&mut self) {
        // Balance the work counted at spawn time when the future is
        // discarded before completing (context teardown).
        if self.state.load(Ordering::Relaxed) != COMPLETED {
            self.inner.work_finished();
        }
    }
}

struct PollHandler(Arc<SpawnTask>);

impl OpHandler for PollHandler {
    fn on_complete(self, _ok: bool) {
        poll(self.0, true)
    }
}

fn schedule(task: Arc<SpawnTask>) {
    let inner = task.inner.clone();
    if let Err(e) = inner.submit(&HeapAlloc, PollHandler(task)) {
        debug!("dropping spawned task wake-up: {}", e);
    }
}

impl ArcWake for SpawnTask {
    fn wake_by_ref(arc_self: &Arc<SpawnTask>) {
        if !arc_self.mark_notified() {
            return;
        }
        schedule(arc_self.clone());
    }
}

/// Poll the future.
///
/// `woken` indicates whether the task arrived here through a wake-up.
fn poll(task: Arc<SpawnTask>, woken: bool) {
    let mut init_state = if woken { NOTIFIED } else { IDLE };
    loop {
        match task
            .state
            .compare_exchange(init_state, POLLING, Ordering::SeqCst, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(COMPLETED) => return,
            Err(s) => panic!("unexpected spawn task state {}", s),
        }

        let waker = waker_ref(&task);
        let mut cx = Context::from_waker(&waker);
        let res = unsafe { &mut *task.handle.get() }
            .as_mut()
            .unwrap()
            .as_mut()
            .poll(&mut cx);

        match res {
            Poll::Ready(()) => {
                unsafe { &mut *task.handle.get() }.take();
                task.state.store(COMPLETED, Ordering::SeqCst);
                task.inner.work_finished();
                return;
            }
            Poll::Pending => {
                match task
                    .state
                    .compare_exchange(POLLING, IDLE, Ordering::SeqCst, Ordering::Acquire)
                {
                    Ok(_) => return,
                    Err(NOTIFIED) => init_state = NOTIFIED,
                    Err(s) => panic!("unexpected spawn task state {}", s),
                }
            }
        }
    }
}

/// Spawns the future onto the context. The task counts as outstanding work
/// until the future completes, so `run` keeps driving a context whose only
/// remaining work is suspended tasks.
pub(crate) fn spawn<F>(inner: &Arc<Inner>, f: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if inner.cq.is_shutdown() {
        return;
    }
    inner.work_started();
    let task = Arc::new(SpawnTask::new(Box::pin(f), inner.clone()));
    schedule(task);
}
