// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::alloc::Layout;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use grpcio_exec::{Deadline, Error, GrpcContext, GrpcExecutor, WorkAlloc};

#[test]
fn test_bare_post() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    exec.post(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    assert!(ctx.run());
    assert_eq!(1, counter.load(Ordering::SeqCst));
    assert!(ctx.is_stopped());
}

#[test]
fn test_run_without_work_returns_immediately() {
    let ctx = GrpcContext::new();
    assert!(!ctx.run());
    assert!(!ctx.is_stopped());
}

#[test]
fn test_reset() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let ok = Arc::new(AtomicBool::new(false));
    assert!(!ctx.is_stopped());
    {
        let ok = ok.clone();
        let exec2 = exec.clone();
        exec.post(move || {
            assert!(!exec2.is_stopped());
            ok.store(true, Ordering::SeqCst);
        });
    }
    assert!(ctx.run());
    assert!(ctx.is_stopped());
    assert!(ok.load(Ordering::SeqCst));

    ctx.reset();
    assert!(!ctx.is_stopped());
    ctx.stop();
    {
        let ok = ok.clone();
        exec.post(move || ok.store(false, Ordering::SeqCst));
    }
    assert!(!ctx.run());
    assert!(ok.load(Ordering::SeqCst));
}

// Work posted after stop is retained and only handled after reset and a
// new run.
#[test]
fn test_stop_does_not_complete_pending_operations() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let exec2 = exec.clone();
        let c = counter.clone();
        exec.post(move || {
            let c = c.clone();
            exec2.stop();
            exec2.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });
    }
    assert!(ctx.run());
    assert_eq!(0, counter.load(Ordering::SeqCst));

    ctx.reset();
    assert!(ctx.run());
    assert_eq!(1, counter.load(Ordering::SeqCst));
}

#[test]
fn test_post_from_multiple_threads() {
    const THREADS: usize = 8;
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let counter = Arc::new(AtomicUsize::new(0));
    let guard = Arc::new(Mutex::new(Some(exec.with_outstanding_work_tracked(true))));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let exec = exec.clone();
        let counter = counter.clone();
        let guard = guard.clone();
        handles.push(thread::spawn(move || {
            let on_worker = exec.clone();
            exec.post(move || {
                assert!(on_worker.running_in_this_thread());
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == THREADS {
                    guard.lock().unwrap().take();
                }
            });
        }));
    }
    ctx.run();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(THREADS, counter.load(Ordering::SeqCst));
}

#[test]
fn test_work_tracking_executor_keeps_run_alive() {
    let ctx = Arc::new(GrpcContext::new());
    let tracked = ctx.executor().with_outstanding_work_tracked(true);
    let runner = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.run())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!ctx.is_stopped());
    drop(tracked);
    // Dropping the last work brings the counter to zero, which stops the
    // context and wakes the worker.
    assert!(!runner.join().unwrap());
    assert!(ctx.is_stopped());
}

#[test]
fn test_local_posts_run_in_order() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let exec2 = exec.clone();
        let order = order.clone();
        exec.post(move || {
            for i in 0..5 {
                let order = order.clone();
                exec2.post(move || order.lock().unwrap().push(i));
            }
        });
    }
    assert!(ctx.run());
    assert_eq!(vec![0, 1, 2, 3, 4], *order.lock().unwrap());
}

#[test]
fn test_dispatch_runs_inline_on_worker() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let exec2 = exec.clone();
        let order = order.clone();
        exec.post(move || {
            {
                let order = order.clone();
                exec2.dispatch(move || order.lock().unwrap().push("inline"));
            }
            order.lock().unwrap().push("after");
        });
    }
    assert!(ctx.run());
    // Dispatch ran inline, exactly once, before the posting handler
    // continued.
    assert_eq!(vec!["inline", "after"], *order.lock().unwrap());
}

#[test]
fn test_dispatch_from_other_thread_posts() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let invoked = Arc::new(AtomicBool::new(false));
    {
        let invoked = invoked.clone();
        exec.dispatch(move || invoked.store(true, Ordering::SeqCst));
    }
    // Not run inline: this thread is not the worker yet.
    assert!(!invoked.load(Ordering::SeqCst));
    assert!(ctx.run());
    assert!(invoked.load(Ordering::SeqCst));
}

#[test]
fn test_execute_respects_blocking_property() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let inline_count = Arc::new(AtomicUsize::new(0));
    {
        let exec2 = exec.clone();
        let inline_count = inline_count.clone();
        exec.post(move || {
            let possibly = exec2.with_blocking_never(false);
            {
                let inline_count = inline_count.clone();
                possibly.execute(move || {
                    inline_count.fetch_add(1, Ordering::SeqCst);
                });
            }
            // The blocking-never default posts instead.
            assert_eq!(1, inline_count.load(Ordering::SeqCst));
            let inline_count = inline_count.clone();
            exec2.execute(move || {
                inline_count.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(1, inline_count.load(Ordering::SeqCst));
        });
    }
    assert!(ctx.run());
    assert_eq!(2, inline_count.load(Ordering::SeqCst));
}

#[test]
fn test_poll() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let invoked = Arc::new(AtomicBool::new(false));
    assert!(!ctx.poll());
    {
        let invoked = invoked.clone();
        exec.post(move || invoked.store(true, Ordering::SeqCst));
    }
    // Give the work alarm time to surface on the completion queue.
    thread::sleep(Duration::from_millis(100));
    assert!(ctx.poll());
    assert!(invoked.load(Ordering::SeqCst));
}

#[test]
fn test_poll_completion_queue_skips_local_work() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let posted = Arc::new(AtomicBool::new(false));
    let fired = Arc::new(AtomicBool::new(false));
    {
        let posted = posted.clone();
        exec.post(move || posted.store(true, Ordering::SeqCst));
    }
    let mut alarm = grpcio_exec::Alarm::new(&ctx);
    {
        let fired = fired.clone();
        alarm.wait(Deadline::from(Duration::from_millis(10)), move |ok| {
            assert!(ok);
            fired.store(true, Ordering::SeqCst);
        });
    }
    thread::sleep(Duration::from_millis(100));
    // Only the completion-queue event is consumed; the posted work stays
    // queued.
    assert!(ctx.poll_completion_queue());
    assert!(fired.load(Ordering::SeqCst));
    assert!(!posted.load(Ordering::SeqCst));
    assert!(ctx.run());
    assert!(posted.load(Ordering::SeqCst));
}

#[test]
fn test_run_until_times_out() {
    let ctx = GrpcContext::new();
    let _guard = ctx.executor().with_outstanding_work_tracked(true);
    let start = Instant::now();
    assert!(!ctx.run_until(Deadline::from(Duration::from_millis(100))));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(!ctx.is_stopped());
}

#[test]
fn test_run_until_processes_work() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let invoked = Arc::new(AtomicBool::new(false));
    {
        let invoked = invoked.clone();
        exec.post(move || invoked.store(true, Ordering::SeqCst));
    }
    assert!(ctx.run_until(Deadline::from(Duration::from_secs(5))));
    assert!(invoked.load(Ordering::SeqCst));
}

#[test]
fn test_run_while() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = counter.clone();
        exec.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    let c = counter.clone();
    assert!(ctx.run_while(move || c.load(Ordering::SeqCst) < 2));
    assert!(counter.load(Ordering::SeqCst) >= 2);
}

#[derive(Clone)]
struct TrackingAlloc {
    used: Arc<AtomicBool>,
}

impl PartialEq for TrackingAlloc {
    fn eq(&self, other: &TrackingAlloc) -> bool {
        Arc::ptr_eq(&self.used, &other.used)
    }
}

impl WorkAlloc for TrackingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.used.store(true, Ordering::SeqCst);
        std::alloc::alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        std::alloc::dealloc(ptr, layout);
    }
}

#[test]
fn test_post_with_custom_allocator() {
    let ctx = GrpcContext::new();
    let used = Arc::new(AtomicBool::new(false));
    let exec = ctx.executor().with_allocator(TrackingAlloc { used: used.clone() });
    let invoked = Arc::new(AtomicBool::new(false));
    {
        let invoked = invoked.clone();
        exec.post(move || invoked.store(true, Ordering::SeqCst));
    }
    assert!(ctx.run());
    assert!(used.load(Ordering::SeqCst));
    assert!(invoked.load(Ordering::SeqCst));
}

// A handler too large for the worker arena falls back to the heap and
// still runs.
#[test]
fn test_post_large_local_allocation() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let ok = Arc::new(AtomicBool::new(false));
    {
        let exec2 = exec.clone();
        let ok = ok.clone();
        exec.post(move || {
            let payload = [0u8; 5000];
            let ok = ok.clone();
            exec2.post(move || {
                assert_eq!(0, payload[4999]);
                ok.store(true, Ordering::SeqCst);
            });
        });
    }
    assert!(ctx.run());
    assert!(ok.load(Ordering::SeqCst));
}

#[test]
fn test_panicking_handler_unwinds_and_stops() {
    let ctx = GrpcContext::new();
    ctx.executor().post(|| panic!("handler failure"));
    let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.run()));
    assert!(result.is_err());
    assert!(ctx.is_stopped());
}

#[test]
fn test_executor_equality() {
    let ctx = GrpcContext::new();
    let other = GrpcContext::new();
    let exec = ctx.executor();
    assert_eq!(exec, ctx.executor());
    assert_ne!(exec, other.executor());
    // The default executor already has the blocking-never property.
    assert_eq!(exec, exec.with_blocking_never(true));
    assert_ne!(exec, exec.with_blocking_never(false));
    assert_ne!(exec, exec.with_relationship_continuation(true));
    let roundtrip = exec
        .with_relationship_continuation(true)
        .with_relationship_continuation(false);
    assert_eq!(exec, roundtrip);
}

#[test]
fn test_post_after_teardown_is_dropped() {
    let exec: GrpcExecutor = {
        let ctx = GrpcContext::new();
        ctx.executor()
    };
    // The context is gone; posting must not invoke or leak the handler.
    exec.post(|| unreachable!("ran on a torn-down context"));
}

// The low-level initiation contract: hand a tag to gRPC, get the event's
// ok back in the handler.
#[test]
fn test_initiate_delivers_completion() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let fired = Arc::new(AtomicBool::new(false));
    let alarm = unsafe { grpcio_sys::grpc_alarm_create(std::ptr::null_mut()) };
    {
        let fired = fired.clone();
        exec.initiate(
            |cq, tag| unsafe {
                let now = grpcio_sys::gpr_now(grpcio_sys::gpr_clock_type::GPR_CLOCK_MONOTONIC);
                grpcio_sys::grpc_alarm_set(alarm, cq, now, tag, std::ptr::null_mut());
            },
            move |ok| {
                assert!(ok);
                fired.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    }
    assert!(ctx.run());
    assert!(fired.load(Ordering::SeqCst));
    unsafe { grpcio_sys::grpc_alarm_destroy(alarm, std::ptr::null_mut()) };
}

#[test]
fn test_schedule_completes_on_worker() {
    let ctx = GrpcContext::new();
    let exec = ctx.executor();
    let done = Arc::new(AtomicBool::new(false));
    {
        let exec2 = exec.clone();
        let done = done.clone();
        ctx.spawn(async move {
            exec2.schedule().await.unwrap();
            assert!(exec2.running_in_this_thread());
            done.store(true, Ordering::SeqCst);
        });
    }
    assert!(ctx.run());
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn test_schedule_reports_teardown() {
    let exec: GrpcExecutor = {
        let ctx = GrpcContext::new();
        ctx.executor()
    };
    let result = futures::executor::block_on(exec.schedule());
    assert_eq!(Err(Error::QueueShutdown), result);
}

#[test]
fn test_spawn_with_cross_thread_wake() {
    let ctx = GrpcContext::new();
    let (tx, rx) = futures::channel::oneshot::channel::<u32>();
    let value = Arc::new(AtomicUsize::new(0));
    {
        let value = value.clone();
        ctx.spawn(async move {
            let v = rx.await.unwrap();
            value.store(v as usize, Ordering::SeqCst);
        });
    }
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        tx.send(7).unwrap();
    });
    assert!(ctx.run());
    sender.join().unwrap();
    assert_eq!(7, value.load(Ordering::SeqCst));
}
