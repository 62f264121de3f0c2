// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! The operation record: the unit the completion queue understands.
//!
//! Every scheduled action is one heap- or arena-allocated record whose
//! address doubles as the gRPC tag. The first field of the record is a
//! completion function that also encodes the concrete type; completing a
//! record moves the handler off its storage, frees the storage through the
//! allocator that produced it and only then runs the handler.

use std::alloc::Layout;
use std::ptr;

use libc::c_void;

use crate::alloc::WorkAlloc;
use crate::context::Inner;

/// Completion function: `(op, context, ok, invoke_handler)`.
///
/// `invoke_handler` is false only on the shutdown-drain path, where the
/// record must be freed without running the user continuation.
type OnComplete = unsafe fn(*mut OpHead, &Inner, bool, bool);

/// Header shared by all operation records. `repr(C)` so that a pointer to
/// the concrete record and a pointer to its header are interchangeable.
#[repr(C)]
pub(crate) struct OpHead {
    pub next: *mut OpHead,
    pub on_complete: OnComplete,
}

impl OpHead {
    pub fn tag(op: *mut OpHead) -> *mut c_void {
        op as *mut c_void
    }

    /// # Safety
    ///
    /// `tag` must be the address of a live operation record produced by
    /// [`alloc_op`].
    pub unsafe fn from_tag(tag: *mut c_void) -> *mut OpHead {
        tag as *mut OpHead
    }

    /// Consumes the record. Runs at most once per record.
    pub unsafe fn complete(op: *mut OpHead, inner: &Inner, ok: bool, invoke: bool) {
        ((*op).on_complete)(op, inner, ok, invoke)
    }
}

/// A continuation carried by an operation record.
pub(crate) trait OpHandler: Send + 'static {
    fn on_complete(self, ok: bool);

    /// Invoked instead of `on_complete` on the shutdown-drain path. The
    /// default simply drops the continuation.
    fn on_drain(self)
    where
        Self: Sized,
    {
    }
}

/// Adapts a nullary closure (a posted function) to the handler contract.
pub(crate) struct Nullary<F>(pub F);

impl<F: FnOnce() + Send + 'static> OpHandler for Nullary<F> {
    fn on_complete(self, _ok: bool) {
        (self.0)()
    }
}

/// Adapts a completion closure receiving the event's `ok`.
pub(crate) struct Completion<F>(pub F);

impl<F: FnOnce(bool) + Send + 'static> OpHandler for Completion<F> {
    fn on_complete(self, ok: bool) {
        (self.0)(ok)
    }
}

#[repr(C)]
struct HeapOp<H, A> {
    head: OpHead,
    handler: H,
    alloc: A,
}

#[repr(C)]
struct ArenaOp<H> {
    head: OpHead,
    handler: H,
}

unsafe fn heap_complete<H: OpHandler, A: WorkAlloc>(
    head: *mut OpHead,
    _inner: &Inner,
    ok: bool,
    invoke: bool,
) {
    let op = head as *mut HeapOp<H, A>;
    // Move the continuation and the allocator off the record so the storage
    // can be released before the handler runs; the handler may allocate.
    let handler = ptr::read(&(*op).handler);
    let alloc = ptr::read(&(*op).alloc);
    alloc.dealloc(op as *mut u8, Layout::new::<HeapOp<H, A>>());
    if invoke {
        handler.on_complete(ok);
    } else {
        handler.on_drain();
    }
}

unsafe fn arena_complete<H: OpHandler>(head: *mut OpHead, inner: &Inner, ok: bool, invoke: bool) {
    let op = head as *mut ArenaOp<H>;
    let handler = ptr::read(&(*op).handler);
    inner.arena_dealloc(op as *mut u8, Layout::new::<ArenaOp<H>>());
    if invoke {
        handler.on_complete(ok);
    } else {
        handler.on_drain();
    }
}

/// Allocates an operation record for `handler`.
///
/// With the default allocator and on the worker thread, the record comes
/// from the context's arena; its completion function frees back to the
/// arena. Otherwise the record is allocated through `alloc` and carries a
/// clone of it for deallocation.
pub(crate) fn alloc_op<H: OpHandler, A: WorkAlloc>(
    inner: &Inner,
    alloc: &A,
    handler: H,
) -> *mut OpHead {
    if A::IS_DEFAULT && inner.is_running_in_this_thread() {
        let layout = Layout::new::<ArenaOp<H>>();
        if let Some(ptr) = inner.arena_alloc(layout) {
            let op = ptr as *mut ArenaOp<H>;
            unsafe {
                ptr::write(
                    op,
                    ArenaOp {
                        head: OpHead {
                            next: ptr::null_mut(),
                            on_complete: arena_complete::<H>,
                        },
                        handler,
                    },
                );
            }
            return op as *mut OpHead;
        }
    }
    let layout = Layout::new::<HeapOp<H, A>>();
    unsafe {
        let op = alloc.alloc(layout) as *mut HeapOp<H, A>;
        ptr::write(
            op,
            HeapOp {
                head: OpHead {
                    next: ptr::null_mut(),
                    on_complete: heap_complete::<H, A>,
                },
                handler,
                alloc: alloc.clone(),
            },
        );
        op as *mut OpHead
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::alloc::HeapAlloc;
    use crate::GrpcContext;

    struct CountingHandler {
        invoked: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    impl OpHandler for CountingHandler {
        fn on_complete(self, ok: bool) {
            assert!(ok);
            self.invoked.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for CountingHandler {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_complete_invokes_handler_exactly_once() {
        let ctx = GrpcContext::new();
        let invoked = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let op = alloc_op(
            ctx.inner(),
            &HeapAlloc,
            CountingHandler {
                invoked: invoked.clone(),
                dropped: dropped.clone(),
            },
        );
        unsafe { OpHead::complete(op, ctx.inner(), true, true) };
        assert_eq!(1, invoked.load(Ordering::SeqCst));
        assert_eq!(1, dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drain_frees_without_invoking() {
        let ctx = GrpcContext::new();
        let invoked = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let op = alloc_op(
            ctx.inner(),
            &HeapAlloc,
            CountingHandler {
                invoked: invoked.clone(),
                dropped: dropped.clone(),
            },
        );
        unsafe { OpHead::complete(op, ctx.inner(), false, false) };
        assert_eq!(0, invoked.load(Ordering::SeqCst));
        assert_eq!(1, dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_thread_allocates_from_arena() {
        let ctx = GrpcContext::new();
        // An empty poll claims the worker identity for this thread.
        ctx.poll();
        assert!(ctx.inner().is_running_in_this_thread());
        let invoked = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let handler = || CountingHandler {
            invoked: invoked.clone(),
            dropped: dropped.clone(),
        };
        let op = alloc_op(ctx.inner(), &HeapAlloc, handler());
        let first = op as usize;
        unsafe { OpHead::complete(op, ctx.inner(), true, true) };
        // The freed arena block is recycled for the next record of the
        // same size class.
        let op = alloc_op(ctx.inner(), &HeapAlloc, handler());
        assert_eq!(first, op as usize);
        unsafe { OpHead::complete(op, ctx.inner(), true, true) };
        assert_eq!(2, invoked.load(Ordering::SeqCst));
        assert_eq!(2, dropped.load(Ordering::SeqCst));
    }
}
