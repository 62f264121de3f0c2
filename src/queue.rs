// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Intrusive queues of operation records.
//!
//! Records link through their embedded `next` pointer, so queue membership
//! never allocates. The single-threaded FIFO backs the worker's local
//! queue; the atomic multi-producer queue backs the remote queue. The
//! remote queue is a LIFO under the hood and is reversed into FIFO order
//! when the worker drains it, so cross-thread posts are FIFO per drain
//! window rather than globally.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::op::OpHead;

/// Single-threaded FIFO. O(1) push, pop and splice.
pub(crate) struct OpQueue {
    head: *mut OpHead,
    tail: *mut OpHead,
}

impl OpQueue {
    pub const fn new() -> OpQueue {
        OpQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Consumes a LIFO chain and returns it in FIFO order.
    pub fn make_reversed(mut list: *mut OpHead) -> OpQueue {
        let mut head = ptr::null_mut();
        let tail = list;
        while !list.is_null() {
            let next = unsafe { (*list).next };
            unsafe { (*list).next = head };
            head = list;
            list = next;
        }
        OpQueue { head, tail }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn push_back(&mut self, op: *mut OpHead) {
        unsafe { (*op).next = ptr::null_mut() };
        if self.tail.is_null() {
            self.head = op;
        } else {
            unsafe { (*self.tail).next = op };
        }
        self.tail = op;
    }

    pub fn pop_front(&mut self) -> *mut OpHead {
        let op = self.head;
        if op.is_null() {
            return op;
        }
        self.head = unsafe { (*op).next };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        op
    }

    pub fn append(&mut self, mut other: OpQueue) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.head = other.head;
        } else {
            unsafe { (*self.tail).next = other.head };
        }
        self.tail = other.tail;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
    }
}

// Some stable address that can never be the address of a valid record.
// A static rather than a field address: the queue is moved around during
// context construction and a self-referential sentinel would go stale.
static INACTIVE: u8 = 0;

fn inactive() -> *mut OpHead {
    &INACTIVE as *const u8 as *mut OpHead
}

/// Multi-producer single-consumer queue with an inactive marker.
///
/// The head pointer has three meanings: null (empty, consumer awake), the
/// inactive sentinel (empty, consumer asleep and in need of a wake-up on
/// the next push) or the top of a LIFO chain of pending records. Producers
/// only ever compare-and-swap; the consumer drains with a single exchange.
pub(crate) struct AtomicOpQueue {
    head: AtomicPtr<OpHead>,
}

impl AtomicOpQueue {
    /// Creates the queue in the inactive state: the first producer is
    /// responsible for waking the consumer.
    pub fn new() -> AtomicOpQueue {
        AtomicOpQueue {
            head: AtomicPtr::new(inactive()),
        }
    }

    /// Pushes a record. Returns true when the consumer was inactive; the
    /// caller must then wake it.
    pub fn enqueue(&self, op: *mut OpHead) -> bool {
        let inactive = inactive();
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            let next = if old == inactive { ptr::null_mut() } else { old };
            unsafe { (*op).next = next };
            match self
                .head
                .compare_exchange_weak(old, op, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return old == inactive,
                Err(v) => old = v,
            }
        }
    }

    /// Drains every pending record in FIFO order. Leaves the queue active.
    pub fn dequeue_all(&self) -> OpQueue {
        let inactive = inactive();
        let value = self.head.load(Ordering::Relaxed);
        if value.is_null() || value == inactive {
            return OpQueue::new();
        }
        let value = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        if value.is_null() || value == inactive {
            return OpQueue::new();
        }
        OpQueue::make_reversed(value)
    }

    /// Attempts the empty-to-inactive transition. On success the next
    /// `enqueue` reports that a wake-up is required.
    pub fn try_mark_inactive(&self) -> bool {
        self.head
            .compare_exchange(
                ptr::null_mut(),
                inactive(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Marks the queue inactive if it is empty, otherwise drains it.
    /// An empty result means the queue is inactive and the consumer may
    /// sleep: the next producer will request a wake-up.
    pub fn try_mark_inactive_or_dequeue_all(&self) -> OpQueue {
        // Spurious wake-ups can land here with the queue already inactive;
        // it must stay that way.
        if self.head.load(Ordering::Relaxed) == inactive() {
            return OpQueue::new();
        }
        if self.try_mark_inactive() {
            return OpQueue::new();
        }
        let value = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        if value.is_null() || value == inactive() {
            return OpQueue::new();
        }
        OpQueue::make_reversed(value)
    }
}
