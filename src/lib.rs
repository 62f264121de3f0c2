// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! An asynchronous execution context driving a gRPC completion queue.
//!
//! The gRPC C core reports asynchronous completions through a completion
//! queue: a C-style event loop handing back `(tag, ok)` pairs, one blocking
//! call per event. [`GrpcContext`] turns that loop into a conventional
//! executor. A single worker thread multiplexes two event sources, work
//! posted through [`GrpcExecutor`] handles and completion-queue events,
//! onto one cooperatively scheduled loop. [`Alarm`] schedules cancellable
//! deadline completions, [`Waiter`] decouples starting a one-shot operation
//! from awaiting its result, and `spawn` drives ordinary `futures` tasks on
//! the worker.
//!
//! ```no_run
//! use grpcio_exec::GrpcContext;
//!
//! let ctx = GrpcContext::new();
//! let exec = ctx.executor();
//! exec.post(|| println!("runs on the worker thread"));
//! ctx.run();
//! ```

extern crate grpcio_sys as grpc_sys;

mod alarm;
mod alloc;
mod context;
mod cq;
mod error;
mod executor;
mod op;
mod queue;
mod sync;
mod task;
mod waiter;

pub use crate::alarm::{Alarm, AlarmFuture};
pub use crate::alloc::{HeapAlloc, WorkAlloc};
pub use crate::context::GrpcContext;
pub use crate::cq::Deadline;
pub use crate::error::{Error, Result};
pub use crate::executor::{GrpcExecutor, Schedule};
pub use crate::waiter::{Wait, Waiter, WaiterHandle};
