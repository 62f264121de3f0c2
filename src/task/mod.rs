// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Driving `futures` tasks on the worker thread.

mod executor;

pub(crate) use self::executor::spawn;
