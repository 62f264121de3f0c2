// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::{error, fmt, result};

/// Errors generated by this crate.
///
/// Completion results are deliberately not part of this taxonomy: a
/// completion that did not succeed (a cancelled alarm, a torn-down call) is
/// reported as the `bool` handed to its handler, never as an `Error`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The completion queue is shutting down and no further work can be
    /// submitted to it.
    QueueShutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueShutdown => write!(f, "completion queue is shutting down"),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            "completion queue is shutting down",
            format!("{}", Error::QueueShutdown)
        );
    }
}
