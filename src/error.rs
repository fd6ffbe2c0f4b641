// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types returned by worker pools, stages and pipelines.

use std::fmt;
use thiserror::Error;

/// Result type alias for pipelight operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipelight operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A worker pool, stage, clock or pipeline was configured with invalid
    /// parameters. Always reported at construction time, before any thread is
    /// spawned.
    #[error("Invalid configuration for {target}: {reason}")]
    InvalidConfiguration {
        /// The component that was misconfigured, e.g. `stage #1 'Security
        /// Check'`.
        target: String,
        /// Explanation of why it's invalid.
        reason: String,
    },

    /// A job was submitted after the pool started shutting down.
    #[error("The worker pool is closed and cannot accept new jobs")]
    PoolClosed,
}

impl Error {
    /// Shorthand to build an [`Error::InvalidConfiguration`].
    pub(crate) fn invalid(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfiguration {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// An item that a closed stage refused to accept, handed back to the caller.
///
/// Converts into [`Error::PoolClosed`] when the item itself isn't needed.
pub struct Rejected<T>(pub T);

impl<T> Rejected<T> {
    /// Returns the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

impl<T> From<Rejected<T>> for Error {
    fn from(_: Rejected<T>) -> Self {
        Error::PoolClosed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_invalid_configuration_message_names_target() {
        let err = Error::invalid("stage #1 'Security Check'", "zero workers");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for stage #1 'Security Check': zero workers"
        );
    }

    #[test]
    fn test_rejected_converts_to_pool_closed() {
        let rejected = Rejected("Person 1");
        assert_eq!(format!("{rejected:?}"), "Rejected(..)");
        let err: Error = rejected.into();
        assert_eq!(err, Error::PoolClosed);
    }

    #[test]
    fn test_rejected_into_inner() {
        assert_eq!(Rejected(42).into_inner(), 42);
    }
}
