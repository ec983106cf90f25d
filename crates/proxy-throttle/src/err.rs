//! Declare error types for proxy-throttle.

use std::io;

use thiserror::Error;

use crate::Direction;

/// An error produced while moving data through a throttled stream.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A total-transfer quota was overrun.
    ///
    /// The operation that crossed the limit fails; later operations in the
    /// same direction will keep failing until the quota is reset.
    #[error("Maximum {direction} transfer allowance of {limit} bytes exceeded")]
    QuotaExceeded {
        /// Which direction ran out.
        direction: Direction,
        /// The quota that was configured for that direction, in bytes.
        limit: u64,
    },

    /// A throttled operation was abandoned because its [`CancelToken`](crate::CancelToken)
    /// was cancelled.
    #[error("Throttled operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Return true if this is a quota failure.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match &err {
            Error::QuotaExceeded { .. } => io::ErrorKind::Other,
            Error::Cancelled => io::ErrorKind::Interrupted,
        };
        io::Error::new(kind, err)
    }
}

/// An error produced while building a [`ThrottleConfig`](crate::ThrottleConfig).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
    /// A single field had a value that proved to be unusable.
    #[error("Value of {field} was incorrect: {problem}")]
    Invalid {
        /// The name of the invalid field.
        field: String,
        /// A description of the problem.
        problem: String,
    },
}

impl From<derive_builder::UninitializedFieldError> for ConfigBuildError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        ConfigBuildError::MissingField {
            field: val.field_name().to_string(),
        }
    }
}

/// Return the [`Error`] wrapped inside `err`, if there is one.
///
/// Throttled streams report quota failures as [`io::Error`]s; this recovers
/// the underlying throttling error.
pub fn throttle_error(err: &io::Error) -> Option<&Error> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn io_roundtrip() {
        let e = Error::QuotaExceeded {
            direction: Direction::Upstream,
            limit: 10_000,
        };
        assert_eq!(
            e.to_string(),
            "Maximum upstream transfer allowance of 10000 bytes exceeded"
        );
        let io_err: io::Error = e.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);
        assert_matches!(
            throttle_error(&io_err),
            Some(Error::QuotaExceeded {
                direction: Direction::Upstream,
                limit: 10_000
            })
        );

        let io_err: io::Error = Error::Cancelled.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Interrupted);

        let plain = io::Error::new(io::ErrorKind::BrokenPipe, "nope");
        assert!(throttle_error(&plain).is_none());
    }
}
