#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list @@

//! <!-- @@ end lint list @@ -->

//! ## Design
//!
//! Every throttled stream holds a reference to a single [`RateLimitEngine`],
//! from which it asks permission before each read or write.  The engine keeps
//! one token bucket per direction, refilled twice a second, each behind its
//! own lock.  A permit can be handed back (in whole or in part) when the
//! underlying transport moves fewer bytes than it was allowed to: the kernel
//! will often do exactly that.
//!
//! When a bucket is empty, the caller sleeps until the next refill, plus a
//! little random jitter so that a crowd of blocked streams doesn't wake up in
//! lock-step.  There is no fairness between streams: whoever asks first gets
//! what is left, up to the whole interval's allowance.
//!
//! All sleeping goes through a [`SleepProvider`](tor_rtcompat::SleepProvider),
//! so the engine can be driven by mocked time in tests.

mod budget;
mod cancel;
mod config;
mod err;
mod io;
mod latency;
mod limiter;
mod rate;

use derive_more::Display;

pub use budget::{BudgetState, QuotaStatus};
pub use cancel::{CancelToken, Cancelled};
pub use config::{ThrottleConfig, ThrottleConfigBuilder};
pub use err::{throttle_error, ConfigBuildError, Error};
pub use io::{ThrottledReader, ThrottledWriter};
pub use latency::{ConnectLatency, ConnectTimingSink, ConnectTimings};
pub use limiter::{BandwidthLimits, DirectionLimits, Permit, RateLimitEngine};
pub use rate::BandwidthRate;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// One of the two directions in which traffic is limited.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
#[allow(clippy::exhaustive_enums)] // There are only ever two directions.
pub enum Direction {
    /// Data we send: client requests on their way to the server.
    #[display("upstream")]
    Upstream,
    /// Data we receive: responses on their way back to the client.
    #[display("downstream")]
    Downstream,
}

impl Direction {
    /// Return the largest random delay, in milliseconds, added to a wait for
    /// bandwidth in this direction.
    pub(crate) fn max_jitter_ms(self) -> u64 {
        match self {
            Direction::Upstream => 10,
            Direction::Downstream => 20,
        }
    }
}
