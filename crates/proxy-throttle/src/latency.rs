//! Simulated latency for outbound connections.
//!
//! A connect that completes faster than the engine's configured latency is
//! held back until the latency has elapsed; a slower one is left alone.

use std::fmt::Display;
use std::future::Future;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::{self, Either};
use tor_rtcompat::{NetStreamProvider, SleepProvider};
use tracing::{debug, trace};

use crate::{CancelToken, Error, RateLimitEngine};

/// How long a single connect took, and how long it appeared to take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct ConnectTimings {
    /// Wall-clock time at which we started connecting.
    pub started: SystemTime,
    /// Monotonic time at which we started connecting.
    pub start: Instant,
    /// When the underlying connect actually completed.
    pub real_end: Instant,
    /// When we handed the connection back, after any padding.
    pub observed_end: Instant,
}

impl ConnectTimings {
    /// Return how long the underlying connect took.
    pub fn real(&self) -> Duration {
        self.real_end.saturating_duration_since(self.start)
    }

    /// Return how long the connect appeared to take.
    pub fn observed(&self) -> Duration {
        self.observed_end.saturating_duration_since(self.start)
    }

    /// Return how much delay we added.
    pub fn added(&self) -> Duration {
        self.observed_end.saturating_duration_since(self.real_end)
    }
}

/// Something that wants to know about connection timings.
///
/// Typically this feeds a request log.
pub trait ConnectTimingSink {
    /// Record the timings of one successful connect.
    fn record_connect(&self, timings: &ConnectTimings);
}

impl<F> ConnectTimingSink for F
where
    F: Fn(&ConnectTimings),
{
    fn record_connect(&self, timings: &ConnectTimings) {
        self(timings);
    }
}

/// A connect hook that pads connections out to an engine's latency.
///
/// The latency is read from the engine on every connect, so changes to it
/// apply to the next connection.  Padding happens whether or not throttling
/// is enabled.
pub struct ConnectLatency<R: SleepProvider> {
    /// Where we get the latency, the clock, and sleeps.
    engine: Arc<RateLimitEngine<R>>,
}

impl<R: SleepProvider> Clone for ConnectLatency<R> {
    fn clone(&self) -> Self {
        ConnectLatency {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<R: SleepProvider> std::fmt::Debug for ConnectLatency<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectLatency").finish_non_exhaustive()
    }
}

impl<R: SleepProvider> ConnectLatency<R> {
    /// Make a new hook for `engine`.
    pub(crate) fn new(engine: Arc<RateLimitEngine<R>>) -> Self {
        ConnectLatency { engine }
    }

    /// Run `connect`, a connection attempt to `target`, padding it to the
    /// configured latency.
    ///
    /// On success, the timings are reported to `sink`.  If `connect` fails,
    /// its error is returned at once and nothing is reported.  If `cancel`
    /// is cancelled while we are padding, the new connection is dropped and
    /// we return an [`Interrupted`](std::io::ErrorKind::Interrupted) error.
    pub async fn connect<T, K, S, F>(
        &self,
        target: &T,
        sink: &K,
        cancel: &CancelToken,
        connect: F,
    ) -> IoResult<S>
    where
        T: Display + ?Sized,
        K: ConnectTimingSink + ?Sized,
        F: Future<Output = IoResult<S>>,
    {
        let runtime = self.engine.runtime();
        let started = runtime.wallclock();
        let start = runtime.now();

        let stream = connect.await?;

        let real_end = runtime.now();
        let real = real_end.saturating_duration_since(start);
        let pad = self.engine.latency().saturating_sub(real);
        if pad.is_zero() {
            trace!(%target, ?real, "Connect slower than simulated latency");
        } else {
            debug!(%target, ?real, ?pad, "Padding connect to simulated latency");
            let sleep = pin!(runtime.sleep(pad));
            if let Either::Right(((), _)) = future::select(sleep, cancel.cancelled()).await {
                debug!(%target, "Connect cancelled during latency padding");
                return Err(Error::Cancelled.into());
            }
        }

        sink.record_connect(&ConnectTimings {
            started,
            start,
            real_end,
            observed_end: runtime.now(),
        });
        Ok(stream)
    }

    /// Connect to `addr` over `net`, padding the connect to the configured
    /// latency.
    pub async fn connect_with<N, K>(
        &self,
        net: &N,
        addr: &SocketAddr,
        sink: &K,
        cancel: &CancelToken,
    ) -> IoResult<N::Stream>
    where
        N: NetStreamProvider<SocketAddr>,
        K: ConnectTimingSink + ?Sized,
    {
        self.connect(addr, sink, cancel, net.connect(addr)).await
    }
}
