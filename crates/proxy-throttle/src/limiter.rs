use std::io::Result as IoResult;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{self, Either};
use futures::io::{AsyncWrite, AsyncWriteExt as _};
use rand::Rng as _;
use serde::Serialize;
use tor_rtcompat::SleepProvider;
use tracing::{debug, info, trace};

use crate::budget::{BudgetState, DirectionBudget, QuotaStatus, DEFAULT_PAYLOAD_PERCENT};
use crate::{
    BandwidthRate, CancelToken, ConnectLatency, Direction, Error, ThrottleConfig, ThrottledReader,
    ThrottledWriter,
};

/// Engine-wide settings that aren't specific to one direction.
#[derive(Clone, Debug)]
struct Settings {
    /// No direction may ever be configured faster than this.
    ceiling: BandwidthRate,
    /// Percentage of each configured rate usable for payload.
    payload_percent: u8,
    /// Extra delay added to every outbound connect.
    latency: Duration,
}

/// Shared bandwidth limiter for every stream belonging to one proxy.
///
/// There is exactly one upstream and one downstream budget.  All streams
/// wrapped by the same engine draw from them, so the limits apply to the
/// aggregate traffic, not to each connection.
///
/// The engine starts out disabled: until [`enable`](RateLimitEngine::enable)
/// is called, throttled streams are plain pass-throughs.
pub struct RateLimitEngine<R: SleepProvider> {
    /// Source of time and sleeps.
    runtime: R,
    /// If false, we don't throttle or account anything.
    enabled: AtomicBool,
    /// Ceiling, payload efficiency and latency.
    ///
    /// Lock order: always take this before a direction's lock.
    settings: Mutex<Settings>,
    /// Budget for data we read.
    downstream: Mutex<DirectionBudget>,
    /// Budget for data we write.
    upstream: Mutex<DirectionBudget>,
}

impl<R: SleepProvider> RateLimitEngine<R> {
    /// Create a new, disabled engine whose rates are limited only by `ceiling`.
    pub fn new(runtime: R, ceiling: BandwidthRate) -> Arc<Self> {
        let now = runtime.now();
        Arc::new(RateLimitEngine {
            enabled: AtomicBool::new(false),
            settings: Mutex::new(Settings {
                ceiling,
                payload_percent: DEFAULT_PAYLOAD_PERCENT,
                latency: Duration::ZERO,
            }),
            downstream: Mutex::new(DirectionBudget::new(ceiling, DEFAULT_PAYLOAD_PERCENT, now)),
            upstream: Mutex::new(DirectionBudget::new(ceiling, DEFAULT_PAYLOAD_PERCENT, now)),
            runtime,
        })
    }

    /// Create a new engine configured from `config`.
    pub fn from_config(runtime: R, config: &ThrottleConfig) -> Arc<Self> {
        let engine = Self::new(runtime, config.rate_ceiling);
        engine.reconfigure(config);
        engine
    }

    /// Replace every setting of this engine with the ones in `config`.
    ///
    /// Quotas are reset, and both directions start a fresh interval.
    pub fn reconfigure(&self, config: &ThrottleConfig) {
        let mut settings = self.settings.lock().expect("poisoned lock");
        settings.ceiling = config.rate_ceiling;
        settings.payload_percent = normalize_payload_percent(config.payload_percent);
        settings.latency = config.latency;
        let now = self.runtime.now();
        for direction in [Direction::Downstream, Direction::Upstream] {
            let mut budget = self.lock(direction);
            budget.set_requested(config.rate(direction));
            let rate = budget.clamped_rate(settings.ceiling);
            budget.configure(rate, settings.payload_percent, now);
            budget.set_quota(config.quota(direction));
        }
        self.enabled.store(config.enabled, Ordering::SeqCst);
        debug!(
            enabled = config.enabled,
            ceiling = %settings.ceiling,
            "Reconfigured bandwidth throttling"
        );
    }

    /// Start throttling every stream wrapped by this engine.
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            debug!("Bandwidth throttling enabled");
        }
    }

    /// Stop throttling: wrapped streams become pass-throughs.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            debug!("Bandwidth throttling disabled");
        }
    }

    /// Return true if this engine is currently throttling.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Change the ceiling that bounds both directions' rates.
    ///
    /// Each direction is re-clamped against the new ceiling, starting from
    /// whatever rate was last explicitly requested for it: raising the
    /// ceiling never takes a direction beyond what was asked for.
    pub fn set_rate_ceiling(&self, ceiling: BandwidthRate) {
        let mut settings = self.settings.lock().expect("poisoned lock");
        settings.ceiling = ceiling;
        let now = self.runtime.now();
        for direction in [Direction::Downstream, Direction::Upstream] {
            let mut budget = self.lock(direction);
            let rate = budget.clamped_rate(ceiling);
            budget.configure(rate, settings.payload_percent, now);
        }
        debug!(%ceiling, "Changed bandwidth ceiling");
    }

    /// Return the current rate ceiling.
    pub fn rate_ceiling(&self) -> BandwidthRate {
        self.settings.lock().expect("poisoned lock").ceiling
    }

    /// Set the target rate for `direction`, clamped to the ceiling.
    ///
    /// `None` means "as fast as the ceiling allows".  The new rate takes
    /// effect immediately, without waiting for the current interval to end.
    /// A zero rate stops all throttled traffic in `direction` until the rate
    /// is changed again.
    pub fn set_rate(&self, direction: Direction, rate: Option<BandwidthRate>) {
        let settings = self.settings.lock().expect("poisoned lock");
        let mut budget = self.lock(direction);
        budget.set_requested(rate);
        let clamped = budget.clamped_rate(settings.ceiling);
        budget.configure(clamped, settings.payload_percent, self.runtime.now());
        debug!(%direction, rate = %clamped, "Changed bandwidth limit");
    }

    /// Set the target download rate, clamped to the ceiling.
    pub fn set_downstream_rate(&self, rate: BandwidthRate) {
        self.set_rate(Direction::Downstream, Some(rate));
    }

    /// Set the target upload rate, clamped to the ceiling.
    pub fn set_upstream_rate(&self, rate: BandwidthRate) {
        self.set_rate(Direction::Upstream, Some(rate));
    }

    /// Return the rate in effect for `direction`, before overhead correction.
    pub fn rate(&self, direction: Direction) -> BandwidthRate {
        self.lock(direction).configured()
    }

    /// Return the rate in effect for downloads.
    pub fn downstream_rate(&self) -> BandwidthRate {
        self.rate(Direction::Downstream)
    }

    /// Return the rate in effect for uploads.
    pub fn upstream_rate(&self) -> BandwidthRate {
        self.rate(Direction::Upstream)
    }

    /// Set the percentage of each rate that is usable for payload.
    ///
    /// The rest models protocol overhead.  Values outside `1..=100` are
    /// replaced with the default of 95; this is not an error.
    pub fn set_payload_efficiency(&self, percent: i32) {
        let mut settings = self.settings.lock().expect("poisoned lock");
        settings.payload_percent = normalize_payload_percent(percent);
        let now = self.runtime.now();
        for direction in [Direction::Downstream, Direction::Upstream] {
            let mut budget = self.lock(direction);
            let rate = budget.configured();
            budget.configure(rate, settings.payload_percent, now);
        }
    }

    /// Return the payload efficiency, in percent.
    pub fn payload_efficiency(&self) -> u8 {
        self.settings.lock().expect("poisoned lock").payload_percent
    }

    /// Limit the total number of bytes transferred in `direction` to `total`.
    ///
    /// Zero removes the limit.  Any previous consumption is forgotten.
    pub fn set_quota(&self, direction: Direction, total: u64) {
        self.lock(direction).set_quota(total);
        debug!(%direction, total, "Set transfer quota");
    }

    /// Return the quota for `direction`.
    pub fn quota(&self, direction: Direction) -> QuotaStatus {
        self.lock(direction).quota()
    }

    /// Set the minimum time that every outbound connect should appear to take.
    pub fn set_latency(&self, latency: Duration) {
        self.settings.lock().expect("poisoned lock").latency = latency;
    }

    /// Return the simulated connect latency.
    pub fn latency(&self) -> Duration {
        self.settings.lock().expect("poisoned lock").latency
    }

    /// Return where `direction`'s budget stands in its current interval.
    pub fn budget_state(&self, direction: Direction) -> BudgetState {
        self.lock(direction).state(self.runtime.now())
    }

    /// Return a snapshot of every limit, suitable for a management API.
    pub fn limits(&self) -> BandwidthLimits {
        let settings = self.settings.lock().expect("poisoned lock").clone();
        let direction_limits = |direction| {
            let budget = self.lock(direction);
            DirectionLimits {
                rate: budget.configured(),
                adjusted_rate: BandwidthRate::from_bytes_per_sec(budget.adjusted_bytes_per_sec()),
                quota: budget.quota(),
            }
        };
        BandwidthLimits {
            enabled: self.is_enabled(),
            rate_ceiling: settings.ceiling,
            payload_percent: settings.payload_percent,
            latency: settings.latency,
            downstream: direction_limits(Direction::Downstream),
            upstream: direction_limits(Direction::Upstream),
        }
    }

    /// Ask permission to move up to `len` bytes in `direction`, without waiting.
    ///
    /// On success, return a [`Permit`] for at least one byte (unless `len` is
    /// zero) and no more than `len`.  If the direction's budget is used up,
    /// return how long to wait before asking again.
    ///
    /// When the engine is disabled, the permit is always for `len` bytes and
    /// nothing is accounted.
    pub fn try_acquire(&self, direction: Direction, len: usize) -> Result<Permit<'_, R>, Duration> {
        if !self.is_enabled() || len == 0 {
            return Ok(Permit {
                n: len,
                engine: self,
                direction: None,
            });
        }
        let now = self.runtime.now();
        let mut budget = self.lock(direction);
        let n = budget.try_acquire(len, now);
        if n > 0 {
            trace!(
                %direction,
                requested = len,
                granted = n,
                remaining = budget.remaining_tokens(),
                "Granted bandwidth"
            );
            return Ok(Permit {
                n,
                engine: self,
                direction: Some(direction),
            });
        }
        let jitter = rand::rng().random_range(0..=direction.max_jitter_ms());
        Err(budget.time_to_next_reset(now) + Duration::from_millis(jitter))
    }

    /// Wait until we may move up to `len` bytes in `direction`.
    ///
    /// Returns `None` if `cancel` is cancelled before any bandwidth is
    /// granted.  A disabled engine grants `len` bytes at once, even if
    /// `cancel` has already been cancelled.
    pub async fn acquire(
        &self,
        direction: Direction,
        len: usize,
        cancel: &CancelToken,
    ) -> Option<Permit<'_, R>> {
        loop {
            if cancel.is_cancelled() && self.is_enabled() {
                return None;
            }
            let wait = match self.try_acquire(direction, len) {
                Ok(permit) => return Some(permit),
                Err(wait) => wait,
            };
            trace!(%direction, ?wait, "Bandwidth exhausted; waiting");
            let sleep = pin!(self.runtime.sleep(wait));
            if let Either::Right(((), _)) = future::select(sleep, cancel.cancelled()).await {
                debug!(%direction, "Wait for bandwidth cancelled");
                return None;
            }
        }
    }

    /// Wait until we may read up to `len` bytes.
    pub async fn acquire_read_permit(
        &self,
        len: usize,
        cancel: &CancelToken,
    ) -> Option<Permit<'_, R>> {
        self.acquire(Direction::Downstream, len, cancel).await
    }

    /// Wait until we may write up to `len` bytes.
    pub async fn acquire_write_permit(
        &self,
        len: usize,
        cancel: &CancelToken,
    ) -> Option<Permit<'_, R>> {
        self.acquire(Direction::Upstream, len, cancel).await
    }

    /// Write all of `buf` to `writer`, as fast as the upstream budget allows.
    ///
    /// The data goes out in chunks no larger than each interval's allowance,
    /// and the upstream quota is checked after every chunk.  Returns the
    /// number of bytes written: this is less than `buf.len()` only if `cancel`
    /// was cancelled part way through.
    pub async fn write_all_throttled<W>(
        &self,
        writer: &mut W,
        buf: &[u8],
        cancel: &CancelToken,
    ) -> IoResult<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !self.is_enabled() {
            writer.write_all(buf).await?;
            return Ok(buf.len());
        }
        let mut written = 0;
        while written < buf.len() {
            let Some(permit) = self.acquire_write_permit(buf.len() - written, cancel).await else {
                debug!(written, total = buf.len(), "Throttled write cancelled");
                return Ok(written);
            };
            let chunk = &buf[written..written + permit.len()];
            if let Err(e) = writer.write_all(chunk).await {
                permit.unused();
                return Err(e);
            }
            written += chunk.len();
            permit.used(chunk.len())?;
        }
        Ok(written)
    }

    /// Wrap `io` so that reads from it count against the downstream budget.
    ///
    /// All streams wrapped by the same engine share the same limits.
    pub fn limit_read<T>(self: &Arc<Self>, io: T, cancel: CancelToken) -> ThrottledReader<R, T> {
        ThrottledReader::new(Arc::clone(self), cancel, io)
    }

    /// Wrap `io` so that writes to it count against the upstream budget.
    pub fn limit_write<T>(self: &Arc<Self>, io: T, cancel: CancelToken) -> ThrottledWriter<R, T> {
        ThrottledWriter::new(Arc::clone(self), cancel, io)
    }

    /// Return a connect hook that pads connections out to this engine's latency.
    pub fn connect_latency(self: &Arc<Self>) -> ConnectLatency<R> {
        ConnectLatency::new(Arc::clone(self))
    }

    /// Return the runtime we use for time and sleeping.
    pub(crate) fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Lock and return the budget for `direction`.
    fn lock(&self, direction: Direction) -> MutexGuard<'_, DirectionBudget> {
        let budget = match direction {
            Direction::Downstream => &self.downstream,
            Direction::Upstream => &self.upstream,
        };
        budget.lock().expect("poisoned lock")
    }

    /// Return `unused` bytes to `direction`'s current interval.
    fn refund(&self, direction: Direction, unused: usize) {
        let now = self.runtime.now();
        self.lock(direction).refund(unused, now);
    }

    /// Return `unused` bytes to `direction` and charge `used` bytes to its quota.
    fn settle(&self, direction: Direction, unused: usize, used: usize) -> crate::Result<()> {
        let now = self.runtime.now();
        let mut budget = self.lock(direction);
        if unused > 0 {
            budget.refund(unused, now);
        }
        let already_over = budget.quota().remaining < 0;
        if budget.consume_quota(used) {
            let limit = budget.quota().total;
            if already_over {
                debug!(%direction, limit, "Transfer quota still exhausted");
            } else {
                info!(%direction, limit, "Transfer quota exhausted");
            }
            return Err(Error::QuotaExceeded { direction, limit });
        }
        Ok(())
    }
}

/// Map an arbitrary percentage onto a usable payload efficiency.
fn normalize_payload_percent(percent: i32) -> u8 {
    match u8::try_from(percent) {
        Ok(p @ 1..=100) => p,
        _ => {
            debug!(percent, "Ignoring out-of-range payload efficiency");
            DEFAULT_PAYLOAD_PERCENT
        }
    }
}

/// Permission to move a certain number of bytes through a [`RateLimitEngine`].
///
/// Once the I/O has happened, report how much of the permit was actually
/// used with [`used`](Permit::used); if the I/O didn't happen at all, call
/// [`unused`](Permit::unused).  Either way, the bytes that weren't moved go
/// back to the budget.  Dropping a permit without reporting on it counts as
/// [`unused`](Permit::unused).
#[must_use = "a Permit must be reported as used or unused"]
pub struct Permit<'a, R: SleepProvider> {
    /// How many bytes we may move.
    n: usize,
    /// The engine that granted us.
    engine: &'a RateLimitEngine<R>,
    /// The budget we were drawn from, or `None` for a pass-through permit.
    direction: Option<Direction>,
}

impl<'a, R: SleepProvider> Permit<'a, R> {
    /// Return the number of bytes this permit allows.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Return true if this permit allows nothing.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Report that `actual` bytes of this permit were moved.
    ///
    /// Returns [`Error::QuotaExceeded`] if doing so overran the direction's
    /// quota.
    pub fn used(mut self, actual: usize) -> crate::Result<()> {
        debug_assert!(actual <= self.n);
        let n = std::mem::take(&mut self.n);
        match self.direction {
            Some(direction) => self.engine.settle(direction, n.saturating_sub(actual), actual),
            None => Ok(()),
        }
    }

    /// Report that none of this permit was used.
    pub fn unused(mut self) {
        self.put_back();
    }

    /// Return whatever is left of this permit to the budget.
    fn put_back(&mut self) {
        let n = std::mem::take(&mut self.n);
        if let Some(direction) = self.direction {
            if n > 0 {
                self.engine.refund(direction, n);
            }
        }
    }
}

impl<R: SleepProvider> Drop for Permit<'_, R> {
    fn drop(&mut self) {
        self.put_back();
    }
}

/// A snapshot of an engine's configuration and quota usage.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct BandwidthLimits {
    /// Whether throttling is active.
    pub enabled: bool,
    /// The ceiling for both directions.
    pub rate_ceiling: BandwidthRate,
    /// Percentage of each rate usable for payload.
    pub payload_percent: u8,
    /// Simulated connect latency.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Limits on data we receive.
    pub downstream: DirectionLimits,
    /// Limits on data we send.
    pub upstream: DirectionLimits,
}

/// The limits in effect for one direction.
#[derive(Clone, Copy, Debug, Serialize)]
#[non_exhaustive]
pub struct DirectionLimits {
    /// Configured rate, after clamping to the ceiling.
    pub rate: BandwidthRate,
    /// Rate actually available to payload.
    pub adjusted_rate: BandwidthRate,
    /// The total-transfer quota.
    pub quota: QuotaStatus,
}

impl<R: SleepProvider> std::fmt::Debug for RateLimitEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitEngine")
            .field("enabled", &self.is_enabled())
            .field("settings", &self.settings)
            .field("downstream", &self.downstream)
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

impl<R: SleepProvider> std::fmt::Debug for Permit<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("n", &self.n)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}
