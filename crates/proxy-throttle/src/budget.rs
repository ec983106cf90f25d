//! Token-bucket state for a single direction of traffic.
//!
//! A [`DirectionBudget`] is plain arithmetic: it never sleeps, never does I/O,
//! and takes the current time as an argument.  The engine keeps one per
//! direction, each behind its own lock.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::rate::BandwidthRate;

/// How many times per second a budget is refilled.
pub(crate) const SUB_INTERVALS: u32 = 2;

/// The length of one refill period.
#[allow(clippy::cast_lossless)] // u64::from isn't usable in a const.
pub(crate) const SUB_INTERVAL: Duration = Duration::from_millis(1000 / SUB_INTERVALS as u64);

/// Payload efficiency used when no valid value has been supplied, in percent.
pub(crate) const DEFAULT_PAYLOAD_PERCENT: u8 = 95;

/// Where a budget stands within its current sub-interval.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BudgetState {
    /// Nothing has been taken since the last refill.
    Full,
    /// Some, but not all, of this interval's bytes have been handed out.
    Draining,
    /// Nothing is left: callers must wait for the next refill.
    Exhausted,
}

/// The state of a total-transfer quota.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct QuotaStatus {
    /// The configured total, in bytes.  Zero means "unlimited".
    pub total: u64,
    /// How many bytes may still be transferred.
    ///
    /// Negative once the quota has been overrun by the final chunk.
    pub remaining: i64,
}

impl QuotaStatus {
    /// Return true if this quota places no limit on transfers.
    pub fn is_unlimited(&self) -> bool {
        self.total == 0
    }

    /// Return the configured total in kilobytes (1000 bytes), rounding down.
    pub fn total_kb(&self) -> u64 {
        self.total / 1000
    }

    /// Return what is left of the quota in kilobytes (1000 bytes), rounding
    /// towards zero.
    pub fn remaining_kb(&self) -> i64 {
        self.remaining / 1000
    }
}

/// Rate and quota bookkeeping for one traffic direction.
#[derive(Clone, Debug)]
pub(crate) struct DirectionBudget {
    /// The rate explicitly asked for, if any.
    ///
    /// `None` means "as fast as the ceiling allows".
    requested: Option<BandwidthRate>,
    /// The requested rate after clamping to the engine's ceiling.
    configured: BandwidthRate,
    /// Bytes per second actually handed out, after subtracting overhead.
    adjusted_bytes_per_sec: u64,
    /// Bytes handed out in the current sub-interval when it began.
    ///
    /// Sub-intervals alternate between the larger and smaller half of
    /// `adjusted_bytes_per_sec`, so odd rates lose nothing to rounding.
    allowance: u64,
    /// True if the current sub-interval got the larger half.
    first_half: bool,
    /// Bytes that may still be handed out before the next refill.
    ///
    /// Never more than [`DirectionBudget::cap`].
    remaining_tokens: u64,
    /// When we next refill `remaining_tokens`.
    next_reset_at: Instant,
    /// Total-transfer quota; 0 for unlimited.
    quota_total: u64,
    /// What is left of `quota_total`.
    quota_remaining: i64,
}

impl DirectionBudget {
    /// Make a new budget limited only by `ceiling`, with no quota.
    pub(crate) fn new(ceiling: BandwidthRate, payload_percent: u8, now: Instant) -> Self {
        let mut budget = DirectionBudget {
            requested: None,
            configured: ceiling,
            adjusted_bytes_per_sec: 0,
            allowance: 0,
            first_half: false,
            remaining_tokens: 0,
            next_reset_at: now,
            quota_total: 0,
            quota_remaining: 0,
        };
        budget.configure(ceiling, payload_percent, now);
        budget
    }

    /// Set the rate for this direction and restart the current interval.
    ///
    /// `rate` must already be clamped to the engine's ceiling.  Any nonzero
    /// rate yields at least one byte per second; a zero rate blocks all
    /// traffic until it is changed.
    pub(crate) fn configure(&mut self, rate: BandwidthRate, payload_percent: u8, now: Instant) {
        self.configured = rate;
        let adjusted =
            u128::from(rate.as_bytes_per_sec()) * u128::from(payload_percent) / 100;
        let adjusted = u64::try_from(adjusted).unwrap_or(u64::MAX);
        self.adjusted_bytes_per_sec = if rate.is_zero() { 0 } else { adjusted.max(1) };
        // The next reset flips this, so the new interval gets the larger half.
        self.first_half = false;
        self.reset(now);
    }

    /// Remember `rate` as the explicitly requested rate (or forget it, if `None`).
    pub(crate) fn set_requested(&mut self, rate: Option<BandwidthRate>) {
        self.requested = rate;
    }

    /// Return the rate this direction would use under `ceiling`.
    pub(crate) fn clamped_rate(&self, ceiling: BandwidthRate) -> BandwidthRate {
        match self.requested {
            Some(r) => r.min(ceiling),
            None => ceiling,
        }
    }

    /// Return the configured (clamped) rate.
    pub(crate) fn configured(&self) -> BandwidthRate {
        self.configured
    }

    /// Return the rate after overhead correction, in bytes per second.
    pub(crate) fn adjusted_bytes_per_sec(&self) -> u64 {
        self.adjusted_bytes_per_sec
    }

    /// Return the most bytes that can be handed out in the current sub-interval.
    pub(crate) fn cap(&self) -> u64 {
        self.allowance
    }

    /// Return the bytes still available in this sub-interval.
    pub(crate) fn remaining_tokens(&self) -> u64 {
        self.remaining_tokens
    }

    /// Refill unconditionally.
    fn reset(&mut self, now: Instant) {
        self.first_half = !self.first_half;
        let smaller = self.adjusted_bytes_per_sec / u64::from(SUB_INTERVALS);
        self.allowance = if self.first_half {
            self.adjusted_bytes_per_sec - smaller
        } else {
            smaller
        };
        self.remaining_tokens = self.allowance;
        self.next_reset_at = now + SUB_INTERVAL;
    }

    /// Refill if the current sub-interval is over.
    pub(crate) fn reset_if_due(&mut self, now: Instant) {
        if now >= self.next_reset_at {
            self.reset(now);
        }
    }

    /// Take up to `requested` bytes from this interval's pool.
    ///
    /// Returns the number of bytes granted, which may be zero.
    pub(crate) fn try_acquire(&mut self, requested: usize, now: Instant) -> usize {
        self.reset_if_due(now);
        let requested = u64::try_from(requested).unwrap_or(u64::MAX);
        let granted = requested.min(self.remaining_tokens);
        self.remaining_tokens -= granted;
        // `granted <= requested`, which came from a usize.
        usize::try_from(granted).unwrap_or(usize::MAX)
    }

    /// Give back `unused` bytes that were granted but not transferred.
    ///
    /// If the interval rolled over since the grant, the bytes go into the new
    /// interval's pool.  The pool never grows past [`DirectionBudget::cap`].
    pub(crate) fn refund(&mut self, unused: usize, now: Instant) {
        self.reset_if_due(now);
        let unused = u64::try_from(unused).unwrap_or(u64::MAX);
        self.remaining_tokens = self.remaining_tokens.saturating_add(unused).min(self.cap());
    }

    /// Charge `actual` transferred bytes against the quota.
    ///
    /// Returns true if the quota is now overrun.
    pub(crate) fn consume_quota(&mut self, actual: usize) -> bool {
        if self.quota_total == 0 {
            return false;
        }
        let actual = i64::try_from(actual).unwrap_or(i64::MAX);
        self.quota_remaining = self.quota_remaining.saturating_sub(actual);
        self.quota_remaining < 0
    }

    /// Replace the quota with `total` bytes, all of them unused.
    pub(crate) fn set_quota(&mut self, total: u64) {
        self.quota_total = total;
        self.quota_remaining = i64::try_from(total).unwrap_or(i64::MAX);
    }

    /// Return the current quota.
    pub(crate) fn quota(&self) -> QuotaStatus {
        QuotaStatus {
            total: self.quota_total,
            remaining: self.quota_remaining,
        }
    }

    /// Return how long until the next refill; zero if one is already due.
    pub(crate) fn time_to_next_reset(&self, now: Instant) -> Duration {
        self.next_reset_at.saturating_duration_since(now)
    }

    /// Classify the pool as of `now`, without refilling it.
    pub(crate) fn state(&self, now: Instant) -> BudgetState {
        if now >= self.next_reset_at || self.remaining_tokens == self.cap() {
            BudgetState::Full
        } else if self.remaining_tokens == 0 {
            BudgetState::Exhausted
        } else {
            BudgetState::Draining
        }
    }
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

    /// A budget of 10000 B/s at 95%: 4750 bytes per half second.
    fn budget(now: Instant) -> DirectionBudget {
        let mut b = DirectionBudget::new(BandwidthRate::DEFAULT_CEILING, 95, now);
        b.set_requested(Some(BandwidthRate::from_bytes_per_sec(10_000)));
        let rate = b.clamped_rate(BandwidthRate::DEFAULT_CEILING);
        b.configure(rate, 95, now);
        b
    }

    #[test]
    fn acquire_and_exhaust() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        assert_eq!(b.adjusted_bytes_per_sec(), 9500);
        assert_eq!(b.cap(), 4750);
        assert_eq!(b.state(t0), BudgetState::Full);

        assert_eq!(b.try_acquire(4000, t0), 4000);
        assert_eq!(b.state(t0), BudgetState::Draining);
        assert_eq!(b.try_acquire(4000, t0), 750);
        assert_eq!(b.state(t0), BudgetState::Exhausted);
        assert_eq!(b.try_acquire(1, t0), 0);

        let later = t0 + Duration::from_millis(200);
        assert_eq!(b.time_to_next_reset(later), Duration::from_millis(300));
        assert_eq!(b.try_acquire(1, later), 0);
    }

    #[test]
    fn reset_refills_exactly() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        assert_eq!(b.try_acquire(usize::MAX, t0), 4750);
        assert_eq!(b.remaining_tokens(), 0);

        let t1 = t0 + SUB_INTERVAL;
        assert_eq!(b.state(t1), BudgetState::Full);
        b.reset_if_due(t1);
        assert_eq!(b.remaining_tokens(), 4750);
        assert_eq!(b.time_to_next_reset(t1), SUB_INTERVAL);

        // Not due yet: nothing changes.
        b.try_acquire(100, t1);
        b.reset_if_due(t1 + Duration::from_millis(499));
        assert_eq!(b.remaining_tokens(), 4650);
    }

    #[test]
    fn refund_is_capped() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        assert_eq!(b.try_acquire(1000, t0), 1000);
        b.refund(400, t0);
        assert_eq!(b.remaining_tokens(), 4150);
        b.refund(100_000, t0);
        assert_eq!(b.remaining_tokens(), 4750);
    }

    #[test]
    fn refund_after_rollover_feeds_new_interval() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        assert_eq!(b.try_acquire(4750, t0), 4750);
        // The interval rolls over while the I/O is outstanding.
        let t1 = t0 + Duration::from_millis(600);
        b.refund(4750, t1);
        // The new pool is already full; the refund can't push it higher.
        assert_eq!(b.remaining_tokens(), 4750);
        assert_eq!(b.time_to_next_reset(t1), SUB_INTERVAL);

        assert_eq!(b.try_acquire(3000, t1), 3000);
        b.refund(1000, t1 + Duration::from_millis(1));
        assert_eq!(b.remaining_tokens(), 2750);
    }

    #[test]
    fn reconfigure_takes_effect_immediately() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        assert_eq!(b.try_acquire(4750, t0), 4750);
        b.configure(BandwidthRate::from_bytes_per_sec(2000), 100, t0);
        assert_eq!(b.remaining_tokens(), 1000);
        assert_eq!(b.configured().as_bytes_per_sec(), 2000);
    }

    #[test]
    fn clamping() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        let low = BandwidthRate::from_bytes_per_sec(500);
        assert_eq!(b.clamped_rate(low), low);
        assert_eq!(
            b.clamped_rate(BandwidthRate::DEFAULT_CEILING),
            BandwidthRate::from_bytes_per_sec(10_000)
        );
        b.set_requested(None);
        assert_eq!(b.clamped_rate(low), low);
    }

    #[test]
    fn odd_rates_alternate() {
        let t0 = Instant::now();
        let mut b = DirectionBudget::new(BandwidthRate::from_bytes_per_sec(2), 95, t0);
        // 2 * 0.95 rounds down to 1, which is still a usable rate.
        assert_eq!(b.adjusted_bytes_per_sec(), 1);
        let mut granted = Vec::new();
        for i in 0..6 {
            let t = t0 + SUB_INTERVAL * i;
            granted.push(b.try_acquire(10, t));
        }
        assert_eq!(granted, vec![1, 0, 1, 0, 1, 0]);

        // 9501 B/s: 4751 then 4750, so a whole second delivers exactly 9501.
        b.configure(BandwidthRate::from_bytes_per_sec(9501), 100, t0);
        assert_eq!(b.try_acquire(usize::MAX, t0), 4751);
        assert_eq!(b.try_acquire(usize::MAX, t0 + SUB_INTERVAL), 4750);
        assert_eq!(b.try_acquire(usize::MAX, t0 + SUB_INTERVAL * 2), 4751);

        // A tiny rate never rounds away to nothing.
        b.configure(BandwidthRate::from_bytes_per_sec(1), 1, t0);
        assert_eq!(b.adjusted_bytes_per_sec(), 1);
        assert_eq!(b.try_acquire(5, t0), 1);

        // Zero really is zero.
        b.configure(BandwidthRate::from_bytes_per_sec(0), 95, t0);
        assert_eq!(b.adjusted_bytes_per_sec(), 0);
        assert_eq!(b.try_acquire(5, t0), 0);
    }

    #[test]
    fn quota() {
        let t0 = Instant::now();
        let mut b = budget(t0);
        assert!(b.quota().is_unlimited());
        assert!(!b.consume_quota(1_000_000));

        b.set_quota(10_000);
        assert!(!b.consume_quota(6000));
        assert!(!b.consume_quota(4000));
        assert_eq!(b.quota().remaining, 0);
        assert!(b.consume_quota(1));
        assert_eq!(b.quota().remaining, -1);
        assert_eq!(b.quota().total, 10_000);
        assert_eq!(b.quota().total_kb(), 10);
        assert_eq!(b.quota().remaining_kb(), 0);

        b.set_quota(0);
        assert!(!b.consume_quota(5));
    }
}
