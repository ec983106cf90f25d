//! Bandwidth units.
//!
//! The proxy's management surface talks about limits in bits, kilobits or
//! bytes per second depending on the caller.  Internally we only ever store
//! bytes per second.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// A rate of data transfer, stored as a whole number of bytes per second.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[display("{_0} B/s")]
#[serde(transparent)]
#[allow(clippy::exhaustive_structs)] // A newtype around u64; nothing else will ever go here.
pub struct BandwidthRate(u64);

impl BandwidthRate {
    /// One megabit per second.
    pub const ONE_MBPS: BandwidthRate = BandwidthRate::from_bits_per_sec(1_000_000);

    /// The rate ceiling an engine starts with unless told otherwise: 100 Mbit/s.
    pub const DEFAULT_CEILING: BandwidthRate = BandwidthRate::from_bits_per_sec(100_000_000);

    /// Construct a rate from a number of bytes per second.
    pub const fn from_bytes_per_sec(bytes: u64) -> Self {
        BandwidthRate(bytes)
    }

    /// Construct a rate from a number of bits per second.
    ///
    /// Any fraction of a byte is discarded.
    pub const fn from_bits_per_sec(bits: u64) -> Self {
        BandwidthRate(bits / 8)
    }

    /// Construct a rate from a number of kilobits (1000 bits) per second.
    pub const fn from_kbps(kbps: u64) -> Self {
        BandwidthRate(kbps.saturating_mul(1000) / 8)
    }

    /// Return this rate in bytes per second.
    pub const fn as_bytes_per_sec(self) -> u64 {
        self.0
    }

    /// Return this rate in bits per second.
    pub const fn as_bits_per_sec(self) -> u64 {
        self.0.saturating_mul(8)
    }

    /// Return this rate in kilobits (1000 bits) per second, rounding down.
    pub const fn as_kbps(self) -> u64 {
        self.as_bits_per_sec() / 1000
    }

    /// Return true if this rate allows no traffic at all.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
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

    #[test]
    fn units() {
        let r = BandwidthRate::from_kbps(800);
        assert_eq!(r.as_bytes_per_sec(), 100_000);
        assert_eq!(r.as_bits_per_sec(), 800_000);
        assert_eq!(r.as_kbps(), 800);

        assert_eq!(BandwidthRate::from_bits_per_sec(15).as_bytes_per_sec(), 1);
        assert_eq!(BandwidthRate::DEFAULT_CEILING.as_bytes_per_sec(), 12_500_000);
        assert_eq!(BandwidthRate::ONE_MBPS.as_kbps(), 1000);
        assert!(BandwidthRate::default().is_zero());
        assert_eq!(BandwidthRate::from_kbps(u64::MAX).as_bytes_per_sec(), u64::MAX / 8);
    }

    #[test]
    fn display_and_serde() {
        let r = BandwidthRate::from_bytes_per_sec(4096);
        assert_eq!(r.to_string(), "4096 B/s");
        assert_eq!(serde_json::to_string(&r).unwrap(), "4096");
        let back: BandwidthRate = serde_json::from_str("4096").unwrap();
        assert_eq!(back, r);
        assert_eq!(u64::from(r), 4096);
    }
}
