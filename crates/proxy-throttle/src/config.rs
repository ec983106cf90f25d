//! Configuration for a [`RateLimitEngine`](crate::RateLimitEngine).

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::budget::DEFAULT_PAYLOAD_PERCENT;
use crate::{BandwidthRate, ConfigBuildError, Direction};

/// Configuration for bandwidth throttling and latency simulation.
///
/// Build one with [`ThrottleConfig::builder`], or deserialize a
/// [`ThrottleConfigBuilder`] from a configuration file.  Apply it with
/// [`RateLimitEngine::from_config`](crate::RateLimitEngine::from_config)
/// or [`RateLimitEngine::reconfigure`](crate::RateLimitEngine::reconfigure).
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[non_exhaustive]
pub struct ThrottleConfig {
    /// Whether throttling starts out enabled.
    #[builder(default)]
    pub(crate) enabled: bool,

    /// The highest rate either direction may be set to.
    #[builder(default = "BandwidthRate::DEFAULT_CEILING")]
    pub(crate) rate_ceiling: BandwidthRate,

    /// Target rate for data we receive.  If absent, we use the ceiling.
    #[builder(default, setter(strip_option))]
    pub(crate) downstream_rate: Option<BandwidthRate>,

    /// Target rate for data we send.  If absent, we use the ceiling.
    #[builder(default, setter(strip_option))]
    pub(crate) upstream_rate: Option<BandwidthRate>,

    /// Percentage of each rate that is usable for payload.
    ///
    /// Values outside `1..=100` are treated as 95.
    #[builder(default = "DEFAULT_PAYLOAD_PERCENT.into()")]
    pub(crate) payload_percent: i32,

    /// Total bytes that may be received; 0 for no limit.
    #[builder(default)]
    pub(crate) downstream_quota: u64,

    /// Total bytes that may be sent; 0 for no limit.
    #[builder(default)]
    pub(crate) upstream_quota: u64,

    /// Minimum time that each outbound connect should appear to take.
    #[builder(default)]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) latency: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default builder failed")
    }
}

impl ThrottleConfig {
    /// Return a new [`ThrottleConfigBuilder`].
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::default()
    }

    /// Return true if throttling should start out enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Return the configured rate ceiling.
    pub fn rate_ceiling(&self) -> BandwidthRate {
        self.rate_ceiling
    }

    /// Return the explicitly requested rate for `direction`, if any.
    pub fn rate(&self, direction: Direction) -> Option<BandwidthRate> {
        match direction {
            Direction::Downstream => self.downstream_rate,
            Direction::Upstream => self.upstream_rate,
        }
    }

    /// Return the configured payload efficiency, as given.
    pub fn payload_percent(&self) -> i32 {
        self.payload_percent
    }

    /// Return the quota for `direction`, in bytes; 0 means unlimited.
    pub fn quota(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Downstream => self.downstream_quota,
            Direction::Upstream => self.upstream_quota,
        }
    }

    /// Return the simulated connect latency.
    pub fn latency(&self) -> Duration {
        self.latency
    }
}

impl ThrottleConfigBuilder {
    /// Check that the configuration is usable.
    ///
    /// No rate may be zero: a zero rate would stall every throttled stream.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        let rates = [
            ("rate_ceiling", self.rate_ceiling),
            ("downstream_rate", self.downstream_rate.flatten()),
            ("upstream_rate", self.upstream_rate.flatten()),
        ];
        for (field, rate) in rates {
            if rate.is_some_and(|r| r.is_zero()) {
                return Err(ConfigBuildError::Invalid {
                    field: field.to_string(),
                    problem: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}
