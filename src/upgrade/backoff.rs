//! Delay between failed attempts on the same node.

use std::time::Duration;

use crate::crd::BackoffSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffSpec::default())
    }
}

impl From<&BackoffSpec> for BackoffPolicy {
    fn from(spec: &BackoffSpec) -> Self {
        match *spec {
            BackoffSpec::Fixed { seconds } => Self::Fixed(Duration::from_secs(seconds)),
            BackoffSpec::Exponential {
                base_seconds,
                max_seconds,
            } => Self::Exponential {
                base: Duration::from_secs(base_seconds),
                max: Duration::from_secs(max_seconds.max(base_seconds)),
            },
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th consecutive failure. Zero before any failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { base, max } => {
                let shift = (attempt - 1).min(31);
                base.checked_mul(1u32 << shift).map_or(max, |d| d.min(max))
            }
        }
    }
}
