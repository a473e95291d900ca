//! Round-trip estimation and retransmit timeouts.
//!
//! Per timer class the estimator keeps a smoothed round-trip time and mean
//! deviation in fixed point (`srtt` scaled by 8, `sdev` by 4, both in
//! microseconds), updated Jacobson-style from first-attempt replies only.

use fnfs_types::{RpcClass, TimeoutMultipliers};
use std::time::Duration;

/// Multiplier applied per consecutive timeout; the last entry is the cap.
pub const BACKOFF: [u32; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

#[derive(Debug, Clone, Copy, Default)]
struct ClassRtt {
    srtt: i64,
    sdev: i64,
    samples: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    classes: [ClassRtt; RpcClass::TIMED.len()],
}

impl RttEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one round-trip sample into `class`. Untimed classes are ignored.
    pub fn update(&mut self, class: RpcClass, sample: Duration) {
        let Some(idx) = class.timer_index() else {
            return;
        };
        let m = i64::try_from(sample.as_micros()).unwrap_or(i64::MAX / 16).max(1);
        let c = &mut self.classes[idx];
        if c.samples == 0 {
            c.srtt = m << 3;
            c.sdev = m << 1;
        } else {
            let mut delta = m - (c.srtt >> 3);
            c.srtt = (c.srtt + delta).max(1);
            if delta < 0 {
                delta = -delta;
            }
            delta -= c.sdev >> 2;
            c.sdev = (c.sdev + delta).max(1);
        }
        c.samples += 1;
    }

    #[must_use]
    pub fn samples(&self, class: RpcClass) -> u64 {
        class.timer_index().map_or(0, |i| self.classes[i].samples)
    }

    #[must_use]
    pub fn srtt(&self, class: RpcClass) -> Option<Duration> {
        let c = self.sampled(class)?;
        Some(micros(c.srtt >> 3))
    }

    #[must_use]
    pub fn deviation(&self, class: RpcClass) -> Option<Duration> {
        let c = self.sampled(class)?;
        Some(micros(c.sdev >> 2))
    }

    /// `srtt + 4 * deviation`, once the class has a sample.
    #[must_use]
    pub fn rto(&self, class: RpcClass) -> Option<Duration> {
        let c = self.sampled(class)?;
        Some(micros((c.srtt >> 3) + c.sdev))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn sampled(&self, class: RpcClass) -> Option<&ClassRtt> {
        let c = &self.classes[class.timer_index()?];
        (c.samples > 0).then_some(c)
    }
}

fn micros(v: i64) -> Duration {
    Duration::from_micros(u64::try_from(v).unwrap_or(0))
}

#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn scale(base: Duration, factor: f64) -> Duration {
    let us = (base.as_micros() as f64 * factor).round();
    if us >= u64::MAX as f64 {
        Duration::MAX
    } else {
        Duration::from_micros(us.max(0.0) as u64)
    }
}

/// Inputs to the adaptive retransmit timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    /// Used until a class has a round-trip sample, and always on streams.
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
    pub multipliers: TimeoutMultipliers,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            min: Duration::from_micros(62_500),
            max: Duration::from_secs(60),
            multipliers: TimeoutMultipliers::default(),
        }
    }
}

impl TimeoutPolicy {
    /// Timeout for the next attempt of a `class` request.
    ///
    /// `backoff` is the larger of the request's retry count and the
    /// connection's consecutive-timeout count. `degraded` is set while the
    /// connection is reconnecting or the server is flagged unresponsive,
    /// which lowers the cap to a quarter of `max`.
    #[must_use]
    pub fn timeout(
        &self,
        est: &RttEstimator,
        class: RpcClass,
        backoff: u32,
        datagram: bool,
        degraded: bool,
    ) -> Duration {
        let base = if datagram {
            est.rto(class).unwrap_or(self.initial)
        } else {
            self.initial
        };
        let scaled = scale(base, self.multipliers.for_class(class)).max(self.min);
        let step = BACKOFF[(backoff as usize).min(BACKOFF.len() - 1)];
        let cap = if degraded { self.max / 4 } else { self.max };
        scaled.saturating_mul(step).min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn first_sample_seeds_estimate() {
        let mut est = RttEstimator::new();
        assert_eq!(est.rto(RpcClass::Read), None);
        est.update(RpcClass::Read, ms(100));
        assert_eq!(est.srtt(RpcClass::Read), Some(ms(100)));
        assert_eq!(est.deviation(RpcClass::Read), Some(ms(50)));
        assert_eq!(est.rto(RpcClass::Read), Some(ms(300)));
        assert_eq!(est.samples(RpcClass::Write), 0);
    }

    #[test]
    fn steady_samples_converge() {
        let mut est = RttEstimator::new();
        for _ in 0..200 {
            est.update(RpcClass::Getattr, ms(20));
        }
        let srtt = est.srtt(RpcClass::Getattr).expect("srtt");
        assert!(srtt >= ms(19) && srtt <= ms(21), "{srtt:?}");
        let rto = est.rto(RpcClass::Getattr).expect("rto");
        assert!(rto < ms(25), "{rto:?}");
    }

    #[test]
    fn untimed_class_is_ignored() {
        let mut est = RttEstimator::new();
        est.update(RpcClass::Other, ms(5));
        assert_eq!(est.samples(RpcClass::Other), 0);
        assert_eq!(est.rto(RpcClass::Other), None);
    }

    #[test]
    fn timeout_uses_estimate_on_datagrams_only() {
        let policy = TimeoutPolicy::default();
        let mut est = RttEstimator::new();
        est.update(RpcClass::Read, ms(100));
        assert_eq!(policy.timeout(&est, RpcClass::Read, 0, true, false), ms(300));
        assert_eq!(
            policy.timeout(&est, RpcClass::Read, 0, false, false),
            policy.initial
        );
        // Getattr carries a 2x multiplier.
        est.update(RpcClass::Getattr, ms(100));
        assert_eq!(policy.timeout(&est, RpcClass::Getattr, 0, true, false), ms(600));
    }

    #[test]
    fn timeout_backs_off_and_caps() {
        let policy = TimeoutPolicy::default();
        let est = RttEstimator::new();
        assert_eq!(policy.timeout(&est, RpcClass::Write, 1, true, false), ms(2000));
        assert_eq!(policy.timeout(&est, RpcClass::Write, 3, true, false), ms(8000));
        assert_eq!(policy.timeout(&est, RpcClass::Write, 40, true, false), policy.max);
        assert_eq!(
            policy.timeout(&est, RpcClass::Write, 40, true, true),
            policy.max / 4
        );
    }

    #[test]
    fn timeout_is_floored() {
        let policy = TimeoutPolicy::default();
        let mut est = RttEstimator::new();
        est.update(RpcClass::Read, Duration::from_micros(10));
        assert_eq!(policy.timeout(&est, RpcClass::Read, 0, true, false), policy.min);
    }

    proptest! {
        #[test]
        fn timeout_stays_within_bounds(
            samples in proptest::collection::vec(1u64..5_000_000, 0..20),
            backoff in 0u32..50,
            degraded in any::<bool>(),
        ) {
            let policy = TimeoutPolicy::default();
            let mut est = RttEstimator::new();
            for s in samples {
                est.update(RpcClass::Commit, Duration::from_micros(s));
            }
            let t = policy.timeout(&est, RpcClass::Commit, backoff, true, degraded);
            let cap = if degraded { policy.max / 4 } else { policy.max };
            prop_assert!(t <= cap);
            prop_assert!(t >= policy.min);
            if let Some(rto) = est.rto(RpcClass::Commit) {
                prop_assert!(rto >= est.srtt(RpcClass::Commit).unwrap_or_default());
            }
        }
    }
}
