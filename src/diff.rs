//! Differences of counter metrics between plugin runs

use crate::{
    checkpoint::{CheckpointRecord, Checkpoints},
    metric::NumericMetric,
};
use log::{debug, warn};
use std::time::Duration;

/// How a difference is reported.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RateScale {
    /// The plain difference between two readings
    Delta,
    /// Difference per second
    PerSecond,
    /// Difference per minute, what the agent graphs
    PerMinute,
}

impl RateScale {
    fn apply(self, delta: f64, elapsed: u64) -> f64 {
        match self {
            RateScale::Delta => delta,
            RateScale::PerSecond => delta / elapsed as f64,
            RateScale::PerMinute => delta * 60.0 / elapsed as f64,
        }
    }
}

/// What [DiffCalculator::compute] made of a reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DiffOutcome {
    /// A usable, never negative, difference
    Delta(f64),
    /// No earlier reading, this one is the baseline
    Baseline,
    /// The counter went backwards (restart of the monitored process)
    Reset,
    /// Last reading is too old to give a meaningful rate
    TooLongGap,
    /// No time passed since the last reading, or the clock went back
    NoElapsed,
    /// The reading is NaN or infinite and was ignored
    NotFinite,
}

impl DiffOutcome {
    /// The value to report, if any
    pub fn value(&self) -> Option<f64> {
        match *self {
            DiffOutcome::Delta(v) => Some(v),
            _ => None,
        }
    }
}

/// Turns cumulative counter readings into differences, using the
/// checkpoints of the last run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiffCalculator {
    /// Readings further apart than this do not produce a value
    pub max_gap: Duration,
    /// Scale of the reported value
    pub scale: RateScale,
}

impl Default for DiffCalculator {
    fn default() -> Self {
        Self {
            max_gap: Duration::from_secs(600),
            scale: RateScale::PerMinute,
        }
    }
}

impl DiffCalculator {
    /// Calculator with the given gap limit and scale
    pub fn new(max_gap: Duration, scale: RateScale) -> Self {
        Self { max_gap, scale }
    }

    /// Compare `current`, read at unix time `now`, against the
    /// checkpoint stored for `key`.
    ///
    /// Whatever the outcome, the checkpoint for `key` is replaced by
    /// the current reading afterwards, so the next run always has a
    /// fresh baseline. A counter that went backwards is a
    /// [DiffOutcome::Reset] and becomes the new baseline, unless it is
    /// an unsigned counter that plausibly wrapped around: then the
    /// wrapped difference is used, as long as it stays below ten times
    /// the previous one.
    ///
    /// A NaN or infinite reading is the one exception, it is never
    /// stored and the old checkpoint stays as it was.
    pub fn compute(
        &self,
        key: &str,
        current: NumericMetric,
        now: u64,
        checkpoints: &mut Checkpoints,
    ) -> DiffOutcome {
        if !current.as_f64().is_finite() {
            warn!("{key}: ignoring non-finite reading {current}");
            return DiffOutcome::NotFinite;
        }
        let prior = checkpoints.get(key).cloned();
        let outcome = match &prior {
            None => DiffOutcome::Baseline,
            Some(prior) => self.outcome(key, prior, current, now),
        };

        let last_delta = match outcome {
            DiffOutcome::Delta(v) => Some(v),
            DiffOutcome::Reset => None,
            _ => prior.and_then(|p| p.last_delta),
        };
        checkpoints.insert(
            key.to_string(),
            CheckpointRecord {
                value: current,
                timestamp: now,
                last_delta,
            },
        );
        outcome
    }

    fn outcome(
        &self,
        key: &str,
        prior: &CheckpointRecord,
        current: NumericMetric,
        now: u64,
    ) -> DiffOutcome {
        if now <= prior.timestamp {
            debug!("{key}: no time passed since last checkpoint");
            return DiffOutcome::NoElapsed;
        }
        let elapsed = now - prior.timestamp;
        if elapsed > self.max_gap.as_secs() {
            debug!("{key}: last checkpoint is {elapsed}s old, too long ago");
            return DiffOutcome::TooLongGap;
        }

        let delta = match (prior.value, current) {
            (NumericMetric::UInt64(last), NumericMetric::UInt64(cur)) => {
                if cur >= last {
                    Some((cur - last) as f64)
                } else {
                    let wrapped = self.scale.apply(cur.wrapping_sub(last) as f64, elapsed);
                    match prior.last_delta {
                        Some(last_delta) if wrapped < last_delta * 10.0 => {
                            debug!("{key}: counter wrapped around");
                            return DiffOutcome::Delta(wrapped);
                        }
                        _ => None,
                    }
                }
            }
            (NumericMetric::Int64(last), NumericMetric::Int64(cur)) => {
                if cur >= last {
                    Some(cur.abs_diff(last) as f64)
                } else {
                    None
                }
            }
            (last, cur) => {
                let (last, cur) = (last.as_f64(), cur.as_f64());
                if cur >= last {
                    Some(cur - last)
                } else {
                    None
                }
            }
        };

        match delta {
            Some(delta) => DiffOutcome::Delta(self.scale.apply(delta, elapsed)),
            None => {
                warn!("{key}: counter seems to be reset");
                DiffOutcome::Reset
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> DiffCalculator {
        DiffCalculator::new(Duration::from_secs(600), RateScale::Delta)
    }

    #[test]
    fn test_first_run_is_baseline() {
        let mut cp = Checkpoints::new();
        let out = raw().compute("requests", NumericMetric::UInt64(100), 1000, &mut cp);
        assert_eq!(out, DiffOutcome::Baseline);
        assert_eq!(out.value(), None);
        assert_eq!(
            cp.get("requests"),
            Some(&CheckpointRecord::new(NumericMetric::UInt64(100), 1000))
        );
    }

    #[test]
    fn test_monotonic_delta() {
        let calc = raw();
        for (v1, v2, a, b) in [
            (0u64, 0u64, 0u64, 1u64),
            (100, 160, 1000, 1060),
            (5, 5000, 1000, 1600),
            (u64::MAX - 1, u64::MAX, 1, 2),
        ] {
            let mut cp = Checkpoints::new();
            cp.insert(
                String::from("k"),
                CheckpointRecord::new(NumericMetric::UInt64(v1), a),
            );
            let out = calc.compute("k", NumericMetric::UInt64(v2), b, &mut cp);
            assert_eq!(out, DiffOutcome::Delta((v2 - v1) as f64));
            assert_eq!(cp["k"].value, NumericMetric::UInt64(v2));
            assert_eq!(cp["k"].timestamp, b);
        }
    }

    #[test]
    fn test_scales() {
        let mut cp = Checkpoints::new();
        cp.insert(
            String::from("k"),
            CheckpointRecord::new(NumericMetric::Float64(10.0), 1000),
        );
        let per_sec = DiffCalculator::new(Duration::from_secs(600), RateScale::PerSecond);
        let out = per_sec.compute("k", NumericMetric::Float64(40.0), 1030, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(1.0));

        let per_min = DiffCalculator::default();
        let out = per_min.compute("k", NumericMetric::Float64(70.0), 1060, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(60.0));
    }

    #[test]
    fn test_reset_never_negative() {
        let calc = raw();
        for (prior, current) in [
            (NumericMetric::UInt64(1000), NumericMetric::UInt64(5)),
            (NumericMetric::Int64(10), NumericMetric::Int64(-10)),
            (NumericMetric::Float64(2.5), NumericMetric::Float64(2.0)),
        ] {
            let mut cp = Checkpoints::new();
            cp.insert(String::from("k"), CheckpointRecord::new(prior, 1000));
            let out = calc.compute("k", current, 1060, &mut cp);
            assert_eq!(out, DiffOutcome::Reset);
            // New baseline is the current reading
            assert_eq!(cp["k"].value, current);
            assert_eq!(cp["k"].last_delta, None);
        }

        // Next run continues from the new baseline
        let mut cp = Checkpoints::new();
        cp.insert(
            String::from("k"),
            CheckpointRecord::new(NumericMetric::UInt64(1000), 1000),
        );
        calc.compute("k", NumericMetric::UInt64(5), 1060, &mut cp);
        let out = calc.compute("k", NumericMetric::UInt64(25), 1120, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(20.0));
    }

    #[test]
    fn test_unsigned_wraparound() {
        let calc = raw();
        let mut cp = Checkpoints::new();
        cp.insert(
            String::from("k"),
            CheckpointRecord {
                value: NumericMetric::UInt64(u64::MAX - 9),
                timestamp: 1000,
                last_delta: Some(20.0),
            },
        );
        // Wrapped by 10 to land on 5: a difference of 15
        let out = calc.compute("k", NumericMetric::UInt64(5), 1060, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(15.0));
        assert_eq!(cp["k"].last_delta, Some(15.0));

        // Without history the same reading is a reset
        let mut cp = Checkpoints::new();
        cp.insert(
            String::from("k"),
            CheckpointRecord::new(NumericMetric::UInt64(u64::MAX - 9), 1000),
        );
        let out = calc.compute("k", NumericMetric::UInt64(5), 1060, &mut cp);
        assert_eq!(out, DiffOutcome::Reset);
    }

    #[test]
    fn test_gap_and_clock() {
        let calc = raw();
        let mut cp = Checkpoints::new();
        cp.insert(
            String::from("k"),
            CheckpointRecord {
                value: NumericMetric::UInt64(10),
                timestamp: 1000,
                last_delta: Some(4.0),
            },
        );
        let out = calc.compute("k", NumericMetric::UInt64(20), 1601, &mut cp);
        assert_eq!(out, DiffOutcome::TooLongGap);
        assert_eq!(cp["k"].timestamp, 1601);
        assert_eq!(cp["k"].last_delta, Some(4.0));

        // Exactly at the limit is still fine
        let out = calc.compute("k", NumericMetric::UInt64(30), 2201, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(10.0));

        let out = calc.compute("k", NumericMetric::UInt64(40), 2201, &mut cp);
        assert_eq!(out, DiffOutcome::NoElapsed);
        let out = calc.compute("k", NumericMetric::UInt64(50), 2100, &mut cp);
        assert_eq!(out, DiffOutcome::NoElapsed);
        assert_eq!(cp["k"].value, NumericMetric::UInt64(50));
    }

    #[test]
    fn test_non_finite_not_stored() {
        let calc = raw();
        let mut cp = Checkpoints::new();
        assert_eq!(
            calc.compute("g", NumericMetric::Float64(f64::NAN), 1000, &mut cp),
            DiffOutcome::NotFinite
        );
        assert!(cp.is_empty());

        calc.compute("g", NumericMetric::Float64(1.0), 1000, &mut cp);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let out = calc.compute("g", NumericMetric::Float64(bad), 1030, &mut cp);
            assert_eq!(out, DiffOutcome::NotFinite);
            assert_eq!(out.value(), None);
        }
        assert_eq!(
            cp["g"],
            CheckpointRecord::new(NumericMetric::Float64(1.0), 1000)
        );
        // Continues from the last good reading
        let out = calc.compute("g", NumericMetric::Float64(3.5), 1060, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(2.5));
    }

    #[test]
    fn test_mixed_variants() {
        let calc = raw();
        let mut cp = Checkpoints::new();
        cp.insert(
            String::from("k"),
            CheckpointRecord::new(NumericMetric::Float64(1.5), 1000),
        );
        let out = calc.compute("k", NumericMetric::UInt64(4), 1010, &mut cp);
        assert_eq!(out, DiffOutcome::Delta(2.5));
    }
}
