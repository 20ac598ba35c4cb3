//! Simulated environmental sensor for development and for hardware
//! fallback.
//!
//! Values follow a bounded random walk with mean reversion toward a
//! per-metric resting value, so consecutive readings stay coherent instead
//! of jumping across the whole range.

use crate::readings::Metric;
use crate::sensor::{SensorError, SensorPort};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Per-metric profiles
// ---------------------------------------------------------------------------

/// Bounds and walk parameters for one simulated quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimProfile {
    pub min: f64,
    pub max: f64,
    pub center: f64,
    /// Standard deviation of one walk step.
    pub step_sigma: f64,
    /// Fraction of the distance to `center` recovered per step.
    pub mean_reversion: f64,
}

impl SimProfile {
    pub fn for_metric(metric: Metric) -> Self {
        let (min, max, center, step_sigma) = match metric {
            Metric::Temperature => (0.0, 40.0, 22.0, 0.15),
            Metric::Humidity => (0.0, 100.0, 50.0, 0.4),
            Metric::SoilMoisture => (0.0, 100.0, 50.0, 0.3),
            Metric::Pressure => (980.0, 1050.0, 1013.0, 0.2),
            Metric::Light => (0.0, 100.0, 60.0, 0.8),
            Metric::Rain => (0.0, 100.0, 10.0, 0.5),
        };
        Self {
            min,
            max,
            center,
            step_sigma,
            mean_reversion: 0.02,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SimulatedSensor {
    metric: Metric,
    profile: SimProfile,
    value: f64,
}

impl SimulatedSensor {
    pub fn new(metric: Metric) -> Self {
        Self::with_profile(metric, SimProfile::for_metric(metric))
    }

    pub fn with_profile(metric: Metric, profile: SimProfile) -> Self {
        let span = profile.max - profile.min;
        // Start near the resting value, jittered by ~2 % of the span.
        let start = profile.center + approx_std_normal() * span * 0.02;
        Self {
            metric,
            profile,
            value: start.clamp(profile.min, profile.max),
        }
    }

    /// Advance the walk one step and return the new value, rounded to one
    /// decimal like the physical sensors report.
    pub fn next_value(&mut self) -> f64 {
        let p = &self.profile;
        let pull = p.mean_reversion * (p.center - self.value);
        let step = approx_std_normal() * p.step_sigma;
        self.value = (self.value + pull + step).clamp(p.min, p.max);
        (self.value * 10.0).round() / 10.0
    }
}

impl SensorPort for SimulatedSensor {
    fn read(&mut self) -> Result<f64, SensorError> {
        Ok(self.next_value())
    }

    fn describe(&self) -> String {
        format!("simulated:{}", self.metric)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_stay_within_bounds() {
        for metric in Metric::ALL {
            let profile = SimProfile::for_metric(metric);
            let mut sim = SimulatedSensor::new(metric);
            for _ in 0..2000 {
                let v = sim.next_value();
                assert!(
                    (profile.min..=profile.max).contains(&v),
                    "{metric} out of range: {v}"
                );
            }
        }
    }

    #[test]
    fn temporal_coherence() {
        let mut sim = SimulatedSensor::new(Metric::Temperature);
        let samples: Vec<f64> = (0..200).map(|_| sim.next_value()).collect();
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        // Six sigma of one step plus rounding, far below the 40 °C span.
        assert!(max_jump < 1.5, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn walk_reverts_toward_center() {
        let profile = SimProfile {
            min: 0.0,
            max: 100.0,
            center: 50.0,
            step_sigma: 0.0,
            mean_reversion: 0.1,
        };
        let mut sim = SimulatedSensor::with_profile(Metric::Humidity, profile);
        sim.value = 90.0;
        let v = sim.next_value();
        assert!(v < 90.0 && v > 50.0, "expected pull toward centre, got {v}");
    }

    #[test]
    fn rounded_to_one_decimal() {
        let mut sim = SimulatedSensor::new(Metric::Pressure);
        for _ in 0..50 {
            let v = sim.next_value();
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn read_never_fails() {
        let mut sim = SimulatedSensor::new(Metric::Rain);
        assert!(sim.read().is_ok());
        assert_eq!(sim.describe(), "simulated:rain");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(
            mean.abs() < 0.15,
            "approx_std_normal mean should be near zero: {mean}"
        );
    }
}
