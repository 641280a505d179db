//! Reward valve calibration model.
//!
//! Maps a desired reward volume (microliters) to a valve-open duration
//! (seconds). Two modes exist:
//!
//! - **Automatic**: a monotone piecewise-cubic interpolant (Fritsch-Carlson
//!   tangents, the same family as scipy's `pchip`) over measured
//!   (weight-per-drop, open-time) sample pairs. Valid only while the curve's
//!   recorded date is on/after the last calibration run; staleness is
//!   checked once at valve startup, not on every call.
//! - **Manual**: `scale * volume / 3`. The divisor is a calibration
//!   convention shared with the rig's solenoid calibration procedure.
//!
//! The curve is immutable once built.

use crate::config::ValveConfig;
use crate::error::{RigError, RigResult};
use chrono::NaiveDate;

/// Fixed divisor of the manual calibration convention.
const MANUAL_SCALE_DIVISOR: f64 = 3.0;

/// Immutable volume-to-open-time mapping.
#[derive(Debug, Clone)]
pub enum CalibrationCurve {
    Automatic {
        interpolant: MonotoneInterpolant,
        calibration_date: Option<NaiveDate>,
        last_calibration_run: Option<NaiveDate>,
    },
    Manual {
        scale: f64,
    },
}

impl CalibrationCurve {
    /// Build the curve from the merged valve settings.
    pub fn from_config(config: &ValveConfig) -> RigResult<Self> {
        if config.automatic_calibration {
            let interpolant = MonotoneInterpolant::new(
                &config.calibration_weights_ul,
                &config.calibration_open_times_ms,
            )?;
            Ok(CalibrationCurve::Automatic {
                interpolant,
                calibration_date: config.calibration_date,
                last_calibration_run: config.last_calibration_run,
            })
        } else {
            let scale = config.manual_scale.ok_or_else(|| {
                RigError::Configuration(
                    "manual calibration requires hardware.valve.manual_scale".into(),
                )
            })?;
            Ok(CalibrationCurve::Manual { scale })
        }
    }

    /// Whether the curve may be used to compute reward times.
    ///
    /// Automatic curves are valid only when measured on/after the last
    /// calibration run; the template settings carry a far-future run date
    /// precisely so an uncalibrated rig fails this check. Manual curves
    /// are always valid.
    pub fn is_valid(&self) -> bool {
        match self {
            CalibrationCurve::Automatic {
                calibration_date,
                last_calibration_run,
                ..
            } => match (calibration_date, last_calibration_run) {
                (Some(measured), Some(last_run)) => measured >= last_run,
                _ => false,
            },
            CalibrationCurve::Manual { .. } => true,
        }
    }

    /// Startup gate: error out if automatic mode is selected without a
    /// valid curve. Checked once by the valve capability so per-trial
    /// calls skip the validity test.
    pub fn validate(&self) -> RigResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(RigError::Calibration(
                "no valid calibration information found in the hardware settings: \
                 calibrate the rig, or disable automatic_calibration and set a \
                 manual_scale value"
                    .into(),
            ))
        }
    }

    /// Valve-open duration in seconds for the requested volume.
    pub fn time_for_volume(&self, volume_ul: f64) -> f64 {
        match self {
            // Interpolant output is in milliseconds, matching the samples.
            CalibrationCurve::Automatic { interpolant, .. } => {
                interpolant.eval(volume_ul) / 1e3
            }
            CalibrationCurve::Manual { scale } => scale / MANUAL_SCALE_DIVISOR * volume_ul,
        }
    }
}

/// Monotone piecewise-cubic Hermite interpolant.
///
/// Tangents follow Fritsch-Carlson: harmonic-mean weighting of adjacent
/// secant slopes, zeroed at local extrema, which guarantees the
/// interpolant never overshoots the data and stays monotone wherever the
/// samples are.
#[derive(Debug, Clone)]
pub struct MonotoneInterpolant {
    xs: Vec<f64>,
    ys: Vec<f64>,
    tangents: Vec<f64>,
}

impl MonotoneInterpolant {
    pub fn new(xs: &[f64], ys: &[f64]) -> RigResult<Self> {
        if xs.len() != ys.len() || xs.len() < 2 {
            return Err(RigError::Configuration(
                "interpolation requires at least two matching sample pairs".into(),
            ));
        }
        let mut points: Vec<(f64, f64)> = xs.iter().copied().zip(ys.iter().copied()).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(RigError::Configuration(
                "calibration sample volumes must be distinct".into(),
            ));
        }
        let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let ys: Vec<f64> = points.iter().map(|p| p.1).collect();

        let n = xs.len();
        let mut secants = Vec::with_capacity(n - 1);
        for i in 0..n - 1 {
            secants.push((ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i]));
        }

        let mut tangents = vec![0.0; n];
        tangents[0] = secants[0];
        tangents[n - 1] = secants[n - 2];
        for i in 1..n - 1 {
            let (s0, s1) = (secants[i - 1], secants[i]);
            if s0 * s1 <= 0.0 {
                tangents[i] = 0.0;
            } else {
                let (h0, h1) = (xs[i] - xs[i - 1], xs[i + 1] - xs[i]);
                let w0 = 2.0 * h1 + h0;
                let w1 = h1 + 2.0 * h0;
                tangents[i] = (w0 + w1) / (w0 / s0 + w1 / s1);
            }
        }

        Ok(Self { xs, ys, tangents })
    }

    /// Evaluate at `x`, clamping outside the sample range.
    pub fn eval(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let i = match self.xs.binary_search_by(|probe| probe.total_cmp(&x)) {
            Ok(i) => return self.ys[i],
            Err(i) => i - 1,
        };
        let h = self.xs[i + 1] - self.xs[i];
        let t = (x - self.xs[i]) / h;
        let (t2, t3) = (t * t, t * t * t);
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * self.ys[i]
            + h10 * h * self.tangents[i]
            + h01 * self.ys[i + 1]
            + h11 * h * self.tangents[i + 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValveConfig;

    fn automatic_config(measured: &str, last_run: &str) -> ValveConfig {
        ValveConfig {
            automatic_calibration: true,
            calibration_date: measured.parse().ok(),
            last_calibration_run: last_run.parse().ok(),
            calibration_weights_ul: vec![1.0, 3.0],
            calibration_open_times_ms: vec![10.0, 40.0],
            manual_scale: None,
        }
    }

    #[test]
    fn manual_mode_is_linear_and_zero_at_zero() {
        let curve = CalibrationCurve::Manual { scale: 0.3 };
        assert_eq!(curve.time_for_volume(0.0), 0.0);
        assert!((curve.time_for_volume(3.0) - 0.3).abs() < 1e-12);
        assert!(curve.is_valid());
    }

    #[test]
    fn interpolation_stays_strictly_between_samples() {
        let curve =
            CalibrationCurve::from_config(&automatic_config("2024-06-01", "2024-05-01")).unwrap();
        let t = curve.time_for_volume(2.0);
        assert!(t > 0.010 && t < 0.040, "2ul must map inside (10ms, 40ms), got {t}");
    }

    #[test]
    fn time_for_volume_is_monotone_non_decreasing() {
        let interp = MonotoneInterpolant::new(
            &[0.5, 1.0, 1.5, 2.0, 3.0],
            &[5.0, 10.0, 18.0, 22.0, 40.0],
        )
        .unwrap();
        let mut last = f64::NEG_INFINITY;
        let mut v = 0.0;
        while v <= 3.5 {
            let t = interp.eval(v);
            assert!(t >= last - 1e-12, "non-monotone at {v}: {t} < {last}");
            last = t;
            v += 0.01;
        }
    }

    #[test]
    fn eval_clamps_outside_sample_range() {
        let interp = MonotoneInterpolant::new(&[1.0, 3.0], &[10.0, 40.0]).unwrap();
        assert_eq!(interp.eval(0.0), 10.0);
        assert_eq!(interp.eval(10.0), 40.0);
        assert_eq!(interp.eval(1.0), 10.0);
    }

    #[test]
    fn stale_curve_is_invalid_and_fails_validation() {
        let curve =
            CalibrationCurve::from_config(&automatic_config("2024-01-01", "2024-05-01")).unwrap();
        assert!(!curve.is_valid());
        assert!(matches!(curve.validate(), Err(RigError::Calibration(_))));
    }

    #[test]
    fn missing_dates_invalidate_automatic_mode() {
        let mut config = automatic_config("2024-06-01", "2024-05-01");
        config.calibration_date = None;
        let curve = CalibrationCurve::from_config(&config).unwrap();
        assert!(!curve.is_valid());
    }

    #[test]
    fn duplicate_sample_volumes_rejected() {
        assert!(MonotoneInterpolant::new(&[1.0, 1.0], &[10.0, 20.0]).is_err());
        assert!(MonotoneInterpolant::new(&[1.0], &[10.0]).is_err());
    }
}
