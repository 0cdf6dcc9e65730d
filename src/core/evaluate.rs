//! Validation metrics and importance ranking.
//!
//! RMSE is computed over the validation partition in meters, and relative
//! to the mean observed height in percent. A zero mean makes the
//! percentage undefined; it is reported as NaN, never raised. Importance
//! ranking is descending by value with deterministic, order-independent
//! tie handling.

use std::collections::HashMap;
use std::fmt;

/// RMSE in meters and relative to the mean observed height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmseReport {
    pub rmse: f64,
    /// Percent of mean observed height; NaN when the mean is zero or the
    /// validation set is empty.
    pub rmse_pct: f64,
}

impl fmt::Display for RmseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rmse_pct.is_nan() {
            write!(f, "RMSE: {:.2} m (n/a)", self.rmse)
        } else {
            write!(f, "RMSE: {:.2} m ({:.2}%)", self.rmse, self.rmse_pct)
        }
    }
}

/// RMSE over (observed, predicted) pairs.
pub fn rmse(pairs: &[(f32, f32)]) -> RmseReport {
    if pairs.is_empty() {
        log::warn!("empty validation set, RMSE undefined");
        return RmseReport {
            rmse: f64::NAN,
            rmse_pct: f64::NAN,
        };
    }
    let n = pairs.len() as f64;
    let sum_sq: f64 = pairs
        .iter()
        .map(|&(obs, pred)| {
            let err = obs as f64 - pred as f64;
            err * err
        })
        .sum();
    let rmse = (sum_sq / n).sqrt();
    let mean_observed: f64 = pairs.iter().map(|&(obs, _)| obs as f64).sum::<f64>() / n;
    let rmse_pct = if mean_observed == 0.0 {
        f64::NAN
    } else {
        100.0 * rmse / mean_observed
    };
    RmseReport { rmse, rmse_pct }
}

/// Rank importances descending by value. Names are canonicalized first so
/// the result does not depend on map iteration order; equal values keep
/// their name order.
pub fn rank_importances(importances: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = importances
        .iter()
        .map(|(k, &v)| (k.clone(), v))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn perfect_predictions_give_zero_rmse() {
        let pairs = vec![(5.0, 5.0), (10.0, 10.0), (15.0, 15.0)];
        let report = rmse(&pairs);
        assert_relative_eq!(report.rmse, 0.0);
        assert_relative_eq!(report.rmse_pct, 0.0);
    }

    #[test]
    fn rmse_is_scale_equivariant() {
        let pairs: Vec<(f32, f32)> = vec![(5.0, 6.0), (10.0, 8.0), (20.0, 23.0)];
        let k = 3.5f32;
        let scaled: Vec<(f32, f32)> = pairs.iter().map(|&(o, p)| (k * o, k * p)).collect();
        let base = rmse(&pairs);
        let after = rmse(&scaled);
        assert_relative_eq!(after.rmse, k as f64 * base.rmse, epsilon = 1e-9);
        // the percentage is scale-invariant
        assert_relative_eq!(after.rmse_pct, base.rmse_pct, epsilon = 1e-9);
    }

    #[test]
    fn zero_mean_observed_reports_nan_percentage() {
        let pairs = vec![(1.0, 2.0), (-1.0, 0.0)];
        let report = rmse(&pairs);
        assert!(report.rmse.is_finite());
        assert!(report.rmse_pct.is_nan());
        let text = report.to_string();
        assert!(text.contains("n/a"));
    }

    #[test]
    fn empty_validation_reports_nan_without_panicking() {
        let report = rmse(&[]);
        assert!(report.rmse.is_nan());
        assert!(report.rmse_pct.is_nan());
    }

    #[test]
    fn report_formats_like_the_reference() {
        let report = RmseReport {
            rmse: 3.256,
            rmse_pct: 17.449,
        };
        assert_eq!(report.to_string(), "RMSE: 3.26 m (17.45%)");
    }

    #[test]
    fn ranking_is_descending_and_order_independent() {
        let mut a = HashMap::new();
        a.insert("B4".to_string(), 0.2);
        a.insert("VH".to_string(), 0.5);
        a.insert("slope".to_string(), 0.3);
        let mut b = HashMap::new();
        b.insert("slope".to_string(), 0.3);
        b.insert("VH".to_string(), 0.5);
        b.insert("B4".to_string(), 0.2);

        let ranked_a = rank_importances(&a);
        let ranked_b = rank_importances(&b);
        assert_eq!(ranked_a, ranked_b);
        assert_eq!(ranked_a[0].0, "VH");
        assert!(ranked_a.windows(2).all(|w| w[0].1 >= w[1].1));
        let sum_a: f64 = ranked_a.iter().map(|(_, v)| v).sum();
        let sum_b: f64 = ranked_b.iter().map(|(_, v)| v).sum();
        assert_relative_eq!(sum_a, sum_b);
    }

    #[test]
    fn equal_importances_tie_break_on_name() {
        let mut m = HashMap::new();
        m.insert("b".to_string(), 0.5);
        m.insert("a".to_string(), 0.5);
        m.insert("c".to_string(), 0.9);
        let ranked = rank_importances(&m);
        assert_eq!(
            ranked,
            vec![
                ("c".to_string(), 0.9),
                ("a".to_string(), 0.5),
                ("b".to_string(), 0.5),
            ]
        );
    }
}
