//! Forecast accuracy metrics
//!
//! MAPE, RMSE and MAE over paired actual/predicted slot values, with a
//! configurable rule for actuals equal to zero.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ZeroActualRule;

/// Forecast accuracy metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Absolute Percentage Error (%); `None` when every actual was excluded
    pub mape: Option<f64>,
    /// Root Mean Square Error
    pub rmse: f64,
    /// Mean Absolute Error
    pub mae: f64,
    /// Number of samples evaluated
    pub sample_count: usize,
    /// Samples left out of MAPE because the actual was zero
    pub excluded_from_mape: usize,
}

impl ForecastMetrics {
    /// Calculate metrics from actual and predicted values
    pub fn calculate(
        actual: &[f64],
        predicted: &[f64],
        zero_rule: ZeroActualRule,
    ) -> Result<Self, ForecastMetricsError> {
        if actual.len() != predicted.len() {
            return Err(ForecastMetricsError::DimensionMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }

        if actual.is_empty() {
            return Err(ForecastMetricsError::EmptyData);
        }

        let n = actual.len();
        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut pct_sum = 0.0;
        let mut pct_count = 0usize;
        let mut excluded = 0usize;

        for (a, p) in actual.iter().zip(predicted.iter()) {
            let error = a - p;
            abs_sum += error.abs();
            sq_sum += error * error;

            let denom = if *a != 0.0 {
                Some(a.abs())
            } else {
                match zero_rule {
                    ZeroActualRule::Exclude => None,
                    ZeroActualRule::Epsilon { epsilon } => Some(epsilon.abs()),
                }
            };
            match denom {
                Some(d) if d > 0.0 => {
                    pct_sum += error.abs() / d * 100.0;
                    pct_count += 1;
                }
                _ => excluded += 1,
            }
        }

        let mape = (pct_count > 0).then(|| pct_sum / pct_count as f64);

        Ok(ForecastMetrics {
            mape,
            rmse: (sq_sum / n as f64).sqrt(),
            mae: abs_sum / n as f64,
            sample_count: n,
            excluded_from_mape: excluded,
        })
    }
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mape {
            Some(mape) => write!(
                f,
                "Metrics: MAE={:.3}, RMSE={:.3}, MAPE={:.2}%",
                self.mae, self.rmse, mape
            ),
            None => write!(
                f,
                "Metrics: MAE={:.3}, RMSE={:.3}, MAPE=n/a",
                self.mae, self.rmse
            ),
        }
    }
}

/// Forecast metrics calculation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForecastMetricsError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,
}
