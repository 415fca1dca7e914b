use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::ClusterId;

/// One half-hour forecast row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: NaiveDateTime,
    pub forecast: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
}

/// Which value a clamp event touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClampedValue {
    Point,
    Lower,
    Upper,
}

/// A negative value that was raised to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampEvent {
    pub timestamp: NaiveDateTime,
    pub value: ClampedValue,
    pub raw: f64,
}

/// 48-step day-ahead forecast for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub cluster_id: ClusterId,
    pub target_date: NaiveDate,
    pub points: Vec<ForecastPoint>,
    pub fallback_flag: bool,
    pub degenerate: bool,
    pub clamp_events: Vec<ClampEvent>,
}

impl ForecastResult {
    pub fn point_forecasts(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.forecast).collect()
    }

    pub fn has_intervals(&self) -> bool {
        self.points.iter().all(|p| p.lower.is_some() && p.upper.is_some())
    }
}

/// Holdout accuracy for one cluster and evaluation date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetric {
    pub cluster_id: ClusterId,
    pub date: NaiveDate,
    /// Absent only when every actual in the day was zero under the exclude rule
    pub mape: Option<f64>,
    pub rmse: f64,
    pub mae: f64,
    /// Slots left out of MAPE because their actual was zero
    pub excluded_slots: usize,
    pub fallback_flag: bool,
    pub degenerate_flag: bool,
}
