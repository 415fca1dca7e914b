//! Persisted per-cluster model record and its lifecycle states.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::ClusterId;
use crate::error::{PipelineError, Result};

/// Lifecycle state of a cluster model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelState {
    Unfit,
    Fitting,
    Fit,
    Stale,
    Failed,
}

impl ModelState {
    /// Allowed edges of the lifecycle state machine.
    pub fn can_transition_to(self, next: ModelState) -> bool {
        use ModelState::*;
        matches!(
            (self, next),
            (Unfit, Fitting)
                | (Fitting, Fit)
                | (Fitting, Failed)
                | (Fit, Stale)
                | (Stale, Fitting)
                | (Failed, Fitting)
        )
    }

    /// States that may be written to the model store.
    pub fn is_terminal(self) -> bool {
        matches!(self, ModelState::Fit | ModelState::Failed)
    }
}

/// Non-seasonal ARIMA order (p, d, q).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl ArimaOrder {
    pub fn new(p: usize, d: usize, q: usize) -> Self {
        Self { p, d, q }
    }
}

/// Seasonal order (P, D, Q) with period `s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeasonalOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
    pub period: usize,
}

impl SeasonalOrder {
    pub fn new(p: usize, d: usize, q: usize, period: usize) -> Self {
        Self { p, d, q, period }
    }

    pub fn none() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn is_active(&self) -> bool {
        self.period > 1 && (self.p + self.d + self.q) > 0
    }
}

/// OLS regression on the exogenous columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionParams {
    pub intercept: f64,
    /// One coefficient per column of the feature schema, same order
    pub coefficients: Vec<f64>,
}

/// Estimated parameters of a regression with seasonal ARIMA errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedParams {
    pub intercept: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub seasonal_ar: Vec<f64>,
    pub seasonal_ma: Vec<f64>,
    pub regression: Option<RegressionParams>,
    /// Residual variance of the one-step errors
    pub sigma2: f64,
}

/// Persisted record for one cluster, mutated only by the model manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    pub cluster_id: ClusterId,
    pub order: ArimaOrder,
    pub seasonal_order: SeasonalOrder,
    pub fitted_params: Option<FittedParams>,
    /// Regressor column names in fit order; empty for univariate models
    pub feature_schema: Vec<String>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub history_days: usize,
    pub fallback_flag: bool,
    pub short_history: bool,
    pub degenerate: bool,
    pub last_value: f64,
    pub state: ModelState,
    pub fit_timestamp: DateTime<Utc>,
    pub member_fingerprint: String,
    pub aic: Option<f64>,
    pub failure_reason: Option<String>,
}

impl ClusterModel {
    /// Fresh record in the `Unfit` state.
    pub fn unfit(
        cluster_id: ClusterId,
        order: ArimaOrder,
        seasonal_order: SeasonalOrder,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Self {
        Self {
            cluster_id,
            order,
            seasonal_order,
            fitted_params: None,
            feature_schema: Vec::new(),
            window_start,
            window_end,
            history_days: 0,
            fallback_flag: false,
            short_history: false,
            degenerate: false,
            last_value: 0.0,
            state: ModelState::Unfit,
            fit_timestamp: Utc::now(),
            member_fingerprint: String::new(),
            aic: None,
            failure_reason: None,
        }
    }

    /// Move along one edge of the lifecycle.
    pub fn transition(&mut self, next: ModelState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::Configuration(format!(
                "illegal model state transition {} -> {} for cluster {}",
                self.state, next, self.cluster_id
            )));
        }
        tracing::debug!(cluster_id = %self.cluster_id, from = %self.state, to = %next, "model state transition");
        self.state = next;
        Ok(())
    }

    /// Usable by the forecaster.
    pub fn is_ready(&self) -> bool {
        self.state == ModelState::Fit && (self.degenerate || self.fitted_params.is_some())
    }

    pub fn uses_exogenous(&self) -> bool {
        !self.feature_schema.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ClusterModel {
        ClusterModel::unfit(
            ClusterId::from("A"),
            ArimaOrder::new(1, 0, 0),
            SeasonalOrder::new(1, 1, 0, 48),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        )
    }

    #[test]
    fn test_lifecycle_edges() {
        let mut m = model();
        assert!(m.transition(ModelState::Fit).is_err());
        m.transition(ModelState::Fitting).unwrap();
        m.transition(ModelState::Fit).unwrap();
        m.transition(ModelState::Stale).unwrap();
        m.transition(ModelState::Fitting).unwrap();
        m.transition(ModelState::Failed).unwrap();
        m.transition(ModelState::Fitting).unwrap();
        assert_eq!(m.state, ModelState::Fitting);
        assert!(!m.state.is_terminal());
    }

    #[test]
    fn test_state_display_and_parse() {
        assert_eq!(ModelState::Stale.to_string(), "stale");
        assert_eq!("failed".parse::<ModelState>().unwrap(), ModelState::Failed);
    }

    #[test]
    fn test_not_ready_until_fit() {
        let mut m = model();
        assert!(!m.is_ready());
        m.transition(ModelState::Fitting).unwrap();
        m.degenerate = true;
        m.transition(ModelState::Fit).unwrap();
        assert!(m.is_ready());
    }

    #[test]
    fn test_record_serializes_state_in_snake_case() {
        let m = model();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"state\":\"unfit\""));
        let back: ClusterModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
