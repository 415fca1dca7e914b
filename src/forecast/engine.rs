use chrono::{Duration, NaiveDate};
use tracing::{debug, warn};

use super::features::FeatureSet;
use crate::config::ForecastConfig;
use crate::domain::{
    slot_timestamp, ClampEvent, ClampedValue, ClusterModel, ClusterSeries, ForecastPoint,
    ForecastResult, SLOTS_PER_DAY,
};
use crate::error::{PipelineError, Result};
use crate::model::sarima::{self, SarimaError};
use crate::model::stats::quantile_normal;

/// Applies a fitted model to produce the target day's 48 half-hour values.
pub struct Forecaster {
    cfg: ForecastConfig,
}

impl Forecaster {
    pub fn new(cfg: ForecastConfig) -> Self {
        Self { cfg }
    }

    /// Two-sided normal quantile for the configured confidence level.
    pub fn z_score(&self) -> f64 {
        quantile_normal((1.0 + self.cfg.confidence_level) / 2.0)
    }

    /// Forecast `target` from the history in `series` (days before `target`).
    ///
    /// History starts at the model's window start and is re-filtered with
    /// the stored parameters; nothing is re-estimated.
    pub fn forecast(
        &self,
        model: &ClusterModel,
        series: &ClusterSeries,
        features: &FeatureSet,
        target: NaiveDate,
    ) -> Result<ForecastResult> {
        let cluster_id = &model.cluster_id;
        if !model.is_ready() {
            return Err(PipelineError::forecast(
                cluster_id,
                format!("model is not ready (state {})", model.state),
            ));
        }

        let history = series.window(model.window_start, target - Duration::days(1));
        let Some(last_day) = history.end_date() else {
            return Err(PipelineError::forecast(cluster_id, "no history before target date"));
        };
        let gap_days = (target - last_day).num_days() as usize - 1;
        let horizon = (gap_days + 1) * SLOTS_PER_DAY;
        if gap_days > 0 {
            warn!(cluster_id = %cluster_id, gap_days, "history ends before the day preceding the target; extending horizon");
        }

        let values = history.values();
        let (mean, std_err) = if model.degenerate {
            let last = values.last().copied().unwrap_or(model.last_value);
            (vec![last; SLOTS_PER_DAY], vec![0.0; SLOTS_PER_DAY])
        } else {
            let params = model.fitted_params.as_ref().ok_or_else(|| {
                PipelineError::forecast(cluster_id, "fitted parameters missing")
            })?;

            let (exog_history, exog_future) = if model.uses_exogenous() {
                if features.columns != model.feature_schema {
                    return Err(PipelineError::Configuration(format!(
                        "regressor schema for cluster {cluster_id} changed since fit: {:?} vs {:?}",
                        model.feature_schema, features.columns
                    )));
                }
                let hist_rows = features
                    .history_rows(history.start_date, last_day)
                    .map_err(|reason| PipelineError::forecast(cluster_id, reason))?
                    .to_vec();
                let mut future = features.bridge.rows.clone();
                future.extend(features.target.rows.iter().cloned());
                (Some(hist_rows), Some(future))
            } else {
                (None, None)
            };

            let fc = sarima::forecast(
                params,
                &model.order,
                &model.seasonal_order,
                &values,
                exog_history.as_deref(),
                exog_future.as_deref(),
                horizon,
            )
            .map_err(|e| match e {
                SarimaError::Regressors(reason) => PipelineError::forecast(cluster_id, reason),
                other => PipelineError::forecast(cluster_id, other.to_string()),
            })?;

            let skip = horizon - SLOTS_PER_DAY;
            (fc.mean[skip..].to_vec(), fc.std_err[skip..].to_vec())
        };

        let z = self.z_score();
        let mut clamp_events = Vec::new();
        let points = mean
            .iter()
            .zip(&std_err)
            .enumerate()
            .map(|(slot, (&raw, &se))| {
                let timestamp = slot_timestamp(target, slot);
                let mut point = ForecastPoint {
                    timestamp,
                    forecast: raw,
                    lower: self.cfg.intervals.then(|| raw - z * se),
                    upper: self.cfg.intervals.then(|| raw + z * se),
                };
                if self.cfg.clamp_non_negative {
                    clamp(&mut point, &mut clamp_events);
                }
                point
            })
            .collect::<Vec<_>>();

        for event in &clamp_events {
            warn!(cluster_id = %cluster_id, timestamp = %event.timestamp, value = ?event.value, raw = event.raw, "negative forecast clamped to zero");
        }
        debug!(cluster_id = %cluster_id, %target, degenerate = model.degenerate, "forecast produced");

        Ok(ForecastResult {
            cluster_id: cluster_id.clone(),
            target_date: target,
            points,
            fallback_flag: model.fallback_flag,
            degenerate: model.degenerate,
            clamp_events,
        })
    }
}

/// Raise negative values to zero, keeping `lower <= forecast <= upper`.
fn clamp(point: &mut ForecastPoint, events: &mut Vec<ClampEvent>) {
    let timestamp = point.timestamp;
    let mut record = |value: ClampedValue, raw: f64| {
        events.push(ClampEvent {
            timestamp,
            value,
            raw,
        })
    };
    if point.forecast < 0.0 {
        record(ClampedValue::Point, point.forecast);
        point.forecast = 0.0;
    }
    if let Some(lower) = point.lower.filter(|l| *l < 0.0) {
        record(ClampedValue::Lower, lower);
        point.lower = Some(0.0);
    }
    if let Some(upper) = point.upper.filter(|u| *u < point.forecast) {
        record(ClampedValue::Upper, upper);
        point.upper = Some(point.forecast);
    }
}
