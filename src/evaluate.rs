//! Holdout backtest: fit before the holdout, forecast each holdout day, score.

use chrono::{Duration, NaiveDate};
use tracing::{info, warn};

use crate::config::EvaluationConfig;
use crate::domain::{ClusterId, ClusterModel, ClusterSeries, EvaluationMetric};
use crate::error::{PipelineError, Result};
use crate::forecast::metrics::ForecastMetrics;
use crate::forecast::weather::{CalendarTable, WeatherTable};
use crate::forecast::{FeatureAssembler, Forecaster};
use crate::model::{FitInput, ModelManager};

pub struct Evaluator {
    cfg: EvaluationConfig,
}

/// Shared read-only inputs of an evaluation.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub manager: &'a ModelManager,
    pub assembler: &'a FeatureAssembler,
    pub forecaster: &'a Forecaster,
    pub weather: &'a WeatherTable,
    pub calendar: &'a CalendarTable,
}

impl Evaluator {
    pub fn new(cfg: EvaluationConfig) -> Self {
        Self { cfg }
    }

    /// First day of the holdout for a series, if the series is long enough to have one.
    pub fn holdout_start(&self, series: &ClusterSeries) -> Option<NaiveDate> {
        let end = series.end_date()?;
        let start = end - Duration::days(self.cfg.holdout_days as i64 - 1);
        (start > series.start_date).then_some(start)
    }

    /// Score one cluster over the last `holdout_days` of `series`.
    ///
    /// The model is fit on data strictly before the holdout and never persisted.
    /// Days whose forecast cannot be produced, and gap-filled days with no
    /// reporting household, are logged and skipped.
    pub async fn evaluate(
        &self,
        ctx: EvaluationContext<'_>,
        cluster_id: &ClusterId,
        series: &ClusterSeries,
        fingerprint: &str,
    ) -> Result<Vec<EvaluationMetric>> {
        let Some(holdout_start) = self.holdout_start(series) else {
            return Err(PipelineError::InsufficientHistory {
                cluster_id: cluster_id.clone(),
                needed_days: self.cfg.holdout_days + 1,
                available_days: series.num_days(),
            });
        };

        let train = series.before(holdout_start);
        let features = ctx
            .assembler
            .assemble(&train, holdout_start, ctx.weather, ctx.calendar);
        let cfg = ctx.manager.config();
        let base = ClusterModel::unfit(
            cluster_id.clone(),
            cfg.order,
            cfg.seasonal_order,
            train.start_date,
            holdout_start,
        );
        let model = ctx
            .manager
            .fit(
                base,
                FitInput {
                    cluster_id,
                    series: &train,
                    features: &features,
                    fingerprint,
                    target: holdout_start,
                },
            )
            .await
            .map_err(|failed| failed.error)?;

        let mut metrics = Vec::new();
        let mut date = holdout_start;
        while let Some(actual_day) = series.day(date) {
            if actual_day.iter().all(|s| s.contributing_count == 0) {
                warn!(cluster_id = %cluster_id, %date, "no contributing households; holdout day skipped");
                date += Duration::days(1);
                continue;
            }
            let history = series.before(date);
            let day_features = ctx.assembler.assemble(&history, date, ctx.weather, ctx.calendar);
            if model.uses_exogenous() && !day_features.exogenous_ready() {
                warn!(cluster_id = %cluster_id, %date, "regressors unavailable for holdout day; skipped");
                date += Duration::days(1);
                continue;
            }

            match ctx.forecaster.forecast(&model, &history, &day_features, date) {
                Ok(result) => {
                    let actual: Vec<f64> = actual_day.iter().map(|s| s.aggregate_consumption).collect();
                    let scored = ForecastMetrics::calculate(&actual, &result.point_forecasts(), self.cfg.zero_actual)
                        .map_err(|e| PipelineError::forecast(cluster_id, e.to_string()))?;
                    metrics.push(EvaluationMetric {
                        cluster_id: cluster_id.clone(),
                        date,
                        mape: scored.mape,
                        rmse: scored.rmse,
                        mae: scored.mae,
                        excluded_slots: scored.excluded_from_mape,
                        fallback_flag: model.fallback_flag,
                        degenerate_flag: model.degenerate,
                    });
                }
                Err(e) => warn!(cluster_id = %cluster_id, %date, reason = %e, "holdout forecast failed; skipped"),
            }
            date += Duration::days(1);
        }

        info!(cluster_id = %cluster_id, days = metrics.len(), "holdout evaluation complete");
        Ok(metrics)
    }
}
