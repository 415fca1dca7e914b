//! Per-cluster model lifecycle: reuse, refit, fallback and persistence.

pub mod optimization;
pub mod sarima;
pub mod selection;
pub mod stats;

use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{CandidateOrder, ModelConfig, WindowPolicy};
use crate::domain::{ClusterId, ClusterModel, ClusterSeries, ModelState, SLOTS_PER_DAY};
use crate::error::{PipelineError, Result};
use crate::forecast::features::FeatureSet;
use crate::repo::ModelStore;
use sarima::{FitOptions, SarimaError, SarimaFit};

/// Training window chosen for one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: usize,
    pub short_history: bool,
}

/// A fit that ended in `Failed`, with the record as persisted.
#[derive(Debug, Clone)]
pub struct FailedFit {
    pub model: ClusterModel,
    pub error: PipelineError,
}

/// Everything a fit needs for one cluster.
#[derive(Debug, Clone, Copy)]
pub struct FitInput<'a> {
    pub cluster_id: &'a ClusterId,
    /// Aggregate history strictly before the target date
    pub series: &'a ClusterSeries,
    pub features: &'a FeatureSet,
    pub fingerprint: &'a str,
    pub target: NaiveDate,
}

pub struct ModelManager {
    cfg: ModelConfig,
    store: Arc<dyn ModelStore>,
}

impl ModelManager {
    pub fn new(cfg: ModelConfig, store: Arc<dyn ModelStore>) -> Self {
        Self { cfg, store }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    fn candidates(&self) -> Vec<CandidateOrder> {
        if self.cfg.auto_select.enabled {
            self.cfg
                .auto_select
                .candidates
                .iter()
                .take(self.cfg.auto_select.max_candidates)
                .copied()
                .collect()
        } else {
            vec![CandidateOrder {
                order: self.cfg.order,
                seasonal_order: self.cfg.seasonal_order,
            }]
        }
    }

    /// Fewest whole days a fit is attempted on: two seasonal cycles or the
    /// lag requirement of the smallest candidate, whichever is larger.
    pub fn absolute_floor_days(&self) -> usize {
        let lag_days = self
            .candidates()
            .iter()
            .map(|c| sarima::min_observations(&c.order, &c.seasonal_order).div_ceil(SLOTS_PER_DAY))
            .min()
            .unwrap_or(1);
        self.cfg.absolute_min_days.max(2).max(lag_days)
    }

    /// Window for a fit on `series`, clamped to the days that exist.
    pub fn fit_window(&self, cluster_id: &ClusterId, series: &ClusterSeries) -> Result<FitWindow> {
        let floor = self.absolute_floor_days();
        let Some(end) = series.end_date() else {
            return Err(PipelineError::InsufficientHistory {
                cluster_id: cluster_id.clone(),
                needed_days: floor,
                available_days: 0,
            });
        };

        let wanted_start = match self.cfg.window {
            WindowPolicy::Rolling => end - Duration::days(self.cfg.window_days as i64 - 1),
            WindowPolicy::Expanding => self.cfg.expanding_start.unwrap_or(series.start_date),
        };
        let start = wanted_start.max(series.start_date);
        let days = ((end - start).num_days() + 1).max(0) as usize;

        if days < floor {
            return Err(PipelineError::InsufficientHistory {
                cluster_id: cluster_id.clone(),
                needed_days: floor,
                available_days: days,
            });
        }

        let short_history = days < self.cfg.min_history_days;
        if short_history {
            warn!(cluster_id = %cluster_id, days, minimum = self.cfg.min_history_days, "short history; window clamped");
        }
        Ok(FitWindow {
            start,
            end,
            days,
            short_history,
        })
    }

    /// Data has moved more than `max_age_days` past the model's window.
    pub fn is_stale(&self, model: &ClusterModel, target: NaiveDate) -> bool {
        let latest = target - Duration::days(1);
        (latest - model.window_end).num_days() > self.cfg.max_age_days
    }

    /// Whether a stored record can serve this run as-is.
    fn reusable(&self, stored: &ClusterModel, input: &FitInput<'_>) -> bool {
        if stored.state != ModelState::Fit || !stored.is_ready() {
            return false;
        }
        if stored.member_fingerprint != input.fingerprint || self.is_stale(stored, input.target) {
            return false;
        }
        if !self.cfg.auto_select.enabled
            && (stored.order != self.cfg.order || stored.seasonal_order != self.cfg.seasonal_order)
        {
            return false;
        }
        if stored.degenerate {
            return true;
        }
        // the forecast re-filters from the stored window start
        let replay = input
            .series
            .window(stored.window_start, input.target - Duration::days(1));
        let regressors_usable = input.features.exogenous_ready()
            && replay
                .end_date()
                .is_some_and(|end| input.features.history_rows(replay.start_date, end).is_ok());
        match (stored.uses_exogenous(), regressors_usable) {
            (true, true) => stored.feature_schema == input.features.columns,
            (false, false) => true,
            // exogenous model without regressors, or a fallback model now that they are back
            _ => false,
        }
    }

    /// Load, reuse or refit, and persist the model for one cluster.
    ///
    /// On success the returned model is `Fit`. A failed fit is saved as
    /// `Failed` before its error is returned.
    pub async fn prepare(&self, input: FitInput<'_>) -> Result<ClusterModel> {
        let stored = self.store.find(input.cluster_id).await?;

        let base = match stored {
            Some(stored) if self.reusable(&stored, &input) => {
                info!(cluster_id = %input.cluster_id, state = %stored.state, window_end = %stored.window_end, "reusing stored model");
                return Ok(stored);
            }
            Some(mut stored) if stored.member_fingerprint == input.fingerprint => {
                if stored.state == ModelState::Fit && self.is_stale(&stored, input.target) {
                    stored.transition(ModelState::Stale)?;
                }
                match stored.state {
                    ModelState::Stale | ModelState::Failed => stored,
                    _ => self.blank(input.cluster_id, input.target),
                }
            }
            Some(_) => {
                info!(cluster_id = %input.cluster_id, "cluster membership changed; refitting from scratch");
                self.blank(input.cluster_id, input.target)
            }
            None => self.blank(input.cluster_id, input.target),
        };

        match self.fit(base, input).await {
            Ok(model) => {
                self.store.save(input.cluster_id, &model).await?;
                Ok(model)
            }
            Err(failed) => {
                self.store.save(input.cluster_id, &failed.model).await?;
                Err(failed.error)
            }
        }
    }

    /// Fresh record whose window sits on the day before `target`, so a
    /// failure saved before a window is chosen still precedes the forecast date.
    fn blank(&self, cluster_id: &ClusterId, target: NaiveDate) -> ClusterModel {
        let day_before = target - Duration::days(1);
        ClusterModel::unfit(
            cluster_id.clone(),
            self.cfg.order,
            self.cfg.seasonal_order,
            day_before,
            day_before,
        )
    }

    /// Fit without touching the store. `base` must be `Unfit`, `Stale` or `Failed`.
    pub async fn fit(
        &self,
        mut model: ClusterModel,
        input: FitInput<'_>,
    ) -> std::result::Result<ClusterModel, FailedFit> {
        if let Err(error) = model.transition(ModelState::Fitting) {
            return Err(FailedFit { model, error });
        }
        model.fitted_params = None;
        model.feature_schema.clear();
        model.degenerate = false;
        model.fallback_flag = false;
        model.short_history = false;
        model.aic = None;
        model.failure_reason = None;
        model.member_fingerprint = input.fingerprint.to_string();
        model.fit_timestamp = Utc::now();

        match self.estimate(&mut model, &input).await {
            Ok(()) => {
                if let Err(error) = model.transition(ModelState::Fit) {
                    return Err(FailedFit { model, error });
                }
                info!(
                    cluster_id = %input.cluster_id,
                    state = %model.state,
                    window_start = %model.window_start,
                    window_end = %model.window_end,
                    fallback = model.fallback_flag,
                    degenerate = model.degenerate,
                    short_history = model.short_history,
                    aic = ?model.aic,
                    "model fitted"
                );
                Ok(model)
            }
            Err(error) => {
                model.failure_reason = Some(error.to_string());
                // Fitting -> Failed is always a legal edge
                let _ = model.transition(ModelState::Failed);
                warn!(cluster_id = %input.cluster_id, state = %model.state, reason = %error, "model fit failed");
                Err(FailedFit { model, error })
            }
        }
    }

    async fn estimate(&self, model: &mut ClusterModel, input: &FitInput<'_>) -> Result<()> {
        let window = self.fit_window(input.cluster_id, input.series)?;
        model.window_start = window.start;
        model.window_end = window.end;
        model.history_days = window.days;
        model.short_history = window.short_history;

        let slice = input.series.window(window.start, window.end);
        let values = slice.values();
        model.last_value = values.last().copied().unwrap_or(0.0);

        if is_constant(&values) {
            warn!(cluster_id = %input.cluster_id, value = model.last_value, "zero variance over fit window; serving constant forecast");
            model.degenerate = true;
            return Ok(());
        }

        let exog = match input.features.fallback_reason() {
            Some(reason) => Err(reason.to_string()),
            None if input.features.columns.is_empty() => Err("no regressor columns".to_string()),
            None => input
                .features
                .history_rows(window.start, window.end)
                .map(|rows| rows.to_vec()),
        };

        if let Ok(rows) = exog {
            match self.run_fit(values.clone(), Some(rows)).await {
                Ok((candidate, fit)) => {
                    apply(model, candidate, fit);
                    model.feature_schema = input.features.columns.clone();
                    return Ok(());
                }
                Err(e) => {
                    warn!(cluster_id = %input.cluster_id, reason = %e, "exogenous fit failed; retrying univariate");
                }
            }
        } else if let Err(reason) = exog {
            warn!(cluster_id = %input.cluster_id, %reason, "fitting univariate model");
        }

        model.fallback_flag = true;
        let (candidate, fit) = self
            .run_fit(values, None)
            .await
            .map_err(|e| self.map_error(input.cluster_id, e, window.days))?;
        apply(model, candidate, fit);
        Ok(())
    }

    /// Run the estimator on the blocking pool under the per-fit budget.
    async fn run_fit(
        &self,
        values: Vec<f64>,
        exog: Option<Vec<Vec<f64>>>,
    ) -> std::result::Result<(CandidateOrder, SarimaFit), SarimaError> {
        let candidates = self.candidates();
        let opts = FitOptions {
            max_iterations: self.cfg.max_iterations,
            tolerance: self.cfg.tolerance,
            deadline: Some(Instant::now() + std::time::Duration::from_millis(self.cfg.fit_timeout_ms)),
        };

        let handle = tokio::task::spawn_blocking(move || {
            let exog = exog.as_deref();
            if candidates.len() == 1 {
                let c = candidates[0];
                sarima::fit(&values, exog, &c.order, &c.seasonal_order, &opts).map(|fit| (c, fit))
            } else {
                selection::select_order(&values, exog, &candidates, candidates.len(), &opts)
                    .map(|s| (s.candidate, s.fit))
            }
        });
        handle
            .await
            .map_err(|e| SarimaError::NonFinite(format!("fit task aborted: {e}")))?
    }

    fn map_error(&self, cluster_id: &ClusterId, err: SarimaError, days: usize) -> PipelineError {
        match err {
            SarimaError::InsufficientData { needed, .. } => PipelineError::InsufficientHistory {
                cluster_id: cluster_id.clone(),
                needed_days: needed.div_ceil(SLOTS_PER_DAY),
                available_days: days,
            },
            other => PipelineError::convergence(cluster_id, other.to_string()),
        }
    }
}

fn apply(model: &mut ClusterModel, candidate: CandidateOrder, fit: SarimaFit) {
    model.order = candidate.order;
    model.seasonal_order = candidate.seasonal_order;
    model.aic = Some(fit.aic);
    model.fitted_params = Some(fit.params);
}

fn is_constant(values: &[f64]) -> bool {
    match values.first() {
        Some(first) => values.iter().all(|v| v == first),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeaturesConfig;
    use crate::domain::{ArimaOrder, SeasonalOrder};
    use crate::forecast::features::FeatureAssembler;
    use crate::forecast::weather::{CalendarTable, WeatherDay, WeatherTable};
    use crate::repo::InMemoryModelStore;
    use rstest::rstest;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn series(days: usize, f: impl Fn(usize, usize) -> f64) -> ClusterSeries {
        let days = (0..days)
            .map(|d| {
                let mut day = [(0.0, 3); SLOTS_PER_DAY];
                for (s, v) in day.iter_mut().enumerate() {
                    v.0 = f(d, s);
                }
                day
            })
            .collect();
        ClusterSeries::from_days(ClusterId::from("A"), start(), days)
    }

    fn wavy(d: usize, s: usize) -> f64 {
        let x = (d * SLOTS_PER_DAY + s) as f64;
        5.0 + 2.0 * (std::f64::consts::TAU * s as f64 / 48.0).sin() + 0.3 * (x * 0.37).sin()
    }

    fn weather(days: usize) -> WeatherTable {
        WeatherTable::new((0..days).map(|i| WeatherDay {
            date: start() + Duration::days(i as i64),
            min_temp: 2.0 + (i % 5) as f64,
            max_temp: 8.0 + (i % 3) as f64,
            hourly_temps: None,
        }))
    }

    fn cfg() -> ModelConfig {
        ModelConfig {
            window_days: 20,
            min_history_days: 10,
            order: ArimaOrder::new(1, 0, 0),
            seasonal_order: SeasonalOrder::new(0, 1, 0, 48),
            ..Default::default()
        }
    }

    fn manager(cfg: ModelConfig) -> (ModelManager, Arc<InMemoryModelStore>) {
        let store = Arc::new(InMemoryModelStore::new());
        (ModelManager::new(cfg, store.clone()), store)
    }

    #[rstest]
    #[case(30, 20, false)]
    #[case(15, 15, false)]
    #[case(6, 6, true)]
    fn test_fit_window_clamps(#[case] available: usize, #[case] expected: usize, #[case] short: bool) {
        let (mgr, _) = manager(cfg());
        let w = mgr.fit_window(&ClusterId::from("A"), &series(available, wavy)).unwrap();
        assert_eq!(w.days, expected);
        assert_eq!(w.short_history, short);
        assert_eq!(w.end, start() + Duration::days(available as i64 - 1));
    }

    #[test]
    fn test_below_floor_is_insufficient_history() {
        let (mgr, _) = manager(cfg());
        // (1,0,0)(0,1,0)48 needs 1 + 48 + 48 observations -> 3 days
        assert_eq!(mgr.absolute_floor_days(), 3);
        let err = mgr.fit_window(&ClusterId::from("A"), &series(2, wavy)).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientHistory { needed_days: 3, available_days: 2, .. }));
    }

    #[tokio::test]
    async fn test_exogenous_fit_persisted_then_reused() {
        let (mgr, store) = manager(cfg());
        let s = series(30, wavy);
        let target = start() + Duration::days(30);
        let features = FeatureAssembler::new(FeaturesConfig::default()).assemble(&s, target, &weather(31), &CalendarTable::default());
        let input = FitInput { cluster_id: &s.cluster_id, series: &s, features: &features, fingerprint: "fp", target };

        let model = mgr.prepare(input).await.unwrap();
        assert_eq!(model.state, ModelState::Fit);
        assert!(!model.fallback_flag);
        assert_eq!(model.feature_schema, features.columns);
        assert_eq!(store.load(&s.cluster_id).await.unwrap(), model);

        let again = mgr.prepare(input).await.unwrap();
        assert_eq!(again.fit_timestamp, model.fit_timestamp);
    }

    #[tokio::test]
    async fn test_missing_weather_falls_back_and_refits_when_weather_returns() {
        let (mgr, _) = manager(cfg());
        let s = series(30, wavy);
        let target = start() + Duration::days(30);
        let assembler = FeatureAssembler::new(FeaturesConfig::default());

        let partial = assembler.assemble(&s, target, &weather(30), &CalendarTable::default());
        let input = FitInput { cluster_id: &s.cluster_id, series: &s, features: &partial, fingerprint: "fp", target };
        let fallback = mgr.prepare(input).await.unwrap();
        assert!(fallback.fallback_flag);
        assert!(!fallback.uses_exogenous());

        let full = assembler.assemble(&s, target, &weather(31), &CalendarTable::default());
        let input = FitInput { features: &full, ..input };
        let refit = mgr.prepare(input).await.unwrap();
        assert!(!refit.fallback_flag);
        assert!(refit.uses_exogenous());
    }

    #[tokio::test]
    async fn test_constant_window_is_degenerate() {
        let (mgr, _) = manager(cfg());
        let s = series(30, |d, s| if d >= 10 { 4.5 } else { wavy(d, s) });
        let target = start() + Duration::days(30);
        let features = FeatureAssembler::new(FeaturesConfig::default()).assemble(&s, target, &weather(31), &CalendarTable::default());
        let input = FitInput { cluster_id: &s.cluster_id, series: &s, features: &features, fingerprint: "fp", target };

        let model = mgr.prepare(input).await.unwrap();
        assert!(model.degenerate);
        assert!(model.fitted_params.is_none());
        assert_eq!(model.last_value, 4.5);
        assert!(model.is_ready());
    }

    #[tokio::test]
    async fn test_failed_fit_persisted_as_failed() {
        let (mgr, store) = manager(cfg());
        let s = series(2, wavy);
        let target = start() + Duration::days(2);
        let features = FeatureAssembler::new(FeaturesConfig::default()).assemble(&s, target, &weather(3), &CalendarTable::default());
        let input = FitInput { cluster_id: &s.cluster_id, series: &s, features: &features, fingerprint: "fp", target };

        let err = mgr.prepare(input).await.unwrap_err();
        assert_eq!(err.kind(), "insufficient_history");
        let stored = store.load(&s.cluster_id).await.unwrap();
        assert_eq!(stored.state, ModelState::Failed);
        assert!(stored.failure_reason.is_some());
        // no window was chosen; the record still sits before the forecast date
        assert_eq!(stored.window_end, target - Duration::days(1));
        assert!(stored.window_start <= stored.window_end);
    }

    #[rstest]
    #[case::gap_before_window(3, false)]
    #[case::gap_inside_window(15, true)]
    #[tokio::test]
    async fn test_history_weather_gap_matters_only_inside_fit_window(#[case] missing_day: i64, #[case] fallback: bool) {
        let (mgr, _) = manager(cfg());
        let s = series(30, wavy);
        let target = start() + Duration::days(30);
        let missing = start() + Duration::days(missing_day);
        let full = weather(31);
        let gappy = WeatherTable::new(
            (0..31)
                .filter_map(|i| full.get(start() + Duration::days(i)).cloned())
                .filter(|w| w.date != missing),
        );
        let features = FeatureAssembler::new(FeaturesConfig::default()).assemble(&s, target, &gappy, &CalendarTable::default());
        assert!(features.exogenous_ready());
        let input = FitInput { cluster_id: &s.cluster_id, series: &s, features: &features, fingerprint: "fp", target };

        let model = mgr.prepare(input).await.unwrap();
        assert_eq!(model.window_start, start() + Duration::days(10));
        assert_eq!(model.fallback_flag, fallback);
        assert_eq!(model.uses_exogenous(), !fallback);

        // reuse keeps the stored model either way
        let again = mgr.prepare(input).await.unwrap();
        assert_eq!(again.fit_timestamp, model.fit_timestamp);
    }

    #[tokio::test]
    async fn test_membership_change_and_staleness_force_refit() {
        let (mgr, _) = manager(cfg());
        let s = series(30, wavy);
        let target = start() + Duration::days(30);
        let features = FeatureAssembler::new(FeaturesConfig::default()).assemble(&s, target, &weather(31), &CalendarTable::default());
        let input = FitInput { cluster_id: &s.cluster_id, series: &s, features: &features, fingerprint: "fp", target };
        let first = mgr.prepare(input).await.unwrap();

        let changed = mgr.prepare(FitInput { fingerprint: "other", ..input }).await.unwrap();
        assert_eq!(changed.member_fingerprint, "other");
        assert!(changed.fit_timestamp >= first.fit_timestamp);

        let later = target + Duration::days(mgr.config().max_age_days + 2);
        assert!(mgr.is_stale(&changed, later));
        assert!(!mgr.is_stale(&changed, target));
    }
}
