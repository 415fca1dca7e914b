//! One forecasting run for one target date.
//!
//! Alignment and aggregation run once; every cluster then gets its own task
//! (features, fit or reuse, forecast, holdout evaluation) on a bounded pool.

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{member_fingerprint, ClusterAggregator, ClusterLookup, StaticAssignments};
use crate::align::{AlignmentWindow, DataAligner};
use crate::config::{Config, InputsConfig, OutputsConfig};
use crate::domain::{
    ClampEvent, ClusterAssignment, ClusterId, ClusterSeries, EvaluationMetric, ForecastResult,
    HouseholdReading,
};
use crate::error::{PipelineError, Result};
use crate::evaluate::{EvaluationContext, Evaluator};
use crate::forecast::weather::{CalendarTable, WeatherTable};
use crate::forecast::{FeatureAssembler, Forecaster};
use crate::io;
use crate::model::{FitInput, ModelManager};
use crate::profiles::{cluster_profiles, ProfileRow};
use crate::repo::ModelStore;

/// The four input tables of a run.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub readings: Vec<HouseholdReading>,
    pub assignments: Vec<ClusterAssignment>,
    pub weather: WeatherTable,
    pub calendar: CalendarTable,
}

impl Inputs {
    /// Read every configured table; a missing required table is fatal.
    pub fn load(cfg: &InputsConfig) -> anyhow::Result<Self> {
        let readings = io::read_readings(&cfg.readings).context("loading household readings")?;
        let assignments =
            io::read_assignments(&cfg.assignments).context("loading cluster assignments")?;
        let weather = io::read_weather(&cfg.weather).context("loading weather forecast")?;
        let calendar = match &cfg.calendar {
            Some(path) => io::read_calendar(path).context("loading calendar")?,
            None => CalendarTable::default(),
        };
        Ok(Self {
            readings: readings.rows,
            assignments: assignments.rows,
            weather,
            calendar,
        })
    }
}

/// What happened to one cluster in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusterOutcome {
    Forecast {
        fallback_flag: bool,
        degenerate: bool,
        short_history: bool,
        clamp_events: Vec<ClampEvent>,
        evaluated_days: usize,
    },
    Failed {
        kind: String,
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

impl ClusterOutcome {
    fn failed(err: &PipelineError) -> Self {
        Self::Failed {
            kind: err.kind().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Forecast { .. } => "forecast",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timed_out: bool,
    pub households: usize,
    pub rejected_households: usize,
    pub discarded_readings: usize,
    pub partial_days: usize,
    pub forecasted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub clusters: BTreeMap<ClusterId, ClusterOutcome>,
}

/// Everything a run produced, ready to be written out.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Sorted by cluster id
    pub forecasts: Vec<ForecastResult>,
    pub metrics: Vec<EvaluationMetric>,
    pub profiles: Vec<ProfileRow>,
}

impl RunReport {
    /// Fatal when clusters existed but none produced a forecast.
    pub fn is_fatal(&self) -> bool {
        !self.summary.clusters.is_empty() && self.summary.forecasted == 0
    }

    /// Write forecast tables, profiles and the run summary; append diagnostics.
    pub fn write(&self, outputs: &OutputsConfig) -> anyhow::Result<Vec<PathBuf>> {
        let date = self.summary.target_date;
        let csv = outputs.dir.join(format!("forecasts_{date}.csv"));
        let json = outputs.dir.join(format!("forecasts_{date}.json"));
        let summary = outputs.dir.join(format!("run_summary_{date}.json"));

        io::write_forecast_csv(&csv, &self.forecasts)?;
        io::write_forecast_json(&json, &self.forecasts)?;
        io::write_json(&summary, &self.summary)?;
        let mut written = vec![csv, json, summary];

        if !self.metrics.is_empty() {
            io::append_diagnostics(&outputs.diagnostics_log, &self.metrics)?;
            written.push(outputs.diagnostics_log.clone());
        }
        if outputs.write_profiles && !self.profiles.is_empty() {
            let csv = outputs.dir.join("cluster_profiles.csv");
            let json = outputs.dir.join("cluster_profiles.json");
            io::write_profiles_csv(&csv, &self.profiles)?;
            io::write_json(&json, &self.profiles)?;
            written.extend([csv, json]);
        }
        Ok(written)
    }
}

struct ClusterDone {
    forecast: ForecastResult,
    metrics: Vec<EvaluationMetric>,
    short_history: bool,
}

/// Read-only state shared by the cluster tasks.
struct Shared {
    manager: ModelManager,
    assembler: FeatureAssembler,
    forecaster: Forecaster,
    evaluator: Option<Evaluator>,
    weather: WeatherTable,
    calendar: CalendarTable,
}

impl Shared {
    async fn process(
        &self,
        cluster_id: ClusterId,
        series: ClusterSeries,
        fingerprint: String,
        target: NaiveDate,
    ) -> Result<ClusterDone> {
        let history = series.before(target);
        let features = self
            .assembler
            .assemble(&history, target, &self.weather, &self.calendar);
        if let Some(reason) = features.fallback_reason() {
            warn!(cluster_id = %cluster_id, reason = %reason, "regressors unavailable; univariate fallback");
        }

        let model = self
            .manager
            .prepare(FitInput {
                cluster_id: &cluster_id,
                series: &history,
                features: &features,
                fingerprint: &fingerprint,
                target,
            })
            .await?;
        let forecast = self
            .forecaster
            .forecast(&model, &history, &features, target)?;

        let metrics = match &self.evaluator {
            Some(evaluator) => {
                let ctx = EvaluationContext {
                    manager: &self.manager,
                    assembler: &self.assembler,
                    forecaster: &self.forecaster,
                    weather: &self.weather,
                    calendar: &self.calendar,
                };
                evaluator
                    .evaluate(ctx, &cluster_id, &history, &fingerprint)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(cluster_id = %cluster_id, reason = %e, "holdout evaluation skipped");
                        Vec::new()
                    })
            }
            None => Vec::new(),
        };

        Ok(ClusterDone {
            forecast,
            metrics,
            short_history: model.short_history,
        })
    }
}

pub struct Pipeline {
    cfg: Config,
    tz: Tz,
    store: Arc<dyn ModelStore>,
}

impl Pipeline {
    pub fn new(cfg: Config, store: Arc<dyn ModelStore>) -> anyhow::Result<Self> {
        let tz = cfg.clock.tz()?;
        Ok(Self { cfg, tz, store })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Configured target date, or tomorrow in the canonical clock.
    pub fn target_date(&self) -> NaiveDate {
        self.cfg.run.target_date.unwrap_or_else(|| {
            Utc::now().with_timezone(&self.tz).date_naive() + Duration::days(1)
        })
    }

    /// Run without an external cancellation source.
    pub async fn run(&self, inputs: Inputs, target: NaiveDate) -> Result<RunReport> {
        self.run_until(inputs, target, std::future::pending::<()>()).await
    }

    /// Run until done, the run timeout elapses, or `shutdown` resolves.
    ///
    /// Clusters still pending when the run is cut short are reported as skipped.
    /// Only configuration errors (e.g. conflicting assignments) fail the whole run.
    pub async fn run_until(
        &self,
        inputs: Inputs,
        target: NaiveDate,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, %target, "forecast run started");

        let lookup = StaticAssignments::from_rows(&inputs.assignments)?;
        let clusters: Vec<ClusterId> = match &self.cfg.aggregation.clusters {
            // configured ids are taken as given; one without members fails on its own
            Some(only) => only.iter().map(|c| ClusterId::from(c.as_str())).unique().collect(),
            None => lookup.clusters(),
        };

        let window = AlignmentWindow::ending_before(target, self.cfg.alignment.history_days);
        let aligner = DataAligner::new(self.tz, self.cfg.alignment.clone());
        let aligned = aligner.align(&inputs.readings, window);

        let profiles = if self.cfg.outputs.write_profiles {
            cluster_profiles(&clusters, &lookup, &aligned)
        } else {
            Vec::new()
        };

        let aggregator = ClusterAggregator::new(self.cfg.aggregation.clone());
        let mut outcomes: BTreeMap<ClusterId, ClusterOutcome> = BTreeMap::new();
        let mut work = Vec::new();
        for cluster_id in &clusters {
            match aggregator.aggregate(cluster_id, &lookup, &aligned, window) {
                Ok(series) => {
                    let fingerprint = member_fingerprint(&lookup.members(cluster_id));
                    work.push((cluster_id.clone(), series, fingerprint));
                }
                Err(e) => {
                    warn!(cluster_id = %cluster_id, reason = %e, "cluster not aggregated");
                    outcomes.insert(cluster_id.clone(), ClusterOutcome::failed(&e));
                }
            }
        }

        let shared = Arc::new(Shared {
            manager: ModelManager::new(self.cfg.model.clone(), Arc::clone(&self.store)),
            assembler: FeatureAssembler::new(self.cfg.features.clone()),
            forecaster: Forecaster::new(self.cfg.forecast.clone()),
            evaluator: self
                .cfg
                .evaluation
                .enabled
                .then(|| Evaluator::new(self.cfg.evaluation.clone())),
            weather: inputs.weather,
            calendar: inputs.calendar,
        });
        let permits = Arc::new(Semaphore::new(self.cfg.run.max_parallel_fits));
        let mut tasks = JoinSet::new();
        for (cluster_id, series, fingerprint) in work {
            let shared = Arc::clone(&shared);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        shared
                            .process(cluster_id.clone(), series, fingerprint, target)
                            .await
                    }
                    Err(_) => Err(PipelineError::Configuration("worker pool closed".into())),
                };
                (cluster_id, result)
            });
        }

        let mut forecasts = Vec::new();
        let mut metrics = Vec::new();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                let (cluster_id, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        error!(error = %e, "cluster task aborted");
                        continue;
                    }
                };
                match result {
                    Ok(done) => {
                        outcomes.insert(
                            cluster_id,
                            ClusterOutcome::Forecast {
                                fallback_flag: done.forecast.fallback_flag,
                                degenerate: done.forecast.degenerate,
                                short_history: done.short_history,
                                clamp_events: done.forecast.clamp_events.clone(),
                                evaluated_days: done.metrics.len(),
                            },
                        );
                        forecasts.push(done.forecast);
                        metrics.extend(done.metrics);
                    }
                    Err(e) => {
                        warn!(cluster_id = %cluster_id, kind = e.kind(), reason = %e, "cluster failed");
                        outcomes.insert(cluster_id, ClusterOutcome::failed(&e));
                    }
                }
            }
        };

        let budget = std::time::Duration::from_secs(self.cfg.run.timeout_seconds);
        let cut_short = tokio::select! {
            finished = tokio::time::timeout(budget, drain) => finished.is_err(),
            _ = shutdown => true,
        };
        if cut_short {
            warn!(pending = tasks.len(), "run cut short; pending clusters skipped");
            tasks.abort_all();
        }
        for cluster_id in &clusters {
            outcomes.entry(cluster_id.clone()).or_insert_with(|| {
                let reason = if cut_short {
                    "run timeout or shutdown before processing finished"
                } else {
                    "cluster task aborted"
                };
                ClusterOutcome::Skipped {
                    reason: reason.to_string(),
                }
            });
        }

        forecasts.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        metrics.sort_by(|a, b| (&a.cluster_id, a.date).cmp(&(&b.cluster_id, b.date)));

        let counts = outcomes.values().counts_by(|o| o.status());
        let summary = RunSummary {
            run_id,
            target_date: target,
            started_at,
            finished_at: Utc::now(),
            timed_out: cut_short,
            households: aligned.households.len(),
            rejected_households: aligned.rejected.len(),
            discarded_readings: aligned.discarded_readings,
            partial_days: aligned.completeness.iter().filter(|c| c.is_partial()).count(),
            forecasted: counts.get("forecast").copied().unwrap_or(0),
            failed: counts.get("failed").copied().unwrap_or(0),
            skipped: counts.get("skipped").copied().unwrap_or(0),
            clusters: outcomes,
        };
        info!(
            %run_id,
            forecasted = summary.forecasted,
            failed = summary.failed,
            skipped = summary.skipped,
            timed_out = summary.timed_out,
            "forecast run finished"
        );

        Ok(RunReport {
            summary,
            forecasts,
            metrics,
            profiles,
        })
    }
}
