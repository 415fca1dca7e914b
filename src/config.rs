use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::{Validate, ValidationError};

use crate::domain::{ArimaOrder, SeasonalOrder, SLOTS_PER_DAY};

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Config {
    pub inputs: InputsConfig,
    pub outputs: OutputsConfig,
    #[validate(nested)]
    pub clock: ClockConfig,
    #[validate(nested)]
    pub alignment: AlignmentConfig,
    pub aggregation: AggregationConfig,
    pub features: FeaturesConfig,
    #[validate(nested)]
    pub model: ModelConfig,
    #[validate(nested)]
    pub forecast: ForecastConfig,
    #[validate(nested)]
    pub evaluation: EvaluationConfig,
    #[validate(nested)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputsConfig {
    pub readings: PathBuf,
    pub assignments: PathBuf,
    pub weather: PathBuf,
    /// Calendar is optional; weekend/holiday flags are derived when absent
    pub calendar: Option<PathBuf>,
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            readings: PathBuf::from("data/readings.csv"),
            assignments: PathBuf::from("data/cluster_assignments.csv"),
            weather: PathBuf::from("data/weather.csv"),
            calendar: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputsConfig {
    pub dir: PathBuf,
    pub model_store_dir: PathBuf,
    pub diagnostics_log: PathBuf,
    pub write_profiles: bool,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("outputs"),
            model_store_dir: PathBuf::from("outputs/models"),
            diagnostics_log: PathBuf::from("outputs/diagnostics.csv"),
            write_profiles: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ClockConfig {
    /// IANA zone of the canonical wall clock
    #[validate(custom(function = "validate_timezone"))]
    pub timezone: String,
}

impl ClockConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {}", self.timezone, e))
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/London".to_string(),
        }
    }
}

fn validate_timezone(value: &str) -> Result<(), ValidationError> {
    value
        .parse::<Tz>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unknown_timezone"))
}

/// What to do with a household-day under the completeness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialDayPolicy {
    Interpolate,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    Linear,
    ForwardFill,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AlignmentConfig {
    #[validate(range(min = 1, max = 3650))]
    pub history_days: u32,
    /// Fraction of the 48 slots a day needs to count as complete
    #[validate(range(min = 0.0, max = 1.0))]
    pub completeness_threshold: f64,
    pub partial_policy: PartialDayPolicy,
    pub fill_method: FillMethod,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            history_days: 90,
            completeness_threshold: 1.0,
            partial_policy: PartialDayPolicy::Interpolate,
            fill_method: FillMethod::Linear,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Sum,
    Mean,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub method: AggregationMethod,
    /// Rescale sums by member_count / contributing_count
    pub rescale_to_members: bool,
    /// Run exactly these cluster ids; an id without members fails on its own
    pub clusters: Option<Vec<String>>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            method: AggregationMethod::Sum,
            rescale_to_members: true,
            clusters: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub use_weather: bool,
    pub hourly_temps: bool,
    pub hour_of_day_dummies: bool,
    pub month_dummies: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            use_weather: true,
            hourly_temps: false,
            hour_of_day_dummies: false,
            month_dummies: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    Rolling,
    Expanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CandidateOrder {
    pub order: ArimaOrder,
    pub seasonal_order: SeasonalOrder,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoSelectConfig {
    pub enabled: bool,
    pub candidates: Vec<CandidateOrder>,
    /// Hard cap on candidates evaluated per fit
    pub max_candidates: usize,
}

impl Default for AutoSelectConfig {
    fn default() -> Self {
        let s = SLOTS_PER_DAY;
        Self {
            enabled: false,
            candidates: vec![
                CandidateOrder {
                    order: ArimaOrder::new(1, 0, 0),
                    seasonal_order: SeasonalOrder::new(0, 1, 0, s),
                },
                CandidateOrder {
                    order: ArimaOrder::new(1, 0, 0),
                    seasonal_order: SeasonalOrder::new(1, 1, 0, s),
                },
                CandidateOrder {
                    order: ArimaOrder::new(1, 0, 1),
                    seasonal_order: SeasonalOrder::new(0, 1, 1, s),
                },
                CandidateOrder {
                    order: ArimaOrder::new(2, 0, 0),
                    seasonal_order: SeasonalOrder::new(1, 1, 0, s),
                },
            ],
            max_candidates: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_model_config"))]
pub struct ModelConfig {
    pub window: WindowPolicy,
    #[validate(range(min = 1, max = 3650))]
    pub window_days: usize,
    /// Fixed start of an expanding window; defaults to the first available day
    pub expanding_start: Option<NaiveDate>,
    /// Below this the window is clamped and the model marked short-history
    #[validate(range(min = 1))]
    pub min_history_days: usize,
    /// Absolute floor; fewer days is an insufficient-history failure
    #[validate(range(min = 2))]
    pub absolute_min_days: usize,
    /// Days the data may advance past window_end before a model is stale
    pub max_age_days: i64,
    pub order: ArimaOrder,
    pub seasonal_order: SeasonalOrder,
    pub auto_select: AutoSelectConfig,
    #[validate(range(min = 1, max = 100000))]
    pub max_iterations: usize,
    #[validate(range(min = 1))]
    pub fit_timeout_ms: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub tolerance: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            window: WindowPolicy::Rolling,
            window_days: 60,
            expanding_start: None,
            min_history_days: 28,
            absolute_min_days: 2,
            max_age_days: 7,
            order: ArimaOrder::new(1, 0, 0),
            seasonal_order: SeasonalOrder::new(1, 1, 0, SLOTS_PER_DAY),
            auto_select: AutoSelectConfig::default(),
            max_iterations: 2000,
            fit_timeout_ms: 30_000,
            tolerance: 1e-7,
        }
    }
}

fn validate_model_config(cfg: &ModelConfig) -> Result<(), ValidationError> {
    if cfg.min_history_days < cfg.absolute_min_days {
        return Err(ValidationError::new("min_history_below_absolute_floor"));
    }
    if cfg.max_age_days < 0 {
        return Err(ValidationError::new("negative_max_age"));
    }
    if cfg.seasonal_order.is_active() && cfg.seasonal_order.period != SLOTS_PER_DAY {
        return Err(ValidationError::new("seasonal_period_must_be_daily"));
    }
    if cfg.auto_select.enabled
        && (cfg.auto_select.candidates.is_empty() || cfg.auto_select.max_candidates == 0)
    {
        return Err(ValidationError::new("empty_candidate_grid"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ForecastConfig {
    pub intervals: bool,
    #[validate(range(min = 0.5, max = 0.999))]
    pub confidence_level: f64,
    pub clamp_non_negative: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            intervals: true,
            confidence_level: 0.95,
            clamp_non_negative: true,
        }
    }
}

/// Denominator rule for actuals equal to zero in MAPE.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ZeroActualRule {
    /// Leave the slot out of the MAPE average
    Exclude,
    /// Divide by `epsilon` instead of zero
    Epsilon { epsilon: f64 },
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct EvaluationConfig {
    pub enabled: bool,
    #[validate(range(min = 1, max = 366))]
    pub holdout_days: usize,
    pub zero_actual: ZeroActualRule,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            holdout_days: 7,
            zero_actual: ZeroActualRule::Exclude,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct RunConfig {
    /// Day to forecast; tomorrow in the canonical clock when unset
    pub target_date: Option<NaiveDate>,
    #[validate(range(min = 1, max = 256))]
    pub max_parallel_fits: usize,
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_date: None,
            max_parallel_fits: 4,
            timeout_seconds: 1800,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CDF__").split("__"));
        let cfg: Config = figment.extract().context("failed to read configuration")?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}
