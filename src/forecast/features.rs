//! Exogenous regressor assembly
//!
//! Builds the per-slot regressor matrix for a cluster's training window and
//! the 48-row matrix for the forecast date. Both come from the same column
//! schema, so training-time and forecast-time columns always line up.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::weather::{CalendarDay, CalendarTable, WeatherDay, WeatherTable};
use crate::config::FeaturesConfig;
use crate::domain::{ClusterSeries, SLOTS_PER_DAY};

/// Regressor rows (one per half-hour slot) under a fixed column schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExogMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl ExogMatrix {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when every value is finite and every row has the schema width.
    pub fn is_complete(&self) -> bool {
        self.rows
            .iter()
            .all(|r| r.len() == self.width() && r.iter().all(|v| v.is_finite()))
    }

    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[idx]).collect()
    }
}

/// Whether the model stage may use exogenous regressors this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ExogSignal {
    Ready,
    /// Fit and forecast without regressors
    Fallback { reason: String },
}

/// Everything the model stage needs about regressors for one cluster run.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub columns: Vec<String>,
    /// Aligned slot-for-slot with the cluster series from `history_start`.
    /// Days without usable weather carry NaN weather columns.
    pub history: ExogMatrix,
    pub history_start: NaiveDate,
    /// History days whose regressors are incomplete, with what is missing
    pub history_gaps: Vec<(NaiveDate, String)>,
    /// Rows for days between the end of history and the target date
    pub bridge: ExogMatrix,
    /// 48 rows for the target date; weather columns are NaN when partial
    pub target: ExogMatrix,
    pub signal: ExogSignal,
}

impl FeatureSet {
    pub fn exogenous_ready(&self) -> bool {
        self.signal == ExogSignal::Ready && !self.columns.is_empty()
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match &self.signal {
            ExogSignal::Fallback { reason } => Some(reason),
            ExogSignal::Ready => None,
        }
    }

    /// History rows covering `from..=to`, or why that range cannot be used.
    ///
    /// Only gaps inside the range matter; a missing day elsewhere in the
    /// history does not block a window that avoids it.
    pub fn history_rows(&self, from: NaiveDate, to: NaiveDate) -> Result<&[Vec<f64>], String> {
        if let Some((date, issue)) = self
            .history_gaps
            .iter()
            .find(|(date, _)| (from..=to).contains(date))
        {
            return Err(format!("history date {date}: {issue}"));
        }
        let start = (from - self.history_start).num_days();
        let end = (to - self.history_start).num_days() + 1;
        if start < 0 || end <= start {
            return Err(format!("history rows start {}, requested {from}..={to}", self.history_start));
        }
        self.history
            .rows
            .get(start as usize * SLOTS_PER_DAY..end as usize * SLOTS_PER_DAY)
            .ok_or_else(|| {
                format!(
                    "regressor history has {} rows, requested {from}..={to}",
                    self.history.len()
                )
            })
    }
}

pub struct FeatureAssembler {
    cfg: FeaturesConfig,
}

impl FeatureAssembler {
    pub fn new(cfg: FeaturesConfig) -> Self {
        Self { cfg }
    }

    /// Column schema in fixed order.
    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::new();
        if self.cfg.use_weather {
            cols.push("min_temp".to_string());
            cols.push("max_temp".to_string());
            if self.cfg.hourly_temps {
                cols.push("slot_temp".to_string());
            }
        }
        cols.push("is_weekend".to_string());
        cols.push("is_holiday".to_string());
        if self.cfg.hour_of_day_dummies {
            cols.extend((1..24).map(|h| format!("hour_{h:02}")));
        }
        if self.cfg.month_dummies {
            cols.extend((2..=12).map(|m| format!("month_{m:02}")));
        }
        cols
    }

    /// Build history and target regressors for `series` and `target`.
    ///
    /// Never fails: missing or malformed weather yields a partial target
    /// matrix and an [`ExogSignal::Fallback`].
    pub fn assemble(
        &self,
        series: &ClusterSeries,
        target: NaiveDate,
        weather: &WeatherTable,
        calendar: &CalendarTable,
    ) -> FeatureSet {
        let columns = self.columns();
        let mut fallback: Option<String> = None;

        let (target_rows, target_issue) =
            self.day_rows(target, weather.get(target), calendar.get_or_derive(target));
        if let Some(issue) = target_issue {
            fallback = Some(format!("forecast date {target}: {issue}"));
        }

        let mut bridge_rows = Vec::new();
        if let Some(end) = series.end_date() {
            let mut date = end + chrono::Duration::days(1);
            while date < target {
                let (rows, issue) =
                    self.day_rows(date, weather.get(date), calendar.get_or_derive(date));
                if let (Some(issue), None) = (issue, &fallback) {
                    fallback = Some(format!("gap date {date}: {issue}"));
                }
                bridge_rows.extend(rows);
                date += chrono::Duration::days(1);
            }
        }

        // history gaps are recorded per day; the fit and forecast windows
        // decide whether they matter
        let mut history_rows = Vec::with_capacity(series.slots.len());
        let mut history_gaps = Vec::new();
        for i in 0..series.num_days() {
            let date = series.start_date + chrono::Duration::days(i as i64);
            let (rows, issue) =
                self.day_rows(date, weather.get(date), calendar.get_or_derive(date));
            if let Some(issue) = issue {
                history_gaps.push((date, issue));
            }
            history_rows.extend(rows);
        }
        if !history_gaps.is_empty() {
            debug!(cluster_id = %series.cluster_id, days = history_gaps.len(), "history days without complete regressors");
        }

        let signal = match fallback {
            Some(reason) => {
                warn!(cluster_id = %series.cluster_id, %reason, "exogenous regressors unavailable");
                ExogSignal::Fallback { reason }
            }
            None => ExogSignal::Ready,
        };

        FeatureSet {
            columns: columns.clone(),
            history: ExogMatrix {
                columns: columns.clone(),
                rows: history_rows,
            },
            history_start: series.start_date,
            history_gaps,
            bridge: ExogMatrix {
                columns: columns.clone(),
                rows: bridge_rows,
            },
            target: ExogMatrix {
                columns,
                rows: target_rows,
            },
            signal,
        }
    }

    /// 48 rows for one date plus a description of what is missing, if anything.
    fn day_rows(
        &self,
        date: NaiveDate,
        weather: Option<&WeatherDay>,
        calendar: CalendarDay,
    ) -> (Vec<Vec<f64>>, Option<String>) {
        let mut issue = None;
        let weather = if self.cfg.use_weather {
            match weather {
                None => {
                    issue = Some("weather unavailable".to_string());
                    None
                }
                Some(w) if !w.is_valid() => {
                    issue = Some("weather values invalid".to_string());
                    None
                }
                Some(w) if self.cfg.hourly_temps && w.hourly().is_none() => {
                    issue = Some(format!(
                        "expected 24 hourly temperatures, got {}",
                        w.hourly_temps.as_ref().map_or(0, |h| h.len())
                    ));
                    None
                }
                Some(w) => Some(w),
            }
        } else {
            None
        };

        let rows = (0..SLOTS_PER_DAY)
            .map(|slot| {
                let mut row = Vec::with_capacity(self.columns().len());
                if self.cfg.use_weather {
                    row.push(weather.map_or(f64::NAN, |w| w.min_temp));
                    row.push(weather.map_or(f64::NAN, |w| w.max_temp));
                    if self.cfg.hourly_temps {
                        row.push(
                            weather
                                .and_then(|w| w.hourly())
                                .map_or(f64::NAN, |h| h[slot / 2]),
                        );
                    }
                }
                row.push(flag(calendar.is_weekend));
                row.push(flag(calendar.is_holiday));
                if self.cfg.hour_of_day_dummies {
                    let hour = slot / 2;
                    row.extend((1..24).map(|h| flag(hour == h)));
                }
                if self.cfg.month_dummies {
                    let month = date.month() as usize;
                    row.extend((2..=12).map(|m| flag(month == m)));
                }
                row
            })
            .collect();
        (rows, issue)
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}
