//! CSV and JSON input tables and output artifacts.
//!
//! Input tables are located by header name. Rows that cannot be parsed are
//! skipped and counted; a missing file or missing required column is an error.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use csv::StringRecord;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing::{info, warn};

use crate::domain::{
    ClusterAssignment, ClusterId, EvaluationMetric, ForecastResult, HouseholdId, HouseholdReading,
};
use crate::forecast::weather::{CalendarDay, CalendarTable, WeatherDay, WeatherTable};
use crate::profiles::ProfileRow;

/// Rows read from a table plus how many were unparseable.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub rows: Vec<T>,
    pub skipped: usize,
}

struct Columns {
    headers: StringRecord,
}

impl Columns {
    fn new(headers: StringRecord, required: &[&str], path: &Path) -> Result<Self> {
        for name in required {
            if !headers.iter().any(|h| h.trim() == *name) {
                return Err(anyhow!("{}: missing required column '{name}'", path.display()));
            }
        }
        Ok(Self { headers })
    }

    fn get<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        self.headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
    }
}

fn read_table<T>(
    path: &Path,
    required: &[&str],
    parse: impl Fn(&Columns, &StringRecord) -> Option<T>,
) -> Result<Loaded<T>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr
        .headers()
        .with_context(|| format!("failed to read headers of {}", path.display()))?
        .clone();
    let cols = Columns::new(headers, required, path)?;

    let mut rows = Vec::new();
    let mut skipped = 0;
    for result in rdr.records() {
        let record = result.with_context(|| format!("failed to read record in {}", path.display()))?;
        match parse(&cols, &record) {
            Some(row) => rows.push(row),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "unparseable rows skipped");
    }
    info!(path = %path.display(), rows = rows.len(), "table loaded");
    Ok(Loaded { rows, skipped })
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// `household_id, timestamp, consumption` with RFC 3339 timestamps.
pub fn read_readings(path: &Path) -> Result<Loaded<HouseholdReading>> {
    read_table(path, &["household_id", "timestamp", "consumption"], |cols, rec| {
        let household_id = cols.get(rec, "household_id").filter(|s| !s.is_empty())?;
        let timestamp = DateTime::parse_from_rfc3339(cols.get(rec, "timestamp")?).ok()?;
        // NaN/negative values are kept here and discarded (and counted) by the aligner
        let consumption = cols.get(rec, "consumption")?.parse::<f64>().ok()?;
        Some(HouseholdReading {
            household_id: HouseholdId::from(household_id),
            timestamp: timestamp.with_timezone(&Utc),
            consumption,
        })
    })
}

/// `household_id, cluster_id`
pub fn read_assignments(path: &Path) -> Result<Loaded<ClusterAssignment>> {
    read_table(path, &["household_id", "cluster_id"], |cols, rec| {
        let household_id = cols.get(rec, "household_id").filter(|s| !s.is_empty())?;
        let cluster_id = cols.get(rec, "cluster_id").filter(|s| !s.is_empty())?;
        Some(ClusterAssignment {
            household_id: HouseholdId::from(household_id),
            cluster_id: ClusterId::from(cluster_id),
        })
    })
}

/// `date, min_temp, max_temp[, hourly_temps]`; hourly values are `;`-separated.
///
/// Unparseable hourly entries become NaN so the shape check downstream rejects them.
pub fn read_weather(path: &Path) -> Result<WeatherTable> {
    let loaded = read_table(path, &["date", "min_temp", "max_temp"], |cols, rec| {
        let hourly_temps = cols
            .get(rec, "hourly_temps")
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(';')
                    .map(|v| v.trim().parse::<f64>().unwrap_or(f64::NAN))
                    .collect::<Vec<_>>()
            });
        Some(WeatherDay {
            date: parse_date(cols.get(rec, "date")?)?,
            min_temp: cols.get(rec, "min_temp")?.parse().ok()?,
            max_temp: cols.get(rec, "max_temp")?.parse().ok()?,
            hourly_temps,
        })
    })?;
    Ok(WeatherTable::new(loaded.rows))
}

/// `date, is_weekend, is_holiday`
pub fn read_calendar(path: &Path) -> Result<CalendarTable> {
    let loaded = read_table(path, &["date", "is_weekend", "is_holiday"], |cols, rec| {
        Some(CalendarDay {
            date: parse_date(cols.get(rec, "date")?)?,
            is_weekend: parse_bool(cols.get(rec, "is_weekend")?)?,
            is_holiday: parse_bool(cols.get(rec, "is_holiday")?)?,
        })
    })?;
    Ok(CalendarTable::new(loaded.rows))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Flat forecast table row.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastRow<'a> {
    pub cluster_id: &'a str,
    pub timestamp: String,
    pub forecast: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

pub fn forecast_rows(results: &[ForecastResult]) -> Vec<ForecastRow<'_>> {
    results
        .iter()
        .flat_map(|r| {
            r.points.iter().map(move |p| ForecastRow {
                cluster_id: r.cluster_id.as_str(),
                timestamp: p.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
                forecast: p.forecast,
                lower: p.lower,
                upper: p.upper,
            })
        })
        .collect()
}

/// `cluster_id, timestamp, forecast, lower, upper`; bounds are empty when intervals are off.
pub fn write_forecast_csv(path: &Path, results: &[ForecastResult]) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in forecast_rows(results) {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_forecast_json(path: &Path, results: &[ForecastResult]) -> Result<()> {
    write_json(path, &forecast_rows(results))
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct DiagnosticRow<'a> {
    cluster_id: &'a str,
    date: NaiveDate,
    mape: Option<f64>,
    rmse: f64,
    fallback_flag: bool,
    degenerate_flag: bool,
}

/// Append evaluation rows; the header is written only when the file is new or empty.
pub fn append_diagnostics(path: &Path, metrics: &[EvaluationMetric]) -> Result<()> {
    ensure_parent(path)?;
    let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut wtr = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
    for m in metrics {
        wtr.serialize(DiagnosticRow {
            cluster_id: m.cluster_id.as_str(),
            date: m.date,
            mape: m.mape,
            rmse: m.rmse,
            fallback_flag: m.fallback_flag,
            degenerate_flag: m.degenerate_flag,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// `cluster_id, slot, weekday_avg, weekend_avg`
pub fn write_profiles_csv(path: &Path, rows: &[ProfileRow]) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{slot_timestamp, ForecastPoint};
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_read_readings_skips_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "readings.csv",
            "household_id,timestamp,consumption\n\
             h1,2024-01-01T00:00:00Z,0.5\n\
             h1,not-a-time,0.5\n\
             h2,2024-01-01T00:30:00+00:00,abc\n\
             h2,2024-01-01T01:00:00+01:00,0.25\n",
        );
        let loaded = read_readings(&path).unwrap();
        assert_eq!(loaded.rows.len(), 2);
        assert_eq!(loaded.skipped, 2);
        assert_eq!(loaded.rows[1].timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_missing_column_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.csv", "household_id\nh1\n");
        let err = read_assignments(&path).unwrap_err();
        assert!(err.to_string().contains("cluster_id"));
        assert!(read_assignments(&dir.path().join("missing.csv")).is_err());
    }

    #[test]
    fn test_read_weather_with_hourly() {
        let dir = tempfile::tempdir().unwrap();
        let hourly = (0..24).map(|h| h.to_string()).collect::<Vec<_>>().join(";");
        let path = write_file(
            dir.path(),
            "weather.csv",
            &format!("date,min_temp,max_temp,hourly_temps\n2024-01-01,2,8,{hourly}\n2024-01-02,1,5,\n"),
        );
        let table = read_weather(&path).unwrap();
        let d1 = table.get(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).unwrap();
        assert_eq!(d1.hourly().map(|h| h[23]), Some(23.0));
        let d2 = table.get(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()).unwrap();
        assert!(d2.hourly_temps.is_none());
    }

    #[test]
    fn test_read_calendar() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "calendar.csv",
            "date,is_weekend,is_holiday\n2024-05-06,false,true\n2024-05-07,0,0\n",
        );
        let table = read_calendar(&path).unwrap();
        assert!(table.get_or_derive(NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()).is_holiday);
    }

    #[test]
    fn test_forecast_csv_and_diagnostics_append() {
        let dir = tempfile::tempdir().unwrap();
        let target = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let result = ForecastResult {
            cluster_id: ClusterId::from("A"),
            target_date: target,
            points: (0..48)
                .map(|s| ForecastPoint {
                    timestamp: slot_timestamp(target, s),
                    forecast: 1.0,
                    lower: None,
                    upper: None,
                })
                .collect(),
            fallback_flag: false,
            degenerate: false,
            clamp_events: vec![],
        };
        let csv_path = dir.path().join("out/forecast.csv");
        write_forecast_csv(&csv_path, &[result]).unwrap();
        let content = fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 49);
        assert_eq!(lines[0], "cluster_id,timestamp,forecast,lower,upper");
        assert_eq!(lines[1], "A,2024-01-02T00:00:00,1.0,,");

        let diag = dir.path().join("diagnostics.csv");
        let metric = EvaluationMetric {
            cluster_id: ClusterId::from("A"),
            date: target,
            mape: Some(5.0),
            rmse: 0.5,
            mae: 0.4,
            excluded_slots: 0,
            fallback_flag: false,
            degenerate_flag: false,
        };
        append_diagnostics(&diag, &[metric.clone()]).unwrap();
        append_diagnostics(&diag, &[metric]).unwrap();
        let content = fs::read_to_string(&diag).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "cluster_id,date,mape,rmse,fallback_flag,degenerate_flag");
    }
}
