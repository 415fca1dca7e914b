//! Synthetic inputs shared by the scenario tests.

#![allow(dead_code)]

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Europe::London;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::Path;

use cluster_forecast::config::Config;
use cluster_forecast::domain::{
    slot_timestamp, ClusterAssignment, ClusterId, HouseholdId, HouseholdReading, SLOTS_PER_DAY,
};
use cluster_forecast::forecast::{CalendarTable, WeatherDay, WeatherTable};
use cluster_forecast::pipeline::Inputs;

/// Mid-week winter target, far from any DST change.
pub fn target() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, 14).unwrap()
}

/// Evening-peaked household load with a weekend uplift.
pub fn base_load(date: NaiveDate, slot: usize) -> f64 {
    let hour = slot as f64 / 2.0;
    let evening = (-((hour - 18.5) / 2.5).powi(2)).exp();
    let morning = 0.5 * (-((hour - 7.5) / 1.5).powi(2)).exp();
    let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
    (0.15 + 0.6 * evening + morning * 0.4) * if weekend { 1.15 } else { 1.0 }
}

/// Half-hourly readings for one household, timestamps in UTC.
pub fn household_readings(
    household: &str,
    start: NaiveDate,
    days: i64,
    seed: u64,
    load: impl Fn(NaiveDate, usize) -> f64,
) -> Vec<HouseholdReading> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.02).unwrap();
    let mut out = Vec::with_capacity(days as usize * SLOTS_PER_DAY);
    for d in 0..days {
        let date = start + Duration::days(d);
        for slot in 0..SLOTS_PER_DAY {
            let local = London
                .from_local_datetime(&slot_timestamp(date, slot))
                .single()
                .unwrap();
            out.push(HouseholdReading {
                household_id: HouseholdId::from(household),
                timestamp: local.with_timezone(&Utc),
                consumption: (load(date, slot) + noise.sample(&mut rng)).max(0.0),
            });
        }
    }
    out
}

pub fn assignments(rows: &[(&str, &str)]) -> Vec<ClusterAssignment> {
    rows.iter()
        .map(|(h, c)| ClusterAssignment {
            household_id: HouseholdId::from(*h),
            cluster_id: ClusterId::from(*c),
        })
        .collect()
}

/// Daily weather around min 2 °C / max 8 °C for `[from, to]`; exactly 2/8 on the target.
pub fn weather(from: NaiveDate, to: NaiveDate, seed: u64) -> WeatherTable {
    WeatherTable::new(weather_rows(from, to, seed))
}

/// Daily temperatures from `from` through `to`, seeded.
pub fn weather_rows(from: NaiveDate, to: NaiveDate, seed: u64) -> Vec<WeatherDay> {
    let mut rng = StdRng::seed_from_u64(seed);
    let jitter = Normal::new(0.0, 1.5).unwrap();
    from.iter_days()
        .take_while(|d| *d <= to)
        .map(|date| {
            let (low, high): (f64, f64) = if date == target() {
                (2.0, 8.0)
            } else {
                (2.0 + jitter.sample(&mut rng), 8.0 + jitter.sample(&mut rng))
            };
            WeatherDay {
                date,
                min_temp: low.min(high),
                max_temp: low.max(high),
                hourly_temps: None,
            }
        })
        .collect()
}

/// Cluster "A" of five households with `days` of history before `target`.
pub fn cluster_inputs(days: i64, target: NaiveDate) -> Inputs {
    let start = target - Duration::days(days);
    let mut readings = Vec::new();
    let mut rows = Vec::new();
    let names: Vec<String> = (1..=5).map(|i| format!("MAC{i:06}")).collect();
    for (i, name) in names.iter().enumerate() {
        let scale = 0.8 + 0.1 * i as f64;
        readings.extend(household_readings(name, start, days, 7 + i as u64, |d, s| {
            scale * base_load(d, s)
        }));
        rows.push((name.as_str(), "A"));
    }
    Inputs {
        readings,
        assignments: assignments(&rows),
        weather: weather(start, target, 42),
        calendar: CalendarTable::default(),
    }
}

/// Defaults with outputs under `dir` and evaluation off.
pub fn config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.clock.timezone = "Europe/London".to_string();
    cfg.outputs.dir = dir.join("outputs");
    cfg.outputs.model_store_dir = dir.join("outputs/models");
    cfg.outputs.diagnostics_log = dir.join("outputs/diagnostics.csv");
    cfg.alignment.history_days = 90;
    cfg.model.window_days = 60;
    cfg.evaluation.enabled = false;
    cfg
}
