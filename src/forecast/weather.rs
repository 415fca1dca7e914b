//! Weather and calendar inputs keyed by local date.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Daily weather forecast (or observation) for the service area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherDay {
    pub date: NaiveDate,
    pub min_temp: f64,
    pub max_temp: f64,
    /// 24 hourly temperatures, when the provider supplies them
    pub hourly_temps: Option<Vec<f64>>,
}

impl WeatherDay {
    pub fn is_valid(&self) -> bool {
        self.min_temp.is_finite() && self.max_temp.is_finite() && self.min_temp <= self.max_temp
    }

    /// Hourly temperatures when present with exactly 24 finite values.
    pub fn hourly(&self) -> Option<&[f64]> {
        self.hourly_temps
            .as_deref()
            .filter(|h| h.len() == 24 && h.iter().all(|t| t.is_finite()))
    }
}

/// Calendar flags for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub is_weekend: bool,
    pub is_holiday: bool,
}

impl CalendarDay {
    /// Flags derived from the date alone, used when the table has no row.
    pub fn derived(date: NaiveDate) -> Self {
        Self {
            date,
            is_weekend: matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
            is_holiday: is_fixed_holiday(date),
        }
    }
}

/// Fixed-date public holidays (England and Wales).
fn is_fixed_holiday(date: NaiveDate) -> bool {
    matches!(
        (date.month(), date.day()),
        (1, 1)     // New Year's Day
        | (12, 25) // Christmas Day
        | (12, 26) // Boxing Day
    )
    // Note: Easter and the bank-holiday Mondays move; supply a calendar table for those
}

#[derive(Debug, Clone, Default)]
pub struct WeatherTable {
    days: BTreeMap<NaiveDate, WeatherDay>,
}

impl WeatherTable {
    pub fn new(rows: impl IntoIterator<Item = WeatherDay>) -> Self {
        Self {
            days: rows.into_iter().map(|w| (w.date, w)).collect(),
        }
    }

    pub fn get(&self, date: NaiveDate) -> Option<&WeatherDay> {
        self.days.get(&date)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalendarTable {
    days: BTreeMap<NaiveDate, CalendarDay>,
}

impl CalendarTable {
    pub fn new(rows: impl IntoIterator<Item = CalendarDay>) -> Self {
        Self {
            days: rows.into_iter().map(|c| (c.date, c)).collect(),
        }
    }

    /// Row for `date`, or flags derived from the date itself.
    pub fn get_or_derive(&self, date: NaiveDate) -> CalendarDay {
        self.days
            .get(&date)
            .copied()
            .unwrap_or_else(|| CalendarDay::derived(date))
    }
}
