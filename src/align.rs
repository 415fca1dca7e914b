//! Household reading alignment and cleaning.
//!
//! Raw readings arrive as UTC instants. They are mapped onto the canonical
//! wall clock (a configured IANA zone) as `(local date, slot)` pairs and
//! validated to exactly 48 slots per household-day.
//!
//! Daylight-saving rule:
//! - fall-back days repeat an hour; both readings of a repeated slot are
//!   averaged into the one canonical slot
//! - spring-forward days skip an hour; the slots that never exist on the
//!   clock are linearly interpolated from their neighbours and do not count
//!   as missing

use chrono::{Duration, LocalResult, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{AlignmentConfig, FillMethod, PartialDayPolicy};
use crate::domain::{slot_of, slot_timestamp, HouseholdId, HouseholdReading, SLOTS_PER_DAY};
use crate::error::{PipelineError, Result};

/// Inclusive range of local dates to align.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AlignmentWindow {
    /// `days` whole days ending the day before `target`.
    pub fn ending_before(target: NaiveDate, days: u32) -> Self {
        Self {
            start: target - Duration::days(days as i64),
            end: target - Duration::days(1),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Complete,
    /// Partial day whose gaps were filled
    Imputed,
    /// Partial day removed per policy
    Dropped,
    /// No readings at all
    Missing,
}

/// Completeness flag for one household-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayCompleteness {
    pub household_id: HouseholdId,
    pub date: NaiveDate,
    pub present_slots: usize,
    pub expected_slots: usize,
    pub status: DayStatus,
    pub dst_adjusted: bool,
}

impl DayCompleteness {
    pub fn is_partial(&self) -> bool {
        self.status != DayStatus::Complete
    }

    pub fn ratio(&self) -> f64 {
        if self.expected_slots == 0 {
            return 0.0;
        }
        self.present_slots as f64 / self.expected_slots as f64
    }
}

/// Cleaned half-hourly values of one household, keyed by local date.
#[derive(Debug, Clone, PartialEq)]
pub struct HouseholdSeries {
    pub household_id: HouseholdId,
    pub days: BTreeMap<NaiveDate, [f64; SLOTS_PER_DAY]>,
}

/// Output of a full alignment pass.
#[derive(Debug, Clone, Default)]
pub struct AlignedReadings {
    pub households: BTreeMap<HouseholdId, HouseholdSeries>,
    pub completeness: Vec<DayCompleteness>,
    /// Households with zero usable days, with the reason
    pub rejected: Vec<(HouseholdId, PipelineError)>,
    /// Readings discarded as unaligned, non-finite, negative or duplicate
    pub discarded_readings: usize,
}

#[derive(Default, Clone, Copy)]
struct SlotAccumulator {
    sum: f64,
    count: u32,
}

pub struct DataAligner {
    tz: Tz,
    cfg: AlignmentConfig,
}

impl DataAligner {
    pub fn new(tz: Tz, cfg: AlignmentConfig) -> Self {
        Self { tz, cfg }
    }

    /// Align every household present in `readings`.
    ///
    /// Households without a single usable day are reported in
    /// [`AlignedReadings::rejected`] instead of failing the whole pass.
    pub fn align(&self, readings: &[HouseholdReading], window: AlignmentWindow) -> AlignedReadings {
        let mut by_household: BTreeMap<&HouseholdId, Vec<&HouseholdReading>> = BTreeMap::new();
        for r in readings {
            by_household.entry(&r.household_id).or_default().push(r);
        }

        let mut out = AlignedReadings::default();
        for (household_id, rows) in by_household {
            let (result, flags, discarded) = self.align_rows(household_id, rows, window);
            out.discarded_readings += discarded;
            out.completeness.extend(flags);
            match result {
                Ok(series) => {
                    out.households.insert(household_id.clone(), series);
                }
                Err(e) => {
                    warn!(household_id = %household_id, error = %e, "household rejected");
                    out.rejected.push((household_id.clone(), e));
                }
            }
        }

        info!(
            households = out.households.len(),
            rejected = out.rejected.len(),
            discarded_readings = out.discarded_readings,
            partial_days = out.completeness.iter().filter(|c| c.is_partial()).count(),
            "alignment finished"
        );
        out
    }

    /// Align a single household, failing when it has no usable day.
    pub fn align_household(
        &self,
        household_id: &HouseholdId,
        readings: &[HouseholdReading],
        window: AlignmentWindow,
    ) -> Result<(HouseholdSeries, Vec<DayCompleteness>)> {
        let rows = readings
            .iter()
            .filter(|r| &r.household_id == household_id)
            .collect();
        let (result, flags, _) = self.align_rows(household_id, rows, window);
        result.map(|series| (series, flags))
    }

    fn align_rows(
        &self,
        household_id: &HouseholdId,
        mut rows: Vec<&HouseholdReading>,
        window: AlignmentWindow,
    ) -> (Result<HouseholdSeries>, Vec<DayCompleteness>, usize) {
        let mut discarded = 0usize;

        rows.sort_by_key(|r| r.timestamp);
        let before = rows.len();
        rows.dedup_by_key(|r| r.timestamp);
        discarded += before - rows.len();

        let mut buckets: BTreeMap<NaiveDate, [SlotAccumulator; SLOTS_PER_DAY]> = BTreeMap::new();
        for r in rows {
            if !r.consumption.is_finite() || r.consumption < 0.0 {
                discarded += 1;
                continue;
            }
            let local = r.timestamp.with_timezone(&self.tz).naive_local();
            let Some(slot) = slot_of(local.time()) else {
                discarded += 1;
                continue;
            };
            if !window.contains(local.date()) {
                continue;
            }
            let day = buckets
                .entry(local.date())
                .or_insert([SlotAccumulator::default(); SLOTS_PER_DAY]);
            let acc = &mut day[slot];
            acc.sum += r.consumption;
            acc.count += 1;
        }

        let mut days = BTreeMap::new();
        let mut flags = Vec::new();
        for date in window.dates() {
            let Some(acc) = buckets.get(&date) else {
                flags.push(DayCompleteness {
                    household_id: household_id.clone(),
                    date,
                    present_slots: 0,
                    expected_slots: SLOTS_PER_DAY - self.skipped_slots(date).len(),
                    status: DayStatus::Missing,
                    dst_adjusted: false,
                });
                continue;
            };
            let (values, flag) = self.clean_day(household_id, date, acc);
            if let Some(values) = values {
                days.insert(date, values);
            }
            flags.push(flag);
        }

        let result = if days.is_empty() {
            Err(PipelineError::data_quality(
                household_id.as_str(),
                format!(
                    "no usable days between {} and {}",
                    window.start, window.end
                ),
            ))
        } else {
            debug!(household_id = %household_id, days = days.len(), "household aligned");
            Ok(HouseholdSeries {
                household_id: household_id.clone(),
                days,
            })
        };
        (result, flags, discarded)
    }

    fn clean_day(
        &self,
        household_id: &HouseholdId,
        date: NaiveDate,
        acc: &[SlotAccumulator; SLOTS_PER_DAY],
    ) -> (Option<[f64; SLOTS_PER_DAY]>, DayCompleteness) {
        let skipped = self.skipped_slots(date);
        let repeated = acc.iter().any(|a| a.count > 1);

        let mut values: [Option<f64>; SLOTS_PER_DAY] = [None; SLOTS_PER_DAY];
        for (slot, a) in acc.iter().enumerate() {
            if a.count > 0 {
                values[slot] = Some(a.sum / a.count as f64);
            }
        }

        let expected = SLOTS_PER_DAY - skipped.len();
        let present = values
            .iter()
            .enumerate()
            .filter(|(slot, v)| v.is_some() && !skipped.contains(slot))
            .count();

        let mut flag = DayCompleteness {
            household_id: household_id.clone(),
            date,
            present_slots: present,
            expected_slots: expected,
            status: DayStatus::Complete,
            dst_adjusted: repeated || !skipped.is_empty(),
        };
        if flag.dst_adjusted {
            debug!(household_id = %household_id, %date, skipped = skipped.len(), repeated, "daylight-saving day normalized");
        }

        if present < expected {
            let keep = flag.ratio() >= self.cfg.completeness_threshold
                || self.cfg.partial_policy == PartialDayPolicy::Interpolate;
            if !keep {
                flag.status = DayStatus::Dropped;
                return (None, flag);
            }
            flag.status = DayStatus::Imputed;
        }

        // Slots that never existed on the clock are always interpolated.
        for &slot in &skipped {
            values[slot] = None;
        }
        let mut filled = values;
        fill_gaps(&mut filled, self.cfg.fill_method);
        if !skipped.is_empty() && self.cfg.fill_method != FillMethod::Linear {
            let mut linear = values;
            fill_gaps(&mut linear, FillMethod::Linear);
            for &slot in &skipped {
                filled[slot] = linear[slot];
            }
        }

        let mut out = [0.0; SLOTS_PER_DAY];
        for (o, v) in out.iter_mut().zip(filled.iter()) {
            *o = v.unwrap_or(0.0);
        }
        (Some(out), flag)
    }

    /// Canonical slots that do not exist on `date` (spring-forward gap).
    fn skipped_slots(&self, date: NaiveDate) -> Vec<usize> {
        (0..SLOTS_PER_DAY)
            .filter(|&slot| {
                matches!(
                    self.tz.from_local_datetime(&slot_timestamp(date, slot)),
                    LocalResult::None
                )
            })
            .collect()
    }
}

/// Fill `None` slots in place. Leading and trailing gaps take the nearest
/// known value. An all-`None` day is left untouched.
pub(crate) fn fill_gaps(values: &mut [Option<f64>], method: FillMethod) {
    let known: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|_| i))
        .collect();
    let (Some(&first), Some(&last)) = (known.first(), known.last()) else {
        return;
    };

    for i in 0..values.len() {
        if values[i].is_some() {
            continue;
        }
        let filled = if i < first {
            values[first]
        } else if i > last {
            values[last]
        } else {
            let prev = (0..i).rev().find(|&j| values[j].is_some()).unwrap_or(first);
            match method {
                FillMethod::ForwardFill => values[prev],
                FillMethod::Linear => {
                    let next = (i + 1..values.len())
                        .find(|&j| values[j].is_some())
                        .unwrap_or(last);
                    match (values[prev], values[next]) {
                        (Some(a), Some(b)) if next > prev => {
                            let t = (i - prev) as f64 / (next - prev) as f64;
                            Some(a + (b - a) * t)
                        }
                        (a, _) => a,
                    }
                }
            }
        };
        values[i] = filled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn cfg() -> AlignmentConfig {
        AlignmentConfig::default()
    }

    fn reading(h: &str, ts: DateTime<Utc>, v: f64) -> HouseholdReading {
        HouseholdReading {
            household_id: HouseholdId::from(h),
            timestamp: ts,
            consumption: v,
        }
    }

    fn utc_day(h: &str, date: NaiveDate, skip: &[usize]) -> Vec<HouseholdReading> {
        (0..SLOTS_PER_DAY)
            .filter(|s| !skip.contains(s))
            .map(|s| reading(h, slot_timestamp(date, s).and_utc(), 1.0 + s as f64))
            .collect()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_complete_day_passes_through() {
        let aligner = DataAligner::new(chrono_tz::UTC, cfg());
        let day = date(2024, 1, 10);
        let readings = utc_day("H1", day, &[]);
        let window = AlignmentWindow { start: day, end: day };

        let (series, flags) = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].status, DayStatus::Complete);
        assert!(!flags[0].is_partial());
        assert_eq!(series.days[&day][47], 48.0);
    }

    #[test]
    fn test_47_of_48_is_partial_never_complete() {
        let aligner = DataAligner::new(chrono_tz::UTC, cfg());
        let day = date(2024, 1, 10);
        let readings = utc_day("H1", day, &[20]);
        let window = AlignmentWindow { start: day, end: day };

        let (series, flags) = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap();
        assert_eq!(flags[0].present_slots, 47);
        assert_eq!(flags[0].expected_slots, 48);
        assert!(flags[0].is_partial());
        assert_eq!(flags[0].status, DayStatus::Imputed);
        // linear between slot 19 (20.0) and slot 21 (22.0)
        assert_eq!(series.days[&day][20], 21.0);
    }

    #[test]
    fn test_partial_day_dropped_by_policy() {
        let mut c = cfg();
        c.partial_policy = PartialDayPolicy::Drop;
        c.completeness_threshold = 0.9;
        let aligner = DataAligner::new(chrono_tz::UTC, c);
        let d1 = date(2024, 1, 10);
        let d2 = date(2024, 1, 11);
        let mut readings = utc_day("H1", d1, &[]);
        // 40/48 < 0.9 -> dropped
        readings.extend(utc_day("H1", d2, &(0..8).collect::<Vec<_>>()));
        let window = AlignmentWindow { start: d1, end: d2 };

        let (series, flags) = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap();
        assert_eq!(series.days.len(), 1);
        assert_eq!(flags[1].status, DayStatus::Dropped);
    }

    #[test]
    fn test_partial_day_above_threshold_is_imputed_even_under_drop_policy() {
        let mut c = cfg();
        c.partial_policy = PartialDayPolicy::Drop;
        c.completeness_threshold = 0.9;
        c.fill_method = FillMethod::ForwardFill;
        let aligner = DataAligner::new(chrono_tz::UTC, c);
        let day = date(2024, 1, 10);
        let readings = utc_day("H1", day, &[5]);
        let window = AlignmentWindow { start: day, end: day };

        let (series, flags) = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap();
        assert_eq!(flags[0].status, DayStatus::Imputed);
        assert_eq!(series.days[&day][5], series.days[&day][4]);
    }

    #[test]
    fn test_zero_usable_days_is_data_quality_error() {
        let aligner = DataAligner::new(chrono_tz::UTC, cfg());
        let day = date(2024, 1, 10);
        let readings = vec![reading("H1", slot_timestamp(day, 3).and_utc(), f64::NAN)];
        let window = AlignmentWindow { start: day, end: day };

        let err = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap_err();
        assert_eq!(err.kind(), "data_quality");
    }

    #[test]
    fn test_unaligned_and_duplicate_readings_discarded() {
        let aligner = DataAligner::new(chrono_tz::UTC, cfg());
        let day = date(2024, 1, 10);
        let mut readings = utc_day("H1", day, &[]);
        readings.push(readings[0].clone());
        readings.push(reading(
            "H1",
            slot_timestamp(day, 3).and_utc() + Duration::minutes(10),
            5.0,
        ));
        let window = AlignmentWindow { start: day, end: day };

        let aligned = aligner.align(&readings, window);
        assert_eq!(aligned.discarded_readings, 2);
        assert_eq!(aligned.households.len(), 1);
    }

    #[test]
    fn test_spring_forward_day_has_48_slots() {
        // Europe/London skips 01:00-02:00 local on 2024-03-31.
        let tz = chrono_tz::Europe::London;
        let aligner = DataAligner::new(tz, cfg());
        let day = date(2024, 3, 31);
        let start = tz.from_local_datetime(&slot_timestamp(day, 0)).unwrap().with_timezone(&Utc);
        let end = tz
            .from_local_datetime(&slot_timestamp(day + Duration::days(1), 0))
            .unwrap()
            .with_timezone(&Utc);
        let mut readings = Vec::new();
        let mut t = start;
        while t < end {
            readings.push(reading("H1", t, 2.0));
            t += Duration::minutes(30);
        }
        assert_eq!(readings.len(), 46);
        let window = AlignmentWindow { start: day, end: day };

        let (series, flags) = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap();
        assert_eq!(flags[0].expected_slots, 46);
        assert_eq!(flags[0].status, DayStatus::Complete);
        assert!(flags[0].dst_adjusted);
        assert!(series.days[&day].iter().all(|v| (*v - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_fall_back_day_averages_repeated_hour() {
        // Europe/London repeats 01:00-02:00 local on 2024-10-27.
        let tz = chrono_tz::Europe::London;
        let aligner = DataAligner::new(tz, cfg());
        let day = date(2024, 10, 27);
        let start = tz.from_local_datetime(&slot_timestamp(day, 0)).unwrap().with_timezone(&Utc);
        let mut readings = Vec::new();
        for i in 0..50 {
            let t = start + Duration::minutes(30 * i);
            // the second pass through 01:00-02:00 reads 3.0, everything else 1.0
            let v = if (4..6).contains(&i) { 3.0 } else { 1.0 };
            readings.push(reading("H1", t, v));
        }
        let window = AlignmentWindow { start: day, end: day };

        let (series, flags) = aligner
            .align_household(&HouseholdId::from("H1"), &readings, window)
            .unwrap();
        assert_eq!(flags[0].status, DayStatus::Complete);
        assert!(flags[0].dst_adjusted);
        assert_eq!(series.days[&day][2], 2.0);
        assert_eq!(series.days[&day][3], 2.0);
        assert_eq!(series.days[&day][10], 1.0);
    }

    #[test]
    fn test_fill_gaps_edges_take_nearest_value() {
        let mut v = vec![None, Some(2.0), None, Some(4.0), None];
        fill_gaps(&mut v, FillMethod::Linear);
        assert_eq!(v, vec![Some(2.0), Some(2.0), Some(3.0), Some(4.0), Some(4.0)]);

        let mut v = vec![None, Some(2.0), None, Some(4.0), None];
        fill_gaps(&mut v, FillMethod::ForwardFill);
        assert_eq!(v, vec![Some(2.0), Some(2.0), Some(2.0), Some(4.0), Some(4.0)]);
    }

    #[test]
    fn test_missing_days_flagged() {
        let aligner = DataAligner::new(chrono_tz::UTC, cfg());
        let d1 = date(2024, 1, 10);
        let readings = utc_day("H1", d1, &[]);
        let window = AlignmentWindow::ending_before(date(2024, 1, 13), 3);

        let aligned = aligner.align(&readings, window);
        let statuses: Vec<_> = aligned.completeness.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![DayStatus::Complete, DayStatus::Missing, DayStatus::Missing]
        );
    }
}
