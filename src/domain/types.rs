use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Slot Helpers
// ============================================================================

/// Number of half-hour slots in a canonical day.
pub const SLOTS_PER_DAY: usize = 48;

/// Width of one slot in minutes.
pub const SLOT_MINUTES: i64 = 30;

/// Wall-clock timestamp of `slot` on `date` in the canonical clock.
pub fn slot_timestamp(date: NaiveDate, slot: usize) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + Duration::minutes(SLOT_MINUTES * slot as i64)
}

/// Slot index for a wall-clock time, or `None` when it is not half-hour aligned.
pub fn slot_of(time: NaiveTime) -> Option<usize> {
    if time.second() != 0 || time.nanosecond() != 0 || time.minute() % 30 != 0 {
        return None;
    }
    Some((time.hour() * 2 + time.minute() / 30) as usize)
}

/// All 48 slot timestamps of a day, strictly increasing.
pub fn day_slots(date: NaiveDate) -> Vec<NaiveDateTime> {
    (0..SLOTS_PER_DAY).map(|s| slot_timestamp(date, s)).collect()
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a predefined customer cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a metered household.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HouseholdId(pub String);

impl HouseholdId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HouseholdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HouseholdId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HouseholdId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Raw Inputs
// ============================================================================

/// One raw half-hourly meter reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdReading {
    pub household_id: HouseholdId,
    pub timestamp: DateTime<Utc>,
    /// Energy consumed in the half hour (kWh)
    pub consumption: f64,
}

/// Static household to cluster mapping row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub household_id: HouseholdId,
    pub cluster_id: ClusterId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_timestamps_cover_the_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let slots = day_slots(date);
        assert_eq!(slots.len(), SLOTS_PER_DAY);
        assert_eq!(slots[0].time(), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(slots[47].time(), NaiveTime::from_hms_opt(23, 30, 0).unwrap());
        assert!(slots.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_slot_of_rejects_unaligned_times() {
        assert_eq!(slot_of(NaiveTime::from_hms_opt(0, 0, 0).unwrap()), Some(0));
        assert_eq!(slot_of(NaiveTime::from_hms_opt(13, 30, 0).unwrap()), Some(27));
        assert_eq!(slot_of(NaiveTime::from_hms_opt(13, 15, 0).unwrap()), None);
        assert_eq!(slot_of(NaiveTime::from_hms_opt(13, 30, 5).unwrap()), None);
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(ClusterId::from("Affluent").to_string(), "Affluent");
        assert_eq!(HouseholdId::from("MAC000002").as_str(), "MAC000002");
    }
}
