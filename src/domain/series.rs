//! Cluster-level half-hourly series.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{slot_timestamp, ClusterId, SLOTS_PER_DAY};

/// One aggregated half-hour slot of a cluster series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSlot {
    pub timestamp: NaiveDateTime,
    pub aggregate_consumption: f64,
    /// Households that reported in this slot (0 for gap-filled days)
    pub contributing_count: usize,
}

/// Contiguous run of whole days, 48 slots each, in chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSeries {
    pub cluster_id: ClusterId,
    pub start_date: NaiveDate,
    pub slots: Vec<ClusterSlot>,
}

impl ClusterSeries {
    /// Build a series from per-day slot values starting at `start_date`.
    pub fn from_days(
        cluster_id: ClusterId,
        start_date: NaiveDate,
        days: Vec<[(f64, usize); SLOTS_PER_DAY]>,
    ) -> Self {
        let mut slots = Vec::with_capacity(days.len() * SLOTS_PER_DAY);
        for (i, day) in days.iter().enumerate() {
            let date = start_date + Duration::days(i as i64);
            for (slot, (value, count)) in day.iter().enumerate() {
                slots.push(ClusterSlot {
                    timestamp: slot_timestamp(date, slot),
                    aggregate_consumption: *value,
                    contributing_count: *count,
                });
            }
        }
        Self {
            cluster_id,
            start_date,
            slots,
        }
    }

    pub fn num_days(&self) -> usize {
        self.slots.len() / SLOTS_PER_DAY
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Last day covered, if any.
    pub fn end_date(&self) -> Option<NaiveDate> {
        match self.num_days() {
            0 => None,
            n => Some(self.start_date + Duration::days(n as i64 - 1)),
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.aggregate_consumption).collect()
    }

    /// Slots of a single day.
    pub fn day(&self, date: NaiveDate) -> Option<&[ClusterSlot]> {
        let offset = (date - self.start_date).num_days();
        if offset < 0 || offset as usize >= self.num_days() {
            return None;
        }
        let start = offset as usize * SLOTS_PER_DAY;
        Some(&self.slots[start..start + SLOTS_PER_DAY])
    }

    /// Sub-series covering `[from, to]` inclusive, clipped to available days.
    pub fn window(&self, from: NaiveDate, to: NaiveDate) -> ClusterSeries {
        let Some(end) = self.end_date() else {
            return self.clone();
        };
        let from = from.max(self.start_date);
        let to = to.min(end);
        if from > to {
            return ClusterSeries {
                cluster_id: self.cluster_id.clone(),
                start_date: from,
                slots: Vec::new(),
            };
        }
        let a = (from - self.start_date).num_days() as usize * SLOTS_PER_DAY;
        let b = ((to - self.start_date).num_days() as usize + 1) * SLOTS_PER_DAY;
        ClusterSeries {
            cluster_id: self.cluster_id.clone(),
            start_date: from,
            slots: self.slots[a..b].to_vec(),
        }
    }

    /// Every day strictly before `date`.
    pub fn before(&self, date: NaiveDate) -> ClusterSeries {
        self.window(self.start_date, date - Duration::days(1))
    }
}
