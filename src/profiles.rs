//! Average weekday and weekend load shape per cluster.

use chrono::{Datelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::aggregate::ClusterLookup;
use crate::align::AlignedReadings;
use crate::domain::{ClusterId, SLOTS_PER_DAY};

/// Mean household consumption in one slot, split by day type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub cluster_id: ClusterId,
    pub slot: usize,
    pub weekday_avg: Option<f64>,
    pub weekend_avg: Option<f64>,
}

#[derive(Default, Clone, Copy)]
struct Acc {
    sum: f64,
    n: usize,
}

impl Acc {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.n += 1;
    }

    fn mean(self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

/// 48 rows per cluster, averaged over every member household-day in `aligned`.
pub fn cluster_profiles(
    clusters: &[ClusterId],
    lookup: &dyn ClusterLookup,
    aligned: &AlignedReadings,
) -> Vec<ProfileRow> {
    let mut rows = Vec::with_capacity(clusters.len() * SLOTS_PER_DAY);
    for cluster_id in clusters {
        let mut weekday = [Acc::default(); SLOTS_PER_DAY];
        let mut weekend = [Acc::default(); SLOTS_PER_DAY];
        for member in lookup.members(cluster_id) {
            let Some(series) = aligned.households.get(&member) else {
                continue;
            };
            for (date, values) in &series.days {
                let acc = match date.weekday() {
                    Weekday::Sat | Weekday::Sun => &mut weekend,
                    _ => &mut weekday,
                };
                for (slot, v) in values.iter().enumerate() {
                    acc[slot].push(*v);
                }
            }
        }
        rows.extend((0..SLOTS_PER_DAY).map(|slot| ProfileRow {
            cluster_id: cluster_id.clone(),
            slot,
            weekday_avg: weekday[slot].mean(),
            weekend_avg: weekend[slot].mean(),
        }));
    }
    rows
}
