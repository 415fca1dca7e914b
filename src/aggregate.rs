//! Cluster membership lookup and cluster-level aggregation.

use chrono::{Duration, NaiveDate};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::align::{AlignedReadings, AlignmentWindow};
use crate::config::{AggregationConfig, AggregationMethod};
use crate::domain::{ClusterAssignment, ClusterId, ClusterSeries, HouseholdId, SLOTS_PER_DAY};
use crate::error::{PipelineError, Result};

/// Narrow view of cluster membership. Clustering itself lives elsewhere.
pub trait ClusterLookup: Send + Sync {
    fn cluster_of(&self, household_id: &HouseholdId) -> Option<ClusterId>;

    /// Members of a cluster in a stable order.
    fn members(&self, cluster_id: &ClusterId) -> Vec<HouseholdId>;

    fn clusters(&self) -> Vec<ClusterId>;
}

/// Lookup backed by a static assignment table.
#[derive(Debug, Clone, Default)]
pub struct StaticAssignments {
    by_household: HashMap<HouseholdId, ClusterId>,
    by_cluster: BTreeMap<ClusterId, BTreeSet<HouseholdId>>,
}

impl StaticAssignments {
    /// Build from table rows; a household mapped to two clusters is rejected.
    pub fn from_rows(rows: &[ClusterAssignment]) -> Result<Self> {
        let mut out = Self::default();
        for row in rows {
            if let Some(existing) = out.by_household.get(&row.household_id) {
                if existing != &row.cluster_id {
                    return Err(PipelineError::Configuration(format!(
                        "household {} assigned to both {} and {}",
                        row.household_id, existing, row.cluster_id
                    )));
                }
                continue;
            }
            out.by_household
                .insert(row.household_id.clone(), row.cluster_id.clone());
            out.by_cluster
                .entry(row.cluster_id.clone())
                .or_default()
                .insert(row.household_id.clone());
        }
        Ok(out)
    }
}

impl ClusterLookup for StaticAssignments {
    fn cluster_of(&self, household_id: &HouseholdId) -> Option<ClusterId> {
        self.by_household.get(household_id).cloned()
    }

    fn members(&self, cluster_id: &ClusterId) -> Vec<HouseholdId> {
        self.by_cluster
            .get(cluster_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn clusters(&self) -> Vec<ClusterId> {
        self.by_cluster.keys().cloned().collect()
    }
}

/// Stable hash of a member list, used to detect membership changes.
pub fn member_fingerprint(members: &[HouseholdId]) -> String {
    let mut sorted: Vec<&str> = members.iter().map(|m| m.as_str()).collect();
    sorted.sort_unstable();
    let mut hasher = blake3::Hasher::new();
    for m in sorted {
        hasher.update(m.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

pub struct ClusterAggregator {
    cfg: AggregationConfig,
}

impl ClusterAggregator {
    pub fn new(cfg: AggregationConfig) -> Self {
        Self { cfg }
    }

    /// Aggregate the members of `cluster_id` into one contiguous series.
    ///
    /// Interior days with no contributing member repeat the previous day with
    /// `contributing_count = 0`; leading and trailing empty days are trimmed.
    pub fn aggregate(
        &self,
        cluster_id: &ClusterId,
        lookup: &dyn ClusterLookup,
        aligned: &AlignedReadings,
        window: AlignmentWindow,
    ) -> Result<ClusterSeries> {
        let members = lookup.members(cluster_id);
        if members.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "cluster {cluster_id} resolves to zero households"
            )));
        }
        let target_count = members.len();

        let mut days: Vec<(NaiveDate, Option<[(f64, usize); SLOTS_PER_DAY]>)> = Vec::new();
        for date in window.dates() {
            let mut sums = [0.0; SLOTS_PER_DAY];
            let mut counts = [0usize; SLOTS_PER_DAY];
            for member in &members {
                let Some(values) = aligned.households.get(member).and_then(|h| h.days.get(&date))
                else {
                    continue;
                };
                for slot in 0..SLOTS_PER_DAY {
                    sums[slot] += values[slot];
                    counts[slot] += 1;
                }
            }
            if counts.iter().all(|c| *c == 0) {
                days.push((date, None));
                continue;
            }
            let mut day = [(0.0, 0usize); SLOTS_PER_DAY];
            for slot in 0..SLOTS_PER_DAY {
                day[slot] = (self.combine(sums[slot], counts[slot], target_count), counts[slot]);
            }
            days.push((date, Some(day)));
        }

        let first = days.iter().position(|(_, d)| d.is_some());
        let last = days.iter().rposition(|(_, d)| d.is_some());
        let (Some(first), Some(last)) = (first, last) else {
            return Err(PipelineError::data_quality(
                format!("cluster {cluster_id}"),
                "no member household has usable data in the window",
            ));
        };

        let start_date = days[first].0;
        let mut filled: Vec<[(f64, usize); SLOTS_PER_DAY]> = Vec::with_capacity(last - first + 1);
        for (date, day) in &days[first..=last] {
            match day {
                Some(day) => filled.push(*day),
                None => {
                    warn!(cluster_id = %cluster_id, %date, "no contributing households, repeating previous day");
                    let mut prev = *filled.last().unwrap_or(&[(0.0, 0); SLOTS_PER_DAY]);
                    for slot in prev.iter_mut() {
                        slot.1 = 0;
                    }
                    filled.push(prev);
                }
            }
        }

        debug!(
            cluster_id = %cluster_id,
            members = target_count,
            days = filled.len(),
            start = %start_date,
            end = %(start_date + Duration::days(filled.len() as i64 - 1)),
            "cluster series built"
        );
        Ok(ClusterSeries::from_days(cluster_id.clone(), start_date, filled))
    }

    fn combine(&self, sum: f64, contributing: usize, target: usize) -> f64 {
        if contributing == 0 {
            return 0.0;
        }
        match self.cfg.method {
            AggregationMethod::Mean => sum / contributing as f64,
            AggregationMethod::Sum if self.cfg.rescale_to_members => {
                sum * target as f64 / contributing as f64
            }
            AggregationMethod::Sum => sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::HouseholdSeries;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn assignments(rows: &[(&str, &str)]) -> Vec<ClusterAssignment> {
        rows.iter()
            .map(|(h, c)| ClusterAssignment {
                household_id: HouseholdId::from(*h),
                cluster_id: ClusterId::from(*c),
            })
            .collect()
    }

    fn aligned(rows: &[(&str, u32, f64)]) -> AlignedReadings {
        let mut out = AlignedReadings::default();
        for (h, d, v) in rows {
            out.households
                .entry(HouseholdId::from(*h))
                .or_insert_with(|| HouseholdSeries {
                    household_id: HouseholdId::from(*h),
                    days: BTreeMap::new(),
                })
                .days
                .insert(date(*d), [*v; SLOTS_PER_DAY]);
        }
        out
    }

    fn window(a: u32, b: u32) -> AlignmentWindow {
        AlignmentWindow {
            start: date(a),
            end: date(b),
        }
    }

    #[test]
    fn test_conflicting_assignment_rejected() {
        let rows = assignments(&[("H1", "A"), ("H1", "B")]);
        assert!(matches!(
            StaticAssignments::from_rows(&rows),
            Err(PipelineError::Configuration(_))
        ));
        // repeating the same mapping is fine
        let rows = assignments(&[("H1", "A"), ("H1", "A")]);
        let lookup = StaticAssignments::from_rows(&rows).unwrap();
        assert_eq!(lookup.cluster_of(&HouseholdId::from("H1")), Some(ClusterId::from("A")));
    }

    #[test]
    fn test_empty_cluster_is_configuration_error() {
        let lookup = StaticAssignments::from_rows(&assignments(&[("H1", "A")])).unwrap();
        let agg = ClusterAggregator::new(AggregationConfig::default());
        let err = agg
            .aggregate(&ClusterId::from("Z"), &lookup, &aligned(&[]), window(1, 2))
            .unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_sum_rescaled_by_participation() {
        let lookup =
            StaticAssignments::from_rows(&assignments(&[("H1", "A"), ("H2", "A")])).unwrap();
        let data = aligned(&[("H1", 1, 1.0), ("H2", 1, 3.0), ("H1", 2, 2.0)]);
        let agg = ClusterAggregator::new(AggregationConfig::default());

        let series = agg
            .aggregate(&ClusterId::from("A"), &lookup, &data, window(1, 2))
            .unwrap();
        assert_eq!(series.num_days(), 2);
        let d1 = series.day(date(1)).unwrap();
        assert_eq!(d1[0].aggregate_consumption, 4.0);
        assert_eq!(d1[0].contributing_count, 2);
        // only H1 on day 2: 2.0 * 2 / 1
        let d2 = series.day(date(2)).unwrap();
        assert_eq!(d2[0].aggregate_consumption, 4.0);
        assert_eq!(d2[0].contributing_count, 1);
    }

    #[test]
    fn test_mean_and_plain_sum() {
        let lookup =
            StaticAssignments::from_rows(&assignments(&[("H1", "A"), ("H2", "A")])).unwrap();
        let data = aligned(&[("H1", 1, 1.0), ("H2", 1, 3.0), ("H1", 2, 2.0)]);

        let mean = ClusterAggregator::new(AggregationConfig {
            method: AggregationMethod::Mean,
            ..Default::default()
        });
        let s = mean
            .aggregate(&ClusterId::from("A"), &lookup, &data, window(1, 2))
            .unwrap();
        assert_eq!(s.day(date(1)).unwrap()[5].aggregate_consumption, 2.0);

        let plain = ClusterAggregator::new(AggregationConfig {
            rescale_to_members: false,
            ..Default::default()
        });
        let s = plain
            .aggregate(&ClusterId::from("A"), &lookup, &data, window(1, 2))
            .unwrap();
        assert_eq!(s.day(date(2)).unwrap()[5].aggregate_consumption, 2.0);
    }

    #[test]
    fn test_interior_gap_repeats_previous_day_and_edges_trimmed() {
        let lookup = StaticAssignments::from_rows(&assignments(&[("H1", "A")])).unwrap();
        let data = aligned(&[("H1", 2, 1.0), ("H1", 4, 5.0)]);
        let agg = ClusterAggregator::new(AggregationConfig::default());

        let series = agg
            .aggregate(&ClusterId::from("A"), &lookup, &data, window(1, 5))
            .unwrap();
        assert_eq!(series.start_date, date(2));
        assert_eq!(series.num_days(), 3);
        let gap = series.day(date(3)).unwrap();
        assert_eq!(gap[0].aggregate_consumption, 1.0);
        assert_eq!(gap[0].contributing_count, 0);
    }

    #[test]
    fn test_cluster_without_data_is_data_quality_error() {
        let lookup = StaticAssignments::from_rows(&assignments(&[("H1", "A")])).unwrap();
        let agg = ClusterAggregator::new(AggregationConfig::default());
        let err = agg
            .aggregate(&ClusterId::from("A"), &lookup, &aligned(&[]), window(1, 3))
            .unwrap_err();
        assert_eq!(err.kind(), "data_quality");
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let a = member_fingerprint(&[HouseholdId::from("H1"), HouseholdId::from("H2")]);
        let b = member_fingerprint(&[HouseholdId::from("H2"), HouseholdId::from("H1")]);
        let c = member_fingerprint(&[HouseholdId::from("H1")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn aggregation_is_idempotent(values in proptest::collection::vec(0.0f64..10.0, 1..12)) {
                let rows: Vec<(String, u32, f64)> = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (format!("H{}", i % 3), (i % 4) as u32 + 1, *v))
                    .collect();
                let refs: Vec<(&str, u32, f64)> =
                    rows.iter().map(|(h, d, v)| (h.as_str(), *d, *v)).collect();
                let data = aligned(&refs);
                let lookup = StaticAssignments::from_rows(&assignments(&[
                    ("H0", "A"), ("H1", "A"), ("H2", "A"),
                ])).unwrap();
                let agg = ClusterAggregator::new(AggregationConfig::default());

                let first = agg.aggregate(&ClusterId::from("A"), &lookup, &data, window(1, 4)).unwrap();
                let second = agg.aggregate(&ClusterId::from("A"), &lookup, &data, window(1, 4)).unwrap();
                prop_assert_eq!(first, second);
            }
        }
    }
}
