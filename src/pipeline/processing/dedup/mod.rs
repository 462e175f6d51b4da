use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::DedupConfig;
use crate::domain::{CanonicalRecord, IdentityKey, Provenance};
use crate::error::Result;
use crate::observability::metrics;

/// One step of the winner selection inside an identity group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakCriterion {
    /// Latest `ingested_at` across the record's lineage wins
    LatestIngestedAt,
    /// Earliest `ingested_at` wins
    EarliestIngestedAt,
    /// Fewest empty fields wins
    MostComplete,
    /// Lexicographically smallest canonical field serialization wins
    CanonicalSerialization,
}

/// Ordered tie-break criteria. Canonical serialization always closes the list so a
/// group has exactly one winner regardless of input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieBreakPolicy {
    criteria: Vec<TieBreakCriterion>,
}

impl TieBreakPolicy {
    pub fn new(criteria: &[TieBreakCriterion]) -> Self {
        let mut ordered: Vec<TieBreakCriterion> = Vec::with_capacity(criteria.len() + 1);
        for c in criteria {
            if !ordered.contains(c) {
                ordered.push(*c);
            }
        }
        ordered.retain(|c| *c != TieBreakCriterion::CanonicalSerialization);
        ordered.push(TieBreakCriterion::CanonicalSerialization);
        Self { criteria: ordered }
    }

    pub fn criteria(&self) -> &[TieBreakCriterion] {
        &self.criteria
    }

    /// `Ordering::Less` means `a` is preferred over `b`
    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        for criterion in &self.criteria {
            let ord = match criterion {
                TieBreakCriterion::LatestIngestedAt => b
                    .record
                    .latest_ingested_at()
                    .cmp(&a.record.latest_ingested_at()),
                TieBreakCriterion::EarliestIngestedAt => a
                    .record
                    .earliest_ingested_at()
                    .cmp(&b.record.earliest_ingested_at()),
                TieBreakCriterion::MostComplete => a
                    .record
                    .empty_field_count()
                    .cmp(&b.record.empty_field_count()),
                TieBreakCriterion::CanonicalSerialization => a.serialized.cmp(&b.serialized),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl Default for TieBreakPolicy {
    fn default() -> Self {
        Self::new(&[
            TieBreakCriterion::LatestIngestedAt,
            TieBreakCriterion::MostComplete,
        ])
    }
}

struct Candidate<'a> {
    record: &'a CanonicalRecord,
    serialized: String,
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// One record per identity key, sorted by key
    pub records: Vec<CanonicalRecord>,
    pub groups: usize,
    pub duplicates_collapsed: usize,
}

/// Collapses canonical records sharing an identity key into one record.
///
/// Must see the complete normalized record set of a run: grouping is only correct once
/// every record for a key is present.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    policy: TieBreakPolicy,
}

impl Deduplicator {
    pub fn new(policy: TieBreakPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(TieBreakPolicy::new(&config.tie_break))
    }

    pub fn policy(&self) -> &TieBreakPolicy {
        &self.policy
    }

    pub fn deduplicate(&self, records: Vec<CanonicalRecord>) -> Result<DedupOutcome> {
        let mut groups: BTreeMap<IdentityKey, Vec<CanonicalRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry(record.identity_key.clone())
                .or_default()
                .push(record);
        }

        let mut outcome = DedupOutcome {
            records: Vec::with_capacity(groups.len()),
            groups: groups.len(),
            duplicates_collapsed: 0,
        };
        for (_, group) in groups {
            metrics::dedup::group_resolved(group.len());
            outcome.duplicates_collapsed += group.len() - 1;
            outcome.records.push(self.resolve_group(group)?);
        }
        Ok(outcome)
    }

    /// Pick the group winner and give it the union of every member's lineage
    fn resolve_group(&self, mut group: Vec<CanonicalRecord>) -> Result<CanonicalRecord> {
        let mut candidates = Vec::with_capacity(group.len());
        for record in &group {
            candidates.push(Candidate {
                record,
                serialized: record.canonical_fields_json()?,
            });
        }

        let mut winner_idx = 0;
        for idx in 1..candidates.len() {
            if self.policy.compare(&candidates[idx], &candidates[winner_idx]) == Ordering::Less {
                winner_idx = idx;
            }
        }
        drop(candidates);

        let lineage: BTreeSet<Provenance> = group
            .iter()
            .flat_map(|r| r.lineage.iter().cloned())
            .collect();
        let mut winner = group.swap_remove(winner_idx);
        winner.lineage = lineage;
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CanonicalValue;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(station: &str, bikes: Option<i64>, ingested_hour: u32, locator: &str) -> CanonicalRecord {
        let mut fields = BTreeMap::new();
        fields.insert("station_id".to_string(), CanonicalValue::String(station.to_string()));
        fields.insert(
            "bikes".to_string(),
            bikes.map(CanonicalValue::Integer).unwrap_or(CanonicalValue::Null),
        );
        CanonicalRecord::new(
            IdentityKey::from_components(vec![json!(station)]),
            fields,
            Provenance {
                source_id: "paris_bike_counts".to_string(),
                ingested_at: Utc.with_ymd_and_hms(2024, 1, 2, ingested_hour, 0, 0).unwrap(),
                origin_locator: locator.to_string(),
                record_path: "$[0]".to_string(),
            },
        )
    }

    fn bikes(record: &CanonicalRecord) -> &CanonicalValue {
        record.get("bikes").unwrap()
    }

    #[test]
    fn test_latest_ingestion_wins_regardless_of_order() {
        let dedup = Deduplicator::default();
        let older = record("S1", Some(5), 1, "a.json");
        let newer = record("S1", Some(7), 2, "b.json");

        let forward = dedup.deduplicate(vec![older.clone(), newer.clone()]).unwrap();
        let backward = dedup.deduplicate(vec![newer, older]).unwrap();

        assert_eq!(forward.records.len(), 1);
        assert_eq!(bikes(&forward.records[0]), &CanonicalValue::Integer(7));
        assert_eq!(forward.records, backward.records);
        assert_eq!(forward.records[0].lineage.len(), 2);
        assert_eq!(forward.duplicates_collapsed, 1);
    }

    #[test]
    fn test_completeness_breaks_timestamp_tie() {
        let dedup = Deduplicator::default();
        let sparse = record("S1", None, 3, "a.json");
        let full = record("S1", Some(4), 3, "b.json");

        let outcome = dedup.deduplicate(vec![sparse, full]).unwrap();
        assert_eq!(bikes(&outcome.records[0]), &CanonicalValue::Integer(4));
    }

    #[test]
    fn test_canonical_serialization_is_final_tie_break() {
        let dedup = Deduplicator::default();
        let a = record("S1", Some(9), 3, "a.json");
        let b = record("S1", Some(10), 3, "b.json");

        let one = dedup.deduplicate(vec![a.clone(), b.clone()]).unwrap();
        let two = dedup.deduplicate(vec![b, a]).unwrap();
        assert_eq!(one.records, two.records);
        // {"bikes":{"integer":10},...} sorts before {"bikes":{"integer":9},...}
        assert_eq!(bikes(&one.records[0]), &CanonicalValue::Integer(10));
    }

    #[test]
    fn test_earliest_policy() {
        let dedup = Deduplicator::new(TieBreakPolicy::new(&[TieBreakCriterion::EarliestIngestedAt]));
        let outcome = dedup
            .deduplicate(vec![record("S1", Some(5), 1, "a.json"), record("S1", Some(7), 2, "b.json")])
            .unwrap();
        assert_eq!(bikes(&outcome.records[0]), &CanonicalValue::Integer(5));
    }

    #[test]
    fn test_singletons_pass_through_sorted() {
        let dedup = Deduplicator::default();
        let outcome = dedup
            .deduplicate(vec![record("S2", Some(1), 1, "a.json"), record("S1", Some(2), 1, "a.json")])
            .unwrap();
        assert_eq!(outcome.groups, 2);
        assert_eq!(outcome.duplicates_collapsed, 0);
        assert!(outcome.records[0].identity_key < outcome.records[1].identity_key);
        assert!(outcome.records.iter().all(|r| r.lineage.len() == 1));
    }

    #[test]
    fn test_policy_always_ends_with_canonical_serialization() {
        let policy = TieBreakPolicy::new(&[
            TieBreakCriterion::CanonicalSerialization,
            TieBreakCriterion::MostComplete,
            TieBreakCriterion::MostComplete,
        ]);
        assert_eq!(
            policy.criteria(),
            &[TieBreakCriterion::MostComplete, TieBreakCriterion::CanonicalSerialization]
        );
    }
}
