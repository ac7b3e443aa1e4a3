//! Incremental ranking with deduplication
//!
//! Results are kept in one ordered list:
//! - Highest score first
//! - Ties broken by earliest arrival, then by arrival sequence
//! - One entry per similarity key, the highest-scoring duplicate wins
//!
//! Each applied batch yields a `Delta` holding only what changed, which a
//! `ResultView` mirror can replay to reconstruct the same list.

use fista_common::models::BackendResult;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Separator between fragments in rendered content
pub const FRAGMENT_SEPARATOR: &str = "\n\n";

/// Content-similarity key: SHA-256 of the normalized fragment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SimilarityKey(String);

impl SimilarityKey {
    pub fn of(content: &str) -> Self {
        let normalized = content
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect::<String>();
        let canonical = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A deduplicated result in rank order
#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub key: SimilarityKey,
    pub result: BackendResult,
    /// Arrival sequence within one aggregation
    pub sequence: u64,
}

impl RankedResult {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .result
            .score
            .total_cmp(&self.result.score)
            .then_with(|| self.result.arrived_at.cmp(&other.result.arrived_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// A result inserted at its final position
#[derive(Debug, Clone, Serialize)]
pub struct DeltaInsert {
    pub index: usize,
    pub item: RankedResult,
}

/// Changes produced by one batch, emitted once
#[derive(Debug, Clone, Serialize)]
pub struct Delta {
    pub revision: u64,
    /// Keys whose previous entry is gone (dropped or superseded by a better duplicate)
    pub removed: Vec<SimilarityKey>,
    /// New entries in ascending final index
    pub inserted: Vec<DeltaInsert>,
}

/// Ordered, deduplicated result set
#[derive(Debug, Default)]
pub struct RankedSet {
    items: Vec<RankedResult>,
    scores: HashMap<SimilarityKey, f64>,
    next_sequence: u64,
    revision: u64,
}

impl RankedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn items(&self) -> &[RankedResult] {
        &self.items
    }

    pub fn into_items(self) -> Vec<RankedResult> {
        self.items
    }

    /// Merge a batch; returns `None` when nothing visible changed
    pub fn apply(&mut self, batch: Vec<BackendResult>) -> Option<Delta> {
        let mut removed = Vec::new();
        let mut inserted: HashSet<SimilarityKey> = HashSet::new();

        for result in batch {
            let sequence = self.next_sequence;
            self.next_sequence += 1;

            let key = SimilarityKey::of(&result.content);
            if let Some(&existing) = self.scores.get(&key) {
                if existing >= result.score {
                    continue;
                }
                if let Some(pos) = self.items.iter().position(|i| i.key == key) {
                    self.items.remove(pos);
                }
                // Entries inserted earlier in this batch were never emitted
                if !inserted.contains(&key) {
                    removed.push(key.clone());
                }
            }

            let item = RankedResult {
                key: key.clone(),
                result,
                sequence,
            };
            let index = self
                .items
                .partition_point(|existing| existing.rank_cmp(&item) == Ordering::Less);
            self.scores.insert(key.clone(), item.result.score);
            self.items.insert(index, item);
            inserted.insert(key);
        }

        if removed.is_empty() && inserted.is_empty() {
            return None;
        }

        self.revision += 1;
        let inserted = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| inserted.contains(&item.key))
            .map(|(index, item)| DeltaInsert {
                index,
                item: item.clone(),
            })
            .collect();

        Some(Delta {
            revision: self.revision,
            removed,
            inserted,
        })
    }

    /// Final text: fragments in rank order
    pub fn render(&self) -> String {
        render(self.items.iter().map(|i| &i.result))
    }
}

/// Join fragments in the given order
pub fn render<'a>(results: impl Iterator<Item = &'a BackendResult>) -> String {
    results
        .map(|r| r.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}

/// Consumer-side mirror of a `RankedSet`, rebuilt from deltas only
#[derive(Debug, Default)]
pub struct ResultView {
    items: Vec<RankedResult>,
    revision: u64,
}

impl ResultView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[RankedResult] {
        &self.items
    }

    pub fn apply(&mut self, delta: &Delta) {
        if !delta.removed.is_empty() {
            let removed: HashSet<&SimilarityKey> = delta.removed.iter().collect();
            self.items.retain(|i| !removed.contains(&i.key));
        }
        for insert in &delta.inserted {
            let index = insert.index.min(self.items.len());
            self.items.insert(index, insert.item.clone());
        }
        self.revision = delta.revision;
    }

    pub fn render(&self) -> String {
        render(self.items.iter().map(|i| &i.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn result(source: &str, content: &str, score: f64, arrived_ms: i64) -> BackendResult {
        BackendResult {
            source: source.to_string(),
            score,
            content: content.to_string(),
            title: None,
            url: None,
            arrived_at: at(arrived_ms),
        }
    }

    fn contents(items: &[RankedResult]) -> Vec<&str> {
        items.iter().map(|i| i.result.content.as_str()).collect()
    }

    #[test]
    fn test_similarity_key_ignores_case_and_punctuation() {
        assert_eq!(SimilarityKey::of("Trail A!"), SimilarityKey::of("  trail   a "));
        assert_ne!(SimilarityKey::of("trail A"), SimilarityKey::of("trail B"));
        assert_eq!(SimilarityKey::of("x").as_str().len(), 64);
    }

    #[test]
    fn test_orders_by_score_then_arrival() {
        let mut set = RankedSet::new();
        set.apply(vec![
            result("web", "trail B", 0.7, 0),
            result("kb", "trail A", 0.9, 5),
            result("kb", "trail C", 0.7, -5),
        ]);
        assert_eq!(contents(set.items()), vec!["trail A", "trail C", "trail B"]);
        assert_eq!(set.render(), "trail A\n\ntrail C\n\ntrail B");
    }

    #[test]
    fn test_duplicate_keeps_higher_score() {
        let mut set = RankedSet::new();
        set.apply(vec![result("web", "Trail A", 0.5, 0)]);
        let delta = set.apply(vec![result("kb", "trail a.", 0.8, 1)]).unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.items()[0].result.source, "kb");
        assert_eq!(delta.removed, vec![SimilarityKey::of("trail a")]);
        assert_eq!(delta.inserted.len(), 1);

        // A weaker duplicate changes nothing
        assert!(set.apply(vec![result("web", "TRAIL A", 0.1, 2)]).is_none());
        assert_eq!(set.items()[0].result.score, 0.8);
    }

    #[test]
    fn test_duplicate_within_one_batch_is_not_reported_removed() {
        let mut set = RankedSet::new();
        let delta = set
            .apply(vec![
                result("web", "trail A", 0.5, 0),
                result("kb", "Trail A", 0.9, 1),
            ])
            .unwrap();

        assert!(delta.removed.is_empty());
        assert_eq!(delta.inserted.len(), 1);
        assert_eq!(delta.inserted[0].item.result.score, 0.9);
    }

    #[test]
    fn test_delta_only_carries_changes() {
        let mut set = RankedSet::new();
        set.apply(vec![
            result("web", "trail A", 0.9, 0),
            result("web", "trail C", 0.5, 1),
        ]);

        let delta = set.apply(vec![result("kb", "trail B", 0.7, 2)]).unwrap();
        assert_eq!(delta.revision, 2);
        assert!(delta.removed.is_empty());
        assert_eq!(delta.inserted.len(), 1);
        assert_eq!(delta.inserted[0].index, 1);
    }

    #[test]
    fn test_view_replays_deltas() {
        let mut set = RankedSet::new();
        let mut view = ResultView::new();

        let batches = vec![
            vec![result("web", "trail C", 0.3, 0), result("web", "trail A", 0.9, 1)],
            vec![result("kb", "trail B", 0.7, 2), result("kb", "Trail C", 0.95, 3)],
            vec![result("kb", "trail D", 0.1, 4)],
        ];
        for batch in batches {
            if let Some(delta) = set.apply(batch) {
                view.apply(&delta);
            }
        }

        assert_eq!(
            contents(view.items()),
            vec!["Trail C", "trail A", "trail B", "trail D"]
        );
        assert_eq!(view.render(), set.render());
        assert_eq!(view.revision(), set.revision());
    }

    #[test]
    fn test_randomized_ordering_is_strictly_descending() {
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let n = rng.gen_range(1..40);
            let mut scores: Vec<u32> = (0..n).collect();
            scores.shuffle(&mut rng);

            let mut results: Vec<BackendResult> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    result(
                        "web",
                        &format!("fragment {}", i),
                        *s as f64 / 100.0,
                        rng.gen_range(0..1000),
                    )
                })
                .collect();
            results.shuffle(&mut rng);

            let mut set = RankedSet::new();
            let mut view = ResultView::new();
            while !results.is_empty() {
                let take = rng.gen_range(1..=results.len());
                let batch: Vec<_> = results.drain(..take).collect();
                if let Some(delta) = set.apply(batch) {
                    view.apply(&delta);
                }
            }

            let items = view.items();
            assert_eq!(items.len(), n as usize);
            for pair in items.windows(2) {
                assert!(pair[0].result.score > pair[1].result.score);
            }
            assert_eq!(view.render(), set.render());
        }
    }

    #[test]
    fn test_randomized_ties_break_by_earliest_arrival() {
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let n = rng.gen_range(2..30);
            let mut arrivals: Vec<i64> = (0..n).collect();
            arrivals.shuffle(&mut rng);

            let mut results: Vec<BackendResult> = arrivals
                .iter()
                .enumerate()
                .map(|(i, ms)| {
                    let score = if i % 2 == 0 { 0.5 } else { 0.8 };
                    result("kb", &format!("fragment {}", i), score, *ms)
                })
                .collect();
            results.shuffle(&mut rng);

            let mut set = RankedSet::new();
            for chunk in results.chunks(3) {
                set.apply(chunk.to_vec());
            }

            for pair in set.items().windows(2) {
                let (a, b) = (&pair[0].result, &pair[1].result);
                assert!(a.score >= b.score);
                if a.score == b.score {
                    assert!(a.arrived_at < b.arrived_at);
                }
            }
        }
    }

    #[test]
    fn test_same_arrival_falls_back_to_sequence() {
        let mut set = RankedSet::new();
        let now = Utc::now();
        let mut first = result("web", "first", 0.5, 0);
        let mut second = result("kb", "second", 0.5, 0);
        first.arrived_at = now;
        second.arrived_at = now;
        set.apply(vec![first, second]);
        assert_eq!(contents(set.items()), vec!["first", "second"]);

        let mut later = result("kb", "later", 0.5, 0);
        later.arrived_at = now + Duration::milliseconds(1);
        set.apply(vec![later]);
        assert_eq!(contents(set.items()), vec!["first", "second", "later"]);
    }
}
