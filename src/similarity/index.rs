//! In-memory vector index with exact k-nearest-neighbour search.
//!
//! Entries keep their first insertion position, which is what breaks
//! distance ties in query results.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Distance metric of an index. Fixed when the index is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Euclidean distance.
    L2,
    /// Cosine distance, `1 - cosine similarity`.
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cosine => "cosine",
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Metric::L2 => 1,
            Metric::Cosine => 2,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Metric::L2),
            2 => Some(Metric::Cosine),
            _ => None,
        }
    }

    /// Whether `vector` can be stored or searched under this metric.
    /// Cosine is undefined for the zero vector.
    pub fn admits(self, vector: &[f32]) -> bool {
        self != Metric::Cosine || l2_norm(vector) >= f32::EPSILON
    }

    fn distance(self, query: &[f32], query_norm: f32, target: &[f32]) -> f32 {
        match self {
            Metric::L2 => query
                .iter()
                .zip(target.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
            Metric::Cosine => {
                let target_norm = l2_norm(target);
                if target_norm < f32::EPSILON {
                    return 1.0;
                }
                let dot: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
                1.0 - dot / (query_norm * target_norm)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            other => Err(IndexError::UnknownMetric(other.to_string())),
        }
    }
}

/// Metadata recorded alongside each vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMetadata {
    pub path: String,
    pub name: String,
}

/// A stored vector and its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

/// A single query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: String,
    #[serde(flatten)]
    pub metadata: EntryMetadata,
    pub distance: f32,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub replaced: usize,
}

/// Exact nearest-neighbour index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    /// Entries in insertion order
    entries: Vec<IndexEntry>,
    /// id -> position in `entries`
    positions: HashMap<String, usize>,
    dimensions: usize,
    metric: Metric,
}

impl VectorIndex {
    pub fn new(dimensions: usize, metric: Metric) -> Self {
        Self::with_capacity(dimensions, metric, 0)
    }

    pub fn with_capacity(dimensions: usize, metric: Metric, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
            dimensions,
            metric,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.positions.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Return the subset of `ids` already present.
    pub fn exists<'a, I>(&self, ids: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter(|id| self.positions.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    /// Insert or replace a batch of entries.
    ///
    /// The whole batch is validated before anything is applied, so a
    /// rejected batch leaves the index untouched. A replaced entry keeps its
    /// original position.
    pub fn upsert(&mut self, entries: Vec<IndexEntry>) -> Result<UpsertReport, IndexError> {
        self.validate(&entries)?;

        let mut report = UpsertReport::default();
        for entry in entries {
            match self.positions.get(&entry.id) {
                Some(&pos) => {
                    let existing = &mut self.entries[pos];
                    if existing.metadata != entry.metadata {
                        log::warn!(
                            "id {} re-indexed with different metadata ({:?} -> {:?}), possible naming collision",
                            entry.id,
                            existing.metadata.name,
                            entry.metadata.name
                        );
                    }
                    *existing = entry;
                    report.replaced += 1;
                }
                None => {
                    self.positions.insert(entry.id.clone(), self.entries.len());
                    self.entries.push(entry);
                    report.inserted += 1;
                }
            }
        }

        Ok(report)
    }

    /// Check a batch would be accepted by [`VectorIndex::upsert`].
    pub fn validate(&self, entries: &[IndexEntry]) -> Result<(), IndexError> {
        entries
            .iter()
            .try_for_each(|entry| self.validate_vector(&entry.vector))
    }

    /// Remove entries by id. Returns how many were present.
    pub fn remove(&mut self, ids: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !ids.contains(&entry.id));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.positions = self
                .entries
                .iter()
                .enumerate()
                .map(|(pos, entry)| (entry.id.clone(), pos))
                .collect();
        }
        removed
    }

    /// Return up to `k` entries nearest to `query`, closest first.
    ///
    /// Equal distances keep insertion order.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.validate_vector(query)?;

        if k == 0 || self.entries.is_empty() {
            return Ok(vec![]);
        }

        let query_norm = l2_norm(query);
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (pos, self.metric.distance(query, query_norm, &entry.vector)))
            .collect();

        // sort_by is stable
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(pos, distance)| {
                let entry = &self.entries[pos];
                Neighbor {
                    id: entry.id.clone(),
                    metadata: entry.metadata.clone(),
                    distance,
                }
            })
            .collect())
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if !self.metric.admits(vector) {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector under cosine metric")]
    ZeroNormVector,

    #[error("Unknown distance metric '{0}' (expected 'l2' or 'cosine')")]
    UnknownMetric(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            vector,
            metadata: EntryMetadata {
                path: format!("corpus/{id}"),
                name: id.to_string(),
            },
        }
    }

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(2560, Metric::L2);
        assert_eq!(index.dimensions(), 2560);
        assert_eq!(index.metric(), Metric::L2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("L2".parse::<Metric>().unwrap(), Metric::L2);
        assert_eq!(" cosine ".parse::<Metric>().unwrap(), Metric::Cosine);
        assert!(matches!(
            "manhattan".parse::<Metric>(),
            Err(IndexError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_upsert_and_get() {
        let mut index = VectorIndex::new(3, Metric::L2);
        let report = index.upsert(vec![entry("a", vec![1.0, 0.0, 0.0])]).unwrap();

        assert_eq!(report, UpsertReport { inserted: 1, replaced: 0 });
        assert!(index.contains("a"));
        assert_eq!(index.get("a").unwrap().metadata.name, "a");
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        let report = index.upsert(vec![entry("a", vec![0.0, 1.0])]).unwrap();

        assert_eq!(report, UpsertReport { inserted: 0, replaced: 1 });
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a").unwrap().vector, vec![0.0, 1.0]);
    }

    #[test]
    fn test_upsert_rejects_whole_batch_on_bad_dimension() {
        let mut index = VectorIndex::new(3, Metric::L2);
        let result = index.upsert(vec![
            entry("good", vec![1.0, 0.0, 0.0]),
            entry("bad", vec![1.0, 0.0, 0.0, 0.0]),
        ]);

        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch { expected: 3, got: 4 })
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_cosine_rejects_zero_norm() {
        let mut index = VectorIndex::new(3, Metric::Cosine);
        let result = index.upsert(vec![entry("zero", vec![0.0, 0.0, 0.0])]);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_l2_accepts_zero_vector() {
        let mut index = VectorIndex::new(3, Metric::L2);
        index.upsert(vec![entry("zero", vec![0.0, 0.0, 0.0])]).unwrap();
        let hits = index.query(&[0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_exists() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index
            .upsert(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
            .unwrap();

        let asked: Vec<String> = vec!["a".into(), "c".into()];
        let present = index.exists(&asked);
        assert_eq!(present.len(), 1);
        assert!(present.contains("a"));
    }

    #[test]
    fn test_query_sorted_ascending() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index
            .upsert(vec![
                entry("far", vec![10.0, 0.0]),
                entry("near", vec![1.0, 0.0]),
                entry("mid", vec![5.0, 0.0]),
            ])
            .unwrap();

        let hits = index.query(&[0.0, 0.0], 3).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!((hits[0].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_query_ties_keep_insertion_order() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index
            .upsert(vec![
                entry("first", vec![1.0, 0.0]),
                entry("second", vec![0.0, 1.0]),
                entry("third", vec![-1.0, 0.0]),
            ])
            .unwrap();

        for _ in 0..3 {
            let hits = index.query(&[0.0, 0.0], 3).unwrap();
            let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
            assert_eq!(ids, vec!["first", "second", "third"]);
        }
    }

    #[test]
    fn test_replaced_entry_keeps_position() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index
            .upsert(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
            .unwrap();
        index.upsert(vec![entry("a", vec![-1.0, 0.0])]).unwrap();

        let hits = index.query(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[test]
    fn test_query_fewer_than_k() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index.upsert(vec![entry("only", vec![1.0, 1.0])]).unwrap();

        let hits = index.query(&[0.0, 0.0], 12).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_query_k_zero_and_empty_index() {
        let mut index = VectorIndex::new(2, Metric::L2);
        assert!(index.query(&[0.0, 0.0], 5).unwrap().is_empty());

        index.upsert(vec![entry("a", vec![1.0, 1.0])]).unwrap();
        assert!(index.query(&[0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let index = VectorIndex::new(3, Metric::L2);
        let result = index.query(&[1.0, 0.0], 1);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_cosine_distance() {
        let mut index = VectorIndex::new(2, Metric::Cosine);
        index
            .upsert(vec![
                entry("same", vec![2.0, 0.0]),
                entry("orthogonal", vec![0.0, 3.0]),
                entry("opposite", vec![-1.0, 0.0]),
            ])
            .unwrap();

        let hits = index.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].id, "same");
        assert!(hits[0].distance.abs() < 1e-6);
        assert!((hits[1].distance - 1.0).abs() < 1e-6);
        assert!((hits[2].distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_remove() {
        let mut index = VectorIndex::new(2, Metric::L2);
        index
            .upsert(vec![
                entry("a", vec![1.0, 0.0]),
                entry("b", vec![0.0, 1.0]),
                entry("c", vec![1.0, 1.0]),
            ])
            .unwrap();

        let ids: HashSet<String> = ["b".to_string(), "missing".to_string()].into();
        assert_eq!(index.remove(&ids), 1);
        assert_eq!(index.len(), 2);
        assert!(!index.contains("b"));
        assert_eq!(index.get("c").unwrap().metadata.name, "c");
    }
}
