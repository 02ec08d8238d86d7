//! Vector clock implementation for per-replica causality tracking.
//!
//! A vector clock maps each replica identifier to a counter that only that
//! replica advances. Comparing two clocks yields the causal relationship
//! between the events they summarize:
//! - one clock component-wise ≤ the other, with at least one strict `<`,
//!   means the first happened before the second
//! - otherwise the events are concurrent (equal clocks included)
//!
//! # References
//!
//! Mattern, "Virtual Time and Global States of Distributed Systems" (1989)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockOrdering {
    /// The left clock happened strictly before the right one
    Before,
    /// The left clock happened strictly after the right one
    After,
    /// Neither dominates the other, or both are equal
    Concurrent,
}

/// A logical clock mapping replica IDs to monotonically increasing counters.
///
/// Absent replicas read as zero. Keys are kept sorted so the JSON form of a
/// clock is stable, which operation IDs rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// Create an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter of `replica_id` by one.
    pub fn increment(&mut self, replica_id: &str) {
        let counter = self.0.entry(replica_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// Absorb another clock by taking the component-wise maximum.
    pub fn merge(&mut self, other: &Self) {
        for (replica_id, &counter) in &other.0 {
            let entry = self.0.entry(replica_id.clone()).or_insert(0);
            if *entry < counter {
                *entry = counter;
            }
        }
    }

    /// Get the counter for a replica (zero when absent).
    #[must_use]
    pub fn get(&self, replica_id: &str) -> u64 {
        self.0.get(replica_id).copied().unwrap_or(0)
    }

    /// Compare against another clock over the union of both key sets.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut has_less = false;
        let mut has_greater = false;

        for replica_id in self.0.keys().chain(other.0.keys()) {
            match self.get(replica_id).cmp(&other.get(replica_id)) {
                std::cmp::Ordering::Less => has_less = true,
                std::cmp::Ordering::Greater => has_greater = true,
                std::cmp::Ordering::Equal => {}
            }
            if has_less && has_greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (has_less, has_greater) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            // Equal clocks are treated as concurrent
            _ => ClockOrdering::Concurrent,
        }
    }

    /// Check whether this clock happened strictly before `other`.
    #[must_use]
    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Check whether this clock is concurrent with (or equal to) `other`.
    #[must_use]
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Check whether every component is ≤ the matching component of `other`.
    ///
    /// This is "happened before or equal", unlike [`compare`](Self::compare)
    /// which folds equality into concurrency.
    #[must_use]
    pub fn dominated_by(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(replica_id, &counter)| counter <= other.get(replica_id))
    }

    /// Iterate over `(replica_id, counter)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of replicas with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no replica has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a clock from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns error if the input is not a JSON object of counters.
    pub fn parse(s: &str) -> Result<Self, ClockError> {
        serde_json::from_str(s).map_err(|e| ClockError::Parse(e.to_string()))
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (replica_id, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            // Replica IDs are arbitrary strings, so escape them like JSON does
            let key = serde_json::to_string(replica_id).map_err(|_| fmt::Error)?;
            write!(f, "{key}:{counter}")?;
        }
        f.write_str("}")
    }
}

impl FromStr for VectorClock {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors that can occur with vector clock operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// The textual form could not be parsed
    #[error("failed to parse vector clock: {0}")]
    Parse(String),
}
