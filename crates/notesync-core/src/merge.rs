//! Deterministic ordering and replay of text operations.
//!
//! Every replica holding the same set of operations must reach the same
//! text, whatever order the operations arrived in. Replay therefore runs
//! over a canonical order computed from the operations alone.
//!
//! # Ordering Rules
//!
//! | Level | Rule |
//! |-------|------|
//! | 1 | Causal: an operation whose clock happened before another's comes first |
//! | 2 | Concurrent operations: ascending wall-clock timestamp |
//! | 3 | Equal timestamps: ascending replica ID (lexicographic) |
//! | 4 | Identical keys: ascending operation ID |
//!
//! The vector clock order is only partial, so a plain comparison sort over
//! these rules is not guaranteed to be consistent. The order is instead
//! built as a linear extension of the causal order: at each step the
//! smallest operation (by levels 2-4) among those whose causal
//! predecessors have all been emitted is taken next.
//!
//! # Replay Rules
//!
//! | Kind | Applies when | Effect |
//! |------|--------------|--------|
//! | Insert | `position <= len` | splice `content` in at `position` |
//! | Delete | `position < len` | remove one character at `position` |
//!
//! Out-of-range operations are skipped without error. Positions count
//! Unicode scalar values, not bytes.

use crate::crdt::{OpKind, Operation};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Operations of one replica sorted by that replica's own counter.
type Lane = Vec<(u64, usize)>;

/// Order operations canonically, respecting causality first.
///
/// Only edges to each operation's nearest causal predecessor per replica
/// are built; the remaining happens-before pairs follow transitively.
#[must_use]
pub fn causal_order(ops: &[Operation]) -> Vec<&Operation> {
    let n = ops.len();
    let mut lanes: HashMap<&str, Lane> = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        lanes
            .entry(op.replica_id.as_str())
            .or_default()
            .push((op.clock.get(&op.replica_id), i));
    }
    for lane in lanes.values_mut() {
        lane.sort_unstable();
    }

    let mut pending_predecessors = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (j, later) in ops.iter().enumerate() {
        for (replica, seen) in later.clock.iter() {
            let Some(lane) = lanes.get(replica) else {
                continue;
            };
            // Own operations must carry a strictly smaller counter
            let limit = if replica == later.replica_id {
                match seen.checked_sub(1) {
                    Some(limit) => limit,
                    None => continue,
                }
            } else {
                seen
            };

            for i in nearest_predecessors(ops, lane, limit, later) {
                successors[i].push(j);
                pending_predecessors[j] += 1;
            }
        }
    }

    let tiebreak = |i: usize| {
        let op = &ops[i];
        Reverse((op.timestamp, op.replica_id.as_str(), op.id.as_str(), i))
    };

    let mut ready: BinaryHeap<_> = (0..n)
        .filter(|&i| pending_predecessors[i] == 0)
        .map(tiebreak)
        .collect();

    let mut ordered = Vec::with_capacity(n);
    while let Some(Reverse((_, _, _, i))) = ready.pop() {
        ordered.push(&ops[i]);
        for &j in &successors[i] {
            pending_predecessors[j] -= 1;
            if pending_predecessors[j] == 0 {
                ready.push(tiebreak(j));
            }
        }
    }

    ordered
}

/// Indices in `lane` of the operations with the greatest counter not above
/// `limit` that happened before `later`.
///
/// Walks further back only when a lane holds operations whose clocks do
/// not line up with their counters.
fn nearest_predecessors(ops: &[Operation], lane: &Lane, limit: u64, later: &Operation) -> Vec<usize> {
    let mut end = lane.partition_point(|&(counter, _)| counter <= limit);

    while end > 0 {
        let counter = lane[end - 1].0;
        let start = lane[..end].partition_point(|&(c, _)| c < counter);
        let linked: Vec<usize> = lane[start..end]
            .iter()
            .map(|&(_, i)| i)
            .filter(|&i| ops[i].clock.happens_before(&later.clock))
            .collect();
        if !linked.is_empty() {
            return linked;
        }
        end = start;
    }

    Vec::new()
}

/// Apply one operation to `text`, skipping it when out of range.
pub fn apply_one(text: &mut String, op: &Operation) {
    match op.kind {
        OpKind::Insert => {
            let offset = text
                .char_indices()
                .map(|(offset, _)| offset)
                .chain(std::iter::once(text.len()))
                .nth(op.position);
            if let Some(offset) = offset {
                text.insert_str(offset, &op.content);
            }
        }
        OpKind::Delete => {
            if let Some((offset, ch)) = text.char_indices().nth(op.position) {
                text.replace_range(offset..offset + ch.len_utf8(), "");
            }
        }
    }
}

/// Replay ordered operations onto an empty text.
#[must_use]
pub fn replay<'a>(ordered: impl IntoIterator<Item = &'a Operation>) -> String {
    let mut text = String::new();
    for op in ordered {
        apply_one(&mut text, op);
    }
    text
}

/// Order and replay in one step.
#[must_use]
pub fn materialize(ops: &[Operation]) -> String {
    replay(causal_order(ops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn insert(replica: &str, vc: VectorClock, position: usize, content: &str, ts: i64) -> Operation {
        Operation::insert(replica, vc, position, content, at(ts))
    }

    #[test]
    fn causal_order_beats_timestamp() {
        // The causally later op carries an earlier wall-clock time
        let first = insert("a", clock(&[("a", 1)]), 0, "x", 100);
        let second = insert("a", clock(&[("a", 2)]), 1, "y", 50);

        let ops = vec![second.clone(), first.clone()];
        let ordered = causal_order(&ops);

        assert_eq!(ordered[0].id, first.id);
        assert_eq!(ordered[1].id, second.id);
        assert_eq!(materialize(&ops), "xy");
    }

    #[test]
    fn concurrent_ops_ordered_by_timestamp_then_replica() {
        let early = insert("b", clock(&[("b", 1)]), 0, "B", 10);
        let late = insert("a", clock(&[("a", 1)]), 0, "A", 20);
        let tie = insert("c", clock(&[("c", 1)]), 0, "C", 20);

        let ops = vec![tie.clone(), late.clone(), early.clone()];
        let ordered: Vec<&str> = causal_order(&ops)
            .into_iter()
            .map(|op| op.replica_id.as_str())
            .collect();

        assert_eq!(ordered, vec!["b", "a", "c"]);
    }

    #[test]
    fn order_independent_of_input_order() {
        let base = insert("a", clock(&[("a", 1)]), 0, "AB", 1);
        let x = insert("a", clock(&[("a", 2)]), 1, "X", 5);
        let y = insert("b", clock(&[("a", 1), ("b", 1)]), 1, "Y", 3);

        let forward = vec![base.clone(), x.clone(), y.clone()];
        let backward = vec![y, x, base];

        assert_eq!(materialize(&forward), materialize(&backward));
        assert_eq!(materialize(&forward), "AXYB");
    }

    #[test]
    fn order_respects_every_happens_before_pair() {
        use crate::crdt::TextCrdt;

        // Three replicas editing and exchanging logs at uneven intervals
        let names = ["a", "b", "c"];
        let mut replicas = vec![TextCrdt::new(), TextCrdt::new(), TextCrdt::new()];
        for step in 0..60 {
            let r = step % 3;
            let position = step % 4;
            let op = replicas[r].create_insert(names[r], position, "x");
            replicas[r].apply(op);

            if step % 7 == 0 {
                let source = replicas[(r + 1) % 3].clone();
                replicas[r].merge(&source);
            }
            if step % 11 == 0 {
                let source = replicas[r].clone();
                replicas[(r + 2) % 3].merge(&source);
            }
        }
        for r in 0..3 {
            let source = replicas[r].clone();
            replicas[(r + 1) % 3].merge(&source);
            replicas[(r + 2) % 3].merge(&source);
        }

        let ops = replicas[0].operations().to_vec();
        assert_eq!(ops.len(), 60);
        let ordered = causal_order(&ops);
        assert_eq!(ordered.len(), ops.len());

        let rank: std::collections::HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(rank, op)| (op.id.as_str(), rank))
            .collect();
        for earlier in &ops {
            for later in &ops {
                if earlier.clock.happens_before(&later.clock) {
                    assert!(
                        rank[earlier.id.as_str()] < rank[later.id.as_str()],
                        "{} must precede {}",
                        earlier.id,
                        later.id
                    );
                }
            }
        }

        let texts: Vec<&str> = replicas.iter().map(TextCrdt::text).collect();
        assert_eq!(texts[0], texts[1]);
        assert_eq!(texts[1], texts[2]);
    }

    #[test]
    fn mismatched_counters_still_link_causally() {
        // The a-op at counter 3 saw a replica the reader never heard of
        let first = insert("a", clock(&[("a", 1)]), 0, "x", 30);
        let skipped = insert("a", clock(&[("a", 3), ("c", 9)]), 1, "y", 20);
        let reader = insert("b", clock(&[("a", 3), ("b", 1)]), 0, "z", 10);

        let ops = vec![reader.clone(), skipped, first.clone()];
        let ordered: Vec<&str> = causal_order(&ops)
            .into_iter()
            .map(|op| op.content.as_str())
            .collect();

        assert_eq!(ordered, vec!["x", "z", "y"]);
    }

    #[test]
    fn replay_skips_out_of_range() {
        let ops = vec![
            insert("a", clock(&[("a", 1)]), 0, "hi", 1),
            insert("a", clock(&[("a", 2)]), 5, "!", 2),
            Operation::delete("a", clock(&[("a", 3)]), 2, at(3)),
        ];

        assert_eq!(materialize(&ops), "hi");
    }

    #[test]
    fn replay_counts_characters_not_bytes() {
        let ops = vec![
            insert("a", clock(&[("a", 1)]), 0, "héllo", 1),
            Operation::delete("a", clock(&[("a", 2)]), 1, at(2)),
            insert("a", clock(&[("a", 3)]), 1, "ë", 3),
        ];

        assert_eq!(materialize(&ops), "hëllo");
    }
}
