//! Priority dispatch queue with ready-time gating.
//!
//! Ordering key: priority descending, then `ready_at` ascending, then
//! `created_at` ascending, then submission sequence. The sequence makes
//! dispatch order deterministic for tasks that tie on everything else.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Queue entry for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub priority: i32,
    pub ready_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Monotonic submission sequence; preserves insertion order among
    /// full ties.
    pub seq: u64,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier ready_at/created_at/seq.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.ready_at.cmp(&other.ready_at))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Priority queue over task ids.
///
/// `pop_ready` never returns an entry whose `ready_at` is in the
/// future; delayed retries simply sit in the set until their time
/// comes.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    entries: BTreeSet<QueueEntry>,
    next_seq: u64,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Returns the sequence assigned to the entry.
    pub fn push(
        &mut self,
        task_id: Uuid,
        priority: i32,
        ready_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(QueueEntry {
            task_id,
            priority,
            ready_at,
            created_at,
            seq,
        });
        seq
    }

    /// Pop the best entry whose `ready_at <= now`.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<QueueEntry> {
        let found = self.entries.iter().find(|e| e.ready_at <= now).cloned()?;
        self.entries.remove(&found);
        Some(found)
    }

    /// Peek the earliest instant at which a currently queued entry
    /// becomes ready, if any entry exists.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.ready_at).min()
    }

    /// Remove a specific task (cancellation). Returns whether it was
    /// present.
    pub fn remove(&mut self, task_id: Uuid) -> bool {
        let found: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        let removed = !found.is_empty();
        for entry in found {
            self.entries.remove(&entry);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in dispatch order without removing them.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    #[test]
    fn test_priority_ordering() {
        let now = Utc::now();
        let mut q = DispatchQueue::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        let mid = Uuid::new_v4();

        q.push(low, 1, now, now);
        q.push(high, 10, now, now);
        q.push(mid, 5, now, now);

        assert_eq!(q.pop_ready(now).unwrap().task_id, high);
        assert_eq!(q.pop_ready(now).unwrap().task_id, mid);
        assert_eq!(q.pop_ready(now).unwrap().task_id, low);
        assert!(q.pop_ready(now).is_none());
    }

    #[test]
    fn test_insertion_order_for_full_ties() {
        let now = Utc::now();
        let mut q = DispatchQueue::new();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.push(*id, 5, now, now);
        }
        for id in &ids {
            assert_eq!(q.pop_ready(now).unwrap().task_id, *id);
        }
    }

    #[test]
    fn test_ready_at_gating() {
        let now = Utc::now();
        let mut q = DispatchQueue::new();
        let delayed = Uuid::new_v4();
        let ready = Uuid::new_v4();

        // Delayed entry has higher priority but is not ready yet.
        q.push(delayed, 10, at(now, 30), now);
        q.push(ready, 1, now, now);

        assert_eq!(q.pop_ready(now).unwrap().task_id, ready);
        assert!(q.pop_ready(now).is_none());
        assert_eq!(q.next_ready_at(), Some(at(now, 30)));

        // Once its time comes, the delayed entry pops.
        assert_eq!(q.pop_ready(at(now, 31)).unwrap().task_id, delayed);
    }

    #[test]
    fn test_remove() {
        let now = Utc::now();
        let mut q = DispatchQueue::new();
        let id = Uuid::new_v4();
        q.push(id, 3, now, now);

        assert!(q.remove(id));
        assert!(!q.remove(id));
        assert!(q.is_empty());
    }

    #[test]
    fn test_earlier_created_at_wins_within_priority() {
        let now = Utc::now();
        let mut q = DispatchQueue::new();
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();

        q.push(newer, 5, now, at(now, 1));
        q.push(older, 5, now, now);

        assert_eq!(q.pop_ready(at(now, 2)).unwrap().task_id, older);
        assert_eq!(q.pop_ready(at(now, 2)).unwrap().task_id, newer);
    }
}
