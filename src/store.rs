use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use tokio::time::{Duration, Instant};

use crate::{config::Retention, reading::Reading};

/// Whether a merged reading introduced a new source or replaced a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct Record {
    seq: u64,
    pub reading: Reading,
    /// Local arrival time. Only ever compared with other local instants.
    pub received_at: Instant,
}

/// The bounded, arrival-ordered set of accepted readings, together with the
/// last-activity time of every source that currently has data in it.
///
/// The store itself is not synchronised; the [`Aggregator`] keeps it behind a
/// single mutex so every read and write sees a whole view, and commits a
/// changed copy only once it is on disk.
///
/// [`Aggregator`]: crate::service::Aggregator
#[derive(Debug, Clone)]
pub struct RecordStore {
    /// Oldest first. Sequence numbers increase from front to back.
    records: VecDeque<Record>,
    /// Source id to the sequence number of its newest record.
    latest: HashMap<String, u64>,
    /// Source id to the time of its last accepted submission.
    activity: HashMap<String, Instant>,
    next_seq: u64,
    max_records: usize,
    retention: Retention,
}

impl RecordStore {
    pub fn new(max_records: usize, retention: Retention) -> Self {
        let max_records = max_records.max(1);
        Self {
            records: VecDeque::with_capacity(max_records),
            latest: HashMap::new(),
            activity: HashMap::new(),
            next_seq: 0,
            max_records,
            retention,
        }
    }

    /// Merges a reading received at `now` and marks its source active.
    ///
    /// If the store is full the oldest record overall is evicted first, no
    /// matter which source it belongs to.
    pub fn upsert(&mut self, reading: Reading, now: Instant) -> Upsert {
        let id = reading.id().to_owned();
        let outcome = match self.latest.get(&id) {
            Some(&seq) => {
                if self.retention == Retention::LatestPerSource {
                    self.remove_seq(seq);
                }
                Upsert::Updated
            }
            None => Upsert::Created,
        };

        while self.records.len() >= self.max_records {
            self.evict_oldest();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push_back(Record {
            seq,
            reading,
            received_at: now,
        });
        self.latest.insert(id.clone(), seq);
        self.activity.insert(id, now);
        outcome
    }

    /// The most recently inserted reading, from any source.
    pub fn latest(&self) -> Option<&Reading> {
        self.records.back().map(|r| &r.reading)
    }

    /// The most recently inserted reading from one source.
    pub fn latest_for(&self, id: &str) -> Option<&Reading> {
        let seq = *self.latest.get(id)?;
        self.position(seq).map(|i| &self.records[i].reading)
    }

    pub fn last_activity(&self, id: &str) -> Option<Instant> {
        self.activity.get(id).copied()
    }

    /// Removes every source whose last activity is strictly more than
    /// `cutoff` before `now`, with all of its records. Returns the evicted
    /// source ids, sorted.
    pub fn evict_older_than(
        &mut self,
        cutoff: Duration,
        now: Instant,
    ) -> Vec<String> {
        let mut expired: Vec<String> = self
            .activity
            .iter()
            .filter(|(_, &at)| now.saturating_duration_since(at) > cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        expired.sort_unstable();

        for id in &expired {
            self.activity.remove(id);
            self.latest.remove(id);
        }
        {
            let gone: HashSet<&str> = expired.iter().map(String::as_str).collect();
            self.records.retain(|r| !gone.contains(r.reading.id()));
        }
        expired
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self.records.pop_front() else {
            return;
        };
        let id = oldest.reading.id();
        // only forget the source if this was its newest record
        if self.latest.get(id) == Some(&oldest.seq) {
            self.latest.remove(id);
            self.activity.remove(id);
        }
    }

    fn remove_seq(&mut self, seq: u64) {
        if let Some(i) = self.position(seq) {
            self.records.remove(i);
        }
    }

    fn position(&self, seq: u64) -> Option<usize> {
        self.records.binary_search_by_key(&seq, |r| r.seq).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(id: &str, temp: &str) -> Reading {
        let body = format!(r#"{{"id":"{id}","air_temp":"{temp}"}}"#);
        Reading::parse(body.as_bytes()).unwrap()
    }

    fn ids(store: &RecordStore) -> Vec<String> {
        store.records().map(|r| r.reading.id().to_owned()).collect()
    }

    #[test]
    fn empty_store_has_no_data() {
        let store = RecordStore::new(20, Retention::LatestPerSource);
        assert!(store.latest().is_none());
        assert!(store.latest_for("S1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn create_then_update() {
        let mut store = RecordStore::new(20, Retention::LatestPerSource);
        let now = Instant::now();
        assert_eq!(store.upsert(reading("S1", "1"), now), Upsert::Created);
        assert_eq!(store.upsert(reading("S2", "2"), now), Upsert::Created);
        assert_eq!(store.upsert(reading("S1", "3"), now), Upsert::Updated);

        assert_eq!(store.len(), 2);
        assert_eq!(ids(&store), ["S2", "S1"]);
        assert_eq!(store.latest_for("S1").unwrap().get("air_temp"), Some("3"));
        assert_eq!(store.latest().unwrap().id(), "S1");
    }

    #[test]
    fn keeps_the_twenty_newest() {
        let mut store = RecordStore::new(20, Retention::LatestPerSource);
        let now = Instant::now();
        for n in 1..=25 {
            store.upsert(reading(&format!("S{n}"), "0"), now);
        }
        let expected: Vec<String> = (6..=25).map(|n| format!("S{n}")).collect();
        assert_eq!(ids(&store), expected);
        assert!(store.latest_for("S5").is_none());
        assert!(store.last_activity("S5").is_none());
        // an evicted source starts over
        assert_eq!(store.upsert(reading("S1", "0"), now), Upsert::Created);
        assert_eq!(store.len(), 20);
    }

    #[test]
    fn update_in_full_store_does_not_evict() {
        let mut store = RecordStore::new(3, Retention::LatestPerSource);
        let now = Instant::now();
        for id in ["A", "B", "C"] {
            store.upsert(reading(id, "0"), now);
        }
        assert_eq!(store.upsert(reading("A", "1"), now), Upsert::Updated);
        assert_eq!(ids(&store), ["B", "C", "A"]);
    }

    #[test]
    fn full_history_keeps_every_submission() {
        let mut store = RecordStore::new(3, Retention::FullHistory);
        let now = Instant::now();
        store.upsert(reading("A", "1"), now);
        store.upsert(reading("B", "1"), now);
        assert_eq!(store.upsert(reading("A", "2"), now), Upsert::Updated);
        assert_eq!(ids(&store), ["A", "B", "A"]);
        assert_eq!(store.latest_for("A").unwrap().get("air_temp"), Some("2"));

        // evicting A's older record leaves A's newer one, and A active
        store.upsert(reading("C", "1"), now);
        assert_eq!(ids(&store), ["B", "A", "C"]);
        assert!(store.last_activity("A").is_some());
        assert_eq!(store.latest_for("A").unwrap().get("air_temp"), Some("2"));
    }

    #[test]
    fn evicts_only_past_the_cutoff() {
        let mut store = RecordStore::new(20, Retention::LatestPerSource);
        let start = Instant::now();
        let cutoff = Duration::from_secs(30);
        store.upsert(reading("old", "0"), start);
        store.upsert(reading("edge", "0"), start + Duration::from_secs(1));
        store.upsert(reading("fresh", "0"), start + Duration::from_secs(20));

        let now = start + Duration::from_secs(31);
        assert_eq!(store.evict_older_than(cutoff, now), ["old"]);
        // exactly at the cutoff is kept
        assert_eq!(ids(&store), ["edge", "fresh"]);

        let now = start + Duration::from_millis(31_001);
        assert_eq!(store.evict_older_than(cutoff, now), ["edge"]);
        assert_eq!(store.latest().unwrap().id(), "fresh");
        assert!(store.last_activity("edge").is_none());
    }

    #[test]
    fn eviction_of_only_source_empties_store() {
        let mut store = RecordStore::new(20, Retention::FullHistory);
        let start = Instant::now();
        store.upsert(reading("S1", "0"), start);
        store.upsert(reading("S1", "1"), start);
        let evicted =
            store.evict_older_than(Duration::from_secs(30), start + Duration::from_secs(31));
        assert_eq!(evicted, ["S1"]);
        assert!(store.latest().is_none());
    }
}
