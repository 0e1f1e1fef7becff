use std::collections::VecDeque;

use crate::types::{Event, sort_events};

/// Append-only, capacity-bounded window over the event history.
///
/// Fed by push (`append`) and by full reconciliation fetches (`replace_all`).
/// The oldest entries evict first. Views index from the most recent end, so
/// eviction never shifts a window measured from the tail.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Add at the tail, evicting from the head once over capacity. No id
    /// dedup: an event seen by push and by a later fetch coexists until the
    /// next `replace_all`.
    pub fn append(&mut self, event: Event) {
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    /// Replace the contents with the canonical history, keeping the most
    /// recent `capacity` events by timestamp.
    pub fn replace_all(&mut self, events: Vec<Event>) {
        let mut events = events;
        sort_events(&mut events);
        let skip = events.len().saturating_sub(self.capacity);
        self.events = events.into_iter().skip(skip).collect();
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    /// The last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<Event> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_timestamp;

    fn event(n: usize) -> Event {
        Event {
            id: format!("ev-{n}"),
            timestamp: parse_timestamp(&format!("2025-01-01T00:{:02}:{:02}Z", n / 60, n % 60)),
            kind: Some("tick".into()),
            actor_id: None,
            target_id: None,
            description: format!("event {n}"),
            metadata: None,
        }
    }

    #[test]
    fn test_append_evicts_oldest() {
        let mut log = EventLog::new(200);
        for n in 0..250 {
            log.append(event(n));
            assert!(log.len() <= 200);
        }
        let snap = log.snapshot();
        assert_eq!(snap.len(), 200);
        assert_eq!(snap.first().unwrap().id, "ev-50");
        assert_eq!(snap.last().unwrap().id, "ev-249");
    }

    #[test]
    fn test_append_keeps_arrival_order() {
        let mut log = EventLog::new(3);
        // Out of timestamp order on purpose: append does not re-sort
        for n in [5, 1, 9, 3] {
            log.append(event(n));
        }
        let ids: Vec<String> = log.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ev-1", "ev-9", "ev-3"]);
    }

    #[test]
    fn test_append_does_not_dedup() {
        let mut log = EventLog::new(10);
        log.append(event(1));
        log.append(event(1));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_replace_all_sorts_and_trims() {
        let mut log = EventLog::new(3);
        log.append(event(100));
        log.append(event(100));

        log.replace_all(vec![event(4), event(1), event(3), event(2), event(0)]);
        let ids: Vec<String> = log.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ev-2", "ev-3", "ev-4"]);
    }

    #[test]
    fn test_tail() {
        let mut log = EventLog::new(10);
        for n in 0..5 {
            log.append(event(n));
        }
        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, "ev-3");
        assert_eq!(log.tail(50).len(), 5);
    }
}
