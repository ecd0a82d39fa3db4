//! Deadline bookkeeping for the reactor.
//!
//! Timers are plain entries in a deadline heap; the reactor sleeps until
//! the earliest deadline and drains whatever has expired. Events carry a
//! connection id rather than a reference, so a firing whose connection
//! is gone simply finds nothing to deliver to. Cancellation is
//! synchronous: once [`TimerService::cancel`] returns the entry can
//! never fire.

use crate::peer::RequestId;
use crate::session::ConnId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Stable handle to one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer firing means to its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// 120 s of outbound idleness elapsed; send a keep-alive.
    KeepAlive,
    /// 180 s without receiving anything; drop the connection.
    IdleDisconnect,
    /// An outstanding block request went unanswered for 60 s.
    RequestTimeout(RequestId),
}

/// A timer firing, addressed by connection id.
#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub conn: ConnId,
    pub kind: TimerKind,
}

/// Deadline-heap timer service.
///
/// The heap may hold stale entries for cancelled timers; they are
/// skipped lazily when popped, while the entry map is the source of
/// truth for liveness.
pub struct TimerService {
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEvent>,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    /// Schedules `event` to fire after `after` from now.
    pub fn add(&mut self, after: Duration, event: TimerEvent) -> TimerId {
        self.add_at(Instant::now() + after, event)
    }

    /// Schedules `event` at an absolute deadline.
    pub fn add_at(&mut self, deadline: Instant, event: TimerEvent) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, event);
        id
    }

    /// Cancels a timer. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Earliest live deadline, if any timers are scheduled.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every event whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(event) = self.entries.remove(&id) {
                fired.push(event);
            }
        }
        fired
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live timers belonging to one connection.
    pub fn count_for(&self, conn: ConnId) -> usize {
        self.entries.values().filter(|e| e.conn == conn).count()
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: TimerKind) -> TimerEvent {
        TimerEvent {
            conn: ConnId::from_raw(7),
            kind,
        }
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerService::new();
        let now = Instant::now();
        timers.add_at(now + Duration::from_secs(2), event(TimerKind::IdleDisconnect));
        timers.add_at(now + Duration::from_secs(1), event(TimerKind::KeepAlive));

        let fired = timers.expired(now + Duration::from_secs(3));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].kind, TimerKind::KeepAlive);
        assert_eq!(fired[1].kind, TimerKind::IdleDisconnect);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut timers = TimerService::new();
        let now = Instant::now();
        let id = timers.add_at(now + Duration::from_secs(1), event(TimerKind::KeepAlive));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.expired(now + Duration::from_secs(2)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_next_deadline_skips_stale_entries() {
        let mut timers = TimerService::new();
        let now = Instant::now();
        let early = timers.add_at(now + Duration::from_secs(1), event(TimerKind::KeepAlive));
        timers.add_at(now + Duration::from_secs(5), event(TimerKind::IdleDisconnect));
        timers.cancel(early);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_not_yet_due_stays_scheduled() {
        let mut timers = TimerService::new();
        let now = Instant::now();
        timers.add_at(now + Duration::from_secs(10), event(TimerKind::KeepAlive));
        assert!(timers.expired(now).is_empty());
        assert_eq!(timers.len(), 1);
    }
}
