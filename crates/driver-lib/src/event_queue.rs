//! Time-ordered queue of pending session events
//!
//! Events are bucketed per session. The head of every session that is not
//! on hold is indexed in a single ordered set, so extraction across all
//! sessions is always in timestamp order while holds and delays only touch
//! the affected session.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::error::QueueError;
use crate::models::Event;

/// Total order of queued events
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    timestamp: DateTime<Utc>,
    rank: u8,
    global_index: u64,
}

impl OrderKey {
    fn of(event: &Event) -> Self {
        Self {
            timestamp: event.timestamp,
            rank: event.name.tie_break_rank(),
            global_index: event.global_index,
        }
    }
}

#[derive(Debug)]
struct SessionQueue {
    events: BTreeMap<OrderKey, Event>,
    held: bool,
    /// Cumulative delay applied to every event of this session
    delay: chrono::Duration,
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
            held: false,
            delay: chrono::Duration::zero(),
        }
    }
}

impl SessionQueue {
    fn head(&self) -> Option<&OrderKey> {
        self.events.keys().next()
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SessionQueue>,
    ready: BTreeSet<(OrderKey, String)>,
    len: usize,
}

impl Inner {
    fn unindex(&mut self, session_id: &str) {
        if let Some(key) = self.sessions.get(session_id).and_then(|q| q.head().cloned()) {
            self.ready.remove(&(key, session_id.to_string()));
        }
    }

    fn index(&mut self, session_id: &str) {
        if let Some(queue) = self.sessions.get(session_id) {
            if queue.held {
                return;
            }
            if let Some(key) = queue.head() {
                self.ready.insert((key.clone(), session_id.to_string()));
            }
        }
    }
}

/// Pending events for all sessions of one workload
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, applying any delay already incurred by its session
    pub fn enqueue_event(&self, mut event: Event) {
        let mut inner = self.inner.lock();
        let session_id = event.session_id.clone();

        inner.unindex(&session_id);
        let queue = inner.sessions.entry(session_id.clone()).or_default();

        let outstanding = queue.delay - event.total_delay();
        if outstanding > chrono::Duration::zero() {
            event.push_timestamp_back(outstanding);
        }
        event.mark_enqueued();

        debug!(
            session_id = %session_id,
            event_name = %event.name,
            timestamp = %event.timestamp,
            num_times_enqueued = event.num_times_enqueued(),
            "Enqueued event"
        );

        queue.events.insert(OrderKey::of(&event), event);
        inner.len += 1;
        inner.index(&session_id);
    }

    /// Whether some non-held event is due at or before `tick`
    pub fn has_events_for_tick(&self, tick: DateTime<Utc>) -> bool {
        self.inner
            .lock()
            .ready
            .first()
            .is_some_and(|(key, _)| key.timestamp <= tick)
    }

    /// Remove and return the earliest non-held event due at or before `tick`
    pub fn pop(&self, tick: DateTime<Utc>) -> Option<Event> {
        let mut inner = self.inner.lock();
        let (key, session_id) = inner.ready.first()?.clone();
        if key.timestamp > tick {
            return None;
        }

        inner.ready.remove(&(key.clone(), session_id.clone()));
        let event = inner
            .sessions
            .get_mut(&session_id)
            .and_then(|q| q.events.remove(&key))?;
        inner.len -= 1;
        inner.index(&session_id);

        Some(event)
    }

    /// Timestamp of the next event that could be extracted
    pub fn next_ready_timestamp(&self) -> Result<DateTime<Utc>, QueueError> {
        self.inner
            .lock()
            .ready
            .first()
            .map(|(key, _)| key.timestamp)
            .ok_or(QueueError::Empty)
    }

    /// Hide a session's events until [`EventQueue::release_event_hold_for_session`]
    pub fn hold_events_for_session(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        inner.unindex(session_id);
        inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .held = true;

        debug!(session_id = %session_id, "Holding events for session");
    }

    pub fn release_event_hold_for_session(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(session_id) {
            Some(queue) if queue.held => queue.held = false,
            _ => return,
        }
        inner.index(session_id);

        debug!(session_id = %session_id, "Released event hold for session");
    }

    pub fn is_session_held(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .is_some_and(|q| q.held)
    }

    /// Push every queued and future event of a session back by `delay`
    pub fn delay_session(&self, session_id: &str, delay: chrono::Duration) {
        if delay <= chrono::Duration::zero() {
            return;
        }

        let mut inner = self.inner.lock();
        inner.unindex(session_id);

        let queue = inner.sessions.entry(session_id.to_string()).or_default();
        queue.delay += delay;
        queue.events = std::mem::take(&mut queue.events)
            .into_values()
            .map(|mut event| {
                event.push_timestamp_back(delay);
                (OrderKey::of(&event), event)
            })
            .collect();

        debug!(
            session_id = %session_id,
            delay_ms = delay.num_milliseconds(),
            total_delay_ms = queue.delay.num_milliseconds(),
            "Delayed session"
        );

        inner.index(session_id);
    }

    /// Cumulative delay incurred by a session
    pub fn session_delay(&self, session_id: &str) -> chrono::Duration {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|q| q.delay)
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Number of pending events, held ones included
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventName;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn evt(name: EventName, session: &str, secs: i64) -> Event {
        Event::new(name, session, t(secs))
    }

    fn drain(queue: &EventQueue, tick: DateTime<Utc>) -> Vec<Event> {
        let mut out = Vec::new();
        while queue.has_events_for_tick(tick) {
            out.push(queue.pop(tick).unwrap());
        }
        out
    }

    #[test]
    fn test_pop_in_timestamp_order_across_sessions() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::TrainingStarted, "b", 30));
        queue.enqueue_event(evt(EventName::SessionReady, "a", 10));
        queue.enqueue_event(evt(EventName::SessionReady, "b", 0));
        queue.enqueue_event(evt(EventName::SessionStopped, "a", 50));

        let events = drain(&queue, t(60));
        let order: Vec<_> = events.iter().map(|e| (e.session_id.as_str(), e.name)).collect();
        assert_eq!(
            order,
            vec![
                ("b", EventName::SessionReady),
                ("a", EventName::SessionReady),
                ("b", EventName::TrainingStarted),
                ("a", EventName::SessionStopped),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_only_events_due_by_tick_are_returned() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::SessionReady, "a", 60));
        queue.enqueue_event(evt(EventName::TrainingStarted, "a", 61));

        assert!(queue.has_events_for_tick(t(60)));
        assert_eq!(queue.pop(t(60)).unwrap().name, EventName::SessionReady);
        assert!(!queue.has_events_for_tick(t(60)));
        assert!(queue.pop(t(60)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_equal_timestamp_tie_break() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::SessionStopped, "a", 120));
        queue.enqueue_event(evt(EventName::TrainingEnded, "a", 120));
        queue.enqueue_event(evt(EventName::TrainingStarted, "b", 120));
        queue.enqueue_event(evt(EventName::SessionReady, "b", 120));

        let names: Vec<_> = drain(&queue, t(120)).into_iter().map(|e| e.name).collect();
        assert_eq!(names[0], EventName::SessionReady);
        let ended = names.iter().position(|n| *n == EventName::TrainingEnded).unwrap();
        let stopped = names.iter().position(|n| *n == EventName::SessionStopped).unwrap();
        assert!(ended < stopped);
    }

    #[test]
    fn test_hold_hides_session_until_release() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::TrainingStarted, "a", 10));
        queue.enqueue_event(evt(EventName::TrainingEnded, "a", 20));
        queue.enqueue_event(evt(EventName::TrainingStarted, "b", 15));

        queue.hold_events_for_session("a");
        assert!(queue.is_session_held("a"));

        let visible = drain(&queue, t(60));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].session_id, "b");
        assert_eq!(queue.len(), 2);

        queue.release_event_hold_for_session("a");
        let released: Vec<_> = drain(&queue, t(60)).into_iter().map(|e| e.name).collect();
        assert_eq!(released, vec![EventName::TrainingStarted, EventName::TrainingEnded]);
    }

    #[test]
    fn test_hold_applies_to_events_enqueued_later() {
        let queue = EventQueue::new();
        queue.hold_events_for_session("a");
        queue.enqueue_event(evt(EventName::TrainingEnded, "a", 5));

        assert!(!queue.has_events_for_tick(t(60)));
        assert_eq!(queue.next_ready_timestamp(), Err(QueueError::Empty));

        queue.release_event_hold_for_session("a");
        assert_eq!(queue.next_ready_timestamp(), Ok(t(5)));
    }

    #[test]
    fn test_delay_session_shifts_queued_and_future_events() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::TrainingStarted, "a", 10));
        queue.enqueue_event(evt(EventName::TrainingStarted, "b", 20));

        queue.delay_session("a", Duration::seconds(120));
        queue.enqueue_event(evt(EventName::TrainingEnded, "a", 40));

        assert_eq!(queue.session_delay("a"), Duration::seconds(120));
        let events = drain(&queue, t(600));
        let order: Vec<_> = events
            .iter()
            .map(|e| (e.session_id.as_str(), e.timestamp))
            .collect();
        assert_eq!(order, vec![("b", t(20)), ("a", t(130)), ("a", t(160))]);
        assert_eq!(events[1].total_delay(), Duration::seconds(120));
    }

    #[test]
    fn test_requeued_event_catches_up_with_session_delay() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::TrainingStarted, "a", 10));
        let popped = queue.pop(t(10)).unwrap();

        queue.delay_session("a", Duration::seconds(60));
        queue.enqueue_event(popped);

        let again = queue.pop(t(600)).unwrap();
        assert_eq!(again.timestamp, t(70));
        assert_eq!(again.num_times_enqueued(), 2);
    }

    #[test]
    fn test_next_ready_timestamp_on_empty_queue() {
        let queue = EventQueue::new();
        assert_eq!(queue.next_ready_timestamp(), Err(QueueError::Empty));

        queue.enqueue_event(evt(EventName::SessionReady, "a", 42));
        assert_eq!(queue.next_ready_timestamp(), Ok(t(42)));
    }

    #[test]
    fn test_release_without_hold_is_noop() {
        let queue = EventQueue::new();
        queue.enqueue_event(evt(EventName::SessionReady, "a", 0));
        queue.release_event_hold_for_session("a");
        queue.release_event_hold_for_session("missing");
        assert_eq!(drain(&queue, t(0)).len(), 1);
    }
}
