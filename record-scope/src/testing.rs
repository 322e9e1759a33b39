//! Utilities for asserting on scope events in tests.
//!
//! The recorder registers like any other observer, so concurrently running
//! tests each hold their own instance and filter events by scope names
//! unique to the test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::global::ScopeObserver;
use crate::trace::{SpanData, SpanId};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Draws a process-wide monotonic ticket from the counter every recorder
/// stamps its events with.
///
/// Comparing a ticket drawn after some operation against the sequence
/// numbers of recorded events establishes which came first.
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Whether an event was an open or a close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopePhase {
    /// The scope was opened.
    Opened,
    /// The scope closed.
    Closed,
}

/// One recorded observer callback.
#[derive(Clone, Debug)]
pub struct RecordedScope {
    /// Ticket drawn when the event was recorded.
    pub sequence: u64,
    /// Open or close.
    pub phase: ScopePhase,
    /// The event payload as delivered.
    pub data: SpanData,
}

/// A [`ScopeObserver`] that stores every event in memory.
///
/// Clones share storage, so a test can register one clone and query the
/// other after the fact.
#[derive(Clone, Debug, Default)]
pub struct InMemoryScopeRecorder {
    events: Arc<Mutex<Vec<RecordedScope>>>,
}

impl InMemoryScopeRecorder {
    fn record(&self, phase: ScopePhase, data: SpanData) {
        let event = RecordedScope {
            sequence: next_sequence(),
            phase,
            data,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// All recorded events, in arrival order.
    pub fn events(&self) -> Vec<RecordedScope> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Open events for scopes named `name`.
    pub fn opened_named(&self, name: &str) -> Vec<SpanData> {
        self.filter(ScopePhase::Opened, name)
    }

    /// Close events for scopes named `name`.
    pub fn closed_named(&self, name: &str) -> Vec<SpanData> {
        self.filter(ScopePhase::Closed, name)
    }

    fn filter(&self, phase: ScopePhase, name: &str) -> Vec<SpanData> {
        self.events()
            .into_iter()
            .filter(|event| event.phase == phase && event.data.name.as_str() == name)
            .map(|event| event.data)
            .collect()
    }

    /// Sequence number of the open event for span `id`.
    pub fn opened_seq(&self, id: SpanId) -> Option<u64> {
        self.seq_of(ScopePhase::Opened, id)
    }

    /// Sequence number of the close event for span `id`.
    pub fn closed_seq(&self, id: SpanId) -> Option<u64> {
        self.seq_of(ScopePhase::Closed, id)
    }

    fn seq_of(&self, phase: ScopePhase, id: SpanId) -> Option<u64> {
        self.events()
            .into_iter()
            .find(|event| event.phase == phase && event.data.id == id)
            .map(|event| event.sequence)
    }

    /// Clears all recorded events.
    pub fn reset(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl ScopeObserver for InMemoryScopeRecorder {
    fn on_open(&self, scope: &SpanData) {
        self.record(ScopePhase::Opened, scope.clone());
    }

    fn on_close(&self, scope: SpanData) {
        self.record(ScopePhase::Closed, scope);
    }
}
