use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::{ScopeKind, SpanName};
use crate::global;
use crate::scope_debug;

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a single span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    fn next() -> Self {
        SpanId(NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn into_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One scope's span record.
///
/// Shared between the owning handle, the opening thread's active stack, and
/// any child spans holding it as their parent. The mutable portion sits
/// behind a mutex that holds `Some` until the span ends; taking it is what
/// makes ending exactly-once, from whichever thread gets there first.
#[derive(Debug)]
pub(crate) struct Span {
    id: SpanId,
    name: SpanName,
    kind: ScopeKind,
    parent: Option<Arc<Span>>,
    active: Mutex<Option<ActiveSpan>>,
}

#[derive(Debug)]
struct ActiveSpan {
    start_time: SystemTime,
}

impl Span {
    pub(crate) fn start(name: SpanName, kind: ScopeKind, parent: Option<Arc<Span>>) -> Arc<Self> {
        Arc::new(Span {
            id: SpanId::next(),
            name,
            kind,
            parent,
            active: Mutex::new(Some(ActiveSpan {
                start_time: SystemTime::now(),
            })),
        })
    }

    pub(crate) fn id(&self) -> SpanId {
        self.id
    }

    pub(crate) fn name(&self) -> &SpanName {
        &self.name
    }

    pub(crate) fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub(crate) fn parent_id(&self) -> Option<SpanId> {
        self.parent.as_ref().map(|parent| parent.id)
    }

    /// Whether the span has not ended yet. A poisoned lock counts as ended.
    pub(crate) fn is_active(&self) -> bool {
        self.active
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// The open-event payload, or `None` once the span has ended.
    pub(crate) fn open_data(&self) -> Option<SpanData> {
        self.active.lock().ok().and_then(|guard| {
            guard
                .as_ref()
                .map(|active| self.snapshot(active.start_time, None))
        })
    }

    /// Ends the span and notifies observers, exactly once. Later calls are
    /// no-ops.
    pub(crate) fn end(&self) {
        // Take the active state, marking the span as ended
        let active = match self.active.lock().ok().and_then(|mut guard| guard.take()) {
            Some(active) => active,
            None => {
                scope_debug!(name: "Span.EndAfterClose", id = self.id.into_u64());
                return; // Already ended
            }
        };
        global::notify_close(self.snapshot(active.start_time, Some(SystemTime::now())));
    }

    fn snapshot(&self, start_time: SystemTime, end_time: Option<SystemTime>) -> SpanData {
        SpanData {
            id: self.id,
            parent_id: self.parent_id(),
            name: self.name.clone(),
            kind: self.kind,
            start_time,
            end_time,
        }
    }
}

/// The immutable event payload delivered to observers.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Process-unique id of the span.
    pub id: SpanId,
    /// Id of the structural parent, if the scope opened under one.
    pub parent_id: Option<SpanId>,
    /// The span's name.
    pub name: SpanName,
    /// User scope or management span.
    pub kind: ScopeKind,
    /// When the scope was opened.
    pub start_time: SystemTime,
    /// When the scope closed. `None` in open events.
    pub end_time: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::register_observer;
    use crate::testing::InMemoryScopeRecorder;

    #[test]
    fn span_ends_exactly_once() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let span = Span::start(SpanName::User("span::end_once".into()), ScopeKind::User, None);
        assert!(span.is_active());

        span.end();
        assert!(!span.is_active());

        // Ending again must not produce a second close event.
        span.end();
        span.end();

        assert_eq!(recorder.closed_named("span::end_once").len(), 1);
    }

    #[test]
    fn span_ids_are_unique() {
        let a = Span::start(SpanName::User("span::id_a".into()), ScopeKind::User, None);
        let b = Span::start(SpanName::User("span::id_b".into()), ScopeKind::User, None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn close_event_carries_parent_and_times() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let parent = Span::start(SpanName::User("span::parent".into()), ScopeKind::User, None);
        let child = Span::start(
            SpanName::User("span::child".into()),
            ScopeKind::User,
            Some(parent.clone()),
        );
        child.end();

        let closed = recorder.closed_named("span::child");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].parent_id, Some(parent.id()));
        assert_eq!(closed[0].kind, ScopeKind::User);
        let end_time = closed[0].end_time.unwrap();
        assert!(end_time >= closed[0].start_time);
    }
}
