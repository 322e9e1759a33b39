use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use super::span::Span;
use super::stack::with_active_stack;
use super::{ReservedOp, ScopeKind, SpanName};
use crate::global;
use crate::scope_debug;

/// Opens a user scope named `name` on the current thread.
///
/// The scope becomes the innermost active scope of this thread, and the
/// structural parent of anything opened under it, until the returned handle
/// is closed. Registered observers see the open event before this function
/// returns.
///
/// If the innermost active span at the time of the call is the enter
/// operator's own management span, that span is ended first: a management
/// span must never become the parent of the user scope it was opening.
///
/// ```
/// let scope = record_scope::open_scope("stage::decode");
/// // ... traced work ...
/// scope.close();
/// ```
pub fn open_scope(name: impl Into<Cow<'static, str>>) -> ScopeHandle {
    repair_current(ReservedOp::Enter);
    start_scope(SpanName::User(name.into()), ScopeKind::User)
}

/// Opens a management span for one of the built-in operations.
///
/// No repair pass runs here; a reserved span nests under whatever is
/// current, and it is the repair pass in [`open_scope`] and
/// [`ScopeHandle::close`] that keeps it from lingering.
pub(crate) fn open_reserved(op: ReservedOp) -> ScopeHandle {
    start_scope(SpanName::Reserved(op), ScopeKind::Internal)
}

fn start_scope(name: SpanName, kind: ScopeKind) -> ScopeHandle {
    let span = with_active_stack(|stack| {
        let parent = stack.current();
        let span = Span::start(name, kind, parent);
        stack.push(span.clone());
        span
    });
    // Observers run after the thread-local borrow is released, so they are
    // free to open scopes of their own.
    if let Some(data) = span.open_data() {
        global::notify_open(&data);
    }
    ScopeHandle { span: Some(span) }
}

/// Ends the innermost active span if it is the management span of `op`.
///
/// A reserved span still on top of the stack at this point belongs to an
/// operation that has not returned yet. It must not parent the span about
/// to be created, and it must not outlive the span about to be closed, so
/// it is ended here, early.
fn repair_current(op: ReservedOp) {
    let repaired = with_active_stack(|stack| match stack.current() {
        Some(current) if current.name().is_reserved(op) => {
            stack.pop(&current);
            Some(current)
        }
        _ => None,
    });
    if let Some(span) = repaired {
        // Ends outside the borrow; observers may re-enter scope operations.
        span.end();
    }
}

/// Owns an open scope.
///
/// The handle is move-only and closing consumes it, which makes the
/// close-exactly-once contract hold at the type level. Handles may travel
/// freely between threads; the scope then ends on whichever thread calls
/// [`close`].
///
/// Dropping a handle without closing it leaves the scope open, on purpose:
/// an abandoned handle (for example one inside a cancelled binding) must
/// not fabricate a close event. The drop is logged at debug level.
///
/// [`close`]: ScopeHandle::close
pub struct ScopeHandle {
    span: Option<Arc<Span>>,
}

impl ScopeHandle {
    /// Closes the scope, ending its span and notifying observers before
    /// this function returns.
    ///
    /// If the innermost active span on the closing thread is the exit
    /// operator's own management span, that span is ended first, so it
    /// cannot outlive the scope it was closing.
    pub fn close(mut self) {
        if let Some(span) = self.span.take() {
            repair_current(ReservedOp::Exit);
            with_active_stack(|stack| stack.pop(&span));
            span.end();
        }
    }

    /// Ends the span without a repair pass and without touching this
    /// thread's active stack.
    ///
    /// This is the continuation-binder path: the resolving thread is in
    /// general not the opening thread, and whatever is on its stack belongs
    /// to the work it was doing when the result resolved. The opener's
    /// stack entry is pruned lazily.
    pub(crate) fn close_deferred(mut self) {
        if let Some(span) = self.span.take() {
            span.end();
        }
    }

    /// Whether the scope is still open.
    pub fn is_active(&self) -> bool {
        self.span.as_ref().is_some_and(|span| span.is_active())
    }

    #[cfg(test)]
    pub(crate) fn span_id(&self) -> Option<super::SpanId> {
        self.span.as_ref().map(|span| span.id())
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => f
                .debug_struct("ScopeHandle")
                .field("id", &span.id())
                .field("name", &span.name().as_str())
                .field("active", &span.is_active())
                .finish(),
            None => f.debug_struct("ScopeHandle").field("closed", &true).finish(),
        }
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        if let Some(span) = &self.span {
            if span.is_active() {
                scope_debug!(
                    name: "ScopeHandle.DroppedWithoutClose",
                    id = span.id().into_u64(),
                    scope = span.name().as_str()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::register_observer;
    use crate::testing::InMemoryScopeRecorder;
    use crate::trace::get_active_scope;

    fn require_send<T: Send>(_: &T) {}

    #[test]
    fn handles_are_send() {
        let scope = open_scope("scope::send");
        require_send(&scope);
        scope.close();
    }

    #[test]
    fn nested_scopes_parent_innermost() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let outer = open_scope("scope::nest_outer");
        let inner = open_scope("scope::nest_inner");
        inner.close();
        outer.close();

        let outer_data = &recorder.closed_named("scope::nest_outer")[0];
        let inner_data = &recorder.closed_named("scope::nest_inner")[0];
        assert_eq!(outer_data.parent_id, None);
        assert_eq!(inner_data.parent_id, Some(outer_data.id));
    }

    #[test]
    fn out_of_order_close_still_closes_each_once() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let first = open_scope("scope::ooo_first");
        let second = open_scope("scope::ooo_second");

        // Close the outer scope while the inner one is still open.
        first.close();
        second.close();

        assert_eq!(recorder.closed_named("scope::ooo_first").len(), 1);
        assert_eq!(recorder.closed_named("scope::ooo_second").len(), 1);

        // The thread's stack has fully unwound; a new scope starts a fresh
        // lineage.
        let fresh = open_scope("scope::ooo_fresh");
        fresh.close();
        assert_eq!(recorder.closed_named("scope::ooo_fresh")[0].parent_id, None);
    }

    #[test]
    fn enter_management_span_is_repaired_away() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let outer = open_scope("scope::repair_outer");
        let management = open_reserved(ReservedOp::Enter);
        let management_id = management.span_id().unwrap();

        let user = open_scope("scope::repair_user");

        // The management span ended before the user scope opened, and the
        // user scope parents to the management span's own parent.
        let management_closed = recorder.closed_seq(management_id).unwrap();
        let user_data = &recorder.opened_named("scope::repair_user")[0];
        let user_opened = recorder.opened_seq(user_data.id).unwrap();
        assert!(management_closed < user_opened);

        let outer_id = recorder.opened_named("scope::repair_outer")[0].id;
        assert_eq!(user_data.parent_id, Some(outer_id));
        assert!(!management.is_active());

        user.close();
        outer.close();
        drop(management);

        // Repair closed the management span exactly once.
        assert_eq!(
            recorder
                .events()
                .iter()
                .filter(|event| event.data.id == management_id)
                .count(),
            2 // one open, one close
        );
    }

    #[test]
    fn exit_management_span_cannot_outlive_the_target() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let target = open_scope("scope::exit_target");
        let target_id = target.span_id().unwrap();
        let management = open_reserved(ReservedOp::Exit);
        let management_id = management.span_id().unwrap();

        target.close();

        let management_closed = recorder.closed_seq(management_id).unwrap();
        let target_closed = recorder.closed_seq(target_id).unwrap();
        assert!(management_closed < target_closed);
        drop(management);
    }

    #[test]
    fn user_scope_with_reserved_looking_name_is_not_repaired() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        // The name matches the enter operator's text, but it is a user
        // scope, so repair must leave it alone.
        let decoy = open_scope(ReservedOp::Enter.name());
        let decoy_id = decoy.span_id().unwrap();
        let inner = open_scope("scope::decoy_inner");

        assert!(decoy.is_active());
        let inner_data = &recorder.opened_named("scope::decoy_inner")[0];
        assert_eq!(inner_data.parent_id, Some(decoy_id));

        inner.close();
        decoy.close();
    }

    #[test]
    fn close_on_another_thread_unwinds_the_opener() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let scope = open_scope("scope::cross_thread");
        std::thread::spawn(move || scope.close()).join().unwrap();

        assert_eq!(recorder.closed_named("scope::cross_thread").len(), 1);

        // The opener's stack prunes the ended entry on its next use.
        assert!(get_active_scope(|active| active.is_none()));
        let fresh = open_scope("scope::cross_fresh");
        fresh.close();
        assert_eq!(
            recorder.closed_named("scope::cross_fresh")[0].parent_id,
            None
        );
    }

    #[test]
    fn dropped_handle_leaves_scope_open() {
        let recorder = InMemoryScopeRecorder::default();
        let _guard = register_observer(recorder.clone());

        let scope = open_scope("scope::dropped");
        drop(scope);

        assert_eq!(recorder.opened_named("scope::dropped").len(), 1);
        assert_eq!(recorder.closed_named("scope::dropped").len(), 0);
    }

    #[test]
    fn observers_may_reenter_scope_operations() {
        #[derive(Debug)]
        struct Reentrant;

        impl crate::global::ScopeObserver for Reentrant {
            fn on_open(&self, _scope: &crate::trace::SpanData) {}

            fn on_close(&self, scope: crate::trace::SpanData) {
                if scope.name.as_str() == "scope::reenter_outer" {
                    open_scope("scope::reenter_inner").close();
                }
            }
        }

        let recorder = InMemoryScopeRecorder::default();
        let _recorder_guard = register_observer(recorder.clone());
        let _reentrant_guard = register_observer(Reentrant);

        open_scope("scope::reenter_outer").close();

        assert_eq!(recorder.closed_named("scope::reenter_outer").len(), 1);
        assert_eq!(recorder.closed_named("scope::reenter_inner").len(), 1);
    }
}
