use std::sync::{Arc, Mutex};

use super::*;
use crate::global::{register_observer, ScopeObserver};
use crate::trace::SpanData;

// Ambient values the way embedders carry them: a newtype per concern, since
// entries are keyed by type.
#[derive(Clone, Debug, PartialEq)]
struct RequestId(u64);
#[derive(Clone, Debug, PartialEq)]
struct Stage(&'static str);

#[test]
fn snapshots_never_see_later_writes() {
    let base = Context::new();
    let with_request = base.with_value(RequestId(7));

    // Writes build new contexts; the source is untouched.
    assert_eq!(base.get::<RequestId>(), None);
    assert_eq!(with_request.get::<RequestId>(), Some(&RequestId(7)));

    // Layering keeps earlier values visible without disturbing the source.
    let with_stage = with_request.with_value(Stage("resolve"));
    assert_eq!(with_request.get::<Stage>(), None);
    assert_eq!(with_stage.get::<RequestId>(), Some(&RequestId(7)));
    assert_eq!(with_stage.get::<Stage>(), Some(&Stage("resolve")));
}

#[test]
fn a_held_snapshot_outlives_context_churn() {
    let _request_guard = Context::new().with_value(RequestId(1)).attach();

    // What the binder does at bind time.
    let bind_cx = Context::current();

    {
        let _churn_guard = Context::current_with_value(RequestId(2)).attach();
        assert_eq!(Context::current().get::<RequestId>(), Some(&RequestId(2)));
        // The snapshot still reads the bind-time value.
        assert_eq!(bind_cx.get::<RequestId>(), Some(&RequestId(1)));
    }

    // Re-attaching the snapshot restores the bind-time view, which is what
    // the deferred close does on the resolving thread.
    let _reattach_guard = bind_cx.attach();
    assert_eq!(Context::current().get::<RequestId>(), Some(&RequestId(1)));
}

#[test]
fn observers_read_the_attached_context_during_close() {
    #[derive(Debug)]
    struct AmbientReader {
        seen: Arc<Mutex<Option<(Stage, RequestId)>>>,
    }

    impl ScopeObserver for AmbientReader {
        fn on_open(&self, _scope: &SpanData) {}

        fn on_close(&self, scope: SpanData) {
            if scope.name.as_str() == "context::ambient" {
                *self.seen.lock().unwrap() = Context::map_current(|cx| {
                    Some((cx.get::<Stage>()?.clone(), cx.get::<RequestId>()?.clone()))
                });
            }
        }
    }

    let seen = Arc::new(Mutex::new(None));
    let _observer_guard = register_observer(AmbientReader { seen: seen.clone() });

    // One value attached fresh, one layered onto it, with the scope closed
    // while both guards are still held.
    let _stage_guard = Context::new().with_value(Stage("encode")).attach();
    let _request_guard = Context::current_with_value(RequestId(11)).attach();
    crate::open_scope("context::ambient").close();

    assert_eq!(
        *seen.lock().unwrap(),
        Some((Stage("encode"), RequestId(11)))
    );
}

#[test]
fn guards_restore_even_when_dropped_out_of_order() {
    // A deferred close attaches its snapshot on a thread that already holds
    // guards of its own; nothing forces the two to nest.
    let resolver_guard = Context::new().with_value(Stage("resolver")).attach();
    let close_guard = Context::new().with_value(Stage("close")).attach();
    assert_eq!(Context::current().get::<Stage>(), Some(&Stage("close")));

    // The older guard going first must not clobber the newer context.
    drop(resolver_guard);
    assert_eq!(Context::current().get::<Stage>(), Some(&Stage("close")));

    drop(close_guard);
    assert_eq!(Context::current().get::<Stage>(), None);
}

#[test]
fn new_threads_start_from_the_empty_context() {
    let _binder_guard = Context::new().with_value(RequestId(40)).attach();
    assert_eq!(Context::current().get::<RequestId>(), Some(&RequestId(40)));

    // A resolver thread sees none of the binding thread's values until a
    // snapshot is explicitly attached there.
    let (clean, reattached) = std::thread::spawn(|| {
        let clean = Context::current().get::<RequestId>().is_none();
        let _snapshot_guard = Context::new().with_value(RequestId(41)).attach();
        let reattached = Context::current().get::<RequestId>() == Some(&RequestId(41));
        (clean, reattached)
    })
    .join()
    .unwrap();
    assert!(clean);
    assert!(reattached);
}

#[test]
fn positional_pops_only_restore_at_the_top() {
    let mut stack = ContextStack::default();
    let first = stack.push(Context::new().with_value(RequestId(1)));
    let second = stack.push(Context::new().with_value(RequestId(2)));
    let third = stack.push(Context::new().with_value(RequestId(3)));

    // A pop below the top defers; the newest context stays current.
    stack.pop_id(second);
    assert_eq!(stack.current_cx.get::<RequestId>(), Some(&RequestId(3)));

    // Popping the top skips the vacated slot and lands on the first.
    stack.pop_id(third);
    assert_eq!(stack.current_cx.get::<RequestId>(), Some(&RequestId(1)));

    stack.pop_id(first);
    assert_eq!(stack.current_cx.get::<RequestId>(), None);
    assert!(stack.stack.is_empty());
}

#[test]
fn reserved_and_stale_positions_are_ignored() {
    let mut stack = ContextStack::default();
    let kept = stack.push(Context::new().with_value(Stage("kept")));

    // The base slot, the overflow sentinel, and positions beyond the stack
    // must all be no-ops.
    stack.pop_id(ContextStack::BASE_POS);
    stack.pop_id(ContextStack::MAX_POS);
    stack.pop_id(kept + 1);
    assert_eq!(stack.current_cx.get::<Stage>(), Some(&Stage("kept")));

    stack.pop_id(kept);
    assert_eq!(stack.current_cx.get::<Stage>(), None);
}

#[test]
fn overflow_attaches_fail_without_touching_the_current_context() {
    let mut stack = ContextStack::default();
    for expected in 1..ContextStack::MAX_POS {
        let pos = stack.push(Context::new().with_value(RequestId(u64::from(expected))));
        assert_eq!(pos, expected);
    }
    let deepest = u64::from(ContextStack::MAX_POS) - 1;
    assert_eq!(stack.current_cx.get::<RequestId>(), Some(&RequestId(deepest)));

    // The stack is full: further pushes report the sentinel position and
    // leave the current context alone.
    let overflow = stack.push(Context::new().with_value(Stage("rejected")));
    assert_eq!(overflow, ContextStack::MAX_POS);
    assert_eq!(stack.current_cx.get::<Stage>(), None);
    assert_eq!(stack.current_cx.get::<RequestId>(), Some(&RequestId(deepest)));

    // Guards at the sentinel position do not pop; freeing a real slot makes
    // room again.
    stack.pop_id(ContextStack::MAX_POS);
    stack.pop_id(ContextStack::MAX_POS - 1);
    let freed = stack.push(Context::new().with_value(Stage("retry")));
    assert_eq!(freed, ContextStack::MAX_POS - 1);
    assert_eq!(stack.current_cx.get::<Stage>(), Some(&Stage("retry")));
}
