use std::cell::RefCell;
use std::sync::Arc;

use super::span::Span;
use super::{ScopeKind, SpanId, SpanName};
use crate::{scope_debug, scope_warn};

thread_local! {
    static ACTIVE_SCOPES: RefCell<ActiveSpanStack> = RefCell::new(ActiveSpanStack::new());
}

/// Runs `f` with this thread's active-span stack borrowed mutably.
///
/// `f` must not re-enter scope operations; the borrow is still held.
pub(crate) fn with_active_stack<T>(f: impl FnOnce(&mut ActiveSpanStack) -> T) -> T {
    ACTIVE_SCOPES.with(|stack| f(&mut stack.borrow_mut()))
}

/// The spans opened and not yet closed on this thread, innermost last.
///
/// A span closed on another thread is never removed from here by the closing
/// thread. Instead, ended entries are pruned off the top lazily on the next
/// operation that inspects this stack, so the opener's view repairs itself
/// without any cross-thread mutation of thread-local state.
pub(crate) struct ActiveSpanStack {
    stack: Vec<Arc<Span>>,
}

impl ActiveSpanStack {
    fn new() -> Self {
        ActiveSpanStack { stack: Vec::new() }
    }

    /// Drops ended spans off the top.
    fn prune(&mut self) {
        while self.stack.last().is_some_and(|top| !top.is_active()) {
            if let Some(span) = self.stack.pop() {
                scope_debug!(name: "ScopeStack.PrunedEndedScope", id = span.id().into_u64());
            }
        }
    }

    /// The innermost span still active on this thread.
    pub(crate) fn current(&mut self) -> Option<Arc<Span>> {
        self.prune();
        self.stack.last().cloned()
    }

    pub(crate) fn push(&mut self, span: Arc<Span>) {
        self.stack.push(span);
    }

    /// Removes `span` if it is the innermost active entry.
    ///
    /// An out-of-order close leaves the entry in place; it is pruned once it
    /// ends and reaches the top. A span that was already pruned, or that was
    /// never pushed on this thread, is ignored.
    pub(crate) fn pop(&mut self, span: &Arc<Span>) {
        self.prune();
        match self.stack.last() {
            Some(top) if Arc::ptr_eq(top, span) => {
                self.stack.pop();
            }
            _ => {
                if self.stack.iter().any(|entry| Arc::ptr_eq(entry, span)) {
                    scope_warn!(name: "ScopeStack.PopOutOfOrder", id = span.id().into_u64());
                } else {
                    scope_debug!(name: "ScopeStack.PopMissing", id = span.id().into_u64());
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.stack.len()
    }
}

/// A borrowed view of a span on the current thread's stack.
#[derive(Debug)]
pub struct SpanRef<'a>(&'a Arc<Span>);

impl SpanRef<'_> {
    /// The span's id.
    pub fn id(&self) -> SpanId {
        self.0.id()
    }

    /// The span's name.
    pub fn name(&self) -> &SpanName {
        self.0.name()
    }

    /// User scope or management span.
    pub fn kind(&self) -> ScopeKind {
        self.0.kind()
    }

    /// Id of the structural parent, if any.
    pub fn parent_id(&self) -> Option<SpanId> {
        self.0.parent_id()
    }
}

/// Calls `f` with the innermost scope still active on this thread, if any.
///
/// The thread's stack stays borrowed while `f` runs, so `f` must not open,
/// close, or query scopes itself.
///
/// ```
/// use record_scope::trace::get_active_scope;
///
/// let scope = record_scope::open_scope("outer");
/// let name = get_active_scope(|active| {
///     active.map(|span| span.name().as_str().to_owned())
/// });
/// assert_eq!(name.as_deref(), Some("outer"));
/// scope.close();
/// ```
pub fn get_active_scope<F, T>(f: F) -> T
where
    F: FnOnce(Option<SpanRef<'_>>) -> T,
{
    with_active_stack(|stack| {
        let current = stack.current();
        f(current.as_ref().map(SpanRef))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &'static str) -> Arc<Span> {
        Span::start(SpanName::User(name.into()), ScopeKind::User, None)
    }

    #[test]
    fn innermost_span_is_current() {
        let mut stack = ActiveSpanStack::new();
        assert!(stack.current().is_none());

        let outer = named("stack::outer");
        let inner = named("stack::inner");
        stack.push(outer.clone());
        stack.push(inner.clone());

        assert_eq!(stack.current().unwrap().id(), inner.id());
        stack.pop(&inner);
        assert_eq!(stack.current().unwrap().id(), outer.id());
        stack.pop(&outer);
        assert!(stack.current().is_none());
    }

    #[test]
    fn ended_spans_are_pruned() {
        let mut stack = ActiveSpanStack::new();
        let outer = named("stack::prune_outer");
        let inner = named("stack::prune_inner");
        stack.push(outer.clone());
        stack.push(inner.clone());

        // Simulates a close that happened on another thread: the span ends
        // without being popped here.
        inner.end();
        assert_eq!(stack.current().unwrap().id(), outer.id());
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn out_of_order_pop_is_deferred() {
        let mut stack = ActiveSpanStack::new();
        let outer = named("stack::ooo_outer");
        let inner = named("stack::ooo_inner");
        stack.push(outer.clone());
        stack.push(inner.clone());

        // Popping the non-top span leaves it on the stack.
        stack.pop(&outer);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.current().unwrap().id(), inner.id());

        // Once it ends and the top is gone, pruning clears it out.
        outer.end();
        stack.pop(&inner);
        assert!(stack.current().is_none());
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn pop_of_unknown_span_is_ignored() {
        let mut stack = ActiveSpanStack::new();
        let resident = named("stack::resident");
        let foreign = named("stack::foreign");
        stack.push(resident.clone());

        stack.pop(&foreign);
        assert_eq!(stack.current().unwrap().id(), resident.id());
    }

    #[test]
    fn fresh_thread_has_no_active_scope() {
        let none = std::thread::spawn(|| get_active_scope(|active| active.is_none()))
            .join()
            .unwrap();
        assert!(none);
    }
}
