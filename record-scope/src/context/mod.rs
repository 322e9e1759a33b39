//! Execution-scoped context propagation.
//!
//! A [`Context`] is an immutable, typed bag of values associated with the
//! current thread of execution. The continuation binder snapshots the
//! context at bind time and re-attaches it around the deferred scope close,
//! so observers see the same ambient values they would have seen had the
//! scope been closed synchronously on the binding thread.

use crate::scope_warn;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(test)]
mod tests;

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// An execution-scoped collection of values.
///
/// Contexts are immutable. Write operations return a new context containing
/// the original values plus the new ones, leaving the source untouched. A
/// context becomes the thread's current context via [`attach`], and the
/// previous context is restored when the returned [`ContextGuard`] drops.
///
/// [`attach`]: Context::attach()
///
/// # Examples
///
/// ```
/// use record_scope::Context;
///
/// // Application-specific values
/// #[derive(Debug, PartialEq)]
/// struct Stage(&'static str);
/// #[derive(Debug, PartialEq)]
/// struct WorkerId(u64);
///
/// let _outer_guard = Context::new().with_value(Stage("load")).attach();
///
/// // Only the stage has been set
/// let current = Context::current();
/// assert_eq!(current.get::<Stage>(), Some(&Stage("load")));
/// assert_eq!(current.get::<WorkerId>(), None);
///
/// {
///     let _inner_guard = Context::current_with_value(WorkerId(42)).attach();
///     // Both values are visible in the inner context
///     let current = Context::current();
///     assert_eq!(current.get::<Stage>(), Some(&Stage("load")));
///     assert_eq!(current.get::<WorkerId>(), Some(&WorkerId(42)));
/// }
///
/// // Back to only the stage once the inner guard is dropped
/// let current = Context::current();
/// assert_eq!(current.get::<Stage>(), Some(&Stage("load")));
/// assert_eq!(current.get::<WorkerId>(), None);
/// ```
#[derive(Clone, Default)]
pub struct Context {
    entries: Option<Arc<EntryMap>>,
}

type EntryMap = HashMap<TypeId, Arc<dyn Any + Sync + Send>, BuildHasherDefault<IdHasher>>;

impl Context {
    /// Creates an empty `Context`.
    ///
    /// The context is initially created with a capacity of 0, so it will not
    /// allocate. Use [`with_value`] to create a new context that has entries.
    ///
    /// [`with_value`]: Context::with_value()
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns an immutable snapshot of the current thread's context.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context, returning its value.
    ///
    /// This avoids the clone that [`Context::current`] performs when all that
    /// is needed is a read of the current context.
    ///
    /// Note: This function will panic if you attempt to attach another context
    /// while the current one is still borrowed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| cx.borrow().map_current_cx(f))
    }

    /// Returns a clone of the current thread's context with the given value.
    ///
    /// This is a more efficient form of `Context::current().with_value(value)`
    /// as it avoids the intermediate context clone.
    pub fn current_with_value<T: 'static + Send + Sync>(value: T) -> Self {
        Self::map_current(|cx| cx.with_value(value))
    }

    /// Returns a reference to the entry for the corresponding value type.
    ///
    /// # Examples
    ///
    /// ```
    /// use record_scope::Context;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct Stage(&'static str);
    /// #[derive(Debug, PartialEq)]
    /// struct Missing();
    ///
    /// let cx = Context::new().with_value(Stage("load"));
    ///
    /// // Values can be queried by type
    /// assert_eq!(cx.get::<Stage>(), Some(&Stage("load")));
    ///
    /// // And return none if not yet set
    /// assert_eq!(cx.get::<Missing>(), None);
    /// ```
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .as_ref()?
            .get(&TypeId::of::<T>())?
            .downcast_ref()
    }

    /// Returns a copy of the context with the new value included.
    ///
    /// Storing application-specific newtypes rather than bare primitives
    /// avoids unintentionally overwriting entries from unrelated code, since
    /// values are keyed by type.
    pub fn with_value<T: 'static + Send + Sync>(&self, value: T) -> Self {
        let entries = if let Some(current_entries) = &self.entries {
            let mut inner_entries = (**current_entries).clone();
            inner_entries.insert(TypeId::of::<T>(), Arc::new(value));
            Some(Arc::new(inner_entries))
        } else {
            let mut entries = EntryMap::default();
            entries.insert(TypeId::of::<T>(), Arc::new(value));
            Some(Arc::new(entries))
        };
        Context { entries }
    }

    /// Replaces the current context on this thread with this context.
    ///
    /// Dropping the returned [`ContextGuard`] resets the current context to
    /// the previous value. Guards may drop out of order; the stack tolerates
    /// that and restores each prior context once it becomes the top again.
    ///
    /// # Examples
    ///
    /// ```
    /// use record_scope::Context;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct Stage(&'static str);
    ///
    /// let my_cx = Context::new().with_value(Stage("load"));
    ///
    /// // Set the current thread context
    /// let cx_guard = my_cx.attach();
    /// assert_eq!(Context::current().get::<Stage>(), Some(&Stage("load")));
    ///
    /// // Drop the guard to restore the previous context
    /// drop(cx_guard);
    /// assert_eq!(Context::current().get::<Stage>(), None);
    /// ```
    pub fn attach(self) -> ContextGuard {
        let cx_id = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos: cx_id,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.as_ref().map_or(0, |e| e.len());
        f.debug_struct("Context")
            .field("entries count", &entries)
            .finish()
    }
}

/// A guard that resets the current context to the prior context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    // The position of the context in the stack. This is used to pop the context.
    cx_pos: u16,
    // Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let id = self.cx_pos;
        if id > ContextStack::BASE_POS && id < ContextStack::MAX_POS {
            CURRENT_CONTEXT.with(|context_stack| context_stack.borrow_mut().pop_id(id));
        }
    }
}

/// With TypeIds as keys, there's no need to hash them. They are already hashes
/// themselves, coming from the compiler. The IdHasher holds the u64 of
/// the TypeId, and then returns it, instead of doing any bit fiddling.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("TypeId calls write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}

/// A stack for keeping track of the [`Context`] instances that have been
/// attached to a thread.
///
/// The stack supports popping contexts by position, which is what makes out
/// of order dropping of [`ContextGuard`] instances safe. Only when the top
/// of the stack is popped is the previous [`Context`] actually restored.
///
/// The stack relies on being thread local: the [`ContextGuard`] instances
/// holding positions from it cannot move to other threads, so the positions
/// are always valid and within the bounds of this stack.
struct ContextStack {
    /// The [`Context`] currently active on this thread, and the top of the
    /// stack. It is always present; when `stack` is empty this is the empty
    /// [`Context`].
    ///
    /// Keeping it outside the `Vec` gives fast access to the current context.
    current_cx: Context,
    /// The other contexts that have been attached to the thread, oldest first.
    stack: Vec<Option<Context>>,
    /// Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const MAX_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: Context) -> u16 {
        // The next id is the length of the `stack`, plus one since we have the
        // top of the [`ContextStack`] as the `current_cx`.
        let next_id = self.stack.len() + 1;
        if next_id < ContextStack::MAX_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_id as u16
        } else {
            // This is an overflow, log it and ignore it.
            scope_warn!(
                name: "Context.AttachFailed",
                message = format!("Too many contexts. Max limit is {}. \
                  Context::current() remains unchanged as this attach failed. \
                  Dropping the returned ContextGuard will have no impact on Context::current().",
                  ContextStack::MAX_POS)
            );
            ContextStack::MAX_POS
        }
    }

    #[inline(always)]
    fn pop_id(&mut self, pos: u16) {
        if pos == ContextStack::BASE_POS || pos == ContextStack::MAX_POS {
            // The empty context is always at the bottom of the [`ContextStack`]
            // and cannot be popped, and the overflow position is invalid, so do
            // nothing.
            scope_warn!(
                name: "Context.OutOfOrderDrop",
                position = pos,
                message = if pos == ContextStack::BASE_POS {
                    "Attempted to pop the base context which is not allowed"
                } else {
                    "Attempted to pop the overflow position which is not allowed"
                }
            );
            return;
        }
        let len: u16 = self.stack.len() as u16;
        // Are we at the top of the [`ContextStack`]?
        if pos == len {
            // Shrink the stack if possible to clear out any out of order pops.
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            // Restore the previous context. This will always happen since the
            // empty context is always at the bottom of the stack if the
            // [`ContextStack`] is not empty.
            if let Some(Some(next_cx)) = self.stack.pop() {
                self.current_cx = next_cx;
            }
        } else {
            // This is an out of order pop.
            if pos >= len {
                // This is an invalid id, ignore it.
                scope_warn!(
                    name: "Context.PopOutOfBounds",
                    position = pos,
                    stack_length = len,
                    message = "Attempted to pop beyond the end of the context stack"
                );
                return;
            }
            // Clear out the entry at the given id.
            _ = self.stack[pos as usize].take();
        }
    }

    #[inline(always)]
    fn map_current_cx<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.current_cx)
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: Context::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
            _marker: PhantomData,
        }
    }
}
