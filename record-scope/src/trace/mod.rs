//! Scope lifetimes and their repair rules.
//!
//! A scope is opened with [`open_scope`], which returns a move-only
//! [`ScopeHandle`]. Closing the handle ends the scope and delivers its final
//! timing data to every registered observer. Handles may be closed on the
//! opening thread or carried to another thread first; each thread keeps its
//! own stack of active scopes for parenting.
//!
//! Opening and closing go through a repair pass: if the innermost active
//! span on the current thread is one of this crate's own management spans,
//! it is ended early so that it never becomes the structural parent of a
//! user scope (or outlives the scope it was managing). User scopes are never
//! repaired away, whatever they are named.
//!
//! ```
//! use record_scope::{open_scope, ScopeFutureExt};
//!
//! // Synchronous use: open, work, close.
//! let scope = open_scope("encode");
//! // ... traced work ...
//! scope.close();
//!
//! // Asynchronous use: the scope closes when the result resolves.
//! let scope = open_scope("load");
//! let fut = std::future::ready(42).close_scope_on_resolve(scope);
//! assert_eq!(futures_executor::block_on(fut), 42);
//! ```

use std::borrow::Cow;
use std::fmt;

mod future;
mod scope;
mod span;
mod stack;

pub use future::{CloseOnResolve, ScopeFutureExt};
pub use scope::{open_scope, ScopeHandle};
pub use span::{SpanData, SpanId};
pub use stack::{get_active_scope, SpanRef};

pub(crate) use scope::open_reserved;

/// Distinguishes caller-opened scopes from this crate's own management spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// A scope opened by user code.
    User,
    /// A span wrapped around one of this crate's own management operations.
    Internal,
}

/// The built-in management operations whose spans are subject to repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReservedOp {
    /// Opens a user scope and returns its handle.
    Enter,
    /// Consumes a handle and closes its scope.
    Exit,
    /// Binds a scope close to a pending result.
    CloseOnResolve,
}

impl ReservedOp {
    /// The exported operator name for this operation.
    pub fn name(&self) -> &'static str {
        match self {
            ReservedOp::Enter => "profiler.scope_enter",
            ReservedOp::Exit => "profiler.scope_exit",
            ReservedOp::CloseOnResolve => "profiler.scope_close_on_resolve",
        }
    }
}

impl fmt::Display for ReservedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The name attached to a span.
///
/// Reserved names tag this crate's own management spans. The repair pass
/// matches on the tag rather than on text, so a user scope is never mistaken
/// for a management span even if its name collides with a reserved one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpanName {
    /// One of the built-in management operations.
    Reserved(ReservedOp),
    /// A caller-supplied scope name.
    User(Cow<'static, str>),
}

impl SpanName {
    /// Text form of the name.
    pub fn as_str(&self) -> &str {
        match self {
            SpanName::Reserved(op) => op.name(),
            SpanName::User(name) => name,
        }
    }

    pub(crate) fn is_reserved(&self, op: ReservedOp) -> bool {
        matches!(self, SpanName::Reserved(tag) if *tag == op)
    }
}

impl fmt::Display for SpanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
