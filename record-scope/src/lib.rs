//! Lifetime management for profiling scopes.
//!
//! A *scope* marks a region of work whose wall-clock extent should be
//! visible to profiling observers. [`open_scope`] starts one and returns a
//! move-only [`ScopeHandle`]; closing the handle ends the scope and delivers
//! its timing data to every observer registered through
//! [`global::register_observer`]. Scopes nest per thread, and each new scope
//! records the innermost scope still active on its thread as its structural
//! parent.
//!
//! ```
//! use record_scope::open_scope;
//!
//! let scope = open_scope("render");
//! let inner = open_scope("render::shadows"); // parented under "render"
//! inner.close();
//! scope.close();
//! ```
//!
//! # Scopes over pending results
//!
//! Work that completes through a future should not close its scope when the
//! function returns, but when the result actually resolves.
//! [`ScopeFutureExt::close_scope_on_resolve`] binds a handle to a future:
//! the scope stays open across every pending poll, closes at the moment of
//! resolution on whichever thread that happens, and the resolved value is
//! forwarded unchanged. The close runs under the context that was current
//! on the binding thread (see [`Context`]), so observers see the ambient
//! values of the code that bound the scope, not of the executor thread
//! that happened to resolve it.
//!
//! ```
//! use record_scope::{open_scope, ScopeFutureExt};
//!
//! let scope = open_scope("fetch");
//! let fut = async { "payload" }.close_scope_on_resolve(scope);
//! assert_eq!(futures_executor::block_on(fut), "payload");
//! ```
//!
//! # Operator surface
//!
//! Embedders that drive scopes from an interpreter use the operators in
//! [`ops`] instead of the Rust API. The operators run inside reserved
//! management spans, and the scope layer's repair pass keeps those spans
//! from ever becoming parents of, or outliving, the user scopes they
//! manage.
//!
//! # Crate feature flags
//!
//! * `internal-logs` (default): routes this crate's own diagnostics through
//!   `tracing`.
//! * `testing`: exposes the in-memory recorder in [`testing`] to downstream
//!   test suites.

#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

pub mod global;

mod context;

pub use context::{Context, ContextGuard};

pub mod ops;

pub mod trace;

pub use trace::{open_scope, CloseOnResolve, ScopeFutureExt, ScopeHandle, ScopeKind};

#[cfg(any(feature = "testing", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
