use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use pin_project_lite::pin_project;

use super::scope::ScopeHandle;
use crate::Context;

/// The close work a binder owes, parked until the result resolves.
///
/// Captures the binding thread's context at construction; running the close
/// re-attaches that snapshot around the observer callbacks and restores the
/// resolving thread's own context afterwards, even if a callback unwinds.
#[derive(Debug)]
struct DeferredClose {
    handle: ScopeHandle,
    bind_cx: Context,
}

impl DeferredClose {
    fn new(handle: ScopeHandle) -> Self {
        DeferredClose {
            handle,
            bind_cx: Context::current(),
        }
    }

    fn run(self) {
        let _cx_guard = self.bind_cx.attach();
        self.handle.close_deferred();
    }
}

pin_project! {
    /// A future that closes a scope at the moment its inner future resolves.
    ///
    /// The wrapped future is otherwise untouched: its output is forwarded
    /// unchanged, and polls that return [`Poll::Pending`] do nothing to the
    /// scope. If the wrapper is dropped before resolving, the scope stays
    /// open.
    ///
    /// Created by [`ScopeFutureExt::close_scope_on_resolve`].
    #[derive(Debug)]
    pub struct CloseOnResolve<F> {
        #[pin]
        inner: F,
        pending_close: Option<DeferredClose>,
    }
}

impl<F> CloseOnResolve<F> {
    /// Binds `handle` to `inner`, capturing the current thread's context.
    pub fn new(handle: ScopeHandle, inner: F) -> Self {
        CloseOnResolve {
            inner,
            pending_close: Some(DeferredClose::new(handle)),
        }
    }
}

impl<F: Future> Future for CloseOnResolve<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(task_cx) {
            Poll::Ready(value) => {
                let close = this
                    .pending_close
                    .take()
                    .expect("CloseOnResolve polled after completion");
                close.run();
                Poll::Ready(value)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extension trait for binding a scope close to a future's resolution.
pub trait ScopeFutureExt: Sized {
    /// Closes `scope` when this future resolves, forwarding the output
    /// unchanged.
    ///
    /// The scope stays open for as long as the future is pending, however
    /// long that is and wherever it is polled. The close runs on the
    /// resolving thread, under the context that was current on the binding
    /// thread.
    ///
    /// ```
    /// use record_scope::{open_scope, ScopeFutureExt};
    ///
    /// let scope = open_scope("fetch");
    /// let fut = async { 7 }.close_scope_on_resolve(scope);
    /// assert_eq!(futures_executor::block_on(fut), 7);
    /// ```
    fn close_scope_on_resolve(self, scope: ScopeHandle) -> CloseOnResolve<Self>;
}

impl<F: Future> ScopeFutureExt for F {
    fn close_scope_on_resolve(self, scope: ScopeHandle) -> CloseOnResolve<Self> {
        CloseOnResolve::new(scope, self)
    }
}
