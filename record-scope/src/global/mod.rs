//! Process-wide observer registration.
//!
//! Observers receive a callback whenever any scope in the process opens or
//! closes, regardless of which thread it happened on. Registration is
//! additive: every registered observer sees every event, and an observer
//! stays registered until the [`ObserverGuard`] returned at registration
//! time is dropped.
//!
//! ```
//! use record_scope::global::{register_observer, ScopeObserver};
//! use record_scope::trace::SpanData;
//!
//! #[derive(Debug)]
//! struct Printer;
//!
//! impl ScopeObserver for Printer {
//!     fn on_open(&self, scope: &SpanData) {
//!         println!("open {}", scope.name);
//!     }
//!     fn on_close(&self, scope: SpanData) {
//!         println!("close {}", scope.name);
//!     }
//! }
//!
//! let _guard = register_observer(Printer);
//! let scope = record_scope::open_scope("compute");
//! scope.close();
//! ```

mod internal_logging;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::scope_error;
use crate::trace::SpanData;

/// Receives open and close events for every scope in the process.
///
/// Callbacks run synchronously on the thread performing the scope operation,
/// so implementations should return quickly. The registry lock is not held
/// while callbacks run, which means an observer may itself open scopes or
/// register further observers without deadlocking.
pub trait ScopeObserver: Send + Sync + fmt::Debug + 'static {
    /// Called after a scope was opened and pushed on its thread's stack.
    fn on_open(&self, scope: &SpanData);

    /// Called exactly once when a scope ends, with its final timing data.
    fn on_close(&self, scope: SpanData);
}

struct RegisteredObserver {
    id: u64,
    observer: Arc<dyn ScopeObserver>,
}

static OBSERVERS: Lazy<RwLock<Vec<RegisteredObserver>>> = Lazy::new(Default::default);
static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Registers `observer` for all subsequent scope events.
///
/// The observer is removed again when the returned guard is dropped. Events
/// that are already in flight on other threads may still be delivered while
/// the guard is being dropped.
pub fn register_observer<T: ScopeObserver>(observer: T) -> ObserverGuard {
    let id = NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed);
    match OBSERVERS.write() {
        Ok(mut observers) => observers.push(RegisteredObserver {
            id,
            observer: Arc::new(observer),
        }),
        Err(_) => {
            scope_error!(name: "Observer.Register.LockPoisoned");
        }
    }
    ObserverGuard { id }
}

/// Keeps an observer registered for as long as it is alive.
#[derive(Debug)]
#[must_use = "dropping the guard unregisters the observer"]
pub struct ObserverGuard {
    id: u64,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Ok(mut observers) = OBSERVERS.write() {
            observers.retain(|entry| entry.id != self.id);
        }
    }
}

fn snapshot() -> Vec<Arc<dyn ScopeObserver>> {
    OBSERVERS
        .read()
        .map(|observers| observers.iter().map(|entry| entry.observer.clone()).collect())
        .unwrap_or_default()
}

pub(crate) fn notify_open(scope: &SpanData) {
    for observer in snapshot() {
        observer.on_open(scope);
    }
}

pub(crate) fn notify_close(scope: SpanData) {
    let observers = snapshot();
    match observers.as_slice() {
        [] => {}
        [observer] => observer.on_close(scope),
        observers => {
            for observer in observers {
                observer.on_close(scope.clone());
            }
        }
    }
}
