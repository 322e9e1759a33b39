use record_scope::global::{register_observer, ScopeObserver};
use record_scope::trace::SpanData;
use record_scope::{open_scope, ScopeFutureExt};

mod throughput;

#[derive(Debug)]
struct NoOpObserver;

impl ScopeObserver for NoOpObserver {
    fn on_open(&self, _scope: &SpanData) {
        // No-op
    }

    fn on_close(&self, _scope: SpanData) {
        // No-op
    }
}

fn main() {
    let _guard = register_observer(NoOpObserver);
    throughput::test_throughput(test_bound_scope);
}

fn test_bound_scope() {
    let scope = open_scope("stress_bound");
    let fut = std::future::ready(1u64).close_scope_on_resolve(scope);
    futures_executor::block_on(fut);
}
