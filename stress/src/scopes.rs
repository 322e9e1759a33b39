use record_scope::global::{register_observer, ScopeObserver};
use record_scope::open_scope;
use record_scope::trace::SpanData;

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
    throughput::test_throughput(test_scope);
}

fn test_scope() {
    let outer = open_scope("stress_outer");
    let inner = open_scope("stress_inner");
    inner.close();
    outer.close();
}
