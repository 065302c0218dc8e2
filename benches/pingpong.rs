//! Round-trip latency of a synchronous method call from outside the runtime.

use criterion::{criterion_group, criterion_main, Criterion};

use coro_pool::{MethodService, Runtime, Scope, ServiceBody, StackSize};

struct Counter {
    hits: u64,
}

impl MethodService for Counter {}

impl Counter {
    fn hit(&mut self) -> u64 {
        self.hits += 1;
        self.hits
    }
}

fn call_roundtrip(c: &mut Criterion) {
    let rt = Runtime::start(2).unwrap();
    let h = rt
        .launch(
            "counter",
            StackSize::Small,
            ServiceBody::method(Counter { hits: 0 }),
        )
        .unwrap();

    c.bench_function("call_roundtrip", |b| {
        b.iter(|| rt.call(h, |s: &mut Counter, _: &Scope| s.hit()).unwrap())
    });

    rt.stop();
}

criterion_group!(benches, call_roundtrip);
criterion_main!(benches);
