//! Rule evaluation and event fan-out throughput.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowctl::events::{EventBus, FlowChange};
use flowctl::flow::{Flow, FlowId, FlowRequest, Stage};
use flowctl::metrics::Metrics;
use flowctl::rules::{Rule, RuleAction, RuleEngine, RulePattern};
use flowctl::throttle::ThrottleProfile;
use std::sync::Arc;

fn rule_set(count: usize) -> Vec<Rule> {
    (0..count)
        .map(|i| {
            let action = match i % 3 {
                0 => RuleAction::Block,
                1 => RuleAction::BreakpointRequest,
                _ => RuleAction::Throttle(ThrottleProfile {
                    latency_ms: 50,
                    ..Default::default()
                }),
            };
            Rule::new(RulePattern::host(&format!("*.service{}.example.com", i)), action, i as i32)
        })
        .collect()
}

fn flow(url: &str) -> Flow {
    let mut flow = Flow::new(FlowId::new("bench"));
    flow.request = FlowRequest::new("GET", url).with_header("accept", "application/json");
    flow
}

fn bench_rule_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("RuleEngine");

    for count in [10, 100, 1000] {
        let engine = RuleEngine::new();
        engine.set_rules(rule_set(count)).unwrap();
        let miss = flow("https://unmatched.example.org/path");
        let hit = flow(&format!("https://api.service{}.example.com/v1", count - 1));

        group.bench_with_input(BenchmarkId::new("no_match", count), &miss, |b, flow| {
            b.iter(|| black_box(engine.evaluate(black_box(flow), Stage::Request)))
        });
        group.bench_with_input(BenchmarkId::new("last_rule_matches", count), &hit, |b, flow| {
            b.iter(|| black_box(engine.evaluate(black_box(flow), Stage::Request)))
        });
    }

    group.finish();
}

fn bench_event_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("EventBus");
    let flow = flow("https://example.com/");

    for subscribers in [1, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("publish", subscribers),
            &subscribers,
            |b, &subscribers| {
                let bus = EventBus::new(1024, Arc::new(Metrics::new()));
                let mut subs: Vec<_> = (0..subscribers).map(|_| bus.subscribe()).collect();
                b.iter(|| {
                    bus.publish_flow(FlowChange::RequestReceived, black_box(&flow));
                    for sub in subs.iter_mut() {
                        black_box(sub.try_recv());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_rule_evaluation, bench_event_fan_out);
criterion_main!(benches);
