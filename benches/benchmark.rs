use criterion::{black_box, criterion_group, criterion_main, Criterion};
use extension_hub::event::listener::ListenerMatcher;
use extension_hub::shared_state::SharedState;
use extension_hub::{event_source, event_type, Event, EventData};

fn bench_listener_matching(c: &mut Criterion) {
    let matchers = [
        ListenerMatcher::standard(event_type::CUSTOM, event_source::REQUEST_CONTENT),
        ListenerMatcher::standard(event_type::CUSTOM, event_source::WILDCARD),
        ListenerMatcher::standard(event_type::WILDCARD, event_source::WILDCARD),
        ListenerMatcher::standard(event_type::IDENTITY, event_source::NONE),
    ];
    let event = Event::new("bench", event_type::CUSTOM, event_source::REQUEST_CONTENT, None);

    c.bench_function("match event against listeners", |b| {
        b.iter(|| matchers.iter().filter(|m| m.matches(black_box(&event))).count())
    });
}

fn bench_shared_state_resolve(c: &mut Criterion) {
    let state = SharedState::new("bench");
    for position in (0..10_000u64).step_by(10) {
        let mut data = EventData::new();
        data.insert("position".to_string(), serde_json::json!(position));
        let _ = state.set(position, data);
    }

    c.bench_function("resolve shared state mid history", |b| {
        b.iter(|| state.resolve(black_box(5_005)))
    });
    c.bench_function("resolve last set at head", |b| {
        b.iter(|| state.resolve_last_set(black_box(u64::MAX)))
    });
}

criterion_group!(benches, bench_listener_matching, bench_shared_state_resolve);
criterion_main!(benches);
