use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use relaychat_net::election::tie_set;
use relaychat_net::identity::IdentityPool;
use relaychat_net::protocol::{
    ClientMessage, RelayAddr, RosterEntry, ServerMessage, WireMessage,
};

fn bench_chat_encode(c: &mut Criterion) {
    let msg = ServerMessage::Chat {
        from_id: 42,
        from_name: "alice".to_string(),
        text: "x".repeat(64),
    };

    c.bench_function("chat_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_chat_decode(c: &mut Criterion) {
    let line = ClientMessage::Chat { text: "x".repeat(64), name: Some("alice".into()) }
        .encode()
        .unwrap();

    c.bench_function("chat_decode_64B", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&line)).unwrap()))
    });
}

fn bench_roster_encode(c: &mut Criterion) {
    let clients: Vec<RosterEntry> = (1..=100)
        .map(|id| RosterEntry {
            id,
            peer: RelayAddr::new("10.0.0.1", 10_000 + id as u16),
            name: format!("peer{id}"),
        })
        .collect();
    let msg = ServerMessage::ClientList { clients };

    c.bench_function("roster_encode_100", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_identity_churn(c: &mut Criterion) {
    c.bench_function("identity_churn_1K", |b| {
        b.iter(|| {
            let mut pool = IdentityPool::new();
            for _ in 0..1000 {
                pool.allocate();
            }
            for id in (1..=1000).step_by(3) {
                pool.release(id);
            }
            for _ in 0..500 {
                black_box(pool.allocate());
            }
        })
    });
}

fn bench_tie_set(c: &mut Criterion) {
    let scores: Vec<f64> = (0..64).map(|i| if i % 8 == 0 { 3.0 } else { 3.0 + i as f64 }).collect();

    c.bench_function("tie_set_64", |b| {
        b.iter(|| black_box(tie_set(black_box(&scores))))
    });
}

criterion_group!(
    benches,
    bench_chat_encode,
    bench_chat_decode,
    bench_roster_encode,
    bench_identity_churn,
    bench_tie_set,
);
criterion_main!(benches);
