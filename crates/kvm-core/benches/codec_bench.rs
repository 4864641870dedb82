//! Criterion benchmarks for the session envelope codec.
//!
//! Input events sit on the latency-critical path, so the interesting numbers
//! are the encode and decode times of INPUT_EVENT and HEARTBEAT envelopes.
//!
//! Run with:
//! ```bash
//! cargo bench --package kvm-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvm_core::protocol::{
    capabilities, decode_envelope, encode_envelope, AuthMessage, HelloMessage, InputEvent,
    Message, ModifierFlags, MouseButton, SessionId, PROTOCOL_VERSION,
};
use uuid::Uuid;

// ── Message fixtures ──────────────────────────────────────────────────────────

fn fixtures() -> Vec<(&'static str, Message)> {
    vec![
        ("Heartbeat", Message::Heartbeat { token: 42 }),
        (
            "KeyEvent",
            Message::InputEvent(InputEvent::key(
                0x04,
                true,
                ModifierFlags(ModifierFlags::SHIFT),
                1_000,
            )),
        ),
        (
            "MouseMove",
            Message::InputEvent(InputEvent::mouse_move(960, 540, 1_000)),
        ),
        (
            "MouseButton",
            Message::InputEvent(InputEvent::mouse_button(
                960,
                540,
                MouseButton::Left,
                true,
                1_000,
            )),
        ),
        (
            "Hello",
            Message::Hello(HelloMessage {
                protocol_version: PROTOCOL_VERSION,
                node_id: Uuid::new_v4(),
                name: "bench-host".to_string(),
                capabilities: capabilities::DEFAULT,
            }),
        ),
        (
            "AuthChallenge",
            Message::Auth(AuthMessage::Challenge { nonce: [7u8; 32] }),
        ),
    ]
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let session = Some(SessionId::generate());
    let mut group = c.benchmark_group("encode_envelope");
    for (name, msg) in fixtures() {
        group.bench_with_input(BenchmarkId::new("msg", name), &msg, |b, msg| {
            b.iter(|| encode_envelope(PROTOCOL_VERSION.major, session, black_box(7), black_box(msg)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let session = Some(SessionId::generate());
    let mut group = c.benchmark_group("decode_envelope");
    for (name, msg) in fixtures() {
        let bytes = encode_envelope(PROTOCOL_VERSION.major, session, 7, &msg)
            .expect("fixture must encode");
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_envelope(black_box(bytes)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
