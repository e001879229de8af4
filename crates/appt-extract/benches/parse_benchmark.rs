//! Reply Parser Benchmarks
//!
//! Measures how quickly generation replies are reduced to their object:
//! - clean JSON
//! - JSON wrapped in prose and fences
//! - long chatty replies with the object near the end

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use appt_extract::{locate_object, parse_reply};

const CLEAN: &str = r#"{"title": "Dentist", "date": "2025-03-14", "time": "09:30", "duration_minutes": 30, "confidence": 0.92}"#;

const WRAPPED: &str = "Sure! Here is the appointment:\n```json\n{\"title\": \"Dentist\", \"date\": \"2025-03-14\", \"time\": \"09:30\", \"description\": \"Bring {forms}\", \"confidence\": 0.9}\n```\nLet me know if you need anything else!";

fn chatty_reply(padding: usize) -> String {
    let mut reply = String::new();
    for i in 0..padding {
        reply.push_str(&format!("Line {} of preamble with a stray {{ brace. ", i));
    }
    reply.push_str(CLEAN);
    reply.push_str(" Anything else?");
    reply
}

fn bench_parse_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_reply");

    group.bench_function("clean", |b| b.iter(|| parse_reply(black_box(CLEAN))));
    group.bench_function("wrapped", |b| b.iter(|| parse_reply(black_box(WRAPPED))));

    for padding in [10, 50, 200] {
        let reply = chatty_reply(padding);
        group.throughput(Throughput::Bytes(reply.len() as u64));
        group.bench_with_input(BenchmarkId::new("chatty", padding), &reply, |b, reply| {
            b.iter(|| locate_object(black_box(reply)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_reply);
criterion_main!(benches);
