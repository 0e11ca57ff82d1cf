//! Criterion benchmarks for slot-addressed result extraction.
//!
//! Batch shapes follow typical decode configurations: up to 256 slots,
//! one to four samples per slot.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::Device;
use jetstream_core::{ResultTokens, SlotSample};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a host buffer with `slots * samples_per_slot` one-token rows.
fn make_result(slots: usize, samples_per_slot: usize) -> ResultTokens {
    let rows: Vec<SlotSample> = (0..slots * samples_per_slot)
        .map(|i| {
            SlotSample::single(i as u32 % 32_000, i % 7 != 0, i % 512)
                .with_log_prob(vec![-(i as f32 % 5.0)])
        })
        .collect();
    ResultTokens::from_samples(&rows, samples_per_slot, &Device::Cpu)
        .expect("failed to build result buffer")
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_get_result_at_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_result_at_slot");

    for &(slots, samples) in &[(32, 1), (256, 1), (64, 4)] {
        let result = make_result(slots, samples);
        group.bench_with_input(
            BenchmarkId::new("slots_x_samples", format!("{slots}x{samples}")),
            &slots,
            |b, &slots| {
                b.iter(|| {
                    for slot in 0..slots {
                        black_box(result.get_result_at_slot(black_box(slot)).unwrap());
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_get_result_at_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_result_at_slots");

    for &(slots, samples) in &[(32, 1), (256, 1), (64, 4)] {
        let result = make_result(slots, samples);
        let every_other: Vec<usize> = (0..slots).step_by(2).collect();
        group.bench_with_input(
            BenchmarkId::new("slots_x_samples", format!("{slots}x{samples}")),
            &every_other,
            |b, picked| {
                b.iter(|| black_box(result.get_result_at_slots(black_box(picked)).unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_to_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_data_to_samples");

    for &slots in &[32, 256] {
        let result = make_result(slots, 1);
        let all: Vec<usize> = (0..slots).collect();
        let data = result.get_result_at_slots(&all).unwrap();
        group.bench_with_input(BenchmarkId::new("slots", slots), &slots, |b, _| {
            b.iter(|| black_box(data.to_samples().unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    result_tokens,
    bench_get_result_at_slot,
    bench_get_result_at_slots,
    bench_to_samples,
);

criterion_main!(result_tokens);
