//! Benchmark: packed-cell point ops vs word-range bulk ops.
//!
//! Measures the three paths the allocator leans on: point `set`/`get`
//! stamping, the `seek_empty_cell_range` word-mask scan used by the
//! reference allocator, and word-range serialization used by the flush
//! path.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use shale_bitmap::PackedBitmap;

/// Build a realistic 64Ki-block bitmap: 4-bit cells, ~5% allocated in
/// clusters of 32.
fn make_bitmap() -> PackedBitmap {
    let mut bitmap = PackedBitmap::new(65536, 4);
    let mut pos = 100_u64;
    while pos + 32 < 65536 {
        for index in pos..pos + 32 {
            bitmap.set(index, 1);
        }
        pos += 650;
    }
    bitmap
}

fn bench_point_ops(c: &mut Criterion) {
    let mut bitmap = make_bitmap();

    let mut group = c.benchmark_group("point_ops");

    group.bench_function("set", |b| {
        b.iter(|| bitmap.set(black_box(32000), black_box(2)));
    });

    group.bench_function("get", |b| {
        b.iter(|| black_box(bitmap.get(black_box(32000))));
    });

    group.finish();
}

fn bench_seek_empty(c: &mut Criterion) {
    let bitmap = make_bitmap();

    let mut group = c.benchmark_group("seek_empty_cell_range");

    // Short probe inside one word.
    group.bench_function("len_8", |b| {
        b.iter(|| black_box(bitmap.seek_empty_cell_range(black_box(140), 8)));
    });

    // Long scan across many words.
    group.bench_function("len_4096", |b| {
        b.iter(|| black_box(bitmap.seek_empty_cell_range(black_box(16384), 4096)));
    });

    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let bitmap = make_bitmap();
    let words = bitmap.total_words();

    c.bench_function("serialize_all_words", |b| {
        b.iter(|| black_box(bitmap.serialize_range(0, black_box(words))));
    });
}

fn bench_deserialize(c: &mut Criterion) {
    let bitmap = make_bitmap();
    let words = bitmap.total_words();
    let bytes = bitmap.serialize_range(0, words);

    c.bench_function("deserialize_all_words", |b| {
        let mut target = PackedBitmap::new(65536, 4);
        b.iter(|| target.deserialize_range(black_box(&bytes), 0, words));
    });
}

criterion_group!(
    benches,
    bench_point_ops,
    bench_seek_empty,
    bench_serialize,
    bench_deserialize,
);
criterion_main!(benches);
