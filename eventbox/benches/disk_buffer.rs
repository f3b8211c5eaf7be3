//! Microbenchmarks for the paging path.
//!
//! Measures buffered saves against a real container file, cache hits, and
//! filling a file-backed tree.
//!
//! Run with: `cargo bench -p eventbox -- disk_buffer`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use eventbox::controller::BoxController;
use eventbox::disk_buffer::DiskBuffer;
use eventbox::file_io::FileBoxIo;
use eventbox::io::BoxControllerIo;
use eventbox::tree::{BoxNode, Extent, MdEvent};
use tempfile::tempdir;

/// Opens a lean 3-d container and wraps it in a buffer of `size` blocks.
fn setup_buffer(size: usize) -> (DiskBuffer, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut io = FileBoxIo::new(3);
    io.set_data_type(4, "MDLeanEvent").unwrap();
    io.open_file(&temp_dir.path().join("bench.evbx"), "w")
        .unwrap();
    (
        DiskBuffer::with_write_buffer_size(Box::new(io), size),
        temp_dir,
    )
}

fn block(n_events: usize) -> Vec<f64> {
    (0..n_events * 5).map(|i| i as f64 * 0.5).collect()
}

fn bench_save_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("disk_buffer/save_block");

    for size in [0, 16, 256] {
        let (mut buffer, _dir) = setup_buffer(size);
        let data = block(64);
        let mut id = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                // Cycle through a fixed set of boxes so the file stops growing.
                id = (id + 1) % 1024;
                buffer.save_block(black_box(id), data.clone()).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_load_hit(c: &mut Criterion) {
    let (mut buffer, _dir) = setup_buffer(64);
    buffer.save_block(7, block(64)).unwrap();

    c.bench_function("disk_buffer/load_hit", |b| {
        b.iter(|| buffer.load_block(black_box(7)).unwrap());
    });
}

fn bench_load_miss(c: &mut Criterion) {
    let (mut buffer, _dir) = setup_buffer(0);
    buffer.save_block(7, block(64)).unwrap();

    c.bench_function("disk_buffer/load_miss", |b| {
        b.iter(|| buffer.load_block(black_box(7)).unwrap());
    });
}

fn bench_tree_fill(c: &mut Criterion) {
    c.bench_function("tree/fill_10k_evict", |b| {
        b.iter(|| {
            let temp_dir = tempdir().unwrap();
            let mut controller = BoxController::new(3).unwrap();
            controller.set_split_into(2).unwrap();
            controller.set_split_threshold(200);
            controller
                .set_file_backed(Box::new(FileBoxIo::new(3)), temp_dir.path().join("tree.evbx"))
                .unwrap();

            let mut root =
                BoxNode::new_root(&mut controller, vec![Extent::new(0.0, 1.0); 3]).unwrap();
            let mut state = 12_345u32;
            for _ in 0..10_000 {
                let mut center = Vec::with_capacity(3);
                for _ in 0..3 {
                    state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    center.push(f64::from(state >> 8) / f64::from(1u32 << 24));
                }
                root.add_event(MdEvent::lean(1.0, 1.0, center), &mut controller)
                    .unwrap();
            }
            root.evict(&mut controller).unwrap();
            controller.clear_file_backed().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_save_block,
    bench_load_hit,
    bench_load_miss,
    bench_tree_fill
);
criterion_main!(benches);
