//! Benchmarks for the slot's hot loaded-path and the pager's eviction scan.

use std::io::Write;

use blockpager::config::{defaults, MemoryLimits, PagerConfig};
use blockpager::slot::LazySlot;
use blockpager::Pager;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_slot_get_release(c: &mut Criterion) {
    let slot = LazySlot::new();
    assert!(slot.should_init());
    slot.init(0x1000);

    c.bench_function("slot_get_release", |b| {
        b.iter(|| {
            let ptr = slot.get().expect("slot is loaded for the whole benchmark");
            black_box(ptr);
            slot.release();
        })
    });
}

fn sized_file(len: usize) -> camino_tempfile::NamedUtf8TempFile {
    let mut file = camino_tempfile::NamedUtf8TempFile::new().expect("create temp file");
    file.write_all(&vec![0u8; len]).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}

/// Repeatedly touches more distinct blocks than the soft limit admits, forcing an eviction scan
/// on most iterations.
fn bench_eviction_scan(c: &mut Criterion) {
    let blocks = 16u64;
    let file = sized_file((blocks * defaults::BLOCK_SIZE) as usize);
    let config = PagerConfig::new(MemoryLimits::simple(2 * defaults::BLOCK_SIZE));
    let pager = Pager::open(file.path(), config).expect("open pager");

    c.bench_function("eviction_scan_on_admission", |b| {
        b.iter(|| {
            for block in 0..blocks {
                let page = block * defaults::PAGES_PER_BLOCK;
                if let Ok(guard) = pager.get_page(page, 1) {
                    black_box(&*guard);
                }
            }
        })
    });
}

criterion_group!(benches, bench_slot_get_release, bench_eviction_scan);
criterion_main!(benches);
