//! End-to-end scenarios from the pager's public contract, seeded against real temp files
//! (mirroring `libs/postgres_backend/tests/simple_select.rs`'s top-level integration style).

use std::io::Write;
use std::sync::Arc;

use blockpager::config::defaults;
use blockpager::{MemoryLimits, Pager, PagerConfig, PagerError};

fn sized_file(len: usize, prefix: &[u8]) -> camino_tempfile::NamedUtf8TempFile {
    let mut file = camino_tempfile::NamedUtf8TempFile::new().expect("create temp file");
    let mut contents = vec![0u8; len];
    contents[..prefix.len()].copy_from_slice(prefix);
    file.write_all(&contents).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}

fn generous_config() -> PagerConfig {
    PagerConfig::new(MemoryLimits::simple(64 * defaults::BLOCK_SIZE))
}

/// Scenario 1: `try_page` misses before a load, `get_page` returns the right bytes afterward.
#[test]
fn hello_world_round_trip() {
    let file = sized_file(8 * 1024 * 1024, b"hello world\n");
    let pager = Pager::open(file.path(), generous_config()).expect("open pager");

    assert!(pager.try_page(0, 1).is_none());

    let page = pager.get_page(0, 1).expect("get_page should succeed");
    assert_eq!(page.len(), defaults::PAGE_SIZE as usize);
    assert_eq!(&page[..12], b"hello world\n");
}

/// Scenario 2: two pages in the same block share a single `BlockSize` charge.
#[test]
fn same_block_pages_charge_once() {
    let file = sized_file(8 * 1024 * 1024, b"");
    let pager = Pager::open(file.path(), generous_config()).expect("open pager");

    let _p0 = pager.get_page(0, 1).expect("page 0");
    let _p1 = pager.get_page(1, 1).expect("page 1");
    assert_eq!(pager.size_used(), defaults::BLOCK_SIZE);
}

/// Scenario 3: a second block cannot be admitted while the first is still referenced and the
/// limit only has room for one block.
#[test]
fn out_of_memory_while_first_block_pinned() {
    let file = sized_file(8 * 1024 * 1024, b"");
    let config = PagerConfig::new(MemoryLimits::simple(defaults::BLOCK_SIZE));
    let pager = Pager::open(file.path(), config).expect("open pager");

    let _held = pager.get_page(0, 1).expect("first block loads");
    let err = pager
        .get_page(257, 1)
        .expect_err("second block must be refused while the first is pinned");
    assert_eq!(err, PagerError::OutOfMemory);
}

/// Scenario 4: two threads race `get_page` on the same page; both see identical bytes and only
/// one of them ever wins `should_init` (checked indirectly: the read succeeds for both without
/// either thread observing a torn or inconsistent buffer).
#[test]
fn concurrent_get_page_agrees() {
    let file = sized_file(8 * 1024 * 1024, b"racing readers\n");
    let pager = Pager::open(file.path(), generous_config()).expect("open pager");

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pager = Arc::clone(&pager);
                scope.spawn(move || {
                    let page = pager.get_page(0, 1).expect("get_page should succeed");
                    page[..14].to_vec()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for bytes in &results {
            assert_eq!(bytes, b"racing readers");
        }
    });
}

/// Scenario 5: a read past the sized region of the file surfaces `EndOfFile`.
#[test]
fn end_of_file_past_sized_region() {
    let file = sized_file(defaults::BLOCK_SIZE as usize, b"");
    let pager = Pager::open(file.path(), generous_config()).expect("open pager");

    let err = pager
        .get_page(defaults::PAGES_PER_BLOCK, 1)
        .expect_err("reading past the sized region should fail");
    assert_eq!(err, PagerError::EndOfFile);
}

/// Scenario 6: under a soft limit that forces eviction on every third block, the block touched
/// most recently always survives and the older, unreferenced one is the victim. `size_used`
/// pins down exactly which two blocks remain resident, and `try_page` (which never loads, so
/// `Some` means still resident without triggering a reload) confirms the survivor directly. The
/// victim is checked only indirectly, through `size_used`: probing it with `try_page` would itself
/// schedule a background reload and defeat the check.
#[test]
fn eviction_prefers_cold_blocks() {
    let file = sized_file(8 * defaults::BLOCK_SIZE as usize, b"");
    let mut config = PagerConfig::new(MemoryLimits {
        self_soft: 3 * defaults::BLOCK_SIZE,
        self_hard: 4 * defaults::BLOCK_SIZE,
        global_soft: 3 * defaults::BLOCK_SIZE,
        global_hard: 4 * defaults::BLOCK_SIZE,
    });
    // Short relative to `settle` so a touch reliably lands in a distinct, and eventually
    // aged-out, access generation from the next one, without slowing the test down.
    config.access_generation_period = std::time::Duration::from_millis(15);
    let pager = Pager::open(file.path(), config).expect("open pager");
    let settle = std::time::Duration::from_millis(50);

    let page_for = |block: u64| block * defaults::PAGES_PER_BLOCK;

    // Blocks 0 and 1 become the two unreferenced, loaded candidates eviction will choose between
    // once block 2's charge crosses the soft limit (3 blocks). Block 1 was touched a generation
    // after block 0, so it must be the one still resident afterward; block 0 is evicted, leaving
    // exactly blocks 1 and 2 resident.
    drop(pager.get_page(page_for(0), 1).expect("block 0 should load"));
    std::thread::sleep(settle);
    drop(pager.get_page(page_for(1), 1).expect("block 1 should load"));
    std::thread::sleep(settle);
    drop(pager.get_page(page_for(2), 1).expect("block 2 should load, evicting block 0"));

    assert_eq!(
        pager.size_used(),
        2 * defaults::BLOCK_SIZE,
        "exactly blocks 1 and 2 should remain resident"
    );
    assert!(
        pager.try_page(page_for(1), 1).is_some(),
        "the more recently touched block must not be evicted"
    );

    // Repeat one generation later: loading block 3 now evicts between blocks 1 and 2, and block 2
    // (touched most recently) must again be the survivor.
    std::thread::sleep(settle);
    drop(pager.get_page(page_for(3), 1).expect("block 3 should load, evicting block 1"));

    assert_eq!(
        pager.size_used(),
        2 * defaults::BLOCK_SIZE,
        "exactly blocks 2 and 3 should remain resident"
    );
    assert!(
        pager.try_page(page_for(2), 1).is_some(),
        "the more recently touched block must not be evicted"
    );
}
