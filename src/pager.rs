//! The pager: page-to-block mapping, memory accounting, access tracking, eviction, and disjoint
//! reads, the component the rest of this crate exists to support.
//!
//! Blocks are ranked for eviction by a multi-generation usage score rather than a single
//! saturating counter: each block's recent-access history across `G` generations is packed into a
//! bitmap and scored through a fixed ranking table, so "touched more recently" always outranks
//! "touched more often, but longer ago".

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, debug_span, error, info, trace};

use crate::buffer::BlockBuf;
use crate::config::{defaults, PagerConfig};
use crate::error::PagerError;
use crate::metrics::{eviction_outcome_inc, EvictionOutcome, PAGER_METRICS};
use crate::reader::{BlockReader, OnComplete, ReadResult};
use crate::slot::LazySlot;
use crate::sync::bitmap::AtomicBitmap;
use crate::sync::rwlock::RwLock;

/// Fixed permutation ordering 4-bit access patterns by recency-weighted heat. Bit `G-1-i` is set
/// when generation `i` steps back from current was touched, so the pattern's raw integer value
/// already ranks "touched more recently" above "touched more often, but longer ago", the ordering
/// this table exists to encode. See DESIGN.md for why this permutation is the identity rather than
/// something else.
const RANKING_BY_USAGE: [u8; 16] = {
    let mut table = [0u8; 16];
    let mut i = 0;
    while i < 16 {
        table[i] = i as u8;
        i += 1;
    }
    table
};

/// A borrowed page, released automatically on drop rather than through a manually-paired free
/// function.
pub struct PageGuard {
    pager: Arc<Pager>,
    block_no: usize,
    ptr: u64,
    offset: usize,
    len: usize,
}

impl Deref for PageGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` was published by `LazySlot::init` and is kept alive by this guard's
        // outstanding reference on the slot; the buffer was marked read-only before publication,
        // so no concurrent writer can alias this view.
        unsafe {
            std::slice::from_raw_parts((self.ptr as *const u8).add(self.offset), self.len)
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pager.block_map[self.block_no].release();
    }
}

/// A borrowed disjoint (cross-block) read, released automatically on drop.
pub struct DisjointGuard {
    slot: Arc<LazySlot>,
    ptr: u64,
    len: usize,
}

impl Deref for DisjointGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: see `PageGuard::deref`; `self.slot` keeps the publishing borrow alive.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for DisjointGuard {
    fn drop(&mut self) {
        self.slot.release();
    }
}

struct BlockLoadCallback {
    pager: Arc<Pager>,
    block_no: usize,
}

impl OnComplete for BlockLoadCallback {
    fn on_complete(&self, result: ReadResult, _user_data: u64) {
        let slot = &self.pager.block_map[self.block_no];
        match result {
            Ok(buf) => {
                let ptr = buf.into_raw() as u64;
                slot.init(ptr);
                trace!(block_no = self.block_no, "block load completed");
            }
            Err(err) => {
                self.pager.refund(defaults::BLOCK_SIZE);
                error!(block_no = self.block_no, ?err, "block load failed");
                slot.opps(err);
            }
        }
    }
}

struct DisjointLoadCallback {
    slot: Arc<LazySlot>,
    page: u64,
}

impl OnComplete for DisjointLoadCallback {
    fn on_complete(&self, result: ReadResult, _user_data: u64) {
        match result {
            Ok(buf) => {
                let ptr = buf.into_raw() as u64;
                self.slot.init(ptr);
                trace!(page = self.page, "disjoint load completed");
            }
            Err(err) => {
                error!(page = self.page, ?err, "disjoint load failed");
                self.slot.opps(err);
            }
        }
    }
}

/// Owns the block map, access generations, disjoint map, memory accounting, and the async reader
/// for one opened file.
pub struct Pager {
    path: PathBuf,
    reader: BlockReader,
    block_map: Box<[LazySlot]>,
    accessed: [AtomicBitmap; defaults::NUMBER_OF_ACCESS_GENERATIONS],
    current_access_idx: AtomicUsize,
    disjoint_map: RwLock,
    disjoint_entries: std::sync::Mutex<HashMap<u64, Arc<LazySlot>>>,
    size_used: AtomicU64,
    limits: crate::config::MemoryLimits,
    file_size: u64,
    clock_shutdown: Arc<std::sync::atomic::AtomicBool>,
    clock_handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Pager {
    /// Open `path` and build the pager around it. Block buffers are allocated per-load via the
    /// global allocator (`crate::buffer::BlockBuf::alloc`); there is no separate allocator
    /// parameter to thread through.
    pub fn open(path: impl AsRef<Path>, config: PagerConfig) -> Result<Arc<Self>, PagerError> {
        let path = path.as_ref().to_path_buf();
        let file_size = std::fs::metadata(&path)?.len();
        if file_size > config.max_file_size {
            return Err(PagerError::ParamsOutsideAccessibleAddressSpace);
        }

        let reader = BlockReader::open(&path, config.io_ring_queue_size)?;
        let block_map = (0..defaults::NUMBER_OF_BLOCKS)
            .map(|_| LazySlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let accessed = std::array::from_fn(|_| AtomicBitmap::new(defaults::NUMBER_OF_BLOCKS));

        let clock_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let pager = Arc::new(Pager {
            path,
            reader,
            block_map,
            accessed,
            current_access_idx: AtomicUsize::new(0),
            disjoint_map: RwLock::new(),
            disjoint_entries: std::sync::Mutex::new(HashMap::new()),
            size_used: AtomicU64::new(0),
            limits: config.limits,
            file_size,
            clock_shutdown: Arc::clone(&clock_shutdown),
            clock_handle: std::sync::Mutex::new(None),
        });

        let clock_pager = Arc::downgrade(&pager);
        let period = config.access_generation_period;
        let handle = std::thread::Builder::new()
            .name("blockpager-access-clock".to_string())
            .spawn(move || access_clock_loop(clock_pager, clock_shutdown, period))
            .expect("spawning the access clock thread should not fail");
        *pager.clock_handle.lock().unwrap() = Some(handle);

        info!(path = %pager.path.display(), file_size, "pager opened");
        Ok(pager)
    }

    fn refund(&self, amount: u64) {
        self.size_used.fetch_sub(amount, Ordering::SeqCst);
    }

    /// Charge `amount` against `size_used`, running eviction if the soft limit is crossed and
    /// failing (with a refund) if the hard limit is still exceeded afterward.
    fn charge(&self, amount: u64) -> Result<(), PagerError> {
        let after = self.size_used.fetch_add(amount, Ordering::SeqCst) + amount;
        if after >= self.limits.effective_soft() {
            self.run_eviction();
        }
        if self.size_used.load(Ordering::SeqCst) > self.limits.effective_hard() {
            self.refund(amount);
            crate::metrics::error_inc(crate::metrics::ErrorKind::OutOfMemory);
            error!(amount, "admission refused: still over hard limit after eviction");
            return Err(PagerError::OutOfMemory);
        }
        PAGER_METRICS.bytes_resident.set(self.size_used.load(Ordering::SeqCst));
        Ok(())
    }

    /// Start a background load for a block whose slot the caller has already won
    /// (`should_init() == true`). Never blocks; publishes `opps` itself if admission fails.
    fn start_load(self: &Arc<Self>, block_no: usize) {
        let slot = &self.block_map[block_no];
        if let Err(err) = self.charge(defaults::BLOCK_SIZE) {
            slot.opps(err);
            return;
        }
        let callback = Arc::new(BlockLoadCallback {
            pager: Arc::clone(self),
            block_no,
        });
        if let Err(err) = self.reader.read_block(block_no as u64, callback, 0) {
            self.refund(defaults::BLOCK_SIZE);
            slot.opps(err);
        }
    }

    fn mark_accessed(&self, block_no: usize) {
        let idx = self.current_access_idx.load(Ordering::Relaxed) % defaults::NUMBER_OF_ACCESS_GENERATIONS;
        self.accessed[idx].set(block_no);
    }

    fn usage_score(&self, block_no: usize) -> u8 {
        let current = self.current_access_idx.load(Ordering::Relaxed);
        let mut v: u8 = 0;
        for i in 0..defaults::NUMBER_OF_ACCESS_GENERATIONS {
            let gen_idx = (current + i) % defaults::NUMBER_OF_ACCESS_GENERATIONS;
            if self.accessed[gen_idx].test(block_no) {
                v |= 1 << (defaults::NUMBER_OF_ACCESS_GENERATIONS - 1 - i);
            }
        }
        RANKING_BY_USAGE[v as usize]
    }

    /// Advance the current access generation, clearing the slot the pointer now lands on. Called
    /// by [`access_clock_loop`].
    fn rotate_access_generation(&self) {
        let next = (self.current_access_idx.load(Ordering::Relaxed) + 1)
            % defaults::NUMBER_OF_ACCESS_GENERATIONS;
        self.accessed[next].clear_all();
        self.current_access_idx.store(next, Ordering::Relaxed);
        debug!(next, "access generation rotated");
    }

    /// Scan for Loaded, unreferenced (`references == 1`) blocks and reset the coldest ones until
    /// `size_used` drops below the effective soft limit or no cold candidate remains.
    fn run_eviction(&self) {
        let _span = debug_span!("eviction", path = %self.path.display()).entered();
        let soft = self.limits.effective_soft();

        let mut candidates: Vec<(usize, u8)> = self
            .block_map
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_loaded() && slot.reference_count() == 1)
            .map(|(block_no, _)| (block_no, self.usage_score(block_no)))
            .collect();
        candidates.sort_by_key(|&(_, score)| score);

        let mut freed = 0u64;
        for (block_no, _) in &candidates {
            if self.size_used.load(Ordering::SeqCst) < soft {
                eviction_outcome_inc(EvictionOutcome::TargetReached);
                debug!(freed, "eviction reached target");
                return;
            }
            let slot = &self.block_map[*block_no];
            match slot.reset() {
                Some(ptr) => {
                    // SAFETY: `reset` only returns a pointer it just atomically reclaimed
                    // ownership of; it was published by `BlockLoadCallback` via `BlockBuf::into_raw`
                    // at `defaults::BLOCK_SIZE` length.
                    let buf = unsafe { BlockBuf::from_raw(ptr as *mut u8, defaults::BLOCK_SIZE as usize) };
                    drop(buf);
                    self.size_used.fetch_sub(defaults::BLOCK_SIZE, Ordering::SeqCst);
                    freed += defaults::BLOCK_SIZE;
                    eviction_outcome_inc(EvictionOutcome::Evicted);
                }
                None => {
                    eviction_outcome_inc(EvictionOutcome::SkippedBorrowed);
                }
            }
        }

        PAGER_METRICS.bytes_resident.set(self.size_used.load(Ordering::SeqCst));
        if self.size_used.load(Ordering::SeqCst) >= soft {
            eviction_outcome_inc(EvictionOutcome::NoColdCandidate);
            debug!(freed, "eviction exhausted candidates without reaching target");
        }
    }

    fn block_of(&self, page: u64) -> Result<usize, PagerError> {
        let block_no = (page / defaults::PAGES_PER_BLOCK) as usize;
        if block_no >= self.block_map.len() {
            return Err(PagerError::ParamsOutsideAccessibleAddressSpace);
        }
        Ok(block_no)
    }

    /// Return a borrowed view of page `page`. Blocks until the containing block is
    /// loaded. `n` must be 1; spans crossing a block boundary go through [`Self::get_disjoint`].
    pub fn get_page(self: &Arc<Self>, page: u64, n: u32) -> Result<PageGuard, PagerError> {
        assert_eq!(n, 1, "get_page only resolves a single same-block page; use get_disjoint for spans");
        let block_no = self.block_of(page)?;
        let slot = &self.block_map[block_no];

        if slot.should_init() {
            self.start_load(block_no);
        }

        PAGER_METRICS.same_block_accesses.inc();
        let ptr = slot.get()?;
        PAGER_METRICS.same_block_hits.inc();
        self.mark_accessed(block_no);

        let offset = (page % defaults::PAGES_PER_BLOCK) * defaults::PAGE_SIZE;
        Ok(PageGuard {
            pager: Arc::clone(self),
            block_no,
            ptr,
            offset: offset as usize,
            len: defaults::PAGE_SIZE as usize,
        })
    }

    /// Non-blocking variant of [`Self::get_page`]. Never parks; if the block is not yet loaded,
    /// it is scheduled for background load (winning `should_init` if no one else has) and `None`
    /// is returned immediately.
    pub fn try_page(self: &Arc<Self>, page: u64, n: u32) -> Option<PageGuard> {
        assert_eq!(n, 1, "try_page only resolves a single same-block page");
        let block_no = self.block_of(page).ok()?;
        let slot = &self.block_map[block_no];

        if slot.should_init() {
            self.start_load(block_no);
            return None;
        }

        PAGER_METRICS.same_block_accesses.inc();
        match slot.try_get() {
            Some(Ok(ptr)) => {
                PAGER_METRICS.same_block_hits.inc();
                self.mark_accessed(block_no);
                let offset = (page % defaults::PAGES_PER_BLOCK) * defaults::PAGE_SIZE;
                Some(PageGuard {
                    pager: Arc::clone(self),
                    block_no,
                    ptr,
                    offset: offset as usize,
                    len: defaults::PAGE_SIZE as usize,
                })
            }
            _ => None,
        }
    }

    /// A read whose span crosses a block boundary ("Disjoint reads").
    pub fn get_disjoint(self: &Arc<Self>, page: u64, n: u32) -> Result<DisjointGuard, PagerError> {
        PAGER_METRICS.disjoint_accesses.inc();

        let existing = {
            let _read_guard = self.disjoint_map.read();
            self.disjoint_entries.lock().unwrap().get(&page).cloned()
        };

        let slot = match existing {
            Some(slot) => slot,
            None => {
                let _write_guard = self.disjoint_map.write();
                let mut entries = self.disjoint_entries.lock().unwrap();
                if let Some(slot) = entries.get(&page) {
                    Arc::clone(slot)
                } else {
                    let slot = Arc::new(LazySlot::new());
                    entries.insert(page, Arc::clone(&slot));
                    drop(entries);

                    if slot.should_init() {
                        let length = n as u64 * defaults::PAGE_SIZE;
                        let callback = Arc::new(DisjointLoadCallback {
                            slot: Arc::clone(&slot),
                            page,
                        });
                        if let Err(err) = self.reader.read(page * defaults::PAGE_SIZE, length as u32, callback, 0)
                        {
                            slot.opps(err);
                        }
                    }
                    slot
                }
            }
        };

        let ptr = slot.get()?;
        PAGER_METRICS.disjoint_hits.inc();
        let len = (n as u64 * defaults::PAGE_SIZE) as usize;
        PAGER_METRICS.disjoint_bytes_resident.set(len as u64);
        Ok(DisjointGuard { slot, ptr, len })
    }

    /// Non-blocking variant of [`Self::get_disjoint`].
    pub fn try_disjoint(self: &Arc<Self>, page: u64, n: u32) -> Option<DisjointGuard> {
        PAGER_METRICS.disjoint_accesses.inc();
        let slot = {
            let _read_guard = self.disjoint_map.read();
            self.disjoint_entries.lock().unwrap().get(&page).cloned()
        }?;

        match slot.try_get() {
            Some(Ok(ptr)) => {
                PAGER_METRICS.disjoint_hits.inc();
                let len = (n as u64 * defaults::PAGE_SIZE) as usize;
                Some(DisjointGuard { slot, ptr, len })
            }
            _ => None,
        }
    }

    pub fn size_used(&self) -> u64 {
        self.size_used.load(Ordering::SeqCst)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        self.clock_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.clock_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!(path = %self.path.display(), "pager torn down");
    }
}

/// Background thread rotating the current access generation on a fixed, configurable interval.
fn access_clock_loop(
    pager: std::sync::Weak<Pager>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    period: Duration,
) {
    let _span = debug_span!("access_clock").entered();
    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(period);
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(pager) = pager.upgrade() else {
            break;
        };
        pager.rotate_access_generation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLimits;
    use std::io::Write;

    fn write_temp_file(len: usize, prefix: &[u8]) -> camino_tempfile::NamedUtf8TempFile {
        let mut file = camino_tempfile::NamedUtf8TempFile::new().expect("create temp file");
        let mut contents = vec![0u8; len];
        contents[..prefix.len()].copy_from_slice(prefix);
        file.write_all(&contents).expect("write temp file");
        file.flush().expect("flush temp file");
        file
    }

    #[test]
    fn hello_world_first_page() {
        let file = write_temp_file(8 * 1024 * 1024, b"hello world\n");
        let config = PagerConfig::new(MemoryLimits::simple(64 * defaults::BLOCK_SIZE));
        let pager = Pager::open(file.path(), config).expect("open pager");

        assert!(pager.try_page(0, 1).is_none());

        let page = pager.get_page(0, 1).expect("get_page should succeed");
        assert_eq!(page.len(), defaults::PAGE_SIZE as usize);
        assert_eq!(&page[..12], b"hello world\n");
    }

    #[test]
    fn same_block_pages_share_one_charge() {
        let file = write_temp_file(8 * 1024 * 1024, b"");
        let config = PagerConfig::new(MemoryLimits::simple(64 * defaults::BLOCK_SIZE));
        let pager = Pager::open(file.path(), config).expect("open pager");

        let _p0 = pager.get_page(0, 1).expect("page 0");
        let _p1 = pager.get_page(1, 1).expect("page 1");
        assert_eq!(pager.size_used(), defaults::BLOCK_SIZE);
    }

    #[test]
    fn out_of_memory_when_still_referenced() {
        let file = write_temp_file(8 * 1024 * 1024, b"");
        let config = PagerConfig::new(MemoryLimits::simple(defaults::BLOCK_SIZE));
        let pager = Pager::open(file.path(), config).expect("open pager");

        let _held = pager.get_page(0, 1).expect("first block loads");
        let err = pager
            .get_page(257, 1)
            .expect_err("second block should be refused while the first is pinned");
        assert_eq!(err, PagerError::OutOfMemory);
    }

    #[test]
    fn end_of_file_past_the_sized_region() {
        let file = write_temp_file(defaults::BLOCK_SIZE as usize, b"");
        let config = PagerConfig::new(MemoryLimits::simple(64 * defaults::BLOCK_SIZE));
        let pager = Pager::open(file.path(), config).expect("open pager");

        let err = pager
            .get_page(defaults::PAGES_PER_BLOCK, 1)
            .expect_err("reading past the sized region should fail");
        assert_eq!(err, PagerError::EndOfFile);
    }
}
