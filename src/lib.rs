//! A file-backed page cache with asynchronous, `io_uring`-driven block I/O.
//!
//! # Purpose
//!
//! Exposes a fixed-granularity read interface over a large, pre-sized, read-only file: pages
//! ([`config::defaults::PAGE_SIZE`] bytes) are grouped into blocks
//! ([`config::defaults::BLOCK_SIZE`] bytes, the unit of I/O and residency), loaded on demand, and
//! shared among concurrent readers until memory pressure evicts them.
//!
//! # Locking
//!
//! There is no pager-wide lock. Each block's [`slot::LazySlot`] is independently
//! CAS-synchronized; the disjoint map (for reads crossing a block boundary) has its own
//! reader/writer lock ([`sync::rwlock::RwLock`]). The ring and file are owned exclusively by the
//! reader's worker thread; every other thread talks to it through a pending-request queue.
//!
//! # Filling the cache
//!
//! A caller asking for a page that isn't resident wins (or loses) a race to become that block's
//! loader via `should_init`. The winner charges [`config::defaults::BLOCK_SIZE`] against the
//! configured memory limits, running eviction if needed, and hands a read off to the
//! [`reader::BlockReader`]. The reader's worker thread submits it to the kernel, and publishes
//! the result back into the slot on completion, waking every other caller parked on that block.

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pager;
pub mod reader;
pub mod slot;
pub mod sync;

pub use config::{MemoryLimits, PagerConfig};
pub use error::{PagerError, Result};
pub use pager::{DisjointGuard, Pager, PageGuard};
pub use reader::{BlockReader, OnComplete, ReadResult};
