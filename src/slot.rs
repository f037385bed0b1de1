//! The lazy slot: a lock-free, single-producer/multi-consumer one-shot cell with refcount and
//! error state, packed into one 128-bit atomic word.
//!
//! State, usage count, and the not-yet-filled/filled distinction all live in one packed atomic
//! word with futex park/wake for blocking waiters, rather than a lock plus a separate usage
//! counter, so the loaded-read path is wait-free and there is no per-slot lock to contend on.

use std::sync::atomic::{AtomicU32, Ordering as StdOrdering};

use crossbeam_utils::Backoff;
use portable_atomic::Ordering;

use crate::error::PagerError;
use crate::sync::atomic128::{AtomicPackedState, PackedState};
use crate::sync::futex;

/// Sentinel `references` value marking the Failed state.
const FAILED_MARKER: u32 = u32::MAX;

pub struct LazySlot {
    state: AtomicPackedState,
    /// A plain futex word mirroring "has this slot just transitioned to Loaded or Failed".
    /// The packed 128-bit word above is the sole source of truth; this word exists only so
    /// waiters have something to sleep on, and every wait is bounded by a short timeout so a
    /// wake racing ahead of a waiter's `futex::wait` call can never cause a missed, unbounded
    /// sleep: the wake only needs to be observed eventually, not on a single syscall.
    futex_word: AtomicU32,
}

impl Default for LazySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySlot {
    pub fn new() -> Self {
        LazySlot {
            state: AtomicPackedState::new(PackedState::EMPTY),
            futex_word: AtomicU32::new(0),
        }
    }

    fn bump_futex(&self) {
        self.futex_word.fetch_add(1, StdOrdering::Release);
        futex::wake_all(&self.futex_word);
    }

    /// Non-atomic fast-path snapshot of `val != null` ("may be stale; used only as a
    /// fast path").
    pub fn has_value(&self) -> bool {
        self.state.load(Ordering::Relaxed).val != 0
    }

    /// Attempt to transition Empty -> Loading. Returns `true` exactly once per load cycle, to
    /// the winning loader.
    pub fn should_init(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if current.val != 0 || current.version != 0 {
            return false;
        }
        let loading = PackedState {
            version: 1,
            references: 0,
            val: 0,
        };
        self.state
            .compare_exchange(current, loading, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish a successfully loaded buffer. Precondition: `val` was null (i.e. the caller won
    /// `should_init`). The baseline reference count of 1 represents the pager's own residency
    /// pin: eviction only reclaims a slot once that pin is the only reference left.
    pub fn init(&self, ptr: u64) {
        let backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);
            debug_assert_eq!(current.val, 0, "init() called on an already-loaded slot");
            let loaded = PackedState {
                version: current.version.wrapping_add(1),
                references: 1,
                val: ptr,
            };
            if self
                .state
                .compare_exchange(current, loaded, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.bump_futex();
                return;
            }
            backoff.spin();
        }
    }

    /// Publish a load failure. Terminal until the slot is explicitly [`Self::reset`] (which
    /// cannot succeed on a Failed slot, so in practice a failed slot stays failed for its
    /// lifetime).
    pub fn opps(&self, err: PagerError) {
        let backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);
            let failed = PackedState {
                version: err.encode(),
                references: FAILED_MARKER,
                val: 0,
            };
            if self
                .state
                .compare_exchange(current, failed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.bump_futex();
                return;
            }
            backoff.spin();
        }
    }

    /// Non-blocking borrow attempt: never parks. `None` means Empty/Loading; the caller must
    /// either wait via [`Self::get`] or, like `try_page`, give up without submitting I/O itself.
    pub fn try_get(&self) -> Option<Result<u64, PagerError>> {
        let backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);

            if current.references == FAILED_MARKER {
                return Some(Err(PagerError::decode(current.version)));
            }

            if current.val != 0 {
                debug_assert!(current.references < FAILED_MARKER - 1);
                let bumped = PackedState {
                    version: current.version.wrapping_add(1),
                    references: current.references + 1,
                    val: current.val,
                };
                match self.state.compare_exchange(
                    current,
                    bumped,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(Ok(current.val)),
                    Err(_) => {
                        backoff.spin();
                        continue;
                    }
                }
            }

            return None;
        }
    }

    /// Obtain a new borrow. Blocks (via futex park) while the slot is Empty/Loading.
    pub fn get(&self) -> Result<u64, PagerError> {
        loop {
            if let Some(result) = self.try_get() {
                return result;
            }
            // Empty or Loading: park until init()/opps() wakes us, then re-check.
            futex::wait_until(&self.futex_word, || {
                self.try_get()
                    .is_none()
                    .then(|| self.futex_word.load(StdOrdering::Acquire))
            });
        }
    }

    /// Release one borrow previously obtained from [`Self::get`]. Does not wake anyone: no waiter
    /// ever blocks on a refcount decrement, only on the Empty/Loading to Loaded/Failed transition.
    pub fn release(&self) {
        let backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);
            debug_assert_ne!(current.val, 0, "release() called on a slot with no value");
            debug_assert!(current.references > 0);
            let released = PackedState {
                version: current.version.wrapping_add(1),
                references: current.references - 1,
                val: current.val,
            };
            if self
                .state
                .compare_exchange(current, released, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Attempt to reset a Loaded slot back to Empty. Succeeds only if `references == 1` (only
    /// the pager's baseline reservation remains) and `val` is set. A single CAS attempt: if it
    /// loses the race to a concurrent borrower, the slot survives ("on failure...
    /// skip"). Returns the freed pointer on success, so the caller can free the buffer without a
    /// second, separately-racing read of `val`.
    pub fn reset(&self) -> Option<u64> {
        let current = self.state.load(Ordering::Acquire);
        if current.val == 0 || current.references != 1 {
            return None;
        }
        self.state
            .compare_exchange(current, PackedState::EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| current.val)
    }

    /// Current reference count, for diagnostics and the pager's eviction scan.
    pub fn reference_count(&self) -> u32 {
        self.state.load(Ordering::Acquire).references
    }

    pub fn is_loaded(&self) -> bool {
        self.state.load(Ordering::Acquire).val != 0
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire).references == FAILED_MARKER
    }
}
