//! The 128-bit atomic word backing the lazy slot, built on `portable-atomic`'s `AtomicU128`:
//! `load`/`store`/`compare_exchange` backed by `CMPXCHG16B`/`LDXP`-`STXP` where the target
//! supports native double-word CAS, and a seqlock fallback on targets that don't.

use portable_atomic::{AtomicU128, Ordering};

/// The three fields packed into the slot's 128-bit word.
///
/// Layout (low to high bits): `version: u32`, `references: u32`, `val: u64` (a tagged pointer,
/// 0 meaning null). A `u64` is wide enough for any real pointer on the 64-bit targets this crate
/// is built for; the top bits of a canonical pointer are always zero, so no information is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedState {
    pub version: u32,
    pub references: u32,
    pub val: u64,
}

impl PackedState {
    pub const EMPTY: PackedState = PackedState {
        version: 0,
        references: 0,
        val: 0,
    };

    fn to_bits(self) -> u128 {
        (self.version as u128) | ((self.references as u128) << 32) | ((self.val as u128) << 64)
    }

    fn from_bits(bits: u128) -> Self {
        PackedState {
            version: bits as u32,
            references: (bits >> 32) as u32,
            val: (bits >> 64) as u64,
        }
    }
}

/// A CAS-able cell holding one [`PackedState`].
#[derive(Debug)]
pub struct AtomicPackedState(AtomicU128);

impl AtomicPackedState {
    pub fn new(initial: PackedState) -> Self {
        AtomicPackedState(AtomicU128::new(initial.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> PackedState {
        PackedState::from_bits(self.0.load(order))
    }

    pub fn compare_exchange(
        &self,
        current: PackedState,
        new: PackedState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PackedState, PackedState> {
        self.0
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(PackedState::from_bits)
            .map_err(PackedState::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bits() {
        let s = PackedState {
            version: 7,
            references: 3,
            val: 0xdead_beef_0000,
        };
        assert_eq!(PackedState::from_bits(s.to_bits()), s);
    }

    #[test]
    fn cas_publishes_atomically() {
        let cell = AtomicPackedState::new(PackedState::EMPTY);
        let loaded = PackedState {
            version: 1,
            references: 1,
            val: 0x1000,
        };
        let result =
            cell.compare_exchange(PackedState::EMPTY, loaded, Ordering::AcqRel, Ordering::Acquire);
        assert_eq!(result, Ok(PackedState::EMPTY));
        assert_eq!(cell.load(Ordering::Acquire), loaded);
    }
}
