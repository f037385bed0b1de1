//! Concurrency primitives the pager is built from, from the bottom up: a 128-bit CAS-able word,
//! raw futex wait/wake, an atomic bitmap, and a futex-backed reader/writer lock.

pub mod atomic128;
pub mod bitmap;
pub mod futex;
pub mod rwlock;
