//! Futex-backed reader/writer lock protecting the pager's disjoint map: a lock over the map
//! itself, kept separate from the locks over the values the map points at. Hand-rolled over two
//! futex words rather than `std::sync::RwLock`, since there's no async scheduler here for a
//! wrapper lock to plug into. `readers` counts live read-holders; `writers` is 0 or 1 (at most one
//! writer at a time).

use std::sync::atomic::{AtomicU32, Ordering};

use super::futex;

pub struct RwLock {
    readers: AtomicU32,
    writers: AtomicU32,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    pub fn new() -> Self {
        RwLock {
            readers: AtomicU32::new(0),
            writers: AtomicU32::new(0),
        }
    }

    /// Acquire the lock for reading. Blocks while a writer holds or is waiting (writer
    /// preference).
    pub fn read(&self) -> RwLockReadGuard<'_> {
        loop {
            if self.writers.load(Ordering::Acquire) != 0 {
                futex::wait_until(&self.writers, || {
                    let w = self.writers.load(Ordering::Acquire);
                    (w != 0).then_some(w)
                });
                continue;
            }
            let prev = self.readers.fetch_add(1, Ordering::AcqRel);
            if self.writers.load(Ordering::Acquire) == 0 {
                return RwLockReadGuard { lock: self };
            }
            // A writer snuck in between our check and our increment; back off and retry.
            let _ = prev;
            self.release_read();
        }
    }

    fn release_read(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // Readers have drained to zero; wake any writer waiting on that condition.
            futex::wake_all(&self.readers);
        }
    }

    /// Acquire the lock for writing. Blocks until no other writer and no readers hold the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_> {
        loop {
            match self.writers.compare_exchange(
                0,
                1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => {
                    futex::wait_until(&self.writers, || {
                        let w = self.writers.load(Ordering::Acquire);
                        (w != 0).then_some(w)
                    });
                }
            }
        }

        futex::wait_until(&self.readers, || {
            let r = self.readers.load(Ordering::Acquire);
            (r != 0).then_some(r)
        });

        RwLockWriteGuard { lock: self }
    }

    fn release_write(&self) {
        self.writers.store(0, Ordering::Release);
        futex::wake_all(&self.writers);
    }
}

pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn multiple_readers_can_hold_concurrently() {
        let lock = Arc::new(RwLock::new());
        let g1 = lock.read();
        let g2 = lock.read();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new());
        let lock2 = Arc::clone(&lock);
        let writer_holds = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_holds2 = Arc::clone(&writer_holds);

        let handle = thread::spawn(move || {
            let _guard = lock2.write();
            writer_holds2.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            writer_holds2.store(false, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(10));
        let _read_guard = lock.read();
        assert!(!writer_holds.load(Ordering::SeqCst));
        handle.join().unwrap();
    }
}
