//! Raw Linux futex wait/wake, used to park callers on the lazy slot's `references` word and on
//! each half of the reader/writer lock's state word. The slot and the RW lock are deliberately
//! lock-free and runtime-free, so parking drops to the same raw syscall the higher-level async
//! wait primitives are themselves built on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Atomically check that `word` still holds `expected`, then sleep until woken or `timeout`
/// elapses. Spurious wakeups are possible by design (matches `FUTEX_WAIT` semantics); callers
/// must re-check their condition in a loop.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let timespec = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as i64,
    });
    let ts_ptr = match &timespec {
        Some(ts) => ts as *const libc::timespec,
        None => std::ptr::null(),
    };

    // SAFETY: `word` is a valid, live `AtomicU32`; `ts_ptr` is either null or points at a
    // stack-local `timespec` that outlives the call. FUTEX_WAIT never mutates `word`.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        );
    }
    // Ignore the return value: EAGAIN (word changed before we slept), EINTR (signal) and a
    // genuine wakeup are all handled the same way by the caller's re-check loop.
}

/// Wake up to `n` waiters parked on `word`. Use `u32::MAX` to wake everyone.
pub fn wake(word: &AtomicU32, n: i32) {
    // SAFETY: `word` is a valid, live `AtomicU32`.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            n,
        );
    }
}

pub fn wake_all(word: &AtomicU32) {
    wake(word, i32::MAX)
}

/// Spin briefly, then park, re-checking `condition` each time. `condition` reads whatever value
/// the caller's protocol treats as authoritative; `futex_word`/`expected` are only used to decide
/// whether it's safe to actually sleep (must match the value `condition` observed).
pub fn wait_until(futex_word: &AtomicU32, mut poll: impl FnMut() -> Option<u32>) {
    const SPINS: u32 = 40;
    for _ in 0..SPINS {
        if poll().is_none() {
            return;
        }
        std::hint::spin_loop();
    }
    loop {
        let Some(expected) = poll() else {
            return;
        };
        if futex_word.load(Ordering::Acquire) != expected {
            continue;
        }
        wait(futex_word, expected, Some(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_unblocks_a_parked_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter_word = Arc::clone(&word);
        let waiter = thread::spawn(move || {
            wait(&waiter_word, 0, Some(Duration::from_secs(5)));
        });

        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::Release);
        wake_all(&word);

        waiter.join().expect("waiter thread should not panic");
    }

    #[test]
    fn wait_times_out_without_a_wake() {
        let word = AtomicU32::new(0);
        let start = std::time::Instant::now();
        wait(&word, 0, Some(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
