//! Cross-process wake-up primitives.
//!
//! Each primitive is a single `AtomicU32` sequence counter that lives inside
//! the shared segment, so both processes address the same word. `post` bumps
//! the sequence and wakes sleepers; `wait` sleeps while the sequence still
//! equals the ticket captured before the request was published, so a post
//! that lands before the wait begins is never missed. On Linux the sleep is a
//! `futex` wait on the shared word; elsewhere a spin/yield/sleep loop polls
//! the same word with identical semantics.

use std::sync::atomic::{AtomicU32, Ordering};

/// Captures the current sequence value. Take the ticket *before* publishing
/// the data whose acknowledgement will be awaited.
pub(crate) fn ticket(word: &AtomicU32) -> u32 {
    word.load(Ordering::Acquire)
}

/// Bumps the sequence and wakes every waiter on the word.
pub(crate) fn post(word: &AtomicU32) {
    word.fetch_add(1, Ordering::Release);
    wake_all(word);
}

/// Blocks until the sequence no longer equals `ticket`.
#[cfg(target_os = "linux")]
pub(crate) fn wait(word: &AtomicU32, ticket: u32) {
    while word.load(Ordering::Acquire) == ticket {
        // SAFETY: `word` lives inside a mapping that outlives the channel
        // handle, and FUTEX_WAIT re-checks the value atomically before
        // sleeping, so a post between our load and the syscall returns
        // immediately with EAGAIN.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                ticket,
                std::ptr::null::<libc::timespec>(),
            )
        };
        if rc == -1 {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                // Unexpected futex failure: back off so the outer re-check
                // cannot turn into a hot spin.
                _ => std::thread::sleep(std::time::Duration::from_micros(100)),
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn wake_all(word: &AtomicU32) {
    // SAFETY: waking a shared futex word is valid whether or not anyone is
    // currently waiting on it.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
        );
    }
}

/// Portable fallback: poll the word, spinning briefly before sleeping in
/// short slices. Bounded staleness (one sleep slice) instead of a kernel
/// wake, same sequence semantics.
#[cfg(not(target_os = "linux"))]
pub(crate) fn wait(word: &AtomicU32, ticket: u32) {
    let mut spins: u32 = 0;
    while word.load(Ordering::Acquire) == ticket {
        if spins < 1_000 {
            std::hint::spin_loop();
            spins += 1;
        } else if spins < 1_050 {
            std::thread::yield_now();
            spins += 1;
        } else {
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn wake_all(_word: &AtomicU32) {
    // Pollers notice the sequence bump on their next check.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_post_wakes_parked_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let t = ticket(&word);
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || wait(&word, t))
        };
        std::thread::sleep(Duration::from_millis(20));
        post(&word);
        waiter.join().unwrap();
    }

    #[test]
    fn test_stale_ticket_returns_immediately() {
        let word = AtomicU32::new(0);
        let t = ticket(&word);
        post(&word);
        // The sequence already moved past the ticket; no blocking.
        wait(&word, t);
        assert_eq!(ticket(&word), t + 1);
    }

    #[test]
    fn test_ticket_tracks_every_post() {
        let word = AtomicU32::new(0);
        for i in 0..5 {
            assert_eq!(ticket(&word), i);
            post(&word);
        }
    }
}
