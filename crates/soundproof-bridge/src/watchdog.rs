//! Background poller that notices dead server processes.

use crate::bridge::Bridge;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Polls registered bridges for process death on a fixed cadence.
///
/// With nothing to watch the thread parks on a condvar; registering the
/// first bridge moves it to polling. Bridges are held weakly and pruned on
/// the poll after they drop or their process exits, so registration needs no
/// matching removal call.
pub struct WatchDog {
    inner: Arc<WatchDogInner>,
    thread: Option<JoinHandle<()>>,
}

struct WatchDogInner {
    bridges: Mutex<Vec<Weak<Bridge>>>,
    wake: Condvar,
    running: AtomicBool,
    interval: Duration,
}

impl WatchDog {
    pub fn new(interval: Duration) -> std::io::Result<Self> {
        let inner = Arc::new(WatchDogInner {
            bridges: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            interval,
        });
        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("soundproof-watchdog".to_string())
            .spawn(move || run(&thread_inner))?;
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Start watching a bridge, waking the thread out of idle.
    pub fn register(&self, bridge: &Arc<Bridge>) {
        let mut bridges = self.inner.bridges.lock();
        bridges.push(Arc::downgrade(bridge));
        self.inner.wake.notify_one();
    }

    /// Bridges currently watched, not counting ones pending prune.
    pub fn watched(&self) -> usize {
        self.inner
            .bridges
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl Drop for WatchDog {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(inner: &WatchDogInner) {
    loop {
        let live: Vec<Arc<Bridge>> = {
            let mut bridges = inner.bridges.lock();
            loop {
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                bridges.retain(|w| w.upgrade().map(|b| b.alive()).unwrap_or(false));
                if !bridges.is_empty() {
                    break bridges.iter().filter_map(Weak::upgrade).collect();
                }
                inner.wake.wait(&mut bridges);
            }
        };

        for bridge in &live {
            bridge.check_status();
        }
        drop(live);

        let mut bridges = inner.bridges.lock();
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        inner.wake.wait_for(&mut bridges, inner.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_watchdog_shuts_down() {
        let watchdog = WatchDog::new(Duration::from_millis(10)).unwrap();
        assert_eq!(watchdog.watched(), 0);
        // Drop must join the parked thread, not hang on it.
        drop(watchdog);
    }
}
