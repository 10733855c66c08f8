//! Watchdog - one-shot, re-armable timer on the tokio runtime
//!
//! Arming an armed watchdog moves its deadline (the previous expiry task is
//! dropped). The expiry callback runs at most once per arm.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Armed {
    deadline: Instant,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    armed: Option<Armed>,
}

/// Per-stage shot timer
pub struct Watchdog {
    slot: Arc<Mutex<TimerSlot>>,
    expirations: Arc<AtomicU64>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(TimerSlot::default())),
            expirations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arm (or re-arm) the timer to call `on_expiry` after `timeout`
    pub fn arm<F>(&self, runtime: &Handle, timeout: Duration, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _enter = runtime.enter();
        let deadline = Instant::now() + timeout;

        let mut slot = self.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        if let Some(previous) = slot.armed.take() {
            previous.task.abort();
        }

        let shared = Arc::clone(&self.slot);
        let expirations = Arc::clone(&self.expirations);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut slot = shared.lock();
                if slot.generation == generation {
                    slot.armed = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                expirations.fetch_add(1, Ordering::Relaxed);
                on_expiry();
            }
        });
        slot.armed = Some(Armed { deadline, task });
    }

    /// Disarm; returns whether a deadline was pending
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        match slot.armed.take() {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().armed.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.slot.lock().armed.as_ref().map(|a| a.deadline)
    }

    /// Number of times the timer actually expired
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(armed) = self.slot.lock().armed.take() {
            armed.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let wd = Watchdog::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        wd.arm(&Handle::current(), Duration::from_millis(100), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wd.is_armed());
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!wd.is_armed());
        assert_eq!(wd.expirations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_moves_deadline() {
        let wd = Watchdog::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hits);
        wd.arm(&Handle::current(), Duration::from_millis(50), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(40)).await;

        let h = Arc::clone(&hits);
        wd.arm(&Handle::current(), Duration::from_millis(50), move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let wd = Watchdog::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        wd.arm(&Handle::current(), Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wd.cancel());
        assert!(!wd.cancel());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(wd.expirations(), 0);
    }
}
