//! Liveness watchdog. The main loop feeds it at fixed points; a monitor
//! thread fires the expiry action (abort, in production) when a feed is
//! late, the way a hardware watchdog would reset the board.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Shared {
    origin: Instant,
    /// Milliseconds since `origin` at the last feed.
    last_feed_ms: AtomicU64,
    stop: AtomicBool,
}

impl Shared {
    fn since_last_feed(&self) -> Duration {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_feed_ms.load(Ordering::Acquire)))
    }
}

pub(crate) struct Watchdog {
    shared: Arc<Shared>,
}

impl Watchdog {
    /// Start the monitor thread. `on_expire` runs once, on that thread, with
    /// the time since the last feed.
    pub(crate) fn spawn<F>(timeout: Duration, on_expire: F) -> Result<Self>
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let watchdog = Self::unmonitored();
        let shared = Arc::clone(&watchdog.shared);
        let poll = (timeout / 10).clamp(Duration::from_millis(1), Duration::from_millis(500));

        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || loop {
                thread::sleep(poll);
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                let late = shared.since_last_feed();
                if late >= timeout {
                    on_expire(late);
                    return;
                }
            })
            .context("failed to start watchdog thread")?;

        tracing::info!(timeout_s = timeout.as_secs_f64(), "watchdog armed");
        Ok(watchdog)
    }

    /// A watchdog with no monitor thread. Feeds are recorded but nothing
    /// ever fires.
    pub(crate) fn unmonitored() -> Self {
        Self {
            shared: Arc::new(Shared {
                origin: Instant::now(),
                last_feed_ms: AtomicU64::new(0),
                stop: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn feed(&self) {
        let now_ms = self.shared.origin.elapsed().as_millis() as u64;
        self.shared.last_feed_ms.store(now_ms, Ordering::Release);
    }

    pub(crate) fn since_last_feed(&self) -> Duration {
        self.shared.since_last_feed()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

/// Expiry action for the real gateway: log and abort.
pub(crate) fn reset(late: Duration) {
    tracing::error!(late_ms = late.as_millis() as u64, "watchdog expired, resetting");
    std::process::abort();
}

// ===========================================================================
// Tests
// ===========================================================================
