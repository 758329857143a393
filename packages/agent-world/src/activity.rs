//! Outstanding-work counter for a world.
//!
//! Every published message is counted once per agent pipeline that will see
//! it. A pipeline counts its delivery down after it finished the whole cycle
//! for that message (save, decide, respond, publish the reply). The reply is
//! counted up before the trigger is counted down, so the counter only reaches
//! zero when no message is queued or in process anywhere in the world.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug, Default)]
pub struct ActivityTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `n` pending deliveries.
    pub fn inc(&self, n: usize) {
        if n > 0 {
            self.count.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Finish `n` deliveries. Notifies waiters when the count hits zero.
    pub fn dec(&self, n: usize) {
        if n == 0 {
            return;
        }
        let result = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            });
        let prev = match result {
            Ok(prev) | Err(prev) => prev,
        };
        if prev < n {
            warn!(prev, n, "activity counter underflow, clamping to zero");
        }
        if prev <= n {
            self.notify.notify_waiters();
        }
    }

    /// Deliveries not yet finished.
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until no delivery is pending.
    ///
    /// Notify is edge-triggered, so register before checking and loop.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
