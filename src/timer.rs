//! Repair timer abstraction.
//!
//! The repair buffer needs a single re-armable one-shot timer to drive its
//! retransmission sweeps. The timer is injected as a trait so the repair
//! logic can be tested without a runtime, with the test double firing the
//! callback explicitly.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A one-shot timer with at most one outstanding schedule; re-arming
/// replaces the previous schedule. `cancel` is idempotent.
pub trait RepairTimer: Send + Sync + 'static {
    fn fire_in(&self, delay: Duration);
    fn cancel(&self);
}

pub trait TimerFactory: Send + Sync {
    fn create_timer(&self, callback: TimerCallback, label: &'static str) -> Box<dyn RepairTimer>;
}

/// Timer backed by a spawned tokio sleep task. Must be armed from within a
/// runtime; the callback runs on a runtime worker.
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn create_timer(&self, callback: TimerCallback, label: &'static str) -> Box<dyn RepairTimer> {
        Box::new(TokioTimer {
            callback,
            label,
            pending: Mutex::new(None),
        })
    }
}

struct TokioTimer {
    callback: TimerCallback,
    label: &'static str,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl RepairTimer for TokioTimer {
    fn fire_in(&self, delay: Duration) {
        trace!("timer {}: arming for {:?}", self.label, delay);
        let callback = self.callback.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        if let Some(previous) = self.pending.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    fn cancel(&self) {
        if let Some(previous) = self.pending.lock().unwrap().take() {
            trace!("timer {}: cancelled", self.label);
            previous.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        if let Some(task) = self.pending.lock().unwrap().take() {
            task.abort();
        }
    }
}
