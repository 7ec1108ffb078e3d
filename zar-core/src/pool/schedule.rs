//! Per-pool renewal deadlines
//!
//! The schedule only does bookkeeping against epoch milliseconds from the
//! injected clock. [`PoolManager`](super::PoolManager) decides when to look at
//! it, either from a tokio timer loop or from a test driving a manual clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A running renewal task for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalHandle {
    pub pool_id: String,
    pub period: Duration,
    /// Epoch milliseconds of the next scheduled renewal
    pub next_due: i64,
    /// Epoch milliseconds of the last renewal attempt, scheduled or triggered
    pub last_attempt: Option<i64>,
}

/// Running renewal tasks keyed by pool id.
///
/// Attempt times outlive the task so a restarted pool still honors the
/// minimum gap.
#[derive(Debug, Default)]
pub struct RenewalSchedule {
    handles: BTreeMap<String, RenewalHandle>,
    last_attempts: HashMap<String, i64>,
}

impl RenewalSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the task for `pool_id`, first due one period from `now`.
    pub fn start(&mut self, pool_id: &str, period: Duration, now: i64) {
        let handle = RenewalHandle {
            pool_id: pool_id.to_string(),
            period,
            next_due: now.saturating_add(period.as_millis() as i64),
            last_attempt: self.last_attempts.get(pool_id).copied(),
        };
        tracing::debug!(pool_id, period_ms = period.as_millis() as u64, "Renewal task started");
        self.handles.insert(pool_id.to_string(), handle);
    }

    /// Stop the task for `pool_id`. Returns false when none was running.
    pub fn stop(&mut self, pool_id: &str) -> bool {
        let stopped = self.handles.remove(pool_id).is_some();
        if stopped {
            tracing::debug!(pool_id, "Renewal task stopped");
        }
        stopped
    }

    /// Stop every task, returning the pool ids that were running.
    pub fn stop_all(&mut self) -> Vec<String> {
        let stopped: Vec<String> = self.handles.keys().cloned().collect();
        self.handles.clear();
        stopped
    }

    pub fn is_running(&self, pool_id: &str) -> bool {
        self.handles.contains_key(pool_id)
    }

    /// Pools whose task is due at `now`, earliest first.
    pub fn due(&self, now: i64) -> Vec<String> {
        let mut due: Vec<&RenewalHandle> =
            self.handles.values().filter(|h| h.next_due <= now).collect();
        due.sort_by_key(|h| h.next_due);
        due.into_iter().map(|h| h.pool_id.clone()).collect()
    }

    /// Move a fired task to its next period. A task that fell more than one
    /// period behind is rescheduled from `now` instead of firing repeatedly.
    pub fn advance(&mut self, pool_id: &str, now: i64) {
        if let Some(handle) = self.handles.get_mut(pool_id) {
            let period = handle.period.as_millis() as i64;
            let next = handle.next_due.saturating_add(period);
            handle.next_due = if next <= now {
                now.saturating_add(period)
            } else {
                next
            };
        }
    }

    /// Earliest deadline across running tasks.
    pub fn next_due(&self) -> Option<i64> {
        self.handles.values().map(|h| h.next_due).min()
    }

    pub fn record_attempt(&mut self, pool_id: &str, now: i64) {
        self.last_attempts.insert(pool_id.to_string(), now);
        if let Some(handle) = self.handles.get_mut(pool_id) {
            handle.last_attempt = Some(now);
        }
    }

    pub fn last_attempt(&self, pool_id: &str) -> Option<i64> {
        self.last_attempts.get(pool_id).copied()
    }

    /// True when the last attempt for `pool_id` is younger than `gap`.
    pub fn within_gap(&self, pool_id: &str, now: i64, gap: Duration) -> bool {
        self.last_attempt(pool_id)
            .is_some_and(|last| now.saturating_sub(last) < gap.as_millis() as i64)
    }

    pub fn handles(&self) -> Vec<RenewalHandle> {
        self.handles.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
