//! Lease lifecycle for tracked pools
//!
//! One [`PoolManager`] owns the document, the overlay table and every pool's
//! lease. All operations take `&mut self`, so a renewal result can never race
//! a teardown: once `clear_pool` or the circuit breaker has run, no in-flight
//! response for that pool is left to apply.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::client::PoolClient;
use super::schedule::{RenewalHandle, RenewalSchedule};
use super::{apply_strategy, ContextStrategy, PoolConfig, PoolObserver};
use crate::clock::Clock;
use crate::config::{FailureScope, PoolPolicy};
use crate::datalayer::DataLayer;
use crate::dom::{Dom, ElementId};
use crate::error::Result;
use crate::identity::IdentityStore;
use crate::overlay::OverlayEngine;
use crate::types::{
    ContextMap, LeaseResponse, LeaseStatus, PageResponse, PoolLeaseState, PoolResult,
};

/// Document visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

struct TrackedPool {
    lease: PoolLeaseState,
    elements: Vec<ElementId>,
    context_strategy: Option<Arc<dyn ContextStrategy>>,
    observer: Option<Arc<dyn PoolObserver>>,
}

impl TrackedPool {
    fn active_number(&self) -> Option<&str> {
        if self.lease.is_active() {
            self.lease.number.as_deref()
        } else {
            None
        }
    }

    fn notify(&self, result: &PoolResult) {
        notify(self.observer.as_ref(), result);
    }
}

fn notify(observer: Option<&Arc<dyn PoolObserver>>, result: &PoolResult) {
    if let Some(observer) = observer {
        observer.on_result(result);
    }
}

fn renewal_error(pool_id: &str, msg: impl Into<String>) -> PoolResult {
    PoolResult {
        renew: true,
        ..PoolResult::error(Some(pool_id.to_string()), msg)
    }
}

/// Leases, overlays and renews numbers for one document.
pub struct PoolManager {
    dom: Box<dyn Dom>,
    overlay: OverlayEngine,
    identity: IdentityStore,
    client: PoolClient,
    data_layer: DataLayer,
    clock: Arc<dyn Clock>,
    policy: PoolPolicy,
    pools: BTreeMap<String, TrackedPool>,
    schedule: RenewalSchedule,
    /// Consecutive transport failures across all pools
    failures: u32,
    /// Set when the global circuit breaker trips; cleared by the next init
    stopped: bool,
}

impl PoolManager {
    pub fn new(
        dom: Box<dyn Dom>,
        identity: IdentityStore,
        client: PoolClient,
        clock: Arc<dyn Clock>,
        policy: PoolPolicy,
    ) -> Self {
        Self {
            dom,
            overlay: OverlayEngine::new(),
            identity,
            client,
            data_layer: DataLayer::new(),
            clock,
            policy,
            pools: BTreeMap::new(),
            schedule: RenewalSchedule::new(),
            failures: 0,
            stopped: false,
        }
    }

    /// Share an existing data layer with other producers.
    pub fn with_data_layer(mut self, data_layer: DataLayer) -> Self {
        self.data_layer = data_layer;
        self
    }

    // ============================================
    // Initialization
    // ============================================

    /// Lease a number for the configured pool, overlay it and start renewing.
    ///
    /// `pool_data` is a lease already issued by the backend (from a page
    /// response); without it a fresh lease is requested. Configuration and
    /// lease errors are reported to the observer and leave no state behind.
    pub async fn init_tracking_pool(
        &mut self,
        config: PoolConfig,
        pool_data: Option<LeaseResponse>,
    ) -> PoolResult {
        self.stopped = false;
        self.failures = 0;

        let observer = config.observer.clone();
        let fail = |pool_id: Option<String>, msg: String| {
            tracing::warn!(pool_id = ?pool_id, "{}", msg);
            let result = PoolResult::error(pool_id, msg);
            notify(observer.as_ref(), &result);
            result
        };

        let Some(requested_id) = config.pool_id.resolve() else {
            return fail(None, "no pool ID".to_string());
        };

        let selector = config.overlay_selector.trim();
        if selector.is_empty() {
            return fail(Some(requested_id), "missing overlay selector".to_string());
        }

        let interval = config
            .renewal_interval
            .unwrap_or_else(|| self.policy.renewal_interval());
        let min_gap = self.policy.min_renewal_gap();
        if interval.is_zero() {
            return fail(
                Some(requested_id),
                "renewal interval must be greater than zero".to_string(),
            );
        }
        if interval < min_gap {
            return fail(
                Some(requested_id),
                format!(
                    "renewal interval {:?} is shorter than the minimum gap {:?}",
                    interval, min_gap
                ),
            );
        }

        let elements = self.dom.query_selector_all(selector);
        if elements.is_empty() {
            return fail(
                Some(requested_id),
                format!("no elements found for: {}", selector),
            );
        }

        let response = match pool_data {
            Some(data) => data,
            None => {
                let (drained, context) = self.take_context(config.context_strategy.as_deref());
                let identity = self.identity.snapshot();
                match self
                    .client
                    .request_lease(&requested_id, None, &context, &identity)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        self.restore_context(drained);
                        return fail(
                            Some(requested_id),
                            format!("error getting number on init: {}", e),
                        );
                    }
                }
            }
        };

        let pool_id = response
            .pool_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or(requested_id);

        let number = match response.number.as_deref() {
            Some(number) if response.is_active() => number.to_string(),
            _ => {
                tracing::warn!(pool_id = %pool_id, msg = ?response.msg, "Pool lease not granted");
                let result = PoolResult::from_response(&pool_id, &response, false);
                notify(observer.as_ref(), &result);
                return result;
            }
        };

        if self.pools.contains_key(&pool_id) {
            tracing::debug!(pool_id = %pool_id, "Re-initializing tracked pool");
            self.clear_pool(&pool_id);
        }

        let now = self.clock.now_ms();
        let overlaid = self
            .overlay
            .overlay(self.dom.as_mut(), &elements, &number, false);
        tracing::info!(
            pool_id = %pool_id,
            number = %number,
            elements = elements.len(),
            overlaid,
            "Pool lease active"
        );

        self.schedule.start(&pool_id, interval, now);
        self.schedule.record_attempt(&pool_id, now);

        let result = PoolResult::from_response(&pool_id, &response, false);
        self.pools.insert(
            pool_id.clone(),
            TrackedPool {
                lease: PoolLeaseState {
                    pool_id,
                    number: Some(number),
                    status: LeaseStatus::Success,
                    leased_at: now,
                    error_count: 0,
                    msg: response.msg,
                    session_context: response.sid_ctx,
                },
                elements,
                context_strategy: config.context_strategy,
                observer: config.observer,
            },
        );

        self.flush_pending_context().await;
        notify(observer.as_ref(), &result);
        result
    }

    /// Initialize from the `pool_data` of a page response, if it carries one.
    pub async fn handle_page_response(
        &mut self,
        config: PoolConfig,
        response: &PageResponse,
    ) -> Option<PoolResult> {
        let pool_data = response.pool_data.clone()?;
        Some(self.init_tracking_pool(config, Some(pool_data)).await)
    }

    // ============================================
    // Renewal
    // ============================================

    /// Renew the lease held for `pool_id`.
    ///
    /// With `check_gap`, an attempt younger than the minimum renewal gap
    /// makes this a no-op success.
    pub async fn renew(&mut self, pool_id: &str, check_gap: bool) -> PoolResult {
        if self.stopped {
            return renewal_error(pool_id, "stopped");
        }

        let Some((number, strategy)) = self
            .pools
            .get(pool_id)
            .and_then(|p| p.active_number().map(|n| (n.to_string(), p.context_strategy.clone())))
        else {
            return renewal_error(pool_id, "no active lease");
        };

        let now = self.clock.now_ms();
        if check_gap
            && self
                .schedule
                .within_gap(pool_id, now, self.policy.min_renewal_gap())
        {
            tracing::debug!(pool_id, "Renewal skipped, last attempt too recent");
            return PoolResult {
                status: LeaseStatus::Success,
                pool_id: Some(pool_id.to_string()),
                number: Some(number),
                msg: Some("skipped".to_string()),
                renew: true,
            };
        }
        self.schedule.record_attempt(pool_id, now);

        let (drained, context) = self.take_context(strategy.as_deref());
        let identity = self.identity.snapshot();
        let response = self
            .client
            .request_lease(pool_id, Some(&number), &context, &identity)
            .await;

        let result = match response {
            Ok(response) => {
                let result = self.apply_renewal(pool_id, &number, response, now);
                if result.is_success() {
                    self.flush_pending_context().await;
                }
                result
            }
            Err(e) => {
                self.restore_context(drained);
                tracing::warn!(pool_id, error = %e, "Pool renewal failed");
                let result = renewal_error(pool_id, format!("error getting number: {}", e));
                self.record_failure(pool_id);
                result
            }
        };

        if let Some(pool) = self.pools.get(pool_id) {
            pool.notify(&result);
        }
        result
    }

    fn apply_renewal(
        &mut self,
        pool_id: &str,
        held: &str,
        response: LeaseResponse,
        now: i64,
    ) -> PoolResult {
        let result = PoolResult::from_response(pool_id, &response, true);
        let Some(pool) = self.pools.get_mut(pool_id) else {
            return result;
        };

        match response.number.as_deref() {
            Some(number) if response.is_active() => {
                self.failures = 0;
                pool.lease.error_count = 0;

                let force = number != held;
                if force {
                    tracing::warn!(pool_id, from = %held, to = %number, "Pool number changed");
                }

                pool.lease.number = Some(number.to_string());
                pool.lease.status = LeaseStatus::Success;
                pool.lease.leased_at = now;
                pool.lease.msg = response.msg.clone();
                if response.sid_ctx.is_some() {
                    pool.lease.session_context = response.sid_ctx.clone();
                }

                self.overlay
                    .overlay(self.dom.as_mut(), &pool.elements, number, force);
            }
            _ => {
                tracing::warn!(pool_id, msg = ?response.msg, "Pool lease lost, reverting");
                self.overlay.revert(self.dom.as_mut(), &pool.elements);
                self.schedule.stop(pool_id);
                pool.lease.status = LeaseStatus::Error;
                pool.lease.msg = response.msg.clone();
            }
        }

        result
    }

    /// Count a transport failure and trip the circuit breaker at the threshold.
    fn record_failure(&mut self, pool_id: &str) {
        self.failures += 1;
        let pool_failures = match self.pools.get_mut(pool_id) {
            Some(pool) => {
                pool.lease.error_count += 1;
                pool.lease.error_count
            }
            None => 0,
        };

        match self.policy.failure_scope {
            FailureScope::Global if self.failures >= self.policy.max_failures => {
                tracing::warn!(
                    failures = self.failures,
                    "Max pool failures reached, stopping all renewals"
                );
                self.stopped = true;
                let pool_ids: Vec<String> = self.pools.keys().cloned().collect();
                for id in pool_ids {
                    self.halt_pool(&id);
                }
            }
            FailureScope::PerPool if pool_failures >= self.policy.max_failures => {
                tracing::warn!(
                    pool_id,
                    failures = pool_failures,
                    "Max pool failures reached, stopping pool"
                );
                self.halt_pool(pool_id);
            }
            _ => {}
        }
    }

    /// Stop renewing and revert, keeping the lease record.
    fn halt_pool(&mut self, pool_id: &str) {
        self.schedule.stop(pool_id);
        if let Some(pool) = self.pools.get_mut(pool_id) {
            self.overlay.revert(self.dom.as_mut(), &pool.elements);
            pool.lease.status = LeaseStatus::Error;
            pool.lease.msg = Some("max failures".to_string());
        }
    }

    /// Renew every pool whose task is due by the clock.
    pub async fn run_due(&mut self) -> Vec<PoolResult> {
        let now = self.clock.now_ms();
        let mut results = Vec::new();
        for pool_id in self.schedule.due(now) {
            // An earlier renewal in this batch may have tripped the breaker
            if !self.schedule.is_running(&pool_id) {
                continue;
            }
            self.schedule.advance(&pool_id, now);
            results.push(self.renew(&pool_id, true).await);
        }
        results
    }

    /// Drive renewals in real time until `shutdown` resolves or no task is
    /// left running.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let Some(next_due) = self.schedule.next_due() else {
                tracing::debug!("No renewal tasks running");
                break;
            };
            let wait = next_due.saturating_sub(self.clock.now_ms()).max(0) as u64;

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("Renewal loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {
                    self.run_due().await;
                }
            }
        }
    }

    /// A hidden page becoming visible renews every active pool.
    pub async fn on_visibility_change(&mut self, visibility: Visibility) -> Vec<PoolResult> {
        match visibility {
            Visibility::Visible => self.renew_active().await,
            Visibility::Hidden => Vec::new(),
        }
    }

    /// A page restored from the back/forward cache renews every active pool.
    pub async fn on_page_show(&mut self, persisted: bool) -> Vec<PoolResult> {
        if persisted {
            self.renew_active().await
        } else {
            Vec::new()
        }
    }

    async fn renew_active(&mut self) -> Vec<PoolResult> {
        if self.stopped {
            return Vec::new();
        }
        let active: Vec<String> = self
            .pools
            .iter()
            .filter(|(_, p)| p.active_number().is_some())
            .map(|(id, _)| id.clone())
            .collect();

        let mut results = Vec::with_capacity(active.len());
        for pool_id in active {
            results.push(self.renew(&pool_id, true).await);
        }
        results
    }

    // ============================================
    // Context
    // ============================================

    /// Drain buffered context and run it through `strategy`. Returns the raw
    /// drained fragments too so they can be restored if the request fails.
    fn take_context(
        &self,
        strategy: Option<&dyn ContextStrategy>,
    ) -> (Option<ContextMap>, ContextMap) {
        let drained = self.data_layer.drain();
        let context = apply_strategy(strategy, drained.clone().unwrap_or_default());
        (drained, context)
    }

    fn restore_context(&self, drained: Option<ContextMap>) {
        if let Some(context) = drained.filter(|c| !c.is_empty()) {
            self.data_layer.restore(context);
        }
    }

    /// Buffer a context fragment and send it to every active lease.
    pub async fn push_context(&mut self, fragment: ContextMap) -> usize {
        self.data_layer.push(fragment);
        self.flush_pending_context().await
    }

    /// Send buffered context to every active lease. Without an active lease,
    /// or when no update gets through, the context stays buffered for the
    /// next lease request. Returns how many pools were updated.
    pub async fn flush_pending_context(&mut self) -> usize {
        let active: Vec<(String, String)> = self
            .pools
            .iter()
            .filter_map(|(id, p)| p.active_number().map(|n| (id.clone(), n.to_string())))
            .collect();
        if active.is_empty() {
            return 0;
        }
        let Some(context) = self.data_layer.drain() else {
            return 0;
        };

        let identity = self.identity.snapshot();
        let mut updated = 0;
        for (pool_id, number) in active {
            match self
                .client
                .update_context(&pool_id, &number, &context, &identity)
                .await
            {
                Ok(_) => updated += 1,
                Err(e) => {
                    tracing::warn!(pool_id = %pool_id, error = %e, "Failed to update pool context")
                }
            }
        }
        if updated == 0 {
            self.restore_context(Some(context));
        }
        updated
    }

    /// Send `context` for the lease held on `pool_id`. `None` when no lease
    /// is active.
    pub async fn update_context(
        &mut self,
        pool_id: &str,
        context: ContextMap,
    ) -> Result<Option<Value>> {
        let Some(number) = self
            .pools
            .get(pool_id)
            .and_then(|p| p.active_number())
            .map(str::to_string)
        else {
            tracing::warn!(pool_id, "No active lease, not updating context");
            return Ok(None);
        };

        let identity = self.identity.snapshot();
        self.client
            .update_context(pool_id, &number, &context, &identity)
            .await
            .map(Some)
    }

    // ============================================
    // Teardown
    // ============================================

    /// Stop renewing `pool_id`, revert its elements and forget its lease.
    pub fn clear_pool(&mut self, pool_id: &str) -> bool {
        let was_running = self.schedule.stop(pool_id);
        match self.pools.remove(pool_id) {
            Some(pool) => {
                self.overlay.revert(self.dom.as_mut(), &pool.elements);
                tracing::debug!(pool_id, "Pool cleared");
                true
            }
            None => was_running,
        }
    }

    /// Clear every pool. Returns how many were cleared.
    pub fn clear_all(&mut self) -> usize {
        let pool_ids: Vec<String> = self.pools.keys().cloned().collect();
        pool_ids.iter().filter(|id| self.clear_pool(id)).count()
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn handles(&self) -> Vec<RenewalHandle> {
        self.schedule.handles()
    }

    pub fn is_running(&self, pool_id: &str) -> bool {
        self.schedule.is_running(pool_id)
    }

    /// Earliest renewal deadline in epoch milliseconds.
    pub fn next_due(&self) -> Option<i64> {
        self.schedule.next_due()
    }

    pub fn lease(&self, pool_id: &str) -> Option<&PoolLeaseState> {
        self.pools.get(pool_id).map(|p| &p.lease)
    }

    pub fn elements(&self, pool_id: &str) -> Option<&[ElementId]> {
        self.pools.get(pool_id).map(|p| p.elements.as_slice())
    }

    pub fn pool_ids(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    /// True once the global circuit breaker has tripped.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    pub fn dom(&self) -> &dyn Dom {
        self.dom.as_ref()
    }

    pub fn dom_mut(&mut self) -> &mut dyn Dom {
        self.dom.as_mut()
    }

    pub fn overlay(&self) -> &OverlayEngine {
        &self.overlay
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut IdentityStore {
        &mut self.identity
    }

    pub fn data_layer(&self) -> &DataLayer {
        &self.data_layer
    }

    pub fn client(&self) -> &PoolClient {
        &self.client
    }
}
