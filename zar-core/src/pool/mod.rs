//! Dynamic number pool
//!
//! A pool lease binds a phone number to the current session for a bounded
//! time. The [`PoolManager`] leases a number, overlays it on the page, keeps
//! the lease alive on a timer and reverts the page when the lease is lost.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zar_core::pool::{PoolClient, PoolConfig, PoolManager};
//! use zar_core::{Config, HttpTransport, IdentityStore, MemoryDom, MemoryStorage, SystemClock};
//!
//! # async fn run() -> zar_core::Result<()> {
//! let config = Config::load()?;
//! let transport = Arc::new(HttpTransport::new(config.api.timeout())?);
//! let client = PoolClient::new(transport, &config.api.base_url()?);
//! let clock = Arc::new(SystemClock);
//! let identity = IdentityStore::new(
//!     Box::new(MemoryStorage::new()),
//!     config.identity.clone(),
//!     clock.clone(),
//! );
//!
//! let mut manager = PoolManager::new(
//!     Box::new(MemoryDom::new()),
//!     identity,
//!     client,
//!     clock,
//!     config.pool.clone(),
//! );
//! let result = manager
//!     .init_tracking_pool(PoolConfig::new("1", ".phone"), None)
//!     .await;
//! println!("{:?}", result);
//! # Ok(())
//! # }
//! ```

mod client;
mod manager;
mod schedule;

pub use client::PoolClient;
pub use manager::{PoolManager, Visibility};
pub use schedule::{RenewalHandle, RenewalSchedule};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{ContextMap, PoolResult};

/// Augments the drained context before it is sent with a lease request.
pub trait ContextStrategy: Send + Sync {
    fn augment(&self, context: ContextMap) -> Result<ContextMap>;
}

impl<F> ContextStrategy for F
where
    F: Fn(ContextMap) -> Result<ContextMap> + Send + Sync,
{
    fn augment(&self, context: ContextMap) -> Result<ContextMap> {
        self(context)
    }
}

/// Receives the outcome of every initialization and renewal.
pub trait PoolObserver: Send + Sync {
    fn on_result(&self, result: &PoolResult);
}

impl<F> PoolObserver for F
where
    F: Fn(&PoolResult) + Send + Sync,
{
    fn on_result(&self, result: &PoolResult) {
        self(result)
    }
}

/// Run `strategy` over `context`, keeping the original when it fails.
pub fn apply_strategy(strategy: Option<&dyn ContextStrategy>, context: ContextMap) -> ContextMap {
    let Some(strategy) = strategy else {
        return context;
    };
    match strategy.augment(context.clone()) {
        Ok(augmented) => augmented,
        Err(e) => {
            tracing::warn!(error = %e, "Context strategy failed, sending unaugmented context");
            context
        }
    }
}

/// Where the pool id comes from.
pub enum PoolIdSource {
    Fixed(String),
    /// Evaluated on every initialization
    Resolver(Box<dyn Fn() -> Option<String> + Send + Sync>),
}

impl PoolIdSource {
    pub fn resolver<F>(f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        PoolIdSource::Resolver(Box::new(f))
    }

    /// The pool id, or `None` when it resolves to nothing.
    pub fn resolve(&self) -> Option<String> {
        let id = match self {
            PoolIdSource::Fixed(id) => Some(id.clone()),
            PoolIdSource::Resolver(f) => f(),
        }?;
        let id = id.trim();
        (!id.is_empty()).then(|| id.to_string())
    }
}

impl fmt::Debug for PoolIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolIdSource::Fixed(id) => f.debug_tuple("Fixed").field(id).finish(),
            PoolIdSource::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<&str> for PoolIdSource {
    fn from(id: &str) -> Self {
        PoolIdSource::Fixed(id.to_string())
    }
}

impl From<String> for PoolIdSource {
    fn from(id: String) -> Self {
        PoolIdSource::Fixed(id)
    }
}

impl From<u64> for PoolIdSource {
    fn from(id: u64) -> Self {
        PoolIdSource::Fixed(id.to_string())
    }
}

/// Setup for one tracked pool.
pub struct PoolConfig {
    pub pool_id: PoolIdSource,
    /// Selector for the elements whose number is overlaid
    pub overlay_selector: String,
    /// Overrides the policy's renewal interval
    pub renewal_interval: Option<Duration>,
    pub context_strategy: Option<Arc<dyn ContextStrategy>>,
    pub observer: Option<Arc<dyn PoolObserver>>,
}

impl PoolConfig {
    pub fn new(pool_id: impl Into<PoolIdSource>, overlay_selector: &str) -> Self {
        Self {
            pool_id: pool_id.into(),
            overlay_selector: overlay_selector.to_string(),
            renewal_interval: None,
            context_strategy: None,
            observer: None,
        }
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = Some(interval);
        self
    }

    pub fn with_context_strategy(mut self, strategy: impl ContextStrategy + 'static) -> Self {
        self.context_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn with_observer(mut self, observer: impl PoolObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("pool_id", &self.pool_id)
            .field("overlay_selector", &self.overlay_selector)
            .field("renewal_interval", &self.renewal_interval)
            .field("context_strategy", &self.context_strategy.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
