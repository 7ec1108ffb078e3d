//! # zar-core
//!
//! Core library for zar - visitor analytics with dynamic number insertion.
//!
//! This library provides:
//! - Visitor, session and client identifiers with pluggable storage
//! - Phone number extraction and reversible overlay over a document
//! - Number pool leasing with timed renewal and a failure circuit breaker
//! - Page and track event dispatch
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! The [`PoolManager`] owns everything a page needs for one pool session:
//! - **Document:** a [`Dom`] implementation the overlay engine rewrites
//! - **Identity:** an [`IdentityStore`] whose snapshot rides along with every request
//! - **Network:** a [`Transport`] behind the pool client and the event [`Tracker`]
//! - **Time:** a [`Clock`] that renewal deadlines are measured against
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zar_core::{Config, IdentityStore, SqliteStorage, SystemClock};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open persistent identity storage
//! let storage = SqliteStorage::open(&Config::identity_db_path(), "default")
//!     .expect("failed to open identity database");
//! let mut identity = IdentityStore::new(Box::new(storage), config.identity, Arc::new(SystemClock));
//! println!("{:?}", identity.init_ids());
//! ```

// Re-export commonly used items at the crate root
pub use analytics::{is_bot, PageEnv, Tracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use datalayer::DataLayer;
pub use dom::{Dom, ElementId, MemoryDom, MemoryElement};
pub use error::{Error, Result};
pub use identity::{IdentityStore, MemoryStorage, ScopedStorage, SqliteStorage};
pub use overlay::{extract, Extracted, OverlayEngine};
pub use pool::{PoolClient, PoolConfig, PoolManager, Visibility};
pub use transport::{HttpTransport, Transport};
pub use types::*;

// Public modules
pub mod analytics;
pub mod clock;
pub mod config;
pub mod datalayer;
pub mod dom;
pub mod error;
pub mod identity;
pub mod logging;
pub mod overlay;
pub mod pool;
pub mod transport;
pub mod types;
