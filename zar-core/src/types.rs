//! Core domain types for zar
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Visit** (`vid`) | One browsing context; regenerated when the tab's scoped storage is empty |
//! | **Session** (`sid`) | A run of visits reconciled with the backend's session cookie |
//! | **Client** (`cid`) | A long-lived device identifier |
//! | **Pool** | A named set of phone numbers available for leasing |
//! | **Lease** | A backend-assigned number bound to a session for a bounded time, renewable |
//! | **Overlay** | Client-side substitution of a displayed phone number |
//! | **Context** | Arbitrary key/value data attached to lease requests |

use serde::{Deserialize, Serialize};
use std::fmt;

/// A JSON object of context fragments.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

// ============================================
// Identity
// ============================================

/// The identity kinds tracked per browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Vid,
    Sid,
    Cid,
}

impl IdentityKind {
    pub const ALL: [IdentityKind; 3] = [IdentityKind::Vid, IdentityKind::Sid, IdentityKind::Cid];

    /// Storage key for this kind.
    pub fn storage_key(&self) -> &'static str {
        match self {
            IdentityKind::Vid => "__zar_vid",
            IdentityKind::Sid => "__zar_sid",
            IdentityKind::Cid => "__zar_cid",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Vid => "vid",
            IdentityKind::Sid => "sid",
            IdentityKind::Cid => "cid",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored identifier of one kind.
///
/// Field names on the wire match what the backend reads from `properties.zar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    /// Creation time in epoch milliseconds
    #[serde(rename = "t")]
    pub created_at: i64,
    /// Last access in epoch milliseconds; TTLs are measured from here
    #[serde(rename = "lastSeen", default)]
    pub last_seen: i64,
    #[serde(rename = "origReferrer")]
    pub orig_referrer: Option<String>,
    #[serde(rename = "isNew")]
    pub is_new: bool,
}

/// The identity records sent with every request as `properties.zar`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<IdentityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<IdentityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<IdentityRecord>,
}

impl IdentitySnapshot {
    pub fn get(&self, kind: IdentityKind) -> Option<&IdentityRecord> {
        match kind {
            IdentityKind::Vid => self.vid.as_ref(),
            IdentityKind::Sid => self.sid.as_ref(),
            IdentityKind::Cid => self.cid.as_ref(),
        }
    }

    pub fn set(&mut self, kind: IdentityKind, record: IdentityRecord) {
        match kind {
            IdentityKind::Vid => self.vid = Some(record),
            IdentityKind::Sid => self.sid = Some(record),
            IdentityKind::Cid => self.cid = Some(record),
        }
    }
}

/// Just the identifier strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ids {
    pub vid: Option<String>,
    pub sid: Option<String>,
    pub cid: Option<String>,
}

// ============================================
// Number pool
// ============================================

/// Status reported by the number pool endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Success,
    Error,
}

/// Response of `POST /number_pool`, also embedded as `pool_data` in page responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub status: LeaseStatus,
    #[serde(default, deserialize_with = "deserialize_pool_id")]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    /// Server-side session context associated with the leased number
    #[serde(default)]
    pub sid_ctx: Option<serde_json::Value>,
}

impl LeaseResponse {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: LeaseStatus::Error,
            pool_id: None,
            number: None,
            msg: Some(msg.into()),
            sid_ctx: None,
        }
    }

    /// A success carrying a non-empty number.
    pub fn is_active(&self) -> bool {
        self.status == LeaseStatus::Success && self.number.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// Pool ids are numeric on some backends and strings on others.
fn deserialize_pool_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// The client-side view of one pool's lease.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolLeaseState {
    pub pool_id: String,
    pub number: Option<String>,
    pub status: LeaseStatus,
    /// Epoch milliseconds of the last successful lease or renewal
    pub leased_at: i64,
    /// Consecutive failed renewals of this pool
    pub error_count: u32,
    pub msg: Option<String>,
    pub session_context: Option<serde_json::Value>,
}

impl PoolLeaseState {
    pub fn is_active(&self) -> bool {
        self.status == LeaseStatus::Success && self.number.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// Outcome handed to observers and returned by pool operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolResult {
    pub status: LeaseStatus,
    pub pool_id: Option<String>,
    pub number: Option<String>,
    pub msg: Option<String>,
    /// Set for results produced by a renewal rather than initialization
    pub renew: bool,
}

impl PoolResult {
    pub fn error(pool_id: Option<String>, msg: impl Into<String>) -> Self {
        Self {
            status: LeaseStatus::Error,
            pool_id,
            number: None,
            msg: Some(msg.into()),
            renew: false,
        }
    }

    pub fn from_response(pool_id: &str, resp: &LeaseResponse, renew: bool) -> Self {
        Self {
            status: resp.status,
            pool_id: Some(pool_id.to_string()),
            number: resp.number.clone(),
            msg: resp.msg.clone(),
            renew,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == LeaseStatus::Success
    }
}

/// Response of `POST /page`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    #[serde(default)]
    pub vid: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub cid: Option<String>,
    /// Server-side id of the recorded page event
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// Lease issued alongside the page view, when a pool was requested
    #[serde(default)]
    pub pool_data: Option<LeaseResponse>,
}
