//! HTTP client for the number pool endpoints
//!
//! No retries happen here; the renewal schedule decides when to try again.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{ContextMap, IdentitySnapshot, LeaseResponse};

/// Request body shared by `POST /number_pool` and `POST /update_number`
#[derive(Serialize)]
struct LeaseRequest<'a> {
    pool_id: Value,
    /// `None` asks for a fresh lease, `Some` asks to renew that number
    number: Option<&'a str>,
    context: &'a ContextMap,
    properties: RequestProperties<'a>,
}

#[derive(Serialize)]
struct RequestProperties<'a> {
    zar: &'a IdentitySnapshot,
}

/// Pool ids are sent as numbers when they look like one.
pub(crate) fn pool_id_value(pool_id: &str) -> Value {
    pool_id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(pool_id))
}

/// Client for the pool lease endpoints
#[derive(Clone)]
pub struct PoolClient {
    transport: Arc<dyn Transport>,
    api_base: String,
}

impl PoolClient {
    pub fn new(transport: Arc<dyn Transport>, api_base: &str) -> Self {
        Self {
            transport,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Lease a number for `pool_id`, or renew `number` when given.
    pub async fn request_lease(
        &self,
        pool_id: &str,
        number: Option<&str>,
        context: &ContextMap,
        identity: &IdentitySnapshot,
    ) -> Result<LeaseResponse> {
        let url = format!("{}/number_pool", self.api_base);
        let body = serde_json::to_value(LeaseRequest {
            pool_id: pool_id_value(pool_id),
            number,
            context,
            properties: RequestProperties { zar: identity },
        })?;

        let value = self.transport.post_json(&url, &body).await?;
        let response: LeaseResponse = serde_json::from_value(value)
            .map_err(|e| Error::Pool(format!("unexpected number_pool response: {}", e)))?;

        tracing::debug!(
            pool_id,
            renew = number.is_some(),
            status = ?response.status,
            number = ?response.number,
            "Number pool response"
        );
        Ok(response)
    }

    /// Push additional context for an active lease.
    pub async fn update_context(
        &self,
        pool_id: &str,
        number: &str,
        context: &ContextMap,
        identity: &IdentitySnapshot,
    ) -> Result<Value> {
        let url = format!("{}/update_number", self.api_base);
        let body = serde_json::to_value(LeaseRequest {
            pool_id: pool_id_value(pool_id),
            number: Some(number),
            context,
            properties: RequestProperties { zar: identity },
        })?;

        self.transport.post_json(&url, &body).await
    }

    /// Read-only pool statistics.
    pub async fn fetch_stats(&self, key: Option<&str>, with_contexts: bool) -> Result<Value> {
        let url = format!("{}/number_pool_stats", self.api_base);
        let mut params = Vec::new();
        if let Some(key) = key {
            params.push(("key", key.to_string()));
        }
        params.push(("with_contexts", with_contexts.to_string()));

        self.transport.get_json(&url, &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_id_value() {
        assert_eq!(pool_id_value("12"), Value::from(12));
        assert_eq!(pool_id_value("main-pool"), Value::from("main-pool"));
    }

    #[test]
    fn test_lease_request_shape() {
        let context = ContextMap::new();
        let identity = IdentitySnapshot::default();
        let body = serde_json::to_value(LeaseRequest {
            pool_id: pool_id_value("3"),
            number: None,
            context: &context,
            properties: RequestProperties { zar: &identity },
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "pool_id": 3,
                "number": null,
                "context": {},
                "properties": {"zar": {}}
            })
        );
    }
}
