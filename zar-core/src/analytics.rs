//! Page and track events
//!
//! Every event carries the identity snapshot as `properties.zar`. Page events
//! can ask the backend for a pool lease in the same round trip; the lease
//! comes back as `pool_data` and is handed to
//! [`PoolManager::handle_page_response`](crate::pool::PoolManager::handle_page_response).

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};

use crate::config::ApiConfig;
use crate::datalayer::DataLayer;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::pool::{apply_strategy, PoolConfig};
use crate::transport::Transport;
use crate::types::{ContextMap, IdentityKind, PageResponse};

static BOT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)bot|crawl|spider|slurp|archiver|headless|lighthouse|phantomjs|facebookexternalhit|bingpreview|python-requests|curl/|wget",
    )
    .expect("valid bot regex")
});

/// True for crawler and headless-browser user agents. A missing user agent
/// counts as a bot.
pub fn is_bot(user_agent: Option<&str>) -> bool {
    match user_agent.map(str::trim) {
        Some(ua) if !ua.is_empty() => BOT_PATTERN.is_match(ua),
        _ => true,
    }
}

/// The page the events are about.
#[derive(Debug, Clone, Default)]
pub struct PageEnv {
    pub url: String,
    pub referrer: Option<String>,
    pub title: Option<String>,
    pub user_agent: Option<String>,
}

impl PageEnv {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// URL without its fragment
    fn clean_url(&self) -> &str {
        self.url.split('#').next().unwrap_or_default()
    }

    fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref().filter(|r| !r.is_empty())
    }
}

/// Sends page and track events to the zar API.
pub struct Tracker {
    transport: Arc<dyn Transport>,
    api_base: String,
    max_tries: u32,
    retry_delay: Duration,
    data_layer: DataLayer,
}

impl Tracker {
    pub fn new(transport: Arc<dyn Transport>, api: &ApiConfig) -> Result<Self> {
        Ok(Self {
            transport,
            api_base: api.base_url()?,
            max_tries: api.page_max_tries.max(1),
            retry_delay: api.page_retry_delay(),
            data_layer: DataLayer::new(),
        })
    }

    /// Drain pool context from a data layer shared with a [`PoolManager`](crate::pool::PoolManager).
    pub fn with_data_layer(mut self, data_layer: DataLayer) -> Self {
        self.data_layer = data_layer;
        self
    }

    /// Build the page event body.
    ///
    /// Caller properties override the page defaults; identity, bot detection
    /// and pool fields override both.
    pub fn page_payload(
        &self,
        identity: &mut IdentityStore,
        env: &PageEnv,
        properties: ContextMap,
        pool: Option<&PoolConfig>,
    ) -> Value {
        self.build_page(identity, env, properties, pool).0
    }

    /// Page body plus the context drained into it.
    fn build_page(
        &self,
        identity: &mut IdentityStore,
        env: &PageEnv,
        properties: ContextMap,
        pool: Option<&PoolConfig>,
    ) -> (Value, Option<ContextMap>) {
        let mut props = ContextMap::new();
        props.insert("url".to_string(), json!(env.clean_url()));
        if let Some(title) = &env.title {
            props.insert("title".to_string(), json!(title));
        }
        if let Some(referrer) = env.referrer() {
            props.insert("referrer".to_string(), json!(referrer));
        }
        props.extend(properties);

        identity.set_referrer(env.referrer.clone());
        let snapshot = identity.init_ids();
        props.insert("zar".to_string(), json!(snapshot));
        props.insert("referrer".to_string(), json!(env.referrer()));
        props.insert(
            "is_bot".to_string(),
            json!(is_bot(env.user_agent.as_deref())),
        );

        let mut drained = None;
        if let Some(pool) = pool {
            match pool.pool_id.resolve() {
                Some(pool_id) => {
                    drained = self.data_layer.drain();
                    let context = apply_strategy(
                        pool.context_strategy.as_deref(),
                        drained.clone().unwrap_or_default(),
                    );
                    props.insert("pool_id".to_string(), json!(pool_id));
                    props.insert("pool_context".to_string(), Value::Object(context));
                }
                None => tracing::warn!("No pool ID, page sent without pool request"),
            }
        }

        (json!({"type": "page", "properties": props}), drained)
    }

    /// Send a page event, retrying transport failures, and reconcile the
    /// identifiers the backend returns.
    pub async fn page(
        &self,
        identity: &mut IdentityStore,
        env: &PageEnv,
        properties: ContextMap,
        pool: Option<&PoolConfig>,
    ) -> Result<PageResponse> {
        let url = format!("{}/page", self.api_base);
        let (body, drained) = self.build_page(identity, env, properties, pool);

        let mut tries = 0;
        let value = loop {
            match self.transport.post_json(&url, &body).await {
                Ok(value) => break value,
                Err(e) => {
                    tries += 1;
                    if tries >= self.max_tries {
                        tracing::warn!(tries, error = %e, "Error posting page");
                        if let Some(context) = drained.filter(|c| !c.is_empty()) {
                            self.data_layer.restore(context);
                        }
                        return Err(e);
                    }
                    tracing::debug!(tries, error = %e, "Page post failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        };

        let response: PageResponse = serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("unexpected page response: {}", e)))?;

        for (kind, id) in [
            (IdentityKind::Vid, &response.vid),
            (IdentityKind::Sid, &response.sid),
            (IdentityKind::Cid, &response.cid),
        ] {
            if let Some(id) = id {
                identity.adopt(kind, id);
            }
        }

        tracing::debug!(
            id = ?response.id,
            pool_data = response.pool_data.is_some(),
            "Page recorded"
        );
        Ok(response)
    }

    /// Send a track event without waiting for its result body. Failures are
    /// logged, never returned.
    pub async fn track(
        &self,
        identity: &IdentityStore,
        env: &PageEnv,
        event: &str,
        properties: ContextMap,
    ) {
        let mut props = properties;
        props.insert("zar".to_string(), json!(identity.snapshot()));
        props.insert("url".to_string(), json!(env.clean_url()));
        props.insert("referrer".to_string(), json!(env.referrer()));

        let url = format!("{}/track", self.api_base);
        let body = json!({"type": "track", "event": event, "properties": props});
        match self.transport.beacon(&url, &body).await {
            Ok(()) => tracing::debug!(event, "Event tracked"),
            Err(e) => tracing::warn!(event, error = %e, "Failed to send track event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::IdentityPolicy;
    use crate::identity::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails the first `failures` posts, then answers with `response`.
    struct Flaky {
        failures: Mutex<u32>,
        response: Value,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl Flaky {
        fn new(failures: u32, response: Value) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                response,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
            self.sent.lock().unwrap().push((url.to_string(), body.clone()));
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Transport("connection reset".to_string()));
            }
            Ok(self.response.clone())
        }

        async fn get_json(&self, _url: &str, _params: &[(&str, String)]) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn beacon(&self, url: &str, body: &Value) -> Result<()> {
            self.sent.lock().unwrap().push((url.to_string(), body.clone()));
            Ok(())
        }
    }

    fn api() -> ApiConfig {
        ApiConfig {
            base_url: Some("https://api.test/v2/".to_string()),
            page_retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn identity() -> IdentityStore {
        IdentityStore::new(
            Box::new(MemoryStorage::new()),
            IdentityPolicy::default(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    fn env() -> PageEnv {
        PageEnv {
            url: "https://shop.example/pricing#plans".to_string(),
            referrer: Some("https://search.example/".to_string()),
            title: Some("Pricing".to_string()),
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0".to_string()),
        }
    }

    #[test]
    fn test_is_bot() {
        assert!(is_bot(Some("Googlebot/2.1 (+http://www.google.com/bot.html)")));
        assert!(is_bot(Some("Mozilla/5.0 HeadlessChrome/120.0")));
        assert!(is_bot(None));
        assert!(!is_bot(Some("Mozilla/5.0 (Macintosh) Safari/605.1.15")));
    }

    #[test]
    fn test_page_payload_with_pool() {
        let transport = Flaky::new(0, json!({}));
        let layer = DataLayer::new();
        layer.push(json!({"gclid": "abc"}).as_object().cloned().unwrap());
        let tracker = Tracker::new(transport, &api()).unwrap().with_data_layer(layer.clone());
        let mut identity = identity();

        let mut props = ContextMap::new();
        props.insert("title".to_string(), json!("Override"));
        let pool = PoolConfig::new("4", ".phone");
        let body = tracker.page_payload(&mut identity, &env(), props, Some(&pool));

        let props = &body["properties"];
        assert_eq!(body["type"], "page");
        assert_eq!(props["url"], "https://shop.example/pricing");
        assert_eq!(props["title"], "Override");
        assert_eq!(props["referrer"], "https://search.example/");
        assert_eq!(props["is_bot"], false);
        assert_eq!(props["pool_id"], "4");
        assert_eq!(props["pool_context"], json!({"gclid": "abc"}));
        assert!(props["zar"]["vid"]["id"].is_string());
        assert_eq!(
            props["zar"]["cid"]["origReferrer"],
            "https://search.example/"
        );
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn test_page_retries_then_adopts_server_ids() {
        let transport = Flaky::new(
            2,
            json!({"vid": "v-server", "sid": "s-server", "cid": "c-server", "id": 9}),
        );
        let tracker = Tracker::new(transport.clone(), &api()).unwrap();
        let mut identity = identity();

        let resp = tracker
            .page(&mut identity, &env(), ContextMap::new(), None)
            .await
            .unwrap();
        assert!(resp.pool_data.is_none());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].0, "https://api.test/v2/page");

        let ids = identity.ids();
        assert_eq!(ids.sid.as_deref(), Some("s-server"));
        assert_eq!(ids.cid.as_deref(), Some("c-server"));
    }

    #[tokio::test]
    async fn test_page_gives_up_after_max_tries() {
        let transport = Flaky::new(5, json!({}));
        let tracker = Tracker::new(transport.clone(), &api()).unwrap();
        let mut identity = identity();

        let err = tracker
            .page(&mut identity, &env(), ContextMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_pool_context_buffered() {
        let transport = Flaky::new(5, json!({}));
        let layer = DataLayer::new();
        layer.push(json!({"gclid": "abc"}).as_object().cloned().unwrap());
        let tracker = Tracker::new(transport.clone(), &api())
            .unwrap()
            .with_data_layer(layer.clone());
        let mut identity = identity();

        let pool = PoolConfig::new("4", ".phone");
        let result = tracker
            .page(&mut identity, &env(), ContextMap::new(), Some(&pool))
            .await;
        assert!(result.is_err());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1["properties"]["pool_context"], json!({"gclid": "abc"}));
        assert_eq!(layer.drain(), json!({"gclid": "abc"}).as_object().cloned());
    }

    #[tokio::test]
    async fn test_track_sends_beacon() {
        let transport = Flaky::new(0, json!({}));
        let tracker = Tracker::new(transport.clone(), &api()).unwrap();
        let mut identity = identity();
        identity.init_ids();

        let mut props = ContextMap::new();
        props.insert("plan".to_string(), json!("pro"));
        tracker.track(&identity, &env(), "signup", props).await;

        let sent = transport.sent.lock().unwrap();
        let (url, body) = &sent[0];
        assert_eq!(url, "https://api.test/v2/track");
        assert_eq!(body["event"], "signup");
        assert_eq!(body["properties"]["plan"], "pro");
        assert_eq!(body["properties"]["url"], "https://shop.example/pricing");
        assert!(body["properties"]["zar"]["sid"]["id"].is_string());
    }
}
