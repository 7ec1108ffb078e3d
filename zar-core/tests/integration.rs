//! Integration tests for the number pool lifecycle
//!
//! These tests drive a `PoolManager` over an in-memory document with a
//! scripted transport and a manual clock, so every renewal is deterministic.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::fmt::MakeWriter;
use zar_core::config::{FailureScope, IdentityPolicy, PoolPolicy};
use zar_core::pool::{PoolClient, PoolConfig, PoolManager, Visibility};
use zar_core::{
    ContextMap, Dom, ElementId, Error, IdentityStore, LeaseStatus, ManualClock, MemoryDom,
    MemoryElement, MemoryStorage, PageResponse, PoolResult, Result, SystemClock, Transport,
};

const SECOND: Duration = Duration::from_secs(1);

// ============================================
// Log capture
// ============================================

#[derive(Clone, Default)]
struct TestWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

struct TestWriterGuard {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for TestWriter {
    type Writer = TestWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        TestWriterGuard {
            buffer: self.buffer.clone(),
        }
    }
}

impl Write for TestWriterGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer
            .lock()
            .expect("log buffer")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TestWriter {
    /// Route WARN and above on this thread into the buffer until the guard drops.
    fn capture(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().expect("log buffer").clone()).expect("utf8 logs")
    }
}

// ============================================
// Scripted transport
// ============================================

enum Reply {
    Json(Value),
    Fail,
}

/// Answers each endpoint from a queue, preferring replies queued for the
/// request's pool. An empty `number_pool` queue grants the requested number
/// (or a default one); other endpoints answer success.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    fn reply(&self, endpoint: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue a reply for one pool only.
    fn reply_for(&self, endpoint: &str, pool_id: &str, reply: Reply) {
        self.reply(&format!("{}:{}", endpoint, pool_id), reply);
    }

    fn grant(&self, number: &str) {
        self.reply(
            "number_pool",
            Reply::Json(json!({"status": "success", "number": number})),
        );
    }

    fn sent_to(&self, endpoint: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn answer(&self, url: &str, body: &Value) -> Result<Value> {
        let endpoint = url.rsplit('/').next().unwrap_or_default().to_string();
        self.sent.lock().unwrap().push((endpoint.clone(), body.clone()));

        let pool_id = match &body["pool_id"] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let next = {
            let mut replies = self.replies.lock().unwrap();
            let scoped = format!("{}:{}", endpoint, pool_id);
            match replies.get_mut(&scoped).and_then(|q| q.pop_front()) {
                Some(reply) => Some(reply),
                None => replies.get_mut(&endpoint).and_then(|q| q.pop_front()),
            }
        };
        match next {
            Some(Reply::Json(value)) => Ok(value),
            Some(Reply::Fail) => Err(Error::Transport("connection refused".to_string())),
            None if endpoint == "number_pool" => {
                let number = body["number"].as_str().unwrap_or("6505550000");
                Ok(json!({"status": "success", "pool_id": body["pool_id"], "number": number}))
            }
            None => Ok(json!({"status": "success"})),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        self.answer(url, body)
    }

    async fn get_json(&self, url: &str, _params: &[(&str, String)]) -> Result<Value> {
        self.answer(url, &Value::Null)
    }

    async fn beacon(&self, url: &str, body: &Value) -> Result<()> {
        self.answer(url, body).map(|_| ())
    }
}

// ============================================
// Harness
// ============================================

struct Page {
    main: ElementId,
    footer: ElementId,
    alt: ElementId,
}

fn page_dom() -> (MemoryDom, Page) {
    let mut dom = MemoryDom::new();
    let main = dom.insert(
        MemoryElement::new("a")
            .with_class("phone")
            .with_href("tel:6505551234")
            .with_text("Call 650-555-1234"),
    );
    let footer = dom.insert(
        MemoryElement::new("span")
            .with_class("phone")
            .with_text("Or dial 6505551234"),
    );
    let alt = dom.insert(
        MemoryElement::new("a")
            .with_class("alt-phone")
            .with_href("tel:8005550100")
            .with_text("800-555-0100"),
    );
    (dom, Page { main, footer, alt })
}

struct Harness {
    manager: PoolManager,
    transport: Arc<ScriptedTransport>,
    clock: Arc<ManualClock>,
    results: Arc<Mutex<Vec<PoolResult>>>,
    page: Page,
}

impl Harness {
    fn new(policy: PoolPolicy) -> Self {
        zar_core::logging::init_test();
        let (dom, page) = page_dom();
        let transport = Arc::new(ScriptedTransport::default());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut identity = IdentityStore::new(
            Box::new(MemoryStorage::new()),
            IdentityPolicy::default(),
            clock.clone(),
        );
        identity.init_ids();

        let client = PoolClient::new(transport.clone(), "https://api.test/api/v2");
        let manager = PoolManager::new(Box::new(dom), identity, client, clock.clone(), policy);

        Self {
            manager,
            transport,
            clock,
            results: Arc::new(Mutex::new(Vec::new())),
            page,
        }
    }

    fn config(&self, pool_id: &str, selector: &str) -> PoolConfig {
        let sink = self.results.clone();
        PoolConfig::new(pool_id, selector)
            .with_observer(move |r: &PoolResult| sink.lock().unwrap().push(r.clone()))
    }

    fn text(&self, el: ElementId) -> String {
        self.manager.dom().text(el).unwrap_or_default()
    }

    fn href(&self, el: ElementId) -> Option<String> {
        self.manager.dom().href(el)
    }

    fn observed(&self) -> Vec<PoolResult> {
        self.results.lock().unwrap().clone()
    }

    async fn tick(&mut self, by: Duration) -> Vec<PoolResult> {
        self.clock.advance(by);
        self.manager.run_due().await
    }
}

fn context(value: Value) -> ContextMap {
    value.as_object().cloned().unwrap()
}

// ============================================
// Initialization
// ============================================

#[tokio::test]
async fn test_lease_overlays_every_match_and_clear_reverts() {
    let mut h = Harness::new(PoolPolicy::default());
    h.transport.grant("6505550000");

    let config = h.config("1", ".phone");
    let result = h.manager.init_tracking_pool(config, None).await;
    assert!(result.is_success());
    assert_eq!(result.number.as_deref(), Some("6505550000"));

    // Fresh lease request carries no number and the identity snapshot
    let requests = h.transport.sent_to("number_pool");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["pool_id"], 1);
    assert!(requests[0]["number"].is_null());
    assert!(requests[0]["properties"]["zar"]["vid"]["id"].is_string());

    assert_eq!(h.text(h.page.main), "Call 650-555-0000");
    assert_eq!(h.href(h.page.main).as_deref(), Some("tel:+16505550000"));
    assert_eq!(h.text(h.page.footer), "Or dial +16505550000");
    assert_eq!(h.text(h.page.alt), "800-555-0100");

    assert!(h.manager.is_running("1"));
    let observed = h.observed();
    assert_eq!(observed.len(), 1);
    assert!(!observed[0].renew);

    assert!(h.manager.clear_pool("1"));
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");
    assert_eq!(h.href(h.page.main).as_deref(), Some("tel:6505551234"));
    assert_eq!(h.text(h.page.footer), "Or dial 6505551234");
    assert!(h.manager.handles().is_empty());
}

#[tokio::test]
async fn test_selector_without_matches_reports_error() {
    let mut h = Harness::new(PoolPolicy::default());

    let config = h.config("1", ".nothing-here");
    let result = h.manager.init_tracking_pool(config, None).await;

    assert_eq!(result.status, LeaseStatus::Error);
    assert!(h.transport.sent_to("number_pool").is_empty());
    assert!(h.manager.handles().is_empty());
    assert_eq!(h.observed().len(), 1);
}

#[tokio::test]
async fn test_unresolved_pool_id_reports_error() {
    let mut h = Harness::new(PoolPolicy::default());
    let sink = h.results.clone();
    let config = PoolConfig::new(zar_core::pool::PoolIdSource::resolver(|| None), ".phone")
        .with_observer(move |r: &PoolResult| sink.lock().unwrap().push(r.clone()));

    let result = h.manager.init_tracking_pool(config, None).await;
    assert_eq!(result.msg.as_deref(), Some("no pool ID"));
    assert!(h.manager.pool_ids().is_empty());
    assert_eq!(h.observed().len(), 1);
}

#[tokio::test]
async fn test_renewal_interval_override_is_validated() {
    let mut h = Harness::new(PoolPolicy {
        min_renewal_gap_ms: 0,
        ..Default::default()
    });
    let config = h.config("1", ".phone").with_renewal_interval(Duration::ZERO);
    let result = h.manager.init_tracking_pool(config, None).await;

    assert!(!result.is_success());
    assert_eq!(
        result.msg.as_deref(),
        Some("renewal interval must be greater than zero")
    );
    assert!(h.transport.sent_to("number_pool").is_empty());
    assert!(h.manager.handles().is_empty());
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");

    // Nothing scheduled, so the loop returns instead of spinning
    h.manager
        .run_until(tokio::time::sleep(Duration::from_millis(50)))
        .await;
    assert!(h.transport.sent_to("number_pool").is_empty());
    assert_eq!(h.observed().len(), 1);
}

#[tokio::test]
async fn test_renewal_interval_shorter_than_gap_is_rejected() {
    let mut h = Harness::new(PoolPolicy::default());
    let config = h.config("1", ".phone").with_renewal_interval(5 * SECOND);
    let result = h.manager.init_tracking_pool(config, None).await;

    assert!(!result.is_success());
    assert!(result
        .msg
        .as_deref()
        .unwrap_or_default()
        .contains("shorter than the minimum gap"));
    assert!(h.transport.sent_to("number_pool").is_empty());
    assert!(!h.manager.is_running("1"));

    // An interval equal to the gap is accepted
    h.transport.grant("6505550000");
    let config = h.config("1", ".phone").with_renewal_interval(10 * SECOND);
    assert!(h.manager.init_tracking_pool(config, None).await.is_success());
    assert!(h.manager.is_running("1"));
}

#[tokio::test]
async fn test_denied_lease_leaves_page_untouched() {
    let mut h = Harness::new(PoolPolicy::default());
    h.transport.reply(
        "number_pool",
        Reply::Json(json!({"status": "error", "number": null, "msg": "no numbers available"})),
    );

    let config = h.config("1", ".phone");
    let result = h.manager.init_tracking_pool(config, None).await;

    assert!(!result.is_success());
    assert_eq!(result.msg.as_deref(), Some("no numbers available"));
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");
    assert!(h.manager.handles().is_empty());
    assert!(h.manager.lease("1").is_none());
}

#[tokio::test]
async fn test_page_response_pool_data_skips_lease_request() {
    let mut h = Harness::new(PoolPolicy::default());
    let response: PageResponse = serde_json::from_value(json!({
        "vid": "v", "sid": "s", "cid": "c", "id": 1,
        "pool_data": {"status": "success", "pool_id": 1, "number": "6505557777",
                      "sid_ctx": {"utm_source": "search"}}
    }))
    .unwrap();

    let config = h.config("1", ".phone");
    let result = h.manager.handle_page_response(config, &response).await.unwrap();

    assert!(result.is_success());
    assert!(h.transport.sent_to("number_pool").is_empty());
    assert_eq!(h.text(h.page.main), "Call 650-555-7777");
    assert_eq!(
        h.manager.lease("1").unwrap().session_context,
        Some(json!({"utm_source": "search"}))
    );

    let bare = PageResponse::default();
    let config = h.config("1", ".phone");
    assert!(h.manager.handle_page_response(config, &bare).await.is_none());
}

// ============================================
// Renewal
// ============================================

#[tokio::test]
async fn test_renewal_keeps_number_and_overlay() {
    let mut h = Harness::new(PoolPolicy::default());
    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;

    assert!(h.tick(29 * SECOND).await.is_empty());
    let results = h.tick(SECOND).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());
    assert!(results[0].renew);

    let requests = h.transport.sent_to("number_pool");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1]["number"], "6505550000");
    assert_eq!(h.text(h.page.main), "Call 650-555-0000");
    assert!(h.observed().last().unwrap().renew);
}

#[tokio::test]
async fn test_changed_number_is_force_overlaid() {
    let mut h = Harness::new(PoolPolicy::default());
    h.transport.grant("6505550000");
    h.transport.grant("6505559999");

    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;

    let logs = TestWriter::default();
    let guard = logs.capture();
    h.tick(30 * SECOND).await;
    drop(guard);

    let warnings = logs.contents();
    assert!(warnings.contains("Pool number changed"), "got logs:\n{warnings}");
    assert!(warnings.contains("6505559999"));

    assert_eq!(h.text(h.page.main), "Call 650-555-9999");
    assert_eq!(h.href(h.page.main).as_deref(), Some("tel:+16505559999"));
    assert_eq!(h.text(h.page.footer), "Or dial +16505559999");
    assert_eq!(
        h.manager.lease("1").unwrap().number.as_deref(),
        Some("6505559999")
    );

    // Reverting still restores what the page had before any overlay
    h.manager.clear_all();
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");
}

#[tokio::test]
async fn test_lost_lease_reverts_and_stops_pool() {
    let mut h = Harness::new(PoolPolicy::default());
    h.transport.grant("6505550000");
    h.transport.reply(
        "number_pool",
        Reply::Json(json!({"status": "error", "number": null, "msg": "lease expired"})),
    );

    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;
    let results = h.tick(30 * SECOND).await;

    assert_eq!(results[0].status, LeaseStatus::Error);
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");
    assert!(!h.manager.is_running("1"));

    let lease = h.manager.lease("1").unwrap();
    assert_eq!(lease.status, LeaseStatus::Error);
    assert_eq!(lease.msg.as_deref(), Some("lease expired"));

    // Nothing left to renew
    assert!(h.tick(30 * SECOND).await.is_empty());
    assert!(h.manager.on_visibility_change(Visibility::Visible).await.is_empty());
}

#[tokio::test]
async fn test_min_gap_skips_early_triggers() {
    let mut h = Harness::new(PoolPolicy::default());
    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;

    h.clock.advance(5 * SECOND);
    let results = h.manager.on_visibility_change(Visibility::Visible).await;
    assert_eq!(results[0].msg.as_deref(), Some("skipped"));
    assert_eq!(h.transport.sent_to("number_pool").len(), 1);

    h.clock.advance(7 * SECOND);
    let results = h.manager.on_page_show(true).await;
    assert!(results[0].is_success());
    assert_eq!(results[0].msg, None);
    assert_eq!(h.transport.sent_to("number_pool").len(), 2);

    // Scheduled tick at 30s is 18s after the triggered renewal
    h.tick(18 * SECOND).await;
    assert_eq!(h.transport.sent_to("number_pool").len(), 3);
}

// ============================================
// Circuit breaker
// ============================================

#[tokio::test]
async fn test_global_breaker_stops_every_pool() {
    let mut h = Harness::new(PoolPolicy::default());
    let main = h.config("1", ".phone");
    let alt = h.config("2", ".alt-phone");
    h.manager.init_tracking_pool(main, None).await;
    h.manager.init_tracking_pool(alt, None).await;
    assert_eq!(h.text(h.page.alt), "650-555-0000");

    for _ in 0..3 {
        h.transport.reply("number_pool", Reply::Fail);
    }

    // Both pools fail at 30s, pool 1 fails again at 60s and trips the breaker
    h.tick(30 * SECOND).await;
    assert_eq!(h.manager.failure_count(), 2);
    let results = h.tick(30 * SECOND).await;
    assert_eq!(results.len(), 1);

    assert!(h.manager.is_stopped());
    assert!(h.manager.handles().is_empty());
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");
    assert_eq!(h.text(h.page.alt), "800-555-0100");
    assert_eq!(h.href(h.page.alt).as_deref(), Some("tel:8005550100"));

    let before = h.transport.sent_to("number_pool").len();
    let result = h.manager.renew("2", false).await;
    assert_eq!(result.msg.as_deref(), Some("stopped"));
    assert!(h.manager.on_visibility_change(Visibility::Visible).await.is_empty());
    assert_eq!(h.transport.sent_to("number_pool").len(), before);

    // A new initialization clears the stop flag and the counter
    let main = h.config("1", ".phone");
    assert!(h.manager.init_tracking_pool(main, None).await.is_success());
    assert!(!h.manager.is_stopped());
    assert_eq!(h.manager.failure_count(), 0);
}

#[tokio::test]
async fn test_per_pool_breaker_spares_healthy_pools() {
    let policy = PoolPolicy {
        failure_scope: FailureScope::PerPool,
        ..Default::default()
    };
    let mut h = Harness::new(policy);
    let main = h.config("1", ".phone");
    let alt = h.config("2", ".alt-phone").with_renewal_interval(40 * SECOND);
    h.manager.init_tracking_pool(main, None).await;
    h.manager.init_tracking_pool(alt, None).await;

    // Pool 1 renews at 30s, 60s and 90s; pool 2 at 40s and 80s
    for _ in 0..3 {
        h.transport.reply_for("number_pool", "1", Reply::Fail);
    }
    for _ in 0..9 {
        h.tick(10 * SECOND).await;
    }

    assert!(!h.manager.is_stopped());
    assert!(!h.manager.is_running("1"));
    assert!(h.manager.is_running("2"));
    assert_eq!(h.manager.lease("1").unwrap().error_count, 3);
    assert_eq!(h.text(h.page.main), "Call 650-555-1234");
    assert_eq!(h.text(h.page.alt), "650-555-0000");
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let mut h = Harness::new(PoolPolicy::default());
    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;

    h.transport.reply("number_pool", Reply::Fail);
    h.transport.reply("number_pool", Reply::Fail);
    h.tick(30 * SECOND).await;
    h.tick(30 * SECOND).await;
    assert_eq!(h.manager.failure_count(), 2);
    assert_eq!(h.text(h.page.main), "Call 650-555-0000");

    h.tick(30 * SECOND).await;
    assert_eq!(h.manager.failure_count(), 0);
    assert_eq!(h.manager.lease("1").unwrap().error_count, 0);
    assert!(h.manager.is_running("1"));

    let failures: Vec<_> = h
        .observed()
        .into_iter()
        .filter(|r| r.renew && !r.is_success())
        .collect();
    assert_eq!(failures.len(), 2);
}

// ============================================
// Context
// ============================================

#[tokio::test]
async fn test_context_reaches_lease_requests_and_updates() {
    let mut h = Harness::new(PoolPolicy::default());
    h.manager
        .data_layer()
        .push(context(json!({"gclid": "abc", "step": 1})));
    h.manager.data_layer().push(context(json!({"step": 2})));

    let config = h.config("1", ".phone").with_context_strategy(
        |mut ctx: ContextMap| -> Result<ContextMap> {
            ctx.insert("landing".to_string(), json!("/pricing"));
            Ok(ctx)
        },
    );
    h.manager.init_tracking_pool(config, None).await;

    let lease = &h.transport.sent_to("number_pool")[0];
    assert_eq!(
        lease["context"],
        json!({"gclid": "abc", "step": 2, "landing": "/pricing"})
    );
    assert!(h.manager.data_layer().is_empty());

    let updated = h
        .manager
        .push_context(context(json!({"form": "quote"})))
        .await;
    assert_eq!(updated, 1);
    let updates = h.transport.sent_to("update_number");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["number"], "6505550000");
    assert_eq!(updates[0]["context"], json!({"form": "quote"}));

    // Renewals carry only what arrived since, still augmented
    h.tick(30 * SECOND).await;
    let renewal = &h.transport.sent_to("number_pool")[1];
    assert_eq!(renewal["context"], json!({"landing": "/pricing"}));
}

#[tokio::test]
async fn test_context_without_active_lease_stays_buffered() {
    let mut h = Harness::new(PoolPolicy::default());

    let updated = h.manager.push_context(context(json!({"gclid": "abc"}))).await;
    assert_eq!(updated, 0);
    assert_eq!(h.manager.data_layer().len(), 1);
    assert!(h
        .manager
        .update_context("1", context(json!({"x": 1})))
        .await
        .unwrap()
        .is_none());

    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;
    assert_eq!(
        h.transport.sent_to("number_pool")[0]["context"],
        json!({"gclid": "abc"})
    );
    assert!(h.transport.sent_to("update_number").is_empty());
}

#[tokio::test]
async fn test_failed_requests_keep_context_for_next_attempt() {
    let mut h = Harness::new(PoolPolicy::default());
    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;

    h.transport.reply("update_number", Reply::Fail);
    h.transport.reply("number_pool", Reply::Fail);

    let updated = h.manager.push_context(context(json!({"form": "quote"}))).await;
    assert_eq!(updated, 0);
    assert_eq!(h.manager.data_layer().len(), 1);

    h.manager.data_layer().push(context(json!({"page": 2})));
    h.tick(30 * SECOND).await;
    assert_eq!(h.manager.data_layer().len(), 1);

    h.tick(30 * SECOND).await;
    assert_eq!(
        h.transport.sent_to("number_pool")[2]["context"],
        json!({"form": "quote", "page": 2})
    );
    assert!(h.manager.data_layer().is_empty());
}

#[tokio::test]
async fn test_restored_context_does_not_override_newer_pushes() {
    let mut h = Harness::new(PoolPolicy::default());
    let config = h.config("1", ".phone");
    h.manager.init_tracking_pool(config, None).await;

    let producer = h.manager.data_layer().clone();
    producer.push(context(json!({"step": "cart", "gclid": "abc"})));
    h.transport.reply("number_pool", Reply::Fail);
    h.tick(30 * SECOND).await;

    producer.push(context(json!({"step": "checkout"})));
    h.tick(30 * SECOND).await;

    let requests = h.transport.sent_to("number_pool");
    assert_eq!(
        requests[1]["context"],
        json!({"step": "cart", "gclid": "abc"})
    );
    assert_eq!(
        requests[2]["context"],
        json!({"step": "checkout", "gclid": "abc"})
    );
}

// ============================================
// Real-time driving
// ============================================

#[tokio::test]
async fn test_run_until_renews_in_real_time() {
    let (dom, page) = page_dom();
    let transport = Arc::new(ScriptedTransport::default());
    let clock = Arc::new(SystemClock);
    let identity = IdentityStore::new(
        Box::new(MemoryStorage::new()),
        IdentityPolicy::default(),
        clock.clone(),
    );
    let client = PoolClient::new(transport.clone(), "https://api.test/api/v2");
    let policy = PoolPolicy {
        min_renewal_gap_ms: 0,
        ..Default::default()
    };
    let mut manager = PoolManager::new(Box::new(dom), identity, client, clock, policy);

    let config = PoolConfig::new("1", ".phone").with_renewal_interval(Duration::from_millis(20));
    manager.init_tracking_pool(config, None).await;
    manager
        .run_until(tokio::time::sleep(Duration::from_millis(200)))
        .await;

    assert!(transport.sent_to("number_pool").len() >= 3);
    assert!(manager.is_running("1"));
    assert!(manager.overlay().is_overlaid(page.main));
}
