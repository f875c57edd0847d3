#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use courier_api::outbound::{PlatformMessage, SendCapability, SendFailure, SendReceipt};
use courier_api::{AppState, AppStateInner, RelayConfig};
use courier_crypto::credentials::CredentialVault;
use courier_crypto::signature::{SIGNATURE_HEADER, sign};
use courier_db::Database;
use courier_types::models::{Account, AccountId};

pub const APP_SECRET: &str = "app-secret";
pub const VERIFY_TOKEN: &str = "verify-me";
pub const API_TOKEN: &str = "api-token";

/// Send capability that counts calls and answers from a script.
pub struct CountingSender {
    calls: AtomicUsize,
    delay: Duration,
    failure: Option<SendFailure>,
}

impl CountingSender {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failure: None,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failure: None,
        })
    }

    pub fn failing(failure: SendFailure) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failure: Some(failure),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SendCapability for CountingSender {
    async fn send(&self, _message: &PlatformMessage<'_>) -> Result<SendReceipt, SendFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(SendReceipt::new(format!("mid.out.{n}"))),
        }
    }
}

pub struct Harness {
    pub state: AppState,
    pub app: Router,
    pub sender: Arc<CountingSender>,
    pub vault: CredentialVault,
    pub media: TempDir,
}

pub fn config(media_root: &std::path::Path) -> RelayConfig {
    RelayConfig {
        app_secret: APP_SECRET.into(),
        verify_token: VERIFY_TOKEN.into(),
        api_token: API_TOKEN.into(),
        media_root: media_root.to_path_buf(),
        public_media_url: "https://relay.test/media".into(),
        send_timeout: Duration::from_secs(2),
        crm_timeout: Duration::from_secs(2),
        effect_workers: 2,
        effect_queue: 16,
        ..RelayConfig::default()
    }
}

/// In-memory relay with `acc_1` (platform `P0`, channel `C1`) linked.
pub fn harness(sender: Arc<CountingSender>) -> Harness {
    harness_with(sender, None)
}

pub fn harness_with(sender: Arc<CountingSender>, crm_url: Option<String>) -> Harness {
    let media = tempfile::tempdir().unwrap();
    let vault = CredentialVault::new([7u8; 32]);
    let db = Database::open_in_memory().unwrap();

    let mut acc_1 = account(&vault, "acc_1", "P0", "C1");
    acc_1.crm_webhook_url = crm_url;
    db.insert_account(&acc_1).unwrap();

    let state = AppStateInner::new(db, config(media.path()), vault.clone(), sender.clone()).unwrap();
    let app = courier_api::router(state.clone());

    Harness {
        state,
        app,
        sender,
        vault,
        media,
    }
}

pub fn account(vault: &CredentialVault, id: &str, platform_id: &str, channel_id: &str) -> Account {
    Account {
        id: AccountId::new(id),
        platform_account_id: platform_id.into(),
        channel_id: channel_id.into(),
        webhook_secret: format!("{id}-crm-secret"),
        crm_webhook_url: None,
        credential: vault.seal(&format!("{id}-page-token")).unwrap(),
        created_at: Utc::now(),
    }
}

pub async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

pub fn authed_json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {API_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authed_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {API_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

pub fn signed_webhook(payload: &Value) -> Request<Body> {
    let body = payload.to_string();
    let signature = sign(body.as_bytes(), APP_SECRET).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(SIGNATURE_HEADER, signature)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

pub fn message_event(recipient_id: &str, mid: &str, text: &str) -> Value {
    serde_json::json!({
        "sender": {"id": "u_1"},
        "recipient": {"id": recipient_id},
        "timestamp": 1700000000000i64,
        "message": {"mid": mid, "text": text},
    })
}

pub fn delivery(channel_id: &str, events: Vec<Value>) -> Value {
    serde_json::json!({
        "object": "instagram",
        "entry": [{ "id": channel_id, "time": 1700000000000i64, "messaging": events }]
    })
}

pub fn send_body(text: &str, key: &str) -> Value {
    serde_json::json!({
        "account_id": "acc_1",
        "recipient_id": "u_1",
        "text": text,
        "idempotency_key": key,
    })
}
