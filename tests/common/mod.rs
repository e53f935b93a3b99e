#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use storefront_api::{
    app_router,
    config::AppConfig,
    db,
    entities::{audit_entry, cart, cart_line, order, product, variant, FulfillmentStatus, PaymentStatus},
    services::notifications::{
        NotificationError, Notifier, OrderConfirmation, RefundNotice, ShippedNotice,
    },
    services::payments::{
        CheckoutSessionRequest, PaymentProvider, PaymentProviderError, ProviderCheckoutSession,
        ProviderRefund, RefundRequest,
    },
    webhooks::sign_payload,
    AppState,
};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_KEY: &str = "internal-key-current";
pub const NEXT_ADMIN_KEY: &str = "internal-key-next";

/// Payment provider double that hands out sequential ids and records calls.
#[derive(Default)]
pub struct FakeProvider {
    counter: AtomicU32,
    pub refunds: Mutex<Vec<RefundRequest>>,
    pub sessions: Mutex<Vec<CheckoutSessionRequest>>,
    pub fail_refunds: std::sync::atomic::AtomicBool,
    /// When set, a repeated idempotency key returns the refund created the first time.
    pub replay_by_key: std::sync::atomic::AtomicBool,
    issued: Mutex<HashMap<String, ProviderRefund>>,
}

impl FakeProvider {
    pub fn refund_calls(&self) -> Vec<RefundRequest> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn set_refunds_failing(&self, failing: bool) {
        self.fail_refunds.store(failing, Ordering::SeqCst);
    }

    pub fn set_replaying(&self, replaying: bool) {
        self.replay_by_key.store(replaying, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_refund(
        &self,
        request: RefundRequest,
    ) -> Result<ProviderRefund, PaymentProviderError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(PaymentProviderError::Transport("connection reset".into()));
        }
        let replaying = self.replay_by_key.load(Ordering::SeqCst);
        if replaying {
            if let Some(existing) = self.issued.lock().unwrap().get(&request.idempotency_key) {
                return Ok(existing.clone());
            }
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let refund = ProviderRefund {
            id: format!("re_test_{}", n),
            amount_cents: request.amount_cents,
            status: Some("succeeded".into()),
        };
        self.issued
            .lock()
            .unwrap()
            .insert(request.idempotency_key.clone(), refund.clone());
        self.refunds.lock().unwrap().push(request);
        Ok(refund)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<ProviderCheckoutSession, PaymentProviderError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.sessions.lock().unwrap().push(request);
        Ok(ProviderCheckoutSession {
            id: format!("cs_test_{}", n),
            url: format!("https://checkout.test/pay/cs_test_{}", n),
        })
    }
}

/// Notifier double that keeps every message it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub confirmations: Mutex<Vec<OrderConfirmation>>,
    pub refund_notices: Mutex<Vec<RefundNotice>>,
    pub shipped_notices: Mutex<Vec<ShippedNotice>>,
    pub alerts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn confirmation_count(&self) -> usize {
        self.confirmations.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        self.confirmations.lock().unwrap().push(confirmation.clone());
        Ok(())
    }

    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotificationError> {
        self.refund_notices.lock().unwrap().push(notice.clone());
        Ok(())
    }

    async fn send_shipped_notice(&self, notice: &ShippedNotice) -> Result<(), NotificationError> {
        self.shipped_notices.lock().unwrap().push(notice.clone());
        Ok(())
    }

    async fn send_operator_alert(
        &self,
        subject: &str,
        _detail: &str,
    ) -> Result<(), NotificationError> {
        self.alerts.lock().unwrap().push(subject.to_string());
        Ok(())
    }
}

/// Defaults for the harness; the database url is filled in per app.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        String::new(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.db_max_connections = 4;
    cfg.db_min_connections = 1;
    cfg.db_idle_timeout_secs = 3600;
    cfg.payment_webhook_secret = WEBHOOK_SECRET.to_string();
    cfg.internal_admin_key = Some(ADMIN_KEY.to_string());
    cfg.internal_admin_key_next = Some(NEXT_ADMIN_KEY.to_string());
    cfg.notification_poll_attempts = 2;
    cfg.notification_poll_delay_ms = 1;
    cfg.app_url = "https://shop.test".to_string();
    cfg
}

/// Helper harness for spinning up an application state backed by a pooled, file-backed SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
    pub notifier: Arc<RecordingNotifier>,
    _db_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(mut cfg: AppConfig) -> Self {
        let db_dir = TempDir::new().expect("failed to create database dir");
        cfg.database_url = format!(
            "sqlite://{}?mode=rwc",
            db_dir.path().join("ledger.db").display()
        );
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let provider = Arc::new(FakeProvider::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let state = AppState::new(
            Arc::new(pool),
            cfg,
            provider.clone(),
            notifier.clone(),
            None,
        );

        Self {
            router: app_router(state.clone()),
            state,
            provider,
            notifier,
            _db_dir: db_dir,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a request against the router with optional JSON body and extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    /// JSON request carrying the current internal key.
    pub async fn internal(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request(method, uri, body, &[("x-internal-key", ADMIN_KEY)])
            .await
    }

    /// Delivers a correctly signed provider event.
    pub async fn deliver(&self, event: &Value) -> Response {
        let payload = serde_json::to_vec(event).expect("serialize event");
        let ts = Utc::now().timestamp().to_string();
        let signature = sign_payload(WEBHOOK_SECRET, &ts, &payload);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks/payments")
            .header("content-type", "application/json")
            .header("stripe-signature", format!("t={},v1={}", ts, signature))
            .body(Body::from(payload))
            .expect("failed to build webhook request");
        self.send(request).await
    }

    pub async fn seed_variant(
        &self,
        product_title: &str,
        variant_title: Option<&str>,
        price_cents: i64,
        vat_rate: Decimal,
        stock_qty: Option<i32>,
    ) -> variant::Model {
        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(product_title.to_string()),
            created_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product");

        variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            title: Set(variant_title.map(str::to_string)),
            price_cents: Set(price_cents),
            currency: Set("EUR".to_string()),
            vat_rate: Set(vat_rate),
            stock_qty: Set(stock_qty),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed variant")
    }

    /// Cart with a contact email and shipping address.
    pub async fn seed_cart(&self, lines: &[(&variant::Model, i32)]) -> Uuid {
        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(None),
            email: Set(Some("shopper@example.com".to_string())),
            currency: Set("EUR".to_string()),
            shipping_name: Set(Some("Ada Lovelace".to_string())),
            shipping_phone: Set(None),
            shipping_addr1: Set(Some("Mannerheimintie 1".to_string())),
            shipping_addr2: Set(None),
            shipping_city: Set(Some("Helsinki".to_string())),
            shipping_postal: Set(Some("00100".to_string())),
            shipping_country: Set(Some("FI".to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed cart");

        for (variant, quantity) in lines {
            cart_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                variant_id: Set(variant.id),
                quantity: Set(*quantity),
                unit_price_cents: Set(variant.price_cents),
                created_at: Set(now),
            }
            .insert(self.db())
            .await
            .expect("seed cart line");
        }
        cart.id
    }

    /// Paid order inserted directly, bypassing the webhook flow.
    pub async fn seed_paid_order(&self, total_cents: i64, intent_id: Option<&str>) -> order::Model {
        let now = Utc::now();
        order::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(None),
            email: Set(Some("shopper@example.com".to_string())),
            currency: Set("EUR".to_string()),
            subtotal_cents: Set(total_cents),
            tax_cents: Set(0),
            shipping_cents: Set(0),
            total_cents: Set(total_cents),
            shipping_name: Set(Some("Ada Lovelace".to_string())),
            shipping_phone: Set(None),
            shipping_addr1: Set(Some("Mannerheimintie 1".to_string())),
            shipping_addr2: Set(None),
            shipping_city: Set(Some("Helsinki".to_string())),
            shipping_postal: Set(Some("00100".to_string())),
            shipping_country: Set(Some("FI".to_string())),
            provider_session_id: Set(Some(format!("cs_{}", Uuid::new_v4().simple()))),
            provider_intent_id: Set(intent_id.map(str::to_string)),
            cart_id: Set(None),
            payment_status: Set(PaymentStatus::Paid),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            failure_reason: Set(None),
            carrier: Set(None),
            tracking_number: Set(None),
            tracking_url: Set(None),
            confirmation_email_sent: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed order")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn orders_for_session(&self, session_id: &str) -> Vec<order::Model> {
        order::Entity::find()
            .filter(order::Column::ProviderSessionId.eq(session_id))
            .all(self.db())
            .await
            .expect("load orders")
    }

    pub async fn order_count(&self) -> usize {
        order::Entity::find()
            .all(self.db())
            .await
            .expect("load orders")
            .len()
    }

    pub async fn variant(&self, id: Uuid) -> variant::Model {
        variant::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("load variant")
            .expect("variant exists")
    }

    pub async fn audit_events(&self) -> Vec<String> {
        audit_entry::Entity::find()
            .all(self.db())
            .await
            .expect("load audit entries")
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("response is json")
}

pub fn checkout_completed(
    event_id: &str,
    session_id: &str,
    cart_id: Uuid,
    intent_id: Option<&str>,
) -> Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": session_id,
            "object": "checkout.session",
            "payment_intent": intent_id,
            "metadata": { "cart_id": cart_id.to_string() },
        }}
    })
}

pub fn event(event_id: &str, event_type: &str, object: Value) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": object }
    })
}
