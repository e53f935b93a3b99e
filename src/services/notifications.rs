//! Customer and operator notifications.
//!
//! Two delivery modes:
//! 1. POST a JSON message to a mail relay (`notification_relay_url`)
//! 2. Log only, when no relay is configured
//!
//! Every send is best-effort. The one stateful flow is the order
//! confirmation, which [`NotificationDispatcher`] sends at most once per
//! order and only after the order is fully populated.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{order, order_line};
use crate::errors::ServiceError;
use crate::retry::{poll_until_ready, PollOutcome, RetryPolicy};
use crate::services::audit::{self, Actor, AuditEvent};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification relay rejected message ({0})")]
    Rejected(u16),
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        NotificationError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationLine {
    pub title: String,
    pub sku: String,
    pub quantity: i32,
    pub line_total_cents: i64,
}

/// Snapshot of an order as shown in the confirmation email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderConfirmation {
    pub order_id: Uuid,
    pub email: String,
    pub currency: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub shipping_name: Option<String>,
    pub shipping_addr1: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_postal: Option<String>,
    pub shipping_country: Option<String>,
    pub lines: Vec<ConfirmationLine>,
}

impl OrderConfirmation {
    pub fn new(order: &order::Model, email: String, lines: &[order_line::Model]) -> Self {
        Self {
            order_id: order.id,
            email,
            currency: order.currency.clone(),
            subtotal_cents: order.subtotal_cents,
            tax_cents: order.tax_cents,
            shipping_cents: order.shipping_cents,
            total_cents: order.total_cents,
            shipping_name: order.shipping_name.clone(),
            shipping_addr1: order.shipping_addr1.clone(),
            shipping_city: order.shipping_city.clone(),
            shipping_postal: order.shipping_postal.clone(),
            shipping_country: order.shipping_country.clone(),
            lines: lines
                .iter()
                .map(|l| ConfirmationLine {
                    title: l.title.clone(),
                    sku: l.sku.clone(),
                    quantity: l.quantity,
                    line_total_cents: l.line_total_cents,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundNotice {
    pub order_id: Uuid,
    pub email: String,
    pub currency: String,
    pub amount_cents: i64,
    pub remaining_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShippedNotice {
    pub order_id: Uuid,
    pub email: String,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError>;

    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotificationError>;

    async fn send_shipped_notice(&self, notice: &ShippedNotice) -> Result<(), NotificationError>;

    async fn send_operator_alert(&self, subject: &str, detail: &str)
        -> Result<(), NotificationError>;
}

/// Message posted to the mail relay.
#[derive(Debug, Serialize)]
struct RelayMessage<'a, T: Serialize> {
    event: &'static str,
    from: &'a str,
    to: &'a str,
    subject: String,
    data: &'a T,
}

/// Posts messages to an HTTP mail relay.
#[derive(Clone)]
pub struct RelayNotifier {
    http: reqwest::Client,
    relay_url: String,
    from: String,
    alert_recipient: Option<String>,
}

impl RelayNotifier {
    pub fn new(
        relay_url: impl Into<String>,
        from: impl Into<String>,
        alert_recipient: Option<String>,
    ) -> Result<Self, NotificationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            relay_url: relay_url.into(),
            from: from.into(),
            alert_recipient,
        })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        event: &'static str,
        to: &str,
        subject: String,
        data: &T,
    ) -> Result<(), NotificationError> {
        let message = RelayMessage {
            event,
            from: &self.from,
            to,
            subject,
            data,
        };
        let response = self.http.post(&self.relay_url).json(&message).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotificationError::Rejected(status.as_u16()))
        }
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        let subject = format!("Order confirmation #{}", short_id(confirmation.order_id));
        self.post("order_confirmation", &confirmation.email, subject, confirmation)
            .await
    }

    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotificationError> {
        let subject = format!("Refund for order #{}", short_id(notice.order_id));
        self.post("refund_notice", &notice.email, subject, notice).await
    }

    async fn send_shipped_notice(&self, notice: &ShippedNotice) -> Result<(), NotificationError> {
        let subject = format!("Order #{} has shipped", short_id(notice.order_id));
        self.post("shipped_notice", &notice.email, subject, notice).await
    }

    async fn send_operator_alert(
        &self,
        subject: &str,
        detail: &str,
    ) -> Result<(), NotificationError> {
        let Some(to) = self.alert_recipient.as_deref() else {
            return Ok(());
        };
        self.post(
            "operator_alert",
            to,
            subject.to_string(),
            &json!({ "detail": detail }),
        )
        .await
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        info!(
            order_id = %confirmation.order_id,
            total_cents = confirmation.total_cents,
            "order confirmation (log only)"
        );
        Ok(())
    }

    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotificationError> {
        info!(
            order_id = %notice.order_id,
            amount_cents = notice.amount_cents,
            remaining_cents = notice.remaining_cents,
            "refund notice (log only)"
        );
        Ok(())
    }

    async fn send_shipped_notice(&self, notice: &ShippedNotice) -> Result<(), NotificationError> {
        info!(order_id = %notice.order_id, "shipped notice (log only)");
        Ok(())
    }

    async fn send_operator_alert(
        &self,
        subject: &str,
        detail: &str,
    ) -> Result<(), NotificationError> {
        warn!(subject, detail, "operator alert (log only)");
        Ok(())
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_uppercase()
}

/// What happened to an order confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Sent,
    AlreadySent,
    Deferred,
    Failed,
}

enum Readiness {
    AlreadySent,
    Ready(order::Model, Vec<order_line::Model>),
}

/// Drives the confirmation email and the best-effort notices.
#[derive(Clone)]
pub struct NotificationDispatcher {
    db: Arc<DatabaseConnection>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(db: Arc<DatabaseConnection>, notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self {
            db,
            notifier,
            policy,
        }
    }

    async fn readiness(&self, order_id: Uuid) -> Result<Option<Readiness>, ServiceError> {
        let Some(order) = order::Entity::find_by_id(order_id).one(&*self.db).await? else {
            return Ok(None);
        };
        if order.confirmation_email_sent {
            return Ok(Some(Readiness::AlreadySent));
        }

        let line_count = order_line::Entity::find()
            .filter(order_line::Column::OrderId.eq(order_id))
            .count(&*self.db)
            .await?;
        if !order.is_confirmation_ready(line_count) {
            return Ok(None);
        }

        let lines = order_line::Entity::find()
            .filter(order_line::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(Some(Readiness::Ready(order, lines)))
    }

    /// Sends the order confirmation once the order is paid and populated.
    ///
    /// Polls with the configured policy; on exhaustion a deferred entry is
    /// audited and nothing is sent. The sent flag is claimed with a
    /// conditional update before sending, so concurrent callers cannot both
    /// send, and it is not released when delivery fails.
    #[instrument(skip(self))]
    pub async fn confirm_when_ready(&self, order_id: Uuid) -> Result<ConfirmationOutcome, ServiceError> {
        let outcome = poll_until_ready(self.policy, || self.readiness(order_id)).await?;

        let (order, lines) = match outcome {
            PollOutcome::Ready {
                value: Readiness::AlreadySent,
                ..
            } => return Ok(ConfirmationOutcome::AlreadySent),
            PollOutcome::Ready {
                value: Readiness::Ready(order, lines),
                ..
            } => (order, lines),
            PollOutcome::Exhausted { attempts } => {
                info!(attempts, "order not ready for confirmation, deferring");
                audit::record(
                    &*self.db,
                    AuditEvent::ConfirmationDeferred,
                    Some(order_id),
                    &Actor::system(),
                    json!({ "attempts": attempts }),
                )
                .await?;
                return Ok(ConfirmationOutcome::Deferred);
            }
        };

        let claimed = order::Entity::update_many()
            .col_expr(order::Column::ConfirmationEmailSent, Expr::value(true))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::ConfirmationEmailSent.eq(false))
            .exec(&*self.db)
            .await?;
        if claimed.rows_affected == 0 {
            return Ok(ConfirmationOutcome::AlreadySent);
        }

        // readiness guarantees an email
        let email = order.email.clone().unwrap_or_default();
        let confirmation = OrderConfirmation::new(&order, email, &lines);
        self.deliver_confirmation(&confirmation, false).await
    }

    /// Sends the confirmation again regardless of the sent flag.
    #[instrument(skip(self))]
    pub async fn resend_confirmation(&self, order_id: Uuid) -> Result<ConfirmationOutcome, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let email = order
            .email
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ServiceError::ValidationError("Order has no contact email".into()))?;
        let lines = order_line::Entity::find()
            .filter(order_line::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;

        order::Entity::update_many()
            .col_expr(order::Column::ConfirmationEmailSent, Expr::value(true))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;

        let confirmation = OrderConfirmation::new(&order, email, &lines);
        self.deliver_confirmation(&confirmation, true).await
    }

    async fn deliver_confirmation(
        &self,
        confirmation: &OrderConfirmation,
        resend: bool,
    ) -> Result<ConfirmationOutcome, ServiceError> {
        let order_id = confirmation.order_id;
        match self.notifier.send_order_confirmation(confirmation).await {
            Ok(()) => {
                info!(%order_id, resend, "order confirmation sent");
                audit::record(
                    &*self.db,
                    AuditEvent::ConfirmationSent,
                    Some(order_id),
                    &Actor::system(),
                    json!({ "resend": resend }),
                )
                .await?;
                Ok(ConfirmationOutcome::Sent)
            }
            Err(err) => {
                warn!(%order_id, error = %err, "order confirmation failed");
                audit::record(
                    &*self.db,
                    AuditEvent::ConfirmationFailed,
                    Some(order_id),
                    &Actor::system(),
                    json!({ "resend": resend, "error": err.to_string() }),
                )
                .await?;
                Ok(ConfirmationOutcome::Failed)
            }
        }
    }

    pub async fn notify_refund(&self, order: &order::Model, amount_cents: i64, remaining_cents: i64) {
        let Some(email) = order.email.clone() else {
            return;
        };
        let notice = RefundNotice {
            order_id: order.id,
            email,
            currency: order.currency.clone(),
            amount_cents,
            remaining_cents,
        };
        if let Err(err) = self.notifier.send_refund_notice(&notice).await {
            warn!(order_id = %order.id, error = %err, "refund notice failed");
        }
    }

    pub async fn notify_shipped(&self, order: &order::Model) {
        let Some(email) = order.email.clone() else {
            return;
        };
        let notice = ShippedNotice {
            order_id: order.id,
            email,
            carrier: order.carrier.clone(),
            tracking_number: order.tracking_number.clone(),
            tracking_url: order.tracking_url.clone(),
        };
        if let Err(err) = self.notifier.send_shipped_notice(&notice).await {
            warn!(order_id = %order.id, error = %err, "shipped notice failed");
        }
    }

    pub async fn alert_operator(&self, subject: &str, detail: &str) {
        if let Err(err) = self.notifier.send_operator_alert(subject, detail).await {
            warn!(subject, error = %err, "operator alert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_ledger;
    use crate::entities::audit_entry;
    use crate::entities::{FulfillmentStatus, PaymentStatus};
    use rust_decimal_macros::dec;
    use sea_orm::{ActiveModelTrait, Set};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    async fn seed_order(
        db: &DatabaseConnection,
        status: PaymentStatus,
        email: Option<&str>,
        with_line: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        order::ActiveModel {
            id: Set(id),
            customer_id: Set(None),
            email: Set(email.map(str::to_string)),
            currency: Set("EUR".into()),
            subtotal_cents: Set(1000),
            tax_cents: Set(240),
            shipping_cents: Set(0),
            total_cents: Set(1240),
            shipping_name: Set(Some("Ada".into())),
            shipping_phone: Set(None),
            shipping_addr1: Set(Some("Main St 1".into())),
            shipping_addr2: Set(None),
            shipping_city: Set(Some("Helsinki".into())),
            shipping_postal: Set(Some("00100".into())),
            shipping_country: Set(Some("FI".into())),
            provider_session_id: Set(None),
            provider_intent_id: Set(None),
            cart_id: Set(None),
            payment_status: Set(status),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            failure_reason: Set(None),
            carrier: Set(None),
            tracking_number: Set(None),
            tracking_url: Set(None),
            confirmation_email_sent: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();

        if with_line {
            order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(id),
                variant_id: Set(None),
                title: Set("Mug".into()),
                sku: Set("MUG-1".into()),
                quantity: Set(1),
                unit_price_cents: Set(1000),
                tax_rate: Set(dec!(24)),
                line_total_cents: Set(1000),
                tax_cents: Set(240),
                created_at: Set(now),
            }
            .insert(db)
            .await
            .unwrap();
        }
        id
    }

    async fn audit_events(db: &DatabaseConnection, order_id: Uuid) -> Vec<String> {
        audit_entry::Entity::find()
            .filter(audit_entry::Column::OrderId.eq(order_id))
            .all(db)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn confirmation_is_sent_exactly_once() {
        let db = Arc::new(memory_ledger().await);
        let order_id = seed_order(&db, PaymentStatus::Paid, Some("ada@example.com"), true).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_order_confirmation()
            .withf(move |c| c.order_id == order_id && c.lines.len() == 1)
            .times(1)
            .returning(|_| Ok(()));
        let dispatcher = NotificationDispatcher::new(db.clone(), Arc::new(notifier), policy());

        assert_eq!(
            dispatcher.confirm_when_ready(order_id).await.unwrap(),
            ConfirmationOutcome::Sent
        );
        assert_eq!(
            dispatcher.confirm_when_ready(order_id).await.unwrap(),
            ConfirmationOutcome::AlreadySent
        );
        assert_eq!(audit_events(&db, order_id).await, vec!["CONFIRMATION_SENT"]);
    }

    #[tokio::test]
    async fn incomplete_order_is_deferred_without_sending() {
        let db = Arc::new(memory_ledger().await);
        let order_id = seed_order(&db, PaymentStatus::Paid, None, true).await;

        let mut notifier = MockNotifier::new();
        notifier.expect_send_order_confirmation().never();
        let dispatcher = NotificationDispatcher::new(db.clone(), Arc::new(notifier), policy());

        assert_eq!(
            dispatcher.confirm_when_ready(order_id).await.unwrap(),
            ConfirmationOutcome::Deferred
        );
        assert_eq!(audit_events(&db, order_id).await, vec!["CONFIRMATION_DEFERRED"]);
    }

    #[tokio::test]
    async fn unpaid_order_is_not_confirmed() {
        let db = Arc::new(memory_ledger().await);
        let order_id = seed_order(&db, PaymentStatus::Unpaid, Some("ada@example.com"), true).await;

        let mut notifier = MockNotifier::new();
        notifier.expect_send_order_confirmation().never();
        let dispatcher = NotificationDispatcher::new(db.clone(), Arc::new(notifier), policy());

        assert_eq!(
            dispatcher.confirm_when_ready(order_id).await.unwrap(),
            ConfirmationOutcome::Deferred
        );
    }

    #[tokio::test]
    async fn failed_delivery_keeps_flag_and_is_audited() {
        let db = Arc::new(memory_ledger().await);
        let order_id = seed_order(&db, PaymentStatus::Paid, Some("ada@example.com"), true).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_order_confirmation()
            .times(1)
            .returning(|_| Err(NotificationError::Rejected(503)));
        let dispatcher = NotificationDispatcher::new(db.clone(), Arc::new(notifier), policy());

        assert_eq!(
            dispatcher.confirm_when_ready(order_id).await.unwrap(),
            ConfirmationOutcome::Failed
        );
        let order = order::Entity::find_by_id(order_id).one(&*db).await.unwrap().unwrap();
        assert!(order.confirmation_email_sent);
        assert_eq!(audit_events(&db, order_id).await, vec!["CONFIRMATION_FAILED"]);
    }

    #[tokio::test]
    async fn resend_ignores_sent_flag() {
        let db = Arc::new(memory_ledger().await);
        let order_id = seed_order(&db, PaymentStatus::Paid, Some("ada@example.com"), true).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_order_confirmation()
            .times(2)
            .returning(|_| Ok(()));
        let dispatcher = NotificationDispatcher::new(db.clone(), Arc::new(notifier), policy());

        dispatcher.confirm_when_ready(order_id).await.unwrap();
        assert_eq!(
            dispatcher.resend_confirmation(order_id).await.unwrap(),
            ConfirmationOutcome::Sent
        );
    }

    #[tokio::test]
    async fn refund_notice_failure_is_swallowed() {
        let db = Arc::new(memory_ledger().await);
        let order_id = seed_order(&db, PaymentStatus::Paid, Some("ada@example.com"), true).await;
        let order = order::Entity::find_by_id(order_id).one(&*db).await.unwrap().unwrap();

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_refund_notice()
            .withf(|n| n.amount_cents == 400 && n.remaining_cents == 840)
            .times(1)
            .returning(|_| Err(NotificationError::Transport("down".into())));
        let dispatcher = NotificationDispatcher::new(db, Arc::new(notifier), policy());

        dispatcher.notify_refund(&order, 400, 840).await;
    }

    #[test]
    fn short_id_is_eight_upper_hex_chars() {
        let id = Uuid::parse_str("0f3a9c2e-1111-2222-3333-444455556666").unwrap();
        assert_eq!(short_id(id), "0F3A9C2E");
    }
}
