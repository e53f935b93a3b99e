//! Order reconciler.
//!
//! Applies provider events to the ledger. Each event handler is written to
//! converge: applying the same or different events in any order leaves the
//! order in the same final state. Orders are keyed by the provider session
//! id, then by the payment intent id.

use chrono::Utc;
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::{cart_line, order, order_line, refund, FulfillmentStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::services::audit::{self, Actor, AuditEvent};
use crate::services::materializer::{load_cart_snapshot, materialize, CartSnapshot, OrderDraft};
use crate::services::notifications::NotificationDispatcher;
use crate::services::refunds::{apply_refund, refunded_total, LedgerOutcome};
use crate::services::stock;
use crate::webhooks::{CheckoutSessionObject, EventKind, RefundObject};

const ASYNC_PAYMENT_FAILED: &str = "Asynchronous payment failed";

/// What an event did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    OrderCreated(Uuid),
    OrderPaid(Uuid),
    PaymentFailed(Vec<Uuid>),
    RefundsApplied {
        order_id: Uuid,
        recorded: usize,
        rejected: usize,
        status: PaymentStatus,
    },
    NoOp(&'static str),
}

impl EventOutcome {
    /// Order that may now be ready for its confirmation email.
    pub fn confirmable_order(&self) -> Option<Uuid> {
        match self {
            Self::OrderCreated(id) | Self::OrderPaid(id) => Some(*id),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => "order_created",
            Self::OrderPaid(_) => "order_paid",
            Self::PaymentFailed(_) => "payment_failed",
            Self::RefundsApplied { .. } => "refunds_applied",
            Self::NoOp(_) => "noop",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct TrackingUpdate {
    #[validate(length(min = 1, max = 64))]
    pub carrier: String,
    #[validate(length(min = 1, max = 128))]
    pub tracking_number: String,
    #[validate(url)]
    pub tracking_url: Option<String>,
}

/// Order with its lines and refund ledger.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderDetails {
    #[schema(value_type = Object)]
    pub order: order::Model,
    #[schema(value_type = Vec<Object>)]
    pub lines: Vec<order_line::Model>,
    #[schema(value_type = Vec<Object>)]
    pub refunds: Vec<refund::Model>,
    pub refunded_total_cents: i64,
    pub remaining_refundable_cents: i64,
}

#[derive(Clone)]
pub struct OrderReconciler {
    db: Arc<DatabaseConnection>,
    notifications: NotificationDispatcher,
    shipping_cents: i64,
}

impl OrderReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        notifications: NotificationDispatcher,
        shipping_cents: i64,
    ) -> Self {
        Self {
            db,
            notifications,
            shipping_cents,
        }
    }

    /// Applies one already-claimed provider event.
    #[instrument(skip(self, kind))]
    pub async fn apply(&self, event_id: &str, kind: EventKind) -> Result<EventOutcome, ServiceError> {
        match kind {
            EventKind::CheckoutCompleted(session) => {
                let paid = session.payment_intent.is_some();
                self.checkout_completed(&session, paid).await
            }
            EventKind::CheckoutAsyncSucceeded(session) => {
                self.checkout_completed(&session, true).await
            }
            EventKind::CheckoutAsyncFailed(session) => {
                self.mark_failed(
                    session.payment_intent.as_deref(),
                    Some(&session.id),
                    ASYNC_PAYMENT_FAILED,
                )
                .await
            }
            EventKind::PaymentSucceeded(intent) => self.mark_paid_by_intent(&intent.id).await,
            EventKind::PaymentFailed(intent) => {
                self.mark_failed(Some(&intent.id), None, &intent.failure_reason())
                    .await
            }
            EventKind::ChargeFailed(charge) => {
                self.mark_failed(charge.payment_intent.as_deref(), None, &charge.failure_reason())
                    .await
            }
            EventKind::RefundUpdated(refund) => {
                let intent = refund.payment_intent.clone();
                self.record_provider_refunds(intent.as_deref(), vec![refund])
                    .await
            }
            EventKind::ChargeRefunded(charge) => {
                let refunds = charge.refunds.map(|r| r.data).unwrap_or_default();
                self.record_provider_refunds(charge.payment_intent.as_deref(), refunds)
                    .await
            }
            EventKind::Ignored => Ok(EventOutcome::NoOp("event type not handled")),
        }
    }

    async fn find_by_correlation(
        &self,
        session_id: &str,
        intent_id: Option<&str>,
    ) -> Result<Option<order::Model>, ServiceError> {
        if let Some(order) = order::Entity::find()
            .filter(order::Column::ProviderSessionId.eq(session_id))
            .one(&*self.db)
            .await?
        {
            return Ok(Some(order));
        }
        match intent_id {
            Some(intent) => Ok(order::Entity::find()
                .filter(order::Column::ProviderIntentId.eq(intent))
                .one(&*self.db)
                .await?),
            None => Ok(None),
        }
    }

    /// Materializes the order for a completed checkout, or updates the one
    /// that already exists for the session or its payment intent.
    pub async fn checkout_completed(
        &self,
        session: &CheckoutSessionObject,
        paid: bool,
    ) -> Result<EventOutcome, ServiceError> {
        let intent = session.payment_intent.as_deref();
        if let Some(existing) = self.find_by_correlation(&session.id, intent).await? {
            return self.backfill(existing, session, paid).await;
        }

        let cart_id = session
            .cart_id()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "checkout session {} carries no cart reference",
                    session.id
                ))
            })?;

        match self.materialize_order(cart_id, session, paid).await {
            Ok(order) => {
                info!(
                    order_id = %order.id,
                    %cart_id,
                    session_id = %session.id,
                    total_cents = order.total_cents,
                    "order materialized"
                );
                Ok(EventOutcome::OrderCreated(order.id))
            }
            Err(err) if err.is_unique_violation() => {
                // another delivery won the race for this session or intent
                info!(session_id = %session.id, "order already materialized concurrently");
                match self.find_by_correlation(&session.id, intent).await? {
                    Some(existing) => self.backfill(existing, session, paid).await,
                    None => Err(err),
                }
            }
            Err(err) => {
                error!(
                    %cart_id,
                    session_id = %session.id,
                    error = %err,
                    "order materialization failed"
                );
                Err(err)
            }
        }
    }

    async fn materialize_order(
        &self,
        cart_id: Uuid,
        session: &CheckoutSessionObject,
        paid: bool,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let snapshot = load_cart_snapshot(&txn, cart_id).await?;
        let draft = materialize(cart_id, &snapshot.lines, self.shipping_cents)?;
        stock::reserve(&txn, &draft.lines).await?;

        let order = new_order(&snapshot, &draft, session, paid)
            .insert(&txn)
            .await?;

        let now = Utc::now();
        let lines: Vec<order_line::ActiveModel> = draft
            .lines
            .iter()
            .map(|line| order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                variant_id: Set(Some(line.variant_id)),
                title: Set(line.title.clone()),
                sku: Set(line.sku.clone()),
                quantity: Set(line.quantity),
                unit_price_cents: Set(line.unit_price_cents),
                tax_rate: Set(line.tax_rate),
                line_total_cents: Set(line.line_total_cents),
                tax_cents: Set(line.tax_cents),
                created_at: Set(now),
            })
            .collect();
        order_line::Entity::insert_many(lines)
            .exec_without_returning(&txn)
            .await?;

        cart_line::Entity::delete_many()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(order)
    }

    async fn backfill(
        &self,
        existing: order::Model,
        session: &CheckoutSessionObject,
        paid: bool,
    ) -> Result<EventOutcome, ServiceError> {
        let order_id = existing.id;
        let mut active: order::ActiveModel = existing.clone().into();
        let mut changed = false;

        if existing.provider_session_id.is_none() {
            active.provider_session_id = Set(Some(session.id.clone()));
            changed = true;
        }
        if existing.provider_intent_id.is_none() {
            if let Some(intent) = &session.payment_intent {
                active.provider_intent_id = Set(Some(intent.clone()));
                changed = true;
            }
        }
        if existing.email.is_none() {
            if let Some(email) = session.email() {
                active.email = Set(Some(email));
                changed = true;
            }
        }
        if changed {
            active.updated_at = Set(Utc::now());
            active.update(&*self.db).await?;
            info!(%order_id, session_id = %session.id, "backfilled order correlation");
        }

        if paid {
            self.mark_paid(Condition::all().add(order::Column::Id.eq(order_id)))
                .await?;
            Ok(EventOutcome::OrderPaid(order_id))
        } else {
            Ok(EventOutcome::NoOp("order already materialized"))
        }
    }

    /// UNPAID or FAILED to PAID. Refunded states are never regressed.
    async fn mark_paid(&self, filter: Condition) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let revived = order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(
                order::Column::FulfillmentStatus,
                Expr::value(FulfillmentStatus::Pending),
            )
            .col_expr(order::Column::FailureReason, Expr::value(Option::<String>::None))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(filter.clone())
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Failed))
            .filter(order::Column::FulfillmentStatus.eq(FulfillmentStatus::Canceled))
            .exec(&*self.db)
            .await?;

        let paid = order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(filter)
            .filter(
                order::Column::PaymentStatus.is_in([PaymentStatus::Unpaid, PaymentStatus::Failed]),
            )
            .exec(&*self.db)
            .await?;

        Ok(revived.rows_affected + paid.rows_affected)
    }

    pub async fn mark_paid_by_intent(&self, intent_id: &str) -> Result<EventOutcome, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::ProviderIntentId.eq(intent_id))
            .one(&*self.db)
            .await?;
        let Some(order) = order else {
            info!(intent_id, "no order for payment intent yet");
            return Ok(EventOutcome::NoOp("no order for payment intent"));
        };

        self.mark_paid(Condition::all().add(order::Column::Id.eq(order.id)))
            .await?;
        Ok(EventOutcome::OrderPaid(order.id))
    }

    /// Fails every UNPAID order matching the intent or session and cancels its
    /// fulfillment. No order is created when none exists yet.
    pub async fn mark_failed(
        &self,
        intent_id: Option<&str>,
        session_id: Option<&str>,
        reason: &str,
    ) -> Result<EventOutcome, ServiceError> {
        let mut correlation = Condition::any();
        if let Some(intent) = intent_id {
            correlation = correlation.add(order::Column::ProviderIntentId.eq(intent));
        }
        if let Some(session) = session_id {
            correlation = correlation.add(order::Column::ProviderSessionId.eq(session));
        }
        if intent_id.is_none() && session_id.is_none() {
            return Ok(EventOutcome::NoOp("failure carries no correlation id"));
        }

        let txn = self.db.begin().await?;
        let orders = order::Entity::find()
            .filter(correlation)
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .all(&txn)
            .await?;

        if orders.is_empty() {
            info!(?intent_id, ?session_id, "payment failed with no unpaid order");
            return Ok(EventOutcome::NoOp("no unpaid order for failed payment"));
        }

        let mut failed = Vec::with_capacity(orders.len());
        for existing in orders {
            let before = existing.fulfillment_status;
            let mut active: order::ActiveModel = existing.clone().into();
            active.payment_status = Set(PaymentStatus::Failed);
            if before.can_transition_to(FulfillmentStatus::Canceled) {
                active.fulfillment_status = Set(FulfillmentStatus::Canceled);
            }
            active.failure_reason = Set(Some(reason.to_string()));
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;

            audit::record(
                &txn,
                AuditEvent::PaymentFailed,
                Some(existing.id),
                &Actor::webhook(),
                json!({
                    "reason": reason,
                    "paymentIntentId": intent_id,
                    "sessionId": session_id,
                }),
            )
            .await?;
            warn!(order_id = %existing.id, reason, "payment failed");
            failed.push(existing.id);
        }

        txn.commit().await?;
        Ok(EventOutcome::PaymentFailed(failed))
    }

    /// Books settled provider refunds onto the ledger of the order they belong to.
    pub async fn record_provider_refunds(
        &self,
        fallback_intent: Option<&str>,
        refunds: Vec<RefundObject>,
    ) -> Result<EventOutcome, ServiceError> {
        let intent = fallback_intent
            .map(str::to_string)
            .or_else(|| refunds.iter().find_map(|r| r.payment_intent.clone()));
        let Some(intent) = intent else {
            return Ok(EventOutcome::NoOp("refund carries no payment intent"));
        };

        let txn = self.db.begin().await?;
        let Some(mut order) = order::Entity::find()
            .filter(order::Column::ProviderIntentId.eq(intent.as_str()))
            .lock_exclusive()
            .one(&txn)
            .await?
        else {
            info!(intent_id = %intent, "refund for unknown payment intent");
            return Ok(EventOutcome::NoOp("no order for refund"));
        };

        let (mut recorded, mut rejected) = (0, 0);
        for refund in refunds.iter().filter(|r| r.is_settled() && r.amount > 0) {
            let outcome = apply_refund(&txn, &order, &refund.id, refund.amount, refund.reason.clone())
                .await?;
            match outcome {
                LedgerOutcome::Recorded {
                    refunded_cents,
                    status,
                } => {
                    recorded += 1;
                    order.payment_status = status;
                    audit::record(
                        &txn,
                        AuditEvent::RefundRecorded,
                        Some(order.id),
                        &Actor::webhook(),
                        json!({
                            "providerRefundId": refund.id,
                            "amountCents": refund.amount,
                            "refundedTotalCents": refunded_cents,
                            "paymentStatus": status,
                        }),
                    )
                    .await?;
                }
                LedgerOutcome::Duplicate { status, .. } => {
                    order.payment_status = status;
                }
                LedgerOutcome::Rejected { remaining_cents } => {
                    rejected += 1;
                    error!(
                        order_id = %order.id,
                        refund_id = %refund.id,
                        amount = refund.amount,
                        remaining_cents,
                        "provider refund exceeds order total"
                    );
                    audit::record(
                        &txn,
                        AuditEvent::RefundRejected,
                        Some(order.id),
                        &Actor::webhook(),
                        json!({
                            "providerRefundId": refund.id,
                            "amountCents": refund.amount,
                            "remainingCents": remaining_cents,
                        }),
                    )
                    .await?;
                }
            }
        }

        txn.commit().await?;

        if rejected > 0 {
            self.notifications
                .alert_operator(
                    "Refund exceeds order total",
                    &format!("order {}: {} provider refund(s) rejected", order.id, rejected),
                )
                .await;
        }

        Ok(EventOutcome::RefundsApplied {
            order_id: order.id,
            recorded,
            rejected,
            status: order.payment_status,
        })
    }

    pub async fn order_details(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = self.find_order(order_id).await?;
        let lines = order_line::Entity::find()
            .filter(order_line::Column::OrderId.eq(order_id))
            .order_by_asc(order_line::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        let refunds = refund::Entity::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .order_by_asc(refund::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        let refunded_total_cents = refunded_total(&*self.db, order_id).await?;

        Ok(OrderDetails {
            remaining_refundable_cents: (order.total_cents - refunded_total_cents).max(0),
            order,
            lines,
            refunds,
            refunded_total_cents,
        })
    }

    async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Admin fulfillment transition, guarded against concurrent edits.
    #[instrument(skip(self, actor))]
    pub async fn update_fulfillment(
        &self,
        order_id: Uuid,
        next: FulfillmentStatus,
        actor: &Actor,
    ) -> Result<order::Model, ServiceError> {
        let current = self.find_order(order_id).await?;
        let before = current.fulfillment_status;
        if !before.can_transition_to(next) {
            return Err(ServiceError::InvalidTransition(format!("{} -> {}", before, next)));
        }

        let txn = self.db.begin().await?;
        let result = order::Entity::update_many()
            .col_expr(order::Column::FulfillmentStatus, Expr::value(next))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::FulfillmentStatus.eq(before))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} changed concurrently",
                order_id
            )));
        }

        audit::record(
            &txn,
            AuditEvent::FulfillmentStatusChanged,
            Some(order_id),
            actor,
            json!({ "before": before, "after": next }),
        )
        .await?;
        txn.commit().await?;

        info!(%order_id, %before, %next, "fulfillment status changed");
        self.find_order(order_id).await
    }

    /// Stores carrier tracking, moves the order to SHIPPED and notifies the customer.
    #[instrument(skip(self, update, actor))]
    pub async fn set_tracking(
        &self,
        order_id: Uuid,
        update: TrackingUpdate,
        actor: &Actor,
    ) -> Result<order::Model, ServiceError> {
        update.validate()?;

        let current = self.find_order(order_id).await?;
        let before = current.fulfillment_status;
        if before != FulfillmentStatus::Shipped && !before.can_transition_to(FulfillmentStatus::Shipped)
        {
            return Err(ServiceError::InvalidTransition(format!(
                "{} -> {}",
                before,
                FulfillmentStatus::Shipped
            )));
        }

        let txn = self.db.begin().await?;
        let mut active: order::ActiveModel = current.clone().into();
        active.carrier = Set(Some(update.carrier.trim().to_string()));
        active.tracking_number = Set(Some(update.tracking_number.trim().to_string()));
        active.tracking_url = Set(update.tracking_url.clone());
        active.fulfillment_status = Set(FulfillmentStatus::Shipped);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        audit::record(
            &txn,
            AuditEvent::TrackingUpdated,
            Some(order_id),
            actor,
            json!({
                "before": {
                    "status": before,
                    "carrier": current.carrier,
                    "trackingNumber": current.tracking_number,
                },
                "after": {
                    "status": updated.fulfillment_status,
                    "carrier": updated.carrier,
                    "trackingNumber": updated.tracking_number,
                    "trackingUrl": updated.tracking_url,
                },
            }),
        )
        .await?;
        txn.commit().await?;

        self.notifications.notify_shipped(&updated).await;
        Ok(updated)
    }

    /// Attaches ownerless orders placed with `email` to `customer_id`.
    #[instrument(skip(self, email, actor))]
    pub async fn link_guest_orders(
        &self,
        email: &str,
        customer_id: Uuid,
        actor: &Actor,
    ) -> Result<u64, ServiceError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(ServiceError::ValidationError("email is required".into()));
        }

        let result = order::Entity::update_many()
            .col_expr(order::Column::CustomerId, Expr::value(Some(customer_id)))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::CustomerId.is_null())
            .filter(Expr::expr(Func::lower(Expr::col(order::Column::Email))).eq(email.as_str()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 0 {
            audit::record(
                &*self.db,
                AuditEvent::GuestOrdersLinked,
                None,
                actor,
                json!({ "customerId": customer_id, "linked": result.rows_affected }),
            )
            .await?;
            info!(%customer_id, linked = result.rows_affected, "guest orders linked");
        }

        Ok(result.rows_affected)
    }
}

fn new_order(
    snapshot: &CartSnapshot,
    draft: &OrderDraft,
    session: &CheckoutSessionObject,
    paid: bool,
) -> order::ActiveModel {
    let cart = &snapshot.cart;
    let details = session.customer_details.as_ref();
    let address = details.and_then(|d| d.address.as_ref());
    let now = Utc::now();

    let customer_id = session
        .customer_id()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .or(cart.customer_id);
    let email = session.email().or_else(|| cart.email.clone());

    order::ActiveModel {
        id: Set(Uuid::new_v4()),
        customer_id: Set(customer_id),
        email: Set(email),
        currency: Set(cart.currency.clone()),
        subtotal_cents: Set(draft.subtotal_cents),
        tax_cents: Set(draft.tax_cents),
        shipping_cents: Set(draft.shipping_cents),
        total_cents: Set(draft.total_cents),
        shipping_name: Set(cart
            .shipping_name
            .clone()
            .or_else(|| details.and_then(|d| d.name.clone()))),
        shipping_phone: Set(cart
            .shipping_phone
            .clone()
            .or_else(|| details.and_then(|d| d.phone.clone()))),
        shipping_addr1: Set(cart
            .shipping_addr1
            .clone()
            .or_else(|| address.and_then(|a| a.line1.clone()))),
        shipping_addr2: Set(cart
            .shipping_addr2
            .clone()
            .or_else(|| address.and_then(|a| a.line2.clone()))),
        shipping_city: Set(cart
            .shipping_city
            .clone()
            .or_else(|| address.and_then(|a| a.city.clone()))),
        shipping_postal: Set(cart
            .shipping_postal
            .clone()
            .or_else(|| address.and_then(|a| a.postal_code.clone()))),
        shipping_country: Set(cart
            .shipping_country
            .clone()
            .or_else(|| address.and_then(|a| a.country.clone()))),
        provider_session_id: Set(Some(session.id.clone())),
        provider_intent_id: Set(session.payment_intent.clone()),
        cart_id: Set(Some(cart.id)),
        payment_status: Set(if paid {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Unpaid
        }),
        fulfillment_status: Set(FulfillmentStatus::Pending),
        failure_reason: Set(None),
        carrier: Set(None),
        tracking_number: Set(None),
        tracking_url: Set(None),
        confirmation_email_sent: Set(false),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_created_or_paid_orders_are_confirmable() {
        let id = Uuid::new_v4();
        assert_eq!(EventOutcome::OrderCreated(id).confirmable_order(), Some(id));
        assert_eq!(EventOutcome::OrderPaid(id).confirmable_order(), Some(id));
        assert_eq!(EventOutcome::PaymentFailed(vec![id]).confirmable_order(), None);
        assert_eq!(EventOutcome::NoOp("x").confirmable_order(), None);
    }
}
