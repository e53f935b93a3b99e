//! Refund accounting.
//!
//! The refunded total of an order is always re-summed from the refund
//! ledger inside the transaction that appends to it, with the order row
//! locked, so concurrent refunds cannot jointly pass the order total.
//! Payment status follows from that sum alone.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{order, refund, PaymentStatus};
use crate::errors::{RefundError, ServiceError};
use crate::services::audit::{self, Actor, AuditEvent};
use crate::services::notifications::NotificationDispatcher;
use crate::services::payments::{refund_idempotency_key, PaymentProvider, RefundRequest};

/// Payment status implied by the refund ledger, `None` while nothing has been refunded.
pub fn derive_payment_status(total_cents: i64, refunded_cents: i64) -> Option<PaymentStatus> {
    if refunded_cents <= 0 {
        None
    } else if refunded_cents >= total_cents {
        Some(PaymentStatus::Refunded)
    } else {
        Some(PaymentStatus::PartiallyRefunded)
    }
}

/// Fresh sum of all ledger rows for an order.
pub async fn refunded_total<C>(conn: &C, order_id: Uuid) -> Result<i64, DbErr>
where
    C: ConnectionTrait,
{
    let amounts: Vec<i64> = refund::Entity::find()
        .select_only()
        .column(refund::Column::AmountCents)
        .filter(refund::Column::OrderId.eq(order_id))
        .into_tuple()
        .all(conn)
        .await?;
    Ok(amounts.into_iter().sum())
}

/// Result of appending one provider refund to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Recorded {
        refunded_cents: i64,
        status: PaymentStatus,
    },
    /// The provider refund id was already on the ledger.
    Duplicate {
        refunded_cents: i64,
        status: PaymentStatus,
    },
    /// Appending would take the refunded total past the order total.
    Rejected { remaining_cents: i64 },
}

/// Appends a provider refund to the ledger and re-derives payment status.
///
/// `order` must have been read under a row lock on `conn`.
pub async fn apply_refund<C>(
    conn: &C,
    order: &order::Model,
    provider_refund_id: &str,
    amount_cents: i64,
    reason: Option<String>,
) -> Result<LedgerOutcome, DbErr>
where
    C: ConnectionTrait,
{
    let already = refund::Entity::find()
        .filter(refund::Column::ProviderRefundId.eq(provider_refund_id))
        .one(conn)
        .await?
        .is_some();

    let refunded_before = refunded_total(conn, order.id).await?;
    if !already && amount_cents > order.total_cents - refunded_before {
        return Ok(LedgerOutcome::Rejected {
            remaining_cents: (order.total_cents - refunded_before).max(0),
        });
    }

    let inserted = if already {
        0
    } else {
        let row = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            provider_refund_id: Set(provider_refund_id.to_string()),
            amount_cents: Set(amount_cents),
            reason: Set(reason),
            created_at: Set(Utc::now()),
        };
        refund::Entity::insert(row)
            .on_conflict(
                OnConflict::column(refund::Column::ProviderRefundId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?
    };

    let refunded_cents = refunded_total(conn, order.id).await?;
    let status = derive_payment_status(order.total_cents, refunded_cents)
        .unwrap_or(order.payment_status);
    if status != order.payment_status {
        let mut active: order::ActiveModel = order.clone().into();
        active.payment_status = Set(status);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
    }

    Ok(if inserted == 0 {
        LedgerOutcome::Duplicate {
            refunded_cents,
            status,
        }
    } else {
        LedgerOutcome::Recorded {
            refunded_cents,
            status,
        }
    })
}

/// A refund request from the admin API.
#[derive(Debug, Clone)]
pub struct RefundCommand {
    pub order_id: Uuid,
    /// `None` refunds everything that remains.
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub amount_cents: i64,
    pub refunded_total_cents: i64,
    pub remaining_cents: i64,
    pub payment_status: PaymentStatus,
    /// True when the provider returned a refund that was already booked; nothing new was issued.
    pub replayed: bool,
}

/// Issues refunds against the payment provider and books them on the ledger.
#[derive(Clone)]
pub struct RefundAccountant {
    db: Arc<DatabaseConnection>,
    provider: Arc<dyn PaymentProvider>,
    notifications: NotificationDispatcher,
}

impl RefundAccountant {
    pub fn new(
        db: Arc<DatabaseConnection>,
        provider: Arc<dyn PaymentProvider>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            db,
            provider,
            notifications,
        }
    }

    #[instrument(skip(self, command), fields(order_id = %command.order_id))]
    pub async fn issue_refund(&self, command: RefundCommand) -> Result<RefundReceipt, ServiceError> {
        let order_id = command.order_id;
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(RefundError::OrderNotFound(order_id))?;

        let payment_intent_id = order
            .provider_intent_id
            .clone()
            .filter(|pi| !pi.trim().is_empty())
            .ok_or(RefundError::MissingPaymentReference(order_id))?;

        let refunded_before = refunded_total(&txn, order_id).await?;
        let remaining = (order.total_cents - refunded_before).max(0);
        let amount = command.amount_cents.unwrap_or(remaining);

        if amount <= 0 {
            return Err(RefundError::NothingToRefund.into());
        }
        if amount > remaining {
            return Err(RefundError::ExceedsRefundable {
                requested: amount,
                remaining,
            }
            .into());
        }
        if !order.payment_status.is_refundable() {
            return Err(RefundError::NotRefundable(order.payment_status.to_string()).into());
        }

        let idempotency_key = refund_idempotency_key(order_id, &payment_intent_id, amount);
        let provider_refund = match self
            .provider
            .create_refund(RefundRequest {
                order_id,
                payment_intent_id: payment_intent_id.clone(),
                amount_cents: amount,
                idempotency_key: idempotency_key.clone(),
                reason: command.reason.clone(),
            })
            .await
        {
            Ok(refund) => refund,
            Err(err) => {
                txn.rollback().await?;
                error!(error = %err, amount, "provider refund failed");
                self.notifications
                    .alert_operator(
                        "Refund failed",
                        &format!("order {} amount {}: {}", order_id, amount, err),
                    )
                    .await;
                return Err(err.into());
            }
        };

        let outcome = apply_refund(
            &txn,
            &order,
            &provider_refund.id,
            amount,
            command.reason.clone(),
        )
        .await?;
        let (refunded_total_cents, payment_status, replayed) = match outcome {
            LedgerOutcome::Recorded {
                refunded_cents,
                status,
            } => (refunded_cents, status, false),
            LedgerOutcome::Duplicate {
                refunded_cents,
                status,
            } => (refunded_cents, status, true),
            LedgerOutcome::Rejected { remaining_cents } => {
                // the row lock makes this unreachable unless the ledger was edited by hand
                return Err(RefundError::ExceedsRefundable {
                    requested: amount,
                    remaining: remaining_cents,
                }
                .into());
            }
        };
        let remaining_cents = (order.total_cents - refunded_total_cents).max(0);

        if replayed {
            // provider answered with a refund already on the ledger
            txn.commit().await?;
            info!(
                refund_id = %provider_refund.id,
                amount,
                remaining_cents,
                "refund replayed"
            );
            return Ok(RefundReceipt {
                refund_id: provider_refund.id,
                amount_cents: amount,
                refunded_total_cents,
                remaining_cents,
                payment_status,
                replayed,
            });
        }

        audit::record(
            &txn,
            AuditEvent::RefundRequested,
            Some(order_id),
            &command.actor,
            json!({
                "idempotencyKey": idempotency_key,
                "providerRefundId": provider_refund.id,
                "amountCents": amount,
                "reason": command.reason,
                "refundedTotalCents": refunded_total_cents,
                "paymentStatus": payment_status,
            }),
        )
        .await?;

        txn.commit().await?;
        counter!("storefront_refunds_issued_total", 1);

        info!(
            refund_id = %provider_refund.id,
            amount,
            remaining_cents,
            %payment_status,
            "refund issued"
        );

        self.notifications
            .notify_refund(&order, amount, remaining_cents)
            .await;

        Ok(RefundReceipt {
            refund_id: provider_refund.id,
            amount_cents: amount,
            refunded_total_cents,
            remaining_cents,
            payment_status,
            replayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1000, 0, None)]
    #[case(1000, 1, Some(PaymentStatus::PartiallyRefunded))]
    #[case(1000, 999, Some(PaymentStatus::PartiallyRefunded))]
    #[case(1000, 1000, Some(PaymentStatus::Refunded))]
    #[case(1000, 1200, Some(PaymentStatus::Refunded))]
    #[case(0, 0, None)]
    fn status_follows_refunded_total(
        #[case] total: i64,
        #[case] refunded: i64,
        #[case] expected: Option<PaymentStatus>,
    ) {
        assert_eq!(derive_payment_status(total, refunded), expected);
    }
}
