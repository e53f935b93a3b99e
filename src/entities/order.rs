use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

/// Durable financial record of a checkout.
///
/// Monetary columns are minor currency units and are written once, at
/// materialization; refunds never touch them. `provider_session_id` and
/// `provider_intent_id` are unique and act as the idempotency boundary for
/// provider events.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(nullable)]
    pub customer_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub email: Option<String>,
    pub currency: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    #[sea_orm(nullable)]
    pub shipping_name: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_phone: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_addr1: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_addr2: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_city: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_postal: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_country: Option<String>,
    #[sea_orm(nullable, unique)]
    pub provider_session_id: Option<String>,
    #[sea_orm(nullable, unique)]
    pub provider_intent_id: Option<String>,
    #[sea_orm(nullable)]
    pub cart_id: Option<Uuid>,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    #[sea_orm(nullable)]
    pub failure_reason: Option<String>,
    #[sea_orm(nullable)]
    pub carrier: Option<String>,
    #[sea_orm(nullable)]
    pub tracking_number: Option<String>,
    #[sea_orm(nullable)]
    pub tracking_url: Option<String>,
    pub confirmation_email_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// An order is ready for its confirmation email once it is paid, has a
    /// contact address, a shipping address and at least one line.
    pub fn is_confirmation_ready(&self, line_count: u64) -> bool {
        self.payment_status == PaymentStatus::Paid
            && !self.confirmation_email_sent
            && line_count > 0
            && self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
            && self
                .shipping_addr1
                .as_deref()
                .is_some_and(|a| !a.trim().is_empty())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    Lines,
    #[sea_orm(has_many = "super::refund::Entity")]
    Refunds,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl Related<super::refund::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Refunds.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Payment status, derived from provider events and the refund ledger
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "UNPAID")]
    Unpaid,
    #[sea_orm(string_value = "PAID")]
    Paid,
    #[sea_orm(string_value = "PARTIALLY_REFUNDED")]
    PartiallyRefunded,
    #[sea_orm(string_value = "REFUNDED")]
    Refunded,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl PaymentStatus {
    /// Statuses from which a refund may be issued.
    pub fn is_refundable(self) -> bool {
        matches!(self, Self::Paid | Self::PartiallyRefunded)
    }
}

/// Fulfillment lifecycle, moved only by explicit admin action (or a failed payment)
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "PACKING")]
    Packing,
    #[sea_orm(string_value = "SHIPPED")]
    Shipped,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "CANCELED")]
    Canceled,
}

impl FulfillmentStatus {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Packing => Some(1),
            Self::Shipped => Some(2),
            Self::Delivered => Some(3),
            Self::Canceled => None,
        }
    }

    /// Forward-only progression; cancellation only before the parcel leaves.
    pub fn can_transition_to(self, next: FulfillmentStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            (Some(_), None) => matches!(self, Self::Pending | Self::Packing),
            (None, _) => false,
        }
    }
}
