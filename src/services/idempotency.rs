use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entities::processed_event;
use crate::errors::{is_unique_violation, ServiceError};

/// Outcome of claiming a provider event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub claimed: bool,
}

/// Exactly-once gate for provider events.
///
/// The claim is the first durable write for an event and never expires. A
/// failure after a successful claim leaves the event marked as handled.
#[derive(Clone)]
pub struct IdempotencyGuard {
    db: Arc<DatabaseConnection>,
}

impl IdempotencyGuard {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn try_claim(&self, event_id: &str, event_type: &str) -> Result<Claim, ServiceError> {
        let row = processed_event::ActiveModel {
            id: Set(event_id.to_string()),
            event_type: Set(event_type.to_string()),
            created_at: Set(Utc::now()),
        };

        match row.insert(&*self.db).await {
            Ok(_) => Ok(Claim { claimed: true }),
            Err(err) if is_unique_violation(&err) => {
                debug!("event already processed");
                counter!("storefront_webhook_events_total", 1, "outcome" => "duplicate");
                Ok(Claim { claimed: false })
            }
            Err(err) => Err(ServiceError::DatabaseError(err)),
        }
    }
}
