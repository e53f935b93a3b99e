pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod refunds;
pub mod webhooks;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    checkout::CheckoutService,
    idempotency::IdempotencyGuard,
    notifications::{NotificationDispatcher, Notifier},
    payments::PaymentProvider,
    reconciler::OrderReconciler,
    refunds::RefundAccountant,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub idempotency: IdempotencyGuard,
    pub reconciler: OrderReconciler,
    pub refunds: RefundAccountant,
    pub notifications: NotificationDispatcher,
    pub checkout: CheckoutService,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let notifications =
            NotificationDispatcher::new(db.clone(), notifier, config.notification_retry_policy());

        Self {
            idempotency: IdempotencyGuard::new(db.clone()),
            reconciler: OrderReconciler::new(
                db.clone(),
                notifications.clone(),
                config.default_shipping_cents,
            ),
            refunds: RefundAccountant::new(db.clone(), provider.clone(), notifications.clone()),
            checkout: CheckoutService::new(
                db,
                provider,
                config.app_url.clone(),
                config.default_shipping_cents,
            ),
            notifications,
        }
    }
}
