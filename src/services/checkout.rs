//! Checkout session creation.

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::materializer::{load_cart_snapshot, materialize, OrderDraft};
use crate::services::payments::{
    CheckoutLineItem, CheckoutSessionRequest, PaymentProvider, ProviderCheckoutSession,
};
use crate::services::stock;

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    provider: Arc<dyn PaymentProvider>,
    app_url: String,
    shipping_cents: i64,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        provider: Arc<dyn PaymentProvider>,
        app_url: impl Into<String>,
        shipping_cents: i64,
    ) -> Self {
        Self {
            db,
            provider,
            app_url: app_url.into().trim_end_matches('/').to_string(),
            shipping_cents,
        }
    }

    pub fn app_url(&self) -> &str {
        &self.app_url
    }

    /// Opens a hosted payment page for a cart. The cart id travels as session
    /// metadata and comes back on the completion webhook.
    #[instrument(skip(self))]
    pub async fn create_session(&self, cart_id: Uuid) -> Result<ProviderCheckoutSession, ServiceError> {
        let snapshot = load_cart_snapshot(&*self.db, cart_id).await?;
        if snapshot.lines.is_empty() {
            return Err(ServiceError::EmptyCart(cart_id));
        }
        stock::check_availability(&*self.db, &snapshot.lines).await?;

        let draft = materialize(cart_id, &snapshot.lines, self.shipping_cents)?;
        let session = self
            .provider
            .create_checkout_session(CheckoutSessionRequest {
                cart_id,
                currency: snapshot.cart.currency.clone(),
                customer_email: snapshot.cart.email.clone(),
                lines: checkout_lines(&draft),
                success_url: format!(
                    "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.app_url
                ),
                cancel_url: format!("{}/cart", self.app_url),
            })
            .await?;

        info!(%cart_id, session_id = %session.id, total_cents = draft.total_cents, "checkout session created");
        Ok(session)
    }
}

/// Provider line items charging exactly the order total.
///
/// Tax is rounded per line, so a line is only itemized per unit when its
/// gross total divides evenly by the quantity.
pub fn checkout_lines(draft: &OrderDraft) -> Vec<CheckoutLineItem> {
    let mut items: Vec<CheckoutLineItem> = draft
        .lines
        .iter()
        .map(|line| {
            let gross = line.line_total_cents + line.tax_cents;
            let quantity = i64::from(line.quantity);
            if quantity > 0 && gross % quantity == 0 {
                CheckoutLineItem {
                    name: line.title.clone(),
                    unit_amount_cents: gross / quantity,
                    quantity: line.quantity,
                }
            } else {
                CheckoutLineItem {
                    name: format!("{} × {}", line.title, line.quantity),
                    unit_amount_cents: gross,
                    quantity: 1,
                }
            }
        })
        .collect();

    if draft.shipping_cents > 0 {
        items.push(CheckoutLineItem {
            name: "Shipping".to_string(),
            unit_amount_cents: draft.shipping_cents,
            quantity: 1,
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::materializer::CartLineSnapshot;
    use rust_decimal_macros::dec;

    fn snapshot_line(unit: i64, qty: i32) -> CartLineSnapshot {
        CartLineSnapshot {
            variant_id: Uuid::new_v4(),
            product_title: "Mug".into(),
            variant_title: None,
            sku: "MUG".into(),
            quantity: qty,
            unit_price_cents: unit,
            vat_rate: dec!(24),
        }
    }

    fn charged(items: &[CheckoutLineItem]) -> i64 {
        items
            .iter()
            .map(|i| i.unit_amount_cents * i64::from(i.quantity))
            .sum()
    }

    #[test]
    fn charged_amount_equals_order_total() {
        let draft = materialize(
            Uuid::new_v4(),
            &[snapshot_line(333, 3), snapshot_line(1000, 2)],
            490,
        )
        .unwrap();
        let items = checkout_lines(&draft);
        assert_eq!(charged(&items), draft.total_cents);
        assert_eq!(items.last().unwrap().name, "Shipping");
    }

    #[test]
    fn uneven_lines_collapse_to_single_item() {
        // 303 + 73 = 376 is not divisible by 3
        let draft = materialize(Uuid::new_v4(), &[snapshot_line(101, 3)], 0).unwrap();
        let items = checkout_lines(&draft);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 1);
        assert_eq!(items[0].unit_amount_cents, 376);
        assert_eq!(items[0].name, "Mug × 3");
    }

    #[test]
    fn even_lines_keep_quantity() {
        // 1000 * 2 + 480 = 2480, 1240 per unit
        let draft = materialize(Uuid::new_v4(), &[snapshot_line(1000, 2)], 0).unwrap();
        let items = checkout_lines(&draft);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(items[0].unit_amount_cents, 1240);
    }
}
