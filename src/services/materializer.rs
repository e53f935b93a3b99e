//! Cart to order conversion.
//!
//! [`materialize`] is pure: it only sees the cart snapshot loaded by
//! [`load_cart_snapshot`] and produces an [`OrderDraft`] with every monetary
//! figure fixed. Tax is rounded per line, half away from zero.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use std::collections::HashMap;
use uuid::Uuid;

use crate::entities::{cart, cart_line, product, variant};
use crate::errors::ServiceError;

/// Cart line joined with the catalog data needed to price and title it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartLineSnapshot {
    pub variant_id: Uuid,
    pub product_title: String,
    pub variant_title: Option<String>,
    pub sku: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub vat_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartSnapshot {
    pub cart: cart::Model,
    pub lines: Vec<CartLineSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLineDraft {
    pub variant_id: Uuid,
    pub title: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub tax_rate: Decimal,
    pub line_total_cents: i64,
    pub tax_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub lines: Vec<OrderLineDraft>,
}

/// `round(line_total * rate_percent / 100)`, half away from zero.
pub fn line_tax_cents(line_total_cents: i64, rate_percent: Decimal) -> i64 {
    (Decimal::from(line_total_cents) * rate_percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or_default()
}

/// "Product — Variant", or just the product title when the variant has none.
pub fn line_title(product_title: &str, variant_title: Option<&str>) -> String {
    match variant_title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(variant) => format!("{} — {}", product_title, variant),
        None => product_title.to_string(),
    }
}

pub fn materialize(
    cart_id: Uuid,
    lines: &[CartLineSnapshot],
    shipping_cents: i64,
) -> Result<OrderDraft, ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::EmptyCart(cart_id));
    }

    let lines: Vec<OrderLineDraft> = lines
        .iter()
        .map(|line| {
            let line_total_cents = line.unit_price_cents * i64::from(line.quantity);
            OrderLineDraft {
                variant_id: line.variant_id,
                title: line_title(&line.product_title, line.variant_title.as_deref()),
                sku: line.sku.clone(),
                quantity: line.quantity,
                unit_price_cents: line.unit_price_cents,
                tax_rate: line.vat_rate,
                line_total_cents,
                tax_cents: line_tax_cents(line_total_cents, line.vat_rate),
            }
        })
        .collect();

    let subtotal_cents: i64 = lines.iter().map(|l| l.line_total_cents).sum();
    let tax_cents: i64 = lines.iter().map(|l| l.tax_cents).sum();

    Ok(OrderDraft {
        subtotal_cents,
        tax_cents,
        shipping_cents,
        total_cents: subtotal_cents + tax_cents + shipping_cents,
        lines,
    })
}

/// Loads a cart with its lines and their variant and product data.
pub async fn load_cart_snapshot<C>(conn: &C, cart_id: Uuid) -> Result<CartSnapshot, ServiceError>
where
    C: ConnectionTrait,
{
    let cart = cart::Entity::find_by_id(cart_id)
        .one(conn)
        .await?
        .ok_or(ServiceError::CartNotFound(cart_id))?;

    let rows = cart_line::Entity::find()
        .filter(cart_line::Column::CartId.eq(cart_id))
        .order_by_asc(cart_line::Column::CreatedAt)
        .find_also_related(variant::Entity)
        .all(conn)
        .await?;

    let product_ids: Vec<Uuid> = rows
        .iter()
        .filter_map(|(_, v)| v.as_ref().map(|v| v.product_id))
        .collect();
    let products: HashMap<Uuid, product::Model> = product::Entity::find()
        .filter(product::Column::Id.is_in(product_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let mut lines = Vec::with_capacity(rows.len());
    for (line, variant) in rows {
        let variant = variant.ok_or_else(|| {
            ServiceError::InternalError(format!(
                "cart line {} references missing variant {}",
                line.id, line.variant_id
            ))
        })?;
        let product_title = products
            .get(&variant.product_id)
            .map(|p| p.title.clone())
            .unwrap_or_else(|| variant.sku.clone());

        lines.push(CartLineSnapshot {
            variant_id: variant.id,
            product_title,
            variant_title: variant.title.clone(),
            sku: variant.sku.clone(),
            quantity: line.quantity,
            unit_price_cents: line.unit_price_cents,
            vat_rate: variant.vat_rate,
        });
    }

    Ok(CartSnapshot { cart, lines })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn line(unit: i64, qty: i32, rate: Decimal) -> CartLineSnapshot {
        CartLineSnapshot {
            variant_id: Uuid::new_v4(),
            product_title: "NeoTag Classic".into(),
            variant_title: Some("White 1-pack".into()),
            sku: "NTC-WHT-1".into(),
            quantity: qty,
            unit_price_cents: unit,
            vat_rate: rate,
        }
    }

    #[rstest]
    #[case(999, dec!(24), 240)]
    #[case(1000, dec!(24), 240)]
    #[case(1, dec!(24), 0)]
    #[case(2, dec!(25), 1)] // 0.5
    #[case(50, dec!(1), 1)] // 0.5
    #[case(150, dec!(1), 2)] // 1.5
    #[case(250, dec!(1), 3)] // 2.5, not banker's 2
    #[case(349, dec!(1), 3)] // 3.49
    #[case(1999, dec!(0), 0)]
    #[case(1000, dec!(5.5), 55)]
    fn tax_rounds_half_away_from_zero(#[case] total: i64, #[case] rate: Decimal, #[case] tax: i64) {
        assert_eq!(line_tax_cents(total, rate), tax);
    }

    #[test]
    fn unit_333_times_3_at_24_percent() {
        let draft = materialize(Uuid::new_v4(), &[line(333, 3, dec!(24))], 0).unwrap();
        assert_eq!(draft.subtotal_cents, 999);
        assert_eq!(draft.tax_cents, 240);
        assert_eq!(draft.total_cents, 1239);
    }

    #[test]
    fn tax_is_summed_per_line_not_on_aggregate() {
        // each line is 0.5 cent of tax and rounds up on its own
        let draft = materialize(
            Uuid::new_v4(),
            &[line(2, 1, dec!(25)), line(2, 1, dec!(25))],
            0,
        )
        .unwrap();
        assert_eq!(draft.tax_cents, 2);
        assert_eq!(line_tax_cents(4, dec!(25)), 1);
    }

    #[test]
    fn totals_include_shipping() {
        let draft = materialize(
            Uuid::new_v4(),
            &[line(1000, 2, dec!(24))],
            490,
        )
        .unwrap();
        assert_eq!(draft.subtotal_cents, 2000);
        assert_eq!(draft.tax_cents, 480);
        assert_eq!(draft.shipping_cents, 490);
        assert_eq!(draft.total_cents, 2970);
    }

    #[test]
    fn empty_cart_is_rejected() {
        let cart_id = Uuid::new_v4();
        assert_matches!(
            materialize(cart_id, &[], 0),
            Err(ServiceError::EmptyCart(id)) if id == cart_id
        );
    }

    #[test]
    fn titles_join_product_and_variant() {
        assert_eq!(
            line_title("NeoTag Classic", Some("White 1-pack")),
            "NeoTag Classic — White 1-pack"
        );
        assert_eq!(line_title("NeoTag Classic", Some("  ")), "NeoTag Classic");
        assert_eq!(line_title("NeoTag Classic", None), "NeoTag Classic");
    }

    #[test]
    fn lines_snapshot_price_and_rate() {
        let draft = materialize(Uuid::new_v4(), &[line(1499, 2, dec!(24))], 0).unwrap();
        let first = &draft.lines[0];
        assert_eq!(first.unit_price_cents, 1499);
        assert_eq!(first.tax_rate, dec!(24));
        assert_eq!(first.line_total_cents, 2998);
        assert_eq!(first.tax_cents, 720);
    }
}
