//! Stock guard.
//!
//! Decrements are a single conditional `UPDATE ... WHERE stock_qty >= q`, so
//! two transactions racing for the last units serialize on the variant row
//! and the loser sees zero affected rows. Variants with a `NULL` stock are
//! not tracked and are never decremented.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::variant;
use crate::errors::ServiceError;
use crate::services::materializer::{line_title, CartLineSnapshot, OrderLineDraft};

/// Decrements stock for every tracked variant referenced by `lines`.
///
/// Must run on the transaction that inserts the order. On
/// [`ServiceError::InsufficientStock`] the caller drops the transaction, which
/// rolls back any decrement already applied for earlier lines.
pub async fn reserve<C>(conn: &C, lines: &[OrderLineDraft]) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    for line in lines {
        let quantity = line.quantity;
        let result = variant::Entity::update_many()
            .col_expr(
                variant::Column::StockQty,
                Expr::col(variant::Column::StockQty).sub(quantity),
            )
            .col_expr(variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(variant::Column::Id.eq(line.variant_id))
            .filter(variant::Column::StockQty.is_not_null())
            .filter(variant::Column::StockQty.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 1 {
            debug!(variant_id = %line.variant_id, quantity, "stock decremented");
            continue;
        }

        // Nothing updated: either untracked, or not enough left.
        let current = variant::Entity::find_by_id(line.variant_id).one(conn).await?;
        match current {
            Some(v) if v.stock_qty.is_none() => continue,
            _ => {
                warn!(variant_id = %line.variant_id, quantity, "insufficient stock");
                counter!("storefront_stock_rejections_total", 1);
                return Err(ServiceError::InsufficientStock {
                    variant_id: line.variant_id,
                    name: line.title.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Read-only re-check of cart lines against current stock, used right
/// before a checkout session is opened.
pub async fn check_availability<C>(conn: &C, lines: &[CartLineSnapshot]) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let ids: Vec<Uuid> = lines.iter().map(|l| l.variant_id).collect();
    let stock: HashMap<Uuid, Option<i32>> = variant::Entity::find()
        .filter(variant::Column::Id.is_in(ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|v| (v.id, v.stock_qty))
        .collect();

    // Quantities are summed per variant in case a cart holds it twice.
    let mut wanted: HashMap<Uuid, i64> = HashMap::new();
    for line in lines {
        *wanted.entry(line.variant_id).or_default() += i64::from(line.quantity);
    }

    for line in lines {
        let available = match stock.get(&line.variant_id) {
            Some(None) => continue,
            Some(Some(qty)) => i64::from(*qty),
            None => 0,
        };
        if wanted.get(&line.variant_id).copied().unwrap_or_default() > available {
            return Err(ServiceError::InsufficientStock {
                variant_id: line.variant_id,
                name: line_title(&line.product_title, line.variant_title.as_deref()),
            });
        }
    }

    Ok(())
}
