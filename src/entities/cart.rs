use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shopping cart. Lines are deleted once the cart has been turned into an order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "carts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(nullable)]
    pub customer_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub email: Option<String>,
    pub currency: String,
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
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cart_line::Entity")]
    Lines,
}

impl Related<super::cart_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
