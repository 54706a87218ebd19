use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement transaction entity: one attempt to pay for a cart through the
/// external gateway, from request through verification.
///
/// `amount` is frozen from the pricing engine when the transaction is opened
/// and is never recomputed from the cart afterwards. `verification_token` is
/// single-use: once the transaction reaches a terminal status, replayed
/// callbacks are answered from the recorded resolution.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "settlement_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub cart_id: Uuid,
    #[sea_orm(nullable)]
    pub customer_id: Option<Uuid>,
    pub status: SettlementStatus,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_cost: Decimal,
    /// Amount collected online, frozen at creation
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount: Decimal,
    pub shipping_method: String,
    #[sea_orm(column_type = "Json")]
    pub destination: Json,
    #[sea_orm(column_type = "Json")]
    pub cart_snapshot: Json,
    #[sea_orm(nullable)]
    pub coupon_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub authority_token: Option<String>,
    pub verification_token: String,
    #[sea_orm(nullable)]
    pub failure_reason: Option<String>,
    #[sea_orm(nullable)]
    pub gateway_reference: Option<String>,
    #[sea_orm(nullable)]
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cart::Entity",
        from = "Column::CartId",
        to = "super::cart::Column::Id"
    )]
    Cart,
}

impl Related<super::cart::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cart.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Settlement lifecycle status.
///
/// A `pending` row that never receives a callback simply stays `pending`;
/// unresolved is not the same thing as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum SettlementStatus {
    /// Opened locally, gateway not yet contacted
    #[sea_orm(string_value = "created")]
    Created,
    /// Gateway accepted the request; shopper redirected
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Verified with the gateway exactly once
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    /// Cancelled, rejected, or administratively expired
    #[sea_orm(string_value = "failed")]
    Failed,
}
