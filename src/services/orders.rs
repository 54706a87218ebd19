use crate::{
    config::AppConfig,
    entities::{
        cart::{self, CartStatus},
        cart_item, order, order_item, Cart, CartItem, Order, OrderItem, OrderModel,
        SettlementModel,
    },
    errors::ServiceError,
    services::{
        coupons::CouponService,
        settlement::{Destination, LineSnapshot},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    ModelTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Order materialization and retrieval.
///
/// An order is only ever created from a successfully verified settlement,
/// exactly once (the settlement claim guards re-entry). Header, items,
/// coupon usage, and the cart clear commit as one unit; a failure rolls
/// everything back and leaves no partial order visible.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    coupons: Arc<CouponService>,
    config: Arc<AppConfig>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        coupons: Arc<CouponService>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            coupons,
            config,
        }
    }

    /// Materializes the order for a verified settlement inside the caller's
    /// transaction: order header, immutable items, coupon usage, cart clear.
    #[instrument(skip(self, txn, settlement), fields(settlement_id = %settlement.id))]
    pub async fn materialize_settlement(
        &self,
        txn: &DatabaseTransaction,
        settlement: &SettlementModel,
        gateway_reference: &str,
    ) -> Result<OrderModel, ServiceError> {
        let snapshot: Vec<LineSnapshot> = serde_json::from_value(settlement.cart_snapshot.clone())
            .map_err(|e| {
                ServiceError::InternalError(format!("Corrupt cart snapshot: {}", e))
            })?;
        if snapshot.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Settlement has an empty cart snapshot".to_string(),
            ));
        }

        let destination: Destination = serde_json::from_value(settlement.destination.clone())
            .map_err(|e| ServiceError::InternalError(format!("Corrupt destination: {}", e)))?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(format!(
                "ORD-{}",
                order_id.to_string()[..8].to_uppercase()
            )),
            settlement_id: Set(settlement.id),
            customer_id: Set(settlement.customer_id),
            status: Set("pending_fulfillment".to_string()),
            payment_status: Set("paid".to_string()),
            subtotal: Set(settlement.subtotal),
            discount_total: Set(settlement.discount_total),
            shipping_cost: Set(settlement.shipping_cost),
            total_amount: Set(settlement.amount),
            currency: Set(self.config.currency.clone()),
            shipping_method: Set(settlement.shipping_method.clone()),
            destination: Set(settlement.destination.clone()),
            contact_phone: Set(destination.phone),
            coupon_id: Set(settlement.coupon_id),
            gateway_reference: Set(Some(gateway_reference.to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order = order.insert(txn).await?;

        for line in &snapshot {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                name: Set(line.name.clone()),
                color: Set(line.color.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                line_total: Set(line.unit_price * Decimal::from(line.quantity)),
                weight_grams: Set(line.weight_grams),
                created_at: Set(now),
            };
            item.insert(txn).await?;
        }

        if let Some(coupon_id) = settlement.coupon_id {
            self.coupons.increment_usage(txn, coupon_id).await?;
        }

        self.clear_settled_cart(txn, settlement.cart_id).await?;

        info!(
            "Materialized order {} from settlement {}",
            order.order_number, settlement.id
        );
        Ok(order)
    }

    /// Retrieves an order with its items.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = order
            .find_related(OrderItem)
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    async fn clear_settled_cart(
        &self,
        txn: &DatabaseTransaction,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(txn)
            .await?;

        if let Some(cart_row) = Cart::find_by_id(cart_id).one(txn).await? {
            let mut active: cart::ActiveModel = cart_row.into();
            active.status = Set(CartStatus::Converted);
            active.updated_at = Set(Utc::now());
            active.update(txn).await?;
        }

        Ok(())
    }
}

/// Order with its lines
#[derive(Debug, Serialize)]
pub struct OrderWithItems {
    pub order: OrderModel,
    pub items: Vec<order_item::Model>,
}
