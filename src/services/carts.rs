use crate::{
    entities::{
        cart::{self, CartStatus},
        cart_item, Cart, CartItem, CartModel, Product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Shopping cart service.
///
/// A cart line's identity inside a cart is `(product_id, color)`: adding a
/// product that is already present merges quantities instead of creating a
/// second line, and setting a quantity to zero or below removes the line.
///
/// Every mutation is a read-modify-write of the whole cart record inside a
/// database transaction, so concurrent tabs editing the same cart settle as
/// last-write-wins at the record level and a torn line is never observable.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Creates a new cart for a guest session or an authenticated customer.
    #[instrument(skip(self))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<CartModel, ServiceError> {
        if input.session_id.is_none() && input.customer_id.is_none() {
            return Err(ServiceError::InvalidInput(
                "Cart needs a session or a customer owner".to_string(),
            ));
        }

        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(input.session_id),
            customer_id: Set(input.customer_id),
            status: Set(CartStatus::Active),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };

        let cart = cart.insert(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartCreated(cart.id))
            .await;

        info!("Created cart: {}", cart.id);
        Ok(cart)
    }

    /// Finds the active cart for a guest session, if any.
    pub async fn find_active_cart_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CartModel>, ServiceError> {
        Ok(Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Finds the active cart for an authenticated customer, if any.
    pub async fn find_active_cart_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<CartModel>, ServiceError> {
        Ok(Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Adds a product to the cart, merging into an existing line when one
    /// with the same `(product_id, color)` key is already present.
    ///
    /// Price, name, weight, and prep time are snapshotted from the catalog
    /// at add time and are not refreshed afterwards.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        let quantity = input.quantity.unwrap_or(1);
        if quantity < 1 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let product = Product::find_by_id(input.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        if !product.is_active {
            return Err(ServiceError::InvalidOperation(
                "Product is not available".to_string(),
            ));
        }

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(input.product_id))
            .filter(match &input.color {
                Some(color) => cart_item::Column::Color.eq(color.clone()),
                None => cart_item::Column::Color.is_null(),
            })
            .one(&txn)
            .await?;

        if let Some(item) = existing {
            let merged = item.quantity + quantity;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(merged);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        } else {
            let item = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                product_id: Set(product.id),
                name: Set(product.name.clone()),
                color: Set(input.color.clone()),
                attributes: Set(input.attributes.clone()),
                unit_price: Set(product.unit_price),
                quantity: Set(quantity),
                weight_grams: Set(product.weight_grams),
                prep_days: Set(product.prep_days),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            };
            item.insert(&txn).await?;
        }

        let cart = Self::touch(&txn, cart).await?;
        let items = Self::items_of(&txn, cart_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id,
                product_id: input.product_id,
            })
            .await;

        info!(
            "Added item to cart {}: product {} x{}",
            cart_id, input.product_id, quantity
        );
        Ok(CartWithItems { cart, items })
    }

    /// Sets the quantity of a cart line. Zero or below removes the line, so
    /// a negative quantity is never observable.
    #[instrument(skip(self))]
    pub async fn set_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let item = CartItem::find_by_id(item_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        let product_id = item.product_id;
        let removed = quantity <= 0;
        if removed {
            item.delete(&txn).await?;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        }

        let cart = Self::touch(&txn, cart).await?;
        let items = Self::items_of(&txn, cart_id).await?;
        txn.commit().await?;

        if removed {
            self.event_sender
                .send_or_log(Event::CartItemRemoved {
                    cart_id,
                    product_id,
                })
                .await;
        }

        Ok(CartWithItems { cart, items })
    }

    /// Removes a cart line.
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        self.set_item_quantity(cart_id, item_id, 0).await
    }

    /// Retrieves a cart with all its lines.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = cart
            .find_related(CartItem)
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(CartWithItems { cart, items })
    }

    /// Deletes every line from the cart. The cart stays active.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        Self::touch(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(cart_id)).await;

        info!("Cleared cart: {}", cart_id);
        Ok(())
    }

    /// Derived totals for a cart. Never persisted anywhere.
    pub async fn totals(&self, cart_id: Uuid) -> Result<CartTotals, ServiceError> {
        let with_items = self.get_cart(cart_id).await?;
        Ok(CartTotals::from_lines(&with_items.items))
    }

    async fn touch(
        conn: &impl sea_orm::ConnectionTrait,
        cart: CartModel,
    ) -> Result<CartModel, ServiceError> {
        let mut cart: cart::ActiveModel = cart.into();
        cart.updated_at = Set(Utc::now());
        Ok(cart.update(conn).await?)
    }

    async fn items_of(
        conn: &impl sea_orm::ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<Vec<cart_item::Model>, ServiceError> {
        Ok(CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?)
    }
}

/// Input for creating a cart
#[derive(Debug, Deserialize)]
pub struct CreateCartInput {
    pub session_id: Option<String>,
    pub customer_id: Option<Uuid>,
}

/// Input for adding an item to a cart
#[derive(Debug, Clone, Deserialize)]
pub struct AddItemInput {
    pub product_id: Uuid,
    pub color: Option<String>,
    pub attributes: Option<serde_json::Value>,
    /// Defaults to 1 when omitted
    pub quantity: Option<i32>,
}

/// Cart with its lines
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
}

/// Derived cart totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub item_count: i32,
    pub total_weight_grams: i64,
    /// Longest prep time across lines; 1 for a non-empty cart with no prep
    /// data, 0 for an empty cart
    pub max_prep_days: i32,
}

impl CartTotals {
    pub fn from_lines(lines: &[cart_item::Model]) -> Self {
        if lines.is_empty() {
            return Self {
                subtotal: Decimal::ZERO,
                item_count: 0,
                total_weight_grams: 0,
                max_prep_days: 0,
            };
        }

        Self {
            subtotal: super::pricing::subtotal(lines),
            item_count: lines.iter().map(|l| l.quantity).sum(),
            total_weight_grams: super::pricing::total_weight_grams(lines),
            max_prep_days: lines.iter().map(|l| l.prep_days).max().unwrap_or(1).max(1),
        }
    }
}
