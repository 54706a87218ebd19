use crate::{
    entities::{
        cart::{self, CartStatus},
        cart_item, Cart, CartItem, CartModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::carts::CartWithItems,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Folds a guest cart into a customer cart on the login transition.
///
/// Runs exactly once per login: after a successful merge no active guest
/// cart remains for the session, so a repeated call is a no-op. The merge
/// commits atomically; if the customer cart cannot be updated the guest
/// cart is left untouched and keeps serving as the shopper's cart.
#[derive(Clone)]
pub struct CartReconciler {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

/// Line identity within a cart.
fn line_key(item: &cart_item::Model) -> (Uuid, Option<String>) {
    (item.product_id, item.color.clone())
}

/// Pure merge rule: quantities are summed for keys present on both sides,
/// one-sided keys carry over unchanged. Unit price is not reconciled; it is
/// a snapshot field, and for shared keys the surviving line keeps the price
/// of the side being merged into.
pub fn merged_quantities(
    guest: &[cart_item::Model],
    customer: &[cart_item::Model],
) -> HashMap<(Uuid, Option<String>), i32> {
    let mut merged: HashMap<(Uuid, Option<String>), i32> = HashMap::new();
    for item in customer.iter().chain(guest.iter()) {
        *merged.entry(line_key(item)).or_insert(0) += item.quantity;
    }
    merged
}

impl CartReconciler {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Merges the guest session's cart into the customer's cart.
    ///
    /// Returns the authoritative customer cart. All four shapes are handled:
    /// no guest cart (no-op), empty guest cart (retired), guest-only cart
    /// (promoted to the customer), and a true two-sided merge.
    #[instrument(skip(self))]
    pub async fn merge_on_login(
        &self,
        session_id: &str,
        customer_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        let guest = Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::CreatedAt)
            .one(&*self.db)
            .await?;

        let customer = Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::CreatedAt)
            .one(&*self.db)
            .await?;

        let Some(guest) = guest else {
            // Nothing to reconcile; the remote cart (possibly empty) is
            // already the single source of truth.
            return self.ensure_customer_cart(customer, customer_id).await;
        };

        let guest_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(guest.id))
            .all(&*self.db)
            .await?;

        if guest_items.is_empty() {
            let txn = self.db.begin().await?;
            Self::retire(&txn, guest).await?;
            txn.commit().await?;
            return self.ensure_customer_cart(customer, customer_id).await;
        }

        match customer {
            None => self.promote_guest_cart(guest, guest_items, customer_id).await,
            Some(customer) => self.merge_into(guest, guest_items, customer).await,
        }
    }

    /// Guest side is the only non-empty side: it becomes the remote cart.
    async fn promote_guest_cart(
        &self,
        guest: CartModel,
        items: Vec<cart_item::Model>,
        customer_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        let guest_id = guest.id;
        let mut active: cart::ActiveModel = guest.into();
        active.customer_id = Set(Some(customer_id));
        active.session_id = Set(None);
        active.updated_at = Set(Utc::now());
        let cart = active.update(&*self.db).await?;

        info!("Promoted guest cart {} to customer {}", guest_id, customer_id);
        Ok(CartWithItems { cart, items })
    }

    /// Both sides non-empty: sum quantities for shared keys, copy one-sided
    /// guest lines over, then retire the guest cart.
    async fn merge_into(
        &self,
        guest: CartModel,
        guest_items: Vec<cart_item::Model>,
        customer: CartModel,
    ) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let customer_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(customer.id))
            .all(&txn)
            .await?;

        let mut targets = merged_quantities(&guest_items, &customer_items);

        // Existing customer lines take their merged quantity (keeping their
        // own price snapshot); whatever remains in the map is guest-only and
        // gets copied over.
        for existing in customer_items {
            if let Some(quantity) = targets.remove(&line_key(&existing)) {
                if quantity != existing.quantity {
                    let mut active: cart_item::ActiveModel = existing.into();
                    active.quantity = Set(quantity);
                    active.updated_at = Set(Utc::now());
                    active.update(&txn).await?;
                }
            }
        }

        for guest_item in guest_items {
            let Some(quantity) = targets.remove(&line_key(&guest_item)) else {
                continue;
            };
            let copied = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(customer.id),
                product_id: Set(guest_item.product_id),
                name: Set(guest_item.name),
                color: Set(guest_item.color),
                attributes: Set(guest_item.attributes),
                unit_price: Set(guest_item.unit_price),
                quantity: Set(quantity),
                weight_grams: Set(guest_item.weight_grams),
                prep_days: Set(guest_item.prep_days),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            };
            copied.insert(&txn).await?;
        }

        // Clear the guest record only inside the same transaction: if the
        // merge fails the guest cart survives intact.
        let guest_id = guest.id;
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(guest_id))
            .exec(&txn)
            .await?;
        Self::retire(&txn, guest).await?;

        let mut active: cart::ActiveModel = customer.clone().into();
        active.updated_at = Set(Utc::now());
        let cart = active.update(&txn).await?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&txn)
            .await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartsMerged {
                guest_cart_id: guest_id,
                customer_cart_id: cart.id,
            })
            .await;

        info!("Merged guest cart {} into customer cart {}", guest_id, cart.id);
        Ok(CartWithItems { cart, items })
    }

    async fn ensure_customer_cart(
        &self,
        existing: Option<CartModel>,
        customer_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        let cart = match existing {
            Some(cart) => cart,
            None => {
                let cart = cart::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    session_id: Set(None),
                    customer_id: Set(Some(customer_id)),
                    status: Set(CartStatus::Active),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                };
                cart.insert(&*self.db).await?
            }
        };

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(CartWithItems { cart, items })
    }

    async fn retire(
        conn: &impl sea_orm::ConnectionTrait,
        guest: CartModel,
    ) -> Result<(), ServiceError> {
        let mut active: cart::ActiveModel = guest.into();
        active.status = Set(CartStatus::Merged);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn item(product_id: Uuid, color: Option<&str>, quantity: i32) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            product_id,
            name: "Celadon cup".to_string(),
            color: color.map(str::to_string),
            attributes: None,
            unit_price: dec!(100000),
            quantity,
            weight_grams: 300,
            prep_days: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_shared_keys_sum_quantities() {
        let a = Uuid::new_v4();
        let merged = merged_quantities(&[item(a, None, 2)], &[item(a, None, 3)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[&(a, None)], 5);
    }

    #[test]
    fn test_one_sided_keys_carry_over() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merged_quantities(&[item(a, None, 2)], &[item(b, None, 1)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&(a, None)], 2);
        assert_eq!(merged[&(b, None)], 1);
    }

    #[test]
    fn test_color_distinguishes_lines() {
        let a = Uuid::new_v4();
        let merged = merged_quantities(&[item(a, Some("azure"), 1)], &[item(a, None, 2)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&(a, Some("azure".to_string()))], 1);
        assert_eq!(merged[&(a, None)], 2);
    }

    proptest! {
        /// The merge rule is commutative on quantities: swapping which side
        /// is "guest" and which is "customer" yields the same totals.
        #[test]
        fn prop_merge_is_commutative_on_quantities(
            quantities_a in proptest::collection::vec(1..50i32, 0..6),
            quantities_b in proptest::collection::vec(1..50i32, 0..6),
        ) {
            // A small pool of product ids so overlaps actually occur.
            let pool: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

            let side_a: Vec<cart_item::Model> = quantities_a
                .iter()
                .enumerate()
                .map(|(i, q)| item(pool[i % pool.len()], None, *q))
                .collect();
            let side_b: Vec<cart_item::Model> = quantities_b
                .iter()
                .enumerate()
                .map(|(i, q)| item(pool[(i + 1) % pool.len()], None, *q))
                .collect();

            prop_assert_eq!(
                merged_quantities(&side_a, &side_b),
                merged_quantities(&side_b, &side_a)
            );
        }
    }
}
