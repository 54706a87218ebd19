use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::CartService,
        coupons::CouponService,
        pricing::{self, PricingBreakdown, ShippingMethod},
        settlement::{
            CheckoutHandoff, Destination, LineSnapshot, OpenSettlementInput, SettlementService,
        },
    },
};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Checkout orchestrator.
///
/// Validates the cart and destination, re-prices from the live cart (never
/// a cached quote), snapshots the lines, and opens a settlement. One
/// submission per cart may be in flight at a time; a second submit while
/// the first is still talking to the gateway is refused outright.
#[derive(Clone)]
pub struct CheckoutService {
    carts: Arc<CartService>,
    coupons: Arc<CouponService>,
    settlements: Arc<SettlementService>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    in_flight: Arc<DashMap<Uuid, ()>>,
}

/// Input for a non-binding price preview.
#[derive(Debug, Deserialize)]
pub struct QuoteInput {
    pub cart_id: Uuid,
    pub shipping_method: ShippingMethod,
    /// Destination city, needed to offer the courier option
    pub city: Option<String>,
    pub coupon_code: Option<String>,
}

/// Input for submitting a checkout.
#[derive(Debug, Deserialize)]
pub struct CheckoutInput {
    pub cart_id: Uuid,
    pub destination: Destination,
    pub shipping_method: ShippingMethod,
    pub coupon_code: Option<String>,
}

/// Removes the in-flight marker when the submission finishes, on every
/// path out of `submit`.
#[derive(Debug)]
struct InFlightGuard {
    map: Arc<DashMap<Uuid, ()>>,
    cart_id: Uuid,
}

impl InFlightGuard {
    fn acquire(map: Arc<DashMap<Uuid, ()>>, cart_id: Uuid) -> Result<Self, ServiceError> {
        if map.insert(cart_id, ()).is_some() {
            return Err(ServiceError::InvalidOperation(
                "A checkout is already in progress for this cart".to_string(),
            ));
        }
        Ok(Self { map, cart_id })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.cart_id);
    }
}

fn courier_allowed(destination_city: &str, configured_city: &str) -> bool {
    destination_city.trim().eq_ignore_ascii_case(configured_city)
}

impl CheckoutService {
    pub fn new(
        carts: Arc<CartService>,
        coupons: Arc<CouponService>,
        settlements: Arc<SettlementService>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            carts,
            coupons,
            settlements,
            event_sender,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Prices the current cart for a shipping method and optional coupon
    /// without opening a settlement. An empty cart quotes to all zeros.
    #[instrument(skip(self))]
    pub async fn quote(&self, input: QuoteInput) -> Result<PricingBreakdown, ServiceError> {
        self.ensure_courier_allowed(input.shipping_method, input.city.as_deref())?;

        let with_items = self.carts.get_cart(input.cart_id).await?;

        let coupon = match &input.coupon_code {
            Some(code) => {
                let subtotal = pricing::subtotal(&with_items.items);
                Some(self.coupons.resolve_applicable(code, subtotal).await?)
            }
            None => None,
        };

        Ok(pricing::price_cart(
            &with_items.items,
            input.shipping_method,
            coupon.as_ref(),
            &self.config.shipping,
        ))
    }

    /// Validates and submits a checkout, handing off to the settlement
    /// state machine. On any failure the cart is left untouched and the
    /// shopper can correct and resubmit.
    #[instrument(skip(self, input), fields(cart_id = %input.cart_id))]
    pub async fn submit(&self, input: CheckoutInput) -> Result<CheckoutHandoff, ServiceError> {
        let _guard = InFlightGuard::acquire(self.in_flight.clone(), input.cart_id)?;

        input
            .destination
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        self.ensure_courier_allowed(input.shipping_method, Some(&input.destination.city))?;

        let with_items = self.carts.get_cart(input.cart_id).await?;
        if with_items.cart.status != crate::entities::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }
        if with_items.items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cart is empty".to_string(),
            ));
        }

        let coupon = match &input.coupon_code {
            Some(code) => {
                let subtotal = pricing::subtotal(&with_items.items);
                Some(self.coupons.resolve_applicable(code, subtotal).await?)
            }
            None => None,
        };

        // Price from the live cart at the moment of submission; the result
        // is frozen into the settlement and never recomputed.
        let breakdown = pricing::price_cart(
            &with_items.items,
            input.shipping_method,
            coupon.as_ref(),
            &self.config.shipping,
        );
        let snapshot: Vec<LineSnapshot> =
            with_items.items.iter().map(LineSnapshot::from).collect();

        let handoff = self
            .settlements
            .open(OpenSettlementInput {
                cart_id: input.cart_id,
                customer_id: with_items.cart.customer_id,
                destination: input.destination,
                shipping_method: input.shipping_method,
                coupon,
                breakdown,
                snapshot,
            })
            .await?;

        self.event_sender
            .send_or_log(Event::CheckoutSubmitted {
                cart_id: input.cart_id,
                settlement_id: handoff.settlement_id,
            })
            .await;

        info!(
            "Checkout submitted for cart {}: settlement {}",
            input.cart_id, handoff.settlement_id
        );
        Ok(handoff)
    }

    fn ensure_courier_allowed(
        &self,
        method: ShippingMethod,
        city: Option<&str>,
    ) -> Result<(), ServiceError> {
        if method != ShippingMethod::Courier {
            return Ok(());
        }
        let allowed = city
            .map(|c| courier_allowed(c, &self.config.shipping.courier_city))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            Err(ServiceError::ValidationError(format!(
                "Courier delivery is only available in {}",
                self.config.shipping.courier_city
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard_blocks_second_submit() {
        let map = Arc::new(DashMap::new());
        let cart_id = Uuid::new_v4();

        let first = InFlightGuard::acquire(map.clone(), cart_id);
        assert!(first.is_ok());

        let second = InFlightGuard::acquire(map.clone(), cart_id);
        assert!(matches!(
            second.unwrap_err(),
            ServiceError::InvalidOperation(_)
        ));

        // Releasing the first submission frees the slot.
        drop(first);
        assert!(InFlightGuard::acquire(map, cart_id).is_ok());
    }

    #[test]
    fn test_in_flight_guard_is_per_cart() {
        let map = Arc::new(DashMap::new());
        let _a = InFlightGuard::acquire(map.clone(), Uuid::new_v4()).unwrap();
        assert!(InFlightGuard::acquire(map, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_courier_city_match_ignores_case_and_spacing() {
        assert!(courier_allowed("portland", "Portland"));
        assert!(courier_allowed(" Portland ", "Portland"));
        assert!(!courier_allowed("Salem", "Portland"));
        assert!(!courier_allowed("", "Portland"));
    }
}
