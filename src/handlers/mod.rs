pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    gateway::PaymentGateway,
    services::{
        carts::CartService, checkout::CheckoutService, coupons::CouponService,
        inventory::InventoryService, orders::OrderService, reconciliation::CartReconciler,
        settlement::SettlementService,
    },
    AppState,
};
use axum::Router;
use std::sync::Arc;

/// Service container shared through the application state.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub reconciler: Arc<CartReconciler>,
    pub coupons: Arc<CouponService>,
    pub checkout: Arc<CheckoutService>,
    pub settlements: Arc<SettlementService>,
    pub orders: Arc<OrderService>,
    pub inventory: Arc<InventoryService>,
}

impl AppServices {
    /// Wires the service graph. The payment gateway arrives as a trait
    /// object so tests and alternate gateways plug in without touching the
    /// wiring.
    pub fn new(
        db: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<AppConfig>,
    ) -> Self {
        let carts = Arc::new(CartService::new(db.clone(), event_sender.clone()));
        let reconciler = Arc::new(CartReconciler::new(db.clone(), event_sender.clone()));
        let coupons = Arc::new(CouponService::new(db.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            coupons.clone(),
            config.clone(),
        ));
        let inventory = Arc::new(InventoryService::new(db.clone(), event_sender.clone()));
        let settlements = Arc::new(SettlementService::new(
            db,
            gateway,
            orders.clone(),
            inventory.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            carts.clone(),
            coupons.clone(),
            settlements.clone(),
            event_sender,
            config,
        ));

        Self {
            carts,
            reconciler,
            coupons,
            checkout,
            settlements,
            orders,
            inventory,
        }
    }
}

/// Versioned API router.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/carts", carts::carts_routes())
        .nest("/checkout", checkout::checkout_routes())
        .nest("/payments", payments::payments_routes())
        .nest("/orders", orders::orders_routes())
}
