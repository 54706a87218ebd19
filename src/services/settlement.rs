use crate::{
    config::AppConfig,
    entities::{
        cart_item,
        settlement::{self, SettlementStatus},
        CouponModel, Settlement, SettlementModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{GatewayError, PaymentGateway, PaymentRequest, VerifyRequest},
    services::{inventory::InventoryService, orders::OrderService, pricing},
};
use chrono::{Duration, Utc};
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use once_cell::sync::Lazy;
use regex::Regex;

pub static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?\d{10,15}$").expect("phone regex compiles"));

/// Shipping destination collected at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct Destination {
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub recipient: String,
    #[validate(regex(path = "PHONE_RE", message = "Phone number is malformed"))]
    pub phone: String,
    #[validate(length(min = 1, message = "Address is required"))]
    pub address_line: String,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, message = "Postal code is required"))]
    pub postal_code: String,
}

/// Immutable copy of one cart line, frozen into the settlement transaction
/// and later into order items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LineSnapshot {
    pub product_id: Uuid,
    pub name: String,
    pub color: Option<String>,
    pub unit_price: rust_decimal::Decimal,
    pub quantity: i32,
    pub weight_grams: i32,
}

impl From<&cart_item::Model> for LineSnapshot {
    fn from(item: &cart_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            name: item.name.clone(),
            color: item.color.clone(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            weight_grams: item.weight_grams,
        }
    }
}

/// Why a settlement resolved to `failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SettlementFailure {
    /// The shopper cancelled at the gateway
    UserCancelled,
    /// The gateway processed the verification and rejected the payment
    GatewayRejected,
    /// The gateway could not be reached or answered garbage
    TransportError,
    /// The callback was missing or carried mismatched parameters
    InvalidCallback,
    /// Administratively expired after sitting unresolved past the TTL
    Expired,
}

/// Terminal answer for one settlement callback. Replays of an
/// already-resolved callback receive the same resolution again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackResolution {
    Succeeded {
        settlement_id: Uuid,
        order_id: Uuid,
        reference: String,
    },
    Failed {
        settlement_id: Option<Uuid>,
        reason: SettlementFailure,
    },
}

/// Raw query parameters arriving on the gateway callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// The gateway's own status flag; anything other than `OK` is treated
    /// as shopper cancellation
    pub status: Option<String>,
    pub authority: Option<String>,
    pub pending_id: Option<String>,
    pub token: Option<String>,
}

/// Input assembled by the checkout orchestrator to open a settlement.
#[derive(Debug)]
pub struct OpenSettlementInput {
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub destination: Destination,
    pub shipping_method: pricing::ShippingMethod,
    pub coupon: Option<CouponModel>,
    pub breakdown: pricing::PricingBreakdown,
    pub snapshot: Vec<LineSnapshot>,
}

/// Handle returned to the shopper's browser: where to go next.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutHandoff {
    pub settlement_id: Uuid,
    pub redirect_url: String,
}

const GATEWAY_OK: &str = "OK";

/// The settlement state machine: `created → pending → succeeded | failed`.
///
/// The pending record (frozen amount, cart snapshot, one-time verification
/// token) is durably persisted before the redirect URL is ever released, so
/// nothing the flow needs lives only in browser memory. A `pending` row
/// that never receives a callback simply stays `pending` until the expiry
/// sweep claims it.
#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    orders: Arc<OrderService>,
    inventory: Arc<InventoryService>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl SettlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        orders: Arc<OrderService>,
        inventory: Arc<InventoryService>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            gateway,
            orders,
            inventory,
            event_sender,
            config,
        }
    }

    /// Opens a settlement transaction and obtains the gateway redirect.
    ///
    /// The row is inserted as `created` before the gateway is contacted and
    /// only advances to `pending` once the authority token is persisted; if
    /// that persist fails the redirect URL is not returned to the caller.
    /// A request the gateway refuses leaves a `failed` row behind, never a
    /// dangling `pending` one.
    #[instrument(skip(self, input), fields(cart_id = %input.cart_id))]
    pub async fn open(
        &self,
        input: OpenSettlementInput,
    ) -> Result<CheckoutHandoff, ServiceError> {
        let settlement_id = Uuid::new_v4();
        let verification_token = mint_verification_token();
        let now = Utc::now();

        let snapshot_json = serde_json::to_value(&input.snapshot)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let destination_json = serde_json::to_value(&input.destination)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        let row = settlement::ActiveModel {
            id: Set(settlement_id),
            cart_id: Set(input.cart_id),
            customer_id: Set(input.customer_id),
            status: Set(SettlementStatus::Created),
            subtotal: Set(input.breakdown.subtotal),
            discount_total: Set(input.breakdown.discount_total),
            shipping_cost: Set(input.breakdown.shipping_cost),
            amount: Set(input.breakdown.online_total),
            shipping_method: Set(input.shipping_method.to_string()),
            destination: Set(destination_json),
            cart_snapshot: Set(snapshot_json),
            coupon_id: Set(input.coupon.as_ref().map(|c| c.id)),
            authority_token: Set(None),
            verification_token: Set(verification_token.clone()),
            failure_reason: Set(None),
            gateway_reference: Set(None),
            order_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            resolved_at: Set(None),
        };
        row.insert(&*self.db).await?;

        let callback_url = format!(
            "{}?pending_id={}&token={}",
            self.config.gateway.callback_url, settlement_id, verification_token
        );
        let item_count: i32 = input.snapshot.iter().map(|l| l.quantity).sum();

        let handle = match self
            .gateway
            .request_payment(PaymentRequest {
                amount: input.breakdown.online_total,
                description: format!("Handmade ceramics order ({} items)", item_count),
                contact_phone: input.destination.phone.clone(),
                callback_url,
                payload: serde_json::json!({
                    "settlement_id": settlement_id,
                    "cart_id": input.cart_id,
                }),
            })
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                // The transaction never reached pending; record the refusal
                // so no dangling pending row is left behind.
                self.mark_failed(settlement_id, SettlementFailure::TransportError)
                    .await?;
                warn!(%settlement_id, error = %err, "gateway refused payment request");
                return Err(ServiceError::ExternalServiceError(format!(
                    "Payment gateway request failed: {}",
                    err
                )));
            }
        };

        // Persist the authority and advance to pending before releasing the
        // redirect; a failure here must not let the shopper leave.
        let pending = settlement::ActiveModel {
            status: Set(SettlementStatus::Pending),
            authority_token: Set(Some(handle.authority.clone())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let updated = Settlement::update_many()
            .set(pending)
            .filter(settlement::Column::Id.eq(settlement_id))
            .filter(settlement::Column::Status.eq(SettlementStatus::Created))
            .exec(&*self.db)
            .await?;
        if updated.rows_affected != 1 {
            return Err(ServiceError::InternalError(
                "Failed to persist pending settlement".to_string(),
            ));
        }

        self.event_sender
            .send_or_log(Event::SettlementOpened(settlement_id))
            .await;

        info!(%settlement_id, amount = %input.breakdown.online_total, "settlement opened");
        Ok(CheckoutHandoff {
            settlement_id,
            redirect_url: handle.redirect_url,
        })
    }

    /// Handles the gateway callback, safe under at-least-once delivery.
    ///
    /// A callback for an already-resolved transaction is answered from the
    /// recorded resolution without contacting the gateway again or creating
    /// a second order. Cancellation flags and malformed parameters resolve
    /// to `failed` without a verify call.
    #[instrument(skip(self, params))]
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
    ) -> Result<CallbackResolution, ServiceError> {
        let Some(settlement_id) = params
            .pending_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            return Ok(CallbackResolution::Failed {
                settlement_id: None,
                reason: SettlementFailure::InvalidCallback,
            });
        };

        let Some(row) = Settlement::find_by_id(settlement_id).one(&*self.db).await? else {
            return Ok(CallbackResolution::Failed {
                settlement_id: None,
                reason: SettlementFailure::InvalidCallback,
            });
        };

        // Replay of a resolved transaction: answer deterministically.
        if let Some(resolution) = stored_resolution(&row) {
            info!(%settlement_id, "replayed callback answered from stored resolution");
            return Ok(resolution);
        }

        if row.status == SettlementStatus::Created {
            // The gateway was never confirmed for this row; a callback for
            // it cannot be genuine.
            return self
                .fail_and_report(settlement_id, SettlementFailure::InvalidCallback)
                .await;
        }

        if params.status.as_deref() != Some(GATEWAY_OK) {
            return self
                .fail_and_report(settlement_id, SettlementFailure::UserCancelled)
                .await;
        }

        let token_ok = params
            .token
            .as_deref()
            .map(|t| t == row.verification_token)
            .unwrap_or(false);
        let authority_ok = match (&params.authority, &row.authority_token) {
            (Some(sent), Some(stored)) => sent == stored,
            _ => false,
        };
        if !token_ok || !authority_ok {
            return self
                .fail_and_report(settlement_id, SettlementFailure::InvalidCallback)
                .await;
        }

        let authority = row.authority_token.clone().unwrap_or_default();
        match self
            .gateway
            .verify_payment(VerifyRequest {
                authority,
                amount: row.amount,
            })
            .await
        {
            Ok(outcome) => self.settle(row, outcome.reference_id).await,
            Err(GatewayError::Declined(reason)) => {
                warn!(%settlement_id, %reason, "gateway rejected payment");
                self.fail_and_report(settlement_id, SettlementFailure::GatewayRejected)
                    .await
            }
            Err(err) => {
                warn!(%settlement_id, error = %err, "payment verification errored");
                self.fail_and_report(settlement_id, SettlementFailure::TransportError)
                    .await
            }
        }
    }

    /// Marks pending transactions older than the configured TTL as failed
    /// with an `expired` reason. Never called from the callback path; an
    /// unresolved transaction is not failed until this sweep decides so.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - Duration::hours(self.config.settlement_pending_ttl_hours);
        let update = settlement::ActiveModel {
            status: Set(SettlementStatus::Failed),
            failure_reason: Set(Some(SettlementFailure::Expired.to_string())),
            resolved_at: Set(Some(Utc::now())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };

        let result = Settlement::update_many()
            .set(update)
            .filter(settlement::Column::Status.eq(SettlementStatus::Pending))
            .filter(settlement::Column::CreatedAt.lt(cutoff))
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 0 {
            info!(count = result.rows_affected, "expired stale pending settlements");
        }
        Ok(result.rows_affected)
    }

    /// Finalizes a verified payment: claims the row, materializes the
    /// order, and records the stock movements.
    async fn settle(
        &self,
        row: SettlementModel,
        reference: String,
    ) -> Result<CallbackResolution, ServiceError> {
        let settlement_id = row.id;
        let txn = self.db.begin().await?;

        // Claim the pending row. Losing this race means another delivery of
        // the callback settled first; fall back to its recorded resolution.
        let claim = settlement::ActiveModel {
            status: Set(SettlementStatus::Succeeded),
            gateway_reference: Set(Some(reference.clone())),
            resolved_at: Set(Some(Utc::now())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let claimed = Settlement::update_many()
            .set(claim)
            .filter(settlement::Column::Id.eq(settlement_id))
            .filter(settlement::Column::Status.eq(SettlementStatus::Pending))
            .exec(&txn)
            .await?;

        if claimed.rows_affected != 1 {
            txn.commit().await?;
            return self.reload_resolution(settlement_id).await;
        }

        let order = self
            .orders
            .materialize_settlement(&txn, &row, &reference)
            .await?;

        let link = settlement::ActiveModel {
            order_id: Set(Some(order.id)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        Settlement::update_many()
            .set(link)
            .filter(settlement::Column::Id.eq(settlement_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        // Stock movements live outside the order transaction but are
        // idempotent per settled transaction, so a crash between commit and
        // here can be retried without a double decrement.
        let snapshot: Vec<LineSnapshot> =
            serde_json::from_value(row.cart_snapshot.clone()).unwrap_or_default();
        self.inventory
            .record_sale(settlement_id, &snapshot)
            .await?;

        self.event_sender
            .send_or_log(Event::SettlementSucceeded {
                settlement_id,
                order_id: order.id,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderCreated(order.id))
            .await;
        self.event_sender
            .send_or_log(Event::CartCleared(row.cart_id))
            .await;
        if let Some(coupon_id) = row.coupon_id {
            self.event_sender
                .send_or_log(Event::CouponRedeemed {
                    coupon_id,
                    order_id: order.id,
                })
                .await;
        }

        info!(%settlement_id, order_id = %order.id, "settlement succeeded");
        Ok(CallbackResolution::Succeeded {
            settlement_id,
            order_id: order.id,
            reference,
        })
    }

    /// Conditionally fails an unresolved row and reports the resolution.
    /// If the row turned terminal in the meantime, the recorded resolution
    /// wins.
    async fn fail_and_report(
        &self,
        settlement_id: Uuid,
        reason: SettlementFailure,
    ) -> Result<CallbackResolution, ServiceError> {
        if self.mark_failed(settlement_id, reason).await? {
            self.event_sender
                .send_or_log(Event::SettlementFailed {
                    settlement_id,
                    reason: reason.to_string(),
                })
                .await;
            Ok(CallbackResolution::Failed {
                settlement_id: Some(settlement_id),
                reason,
            })
        } else {
            self.reload_resolution(settlement_id).await
        }
    }

    /// Returns true when this call performed the transition.
    async fn mark_failed(
        &self,
        settlement_id: Uuid,
        reason: SettlementFailure,
    ) -> Result<bool, ServiceError> {
        let update = settlement::ActiveModel {
            status: Set(SettlementStatus::Failed),
            failure_reason: Set(Some(reason.to_string())),
            resolved_at: Set(Some(Utc::now())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };

        let result = Settlement::update_many()
            .set(update)
            .filter(settlement::Column::Id.eq(settlement_id))
            .filter(
                settlement::Column::Status
                    .is_in([SettlementStatus::Created, SettlementStatus::Pending]),
            )
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn reload_resolution(
        &self,
        settlement_id: Uuid,
    ) -> Result<CallbackResolution, ServiceError> {
        let row = Settlement::find_by_id(settlement_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Settlement {} not found", settlement_id))
            })?;

        stored_resolution(&row).ok_or_else(|| {
            ServiceError::InternalError(format!(
                "Settlement {} lost its claim but is not terminal",
                settlement_id
            ))
        })
    }
}

/// Recorded resolution of a terminal settlement row, if it has one.
fn stored_resolution(row: &SettlementModel) -> Option<CallbackResolution> {
    match row.status {
        SettlementStatus::Succeeded => Some(CallbackResolution::Succeeded {
            settlement_id: row.id,
            order_id: row.order_id.unwrap_or_default(),
            reference: row.gateway_reference.clone().unwrap_or_default(),
        }),
        SettlementStatus::Failed => {
            let reason = row
                .failure_reason
                .as_deref()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(SettlementFailure::GatewayRejected);
            Some(CallbackResolution::Failed {
                settlement_id: Some(row.id),
                reason,
            })
        }
        SettlementStatus::Created | SettlementStatus::Pending => None,
    }
}

/// Mints the one-time verification token bound to a settlement attempt.
fn mint_verification_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn terminal_row(status: SettlementStatus) -> SettlementModel {
        SettlementModel {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            customer_id: None,
            status,
            subtotal: dec!(200000),
            discount_total: dec!(0),
            shipping_cost: dec!(45000),
            amount: dec!(245000),
            shipping_method: "standard".to_string(),
            destination: serde_json::json!({}),
            cart_snapshot: serde_json::json!([]),
            coupon_id: None,
            authority_token: Some("A-1".to_string()),
            verification_token: "tok".to_string(),
            failure_reason: None,
            gateway_reference: None,
            order_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_stored_resolution_for_succeeded_row() {
        let order_id = Uuid::new_v4();
        let row = SettlementModel {
            order_id: Some(order_id),
            gateway_reference: Some("REF-1".to_string()),
            ..terminal_row(SettlementStatus::Succeeded)
        };

        match stored_resolution(&row) {
            Some(CallbackResolution::Succeeded {
                order_id: got,
                reference,
                ..
            }) => {
                assert_eq!(got, order_id);
                assert_eq!(reference, "REF-1");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn test_stored_resolution_for_failed_row_parses_reason() {
        let row = SettlementModel {
            failure_reason: Some("user_cancelled".to_string()),
            ..terminal_row(SettlementStatus::Failed)
        };

        match stored_resolution(&row) {
            Some(CallbackResolution::Failed { reason, .. }) => {
                assert_eq!(reason, SettlementFailure::UserCancelled);
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_rows_have_no_stored_resolution() {
        assert!(stored_resolution(&terminal_row(SettlementStatus::Pending)).is_none());
        assert!(stored_resolution(&terminal_row(SettlementStatus::Created)).is_none());
    }

    #[test]
    fn test_verification_tokens_are_unique_hex() {
        let a = mint_verification_token();
        let b = mint_verification_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_failure_reason_string_round_trip() {
        for reason in [
            SettlementFailure::UserCancelled,
            SettlementFailure::GatewayRejected,
            SettlementFailure::TransportError,
            SettlementFailure::InvalidCallback,
            SettlementFailure::Expired,
        ] {
            let parsed: SettlementFailure = reason.to_string().parse().unwrap();
            assert_eq!(parsed, reason);
        }
    }

    #[test]
    fn test_destination_validation_catches_malformed_phone() {
        let destination = Destination {
            recipient: "Mina K".to_string(),
            phone: "not-a-phone".to_string(),
            address_line: "12 Kiln Street".to_string(),
            city: "Portland".to_string(),
            postal_code: "97201".to_string(),
        };
        assert!(destination.validate().is_err());

        let destination = Destination {
            phone: "09123456789".to_string(),
            ..destination
        };
        assert!(destination.validate().is_ok());
    }
}
