use crate::{
    entities::{coupon, Coupon, CouponModel},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Coupon lookup and applicability checks.
///
/// Applicability is evaluated against a subtotal at quote/checkout time;
/// `used_count` only moves when the order materializer confirms a
/// settlement, so abandoned checkouts never consume a use.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

/// A coupon is applicable iff it is active, unexpired, the subtotal meets
/// the minimum purchase, and the usage limit (when set) is not exhausted.
pub fn validate_coupon(
    coupon: &CouponModel,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if !coupon.is_active {
        return Err(ServiceError::CouponRejected(format!(
            "Coupon {} is not active",
            coupon.code
        )));
    }

    if let Some(expires_at) = coupon.expires_at {
        if now >= expires_at {
            return Err(ServiceError::CouponRejected(format!(
                "Coupon {} has expired",
                coupon.code
            )));
        }
    }

    if subtotal < coupon.min_purchase {
        return Err(ServiceError::CouponRejected(format!(
            "Coupon {} requires a minimum purchase of {}",
            coupon.code, coupon.min_purchase
        )));
    }

    if let Some(limit) = coupon.usage_limit {
        if coupon.used_count >= limit {
            return Err(ServiceError::CouponRejected(format!(
                "Coupon {} has been fully redeemed",
                coupon.code
            )));
        }
    }

    Ok(())
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Looks up a coupon by code.
    #[instrument(skip(self))]
    pub async fn get_by_code(&self, code: &str) -> Result<CouponModel, ServiceError> {
        Coupon::find()
            .filter(coupon::Column::Code.eq(code))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::CouponRejected(format!("Coupon {} not found", code)))
    }

    /// Resolves a code into an applicable coupon for the given subtotal, or
    /// a `CouponRejected` error describing why it does not apply.
    pub async fn resolve_applicable(
        &self,
        code: &str,
        subtotal: Decimal,
    ) -> Result<CouponModel, ServiceError> {
        let coupon = self.get_by_code(code).await?;
        validate_coupon(&coupon, subtotal, Utc::now())?;
        Ok(coupon)
    }

    /// Advances `used_count` for a confirmed settlement. Runs inside the
    /// materializer's transaction.
    pub async fn increment_usage(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
        coupon_id: Uuid,
    ) -> Result<(), ServiceError> {
        let coupon = Coupon::find_by_id(coupon_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;

        let used = coupon.used_count + 1;
        let mut active: coupon::ActiveModel = coupon.into();
        active.used_count = Set(used);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        Ok(())
    }
}
