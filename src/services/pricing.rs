//! Pricing engine: subtotal, weight-tiered shipping, coupon discount, and
//! the split between the online-collected amount and pay-at-door charges.
//!
//! Everything here is pure and deterministic: no I/O, no clock. Coupon
//! *applicability* (expiry, minimum purchase, usage limit) is checked by the
//! coupon service before a coupon model ever reaches these functions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;

use crate::config::ShippingConfig;
use crate::entities::cart_item;
use crate::entities::coupon::{self, CouponType};

const GRAMS_PER_KG: i64 = 1000;

/// Delivery options offered at checkout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShippingMethod {
    /// National carrier, first kilogram flat then per-kg
    Standard,
    /// Same-city courier; offered only for the configured city
    Courier,
    /// Standard carrier, but the shipping charge is collected at the door
    PayOnDelivery,
}

/// A two-part tariff: flat rate for the first kilogram, then per extra kg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingTariff {
    pub base: Decimal,
    pub extra_per_kg: Decimal,
}

impl ShippingTariff {
    pub fn standard(cfg: &ShippingConfig) -> Self {
        Self {
            base: Decimal::from(cfg.standard_base),
            extra_per_kg: Decimal::from(cfg.standard_extra_per_kg),
        }
    }

    pub fn courier(cfg: &ShippingConfig) -> Self {
        Self {
            base: Decimal::from(cfg.courier_base),
            extra_per_kg: Decimal::from(cfg.courier_extra_per_kg),
        }
    }
}

/// Full priced breakdown for a cart + shipping method + optional coupon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PricingBreakdown {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    /// Displayed shipping cost, regardless of where it is collected
    pub shipping_cost: Decimal,
    /// Amount the gateway collects online
    pub online_total: Decimal,
    /// Amount settled physically on delivery (pay-on-delivery shipping)
    pub due_on_delivery: Decimal,
    pub total_weight_grams: i64,
}

impl PricingBreakdown {
    pub fn zero() -> Self {
        Self {
            subtotal: Decimal::ZERO,
            discount_total: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            online_total: Decimal::ZERO,
            due_on_delivery: Decimal::ZERO,
            total_weight_grams: 0,
        }
    }
}

/// Sum of `unit_price * quantity` across lines.
pub fn subtotal(lines: &[cart_item::Model]) -> Decimal {
    lines
        .iter()
        .map(|line| line.unit_price * Decimal::from(line.quantity))
        .sum()
}

/// Sum of `weight_grams * quantity` across lines.
pub fn total_weight_grams(lines: &[cart_item::Model]) -> i64 {
    lines
        .iter()
        .map(|line| i64::from(line.weight_grams) * i64::from(line.quantity))
        .sum()
}

/// Standard-carrier shipping: the first kilogram is covered by the flat
/// rate; the weight *above* it is rounded up to whole kilograms. Partial
/// kilograms are never pro-rated down.
pub fn standard_shipping_cost(weight_grams: i64, tariff: &ShippingTariff) -> Decimal {
    if weight_grams <= GRAMS_PER_KG {
        return tariff.base;
    }
    let over = weight_grams - GRAMS_PER_KG;
    let extra_kg = (over + GRAMS_PER_KG - 1) / GRAMS_PER_KG;
    tariff.base + tariff.extra_per_kg * Decimal::from(extra_kg)
}

/// Courier shipping: the whole shipment is rounded up to whole kilograms
/// first, then the included first kilogram is subtracted. The standard
/// carrier rounds only the weight above the included kilogram.
pub fn courier_shipping_cost(weight_grams: i64, tariff: &ShippingTariff) -> Decimal {
    let whole_kg = ((weight_grams + GRAMS_PER_KG - 1) / GRAMS_PER_KG).max(1);
    let extra_kg = whole_kg - 1;
    tariff.base + tariff.extra_per_kg * Decimal::from(extra_kg)
}

/// Discount amount for an already-validated coupon, clamped so the goods
/// total can never go negative.
pub fn coupon_discount(coupon: &coupon::Model, subtotal: Decimal) -> Decimal {
    let raw = match coupon.discount_type {
        CouponType::Percentage => {
            let pct = subtotal * coupon.discount_value / Decimal::from(100);
            match coupon.max_discount {
                Some(cap) => pct.min(cap),
                None => pct,
            }
        }
        CouponType::Fixed => coupon.discount_value,
    };
    raw.min(subtotal)
}

/// Prices a cart for a shipping method and optional (validated) coupon.
///
/// An empty cart prices to all zeros; the checkout orchestrator refuses it
/// before any settlement is opened.
pub fn price_cart(
    lines: &[cart_item::Model],
    method: ShippingMethod,
    coupon: Option<&coupon::Model>,
    shipping: &ShippingConfig,
) -> PricingBreakdown {
    if lines.is_empty() {
        return PricingBreakdown::zero();
    }

    let subtotal = subtotal(lines);
    let weight = total_weight_grams(lines);

    let shipping_cost = match method {
        ShippingMethod::Standard | ShippingMethod::PayOnDelivery => {
            standard_shipping_cost(weight, &ShippingTariff::standard(shipping))
        }
        ShippingMethod::Courier => {
            courier_shipping_cost(weight, &ShippingTariff::courier(shipping))
        }
    };

    let discount_total = coupon
        .map(|c| coupon_discount(c, subtotal))
        .unwrap_or(Decimal::ZERO);

    let goods_total = subtotal - discount_total;
    let (online_total, due_on_delivery) = match method {
        ShippingMethod::PayOnDelivery => (goods_total, shipping_cost),
        _ => (goods_total + shipping_cost, Decimal::ZERO),
    };

    PricingBreakdown {
        subtotal,
        discount_total,
        shipping_cost,
        online_total,
        due_on_delivery,
        total_weight_grams: weight,
    }
}
