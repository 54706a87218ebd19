//! Payment gateway client.
//!
//! The settlement flow only ever talks to the gateway through the
//! [`PaymentGateway`] trait, so tests (and any future gateway swap) inject
//! their own implementation. The gateway itself is a black box reached by
//! redirecting the shopper and then confirming the transaction server-side.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

use crate::config::GatewayConfig;

/// Errors surfaced by gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The gateway processed the call and rejected the payment
    #[error("payment declined: {0}")]
    Declined(String),

    /// The gateway could not be reached or timed out
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// The gateway answered with something other than the documented shape
    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

/// Input for opening a transaction at the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub description: String,
    pub contact_phone: String,
    pub callback_url: String,
    /// Opaque order payload echoed back by the gateway; not interpreted
    pub payload: serde_json::Value,
}

/// A successfully opened gateway transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentHandle {
    /// Gateway-issued token identifying the reservation
    pub authority: String,
    /// URL the shopper's browser must be sent to
    pub redirect_url: String,
}

/// Input for confirming a transaction after the shopper returns.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    pub authority: String,
    /// The frozen settlement amount; the gateway cross-checks it
    pub amount: Decimal,
}

/// A confirmed payment.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyOutcome {
    /// Gateway-side reference for the captured payment
    pub reference_id: String,
}

/// Narrow interface to the external payment gateway.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a transaction and returns the redirect handle.
    async fn request_payment(&self, request: PaymentRequest)
        -> Result<PaymentHandle, GatewayError>;

    /// Confirms a transaction exactly once. Callers are responsible for not
    /// invoking this again for an already-resolved transaction.
    async fn verify_payment(&self, request: VerifyRequest)
        -> Result<VerifyOutcome, GatewayError>;
}

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    merchant_id: &'a str,
    #[serde(flatten)]
    request: &'a PaymentRequest,
}

#[derive(Debug, Serialize)]
struct VerifyEnvelope<'a> {
    merchant_id: &'a str,
    #[serde(flatten)]
    request: &'a VerifyRequest,
}

#[derive(Debug, Deserialize)]
struct VerifyReply {
    confirmed: bool,
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    #[serde(default)]
    error: Option<String>,
}

/// HTTP implementation of [`PaymentGateway`].
#[derive(Debug, Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn read_error(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<ErrorReply>().await {
            Ok(reply) => reply
                .error
                .unwrap_or_else(|| format!("gateway returned {}", status)),
            Err(_) => format!("gateway returned {}", status),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(amount = %request.amount))]
    async fn request_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentHandle, GatewayError> {
        let envelope = RequestEnvelope {
            merchant_id: &self.config.merchant_id,
            request: &request,
        };

        let response = self
            .client
            .post(self.endpoint("payments/request"))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let message = Self::read_error(response).await;
            warn!(%message, "gateway refused payment request");
            return Err(GatewayError::Protocol(message));
        }

        response
            .json::<PaymentHandle>()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    #[instrument(skip(self, request), fields(authority = %request.authority))]
    async fn verify_payment(
        &self,
        request: VerifyRequest,
    ) -> Result<VerifyOutcome, GatewayError> {
        let envelope = VerifyEnvelope {
            merchant_id: &self.config.merchant_id,
            request: &request,
        };

        let response = self
            .client
            .post(self.endpoint("payments/verify"))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let message = Self::read_error(response).await;
            return Err(GatewayError::Protocol(message));
        }

        let reply = response
            .json::<VerifyReply>()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;

        if reply.confirmed {
            let reference_id = reply
                .reference_id
                .ok_or_else(|| GatewayError::Protocol("confirmed without reference".into()))?;
            Ok(VerifyOutcome { reference_id })
        } else {
            Err(GatewayError::Declined(
                reply.reason.unwrap_or_else(|| "payment not confirmed".into()),
            ))
        }
    }
}
