//! Payment gateway client
//!
//! The core depends on the [`PaymentGateway`] trait only. The HTTP
//! implementation speaks the Razorpay wire shape: basic auth with
//! `key_id:key_secret`, order and refund creation, amounts in minor units
//! (paise). Every call carries the configured deadline; 4xx responses are
//! permanent rejections, 5xx and transport failures are retryable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use meterflow_core::config::GatewayConfig;
use meterflow_core::errors::{PaymentError, PaymentResult};

/// An order created at the gateway
#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub order_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub receipt: String,
}

/// A refund created at the gateway
#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub refund_id: String,
    pub gateway_payment_id: String,
    pub amount_minor: i64,
    pub status: String,
}

/// A payment's state as the gateway reports it; used by reconciliation
#[derive(Debug, Clone)]
pub struct GatewayPaymentState {
    pub gateway_payment_id: String,
    pub order_id: Option<String>,
    pub status: String,
    pub amount_minor: i64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
        notes: &HashMap<String, String>,
    ) -> PaymentResult<GatewayOrder>;

    async fn create_refund(
        &self,
        gateway_payment_id: &str,
        amount_minor: i64,
        notes: &HashMap<String, String>,
    ) -> PaymentResult<GatewayRefund>;

    async fn fetch_payment(
        &self,
        gateway_payment_id: &str,
    ) -> PaymentResult<Option<GatewayPaymentState>>;
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    receipt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    payment_id: String,
    amount: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    #[serde(default)]
    order_id: Option<String>,
    status: String,
    amount: i64,
}

/// HTTP client for the Razorpay-shaped gateway API
pub struct RazorpayGateway {
    http: reqwest::Client,
    api_base: String,
    auth_header: String,
}

impl RazorpayGateway {
    pub fn new(config: &GatewayConfig) -> PaymentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
        let credentials = format!("{}:{}", config.key_id, config.key_secret);
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth_header: format!("Basic {}", STANDARD.encode(credentials)),
        })
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> PaymentResult<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.api_base))
            .header("Authorization", &self.auth_header)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> PaymentResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(PaymentError::GatewayUnavailable(format!(
                "{status}: {message}"
            )))
        } else {
            Err(PaymentError::GatewayRejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
        notes: &HashMap<String, String>,
    ) -> PaymentResult<GatewayOrder> {
        let response: OrderResponse = self
            .post_json(
                "/orders",
                json!({
                    "amount": amount_minor,
                    "currency": currency,
                    "receipt": receipt,
                    "notes": notes,
                }),
            )
            .await?;
        debug!(order_id = %response.id, amount = amount_minor, "gateway order created");
        Ok(GatewayOrder {
            order_id: response.id,
            amount_minor: response.amount,
            currency: response.currency,
            receipt: response.receipt.unwrap_or_else(|| receipt.to_string()),
        })
    }

    async fn create_refund(
        &self,
        gateway_payment_id: &str,
        amount_minor: i64,
        notes: &HashMap<String, String>,
    ) -> PaymentResult<GatewayRefund> {
        let response: RefundResponse = self
            .post_json(
                &format!("/payments/{gateway_payment_id}/refund"),
                json!({ "amount": amount_minor, "notes": notes }),
            )
            .await?;
        Ok(GatewayRefund {
            refund_id: response.id,
            gateway_payment_id: response.payment_id,
            amount_minor: response.amount,
            status: response.status,
        })
    }

    async fn fetch_payment(
        &self,
        gateway_payment_id: &str,
    ) -> PaymentResult<Option<GatewayPaymentState>> {
        let response = self
            .http
            .get(format!("{}/payments/{gateway_payment_id}", self.api_base))
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let state: PaymentResponse = Self::decode(response).await?;
        Ok(Some(GatewayPaymentState {
            gateway_payment_id: state.id,
            order_id: state.order_id,
            status: state.status,
            amount_minor: state.amount,
        }))
    }
}

/// In-memory gateway for tests and local development. Ids carry a random
/// instance tag so rows from different runs never collide on the unique
/// gateway-id columns; `fail_next` makes the next call return a transient
/// error.
pub struct MockGateway {
    sequence: AtomicU64,
    fail_next: AtomicBool,
    tag: String,
    pub orders: DashMap<String, GatewayOrder>,
    pub refunds: DashMap<String, GatewayRefund>,
    pub payments: DashMap<String, GatewayPaymentState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            sequence: AtomicU64::new(0),
            fail_next: AtomicBool::new(false),
            tag: tag[..8].to_string(),
            orders: DashMap::new(),
            refunds: DashMap::new(),
            payments: DashMap::new(),
        }
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> PaymentResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PaymentError::GatewayUnavailable(
                "mock gateway unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}_{}_{n:06}", self.tag)
    }

    /// Register a payment state so reconciliation tests can compare.
    pub fn put_payment_state(&self, state: GatewayPaymentState) {
        self.payments
            .insert(state.gateway_payment_id.clone(), state);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
        _notes: &HashMap<String, String>,
    ) -> PaymentResult<GatewayOrder> {
        self.check_failure()?;
        let order = GatewayOrder {
            order_id: self.next_id("order"),
            amount_minor,
            currency: currency.to_string(),
            receipt: receipt.to_string(),
        };
        self.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn create_refund(
        &self,
        gateway_payment_id: &str,
        amount_minor: i64,
        _notes: &HashMap<String, String>,
    ) -> PaymentResult<GatewayRefund> {
        self.check_failure()?;
        let refund = GatewayRefund {
            refund_id: self.next_id("rfnd"),
            gateway_payment_id: gateway_payment_id.to_string(),
            amount_minor,
            status: "pending".to_string(),
        };
        self.refunds.insert(refund.refund_id.clone(), refund.clone());
        Ok(refund)
    }

    async fn fetch_payment(
        &self,
        gateway_payment_id: &str,
    ) -> PaymentResult<Option<GatewayPaymentState>> {
        self.check_failure()?;
        Ok(self
            .payments
            .get(gateway_payment_id)
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_gateway_creates_sequential_orders() {
        let gateway = MockGateway::new();
        let a = gateway
            .create_order(118000, "INR", "INV-1", &HashMap::new())
            .await
            .unwrap();
        let b = gateway
            .create_order(5000, "INR", "INV-2", &HashMap::new())
            .await
            .unwrap();
        assert_ne!(a.order_id, b.order_id);
        assert_eq!(a.amount_minor, 118000);
        assert!(gateway.orders.contains_key(&a.order_id));
    }

    #[tokio::test]
    async fn mock_gateway_failure_is_one_shot() {
        let gateway = MockGateway::new();
        gateway.fail_next_call();
        let err = gateway
            .create_order(100, "INR", "r", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::GatewayUnavailable(_)));
        assert!(gateway
            .create_order(100, "INR", "r", &HashMap::new())
            .await
            .is_ok());
    }
}
