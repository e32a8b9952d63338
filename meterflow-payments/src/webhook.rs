//! Webhook signature verification and event parsing
//!
//! The gateway signs the raw request body with HMAC-SHA-256 over the shared
//! webhook secret and sends the hex digest in `X-Razorpay-Signature`.
//! Verification is constant-time; a bad or missing signature leaves state
//! untouched and answers 400.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use meterflow_core::errors::{PaymentError, PaymentResult};

type HmacSha256 = Hmac<Sha256>;

/// Constant-time verification of the webhook signature over the raw body.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac.verify_slice(&signature).is_ok()
}

/// Sign a body the way the gateway does; used by tests and the mock.
pub fn sign(secret: &str, raw_body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

/// Payment entity inside a gateway webhook
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Minor units (paise for INR)
    pub amount: i64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub notes: Option<serde_json::Value>,
}

/// Refund entity inside a gateway webhook
#[derive(Debug, Clone, Deserialize)]
pub struct RefundEntity {
    pub id: String,
    pub payment_id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    payment: Option<Wrapped<PaymentEntity>>,
    #[serde(default)]
    refund: Option<Wrapped<RefundEntity>>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    payload: Payload,
}

/// A parsed webhook the state machine knows how to apply
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PaymentAuthorized(PaymentEntity),
    PaymentCaptured(PaymentEntity),
    PaymentFailed(PaymentEntity),
    RefundProcessed(RefundEntity),
    RefundFailed(RefundEntity),
    /// Recognised envelope, event type we deliberately ignore
    Ignored(String),
}

/// Parse the raw body into a typed event. Unknown event names are `Ignored`
/// (the gateway sends many we do not consume); structurally malformed
/// payloads are permanent 400s.
pub fn parse_event(raw_body: &[u8]) -> PaymentResult<WebhookEvent> {
    let envelope: Envelope = serde_json::from_slice(raw_body)
        .map_err(|e| PaymentError::MalformedWebhook(e.to_string()))?;

    let payment = |payload: Payload| {
        payload
            .payment
            .map(|wrapped| wrapped.entity)
            .ok_or_else(|| PaymentError::MalformedWebhook("missing payment entity".to_string()))
    };
    let refund = |payload: Payload| {
        payload
            .refund
            .map(|wrapped| wrapped.entity)
            .ok_or_else(|| PaymentError::MalformedWebhook("missing refund entity".to_string()))
    };

    match envelope.event.as_str() {
        "payment.authorized" => Ok(WebhookEvent::PaymentAuthorized(payment(envelope.payload)?)),
        "payment.captured" => Ok(WebhookEvent::PaymentCaptured(payment(envelope.payload)?)),
        "payment.failed" => Ok(WebhookEvent::PaymentFailed(payment(envelope.payload)?)),
        "refund.processed" => Ok(WebhookEvent::RefundProcessed(refund(envelope.payload)?)),
        "refund.failed" => Ok(WebhookEvent::RefundFailed(refund(envelope.payload)?)),
        other => Ok(WebhookEvent::Ignored(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn captured_body() -> Vec<u8> {
        serde_json::json!({
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_X",
                        "order_id": "order_1",
                        "status": "captured",
                        "amount": 118000,
                        "method": "card"
                    }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn round_trips_a_valid_signature() {
        let body = captured_body();
        let signature = sign(SECRET, &body);
        assert!(verify_signature(SECRET, &body, &signature));
    }

    #[test]
    fn rejects_tampered_bodies_and_wrong_secrets() {
        let body = captured_body();
        let signature = sign(SECRET, &body);
        let mut tampered = body.clone();
        tampered[0] ^= 1;
        assert!(!verify_signature(SECRET, &tampered, &signature));
        assert!(!verify_signature("whsec_other", &body, &signature));
        assert!(!verify_signature(SECRET, &body, "not-hex"));
        assert!(!verify_signature(SECRET, &body, ""));
    }

    #[test]
    fn parses_payment_events() {
        match parse_event(&captured_body()).unwrap() {
            WebhookEvent::PaymentCaptured(entity) => {
                assert_eq!(entity.id, "pay_X");
                assert_eq!(entity.order_id.as_deref(), Some("order_1"));
                assert_eq!(entity.amount, 118000);
            }
            other => panic!("expected captured, got {other:?}"),
        }
    }

    #[test]
    fn parses_refund_events() {
        let body = serde_json::json!({
            "event": "refund.processed",
            "payload": {
                "refund": {
                    "entity": {
                        "id": "rfnd_1",
                        "payment_id": "pay_X",
                        "amount": 40000,
                        "status": "processed"
                    }
                }
            }
        })
        .to_string();
        match parse_event(body.as_bytes()).unwrap() {
            WebhookEvent::RefundProcessed(entity) => {
                assert_eq!(entity.payment_id, "pay_X");
                assert_eq!(entity.amount, 40000);
            }
            other => panic!("expected refund, got {other:?}"),
        }
    }

    #[test]
    fn unknown_events_are_ignored_not_errors() {
        let body = serde_json::json!({
            "event": "invoice.paid",
            "payload": {}
        })
        .to_string();
        assert!(matches!(
            parse_event(body.as_bytes()).unwrap(),
            WebhookEvent::Ignored(name) if name == "invoice.paid"
        ));
    }

    #[test]
    fn malformed_payloads_are_permanent_errors() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(PaymentError::MalformedWebhook(_))
        ));
        let missing_entity = serde_json::json!({
            "event": "payment.captured",
            "payload": {}
        })
        .to_string();
        assert!(matches!(
            parse_event(missing_entity.as_bytes()),
            Err(PaymentError::MalformedWebhook(_))
        ));
    }
}
