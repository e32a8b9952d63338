//! # Meterflow payments
//!
//! The payment lifecycle: order creation against finalised invoices, signed
//! webhook ingestion with atomic payment+invoice status coupling, full and
//! partial refunds, and the exponential-backoff retry engine for failed
//! payments. The gateway itself sits behind the [`gateway::PaymentGateway`]
//! trait; the Razorpay-shaped HTTP client and an in-memory mock both
//! implement it.

pub mod gateway;
pub mod refunds;
pub mod retry;
pub mod service;
pub mod webhook;

pub use gateway::{MockGateway, PaymentGateway, RazorpayGateway};
pub use refunds::RefundService;
pub use retry::PaymentRetryEngine;
pub use service::PaymentService;
