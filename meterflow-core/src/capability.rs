//! Capability interfaces for external transports
//!
//! The core depends on these interfaces and never on a concrete transport:
//! email delivery, HTML-to-PDF rendering, object storage, and alert
//! notification channels all live behind trait objects injected at startup.
//! The default implementations log (email, notifications) or hold bytes in
//! memory (object store) so the platform runs end to end without any
//! provider credentials.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::CapabilityError;

/// An email ready for a provider-agnostic transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Notification kind, e.g. `invoice_issued`, `payment_reminder`
    pub kind: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), CapabilityError>;
}

/// Logs instead of sending; the development and test transport.
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), CapabilityError> {
        info!(
            to = %message.to,
            kind = %message.kind,
            subject = %message.subject,
            "email delivered to log transport"
        );
        Ok(())
    }
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    /// Render an HTML document to PDF bytes.
    async fn render_html(&self, html: &str) -> Result<Vec<u8>, CapabilityError>;
}

/// Placeholder renderer: returns the HTML bytes untouched. Keeps the invoice
/// pipeline exercisable without the external rendering service.
pub struct PassthroughPdfRenderer;

#[async_trait]
impl PdfRenderer for PassthroughPdfRenderer {
    async fn render_html(&self, html: &str) -> Result<Vec<u8>, CapabilityError> {
        Ok(html.as_bytes().to_vec())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key; returns a retrievable URL.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, CapabilityError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, CapabilityError>;
}

/// In-memory object store used in development and tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: dashmap::DashMap<String, Vec<u8>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, CapabilityError> {
        self.objects.insert(key.to_string(), bytes);
        Ok(format!("memory://{key}"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CapabilityError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CapabilityError::ObjectStore(format!("no object at {key}")))
    }
}

/// A triggered alert handed to notification channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub rule_name: String,
    pub rule_type: String,
    pub message: String,
    pub actual_value: String,
    pub threshold_value: Option<String>,
    pub organisation_id: Option<uuid::Uuid>,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &AlertNotification) -> Result<(), CapabilityError>;
}

/// Channel that writes alerts to the structured log.
pub struct LogNotificationChannel;

#[async_trait]
impl NotificationChannel for LogNotificationChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &AlertNotification) -> Result<(), CapabilityError> {
        info!(
            rule = %alert.rule_name,
            rule_type = %alert.rule_type,
            actual = %alert.actual_value,
            "alert triggered: {}",
            alert.message
        );
        Ok(())
    }
}

/// Registry of notification channels keyed by name.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NotificationChannel>> {
        self.channels.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_object_store_round_trips() {
        let store = MemoryObjectStore::default();
        let url = store
            .put("invoices/inv-1.pdf", b"pdf bytes".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(url, "memory://invoices/inv-1.pdf");
        let bytes = store.get("invoices/inv-1.pdf").await.unwrap();
        assert_eq!(bytes, b"pdf bytes");
        assert!(store.get("missing").await.is_err());
    }

    #[tokio::test]
    async fn channel_registry_resolves_by_name() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(LogNotificationChannel));
        assert!(registry.get("log").is_some());
        assert!(registry.get("pagerduty").is_none());
    }
}
