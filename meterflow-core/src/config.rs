//! Platform configuration
//!
//! Typed configuration for every subsystem, loaded from an optional TOML file
//! layered under `METERFLOW_*` environment variables. Defaults match the
//! platform's documented behaviour so a bare config starts a working
//! development instance.

use serde::{Deserialize, Serialize};

use crate::errors::PlatformError;

/// Top-level platform configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Durable store (Postgres) connection settings
    pub database: DatabaseConfig,

    /// Hot event store (sled) settings
    pub hot_store: HotStoreConfig,

    /// Event ingest settings
    pub ingest: IngestConfig,

    /// Hot-to-durable migration worker settings
    pub migration: MigrationConfig,

    /// Processed hot event retention
    pub cleanup: CleanupConfig,

    /// Billing defaults applied when an organisation has no explicit config
    pub billing: BillingDefaults,

    /// Payment gateway credentials and limits
    pub gateway: GatewayConfig,

    /// Failed payment retry policy
    pub retry: RetryConfig,

    /// Alert engine settings
    pub alerts: AlertsConfig,

    /// Email notification settings
    pub email: EmailConfig,

    /// Invoice PDF rendering and storage
    pub pdf: PdfConfig,

    /// Exchange rate source settings
    pub rates: ExchangeRateConfig,

    /// HTTP API settings
    pub api: ApiConfig,

    /// Scheduled job settings
    pub scheduler: SchedulerConfig,
}

impl PlatformConfig {
    /// Load configuration from an optional file layered under environment
    /// variables (`METERFLOW_DATABASE__URL=...` style).
    pub fn load(path: Option<&str>) -> Result<Self, PlatformError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("meterflow").required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("METERFLOW")
                .separator("__")
                .try_parsing(true),
        );
        let loaded = builder
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        loaded
            .try_deserialize()
            .map_err(|e| PlatformError::Config(e.to_string()))
    }
}

/// Durable store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,

    /// Bounded connection pool size
    pub max_connections: u32,

    /// TCP connect deadline
    pub connect_timeout_secs: u64,

    /// Total acquire deadline per operation
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/meterflow".to_string(),
            max_connections: 20,
            connect_timeout_secs: 3,
            acquire_timeout_secs: 10,
        }
    }
}

/// Hot event store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotStoreConfig {
    /// Directory for the sled database
    pub data_dir: String,

    /// Sled's background flush interval
    pub flush_every_ms: u64,
}

impl Default for HotStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/hot".to_string(),
            flush_every_ms: 500,
        }
    }
}

/// Event ingest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum tolerated future skew on event timestamps
    pub max_future_skew_secs: u64,

    /// Capacity of the bounded migration-hint queue; full-queue sends are
    /// dropped and counted, never awaited
    pub hint_queue_capacity: usize,

    pub max_event_id_len: usize,
    pub max_metric_name_len: usize,
    pub max_unit_len: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_future_skew_secs: 300, // 5 minutes
            hint_queue_capacity: 10_000,
            max_event_id_len: 255,
            max_metric_name_len: 100,
            max_unit_len: 50,
        }
    }
}

/// Migration worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Events migrated per durable-store transaction
    pub batch_size: usize,

    /// Upper bound on batches per run; the next run catches up
    pub max_batches: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_batches: 10,
        }
    }
}

/// Processed hot event retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Processed hot events older than this are deleted
    pub retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

/// Billing defaults for organisations without an explicit billing config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingDefaults {
    /// ISO 4217 code
    pub currency: String,

    /// Decimal fraction, e.g. 0.18 for 18%
    pub tax_rate: String,

    pub payment_terms_days: i32,

    pub minimum_charge_enabled: bool,
}

impl Default for BillingDefaults {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
            tax_rate: "0.18".to_string(),
            payment_terms_days: 30,
            minimum_charge_enabled: true,
        }
    }
}

/// Payment gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub provider: String,

    pub api_base: String,

    pub key_id: String,

    pub key_secret: String,

    /// Shared secret for webhook HMAC-SHA-256 signatures
    pub webhook_secret: String,

    /// Total deadline for gateway calls
    pub timeout_secs: u64,

    /// Payments stuck in `pending` longer than this are failed by the janitor
    pub pending_ttl_minutes: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: "razorpay".to_string(),
            api_base: "https://api.razorpay.com/v1".to_string(),
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: String::new(),
            timeout_secs: 15,
            pending_ttl_minutes: 24 * 60,
        }
    }
}

/// Failed payment retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,

    pub max_retries: i32,

    /// Backoff base; attempt n waits base * 2^n
    pub base_interval_hours: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_interval_hours: 24,
        }
    }
}

/// Alert engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,

    /// Cooldown applied when a rule does not set its own
    pub default_cooldown_minutes: i64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_minutes: 60,
        }
    }
}

/// Email notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Transport selector: `log` records without sending
    pub provider: String,

    pub from_address: String,

    pub api_key: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: "log".to_string(),
            from_address: "billing@meterflow.dev".to_string(),
            api_key: None,
        }
    }
}

/// Invoice PDF rendering and object storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfConfig {
    pub enabled: bool,

    /// External HTML-to-PDF service; None uses the in-process stub
    pub service_url: Option<String>,

    /// Object store bucket/prefix for rendered invoices
    pub bucket: String,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_url: None,
            bucket: "invoices".to_string(),
        }
    }
}

/// Exchange rate source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeRateConfig {
    /// Daily pull from the external source; failures degrade gracefully
    pub sync_enabled: bool,

    pub source_url: Option<String>,

    pub base_currency: String,
}

impl Default for ExchangeRateConfig {
    fn default() -> Self {
        Self {
            sync_enabled: false,
            source_url: None,
            base_currency: "INR".to_string(),
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,

    pub port: u16,

    /// Admin surface api key; unset disables the admin routes
    pub admin_api_key: Option<String>,

    /// Optional allowlist of admin source addresses
    pub admin_ip_whitelist: Vec<String>,

    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            admin_api_key: None,
            admin_ip_whitelist: Vec::new(),
            cors_enabled: true,
        }
    }
}

/// Scheduled job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behaviour() {
        let config = PlatformConfig::default();
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.ingest.max_future_skew_secs, 300);
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.migration.max_batches, 10);
        assert_eq!(config.cleanup.retention_days, 7);
        assert_eq!(config.billing.currency, "INR");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_interval_hours, 24);
        assert_eq!(config.gateway.timeout_secs, 15);
    }
}
