//! Durable store schema
//!
//! Idempotent DDL applied at startup. The invariants that must hold even
//! against buggy writers are enforced here: unique idempotency keys, one
//! non-cancelled invoice per organisation and period, immutability of a
//! finalised invoice's financial fields, and refund-driven payment/invoice
//! coupling.

use sqlx::PgPool;

use meterflow_core::errors::StoreResult;

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS organisations (
    id UUID PRIMARY KEY,
    name VARCHAR NOT NULL,
    currency VARCHAR(3) NOT NULL DEFAULT 'INR',
    gateway_customer_id VARCHAR,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS projects (
    id UUID PRIMARY KEY,
    organisation_id UUID NOT NULL REFERENCES organisations(id),
    name VARCHAR NOT NULL,
    api_key_hash VARCHAR NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (organisation_id, name)
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_projects_api_key_hash ON projects(api_key_hash);

CREATE TABLE IF NOT EXISTS usage_events (
    id UUID PRIMARY KEY,
    organisation_id UUID NOT NULL,
    project_id UUID NOT NULL,
    metric_name VARCHAR(100) NOT NULL,
    metric_value DECIMAL(20,6) NOT NULL CHECK (metric_value >= 0),
    unit VARCHAR(50) NOT NULL,
    event_timestamp TIMESTAMPTZ NOT NULL,
    metadata JSONB,
    idempotency_key VARCHAR(255) NOT NULL,
    ingested_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_usage_events_idempotency_key
    ON usage_events(idempotency_key);
CREATE INDEX IF NOT EXISTS idx_usage_events_org_metric_time
    ON usage_events(organisation_id, metric_name, unit, event_timestamp);
CREATE INDEX IF NOT EXISTS idx_usage_events_project_time
    ON usage_events(project_id, event_timestamp);

CREATE TABLE IF NOT EXISTS usage_aggregates (
    id UUID PRIMARY KEY,
    organisation_id UUID NOT NULL,
    project_id UUID NOT NULL,
    metric_name VARCHAR(100) NOT NULL,
    unit VARCHAR(50) NOT NULL,
    month INT NOT NULL CHECK (month BETWEEN 1 AND 12),
    year INT NOT NULL,
    total_value DECIMAL(20,6) NOT NULL DEFAULT 0,
    event_count BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (organisation_id, project_id, metric_name, unit, month, year)
);
CREATE INDEX IF NOT EXISTS idx_usage_aggregates_org_period
    ON usage_aggregates(organisation_id, year, month);

CREATE TABLE IF NOT EXISTS pricing_rules (
    id UUID PRIMARY KEY,
    organisation_id UUID,
    metric_name VARCHAR(100) NOT NULL,
    unit VARCHAR(50) NOT NULL,
    price_per_unit DECIMAL(20,8) NOT NULL,
    currency VARCHAR(3) NOT NULL,
    effective_from TIMESTAMPTZ NOT NULL,
    effective_to TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_pricing_rules_lookup
    ON pricing_rules(metric_name, unit, effective_from);

CREATE TABLE IF NOT EXISTS minimum_charge_rules (
    id UUID PRIMARY KEY,
    organisation_id UUID,
    minimum_amount DECIMAL(12,2) NOT NULL,
    currency VARCHAR(3) NOT NULL,
    effective_from TIMESTAMPTZ NOT NULL,
    effective_to TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS billing_configs (
    organisation_id UUID PRIMARY KEY REFERENCES organisations(id),
    tax_rate DECIMAL(6,4) NOT NULL DEFAULT 0,
    currency VARCHAR(3) NOT NULL DEFAULT 'INR',
    payment_terms_days INT NOT NULL DEFAULT 30,
    minimum_charge_enabled BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS invoices (
    id UUID PRIMARY KEY,
    organisation_id UUID NOT NULL REFERENCES organisations(id),
    invoice_number VARCHAR NOT NULL UNIQUE,
    status VARCHAR(20) NOT NULL DEFAULT 'draft',
    subtotal DECIMAL(12,2) NOT NULL,
    subtotal_after_min DECIMAL(12,2) NOT NULL,
    tax DECIMAL(12,2) NOT NULL,
    discount DECIMAL(12,2) NOT NULL DEFAULT 0,
    total DECIMAL(12,2) NOT NULL,
    currency VARCHAR(3) NOT NULL,
    month INT NOT NULL CHECK (month BETWEEN 1 AND 12),
    year INT NOT NULL,
    due_date TIMESTAMPTZ NOT NULL,
    issued_at TIMESTAMPTZ,
    paid_at TIMESTAMPTZ,
    pdf_url VARCHAR,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_invoices_org_period
    ON invoices(organisation_id, month, year)
    WHERE status <> 'cancelled';
CREATE INDEX IF NOT EXISTS idx_invoices_due_date ON invoices(due_date);
CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status);

CREATE TABLE IF NOT EXISTS invoice_line_items (
    id UUID PRIMARY KEY,
    invoice_id UUID NOT NULL REFERENCES invoices(id),
    line_number INT NOT NULL,
    description VARCHAR NOT NULL,
    metric_name VARCHAR(100),
    unit VARCHAR(50),
    quantity DECIMAL(20,6) NOT NULL,
    unit_price DECIMAL(20,8) NOT NULL,
    total DECIMAL(12,2) NOT NULL,
    metadata JSONB,
    UNIQUE (invoice_id, line_number)
);

CREATE TABLE IF NOT EXISTS payments (
    id UUID PRIMARY KEY,
    organisation_id UUID NOT NULL REFERENCES organisations(id),
    invoice_id UUID NOT NULL REFERENCES invoices(id),
    gateway_order_id VARCHAR NOT NULL,
    gateway_payment_id VARCHAR,
    amount DECIMAL(12,2) NOT NULL,
    currency VARCHAR(3) NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    method VARCHAR,
    paid_at TIMESTAMPTZ,
    reconciled_at TIMESTAMPTZ,
    retry_count INT NOT NULL DEFAULT 0,
    max_retries INT NOT NULL DEFAULT 3,
    next_retry_at TIMESTAMPTZ,
    last_retry_at TIMESTAMPTZ,
    retry_history JSONB NOT NULL DEFAULT '[]',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_payments_gateway_payment_id
    ON payments(gateway_payment_id)
    WHERE gateway_payment_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_payments_order_id ON payments(gateway_order_id);
CREATE INDEX IF NOT EXISTS idx_payments_retry_due
    ON payments(next_retry_at)
    WHERE status = 'failed' AND next_retry_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_payments_unreconciled
    ON payments(created_at)
    WHERE reconciled_at IS NULL;

CREATE TABLE IF NOT EXISTS refunds (
    id UUID PRIMARY KEY,
    payment_id UUID NOT NULL REFERENCES payments(id),
    invoice_id UUID NOT NULL REFERENCES invoices(id),
    refund_number VARCHAR NOT NULL UNIQUE,
    amount DECIMAL(12,2) NOT NULL CHECK (amount > 0),
    currency VARCHAR(3) NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    refund_type VARCHAR(10) NOT NULL,
    reason VARCHAR,
    gateway_refund_id VARCHAR,
    initiated_by VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_refunds_gateway_refund_id
    ON refunds(gateway_refund_id)
    WHERE gateway_refund_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_refunds_payment_id ON refunds(payment_id);

CREATE TABLE IF NOT EXISTS exchange_rates (
    id UUID PRIMARY KEY,
    base_currency VARCHAR(3) NOT NULL,
    target_currency VARCHAR(3) NOT NULL,
    rate DECIMAL(20,10) NOT NULL CHECK (rate > 0),
    effective_from TIMESTAMPTZ NOT NULL,
    effective_to TIMESTAMPTZ,
    source VARCHAR NOT NULL DEFAULT 'manual',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_exchange_rates_lookup
    ON exchange_rates(base_currency, target_currency, effective_from);

CREATE TABLE IF NOT EXISTS alert_rules (
    id UUID PRIMARY KEY,
    organisation_id UUID,
    name VARCHAR NOT NULL,
    rule_type VARCHAR(30) NOT NULL,
    metric_name VARCHAR(100),
    unit VARCHAR(50),
    threshold DECIMAL(20,6),
    operator VARCHAR(5),
    comparison_period VARCHAR(10) NOT NULL DEFAULT 'day',
    spike_percent DECIMAL(10,2),
    reference_period VARCHAR(10),
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    channels JSONB NOT NULL DEFAULT '["log"]',
    cooldown_minutes BIGINT NOT NULL DEFAULT 60,
    last_alert_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS alert_history (
    id UUID PRIMARY KEY,
    rule_id UUID NOT NULL REFERENCES alert_rules(id),
    organisation_id UUID,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    actual_value DECIMAL(20,6) NOT NULL,
    threshold_value DECIMAL(20,6),
    period_start TIMESTAMPTZ NOT NULL,
    period_end TIMESTAMPTZ NOT NULL,
    message VARCHAR NOT NULL,
    triggered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_alert_history_rule ON alert_history(rule_id, triggered_at);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    idempotency_key VARCHAR(255) PRIMARY KEY,
    entity_type VARCHAR(50) NOT NULL,
    entity_id VARCHAR(255) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id UUID PRIMARY KEY,
    entity_type VARCHAR(50) NOT NULL,
    entity_id VARCHAR(255) NOT NULL,
    action VARCHAR(50) NOT NULL,
    actor VARCHAR NOT NULL,
    before JSONB,
    after JSONB,
    ip_address VARCHAR,
    user_agent VARCHAR,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_entity ON audit_logs(entity_type, entity_id);

CREATE TABLE IF NOT EXISTS reconciliation_runs (
    id UUID PRIMARY KEY,
    run_id UUID NOT NULL,
    scope VARCHAR(30) NOT NULL,
    left_count BIGINT NOT NULL,
    right_count BIGINT NOT NULL,
    discrepancy_count BIGINT NOT NULL,
    details JSONB NOT NULL DEFAULT '[]',
    status VARCHAR(40) NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reconciliation_runs_scope
    ON reconciliation_runs(scope, finished_at);

CREATE TABLE IF NOT EXISTS email_notifications (
    id UUID PRIMARY KEY,
    organisation_id UUID,
    recipient VARCHAR NOT NULL,
    subject VARCHAR NOT NULL,
    body TEXT NOT NULL,
    kind VARCHAR(50) NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    error VARCHAR,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const TRIGGERS: &str = r#"
CREATE OR REPLACE FUNCTION enforce_invoice_immutability() RETURNS TRIGGER AS $$
BEGIN
    IF OLD.status <> 'draft' THEN
        IF NEW.subtotal IS DISTINCT FROM OLD.subtotal
            OR NEW.subtotal_after_min IS DISTINCT FROM OLD.subtotal_after_min
            OR NEW.tax IS DISTINCT FROM OLD.tax
            OR NEW.discount IS DISTINCT FROM OLD.discount
            OR NEW.total IS DISTINCT FROM OLD.total
            OR NEW.currency IS DISTINCT FROM OLD.currency
            OR NEW.month IS DISTINCT FROM OLD.month
            OR NEW.year IS DISTINCT FROM OLD.year
            OR NEW.invoice_number IS DISTINCT FROM OLD.invoice_number
        THEN
            RAISE EXCEPTION 'invoice % is immutable after finalisation', OLD.id;
        END IF;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS trg_invoice_immutability ON invoices;
CREATE TRIGGER trg_invoice_immutability
    BEFORE UPDATE ON invoices
    FOR EACH ROW
    EXECUTE FUNCTION enforce_invoice_immutability();

CREATE OR REPLACE FUNCTION enforce_line_item_immutability() RETURNS TRIGGER AS $$
DECLARE
    parent_status VARCHAR;
    target UUID;
BEGIN
    IF TG_OP = 'DELETE' THEN
        target := OLD.invoice_id;
    ELSE
        target := NEW.invoice_id;
    END IF;
    SELECT status INTO parent_status FROM invoices WHERE id = target;
    IF parent_status IS NOT NULL AND parent_status NOT IN ('draft', 'cancelled') THEN
        RAISE EXCEPTION 'line items of invoice % are immutable after finalisation', target;
    END IF;
    IF TG_OP = 'DELETE' THEN
        RETURN OLD;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS trg_line_item_immutability ON invoice_line_items;
CREATE TRIGGER trg_line_item_immutability
    BEFORE UPDATE OR DELETE ON invoice_line_items
    FOR EACH ROW
    EXECUTE FUNCTION enforce_line_item_immutability();

CREATE OR REPLACE FUNCTION apply_processed_refund() RETURNS TRIGGER AS $$
DECLARE
    pay RECORD;
    total_refunded NUMERIC;
BEGIN
    IF NEW.status = 'processed'
        AND (TG_OP = 'INSERT' OR OLD.status IS DISTINCT FROM NEW.status)
    THEN
        SELECT * INTO pay FROM payments WHERE id = NEW.payment_id FOR UPDATE;
        SELECT COALESCE(SUM(amount), 0) INTO total_refunded
            FROM refunds
            WHERE payment_id = NEW.payment_id AND status = 'processed';
        IF total_refunded >= pay.amount THEN
            UPDATE payments SET status = 'refunded', updated_at = NOW()
                WHERE id = NEW.payment_id;
            UPDATE invoices SET status = 'refunded', updated_at = NOW()
                WHERE id = pay.invoice_id
                AND status IN ('finalized', 'sent', 'overdue', 'paid');
        ELSE
            UPDATE payments SET status = 'partially_refunded', updated_at = NOW()
                WHERE id = NEW.payment_id;
        END IF;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS trg_apply_processed_refund ON refunds;
CREATE TRIGGER trg_apply_processed_refund
    AFTER INSERT OR UPDATE ON refunds
    FOR EACH ROW
    EXECUTE FUNCTION apply_processed_refund();
"#;

/// Apply the schema idempotently.
pub async fn initialize(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(TABLES).execute(pool).await?;
    sqlx::raw_sql(TRIGGERS).execute(pool).await?;
    Ok(())
}
