pub mod error;
pub mod invoice_repository;
pub mod memory;
pub mod message_log_repository;
pub mod payment_repository;
pub mod store;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error as log_error, info};
use uuid::Uuid;

use self::error::DatabaseError;
use self::invoice_repository::InvoiceRepository;
use self::message_log_repository::MessageLogRepository;
use self::payment_repository::PaymentRepository;
use self::store::{
    Invoice, InvoiceStatus, InvoiceStore, MessageLogEntry, MessageLogStore, NewInvoice,
    NewPayment, Payment, PaymentStatus, PaymentStore,
};
use crate::config::DatabaseConfig;
use crate::payments::types::{CallbackSnapshot, RequestSnapshot};

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Initialize the database connection pool
pub async fn init_pool(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<PgPool, DatabaseError> {
    let config = config.unwrap_or_default();

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Initializing database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(|e| {
            log_error!("Failed to initialize database pool: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

    // Test the connection
    pool.acquire().await.map_err(|e| {
        log_error!("Failed to acquire test connection: {}", e);
        DatabaseError::from_sqlx(e)
    })?;

    info!("Database pool initialized successfully");
    Ok(pool)
}

/// Initialize the database pool from application configuration
pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let pool_config = PoolConfig {
        max_connections: config.max_connections,
        min_connections: config.min_connections,
        connection_timeout: Duration::from_secs(config.connection_timeout),
        idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
        max_lifetime: Duration::from_secs(1800),
    };

    init_pool(&config.url, Some(pool_config)).await
}

/// Connection pool health check
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

/// Postgres-backed record store: one object bundling the per-table
/// repositories behind the store traits the services depend on.
pub struct PgStore {
    invoices: InvoiceRepository,
    payments: PaymentRepository,
    messages: MessageLogRepository,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            invoices: InvoiceRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            messages: MessageLogRepository::new(pool),
        }
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, DatabaseError> {
        self.invoices.insert_invoice(invoice).await
    }

    async fn find_invoice(&self, id: &str) -> Result<Option<Invoice>, DatabaseError> {
        self.invoices.find_invoice(id).await
    }

    async fn transition_invoice_status(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        to: InvoiceStatus,
        pay_ref: Option<&str>,
    ) -> Result<Option<Invoice>, DatabaseError> {
        self.invoices
            .transition_invoice_status(id, expected, to, pay_ref)
            .await
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
        self.payments.insert_payment(payment).await
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        self.payments.find_payment(id).await
    }

    async fn find_payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        self.payments.find_payment_by_idempotency_key(key).await
    }

    async fn find_payment_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        self.payments
            .find_payment_by_checkout_id(checkout_request_id)
            .await
    }

    async fn latest_payment_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        self.payments.latest_payment_for_invoice(invoice_id).await
    }

    async fn attach_provider_ids(
        &self,
        id: Uuid,
        merchant_request_id: &str,
        checkout_request_id: &str,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError> {
        self.payments
            .attach_provider_ids(id, merchant_request_id, checkout_request_id, snapshot)
            .await
    }

    async fn mark_payment_failed(
        &self,
        id: Uuid,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError> {
        self.payments.mark_payment_failed(id, snapshot).await
    }

    async fn complete_payment_if_initiated(
        &self,
        id: Uuid,
        to: PaymentStatus,
        mpesa_receipt: Option<&str>,
        callback: &CallbackSnapshot,
    ) -> Result<Option<Payment>, DatabaseError> {
        self.payments
            .complete_payment_if_initiated(id, to, mpesa_receipt, callback)
            .await
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<Payment, DatabaseError> {
        self.payments.increment_retry_count(id).await
    }
}

#[async_trait]
impl MessageLogStore for PgStore {
    async fn log_message(&self, entry: MessageLogEntry) -> Result<(), DatabaseError> {
        self.messages.log_message(entry).await
    }
}
