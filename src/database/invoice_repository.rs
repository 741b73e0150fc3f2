use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use crate::database::error::DatabaseError;
use crate::database::store::{Invoice, InvoiceStatus, InvoiceStore, NewInvoice};

const INVOICE_COLUMNS: &str = "id, customer_name, customer_msisdn, merchant_msisdn, \
     amount_cents, currency, description, status, pay_ref, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct InvoiceRow {
    id: String,
    customer_name: Option<String>,
    customer_msisdn: String,
    merchant_msisdn: String,
    amount_cents: i64,
    currency: String,
    description: String,
    status: String,
    pay_ref: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = DatabaseError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        let status = InvoiceStatus::from_db_status(&row.status).ok_or_else(|| {
            DatabaseError::new(crate::database::error::DatabaseErrorKind::Unknown {
                message: format!("invoice {} has unknown status {}", row.id, row.status),
            })
        })?;
        Ok(Invoice {
            id: row.id,
            customer_name: row.customer_name,
            customer_msisdn: row.customer_msisdn,
            merchant_msisdn: row.merchant_msisdn,
            amount_cents: row.amount_cents,
            currency: row.currency,
            description: row.description,
            status,
            pay_ref: row.pay_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed invoice store.
pub struct InvoiceRepository {
    pool: PgPool,
}

impl InvoiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceStore for InvoiceRepository {
    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, DatabaseError> {
        let query = format!(
            "INSERT INTO invoices \
             (id, customer_name, customer_msisdn, merchant_msisdn, amount_cents, currency, description, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING') \
             RETURNING {INVOICE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&query)
            .bind(&invoice.id)
            .bind(&invoice.customer_name)
            .bind(&invoice.customer_msisdn)
            .bind(&invoice.merchant_msisdn)
            .bind(invoice.amount_cents)
            .bind(&invoice.currency)
            .bind(&invoice.description)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.try_into()
    }

    async fn find_invoice(&self, id: &str) -> Result<Option<Invoice>, DatabaseError> {
        let query = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1");
        let row = sqlx::query_as::<_, InvoiceRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.map(Invoice::try_from).transpose()
    }

    async fn transition_invoice_status(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        to: InvoiceStatus,
        pay_ref: Option<&str>,
    ) -> Result<Option<Invoice>, DatabaseError> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        // Conditional update: the WHERE clause carries the expected-status
        // precondition so the transition is atomic under concurrent writers.
        let query = format!(
            "UPDATE invoices \
             SET status = $2, pay_ref = COALESCE($3, pay_ref), updated_at = NOW() \
             WHERE id = $1 AND status = ANY($4) \
             RETURNING {INVOICE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&query)
            .bind(id)
            .bind(to.as_str())
            .bind(pay_ref)
            .bind(&expected)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.map(Invoice::try_from).transpose()
    }
}
