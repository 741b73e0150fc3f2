use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::store::{MessageLogEntry, MessageLogStore};

/// Audit trail for chat traffic. Rows are metadata-only; message bodies stay
/// out of the database.
pub struct MessageLogRepository {
    pool: PgPool,
}

impl MessageLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLogStore for MessageLogRepository {
    async fn log_message(&self, entry: MessageLogEntry) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO message_log (id, invoice_id, channel, direction, event, payload) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(&entry.invoice_id)
        .bind(&entry.channel)
        .bind(&entry.direction)
        .bind(&entry.event)
        .bind(&entry.payload)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
