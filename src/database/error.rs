use thiserror::Error;

/// Structured database error with a machine-inspectable kind.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Query error: {message}")]
    Query { message: String },

    #[error("Database error: {message}")]
    Unknown { message: String },
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn unique_violation(constraint: &str) -> Self {
        Self::new(DatabaseErrorKind::UniqueViolation {
            constraint: constraint.to_string(),
        })
    }

    /// Map an sqlx error into the structured form. Postgres unique violations
    /// (SQLSTATE 23505) are surfaced as `UniqueViolation` so callers can
    /// resolve insert races instead of failing.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    return Self::unique_violation(
                        db_err.constraint().unwrap_or("unknown"),
                    );
                }
                Self::new(DatabaseErrorKind::Query {
                    message: db_err.to_string(),
                })
            }
            sqlx::Error::RowNotFound => Self::new(DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            }),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::new(DatabaseErrorKind::Connection {
                    message: err.to_string(),
                })
            }
            _ => Self::new(DatabaseErrorKind::Unknown {
                message: err.to_string(),
            }),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }
}
