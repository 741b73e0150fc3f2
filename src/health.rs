//! Health endpoint payload.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
}

impl HealthStatus {
    pub fn healthy(database: &'static str) -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            database,
        }
    }
}
