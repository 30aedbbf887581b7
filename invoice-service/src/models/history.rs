//! Audit history model for invoice-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only audit entry for an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub invoice_id: i64,
    pub user_id: i64,
    pub payment_id: Option<i64>,
    pub action: String,
    pub created_utc: DateTime<Utc>,
}
