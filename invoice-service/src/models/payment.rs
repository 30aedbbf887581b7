//! Payment model for invoice-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A recorded payment against an invoice.
///
/// Rows are created only inside a committed settlement transaction. The
/// payment's own `user_id` (not the invoice owner's) is the authorization
/// subject for later update/delete.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub invoice_id: i64,
    pub user_id: i64,
    pub customer_id: i64,
    pub amount_paid: Decimal,
    pub payment_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording a payment.
#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub amount_paid: Decimal,
    pub payment_date: NaiveDate,
}

/// Input for amending a payment.
#[derive(Debug, Clone, Default)]
pub struct UpdatePayment {
    pub amount_paid: Option<Decimal>,
    pub payment_date: Option<NaiveDate>,
}
