//! Settlement engine: applies payments to invoices.
//!
//! A settlement reads the invoice and its payment ledger, derives the new
//! balance and status, and persists the payment row together with the
//! invoice update as one transaction. The invoice row is locked for the
//! duration, so concurrent settlements on the same invoice serialize and
//! can never jointly overpay it.

use crate::models::{Invoice, InvoiceStatus, Payment, RecordPayment, UpdatePayment};
use crate::services::database::Database;
use crate::services::metrics::SETTLEMENTS_TOTAL;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::{Postgres, Transaction};
use std::future::Future;
use tracing::{info, instrument, warn};

/// Result of a committed settlement: the created payment and the invoice
/// snapshot after the update.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SettlementOutcome {
    pub payment: Payment,
    pub invoice: Invoice,
}

// -----------------------------------------------------------------------------
// Money/status calculator. Pure; all arithmetic in Decimal.
// -----------------------------------------------------------------------------

/// Outstanding balance on an invoice. May be negative if the ledger is
/// inconsistent; callers reject the triggering write rather than clamp.
pub fn remaining_balance(total_amount: Decimal, paid_so_far: Decimal) -> Decimal {
    total_amount - paid_so_far
}

/// Derive the invoice status from its total and the ledger sum.
///
/// Pre-payment statuses (`draft`, `sent`) are owned by invoice workflows and
/// survive a zero ledger; once the ledger emptied out after having payments,
/// the invoice reads `unpaid`.
pub fn derive_status(
    total_amount: Decimal,
    paid_so_far: Decimal,
    current: InvoiceStatus,
) -> InvoiceStatus {
    if paid_so_far <= Decimal::ZERO {
        if current.is_payment_derived() {
            InvoiceStatus::Unpaid
        } else {
            current
        }
    } else if paid_so_far < total_amount {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Paid
    }
}

// -----------------------------------------------------------------------------
// Settlement transaction
// -----------------------------------------------------------------------------

/// Record one payment against one invoice.
///
/// All reads and writes happen inside a single transaction; any failure
/// rolls the whole settlement back. A detected conflict (serialization
/// failure or deadlock) is retried once before surfacing.
#[instrument(skip(db, input), fields(invoice_id = %invoice_id, requesting_user_id = %requesting_user_id))]
pub async fn record_payment(
    db: &Database,
    invoice_id: i64,
    requesting_user_id: i64,
    input: &RecordPayment,
) -> Result<SettlementOutcome, AppError> {
    let result =
        with_conflict_retry(|| try_record_payment(db, invoice_id, requesting_user_id, input))
            .await;

    match &result {
        Ok(outcome) => {
            SETTLEMENTS_TOTAL.with_label_values(&["recorded"]).inc();
            info!(
                payment_id = %outcome.payment.id,
                amount_paid = %outcome.payment.amount_paid,
                status = %outcome.invoice.status,
                amount_due = %outcome.invoice.amount_due,
                "Payment recorded"
            );
            db.record_history(
                invoice_id,
                requesting_user_id,
                Some(outcome.payment.id),
                "payment_recorded",
            )
            .await;
        }
        Err(e) => {
            SETTLEMENTS_TOTAL.with_label_values(&[outcome_label(e)]).inc();
        }
    }

    result
}

async fn try_record_payment(
    db: &Database,
    invoice_id: i64,
    requesting_user_id: i64,
    input: &RecordPayment,
) -> Result<SettlementOutcome, AppError> {
    // Input validation never touches storage.
    if input.amount_paid <= Decimal::ZERO {
        return Err(AppError::validation(
            "payment amount must be greater than zero",
        ));
    }

    let mut tx = db.pool().begin().await?;

    let invoice = fetch_invoice_for_update(&mut tx, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    if invoice.user_id != requesting_user_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Invoice belongs to another user"
        )));
    }

    let paid_so_far = Database::sum_payments(&mut *tx, invoice_id).await?;
    let remaining = remaining_balance(invoice.total_amount, paid_so_far);

    if input.amount_paid > remaining {
        return Err(AppError::validation(
            "payment amount exceeds the remaining amount due",
        ));
    }

    let new_paid = paid_so_far + input.amount_paid;
    let current = InvoiceStatus::from_string(&invoice.status);
    let new_status = derive_status(invoice.total_amount, new_paid, current);
    let new_amount_due = remaining_balance(invoice.total_amount, new_paid);

    let updated_invoice =
        apply_invoice_settlement(&mut tx, invoice.id, new_status, new_amount_due, new_paid)
            .await?;

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments (invoice_id, user_id, customer_id, amount_paid, payment_date)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, invoice_id, user_id, customer_id, amount_paid, payment_date, created_utc
        "#,
    )
    .bind(invoice.id)
    .bind(requesting_user_id)
    .bind(invoice.customer_id)
    .bind(input.amount_paid)
    .bind(input.payment_date)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(SettlementOutcome {
        payment,
        invoice: updated_invoice,
    })
}

/// Amend a recorded payment and re-derive the invoice settlement in the
/// same transaction.
#[instrument(skip(db, input), fields(payment_id = %payment_id, requesting_user_id = %requesting_user_id))]
pub async fn update_payment(
    db: &Database,
    payment_id: i64,
    requesting_user_id: i64,
    input: &UpdatePayment,
) -> Result<SettlementOutcome, AppError> {
    let outcome =
        with_conflict_retry(|| try_update_payment(db, payment_id, requesting_user_id, input))
            .await?;

    db.record_history(
        outcome.invoice.id,
        requesting_user_id,
        Some(outcome.payment.id),
        "payment_updated",
    )
    .await;

    Ok(outcome)
}

async fn try_update_payment(
    db: &Database,
    payment_id: i64,
    requesting_user_id: i64,
    input: &UpdatePayment,
) -> Result<SettlementOutcome, AppError> {
    let mut tx = db.pool().begin().await?;

    // Look the payment up first to learn its invoice, then take the invoice
    // lock; same lock order as record_payment.
    let existing = sqlx::query_as::<_, Payment>(
        r#"
        SELECT id, invoice_id, user_id, customer_id, amount_paid, payment_date, created_utc
        FROM payments
        WHERE id = $1
        "#,
    )
    .bind(payment_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

    if existing.user_id != requesting_user_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Payment belongs to another user"
        )));
    }

    let invoice = fetch_invoice_for_update(&mut tx, existing.invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let new_amount = input.amount_paid.unwrap_or(existing.amount_paid);
    if new_amount <= Decimal::ZERO {
        return Err(AppError::validation(
            "payment amount must be greater than zero",
        ));
    }

    let other_payments = Database::sum_payments(&mut *tx, invoice.id).await? - existing.amount_paid;
    if new_amount > remaining_balance(invoice.total_amount, other_payments) {
        return Err(AppError::validation(
            "payment amount exceeds the remaining amount due",
        ));
    }

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        UPDATE payments
        SET amount_paid = $2,
            payment_date = COALESCE($3, payment_date)
        WHERE id = $1
        RETURNING id, invoice_id, user_id, customer_id, amount_paid, payment_date, created_utc
        "#,
    )
    .bind(payment_id)
    .bind(new_amount)
    .bind(input.payment_date)
    .fetch_optional(&mut *tx)
    .await?
    // Gone while we waited on the invoice lock.
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

    let invoice = recompute_invoice_settlement(&mut tx, &invoice).await?;

    tx.commit().await?;

    info!(
        payment_id = %payment.id,
        amount_paid = %payment.amount_paid,
        status = %invoice.status,
        "Payment updated"
    );

    Ok(SettlementOutcome { payment, invoice })
}

/// Delete a recorded payment and re-derive the invoice settlement in the
/// same transaction. Returns the updated invoice snapshot.
#[instrument(skip(db), fields(payment_id = %payment_id, requesting_user_id = %requesting_user_id))]
pub async fn delete_payment(
    db: &Database,
    payment_id: i64,
    requesting_user_id: i64,
) -> Result<Invoice, AppError> {
    let invoice =
        with_conflict_retry(|| try_delete_payment(db, payment_id, requesting_user_id)).await?;

    db.record_history(invoice.id, requesting_user_id, None, "payment_deleted")
        .await;

    Ok(invoice)
}

async fn try_delete_payment(
    db: &Database,
    payment_id: i64,
    requesting_user_id: i64,
) -> Result<Invoice, AppError> {
    let mut tx = db.pool().begin().await?;

    let existing = sqlx::query_as::<_, Payment>(
        r#"
        SELECT id, invoice_id, user_id, customer_id, amount_paid, payment_date, created_utc
        FROM payments
        WHERE id = $1
        "#,
    )
    .bind(payment_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

    if existing.user_id != requesting_user_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Payment belongs to another user"
        )));
    }

    let invoice = fetch_invoice_for_update(&mut tx, existing.invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let deleted = sqlx::query("DELETE FROM payments WHERE id = $1")
        .bind(payment_id)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        // Gone while we waited on the invoice lock.
        return Err(AppError::NotFound(anyhow::anyhow!("Payment not found")));
    }

    let invoice = recompute_invoice_settlement(&mut tx, &invoice).await?;

    tx.commit().await?;

    info!(
        payment_id = %payment_id,
        status = %invoice.status,
        amount_due = %invoice.amount_due,
        "Payment deleted"
    );

    Ok(invoice)
}

// -----------------------------------------------------------------------------
// Shared pieces
// -----------------------------------------------------------------------------

/// Load an invoice under a row lock. The lock serializes every settlement
/// path touching this invoice until the transaction ends.
async fn fetch_invoice_for_update(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: i64,
) -> Result<Option<Invoice>, AppError> {
    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        SELECT id, user_id, customer_id, invoice_number, issue_date, due_date,
            total_amount, tax, discount, status, amount_due, paid, created_utc
        FROM invoices
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(invoice_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(invoice)
}

/// Write the derived status/balance back to the invoice row.
async fn apply_invoice_settlement(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: i64,
    status: InvoiceStatus,
    amount_due: Decimal,
    paid: Decimal,
) -> Result<Invoice, AppError> {
    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        UPDATE invoices
        SET status = $2, amount_due = $3, paid = $4
        WHERE id = $1
        RETURNING id, user_id, customer_id, invoice_number, issue_date, due_date,
            total_amount, tax, discount, status, amount_due, paid, created_utc
        "#,
    )
    .bind(invoice_id)
    .bind(status.as_str())
    .bind(amount_due)
    .bind(paid)
    .fetch_one(&mut **tx)
    .await?;

    Ok(invoice)
}

/// Re-derive an invoice's settlement from its committed ledger. Shared by
/// every path that mutates the ledger outside of recording a new payment.
/// The caller must already hold the invoice row lock.
async fn recompute_invoice_settlement(
    tx: &mut Transaction<'_, Postgres>,
    invoice: &Invoice,
) -> Result<Invoice, AppError> {
    let paid_so_far = Database::sum_payments(&mut **tx, invoice.id).await?;
    let current = InvoiceStatus::from_string(&invoice.status);
    let status = derive_status(invoice.total_amount, paid_so_far, current);
    let amount_due = remaining_balance(invoice.total_amount, paid_so_far);

    apply_invoice_settlement(tx, invoice.id, status, amount_due, paid_so_far).await
}

/// Run a settlement operation, retrying once on a detected conflict.
async fn with_conflict_retry<T, F, Fut>(op: F) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    match op().await {
        Err(e) if e.is_conflict() => {
            warn!("Settlement conflict detected, retrying once");
            op().await
        }
        other => other,
    }
}

fn outcome_label(err: &AppError) -> &'static str {
    match err {
        AppError::Validation(_) | AppError::Forbidden(_) | AppError::NotFound(_) => "rejected",
        AppError::Conflict(_) => "conflict",
        _ => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn remaining_balance_is_plain_subtraction() {
        assert_eq!(remaining_balance(dec("1000.00"), dec("400.00")), dec("600.00"));
        assert_eq!(remaining_balance(dec("1000.00"), dec("1000.00")), dec("0.00"));
        // Not clamped; callers reject the triggering write instead.
        assert_eq!(remaining_balance(dec("100.00"), dec("150.00")), dec("-50.00"));
    }

    #[test]
    fn zero_ledger_keeps_pre_payment_status() {
        assert_eq!(
            derive_status(dec("500.00"), Decimal::ZERO, InvoiceStatus::Draft),
            InvoiceStatus::Draft
        );
        assert_eq!(
            derive_status(dec("500.00"), Decimal::ZERO, InvoiceStatus::Sent),
            InvoiceStatus::Sent
        );
    }

    #[test]
    fn emptied_ledger_reads_unpaid() {
        // A payment-derived status with a zero ledger means every payment
        // was deleted; the invoice is outstanding again.
        assert_eq!(
            derive_status(dec("500.00"), Decimal::ZERO, InvoiceStatus::Paid),
            InvoiceStatus::Unpaid
        );
        assert_eq!(
            derive_status(dec("500.00"), Decimal::ZERO, InvoiceStatus::PartiallyPaid),
            InvoiceStatus::Unpaid
        );
    }

    #[test]
    fn partial_ledger_reads_partially_paid() {
        assert_eq!(
            derive_status(dec("1000.00"), dec("400.00"), InvoiceStatus::Sent),
            InvoiceStatus::PartiallyPaid
        );
        assert_eq!(
            derive_status(dec("1000.00"), dec("999.99"), InvoiceStatus::PartiallyPaid),
            InvoiceStatus::PartiallyPaid
        );
    }

    #[test]
    fn covered_ledger_reads_paid() {
        assert_eq!(
            derive_status(dec("1000.00"), dec("1000.00"), InvoiceStatus::PartiallyPaid),
            InvoiceStatus::Paid
        );
        assert_eq!(
            derive_status(dec("1000.00"), dec("1000.01"), InvoiceStatus::PartiallyPaid),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn decimal_arithmetic_is_exact_under_repeated_addition() {
        // The same sequence in binary floats drifts; Decimal must not.
        let mut paid = Decimal::ZERO;
        for _ in 0..10 {
            paid += dec("0.10");
        }
        assert_eq!(paid, dec("1.00"));
        assert_eq!(remaining_balance(dec("1.00"), paid), Decimal::ZERO);
        assert_eq!(
            derive_status(dec("1.00"), paid, InvoiceStatus::PartiallyPaid),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn settlement_scenario_progression() {
        // 1000.00 invoice: 400.00 -> partially paid / 600.00 due,
        // then 600.00 -> paid / 0.00 due.
        let total = dec("1000.00");

        let after_first = dec("400.00");
        assert_eq!(
            derive_status(total, after_first, InvoiceStatus::Sent),
            InvoiceStatus::PartiallyPaid
        );
        assert_eq!(remaining_balance(total, after_first), dec("600.00"));

        let after_second = after_first + dec("600.00");
        assert_eq!(
            derive_status(total, after_second, InvoiceStatus::PartiallyPaid),
            InvoiceStatus::Paid
        );
        assert_eq!(remaining_balance(total, after_second), dec("0.00"));
    }
}
