//! Payment handlers.
//!
//! Recording a payment is the settlement inbound operation: it validates,
//! derives the new invoice balance/status, and persists both rows as one
//! transaction via the settlement engine.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{RecordPaymentRequest, UpdatePaymentRequest},
    middleware::AuthContext,
    models::{Invoice, Payment, RecordPayment, UpdatePayment},
    services::settlement::{self, SettlementOutcome},
    AppState,
};

pub async fn record_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<i64>,
    Json(payload): Json<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<SettlementOutcome>), AppError> {
    tracing::info!(
        invoice_id = %invoice_id,
        user_id = %auth.user_id,
        amount_paid = %payload.amount_paid,
        "Recording payment"
    );

    let outcome = settlement::record_payment(
        &state.db,
        invoice_id,
        auth.user_id,
        &RecordPayment {
            amount_paid: payload.amount_paid,
            payment_date: payload.payment_date,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn list_invoice_payments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<i64>,
) -> Result<Json<Vec<Payment>>, AppError> {
    state
        .db
        .get_invoice(auth.user_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let payments = state
        .db
        .payments_for_invoice(auth.user_id, invoice_id)
        .await?;

    Ok(Json(payments))
}

pub async fn get_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<i64>,
) -> Result<Json<Payment>, AppError> {
    let payment = state
        .db
        .get_payment(auth.user_id, payment_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

    Ok(Json(payment))
}

pub async fn update_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<i64>,
    Json(payload): Json<UpdatePaymentRequest>,
) -> Result<Json<SettlementOutcome>, AppError> {
    let outcome = settlement::update_payment(
        &state.db,
        payment_id,
        auth.user_id,
        &UpdatePayment {
            amount_paid: payload.amount_paid,
            payment_date: payload.payment_date,
        },
    )
    .await?;

    Ok(Json(outcome))
}

pub async fn delete_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<i64>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = settlement::delete_payment(&state.db, payment_id, auth.user_id).await?;

    Ok(Json(invoice))
}
