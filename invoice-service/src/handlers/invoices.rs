//! Invoice handlers. All operations are scoped to the authenticated owner.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use service_core::error::AppError;
use validator::Validate;

use crate::{
    dtos::{CreateInvoiceRequest, InvoiceDetailResponse, ListInvoicesQuery, UpdateInvoiceRequest},
    middleware::AuthContext,
    models::{
        CreateInvoice, CreateLineItem, HistoryEntry, Invoice, InvoiceStatus, ListInvoicesFilter,
        UpdateInvoice,
    },
    services::metrics::INVOICES_TOTAL,
    AppState,
};

pub async fn create_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceDetailResponse>), AppError> {
    payload.validate()?;

    let mut messages = Vec::new();
    for (i, item) in payload.items.iter().enumerate() {
        if item.quantity <= Decimal::ZERO {
            messages.push(format!("items[{}]: quantity must be greater than zero", i));
        }
        if item.unit_price <= Decimal::ZERO {
            messages.push(format!("items[{}]: unit price must be greater than zero", i));
        }
    }
    if !messages.is_empty() {
        return Err(AppError::Validation(messages));
    }

    // Explicit pre-write checks, timed relative to the insert rather than
    // hidden in storage-level hooks. The unique index backs the number check
    // up under concurrency.
    if state
        .db
        .get_customer(auth.user_id, payload.customer_id)
        .await?
        .is_none()
    {
        return Err(AppError::validation("customer does not exist"));
    }
    if state
        .db
        .invoice_number_exists(auth.user_id, &payload.invoice_number)
        .await?
    {
        return Err(AppError::validation("invoice number already in use"));
    }

    let subtotal: Decimal = payload
        .items
        .iter()
        .map(|item| item.quantity * item.unit_price)
        .sum();
    let total_amount = (subtotal + payload.tax - payload.discount).round_dp(2);
    if total_amount < Decimal::ZERO {
        return Err(AppError::validation("total amount must not be negative"));
    }

    tracing::info!(
        user_id = %auth.user_id,
        invoice_number = %payload.invoice_number,
        total_amount = %total_amount,
        "Creating invoice"
    );

    let input = CreateInvoice {
        user_id: auth.user_id,
        customer_id: payload.customer_id,
        invoice_number: payload.invoice_number,
        issue_date: payload.issue_date,
        due_date: payload.due_date,
        tax: payload.tax,
        discount: payload.discount,
        items: payload
            .items
            .into_iter()
            .map(|item| CreateLineItem {
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
                sort_order: item.sort_order,
            })
            .collect(),
    };

    let (invoice, items) = state.db.create_invoice(&input, total_amount).await?;

    INVOICES_TOTAL.with_label_values(&["draft"]).inc();
    state
        .db
        .record_history(invoice.id, auth.user_id, None, "invoice_created")
        .await;

    Ok((
        StatusCode::CREATED,
        Json(InvoiceDetailResponse {
            invoice,
            items,
            payments: Vec::new(),
        }),
    ))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s @ ("draft" | "sent" | "unpaid" | "partially_paid" | "paid")) => {
            Some(InvoiceStatus::from_string(s))
        }
        Some(other) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Unknown status filter '{}'",
                other
            )))
        }
    };

    let filter = ListInvoicesFilter {
        status,
        customer_id: query.customer_id,
        start_date: query.start_date,
        end_date: query.end_date,
        page_size: query.page_size.unwrap_or(50),
        page_token: query.page_token,
    };

    let invoices = state.db.list_invoices(auth.user_id, &filter).await?;

    Ok(Json(invoices))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<i64>,
) -> Result<Json<InvoiceDetailResponse>, AppError> {
    let invoice = state
        .db
        .get_invoice(auth.user_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let items = state.db.get_line_items(invoice.id).await?;
    let payments = state
        .db
        .payments_for_invoice(auth.user_id, invoice.id)
        .await?;

    Ok(Json(InvoiceDetailResponse {
        invoice,
        items,
        payments,
    }))
}

pub async fn update_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<i64>,
    Json(payload): Json<UpdateInvoiceRequest>,
) -> Result<Json<Invoice>, AppError> {
    let marked_sent = payload.status == Some(InvoiceStatus::Sent);

    let invoice = state
        .db
        .update_invoice(
            auth.user_id,
            invoice_id,
            &UpdateInvoice {
                issue_date: payload.issue_date,
                due_date: payload.due_date,
                status: payload.status,
            },
        )
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    if marked_sent {
        INVOICES_TOTAL.with_label_values(&["sent"]).inc();
        state
            .db
            .record_history(invoice.id, auth.user_id, None, "invoice_sent")
            .await;
    }

    Ok(Json(invoice))
}

pub async fn delete_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let deleted = state.db.delete_invoice(auth.user_id, invoice_id).await?;
    if !deleted {
        return Err(AppError::NotFound(anyhow::anyhow!("Invoice not found")));
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn invoice_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<i64>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    state
        .db
        .get_invoice(auth.user_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let entries = state
        .db
        .histories_for_invoice(auth.user_id, invoice_id)
        .await?;

    Ok(Json(entries))
}
