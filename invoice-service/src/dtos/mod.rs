//! Request and response bodies for the REST surface.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{Invoice, InvoiceStatus, LineItem, Payment};

// -----------------------------------------------------------------------------
// Customers
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCustomerRequest {
    #[validate(length(min = 1, max = 255, message = "name is required"))]
    pub name: String,
    #[validate(email(message = "must be a valid email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Validate, Default)]
pub struct UpdateCustomerRequest {
    #[validate(length(min = 1, max = 255, message = "name must not be empty"))]
    pub name: Option<String>,
    #[validate(email(message = "must be a valid email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListCustomersQuery {
    pub page_size: Option<i32>,
    pub page_token: Option<i64>,
}

// -----------------------------------------------------------------------------
// Invoices
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct LineItemRequest {
    #[validate(length(min = 1, message = "description is required"))]
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub customer_id: i64,
    #[validate(length(min = 1, max = 64, message = "invoice number is required"))]
    pub invoice_number: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub tax: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[validate(length(min = 1, message = "at least one line item is required"))]
    #[validate(nested)]
    pub items: Vec<LineItemRequest>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateInvoiceRequest {
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListInvoicesQuery {
    pub status: Option<String>,
    pub customer_id: Option<i64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page_size: Option<i32>,
    pub page_token: Option<i64>,
}

/// Invoice with its line items and recorded payments.
#[derive(Debug, Serialize)]
pub struct InvoiceDetailResponse {
    pub invoice: Invoice,
    pub items: Vec<LineItem>,
    pub payments: Vec<Payment>,
}

// -----------------------------------------------------------------------------
// Payments
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount_paid: Decimal,
    pub payment_date: NaiveDate,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdatePaymentRequest {
    pub amount_paid: Option<Decimal>,
    pub payment_date: Option<NaiveDate>,
}
