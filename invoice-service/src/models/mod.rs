//! Domain models for invoice-service.

mod customer;
mod history;
mod invoice;
mod payment;

pub use customer::{CreateCustomer, Customer, UpdateCustomer};
pub use history::HistoryEntry;
pub use invoice::{
    CreateInvoice, CreateLineItem, Invoice, InvoiceStatus, LineItem, ListInvoicesFilter,
    UpdateInvoice,
};
pub use payment::{Payment, RecordPayment, UpdatePayment};
