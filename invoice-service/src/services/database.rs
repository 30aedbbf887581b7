//! Database service for invoice-service.

use crate::models::{
    CreateCustomer, CreateInvoice, Customer, HistoryEntry, Invoice, LineItem, ListInvoicesFilter,
    Payment, UpdateCustomer, UpdateInvoice,
};
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::PgExecutor;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Owner-scoped aggregates backing the dashboard.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DashboardSummary {
    pub invoice_count: i64,
    pub total_billed: Decimal,
    pub total_received: Decimal,
    pub total_outstanding: Decimal,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    ///
    /// A server-side `statement_timeout` bounds every statement, so a wedged
    /// transaction aborts and rolls back even if the caller disconnects.
    #[instrument(skip(database_url), fields(service = "invoice-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid database URL: {}", e)))?
            .options([("statement_timeout", "5000")]);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Customer Operations
    // -------------------------------------------------------------------------

    /// Create a new customer.
    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    pub async fn create_customer(&self, input: &CreateCustomer) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (user_id, name, email, phone, address)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING customer_id, user_id, name, email, phone, address, created_utc
            "#,
        )
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.email)
        .bind(&input.phone)
        .bind(&input.address)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create customer: {}", e)))?;

        timer.observe_duration();

        info!(customer_id = %customer.customer_id, "Customer created");

        Ok(customer)
    }

    /// Get a customer by ID for the owning user.
    #[instrument(skip(self), fields(user_id = %user_id, customer_id = %customer_id))]
    pub async fn get_customer(
        &self,
        user_id: i64,
        customer_id: i64,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, user_id, name, email, phone, address, created_utc
            FROM customers
            WHERE user_id = $1 AND customer_id = $2
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        timer.observe_duration();

        Ok(customer)
    }

    /// List customers for the owning user with keyset pagination.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_customers(
        &self,
        user_id: i64,
        page_size: i32,
        page_token: Option<i64>,
    ) -> Result<Vec<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_customers"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, user_id, name, email, phone, address, created_utc
            FROM customers
            WHERE user_id = $1
              AND ($2::bigint IS NULL OR customer_id > $2)
            ORDER BY customer_id
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list customers: {}", e)))?;

        timer.observe_duration();

        Ok(customers)
    }

    /// Update a customer.
    #[instrument(skip(self, input), fields(user_id = %user_id, customer_id = %customer_id))]
    pub async fn update_customer(
        &self,
        user_id: i64,
        customer_id: i64,
        input: &UpdateCustomer,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            UPDATE customers
            SET name = COALESCE($3, name),
                email = COALESCE($4, email),
                phone = COALESCE($5, phone),
                address = COALESCE($6, address)
            WHERE user_id = $1 AND customer_id = $2
            RETURNING customer_id, user_id, name, email, phone, address, created_utc
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .bind(&input.name)
        .bind(&input.email)
        .bind(&input.phone)
        .bind(&input.address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update customer: {}", e)))?;

        timer.observe_duration();

        Ok(customer)
    }

    /// Delete a customer. Customers with invoices cannot be deleted.
    #[instrument(skip(self), fields(user_id = %user_id, customer_id = %customer_id))]
    pub async fn delete_customer(&self, user_id: i64, customer_id: i64) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_customer"])
            .start_timer();

        let invoice_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM invoices WHERE user_id = $1 AND customer_id = $2",
        )
        .bind(user_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count invoices: {}", e)))?;

        if invoice_count > 0 {
            return Err(AppError::validation(
                "customer has invoices and cannot be deleted",
            ));
        }

        let result = sqlx::query("DELETE FROM customers WHERE user_id = $1 AND customer_id = $2")
            .bind(user_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete customer: {}", e))
            })?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    /// Check whether an invoice number is already in use by this user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn invoice_number_exists(
        &self,
        user_id: i64,
        invoice_number: &str,
    ) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM invoices WHERE user_id = $1 AND invoice_number = $2)",
        )
        .bind(user_id)
        .bind(invoice_number)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check invoice number: {}", e))
        })?;

        Ok(exists)
    }

    /// Create a new draft invoice with its line items in one transaction.
    ///
    /// `total_amount` is computed by the caller from the validated items.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, invoice_number = %input.invoice_number))]
    pub async fn create_invoice(
        &self,
        input: &CreateInvoice,
        total_amount: Decimal,
    ) -> Result<(Invoice, Vec<LineItem>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                user_id, customer_id, invoice_number, issue_date, due_date,
                total_amount, tax, discount, status, amount_due, paid
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'draft', $6, 0)
            RETURNING id, user_id, customer_id, invoice_number, issue_date, due_date,
                total_amount, tax, discount, status, amount_due, paid, created_utc
            "#,
        )
        .bind(input.user_id)
        .bind(input.customer_id)
        .bind(&input.invoice_number)
        .bind(input.issue_date)
        .bind(input.due_date)
        .bind(total_amount)
        .bind(input.tax)
        .bind(input.discount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Invoice number '{}' already in use",
                    input.invoice_number
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)),
        })?;

        let mut items = Vec::with_capacity(input.items.len());
        for item in &input.items {
            let inserted = sqlx::query_as::<_, LineItem>(
                r#"
                INSERT INTO line_items (invoice_id, description, quantity, unit_price, sort_order)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING line_item_id, invoice_id, description, quantity, unit_price, sort_order
                "#,
            )
            .bind(invoice.id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.sort_order)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert line item: {}", e))
            })?;
            items.push(inserted);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.id,
            total_amount = %invoice.total_amount,
            "Draft invoice created"
        );

        Ok((invoice, items))
    }

    /// Get an invoice by ID for the owning user.
    #[instrument(skip(self), fields(user_id = %user_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, user_id, customer_id, invoice_number, issue_date, due_date,
                total_amount, tax, discount, status, amount_due, paid, created_utc
            FROM invoices
            WHERE user_id = $1 AND id = $2
            "#,
        )
        .bind(user_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// List invoices for the owning user.
    #[instrument(skip(self, filter), fields(user_id = %user_id))]
    pub async fn list_invoices(
        &self,
        user_id: i64,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, user_id, customer_id, invoice_number, issue_date, due_date,
                total_amount, tax, discount, status, amount_due, paid, created_utc
            FROM invoices
            WHERE user_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::bigint IS NULL OR customer_id = $3)
              AND ($4::date IS NULL OR issue_date >= $4)
              AND ($5::date IS NULL OR issue_date <= $5)
              AND ($6::bigint IS NULL OR id > $6)
            ORDER BY id
            LIMIT $7
            "#,
        )
        .bind(user_id)
        .bind(&status_str)
        .bind(filter.customer_id)
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    /// Update pre-payment invoice metadata (dates, draft -> sent transition).
    #[instrument(skip(self, input), fields(user_id = %user_id, invoice_id = %invoice_id))]
    pub async fn update_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
        input: &UpdateInvoice,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let existing = match self.get_invoice(user_id, invoice_id).await? {
            Some(inv) => inv,
            None => return Ok(None),
        };

        let current = crate::models::InvoiceStatus::from_string(&existing.status);
        if current.is_payment_derived() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Only draft or sent invoices can be updated"
            )));
        }

        let new_status = match input.status {
            None => None,
            Some(crate::models::InvoiceStatus::Sent) => Some("sent".to_string()),
            Some(s) if s == current => None,
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Invoice status can only transition from draft to sent"
                )))
            }
        };

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET issue_date = COALESCE($3, issue_date),
                due_date = COALESCE($4, due_date),
                status = COALESCE($5, status)
            WHERE user_id = $1 AND id = $2
            RETURNING id, user_id, customer_id, invoice_number, issue_date, due_date,
                total_amount, tax, discount, status, amount_due, paid, created_utc
            "#,
        )
        .bind(user_id)
        .bind(invoice_id)
        .bind(input.issue_date)
        .bind(input.due_date)
        .bind(&new_status)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

        timer.observe_duration();

        if let Some(ref inv) = invoice {
            info!(invoice_id = %inv.id, status = %inv.status, "Invoice updated");
        }

        Ok(invoice)
    }

    /// Delete an invoice. Invoices with payments attached cannot be deleted.
    #[instrument(skip(self), fields(user_id = %user_id, invoice_id = %invoice_id))]
    pub async fn delete_invoice(&self, user_id: i64, invoice_id: i64) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_invoice"])
            .start_timer();

        let payment_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE invoice_id = $1")
                .bind(invoice_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to count payments: {}", e))
                })?;

        if payment_count > 0 {
            return Err(AppError::validation(
                "invoice has recorded payments and cannot be deleted",
            ));
        }

        let result = sqlx::query("DELETE FROM invoices WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(invoice_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete invoice: {}", e))
            })?;

        timer.observe_duration();

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(invoice_id = %invoice_id, "Invoice deleted");
        }

        Ok(deleted)
    }

    /// Get line items for an invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_line_items(&self, invoice_id: i64) -> Result<Vec<LineItem>, AppError> {
        let items = sqlx::query_as::<_, LineItem>(
            r#"
            SELECT line_item_id, invoice_id, description, quantity, unit_price, sort_order
            FROM line_items
            WHERE invoice_id = $1
            ORDER BY sort_order, line_item_id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get line items: {}", e)))?;

        Ok(items)
    }

    // -------------------------------------------------------------------------
    // Payment Ledger Operations
    // -------------------------------------------------------------------------

    /// Sum of committed payments against an invoice.
    ///
    /// Generic over the executor so the settlement engine can run it inside
    /// its own transaction and observe that transaction's prior writes.
    pub async fn sum_payments<'e>(
        executor: impl PgExecutor<'e>,
        invoice_id: i64,
    ) -> Result<Decimal, AppError> {
        let sum: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_paid), 0) FROM payments WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_one(executor)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum payments: {}", e)))?;

        Ok(sum)
    }

    /// Get payments recorded against an invoice, oldest first.
    #[instrument(skip(self), fields(user_id = %user_id, invoice_id = %invoice_id))]
    pub async fn payments_for_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["payments_for_invoice"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, invoice_id, user_id, customer_id, amount_paid, payment_date, created_utc
            FROM payments
            WHERE user_id = $1 AND invoice_id = $2
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list payments: {}", e)))?;

        timer.observe_duration();

        Ok(payments)
    }

    /// Get a payment by ID for the user who recorded it.
    #[instrument(skip(self), fields(user_id = %user_id, payment_id = %payment_id))]
    pub async fn get_payment(
        &self,
        user_id: i64,
        payment_id: i64,
    ) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, invoice_id, user_id, customer_id, amount_paid, payment_date, created_utc
            FROM payments
            WHERE user_id = $1 AND id = $2
            "#,
        )
        .bind(user_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e)))?;

        Ok(payment)
    }

    // -------------------------------------------------------------------------
    // History Operations
    // -------------------------------------------------------------------------

    /// Append an audit entry. Best-effort: failures are logged and swallowed
    /// so they never affect the operation being recorded.
    pub async fn record_history(
        &self,
        invoice_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
        action: &str,
    ) {
        let result = sqlx::query(
            "INSERT INTO histories (invoice_id, user_id, payment_id, action) VALUES ($1, $2, $3, $4)",
        )
        .bind(invoice_id)
        .bind(user_id)
        .bind(payment_id)
        .bind(action)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(
                invoice_id = %invoice_id,
                action = %action,
                error = %e,
                "Failed to record history entry"
            );
        }
    }

    /// Audit entries for an invoice, newest first.
    #[instrument(skip(self), fields(user_id = %user_id, invoice_id = %invoice_id))]
    pub async fn histories_for_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> Result<Vec<HistoryEntry>, AppError> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, invoice_id, user_id, payment_id, action, created_utc
            FROM histories
            WHERE user_id = $1 AND invoice_id = $2
            ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list history: {}", e)))?;

        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Dashboard Operations
    // -------------------------------------------------------------------------

    /// Owner-scoped aggregates for the dashboard.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn dashboard_summary(&self, user_id: i64) -> Result<DashboardSummary, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["dashboard_summary"])
            .start_timer();

        let summary = sqlx::query_as::<_, DashboardSummary>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM invoices WHERE user_id = $1) AS invoice_count,
                (SELECT COALESCE(SUM(total_amount), 0) FROM invoices WHERE user_id = $1) AS total_billed,
                (SELECT COALESCE(SUM(amount_paid), 0) FROM payments WHERE user_id = $1) AS total_received,
                (SELECT COALESCE(SUM(amount_due), 0) FROM invoices WHERE user_id = $1) AS total_outstanding
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load dashboard summary: {}", e))
        })?;

        timer.observe_duration();

        Ok(summary)
    }
}
