//! Common test utilities for invoice-service integration tests.

use invoice_service::config::{Config, DatabaseConfig};
use invoice_service::services::Database;
use invoice_service::Application;
use reqwest::Client;
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,invoice_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestApp {
    pub address: String,
    pub db: Database,
    pub client: Client,
}

impl TestApp {
    /// Spawn the application on a random port against TEST_DATABASE_URL.
    ///
    /// Tests isolate themselves by owner: every test seeds its own user(s),
    /// so a shared database works across concurrent tests.
    pub async fn spawn() -> Self {
        init_tracing();

        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must be set to run integration tests");

        let config = Config {
            common: CommonConfig { port: 0 },
            database: DatabaseConfig {
                url: Secret::new(database_url),
                max_connections: 5,
                min_connections: 1,
            },
            service_name: "invoice-service-test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let db = app.db().clone();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling the health endpoint.
        let client = Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            db,
            client,
        }
    }

    /// Seed a user row directly. Users are managed by the external auth
    /// service, so there is no endpoint for this.
    pub async fn create_user(&self, label: &str) -> i64 {
        let email = format!("{}-{}@example.com", label, Uuid::new_v4());
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (email, name) VALUES ($1, $2) RETURNING id",
        )
        .bind(&email)
        .bind(label)
        .fetch_one(self.db.pool())
        .await
        .expect("Failed to seed test user")
    }

    /// Create a customer over the API, returning its id.
    pub async fn create_customer(&self, user_id: i64, name: &str) -> i64 {
        let response = self
            .client
            .post(format!("{}/customers", self.address))
            .header("X-User-Id", user_id)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .expect("Failed to create customer");
        assert_eq!(response.status(), 201, "customer creation should succeed");

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        body["customer_id"].as_i64().expect("Missing customer_id")
    }

    /// Create a single-line-item invoice over the API, returning its id.
    pub async fn create_invoice(
        &self,
        user_id: i64,
        customer_id: i64,
        invoice_number: &str,
        amount: &str,
    ) -> i64 {
        let response = self
            .client
            .post(format!("{}/invoices", self.address))
            .header("X-User-Id", user_id)
            .json(&serde_json::json!({
                "customer_id": customer_id,
                "invoice_number": invoice_number,
                "issue_date": "2026-01-15",
                "due_date": "2026-02-15",
                "items": [
                    { "description": "Consulting services", "quantity": "1", "unit_price": amount }
                ]
            }))
            .send()
            .await
            .expect("Failed to create invoice");
        assert_eq!(response.status(), 201, "invoice creation should succeed");

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        body["invoice"]["id"].as_i64().expect("Missing invoice id")
    }

    /// Fetch an invoice detail (invoice + items + payments) as JSON.
    pub async fn get_invoice(&self, user_id: i64, invoice_id: i64) -> serde_json::Value {
        let response = self
            .client
            .get(format!("{}/invoices/{}", self.address, invoice_id))
            .header("X-User-Id", user_id)
            .send()
            .await
            .expect("Failed to get invoice");
        assert_eq!(response.status(), 200, "invoice fetch should succeed");

        response.json().await.expect("Failed to parse JSON")
    }

    /// Record a payment, returning the raw response for status assertions.
    pub async fn record_payment(
        &self,
        user_id: i64,
        invoice_id: i64,
        amount: &str,
        date: &str,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}/invoices/{}/payments", self.address, invoice_id))
            .header("X-User-Id", user_id)
            .json(&serde_json::json!({
                "amount_paid": amount,
                "payment_date": date,
            }))
            .send()
            .await
            .expect("Failed to send payment request")
    }
}

/// Parse a monetary JSON value (serialized Decimal string) for comparison.
pub fn money(value: &serde_json::Value) -> rust_decimal::Decimal {
    value
        .as_str()
        .unwrap_or_else(|| panic!("expected monetary string, got {}", value))
        .parse()
        .expect("Failed to parse monetary value")
}
