pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use services::Database;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    db: Database,
}

impl Application {
    /// Build the application: connect the pool, run migrations, assemble the
    /// router, and bind the listener (port 0 binds a random port for tests).
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        db.run_migrations().await?;

        services::metrics::init_metrics();

        let state = AppState { db: db.clone() };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            // Customer endpoints (owner-scoped)
            .route(
                "/customers",
                post(handlers::customers::create_customer).get(handlers::customers::list_customers),
            )
            .route(
                "/customers/:id",
                get(handlers::customers::get_customer)
                    .put(handlers::customers::update_customer)
                    .delete(handlers::customers::delete_customer),
            )
            // Invoice endpoints
            .route(
                "/invoices",
                post(handlers::invoices::create_invoice).get(handlers::invoices::list_invoices),
            )
            .route(
                "/invoices/:id",
                get(handlers::invoices::get_invoice)
                    .put(handlers::invoices::update_invoice)
                    .delete(handlers::invoices::delete_invoice),
            )
            .route("/invoices/:id/history", get(handlers::invoices::invoice_history))
            // Settlement endpoints
            .route(
                "/invoices/:id/payments",
                post(handlers::payments::record_payment)
                    .get(handlers::payments::list_invoice_payments),
            )
            .route(
                "/payments/:id",
                get(handlers::payments::get_payment)
                    .put(handlers::payments::update_payment)
                    .delete(handlers::payments::delete_payment),
            )
            // Dashboard
            .route("/dashboard/summary", get(handlers::dashboard::summary))
            // The SPA client is served from a different origin.
            .layer(CorsLayer::permissive())
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        user_id = tracing::field::Empty,
                    )
                }),
            )
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("invoice-service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            router,
            db,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a handle to the database (used by the test harness).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await
    }
}
