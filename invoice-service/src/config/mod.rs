use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use service_core::config::Config as CommonConfig;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub common: CommonConfig,
    pub database: DatabaseConfig,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let port = env::var("INVOICE_SERVICE_PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse()?;

        let db_url = env::var("INVOICE_DATABASE_URL")
            .map_err(|_| anyhow!("INVOICE_DATABASE_URL must be set"))?;
        let max_connections = env::var("INVOICE_DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        let min_connections = env::var("INVOICE_DATABASE_MIN_CONNECTIONS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()?;

        let log_level = env::var("INVOICE_LOG_LEVEL")
            .unwrap_or_else(|_| "info,invoice_service=debug".to_string());
        let otlp_endpoint = env::var("INVOICE_OTLP_ENDPOINT").ok();

        Ok(Self {
            common: CommonConfig { port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            service_name: "invoice-service".to_string(),
            log_level,
            otlp_endpoint,
        })
    }
}
