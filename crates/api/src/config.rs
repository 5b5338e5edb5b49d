//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,

    // Logging: "text" (default) or "json"
    pub log_format: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Stripe and email settings are loaded separately by the billing crate;
    /// only the HTTP surface's own settings live here.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::Invalid("PORT must be a number"))?;

        Ok(Self {
            bind_address: format!("0.0.0.0:{}", port),
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration value: {0}")]
    Invalid(&'static str),
}
