//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The broker password is wrapped in secrecy::SecretString to prevent log leaks.

pub mod pipeline;
pub mod secrets;

pub use pipeline::{ConsumerSettings, PipelineSettings, ProducerSettings};

use crate::error::{Error, Result};
use secrets::SecretString;

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            vhost: "/".to_string(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.vhost)
    }
}

/// Broker login.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let host = required_var("RABBITMQ_HOSTNAME")?;
        let username = required_var("RABBITMQ_USERNAME")?;
        let password = required_var("RABBITMQ_PASSWORD")?;

        let port = match std::env::var("RABBITMQ_PORT") {
            Ok(raw) => raw.parse().map_err(|_| {
                Error::Configuration(format!("RABBITMQ_PORT is not a valid port: {raw}"))
            })?,
            Err(_) => DEFAULT_PORT,
        };
        let vhost = std::env::var("RABBITMQ_VHOST").unwrap_or_else(|_| "/".to_string());

        Ok(Self {
            endpoint: Endpoint { host, port, vhost },
            credentials: Credentials {
                username,
                password: SecretString::from(password),
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Read a variable that must be present and non-empty.
fn required_var(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Configuration(format!(
            "required environment variable {name} is not set"
        ))),
    }
}
