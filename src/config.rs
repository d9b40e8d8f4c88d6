//! Runtime configuration.
//!
//! Every setting can come from a command-line flag or its environment
//! variable; flags win. Values are validated before any network call.

use crate::odoo::OdooSettings;
use clap::Args;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// ERP endpoint and credentials.
#[derive(Args, Debug, Clone)]
pub struct OdooArgs {
    /// Odoo base URL; upgraded to https
    #[arg(long = "odoo-url", env = "ODOO_URL")]
    pub url: String,

    /// Odoo database name
    #[arg(long = "odoo-db", env = "ODOO_DB")]
    pub database: String,

    /// Login of the extraction user
    #[arg(long = "odoo-username", env = "ODOO_USERNAME")]
    pub username: String,

    /// Password or API key
    #[arg(long = "odoo-password", env = "ODOO_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Per-request timeout in seconds
    #[arg(long = "odoo-timeout-secs", env = "ODOO_TIMEOUT_SECS", default_value_t = 120)]
    pub timeout_secs: u64,
}

impl OdooArgs {
    pub fn settings(&self) -> Result<OdooSettings, ConfigError> {
        let url = normalize_url(&self.url)?;
        let database = required("ODOO_DB", &self.database)?;
        let username = required("ODOO_USERNAME", &self.username)?;
        let password = required("ODOO_PASSWORD", &self.password)?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "ODOO_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(OdooSettings {
            url,
            database,
            username,
            password,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// Destination bucket and prefix.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Bucket receiving chunks, cursors and the entity registry
    #[arg(long = "bucket", env = "GCS_BUCKET")]
    pub bucket: String,

    /// Object prefix inside the bucket
    #[arg(long = "base-path", env = "GCS_BASE_PATH", default_value = "data-lake/odoo")]
    pub base_path: String,
}

impl StorageArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        required("GCS_BUCKET", &self.bucket).map(|_| ())
    }

    pub fn base_path(&self) -> &str {
        self.base_path.trim_matches('/')
    }
}

/// HTTP service settings.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the HTTP service listens on
    #[arg(long = "listen", env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Records per page for runs triggered over HTTP
    #[arg(long = "batch-size", env = "SERVICE_BATCH_SIZE", default_value_t = 2000)]
    pub batch_size: usize,
}

/// Batch job settings.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Records per page for the full-extract job
    #[arg(long = "batch-size", env = "ODOO_BATCH_SIZE", default_value_t = 5000)]
    pub batch_size: usize,
}

pub fn validate_batch_size(batch_size: usize) -> Result<usize, ConfigError> {
    if batch_size == 0 {
        return Err(ConfigError::Invalid {
            name: "batch size",
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(batch_size)
}

fn required(name: &'static str, value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Missing(name));
    }
    Ok(value.to_string())
}

/// Forces `https://` and strips trailing slashes.
pub fn normalize_url(raw: &str) -> Result<String, ConfigError> {
    let raw = required("ODOO_URL", raw)?;
    let host = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .unwrap_or(&raw)
        .trim_end_matches('/');
    if host.is_empty() {
        return Err(ConfigError::Invalid {
            name: "ODOO_URL",
            reason: format!("'{raw}' has no host"),
        });
    }
    Ok(format!("https://{host}"))
}
