//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "ACME_STORE";

/// Configuration for the secret-backed ACME store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Namespace holding the storage secret
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name of the storage secret
    #[serde(default = "default_secret_name")]
    pub secret_name: String,

    /// Kubernetes API server base URL
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// File holding a bearer token for the API server
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_namespace() -> String { "default".to_string() }
fn default_secret_name() -> String { "acme-storage".to_string() }
fn default_api_server() -> String { "http://localhost:8001".to_string() }
fn default_request_timeout_secs() -> u64 { 10 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            secret_name: default_secret_name(),
            api_server: default_api_server(),
            token_path: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl StoreConfig {
    /// Configuration for a namespace with every other setting defaulted.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional file, then `ACME_STORE_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> StoreResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        let config: StoreConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(StoreError::Config("namespace must not be empty".to_string()));
        }
        if self.secret_name.trim().is_empty() {
            return Err(StoreError::Config("secret_name must not be empty".to_string()));
        }
        if !self.api_server.starts_with("http://") && !self.api_server.starts_with("https://") {
            return Err(StoreError::Config(format!(
                "api_server must be an http(s) URL, got '{}'",
                self.api_server
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(StoreError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
