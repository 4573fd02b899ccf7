//! Kubernetes Secret backend
//!
//! Talks to the core/v1 Secret API over plain HTTP(S). The client is built
//! once and reused for every call, so credentials are read a single time
//! at startup.

use std::collections::BTreeMap;
use std::fs;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::{Secret, SecretBackend};
use crate::config::StoreConfig;
use crate::error::{BackendError, StoreError, StoreResult};

/// Secret manifest as exchanged with the API server
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretManifest {
    #[serde(default = "default_api_version")]
    api_version: String,
    #[serde(default = "default_kind")]
    kind: String,
    metadata: ObjectMeta,
    #[serde(rename = "type", default)]
    secret_type: Option<String>,
    #[serde(default)]
    data: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
}

/// Failure body returned by the API server
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

fn default_api_version() -> String { "v1".to_string() }
fn default_kind() -> String { "Secret".to_string() }

impl SecretManifest {
    fn from_secret(secret: &Secret) -> Self {
        let data = secret
            .data
            .iter()
            .map(|(key, value)| (key.clone(), STANDARD.encode(value)))
            .collect();
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: secret.name.clone(),
                namespace: Some(secret.namespace.clone()),
            },
            secret_type: Some(secret.secret_type.clone()),
            data: Some(data),
        }
    }

    fn into_secret(self, namespace: &str) -> Result<Secret, BackendError> {
        let mut data = BTreeMap::new();
        for (key, encoded) in self.data.unwrap_or_default() {
            let value = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                BackendError::InvalidResponse(format!("field '{}' is not base64: {}", key, e))
            })?;
            data.insert(key, value);
        }
        Ok(Secret {
            name: self.metadata.name,
            namespace: self.metadata.namespace.unwrap_or_else(|| namespace.to_string()),
            secret_type: self.secret_type.unwrap_or_default(),
            data,
        })
    }
}

/// Secret backend for the Kubernetes API.
#[derive(Debug, Clone)]
pub struct KubernetesBackend {
    client: Client,
    api_server: String,
    token: Option<String>,
}

impl KubernetesBackend {
    /// Build a backend from store configuration.
    ///
    /// Reads the bearer token file, if configured, once.
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let token = match &config.token_path {
            Some(path) => {
                let token = fs::read_to_string(path).map_err(|e| {
                    StoreError::Config(format!(
                        "failed to read token file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(token.trim().to_string())
            }
            None => None,
        };

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {}", e)))?;

        info!(
            api_server = %config.api_server,
            authenticated = token.is_some(),
            "Initialized Kubernetes secret backend"
        );

        Ok(Self::with_client(client, &config.api_server, token))
    }

    /// Build a backend around an existing HTTP client.
    pub fn with_client(client: Client, api_server: &str, token: Option<String>) -> Self {
        Self {
            client,
            api_server: api_server.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn collection_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/secrets", self.api_server, namespace)
    }

    fn object_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_url(namespace), name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiStatus>(&body) {
            Ok(api_status) if !api_status.message.is_empty() => {
                format!("{} ({})", api_status.message, api_status.reason)
            }
            _ => body,
        };
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SecretBackend for KubernetesBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, BackendError> {
        let url = self.object_url(namespace, name);
        trace!(url = %url, "Fetching secret");

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let manifest: SecretManifest = Self::check(response).await?.json().await?;
        manifest.into_secret(namespace)
    }

    async fn create(&self, secret: &Secret) -> Result<(), BackendError> {
        let url = self.collection_url(&secret.namespace);
        let manifest = SecretManifest::from_secret(secret);

        let response = self
            .authorize(self.client.post(&url))
            .json(&manifest)
            .send()
            .await?;
        Self::check(response).await?;

        debug!(namespace = %secret.namespace, name = %secret.name, "Created secret");
        Ok(())
    }

    async fn update(&self, secret: &Secret) -> Result<(), BackendError> {
        let url = self.object_url(&secret.namespace, &secret.name);
        let manifest = SecretManifest::from_secret(secret);

        let response = self
            .authorize(self.client.put(&url))
            .json(&manifest)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                namespace: secret.namespace.clone(),
                name: secret.name.clone(),
            });
        }
        Self::check(response).await?;

        debug!(namespace = %secret.namespace, name = %secret.name, "Updated secret");
        Ok(())
    }
}
