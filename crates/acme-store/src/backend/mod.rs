//! Remote object backends.
//!
//! The store persists its state as one named, namespaced secret holding a
//! map of binary fields. Backends only need whole-object get, create and
//! update; there is no partial or merge update.

mod kubernetes;
mod memory;

pub use kubernetes::KubernetesBackend;
pub use memory::{BackendOp, MemoryBackend};

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::BackendError;

/// Secret type tag used for the store's object.
pub const OPAQUE_SECRET_TYPE: &str = "Opaque";

/// A named, namespaced object holding binary fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    pub secret_type: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Create an opaque secret with a single field.
    pub fn opaque(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), value);
        Self {
            name: name.into(),
            namespace: namespace.into(),
            secret_type: OPAQUE_SECRET_TYPE.to_string(),
            data,
        }
    }
}

/// Remote object backend.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Fetch a secret. Absence is reported as [`BackendError::NotFound`].
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, BackendError>;

    /// Check whether a secret exists.
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, BackendError> {
        match self.get(namespace, name).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a secret that does not exist yet.
    async fn create(&self, secret: &Secret) -> Result<(), BackendError>;

    /// Replace an existing secret wholesale.
    async fn update(&self, secret: &Secret) -> Result<(), BackendError>;
}
