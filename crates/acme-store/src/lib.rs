//! ACME state store persisted to a Kubernetes Secret
//!
//! Keeps the ACME account, issued certificates and pending HTTP-01 /
//! TLS-ALPN-01 challenges in memory and mirrors every change to one
//! namespaced secret, so the state survives restarts and can be shared by
//! replacement pods.
//!
//! # Architecture
//!
//! - [`KubernetesStore`] - In-memory state plus the [`Store`] accessor API
//! - Persistence writer - Background task writing the state in submission order
//! - [`SecretBackend`] - Remote object backend ([`KubernetesBackend`] over the
//!   Kubernetes API, [`MemoryBackend`] in process)
//!
//! # Example
//!
//! ```ignore
//! use acme_store::{KubernetesBackend, KubernetesStore, Store, StoreConfig};
//!
//! let config = StoreConfig::for_namespace("ingress");
//! let backend = KubernetesBackend::from_config(&config)?;
//! let store = KubernetesStore::new(&config, backend).await?;
//!
//! store.set_http_challenge_token("token", "example.com", key_auth);
//! let key_auth = store.get_http_challenge_token("token", "example.com")?;
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod store;
pub mod types;
mod writer;

pub use crate::backend::{BackendOp, KubernetesBackend, MemoryBackend, Secret, SecretBackend};
pub use crate::config::StoreConfig;
pub use crate::error::{BackendError, StoreError, StoreResult};
pub use crate::store::{KubernetesStore, Store};
pub use crate::types::{Account, Certificate, Domain, StoredData};
pub use crate::writer::{WriterStats, STORAGE_KEY};
