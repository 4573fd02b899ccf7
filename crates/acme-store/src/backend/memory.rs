//! In-process secret backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Secret, SecretBackend};
use crate::error::BackendError;

/// A recorded write against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    Create(Secret),
    Update(Secret),
}

impl BackendOp {
    pub fn secret(&self) -> &Secret {
        match self {
            BackendOp::Create(secret) | BackendOp::Update(secret) => secret,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    secrets: Mutex<HashMap<(String, String), Secret>>,
    ops: Mutex<Vec<BackendOp>>,
    failing_writes: AtomicUsize,
    unavailable: AtomicBool,
}

/// Secret backend held in memory.
///
/// Clones share the same objects, so a second store built from a clone
/// sees what the first one persisted. Every successful create/update is
/// appended to an operation log.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording an operation.
    pub fn insert(&self, secret: Secret) {
        let key = (secret.namespace.clone(), secret.name.clone());
        self.inner.secrets.lock().insert(key, secret);
    }

    /// Current object, if any.
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.inner
            .secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Successful writes, oldest first.
    pub fn ops(&self) -> Vec<BackendOp> {
        self.inner.ops.lock().clone()
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> Result<(), BackendError> {
        let injected = self
            .inner
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, BackendError> {
        self.check_available()?;
        trace!(namespace = %namespace, name = %name, "Memory backend get");
        self.secret(namespace, name).ok_or_else(|| BackendError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn create(&self, secret: &Secret) -> Result<(), BackendError> {
        self.check_available()?;
        self.take_injected_failure()?;

        let key = (secret.namespace.clone(), secret.name.clone());
        let mut secrets = self.inner.secrets.lock();
        if secrets.contains_key(&key) {
            return Err(BackendError::Status {
                status: 409,
                message: format!("secret {}/{} already exists", key.0, key.1),
            });
        }
        secrets.insert(key, secret.clone());
        self.inner.ops.lock().push(BackendOp::Create(secret.clone()));

        debug!(namespace = %secret.namespace, name = %secret.name, "Memory backend created secret");
        Ok(())
    }

    async fn update(&self, secret: &Secret) -> Result<(), BackendError> {
        self.check_available()?;
        self.take_injected_failure()?;

        let key = (secret.namespace.clone(), secret.name.clone());
        let mut secrets = self.inner.secrets.lock();
        if !secrets.contains_key(&key) {
            return Err(BackendError::NotFound {
                namespace: key.0,
                name: key.1,
            });
        }
        secrets.insert(key, secret.clone());
        self.inner.ops.lock().push(BackendOp::Update(secret.clone()));

        debug!(namespace = %secret.namespace, name = %secret.name, "Memory backend updated secret");
        Ok(())
    }
}
