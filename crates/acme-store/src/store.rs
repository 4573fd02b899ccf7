//! Secret-backed ACME store
//!
//! Holds the account, issued certificates and in-flight challenges in memory
//! and mirrors every change to a single Kubernetes Secret.
//!
//! # Consistency
//!
//! - Accessors run synchronously on the caller's thread under one mutex.
//!   The mutex is released before the write is queued.
//! - Writes are fire-and-forget. A failed write is logged by the worker and
//!   is not reported to the caller that triggered it.
//! - The backend sees writes in submission order, but quick successive
//!   mutations may be captured by a single write.
//! - There is no coordination between store instances. Two instances
//!   writing the same secret overwrite each other; the last write wins.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::backend::SecretBackend;
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{BackendError, StoreError, StoreResult};
use crate::types::{Account, Certificate, StoredData};
use crate::writer::{PersistenceWriter, SecretTarget, SharedState, WriterStats, STORAGE_KEY};

/// Storage operations needed by the ACME provider.
pub trait Store: Send + Sync {
    /// Registered account, if any.
    fn get_account(&self) -> Option<Account>;

    /// Replace the account.
    fn save_account(&self, account: Account);

    /// Issued certificates in issuance order.
    fn get_certificates(&self) -> Vec<Certificate>;

    /// Replace the whole certificate list.
    fn save_certificates(&self, certificates: Vec<Certificate>);

    /// Key authorization for an HTTP-01 token and domain.
    fn get_http_challenge_token(&self, token: &str, domain: &str) -> StoreResult<Vec<u8>>;

    /// Register an HTTP-01 key authorization, overwriting any previous one.
    fn set_http_challenge_token(&self, token: &str, domain: &str, key_auth: Vec<u8>);

    /// Remove an HTTP-01 key authorization. Absent entries are ignored.
    fn remove_http_challenge_token(&self, token: &str, domain: &str);

    /// Register a TLS-ALPN-01 challenge certificate for a domain.
    fn add_tls_challenge(&self, domain: &str, certificate: Certificate);

    /// TLS-ALPN-01 challenge certificate for a domain, if any.
    fn get_tls_challenge(&self, domain: &str) -> Option<Certificate>;

    /// Remove the TLS-ALPN-01 challenge certificate for a domain.
    fn remove_tls_challenge(&self, domain: &str);
}

/// ACME store persisted to a Kubernetes Secret.
pub struct KubernetesStore {
    namespace: String,
    state: SharedState,
    writer: PersistenceWriter,
}

impl KubernetesStore {
    /// Load the current state from the backend and start the writer.
    ///
    /// A missing secret is a first run and yields an empty store. Any other
    /// backend failure, or a payload that cannot be decoded, fails
    /// construction.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new<B>(config: &StoreConfig, backend: B) -> StoreResult<Self>
    where
        B: SecretBackend + 'static,
    {
        config.validate()?;

        let backend: Arc<dyn SecretBackend> = Arc::new(backend);
        let target = SecretTarget {
            namespace: config.namespace.clone(),
            name: config.secret_name.clone(),
        };

        let data = load(backend.as_ref(), &target).await?;
        let writer = PersistenceWriter::spawn(backend, target);

        Ok(Self {
            namespace: config.namespace.clone(),
            state: Arc::new(Mutex::new(data)),
            writer,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Copy of the current in-memory state.
    pub fn snapshot(&self) -> StoredData {
        self.state.lock().clone()
    }

    /// Wait until every mutation made so far has been processed by the writer.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Persist pending mutations and stop the writer.
    ///
    /// Mutations made afterwards update memory only.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }

    pub fn stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Apply a mutation under the lock, then queue a write.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoredData) -> R) -> R {
        let result = {
            let mut data = self.state.lock();
            f(&mut data)
        };
        self.writer.enqueue(&self.state);
        result
    }
}

impl Store for KubernetesStore {
    fn get_account(&self) -> Option<Account> {
        self.state.lock().account.clone()
    }

    fn save_account(&self, account: Account) {
        debug!(email = %account.email, "Saving ACME account");
        self.mutate(|data| data.account = Some(account));
    }

    fn get_certificates(&self) -> Vec<Certificate> {
        self.state.lock().certificates.clone()
    }

    fn save_certificates(&self, certificates: Vec<Certificate>) {
        debug!(count = certificates.len(), "Saving certificates");
        self.mutate(|data| data.certificates = certificates);
    }

    fn get_http_challenge_token(&self, token: &str, domain: &str) -> StoreResult<Vec<u8>> {
        let data = self.state.lock();
        let key_auth = data
            .http_challenges
            .get(token)
            .and_then(|domains| domains.get(domain))
            .cloned();

        match key_auth {
            Some(key_auth) => {
                trace!(token = %token, domain = %domain, "HTTP-01 challenge found");
                Ok(key_auth)
            }
            None => {
                trace!(token = %token, domain = %domain, "HTTP-01 challenge not found");
                Err(StoreError::ChallengeNotFound {
                    token: token.to_string(),
                    domain: domain.to_string(),
                })
            }
        }
    }

    fn set_http_challenge_token(&self, token: &str, domain: &str, key_auth: Vec<u8>) {
        debug!(token = %token, domain = %domain, "Registering HTTP-01 challenge");
        self.mutate(|data| {
            data.http_challenges
                .entry(token.to_string())
                .or_default()
                .insert(domain.to_string(), key_auth);
        });
    }

    fn remove_http_challenge_token(&self, token: &str, domain: &str) {
        // An emptied token map is kept until the state is reloaded
        let removed = self.mutate(|data| {
            data.http_challenges
                .get_mut(token)
                .and_then(|domains| domains.remove(domain))
                .is_some()
        });
        if removed {
            debug!(token = %token, domain = %domain, "Removed HTTP-01 challenge");
        }
    }

    fn add_tls_challenge(&self, domain: &str, certificate: Certificate) {
        debug!(domain = %domain, "Registering TLS-ALPN-01 challenge");
        self.mutate(|data| {
            data.tls_challenges.insert(domain.to_string(), certificate);
        });
    }

    fn get_tls_challenge(&self, domain: &str) -> Option<Certificate> {
        self.state.lock().tls_challenges.get(domain).cloned()
    }

    fn remove_tls_challenge(&self, domain: &str) {
        // Persisted like every other mutation so a restart does not revive it
        let removed = self.mutate(|data| data.tls_challenges.remove(domain).is_some());
        if removed {
            debug!(domain = %domain, "Removed TLS-ALPN-01 challenge");
        }
    }
}

async fn load(backend: &dyn SecretBackend, target: &SecretTarget) -> StoreResult<StoredData> {
    let secret = match backend.get(&target.namespace, &target.name).await {
        Ok(secret) => secret,
        Err(BackendError::NotFound { .. }) => {
            info!(
                namespace = %target.namespace,
                name = %target.name,
                "No ACME storage secret found, starting with empty state"
            );
            return Ok(StoredData::default());
        }
        Err(e) => return Err(e.into()),
    };

    let Some(payload) = secret.data.get(STORAGE_KEY) else {
        warn!(
            namespace = %target.namespace,
            name = %target.name,
            key = STORAGE_KEY,
            "ACME storage secret has no state field, starting with empty state"
        );
        return Ok(StoredData::default());
    };

    let data = codec::decode(payload)?;
    info!(
        namespace = %target.namespace,
        name = %target.name,
        has_account = data.account.is_some(),
        certificates = data.certificates.len(),
        http_challenges = data.http_challenges.len(),
        tls_challenges = data.tls_challenges.len(),
        "Loaded ACME state"
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, MemoryBackend, Secret};
    use crate::types::Domain;
    use proptest::prelude::*;

    fn config() -> StoreConfig {
        StoreConfig::for_namespace("ingress")
    }

    async fn empty_store() -> (MemoryBackend, KubernetesStore) {
        let backend = MemoryBackend::new();
        let store = KubernetesStore::new(&config(), backend.clone()).await.unwrap();
        (backend, store)
    }

    fn certificate(domain: &str, marker: &[u8]) -> Certificate {
        Certificate {
            domain: Domain::new(domain),
            certificate: marker.to_vec(),
            key: b"key".to_vec(),
        }
    }

    fn persisted(backend: &MemoryBackend) -> StoredData {
        let secret = backend.secret("ingress", "acme-storage").unwrap();
        codec::decode(&secret.data[STORAGE_KEY]).unwrap()
    }

    #[tokio::test]
    async fn test_http_challenge_set_get() {
        let (_backend, store) = empty_store().await;

        store.set_http_challenge_token("tok", "example.com", b"tok.thumb".to_vec());
        assert_eq!(
            store.get_http_challenge_token("tok", "example.com").unwrap(),
            b"tok.thumb"
        );
    }

    #[tokio::test]
    async fn test_http_challenge_not_found() {
        let (_backend, store) = empty_store().await;

        let err = store.get_http_challenge_token("missing", "example.com").unwrap_err();
        assert!(matches!(err, StoreError::ChallengeNotFound { .. }));

        store.set_http_challenge_token("tok", "example.com", b"auth".to_vec());
        let err = store.get_http_challenge_token("tok", "other.com").unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_http_challenge_multiple_domains() {
        let (_backend, store) = empty_store().await;

        store.set_http_challenge_token("tok", "a.com", b"one".to_vec());
        store.set_http_challenge_token("tok", "b.com", b"two".to_vec());
        store.set_http_challenge_token("tok", "a.com", b"three".to_vec());

        assert_eq!(store.get_http_challenge_token("tok", "a.com").unwrap(), b"three");
        assert_eq!(store.get_http_challenge_token("tok", "b.com").unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_http_challenge_remove() {
        let (_backend, store) = empty_store().await;

        store.set_http_challenge_token("tok", "example.com", b"auth".to_vec());
        store.remove_http_challenge_token("tok", "example.com");
        assert!(store.get_http_challenge_token("tok", "example.com").is_err());

        // Absent pairs are a no-op
        store.remove_http_challenge_token("tok", "example.com");
        store.remove_http_challenge_token("never", "example.com");

        // The emptied token map is kept
        assert!(store.snapshot().http_challenges["tok"].is_empty());
    }

    #[tokio::test]
    async fn test_tls_challenge_lifecycle() {
        let (backend, store) = empty_store().await;
        assert!(store.get_tls_challenge("example.com").is_none());

        let cert = certificate("example.com", b"alpn");
        store.add_tls_challenge("example.com", cert.clone());
        store.add_tls_challenge("example.com", cert.clone());
        assert_eq!(store.get_tls_challenge("example.com"), Some(cert));

        store.flush().await;
        assert!(persisted(&backend).tls_challenges.contains_key("example.com"));

        store.remove_tls_challenge("example.com");
        store.remove_tls_challenge("example.com");
        assert!(store.get_tls_challenge("example.com").is_none());

        store.flush().await;
        assert!(persisted(&backend).tls_challenges.is_empty());
    }

    #[tokio::test]
    async fn test_save_certificates_replaces() {
        let (_backend, store) = empty_store().await;

        store.save_certificates(vec![certificate("a.com", b"a"), certificate("b.com", b"b")]);
        store.save_certificates(vec![certificate("c.com", b"c")]);

        let certs = store.get_certificates();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].domain.main, "c.com");
    }

    #[tokio::test]
    async fn test_every_mutation_is_queued() {
        let (backend, store) = empty_store().await;

        store.save_account(Account::default());
        store.save_certificates(Vec::new());
        store.set_http_challenge_token("t", "d", b"k".to_vec());
        store.remove_http_challenge_token("t", "d");
        store.add_tls_challenge("d", certificate("d", b"c"));
        store.remove_tls_challenge("d");
        store.flush().await;

        let stats = store.stats();
        assert_eq!(stats.submitted, 6);
        assert_eq!(stats.processed, 6);
        assert_eq!(stats.failed, 0);
        assert_eq!(backend.ops().len(), 6);

        // Reads never queue
        store.get_account();
        store.get_certificates();
        let _ = store.get_http_challenge_token("t", "d");
        store.get_tls_challenge("d");
        assert_eq!(store.stats().submitted, 6);
    }

    #[tokio::test]
    async fn test_failed_write_self_heals() {
        let (backend, store) = empty_store().await;
        backend.fail_next_writes(1);

        store.save_account(Account {
            email: "first@example.com".to_string(),
            ..Default::default()
        });
        store.flush().await;
        assert!(backend.secret("ingress", "acme-storage").is_none());
        assert_eq!(store.get_account().unwrap().email, "first@example.com");

        store.set_http_challenge_token("tok", "example.com", b"auth".to_vec());
        store.flush().await;

        let data = persisted(&backend);
        assert_eq!(data.account.unwrap().email, "first@example.com");
        assert_eq!(data.http_challenges["tok"]["example.com"], b"auth");
    }

    #[tokio::test]
    async fn test_load_existing_state() {
        let backend = MemoryBackend::new();
        let mut data = StoredData::default();
        data.certificates.push(certificate("example.com", b"cert"));
        backend.insert(Secret::opaque(
            "ingress",
            "acme-storage",
            STORAGE_KEY,
            codec::encode(&data).unwrap(),
        ));

        let store = KubernetesStore::new(&config(), backend.clone()).await.unwrap();
        assert_eq!(store.get_certificates(), data.certificates);

        // The secret exists, so the next write is an update
        store.save_account(Account::default());
        store.flush().await;
        assert!(matches!(backend.ops()[0], BackendOp::Update(_)));
    }

    #[tokio::test]
    async fn test_load_corrupt_payload_fails() {
        let backend = MemoryBackend::new();
        backend.insert(Secret::opaque(
            "ingress",
            "acme-storage",
            STORAGE_KEY,
            b"{ definitely not json".to_vec(),
        ));

        let err = KubernetesStore::new(&config(), backend).await.err().unwrap();
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[tokio::test]
    async fn test_load_backend_failure_fails() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);

        let err = KubernetesStore::new(&config(), backend).await.err().unwrap();
        assert!(matches!(err, StoreError::Backend(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_load_secret_without_state_field() {
        let backend = MemoryBackend::new();
        backend.insert(Secret::opaque("ingress", "acme-storage", "other", b"x".to_vec()));

        let store = KubernetesStore::new(&config(), backend).await.unwrap();
        assert_eq!(store.snapshot(), StoredData::default());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = KubernetesStore::new(&StoreConfig::for_namespace(""), MemoryBackend::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_do_not_lose_updates() {
        let (backend, store) = empty_store().await;
        let store = Arc::new(store);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.set_http_challenge_token(
                        &format!("token-{}", i),
                        "example.com",
                        format!("auth-{}", i).into_bytes(),
                    );
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..32 {
            assert_eq!(
                store
                    .get_http_challenge_token(&format!("token-{}", i), "example.com")
                    .unwrap(),
                format!("auth-{}", i).into_bytes()
            );
        }

        store.flush().await;
        assert_eq!(persisted(&backend).http_challenges.len(), 32);
        assert!(backend.ops().len() <= 32);
    }

    #[test]
    fn test_set_then_get_returns_key_auth() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let store = runtime
            .block_on(KubernetesStore::new(&config(), MemoryBackend::new()))
            .unwrap();

        proptest!(|(
            token in "[A-Za-z0-9_-]{1,43}",
            domain in "[a-z0-9]{1,20}(\\.[a-z]{2,6}){1,2}",
            key_auth in proptest::collection::vec(any::<u8>(), 0..128),
        )| {
            store.set_http_challenge_token(&token, &domain, key_auth.clone());
            prop_assert_eq!(store.get_http_challenge_token(&token, &domain).unwrap(), key_auth);
        });
    }
}
