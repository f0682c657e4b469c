//! Certificate stores
//!
//! [`CertificateStore`] is the capability interface between the ACME
//! issuing service, the reconciler, and persistence: get a bundle by name,
//! store one durably, or snapshot everything. Two implementations exist — a
//! directory of PEM files ([`dir::DirCertificateStore`]) and a Vault KV v2
//! engine ([`vault::VaultKvCertificateStore`]) — plus
//! [`MlbCertificateStore`], a wrapper that signals marathon-lb after every
//! successful store so HAProxy picks up new certificates.

pub mod dir;
pub mod vault;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::cert::{CertError, CertificateBundle};
use crate::clients::{MarathonLbClient, VaultError};

pub use dir::DirCertificateStore;
pub use vault::{LiveEntry, VaultKvCertificateStore};

/// Errors produced by certificate stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No certificate is stored under the given name
    #[error("no certificate stored for '{0}'")]
    NotFound(String),

    /// The name is not usable as a storage key
    #[error("invalid certificate name '{0}'")]
    InvalidName(String),

    /// A stored entry exists but cannot be interpreted
    #[error("malformed certificate entry for '{name}': {reason}")]
    Malformed {
        /// The certificate name
        name: String,
        /// Why the entry was rejected
        reason: String,
    },

    /// Filesystem failure in the directory store
    #[error("certificate store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Vault failure in the Vault store
    #[error("Vault store error: {0}")]
    Vault(#[from] VaultError),

    /// Certificate material could not be parsed or serialized
    #[error("certificate data error: {0}")]
    Cert(#[from] CertError),

    /// The post-store load balancer signal failed
    #[error("load balancer signal failed: {0}")]
    LbSignal(String),
}

/// Capability interface over certificate persistence.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Fetch the bundle stored under `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no certificate exists for the name.
    async fn get(&self, name: &str) -> Result<CertificateBundle, StoreError>;

    /// Store `bundle` under `name`. The write is durable before this
    /// returns.
    async fn store(&self, name: &str, bundle: CertificateBundle) -> Result<(), StoreError>;

    /// Snapshot all stored certificates. Order is not significant.
    async fn as_dict(&self) -> Result<HashMap<String, CertificateBundle>, StoreError>;
}

/// A store wrapper that signals marathon-lb after every successful store.
///
/// marathon-lb re-reads its certificates on USR1, so a reload is required
/// each time a certificate changes. The signal is sent only after the
/// wrapped store has durably returned, and a signal failure fails the
/// store call so the next sync retries.
pub struct MlbCertificateStore {
    inner: Arc<dyn CertificateStore>,
    mlb: Arc<MarathonLbClient>,
}

impl MlbCertificateStore {
    /// Wrap `inner`, signalling `mlb` on every successful store.
    pub fn new(inner: Arc<dyn CertificateStore>, mlb: Arc<MarathonLbClient>) -> Self {
        Self { inner, mlb }
    }
}

#[async_trait]
impl CertificateStore for MlbCertificateStore {
    async fn get(&self, name: &str) -> Result<CertificateBundle, StoreError> {
        self.inner.get(name).await
    }

    async fn store(&self, name: &str, bundle: CertificateBundle) -> Result<(), StoreError> {
        self.inner.store(name, bundle).await?;
        debug!(domain = %name, "Certificate stored, reloading marathon-lb");
        self.mlb
            .signal_usr1()
            .await
            .map_err(|e| StoreError::LbSignal(e.to_string()))?;
        Ok(())
    }

    async fn as_dict(&self) -> Result<HashMap<String, CertificateBundle>, StoreError> {
        self.inner.as_dict().await
    }
}
