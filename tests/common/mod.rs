//! Shared helpers for integration tests: throwaway certificate bundles and
//! a fake ACME issuer that stores bundles like the real service would.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use marathon_acme::acme::{AcmeError, AcmeIssuer};
use marathon_acme::cert::CertificateBundle;
use marathon_acme::store::CertificateStore;

/// Issue a self-signed test certificate bundle for a domain.
#[allow(dead_code)]
pub fn test_bundle(domain: &str) -> CertificateBundle {
    let key = rcgen::KeyPair::generate().expect("failed to generate key");
    let params =
        rcgen::CertificateParams::new(vec![domain.to_string()]).expect("invalid test domain");
    let cert = params.self_signed(&key).expect("failed to self-sign");
    CertificateBundle::new(key.serialize_pem(), &cert.pem()).expect("failed to build bundle")
}

/// A fake issuer that records issue calls and stores a self-signed bundle
/// through the injected store, mirroring the real service's store-on-issue
/// behavior (and therefore its LB-signal side effect).
#[allow(dead_code)]
pub struct FakeAcmeIssuer {
    store: Arc<dyn CertificateStore>,
    issued: Mutex<Vec<String>>,
    fail_domains: HashSet<String>,
}

#[allow(dead_code)]
impl FakeAcmeIssuer {
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self {
            store,
            issued: Mutex::new(Vec::new()),
            fail_domains: HashSet::new(),
        }
    }

    /// Make issuance fail for the given domain.
    pub fn failing_for(mut self, domain: &str) -> Self {
        self.fail_domains.insert(domain.to_string());
        self
    }

    /// The domains `issue` was called for, in call order.
    pub async fn issued(&self) -> Vec<String> {
        self.issued.lock().await.clone()
    }
}

#[async_trait]
impl AcmeIssuer for FakeAcmeIssuer {
    async fn issue(&self, domain: &str) -> Result<(), AcmeError> {
        self.issued.lock().await.push(domain.to_string());
        if self.fail_domains.contains(domain) {
            return Err(AcmeError::Validation {
                domain: domain.to_string(),
                detail: "injected failure".to_string(),
            });
        }
        self.store.store(domain, test_bundle(domain)).await?;
        Ok(())
    }

    async fn when_ready(&self) -> Result<(), AcmeError> {
        Ok(())
    }
}
