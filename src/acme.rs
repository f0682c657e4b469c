//! ACME issuing service
//!
//! Drives RFC 8555 issuance through `instant-acme`: account management,
//! order lifecycle, and HTTP-01 validation via the shared
//! [`ChallengeResponder`]. Successful issuances are written straight into
//! the certificate store, which (wrapped in the marathon-lb signalling
//! store) is what triggers the HAProxy reload.
//!
//! Account state is persisted through [`AccountStore`] so restarts reuse
//! the existing registration instead of creating a new account on every
//! boot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus, RetryPolicy,
};
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::cert::{CertError, CertificateBundle};
use crate::clients::VaultClient;
use crate::responder::ChallengeResponder;
use crate::store::{CertificateStore, StoreError};

/// How often the background renewal sweep re-examines stored certificates.
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors produced by the ACME issuing service.
#[derive(Error, Debug)]
pub enum AcmeError {
    /// Account registration or persisted-state failure
    #[error("ACME account error: {0}")]
    Account(String),

    /// An order could not be driven to completion
    #[error("ACME order for '{domain}' failed: {reason}")]
    Order {
        /// The domain being issued
        domain: String,
        /// Why the order failed
        reason: String,
    },

    /// The ACME server rejected our challenge response
    #[error("ACME validation failed for '{domain}': {detail}")]
    Validation {
        /// The domain being validated
        domain: String,
        /// Server-reported problem detail
        detail: String,
    },

    /// Lower-level ACME protocol failure
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// The certificate store rejected the issued bundle
    #[error("certificate store error: {0}")]
    Store(#[from] StoreError),

    /// The issued certificate material could not be parsed
    #[error("certificate data error: {0}")]
    Cert(#[from] CertError),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

/// Capability interface over certificate issuance.
///
/// The reconciler only needs these two operations; tests substitute a fake
/// that records issue calls instead of talking to an ACME directory.
#[async_trait]
pub trait AcmeIssuer: Send + Sync {
    /// Issue a certificate for `domain` and store it.
    async fn issue(&self, domain: &str) -> Result<(), AcmeError>;

    /// Resolve once the service is registered and ready to issue.
    async fn when_ready(&self) -> Result<(), AcmeError>;

    /// Re-issue any stored certificate nearing expiry. Returns the renewed
    /// names. The default implementation renews nothing.
    async fn check_renewals(&self) -> Result<Vec<String>, AcmeError> {
        Ok(Vec::new())
    }
}

/// Persistence for the serialized ACME account credentials.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Load the stored credentials JSON, if any.
    async fn load(&self) -> Result<Option<String>, AcmeError>;

    /// Persist the credentials JSON.
    async fn save(&self, credentials_json: &str) -> Result<(), AcmeError>;
}

/// Account state in a file (`client.key` in the storage root).
pub struct FileAccountStore {
    path: PathBuf,
}

impl FileAccountStore {
    /// Use `client.key` under the given storage root.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            path: storage_root.into().join("client.key"),
        }
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn load(&self) -> Result<Option<String>, AcmeError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AcmeError::Account(format!(
                "could not read account state from {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, credentials_json: &str) -> Result<(), AcmeError> {
        tokio::fs::write(&self.path, credentials_json)
            .await
            .map_err(|e| {
                AcmeError::Account(format!(
                    "could not write account state to {}: {}",
                    self.path.display(),
                    e
                ))
            })
    }
}

/// Account state in Vault (the `client_key` entry on the KV mount).
pub struct VaultAccountStore {
    client: VaultClient,
    mount: String,
}

impl VaultAccountStore {
    /// Use the `client_key` entry on the given mount.
    pub fn new(client: VaultClient, mount: impl Into<String>) -> Self {
        Self {
            client,
            mount: mount.into(),
        }
    }
}

#[async_trait]
impl AccountStore for VaultAccountStore {
    async fn load(&self) -> Result<Option<String>, AcmeError> {
        let read = self
            .client
            .read_kv2(&self.mount, "client_key")
            .await
            .map_err(|e| AcmeError::Account(e.to_string()))?;
        Ok(read.and_then(|r| r.data.data.get("credentials").cloned()))
    }

    async fn save(&self, credentials_json: &str) -> Result<(), AcmeError> {
        self.client
            .create_or_update_kv2(
                &self.mount,
                "client_key",
                json!({ "credentials": credentials_json }),
                None,
            )
            .await
            .map_err(|e| AcmeError::Account(e.to_string()))?;
        Ok(())
    }
}

/// The concrete issuing service over `instant-acme`.
pub struct AcmeIssuingService {
    directory_url: String,
    contact_email: Option<String>,
    store: Arc<dyn CertificateStore>,
    responder: Arc<dyn ChallengeResponder>,
    account_store: Arc<dyn AccountStore>,
    account: OnceCell<Account>,
    renewal_days: u32,
}

impl AcmeIssuingService {
    /// Create the service. `store` should be the marathon-lb signalling
    /// store so issued certificates trigger a reload; `renewal_days` is the
    /// lead time for the renewal sweep.
    pub fn new(
        directory_url: String,
        contact_email: Option<String>,
        store: Arc<dyn CertificateStore>,
        responder: Arc<dyn ChallengeResponder>,
        account_store: Arc<dyn AccountStore>,
        renewal_days: u32,
    ) -> Self {
        Self {
            directory_url,
            contact_email,
            store,
            responder,
            account_store,
            account: OnceCell::new(),
            renewal_days,
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_register())
            .await
    }

    /// Load the persisted account or register a new one, saving its
    /// credentials for the next start.
    async fn load_or_register(&self) -> Result<Account, AcmeError> {
        if let Some(stored) = self.account_store.load().await? {
            let credentials: AccountCredentials =
                serde_json::from_str(&stored).map_err(|e| {
                    AcmeError::Account(format!("stored account credentials are corrupt: {}", e))
                })?;
            let account = Account::builder()?.from_credentials(credentials).await?;
            info!("Using existing ACME account");
            return Ok(account);
        }

        let contact: Vec<String> = self
            .contact_email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &contact_refs,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;

        let credentials_json = serde_json::to_string(&credentials)
            .map_err(|e| AcmeError::Account(e.to_string()))?;
        self.account_store.save(&credentials_json).await?;
        info!(directory = %self.directory_url, "Registered new ACME account");
        Ok(account)
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::new()
            .initial_delay(Duration::from_secs(1))
            .backoff(1.5)
            .timeout(Duration::from_secs(90))
    }

    /// Drive an order to a downloaded certificate. Published challenge
    /// tokens are appended to `published` so the caller can withdraw them
    /// whether or not the order succeeds.
    async fn drive_order(
        &self,
        order: &mut Order,
        domain: &str,
        published: &mut Vec<String>,
    ) -> Result<(String, String), AcmeError> {
        match order.state().status {
            OrderStatus::Pending => {
                let mut authorizations = order.authorizations();
                while let Some(result) = authorizations.next().await {
                    let mut authz = result?;
                    match authz.status {
                        AuthorizationStatus::Pending => {}
                        AuthorizationStatus::Valid => continue,
                        status => {
                            warn!(
                                domain = %domain,
                                status = ?status,
                                "Skipping authorization in unexpected status"
                            );
                            continue;
                        }
                    }

                    let mut challenge = authz
                        .challenge(ChallengeType::Http01)
                        .ok_or_else(|| AcmeError::Order {
                            domain: domain.to_string(),
                            reason: "no HTTP-01 challenge offered".to_string(),
                        })?;

                    let token = challenge.token.clone();
                    let key_authorization = challenge.key_authorization();
                    self.responder
                        .start_responding(&token, key_authorization.as_str())
                        .await;
                    published.push(token);

                    challenge.set_ready().await?;
                }

                let status = order.poll_ready(&Self::retry_policy()).await?;
                if status != OrderStatus::Ready {
                    let detail = validation_failure_detail(order).await;
                    return Err(AcmeError::Validation {
                        domain: domain.to_string(),
                        detail,
                    });
                }
            }
            // Cached valid authorizations can make a fresh order Ready.
            OrderStatus::Ready => {}
            status => {
                return Err(AcmeError::Order {
                    domain: domain.to_string(),
                    reason: format!("unexpected order status {:?}", status),
                });
            }
        }

        let private_key_pem = order.finalize().await?;
        let chain_pem = order.poll_certificate(&Self::retry_policy()).await?;
        Ok((private_key_pem, chain_pem))
    }
}

#[async_trait]
impl AcmeIssuer for AcmeIssuingService {
    async fn when_ready(&self) -> Result<(), AcmeError> {
        self.account().await.map(|_| ())
    }

    async fn issue(&self, domain: &str) -> Result<(), AcmeError> {
        let account = self.account().await?;
        info!(domain = %domain, "Requesting certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut published = Vec::new();
        let outcome = self.drive_order(&mut order, domain, &mut published).await;
        for token in &published {
            self.responder.stop_responding(token).await;
        }
        let (private_key_pem, chain_pem) = outcome?;

        let bundle = CertificateBundle::new(private_key_pem, &chain_pem)?;
        self.store.store(domain, bundle).await?;
        info!(domain = %domain, "Certificate issued and stored");
        Ok(())
    }

    /// Re-issue every stored certificate whose leaf expires within the
    /// configured lead time. Per-domain failures are logged and skipped so
    /// one stuck renewal cannot block the rest.
    async fn check_renewals(&self) -> Result<Vec<String>, AcmeError> {
        let certs = self.store.as_dict().await?;
        let mut names: Vec<String> = certs.keys().cloned().collect();
        names.sort();

        let lead = chrono::Duration::days(i64::from(self.renewal_days));
        let now = Utc::now();
        let mut renewed = Vec::new();

        for name in names {
            let not_after = match certs[&name].not_after() {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        domain = %name,
                        error = %e,
                        "Could not determine certificate expiry, skipping"
                    );
                    continue;
                }
            };
            if not_after - now > lead {
                continue;
            }

            info!(
                domain = %name,
                expires = %not_after,
                "Certificate is within the renewal window, reissuing"
            );
            match self.issue(&name).await {
                Ok(()) => renewed.push(name),
                Err(e) => {
                    error!(domain = %name, error = %e, "Failed to renew certificate");
                }
            }
        }

        Ok(renewed)
    }
}

/// Fish the first HTTP-01 problem detail out of an order's authorizations
/// after a failed validation.
async fn validation_failure_detail(order: &mut Order) -> String {
    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        if let Ok(authz) = result {
            for challenge in &authz.challenges {
                if challenge.r#type == ChallengeType::Http01 {
                    if let Some(ref error) = challenge.error {
                        return error
                            .detail
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string());
                    }
                }
            }
        }
    }
    "order did not become ready".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_account_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileAccountStore::new(dir.path());

        assert_eq!(store.load().await.unwrap(), None);
        store.save(r#"{"id":"acct"}"#).await.unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            Some(r#"{"id":"acct"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_file_account_store_path_is_client_key() {
        let dir = TempDir::new().unwrap();
        let store = FileAccountStore::new(dir.path());
        store.save("state").await.unwrap();
        assert!(dir.path().join("client.key").exists());
    }

    #[test]
    fn test_validation_error_display() {
        let error = AcmeError::Validation {
            domain: "example.com".to_string(),
            detail: "connection refused".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("example.com"));
        assert!(msg.contains("connection refused"));
    }
}
