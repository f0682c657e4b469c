//! Vault-backed certificate store
//!
//! Certificates live at `certificates/<domain>` in a KV v2 engine; a single
//! `live` entry maps each managed domain to the version, fingerprint, and
//! DNS names of its authoritative certificate entry. marathon-lb sidecars
//! watch the live mapping, so two invariants must hold after every
//! successful store:
//!
//! - the live entry's `version` equals the backend version of
//!   `certificates/<domain>`;
//! - every domain in the live mapping has a readable certificate entry.
//!
//! Concurrent writers are coordinated through Vault's check-and-set: the
//! certificate entry is written first (the caller is authoritative for that
//! name at that moment), then the live mapping is updated under CAS, with a
//! version guard so a writer that lost the race never downgrades an entry.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::cert::{encode_pem, CertificateBundle};
use crate::clients::{VaultClient, VaultError};
use crate::store::{CertificateStore, StoreError};

const LIVE_PATH: &str = "live";

/// One entry of the live mapping: which certificate version is
/// authoritative for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    /// Backend-assigned version of the `certificates/<domain>` entry
    pub version: u64,
    /// Lowercase hex SHA-256 fingerprint of the DER leaf
    pub fingerprint: String,
    /// DNS names the certificate covers
    pub dns_names: Vec<String>,
}

/// A certificate store over a Vault KV v2 secret engine.
pub struct VaultKvCertificateStore {
    client: VaultClient,
    mount: String,
}

impl VaultKvCertificateStore {
    /// Create a store using the given client and KV v2 mount path.
    pub fn new(client: VaultClient, mount: impl Into<String>) -> Self {
        Self {
            client,
            mount: mount.into(),
        }
    }

    fn certificate_path(name: &str) -> String {
        format!("certificates/{}", name)
    }

    /// Update the live mapping for `name` under check-and-set, retrying on
    /// version races until the write lands or another writer has advanced
    /// the entry past ours.
    async fn update_live(&self, name: &str, entry: LiveEntry) -> Result<(), StoreError> {
        loop {
            let live = self.client.read_kv2(&self.mount, LIVE_PATH).await?;
            let (mut entries, live_version) = decode_live(live)?;

            let existing_version = entries.get(name).map(|e| e.version).unwrap_or(0);
            if existing_version >= entry.version {
                debug!(
                    domain = %name,
                    existing = existing_version,
                    ours = entry.version,
                    "Live mapping already at or past our version, not downgrading"
                );
                return Ok(());
            }

            entries.insert(name.to_string(), entry.clone());
            let data = encode_live(&entries)?;

            match self
                .client
                .create_or_update_kv2(&self.mount, LIVE_PATH, data, Some(live_version))
                .await
            {
                Ok(_) => return Ok(()),
                Err(VaultError::CasMismatch(msg)) => {
                    debug!(
                        domain = %name,
                        error = %msg,
                        "Live mapping version changed underneath us, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl CertificateStore for VaultKvCertificateStore {
    /// Read `certificates/<name>` directly; the live mapping is not
    /// consulted.
    async fn get(&self, name: &str) -> Result<CertificateBundle, StoreError> {
        let read = self
            .client
            .read_kv2(&self.mount, &Self::certificate_path(name))
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let data = read.data.data;
        let field = |key: &str| {
            data.get(key).cloned().ok_or_else(|| StoreError::Malformed {
                name: name.to_string(),
                reason: format!("missing '{}' field", key),
            })
        };
        let privkey = field("privkey")?;
        let cert = field("cert")?;
        let chain = field("chain")?;

        let chain_pems = pem::parse_many(&chain).map_err(|e| StoreError::Malformed {
            name: name.to_string(),
            reason: format!("undecodable chain: {}", e),
        })?;
        let chain_pem: Vec<String> = chain_pems.iter().map(encode_pem).collect();

        Ok(CertificateBundle::from_parts(privkey, cert, chain_pem))
    }

    async fn store(&self, name: &str, bundle: CertificateBundle) -> Result<(), StoreError> {
        // Write the certificate entry first, without CAS: whoever is
        // issuing for this name right now is authoritative for it.
        let data = json!({
            "privkey": bundle.private_key_pem,
            "cert": bundle.cert_pem,
            "chain": bundle.chain_pem.concat(),
        });
        let written = self
            .client
            .create_or_update_kv2(&self.mount, &Self::certificate_path(name), data, None)
            .await?;
        debug!(
            domain = %name,
            version = written.version,
            "Certificate entry written, updating live mapping"
        );

        let entry = LiveEntry {
            version: written.version,
            fingerprint: bundle.fingerprint()?,
            dns_names: bundle.dns_names()?,
        };
        self.update_live(name, entry).await
    }

    /// Read the live mapping, then each referenced certificate in series
    /// so a large mapping does not hammer Vault with parallel reads.
    async fn as_dict(&self) -> Result<HashMap<String, CertificateBundle>, StoreError> {
        let live = self.client.read_kv2(&self.mount, LIVE_PATH).await?;
        let (entries, _) = decode_live(live)?;

        let mut certs = HashMap::new();
        for (name, entry) in entries {
            match self.get(&name).await {
                Ok(bundle) => {
                    match bundle.fingerprint() {
                        Ok(fingerprint) if fingerprint != entry.fingerprint => {
                            warn!(
                                domain = %name,
                                "Stored certificate fingerprint does not match the live mapping"
                            );
                        }
                        _ => {}
                    }
                    certs.insert(name, bundle);
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(
                        domain = %name,
                        "Live mapping references a missing certificate entry"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(certs)
    }
}

/// Decode a live-mapping read into entries plus the mapping's own version.
fn decode_live(
    read: Option<crate::clients::vault::Kv2Read>,
) -> Result<(BTreeMap<String, LiveEntry>, u64), StoreError> {
    let Some(read) = read else {
        return Ok((BTreeMap::new(), 0));
    };

    let version = read.data.metadata.version;
    let mut entries = BTreeMap::new();
    for (name, value) in read.data.data {
        let entry: LiveEntry =
            serde_json::from_str(&value).map_err(|e| StoreError::Malformed {
                name: name.clone(),
                reason: format!("undecodable live entry: {}", e),
            })?;
        entries.insert(name, entry);
    }
    Ok((entries, version))
}

/// Encode live entries as KV v2 data: each value a JSON-encoded string.
fn encode_live(entries: &BTreeMap<String, LiveEntry>) -> Result<serde_json::Value, StoreError> {
    let mut data = serde_json::Map::new();
    for (name, entry) in entries {
        let encoded = serde_json::to_string(entry).map_err(|e| StoreError::Malformed {
            name: name.clone(),
            reason: format!("unencodable live entry: {}", e),
        })?;
        data.insert(name.clone(), serde_json::Value::String(encoded));
    }
    Ok(serde_json::Value::Object(data))
}
