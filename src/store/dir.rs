//! Directory-backed certificate store
//!
//! Stores each certificate as a single PEM file (key, leaf, chain
//! concatenated) under `<storage>/certs/<domain>.pem`. The storage root
//! also carries `client.key` and `default.pem`, which live outside the
//! `certs/` directory and are never enumerated here.
//!
//! Writes go to a temporary file in the same directory, are fsynced, and
//! are renamed into place, so a crash never leaves a torn bundle behind.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::cert::{encode_pem, CertError, CertificateBundle};
use crate::store::{CertificateStore, StoreError};

/// A certificate store over a local directory of PEM bundles.
pub struct DirCertificateStore {
    certs_dir: PathBuf,
}

impl DirCertificateStore {
    /// Open (creating if needed) the `certs/` directory under
    /// `storage_root`.
    pub fn new(storage_root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let certs_dir = storage_root.into().join("certs");
        std::fs::create_dir_all(&certs_dir)?;
        Ok(Self { certs_dir })
    }

    fn bundle_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        // Domain names never contain path separators; anything that does is
        // not a name we ever issued.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.certs_dir.join(format!("{}.pem", name)))
    }

    fn parse_bundle(content: &str) -> Result<CertificateBundle, CertError> {
        let pems = pem::parse_many(content)?;
        let key = pems
            .iter()
            .find(|p| p.tag().contains("PRIVATE KEY"))
            .map(encode_pem)
            .ok_or(CertError::MissingKey)?;
        let certs: String = pems
            .iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(encode_pem)
            .collect();
        CertificateBundle::new(key, &certs)
    }
}

#[async_trait]
impl CertificateStore for DirCertificateStore {
    async fn get(&self, name: &str) -> Result<CertificateBundle, StoreError> {
        let path = self.bundle_path(name)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse_bundle(&content).map_err(|e| StoreError::Malformed {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn store(&self, name: &str, bundle: CertificateBundle) -> Result<(), StoreError> {
        let path = self.bundle_path(name)?;
        let tmp_path = self.certs_dir.join(format!("{}.pem.tmp", name));

        let content = format!("{}{}", bundle.private_key_pem, bundle.full_chain_pem());

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn as_dict(&self) -> Result<HashMap<String, CertificateBundle>, StoreError> {
        let mut certs = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.certs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match self.get(name).await {
                Ok(bundle) => {
                    certs.insert(name.to_string(), bundle);
                }
                Err(e) => {
                    warn!(
                        domain = %name,
                        error = %e,
                        "Skipping unreadable certificate bundle"
                    );
                }
            }
        }

        Ok(certs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_bundle(domain: &str) -> CertificateBundle {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        CertificateBundle::new(key.serialize_pem(), &cert.pem()).unwrap()
    }

    #[tokio::test]
    async fn test_store_then_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DirCertificateStore::new(dir.path()).unwrap();

        let bundle = test_bundle("example.com");
        store.store("example.com", bundle.clone()).await.unwrap();

        let loaded = store.get("example.com").await.unwrap();
        assert_eq!(loaded.cert_pem, bundle.cert_pem);
        assert_eq!(loaded.private_key_pem, bundle.private_key_pem);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DirCertificateStore::new(dir.path()).unwrap();

        let result = store.get("missing.example.com").await;
        assert!(matches!(result, Err(StoreError::NotFound(name)) if name == "missing.example.com"));
    }

    #[tokio::test]
    async fn test_as_dict_lists_stored_bundles() {
        let dir = TempDir::new().unwrap();
        let store = DirCertificateStore::new(dir.path()).unwrap();

        store
            .store("a.example.com", test_bundle("a.example.com"))
            .await
            .unwrap();
        store
            .store("b.example.com", test_bundle("b.example.com"))
            .await
            .unwrap();

        let all = store.as_dict().await.unwrap();
        let mut names: Vec<_> = all.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);
    }

    #[tokio::test]
    async fn test_as_dict_skips_unparseable_files() {
        let dir = TempDir::new().unwrap();
        let store = DirCertificateStore::new(dir.path()).unwrap();

        store
            .store("good.example.com", test_bundle("good.example.com"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("certs").join("bad.pem"), "not a pem").unwrap();

        let all = store.as_dict().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good.example.com"));
    }

    #[tokio::test]
    async fn test_path_traversal_names_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DirCertificateStore::new(dir.path()).unwrap();

        let result = store.get("../escape").await;
        assert!(matches!(result, Err(StoreError::InvalidName(_))));
    }
}
