//! Certificate bundle handling
//!
//! A [`CertificateBundle`] is the immutable value passed between the ACME
//! issuing service, the certificate stores, and the reconciler: a private
//! key, an end-entity certificate, and the intermediate chain, all PEM
//! encoded. PEM objects parsed from a concatenated chain are sorted by the
//! CA flag of each certificate's BasicConstraints extension, so the leaf
//! always comes first.
//!
//! Leaf inspection (SAN names, SHA-256 fingerprint, expiry) uses
//! `x509-parser`; the self-signed wildcard bootstrap certificate for
//! HAProxy is produced with `rcgen`.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Errors produced while parsing or generating certificate material.
#[derive(Error, Debug)]
pub enum CertError {
    /// PEM decoding failed
    #[error("PEM parse error: {0}")]
    Pem(#[from] pem::PemError),

    /// DER certificate decoding failed
    #[error("X.509 parse error: {0}")]
    X509(String),

    /// The bundle contains no private key
    #[error("no private key found in PEM bundle")]
    MissingKey,

    /// The bundle contains no end-entity certificate
    #[error("no end-entity certificate found in PEM bundle")]
    MissingLeaf,

    /// The leaf certificate has no DNS subject alternative names
    #[error("certificate has no DNS subject alternative names")]
    NoDnsNames,

    /// Key or certificate generation failed
    #[error("certificate generation error: {0}")]
    Generate(String),
}

/// An issued certificate with its private key and intermediate chain.
///
/// The leaf is stored separately from the chain; [`full_chain_pem`] rejoins
/// them in leaf-first order for consumers that want a single PEM blob.
///
/// [`full_chain_pem`]: CertificateBundle::full_chain_pem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// PEM-encoded private key matching the leaf
    pub private_key_pem: String,
    /// PEM-encoded end-entity certificate
    pub cert_pem: String,
    /// PEM-encoded intermediate certificates, issuer order preserved
    pub chain_pem: Vec<String>,
}

impl CertificateBundle {
    /// Build a bundle from a private key and a concatenated certificate
    /// chain, sorting the certificates by their BasicConstraints CA flag.
    ///
    /// # Errors
    ///
    /// Fails when the chain contains no end-entity certificate, when any
    /// PEM or DER object cannot be parsed, or when the leaf carries no DNS
    /// subject alternative names.
    pub fn new(private_key_pem: String, cert_chain_pem: &str) -> Result<Self, CertError> {
        let pems = pem::parse_many(cert_chain_pem)?;

        let mut leaf: Option<String> = None;
        let mut chain = Vec::new();
        for p in pems {
            if p.tag() != "CERTIFICATE" {
                continue;
            }
            let encoded = encode_pem(&p);
            if leaf.is_none() && !is_ca_certificate(p.contents())? {
                leaf = Some(encoded);
            } else {
                chain.push(encoded);
            }
        }

        let bundle = Self {
            private_key_pem,
            cert_pem: leaf.ok_or(CertError::MissingLeaf)?,
            chain_pem: chain,
        };

        if bundle.dns_names()?.is_empty() {
            return Err(CertError::NoDnsNames);
        }
        Ok(bundle)
    }

    /// Rebuild a bundle from its three stored parts without re-sorting.
    ///
    /// Used by the stores, which persist the leaf and the chain separately
    /// and are trusted to have stored them in order.
    pub fn from_parts(
        private_key_pem: String,
        cert_pem: String,
        chain_pem: Vec<String>,
    ) -> Self {
        Self {
            private_key_pem,
            cert_pem,
            chain_pem,
        }
    }

    /// DER encoding of the leaf certificate.
    pub fn leaf_der(&self) -> Result<Vec<u8>, CertError> {
        let p = pem::parse(&self.cert_pem)?;
        Ok(p.contents().to_vec())
    }

    /// Lowercase hex SHA-256 fingerprint of the DER leaf.
    pub fn fingerprint(&self) -> Result<String, CertError> {
        let der = self.leaf_der()?;
        let digest = Sha256::digest(&der);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Lowercased DNS names from the leaf's SubjectAlternativeName.
    pub fn dns_names(&self) -> Result<Vec<String>, CertError> {
        let der = self.leaf_der()?;
        let (_, cert) =
            X509Certificate::from_der(&der).map_err(|e| CertError::X509(e.to_string()))?;

        let mut names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                if let GeneralName::DNSName(name) = general_name {
                    names.push(name.to_lowercase());
                }
            }
        }
        Ok(names)
    }

    /// Expiry instant of the leaf certificate.
    pub fn not_after(&self) -> Result<DateTime<Utc>, CertError> {
        let der = self.leaf_der()?;
        let (_, cert) =
            X509Certificate::from_der(&der).map_err(|e| CertError::X509(e.to_string()))?;
        let timestamp = cert.validity().not_after.timestamp();
        Utc.timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| CertError::X509("certificate expiry out of range".to_string()))
    }

    /// Leaf plus intermediates as one concatenated PEM string.
    pub fn full_chain_pem(&self) -> String {
        let mut out = self.cert_pem.clone();
        for c in &self.chain_pem {
            out.push_str(c);
        }
        out
    }
}

/// Encode a PEM object with Unix line endings, matching the encoding used
/// by the ACME issuance path and `rcgen`.
pub(crate) fn encode_pem(p: &pem::Pem) -> String {
    pem::encode_config(
        p,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// Whether a DER certificate carries the BasicConstraints CA flag.
fn is_ca_certificate(der: &[u8]) -> Result<bool, CertError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| CertError::X509(e.to_string()))?;
    let ca = cert
        .basic_constraints()
        .map_err(|e| CertError::X509(e.to_string()))?
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    Ok(ca)
}

/// Generate the self-signed wildcard bootstrap PEM used by HAProxy before
/// any real certificate exists: a fresh key pair and a long-lived
/// certificate with subject common name `*`, concatenated key-first.
pub fn generate_wildcard_pem() -> Result<String, CertError> {
    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;

    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "*");

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generate(e.to_string()))?;

    Ok(format!("{}{}", key_pair.serialize_pem(), cert.pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Issue a test certificate for `domains` signed by a throwaway CA.
    /// Returns (key_pem, leaf_pem, ca_pem).
    fn issue_test_cert(domains: &[&str]) -> (String, String, String) {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "marathon-acme test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(
            domains.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        (leaf_key.serialize_pem(), leaf_cert.pem(), ca_cert.pem())
    }

    #[test]
    fn test_new_sorts_leaf_before_ca() {
        let (key, leaf, ca) = issue_test_cert(&["example.com"]);

        // CA first in the input; the bundle must still pick the leaf.
        let chain = format!("{}{}", ca, leaf);
        let bundle = CertificateBundle::new(key, &chain).unwrap();

        assert_eq!(bundle.cert_pem, leaf);
        assert_eq!(bundle.chain_pem, vec![ca]);
    }

    #[test]
    fn test_dns_names_lowercased() {
        let (key, leaf, ca) = issue_test_cert(&["EXAMPLE.com", "www.example.com"]);
        let chain = format!("{}{}", leaf, ca);
        let bundle = CertificateBundle::new(key, &chain).unwrap();

        assert_eq!(
            bundle.dns_names().unwrap(),
            vec!["example.com".to_string(), "www.example.com".to_string()]
        );
    }

    #[test]
    fn test_fingerprint_is_sha256_hex_of_leaf_der() {
        let (key, leaf, ca) = issue_test_cert(&["example.com"]);
        let bundle = CertificateBundle::new(key, &format!("{}{}", leaf, ca)).unwrap();

        let fingerprint = bundle.fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));

        let expected: String = Sha256::digest(pem::parse(&leaf).unwrap().contents())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert_eq!(fingerprint, expected);
    }

    #[test]
    fn test_missing_leaf_rejected() {
        let (key, _leaf, ca) = issue_test_cert(&["example.com"]);
        let result = CertificateBundle::new(key, &ca);
        assert!(matches!(result, Err(CertError::MissingLeaf)));
    }

    #[test]
    fn test_leaf_without_dns_names_rejected() {
        // A self-signed CN-only certificate has no SAN entries.
        let pem_blob = generate_wildcard_pem().unwrap();
        let pems = pem::parse_many(&pem_blob).unwrap();
        let key = pems
            .iter()
            .find(|p| p.tag().contains("PRIVATE KEY"))
            .map(encode_pem)
            .unwrap();
        let cert = pems
            .iter()
            .find(|p| p.tag() == "CERTIFICATE")
            .map(encode_pem)
            .unwrap();

        let result = CertificateBundle::new(key, &cert);
        assert!(matches!(result, Err(CertError::NoDnsNames)));
    }

    #[test]
    fn test_full_chain_pem_is_leaf_first() {
        let (key, leaf, ca) = issue_test_cert(&["example.com"]);
        let bundle = CertificateBundle::new(key, &format!("{}{}", ca, leaf)).unwrap();
        assert_eq!(bundle.full_chain_pem(), format!("{}{}", leaf, ca));
    }

    #[test]
    fn test_not_after_in_the_future() {
        let (key, leaf, ca) = issue_test_cert(&["example.com"]);
        let bundle = CertificateBundle::new(key, &format!("{}{}", leaf, ca)).unwrap();
        assert!(bundle.not_after().unwrap() > Utc::now());
    }

    #[test]
    fn test_generate_wildcard_pem_contains_key_and_cert() {
        let pem_blob = generate_wildcard_pem().unwrap();
        let pems = pem::parse_many(&pem_blob).unwrap();
        assert!(pems.iter().any(|p| p.tag().contains("PRIVATE KEY")));
        assert!(pems.iter().any(|p| p.tag() == "CERTIFICATE"));
    }
}
