//! Reconciler: Marathon labels → missing certificates → issuance
//!
//! A sync fetches the apps from Marathon, extracts the domains whose
//! effective HAProxy group matches the configured group, diffs them against
//! the certificate store, and asks the ACME service for every missing name.
//! Issuances run concurrently; a failure for one domain never cancels the
//! others and never fails the sync as a whole.
//!
//! Sync is idempotent: when every wanted domain is already stored nothing
//! is issued and (because the LB signal hangs off the store) marathon-lb is
//! not signalled.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::acme::{AcmeError, AcmeIssuer};
use crate::clients::{ClientError, MarathonApp, MarathonClient};
use crate::store::{CertificateStore, StoreError};

/// Errors that fail a sync as a whole.
///
/// Per-domain issuance failures are not among these; they are collected in
/// the [`SyncReport`] instead.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Marathon could not be queried
    #[error("Marathon request failed: {0}")]
    Marathon(#[from] ClientError),

    /// The certificate store could not be read
    #[error("certificate store failed: {0}")]
    Store(#[from] StoreError),
}

/// The outcome of one sync.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Domains issued during this sync
    pub issued: Vec<String>,
    /// Domains whose issuance failed, with the error
    pub failed: Vec<(String, AcmeError)>,
}

impl SyncReport {
    /// Whether the sync had nothing to do.
    pub fn is_noop(&self) -> bool {
        self.issued.is_empty() && self.failed.is_empty()
    }
}

/// Couples the Marathon client, the certificate store, and the ACME
/// service into the sync operation.
pub struct Reconciler {
    marathon: Arc<MarathonClient>,
    store: Arc<dyn CertificateStore>,
    acme: Arc<dyn AcmeIssuer>,
    group: String,
    allow_multiple_certs: bool,
}

impl Reconciler {
    /// Create a reconciler filtering apps by `group`.
    pub fn new(
        marathon: Arc<MarathonClient>,
        store: Arc<dyn CertificateStore>,
        acme: Arc<dyn AcmeIssuer>,
        group: String,
        allow_multiple_certs: bool,
    ) -> Self {
        Self {
            marathon,
            store,
            acme,
            group,
            allow_multiple_certs,
        }
    }

    /// Fetch apps, diff wanted domains against the store, and issue the
    /// missing ones.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let apps = self.marathon.get_apps().await?;

        let mut wanted = BTreeSet::new();
        for app in &apps {
            for domain in app_acme_domains(app, &self.group, self.allow_multiple_certs) {
                wanted.insert(domain);
            }
        }
        debug!(count = wanted.len(), domains = ?wanted, "Found domains for apps");

        let have = self.store.as_dict().await?;

        // BTreeSet iteration keeps the issue order deterministic.
        let missing: Vec<String> = wanted
            .into_iter()
            .filter(|domain| !have.contains_key(domain))
            .collect();

        if missing.is_empty() {
            debug!("No new domains to issue certificates for");
            return Ok(SyncReport::default());
        }

        info!(
            count = missing.len(),
            domains = ?missing,
            "Issuing certificates for new domains"
        );

        let results = join_all(missing.iter().map(|domain| async move {
            (domain.clone(), self.acme.issue(domain).await)
        }))
        .await;

        let mut report = SyncReport::default();
        for (domain, result) in results {
            match result {
                Ok(()) => report.issued.push(domain),
                Err(e) => {
                    error!(domain = %domain, error = %e, "Failed to issue certificate");
                    report.failed.push((domain, e));
                }
            }
        }

        info!(
            issued = report.issued.len(),
            failed = report.failed.len(),
            "Sync completed"
        );
        Ok(report)
    }
}

/// Extract the ACME domains of one app under the group policy.
///
/// For each port the effective group is `HAPROXY_<n>_GROUP` when set, else
/// the app-level `HAPROXY_GROUP`; only ports whose effective group equals
/// `group` are considered. A port's `MARATHON_ACME_<n>_DOMAIN` label is a
/// comma-separated list; unless `allow_multiple` is set only the first
/// entry is used and a warning is logged when more were present.
pub fn app_acme_domains(app: &MarathonApp, group: &str, allow_multiple: bool) -> Vec<String> {
    let mut domains = Vec::new();
    let app_group = app.labels.get("HAPROXY_GROUP");

    for (port_index, _) in app.port_definitions.iter().enumerate() {
        let port_group = app
            .labels
            .get(&format!("HAPROXY_{}_GROUP", port_index))
            .or(app_group);
        if port_group.map(String::as_str) != Some(group) {
            continue;
        }

        let label = app
            .labels
            .get(&format!("MARATHON_ACME_{}_DOMAIN", port_index))
            .map(String::as_str)
            .unwrap_or("");
        let port_domains = parse_domain_label(label);
        if port_domains.is_empty() {
            continue;
        }

        if allow_multiple {
            domains.extend(port_domains);
        } else {
            if port_domains.len() > 1 {
                warn!(
                    app = %app.id,
                    port = port_index,
                    "Multiple domains found for port, only the first will be used"
                );
            }
            domains.push(port_domains[0].clone());
        }
    }

    debug!(
        app = %app.id,
        count = domains.len(),
        domains = ?domains,
        "Found domains for app"
    );
    domains
}

/// Parse a comma-separated domain label: entries are trimmed, empties
/// dropped, and everything lowercased.
pub fn parse_domain_label(label: &str) -> Vec<String> {
    label
        .split(',')
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn app(id: &str, labels: &[(&str, &str)], ports: usize) -> MarathonApp {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        serde_json::from_value(serde_json::json!({
            "id": id,
            "labels": labels,
            "portDefinitions": vec![serde_json::json!({"port": 9000}); ports],
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_domain_label_trims_and_drops_empties() {
        assert_eq!(
            parse_domain_label(" example.com, , example2.com ,"),
            vec!["example.com", "example2.com"]
        );
        assert!(parse_domain_label("").is_empty());
        assert!(parse_domain_label(" , ").is_empty());
    }

    #[test]
    fn test_parse_domain_label_lowercases() {
        assert_eq!(parse_domain_label("Example.COM"), vec!["example.com"]);
    }

    #[test]
    fn test_app_group_match_yields_domain() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "external"),
                ("MARATHON_ACME_0_DOMAIN", "example.com"),
            ],
            1,
        );
        assert_eq!(app_acme_domains(&app, "external", false), vec!["example.com"]);
    }

    #[test]
    fn test_wrong_group_yields_nothing() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "internal"),
                ("MARATHON_ACME_0_DOMAIN", "example.com"),
            ],
            1,
        );
        assert!(app_acme_domains(&app, "external", false).is_empty());
    }

    #[test]
    fn test_port_group_overrides_app_group() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "internal"),
                ("HAPROXY_0_GROUP", "external"),
                ("MARATHON_ACME_0_DOMAIN", "example.com"),
            ],
            1,
        );
        assert_eq!(app_acme_domains(&app, "external", false), vec!["example.com"]);
    }

    #[test]
    fn test_port_group_can_exclude_port() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "external"),
                ("HAPROXY_0_GROUP", "internal"),
                ("MARATHON_ACME_0_DOMAIN", "example.com"),
                ("MARATHON_ACME_1_DOMAIN", "example2.com"),
            ],
            2,
        );
        assert_eq!(
            app_acme_domains(&app, "external", false),
            vec!["example2.com"]
        );
    }

    #[test]
    fn test_no_group_labels_yields_nothing() {
        let app = app("/my-app", &[("MARATHON_ACME_0_DOMAIN", "example.com")], 1);
        assert!(app_acme_domains(&app, "external", false).is_empty());
    }

    #[test]
    fn test_multiple_domains_only_first_used() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "external"),
                ("MARATHON_ACME_0_DOMAIN", "example.com, example2.com"),
            ],
            1,
        );
        assert_eq!(app_acme_domains(&app, "external", false), vec!["example.com"]);
    }

    #[test]
    fn test_multiple_domains_all_used_when_allowed() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "external"),
                ("MARATHON_ACME_0_DOMAIN", "example.com, example2.com"),
            ],
            1,
        );
        assert_eq!(
            app_acme_domains(&app, "external", true),
            vec!["example.com", "example2.com"]
        );
    }

    #[test]
    fn test_domains_collected_per_port_in_order() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "external"),
                ("MARATHON_ACME_0_DOMAIN", "one.example.com"),
                ("MARATHON_ACME_1_DOMAIN", "two.example.com"),
            ],
            2,
        );
        assert_eq!(
            app_acme_domains(&app, "external", false),
            vec!["one.example.com", "two.example.com"]
        );
    }

    #[test]
    fn test_app_without_ports_yields_nothing() {
        let app = app(
            "/my-app",
            &[
                ("HAPROXY_GROUP", "external"),
                ("MARATHON_ACME_0_DOMAIN", "example.com"),
            ],
            0,
        );
        assert!(app_acme_domains(&app, "external", false).is_empty());
    }
}
