//! Vault key/value version 2 client
//!
//! A very simple Vault client that can read and write KV v2 paths with
//! optional check-and-set. Error normalization follows the Vault API:
//!
//! - a `404` whose JSON body carries an empty `errors` list means "absent"
//!   on reads and is not an error;
//! - a `400` whose first error message mentions `check-and-set` while a CAS
//!   option was sent maps to [`VaultError::CasMismatch`], the signal the
//!   store's retry loop is built on;
//! - anything else surfaces as [`VaultError::Api`] with the server's error
//!   messages.
//!
//! [`VaultClient::from_environ`] mirrors the Vault CLI environment
//! variables, including Go's `strconv.ParseBool` convention for
//! `VAULT_SKIP_VERIFY`.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Errors produced by the Vault client.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The request never produced a response
    #[error("Vault transport error: {0}")]
    Transport(String),

    /// Vault answered with an error response
    #[error("Vault error ({status}): {message}")]
    Api {
        /// Response status code
        status: u16,
        /// Joined error messages, or the raw body when not JSON
        message: String,
        /// Individual error messages from the response body
        errors: Vec<String>,
    },

    /// A check-and-set write lost the race
    #[error("Vault check-and-set mismatch: {0}")]
    CasMismatch(String),

    /// A success response could not be decoded
    #[error("Vault response could not be decoded: {0}")]
    Decode(String),

    /// Client construction from the environment failed
    #[error("Vault client configuration error: {0}")]
    Config(String),
}

/// A successful KV v2 read: secret data plus version metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct Kv2Read {
    /// Response `data` envelope
    pub data: Kv2ReadData,
}

/// The `data` envelope of a KV v2 read.
#[derive(Debug, Clone, Deserialize)]
pub struct Kv2ReadData {
    /// The stored key/value pairs
    pub data: HashMap<String, String>,
    /// Version metadata
    pub metadata: Kv2Metadata,
}

/// KV v2 version metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct Kv2Metadata {
    /// Backend-assigned version of this secret
    pub version: u64,
}

/// The result of a KV v2 write: the version Vault assigned.
#[derive(Debug, Clone, Deserialize)]
pub struct Kv2Written {
    /// Backend-assigned version of the written secret
    pub version: u64,
}

#[derive(Debug, Deserialize)]
struct Kv2WriteResponse {
    data: Kv2Written,
}

#[derive(Debug, Deserialize)]
struct VaultErrorBody {
    #[serde(default)]
    errors: Option<Vec<String>>,
}

/// Client for the Vault HTTP API.
#[derive(Clone)]
pub struct VaultClient {
    address: Url,
    token: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl VaultClient {
    /// Create a client for the given address and token.
    pub fn new(address: Url, token: String, timeout: Duration) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| VaultError::Config(e.to_string()))?;
        Ok(Self {
            address,
            token,
            http,
            timeout,
        })
    }

    /// Build a client from the process environment.
    ///
    /// See [`from_env_map`](Self::from_env_map) for the recognized
    /// variables.
    pub fn from_environ(timeout: Duration) -> Result<Self, VaultError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&env, timeout)
    }

    /// Build a client from an explicit environment map.
    ///
    /// Supports a subset of the Vault CLI configuration: `VAULT_ADDR`
    /// (default `https://127.0.0.1:8200`), `VAULT_TOKEN` (default `TEST`,
    /// matching the CLI), `VAULT_CACERT`, `VAULT_CLIENT_CERT` +
    /// `VAULT_CLIENT_KEY`, `VAULT_SKIP_VERIFY`, and `VAULT_TLS_SERVER_NAME`.
    /// Variables that are set but empty are treated as unset, like Vault
    /// itself does.
    pub fn from_env_map(
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, VaultError> {
        let address = env_str(env, "VAULT_ADDR").unwrap_or("https://127.0.0.1:8200");
        let token = env_str(env, "VAULT_TOKEN").unwrap_or("TEST").to_string();

        let mut builder = reqwest::Client::builder();

        if let Some(value) = env_str(env, "VAULT_SKIP_VERIFY") {
            if parse_bool(value).map_err(VaultError::Config)? {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(ca_cert) = env_str(env, "VAULT_CACERT") {
            let pem = std::fs::read(ca_cert).map_err(|e| {
                VaultError::Config(format!("could not read VAULT_CACERT '{}': {}", ca_cert, e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| VaultError::Config(format!("invalid VAULT_CACERT: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(client_cert), Some(client_key)) = (
            env_str(env, "VAULT_CLIENT_CERT"),
            env_str(env, "VAULT_CLIENT_KEY"),
        ) {
            let mut identity_pem = std::fs::read(client_cert).map_err(|e| {
                VaultError::Config(format!(
                    "could not read VAULT_CLIENT_CERT '{}': {}",
                    client_cert, e
                ))
            })?;
            identity_pem.push(b'\n');
            identity_pem.extend(std::fs::read(client_key).map_err(|e| {
                VaultError::Config(format!(
                    "could not read VAULT_CLIENT_KEY '{}': {}",
                    client_key, e
                ))
            })?);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| VaultError::Config(format!("invalid Vault client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        if env_str(env, "VAULT_TLS_SERVER_NAME").is_some() {
            warn!("VAULT_TLS_SERVER_NAME is not supported by this client and will be ignored");
        }

        let address = Url::parse(address)
            .map_err(|e| VaultError::Config(format!("invalid VAULT_ADDR '{}': {}", address, e)))?;
        let http = builder
            .build()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        Ok(Self {
            address,
            token,
            http,
            timeout,
        })
    }

    fn api_url(&self, path: &str) -> Result<Url, VaultError> {
        let joined = format!("{}/v1/{}", self.address.as_str().trim_end_matches('/'), path);
        Url::parse(&joined)
            .map_err(|e| VaultError::Config(format!("invalid Vault path '{}': {}", path, e)))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, VaultError> {
        let url = self.api_url(path)?;
        let mut request = self
            .http
            .request(method, url)
            .header("X-Vault-Token", &self.token)
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| VaultError::Transport(e.to_string()))
    }

    /// Read a secret from a KV v2 engine. `Ok(None)` means the path is
    /// absent.
    pub async fn read_kv2(&self, mount: &str, path: &str) -> Result<Option<Kv2Read>, VaultError> {
        let response = self
            .request(Method::GET, &format!("{}/data/{}", mount, path), None)
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map(Some)
                .map_err(|e| VaultError::Decode(e.to_string()));
        }

        let parsed = parse_error_body(response).await?;
        // A 404 with an empty errors list is how KV v2 reports an absent key.
        if status.as_u16() == 404 && matches!(parsed.errors.as_deref(), Some([])) {
            return Ok(None);
        }
        Err(parsed.into_error(status.as_u16(), false))
    }

    /// Create or update a secret in a KV v2 engine.
    ///
    /// When `cas` is given the write only succeeds if the current version
    /// matches; a mismatch yields [`VaultError::CasMismatch`].
    pub async fn create_or_update_kv2(
        &self,
        mount: &str,
        path: &str,
        data: serde_json::Value,
        cas: Option<u64>,
    ) -> Result<Kv2Written, VaultError> {
        let mut options = serde_json::Map::new();
        if let Some(cas) = cas {
            options.insert("cas".to_string(), cas.into());
        }
        let body = json!({ "data": data, "options": options });

        let response = self
            .request(Method::PUT, &format!("{}/data/{}", mount, path), Some(body))
            .await?;

        let status = response.status();
        if status.is_success() {
            let decoded: Kv2WriteResponse = response
                .json()
                .await
                .map_err(|e| VaultError::Decode(e.to_string()))?;
            return Ok(decoded.data);
        }

        let parsed = parse_error_body(response).await?;
        Err(parsed.into_error(status.as_u16(), cas.is_some()))
    }
}

struct ParsedError {
    errors: Option<Vec<String>>,
    text: String,
}

impl ParsedError {
    fn into_error(self, status: u16, check_cas: bool) -> VaultError {
        let errors = self.errors.unwrap_or_default();
        let message = if errors.is_empty() {
            self.text
        } else {
            errors.join(", ")
        };

        // Vault doesn't flag CAS failures distinctly; a 400 mentioning
        // check-and-set while a CAS option was sent is the best signal.
        if check_cas
            && status == 400
            && errors
                .first()
                .map(|e| e.contains("check-and-set"))
                .unwrap_or(false)
        {
            return VaultError::CasMismatch(message);
        }

        VaultError::Api {
            status,
            message,
            errors,
        }
    }
}

async fn parse_error_body(response: reqwest::Response) -> Result<ParsedError, VaultError> {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let text = response
        .text()
        .await
        .map_err(|e| VaultError::Transport(e.to_string()))?;

    let errors = if is_json {
        serde_json::from_str::<VaultErrorBody>(&text)
            .ok()
            .and_then(|b| b.errors)
    } else {
        None
    };

    Ok(ParsedError { errors, text })
}

fn env_str<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    // Like Vault itself: a set-but-empty variable counts as unset.
    env.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// A port of Go's `strconv.ParseBool`, which is what the Vault CLI uses
/// for boolean environment variables.
pub fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(format!("unable to parse boolean value from '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_accepts_go_values() {
        for v in ["1", "t", "T", "true", "TRUE", "True"] {
            assert_eq!(parse_bool(v), Ok(true), "{}", v);
        }
        for v in ["0", "f", "F", "false", "FALSE", "False"] {
            assert_eq!(parse_bool(v), Ok(false), "{}", v);
        }
    }

    #[test]
    fn test_parse_bool_rejects_other_values() {
        assert!(parse_bool("yes").is_err());
        assert!(parse_bool("").is_err());
        assert!(parse_bool("tRuE").is_err());
    }

    #[test]
    fn test_from_env_map_defaults() {
        let env = HashMap::new();
        let client = VaultClient::from_env_map(&env, Duration::from_secs(5)).unwrap();
        assert_eq!(client.address.as_str(), "https://127.0.0.1:8200/");
        assert_eq!(client.token, "TEST");
    }

    #[test]
    fn test_from_env_map_empty_values_are_unset() {
        let mut env = HashMap::new();
        env.insert("VAULT_ADDR".to_string(), String::new());
        env.insert("VAULT_SKIP_VERIFY".to_string(), String::new());
        let client = VaultClient::from_env_map(&env, Duration::from_secs(5)).unwrap();
        assert_eq!(client.address.as_str(), "https://127.0.0.1:8200/");
    }

    #[test]
    fn test_from_env_map_invalid_skip_verify() {
        let mut env = HashMap::new();
        env.insert("VAULT_SKIP_VERIFY".to_string(), "maybe".to_string());
        let result = VaultClient::from_env_map(&env, Duration::from_secs(5));
        assert!(matches!(result, Err(VaultError::Config(_))));
    }

    #[test]
    fn test_cas_error_detection() {
        let parsed = ParsedError {
            errors: Some(vec![
                "check-and-set parameter did not match the current version".to_string(),
            ]),
            text: String::new(),
        };
        assert!(matches!(
            parsed.into_error(400, true),
            VaultError::CasMismatch(_)
        ));
    }

    #[test]
    fn test_cas_error_requires_cas_request() {
        let parsed = ParsedError {
            errors: Some(vec!["check-and-set parameter required".to_string()]),
            text: String::new(),
        };
        assert!(matches!(
            parsed.into_error(400, false),
            VaultError::Api { status: 400, .. }
        ));
    }
}
