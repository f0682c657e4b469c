//! HTTP-01 challenge responder
//!
//! The ACME issuing service publishes `(token, key authorization)` pairs
//! here before asking the ACME server to validate, and withdraws them when
//! validation settles. The HTTP server reads the same table to answer
//! `GET /.well-known/acme-challenge/<token>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

/// Capability interface for publishing challenge responses.
#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    /// Start answering `token` with `key_authorization`.
    async fn start_responding(&self, token: &str, key_authorization: &str);

    /// Stop answering `token`.
    async fn stop_responding(&self, token: &str);
}

/// In-memory token table shared between the issuing service (writer) and
/// the HTTP server (reader).
#[derive(Clone, Default)]
pub struct Http01Responder {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Responder {
    /// Create an empty responder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the key authorization for a token, if one is published.
    pub async fn key_authorization_for(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }
}

#[async_trait]
impl ChallengeResponder for Http01Responder {
    async fn start_responding(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Publishing ACME challenge response");
        self.tokens
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
    }

    async fn stop_responding(&self, token: &str) {
        debug!(token = %token, "Withdrawing ACME challenge response");
        self.tokens.write().await.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_then_lookup() {
        let responder = Http01Responder::new();
        responder.start_responding("tok", "tok.abc123").await;
        assert_eq!(
            responder.key_authorization_for("tok").await,
            Some("tok.abc123".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_token_is_none() {
        let responder = Http01Responder::new();
        assert_eq!(responder.key_authorization_for("nope").await, None);
    }

    #[tokio::test]
    async fn test_stop_removes_token() {
        let responder = Http01Responder::new();
        responder.start_responding("tok", "tok.abc123").await;
        responder.stop_responding("tok").await;
        assert_eq!(responder.key_authorization_for("tok").await, None);
    }
}
