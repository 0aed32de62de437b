//! Access-token provider consumed by the engine.
//!
//! Token acquisition lives outside this crate. The engine only asks for the
//! current token, checks whether it is still valid, asks for one refresh per
//! open attempt, and reports when the session is beyond repair.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{TelemetryError, TelemetryResult};

/// Source of JWT access tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Current access token, if any.
    fn token(&self) -> Option<String>;

    /// Check whether `token` can no longer be used to authenticate.
    ///
    /// The default decodes the JWT payload and compares its `exp` claim with
    /// the system clock. Tokens that cannot be decoded count as expired.
    fn is_token_expired(&self, token: &str) -> bool {
        jwt_expired_at(token, SystemTime::now())
    }

    /// Obtain a fresh token. On success [`TokenProvider::token`] returns it.
    async fn refresh(&self) -> TelemetryResult<()>;

    /// Called when a refresh failed; the session cannot be recovered.
    fn on_session_invalid(&self) {}
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Check a JWT's `exp` claim against `now`.
pub fn jwt_expired_at(token: &str, now: SystemTime) -> bool {
    let Some(exp) = jwt_expiry(token) else {
        return true;
    };
    let now = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    exp < now
}

/// Extract the `exp` claim (seconds since the epoch) from a JWT.
pub fn jwt_expiry(token: &str) -> Option<f64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp
}

/// Provider holding a fixed token. Refresh is not possible.
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// Replace the held token.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn refresh(&self) -> TelemetryResult<()> {
        Err(TelemetryError::auth("Static token cannot be refreshed"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn jwt(payload: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS512"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_expiry_is_decoded() {
        let token = jwt(r#"{"sub":"tenant@example.com","exp":1700000000}"#);
        assert_eq!(jwt_expiry(&token), Some(1_700_000_000.0));

        let before = UNIX_EPOCH + Duration::from_secs(1_699_999_000);
        let after = UNIX_EPOCH + Duration::from_secs(1_700_000_001);
        assert!(!jwt_expired_at(&token, before));
        assert!(jwt_expired_at(&token, after));
    }

    #[test]
    fn test_undecodable_tokens_are_expired() {
        let now = SystemTime::now();
        assert!(jwt_expired_at("not-a-jwt", now));
        assert!(jwt_expired_at("a.!!!.c", now));
        assert!(jwt_expired_at(&jwt(r#"{"sub":"x"}"#), now));
        assert!(jwt_expired_at(&jwt("[1,2]"), now));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("abc");
        assert_eq!(provider.token().as_deref(), Some("abc"));
        assert!(provider.is_token_expired("abc"));
        assert!(matches!(
            provider.refresh().await,
            Err(TelemetryError::Auth { .. })
        ));

        provider.clear();
        assert!(provider.token().is_none());
        provider.set_token("def");
        assert_eq!(provider.token().as_deref(), Some("def"));
    }
}
