//! Authentication for tunnel sessions.
//!
//! The gateway consumes tokens through the [`TokenValidator`] seam; the
//! bundled [`HmacValidator`] implements it with HMAC-SHA256 signed tokens.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime: 30 days.
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Why a bearer token was rejected.
///
/// The display strings are user-facing: they travel to the agent inside the
/// single `error` frame sent before an unauthenticated session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no token provided")]
    NoToken,
    #[error("invalid token")]
    Invalid,
    #[error("token has been revoked")]
    Revoked,
    #[error("token has expired")]
    Expired,
}

/// Validates bearer credentials presented on the session handshake.
///
/// Tokens are opaque strings to every caller; only the implementation knows
/// their structure. On success the validator returns the principal (user id)
/// the token belongs to.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, bearer: &str) -> Result<String, AuthError>;
}

/// A signed access token issued by [`HmacValidator::generate_token`].
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// The full token string handed to the agent.
    pub token: String,
    /// Token id (the principal reported on validation).
    pub id: String,
    /// Issue time, seconds since the epoch.
    pub issued_at: u64,
}

/// Token validator backed by an HMAC-SHA256 secret.
///
/// Token format: `{id}:{issued_at}.{signature}` where the signature is the
/// hex HMAC of `{id}:{issued_at}`. Revocation is an in-memory set of token
/// ids; a persistent store can live behind the [`TokenValidator`] trait
/// instead.
pub struct HmacValidator {
    secret: Vec<u8>,
    ttl: Duration,
    revoked: RwLock<HashSet<String>>,
}

impl HmacValidator {
    /// Create a new validator with the given secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECONDS),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Create a validator from a hex-encoded secret.
    pub fn from_hex(hex_secret: &str) -> Result<Self, AuthError> {
        let secret = hex::decode(hex_secret).map_err(|_| AuthError::Invalid)?;
        Ok(Self::new(secret))
    }

    /// Override the token lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a new token signed with this validator's secret.
    pub fn generate_token(&self) -> AccessToken {
        let id = generate_token_id();
        let issued_at = unix_now();
        let data = format!("{}:{}", id, issued_at);
        let signature = sign(&data, &self.secret);

        AccessToken {
            token: format!("{}.{}", data, signature),
            id,
            issued_at,
        }
    }

    /// Revoke a token by its id. Subsequent validations fail with
    /// [`AuthError::Revoked`].
    pub fn revoke(&self, token_id: &str) {
        self.revoked
            .write()
            .expect("revocation set poisoned")
            .insert(token_id.to_string());
    }

    /// Get the secret as a hex string, for operator display.
    pub fn secret_hex(&self) -> String {
        hex::encode(&self.secret)
    }
}

impl TokenValidator for HmacValidator {
    fn validate(&self, bearer: &str) -> Result<String, AuthError> {
        if bearer.is_empty() {
            return Err(AuthError::NoToken);
        }

        let (data, signature) = bearer.rsplit_once('.').ok_or(AuthError::Invalid)?;
        if sign(data, &self.secret) != signature {
            return Err(AuthError::Invalid);
        }

        let (id, issued_at) = data.split_once(':').ok_or(AuthError::Invalid)?;
        let issued_at: u64 = issued_at.parse().map_err(|_| AuthError::Invalid)?;

        if self
            .revoked
            .read()
            .expect("revocation set poisoned")
            .contains(id)
        {
            return Err(AuthError::Revoked);
        }

        if unix_now().saturating_sub(issued_at) > self.ttl.as_secs() {
            return Err(AuthError::Expired);
        }

        Ok(id.to_string())
    }
}

impl Default for HmacValidator {
    fn default() -> Self {
        Self::new(generate_random_secret())
    }
}

fn sign(data: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate a random 16-character token id.
fn generate_token_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Generate a random 32-byte secret.
fn generate_random_secret() -> Vec<u8> {
    use rand::Rng;
    let mut bytes = vec![0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_validates() {
        let validator = HmacValidator::default();
        let token = validator.generate_token();

        let principal = validator.validate(&token.token).unwrap();
        assert_eq!(principal, token.id);
    }

    #[test]
    fn empty_bearer_is_no_token() {
        let validator = HmacValidator::default();
        assert_eq!(validator.validate(""), Err(AuthError::NoToken));
    }

    #[test]
    fn garbage_is_invalid() {
        let validator = HmacValidator::default();
        assert_eq!(validator.validate("not-a-token"), Err(AuthError::Invalid));
        assert_eq!(
            validator.validate("abc:123.deadbeef"),
            Err(AuthError::Invalid)
        );
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let issuer = HmacValidator::default();
        let other = HmacValidator::default();

        let token = issuer.generate_token();
        assert_eq!(other.validate(&token.token), Err(AuthError::Invalid));
    }

    #[test]
    fn revoked_token_reports_revoked() {
        let validator = HmacValidator::default();
        let token = validator.generate_token();

        validator.revoke(&token.id);
        assert_eq!(validator.validate(&token.token), Err(AuthError::Revoked));
    }

    #[test]
    fn expired_token_reports_expired() {
        let validator = HmacValidator::default().with_ttl(Duration::from_secs(0));
        let token = validator.generate_token();

        // Forge an issue time in the past with the real secret so only the
        // TTL check can fail.
        let data = format!("{}:{}", token.id, token.issued_at - 10);
        let forged = format!("{}.{}", data, sign(&data, &validator.secret));
        assert_eq!(validator.validate(&forged), Err(AuthError::Expired));
    }

    #[test]
    fn error_reasons_are_user_facing() {
        assert_eq!(AuthError::NoToken.to_string(), "no token provided");
        assert_eq!(AuthError::Invalid.to_string(), "invalid token");
        assert_eq!(AuthError::Revoked.to_string(), "token has been revoked");
        assert_eq!(AuthError::Expired.to_string(), "token has expired");
    }
}
