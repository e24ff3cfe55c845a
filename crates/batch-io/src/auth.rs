//! Command authentication.
//!
//! HMAC-SHA256 tokens bound to an operator name, which is logged with each accepted command.
//! Token format: `base64(issued_at_secs:operator:hmac(issued_at_secs:operator))`.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("auth token required")]
    Missing,

    #[error("token has expired (age: {age_secs}s, max: {max_secs}s)")]
    TokenExpired { age_secs: u64, max_secs: u64 },

    #[error("invalid token format")]
    InvalidFormat,

    #[error("token signature verification failed")]
    InvalidSignature,

    #[error("token decode error: {0}")]
    DecodeError(String),
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Shared secret for HMAC signing
    pub secret: Vec<u8>,
    /// Maximum token age in seconds
    pub max_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: Vec::new(),
            max_age_secs: 8 * 60 * 60, // one shift
        }
    }
}

/// Claims extracted from a validated token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub operator: String,
    pub issued_at: u64,
    pub age_secs: u64,
}

#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    max_age_secs: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TokenValidator {
    pub fn new(secret: Vec<u8>, max_age_secs: u64) -> Self {
        Self {
            secret,
            max_age_secs,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.secret.clone(), config.max_age_secs)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC-SHA256 accepts keys of any length.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC takes keys of any size"),
        }
    }

    /// Check an optional token; `None` is only accepted by callers that do not require auth.
    pub fn check(&self, token: Option<&str>) -> Result<TokenClaims, AuthError> {
        match token {
            Some(token) if !token.is_empty() => self.validate(token),
            _ => Err(AuthError::Missing),
        }
    }

    pub fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let decoded = engine
            .decode(token.trim())
            .map_err(|e| AuthError::DecodeError(e.to_string()))?;

        let mut parts = decoded.splitn(3, |&b| b == b':');
        let (Some(issued), Some(operator), Some(signature)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidFormat);
        };
        let signed_len = issued.len() + 1 + operator.len();

        let issued_at: u64 = std::str::from_utf8(issued)
            .map_err(|_| AuthError::InvalidFormat)?
            .parse()
            .map_err(|_| AuthError::InvalidFormat)?;
        let operator = std::str::from_utf8(operator)
            .map_err(|_| AuthError::InvalidFormat)?
            .to_string();

        let age = unix_now().saturating_sub(issued_at);
        if age > self.max_age_secs {
            return Err(AuthError::TokenExpired {
                age_secs: age,
                max_secs: self.max_age_secs,
            });
        }

        let mut mac = self.mac();
        mac.update(&decoded[..signed_len]);
        mac.verify_slice(signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        Ok(TokenClaims {
            operator,
            issued_at,
            age_secs: age,
        })
    }

    /// Issue a token for `operator`; used by the dashboard backend and in tests.
    pub fn generate_token(&self, operator: &str) -> String {
        self.generate_token_at(operator, unix_now())
    }

    fn generate_token_at(&self, operator: &str, issued_at: u64) -> String {
        let mut payload = format!("{issued_at}:{}", operator.replace(':', "_")).into_bytes();
        let mut mac = self.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();
        payload.push(b':');
        payload.extend_from_slice(&signature);
        base64::engine::general_purpose::STANDARD.encode(&payload)
    }
}
