use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose;
use base64::Engine;
use tracing::{debug, warn};

use crate::store::CredentialStore;

const BASIC_PREFIX: &str = "Basic ";

/// Username/password pair owned by the gateway itself
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Parse a `user:pass` string; both halves must be non-empty
    pub fn parse(s: &str) -> Option<Self> {
        let (username, password) = s.split_once(':')?;
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self::new(username.to_string(), password.to_string()))
    }

    /// `Basic <base64(user:pass)>` value for a `Proxy-Authorization` header
    pub fn basic_header_value(&self) -> String {
        let pair = format!("{}:{}", self.username, self.password);
        format!("{}{}", BASIC_PREFIX, general_purpose::STANDARD.encode(pair))
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("authorization scheme is not Basic")]
    UnsupportedScheme,

    #[error("credentials are not valid base64")]
    InvalidBase64,

    #[error("credentials are not valid UTF-8")]
    InvalidUtf8,

    #[error("credentials carry no ':' separator")]
    MissingSeparator,
}

/// Identity and secret presented by a client
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub identity: String,
    pub secret: String,
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl BasicCredentials {
    /// Decode a `Proxy-Authorization` value.
    ///
    /// The scheme is matched case-sensitively and the decoded pair is split on
    /// the first colon only, so secrets may contain colons.
    pub fn from_header_value(value: &str) -> Result<Self, CredentialError> {
        let encoded = value
            .strip_prefix(BASIC_PREFIX)
            .ok_or(CredentialError::UnsupportedScheme)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| CredentialError::InvalidBase64)?;
        let pair = String::from_utf8(decoded).map_err(|_| CredentialError::InvalidUtf8)?;
        let (identity, secret) = pair
            .split_once(':')
            .ok_or(CredentialError::MissingSeparator)?;
        Ok(Self {
            identity: identity.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// Checks client secrets against the salted hashes in the credential store
#[derive(Clone)]
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// True only when the identity exists and the secret matches its hash.
    ///
    /// Unknown identities, store failures and mismatches all return `false`.
    pub async fn verify(&self, identity: &str, secret: &str) -> bool {
        let hash = match self.store.password_hash(identity).await {
            Ok(Some(hash)) => hash,
            Ok(None) => {
                debug!("No credential record for {}", identity);
                return false;
            }
            Err(e) => {
                warn!("Credential store lookup for {} failed: {}", identity, e);
                return false;
            }
        };

        // bcrypt is deliberately slow; keep it off the I/O workers
        let secret = secret.to_string();
        match tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash)).await {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                warn!("Stored hash for {} is unusable: {}", identity, e);
                false
            }
            Err(e) => {
                warn!("Password check task for {} failed: {}", identity, e);
                false
            }
        }
    }
}
