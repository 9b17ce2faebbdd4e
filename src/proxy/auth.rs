//! Downstream client authentication
//!
//! Clients attach a bearer-style access token as a query parameter. The
//! token carries a protocol identifier, a version, and an HMAC-SHA256
//! signature over both, keyed by the shared secret from the persisted
//! configuration.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::proxy::messages::ProxyAuthError;

type HmacSha256 = Hmac<Sha256>;

/// Parsed access token of the form `<protocol>;<version>;<base64-signature>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub protocol: String,
    pub version: String,
    pub signature: String,
}

impl AuthToken {
    /// Parse a raw token string, validating the grammar only
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let (protocol, version, signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        if protocol.is_empty() || !protocol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if signature.is_empty() {
            return None;
        }

        Some(Self {
            protocol: protocol.to_string(),
            version: version.to_string(),
            signature: signature.to_string(),
        })
    }
}

/// Compute the base64 signature for a token's protocol and version.
///
/// Used by the authenticator to derive the expected signature, and by the
/// administration layer to mint tokens.
pub fn sign_token(protocol: &str, version: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(protocol.as_bytes());
    mac.update(b";");
    mac.update(version.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Build a complete access token for the given protocol and version
pub fn issue_token(protocol: &str, version: &str, secret: &str) -> String {
    format!(
        "{};{};{}",
        protocol,
        version,
        sign_token(protocol, version, secret)
    )
}

/// Result of validating a client access token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Authenticated,
    Rejected(AuthRejection),
}

/// Reasons an access token is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// No token was attached to the connection
    MissingToken,
    /// Token does not match the `<protocol>;<version>;<base64>` grammar
    InvalidTokenFormat,
    /// Token is well-formed but its signature does not match the secret
    InvalidToken,
}

impl AuthRejection {
    /// Map the rejection to its wire code.
    ///
    /// Both invalid cases collapse to `INVALID_TOKEN` on the wire.
    pub fn wire_code(&self) -> ProxyAuthError {
        match self {
            AuthRejection::MissingToken => ProxyAuthError::MissingToken,
            AuthRejection::InvalidTokenFormat | AuthRejection::InvalidToken => {
                ProxyAuthError::InvalidToken
            }
        }
    }
}

/// Validates downstream client access tokens against the configured secret.
///
/// Pure validator; retains no state between calls.
#[derive(Debug, Clone)]
pub struct ConnectionAuthenticator {
    secret: String,
}

impl ConnectionAuthenticator {
    /// Create an authenticator for the given shared secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Validate a raw token taken from the connection query string
    pub fn authenticate(&self, raw_token: Option<&str>) -> AuthResult {
        let raw = match raw_token {
            Some(raw) => raw,
            None => return AuthResult::Rejected(AuthRejection::MissingToken),
        };

        let token = match AuthToken::parse(raw) {
            Some(token) => token,
            None => return AuthResult::Rejected(AuthRejection::InvalidTokenFormat),
        };

        let provided = match BASE64.decode(&token.signature) {
            Ok(bytes) => bytes,
            Err(_) => return AuthResult::Rejected(AuthRejection::InvalidTokenFormat),
        };

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(token.protocol.as_bytes());
        mac.update(b";");
        mac.update(token.version.as_bytes());
        let expected = mac.finalize().into_bytes();

        // constant-time comparison; length is not secret-dependent
        if provided.len() == expected.len() && provided.ct_eq(&expected).into() {
            AuthResult::Authenticated
        } else {
            AuthResult::Rejected(AuthRejection::InvalidToken)
        }
    }
}
