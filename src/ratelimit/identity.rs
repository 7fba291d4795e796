//! Per-request identity values the limiter keys buckets by.

use sha2::{Digest, Sha256};

use super::bucket::Dimension;

/// Identity values extracted from one request.
///
/// Blank values are dropped, so a dimension is either absent or carries a
/// non-empty identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers {
    ip: Option<String>,
    email: Option<String>,
    okta_identifier: Option<String>,
    access_token: Option<String>,
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Identifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caller IP, already resolved through trusted-proxy handling.
    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = non_blank(ip);
        self
    }

    /// Submitted email; stored trimmed and lower-cased.
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = non_blank(&normalize_email(email));
        self
    }

    pub fn with_okta_identifier(mut self, id: &str) -> Self {
        self.okta_identifier = non_blank(id);
        self
    }

    /// A stable hash of the access token, computed by the caller.
    pub fn with_access_token_hash(mut self, hash: &str) -> Self {
        self.access_token = non_blank(hash);
        self
    }

    /// Hash a raw bearer token and keep only the hash.
    pub fn with_raw_access_token(mut self, token: &str) -> Self {
        self.access_token = match token.trim() {
            "" => None,
            token => Some(hash_access_token(token)),
        };
        self
    }

    /// Identifier for a dimension. `global` never has one.
    pub fn get(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::Global => None,
            Dimension::Ip => self.ip.as_deref(),
            Dimension::Email => self.email.as_deref(),
            Dimension::OktaIdentifier => self.okta_identifier.as_deref(),
            Dimension::AccessToken => self.access_token.as_deref(),
        }
    }
}

/// Canonical form of an email address for bucket keys.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// SHA-256 of an access token as lowercase hex. Raw tokens never become keys.
pub fn hash_access_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
