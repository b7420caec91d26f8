//! The authorization seam.
//!
//! Credential validation lives outside the coordinator; it only asks
//! whether a token maps to a principal and whether that principal may
//! subscribe to or write a given document. Unauthorized requests are
//! no-ops on state.

use std::collections::HashMap;

/// Who a connection authenticated as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// External credential and permission checks.
///
/// The default permission methods allow everything, so implementations
/// that only validate tokens stay one method long.
pub trait Authenticator: Send + Sync {
    /// Validate a presented token. `None` closes the connection.
    fn authenticate(&self, token: &str) -> Option<Principal>;

    fn may_subscribe(&self, _principal: &Principal, _document_id: &str) -> bool {
        true
    }

    fn may_write(&self, _principal: &Principal, _document_id: &str) -> bool {
        true
    }
}

/// Accepts any token. For tests and trusted single-process deployments.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _token: &str) -> Option<Principal> {
        Some(Principal::new("anonymous"))
    }
}

/// A fixed token-to-subject table.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), subject.into());
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).map(|subject| Principal::new(subject.as_str()))
    }
}
