//! Resolution of passwords missing from subscription descriptors.
//!
//! A subscription's connection descriptor usually omits the password (it
//! lives in the subscriber's `.pgpass` or a vault). The walker asks a
//! [`SecretResolver`] for it, keyed by subscription name and publisher host,
//! both of which are stable across hosts unlike catalog oids.

use std::collections::HashMap;

/// What the walker knows when it needs a password.
#[derive(Debug, Clone, Copy)]
pub struct SecretRequest<'a> {
    pub subscription: &'a str,
    pub host: &'a str,
    pub user: Option<&'a str>,
}

pub trait SecretResolver: Send + Sync {
    fn resolve(&self, request: &SecretRequest<'_>) -> Option<String>;
}

/// Resolves nothing; descriptors without a password fall back to the seed credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretResolver for NoSecrets {
    fn resolve(&self, _request: &SecretRequest<'_>) -> Option<String> {
        None
    }
}

/// Passwords from the `[secrets]` configuration table.
///
/// Keys are subscription names, `user@host` pairs or host addresses, tried
/// in that order.
#[derive(Clone, Default)]
pub struct StaticSecrets {
    entries: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

impl std::fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("StaticSecrets").field("keys", &keys).finish()
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve(&self, request: &SecretRequest<'_>) -> Option<String> {
        self.entries
            .get(request.subscription)
            .or_else(|| {
                request
                    .user
                    .and_then(|user| self.entries.get(&format!("{}@{}", user, request.host)))
            })
            .or_else(|| self.entries.get(request.host))
            .cloned()
    }
}
