//! Canonical identity resolution with TTL caching.
//!
//! The two systems name people differently: the annotation store uses
//! email addresses, the review service uses opaque ids and account names.
//! The directory maps between them, caching both directions so repeated
//! reconstruction passes do not hammer the resolver.

use std::time::Duration;

use anyhow::Result;

use crate::cache::{TtlCache, DEFAULT_TTL};

/// A resolved identity record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// The review service's opaque id for this user.
    pub id: String,
    /// Account name on the review service.
    pub name: String,
    pub display_name: String,
    /// Primary email, when known.
    pub email: String,
}

impl Identity {
    /// The identifier used to attribute comments: email when available,
    /// account name otherwise.
    #[must_use]
    pub fn preferred_handle(&self) -> &str {
        if self.email.is_empty() {
            &self.name
        } else {
            &self.email
        }
    }
}

/// Backend that can look identities up on the remote service.
pub trait IdentityResolver {
    /// Resolve by the service's opaque id.
    fn resolve_by_id(&self, id: &str) -> Result<Option<Identity>>;

    /// Resolve a free-form name. Callers do not know whether the name is
    /// an email address or an account name; implementations try email
    /// first and fall back to account name.
    fn resolve_by_name(&self, name: &str) -> Result<Option<Identity>>;
}

/// TTL-cached front for an [`IdentityResolver`].
///
/// Owned by whoever drives reconciliation; nothing here is global state.
pub struct IdentityDirectory {
    resolver: Box<dyn IdentityResolver>,
    by_id: TtlCache<String, Option<Identity>>,
    by_name: TtlCache<String, Option<Identity>>,
}

impl IdentityDirectory {
    #[must_use]
    pub fn new(resolver: Box<dyn IdentityResolver>) -> Self {
        Self::with_ttl(resolver, DEFAULT_TTL)
    }

    #[must_use]
    pub fn with_ttl(resolver: Box<dyn IdentityResolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            by_id: TtlCache::new(ttl),
            by_name: TtlCache::new(ttl),
        }
    }

    pub fn lookup_id(&self, id: &str) -> Result<Option<Identity>> {
        self.by_id
            .lookup(&id.to_string(), || self.resolver.resolve_by_id(id))
    }

    pub fn lookup_name(&self, name: &str) -> Result<Option<Identity>> {
        self.by_name
            .lookup(&name.to_string(), || self.resolver.resolve_by_name(name))
    }
}
