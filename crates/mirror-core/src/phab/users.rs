//! Identity resolution against the review service's user directory.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

use crate::phab::conduit::ConduitClient;
use crate::remote::identity::{Identity, IdentityResolver};

#[derive(Debug, Default, Serialize)]
struct UserQuery {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    emails: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    usernames: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    phids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    phid: String,
    #[serde(default, rename = "userName")]
    user_name: String,
    #[serde(default, rename = "realName")]
    real_name: String,
    #[serde(default, rename = "primaryEmail")]
    primary_email: String,
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            id: user.phid,
            name: user.user_name,
            display_name: user.real_name,
            email: user.primary_email,
        }
    }
}

/// Resolves identities through the `user.query` API.
pub struct ConduitUsers {
    conduit: Rc<ConduitClient>,
}

impl ConduitUsers {
    #[must_use]
    pub fn new(conduit: Rc<ConduitClient>) -> Self {
        Self { conduit }
    }

    /// Run a query and return its result only if it matched exactly one
    /// user; ambiguous or empty matches resolve to nobody.
    fn query_one(&self, query: &UserQuery) -> Result<Option<Identity>> {
        let users: Option<Vec<User>> = self.conduit.call("user.query", query)?;
        let mut users = users.unwrap_or_default();
        if users.len() == 1 {
            Ok(users.pop().map(Identity::from))
        } else {
            Ok(None)
        }
    }
}

impl IdentityResolver for ConduitUsers {
    fn resolve_by_id(&self, id: &str) -> Result<Option<Identity>> {
        self.query_one(&UserQuery {
            phids: vec![id.to_string()],
            ..UserQuery::default()
        })
    }

    fn resolve_by_name(&self, name: &str) -> Result<Option<Identity>> {
        let by_email = self.query_one(&UserQuery {
            emails: vec![name.to_string()],
            ..UserQuery::default()
        })?;
        if by_email.is_some() {
            return Ok(by_email);
        }
        self.query_one(&UserQuery {
            usernames: vec![name.to_string()],
            ..UserQuery::default()
        })
    }
}
