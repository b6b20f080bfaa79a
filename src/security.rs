//! Access Guard
//!
//! Every read or write on an entity passes an [`AccessContext`]. The entity's
//! [`ObjectProtection`] decides whether the context's role holds the
//! required [`AccessType`].

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of the built-in system context
pub const SYSTEM_IDENTITY: &str = "SYSTEM";

/// Role of the built-in system context
pub const SYSTEM_ROLE: &str = "SYSTEM";

// =============================================================================
// Access Type
// =============================================================================

/// Access levels, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    View,
    Use,
    Change,
    Control,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessType::View => "VIEW",
            AccessType::Use => "USE",
            AccessType::Change => "CHANGE",
            AccessType::Control => "CONTROL",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Access Context
// =============================================================================

/// Authorization token threaded through every repository call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    identity: String,
    role: String,
    privileged: bool,
}

impl AccessContext {
    /// Unprivileged context for a named identity acting in a role
    pub fn new(identity: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            role: role.into(),
            privileged: false,
        }
    }

    /// The privileged system context used for startup loading and satellite apply
    pub fn system() -> Self {
        Self {
            identity: SYSTEM_IDENTITY.to_string(),
            role: SYSTEM_ROLE.to_string(),
            privileged: true,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }
}

// =============================================================================
// Object Protection
// =============================================================================

/// Role based access control list attached to one entity
#[derive(Debug)]
pub struct ObjectProtection {
    object: String,
    creator: String,
    acl: RwLock<BTreeMap<String, AccessType>>,
}

impl ObjectProtection {
    /// Protection for a newly created object: the creator's role gets CONTROL
    pub fn new(creator: &AccessContext, object: impl Into<String>) -> Self {
        let mut acl = BTreeMap::new();
        acl.insert(creator.role().to_string(), AccessType::Control);
        Self {
            object: object.into(),
            creator: creator.identity().to_string(),
            acl: RwLock::new(acl),
        }
    }

    /// The object this protection guards, used in denial messages
    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Access the context's role has been granted, if any
    pub fn query_access(&self, acc: &AccessContext) -> Option<AccessType> {
        if acc.is_privileged() {
            return Some(AccessType::Control);
        }
        self.acl.read().get(acc.role()).copied()
    }

    /// Fail with [`Error::AccessDenied`] unless `acc` holds at least `requested`
    pub fn require_access(&self, acc: &AccessContext, requested: AccessType) -> Result<()> {
        match self.query_access(acc) {
            Some(granted) if granted >= requested => Ok(()),
            _ => Err(Error::AccessDenied {
                identity: acc.identity().to_string(),
                role: acc.role().to_string(),
                requested: requested.to_string(),
                object: self.object.clone(),
            }),
        }
    }

    /// Grant `access` to `role`. Requires CONTROL.
    pub fn grant(&self, acc: &AccessContext, role: impl Into<String>, access: AccessType) -> Result<()> {
        self.require_access(acc, AccessType::Control)?;
        self.acl.write().insert(role.into(), access);
        Ok(())
    }

    /// Revoke all access of `role`. Requires CONTROL.
    pub fn revoke(&self, acc: &AccessContext, role: &str) -> Result<()> {
        self.require_access(acc, AccessType::Control)?;
        self.acl.write().remove(role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_access_type_ordering() {
        assert!(AccessType::View < AccessType::Use);
        assert!(AccessType::Use < AccessType::Change);
        assert!(AccessType::Change < AccessType::Control);
    }

    #[test]
    fn test_creator_role_has_control() {
        let alice = AccessContext::new("alice", "ops");
        let prot = ObjectProtection::new(&alice, "node alpha");

        assert!(prot.require_access(&alice, AccessType::Control).is_ok());
        assert_eq!(prot.creator(), "alice");
    }

    #[test]
    fn test_foreign_role_denied_until_granted() {
        let alice = AccessContext::new("alice", "ops");
        let bob = AccessContext::new("bob", "audit");
        let prot = ObjectProtection::new(&alice, "node alpha");

        assert_matches!(
            prot.require_access(&bob, AccessType::View),
            Err(Error::AccessDenied { .. })
        );

        prot.grant(&alice, "audit", AccessType::View).unwrap();
        assert!(prot.require_access(&bob, AccessType::View).is_ok());
        assert_matches!(
            prot.require_access(&bob, AccessType::Change),
            Err(Error::AccessDenied { .. })
        );

        // bob cannot hand himself more rights
        assert!(prot.grant(&bob, "audit", AccessType::Control).is_err());

        prot.revoke(&alice, "audit").unwrap();
        assert!(prot.require_access(&bob, AccessType::View).is_err());
    }

    #[test]
    fn test_system_context_bypasses_acl() {
        let alice = AccessContext::new("alice", "ops");
        let prot = ObjectProtection::new(&alice, "node alpha");
        assert!(prot.require_access(&AccessContext::system(), AccessType::Control).is_ok());
    }
}
