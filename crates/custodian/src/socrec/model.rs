use crate::{clock::Clock, keys::AuthPublicKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustedContactAlias(pub String);

impl fmt::Display for TrustedContactAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An invitation this account sent that nobody has accepted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub recovery_relationship_id: String,
    pub trusted_contact_alias: TrustedContactAlias,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl Invitation {
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.expires_at
    }
}

/// Someone who accepted this account's invitation and now helps protect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedContact {
    pub recovery_relationship_id: String,
    pub trusted_contact_alias: TrustedContactAlias,
    pub identity_key: AuthPublicKey,
}

/// An account this account helps protect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedCustomer {
    pub recovery_relationship_id: String,
    pub alias: String,
}

/// Every relationship the account is part of, split by role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocRecRelationships {
    pub invitations: Vec<Invitation>,
    pub trusted_contacts: Vec<TrustedContact>,
    pub protected_customers: Vec<ProtectedCustomer>,
}

impl SocRecRelationships {
    pub fn is_empty(&self) -> bool {
        self.invitations.is_empty()
            && self.trusted_contacts.is_empty()
            && self.protected_customers.is_empty()
    }

    pub fn contains(&self, relationship_id: &str) -> bool {
        self.invitations
            .iter()
            .any(|i| i.recovery_relationship_id == relationship_id)
            || self
                .trusted_contacts
                .iter()
                .any(|t| t.recovery_relationship_id == relationship_id)
            || self
                .protected_customers
                .iter()
                .any(|c| c.recovery_relationship_id == relationship_id)
    }
}
