//! Social recovery: trusted contacts who can vouch for an account that lost a factor.

pub mod fake;
pub mod keys;
pub mod model;
pub mod service;

pub use fake::SocialRecoveryServiceFake;
pub use keys::SocRecKeysRepository;
pub use model::{
    Invitation, ProtectedCustomer, SocRecRelationships, TrustedContact, TrustedContactAlias,
};
pub use service::{SocRecError, SocialRecoveryService};
