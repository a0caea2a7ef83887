use super::{Invitation, ProtectedCustomer, SocRecRelationships, TrustedContact, TrustedContactAlias};
use crate::{
    clock::Clock,
    config::DEFAULT_INVITATION_EXPIRY_SECONDS,
    f8e::{AuthTokenScope, F8eError, SocRecClientErrorCode, SocRecService},
    hardware::HwFactorProofOfPossession,
    keybox::FullAccountId,
    keys::AuthPublicKey,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Acceptance {
    trusted_contact: FullAccountId,
    customer_alias: String,
    identity_key: AuthPublicKey,
}

#[derive(Debug, Clone)]
struct FakeRelationship {
    id: String,
    customer: FullAccountId,
    alias: TrustedContactAlias,
    code: String,
    expires_at: DateTime<Utc>,
    accepted: Option<Acceptance>,
}

impl FakeRelationship {
    fn invitation(&self) -> Invitation {
        Invitation {
            recovery_relationship_id: self.id.clone(),
            trusted_contact_alias: self.alias.clone(),
            code: self.code.clone(),
            expires_at: self.expires_at,
        }
    }

    fn involves(&self, account_id: &FullAccountId) -> bool {
        &self.customer == account_id
            || self
                .accepted
                .as_ref()
                .is_some_and(|a| &a.trusted_contact == account_id)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    relationships: Vec<FakeRelationship>,
    next_id: u64,
    failing_reads: u32,
}

/// In-memory relationship store shared by every account that talks to it.
#[derive(Debug)]
pub struct SocialRecoveryServiceFake {
    clock: Arc<dyn Clock>,
    expiry: TimeDelta,
    state: Mutex<FakeState>,
}

fn not_found(what: &str, id: &str) -> F8eError<SocRecClientErrorCode> {
    F8eError::SpecificClientError {
        code: SocRecClientErrorCode::RelationshipNotFound,
        message: format!("{what} {id} not found."),
    }
}

impl SocialRecoveryServiceFake {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            expiry: TimeDelta::seconds(
                i64::try_from(DEFAULT_INVITATION_EXPIRY_SECONDS).unwrap_or(i64::MAX),
            ),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub async fn reset(&self) {
        *self.state.lock().await = FakeState::default();
    }

    /// The next `n` relationship reads fail as if the server were unreachable. Writes still land.
    pub async fn fail_next_reads(&self, n: u32) {
        self.state.lock().await.failing_reads = n;
    }
}

#[async_trait]
impl SocRecService for SocialRecoveryServiceFake {
    async fn create_invitation(
        &self,
        account_id: &FullAccountId,
        _hw_pop: &HwFactorProofOfPossession,
        alias: &TrustedContactAlias,
        _customer_identity_key: &AuthPublicKey,
    ) -> Result<Invitation, F8eError<SocRecClientErrorCode>> {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        let n = st.next_id;
        st.next_id += 1;
        let mut code = [0_u8; 5];
        crate::crypto::fill_random(&mut code);
        let rel = FakeRelationship {
            id: format!("relationship-{n}"),
            customer: account_id.clone(),
            alias: alias.clone(),
            code: hex::encode_upper(code),
            expires_at: now + self.expiry,
            accepted: None,
        };
        let invitation = rel.invitation();
        st.relationships.push(rel);
        Ok(invitation)
    }

    async fn refresh_invitation(
        &self,
        account_id: &FullAccountId,
        _hw_pop: &HwFactorProofOfPossession,
        relationship_id: &str,
    ) -> Result<Invitation, F8eError<SocRecClientErrorCode>> {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        let rel = st
            .relationships
            .iter_mut()
            .find(|r| {
                r.id == relationship_id && &r.customer == account_id && r.accepted.is_none()
            })
            .ok_or_else(|| not_found("Invitation", relationship_id))?;
        rel.expires_at = now + self.expiry;
        Ok(rel.invitation())
    }

    async fn remove_relationship(
        &self,
        account_id: &FullAccountId,
        _hw_pop: Option<&HwFactorProofOfPossession>,
        _scope: AuthTokenScope,
        relationship_id: &str,
    ) -> Result<(), F8eError<SocRecClientErrorCode>> {
        let mut st = self.state.lock().await;
        let before = st.relationships.len();
        st.relationships
            .retain(|r| !(r.id == relationship_id && r.involves(account_id)));
        if st.relationships.len() == before {
            return Err(not_found("Relationship", relationship_id));
        }
        Ok(())
    }

    async fn get_relationships(
        &self,
        account_id: &FullAccountId,
    ) -> Result<SocRecRelationships, F8eError<SocRecClientErrorCode>> {
        let mut st = self.state.lock().await;
        if st.failing_reads > 0 {
            st.failing_reads -= 1;
            return Err(F8eError::Networking("fake socrec server is unreachable".to_owned()));
        }
        let mut out = SocRecRelationships::default();
        for rel in &st.relationships {
            match &rel.accepted {
                None if &rel.customer == account_id => out.invitations.push(rel.invitation()),
                Some(a) if &rel.customer == account_id => out.trusted_contacts.push(TrustedContact {
                    recovery_relationship_id: rel.id.clone(),
                    trusted_contact_alias: rel.alias.clone(),
                    identity_key: a.identity_key,
                }),
                Some(a) if &a.trusted_contact == account_id => {
                    out.protected_customers.push(ProtectedCustomer {
                        recovery_relationship_id: rel.id.clone(),
                        alias: a.customer_alias.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn accept_invitation(
        &self,
        account_id: &FullAccountId,
        code: &str,
        customer_alias: &str,
        trusted_contact_identity_key: &AuthPublicKey,
    ) -> Result<ProtectedCustomer, F8eError<SocRecClientErrorCode>> {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        let rel = st
            .relationships
            .iter_mut()
            .find(|r| r.code == code && r.accepted.is_none())
            .ok_or_else(|| F8eError::specific(SocRecClientErrorCode::InvitationCodeMismatch))?;
        if now >= rel.expires_at {
            return Err(F8eError::specific(SocRecClientErrorCode::InvitationExpired));
        }
        if &rel.customer == account_id {
            return Err(F8eError::GeneralClient {
                status: 400,
                message: "cannot accept your own invitation".to_owned(),
            });
        }
        rel.accepted = Some(Acceptance {
            trusted_contact: account_id.clone(),
            customer_alias: customer_alias.to_owned(),
            identity_key: *trusted_contact_identity_key,
        });
        Ok(ProtectedCustomer {
            recovery_relationship_id: rel.id.clone(),
            alias: customer_alias.to_owned(),
        })
    }
}
