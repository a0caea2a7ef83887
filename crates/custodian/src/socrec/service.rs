use super::{
    Invitation, ProtectedCustomer, SocRecKeysRepository, SocRecRelationships, TrustedContactAlias,
};
use crate::{
    errors::{ErrorCode, StorageError},
    f8e::{AuthTokenScope, F8eError, SocRecClientErrorCode, SocRecService},
    hardware::HwFactorProofOfPossession,
    keybox::FullAccountId,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum SocRecError {
    #[error("relationship `{0}` not found")]
    NotFound(String),

    #[error("invitation has expired")]
    InvitationExpired,

    #[error("invitation code does not match any pending invitation")]
    InvitationCodeMismatch,

    #[error("identity key unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Server(F8eError<SocRecClientErrorCode>),
}

impl ErrorCode for SocRecError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "relationship_not_found",
            Self::InvitationExpired => "invitation_expired",
            Self::InvitationCodeMismatch => "invitation_code_mismatch",
            Self::Storage(e) => e.code(),
            Self::Server(e) => e.code(),
        }
    }
}

fn classify(e: F8eError<SocRecClientErrorCode>, relationship_id: &str) -> SocRecError {
    match e.client_code() {
        Some(SocRecClientErrorCode::RelationshipNotFound) => {
            SocRecError::NotFound(relationship_id.to_owned())
        }
        Some(SocRecClientErrorCode::InvitationExpired) => SocRecError::InvitationExpired,
        Some(SocRecClientErrorCode::InvitationCodeMismatch) => SocRecError::InvitationCodeMismatch,
        None => {
            tracing::warn!(error = %e, relationship_id, "socrec request failed");
            SocRecError::Server(e)
        }
    }
}

/// Trusted contact management for one account, with the latest relationship set published
/// to subscribers after every change.
#[derive(Debug)]
pub struct SocialRecoveryService {
    f8e: Arc<dyn SocRecService>,
    keys: Arc<SocRecKeysRepository>,
    relationships: watch::Sender<SocRecRelationships>,
}

impl SocialRecoveryService {
    pub fn new(f8e: Arc<dyn SocRecService>, keys: Arc<SocRecKeysRepository>) -> Self {
        let (relationships, _) = watch::channel(SocRecRelationships::default());
        Self {
            f8e,
            keys,
            relationships,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SocRecRelationships> {
        self.relationships.subscribe()
    }

    pub fn relationships(&self) -> SocRecRelationships {
        self.relationships.borrow().clone()
    }

    /// Re-read relationships from the server and publish them.
    pub async fn sync(&self, account_id: &FullAccountId) -> Result<SocRecRelationships, SocRecError> {
        let rel = self
            .f8e
            .get_relationships(account_id)
            .await
            .map_err(|e| classify(e, ""))?;
        self.relationships.send_replace(rel.clone());
        tracing::debug!(
            invitations = rel.invitations.len(),
            trusted_contacts = rel.trusted_contacts.len(),
            protected_customers = rel.protected_customers.len(),
            "socrec relationships synced"
        );
        Ok(rel)
    }

    /// Refresh after a change the server already accepted. A failed read only leaves the
    /// published set stale until the next sync, so it never fails the change itself.
    async fn sync_after_change(&self, account_id: &FullAccountId) {
        if let Err(e) = self.sync(account_id).await {
            tracing::warn!(
                account_id = %account_id,
                code = e.code(),
                error = %e,
                "socrec refresh after change failed"
            );
        }
    }

    pub async fn create_invitation(
        &self,
        account_id: &FullAccountId,
        alias: &TrustedContactAlias,
        hw_pop: &HwFactorProofOfPossession,
    ) -> Result<Invitation, SocRecError> {
        let identity = self.keys.get_or_create_identity_keypair().await?;
        let invitation = self
            .f8e
            .create_invitation(account_id, hw_pop, alias, &identity.public_key)
            .await
            .map_err(|e| classify(e, ""))?;
        tracing::info!(
            relationship_id = %invitation.recovery_relationship_id,
            alias = %alias,
            expires_at = %invitation.expires_at,
            "created trusted contact invitation"
        );
        self.sync_after_change(account_id).await;
        Ok(invitation)
    }

    pub async fn refresh_invitation(
        &self,
        account_id: &FullAccountId,
        relationship_id: &str,
        hw_pop: &HwFactorProofOfPossession,
    ) -> Result<Invitation, SocRecError> {
        let invitation = self
            .f8e
            .refresh_invitation(account_id, hw_pop, relationship_id)
            .await
            .map_err(|e| classify(e, relationship_id))?;
        self.sync_after_change(account_id).await;
        Ok(invitation)
    }

    /// Remove an invitation, a trusted contact, or a customer this account protects.
    pub async fn remove_relationship(
        &self,
        account_id: &FullAccountId,
        relationship_id: &str,
        hw_pop: Option<&HwFactorProofOfPossession>,
        scope: AuthTokenScope,
    ) -> Result<(), SocRecError> {
        self.f8e
            .remove_relationship(account_id, hw_pop, scope, relationship_id)
            .await
            .map_err(|e| classify(e, relationship_id))?;
        tracing::info!(relationship_id, "removed socrec relationship");
        self.sync_after_change(account_id).await;
        Ok(())
    }

    pub async fn accept_invitation(
        &self,
        account_id: &FullAccountId,
        code: &str,
        customer_alias: &str,
    ) -> Result<ProtectedCustomer, SocRecError> {
        let identity = self.keys.get_or_create_identity_keypair().await?;
        let customer = self
            .f8e
            .accept_invitation(account_id, code, customer_alias, &identity.public_key)
            .await
            .map_err(|e| classify(e, code))?;
        self.sync_after_change(account_id).await;
        Ok(customer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock as _, ClockFake},
        secure_store::SecureStore,
        socrec::SocialRecoveryServiceFake,
    };
    use chrono::TimeDelta;

    struct Harness {
        clock: Arc<ClockFake>,
        service: SocialRecoveryService,
        account: FullAccountId,
        pop: HwFactorProofOfPossession,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ClockFake::default());
        let fake = Arc::new(SocialRecoveryServiceFake::new(Arc::clone(&clock) as _));
        let keys = Arc::new(SocRecKeysRepository::new(SecureStore::in_memory()));
        Harness {
            clock,
            service: SocialRecoveryService::new(fake, keys),
            account: FullAccountId("account-0".to_owned()),
            pop: HwFactorProofOfPossession {
                hw_signed_token: "signed".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn invitation_expires_then_refresh_keeps_id() -> eyre::Result<()> {
        let h = harness();
        let jack = TrustedContactAlias("Jack".to_owned());
        let inv = h
            .service
            .create_invitation(&h.account, &jack, &h.pop)
            .await?;

        let rel = h.service.relationships();
        assert_eq!(rel.invitations.len(), 1);
        assert_eq!(
            rel.invitations.first().map(|i| &i.trusted_contact_alias),
            Some(&jack)
        );
        assert_eq!(inv.expires_at, h.clock.now() + TimeDelta::days(7));
        assert!(!inv.is_expired(h.clock.as_ref()));

        h.clock.advance_by(TimeDelta::days(8));
        assert!(inv.is_expired(h.clock.as_ref()));

        let refreshed = h
            .service
            .refresh_invitation(&h.account, &inv.recovery_relationship_id, &h.pop)
            .await?;
        assert_eq!(refreshed.recovery_relationship_id, inv.recovery_relationship_id);
        assert!(!refreshed.is_expired(h.clock.as_ref()));
        assert_eq!(h.service.relationships().invitations, vec![refreshed]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() -> eyre::Result<()> {
        let h = harness();
        let refresh = h
            .service
            .refresh_invitation(&h.account, "nope", &h.pop)
            .await;
        assert!(matches!(refresh, Err(SocRecError::NotFound(id)) if id == "nope"));

        let remove = h
            .service
            .remove_relationship(&h.account, "nope", None, AuthTokenScope::Global)
            .await;
        assert!(matches!(remove, Err(SocRecError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn acceptance_moves_invitation_to_trusted_contacts() -> eyre::Result<()> {
        let h = harness();
        // Customer and trusted contact on separate devices, sharing one server.
        let fake = Arc::new(SocialRecoveryServiceFake::new(Arc::clone(&h.clock) as _));
        let customer_service = SocialRecoveryService::new(
            Arc::clone(&fake) as _,
            Arc::new(SocRecKeysRepository::new(SecureStore::in_memory())),
        );
        let tc_service = SocialRecoveryService::new(
            Arc::clone(&fake) as _,
            Arc::new(SocRecKeysRepository::new(SecureStore::in_memory())),
        );
        let inv = customer_service
            .create_invitation(&h.account, &TrustedContactAlias("Kirill".to_owned()), &h.pop)
            .await?;
        let tc_account = FullAccountId("account-1".to_owned());
        let protected = tc_service
            .accept_invitation(&tc_account, &inv.code, "Mom")
            .await?;
        assert_eq!(protected.recovery_relationship_id, inv.recovery_relationship_id);

        let rel = customer_service.sync(&h.account).await?;
        assert!(rel.invitations.is_empty());
        assert_eq!(rel.trusted_contacts.len(), 1);
        assert_eq!(tc_service.relationships().protected_customers, vec![protected]);

        // Either side may end it; afterwards it is gone for both.
        tc_service
            .remove_relationship(
                &tc_account,
                &inv.recovery_relationship_id,
                None,
                AuthTokenScope::Global,
            )
            .await?;
        assert!(customer_service.sync(&h.account).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn changes_succeed_even_when_the_refresh_fails() -> eyre::Result<()> {
        let h = harness();
        let fake = Arc::new(SocialRecoveryServiceFake::new(Arc::clone(&h.clock) as _));
        let svc = SocialRecoveryService::new(
            Arc::clone(&fake) as _,
            Arc::new(SocRecKeysRepository::new(SecureStore::in_memory())),
        );

        fake.fail_next_reads(1).await;
        let inv = svc
            .create_invitation(&h.account, &TrustedContactAlias("Jack".to_owned()), &h.pop)
            .await?;
        // Stale until the next successful read, and only one invitation exists.
        assert!(svc.relationships().is_empty());
        let rel = svc.sync(&h.account).await?;
        assert_eq!(rel.invitations, vec![inv.clone()]);

        fake.fail_next_reads(1).await;
        svc.remove_relationship(
            &h.account,
            &inv.recovery_relationship_id,
            Some(&h.pop),
            AuthTokenScope::Global,
        )
        .await?;
        assert!(svc.sync(&h.account).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn expired_invitations_cannot_be_accepted() -> eyre::Result<()> {
        let h = harness();
        let fake = Arc::new(SocialRecoveryServiceFake::new(Arc::clone(&h.clock) as _));
        let svc = SocialRecoveryService::new(
            Arc::clone(&fake) as _,
            Arc::new(SocRecKeysRepository::new(SecureStore::in_memory())),
        );
        let inv = svc
            .create_invitation(&h.account, &TrustedContactAlias("Jack".to_owned()), &h.pop)
            .await?;
        h.clock.advance_by(TimeDelta::days(8));
        let res = svc
            .accept_invitation(&FullAccountId("account-9".to_owned()), &inv.code, "Mom")
            .await;
        assert!(matches!(res, Err(SocRecError::InvitationExpired)));

        let res = svc
            .accept_invitation(&FullAccountId("account-9".to_owned()), "WRONG", "Mom")
            .await;
        assert!(matches!(res, Err(SocRecError::InvitationCodeMismatch)));
        Ok(())
    }
}
