use super::{
    auth::AuthTokenScope,
    client::{F8eClient, RequestAuth},
    error::{F8eError, SocRecClientErrorCode},
};
use crate::{
    hardware::HwFactorProofOfPossession,
    keybox::FullAccountId,
    keys::AuthPublicKey,
    socrec::{
        Invitation, ProtectedCustomer, SocRecRelationships, TrustedContact, TrustedContactAlias,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{de::IgnoredAny, Deserialize, Serialize};

/// Social recovery relationships, as the server keeps them.
#[async_trait]
pub trait SocRecService: Send + Sync + std::fmt::Debug {
    async fn create_invitation(
        &self,
        account_id: &FullAccountId,
        hw_pop: &HwFactorProofOfPossession,
        alias: &TrustedContactAlias,
        customer_identity_key: &AuthPublicKey,
    ) -> Result<Invitation, F8eError<SocRecClientErrorCode>>;

    /// Reissue an invitation with a fresh expiry. The relationship id is kept.
    async fn refresh_invitation(
        &self,
        account_id: &FullAccountId,
        hw_pop: &HwFactorProofOfPossession,
        relationship_id: &str,
    ) -> Result<Invitation, F8eError<SocRecClientErrorCode>>;

    /// Remove an invitation or an established relationship, on either side of it.
    async fn remove_relationship(
        &self,
        account_id: &FullAccountId,
        hw_pop: Option<&HwFactorProofOfPossession>,
        scope: AuthTokenScope,
        relationship_id: &str,
    ) -> Result<(), F8eError<SocRecClientErrorCode>>;

    async fn get_relationships(
        &self,
        account_id: &FullAccountId,
    ) -> Result<SocRecRelationships, F8eError<SocRecClientErrorCode>>;

    /// Accept someone else's invitation by its code, becoming their trusted contact.
    async fn accept_invitation(
        &self,
        account_id: &FullAccountId,
        code: &str,
        customer_alias: &str,
        trusted_contact_identity_key: &AuthPublicKey,
    ) -> Result<ProtectedCustomer, F8eError<SocRecClientErrorCode>>;
}

#[derive(Debug, Serialize)]
struct CreateRelationshipBody<'a> {
    trusted_contact_alias: &'a TrustedContactAlias,
    customer_enrollment_pubkey: &'a AuthPublicKey,
}

#[derive(Debug, Deserialize)]
struct InvitationResponse {
    invitation: Invitation,
}

#[derive(Debug, Deserialize)]
struct WireTrustedContact {
    recovery_relationship_id: String,
    trusted_contact_alias: TrustedContactAlias,
    trusted_contact_identity_pubkey: AuthPublicKey,
}

#[derive(Debug, Deserialize)]
struct WireCustomer {
    recovery_relationship_id: String,
    customer_alias: String,
}

#[derive(Debug, Deserialize)]
struct RelationshipsResponse {
    #[serde(default)]
    invitations: Vec<Invitation>,
    #[serde(default)]
    unendorsed_trusted_contacts: Vec<WireTrustedContact>,
    #[serde(default)]
    endorsed_trusted_contacts: Vec<WireTrustedContact>,
    #[serde(default)]
    customers: Vec<WireCustomer>,
}

impl From<WireTrustedContact> for TrustedContact {
    fn from(w: WireTrustedContact) -> Self {
        Self {
            recovery_relationship_id: w.recovery_relationship_id,
            trusted_contact_alias: w.trusted_contact_alias,
            identity_key: w.trusted_contact_identity_pubkey,
        }
    }
}

impl From<WireCustomer> for ProtectedCustomer {
    fn from(w: WireCustomer) -> Self {
        Self {
            recovery_relationship_id: w.recovery_relationship_id,
            alias: w.customer_alias,
        }
    }
}

impl From<RelationshipsResponse> for SocRecRelationships {
    fn from(r: RelationshipsResponse) -> Self {
        Self {
            invitations: r.invitations,
            trusted_contacts: r
                .endorsed_trusted_contacts
                .into_iter()
                .chain(r.unendorsed_trusted_contacts)
                .map(TrustedContact::from)
                .collect(),
            protected_customers: r
                .customers
                .into_iter()
                .map(ProtectedCustomer::from)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundInvitation {
    recovery_relationship_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct InboundInvitationResponse {
    invitation: InboundInvitation,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    customer: WireCustomer,
}

fn global<'a>(
    account_id: &'a FullAccountId,
    hw_pop: Option<&'a HwFactorProofOfPossession>,
) -> RequestAuth<'a> {
    RequestAuth {
        account_id,
        scope: AuthTokenScope::Global,
        hw_pop,
    }
}

#[async_trait]
impl SocRecService for F8eClient {
    async fn create_invitation(
        &self,
        account_id: &FullAccountId,
        hw_pop: &HwFactorProofOfPossession,
        alias: &TrustedContactAlias,
        customer_identity_key: &AuthPublicKey,
    ) -> Result<Invitation, F8eError<SocRecClientErrorCode>> {
        let resp: InvitationResponse = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::POST,
                &format!("/api/accounts/{account_id}/recovery/relationships"),
                global(account_id, Some(hw_pop)),
                Some(&CreateRelationshipBody {
                    trusted_contact_alias: alias,
                    customer_enrollment_pubkey: customer_identity_key,
                }),
            )
            .await?;
        Ok(resp.invitation)
    }

    async fn refresh_invitation(
        &self,
        account_id: &FullAccountId,
        hw_pop: &HwFactorProofOfPossession,
        relationship_id: &str,
    ) -> Result<Invitation, F8eError<SocRecClientErrorCode>> {
        let resp: InvitationResponse = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::PUT,
                &format!("/api/accounts/{account_id}/recovery/relationships/{relationship_id}"),
                global(account_id, Some(hw_pop)),
                Some(&serde_json::json!({ "action": "Reissue" })),
            )
            .await?;
        Ok(resp.invitation)
    }

    async fn remove_relationship(
        &self,
        account_id: &FullAccountId,
        hw_pop: Option<&HwFactorProofOfPossession>,
        scope: AuthTokenScope,
        relationship_id: &str,
    ) -> Result<(), F8eError<SocRecClientErrorCode>> {
        let _: IgnoredAny = self
            .http
            .send::<(), _, _>(
                self.tokens.as_ref(),
                Method::DELETE,
                &format!("/api/accounts/{account_id}/recovery/relationships/{relationship_id}"),
                RequestAuth {
                    account_id,
                    scope,
                    hw_pop,
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_relationships(
        &self,
        account_id: &FullAccountId,
    ) -> Result<SocRecRelationships, F8eError<SocRecClientErrorCode>> {
        let resp: RelationshipsResponse = self
            .http
            .send::<(), _, _>(
                self.tokens.as_ref(),
                Method::GET,
                &format!("/api/accounts/{account_id}/recovery/relationships"),
                global(account_id, None),
                None,
            )
            .await?;
        Ok(resp.into())
    }

    async fn accept_invitation(
        &self,
        account_id: &FullAccountId,
        code: &str,
        customer_alias: &str,
        trusted_contact_identity_key: &AuthPublicKey,
    ) -> Result<ProtectedCustomer, F8eError<SocRecClientErrorCode>> {
        let inbound: InboundInvitationResponse = self
            .http
            .send::<(), _, _>(
                self.tokens.as_ref(),
                Method::GET,
                &format!("/api/accounts/{account_id}/recovery/relationship-invitations/{code}"),
                global(account_id, None),
                None,
            )
            .await?;
        tracing::debug!(
            relationship_id = %inbound.invitation.recovery_relationship_id,
            expires_at = %inbound.invitation.expires_at,
            "accepting invitation"
        );
        let resp: CustomerResponse = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::PUT,
                &format!(
                    "/api/accounts/{account_id}/recovery/relationships/{}",
                    inbound.invitation.recovery_relationship_id
                ),
                global(account_id, None),
                Some(&serde_json::json!({
                    "action": "Accept",
                    "code": code,
                    "customer_alias": customer_alias,
                    "trusted_contact_enrollment_pubkey": trusted_contact_identity_key,
                })),
            )
            .await?;
        Ok(resp.customer.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_auth_keypair;

    #[test]
    fn relationships_are_partitioned_by_role() -> eyre::Result<()> {
        let tc_key = generate_auth_keypair()?.public_key;
        let body = format!(
            r#"{{
              "invitations":[{{"recovery_relationship_id":"r1","trusted_contact_alias":"Jack","code":"abc","expires_at":"2024-01-08T00:00:00Z"}}],
              "unendorsed_trusted_contacts":[{{"recovery_relationship_id":"r2","trusted_contact_alias":"Kirill","trusted_contact_identity_pubkey":"{tc_key}"}}],
              "endorsed_trusted_contacts":[],
              "customers":[{{"recovery_relationship_id":"r3","customer_alias":"Mom"}}]
            }}"#
        );
        let rel: SocRecRelationships = serde_json::from_str::<RelationshipsResponse>(&body)?.into();
        assert_eq!(rel.invitations.len(), 1);
        assert_eq!(rel.trusted_contacts.len(), 1);
        assert_eq!(rel.protected_customers.len(), 1);
        assert!(rel.contains("r3"));
        assert!(!rel.contains("r4"));
        Ok(())
    }
}
