use super::{
    auth::AuthTokenScope,
    client::{F8eClient, RequestAuth},
    error::{F8eError, NoClientErrorCode},
};
use crate::{
    hardware::HwFactorProofOfPossession,
    keybox::{F8eSpendingKeyset, FullAccountId, SpendingKeyset},
    keys::{BitcoinNetworkType, DescriptorPublicKey},
    spending::Psbt,
};
use async_trait::async_trait;
use reqwest::Method;
use serde::{de::IgnoredAny, Deserialize, Serialize};

#[async_trait]
pub trait KeysetService: Send + Sync + std::fmt::Debug {
    /// Register a new keyset. It is not active until [`KeysetService::set_active_keyset`].
    async fn create_keyset(
        &self,
        account_id: &FullAccountId,
        app_spending_key: &DescriptorPublicKey,
        hw_spending_key: &DescriptorPublicKey,
        network: BitcoinNetworkType,
        hw_pop: &HwFactorProofOfPossession,
    ) -> Result<F8eSpendingKeyset, F8eError<NoClientErrorCode>>;

    async fn set_active_keyset(
        &self,
        account_id: &FullAccountId,
        keyset_id: &str,
        hw_pop: &HwFactorProofOfPossession,
    ) -> Result<(), F8eError<NoClientErrorCode>>;

    /// Every keyset the account ever had, active one included.
    async fn list_keysets(
        &self,
        account_id: &FullAccountId,
    ) -> Result<Vec<SpendingKeyset>, F8eError<NoClientErrorCode>>;

    /// Ask the server to add its signature.
    async fn sign_psbt(
        &self,
        account_id: &FullAccountId,
        keyset_id: &str,
        psbt: &Psbt,
    ) -> Result<Psbt, F8eError<NoClientErrorCode>>;
}

#[derive(Debug, Serialize)]
struct CreateKeysetBody<'a> {
    app: &'a DescriptorPublicKey,
    hardware: &'a DescriptorPublicKey,
    network: BitcoinNetworkType,
}

#[derive(Debug, Deserialize)]
struct CreateKeysetResponse {
    keyset_id: String,
    spending: DescriptorPublicKey,
}

#[derive(Debug, Deserialize)]
struct KeysetRecord {
    keyset_id: String,
    network: BitcoinNetworkType,
    app_dpub: DescriptorPublicKey,
    hardware_dpub: DescriptorPublicKey,
    server_dpub: DescriptorPublicKey,
}

#[derive(Debug, Deserialize)]
struct ListKeysetsResponse {
    keysets: Vec<KeysetRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PsbtBody {
    psbt: String,
}

impl From<KeysetRecord> for SpendingKeyset {
    fn from(r: KeysetRecord) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            network_type: r.network,
            app_key: r.app_dpub,
            hardware_key: r.hardware_dpub,
            f8e_spending_keyset: F8eSpendingKeyset {
                keyset_id: r.keyset_id,
                spending_public_key: r.server_dpub,
            },
        }
    }
}

#[async_trait]
impl KeysetService for F8eClient {
    async fn create_keyset(
        &self,
        account_id: &FullAccountId,
        app_spending_key: &DescriptorPublicKey,
        hw_spending_key: &DescriptorPublicKey,
        network: BitcoinNetworkType,
        hw_pop: &HwFactorProofOfPossession,
    ) -> Result<F8eSpendingKeyset, F8eError<NoClientErrorCode>> {
        let resp: CreateKeysetResponse = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::POST,
                &format!("/api/accounts/{account_id}/keysets"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Global,
                    hw_pop: Some(hw_pop),
                },
                Some(&CreateKeysetBody {
                    app: app_spending_key,
                    hardware: hw_spending_key,
                    network,
                }),
            )
            .await?;
        Ok(F8eSpendingKeyset {
            keyset_id: resp.keyset_id,
            spending_public_key: resp.spending,
        })
    }

    async fn set_active_keyset(
        &self,
        account_id: &FullAccountId,
        keyset_id: &str,
        hw_pop: &HwFactorProofOfPossession,
    ) -> Result<(), F8eError<NoClientErrorCode>> {
        let _: IgnoredAny = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::PUT,
                &format!("/api/accounts/{account_id}/keysets/{keyset_id}"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Global,
                    hw_pop: Some(hw_pop),
                },
                Some(&serde_json::json!({})),
            )
            .await?;
        Ok(())
    }

    async fn list_keysets(
        &self,
        account_id: &FullAccountId,
    ) -> Result<Vec<SpendingKeyset>, F8eError<NoClientErrorCode>> {
        let resp: ListKeysetsResponse = self
            .http
            .send::<(), _, _>(
                self.tokens.as_ref(),
                Method::GET,
                &format!("/api/accounts/{account_id}/keysets"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Global,
                    hw_pop: None,
                },
                None,
            )
            .await?;
        Ok(resp.keysets.into_iter().map(SpendingKeyset::from).collect())
    }

    async fn sign_psbt(
        &self,
        account_id: &FullAccountId,
        keyset_id: &str,
        psbt: &Psbt,
    ) -> Result<Psbt, F8eError<NoClientErrorCode>> {
        let resp: PsbtBody = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::POST,
                &format!("/api/accounts/{account_id}/keysets/{keyset_id}/sign-transaction"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Global,
                    hw_pop: None,
                },
                Some(&PsbtBody {
                    psbt: psbt.base64.clone(),
                }),
            )
            .await?;
        let signed = Psbt {
            base64: resp.psbt,
            ..psbt.clone()
        };
        let inner = signed
            .to_inner()
            .map_err(|e| F8eError::Unhandled(e.to_string()))?;
        psbt.with_payload(&inner)
            .map_err(|e| F8eError::Unhandled(e.to_string()))
    }
}
