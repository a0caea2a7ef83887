use super::{
    client::F8eClient,
    error::{CreateAccountClientErrorCode, F8eError},
};
use crate::{
    keybox::{AppKeyBundle, F8eSpendingKeyset, FullAccountId, HwKeyBundle},
    keys::{AuthPublicKey, BitcoinNetworkType, DescriptorPublicKey},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The server's answer to account creation: the account and its first (active) keyset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAccount {
    pub account_id: FullAccountId,
    pub keyset: F8eSpendingKeyset,
}

#[async_trait]
pub trait AccountService: Send + Sync + std::fmt::Debug {
    async fn create_account(
        &self,
        app: &AppKeyBundle,
        hardware: &HwKeyBundle,
        network: BitcoinNetworkType,
        is_test_account: bool,
    ) -> Result<CreatedAccount, F8eError<CreateAccountClientErrorCode>>;
}

#[derive(Debug, Serialize)]
struct AuthKeysBody<'a> {
    app: &'a AuthPublicKey,
    hardware: &'a AuthPublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<&'a AuthPublicKey>,
}

#[derive(Debug, Serialize)]
struct SpendingKeysBody<'a> {
    app: &'a DescriptorPublicKey,
    hardware: &'a DescriptorPublicKey,
    network: BitcoinNetworkType,
}

#[derive(Debug, Serialize)]
struct CreateAccountBody<'a> {
    auth: AuthKeysBody<'a>,
    spending: SpendingKeysBody<'a>,
    is_test_account: bool,
}

#[derive(Debug, Deserialize)]
struct CreateAccountResponse {
    account_id: String,
    keyset_id: String,
    spending: DescriptorPublicKey,
}

#[async_trait]
impl AccountService for F8eClient {
    async fn create_account(
        &self,
        app: &AppKeyBundle,
        hardware: &HwKeyBundle,
        network: BitcoinNetworkType,
        is_test_account: bool,
    ) -> Result<CreatedAccount, F8eError<CreateAccountClientErrorCode>> {
        let body = CreateAccountBody {
            auth: AuthKeysBody {
                app: &app.auth_key,
                hardware: &hardware.auth_key,
                recovery: app.recovery_auth_key.as_ref(),
            },
            spending: SpendingKeysBody {
                app: &app.spending_key,
                hardware: &hardware.spending_key,
                network,
            },
            is_test_account,
        };
        let resp: CreateAccountResponse = self.http.post_unauthenticated("/api/accounts", &body).await?;
        tracing::info!(account_id = %resp.account_id, keyset_id = %resp.keyset_id, "created account");
        Ok(CreatedAccount {
            account_id: FullAccountId(resp.account_id),
            keyset: F8eSpendingKeyset {
                keyset_id: resp.keyset_id,
                spending_public_key: resp.spending,
            },
        })
    }
}
