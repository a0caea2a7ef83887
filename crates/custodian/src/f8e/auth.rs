//! Bearer tokens for the server, obtained by signing a server challenge with an auth key.

use super::{
    client::F8eHttpClient,
    error::{F8eError, NoClientErrorCode},
};
use crate::{
    clock::Clock,
    keybox::FullAccountId,
    keys::{AppPrivateKeyDao, AuthPublicKey},
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Tokens are refreshed this long before the server says they expire.
const EXPIRY_MARGIN_SECONDS: i64 = 60;

/// Which app auth key a token was minted with. Recovery-scoped tokens are signed with the
/// recovery auth key, so they still work after the global key is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthTokenScope {
    Global,
    Recovery,
}

#[async_trait]
pub trait AuthTokenProvider: Send + Sync + std::fmt::Debug {
    async fn access_token(
        &self,
        account_id: &FullAccountId,
        scope: AuthTokenScope,
    ) -> Result<String, F8eError<NoClientErrorCode>>;

    /// Drop a cached token after the server refused it.
    async fn invalidate(&self, account_id: &FullAccountId, scope: AuthTokenScope);

    /// Use `key` for `scope` tokens on `account_id` from now on.
    async fn register_key(&self, account_id: &FullAccountId, scope: AuthTokenScope, key: AuthPublicKey);

    /// A one-off token signed by `key`. Nothing is registered or cached.
    async fn token_for_key(
        &self,
        account_id: &FullAccountId,
        key: AuthPublicKey,
    ) -> Result<String, F8eError<NoClientErrorCode>>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ChallengeRequest<'a> {
    auth_request_key: &'a AuthPublicKey,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge: String,
    session: String,
}

#[derive(Debug, Serialize)]
struct RespondRequest<'a> {
    auth_request_key: &'a AuthPublicKey,
    challenge_response: &'a str,
    session: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Mints tokens through `/api/authenticate` with keys from the app's private key store.
#[derive(Debug)]
pub struct ChallengeAuthTokenProvider {
    http: F8eHttpClient,
    dao: AppPrivateKeyDao,
    clock: Arc<dyn Clock>,
    keys: Mutex<HashMap<(FullAccountId, AuthTokenScope), AuthPublicKey>>,
    cache: Mutex<HashMap<(FullAccountId, AuthTokenScope), CachedToken>>,
}

impl ChallengeAuthTokenProvider {
    pub fn new(http: F8eHttpClient, dao: AppPrivateKeyDao, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            dao,
            clock,
            keys: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn mint(
        &self,
        key: &AuthPublicKey,
    ) -> Result<CachedToken, F8eError<NoClientErrorCode>> {
        let private = self
            .dao
            .require_auth_private_key(key)
            .await
            .map_err(|e| F8eError::Unhandled(e.to_string()))?;
        let challenge: ChallengeResponse = self
            .http
            .post_unauthenticated("/api/authenticate", &ChallengeRequest { auth_request_key: key })
            .await?;
        let signature = private.sign(challenge.challenge.as_bytes());
        let token: TokenResponse = self
            .http
            .post_unauthenticated(
                "/api/authenticate/respond",
                &RespondRequest {
                    auth_request_key: key,
                    challenge_response: &signature,
                    session: &challenge.session,
                },
            )
            .await?;
        let lifetime = TimeDelta::seconds(token.expires_in.saturating_sub(EXPIRY_MARGIN_SECONDS).max(0));
        Ok(CachedToken {
            token: token.access_token,
            refresh_at: self.clock.now() + lifetime,
        })
    }
}

#[async_trait]
impl AuthTokenProvider for ChallengeAuthTokenProvider {
    async fn access_token(
        &self,
        account_id: &FullAccountId,
        scope: AuthTokenScope,
    ) -> Result<String, F8eError<NoClientErrorCode>> {
        let slot = (account_id.clone(), scope);
        let cached = self.cache.lock().await.get(&slot).cloned();
        if let Some(c) = cached.filter(|c| c.refresh_at > self.clock.now()) {
            return Ok(c.token);
        }
        let key = self.keys.lock().await.get(&slot).copied().ok_or_else(|| {
            F8eError::Unhandled(format!("no {scope:?} auth key registered for {account_id}"))
        })?;
        let minted = self.mint(&key).await?;
        tracing::debug!(account_id = %account_id, ?scope, "minted f8e access token");
        let token = minted.token.clone();
        self.cache.lock().await.insert(slot, minted);
        Ok(token)
    }

    async fn invalidate(&self, account_id: &FullAccountId, scope: AuthTokenScope) {
        self.cache.lock().await.remove(&(account_id.clone(), scope));
    }

    /// Replacing a key drops its cached token.
    async fn register_key(&self, account_id: &FullAccountId, scope: AuthTokenScope, key: AuthPublicKey) {
        let slot = (account_id.clone(), scope);
        let previous = self.keys.lock().await.insert(slot.clone(), key);
        if previous.is_some_and(|p| p != key) {
            self.cache.lock().await.remove(&slot);
        }
    }

    async fn token_for_key(
        &self,
        account_id: &FullAccountId,
        key: AuthPublicKey,
    ) -> Result<String, F8eError<NoClientErrorCode>> {
        let minted = self.mint(&key).await?;
        tracing::debug!(account_id = %account_id, "minted unregistered f8e access token");
        Ok(minted.token)
    }
}
